use crate::action::Action;
use crate::error::{Error, Result};
use crate::role::Role;
use crate::statement::{ActionPattern, PrincipalPattern, Statement, StatementSpec};
use crate::types::ResourceType;
use std::collections::{BTreeMap, HashMap};

/// Authored policy document: resource type name to ordered statements.
pub type PolicyDocument = BTreeMap<String, Vec<StatementSpec>>;

/// Per-resource-type ordered allow statements.
///
/// Statements are additive; a resource type with no registered statements
/// denies everything.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    resources: HashMap<ResourceType, Vec<Statement>>,
}

impl PolicyRegistry {
    /// Creates an empty (deny-all) registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends statements for a resource type.
    pub fn register(
        &mut self,
        resource: ResourceType,
        statements: impl IntoIterator<Item = Statement>,
    ) -> &mut Self {
        self.resources
            .entry(resource)
            .or_default()
            .extend(statements);
        self
    }

    /// Builds a registry from an authored document, failing on the first
    /// malformed statement.
    pub fn from_document(document: PolicyDocument) -> Result<Self> {
        let mut registry = Self::new();
        for (resource, specs) in document {
            let resource = ResourceType::new(&resource)?;
            let statements = specs
                .into_iter()
                .enumerate()
                .map(|(index, authored)| {
                    Statement::try_from(authored).map_err(|err| {
                        Error::invalid(format!("{resource} statement {index}: {err}"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            registry.register(resource, statements);
        }
        Ok(registry)
    }

    /// Parses a JSON policy document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let document: PolicyDocument = serde_json::from_str(json)
            .map_err(|err| Error::invalid(format!("policy document: {err}")))?;
        Self::from_document(document)
    }

    /// Built-in policies for the core resource types.
    pub fn standard() -> Self {
        use ActionPattern::{Any as AnyAction, Exact};
        use PrincipalPattern::{Any as Anyone, Role as Member};

        let mut registry = Self::new();
        registry
            .register(
                ResourceType::organizations(),
                [Statement::granting(&[AnyAction], &[Member(Role::Admin)])],
            )
            .register(
                ResourceType::users(),
                [Statement::granting(
                    &[AnyAction],
                    &[Member(Role::User), Member(Role::Admin)],
                )],
            )
            .register(
                ResourceType::memberships(),
                [
                    Statement::granting(&[AnyAction], &[Member(Role::Admin)]),
                    Statement::granting(&[Exact(Action::Retrieve)], &[Member(Role::User)]),
                ],
            )
            .register(
                ResourceType::auth(),
                [Statement::granting(&[Exact(Action::Create)], &[Anyone])],
            );
        registry
    }

    /// Statements for `resource` whose action set contains `action` or `*`.
    pub fn statements_for<'a>(
        &'a self,
        resource: &ResourceType,
        action: Action,
    ) -> impl Iterator<Item = &'a Statement> + 'a {
        self.resources
            .get(resource)
            .into_iter()
            .flatten()
            .filter(move |statement| statement.covers_action(action))
    }

    /// All statements registered for `resource`.
    pub fn statements(&self, resource: &ResourceType) -> &[Statement] {
        self.resources
            .get(resource)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Returns the registry as an authored document.
    pub fn to_document(&self) -> PolicyDocument {
        self.resources
            .iter()
            .map(|(resource, statements)| {
                (
                    resource.as_str().to_string(),
                    statements.iter().map(StatementSpec::from).collect(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_memberships_policy_lets_users_retrieve_only() {
        let registry = PolicyRegistry::standard();
        let resource = ResourceType::memberships();

        let retrieve: Vec<_> = registry
            .statements_for(&resource, Action::Retrieve)
            .collect();
        assert_eq!(retrieve.len(), 2);
        assert!(retrieve.iter().any(|s| s.allows(Role::User)));

        let destroy: Vec<_> = registry
            .statements_for(&resource, Action::Destroy)
            .collect();
        assert_eq!(destroy.len(), 1);
        assert!(!destroy[0].allows(Role::User));
        assert!(destroy[0].allows(Role::Admin));
    }

    #[test]
    fn standard_registry_carries_every_statement() {
        let document = PolicyRegistry::standard().to_document();
        let counts: Vec<(&str, usize)> = document
            .iter()
            .map(|(resource, statements)| (resource.as_str(), statements.len()))
            .collect();
        assert_eq!(
            counts,
            [("auth", 1), ("memberships", 2), ("organizations", 1), ("users", 1)]
        );
        assert_eq!(document["users"][0].principal, ["user", "admin"]);
        assert_eq!(document["auth"][0].action, ["create"]);
        assert_eq!(document["auth"][0].principal, ["*"]);

        let reloaded = PolicyRegistry::from_document(document).unwrap();
        assert_eq!(
            reloaded.statements(&ResourceType::memberships()),
            PolicyRegistry::standard().statements(&ResourceType::memberships())
        );
    }

    #[test]
    fn unknown_resource_has_no_statements() {
        let registry = PolicyRegistry::standard();
        let resource = ResourceType::new("invoices").unwrap();
        assert_eq!(registry.statements_for(&resource, Action::List).count(), 0);
        assert!(registry.statements(&resource).is_empty());
    }

    #[test]
    fn from_json_loads_document() {
        let registry = PolicyRegistry::from_json_str(
            r#"{ "projects": [ { "action": ["list", "retrieve"], "principal": ["group:support"], "effect": "allow" } ] }"#,
        )
        .unwrap();
        let resource = ResourceType::new("projects").unwrap();
        let statements: Vec<_> = registry.statements_for(&resource, Action::List).collect();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].allows(Role::Support));
    }

    #[test]
    fn from_json_fails_fast_on_empty_principals() {
        let err = PolicyRegistry::from_json_str(
            r#"{ "projects": [ { "action": ["*"], "principal": [], "effect": "allow" } ] }"#,
        )
        .expect_err("malformed");
        assert!(err.to_string().contains("projects statement 0"));
    }

    #[test]
    fn document_round_trips() {
        let registry = PolicyRegistry::standard();
        let reloaded = PolicyRegistry::from_document(registry.to_document()).unwrap();
        assert_eq!(
            reloaded.statements(&ResourceType::users()),
            registry.statements(&ResourceType::users())
        );
    }
}
