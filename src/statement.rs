use crate::action::Action;
use crate::error::{Error, Result};
use crate::role::Role;
use serde::{Deserialize, Serialize};
use std::fmt;

const WILDCARD: &str = "*";

/// Statement effect. Only allow statements exist; absence of a match denies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
}

/// Action side of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionPattern {
    Any,
    Exact(Action),
}

impl ActionPattern {
    fn parse(value: &str) -> Result<Self> {
        if value.trim() == WILDCARD {
            return Ok(Self::Any);
        }
        Action::parse(value).map(Self::Exact)
    }

    pub fn matches(self, action: Action) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected == action,
        }
    }
}

impl fmt::Display for ActionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str(WILDCARD),
            Self::Exact(action) => f.write_str(action.as_str()),
        }
    }
}

/// Principal side of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrincipalPattern {
    Any,
    Role(Role),
}

impl PrincipalPattern {
    fn parse(value: &str) -> Result<Self> {
        if value.trim() == WILDCARD {
            return Ok(Self::Any);
        }
        Role::parse(value).map(Self::Role)
    }

    pub fn matches(self, role: Role) -> bool {
        match self {
            Self::Any => true,
            Self::Role(expected) => expected == role,
        }
    }
}

impl fmt::Display for PrincipalPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str(WILDCARD),
            Self::Role(role) => f.write_str(role.as_str()),
        }
    }
}

/// Validated policy statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    actions: Vec<ActionPattern>,
    principals: Vec<PrincipalPattern>,
    effect: Effect,
}

impl Statement {
    /// Builds an allow statement. Both lists must be non-empty.
    pub fn allow(actions: Vec<ActionPattern>, principals: Vec<PrincipalPattern>) -> Result<Self> {
        if actions.is_empty() {
            return Err(Error::invalid("statement must list at least one action"));
        }
        if principals.is_empty() {
            return Err(Error::invalid(
                "statement must list at least one principal",
            ));
        }
        Ok(Self {
            actions,
            principals,
            effect: Effect::Allow,
        })
    }

    /// Allow statement from patterns known to be non-empty.
    pub(crate) fn granting(actions: &[ActionPattern], principals: &[PrincipalPattern]) -> Self {
        Self {
            actions: actions.to_vec(),
            principals: principals.to_vec(),
            effect: Effect::Allow,
        }
    }

    pub fn actions(&self) -> &[ActionPattern] {
        &self.actions
    }

    pub fn principals(&self) -> &[PrincipalPattern] {
        &self.principals
    }

    pub fn effect(&self) -> Effect {
        self.effect
    }

    /// Whether the action set contains `action` or the wildcard.
    pub fn covers_action(&self, action: Action) -> bool {
        self.actions.iter().any(|pattern| pattern.matches(action))
    }

    /// Whether the principal set contains `role` or the wildcard.
    pub fn covers_role(&self, role: Role) -> bool {
        self.principals.iter().any(|pattern| pattern.matches(role))
    }

    /// Whether this statement allows `role` (action filtering happens upstream).
    pub fn allows(&self, role: Role) -> bool {
        self.effect == Effect::Allow && self.covers_role(role)
    }
}

/// Statement as authored in a policy document.
///
/// ```json
/// { "action": ["retrieve"], "principal": ["group:user"], "effect": "allow" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementSpec {
    pub action: Vec<String>,
    pub principal: Vec<String>,
    pub effect: String,
}

impl StatementSpec {
    pub fn new<A, P>(action: A, principal: P) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Self {
            action: action.into_iter().map(Into::into).collect(),
            principal: principal.into_iter().map(Into::into).collect(),
            effect: "allow".to_string(),
        }
    }
}

impl TryFrom<StatementSpec> for Statement {
    type Error = Error;

    fn try_from(authored: StatementSpec) -> Result<Self> {
        if !authored.effect.trim().eq_ignore_ascii_case("allow") {
            return Err(Error::invalid(format!(
                "unsupported effect `{}`; only allow statements may be declared",
                authored.effect
            )));
        }
        let actions = authored
            .action
            .iter()
            .map(|value| ActionPattern::parse(value))
            .collect::<Result<Vec<_>>>()?;
        let principals = authored
            .principal
            .iter()
            .map(|value| PrincipalPattern::parse(value))
            .collect::<Result<Vec<_>>>()?;
        Statement::allow(actions, principals)
    }
}

impl From<&Statement> for StatementSpec {
    fn from(statement: &Statement) -> Self {
        Self::new(
            statement.actions.iter().map(ToString::to_string),
            statement.principals.iter().map(ToString::to_string),
        )
    }
}
