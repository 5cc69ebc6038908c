use crate::action::Action;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::hierarchy::Hierarchy;
use crate::model::{Membership, Organization};
use crate::policy::PolicyRegistry;
use crate::store::{MembershipFilter, Store};
use crate::types::{OrganizationId, ResourceType, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Global switches for the authorization engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Expand permitted organizations with everything downstream of them.
    pub cross_org_management: bool,
    /// Let `system_admin` members see every tenant.
    pub super_admin_override: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cross_org_management: false,
            super_admin_override: true,
        }
    }
}

/// Whether a request consults policy statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scoping {
    /// Every organization the requester belongs to, regardless of action.
    AnyMembership,
    /// Only organizations where a membership role matches an allow statement.
    #[default]
    RoleScoped,
}

/// Input to [`Engine::permitted_organizations`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    pub requester: UserId,
    pub resource: ResourceType,
    pub action: Action,
    pub scoping: Scoping,
    /// Restricts the result to these organizations; absent ids are dropped.
    pub filter: Option<BTreeSet<OrganizationId>>,
}

impl AccessRequest {
    /// Creates a role-scoped request without a filter.
    pub fn new(requester: UserId, resource: ResourceType, action: Action) -> Self {
        Self {
            requester,
            resource,
            action,
            scoping: Scoping::RoleScoped,
            filter: None,
        }
    }

    pub fn scoping(mut self, scoping: Scoping) -> Self {
        self.scoping = scoping;
        self
    }

    pub fn filter(mut self, organizations: impl IntoIterator<Item = OrganizationId>) -> Self {
        self.filter = Some(organizations.into_iter().collect());
        self
    }

    /// Parses a comma-separated organization filter such as `org_a,org_b`.
    pub fn filter_str(self, raw: &str) -> Result<Self> {
        let ids = raw
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(OrganizationId::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(self.filter(ids))
    }
}

/// What justified the permitted set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Basis {
    /// Plain membership, action ignored.
    Membership,
    /// Allow statements matched membership roles.
    Statements,
    /// Super-admin override replaced the set with every tenant.
    SuperAdmin,
}

/// Set of organization ids a requester may act upon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermittedOrganizations {
    ids: BTreeSet<OrganizationId>,
    basis: Basis,
}

impl PermittedOrganizations {
    pub fn ids(&self) -> &BTreeSet<OrganizationId> {
        &self.ids
    }

    pub fn into_ids(self) -> BTreeSet<OrganizationId> {
        self.ids
    }

    pub fn contains(&self, id: &OrganizationId) -> bool {
        self.ids.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OrganizationId> {
        self.ids.iter()
    }

    pub fn basis(&self) -> Basis {
        self.basis
    }
}

/// Already-fetched data an access decision is computed from.
#[derive(Debug, Clone, Default)]
pub struct AccessSnapshot {
    /// Whether the requester exists and is active.
    pub requester_active: bool,
    /// The requester's memberships.
    pub memberships: Vec<Membership>,
    /// Organizations referenced by the memberships, archived ones included.
    /// Every organization when the override or downstream expansion can apply.
    pub organizations: Vec<Organization>,
}

/// Computes the permitted organization set from a snapshot.
///
/// Pure and infallible: deny is the empty set.
pub fn evaluate(
    policies: &PolicyRegistry,
    config: &EngineConfig,
    snapshot: &AccessSnapshot,
    request: &AccessRequest,
    now: DateTime<Utc>,
) -> PermittedOrganizations {
    let live: BTreeSet<OrganizationId> = snapshot
        .organizations
        .iter()
        .filter(|org| !org.archived)
        .map(|org| org.id.clone())
        .collect();

    let memberships: Vec<&Membership> = if snapshot.requester_active {
        snapshot
            .memberships
            .iter()
            .filter(|membership| {
                membership.user_id == request.requester
                    && membership.is_active_at(now)
                    && live.contains(&membership.organization_id)
            })
            .collect()
    } else {
        Vec::new()
    };

    let (mut ids, mut basis) = match request.scoping {
        Scoping::AnyMembership => (
            memberships
                .iter()
                .map(|membership| membership.organization_id.clone())
                .collect::<BTreeSet<_>>(),
            Basis::Membership,
        ),
        Scoping::RoleScoped => (
            role_scoped(policies, request, &memberships),
            Basis::Statements,
        ),
    };

    if config.super_admin_override
        && let Some(grant) = memberships
            .iter()
            .find(|membership| membership.role.is_super_admin())
    {
        tracing::info!(
            target: "rs_org_access::audit",
            requester = %request.requester,
            membership = %grant.id,
            organization = %grant.organization_id,
            resource = %request.resource,
            action = %request.action,
            "super-admin override grants every organization"
        );
        ids = live.clone();
        basis = Basis::SuperAdmin;
    }

    if config.cross_org_management && !ids.is_empty() {
        let hierarchy = Hierarchy::from_organizations(&snapshot.organizations);
        ids = hierarchy
            .downstream(&ids)
            .into_iter()
            .filter(|id| live.contains(id))
            .collect();
    }

    if let Some(filter) = &request.filter {
        ids.retain(|id| filter.contains(id));
    }

    tracing::debug!(
        requester = %request.requester,
        resource = %request.resource,
        action = %request.action,
        permitted = ids.len(),
        ?basis,
        "evaluated access request"
    );

    PermittedOrganizations { ids, basis }
}

fn role_scoped(
    policies: &PolicyRegistry,
    request: &AccessRequest,
    memberships: &[&Membership],
) -> BTreeSet<OrganizationId> {
    let statements: Vec<_> = policies
        .statements_for(&request.resource, request.action)
        .collect();

    let mut permitted = BTreeSet::new();
    for membership in memberships {
        if statements
            .iter()
            .any(|statement| statement.allows(membership.role))
        {
            permitted.insert(membership.organization_id.clone());
        }
    }
    permitted
}

/// Authorization engine over a pluggable store.
#[derive(Debug)]
pub struct Engine<S> {
    store: S,
    policies: PolicyRegistry,
    config: EngineConfig,
    clock: Clock,
}

/// Builder for [`Engine`].
pub struct EngineBuilder<S> {
    store: S,
    policies: PolicyRegistry,
    config: EngineConfig,
    clock: Clock,
}

impl<S> EngineBuilder<S> {
    /// Creates a builder with the standard policies and default configuration.
    pub fn new(store: S) -> Self {
        Self {
            store,
            policies: PolicyRegistry::standard(),
            config: EngineConfig::default(),
            clock: Clock::system(),
        }
    }

    /// Replaces the policy registry.
    pub fn policies(mut self, policies: PolicyRegistry) -> Self {
        self.policies = policies;
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables or disables downstream-organization expansion.
    pub fn enable_cross_org_management(mut self, on: bool) -> Self {
        self.config.cross_org_management = on;
        self
    }

    /// Enables or disables the super-admin override.
    pub fn enable_super_admin_override(mut self, on: bool) -> Self {
        self.config.super_admin_override = on;
        self
    }

    /// Sets the time source for membership expiry.
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the engine.
    pub fn build(self) -> Engine<S> {
        Engine {
            store: self.store,
            policies: self.policies,
            config: self.config,
            clock: self.clock,
        }
    }
}

impl<S> Engine<S> {
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }
}

impl<S> Engine<S>
where
    S: Store,
{
    /// Computes the organizations the requester may act upon.
    ///
    /// Only store failures surface as errors; denial is an empty set.
    pub async fn permitted_organizations(
        &self,
        request: &AccessRequest,
    ) -> Result<PermittedOrganizations> {
        let snapshot = self.snapshot(&request.requester).await?;
        Ok(evaluate(
            &self.policies,
            &self.config,
            &snapshot,
            request,
            self.clock.now(),
        ))
    }

    /// Validates a single target organization, e.g. before creating a
    /// resource inside it. Denial is reported as [`Error::NotFound`].
    pub async fn authorize_target(
        &self,
        request: &AccessRequest,
        target: &OrganizationId,
    ) -> Result<PermittedOrganizations> {
        let permitted = self.permitted_organizations(request).await?;
        if permitted.contains(target) {
            Ok(permitted)
        } else {
            tracing::debug!(
                requester = %request.requester,
                organization = %target,
                "target organization outside permitted set"
            );
            Err(Error::NotFound)
        }
    }

    /// Loads everything [`evaluate`] needs for one requester.
    pub async fn snapshot(&self, requester: &UserId) -> Result<AccessSnapshot> {
        let requester_active = self
            .store
            .user(requester)
            .await
            .map_err(Error::from)?
            .is_some_and(|user| user.is_active);
        if !requester_active {
            return Ok(AccessSnapshot::default());
        }

        let memberships = self
            .store
            .memberships(
                &MembershipFilter::new()
                    .user(requester.clone())
                    .active_at(self.clock.now()),
            )
            .await
            .map_err(Error::from)?;
        // The full organization list only matters for the override and for
        // downstream expansion; otherwise the membership organizations suffice.
        let needs_all = self.config.cross_org_management
            || (self.config.super_admin_override
                && memberships
                    .iter()
                    .any(|membership| membership.role.is_super_admin()));
        let organizations = if needs_all {
            self.store.organizations(true).await
        } else {
            let ids: BTreeSet<OrganizationId> = memberships
                .iter()
                .map(|membership| membership.organization_id.clone())
                .collect();
            self.store.organizations_by_ids(&ids).await
        }
        .map_err(Error::from)?;

        Ok(AccessSnapshot {
            requester_active,
            memberships,
            organizations,
        })
    }
}
