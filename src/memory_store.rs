use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{StoreError, StoreFailure};
use crate::model::{Membership, Organization, User};
use crate::role::Role;
use crate::store::{
    Check, MembershipFilter, MembershipStore, OrganizationStore, UserStore, WriteBatch, WriteOp,
    WriteStore,
};
use crate::types::{Email, ExternalId, MembershipId, OrganizationId, UserId};

/// In-memory store implementation for tests and demos.
///
/// Batches are applied to a scratch copy under the write lock and swapped in
/// only when every check and op succeeds.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<State>>,
}

#[derive(Debug, Default, Clone)]
struct State {
    organizations: HashMap<OrganizationId, Organization>,
    users: HashMap<UserId, User>,
    memberships: HashMap<MembershipId, Membership>,
    /// Tenant-owned resources other than memberships, by name.
    resources: HashMap<OrganizationId, Vec<String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an organization.
    pub fn put_organization(&self, organization: Organization) {
        let mut guard = self.inner.write().expect("poisoned lock");
        guard
            .organizations
            .insert(organization.id.clone(), organization);
    }

    /// Inserts or replaces a user.
    pub fn put_user(&self, user: User) {
        let mut guard = self.inner.write().expect("poisoned lock");
        guard.users.insert(user.id.clone(), user);
    }

    /// Inserts or replaces a membership.
    pub fn put_membership(&self, membership: Membership) {
        let mut guard = self.inner.write().expect("poisoned lock");
        guard
            .memberships
            .insert(membership.id.clone(), membership);
    }

    /// Attaches a named tenant-owned resource to an organization.
    pub fn add_resource(&self, organization: OrganizationId, name: impl Into<String>) {
        let mut guard = self.inner.write().expect("poisoned lock");
        guard
            .resources
            .entry(organization)
            .or_default()
            .push(name.into());
    }

    /// Returns tenant-owned resources of an organization.
    pub fn resources(&self, organization: &OrganizationId) -> Vec<String> {
        let guard = self.inner.read().expect("poisoned lock");
        guard
            .resources
            .get(organization)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of stored users.
    pub fn user_count(&self) -> usize {
        self.inner.read().expect("poisoned lock").users.len()
    }

    /// Number of stored memberships.
    pub fn membership_count(&self) -> usize {
        self.inner.read().expect("poisoned lock").memberships.len()
    }
}

impl State {
    fn check(&self, index: usize, check: &Check) -> Result<(), StoreFailure> {
        let holds = match check {
            Check::AtLeast { filter, min } => {
                self.memberships
                    .values()
                    .filter(|membership| filter.matches(membership))
                    .count()
                    >= *min
            }
            Check::OrganizationActive(id) => self
                .organizations
                .get(id)
                .is_some_and(|org| !org.archived),
        };
        if holds {
            Ok(())
        } else {
            Err(StoreFailure::CheckFailed { index })
        }
    }

    /// Another live membership of the same user in the same organization
    /// already carries `role`.
    fn holds_role(&self, membership: &Membership, role: Role, at: DateTime<Utc>) -> bool {
        self.memberships.values().any(|existing| {
            existing.id != membership.id
                && existing.user_id == membership.user_id
                && existing.organization_id == membership.organization_id
                && existing.role == role
                && existing.is_active_at(at)
        })
    }

    fn apply(&mut self, op: WriteOp) -> Result<(), StoreFailure> {
        match op {
            WriteOp::InsertOrganization(organization) => {
                if self.organizations.contains_key(&organization.id) {
                    return Err(StoreFailure::Conflict {
                        entity: "organization",
                        field: "id",
                    });
                }
                self.organizations
                    .insert(organization.id.clone(), organization);
            }
            WriteOp::ArchiveOrganization {
                id,
                archived_name,
                at,
            } => {
                let organization = self
                    .organizations
                    .get_mut(&id)
                    .ok_or_else(|| missing("organization", &id))?;
                organization.name = archived_name;
                organization.archived = true;
                organization.archived_at = Some(at);
            }
            WriteOp::PurgeOrganizationResources(id) => {
                self.resources.remove(&id);
            }
            WriteOp::InsertUser(user) => {
                if self.users.contains_key(&user.id) {
                    return Err(StoreFailure::Conflict {
                        entity: "user",
                        field: "id",
                    });
                }
                if self.users.values().any(|existing| existing.email == user.email) {
                    return Err(StoreFailure::Conflict {
                        entity: "user",
                        field: "email",
                    });
                }
                if let Some(external_id) = &user.external_id
                    && self
                        .users
                        .values()
                        .any(|existing| existing.external_id.as_ref() == Some(external_id))
                {
                    return Err(StoreFailure::Conflict {
                        entity: "user",
                        field: "external_id",
                    });
                }
                self.users.insert(user.id.clone(), user);
            }
            WriteOp::SetUserActive { id, active, at } => {
                let user = self.users.get_mut(&id).ok_or_else(|| missing("user", &id))?;
                user.is_active = active;
                user.updated_at = at;
            }
            WriteOp::DeactivateUserIfOrphaned { id, at } => {
                let orphaned = !self
                    .memberships
                    .values()
                    .any(|membership| membership.user_id == id);
                if orphaned && let Some(user) = self.users.get_mut(&id) {
                    user.is_active = false;
                    user.updated_at = at;
                }
            }
            WriteOp::DeleteUser(id) => {
                self.users.remove(&id);
                self.memberships
                    .retain(|_, membership| membership.user_id != id);
            }
            WriteOp::InsertMembership(membership) => {
                if !self.users.contains_key(&membership.user_id) {
                    return Err(missing("user", &membership.user_id));
                }
                if !self.organizations.contains_key(&membership.organization_id) {
                    return Err(missing("organization", &membership.organization_id));
                }
                if self.memberships.contains_key(&membership.id) {
                    return Err(StoreFailure::Conflict {
                        entity: "membership",
                        field: "id",
                    });
                }
                if self.holds_role(&membership, membership.role, membership.created_at) {
                    return Err(role_conflict());
                }
                self.memberships
                    .insert(membership.id.clone(), membership);
            }
            WriteOp::UpdateMembershipRole { id, role, at } => {
                let current = self
                    .memberships
                    .get(&id)
                    .ok_or_else(|| missing("membership", &id))?;
                if current.role != role && self.holds_role(current, role, at) {
                    return Err(role_conflict());
                }
                if let Some(membership) = self.memberships.get_mut(&id) {
                    membership.role = role;
                }
            }
            WriteOp::DeleteMembership(id) => {
                self.memberships
                    .remove(&id)
                    .ok_or_else(|| missing("membership", &id))?;
            }
            WriteOp::DeleteMemberships(filter) => {
                self.memberships
                    .retain(|_, membership| !filter.matches(membership));
            }
        }
        Ok(())
    }
}

fn role_conflict() -> StoreFailure {
    StoreFailure::Conflict {
        entity: "membership",
        field: "role",
    }
}

fn missing(entity: &'static str, id: &impl ToString) -> StoreFailure {
    StoreFailure::MissingReference {
        entity,
        id: id.to_string(),
    }
}

#[async_trait]
impl OrganizationStore for MemoryStore {
    async fn organization(
        &self,
        id: &OrganizationId,
    ) -> std::result::Result<Option<Organization>, StoreError> {
        let guard = self.inner.read().expect("poisoned lock");
        Ok(guard.organizations.get(id).cloned())
    }

    async fn organizations(
        &self,
        include_archived: bool,
    ) -> std::result::Result<Vec<Organization>, StoreError> {
        let guard = self.inner.read().expect("poisoned lock");
        Ok(guard
            .organizations
            .values()
            .filter(|org| include_archived || !org.archived)
            .cloned()
            .collect())
    }

    async fn organizations_by_ids(
        &self,
        ids: &BTreeSet<OrganizationId>,
    ) -> std::result::Result<Vec<Organization>, StoreError> {
        let guard = self.inner.read().expect("poisoned lock");
        Ok(ids
            .iter()
            .filter_map(|id| guard.organizations.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn user(&self, id: &UserId) -> std::result::Result<Option<User>, StoreError> {
        let guard = self.inner.read().expect("poisoned lock");
        Ok(guard.users.get(id).cloned())
    }

    async fn user_by_email(
        &self,
        email: &Email,
    ) -> std::result::Result<Option<User>, StoreError> {
        let guard = self.inner.read().expect("poisoned lock");
        Ok(guard
            .users
            .values()
            .find(|user| &user.email == email)
            .cloned())
    }

    async fn user_by_external_id(
        &self,
        external_id: &ExternalId,
    ) -> std::result::Result<Option<User>, StoreError> {
        let guard = self.inner.read().expect("poisoned lock");
        Ok(guard
            .users
            .values()
            .find(|user| user.external_id.as_ref() == Some(external_id))
            .cloned())
    }

    async fn users(&self, ids: &BTreeSet<UserId>) -> std::result::Result<Vec<User>, StoreError> {
        let guard = self.inner.read().expect("poisoned lock");
        Ok(ids
            .iter()
            .filter_map(|id| guard.users.get(id).cloned())
            .collect())
    }

    async fn inactive_users(&self) -> std::result::Result<Vec<User>, StoreError> {
        let guard = self.inner.read().expect("poisoned lock");
        Ok(guard
            .users
            .values()
            .filter(|user| !user.is_active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn membership(
        &self,
        id: &MembershipId,
    ) -> std::result::Result<Option<Membership>, StoreError> {
        let guard = self.inner.read().expect("poisoned lock");
        Ok(guard.memberships.get(id).cloned())
    }

    async fn memberships(
        &self,
        filter: &MembershipFilter,
    ) -> std::result::Result<Vec<Membership>, StoreError> {
        let guard = self.inner.read().expect("poisoned lock");
        Ok(guard
            .memberships
            .values()
            .filter(|membership| filter.matches(membership))
            .cloned()
            .collect())
    }

    async fn count_memberships(
        &self,
        filter: &MembershipFilter,
    ) -> std::result::Result<usize, StoreError> {
        let guard = self.inner.read().expect("poisoned lock");
        Ok(guard
            .memberships
            .values()
            .filter(|membership| filter.matches(membership))
            .count())
    }
}

#[async_trait]
impl WriteStore for MemoryStore {
    async fn commit(&self, batch: WriteBatch) -> std::result::Result<(), StoreError> {
        let mut guard = self.inner.write().expect("poisoned lock");
        for (index, check) in batch.checks.iter().enumerate() {
            guard.check(index, check).map_err(StoreFailure::boxed)?;
        }
        let mut scratch = (*guard).clone();
        for op in batch.ops {
            scratch.apply(op).map_err(StoreFailure::boxed)?;
        }
        *guard = scratch;
        Ok(())
    }
}
