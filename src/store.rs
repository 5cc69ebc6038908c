use crate::error::StoreError;
use crate::model::{Membership, Organization, User};
use crate::role::Role;
use crate::types::{Email, ExternalId, MembershipId, OrganizationId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Field filter over memberships. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MembershipFilter {
    pub user: Option<UserId>,
    pub organizations: Option<BTreeSet<OrganizationId>>,
    pub role: Option<Role>,
    /// Only memberships still active at this instant.
    pub active_at: Option<DateTime<Utc>>,
    pub excluding: Option<MembershipId>,
}

impl MembershipFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user: UserId) -> Self {
        self.user = Some(user);
        self
    }

    pub fn organization(mut self, organization: OrganizationId) -> Self {
        self.organizations = Some(BTreeSet::from([organization]));
        self
    }

    pub fn organizations(mut self, organizations: BTreeSet<OrganizationId>) -> Self {
        self.organizations = Some(organizations);
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn active_at(mut self, now: DateTime<Utc>) -> Self {
        self.active_at = Some(now);
        self
    }

    pub fn excluding(mut self, membership: MembershipId) -> Self {
        self.excluding = Some(membership);
        self
    }

    /// Evaluates the filter against a single record.
    pub fn matches(&self, membership: &Membership) -> bool {
        self.user
            .as_ref()
            .is_none_or(|user| &membership.user_id == user)
            && self
                .organizations
                .as_ref()
                .is_none_or(|orgs| orgs.contains(&membership.organization_id))
            && self.role.is_none_or(|role| membership.role == role)
            && self.active_at.is_none_or(|now| membership.is_active_at(now))
            && self
                .excluding
                .as_ref()
                .is_none_or(|excluded| &membership.id != excluded)
    }
}

/// Precondition evaluated atomically with the rest of a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    /// At least `min` memberships match `filter`.
    AtLeast { filter: MembershipFilter, min: usize },
    /// The organization exists and is not archived.
    OrganizationActive(OrganizationId),
}

/// Single mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    InsertOrganization(Organization),
    /// Soft delete: rename to a sentinel and set the archived flag.
    ArchiveOrganization {
        id: OrganizationId,
        archived_name: String,
        at: DateTime<Utc>,
    },
    /// Removes tenant-owned resources other than memberships.
    PurgeOrganizationResources(OrganizationId),
    /// Fails with a conflict when the email is already taken.
    InsertUser(User),
    SetUserActive {
        id: UserId,
        active: bool,
        at: DateTime<Utc>,
    },
    /// Deactivates the user when no memberships remain at this point in the batch.
    DeactivateUserIfOrphaned { id: UserId, at: DateTime<Utc> },
    /// Deletes the user and cascades to its memberships.
    DeleteUser(UserId),
    /// Fails when the user or organization does not exist, or when the user
    /// already holds a live membership with the same role there.
    InsertMembership(Membership),
    /// Fails with a role conflict when the user already holds `role` there.
    UpdateMembershipRole {
        id: MembershipId,
        role: Role,
        at: DateTime<Utc>,
    },
    DeleteMembership(MembershipId),
    DeleteMemberships(MembershipFilter),
}

/// Atomic unit of work: all checks hold and every op applies, or nothing does.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub checks: Vec<Check>,
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    pub fn op(mut self, op: WriteOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Store interface for organizations.
#[async_trait]
pub trait OrganizationStore {
    /// Returns an organization, archived or not.
    async fn organization(
        &self,
        id: &OrganizationId,
    ) -> std::result::Result<Option<Organization>, StoreError>;

    /// Returns all organizations; archived ones only when asked.
    async fn organizations(
        &self,
        include_archived: bool,
    ) -> std::result::Result<Vec<Organization>, StoreError>;

    /// Returns the listed organizations, archived or not. Unknown ids are skipped.
    async fn organizations_by_ids(
        &self,
        ids: &BTreeSet<OrganizationId>,
    ) -> std::result::Result<Vec<Organization>, StoreError>;
}

/// Store interface for users.
#[async_trait]
pub trait UserStore {
    async fn user(&self, id: &UserId) -> std::result::Result<Option<User>, StoreError>;

    async fn user_by_email(&self, email: &Email)
    -> std::result::Result<Option<User>, StoreError>;

    async fn user_by_external_id(
        &self,
        external_id: &ExternalId,
    ) -> std::result::Result<Option<User>, StoreError>;

    /// Returns the users with the given ids; unknown ids are skipped.
    async fn users(&self, ids: &BTreeSet<UserId>) -> std::result::Result<Vec<User>, StoreError>;

    /// Returns deactivated users, candidates for identity cleanup.
    async fn inactive_users(&self) -> std::result::Result<Vec<User>, StoreError>;
}

/// Store interface for memberships.
#[async_trait]
pub trait MembershipStore {
    async fn membership(
        &self,
        id: &MembershipId,
    ) -> std::result::Result<Option<Membership>, StoreError>;

    async fn memberships(
        &self,
        filter: &MembershipFilter,
    ) -> std::result::Result<Vec<Membership>, StoreError>;

    async fn count_memberships(
        &self,
        filter: &MembershipFilter,
    ) -> std::result::Result<usize, StoreError>;
}

/// Store interface for atomic writes.
#[async_trait]
pub trait WriteStore {
    /// Applies a batch atomically.
    ///
    /// Failures are reported as boxed [`StoreFailure`](crate::StoreFailure)
    /// where applicable so callers can react to conflicts and failed checks.
    async fn commit(&self, batch: WriteBatch) -> std::result::Result<(), StoreError>;
}

/// Composite store trait.
pub trait Store:
    OrganizationStore + UserStore + MembershipStore + WriteStore + Send + Sync
{
}

impl<T> Store for T where
    T: OrganizationStore + UserStore + MembershipStore + WriteStore + Send + Sync
{
}
