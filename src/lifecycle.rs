//! Invitation, membership, user and organization lifecycle.
//!
//! Local mutations go through one atomic [`WriteBatch`] each. Identity
//! provider calls sit outside that unit: remote accounts are created first
//! and deleted again if the local commit fails.

use crate::clock::Clock;
use crate::error::{BoxError, Error, Result, StoreError, StoreFailure};
use crate::identity::{IdentityError, IdentityProvider};
use crate::invite::{InviteClaims, InviteConfig, InviteSigner, InviteToken, Invitee};
use crate::model::{Membership, MembershipOptions, Organization, User, full_name};
use crate::notify::{INVITE_TEMPLATE, Notifier, WELCOME_TEMPLATE};
use crate::role::Role;
use crate::store::{Check, MembershipFilter, Store, WriteBatch, WriteOp};
use crate::types::{Email, ExternalId, MembershipId, OrganizationId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;

const GENERATED_PASSWORD_LEN: usize = 32;
const MIN_PASSWORD_LEN: usize = 8;

/// Lifecycle settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Name given to organizations on archival.
    pub archived_name: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            archived_name: "archived".to_string(),
        }
    }
}

/// Hook for the deferred identity-cleanup job.
///
/// Failures are logged by the caller and never propagated.
#[async_trait]
pub trait CleanupScheduler: Send + Sync {
    async fn schedule_identity_cleanup(
        &self,
        users: Vec<UserId>,
    ) -> std::result::Result<(), BoxError>;
}

/// Scheduler that defers everything to the periodic
/// [`Lifecycle::reconcile_identities`] run.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCleanup;

#[async_trait]
impl CleanupScheduler for NoCleanup {
    async fn schedule_identity_cleanup(
        &self,
        users: Vec<UserId>,
    ) -> std::result::Result<(), BoxError> {
        tracing::debug!(users = users.len(), "identity cleanup left to reconciliation");
        Ok(())
    }
}

/// Input for [`Lifecycle::create_organization`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewOrganization {
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub parent: Option<OrganizationId>,
}

impl NewOrganization {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn parent(mut self, parent: OrganizationId) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// Input for [`Lifecycle::signup`].
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct NewAccount {
    pub email: Email,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub password: String,
}

impl std::fmt::Debug for NewAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewAccount")
            .field("email", &self.email)
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .finish_non_exhaustive()
    }
}

/// Result of [`Lifecycle::activate_invite`].
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub user: User,
    pub membership: Membership,
    /// A new local user and identity account were created.
    pub created_user: bool,
    /// False when the invite had already been applied.
    pub created_membership: bool,
}

/// Result of [`Lifecycle::delete_membership`].
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipRemoval {
    pub membership: Membership,
    /// The user lost its last membership and was deactivated.
    pub user_deactivated: bool,
}

/// Result of [`Lifecycle::delete_organization`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrganizationRemoval {
    pub removed_memberships: usize,
    pub deactivated_users: Vec<UserId>,
}

/// Result of [`Lifecycle::reconcile_identities`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Users whose identity account and local row are gone.
    pub removed: Vec<UserId>,
    /// Users left for the next run.
    pub failed: Vec<UserId>,
}

type RollbackFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<(), IdentityError>> + Send + 'a>>;

/// Undo step for the remote half of a two-phase operation.
struct Rollback<'a> {
    undo: Option<Box<dyn FnOnce() -> RollbackFuture<'a> + Send + 'a>>,
    subject: ExternalId,
}

impl<'a> Rollback<'a> {
    fn none(subject: ExternalId) -> Self {
        Self {
            undo: None,
            subject,
        }
    }

    fn delete_account<I>(identity: &'a I, subject: ExternalId) -> Self
    where
        I: IdentityProvider,
    {
        let target = subject.clone();
        Self {
            undo: Some(Box::new(move || {
                Box::pin(async move { identity.delete_account(&target).await })
            })),
            subject,
        }
    }

    /// Runs the undo step. A failure is a reconciliation event, not an error.
    async fn run(self) {
        let Some(undo) = self.undo else {
            return;
        };
        match undo().await {
            Ok(()) | Err(IdentityError::NotFound) => {
                tracing::info!(external_id = %self.subject, "rolled back identity account");
            }
            Err(err) => {
                tracing::error!(
                    external_id = %self.subject,
                    error = %err,
                    transient = err.is_transient(),
                    "identity rollback failed; account needs reconciliation"
                );
            }
        }
    }
}

enum CommitError {
    CheckFailed(usize),
    Conflict(&'static str),
    Other(StoreError),
}

fn classify(error: StoreError) -> CommitError {
    match StoreFailure::from_store_error(&error).cloned() {
        Some(StoreFailure::CheckFailed { index }) => CommitError::CheckFailed(index),
        Some(StoreFailure::Conflict { field, .. }) => CommitError::Conflict(field),
        _ => CommitError::Other(error),
    }
}

/// Marks the batch checks whose failure means the admin floor was hit.
fn floor_guards(batch: &WriteBatch) -> Vec<bool> {
    batch
        .checks
        .iter()
        .map(|check| matches!(check, Check::AtLeast { .. }))
        .collect()
}

fn guarded_error(guards: &[bool], error: CommitError) -> Error {
    match error {
        CommitError::CheckFailed(index) if guards.get(index).copied().unwrap_or(false) => {
            Error::denied("sole admin")
        }
        CommitError::CheckFailed(_) => Error::NotFound,
        CommitError::Conflict(field) => Error::invalid(format!("{field} already exists")),
        CommitError::Other(err) => {
            let dangling = matches!(
                StoreFailure::from_store_error(&err),
                Some(StoreFailure::MissingReference { .. })
            );
            if dangling {
                Error::NotFound
            } else {
                Error::Store(err)
            }
        }
    }
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

fn admins_except(
    organization: &OrganizationId,
    membership: &MembershipId,
    now: DateTime<Utc>,
) -> MembershipFilter {
    MembershipFilter::new()
        .organization(organization.clone())
        .role(Role::Admin)
        .active_at(now)
        .excluding(membership.clone())
}

/// Lifecycle service over a store and the external collaborators.
pub struct Lifecycle<S, I, N, C = NoCleanup> {
    store: S,
    identity: I,
    notifier: N,
    scheduler: C,
    signer: InviteSigner,
    config: LifecycleConfig,
    clock: Clock,
}

/// Builder for [`Lifecycle`].
pub struct LifecycleBuilder<S, I, N, C = NoCleanup> {
    store: S,
    identity: I,
    notifier: N,
    scheduler: C,
    invite: InviteConfig,
    config: LifecycleConfig,
    clock: Clock,
}

impl<S, I, N> LifecycleBuilder<S, I, N, NoCleanup> {
    pub fn new(store: S, identity: I, notifier: N, invite: InviteConfig) -> Self {
        Self {
            store,
            identity,
            notifier,
            scheduler: NoCleanup,
            invite,
            config: LifecycleConfig::default(),
            clock: Clock::system(),
        }
    }
}

impl<S, I, N, C> LifecycleBuilder<S, I, N, C> {
    /// Sets the deferred identity-cleanup hook.
    pub fn scheduler<C2>(self, scheduler: C2) -> LifecycleBuilder<S, I, N, C2> {
        LifecycleBuilder {
            store: self.store,
            identity: self.identity,
            notifier: self.notifier,
            scheduler,
            invite: self.invite,
            config: self.config,
            clock: self.clock,
        }
    }

    pub fn config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the time source for token deadlines and membership expiry.
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the service; fails on an unusable invite configuration.
    pub fn build(self) -> Result<Lifecycle<S, I, N, C>> {
        let signer = InviteSigner::new(&self.invite, self.clock.clone())?;
        Ok(Lifecycle {
            store: self.store,
            identity: self.identity,
            notifier: self.notifier,
            scheduler: self.scheduler,
            signer,
            config: self.config,
            clock: self.clock,
        })
    }
}

impl<S, I, N, C> Lifecycle<S, I, N, C> {
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn signer(&self) -> &InviteSigner {
        &self.signer
    }
}

impl<S, I, N, C> Lifecycle<S, I, N, C>
where
    S: Store,
    I: IdentityProvider,
    N: Notifier,
    C: CleanupScheduler,
{
    /// Signs an invitation and sends it to the invitee.
    ///
    /// Nothing is persisted; a failed delivery surfaces as
    /// [`Error::UpstreamUnavailable`].
    pub async fn issue_invite(
        &self,
        inviter: &UserId,
        organization: &OrganizationId,
        role: Role,
        invitee: Invitee,
    ) -> Result<InviteToken> {
        let now = self.clock.now();
        let org = self.live_organization(organization).await?;

        let memberships = self
            .store
            .memberships(
                &MembershipFilter::new()
                    .user(inviter.clone())
                    .organization(organization.clone())
                    .active_at(now),
            )
            .await
            .map_err(Error::from)?;
        let Some(acting) = memberships
            .iter()
            .find(|m| m.role.is_admin_tier())
            .or_else(|| memberships.first())
        else {
            return Err(Error::NotFound);
        };

        self.ensure_can_grant(inviter, role).await?;

        let (token, claims) = self
            .signer
            .issue(acting.id.clone(), organization.clone(), role, &invitee)?;

        let variables = BTreeMap::from([
            ("token".to_string(), token.as_str().to_string()),
            ("organization".to_string(), org.name.clone()),
            ("role".to_string(), role.as_str().to_string()),
            (
                "name".to_string(),
                full_name(&invitee.first_name, &invitee.last_name),
            ),
        ]);
        self.notifier
            .send(INVITE_TEMPLATE, &invitee.email, &variables)
            .await
            .map_err(|err| {
                tracing::warn!(email = %invitee.email, error = %err, "invite delivery failed");
                Error::from(err)
            })?;

        tracing::info!(
            inviter = %inviter,
            organization = %organization,
            email = %claims.email,
            role = %role,
            "invite issued"
        );
        Ok(token)
    }

    /// Redeems an invitation token.
    ///
    /// Creates the user and identity account when the email is unknown,
    /// reactivates a deactivated user, and returns the existing membership
    /// when the invite was already applied.
    pub async fn activate_invite(&self, token: &InviteToken) -> Result<Activation> {
        let claims = self.signer.verify(token)?;
        let org = self.live_organization(&claims.organization_id).await?;
        let now = self.clock.now();

        if let Some(user) = self
            .store
            .user_by_email(&claims.email)
            .await
            .map_err(Error::from)?
        {
            return self.activate_existing(user, &org.id, &claims).await;
        }

        let name = full_name(&claims.first_name, &claims.last_name);
        let (external_id, rollback) = match self.provision_identity(&claims.email, &name).await {
            Ok(provisioned) => provisioned,
            Err(err) => {
                // A concurrent activation may have registered the email since
                // the first lookup.
                let Some(existing) = self
                    .store
                    .user_by_email(&claims.email)
                    .await
                    .map_err(Error::from)?
                else {
                    return Err(err);
                };
                tracing::info!(email = %claims.email, "user registered concurrently");
                return self.activate_existing(existing, &org.id, &claims).await;
            }
        };

        let user = User::new(
            claims.email.clone(),
            claims.first_name.clone(),
            claims.last_name.clone(),
            now,
        )
        .with_external_id(external_id.clone());
        let membership = Membership::new(user.id.clone(), org.id.clone(), claims.role, now)
            .with_options(&claims.membership_options());
        let batch = WriteBatch::new()
            .check(Check::OrganizationActive(org.id.clone()))
            .op(WriteOp::InsertUser(user.clone()))
            .op(WriteOp::InsertMembership(membership.clone()));

        match self.store.commit(batch).await.map_err(classify) {
            Ok(()) => {}
            Err(CommitError::Conflict("email")) => {
                // Another activation for this email won the race.
                rollback.run().await;
                let existing = self
                    .store
                    .user_by_email(&claims.email)
                    .await
                    .map_err(Error::from)?
                    .ok_or(Error::NotFound)?;
                return self.activate_existing(existing, &org.id, &claims).await;
            }
            Err(CommitError::CheckFailed(_)) => {
                rollback.run().await;
                return Err(Error::NotFound);
            }
            Err(CommitError::Conflict(field)) => {
                rollback.run().await;
                return Err(Error::invalid(format!("user {field} already registered")));
            }
            Err(CommitError::Other(err)) => {
                rollback.run().await;
                return Err(Error::Store(err));
            }
        }

        tracing::info!(
            user = %user.id,
            organization = %org.id,
            role = %claims.role,
            "invite activated with new account"
        );
        self.send_welcome(&user, &external_id, &org).await;

        Ok(Activation {
            user,
            membership,
            created_user: true,
            created_membership: true,
        })
    }

    /// Removes one membership, keeping at least one admin per organization.
    pub async fn delete_membership(&self, id: &MembershipId) -> Result<MembershipRemoval> {
        let now = self.clock.now();
        let membership = self
            .store
            .membership(id)
            .await
            .map_err(Error::from)?
            .ok_or(Error::NotFound)?;

        let mut batch = WriteBatch::new();
        if membership.role.is_admin_tier() && membership.is_active_at(now) {
            let filter = admins_except(&membership.organization_id, &membership.id, now);
            self.ensure_other_admin(&filter).await?;
            batch = batch.check(Check::AtLeast { filter, min: 1 });
        }
        let batch = batch
            .op(WriteOp::DeleteMembership(membership.id.clone()))
            .op(WriteOp::DeactivateUserIfOrphaned {
                id: membership.user_id.clone(),
                at: now,
            });
        self.commit_guarded(batch).await?;

        let user_deactivated = self
            .store
            .user(&membership.user_id)
            .await
            .map_err(Error::from)?
            .is_some_and(|user| !user.is_active);

        tracing::info!(
            membership = %membership.id,
            organization = %membership.organization_id,
            user = %membership.user_id,
            user_deactivated,
            "membership deleted"
        );
        if user_deactivated {
            self.schedule_cleanup(vec![membership.user_id.clone()]).await;
        }

        Ok(MembershipRemoval {
            membership,
            user_deactivated,
        })
    }

    /// Archives an organization, purges its resources and memberships, and
    /// deactivates users left without any membership.
    pub async fn delete_organization(&self, id: &OrganizationId) -> Result<OrganizationRemoval> {
        let now = self.clock.now();
        let org = self.live_organization(id).await?;

        let memberships = self
            .store
            .memberships(&MembershipFilter::new().organization(org.id.clone()))
            .await
            .map_err(Error::from)?;
        let members: BTreeSet<UserId> = memberships.iter().map(|m| m.user_id.clone()).collect();
        let previously_active: BTreeSet<UserId> = self
            .store
            .users(&members)
            .await
            .map_err(Error::from)?
            .into_iter()
            .filter(|user| user.is_active)
            .map(|user| user.id)
            .collect();

        let mut batch = WriteBatch::new()
            .check(Check::OrganizationActive(org.id.clone()))
            .op(WriteOp::ArchiveOrganization {
                id: org.id.clone(),
                archived_name: self.config.archived_name.clone(),
                at: now,
            })
            .op(WriteOp::PurgeOrganizationResources(org.id.clone()))
            .op(WriteOp::DeleteMemberships(
                MembershipFilter::new().organization(org.id.clone()),
            ));
        for user in &members {
            batch.push(WriteOp::DeactivateUserIfOrphaned {
                id: user.clone(),
                at: now,
            });
        }
        self.commit_guarded(batch).await?;

        let deactivated_users: Vec<UserId> = self
            .store
            .users(&previously_active)
            .await
            .map_err(Error::from)?
            .into_iter()
            .filter(|user| !user.is_active)
            .map(|user| user.id)
            .collect();

        tracing::info!(
            organization = %org.id,
            removed_memberships = memberships.len(),
            deactivated_users = deactivated_users.len(),
            "organization archived"
        );
        if !deactivated_users.is_empty() {
            self.schedule_cleanup(deactivated_users.clone()).await;
        }

        Ok(OrganizationRemoval {
            removed_memberships: memberships.len(),
            deactivated_users,
        })
    }

    /// Creates an organization with the creator as its first admin.
    pub async fn create_organization(
        &self,
        creator: &UserId,
        new: NewOrganization,
    ) -> Result<(Organization, Membership)> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(Error::invalid("organization name must not be empty"));
        }
        let now = self.clock.now();
        self.active_user(creator).await?;

        let mut org = Organization::new(name, now);
        org.attributes = new.attributes;
        org.parent = new.parent.clone();
        let membership = Membership::new(creator.clone(), org.id.clone(), Role::Admin, now);

        let mut batch = WriteBatch::new();
        if let Some(parent) = &new.parent {
            batch = batch.check(Check::OrganizationActive(parent.clone()));
        }
        let batch = batch
            .op(WriteOp::InsertOrganization(org.clone()))
            .op(WriteOp::InsertMembership(membership.clone()));
        self.commit_guarded(batch).await?;

        tracing::info!(organization = %org.id, creator = %creator, "organization created");
        Ok((org, membership))
    }

    /// Direct signup: identity account first, then the local user.
    pub async fn signup(&self, account: NewAccount) -> Result<User> {
        if account.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(Error::invalid(format!(
                "password must have at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        if self
            .store
            .user_by_email(&account.email)
            .await
            .map_err(Error::from)?
            .is_some()
        {
            return Err(Error::invalid("email already registered"));
        }

        // No local user owns this email, so any remote account is an orphan
        // left by an earlier failed rollback. It is replaced so the chosen
        // password takes effect.
        if let Some(orphan) = self.identity.account_by_email(&account.email).await? {
            match self.identity.delete_account(&orphan).await {
                Ok(()) | Err(IdentityError::NotFound) => {
                    tracing::info!(external_id = %orphan, "replaced orphaned identity account");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let name = full_name(&account.first_name, &account.last_name);
        let external_id = self
            .identity
            .create_account(&account.email, &name, &account.password)
            .await?;
        let rollback = Rollback::delete_account(&self.identity, external_id.clone());

        let user = User::new(
            account.email,
            account.first_name,
            account.last_name,
            self.clock.now(),
        )
        .with_external_id(external_id);
        let batch = WriteBatch::new().op(WriteOp::InsertUser(user.clone()));
        match self.store.commit(batch).await.map_err(classify) {
            Ok(()) => {}
            Err(CommitError::Conflict(field)) => {
                rollback.run().await;
                return Err(Error::invalid(format!("{field} already registered")));
            }
            Err(CommitError::CheckFailed(_)) => {
                rollback.run().await;
                return Err(Error::invalid("signup rejected"));
            }
            Err(CommitError::Other(err)) => {
                rollback.run().await;
                return Err(Error::Store(err));
            }
        }

        tracing::info!(user = %user.id, "user signed up");
        Ok(user)
    }

    /// Grants `role` in `organization` to an existing user.
    pub async fn assign_membership(
        &self,
        actor: &UserId,
        user: &UserId,
        organization: &OrganizationId,
        role: Role,
        options: MembershipOptions,
    ) -> Result<Membership> {
        self.ensure_can_grant(actor, role).await?;
        let now = self.clock.now();
        let target = self
            .store
            .user(user)
            .await
            .map_err(Error::from)?
            .ok_or(Error::NotFound)?;
        self.live_organization(organization).await?;

        let duplicates = self
            .store
            .count_memberships(
                &MembershipFilter::new()
                    .user(user.clone())
                    .organization(organization.clone())
                    .role(role),
            )
            .await
            .map_err(Error::from)?;
        if duplicates > 0 {
            return Err(Error::invalid(format!(
                "user already holds {role} in this organization"
            )));
        }

        let membership =
            Membership::new(user.clone(), organization.clone(), role, now).with_options(&options);
        let mut batch = WriteBatch::new().check(Check::OrganizationActive(organization.clone()));
        if !target.is_active {
            batch.push(WriteOp::SetUserActive {
                id: user.clone(),
                active: true,
                at: now,
            });
        }
        batch.push(WriteOp::InsertMembership(membership.clone()));
        self.commit_guarded(batch).await?;

        tracing::info!(
            actor = %actor,
            user = %user,
            organization = %organization,
            role = %role,
            "membership assigned"
        );
        Ok(membership)
    }

    /// Changes the role of a membership, keeping at least one admin.
    pub async fn change_role(
        &self,
        actor: &UserId,
        id: &MembershipId,
        role: Role,
    ) -> Result<Membership> {
        let now = self.clock.now();
        let mut membership = self
            .store
            .membership(id)
            .await
            .map_err(Error::from)?
            .ok_or(Error::NotFound)?;
        if membership.role == role {
            return Ok(membership);
        }
        self.ensure_can_grant(actor, role).await?;

        let mut batch = WriteBatch::new();
        if membership.role.is_admin_tier() && !role.is_admin_tier() && membership.is_active_at(now)
        {
            let filter = admins_except(&membership.organization_id, &membership.id, now);
            self.ensure_other_admin(&filter).await?;
            batch = batch.check(Check::AtLeast { filter, min: 1 });
        }
        let batch = batch.op(WriteOp::UpdateMembershipRole {
            id: membership.id.clone(),
            role,
            at: now,
        });
        self.commit_guarded(batch).await?;

        tracing::info!(
            membership = %membership.id,
            from = %membership.role,
            to = %role,
            "membership role changed"
        );
        membership.role = role;
        Ok(membership)
    }

    /// Deletes a user everywhere.
    ///
    /// Local memberships go first and the user is deactivated; then the
    /// identity account is deleted, then the local row. A failed remote delete
    /// leaves the deactivated user for [`Self::reconcile_identities`].
    pub async fn delete_user(&self, id: &UserId) -> Result<()> {
        let now = self.clock.now();
        let user = self
            .store
            .user(id)
            .await
            .map_err(Error::from)?
            .ok_or(Error::NotFound)?;

        let admin_of = self
            .store
            .memberships(
                &MembershipFilter::new()
                    .user(id.clone())
                    .role(Role::Admin)
                    .active_at(now),
            )
            .await
            .map_err(Error::from)?;
        let mut held: BTreeMap<OrganizationId, usize> = BTreeMap::new();
        for membership in &admin_of {
            *held.entry(membership.organization_id.clone()).or_default() += 1;
        }

        let mut batch = WriteBatch::new();
        for (organization, own) in held {
            let live = self
                .store
                .organization(&organization)
                .await
                .map_err(Error::from)?
                .is_some_and(|org| !org.archived);
            if !live {
                continue;
            }
            let filter = MembershipFilter::new()
                .organization(organization.clone())
                .role(Role::Admin)
                .active_at(now);
            let total = self
                .store
                .count_memberships(&filter)
                .await
                .map_err(Error::from)?;
            if total <= own {
                tracing::debug!(
                    user = %id,
                    organization = %organization,
                    "refusing to delete sole admin"
                );
                return Err(Error::denied("sole admin"));
            }
            // Someone besides this user must still be admin at commit time.
            batch = batch.check(Check::AtLeast {
                filter,
                min: own + 1,
            });
        }
        let batch = batch
            .op(WriteOp::DeleteMemberships(MembershipFilter::new().user(id.clone())))
            .op(WriteOp::SetUserActive {
                id: id.clone(),
                active: false,
                at: now,
            });
        self.commit_guarded(batch).await?;

        if let Some(external_id) = &user.external_id {
            match self.identity.delete_account(external_id).await {
                Ok(()) | Err(IdentityError::NotFound) => {}
                Err(err) => {
                    tracing::warn!(
                        user = %id,
                        external_id = %external_id,
                        error = %err,
                        "identity delete failed; user left for reconciliation"
                    );
                    return Err(err.into());
                }
            }
        }

        self.store
            .commit(WriteBatch::new().op(WriteOp::DeleteUser(id.clone())))
            .await
            .map_err(Error::from)?;
        tracing::info!(user = %id, "user deleted");
        Ok(())
    }

    /// Returns an identity-provider password reset link for an active user.
    pub async fn password_reset_link(&self, id: &UserId) -> Result<String> {
        let user = self.active_user(id).await?;
        let external_id = user.external_id.ok_or(Error::NotFound)?;
        match self.identity.password_reset_link(&external_id).await {
            Ok(link) => Ok(link),
            Err(IdentityError::NotFound) => Err(Error::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes identity accounts and local rows of deactivated users without
    /// memberships. Safe to run repeatedly.
    pub async fn reconcile_identities(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for user in self.store.inactive_users().await.map_err(Error::from)? {
            let remaining = self
                .store
                .count_memberships(&MembershipFilter::new().user(user.id.clone()))
                .await
                .map_err(Error::from)?;
            if remaining > 0 {
                continue;
            }

            if let Some(external_id) = &user.external_id {
                match self.identity.delete_account(external_id).await {
                    Ok(()) | Err(IdentityError::NotFound) => {}
                    Err(err) => {
                        tracing::error!(
                            user = %user.id,
                            external_id = %external_id,
                            error = %err,
                            transient = err.is_transient(),
                            "identity reconciliation failed"
                        );
                        report.failed.push(user.id);
                        continue;
                    }
                }
            }

            let batch = WriteBatch::new().op(WriteOp::DeleteUser(user.id.clone()));
            match self.store.commit(batch).await {
                Ok(()) => report.removed.push(user.id),
                Err(err) => {
                    tracing::error!(user = %user.id, error = %err, "local user removal failed");
                    report.failed.push(user.id);
                }
            }
        }

        tracing::info!(
            removed = report.removed.len(),
            failed = report.failed.len(),
            "identity reconciliation finished"
        );
        Ok(report)
    }

    async fn live_organization(&self, id: &OrganizationId) -> Result<Organization> {
        match self.store.organization(id).await.map_err(Error::from)? {
            Some(org) if !org.archived => Ok(org),
            _ => Err(Error::NotFound),
        }
    }

    async fn active_user(&self, id: &UserId) -> Result<User> {
        match self.store.user(id).await.map_err(Error::from)? {
            Some(user) if user.is_active => Ok(user),
            _ => Err(Error::NotFound),
        }
    }

    async fn reload_user(&self, user: User) -> Result<User> {
        Ok(self
            .store
            .user(&user.id)
            .await
            .map_err(Error::from)?
            .unwrap_or(user))
    }

    /// Rejects grants of `system_admin` by anyone not holding it.
    async fn ensure_can_grant(&self, actor: &UserId, role: Role) -> Result<()> {
        if !role.is_super_admin() {
            return Ok(());
        }
        let held = self
            .store
            .count_memberships(
                &MembershipFilter::new()
                    .user(actor.clone())
                    .role(Role::SystemAdmin)
                    .active_at(self.clock.now()),
            )
            .await
            .map_err(Error::from)?;
        if held > 0 {
            Ok(())
        } else {
            tracing::debug!(actor = %actor, role = %role, "role escalation rejected");
            Err(Error::denied("role escalation"))
        }
    }

    async fn ensure_other_admin(&self, filter: &MembershipFilter) -> Result<()> {
        let remaining = self
            .store
            .count_memberships(filter)
            .await
            .map_err(Error::from)?;
        if remaining == 0 {
            tracing::debug!(filter = ?filter, "admin floor reached");
            return Err(Error::denied("sole admin"));
        }
        Ok(())
    }

    /// Commits a batch whose checks guard the admin floor or a live
    /// organization.
    async fn commit_guarded(&self, batch: WriteBatch) -> Result<()> {
        let guards = floor_guards(&batch);
        self.store
            .commit(batch)
            .await
            .map_err(|err| guarded_error(&guards, classify(err)))
    }

    async fn activate_existing(
        &self,
        user: User,
        organization: &OrganizationId,
        claims: &InviteClaims,
    ) -> Result<Activation> {
        let (membership, created) = self
            .attach(
                user.clone(),
                organization,
                claims.role,
                &claims.membership_options(),
            )
            .await?;
        let user = self.reload_user(user).await?;
        Ok(Activation {
            user,
            membership,
            created_user: false,
            created_membership: created,
        })
    }

    /// Existing-user path of activation; idempotent per (user, org, role).
    async fn attach(
        &self,
        user: User,
        organization: &OrganizationId,
        role: Role,
        options: &MembershipOptions,
    ) -> Result<(Membership, bool)> {
        let now = self.clock.now();
        let existing = self
            .store
            .memberships(
                &MembershipFilter::new()
                    .user(user.id.clone())
                    .organization(organization.clone())
                    .role(role)
                    .active_at(now),
            )
            .await
            .map_err(Error::from)?;
        if let Some(membership) = existing.into_iter().next() {
            tracing::debug!(membership = %membership.id, "invite already applied");
            return Ok((membership, false));
        }

        let membership =
            Membership::new(user.id.clone(), organization.clone(), role, now).with_options(options);
        let mut batch = WriteBatch::new().check(Check::OrganizationActive(organization.clone()));
        if !user.is_active {
            batch.push(WriteOp::SetUserActive {
                id: user.id.clone(),
                active: true,
                at: now,
            });
        }
        batch.push(WriteOp::InsertMembership(membership.clone()));
        match self.store.commit(batch).await.map_err(classify) {
            Ok(()) => {}
            Err(CommitError::Conflict("role")) => {
                // A concurrent activation of the same invite committed first.
                let applied = self
                    .store
                    .memberships(
                        &MembershipFilter::new()
                            .user(user.id.clone())
                            .organization(organization.clone())
                            .role(role)
                            .active_at(now),
                    )
                    .await
                    .map_err(Error::from)?
                    .into_iter()
                    .next()
                    .ok_or(Error::NotFound)?;
                tracing::debug!(membership = %applied.id, "invite already applied");
                return Ok((applied, false));
            }
            Err(err) => return Err(guarded_error(&[], err)),
        }

        tracing::info!(
            user = %user.id,
            organization = %organization,
            role = %role,
            reactivated = !user.is_active,
            "invite attached to existing user"
        );
        Ok((membership, true))
    }

    /// Remote half of account creation. Reuses an orphaned account left by
    /// an earlier failed attempt; only accounts created here are rolled back.
    async fn provision_identity(
        &self,
        email: &Email,
        name: &str,
    ) -> Result<(ExternalId, Rollback<'_>)> {
        if let Some(existing) = self.identity.account_by_email(email).await? {
            tracing::info!(email = %email, external_id = %existing, "reusing identity account");
            return Ok((existing.clone(), Rollback::none(existing)));
        }
        let created = match self
            .identity
            .create_account(email, name, &generate_password())
            .await
        {
            Ok(created) => created,
            Err(err) => {
                // The account may have been created concurrently for the same email.
                if let Ok(Some(existing)) = self.identity.account_by_email(email).await {
                    tracing::info!(
                        email = %email,
                        external_id = %existing,
                        error = %err,
                        "identity account created concurrently"
                    );
                    return Ok((existing.clone(), Rollback::none(existing)));
                }
                return Err(err.into());
            }
        };
        Ok((
            created.clone(),
            Rollback::delete_account(&self.identity, created),
        ))
    }

    async fn send_welcome(&self, user: &User, external_id: &ExternalId, org: &Organization) {
        let link = match self.identity.password_reset_link(external_id).await {
            Ok(link) => link,
            Err(err) => {
                tracing::warn!(user = %user.id, error = %err, "password reset link unavailable");
                return;
            }
        };
        let variables = BTreeMap::from([
            ("reset_link".to_string(), link),
            ("organization".to_string(), org.name.clone()),
            ("name".to_string(), user.full_name()),
        ]);
        if let Err(err) = self
            .notifier
            .send(WELCOME_TEMPLATE, &user.email, &variables)
            .await
        {
            tracing::warn!(user = %user.id, error = %err, "welcome notification failed");
        }
    }

    async fn schedule_cleanup(&self, users: Vec<UserId>) {
        let count = users.len();
        if let Err(err) = self.scheduler.schedule_identity_cleanup(users).await {
            tracing::warn!(users = count, error = %err, "identity cleanup scheduling failed");
        }
    }
}
