#![cfg(feature = "memory-store")]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::executor::block_on;
use rs_org_access::{
    Clock, Email, Error, ExternalId, IdentityError, Invitee, InviteConfig, Lifecycle,
    LifecycleBuilder, Membership, MembershipFilter, MembershipId, MembershipOptions,
    MembershipStore, MemoryIdentityProvider, MemoryStore, NewAccount, NewOrganization,
    Organization, OrganizationId, OrganizationStore, RecordingNotifier, RecordingScheduler, Role,
    StoreError, User, UserId, UserStore, WriteBatch, WriteStore, INVITE_TEMPLATE,
    WELCOME_TEMPLATE,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Memory store whose commits can be made to fail and whose reads can lag
/// behind concurrent writers.
#[derive(Clone, Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_commits: Arc<AtomicBool>,
    stale_email_reads: Arc<AtomicUsize>,
    stale_membership_reads: Arc<AtomicUsize>,
}

/// Consumes one pending stale read, if any.
fn take_stale(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl OrganizationStore for FlakyStore {
    async fn organization(&self, id: &OrganizationId) -> Result<Option<Organization>, StoreError> {
        self.inner.organization(id).await
    }

    async fn organizations(&self, include_archived: bool) -> Result<Vec<Organization>, StoreError> {
        self.inner.organizations(include_archived).await
    }

    async fn organizations_by_ids(
        &self,
        ids: &BTreeSet<OrganizationId>,
    ) -> Result<Vec<Organization>, StoreError> {
        self.inner.organizations_by_ids(ids).await
    }
}

#[async_trait]
impl UserStore for FlakyStore {
    async fn user(&self, id: &UserId) -> Result<Option<User>, StoreError> {
        self.inner.user(id).await
    }

    async fn user_by_email(&self, email: &Email) -> Result<Option<User>, StoreError> {
        if take_stale(&self.stale_email_reads) {
            return Ok(None);
        }
        self.inner.user_by_email(email).await
    }

    async fn user_by_external_id(
        &self,
        external_id: &ExternalId,
    ) -> Result<Option<User>, StoreError> {
        self.inner.user_by_external_id(external_id).await
    }

    async fn users(&self, ids: &BTreeSet<UserId>) -> Result<Vec<User>, StoreError> {
        self.inner.users(ids).await
    }

    async fn inactive_users(&self) -> Result<Vec<User>, StoreError> {
        self.inner.inactive_users().await
    }
}

#[async_trait]
impl MembershipStore for FlakyStore {
    async fn membership(&self, id: &MembershipId) -> Result<Option<Membership>, StoreError> {
        self.inner.membership(id).await
    }

    async fn memberships(&self, filter: &MembershipFilter) -> Result<Vec<Membership>, StoreError> {
        if take_stale(&self.stale_membership_reads) {
            return Ok(Vec::new());
        }
        self.inner.memberships(filter).await
    }

    async fn count_memberships(&self, filter: &MembershipFilter) -> Result<usize, StoreError> {
        self.inner.count_memberships(filter).await
    }
}

#[async_trait]
impl WriteStore for FlakyStore {
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err("database unavailable".into());
        }
        self.inner.commit(batch).await
    }
}

type Service = Lifecycle<FlakyStore, MemoryIdentityProvider, RecordingNotifier, RecordingScheduler>;

struct Harness {
    store: FlakyStore,
    identity: MemoryIdentityProvider,
    notifier: RecordingNotifier,
    scheduler: RecordingScheduler,
    now: Arc<Mutex<DateTime<Utc>>>,
    lifecycle: Service,
}

impl Harness {
    fn new() -> Self {
        let store = FlakyStore::default();
        let identity = MemoryIdentityProvider::new();
        let notifier = RecordingNotifier::new();
        let scheduler = RecordingScheduler::new();
        let now = Arc::new(Mutex::new(Utc::now()));
        let handle = now.clone();
        let lifecycle = LifecycleBuilder::new(
            store.clone(),
            identity.clone(),
            notifier.clone(),
            InviteConfig::new("test-secret").ttl_seconds(3_600),
        )
        .scheduler(scheduler.clone())
        .clock(Clock::from_fn(move || *handle.lock().unwrap()))
        .build()
        .unwrap();
        Self {
            store,
            identity,
            notifier,
            scheduler,
            now,
            lifecycle,
        }
    }

    fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }

    fn memory(&self) -> &MemoryStore {
        &self.store.inner
    }

    /// Active user with an identity account.
    fn user(&self, email: &str) -> User {
        let email = Email::new(email).unwrap();
        let external = self.identity.put_account(email.clone(), "Seeded");
        let user = User::new(email, "Seeded", "", Utc::now()).with_external_id(external);
        self.memory().put_user(user.clone());
        user
    }

    fn org_with_admin(&self, admin: &User, name: &str) -> (Organization, Membership) {
        block_on(
            self.lifecycle
                .create_organization(&admin.id, NewOrganization::new(name)),
        )
        .unwrap()
    }

    fn invite(&self, inviter: &User, org: &OrganizationId, role: Role, email: &str) -> rs_org_access::InviteToken {
        block_on(self.lifecycle.issue_invite(
            &inviter.id,
            org,
            role,
            Invitee::new(Email::new(email).unwrap()).name("New", "Member"),
        ))
        .unwrap()
    }

    fn memberships_of(&self, user: &UserId) -> Vec<Membership> {
        block_on(
            self.memory()
                .memberships(&MembershipFilter::new().user(user.clone())),
        )
        .unwrap()
    }

    fn load_user(&self, id: &UserId) -> Option<User> {
        block_on(self.memory().user(id)).unwrap()
    }
}

#[test]
fn invite_round_trip_creates_single_user_and_membership() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let (acme, _) = h.org_with_admin(&admin, "Acme");
    let (globex, _) = h.org_with_admin(&admin, "Globex");

    let token = h.invite(&admin, &acme.id, Role::User, "a@x.com");
    let sent = h.notifier.last(INVITE_TEMPLATE).expect("invite sent");
    assert_eq!(sent.recipient.as_str(), "a@x.com");
    assert_eq!(sent.variables["token"], token.as_str());

    let first = block_on(h.lifecycle.activate_invite(&token)).unwrap();
    assert!(first.created_user);
    assert_eq!(first.user.email.as_str(), "a@x.com");
    assert_eq!(first.membership.organization_id, acme.id);
    assert_eq!(first.membership.role, Role::User);
    assert_eq!(h.memory().user_count(), 2);

    let welcome = h.notifier.last(WELCOME_TEMPLATE).expect("welcome sent");
    assert!(welcome.variables["reset_link"].contains("reset"));

    let token = h.invite(&admin, &globex.id, Role::User, "A@X.com");
    let second = block_on(h.lifecycle.activate_invite(&token)).unwrap();
    assert!(!second.created_user);
    assert_eq!(second.user.id, first.user.id);
    assert_eq!(h.memory().user_count(), 2);
    assert_eq!(h.memberships_of(&first.user.id).len(), 2);
    assert_eq!(h.identity.account_count(), 2);
}

#[test]
fn activation_is_idempotent() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let (acme, _) = h.org_with_admin(&admin, "Acme");
    let token = h.invite(&admin, &acme.id, Role::User, "a@x.com");

    let first = block_on(h.lifecycle.activate_invite(&token)).unwrap();
    let again = block_on(h.lifecycle.activate_invite(&token)).unwrap();
    assert!(!again.created_membership);
    assert_eq!(again.membership.id, first.membership.id);
    assert_eq!(h.memberships_of(&first.user.id).len(), 1);
}

#[test]
fn activation_losing_the_email_race_attaches_membership() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let (acme, _) = h.org_with_admin(&admin, "Acme");
    let (globex, _) = h.org_with_admin(&admin, "Globex");
    let (initech, _) = h.org_with_admin(&admin, "Initech");

    let winner = h.invite(&admin, &acme.id, Role::User, "a@x.com");
    let first = block_on(h.lifecycle.activate_invite(&winner)).unwrap();
    let accounts = h.identity.account_count();

    // Both lookups miss the winner; the identity provider refuses the
    // duplicate and the retried lookup finds the winner's account.
    let token = h.invite(&admin, &globex.id, Role::User, "a@x.com");
    h.store.stale_email_reads.store(1, Ordering::SeqCst);
    h.identity.stale_lookups(1);
    let second = block_on(h.lifecycle.activate_invite(&token)).unwrap();
    assert!(!second.created_user);
    assert!(second.created_membership);
    assert_eq!(second.user.id, first.user.id);
    assert_eq!(second.membership.organization_id, globex.id);

    // Identity lookups stay stale; the local user shows up on the retry.
    let token = h.invite(&admin, &initech.id, Role::User, "a@x.com");
    h.store.stale_email_reads.store(1, Ordering::SeqCst);
    h.identity.stale_lookups(2);
    let third = block_on(h.lifecycle.activate_invite(&token)).unwrap();
    assert_eq!(third.user.id, first.user.id);
    assert_eq!(third.membership.organization_id, initech.id);

    assert_eq!(h.memory().user_count(), 2);
    assert_eq!(h.memberships_of(&first.user.id).len(), 3);
    assert_eq!(h.identity.account_count(), accounts);
    assert_eq!(h.identity.delete_count(), 0);
}

#[test]
fn concurrent_activation_of_one_invite_yields_one_membership() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let (acme, _) = h.org_with_admin(&admin, "Acme");
    let token = h.invite(&admin, &acme.id, Role::User, "a@x.com");
    let first = block_on(h.lifecycle.activate_invite(&token)).unwrap();

    // The second activation does not see the first membership before it
    // commits; the store's uniqueness rule decides.
    h.store.stale_membership_reads.store(1, Ordering::SeqCst);
    let again = block_on(h.lifecycle.activate_invite(&token)).unwrap();
    assert!(!again.created_membership);
    assert_eq!(again.membership.id, first.membership.id);
    assert_eq!(h.memberships_of(&first.user.id).len(), 1);
}

#[test]
fn invited_membership_keeps_its_deadline() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let (acme, _) = h.org_with_admin(&admin, "Acme");
    let deadline = Utc::now() + Duration::days(14);

    let token = block_on(h.lifecycle.issue_invite(
        &admin.id,
        &acme.id,
        Role::User,
        Invitee::new(Email::new("contractor@partner.io").unwrap())
            .external(true)
            .expires(deadline),
    ))
    .unwrap();
    let activation = block_on(h.lifecycle.activate_invite(&token)).unwrap();
    assert_eq!(activation.membership.expires, Some(deadline));
    assert!(activation.membership.is_external);
    assert_eq!(h.memberships_of(&activation.user.id)[0].expires, Some(deadline));
}

#[test]
fn expired_token_is_rejected() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let (acme, _) = h.org_with_admin(&admin, "Acme");
    let token = h.invite(&admin, &acme.id, Role::User, "a@x.com");

    h.advance(Duration::seconds(3_600));
    let err = block_on(h.lifecycle.activate_invite(&token)).unwrap_err();
    assert!(matches!(err, Error::TokenExpired));
    assert_eq!(h.memory().user_count(), 1);
    assert_eq!(h.identity.account_count(), 1);
}

#[test]
fn invite_requires_membership_and_blocks_escalation() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let outsider = h.user("out@globex.io");
    let (acme, _) = h.org_with_admin(&admin, "Acme");
    let invitee = Invitee::new(Email::new("a@x.com").unwrap());

    let err = block_on(h.lifecycle.issue_invite(
        &outsider.id,
        &acme.id,
        Role::User,
        invitee.clone(),
    ))
    .unwrap_err();
    assert!(matches!(err, Error::NotFound));

    let err = block_on(h.lifecycle.issue_invite(
        &admin.id,
        &acme.id,
        Role::SystemAdmin,
        invitee,
    ))
    .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied { .. }));
    assert!(h.notifier.sent().is_empty());
}

#[test]
fn failed_delivery_surfaces_upstream_error() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let (acme, _) = h.org_with_admin(&admin, "Acme");
    h.notifier.set_failing(true);

    let err = block_on(h.lifecycle.issue_invite(
        &admin.id,
        &acme.id,
        Role::User,
        Invitee::new(Email::new("a@x.com").unwrap()),
    ))
    .unwrap_err();
    assert!(matches!(err, Error::UpstreamUnavailable { .. }));
}

#[test]
fn failed_local_commit_rolls_back_identity() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let (acme, _) = h.org_with_admin(&admin, "Acme");
    let token = h.invite(&admin, &acme.id, Role::User, "a@x.com");

    h.store.fail_commits.store(true, Ordering::SeqCst);
    let err = block_on(h.lifecycle.activate_invite(&token)).unwrap_err();
    assert!(matches!(err, Error::Store(_)));
    assert_eq!(h.identity.account_count(), 1);
    assert_eq!(h.memory().user_count(), 1);

    h.store.fail_commits.store(false, Ordering::SeqCst);
    let activation = block_on(h.lifecycle.activate_invite(&token)).unwrap();
    assert!(activation.created_user);
    assert_eq!(h.identity.account_count(), 2);
}

#[test]
fn failed_identity_creation_leaves_nothing_local() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let (acme, _) = h.org_with_admin(&admin, "Acme");
    let token = h.invite(&admin, &acme.id, Role::User, "a@x.com");

    h.identity
        .fail_creates(Some(IdentityError::Transient("timeout".into())));
    let err = block_on(h.lifecycle.activate_invite(&token)).unwrap_err();
    assert!(matches!(
        err,
        Error::UpstreamUnavailable {
            transient: true,
            ..
        }
    ));
    assert_eq!(h.memory().user_count(), 1);
}

#[test]
fn orphaned_identity_is_reused_on_retry() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let (acme, _) = h.org_with_admin(&admin, "Acme");
    let orphan = h
        .identity
        .put_account(Email::new("a@x.com").unwrap(), "Orphan");
    let token = h.invite(&admin, &acme.id, Role::User, "a@x.com");

    let activation = block_on(h.lifecycle.activate_invite(&token)).unwrap();
    assert_eq!(activation.user.external_id, Some(orphan));
    assert_eq!(h.identity.account_count(), 2);
}

#[test]
fn admin_floor_protects_sole_admin() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let (acme, sole) = h.org_with_admin(&admin, "Acme");

    let err = block_on(h.lifecycle.delete_membership(&sole.id)).unwrap_err();
    assert!(matches!(err, Error::PermissionDenied { .. }));
    assert_eq!(h.memberships_of(&admin.id).len(), 1);

    let second = h.user("second@acme.io");
    let granted = block_on(h.lifecycle.assign_membership(
        &admin.id,
        &second.id,
        &acme.id,
        Role::Admin,
        MembershipOptions::default(),
    ))
    .unwrap();

    let removal = block_on(h.lifecycle.delete_membership(&sole.id)).unwrap();
    assert!(removal.user_deactivated);
    assert_eq!(h.memberships_of(&second.id), vec![granted]);
}

#[test]
fn expired_admin_does_not_count_toward_floor() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let (acme, sole) = h.org_with_admin(&admin, "Acme");
    let lapsed = h.user("lapsed@acme.io");
    let expires = *h.now.lock().unwrap() + Duration::hours(1);
    block_on(h.lifecycle.assign_membership(
        &admin.id,
        &lapsed.id,
        &acme.id,
        Role::Admin,
        MembershipOptions {
            expires: Some(expires),
            ..MembershipOptions::default()
        },
    ))
    .unwrap();

    h.advance(Duration::hours(2));
    let err = block_on(h.lifecycle.delete_membership(&sole.id)).unwrap_err();
    assert!(matches!(err, Error::PermissionDenied { .. }));
}

#[test]
fn last_membership_removal_deactivates_and_schedules_cleanup() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let (acme, _) = h.org_with_admin(&admin, "Acme");
    let token = h.invite(&admin, &acme.id, Role::User, "a@x.com");
    let activation = block_on(h.lifecycle.activate_invite(&token)).unwrap();

    let removal = block_on(h.lifecycle.delete_membership(&activation.membership.id)).unwrap();
    assert!(removal.user_deactivated);
    assert!(!h.load_user(&activation.user.id).unwrap().is_active);
    assert_eq!(h.scheduler.scheduled(), vec![activation.user.id.clone()]);

    let token = h.invite(&admin, &acme.id, Role::User, "a@x.com");
    let back = block_on(h.lifecycle.activate_invite(&token)).unwrap();
    assert_eq!(back.user.id, activation.user.id);
    assert!(back.user.is_active);
}

#[test]
fn change_role_keeps_an_admin() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let (_, sole) = h.org_with_admin(&admin, "Acme");

    let err = block_on(h.lifecycle.change_role(&admin.id, &sole.id, Role::User)).unwrap_err();
    assert!(matches!(err, Error::PermissionDenied { .. }));

    let err = block_on(h.lifecycle.change_role(&admin.id, &sole.id, Role::SystemAdmin)).unwrap_err();
    assert!(matches!(err, Error::PermissionDenied { .. }));

    let same = block_on(h.lifecycle.change_role(&admin.id, &sole.id, Role::Admin)).unwrap();
    assert_eq!(same.role, Role::Admin);
}

#[test]
fn assign_membership_rejects_duplicates() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let member = h.user("m@acme.io");
    let (acme, _) = h.org_with_admin(&admin, "Acme");

    let assign = |role| {
        block_on(h.lifecycle.assign_membership(
            &admin.id,
            &member.id,
            &acme.id,
            role,
            MembershipOptions::default(),
        ))
    };
    assert!(assign(Role::User).is_ok());
    assert!(matches!(assign(Role::User), Err(Error::ValidationFailed(_))));
    assert!(assign(Role::Support).is_ok());
    assert_eq!(h.memberships_of(&member.id).len(), 2);
}

#[test]
fn organization_deletion_archives_and_deactivates_sole_members() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let (acme, _) = h.org_with_admin(&admin, "Acme");
    let (globex, _) = h.org_with_admin(&admin, "Globex");
    let local = h.user("local@acme.io");
    block_on(h.lifecycle.assign_membership(
        &admin.id,
        &local.id,
        &acme.id,
        Role::User,
        MembershipOptions::default(),
    ))
    .unwrap();
    h.memory().add_resource(acme.id.clone(), "device-1");
    h.scheduler.set_unreachable(true);

    let removal = block_on(h.lifecycle.delete_organization(&acme.id)).unwrap();
    assert_eq!(removal.removed_memberships, 2);
    assert_eq!(removal.deactivated_users, vec![local.id.clone()]);

    let archived = block_on(h.memory().organization(&acme.id)).unwrap().unwrap();
    assert!(archived.archived);
    assert_eq!(archived.name, "archived");
    assert!(h.memory().resources(&acme.id).is_empty());
    assert!(!h.load_user(&local.id).unwrap().is_active);
    assert!(h.load_user(&admin.id).unwrap().is_active);
    assert_eq!(h.memberships_of(&admin.id)[0].organization_id, globex.id);

    let err = block_on(h.lifecycle.delete_organization(&acme.id)).unwrap_err();
    assert!(matches!(err, Error::NotFound));
}

#[test]
fn delete_user_honors_floor_and_reconciles_remote_failures() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let (acme, _) = h.org_with_admin(&admin, "Acme");

    let err = block_on(h.lifecycle.delete_user(&admin.id)).unwrap_err();
    assert!(matches!(err, Error::PermissionDenied { .. }));

    let other = h.user("other@acme.io");
    block_on(h.lifecycle.assign_membership(
        &admin.id,
        &other.id,
        &acme.id,
        Role::Admin,
        MembershipOptions::default(),
    ))
    .unwrap();

    h.identity
        .fail_deletes(Some(IdentityError::Transient("503".into())));
    let err = block_on(h.lifecycle.delete_user(&admin.id)).unwrap_err();
    assert!(matches!(err, Error::UpstreamUnavailable { .. }));
    let left = h.load_user(&admin.id).expect("left for reconciliation");
    assert!(!left.is_active);
    assert!(h.memberships_of(&admin.id).is_empty());

    let report = block_on(h.lifecycle.reconcile_identities()).unwrap();
    assert_eq!(report.failed, vec![admin.id.clone()]);

    h.identity.fail_deletes(None);
    let report = block_on(h.lifecycle.reconcile_identities()).unwrap();
    assert_eq!(report.removed, vec![admin.id.clone()]);
    assert!(h.load_user(&admin.id).is_none());

    let report = block_on(h.lifecycle.reconcile_identities()).unwrap();
    assert!(report.removed.is_empty() && report.failed.is_empty());
}

#[test]
fn delete_user_removes_identity_and_row() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let (acme, _) = h.org_with_admin(&admin, "Acme");
    let member = h.user("m@acme.io");
    block_on(h.lifecycle.assign_membership(
        &admin.id,
        &member.id,
        &acme.id,
        Role::User,
        MembershipOptions::default(),
    ))
    .unwrap();

    block_on(h.lifecycle.delete_user(&member.id)).unwrap();
    assert!(h.load_user(&member.id).is_none());
    assert!(!h.identity.contains(member.external_id.as_ref().unwrap()));
    assert!(matches!(
        block_on(h.lifecycle.delete_user(&member.id)),
        Err(Error::NotFound)
    ));
}

#[test]
fn signup_creates_identity_and_rejects_duplicates() {
    let h = Harness::new();
    let account = NewAccount {
        email: Email::new("new@x.com").unwrap(),
        first_name: "New".into(),
        last_name: "User".into(),
        password: "correct horse".into(),
    };

    let user = block_on(h.lifecycle.signup(account.clone())).unwrap();
    let external = user.external_id.clone().expect("linked");
    assert_eq!(h.identity.name_of(&external).as_deref(), Some("New User"));

    let err = block_on(h.lifecycle.signup(account.clone())).unwrap_err();
    assert!(matches!(err, Error::ValidationFailed(_)));

    let short = NewAccount {
        email: Email::new("short@x.com").unwrap(),
        password: "short".into(),
        ..account
    };
    assert!(matches!(
        block_on(h.lifecycle.signup(short)),
        Err(Error::ValidationFailed(_))
    ));
    assert_eq!(h.identity.account_count(), 1);
}

#[test]
fn signup_replaces_orphaned_identity_account() {
    let h = Harness::new();
    let email = Email::new("back@x.com").unwrap();
    let orphan = h.identity.put_account(email.clone(), "Orphan");

    let user = block_on(h.lifecycle.signup(NewAccount {
        email,
        first_name: "Back".into(),
        last_name: "Again".into(),
        password: "long enough".into(),
    }))
    .unwrap();
    let external = user.external_id.expect("linked");
    assert_ne!(external, orphan);
    assert!(!h.identity.contains(&orphan));
    assert_eq!(h.identity.name_of(&external).as_deref(), Some("Back Again"));
    assert_eq!(h.identity.account_count(), 1);
}

#[test]
fn signup_rolls_back_identity_when_commit_fails() {
    let h = Harness::new();
    h.store.fail_commits.store(true, Ordering::SeqCst);
    let err = block_on(h.lifecycle.signup(NewAccount {
        email: Email::new("new@x.com").unwrap(),
        first_name: String::new(),
        last_name: String::new(),
        password: "long enough".into(),
    }))
    .unwrap_err();
    assert!(matches!(err, Error::Store(_)));
    assert_eq!(h.identity.account_count(), 0);
    assert_eq!(h.identity.delete_count(), 1);
}

#[test]
fn create_organization_requires_live_parent() {
    let h = Harness::new();
    let admin = h.user("admin@acme.io");
    let (parent, _) = h.org_with_admin(&admin, "Parent");

    let (child, membership) = block_on(h.lifecycle.create_organization(
        &admin.id,
        NewOrganization::new("Child").parent(parent.id.clone()),
    ))
    .unwrap();
    assert_eq!(child.parent, Some(parent.id.clone()));
    assert_eq!(membership.role, Role::Admin);

    let err = block_on(h.lifecycle.create_organization(
        &admin.id,
        NewOrganization::new("Stray").parent(OrganizationId::generate()),
    ))
    .unwrap_err();
    assert!(matches!(err, Error::NotFound));

    let err = block_on(
        h.lifecycle
            .create_organization(&admin.id, NewOrganization::new("  ")),
    )
    .unwrap_err();
    assert!(matches!(err, Error::ValidationFailed(_)));
}

#[test]
fn password_reset_link_needs_active_linked_user() {
    let h = Harness::new();
    let user = h.user("a@x.com");
    let link = block_on(h.lifecycle.password_reset_link(&user.id)).unwrap();
    assert!(link.contains(user.external_id.as_ref().unwrap().as_str()));

    let unlinked = User::new(Email::new("b@x.com").unwrap(), "B", "", Utc::now());
    h.memory().put_user(unlinked.clone());
    assert!(matches!(
        block_on(h.lifecycle.password_reset_link(&unlinked.id)),
        Err(Error::NotFound)
    ));
}
