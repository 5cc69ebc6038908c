use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::BoxError;
use crate::identity::{IdentityError, IdentityProvider};
use crate::lifecycle::CleanupScheduler;
use crate::notify::{Notifier, NotifyError};
use crate::types::{Email, ExternalId, UserId};

/// In-memory identity provider for tests and demos.
///
/// Failures can be injected per call kind to exercise rollback paths.
#[derive(Debug, Default, Clone)]
pub struct MemoryIdentityProvider {
    inner: Arc<Mutex<IdentityState>>,
}

#[derive(Debug, Default)]
struct IdentityState {
    accounts: HashMap<ExternalId, Account>,
    next: u64,
    fail_create: Option<IdentityError>,
    fail_delete: Option<IdentityError>,
    stale_lookups: usize,
    deletes: usize,
}

#[derive(Debug, Clone)]
struct Account {
    email: Email,
    name: String,
}

impl MemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an account directly, bypassing failure injection.
    pub fn put_account(&self, email: Email, name: impl Into<String>) -> ExternalId {
        let mut guard = self.inner.lock().expect("poisoned lock");
        guard.insert(email, name.into())
    }

    /// Makes every `create_account` call fail with `error` until cleared.
    pub fn fail_creates(&self, error: Option<IdentityError>) {
        self.inner.lock().expect("poisoned lock").fail_create = error;
    }

    /// Makes every `delete_account` call fail with `error` until cleared.
    pub fn fail_deletes(&self, error: Option<IdentityError>) {
        self.inner.lock().expect("poisoned lock").fail_delete = error;
    }

    /// Makes the next `count` `account_by_email` calls miss, like a lagging
    /// read replica.
    pub fn stale_lookups(&self, count: usize) {
        self.inner.lock().expect("poisoned lock").stale_lookups = count;
    }

    pub fn contains(&self, id: &ExternalId) -> bool {
        self.inner
            .lock()
            .expect("poisoned lock")
            .accounts
            .contains_key(id)
    }

    pub fn account_count(&self) -> usize {
        self.inner.lock().expect("poisoned lock").accounts.len()
    }

    /// Number of successful deletions so far.
    pub fn delete_count(&self) -> usize {
        self.inner.lock().expect("poisoned lock").deletes
    }

    /// Display name stored for an account.
    pub fn name_of(&self, id: &ExternalId) -> Option<String> {
        self.inner
            .lock()
            .expect("poisoned lock")
            .accounts
            .get(id)
            .map(|account| account.name.clone())
    }
}

impl IdentityState {
    fn insert(&mut self, email: Email, name: String) -> ExternalId {
        self.next += 1;
        let id = ExternalId::from_string(format!("memory|{}", self.next));
        self.accounts.insert(id.clone(), Account { email, name });
        id
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn create_account(
        &self,
        email: &Email,
        name: &str,
        password: &str,
    ) -> std::result::Result<ExternalId, IdentityError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        if let Some(err) = guard.fail_create.clone() {
            return Err(err);
        }
        if password.is_empty() {
            return Err(IdentityError::Permanent("password required".to_string()));
        }
        if guard.accounts.values().any(|account| &account.email == email) {
            return Err(IdentityError::Permanent("account already exists".to_string()));
        }
        Ok(guard.insert(email.clone(), name.to_string()))
    }

    async fn delete_account(&self, id: &ExternalId) -> std::result::Result<(), IdentityError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        if let Some(err) = guard.fail_delete.clone() {
            return Err(err);
        }
        guard
            .accounts
            .remove(id)
            .ok_or(IdentityError::NotFound)?;
        guard.deletes += 1;
        Ok(())
    }

    async fn account_by_email(
        &self,
        email: &Email,
    ) -> std::result::Result<Option<ExternalId>, IdentityError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        if guard.stale_lookups > 0 {
            guard.stale_lookups -= 1;
            return Ok(None);
        }
        Ok(guard
            .accounts
            .iter()
            .find(|(_, account)| &account.email == email)
            .map(|(id, _)| id.clone()))
    }

    async fn password_reset_link(
        &self,
        id: &ExternalId,
    ) -> std::result::Result<String, IdentityError> {
        let guard = self.inner.lock().expect("poisoned lock");
        if !guard.accounts.contains_key(id) {
            return Err(IdentityError::NotFound);
        }
        Ok(format!("https://identity.invalid/reset?subject={id}"))
    }
}

/// Notification captured by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub template: String,
    pub recipient: Email,
    pub variables: BTreeMap<String, String>,
}

/// Notifier that records every message instead of delivering it.
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    inner: Arc<Mutex<NotifierState>>,
}

#[derive(Debug, Default)]
struct NotifierState {
    sent: Vec<SentNotification>,
    failing: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every send fail while `failing` is set.
    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().expect("poisoned lock").failing = failing;
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.inner.lock().expect("poisoned lock").sent.clone()
    }

    /// Last message sent with `template`.
    pub fn last(&self, template: &str) -> Option<SentNotification> {
        self.inner
            .lock()
            .expect("poisoned lock")
            .sent
            .iter()
            .rev()
            .find(|sent| sent.template == template)
            .cloned()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        template: &str,
        recipient: &Email,
        variables: &BTreeMap<String, String>,
    ) -> std::result::Result<(), NotifyError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        if guard.failing {
            return Err(NotifyError("delivery disabled".to_string()));
        }
        guard.sent.push(SentNotification {
            template: template.to_string(),
            recipient: recipient.clone(),
            variables: variables.clone(),
        });
        Ok(())
    }
}

/// Scheduler that records cleanup requests.
#[derive(Debug, Default, Clone)]
pub struct RecordingScheduler {
    inner: Arc<Mutex<SchedulerState>>,
}

#[derive(Debug, Default)]
struct SchedulerState {
    scheduled: Vec<UserId>,
    unreachable: bool,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the job runner being down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().expect("poisoned lock").unreachable = unreachable;
    }

    pub fn scheduled(&self) -> Vec<UserId> {
        self.inner.lock().expect("poisoned lock").scheduled.clone()
    }
}

#[async_trait]
impl CleanupScheduler for RecordingScheduler {
    async fn schedule_identity_cleanup(
        &self,
        users: Vec<UserId>,
    ) -> std::result::Result<(), BoxError> {
        let mut guard = self.inner.lock().expect("poisoned lock");
        if guard.unreachable {
            return Err("cleanup queue unreachable".into());
        }
        guard.scheduled.extend(users);
        Ok(())
    }
}
