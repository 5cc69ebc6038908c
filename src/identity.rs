use crate::error::{Error, Upstream};
use crate::types::{Email, ExternalId};
use async_trait::async_trait;
use thiserror::Error;

/// Failure reported by an [`IdentityProvider`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// The account does not exist.
    #[error("identity account not found")]
    NotFound,
    /// Retry may succeed (timeouts, rate limits, 5xx).
    #[error("transient identity provider failure: {0}")]
    Transient(String),
    /// Retry will not help (rejected payload, revoked credentials).
    #[error("identity provider rejected the call: {0}")]
    Permanent(String),
}

impl IdentityError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<IdentityError> for Error {
    fn from(error: IdentityError) -> Self {
        Self::UpstreamUnavailable {
            upstream: Upstream::IdentityProvider,
            transient: error.is_transient(),
            message: error.to_string(),
        }
    }
}

/// Narrow client interface to the external identity provider.
///
/// Deletes must be idempotent: callers retry them from reconciliation.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Creates an account and returns its external id.
    async fn create_account(
        &self,
        email: &Email,
        name: &str,
        password: &str,
    ) -> std::result::Result<ExternalId, IdentityError>;

    /// Deletes an account. Missing accounts report [`IdentityError::NotFound`].
    async fn delete_account(&self, id: &ExternalId) -> std::result::Result<(), IdentityError>;

    async fn account_by_email(
        &self,
        email: &Email,
    ) -> std::result::Result<Option<ExternalId>, IdentityError>;

    /// Issues a password reset URL for the account.
    async fn password_reset_link(
        &self,
        id: &ExternalId,
    ) -> std::result::Result<String, IdentityError>;
}
