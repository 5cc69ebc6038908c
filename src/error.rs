use std::fmt;

use thiserror::Error;

/// Boxed error returned by collaborators (stores, schedulers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Store-layer error type.
pub type StoreError = BoxError;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// External collaborator that failed a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    /// Identity provider (account management).
    IdentityProvider,
    /// Notification sender.
    Notifier,
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::IdentityProvider => "identity provider",
            Self::Notifier => "notifier",
        })
    }
}

/// Errors returned by this crate.
///
/// `NotFound` and `PermissionDenied` render without detail so they can be
/// surfaced to clients as-is.
#[derive(Debug, Error)]
pub enum Error {
    /// Resource absent or outside the requester's permitted set.
    #[error("not found")]
    NotFound,
    /// Admin-floor violation or role escalation attempt.
    #[error("permission denied")]
    PermissionDenied {
        /// Internal reason, for logs only.
        reason: &'static str,
    },
    /// Malformed input (role, identifier, statement config).
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    /// Invitation token is past its deadline.
    #[error("token expired")]
    TokenExpired,
    /// Invitation token failed signature or format checks.
    #[error("invalid token")]
    TokenInvalid,
    /// Identity provider or notification call failed.
    #[error("{upstream} unavailable: {message}")]
    UpstreamUnavailable {
        upstream: Upstream,
        transient: bool,
        message: String,
    },
    /// Store error wrapper.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

/// Coarse classification of [`Error`] for boundary mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    ValidationFailed,
    TokenExpired,
    TokenInvalid,
    UpstreamUnavailable,
    Internal,
}

impl Error {
    pub(crate) fn denied(reason: &'static str) -> Self {
        Self::PermissionDenied { reason }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::ValidationFailed(message.into())
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound => ErrorKind::NotFound,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Self::TokenExpired => ErrorKind::TokenExpired,
            Self::TokenInvalid => ErrorKind::TokenInvalid,
            Self::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            Self::Store(_) => ErrorKind::Internal,
        }
    }

    /// Returns true for errors that map to a generic client-facing denial.
    pub fn is_client_denial(&self) -> bool {
        matches!(self, Self::NotFound | Self::PermissionDenied { .. })
    }
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

/// Concrete failures raised by store implementations.
///
/// Stores return these boxed as [`StoreError`]; callers recover them with
/// [`StoreFailure::from_store_error`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreFailure {
    /// A uniqueness constraint rejected the write.
    #[error("unique constraint violated on {entity}.{field}")]
    Conflict {
        entity: &'static str,
        field: &'static str,
    },
    /// A batch precondition did not hold; nothing was written.
    #[error("precondition {index} failed")]
    CheckFailed { index: usize },
    /// A write referenced a row that does not exist.
    #[error("missing {entity} {id}")]
    MissingReference { entity: &'static str, id: String },
}

impl StoreFailure {
    /// Downcasts a boxed store error into a [`StoreFailure`], if it is one.
    pub fn from_store_error(error: &StoreError) -> Option<&StoreFailure> {
        error.downcast_ref::<StoreFailure>()
    }

    /// Boxes this failure as a [`StoreError`].
    pub fn boxed(self) -> StoreError {
        Box::new(self)
    }
}
