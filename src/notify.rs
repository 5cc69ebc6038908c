use crate::error::{Error, Upstream};
use crate::types::Email;
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

/// Template used for invitation emails.
pub const INVITE_TEMPLATE: &str = "invite";
/// Template used after an invitation creates a new account.
pub const WELCOME_TEMPLATE: &str = "welcome";

/// Delivery failure reported by a [`Notifier`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

impl From<NotifyError> for Error {
    fn from(error: NotifyError) -> Self {
        Self::UpstreamUnavailable {
            upstream: Upstream::Notifier,
            transient: true,
            message: error.0,
        }
    }
}

/// Out-of-band message sender (email, SMS, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        template: &str,
        recipient: &Email,
        variables: &BTreeMap<String, String>,
    ) -> std::result::Result<(), NotifyError>;
}

/// Notifier that only logs; useful when delivery is wired elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(
        &self,
        template: &str,
        recipient: &Email,
        variables: &BTreeMap<String, String>,
    ) -> std::result::Result<(), NotifyError> {
        tracing::info!(
            template,
            recipient = %recipient,
            variables = variables.len(),
            "notification dispatched"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn tracing_notifier_always_succeeds() {
        let email = Email::new("a@x.com").unwrap();
        let result = block_on(TracingNotifier.send(INVITE_TEMPLATE, &email, &BTreeMap::new()));
        assert!(result.is_ok());
    }

    #[test]
    fn notify_error_maps_to_upstream() {
        let err = Error::from(NotifyError("smtp down".into()));
        assert!(err.to_string().contains("notifier unavailable"));
    }
}
