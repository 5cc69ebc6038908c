use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

const MAX_NAME_LEN: usize = 128;
const MAX_EMAIL_LEN: usize = 254;

fn validate_simple_name(value: &str, kind: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid(format!("{kind} must not be empty")));
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(Error::invalid(format!(
            "{kind} length must be <= {MAX_NAME_LEN}"
        )));
    }
    if !trimmed.chars().all(is_allowed_name_char) {
        return Err(Error::invalid(format!("{kind} contains invalid characters")));
    }
    Ok(trimmed.to_string())
}

fn is_allowed_name_char(ch: char) -> bool {
    // `|` and `.` appear in identity-provider subjects such as `auth0|abc.1`.
    ch.is_ascii_alphanumeric() || matches!(ch, ':' | '_' | '-' | '|' | '.')
}

macro_rules! define_id_type {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a validated identifier.
            pub fn new(value: impl AsRef<str>) -> Result<Self> {
                validate_simple_name(value.as_ref(), $kind).map(Self)
            }

            /// Creates an identifier from a trusted string without validation.
            pub fn from_string(value: String) -> Self {
                Self(value)
            }

            /// Generates a fresh, time-ordered identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::now_v7().to_string())
            }

            /// Returns the underlying string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(value: &str) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::from_string(value)
            }
        }
    };
}

define_id_type!(
    /// Organization (tenant) identifier.
    OrganizationId,
    "organization id"
);
define_id_type!(
    /// Local user identifier.
    UserId,
    "user id"
);
define_id_type!(
    /// Membership identifier.
    MembershipId,
    "membership id"
);
define_id_type!(
    /// Identity-provider account identifier.
    ExternalId,
    "external id"
);

/// Protected resource type used to select policy statements.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceType(String);

impl ResourceType {
    /// Creates a validated resource type.
    pub fn new(value: impl AsRef<str>) -> Result<Self> {
        validate_simple_name(value.as_ref(), "resource type").map(Self)
    }

    /// Creates a resource type from a trusted string without validation.
    pub fn from_string(value: String) -> Self {
        Self(value)
    }

    /// Organization records.
    pub fn organizations() -> Self {
        Self::from_string("organizations".to_string())
    }

    /// User records.
    pub fn users() -> Self {
        Self::from_string("users".to_string())
    }

    /// Membership records.
    pub fn memberships() -> Self {
        Self::from_string("memberships".to_string())
    }

    /// Authentication endpoints.
    pub fn auth() -> Self {
        Self::from_string("auth".to_string())
    }

    /// Returns the underlying string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ResourceType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for ResourceType {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

/// Normalized email address (trimmed, lowercased).
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Email(String);

impl Email {
    /// Parses and normalizes an email address.
    pub fn new(value: impl AsRef<str>) -> Result<Self> {
        let normalized = value.as_ref().trim().to_ascii_lowercase();
        if normalized.is_empty() || normalized.len() > MAX_EMAIL_LEN {
            return Err(Error::invalid("email length is out of range"));
        }
        let Some((local, domain)) = normalized.split_once('@') else {
            return Err(Error::invalid("email must contain '@'"));
        };
        let domain_ok = !domain.contains('@')
            && domain.contains('.')
            && !domain.starts_with('.')
            && !domain.ends_with('.');
        if local.is_empty() || !domain_ok || normalized.chars().any(char::is_whitespace) {
            return Err(Error::invalid("email is malformed"));
        }
        Ok(Self(normalized))
    }

    /// Returns the underlying string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Email {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Email {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for Email {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Email> for String {
    fn from(value: Email) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_id_accepts_provider_subjects() {
        let id = ExternalId::try_from("auth0|5f1e.a2").expect("external id");
        assert_eq!(id.as_str(), "auth0|5f1e.a2");
    }

    #[test]
    fn ids_reject_invalid_chars() {
        let err = OrganizationId::try_from("org 1").expect_err("must reject");
        assert!(err.to_string().contains("organization id"));
    }

    #[test]
    fn generated_ids_are_valid_and_distinct() {
        let a = UserId::generate();
        let b = UserId::generate();
        assert_ne!(a, b);
        assert!(UserId::new(a.as_str()).is_ok());
    }

    #[test]
    fn email_is_normalized() {
        let email = Email::try_from("  A@X.com ").expect("email");
        assert_eq!(email.as_str(), "a@x.com");
    }

    #[test]
    fn email_rejects_malformed_values() {
        for raw in ["", "nobody", "@x.com", "a@x", "a@@x.com", "a b@x.com", "a@x.com."] {
            assert!(Email::new(raw).is_err(), "{raw} should be rejected");
        }
    }
}
