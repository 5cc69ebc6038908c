//! Signed, time-limited invitation tokens.
//!
//! Tokens are never persisted: validity is the signature plus the deadline.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::model::MembershipOptions;
use crate::role::Role;
use crate::types::{Email, MembershipId, OrganizationId};
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::fmt;

const DEFAULT_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_ISSUER: &str = "rs-org-access";

/// Invitation signing settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InviteConfig {
    /// HMAC secret; must not be empty.
    pub secret: String,
    /// Token lifetime in seconds.
    pub ttl_seconds: u64,
    pub issuer: String,
}

impl Default for InviteConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            ttl_seconds: DEFAULT_TTL_SECONDS,
            issuer: DEFAULT_ISSUER.to_string(),
        }
    }
}

impl InviteConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            ..Self::default()
        }
    }

    pub fn ttl_seconds(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }
}

impl fmt::Debug for InviteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InviteConfig")
            .field("secret", &"<redacted>")
            .field("ttl_seconds", &self.ttl_seconds)
            .field("issuer", &self.issuer)
            .finish()
    }
}

/// Payload carried by an invitation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteClaims {
    /// Membership the inviter acted through.
    pub inviter: MembershipId,
    pub email: Email,
    pub first_name: String,
    pub last_name: String,
    pub organization_id: OrganizationId,
    pub role: Role,
    #[serde(default)]
    pub is_external: bool,
    #[serde(default)]
    pub is_key_contact: bool,
    /// Deadline of the membership granted on activation.
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

impl InviteClaims {
    /// Token deadline; activation at or after this instant fails.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.exp, 0).single()
    }

    /// Membership attributes granted on activation.
    pub fn membership_options(&self) -> MembershipOptions {
        MembershipOptions {
            is_key_contact: self.is_key_contact,
            is_external: self.is_external,
            expires: self.expires,
        }
    }
}

/// Invitee details supplied when issuing an invite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitee {
    pub email: Email,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub is_external: bool,
    #[serde(default)]
    pub is_key_contact: bool,
    /// Limits the granted membership, typically for external members.
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl Invitee {
    pub fn new(email: Email) -> Self {
        Self {
            email,
            first_name: String::new(),
            last_name: String::new(),
            is_external: false,
            is_key_contact: false,
            expires: None,
        }
    }

    pub fn name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = first.into();
        self.last_name = last.into();
        self
    }

    pub fn external(mut self, is_external: bool) -> Self {
        self.is_external = is_external;
        self
    }

    pub fn key_contact(mut self, is_key_contact: bool) -> Self {
        self.is_key_contact = is_key_contact;
        self
    }

    pub fn expires(mut self, at: DateTime<Utc>) -> Self {
        self.expires = Some(at);
        self
    }
}

/// Encoded invitation token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InviteToken(String);

impl InviteToken {
    pub fn from_string(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for InviteToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InviteToken(..)")
    }
}

impl From<String> for InviteToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Signs and verifies invitation tokens (HS256).
#[derive(Clone)]
pub struct InviteSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_seconds: i64,
    issuer: String,
    clock: Clock,
}

impl InviteSigner {
    pub fn new(config: &InviteConfig, clock: Clock) -> Result<Self> {
        if config.secret.is_empty() {
            return Err(Error::invalid("invite secret must not be empty"));
        }
        let ttl_seconds = i64::try_from(config.ttl_seconds)
            .map_err(|_| Error::invalid("invite ttl is out of range"))?;

        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is compared against the injected clock instead.
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.set_issuer(&[config.issuer.as_str()]);

        Ok(Self {
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            ttl_seconds,
            issuer: config.issuer.clone(),
            clock,
        })
    }

    /// Signs an invitation for `invitee` to join `organization` as `role`.
    pub fn issue(
        &self,
        inviter: MembershipId,
        organization: OrganizationId,
        role: Role,
        invitee: &Invitee,
    ) -> Result<(InviteToken, InviteClaims)> {
        let issued_at = self.clock.now();
        if invitee.expires.is_some_and(|expires| expires <= issued_at) {
            return Err(Error::invalid("membership expiry must be in the future"));
        }
        let now = issued_at.timestamp();
        let claims = InviteClaims {
            inviter,
            email: invitee.email.clone(),
            first_name: invitee.first_name.clone(),
            last_name: invitee.last_name.clone(),
            organization_id: organization,
            role,
            is_external: invitee.is_external,
            is_key_contact: invitee.is_key_contact,
            expires: invitee.expires,
            iss: self.issuer.clone(),
            iat: now,
            exp: now.saturating_add(self.ttl_seconds),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| Error::invalid(format!("invite token: {err}")))?;
        Ok((InviteToken(token), claims))
    }

    /// Verifies signature and deadline, returning the claims.
    pub fn verify(&self, token: &InviteToken) -> Result<InviteClaims> {
        let data = decode::<InviteClaims>(&token.0, &self.decoding, &self.validation).map_err(
            |err| {
                tracing::debug!(error = %err, "invite token rejected");
                Error::TokenInvalid
            },
        )?;
        let claims = data.claims;
        if self.clock.now().timestamp() >= claims.exp {
            tracing::debug!(
                email = %claims.email,
                organization = %claims.organization_id,
                "invite token expired"
            );
            return Err(Error::TokenExpired);
        }
        Ok(claims)
    }
}

impl fmt::Debug for InviteSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InviteSigner")
            .field("ttl_seconds", &self.ttl_seconds)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}
