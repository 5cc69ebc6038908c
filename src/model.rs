//! Stored records: users, organizations and the memberships joining them.

use crate::role::Role;
use crate::types::{Email, ExternalId, MembershipId, OrganizationId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Local identity record, mirrored by an identity-provider account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: Email,
    /// Identity-provider account, once provisioned.
    pub external_id: Option<ExternalId>,
    pub first_name: String,
    pub last_name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Creates an active user.
    pub fn new(
        email: Email,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: UserId::generate(),
            email,
            external_id: None,
            first_name: first_name.into(),
            last_name: last_name.into(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Links the identity-provider account.
    pub fn with_external_id(mut self, external_id: ExternalId) -> Self {
        self.external_id = Some(external_id);
        self
    }

    /// Display name sent to the identity provider.
    pub fn full_name(&self) -> String {
        full_name(&self.first_name, &self.last_name)
    }
}

pub(crate) fn full_name(first: &str, last: &str) -> String {
    format!("{first} {last}").trim().to_string()
}

/// Tenant record. Archival is a soft delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
    /// Free-form tenant attributes (country, industry, ...).
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    /// Managing organization; this one is downstream of it.
    pub parent: Option<OrganizationId>,
    pub created_at: DateTime<Utc>,
}

impl Organization {
    /// Creates an unarchived organization.
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: OrganizationId::generate(),
            name: name.into(),
            attributes: BTreeMap::new(),
            archived: false,
            archived_at: None,
            parent: None,
            created_at: now,
        }
    }

    pub fn with_id(mut self, id: OrganizationId) -> Self {
        self.id = id;
        self
    }

    pub fn with_parent(mut self, parent: OrganizationId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Binds a user to an organization with a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub id: MembershipId,
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub role: Role,
    pub is_key_contact: bool,
    /// Member from outside the organization (contractor, partner).
    pub is_external: bool,
    pub expires: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Membership {
    pub fn new(
        user_id: UserId,
        organization_id: OrganizationId,
        role: Role,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MembershipId::generate(),
            user_id,
            organization_id,
            role,
            is_key_contact: false,
            is_external: false,
            expires: None,
            created_at: now,
        }
    }

    pub fn with_options(mut self, options: &MembershipOptions) -> Self {
        self.is_key_contact = options.is_key_contact;
        self.is_external = options.is_external;
        self.expires = options.expires;
        self
    }

    /// A membership without a deadline never expires.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_none_or(|expires| expires > now)
    }
}

/// Optional membership attributes supplied at creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipOptions {
    #[serde(default)]
    pub is_key_contact: bool,
    #[serde(default)]
    pub is_external: bool,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}
