//! Closed membership role set.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role held through a [`Membership`](crate::Membership).
///
/// The set is closed; anything outside it is rejected before it can reach a
/// store. `Admin` is the organization admin tier protected by the admin floor,
/// `SystemAdmin` is the super-admin tier that sees every tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SystemAdmin,
    Installer,
    Manufacturer,
    Admin,
    FacilityManager,
    User,
    Support,
}

impl Role {
    /// Every role, in declaration order.
    pub const ALL: [Role; 7] = [
        Role::SystemAdmin,
        Role::Installer,
        Role::Manufacturer,
        Role::Admin,
        Role::FacilityManager,
        Role::User,
        Role::Support,
    ];

    /// Returns the canonical role name.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::SystemAdmin => "system_admin",
            Role::Installer => "installer",
            Role::Manufacturer => "manufacturer",
            Role::Admin => "admin",
            Role::FacilityManager => "facility_manager",
            Role::User => "user",
            Role::Support => "support",
        }
    }

    /// Organization admin tier, counted by the admin floor.
    pub fn is_admin_tier(self) -> bool {
        matches!(self, Role::Admin)
    }

    /// System-wide administrative tier.
    pub fn is_super_admin(self) -> bool {
        matches!(self, Role::SystemAdmin)
    }

    /// Parses a role name, accepting the `group:` prefix used in policy files.
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        let name = trimmed.strip_prefix("group:").unwrap_or(trimmed);
        Role::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::invalid(format!("unknown role `{trimmed}`")))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl TryFrom<&str> for Role {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_every_role() {
        for role in Role::ALL {
            assert_eq!(Role::parse(role.as_str()).unwrap(), role);
        }
    }

    #[test]
    fn parse_accepts_group_prefix_and_case() {
        assert_eq!(Role::parse("group:Admin").unwrap(), Role::Admin);
        assert_eq!(Role::parse(" USER ").unwrap(), Role::User);
    }

    #[test]
    fn parse_rejects_unknown_role() {
        let err = Role::parse("owner").expect_err("closed set");
        assert!(matches!(err, Error::ValidationFailed(_)));
    }
}
