use crate::engine::EngineConfig;
use crate::error::{Error, Result};
use crate::invite::InviteConfig;
use crate::lifecycle::LifecycleConfig;
use crate::policy::{PolicyDocument, PolicyRegistry};
use serde::{Deserialize, Serialize};

/// Top-level configuration document.
///
/// ```json
/// {
///   "engine": { "cross_org_management": true },
///   "invite": { "secret": "...", "ttl_seconds": 86400 },
///   "lifecycle": { "archived_name": "archived" },
///   "policies": { "devices": [ { "action": ["list"], "principal": ["*"], "effect": "allow" } ] }
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    pub engine: EngineConfig,
    pub invite: InviteConfig,
    pub lifecycle: LifecycleConfig,
    /// Replaces the standard policies when present.
    pub policies: Option<PolicyDocument>,
}

impl AccessConfig {
    /// Parses a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| Error::invalid(format!("config: {err}")))
    }

    /// Builds the policy registry this configuration describes.
    pub fn policy_registry(&self) -> Result<PolicyRegistry> {
        match &self.policies {
            Some(document) => PolicyRegistry::from_document(document.clone()),
            None => Ok(PolicyRegistry::standard()),
        }
    }
}
