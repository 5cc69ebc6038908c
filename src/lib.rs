//! Multi-tenant organization access control.
//!
//! This crate computes which organizations a requester may act upon, from
//! role-bearing memberships and allow-only policy statements, and manages
//! the invitation and membership lifecycle around it. The default behavior
//! is deny-by-default. Use [`Engine`] for authorization and [`Lifecycle`]
//! for mutations.
//!
//! # Examples
//!
//! Computing the permitted organizations with the in-memory store
//! (enable `memory-store`):
//! ```no_run
//! use rs_org_access::{AccessRequest, Action, EngineBuilder, ResourceType, UserId};
//! # #[cfg(feature = "memory-store")]
//! # {
//! use rs_org_access::MemoryStore;
//! let store = MemoryStore::new();
//! let engine = EngineBuilder::new(store)
//!     .enable_cross_org_management(true)
//!     .build();
//! let requester = UserId::try_from("user_1").unwrap();
//! let request = AccessRequest::new(requester, ResourceType::users(), Action::List);
//! let _ = engine.permitted_organizations(&request);
//! # }
//! ```
//!
//! Loading configuration and policies from JSON:
//! ```no_run
//! use rs_org_access::AccessConfig;
//! let config = AccessConfig::from_json_str(r#"{ "invite": { "secret": "change-me" } }"#).unwrap();
//! let policies = config.policy_registry().unwrap();
//! # let _ = policies;
//! ```
#![forbid(unsafe_code)]

mod action;
mod clock;
mod config;
mod engine;
mod error;
mod hierarchy;
mod identity;
mod invite;
mod lifecycle;
mod model;
mod notify;
mod policy;
mod role;
mod scope;
mod statement;
mod store;
mod types;

#[cfg(feature = "memory-store")]
mod memory_identity;
#[cfg(feature = "memory-store")]
mod memory_store;

#[cfg(feature = "axum")]
pub mod axum;

pub use crate::action::Action;
pub use crate::clock::Clock;
pub use crate::config::AccessConfig;
pub use crate::engine::{
    AccessRequest, AccessSnapshot, Basis, Engine, EngineBuilder, EngineConfig,
    PermittedOrganizations, Scoping, evaluate,
};
pub use crate::error::{BoxError, Error, ErrorKind, Result, StoreError, StoreFailure, Upstream};
pub use crate::hierarchy::Hierarchy;
pub use crate::identity::{IdentityError, IdentityProvider};
pub use crate::invite::{InviteClaims, InviteConfig, InviteSigner, InviteToken, Invitee};
pub use crate::lifecycle::{
    Activation, CleanupScheduler, Lifecycle, LifecycleBuilder, LifecycleConfig, MembershipRemoval,
    NewAccount, NewOrganization, NoCleanup, OrganizationRemoval, ReconcileReport,
};
pub use crate::model::{Membership, MembershipOptions, Organization, User};
pub use crate::notify::{INVITE_TEMPLATE, Notifier, NotifyError, TracingNotifier, WELCOME_TEMPLATE};
pub use crate::policy::{PolicyDocument, PolicyRegistry};
pub use crate::role::Role;
pub use crate::statement::{ActionPattern, Effect, PrincipalPattern, Statement, StatementSpec};
pub use crate::store::{
    Check, MembershipFilter, MembershipStore, OrganizationStore, Store, UserStore, WriteBatch,
    WriteOp, WriteStore,
};
pub use crate::types::{Email, ExternalId, MembershipId, OrganizationId, ResourceType, UserId};

#[cfg(feature = "memory-store")]
pub use crate::memory_identity::{
    MemoryIdentityProvider, RecordingNotifier, RecordingScheduler, SentNotification,
};
#[cfg(feature = "memory-store")]
pub use crate::memory_store::MemoryStore;
