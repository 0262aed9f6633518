//! Core of a municipal back-office service.
//!
//! This crate provides the pieces every module of such a service shares:
//! permission matching over role permission maps, a session/address/account
//! guard, a two-tier read-through cache, request/reply task dispatch over a
//! message broker, and the registry refresh saga built on top of them.
//! Storage, broker and notification backends are async traits; in-memory
//! implementations are available behind cargo features.
//!
//! # Examples
//!
//! Guarding a route with the in-memory store (enable `memory-store`):
//! ```no_run
//! # #[cfg(feature = "memory-store")]
//! # {
//! use rs_civic::{GuardBuilder, GuardRequest, MemoryStore, RouteRequirement};
//! let store = MemoryStore::new();
//! let guard = GuardBuilder::new(store).build();
//! let request = GuardRequest::new(None, None);
//! let requirement = RouteRequirement::new("debtor", "VIEW");
//! let _ = guard.check(&request, Some(&requirement));
//! # }
//! ```
//!
//! Dispatching a task (enable `memory-broker`):
//! ```no_run
//! # #[cfg(feature = "memory-broker")]
//! # async fn demo() -> rs_civic::Result<()> {
//! use rs_civic::{MemoryBroker, TaskDispatcher, TaskName};
//! use std::time::Duration;
//! let broker = MemoryBroker::new();
//! let dispatcher = TaskDispatcher::new(broker.clone());
//! let replies = broker.reply_channel(dispatcher.reply_queue(), 64);
//! let _listener = dispatcher.spawn_reply_listener(replies);
//! let task = TaskName::try_from("debtor.get_latest_metadata")?;
//! let _ = dispatcher
//!     .send_task_with_reply(&task, serde_json::json!({}), Duration::from_secs(30))
//!     .await?;
//! # Ok(())
//! # }
//! ```
#![forbid(unsafe_code)]

mod broker;
mod cache;
mod config;
mod dispatcher;
mod error;
mod guard;
mod notify;
mod permission;
mod settings;
mod store;
mod tiered;
mod types;
mod workflow;

#[cfg(feature = "memory-cache")]
mod memory_cache;

#[cfg(feature = "memory-store")]
mod memory_store;

#[cfg(feature = "memory-broker")]
mod memory_broker;

#[cfg(feature = "redis")]
mod redis_cache;

#[cfg(feature = "axum")]
pub mod axum;

#[cfg(feature = "subscriber")]
pub mod observability;

pub use crate::broker::{Broker, TaskEnvelope, TaskReply};
pub use crate::cache::{DistributedCache, FnLoader, Loader, NoDistributedCache};
pub use crate::config::{
    CacheConfig, CoreConfig, DEFAULT_SESSION_COOKIE, DispatcherConfig, SessionConfig,
    WorkflowConfig,
};
pub use crate::dispatcher::{TaskDispatcher, TaskResult};
pub use crate::error::{Error, Result, StoreError, WorkflowStep};
pub use crate::guard::{
    AuthenticatedUser, Decision, DenyReason, Guard, GuardBuilder, GuardRequest, RouteRequirement,
};
pub use crate::notify::{
    CooldownClaim, CooldownStore, FanoutOptions, FanoutProgress, FanoutReport, Notifier,
    claim_cooldown, cooldown_elapsed,
};
pub use crate::permission::{Capability, Grant, PermissionMap, RequiredKeys, has_capability};
pub use crate::settings::{
    CommunityNameSource, CommunitySettings, SETTINGS_STORAGE_KEY, SettingsLoader,
    SettingsRepository, SettingsService,
};
pub use crate::store::{AllModules, ModuleRegistry, SessionStore, Store, UserRecord, UserStore};
pub use crate::tiered::{TieredCache, TieredCacheBuilder};
pub use crate::types::{CommunityId, CorrelationId, SessionToken, TaskName, UserId};
pub use crate::workflow::{
    CommunityValidator, NotificationOutcome, RefreshSummary, RegistryKind, RegistryRecord,
    RegistryRefresh, RegistryRefreshBuilder, RegistryRepository,
};

#[cfg(feature = "memory-store")]
pub use crate::memory_store::MemoryStore;

#[cfg(feature = "memory-cache")]
pub use crate::memory_cache::MemoryDistributedCache;

#[cfg(feature = "memory-broker")]
pub use crate::memory_broker::{FnHandler, MemoryBroker, TaskHandler};

#[cfg(feature = "redis")]
pub use crate::redis_cache::RedisCache;
