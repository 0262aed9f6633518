//! Runtime configuration.
//!
//! Every section has defaults suitable for a single back-office instance.
//! [`CoreConfig::from_env`] overrides them from `CIVIC_*` variables:
//!
//! - `CIVIC_CACHE_MEMORY_TTL_SECS` (default 300)
//! - `CIVIC_CACHE_DISTRIBUTED_TTL_SECS` (default 3600)
//! - `CIVIC_TASK_QUEUE` (default `tasks`)
//! - `CIVIC_REPLY_QUEUE` (default `tasks.replies`)
//! - `CIVIC_SESSION_TTL_SECS` (default 86400)
//! - `CIVIC_SESSION_COOKIE` (default `sid`)
//! - `CIVIC_METADATA_TIMEOUT_SECS` (default 30)
//! - `CIVIC_BULK_TIMEOUT_SECS` (default 120)
//! - `CIVIC_NOTIFICATION_COOLDOWN_DAYS` (default 20)
//! - `CIVIC_DEFAULT_COMMUNITY_NAME`

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dispatcher::{DEFAULT_REPLY_QUEUE, DEFAULT_TASK_QUEUE};
use crate::error::{Error, Result};

/// Default name of the session cookie.
pub const DEFAULT_SESSION_COOKIE: &str = "sid";

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub cache: CacheConfig,
    pub dispatcher: DispatcherConfig,
    pub session: SessionConfig,
    pub workflow: WorkflowConfig,
}

/// Tiered cache lifetimes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub memory_ttl_secs: u64,
    pub distributed_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_ttl_secs: 5 * 60,
            distributed_ttl_secs: 60 * 60,
        }
    }
}

impl CacheConfig {
    pub fn memory_ttl(&self) -> Duration {
        Duration::from_secs(self.memory_ttl_secs)
    }

    pub fn distributed_ttl(&self) -> Duration {
        Duration::from_secs(self.distributed_ttl_secs)
    }
}

/// Broker queue names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub task_queue: String,
    pub reply_queue: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            reply_queue: DEFAULT_REPLY_QUEUE.to_string(),
        }
    }
}

/// Login session settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_secs: u64,
    pub cookie_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            cookie_name: DEFAULT_SESSION_COOKIE.to_string(),
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Registry refresh settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub metadata_timeout_secs: u64,
    pub bulk_timeout_secs: u64,
    pub notification_cooldown_days: u32,
    /// Used in notifications when the settings row has no name.
    pub default_community_name: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            metadata_timeout_secs: 30,
            bulk_timeout_secs: 120,
            notification_cooldown_days: 20,
            default_community_name: "Community".to_string(),
        }
    }
}

impl WorkflowConfig {
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_secs(self.bulk_timeout_secs)
    }
}

impl CoreConfig {
    /// Defaults overridden by `CIVIC_*` environment variables.
    ///
    /// Unparsable values are ignored with a warning; call [`CoreConfig::validate`]
    /// afterwards.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `CIVIC_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        override_parsed(&lookup, "CIVIC_CACHE_MEMORY_TTL_SECS", &mut config.cache.memory_ttl_secs);
        override_parsed(
            &lookup,
            "CIVIC_CACHE_DISTRIBUTED_TTL_SECS",
            &mut config.cache.distributed_ttl_secs,
        );
        override_parsed(&lookup, "CIVIC_TASK_QUEUE", &mut config.dispatcher.task_queue);
        override_parsed(&lookup, "CIVIC_REPLY_QUEUE", &mut config.dispatcher.reply_queue);
        override_parsed(&lookup, "CIVIC_SESSION_TTL_SECS", &mut config.session.ttl_secs);
        override_parsed(&lookup, "CIVIC_SESSION_COOKIE", &mut config.session.cookie_name);
        override_parsed(
            &lookup,
            "CIVIC_METADATA_TIMEOUT_SECS",
            &mut config.workflow.metadata_timeout_secs,
        );
        override_parsed(&lookup, "CIVIC_BULK_TIMEOUT_SECS", &mut config.workflow.bulk_timeout_secs);
        override_parsed(
            &lookup,
            "CIVIC_NOTIFICATION_COOLDOWN_DAYS",
            &mut config.workflow.notification_cooldown_days,
        );
        override_parsed(
            &lookup,
            "CIVIC_DEFAULT_COMMUNITY_NAME",
            &mut config.workflow.default_community_name,
        );
        config
    }

    /// Rejects zero lifetimes, zero timeouts and empty names.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.cache.memory_ttl_secs == 0, "cache.memory_ttl_secs must be > 0"),
            (self.cache.distributed_ttl_secs == 0, "cache.distributed_ttl_secs must be > 0"),
            (self.dispatcher.task_queue.trim().is_empty(), "dispatcher.task_queue must not be empty"),
            (self.dispatcher.reply_queue.trim().is_empty(), "dispatcher.reply_queue must not be empty"),
            (
                self.dispatcher.task_queue == self.dispatcher.reply_queue,
                "dispatcher.task_queue and dispatcher.reply_queue must differ",
            ),
            (self.session.ttl_secs == 0, "session.ttl_secs must be > 0"),
            (self.session.cookie_name.trim().is_empty(), "session.cookie_name must not be empty"),
            (self.workflow.metadata_timeout_secs == 0, "workflow.metadata_timeout_secs must be > 0"),
            (self.workflow.bulk_timeout_secs == 0, "workflow.bulk_timeout_secs must be > 0"),
        ];
        match checks.into_iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(Error::Validation(message.to_string())),
            None => Ok(()),
        }
    }
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => warn!(key, value = %raw, "ignoring unparsable config value"),
    }
}
