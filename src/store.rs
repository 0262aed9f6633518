use crate::error::StoreError;
use crate::permission::PermissionMap;
use crate::types::{SessionToken, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;

/// User row joined with its role's permission map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    pub enabled: bool,
    pub is_active: bool,
    #[serde(default)]
    pub permission: PermissionMap,
}

/// Store interface for login sessions.
#[async_trait]
pub trait SessionStore {
    /// Resolves a session token to its user; `None` when absent or expired.
    async fn session_user(
        &self,
        token: &SessionToken,
    ) -> std::result::Result<Option<UserId>, StoreError>;

    /// Extends the session's expiry.
    async fn touch(&self, token: &SessionToken) -> std::result::Result<(), StoreError>;
}

/// Store interface for users and the address denylist.
#[async_trait]
pub trait UserStore {
    /// Fetches a user with its role permissions.
    async fn user_by_id(&self, id: &UserId)
    -> std::result::Result<Option<UserRecord>, StoreError>;

    /// Returns whether `ip` is on the denylist.
    async fn ip_denied(&self, ip: IpAddr) -> std::result::Result<bool, StoreError>;
}

/// Composite store trait.
pub trait Store: SessionStore + UserStore + Send + Sync {}

impl<T> Store for T where T: SessionStore + UserStore + Send + Sync {}

/// Permission keys known to the navigation/module registry.
///
/// Only registered keys (plus wildcard and hierarchical keys) of a user's
/// permission map take part in capability checks.
pub trait ModuleRegistry: Send + Sync {
    fn contains(&self, key: &str) -> bool;
}

impl ModuleRegistry for HashSet<String> {
    fn contains(&self, key: &str) -> bool {
        HashSet::contains(self, key)
    }
}

impl ModuleRegistry for BTreeSet<String> {
    fn contains(&self, key: &str) -> bool {
        BTreeSet::contains(self, key)
    }
}

/// Registry that accepts every key.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllModules;

impl ModuleRegistry for AllModules {
    fn contains(&self, _key: &str) -> bool {
        true
    }
}
