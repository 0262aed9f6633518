use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::store::{SessionStore, UserRecord, UserStore};
use crate::types::{SessionToken, UserId};

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// In-memory store implementation for tests and demos.
///
/// Sessions slide: every [`SessionStore::touch`] pushes expiry `session_ttl`
/// into the future.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
    session_ttl: Duration,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: RwLock<HashMap<SessionToken, Session>>,
    users: RwLock<HashMap<UserId, UserRecord>>,
    denied_ips: RwLock<HashSet<IpAddr>>,
}

#[derive(Debug, Clone)]
struct Session {
    user: UserId,
    expires_at: Instant,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: Arc::default(),
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store with the session lifetime from `config`.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new().with_session_ttl(config.ttl())
    }

    /// Sets the sliding session lifetime.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Inserts or replaces a user.
    pub fn put_user(&self, user: UserRecord) {
        write(&self.inner.users).insert(user.id.clone(), user);
    }

    /// Adds an address to the denylist.
    pub fn deny_ip(&self, ip: IpAddr) {
        write(&self.inner.denied_ips).insert(ip);
    }

    /// Opens a session for `user` and returns its token.
    ///
    /// Expired sessions are dropped on the way.
    pub fn create_session(&self, user: UserId) -> SessionToken {
        let token = SessionToken::from_string(uuid::Uuid::new_v4().simple().to_string());
        let now = Instant::now();
        let mut sessions = write(&self.inner.sessions);
        sessions.retain(|_, session| session.expires_at > now);
        sessions.insert(
            token.clone(),
            Session {
                user,
                expires_at: now + self.session_ttl,
            },
        );
        token
    }

    /// Ends a session.
    pub fn destroy_session(&self, token: &SessionToken) {
        write(&self.inner.sessions).remove(token);
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn session_user(
        &self,
        token: &SessionToken,
    ) -> std::result::Result<Option<UserId>, crate::StoreError> {
        let now = Instant::now();
        let mut guard = write(&self.inner.sessions);
        let expired = match guard.get(token) {
            Some(session) if session.expires_at > now => return Ok(Some(session.user.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            guard.remove(token);
        }
        Ok(None)
    }

    async fn touch(&self, token: &SessionToken) -> std::result::Result<(), crate::StoreError> {
        let mut guard = write(&self.inner.sessions);
        if let Some(session) = guard.get_mut(token) {
            session.expires_at = Instant::now() + self.session_ttl;
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn user_by_id(
        &self,
        id: &UserId,
    ) -> std::result::Result<Option<UserRecord>, crate::StoreError> {
        Ok(read(&self.inner.users).get(id).cloned())
    }

    async fn ip_denied(&self, ip: IpAddr) -> std::result::Result<bool, crate::StoreError> {
        Ok(read(&self.inner.denied_ips).contains(&ip))
    }
}
