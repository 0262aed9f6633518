use std::net::IpAddr;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::permission::{Capability, PermissionMap, RequiredKeys, has_capability};
use crate::store::{AllModules, ModuleRegistry, Store};
use crate::types::{SessionToken, UserId};

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// No usable session, denylisted address, unknown or disabled account (401).
    Unauthenticated,
    /// Authenticated but lacking the route's capability (403).
    Forbidden,
}

impl DenyReason {
    /// HTTP status code for the denial.
    pub fn status_code(self) -> u16 {
        match self {
            Self::Unauthenticated => 401,
            Self::Forbidden => 403,
        }
    }

    /// Converts the denial into the matching crate error.
    pub fn into_error(self) -> Error {
        match self {
            Self::Unauthenticated => Error::Authentication,
            Self::Forbidden => Error::Authorization,
        }
    }
}

/// User resolved for an allowed request.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedUser {
    pub id: UserId,
    pub username: String,
    pub permission: PermissionMap,
}

/// Guard outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow(AuthenticatedUser),
    Deny(DenyReason),
}

impl Decision {
    /// Returns whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }
}

/// Capability a route demands: `permission_level` on any of `permissions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequirement {
    pub permissions: RequiredKeys,
    pub permission_level: Capability,
}

impl RouteRequirement {
    /// Creates a requirement.
    pub fn new(permissions: impl Into<RequiredKeys>, permission_level: impl Into<Capability>) -> Self {
        Self {
            permissions: permissions.into(),
            permission_level: permission_level.into(),
        }
    }
}

/// Request facts the guard looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardRequest {
    pub session: Option<SessionToken>,
    pub ip: Option<IpAddr>,
}

impl GuardRequest {
    /// Creates a request with a session token and client address.
    pub fn new(session: Option<SessionToken>, ip: Option<IpAddr>) -> Self {
        Self { session, ip }
    }
}

/// Per-request authorization over a session store, user store and module registry.
///
/// Checks run strictly in order and stop at the first denial: session
/// present, session resolves, address not denylisted, user exists, account
/// enabled and active, then (only when the route declares one) the
/// capability check.
#[derive(Debug)]
pub struct Guard<S, R = AllModules> {
    store: S,
    registry: R,
}

/// Builder for [`Guard`].
pub struct GuardBuilder<S, R = AllModules> {
    store: S,
    registry: R,
}

impl<S> GuardBuilder<S, AllModules> {
    /// Creates a builder that accepts every permission key.
    pub fn new(store: S) -> Self {
        Self {
            store,
            registry: AllModules,
        }
    }
}

impl<S, R> GuardBuilder<S, R> {
    /// Sets the module registry used to filter permission keys.
    pub fn registry<R2: ModuleRegistry>(self, registry: R2) -> GuardBuilder<S, R2> {
        GuardBuilder {
            store: self.store,
            registry,
        }
    }

    /// Builds the guard.
    pub fn build(self) -> Guard<S, R> {
        Guard {
            store: self.store,
            registry: self.registry,
        }
    }
}

impl<S, R> Guard<S, R>
where
    S: Store,
    R: ModuleRegistry,
{
    /// Session, address and account checks without a capability check.
    pub async fn authenticate(&self, request: &GuardRequest) -> Result<Decision> {
        self.check(request, None).await
    }

    /// Runs the full guard for a route.
    ///
    /// `Err` is returned only for store failures; every policy outcome is a
    /// [`Decision`].
    pub async fn check(
        &self,
        request: &GuardRequest,
        requirement: Option<&RouteRequirement>,
    ) -> Result<Decision> {
        let decision = self.evaluate(request, requirement).await?;
        if decision.is_allowed()
            && let Some(token) = &request.session
            && let Err(err) = self.store.touch(token).await
        {
            warn!(error = %err, "session touch failed");
        }
        Ok(decision)
    }

    async fn evaluate(
        &self,
        request: &GuardRequest,
        requirement: Option<&RouteRequirement>,
    ) -> Result<Decision> {
        let Some(token) = &request.session else {
            debug!("deny: no session cookie");
            return Ok(Decision::Deny(DenyReason::Unauthenticated));
        };
        let Some(user_id) = self.store.session_user(token).await.map_err(Error::from)? else {
            debug!("deny: unknown or expired session");
            return Ok(Decision::Deny(DenyReason::Unauthenticated));
        };
        if let Some(ip) = request.ip
            && self.store.ip_denied(ip).await.map_err(Error::from)?
        {
            debug!(%ip, user = %user_id, "deny: denylisted address");
            return Ok(Decision::Deny(DenyReason::Unauthenticated));
        }
        let Some(user) = self.store.user_by_id(&user_id).await.map_err(Error::from)? else {
            debug!(user = %user_id, "deny: user not found");
            return Ok(Decision::Deny(DenyReason::Unauthenticated));
        };
        if !user.enabled || !user.is_active {
            debug!(user = %user_id, enabled = user.enabled, active = user.is_active, "deny: account disabled");
            return Ok(Decision::Deny(DenyReason::Unauthenticated));
        }

        if let Some(requirement) = requirement {
            let visible = user.permission.retain_keys(|key| {
                self.registry.contains(key) || key.contains('*') || key.contains('/')
            });
            if !has_capability(
                &visible,
                &requirement.permissions,
                requirement.permission_level.as_str(),
            ) {
                debug!(user = %user_id, level = %requirement.permission_level, "deny: missing capability");
                return Ok(Decision::Deny(DenyReason::Forbidden));
            }
        }

        Ok(Decision::Allow(AuthenticatedUser {
            id: user.id,
            username: user.username,
            permission: user.permission,
        }))
    }
}
