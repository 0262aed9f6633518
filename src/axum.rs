//! Axum integration utilities.
//!
//! [`GuardLayer::auth`] runs the session, address and account checks;
//! [`GuardLayer::route`] additionally demands a capability. Denied requests
//! never reach the inner service and get a JSON body
//! `{ "error": true, "message": ... }`.
//!
//! The client address comes from the socket ([`ConnectInfo`]). Forwarding
//! headers are only read after [`GuardLayer::trust_proxy_headers`], for
//! deployments behind a proxy that overwrites them.

use std::future::poll_fn;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::config::SessionConfig;
use crate::guard::{Decision, Guard, GuardRequest, RouteRequirement};
use crate::types::SessionToken;

use ::axum::Json;
use ::axum::body::Body;
use ::axum::extract::ConnectInfo;
use ::axum::response::{IntoResponse, Response};
use ::http::header::{COOKIE, HeaderName};
use ::http::{HeaderMap, Request, StatusCode};
use ::tower::{Layer, Service};
use serde_json::json;
use tracing::error;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

pub use crate::config::DEFAULT_SESSION_COOKIE;

/// Middleware layer running a [`Guard`] before the inner service.
#[derive(Debug)]
pub struct GuardLayer<S, R> {
    guard: Arc<Guard<S, R>>,
    requirement: Option<RouteRequirement>,
    cookie_name: Arc<str>,
    trust_proxy_headers: bool,
}

impl<S, R> Clone for GuardLayer<S, R> {
    fn clone(&self) -> Self {
        Self {
            guard: Arc::clone(&self.guard),
            requirement: self.requirement.clone(),
            cookie_name: Arc::clone(&self.cookie_name),
            trust_proxy_headers: self.trust_proxy_headers,
        }
    }
}

impl<S, R> GuardLayer<S, R> {
    /// Authentication only: no capability check.
    pub fn auth(guard: Arc<Guard<S, R>>) -> Self {
        Self {
            guard,
            requirement: None,
            cookie_name: Arc::from(DEFAULT_SESSION_COOKIE),
            trust_proxy_headers: false,
        }
    }

    /// Full route guard with a capability requirement.
    pub fn route(guard: Arc<Guard<S, R>>, requirement: RouteRequirement) -> Self {
        Self {
            requirement: Some(requirement),
            ..Self::auth(guard)
        }
    }

    /// Reads the session token from `name` instead of the default cookie.
    pub fn cookie_name(mut self, name: &str) -> Self {
        self.cookie_name = Arc::from(name);
        self
    }

    /// Takes the cookie name from `config`.
    pub fn session_config(self, config: &SessionConfig) -> Self {
        self.cookie_name(&config.cookie_name)
    }

    /// Reads `X-Forwarded-For` / `X-Real-IP` before the socket address.
    ///
    /// Only enable this when every request passes a proxy that sets these
    /// headers; otherwise a client can pick its own address.
    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }
}

impl<S, R, Inner> Layer<Inner> for GuardLayer<S, R>
where
    S: crate::store::Store,
    R: crate::store::ModuleRegistry,
{
    type Service = GuardService<Inner, S, R>;

    fn layer(&self, inner: Inner) -> Self::Service {
        GuardService {
            inner,
            layer: self.clone(),
        }
    }
}

/// Middleware service produced by [`GuardLayer`].
#[derive(Debug)]
pub struct GuardService<Inner, S, R> {
    inner: Inner,
    layer: GuardLayer<S, R>,
}

impl<Inner: Clone, S, R> Clone for GuardService<Inner, S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            layer: self.layer.clone(),
        }
    }
}

impl<Inner, S, R> Service<Request<Body>> for GuardService<Inner, S, R>
where
    Inner: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    S: crate::store::Store + 'static,
    R: crate::store::ModuleRegistry + 'static,
{
    type Response = Response;
    type Error = Inner::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let layer = self.layer.clone();

        Box::pin(async move {
            let request = GuardRequest::new(
                session_token(req.headers(), &layer.cookie_name),
                client_ip(&req, layer.trust_proxy_headers),
            );

            match layer.guard.check(&request, layer.requirement.as_ref()).await {
                Ok(Decision::Allow(user)) => {
                    req.extensions_mut().insert(user);
                    poll_fn(|cx| inner.poll_ready(cx)).await?;
                    inner.call(req).await
                }
                Ok(Decision::Deny(reason)) => Ok(error_response(
                    StatusCode::from_u16(reason.status_code())
                        .unwrap_or(StatusCode::UNAUTHORIZED),
                    &reason.into_error().public_message(),
                )),
                Err(err) => {
                    error!(error = %err, "guard failed");
                    Ok(error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &err.public_message(),
                    ))
                }
            }
        })
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": true, "message": message }))).into_response()
}

/// Extracts the session token from the `Cookie` header(s).
pub fn session_token(headers: &HeaderMap, cookie_name: &str) -> Option<SessionToken> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .and_then(|(_, value)| SessionToken::new(value).ok())
}

/// Client address.
///
/// With `trust_proxy_headers` the first `X-Forwarded-For` entry, then
/// `X-Real-IP`, win over the socket address; otherwise only the socket counts.
pub fn client_ip<B>(req: &Request<B>, trust_proxy_headers: bool) -> Option<IpAddr> {
    let socket = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    if !trust_proxy_headers {
        return socket;
    }
    let headers = req.headers();
    let forwarded: Option<IpAddr> = headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|value| value.trim().parse().ok());
    let real_ip = || {
        headers
            .get(X_REAL_IP)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<IpAddr>().ok())
    };
    forwarded.or_else(real_ip).or(socket)
}

#[cfg(all(test, feature = "memory-store"))]
mod tests {
    use super::*;
    use crate::guard::{AuthenticatedUser, GuardBuilder};
    use crate::memory_store::MemoryStore;
    use crate::permission::PermissionMap;
    use crate::store::{AllModules, UserRecord};
    use crate::types::UserId;
    use ::axum::Router;
    use ::axum::routing::get;
    use ::axum::Extension;
    use ::tower::ServiceExt;

    fn layer(store: MemoryStore, requirement: Option<RouteRequirement>) -> GuardLayer<MemoryStore, AllModules> {
        let guard = Arc::new(GuardBuilder::new(store).build());
        match requirement {
            Some(requirement) => GuardLayer::route(guard, requirement),
            None => GuardLayer::auth(guard),
        }
    }

    fn router(layer: GuardLayer<MemoryStore, AllModules>) -> Router {
        Router::new()
            .route(
                "/debtors",
                get(|Extension(user): Extension<AuthenticatedUser>| async move { user.username }),
            )
            .layer(layer)
    }

    fn app(store: MemoryStore, requirement: Option<RouteRequirement>) -> Router {
        router(layer(store, requirement))
    }

    fn seeded() -> (MemoryStore, SessionToken) {
        let store = MemoryStore::new();
        let id = UserId::try_from("1").unwrap();
        store.put_user(UserRecord {
            id: id.clone(),
            username: "clerk".to_string(),
            enabled: true,
            is_active: true,
            permission: PermissionMap::new().with("debtor", ["VIEW"]),
        });
        let token = store.create_session(id);
        (store, token)
    }

    fn request(token: Option<&SessionToken>) -> Request<Body> {
        let mut builder = Request::builder()
            .uri("/debtors")
            .header("x-forwarded-for", "10.0.0.9, 10.0.0.1");
        if let Some(token) = token {
            builder = builder.header(COOKIE, format!("theme=dark; sid={token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn from_socket(mut req: Request<Body>, ip: [u8; 4]) -> Request<Body> {
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((ip, 40_000))));
        req
    }

    #[tokio::test]
    async fn missing_cookie_returns_401_json() {
        let (store, _) = seeded();
        let response = app(store, None).oneshot(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn allowed_request_reaches_handler_with_user() {
        let (store, token) = seeded();
        let requirement = RouteRequirement::new("debtor", "VIEW");
        let response = app(store, Some(requirement))
            .oneshot(request(Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_capability_returns_403() {
        let (store, token) = seeded();
        let requirement = RouteRequirement::new("debtor", "DELETE");
        let response = app(store, Some(requirement))
            .oneshot(request(Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn denylisted_socket_address_returns_401() {
        let (store, token) = seeded();
        store.deny_ip("10.0.0.9".parse().unwrap());
        let response = app(store, None)
            .oneshot(from_socket(request(Some(&token)), [10, 0, 0, 9]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn spoofed_forwarded_header_does_not_unblock_socket_address() {
        let (store, token) = seeded();
        store.deny_ip("192.0.2.7".parse().unwrap());
        let mut req = from_socket(request(Some(&token)), [192, 0, 2, 7]);
        req.headers_mut()
            .insert(X_FORWARDED_FOR, "1.2.3.4".parse().unwrap());

        let response = app(store, None).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn trusted_proxy_header_is_checked_against_denylist() {
        let (store, token) = seeded();
        store.deny_ip("10.0.0.9".parse().unwrap());
        let trusting = layer(store, None).trust_proxy_headers(true);
        let response = router(trusting)
            .oneshot(from_socket(request(Some(&token)), [127, 0, 0, 1]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn cookie_name_comes_from_session_config() {
        let (store, token) = seeded();
        let config = SessionConfig {
            cookie_name: "civic_sid".to_string(),
            ..SessionConfig::default()
        };
        let req = Request::builder()
            .uri("/debtors")
            .header(COOKIE, format!("civic_sid={token}"))
            .body(Body::empty())
            .unwrap();

        let response = router(layer(store, None).session_config(&config))
            .oneshot(req)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn client_ip_ignores_headers_unless_trusted() {
        let req = from_socket(request(None), [192, 0, 2, 7]);
        assert_eq!(client_ip(&req, false), "192.0.2.7".parse().ok());
        assert_eq!(client_ip(&req, true), "10.0.0.9".parse().ok());

        let bare = request(None);
        assert_eq!(client_ip(&bare, false), None);
    }

    #[test]
    fn session_token_reads_named_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "a=1; sid=abc.def; b=2".parse().unwrap());
        assert_eq!(
            session_token(&headers, "sid").map(|t| t.to_string()).as_deref(),
            Some("abc.def")
        );
        assert!(session_token(&headers, "other").is_none());
    }
}
