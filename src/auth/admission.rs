//! Admission control for inbound requests
//!
//! Every request passes, in order: the rate limiter keyed by
//! (client IP, method + route template), the stateless access-token check,
//! and for routes that ask for it the live device check. The first failure
//! short-circuits with its error response.

use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{HeaderMap, AUTHORIZATION, USER_AGENT};
use actix_web::http::Method;
use actix_web::{FromRequest, HttpMessage, HttpRequest};
use futures::future::{ready, LocalBoxFuture, Ready};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth::rate_limit::{RateLimitPolicy, RateLimiter};
use crate::auth::service::{Identity, SessionManager};
use crate::config::RateLimitSettings;
use crate::error::{AppError, AuthError};

pub const DEFAULT_POLICY: &str = "api";

/// Route key shared by every request that matches no registered resource.
pub const UNMATCHED_ROUTE: &str = "<unmatched>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthLevel {
    /// Rate limit only.
    Public,
    /// Signed, unexpired access token.
    Token,
    /// Access token plus a live session and device.
    DeviceLive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub policy: String,
    pub auth: AuthLevel,
    /// Whether an admitted request refreshes the device's activity.
    pub heartbeat: bool,
}

impl RouteRule {
    pub fn new(policy: impl Into<String>, auth: AuthLevel) -> Self {
        Self {
            policy: policy.into(),
            auth,
            heartbeat: true,
        }
    }

    /// For routes such as logout, where a heartbeat would bring the device back online.
    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat = false;
        self
    }
}

/// What the gate needs to know about one request.
#[derive(Debug, Clone)]
pub struct AdmissionRequest<'a> {
    pub client_ip: &'a str,
    pub method: &'a Method,
    /// Route template such as `/devices/{id}`, or [`UNMATCHED_ROUTE`].
    pub route: &'a str,
    pub bearer: Option<&'a str>,
}

pub struct AdmissionGate {
    limiter: Arc<RateLimiter>,
    sessions: Arc<SessionManager>,
    policies: HashMap<String, RateLimitPolicy>,
    default_policy: RateLimitPolicy,
    routes: HashMap<(Method, String), RouteRule>,
    default_rule: RouteRule,
    trust_forwarded_headers: bool,
}

impl AdmissionGate {
    pub fn new(
        limiter: Arc<RateLimiter>,
        sessions: Arc<SessionManager>,
        policies: HashMap<String, RateLimitPolicy>,
    ) -> crate::Result<Self> {
        let default_policy = policies.get(DEFAULT_POLICY).cloned().ok_or_else(|| {
            AppError::ConfigError(format!("rate limit policy '{}' is not configured", DEFAULT_POLICY))
        })?;
        Ok(Self {
            limiter,
            sessions,
            policies,
            default_policy,
            routes: HashMap::new(),
            default_rule: RouteRule::new(DEFAULT_POLICY, AuthLevel::Token),
            trust_forwarded_headers: false,
        })
    }

    pub fn from_settings(
        limiter: Arc<RateLimiter>,
        sessions: Arc<SessionManager>,
        settings: &RateLimitSettings,
    ) -> crate::Result<Self> {
        let policies = settings
            .policies
            .iter()
            .map(|(name, config)| (name.clone(), RateLimitPolicy::from(config)))
            .collect();
        Ok(Self::new(limiter, sessions, policies)?
            .trusting_forwarded_headers(settings.trust_forwarded_headers))
    }

    pub fn trusting_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    pub fn trusts_forwarded_headers(&self) -> bool {
        self.trust_forwarded_headers
    }

    pub fn with_route(mut self, method: Method, route: &str, rule: RouteRule) -> Self {
        if !self.policies.contains_key(&rule.policy) {
            warn!(route = %route, policy = %rule.policy, "unknown rate limit policy, falling back to default");
        }
        self.routes.insert((method, route.to_string()), rule);
        self
    }

    pub fn with_routes<'a>(self, rules: impl IntoIterator<Item = (Method, &'a str, RouteRule)>) -> Self {
        rules
            .into_iter()
            .fold(self, |gate, (method, route, rule)| gate.with_route(method, route, rule))
    }

    pub fn rule_for(&self, method: &Method, route: &str) -> &RouteRule {
        self.routes
            .get(&(method.clone(), route.to_string()))
            .unwrap_or(&self.default_rule)
    }

    fn policy(&self, name: &str) -> &RateLimitPolicy {
        self.policies.get(name).unwrap_or(&self.default_policy)
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Returns the caller's identity for authenticated routes, `None` for public ones.
    pub async fn admit(&self, request: &AdmissionRequest<'_>) -> crate::Result<Option<Identity>> {
        let rule = self.rule_for(request.method, request.route);
        let policy = self.policy(&rule.policy);
        let endpoint = format!("{} {}", request.method, request.route);

        if !self.limiter.allow(request.client_ip, &endpoint, policy) {
            return Err(AuthError::RateLimited {
                message: policy.error_message.clone(),
                retry_after_secs: policy.retry_after_secs(),
            }
            .into());
        }

        if rule.auth == AuthLevel::Public {
            return Ok(None);
        }

        let token = request
            .bearer
            .ok_or(AppError::AuthError(AuthError::Unauthorized))?;
        let identity = self.sessions.validate_access(token)?;

        if rule.auth == AuthLevel::DeviceLive {
            self.sessions.verify_session(&identity).await?;
        }

        Ok(Some(identity))
    }

    /// Fire-and-forget heartbeat for an admitted caller.
    pub fn record_activity(&self, identity: &Identity, client_ip: &str, user_agent: Option<String>) {
        let ip = (client_ip != UNKNOWN_CLIENT).then(|| client_ip.to_string());
        self.sessions.registry().heartbeat_detached(
            identity.user_id,
            identity.device_id.clone(),
            ip,
            user_agent,
        );
    }
}

const UNKNOWN_CLIENT: &str = "unknown";

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Client address with any port removed. `Forwarded`/`X-Forwarded-For` are
/// only consulted when `trust_forwarded` is set; otherwise the peer address.
pub fn client_ip(req: &ServiceRequest, trust_forwarded: bool) -> String {
    if !trust_forwarded {
        return req
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string());
    }

    let info = req.connection_info();
    match info.realip_remote_addr() {
        Some(addr) => addr
            .parse::<SocketAddr>()
            .map(|socket| socket.ip().to_string())
            .unwrap_or_else(|_| addr.to_string()),
        None => UNKNOWN_CLIENT.to_string(),
    }
}

/// actix-web middleware running [`AdmissionGate`] in front of every route.
pub struct Admission {
    gate: Arc<AdmissionGate>,
}

impl Admission {
    pub fn new(gate: Arc<AdmissionGate>) -> Self {
        Self { gate }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Admission
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = AdmissionMiddleware<S>;
    type InitError = ();
    type Future = Ready<std::result::Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AdmissionMiddleware {
            service: Rc::new(service),
            gate: self.gate.clone(),
        }))
    }
}

pub struct AdmissionMiddleware<S> {
    service: Rc<S>,
    gate: Arc<AdmissionGate>,
}

impl<S, B> Service<ServiceRequest> for AdmissionMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let gate = self.gate.clone();

        Box::pin(async move {
            let client_ip = client_ip(&req, gate.trusts_forwarded_headers());
            let route = req
                .match_pattern()
                .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());
            let method = req.method().clone();
            let bearer = bearer_token(req.headers()).map(str::to_string);
            let user_agent = req
                .headers()
                .get(USER_AGENT)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string);

            let admission = AdmissionRequest {
                client_ip: &client_ip,
                method: &method,
                route: &route,
                bearer: bearer.as_deref(),
            };

            match gate.admit(&admission).await {
                Ok(identity) => {
                    if let Some(identity) = identity {
                        if gate.rule_for(&method, &route).heartbeat {
                            gate.record_activity(&identity, &client_ip, user_agent);
                        }
                        req.extensions_mut().insert(identity);
                    }
                    let res = service.call(req).await?;
                    Ok(res.map_into_left_body())
                }
                Err(e) => {
                    debug!(method = %method, route = %route, code = e.code(), "request rejected at admission");
                    Ok(req.error_response(e).map_into_right_body())
                }
            }
        })
    }
}

impl FromRequest for Identity {
    type Error = AppError;
    type Future = Ready<std::result::Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<Identity>()
                .cloned()
                .ok_or(AppError::AuthError(AuthError::Unauthorized)),
        )
    }
}
