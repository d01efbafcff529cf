use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use haven_core::{GuardError, IssuedToken, RateLimiter, RouteClass, TokenCheck};
use haven_util::token::constant_time_equal;

use crate::error::ApiError;
use crate::extract::{KeyExtractor, ProxyPolicy};
use crate::metrics::Metrics;
use crate::AppState;

pub const CSRF_COOKIE_NAME: &str = "haven_csrf";
pub const CSRF_HEADER_NAME: &str = "x-csrf-token";
pub const CSRF_BODY_FIELD: &str = "csrf_token";
pub const ADMIN_TOKEN_HEADER: &str = "x-haven-admin-token";

const MAX_CSRF_BODY_BYTES: usize = 64 * 1024;

// ── Request counting ────────────────────────────────────────────────────────

pub async fn count_requests(State(metrics): State<Arc<Metrics>>, req: Request, next: Next) -> Response {
    metrics.record_request();
    next.run(req).await
}

// ── CSRF ────────────────────────────────────────────────────────────────────

fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

fn get_cookie_value(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    for part in raw.split(';') {
        let trimmed = part.trim();
        let Some((name, value)) = trimmed.split_once('=') else {
            continue;
        };
        if name == cookie_name {
            return Some(value.to_string());
        }
    }
    None
}

pub fn build_csrf_cookie(token: &str, max_age_secs: u64, secure: bool) -> String {
    let secure_attr = if secure { "; Secure" } else { "" };
    format!(
        "{name}={token}; HttpOnly; Path=/; SameSite=Strict; Max-Age={max_age_secs}{secure_attr}",
        name = CSRF_COOKIE_NAME,
    )
}

fn header_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CSRF_HEADER_NAME)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn body_token(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get(CSRF_BODY_FIELD)?
        .as_str()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Attach a fresh token as cookie and header, unless the handler already did.
pub fn attach_csrf_token(state: &AppState, response: &mut Response) {
    if response.headers().contains_key(CSRF_HEADER_NAME) {
        return;
    }
    let issued = state.guards.csrf.issue();
    attach_issued_token(response, &issued, state.settings.cookie_secure);
}

pub fn attach_issued_token(response: &mut Response, issued: &IssuedToken, secure: bool) {
    let cookie = build_csrf_cookie(&issued.token, issued.expires_in, secure);
    if let (Ok(cookie), Ok(token)) = (
        HeaderValue::from_str(&cookie),
        HeaderValue::from_str(&issued.token),
    ) {
        let headers = response.headers_mut();
        headers.append(header::SET_COOKIE, cookie);
        headers.insert(CSRF_HEADER_NAME, token);
    }
}

/// Issues tokens on safe methods and checks them on everything else.
pub async fn csrf_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if is_safe_method(req.method()) {
        let already_holds_token = get_cookie_value(req.headers(), CSRF_COOKIE_NAME)
            .is_some_and(|token| state.guards.csrf.validate(&token).is_valid());
        let mut response = next.run(req).await;
        if !already_holds_token {
            attach_csrf_token(&state, &mut response);
        }
        return response;
    }

    let (req, token) = match header_token(req.headers()) {
        Some(token) => (req, Some(token)),
        None => {
            let (parts, body) = req.into_parts();
            let bytes = match to_bytes(body, MAX_CSRF_BODY_BYTES).await {
                Ok(bytes) => bytes,
                Err(_) => {
                    return ApiError::BadRequest("Request body too large".into()).into_response()
                }
            };
            let token = body_token(&bytes);
            (Request::from_parts(parts, Body::from(bytes)), token)
        }
    };

    let check = state
        .guards
        .csrf
        .check_unsafe_request(token.as_deref().unwrap_or_default());
    if let TokenCheck::Invalid(reason) = check {
        state.metrics.record_csrf_rejected();
        tracing::warn!(
            method = %req.method(),
            path = %req.uri().path(),
            %reason,
            "csrf check failed"
        );
        return ApiError::Guard(check.to_decision()).into_response();
    }
    next.run(req).await
}

// ── Rate limiting ───────────────────────────────────────────────────────────

/// Everything the rate-limit middleware needs for one route class.
#[derive(Clone)]
pub struct RateLimitGuard {
    class: RouteClass,
    limiter: Arc<RateLimiter>,
    extractor: Arc<dyn KeyExtractor>,
    proxy: Arc<ProxyPolicy>,
    metrics: Arc<Metrics>,
}

pub struct RateLimitLayerBuilder {
    class: RouteClass,
    extractor: Option<Arc<dyn KeyExtractor>>,
}

impl RateLimitLayerBuilder {
    pub fn new(class: RouteClass) -> Self {
        Self {
            class,
            extractor: None,
        }
    }

    pub fn key_by(mut self, extractor: impl KeyExtractor) -> Self {
        self.extractor = Some(Arc::new(extractor));
        self
    }

    pub fn build(self, state: &AppState) -> Result<RateLimitGuard, GuardError> {
        let extractor = self.extractor.ok_or_else(|| {
            GuardError::Configuration(format!(
                "rate limit for route class {} has no key extractor",
                self.class.as_str()
            ))
        })?;
        Ok(RateLimitGuard {
            class: self.class,
            limiter: state.guards.limiter(self.class).clone(),
            extractor,
            proxy: Arc::new(state.settings.proxy.clone()),
            metrics: state.metrics.clone(),
        })
    }
}

pub async fn rate_limit_middleware(
    State(guard): State<RateLimitGuard>,
    req: Request,
    next: Next,
) -> Response {
    let key = guard.extractor.extract(&req, &guard.proxy);
    let decision = guard.limiter.allow(&key);
    if !decision.allowed {
        guard.metrics.record_rate_limited();
        tracing::debug!(class = guard.class.as_str(), %key, "request rate limited");
        return ApiError::Guard(decision.to_decision()).into_response();
    }

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&decision.remaining.to_string()) {
        response.headers_mut().insert("x-ratelimit-remaining", value);
    }
    response
}

// ── Admin token ─────────────────────────────────────────────────────────────

/// Extractor that requires the configured admin token.
pub struct AdminToken;

impl FromRequestParts<AppState> for AdminToken {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.settings.admin_token.as_deref() else {
            return Err(ApiError::Forbidden);
        };
        let provided = parts
            .headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        if !constant_time_equal(provided, expected) {
            tracing::warn!("admin request with wrong token");
            return Err(ApiError::Unauthorized);
        }
        Ok(AdminToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::state_with;
    use haven_core::GuardConfig;

    #[test]
    fn builder_without_extractor_is_rejected() {
        let state = state_with(GuardConfig::default());
        let result = RateLimitLayerBuilder::new(RouteClass::Auth).build(&state);
        assert!(matches!(result, Err(GuardError::Configuration(_))));
    }

    #[test]
    fn builder_with_extractor_builds() {
        let state = state_with(GuardConfig::default());
        let guard = RateLimitLayerBuilder::new(RouteClass::Api)
            .key_by(crate::extract::ClientAddressKey)
            .build(&state);
        assert!(guard.is_ok());
    }

    #[test]
    fn cookie_attributes() {
        assert_eq!(
            build_csrf_cookie("abc", 60, true),
            "haven_csrf=abc; HttpOnly; Path=/; SameSite=Strict; Max-Age=60; Secure"
        );
        assert!(!build_csrf_cookie("abc", 60, false).contains("Secure"));
    }

    #[test]
    fn reads_named_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; haven_csrf=tok123"),
        );
        assert_eq!(get_cookie_value(&headers, CSRF_COOKIE_NAME).as_deref(), Some("tok123"));
        assert_eq!(get_cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn body_field_fallback() {
        assert_eq!(
            body_token(br#"{"username":"a","csrf_token":"tok"}"#).as_deref(),
            Some("tok")
        );
        assert_eq!(body_token(b"not json"), None);
        assert_eq!(body_token(br#"{"csrf_token":""}"#), None);
    }
}
