use std::sync::Arc;

use axum::{
    http::StatusCode,
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use haven_core::{GuardError, Guards, RouteClass};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::ServiceBuilder;

pub mod accounts;
pub mod error;
pub mod extract;
pub mod metrics;
pub mod middleware;
pub mod routes;

use accounts::AccountDirectory;
use extract::{AddressAndRouteKey, ClientAddressKey, ProxyPolicy, SubjectKey};
use metrics::Metrics;
use middleware::{count_requests, csrf_middleware, rate_limit_middleware, RateLimitLayerBuilder};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiSettings {
    pub proxy: ProxyPolicy,
    /// Admin endpoints are disabled when unset.
    pub admin_token: Option<String>,
    pub cookie_secure: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub guards: Arc<Guards>,
    pub accounts: Arc<AccountDirectory>,
    pub settings: Arc<ApiSettings>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(guards: Arc<Guards>, accounts: AccountDirectory, settings: ApiSettings) -> Self {
        Self {
            guards,
            accounts: Arc::new(accounts),
            settings: Arc::new(settings),
            metrics: Arc::new(Metrics::default()),
        }
    }
}

/// The full HTTP surface. Unsafe browser routes pass CSRF, then the rate
/// limiter, then (for login) the brute-force guard inside the handler.
pub fn build_router(state: AppState) -> Result<Router, GuardError> {
    let auth_limit = RateLimitLayerBuilder::new(RouteClass::Auth)
        .key_by(ClientAddressKey)
        .build(&state)?;
    let api_limit = RateLimitLayerBuilder::new(RouteClass::Api)
        .key_by(AddressAndRouteKey(RouteClass::Api))
        .build(&state)?;
    let general_limit = RateLimitLayerBuilder::new(RouteClass::General)
        .key_by(SubjectKey)
        .build(&state)?;

    let auth = Router::new()
        .route("/api/v1/auth/login", post(routes::auth::login))
        .route("/api/v1/auth/mfa/verify", post(routes::auth::verify_mfa))
        .route("/api/v1/auth/mfa/otp", post(routes::auth::send_mfa_otp))
        .layer(from_fn_with_state(auth_limit, rate_limit_middleware));

    let csrf = Router::new()
        .route("/api/v1/csrf", get(routes::csrf::issue_token))
        .layer(from_fn_with_state(general_limit, rate_limit_middleware));

    let browser = Router::new()
        .merge(auth)
        .merge(csrf)
        .layer(from_fn_with_state(state.clone(), csrf_middleware));

    let admin = Router::new()
        .route("/api/v1/admin/access", get(routes::admin::list_access))
        .route(
            "/api/v1/admin/access/{list}/{key}",
            put(routes::admin::add_access_entry).delete(routes::admin::remove_access_entry),
        )
        .route("/api/v1/admin/csrf/{token}", delete(routes::admin::revoke_csrf_token))
        .route("/api/v1/admin/lockouts/{key}", delete(routes::admin::clear_lockout))
        .layer(from_fn_with_state(api_limit, rate_limit_middleware));

    let metrics = state.metrics.clone();
    Ok(Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .merge(browser)
        .merge(admin)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(tower_http::trace::TraceLayer::new_for_http())
                .layer(from_fn_with_state(metrics, count_requests)),
        ))
}

async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "service": "haven" })),
    )
}

async fn render_metrics(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use haven_core::GuardConfig;

    pub fn state_with(config: GuardConfig) -> AppState {
        let guards = Guards::new(&config).expect("guards");
        AppState::new(Arc::new(guards), AccountDirectory::default(), ApiSettings::default())
    }
}
