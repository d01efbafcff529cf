use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use haven_core::{Decision, DenyReason, GuardError};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("invalid credentials")]
    InvalidCredentials { message: String, attempts_remaining: u32 },
    #[error("request denied")]
    Guard(Decision),
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                json!({ "error": "not_found", "message": self.to_string() }),
            ),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "unauthorized", "message": self.to_string() }),
            ),
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                json!({ "error": "forbidden", "message": self.to_string() }),
            ),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "bad_request", "message": msg }),
            ),
            ApiError::InvalidCredentials {
                message,
                attempts_remaining,
            } => (
                StatusCode::UNAUTHORIZED,
                json!({
                    "error": "invalid_credentials",
                    "message": message,
                    "attempts_remaining": attempts_remaining,
                }),
            ),
            ApiError::Guard(decision) => return guard_response(decision),
            ApiError::Internal(err) => {
                tracing::error!("API internal error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal", "message": "internal server error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

fn guard_response(decision: &Decision) -> Response {
    let status =
        StatusCode::from_u16(decision.http_status).unwrap_or(StatusCode::FORBIDDEN);
    let mut body = json!({
        "error": decision.reason.map(DenyReason::as_str).unwrap_or("denied"),
        "message": decision.message,
    });
    if let Some(retry) = decision.retry_after_seconds {
        body["retry_after_seconds"] = json!(retry);
    }
    if let Some(remaining) = decision.attempts_remaining {
        body["attempts_remaining"] = json!(remaining);
    }

    let mut response = (status, Json(body)).into_response();
    if status == StatusCode::TOO_MANY_REQUESTS {
        if let Some(retry) = decision.retry_after_seconds {
            if let Ok(value) = HeaderValue::from_str(&retry.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
    }
    response
}

impl From<GuardError> for ApiError {
    fn from(e: GuardError) -> Self {
        match e {
            GuardError::SessionNotFound | GuardError::SessionExpired => ApiError::Guard(
                Decision::deny(DenyReason::SessionExpired, "MFA session not found or expired"),
            ),
            GuardError::SessionNotVerified => ApiError::Unauthorized,
            GuardError::Configuration(msg) | GuardError::Totp(msg) => {
                ApiError::Internal(anyhow::anyhow!(msg))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_decision_sets_retry_after() {
        let decision = Decision::deny(DenyReason::RateLimited, "slow down").with_retry_after(7);
        let response = ApiError::Guard(decision).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER),
            Some(&HeaderValue::from_static("7"))
        );
    }

    #[test]
    fn forbidden_decision_has_no_retry_after() {
        let response =
            ApiError::Guard(Decision::deny(DenyReason::Blacklisted, "Access denied")).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[test]
    fn missing_session_maps_to_unauthorized_decision() {
        let response = ApiError::from(GuardError::SessionNotFound).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
