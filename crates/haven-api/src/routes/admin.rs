use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use haven_util::token::log_fingerprint;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::middleware::AdminToken;
use crate::AppState;

// ── Access lists ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessList {
    Whitelist,
    Blacklist,
}

impl AccessList {
    fn parse(raw: &str) -> Result<Self, ApiError> {
        match raw {
            "whitelist" => Ok(AccessList::Whitelist),
            "blacklist" => Ok(AccessList::Blacklist),
            other => Err(ApiError::BadRequest(format!("unknown access list: {other}"))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            AccessList::Whitelist => "whitelist",
            AccessList::Blacklist => "blacklist",
        }
    }
}

pub async fn list_access(
    State(state): State<AppState>,
    _admin: AdminToken,
) -> Json<Value> {
    let lists = &state.guards.access;
    Json(json!({
        "whitelist": lists.whitelisted(),
        "blacklist": lists.blacklisted(),
    }))
}

pub async fn add_access_entry(
    State(state): State<AppState>,
    _admin: AdminToken,
    Path((list, key)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let list = AccessList::parse(&list)?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ApiError::BadRequest("key must not be empty".into()));
    }
    match list {
        AccessList::Whitelist => state.guards.access.whitelist(key),
        AccessList::Blacklist => state.guards.access.blacklist(key),
    }
    Ok(Json(json!({ "list": list.as_str(), "key": key, "added": true })))
}

pub async fn remove_access_entry(
    State(state): State<AppState>,
    _admin: AdminToken,
    Path((list, key)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let list = AccessList::parse(&list)?;
    let removed = match list {
        AccessList::Whitelist => state.guards.access.remove_whitelist(&key),
        AccessList::Blacklist => state.guards.access.remove_blacklist(&key),
    };
    if removed {
        tracing::info!(list = list.as_str(), %key, "access list entry removed");
    }
    Ok(Json(json!({ "list": list.as_str(), "key": key, "removed": removed })))
}

// ── Tokens & lockouts ────────────────────────────────────────────────

pub async fn revoke_csrf_token(
    State(state): State<AppState>,
    _admin: AdminToken,
    Path(token): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.guards.csrf.invalidate(&token) {
        tracing::info!(token = %log_fingerprint(&token), "csrf token revoked by admin");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

pub async fn clear_lockout(
    State(state): State<AppState>,
    _admin: AdminToken,
    Path(key): Path<String>,
) -> StatusCode {
    state.guards.brute_force.clear(&key);
    tracing::info!(%key, "lockout cleared by admin");
    StatusCode::NO_CONTENT
}
