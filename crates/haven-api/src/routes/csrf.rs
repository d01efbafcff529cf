use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::middleware::attach_issued_token;
use crate::AppState;

/// Issue a token explicitly, for clients that start with an unsafe request.
pub async fn issue_token(State(state): State<AppState>) -> Response {
    let issued = state.guards.csrf.issue();
    let mut response = Json(json!({
        "token": issued.token,
        "expires_in": issued.expires_in,
    }))
    .into_response();
    attach_issued_token(&mut response, &issued, state.settings.cookie_secure);
    response
}
