use axum::{extract::State, Json};
use haven_core::{
    decision::retry_after_secs, Decision, DenyReason, FailureOutcome, GuardError, MfaMethod,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::accounts::normalize_username;
use crate::error::ApiError;
use crate::extract::{auth_guard_keys, ClientIp};
use crate::AppState;

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct VerifyMfaRequest {
    pub session_id: String,
    pub code: String,
}

#[derive(Deserialize)]
pub struct MfaOtpRequest {
    pub session_id: String,
}

fn auth_guard_enforce(state: &AppState, keys: &[String]) -> Result<(), ApiError> {
    let decision = state
        .guards
        .brute_force
        .decision_any(keys.iter().map(String::as_str));
    if decision.allowed {
        return Ok(());
    }
    state.metrics.record_locked_out();
    Err(ApiError::Guard(decision))
}

/// Record the failure against every key and report the most restrictive result.
fn auth_guard_record_failure(state: &AppState, keys: &[String]) -> ApiError {
    let outcomes: Vec<FailureOutcome> = keys
        .iter()
        .map(|key| state.guards.brute_force.record_failure(key))
        .collect();

    if let Some(locked) = outcomes
        .iter()
        .filter(|o| o.locked)
        .max_by_key(|o| o.remaining_ms)
    {
        state.metrics.record_locked_out();
        let secs = retry_after_secs(locked.remaining_ms);
        return ApiError::Guard(
            Decision::deny(DenyReason::LockedOut, locked.message.clone())
                .with_retry_after(secs)
                .with_attempts_remaining(0),
        );
    }

    let max_attempts = state.guards.brute_force.config().max_attempts;
    let attempts_remaining = outcomes
        .iter()
        .map(|o| max_attempts.saturating_sub(o.attempts))
        .min()
        .unwrap_or(max_attempts);
    ApiError::InvalidCredentials {
        message: format!("Invalid credentials. {attempts_remaining} attempts remaining"),
        attempts_remaining,
    }
}

fn auth_guard_record_success(state: &AppState, keys: &[String]) {
    for key in keys {
        state.guards.brute_force.clear(key);
    }
}

pub async fn login(
    State(state): State<AppState>,
    ClientIp(client_ip): ClientIp,
    Json(body): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    let username = normalize_username(&body.username);
    let keys = auth_guard_keys(&client_ip, Some(&username));
    auth_guard_enforce(&state, &keys)?;

    if username.is_empty() || body.password.is_empty() {
        return Err(auth_guard_record_failure(&state, &keys));
    }
    let Some(account) = state.accounts.authenticate(&username, &body.password) else {
        tracing::info!(ip = %client_ip, "login failed");
        return Err(auth_guard_record_failure(&state, &keys));
    };
    auth_guard_record_success(&state, &keys);

    let Some(method) = account.mfa else {
        tracing::info!(username = %account.username, "login succeeded");
        return Ok(Json(json!({
            "status": "authenticated",
            "username": account.username,
        })));
    };

    let mfa = &state.guards.mfa;
    let session = mfa.create_session(&account.username, method);
    if method.uses_otp() {
        mfa.issue_session_otp(&session.session_id)?;
        // Delivery over email/SMS happens outside this service.
        tracing::info!(username = %account.username, ?method, "mfa code issued for delivery");
    }
    Ok(Json(json!({
        "status": "mfa_required",
        "method": method,
        "session_id": session.session_id,
        "expires_in": session.expires_in,
    })))
}

pub async fn verify_mfa(
    State(state): State<AppState>,
    Json(body): Json<VerifyMfaRequest>,
) -> Result<Json<Value>, ApiError> {
    let mfa = &state.guards.mfa;
    // The attempt is counted before the code is checked, so concurrent
    // guesses cannot outrun the ceiling.
    let session = mfa
        .reserve_attempt(&body.session_id)
        .map_err(|outcome| ApiError::Guard(outcome.to_decision()))?;
    let account = state
        .accounts
        .get(&session.subject_id)
        .ok_or(ApiError::Unauthorized)?;

    let code = body.code.trim();
    let code_ok = match session.method {
        MfaMethod::Totp => account
            .totp_secret()
            .is_some_and(|secret| mfa.verify_totp_code(secret, code)),
        MfaMethod::Sms | MfaMethod::Email => mfa.verify_session_otp(&session.session_id, code),
    };
    let verified = code_ok || account.use_backup_code(code);

    if !verified {
        let outcome = mfa.reject_attempt(&session);
        if outcome.locked {
            tracing::warn!(username = %account.username, "mfa challenge locked");
        }
        return Err(ApiError::Guard(outcome.to_decision()));
    }

    mfa.mark_verified(&session.session_id)?;
    let completed = mfa.complete_session(&session.session_id)?;
    tracing::info!(username = %completed.subject_id, "mfa challenge completed");
    Ok(Json(json!({
        "status": "authenticated",
        "username": completed.subject_id,
        "backup_codes_remaining": account.unused_backup_codes(),
    })))
}

/// Re-issue the out-of-band code for an email or SMS challenge.
pub async fn send_mfa_otp(
    State(state): State<AppState>,
    Json(body): Json<MfaOtpRequest>,
) -> Result<Json<Value>, ApiError> {
    let mfa = &state.guards.mfa;
    let session = mfa
        .get_session(&body.session_id)
        .ok_or(GuardError::SessionNotFound)?;
    if !session.method.uses_otp() {
        return Err(ApiError::BadRequest(
            "Session method does not use delivered codes".into(),
        ));
    }
    mfa.issue_session_otp(&session.session_id)?;
    tracing::info!(
        username = %session.subject_id,
        method = ?session.method,
        "mfa code re-issued for delivery"
    );
    let expires_in = retry_after_secs(mfa.config().code_expiry_ms);
    Ok(Json(json!({ "status": "sent", "expires_in": expires_in })))
}
