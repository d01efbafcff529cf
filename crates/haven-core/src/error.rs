use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("mfa session not found")]
    SessionNotFound,
    #[error("mfa session has not been verified")]
    SessionNotVerified,
    #[error("mfa session expired")]
    SessionExpired,
    #[error("totp error: {0}")]
    Totp(String),
}
