use serde::Serialize;

/// Machine-readable reason a guard refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    LockedOut,
    RateLimited,
    Blacklisted,
    InvalidToken,
    ExpiredToken,
    AlreadyConsumedToken,
    MaxMfaAttemptsExceeded,
    SessionExpired,
}

impl DenyReason {
    pub fn http_status(self) -> u16 {
        match self {
            DenyReason::LockedOut | DenyReason::RateLimited => 429,
            DenyReason::Blacklisted
            | DenyReason::InvalidToken
            | DenyReason::ExpiredToken
            | DenyReason::AlreadyConsumedToken => 403,
            DenyReason::MaxMfaAttemptsExceeded | DenyReason::SessionExpired => 401,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::LockedOut => "locked_out",
            DenyReason::RateLimited => "rate_limited",
            DenyReason::Blacklisted => "blacklisted",
            DenyReason::InvalidToken => "invalid_token",
            DenyReason::ExpiredToken => "expired_token",
            DenyReason::AlreadyConsumedToken => "already_consumed_token",
            DenyReason::MaxMfaAttemptsExceeded => "max_mfa_attempts_exceeded",
            DenyReason::SessionExpired => "session_expired",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome handed to the request pipeline by every guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub http_status: u16,
    pub reason: Option<DenyReason>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts_remaining: Option<u32>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            http_status: 200,
            reason: None,
            message: String::new(),
            retry_after_seconds: None,
            attempts_remaining: None,
        }
    }

    pub fn deny(reason: DenyReason, message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            http_status: reason.http_status(),
            reason: Some(reason),
            message: message.into(),
            retry_after_seconds: None,
            attempts_remaining: None,
        }
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_seconds = Some(seconds);
        self
    }

    pub fn with_attempts_remaining(mut self, remaining: u32) -> Self {
        self.attempts_remaining = Some(remaining);
        self
    }
}

/// Round a millisecond wait up to whole seconds, never below one.
pub fn retry_after_secs(remaining_ms: i64) -> u64 {
    let secs = (remaining_ms.max(0) as u64).div_ceil(1000);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_reason() {
        assert_eq!(DenyReason::LockedOut.http_status(), 429);
        assert_eq!(DenyReason::Blacklisted.http_status(), 403);
        assert_eq!(DenyReason::SessionExpired.http_status(), 401);
    }

    #[test]
    fn deny_serializes_reason_code() {
        let decision = Decision::deny(DenyReason::RateLimited, "slow down").with_retry_after(3);
        let value = serde_json::to_value(&decision).expect("serialize");
        assert_eq!(value["reason"], "rate_limited");
        assert_eq!(value["http_status"], 429);
        assert_eq!(value["retry_after_seconds"], 3);
        assert!(value.get("attempts_remaining").is_none());
    }

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(retry_after_secs(1), 1);
        assert_eq!(retry_after_secs(1000), 1);
        assert_eq!(retry_after_secs(1001), 2);
        assert_eq!(retry_after_secs(-5), 1);
    }
}
