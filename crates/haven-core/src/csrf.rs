//! Double-submit CSRF tokens.

use std::sync::Arc;

use haven_util::token::random_token_hex;
use haven_util::{Clock, KeyStore, MemoryStore, SystemClock};
use serde::{Deserialize, Serialize};

use crate::decision::{Decision, DenyReason};
use crate::sweeper::Sweep;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CsrfConfig {
    pub token_expiry_ms: i64,
    /// Consume tokens on successful validation of unsafe requests.
    pub single_use: bool,
    pub sweep_interval_ms: u64,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            token_expiry_ms: 86_400_000,
            single_use: false,
            sweep_interval_ms: 3_600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfToken {
    pub token: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub used: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCheck {
    Valid,
    Invalid(DenyReason),
}

impl TokenCheck {
    pub fn is_valid(self) -> bool {
        matches!(self, TokenCheck::Valid)
    }

    pub fn message(self) -> &'static str {
        match self {
            TokenCheck::Valid => "CSRF token valid",
            TokenCheck::Invalid(DenyReason::ExpiredToken) => "CSRF token expired",
            TokenCheck::Invalid(DenyReason::AlreadyConsumedToken) => "CSRF token already used",
            TokenCheck::Invalid(_) => "Invalid CSRF token",
        }
    }

    pub fn to_decision(self) -> Decision {
        match self {
            TokenCheck::Valid => Decision::allow(),
            TokenCheck::Invalid(reason) => Decision::deny(reason, self.message()),
        }
    }
}

pub struct CsrfGuard<S = MemoryStore<CsrfToken>> {
    config: CsrfConfig,
    store: S,
    clock: Arc<dyn Clock>,
}

impl CsrfGuard {
    pub fn new(config: CsrfConfig) -> Self {
        Self::with_store(config, MemoryStore::new(), Arc::new(SystemClock))
    }
}

impl<S: KeyStore<CsrfToken>> CsrfGuard<S> {
    pub fn with_store(config: CsrfConfig, store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    pub fn config(&self) -> &CsrfConfig {
        &self.config
    }

    pub fn issue(&self) -> IssuedToken {
        let now = self.clock.now_ms();
        let token = random_token_hex(32);
        self.store.set(
            &token,
            CsrfToken {
                token: token.clone(),
                created_at: now,
                expires_at: now + self.config.token_expiry_ms,
                used: false,
            },
        );
        IssuedToken {
            token,
            expires_in: (self.config.token_expiry_ms.max(0) / 1000) as u64,
        }
    }

    /// Check a presented token without consuming it.
    pub fn validate(&self, token: &str) -> TokenCheck {
        if token.is_empty() {
            return TokenCheck::Invalid(DenyReason::InvalidToken);
        }
        let now = self.clock.now_ms();
        let Some(record) = self.store.get(token) else {
            return TokenCheck::Invalid(DenyReason::InvalidToken);
        };
        if now > record.expires_at {
            self.store.remove_if(token, |t| now > t.expires_at);
            return TokenCheck::Invalid(DenyReason::ExpiredToken);
        }
        if record.used {
            return TokenCheck::Invalid(DenyReason::AlreadyConsumedToken);
        }
        TokenCheck::Valid
    }

    /// Mark a live token used. Only one caller can ever succeed per token.
    pub fn consume(&self, token: &str) -> bool {
        let now = self.clock.now_ms();
        self.store
            .modify(token, |record| {
                if record.used || now > record.expires_at {
                    return false;
                }
                record.used = true;
                true
            })
            .unwrap_or(false)
    }

    /// Validate and, in single-use mode, consume in one step.
    pub fn check_unsafe_request(&self, token: &str) -> TokenCheck {
        let check = self.validate(token);
        if !check.is_valid() || !self.config.single_use {
            return check;
        }
        if self.consume(token) {
            return TokenCheck::Valid;
        }
        // Lost a race with another consumer or with expiry.
        match self.validate(token) {
            TokenCheck::Valid => TokenCheck::Invalid(DenyReason::AlreadyConsumedToken),
            invalid => invalid,
        }
    }

    pub fn invalidate(&self, token: &str) -> bool {
        self.store.delete(token).is_some()
    }

    pub fn live_tokens(&self) -> usize {
        self.store.len()
    }
}

impl<S: KeyStore<CsrfToken> + 'static> Sweep for CsrfGuard<S> {
    fn name(&self) -> &'static str {
        "csrf"
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        self.store
            .keys()
            .into_iter()
            .filter(|token| self.store.remove_if(token, |t| now > t.expires_at).is_some())
            .count()
    }
}
