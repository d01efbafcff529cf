pub mod brute_force;
pub mod csrf;
pub mod decision;
pub mod error;
pub mod mfa;
pub mod rate_limit;
pub mod sweeper;

use std::sync::Arc;
use std::time::Duration;

use haven_util::{Clock, MemoryStore, SystemClock};
use serde::{Deserialize, Serialize};

pub use brute_force::{BruteForceConfig, BruteForceGuard, FailureOutcome, LockStatus};
pub use csrf::{CsrfConfig, CsrfGuard, IssuedToken, TokenCheck};
pub use decision::{Decision, DenyReason};
pub use error::GuardError;
pub use mfa::{verify_backup_code, BackupCode, MfaConfig, MfaManager, MfaMethod};
pub use rate_limit::{AccessLists, RateDecision, RateLimitConfig, RateLimiter};
pub use sweeper::{Sweep, Sweeper, SweeperSet};

/// Route classes, each with its own bucket configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteClass {
    Auth,
    Api,
    General,
}

impl RouteClass {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteClass::Auth => "auth",
            RouteClass::Api => "api",
            RouteClass::General => "general",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub auth: RateLimitConfig,
    pub api: RateLimitConfig,
    pub general: RateLimitConfig,
    /// Keys seeded into the shared whitelist at startup.
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            auth: RateLimitConfig::new(10, 60_000),
            api: RateLimitConfig::new(120, 60_000),
            general: RateLimitConfig::new(300, 60_000),
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        }
    }
}

impl RateLimitSettings {
    pub fn class(&self, class: RouteClass) -> &RateLimitConfig {
        match class {
            RouteClass::Auth => &self.auth,
            RouteClass::Api => &self.api,
            RouteClass::General => &self.general,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardConfig {
    pub brute_force: BruteForceConfig,
    pub rate_limit: RateLimitSettings,
    pub mfa: MfaConfig,
    pub csrf: CsrfConfig,
}

impl GuardConfig {
    /// Reject settings that would make a guard meaningless or a sweeper spin.
    pub fn validate(&self) -> Result<(), GuardError> {
        let bf = &self.brute_force;
        require(bf.max_attempts > 0, "brute_force.max_attempts must be positive")?;
        require(bf.initial_delay_ms > 0, "brute_force.initial_delay_ms must be positive")?;
        require(
            bf.max_delay_ms >= bf.initial_delay_ms,
            "brute_force.max_delay_ms must not be below initial_delay_ms",
        )?;
        require(bf.reset_interval_ms > 0, "brute_force.reset_interval_ms must be positive")?;
        require(bf.sweep_interval_ms > 0, "brute_force.sweep_interval_ms must be positive")?;

        for class in [RouteClass::Auth, RouteClass::Api, RouteClass::General] {
            let limits = self.rate_limit.class(class);
            if limits.max_tokens == 0 || limits.window_ms <= 0 || limits.sweep_interval_ms == 0 {
                return Err(GuardError::Configuration(format!(
                    "rate_limit.{} needs positive max_tokens, window_ms and sweep_interval_ms",
                    class.as_str()
                )));
            }
        }

        let mfa = &self.mfa;
        require(mfa.max_attempts > 0, "mfa.max_attempts must be positive")?;
        require(mfa.code_expiry_ms > 0, "mfa.code_expiry_ms must be positive")?;
        require(mfa.session_expiry_ms > 0, "mfa.session_expiry_ms must be positive")?;
        require(mfa.backup_code_length > 0, "mfa.backup_code_length must be positive")?;
        require(mfa.sweep_interval_ms > 0, "mfa.sweep_interval_ms must be positive")?;

        require(self.csrf.token_expiry_ms > 0, "csrf.token_expiry_ms must be positive")?;
        require(self.csrf.sweep_interval_ms > 0, "csrf.sweep_interval_ms must be positive")?;
        Ok(())
    }
}

fn require(ok: bool, message: &str) -> Result<(), GuardError> {
    if ok {
        Ok(())
    } else {
        Err(GuardError::Configuration(message.to_string()))
    }
}

/// Every guard of one process, sharing a clock and the access lists.
pub struct Guards {
    pub brute_force: Arc<BruteForceGuard>,
    pub mfa: Arc<MfaManager>,
    pub csrf: Arc<CsrfGuard>,
    pub access: Arc<AccessLists>,
    auth_limiter: Arc<RateLimiter>,
    api_limiter: Arc<RateLimiter>,
    general_limiter: Arc<RateLimiter>,
}

impl Guards {
    pub fn new(config: &GuardConfig) -> Result<Self, GuardError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &GuardConfig, clock: Arc<dyn Clock>) -> Result<Self, GuardError> {
        config.validate()?;

        let access = Arc::new(AccessLists::new());
        for key in &config.rate_limit.whitelist {
            access.whitelist(key);
        }
        for key in &config.rate_limit.blacklist {
            access.blacklist(key);
        }

        let limiter = |class: RouteClass| {
            Arc::new(RateLimiter::with_store(
                config.rate_limit.class(class).clone(),
                MemoryStore::new(),
                access.clone(),
                clock.clone(),
            ))
        };

        Ok(Self {
            brute_force: Arc::new(BruteForceGuard::with_store(
                config.brute_force.clone(),
                MemoryStore::new(),
                clock.clone(),
            )),
            mfa: Arc::new(MfaManager::with_store(
                config.mfa.clone(),
                MemoryStore::new(),
                clock.clone(),
            )),
            csrf: Arc::new(CsrfGuard::with_store(
                config.csrf.clone(),
                MemoryStore::new(),
                clock.clone(),
            )),
            auth_limiter: limiter(RouteClass::Auth),
            api_limiter: limiter(RouteClass::Api),
            general_limiter: limiter(RouteClass::General),
            access,
        })
    }

    pub fn limiter(&self, class: RouteClass) -> &Arc<RateLimiter> {
        match class {
            RouteClass::Auth => &self.auth_limiter,
            RouteClass::Api => &self.api_limiter,
            RouteClass::General => &self.general_limiter,
        }
    }

    /// Spawn one sweeper per store. Must be called inside a tokio runtime.
    pub fn start_sweepers(&self) -> SweeperSet {
        let mut set = SweeperSet::default();
        set.push(Sweeper::start(
            self.brute_force.clone(),
            Duration::from_millis(self.brute_force.config().sweep_interval_ms),
        ));
        for class in [RouteClass::Auth, RouteClass::Api, RouteClass::General] {
            let limiter = self.limiter(class);
            set.push(Sweeper::start(
                limiter.clone(),
                Duration::from_millis(limiter.config().sweep_interval_ms),
            ));
        }
        set.push(Sweeper::start(
            self.mfa.clone(),
            Duration::from_millis(self.mfa.config().sweep_interval_ms),
        ));
        set.push(Sweeper::start(
            self.csrf.clone(),
            Duration::from_millis(self.csrf.config().sweep_interval_ms),
        ));
        tracing::info!(sweepers = set.len(), "guard sweepers started");
        set
    }
}
