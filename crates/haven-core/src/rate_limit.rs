//! Token-bucket rate limiting with shared allow/deny lists.
//!
//! Buckets refill lazily at `max_tokens / window_ms` tokens per millisecond
//! whenever they are checked; nothing ticks in the background.

use std::sync::Arc;

use dashmap::DashSet;
use haven_util::{Clock, KeyStore, MemoryStore, SystemClock};
use serde::{Deserialize, Serialize};

use crate::decision::{Decision, DenyReason};
use crate::sweeper::Sweep;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_tokens: u32,
    pub window_ms: i64,
    /// Buckets untouched for this long are evicted. Defaults to `window_ms`,
    /// after which an idle bucket is full again and indistinguishable from a new one.
    pub idle_eviction_ms: Option<i64>,
    pub sweep_interval_ms: u64,
}

impl RateLimitConfig {
    pub fn new(max_tokens: u32, window_ms: i64) -> Self {
        Self {
            max_tokens,
            window_ms,
            ..Self::default()
        }
    }

    pub fn refill_per_ms(&self) -> f64 {
        f64::from(self.max_tokens) / self.window_ms.max(1) as f64
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: 60,
            window_ms: 60_000,
            idle_eviction_ms: None,
            sweep_interval_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    pub key: String,
    pub tokens: f64,
    pub last_refill_at: i64,
}

/// Whitelist and blacklist consulted before any token accounting.
#[derive(Debug, Default)]
pub struct AccessLists {
    whitelist: DashSet<String>,
    blacklist: DashSet<String>,
}

impl AccessLists {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn whitelist(&self, key: &str) {
        self.whitelist.insert(key.to_owned());
        tracing::info!(key, "key whitelisted");
    }

    pub fn remove_whitelist(&self, key: &str) -> bool {
        self.whitelist.remove(key).is_some()
    }

    pub fn blacklist(&self, key: &str) {
        self.blacklist.insert(key.to_owned());
        tracing::info!(key, "key blacklisted");
    }

    pub fn remove_blacklist(&self, key: &str) -> bool {
        self.blacklist.remove(key).is_some()
    }

    pub fn is_whitelisted(&self, key: &str) -> bool {
        self.whitelist.contains(key)
    }

    pub fn is_blacklisted(&self, key: &str) -> bool {
        self.blacklist.contains(key)
    }

    pub fn whitelisted(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.whitelist.iter().map(|k| k.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn blacklisted(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blacklist.iter().map(|k| k.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_seconds: u64,
    pub reason: Option<DenyReason>,
}

impl RateDecision {
    pub fn to_decision(&self) -> Decision {
        match self.reason {
            None => Decision::allow(),
            Some(DenyReason::Blacklisted) => Decision::deny(DenyReason::Blacklisted, "Access denied"),
            Some(reason) => Decision::deny(
                reason,
                format!(
                    "Too many requests. Retry in {} seconds.",
                    self.retry_after_seconds
                ),
            )
            .with_retry_after(self.retry_after_seconds),
        }
    }
}

pub struct RateLimiter<S = MemoryStore<TokenBucket>> {
    config: RateLimitConfig,
    store: S,
    lists: Arc<AccessLists>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_lists(config, Arc::new(AccessLists::new()))
    }

    pub fn with_lists(config: RateLimitConfig, lists: Arc<AccessLists>) -> Self {
        Self::with_store(config, MemoryStore::new(), lists, Arc::new(SystemClock))
    }
}

impl<S: KeyStore<TokenBucket>> RateLimiter<S> {
    pub fn with_store(
        config: RateLimitConfig,
        store: S,
        lists: Arc<AccessLists>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            lists,
            clock,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn lists(&self) -> &Arc<AccessLists> {
        &self.lists
    }

    pub fn allow(&self, key: &str) -> RateDecision {
        self.allow_cost(key, 1)
    }

    pub fn allow_cost(&self, key: &str, cost: u32) -> RateDecision {
        if self.lists.is_blacklisted(key) {
            tracing::warn!(key, "blacklisted key rejected");
            return RateDecision {
                allowed: false,
                remaining: 0,
                retry_after_seconds: 0,
                reason: Some(DenyReason::Blacklisted),
            };
        }
        if self.lists.is_whitelisted(key) {
            return RateDecision {
                allowed: true,
                remaining: self.config.max_tokens,
                retry_after_seconds: 0,
                reason: None,
            };
        }

        let now = self.clock.now_ms();
        let max_tokens = f64::from(self.config.max_tokens);
        let rate = self.config.refill_per_ms();
        let cost = f64::from(cost);

        self.store.upsert(
            key,
            || TokenBucket {
                key: key.to_owned(),
                tokens: max_tokens,
                last_refill_at: now,
            },
            |bucket| {
                let elapsed = (now - bucket.last_refill_at).max(0) as f64;
                bucket.tokens = (bucket.tokens + elapsed * rate).min(max_tokens);
                bucket.last_refill_at = bucket.last_refill_at.max(now);

                if bucket.tokens - cost < 0.0 {
                    let deficit = cost - bucket.tokens;
                    let wait_ms = deficit / rate;
                    let retry_after_seconds = ((wait_ms / 1000.0).ceil() as u64).max(1);
                    tracing::debug!(key, retry_after_seconds, "rate limit exceeded");
                    RateDecision {
                        allowed: false,
                        remaining: bucket.tokens.floor() as u32,
                        retry_after_seconds,
                        reason: Some(DenyReason::RateLimited),
                    }
                } else {
                    bucket.tokens -= cost;
                    RateDecision {
                        allowed: true,
                        remaining: bucket.tokens.floor() as u32,
                        retry_after_seconds: 0,
                        reason: None,
                    }
                }
            },
        )
    }

    pub fn whitelist(&self, key: &str) {
        self.lists.whitelist(key);
    }

    pub fn remove_whitelist(&self, key: &str) -> bool {
        self.lists.remove_whitelist(key)
    }

    pub fn blacklist(&self, key: &str) {
        self.lists.blacklist(key);
    }

    pub fn remove_blacklist(&self, key: &str) -> bool {
        self.lists.remove_blacklist(key)
    }

    pub fn bucket(&self, key: &str) -> Option<TokenBucket> {
        self.store.get(key)
    }

    pub fn tracked_keys(&self) -> usize {
        self.store.len()
    }

    fn idle_horizon_ms(&self) -> i64 {
        self.config
            .idle_eviction_ms
            .unwrap_or(self.config.window_ms)
            .max(self.config.window_ms)
    }
}

impl<S: KeyStore<TokenBucket> + 'static> Sweep for RateLimiter<S> {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn sweep(&self) -> usize {
        let cutoff = self.clock.now_ms() - self.idle_horizon_ms();
        self.store
            .keys()
            .into_iter()
            .filter(|key| {
                self.store
                    .remove_if(key, |bucket| bucket.last_refill_at <= cutoff)
                    .is_some()
            })
            .count()
    }
}
