//! Failed-attempt tracking with escalating lockouts.
//!
//! Below `max_attempts` failures a key is only counted. From then on each
//! further failure locks the key for `min(initial_delay * 2^(attempts-1),
//! max_delay)`. Past the cap the duration stays flat at `max_delay`.

use std::sync::Arc;

use haven_util::{Clock, KeyStore, MemoryStore, SystemClock};
use serde::{Deserialize, Serialize};

use crate::decision::{retry_after_secs, Decision, DenyReason};
use crate::sweeper::Sweep;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BruteForceConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: i64,
    pub max_delay_ms: i64,
    /// Idle records older than this are dropped by the sweep.
    pub reset_interval_ms: i64,
    pub sweep_interval_ms: u64,
}

impl Default for BruteForceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 900_000,
            reset_interval_ms: 3_600_000,
            sweep_interval_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub key: String,
    pub attempts: u32,
    pub last_attempt_at: i64,
    pub locked_until: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStatus {
    pub locked: bool,
    pub remaining_ms: i64,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureOutcome {
    pub locked: bool,
    pub remaining_ms: i64,
    pub attempts: u32,
    pub message: String,
}

pub struct BruteForceGuard<S = MemoryStore<AttemptRecord>> {
    config: BruteForceConfig,
    store: S,
    clock: Arc<dyn Clock>,
}

impl BruteForceGuard {
    pub fn new(config: BruteForceConfig) -> Self {
        Self::with_store(config, MemoryStore::new(), Arc::new(SystemClock))
    }
}

impl<S: KeyStore<AttemptRecord>> BruteForceGuard<S> {
    pub fn with_store(config: BruteForceConfig, store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    pub fn config(&self) -> &BruteForceConfig {
        &self.config
    }

    /// Lock duration applied after the given failure count, or zero below the threshold.
    pub fn lockout_duration_ms(&self, attempts: u32) -> i64 {
        if attempts == 0 || attempts < self.config.max_attempts {
            return 0;
        }
        let factor = 2i64
            .checked_pow(attempts - 1)
            .unwrap_or(i64::MAX);
        self.config
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.config.max_delay_ms)
    }

    pub fn check(&self, key: &str) -> LockStatus {
        let now = self.clock.now_ms();
        match self.store.get(key) {
            Some(record) => status_at(&record, now),
            None => LockStatus {
                locked: false,
                remaining_ms: 0,
                attempts: 0,
            },
        }
    }

    pub fn record_failure(&self, key: &str) -> FailureOutcome {
        let now = self.clock.now_ms();
        let record = self.store.upsert(
            key,
            || AttemptRecord {
                key: key.to_owned(),
                attempts: 0,
                last_attempt_at: now,
                locked_until: None,
            },
            |record| {
                record.attempts = record.attempts.saturating_add(1);
                record.last_attempt_at = now;
                let duration = self.lockout_duration_ms(record.attempts);
                if duration > 0 {
                    record.locked_until = Some(now + duration);
                }
                record.clone()
            },
        );

        let status = status_at(&record, now);
        let message = if status.locked {
            tracing::warn!(
                key,
                attempts = record.attempts,
                lock_ms = status.remaining_ms,
                "brute-force lockout engaged"
            );
            format!(
                "Too many failed attempts. Try again in {} seconds.",
                retry_after_secs(status.remaining_ms)
            )
        } else {
            let remaining = self.config.max_attempts.saturating_sub(record.attempts);
            tracing::debug!(key, attempts = record.attempts, "failed attempt recorded");
            format!("{remaining} attempts remaining")
        };

        FailureOutcome {
            locked: status.locked,
            remaining_ms: status.remaining_ms,
            attempts: status.attempts,
            message,
        }
    }

    pub fn clear(&self, key: &str) {
        if self.store.delete(key).is_some() {
            tracing::debug!(key, "failed attempts cleared");
        }
    }

    /// Pipeline view of [`check`](Self::check).
    pub fn decision(&self, key: &str) -> Decision {
        let status = self.check(key);
        if status.locked {
            let secs = retry_after_secs(status.remaining_ms);
            return Decision::deny(
                DenyReason::LockedOut,
                format!("Too many failed attempts. Try again in {secs} seconds."),
            )
            .with_retry_after(secs)
            .with_attempts_remaining(0);
        }
        Decision::allow()
            .with_attempts_remaining(self.config.max_attempts.saturating_sub(status.attempts))
    }

    /// Decision over several keys: the first locked key wins.
    pub fn decision_any<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Decision {
        let mut allowed = Decision::allow();
        for key in keys {
            let decision = self.decision(key);
            if !decision.allowed {
                return decision;
            }
            allowed.attempts_remaining = match (allowed.attempts_remaining, decision.attempts_remaining) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        allowed
    }

    pub fn tracked_keys(&self) -> usize {
        self.store.len()
    }
}

fn status_at(record: &AttemptRecord, now: i64) -> LockStatus {
    let remaining_ms = record
        .locked_until
        .map(|until| until - now)
        .filter(|remaining| *remaining > 0)
        .unwrap_or(0);
    LockStatus {
        locked: remaining_ms > 0,
        remaining_ms,
        attempts: record.attempts,
    }
}

impl<S: KeyStore<AttemptRecord> + 'static> Sweep for BruteForceGuard<S> {
    fn name(&self) -> &'static str {
        "brute_force"
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let cutoff = now - self.config.reset_interval_ms;
        // A lock may outlive the reset interval when max_delay exceeds it.
        self.store
            .keys()
            .into_iter()
            .filter(|key| {
                self.store
                    .remove_if(key, |record| {
                        record.last_attempt_at < cutoff
                            && record.locked_until.is_none_or(|until| until <= now)
                    })
                    .is_some()
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_util::ManualClock;

    fn guard() -> (BruteForceGuard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let guard = BruteForceGuard::with_store(
            BruteForceConfig::default(),
            MemoryStore::new(),
            clock.clone(),
        );
        (guard, clock)
    }

    #[test]
    fn counts_without_locking_below_threshold() {
        let (guard, _) = guard();
        for expected in 1..=4 {
            let outcome = guard.record_failure("ip:1.2.3.4");
            assert!(!outcome.locked);
            assert_eq!(outcome.attempts, expected);
            assert_eq!(outcome.message, format!("{} attempts remaining", 5 - expected));
        }
        assert!(!guard.check("ip:1.2.3.4").locked);
    }

    #[test]
    fn locks_after_max_attempts() {
        let (guard, _) = guard();
        for _ in 0..5 {
            guard.record_failure("acct:alice");
        }
        let status = guard.check("acct:alice");
        assert!(status.locked);
        assert!(status.remaining_ms > 0);
        assert_eq!(status.attempts, 5);
    }

    #[test]
    fn lockout_durations_double_then_cap() {
        let (guard, _) = guard();
        assert_eq!(guard.lockout_duration_ms(4), 0);
        assert_eq!(guard.lockout_duration_ms(5), 16_000);
        assert_eq!(guard.lockout_duration_ms(6), 32_000);
        assert_eq!(guard.lockout_duration_ms(10), 512_000);
        assert_eq!(guard.lockout_duration_ms(11), 900_000);
        assert_eq!(guard.lockout_duration_ms(200), 900_000);
    }

    #[test]
    fn recorded_lock_matches_formula() {
        let (guard, _) = guard();
        let mut last = None;
        for _ in 0..6 {
            last = Some(guard.record_failure("k"));
        }
        let outcome = last.expect("outcome");
        assert!(outcome.locked);
        assert_eq!(outcome.remaining_ms, 32_000);
        assert_eq!(outcome.message, "Too many failed attempts. Try again in 32 seconds.");
    }

    #[test]
    fn lock_expires_with_time() {
        let (guard, clock) = guard();
        for _ in 0..5 {
            guard.record_failure("k");
        }
        clock.advance(15_999);
        assert!(guard.check("k").locked);
        clock.advance(1);
        let status = guard.check("k");
        assert!(!status.locked);
        assert_eq!(status.attempts, 5);
    }

    #[test]
    fn clear_resets_everything() {
        let (guard, _) = guard();
        for _ in 0..7 {
            guard.record_failure("k");
        }
        guard.clear("k");
        let status = guard.check("k");
        assert_eq!(
            status,
            LockStatus {
                locked: false,
                remaining_ms: 0,
                attempts: 0
            }
        );
        guard.clear("never-seen");
    }

    #[test]
    fn check_does_not_mutate() {
        let (guard, _) = guard();
        guard.check("k");
        assert_eq!(guard.tracked_keys(), 0);
    }

    #[test]
    fn decision_reports_retry_hint() {
        let (guard, _) = guard();
        for _ in 0..5 {
            guard.record_failure("k");
        }
        let decision = guard.decision_any(["other", "k"]);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenyReason::LockedOut));
        assert_eq!(decision.retry_after_seconds, Some(16));

        let open = guard.decision_any(["other"]);
        assert!(open.allowed);
        assert_eq!(open.attempts_remaining, Some(5));
    }

    #[test]
    fn sweep_drops_only_idle_records() {
        let (guard, clock) = guard();
        guard.record_failure("old");
        clock.advance(3_000_000);
        guard.record_failure("fresh");
        clock.advance(700_000);
        assert_eq!(guard.sweep(), 1);
        assert_eq!(guard.check("old").attempts, 0);
        assert_eq!(guard.check("fresh").attempts, 1);
    }

    #[test]
    fn sweep_keeps_locks_longer_than_reset_interval() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let config = BruteForceConfig {
            max_attempts: 1,
            initial_delay_ms: 7_200_000,
            max_delay_ms: 7_200_000,
            reset_interval_ms: 3_600_000,
            ..BruteForceConfig::default()
        };
        let guard = BruteForceGuard::with_store(config, MemoryStore::new(), clock.clone());
        assert!(guard.record_failure("ip:9.9.9.9").locked);

        clock.advance(3_600_001);
        assert_eq!(guard.sweep(), 0);
        assert!(guard.check("ip:9.9.9.9").locked);

        clock.advance(3_600_000);
        assert_eq!(guard.sweep(), 1);
        assert!(!guard.check("ip:9.9.9.9").locked);
    }

    #[test]
    fn concurrent_failures_are_all_counted() {
        let (guard, _) = guard();
        let guard = Arc::new(guard);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let guard = guard.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        guard.record_failure("shared");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread");
        }
        assert_eq!(guard.check("shared").attempts, 1_000);
    }
}
