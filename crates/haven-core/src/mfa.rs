//! Multi-factor challenge sessions and code verification.
//!
//! A session moves from created through zero or more failed attempts to
//! either locked (attempt ceiling reached, session deleted) or verified and
//! then completed (session deleted). Expiry can end any live session; an
//! expired session is deleted the next time it is touched.

use std::sync::Arc;

use haven_util::token::{constant_time_equal, random_code_from, random_numeric_code, random_token_hex};
use haven_util::{Clock, KeyStore, MemoryStore, SystemClock};
use serde::{Deserialize, Serialize};
use totp_rs::{Algorithm, Secret, TOTP};

use crate::decision::{Decision, DenyReason};
use crate::error::GuardError;
use crate::sweeper::Sweep;

const TOTP_DIGITS: usize = 6;
const TOTP_STEP_SECS: u64 = 30;
const OTP_DIGITS: u32 = 6;
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MfaConfig {
    /// Issuer shown by authenticator apps.
    pub issuer: String,
    pub code_expiry_ms: i64,
    pub session_expiry_ms: i64,
    pub max_attempts: u32,
    pub backup_code_count: usize,
    pub backup_code_length: usize,
    /// Adjacent 30-second steps accepted on each side of the current one.
    pub drift_window: u8,
    pub sweep_interval_ms: u64,
}

impl Default for MfaConfig {
    fn default() -> Self {
        Self {
            issuer: "Haven".to_string(),
            code_expiry_ms: 300_000,
            session_expiry_ms: 900_000,
            max_attempts: 3,
            backup_code_count: 10,
            backup_code_length: 8,
            drift_window: 1,
            sweep_interval_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MfaMethod {
    Totp,
    Sms,
    Email,
}

impl MfaMethod {
    /// Whether the code for this method is delivered out of band.
    pub fn uses_otp(self) -> bool {
        matches!(self, MfaMethod::Sms | MfaMethod::Email)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OtpCode {
    pub code: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MfaSession {
    pub session_id: String,
    pub subject_id: String,
    pub method: MfaMethod,
    pub attempts: u32,
    pub max_attempts: u32,
    pub verified: bool,
    pub created_at: i64,
    pub expires_at: i64,
    /// Out-of-band code issued for sms/email sessions.
    pub otp: Option<OtpCode>,
}

impl MfaSession {
    fn expired_at(&self, now: i64) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackupCode {
    pub code: String,
    pub used: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TotpSetup {
    /// Base32 shared secret.
    pub secret: String,
    pub provisioning_uri: String,
    /// PNG data URL of the provisioning QR code.
    pub qr_image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStart {
    pub session_id: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub success: bool,
    pub attempts_remaining: u32,
    pub locked: bool,
    pub message: String,
    pub reason: Option<DenyReason>,
}

impl AttemptOutcome {
    pub fn to_decision(&self) -> Decision {
        let reason = self.reason.unwrap_or(DenyReason::InvalidToken);
        Decision::deny(reason, self.message.clone()).with_attempts_remaining(self.attempts_remaining)
    }
}

pub struct MfaManager<S = MemoryStore<MfaSession>> {
    config: MfaConfig,
    sessions: S,
    /// Ids of sessions deleted for exceeding the attempt ceiling, kept until
    /// their original expiry so late attempts still report the lockout.
    locked_out: MemoryStore<i64>,
    clock: Arc<dyn Clock>,
}

impl MfaManager {
    pub fn new(config: MfaConfig) -> Self {
        Self::with_store(config, MemoryStore::new(), Arc::new(SystemClock))
    }
}

impl<S: KeyStore<MfaSession>> MfaManager<S> {
    pub fn with_store(config: MfaConfig, sessions: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            sessions,
            locked_out: MemoryStore::new(),
            clock,
        }
    }

    pub fn config(&self) -> &MfaConfig {
        &self.config
    }

    // ── TOTP ────────────────────────────────────────────────────────────────

    pub fn generate_totp_secret(&self, subject_label: &str) -> Result<TotpSetup, GuardError> {
        let secret = Secret::generate_secret()
            .to_bytes()
            .map_err(|e| GuardError::Totp(format!("secret generation failed: {e:?}")))?;
        let totp = TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            self.config.drift_window,
            TOTP_STEP_SECS,
            secret,
            Some(self.config.issuer.clone()),
            subject_label.to_string(),
        )
        .map_err(|e| GuardError::Totp(format!("invalid totp parameters: {e}")))?;

        let qr = totp
            .get_qr_base64()
            .map_err(|e| GuardError::Totp(format!("qr generation failed: {e}")))?;

        Ok(TotpSetup {
            secret: totp.get_secret_base32(),
            provisioning_uri: totp.get_url(),
            qr_image: format!("data:image/png;base64,{qr}"),
        })
    }

    /// Check `code` against the configured drift window.
    pub fn verify_totp_code(&self, secret: &str, code: &str) -> bool {
        self.verify_totp_code_with_drift(secret, code, self.config.drift_window)
    }

    pub fn verify_totp_code_with_drift(&self, secret: &str, code: &str, drift_window: u8) -> bool {
        let Ok(totp) = build_totp(secret, drift_window) else {
            return false;
        };
        let now_secs = (self.clock.now_ms().max(0) / 1000) as u64;
        totp.check(code, now_secs)
    }

    // ── Out-of-band codes ───────────────────────────────────────────────────

    pub fn generate_otp_code(&self) -> OtpCode {
        OtpCode {
            code: random_numeric_code(OTP_DIGITS),
            expires_at: self.clock.now_ms() + self.config.code_expiry_ms,
        }
    }

    pub fn verify_otp_code(&self, provided: &str, stored: &str, expires_at: i64) -> bool {
        if self.clock.now_ms() > expires_at {
            return false;
        }
        constant_time_equal(provided, stored)
    }

    // ── Backup codes ────────────────────────────────────────────────────────

    /// A fresh pool of `backup_code_count` unused codes.
    pub fn generate_backup_codes(&self) -> Vec<BackupCode> {
        self.generate_backup_codes_n(self.config.backup_code_count)
    }

    pub fn generate_backup_codes_n(&self, count: usize) -> Vec<BackupCode> {
        let now = self.clock.now_ms();
        (0..count)
            .map(|_| BackupCode {
                code: random_code_from(BACKUP_CODE_ALPHABET, self.config.backup_code_length),
                used: false,
                created_at: now,
            })
            .collect()
    }

    // ── Challenge sessions ──────────────────────────────────────────────────

    pub fn create_session(&self, subject_id: &str, method: MfaMethod) -> SessionStart {
        let now = self.clock.now_ms();
        let session_id = random_token_hex(32);
        let session = MfaSession {
            session_id: session_id.clone(),
            subject_id: subject_id.to_owned(),
            method,
            attempts: 0,
            max_attempts: self.config.max_attempts,
            verified: false,
            created_at: now,
            expires_at: now + self.config.session_expiry_ms,
            otp: None,
        };
        self.sessions.set(&session_id, session);
        tracing::debug!(subject_id, ?method, "mfa session created");
        SessionStart {
            session_id,
            expires_in: (self.config.session_expiry_ms.max(0) / 1000) as u64,
        }
    }

    /// Live session by id. Expired sessions are deleted and reported absent.
    pub fn get_session(&self, session_id: &str) -> Option<MfaSession> {
        let now = self.clock.now_ms();
        if self
            .sessions
            .remove_if(session_id, |session| session.expired_at(now))
            .is_some()
        {
            return None;
        }
        self.sessions.get(session_id)
    }

    /// Issue and remember a fresh out-of-band code for an sms/email session.
    pub fn issue_session_otp(&self, session_id: &str) -> Result<OtpCode, GuardError> {
        let now = self.clock.now_ms();
        let otp = self.generate_otp_code();
        let issued = self
            .sessions
            .modify(session_id, |session| {
                if session.expired_at(now) {
                    return Err(GuardError::SessionExpired);
                }
                session.otp = Some(otp.clone());
                Ok(())
            })
            .ok_or(GuardError::SessionNotFound)?;
        if let Err(err) = issued {
            self.expire(session_id, now);
            return Err(err);
        }
        Ok(otp)
    }

    /// Check a code delivered for the session's out-of-band method.
    pub fn verify_session_otp(&self, session_id: &str, provided: &str) -> bool {
        self.get_session(session_id)
            .and_then(|session| session.otp)
            .is_some_and(|otp| self.verify_otp_code(provided, &otp.code, otp.expires_at))
    }

    /// Count one failed verification. Reaching the ceiling deletes the session.
    pub fn record_attempt(&self, session_id: &str) -> AttemptOutcome {
        match self.reserve_attempt(session_id) {
            Ok(session) => self.reject_attempt(&session),
            Err(outcome) => outcome,
        }
    }

    /// Claim one verification attempt before a code is checked.
    ///
    /// The attempt is counted up front under the session's lock, so at most
    /// `max_attempts` codes are ever evaluated for a session no matter how
    /// many requests race on it. On `Err` the caller must not check the code.
    pub fn reserve_attempt(&self, session_id: &str) -> Result<MfaSession, AttemptOutcome> {
        let now = self.clock.now_ms();
        if self.locked_out.get(session_id).is_some() {
            return Err(max_attempts_outcome());
        }

        let claim = self.sessions.modify(session_id, |session| {
            if session.expired_at(now) {
                return Claim::Expired;
            }
            if session.attempts >= session.max_attempts {
                return Claim::Exhausted(session.clone());
            }
            session.attempts += 1;
            Claim::Granted(session.clone())
        });

        match claim {
            Some(Claim::Granted(session)) => Ok(session),
            Some(Claim::Exhausted(session)) => Err(self.lock_session(&session)),
            Some(Claim::Expired) => {
                self.expire(session_id, now);
                Err(missing_session_outcome())
            }
            None if self.locked_out.get(session_id).is_some() => Err(max_attempts_outcome()),
            None => Err(missing_session_outcome()),
        }
    }

    /// Settle a reserved attempt whose code did not verify.
    pub fn reject_attempt(&self, session: &MfaSession) -> AttemptOutcome {
        if session.attempts >= session.max_attempts {
            return self.lock_session(session);
        }
        let remaining = session.max_attempts - session.attempts;
        AttemptOutcome {
            success: true,
            attempts_remaining: remaining,
            locked: false,
            message: format!("Invalid code. {remaining} attempts remaining."),
            reason: Some(DenyReason::InvalidToken),
        }
    }

    fn lock_session(&self, session: &MfaSession) -> AttemptOutcome {
        self.locked_out.set(&session.session_id, session.expires_at);
        if self
            .sessions
            .remove_if(&session.session_id, |s| {
                // A session verified by the final attempt is left to complete.
                !s.verified && s.attempts >= s.max_attempts
            })
            .is_some()
        {
            tracing::warn!(
                subject_id = %session.subject_id,
                attempts = session.attempts,
                "mfa session locked after too many attempts"
            );
        }
        max_attempts_outcome()
    }

    pub fn mark_verified(&self, session_id: &str) -> Result<(), GuardError> {
        let now = self.clock.now_ms();
        let marked = self
            .sessions
            .modify(session_id, |session| {
                if session.expired_at(now) {
                    return false;
                }
                session.verified = true;
                true
            })
            .ok_or(GuardError::SessionNotFound)?;
        if !marked {
            self.expire(session_id, now);
            return Err(GuardError::SessionExpired);
        }
        Ok(())
    }

    /// Finish a verified session, removing it. Unverified sessions stay intact.
    pub fn complete_session(&self, session_id: &str) -> Result<MfaSession, GuardError> {
        let now = self.clock.now_ms();
        if let Some(session) = self
            .sessions
            .remove_if(session_id, |s| s.verified && !s.expired_at(now))
        {
            tracing::debug!(subject_id = %session.subject_id, "mfa session completed");
            return Ok(session);
        }
        match self.sessions.get(session_id) {
            None => Err(GuardError::SessionNotFound),
            Some(session) if session.expired_at(now) => {
                self.expire(session_id, now);
                Err(GuardError::SessionExpired)
            }
            Some(_) => Err(GuardError::SessionNotVerified),
        }
    }

    pub fn clear_session(&self, session_id: &str) -> bool {
        self.sessions.delete(session_id).is_some()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn expire(&self, session_id: &str, now: i64) {
        self.sessions.remove_if(session_id, |s| s.expired_at(now));
    }
}

/// Marks the first unused code in `pool` matching `provided` (ignoring case) as used.
pub fn verify_backup_code(pool: &mut [BackupCode], provided: &str) -> bool {
    let provided = provided.trim().to_ascii_uppercase();
    if provided.is_empty() {
        return false;
    }
    match pool
        .iter_mut()
        .find(|entry| !entry.used && constant_time_equal(&entry.code.to_ascii_uppercase(), &provided))
    {
        Some(entry) => {
            entry.used = true;
            true
        }
        None => false,
    }
}

fn build_totp(secret_base32: &str, drift_window: u8) -> Result<TOTP, GuardError> {
    let secret = Secret::Encoded(secret_base32.trim().to_string())
        .to_bytes()
        .map_err(|e| GuardError::Totp(format!("invalid secret: {e:?}")))?;
    TOTP::new(
        Algorithm::SHA1,
        TOTP_DIGITS,
        drift_window,
        TOTP_STEP_SECS,
        secret,
        None,
        String::new(),
    )
    .map_err(|e| GuardError::Totp(format!("invalid totp parameters: {e}")))
}

enum Claim {
    Granted(MfaSession),
    Exhausted(MfaSession),
    Expired,
}

fn max_attempts_outcome() -> AttemptOutcome {
    AttemptOutcome {
        success: false,
        attempts_remaining: 0,
        locked: true,
        message: "Maximum verification attempts exceeded. Start a new challenge.".to_string(),
        reason: Some(DenyReason::MaxMfaAttemptsExceeded),
    }
}

fn missing_session_outcome() -> AttemptOutcome {
    AttemptOutcome {
        success: false,
        attempts_remaining: 0,
        locked: false,
        message: "MFA session not found or expired".to_string(),
        reason: Some(DenyReason::SessionExpired),
    }
}

impl<S: KeyStore<MfaSession> + 'static> Sweep for MfaManager<S> {
    fn name(&self) -> &'static str {
        "mfa"
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let sessions = self
            .sessions
            .keys()
            .into_iter()
            .filter(|id| {
                self.sessions
                    .remove_if(id, |session| session.expired_at(now))
                    .is_some()
            })
            .count();
        let tombstones = self
            .locked_out
            .keys()
            .into_iter()
            .filter(|id| self.locked_out.remove_if(id, |expires_at| now > *expires_at).is_some())
            .count();
        sessions + tombstones
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_util::ManualClock;

    // RFC 6238 SHA1 test key "12345678901234567890".
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    fn manager_at(start_ms: i64) -> (MfaManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let manager = MfaManager::with_store(MfaConfig::default(), MemoryStore::new(), clock.clone());
        (manager, clock)
    }

    fn manager() -> (MfaManager, Arc<ManualClock>) {
        manager_at(1_700_000_000_000)
    }

    #[test]
    fn rfc_vector_verifies_within_drift() {
        let (manager, clock) = manager_at(59_000);
        assert!(manager.verify_totp_code(RFC_SECRET, "287082"));
        clock.set(59_000 + 30_000);
        assert!(manager.verify_totp_code(RFC_SECRET, "287082"));
        assert!(!manager.verify_totp_code_with_drift(RFC_SECRET, "287082", 0));
        clock.set(59_000 + 60_000);
        assert!(!manager.verify_totp_code(RFC_SECRET, "287082"));
    }

    #[test]
    fn totp_rejects_partial_and_garbage_codes() {
        let (manager, _) = manager_at(59_000);
        assert!(!manager.verify_totp_code(RFC_SECRET, "28708"));
        assert!(!manager.verify_totp_code(RFC_SECRET, "2870820"));
        assert!(!manager.verify_totp_code("not base32!", "287082"));
    }

    #[test]
    fn fresh_secret_verifies_current_code_and_rejects_zeros() {
        let (manager, clock) = manager();
        let now_secs = (clock.now_ms() / 1000) as u64;
        let setup = loop {
            let setup = manager.generate_totp_secret("alice@example.com").expect("setup");
            let totp = build_totp(&setup.secret, 1).expect("totp");
            let window = [now_secs - 30, now_secs, now_secs + 30];
            if window.iter().all(|t| totp.generate(*t) != "000000") {
                break setup;
            }
        };
        let current = build_totp(&setup.secret, 1).expect("totp").generate(now_secs);
        assert!(manager.verify_totp_code(&setup.secret, &current));
        assert!(!manager.verify_totp_code(&setup.secret, "000000"));
        assert!(setup.provisioning_uri.starts_with("otpauth://totp/"));
        assert!(setup.provisioning_uri.contains("issuer=Haven"));
        assert!(setup.qr_image.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn otp_codes_expire_after_five_minutes() {
        let (manager, clock) = manager();
        let otp = manager.generate_otp_code();
        assert_eq!(otp.code.len(), 6);
        assert_eq!(otp.expires_at, clock.now_ms() + 300_000);
        assert!(manager.verify_otp_code(&otp.code, &otp.code, otp.expires_at));
        clock.advance(300_000);
        assert!(manager.verify_otp_code(&otp.code, &otp.code, otp.expires_at));
        clock.advance(1);
        assert!(!manager.verify_otp_code(&otp.code, &otp.code, otp.expires_at));
    }

    #[test]
    fn otp_requires_exact_match() {
        let (manager, clock) = manager();
        let expires = clock.now_ms() + 1_000;
        assert!(!manager.verify_otp_code("12345", "123456", expires));
        assert!(!manager.verify_otp_code("123457", "123456", expires));
    }

    #[test]
    fn backup_codes_are_single_use_and_case_insensitive() {
        let (manager, _) = manager();
        let mut pool = manager.generate_backup_codes();
        assert_eq!(pool.len(), 10);
        assert!(pool.iter().all(|c| c.code.len() == 8 && !c.used));

        let code = pool[3].code.to_ascii_lowercase();
        assert!(verify_backup_code(&mut pool, &code));
        assert!(pool[3].used);
        assert!(!verify_backup_code(&mut pool, &code));
        assert!(!verify_backup_code(&mut pool, "NOPE1234"));
        assert!(!verify_backup_code(&mut pool, ""));
    }

    #[test]
    fn three_failures_lock_and_delete_session() {
        let (manager, _) = manager();
        let start = manager.create_session("user-1", MfaMethod::Totp);
        assert_eq!(start.expires_in, 900);

        let first = manager.record_attempt(&start.session_id);
        assert!(first.success && !first.locked);
        assert_eq!(first.attempts_remaining, 2);

        let second = manager.record_attempt(&start.session_id);
        assert_eq!(second.attempts_remaining, 1);
        assert!(manager.get_session(&start.session_id).is_some());

        let third = manager.record_attempt(&start.session_id);
        assert!(third.locked);
        assert!(manager.get_session(&start.session_id).is_none());

        let fourth = manager.record_attempt(&start.session_id);
        assert!(fourth.locked);
        assert!(fourth.message.contains("Maximum verification attempts"));
        assert_eq!(fourth.reason, Some(DenyReason::MaxMfaAttemptsExceeded));
        assert!(manager.get_session(&start.session_id).is_none());
    }

    #[test]
    fn unknown_session_is_not_reported_locked() {
        let (manager, _) = manager();
        let outcome = manager.record_attempt("missing");
        assert!(!outcome.locked);
        assert!(!outcome.success);
        assert_eq!(outcome.reason, Some(DenyReason::SessionExpired));
    }

    #[test]
    fn complete_requires_verification() {
        let (manager, _) = manager();
        let start = manager.create_session("user-1", MfaMethod::Email);
        assert!(matches!(
            manager.complete_session(&start.session_id),
            Err(GuardError::SessionNotVerified)
        ));
        assert!(manager.get_session(&start.session_id).is_some());

        manager.mark_verified(&start.session_id).expect("mark verified");
        let done = manager.complete_session(&start.session_id).expect("complete");
        assert_eq!(done.subject_id, "user-1");
        assert!(manager.get_session(&start.session_id).is_none());
        assert!(matches!(
            manager.complete_session(&start.session_id),
            Err(GuardError::SessionNotFound)
        ));
    }

    #[test]
    fn expired_sessions_are_deleted_on_access() {
        let (manager, clock) = manager();
        let start = manager.create_session("user-1", MfaMethod::Sms);
        clock.advance(900_001);
        assert!(matches!(
            manager.mark_verified(&start.session_id),
            Err(GuardError::SessionExpired)
        ));
        assert_eq!(manager.active_sessions(), 0);
        assert!(!manager.record_attempt(&start.session_id).locked);
    }

    #[test]
    fn session_otp_round_trip() {
        let (manager, clock) = manager();
        let start = manager.create_session("user-1", MfaMethod::Email);
        let otp = manager.issue_session_otp(&start.session_id).expect("otp");
        assert!(manager.verify_session_otp(&start.session_id, &otp.code));
        clock.advance(300_001);
        assert!(!manager.verify_session_otp(&start.session_id, &otp.code));
        assert!(matches!(
            manager.issue_session_otp("missing"),
            Err(GuardError::SessionNotFound)
        ));
    }

    #[test]
    fn clear_session_removes_it() {
        let (manager, _) = manager();
        let start = manager.create_session("user-1", MfaMethod::Totp);
        assert!(manager.clear_session(&start.session_id));
        assert!(!manager.clear_session(&start.session_id));
    }

    #[test]
    fn sweep_removes_expired_sessions_and_tombstones() {
        let (manager, clock) = manager();
        let stale = manager.create_session("a", MfaMethod::Totp);
        for _ in 0..3 {
            manager.record_attempt(&stale.session_id);
        }
        manager.create_session("b", MfaMethod::Totp);
        clock.advance(600_000);
        let live = manager.create_session("c", MfaMethod::Totp);
        clock.advance(300_001);
        assert_eq!(manager.sweep(), 2);
        assert_eq!(manager.active_sessions(), 1);
        assert!(manager.get_session(&live.session_id).is_some());
    }

    #[test]
    fn backup_pool_size_follows_config() {
        let config = MfaConfig {
            backup_code_count: 4,
            backup_code_length: 10,
            ..MfaConfig::default()
        };
        let manager = MfaManager::with_store(
            config,
            MemoryStore::new(),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        );
        let pool = manager.generate_backup_codes();
        assert_eq!(pool.len(), 4);
        assert!(pool.iter().all(|c| c.code.len() == 10));
        assert_eq!(manager.generate_backup_codes_n(2).len(), 2);
    }

    #[test]
    fn racing_verifications_never_exceed_the_ceiling() {
        let (manager, _) = manager();
        let manager = Arc::new(manager);
        let start = manager.create_session("user-1", MfaMethod::Totp);
        let barrier = Arc::new(std::sync::Barrier::new(10));
        let evaluated = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let manager = manager.clone();
                let barrier = barrier.clone();
                let evaluated = evaluated.clone();
                let session_id = start.session_id.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    match manager.reserve_attempt(&session_id) {
                        Ok(session) => {
                            evaluated.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            manager.reject_attempt(&session)
                        }
                        Err(outcome) => outcome,
                    }
                })
            })
            .collect();
        let outcomes: Vec<AttemptOutcome> = handles
            .into_iter()
            .map(|h| h.join().expect("worker thread"))
            .collect();

        assert_eq!(evaluated.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(outcomes.iter().filter(|o| o.locked).count(), 8);
        assert!(manager.get_session(&start.session_id).is_none());
        assert!(manager.reserve_attempt(&start.session_id).is_err());
    }

    #[test]
    fn reserved_attempt_at_ceiling_can_still_verify() {
        let (manager, _) = manager();
        let start = manager.create_session("user-1", MfaMethod::Totp);
        manager.record_attempt(&start.session_id);
        manager.record_attempt(&start.session_id);

        let last = manager.reserve_attempt(&start.session_id).expect("last attempt");
        assert_eq!(last.attempts, 3);
        manager.mark_verified(&start.session_id).expect("mark verified");

        let late = manager.record_attempt(&start.session_id);
        assert!(late.locked);
        assert!(manager.complete_session(&start.session_id).is_ok());
    }
}
