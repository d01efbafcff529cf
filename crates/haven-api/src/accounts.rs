//! Credential records consulted by the login and MFA routes.

use std::collections::HashMap;
use std::sync::Mutex;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use haven_core::{verify_backup_code, BackupCode, GuardError, MfaMethod};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AccountConfig {
    pub username: String,
    /// Argon2 PHC string.
    pub password_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mfa: Option<MfaMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totp_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backup_codes: Vec<String>,
}

#[derive(Debug)]
pub struct Account {
    pub username: String,
    password_hash: String,
    pub mfa: Option<MfaMethod>,
    totp_secret: Option<String>,
    backup_codes: Mutex<Vec<BackupCode>>,
}

impl Account {
    pub fn totp_secret(&self) -> Option<&str> {
        self.totp_secret.as_deref()
    }

    /// Spend one backup code from this account's pool.
    pub fn use_backup_code(&self, provided: &str) -> bool {
        let mut pool = match self.backup_codes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        verify_backup_code(&mut pool, provided)
    }

    pub fn unused_backup_codes(&self) -> usize {
        let pool = match self.backup_codes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pool.iter().filter(|code| !code.used).count()
    }
}

#[derive(Debug, Default)]
pub struct AccountDirectory {
    accounts: HashMap<String, Account>,
}

impl AccountDirectory {
    pub fn from_config(configs: &[AccountConfig]) -> Result<Self, GuardError> {
        let mut accounts = HashMap::new();
        for config in configs {
            let username = normalize_username(&config.username);
            if username.is_empty() {
                return Err(GuardError::Configuration("account with empty username".into()));
            }
            PasswordHash::new(&config.password_hash).map_err(|e| {
                GuardError::Configuration(format!("account {username}: bad password hash: {e}"))
            })?;
            if config.mfa == Some(MfaMethod::Totp) && config.totp_secret.is_none() {
                return Err(GuardError::Configuration(format!(
                    "account {username}: totp mfa requires totp_secret"
                )));
            }
            let mfa = config
                .mfa
                .or(config.totp_secret.as_ref().map(|_| MfaMethod::Totp));
            let backup_codes = config
                .backup_codes
                .iter()
                .map(|code| BackupCode {
                    code: code.trim().to_ascii_uppercase(),
                    used: false,
                    created_at: 0,
                })
                .collect();
            let account = Account {
                username: username.clone(),
                password_hash: config.password_hash.clone(),
                mfa,
                totp_secret: config.totp_secret.clone(),
                backup_codes: Mutex::new(backup_codes),
            };
            if accounts.insert(username.clone(), account).is_some() {
                return Err(GuardError::Configuration(format!(
                    "duplicate account {username}"
                )));
            }
        }
        Ok(Self { accounts })
    }

    pub fn get(&self, username: &str) -> Option<&Account> {
        self.accounts.get(&normalize_username(username))
    }

    /// The account, if the password matches.
    pub fn authenticate(&self, username: &str, password: &str) -> Option<&Account> {
        let account = self.get(username)?;
        verify_password(password, &account.password_hash).then_some(account)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

pub fn normalize_username(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}
