use std::fs;
use std::net::IpAddr;

use anyhow::{Context, Result};
use haven_api::accounts::AccountConfig;
use haven_api::extract::ProxyPolicy;
use haven_api::ApiSettings;
use haven_core::{BruteForceConfig, CsrfConfig, GuardConfig, MfaConfig, MfaManager, RateLimitSettings};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub brute_force: BruteForceConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub mfa: MfaConfig,
    #[serde(default)]
    pub csrf: CsrfConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    /// Credential directory used by the login routes.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_true")]
    pub trust_forwarded_for: bool,
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
    /// Mark the CSRF cookie `Secure`. Enable behind TLS.
    #[serde(default)]
    pub cookie_secure: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            trust_forwarded_for: true,
            trusted_proxies: Vec::new(),
            cookie_secure: false,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AdminConfig {
    /// Value expected in `x-haven-admin-token`. Admin routes are off when unset.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_bind_address() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_true() -> bool {
    true
}

fn generate_config_template(config: &Config, admin_token: &str) -> String {
    let rl = &config.rate_limit;
    format!(
        r#"# Haven Configuration
# Generated automatically on first run. Edit as needed.
# All durations are in milliseconds.

[server]
bind_address = "{bind_address}"
# Honor the left-most X-Forwarded-For entry when identifying clients.
trust_forwarded_for = {trust_forwarded_for}
# When non-empty, only these peers may supply X-Forwarded-For.
trusted_proxies = []
cookie_secure = {cookie_secure}

[brute_force]
max_attempts = {bf_max_attempts}
initial_delay_ms = {bf_initial}
max_delay_ms = {bf_max}
reset_interval_ms = {bf_reset}
sweep_interval_ms = {bf_sweep}

[rate_limit]
whitelist = []
blacklist = []

[rate_limit.auth]
max_tokens = {auth_tokens}
window_ms = {auth_window}

[rate_limit.api]
max_tokens = {api_tokens}
window_ms = {api_window}

[rate_limit.general]
max_tokens = {general_tokens}
window_ms = {general_window}

[mfa]
issuer = "{issuer}"
code_expiry_ms = {code_expiry}
session_expiry_ms = {session_expiry}
max_attempts = {mfa_attempts}
backup_code_count = {backup_count}
drift_window = {drift_window}

[csrf]
token_expiry_ms = {csrf_expiry}
# Consume tokens on first use by state-changing requests.
single_use = {single_use}

[admin]
token = "{admin_token}"

# Accounts for the login routes. Generate hashes with
# `haven-server --hash-password <PASSWORD>`.
# [[accounts]]
# username = "alice"
# password_hash = "$argon2id$v=19$..."
# totp_secret = "BASE32SECRET"
# backup_codes = ["ABCD2345"]   # or `haven-server --backup-codes`
"#,
        bind_address = config.server.bind_address,
        trust_forwarded_for = config.server.trust_forwarded_for,
        cookie_secure = config.server.cookie_secure,
        bf_max_attempts = config.brute_force.max_attempts,
        bf_initial = config.brute_force.initial_delay_ms,
        bf_max = config.brute_force.max_delay_ms,
        bf_reset = config.brute_force.reset_interval_ms,
        bf_sweep = config.brute_force.sweep_interval_ms,
        auth_tokens = rl.auth.max_tokens,
        auth_window = rl.auth.window_ms,
        api_tokens = rl.api.max_tokens,
        api_window = rl.api.window_ms,
        general_tokens = rl.general.max_tokens,
        general_window = rl.general.window_ms,
        issuer = config.mfa.issuer,
        code_expiry = config.mfa.code_expiry_ms,
        session_expiry = config.mfa.session_expiry_ms,
        mfa_attempts = config.mfa.max_attempts,
        backup_count = config.mfa.backup_code_count,
        drift_window = config.mfa.drift_window,
        csrf_expiry = config.csrf.token_expiry_ms,
        single_use = config.csrf.single_use,
        admin_token = admin_token,
    )
}

/// `backup_codes = [...]` line holding a fresh pool sized by `[mfa]`.
pub fn backup_codes_entry(mfa: &MfaConfig) -> String {
    let codes: Vec<String> = MfaManager::new(mfa.clone())
        .generate_backup_codes()
        .into_iter()
        .map(|code| format!("\"{}\"", code.code))
        .collect();
    format!("backup_codes = [{}]", codes.join(", "))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("reading config file '{path}'"))?;
            toml::from_str(&content).with_context(|| format!("parsing config file '{path}'"))?
        } else {
            tracing::info!(
                "Config file not found at '{}', generating defaults...",
                path
            );
            let mut config = Config::default();
            let admin_token = haven_util::token::random_token_hex(32);

            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, generate_config_template(&config, &admin_token))?;
            config.admin.token = Some(admin_token);
            tracing::info!("Generated default config at '{}'", path);
            config
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("HAVEN_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Ok(value) = std::env::var("HAVEN_ADMIN_TOKEN") {
            self.admin.token = Some(value).filter(|v| !v.trim().is_empty());
        }
        if let Ok(value) = std::env::var("HAVEN_TRUST_FORWARDED_FOR") {
            match parse_bool(&value) {
                Some(parsed) => self.server.trust_forwarded_for = parsed,
                None => tracing::warn!(
                    "Ignoring invalid HAVEN_TRUST_FORWARDED_FOR value '{}'; expected true or false",
                    value
                ),
            }
        }
        if let Ok(value) = std::env::var("HAVEN_CSRF_SINGLE_USE") {
            match parse_bool(&value) {
                Some(parsed) => self.csrf.single_use = parsed,
                None => tracing::warn!(
                    "Ignoring invalid HAVEN_CSRF_SINGLE_USE value '{}'; expected true or false",
                    value
                ),
            }
        }
        if let Ok(value) = std::env::var("HAVEN_BRUTE_FORCE_MAX_ATTEMPTS") {
            match value.trim().parse::<u32>() {
                Ok(parsed) if parsed > 0 => self.brute_force.max_attempts = parsed,
                _ => tracing::warn!(
                    "Ignoring invalid HAVEN_BRUTE_FORCE_MAX_ATTEMPTS value '{}'; expected a positive integer",
                    value
                ),
            }
        }
    }

    pub fn guard_config(&self) -> GuardConfig {
        GuardConfig {
            brute_force: self.brute_force.clone(),
            rate_limit: self.rate_limit.clone(),
            mfa: self.mfa.clone(),
            csrf: self.csrf.clone(),
        }
    }

    pub fn api_settings(&self) -> ApiSettings {
        ApiSettings {
            proxy: ProxyPolicy {
                trust_forwarded_for: self.server.trust_forwarded_for,
                trusted_proxies: self.server.trusted_proxies.clone(),
            },
            admin_token: self.admin.token.clone(),
            cookie_secure: self.server.cookie_secure,
        }
    }
}
