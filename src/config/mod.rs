//! Configuration loading for the account slot service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `SLOTS_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf};

use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "SLOTS_";

/// Plan recorded on slots when the caller does not name one.
pub const DEFAULT_PLAN: &str = "free";

/// Application configuration derived from `SLOTS_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<Vec<u8>>,
    /// HMAC key for signed transfer references
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_signing_key: Option<Vec<u8>>,
    #[serde(default)]
    pub auto_migrate: bool,
    #[serde(default)]
    pub slots: SlotPolicyConfig,
    #[serde(default)]
    pub transfers: TransferConfig,
}

/// Lifetime quota policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SlotPolicyConfig {
    /// Lifetime slots per (owner, provider) when the plan has no override
    ///
    /// Environment variable: `SLOTS_DEFAULT_LIFETIME_QUOTA`
    #[serde(default = "default_lifetime_quota")]
    pub default_lifetime_quota: u32,

    /// Per-plan overrides, parsed from `plan=n,plan=n`
    ///
    /// Environment variable: `SLOTS_PLAN_QUOTAS`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plan_quotas: BTreeMap<String, u32>,
}

impl Default for SlotPolicyConfig {
    fn default() -> Self {
        Self {
            default_lifetime_quota: default_lifetime_quota(),
            plan_quotas: BTreeMap::new(),
        }
    }
}

impl SlotPolicyConfig {
    /// Lifetime quota that applies to `plan`.
    pub fn quota_for(&self, plan: &str) -> u32 {
        self.plan_quotas
            .get(plan)
            .copied()
            .unwrap_or(self.default_lifetime_quota)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_lifetime_quota == 0 {
            return Err(ConfigError::InvalidLifetimeQuota {
                plan: DEFAULT_PLAN.to_string(),
                value: 0,
            });
        }
        if let Some((plan, value)) = self.plan_quotas.iter().find(|(_, value)| **value == 0) {
            return Err(ConfigError::InvalidLifetimeQuota {
                plan: plan.clone(),
                value: *value,
            });
        }
        Ok(())
    }
}

/// Staged transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TransferConfig {
    /// Lifetime of a staged transfer request (default: 600)
    ///
    /// Environment variable: `SLOTS_TRANSFER_TTL_SECONDS`
    #[serde(default = "default_transfer_ttl_seconds")]
    pub ttl_seconds: u64,

    /// Interval of the expired-request sweeper (default: 60)
    ///
    /// Environment variable: `SLOTS_TRANSFER_SWEEP_SECONDS`
    #[serde(default = "default_transfer_sweep_seconds")]
    pub sweep_interval_seconds: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_transfer_ttl_seconds(),
            sweep_interval_seconds: default_transfer_sweep_seconds(),
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(60..=3600).contains(&self.ttl_seconds) {
            return Err(ConfigError::InvalidTransferTtl {
                value: self.ttl_seconds,
            });
        }
        if !(5..=3600).contains(&self.sweep_interval_seconds) {
            return Err(ConfigError::InvalidTransferSweepInterval {
                value: self.sweep_interval_seconds,
            });
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            operator_tokens: Vec::new(),
            crypto_key: None,
            transfer_signing_key: None,
            auto_migrate: false,
            slots: SlotPolicyConfig::default(),
            transfers: TransferConfig::default(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec!["[REDACTED]".to_string()];
        }
        if config.crypto_key.is_some() {
            config.crypto_key = Some(b"[REDACTED]".to_vec());
        }
        if config.transfer_signing_key.is_some() {
            config.transfer_signing_key = Some(b"[REDACTED]".to_vec());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.crypto_key {
            Some(ref key) if key.len() != 32 => {
                return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
            }
            Some(_) => {}
            None => return Err(ConfigError::MissingCryptoKey),
        }

        match self.transfer_signing_key {
            Some(ref key) if key.len() < 32 => {
                return Err(ConfigError::InvalidSigningKeyLength { length: key.len() });
            }
            Some(_) => {}
            None => return Err(ConfigError::MissingSigningKey),
        }

        if self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }

        self.slots.validate()?;
        self.transfers.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "postgresql://localhost:5432/account_slots".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_lifetime_quota() -> u32 {
    3
}

fn default_transfer_ttl_seconds() -> u64 {
    600 // 10 minutes
}

fn default_transfer_sweep_seconds() -> u64 {
    60
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("no operator tokens configured; set SLOTS_OPERATOR_TOKEN or SLOTS_OPERATOR_TOKENS")]
    MissingOperatorTokens,
    #[error("crypto key is missing; set SLOTS_CRYPTO_KEY environment variable")]
    MissingCryptoKey,
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
    #[error("transfer signing key is missing; set SLOTS_TRANSFER_SIGNING_KEY environment variable")]
    MissingSigningKey,
    #[error("transfer signing key is invalid base64: {error}")]
    InvalidSigningKeyBase64 { error: String },
    #[error("transfer signing key must decode to at least 32 bytes, got {length} bytes")]
    InvalidSigningKeyLength { length: usize },
    #[error("invalid plan quota entry '{entry}'; expected plan=n")]
    InvalidPlanQuotaEntry { entry: String },
    #[error("lifetime quota for plan '{plan}' must be at least 1, got {value}")]
    InvalidLifetimeQuota { plan: String, value: u32 },
    #[error("transfer ttl must be between 60 and 3600 seconds, got {value}")]
    InvalidTransferTtl { value: u64 },
    #[error("transfer sweep interval must be between 5 and 3600 seconds, got {value}")]
    InvalidTransferSweepInterval { value: u64 },
}

/// Parses `plan=n,plan=n` into a map, rejecting malformed entries.
pub fn parse_plan_quotas(raw: &str) -> Result<BTreeMap<String, u32>, ConfigError> {
    let mut quotas = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let parsed = entry.split_once('=').and_then(|(plan, value)| {
            let plan = plan.trim();
            let value = value.trim().parse::<u32>().ok()?;
            (!plan.is_empty()).then(|| (plan.to_string(), value))
        });
        let Some((plan, value)) = parsed else {
            return Err(ConfigError::InvalidPlanQuotaEntry {
                entry: entry.to_string(),
            });
        };
        quotas.insert(plan, value);
    }
    Ok(quotas)
}

fn decode_base64_key(
    raw: Option<String>,
    on_error: impl FnOnce(String) -> ConfigError,
) -> Result<Option<Vec<u8>>, ConfigError> {
    match raw.map(|value| value.trim().to_string()) {
        Some(value) if !value.is_empty() => general_purpose::STANDARD
            .decode(&value)
            .map(Some)
            .map_err(|e| on_error(e.to_string())),
        _ => Ok(None),
    }
}

/// Loads configuration using layered `.env` files and `SLOTS_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads `.env`, `.env.local`, `.env.{profile}`, `.env.{profile}.local`,
    /// then the process environment, and validates the result.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let mut take = |key: &str| layered.remove(key).filter(|v| !v.is_empty());

        let profile = take("PROFILE").unwrap_or(profile_hint);
        let api_bind_addr = take("API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let log_level = take("LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format = take("LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url = take("DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = take("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = take("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);

        // Single token or comma-separated list
        let operator_tokens = if let Some(tokens) = take("OPERATOR_TOKENS") {
            tokens
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        } else if let Some(token) = take("OPERATOR_TOKEN") {
            vec![token]
        } else {
            Vec::new()
        };

        let crypto_key = decode_base64_key(take("CRYPTO_KEY"), |error| {
            ConfigError::InvalidCryptoKeyBase64 { error }
        })?;
        let transfer_signing_key = decode_base64_key(take("TRANSFER_SIGNING_KEY"), |error| {
            ConfigError::InvalidSigningKeyBase64 { error }
        })?;

        let auto_migrate = take("AUTO_MIGRATE")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let slots = SlotPolicyConfig {
            default_lifetime_quota: take("DEFAULT_LIFETIME_QUOTA")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_lifetime_quota),
            plan_quotas: take("PLAN_QUOTAS")
                .map(|raw| parse_plan_quotas(&raw))
                .transpose()?
                .unwrap_or_default(),
        };

        let transfers = TransferConfig {
            ttl_seconds: take("TRANSFER_TTL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_transfer_ttl_seconds),
            sweep_interval_seconds: take("TRANSFER_SWEEP_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_transfer_sweep_seconds),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            operator_tokens,
            crypto_key,
            transfer_signing_key,
            auto_migrate,
            slots,
            transfers,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(self.base_dir.join(format!(".env.{profile}")), &mut values)?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{profile}.local")),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
