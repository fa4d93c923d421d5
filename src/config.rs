use std::fs;
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::Duration;
use once_cell::sync::Lazy;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::audit::AuditConfig;
use crate::crypto::KEY_LEN;
use crate::keys::KeyManagerConfig;
use crate::rate_limit::RateLimiterConfig;
use crate::tokenization::TokenVaultConfig;
use crate::validator::ValidatorConfig;

pub const RATE_LIMIT_SALT: &str = "RATE_LIMIT_SALT";
pub const AUDIT_SALT: &str = "AUDIT_SALT";
pub const AUDIT_SECRET: &str = "AUDIT_SECRET";
pub const MASTER_KEY_ENCRYPTION_KEY: &str = "MASTER_KEY_ENCRYPTION_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(String),
    #[error("failed to read {var} from {path}: {source}")]
    Unreadable {
        var: String,
        path: String,
        source: std::io::Error,
    },
    #[error("{var} is invalid: {reason}")]
    Invalid { var: String, reason: String },
}

/// Directory holding the daily audit files. Defaults to `./logs/audit/`.
pub static AUDIT_LOG_PATH: Lazy<PathBuf> = Lazy::new(|| {
    read_optional_env("AUDIT_LOG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./logs/audit/"))
});

/// key: key-config -> scheduled rotation cadence
pub static KEY_ROTATION_INTERVAL_SECS: Lazy<u64> =
    Lazy::new(|| positive_env("KEY_ROTATION_INTERVAL_SECS", 24 * 60 * 60));

/// key: key-config -> lifetime of a key from creation
pub static KEY_RETENTION_SECS: Lazy<u64> =
    Lazy::new(|| positive_env("KEY_RETENTION_SECS", 7 * 24 * 60 * 60));

/// key: key-config -> purge sweep cadence, independent of rotation
pub static KEY_PURGE_INTERVAL_SECS: Lazy<u64> =
    Lazy::new(|| positive_env("KEY_PURGE_INTERVAL_SECS", 60 * 60));

/// key: vault-config -> default token lifetime
pub static TOKEN_TTL_SECS: Lazy<u64> =
    Lazy::new(|| positive_env("TOKEN_TTL_SECS", 30 * 24 * 60 * 60));

pub static TOKEN_SWEEP_INTERVAL_SECS: Lazy<u64> =
    Lazy::new(|| positive_env("TOKEN_SWEEP_INTERVAL_SECS", 60 * 60));

/// key: vault-config -> how long expired tokens stay correlatable
pub static TOKEN_INDEX_RETENTION_SECS: Lazy<u64> =
    Lazy::new(|| positive_env("TOKEN_INDEX_RETENTION_SECS", 90 * 24 * 60 * 60));

/// key: rate-limit-config -> penalty after a burst
pub static RATE_LIMIT_BLOCK_SECS: Lazy<u64> =
    Lazy::new(|| positive_env("RATE_LIMIT_BLOCK_SECS", 5 * 60));

pub static RATE_LIMIT_IDLE_SECS: Lazy<u64> =
    Lazy::new(|| positive_env("RATE_LIMIT_IDLE_SECS", 60 * 60));

/// key: rate-limit-config -> scan detection thresholds
pub static SCAN_ENDPOINT_THRESHOLD: Lazy<u64> =
    Lazy::new(|| positive_env("SCAN_ENDPOINT_THRESHOLD", 10));

pub static SCAN_REQUEST_THRESHOLD: Lazy<u64> =
    Lazy::new(|| positive_env("SCAN_REQUEST_THRESHOLD", 50));

pub static SCAN_HORIZON_SECS: Lazy<u64> = Lazy::new(|| positive_env("SCAN_HORIZON_SECS", 5 * 60));

pub static SCAN_BLOCK_SECS: Lazy<u64> = Lazy::new(|| positive_env("SCAN_BLOCK_SECS", 60 * 60));

pub static PATTERN_RESET_INTERVAL_SECS: Lazy<u64> =
    Lazy::new(|| positive_env("PATTERN_RESET_INTERVAL_SECS", 5 * 60));

/// key: audit-config -> size that triggers rotation before the next append
pub static AUDIT_ROTATE_BYTES: Lazy<u64> =
    Lazy::new(|| positive_env("AUDIT_ROTATE_BYTES", 100 * 1024 * 1024));

/// key: audit-config -> hard cap on the current file
pub static AUDIT_MAX_BYTES: Lazy<u64> =
    Lazy::new(|| positive_env("AUDIT_MAX_BYTES", 500 * 1024 * 1024));

pub static VALIDATOR_MAX_LENGTH: Lazy<u64> =
    Lazy::new(|| positive_env("VALIDATOR_MAX_LENGTH", 500));

/// Deployment environment recorded in audit source info. Defaults to `development`.
pub static APP_ENV: Lazy<String> =
    Lazy::new(|| read_optional_env("APP_ENV").unwrap_or_else(|| "development".to_string()));

pub static HOSTNAME: Lazy<String> =
    Lazy::new(|| read_optional_env("HOSTNAME").unwrap_or_else(|| "unknown".to_string()));

/// key: secrets-config
/// Required secrets. There is no insecure fallback: any missing value stops startup.
#[derive(Clone)]
pub struct SecretsConfig {
    pub rate_limit_salt: Zeroizing<String>,
    pub audit_salt: Zeroizing<String>,
    pub audit_secret: Zeroizing<String>,
    pub master_key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for SecretsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsConfig").finish_non_exhaustive()
    }
}

impl SecretsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(read_optional_env)
    }

    /// Resolves every secret through `lookup`, honouring the `<NAME>_FILE` variants.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rate_limit_salt = required_secret(&lookup, RATE_LIMIT_SALT)?;
        let audit_salt = required_secret(&lookup, AUDIT_SALT)?;
        let audit_secret = required_secret(&lookup, AUDIT_SECRET)?;
        let master_hex = required_secret(&lookup, MASTER_KEY_ENCRYPTION_KEY)?;
        let master_key =
            Zeroizing::new(hex::decode(master_hex.as_str()).map_err(|err| ConfigError::Invalid {
                var: MASTER_KEY_ENCRYPTION_KEY.to_string(),
                reason: format!("not hex: {err}"),
            })?);
        if master_key.len() != KEY_LEN {
            return Err(ConfigError::Invalid {
                var: MASTER_KEY_ENCRYPTION_KEY.to_string(),
                reason: format!(
                    "expected {} hex characters, got {}",
                    KEY_LEN * 2,
                    master_hex.len()
                ),
            });
        }
        Ok(Self {
            rate_limit_salt,
            audit_salt,
            audit_secret,
            master_key,
        })
    }
}

/// key: host-config
/// Everything the host needs to build a `ProtectionLayer`.
#[derive(Clone, Debug)]
pub struct HostConfig {
    pub secrets: SecretsConfig,
    pub audit: AuditConfig,
    pub keys: KeyManagerConfig,
    pub vault: TokenVaultConfig,
    pub rate_limit: RateLimiterConfig,
    pub validator: ValidatorConfig,
    pub idle_sweep_interval: StdDuration,
}

impl HostConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::from_secrets(SecretsConfig::from_env()?))
    }

    /// Combines `secrets` with the tunables read from the environment.
    pub fn from_secrets(secrets: SecretsConfig) -> Self {
        let mut audit = AuditConfig::new(
            AUDIT_LOG_PATH.clone(),
            secrets.audit_secret.as_str(),
            secrets.audit_salt.as_str(),
        );
        audit.rotate_bytes = *AUDIT_ROTATE_BYTES;
        audit.max_bytes = *AUDIT_MAX_BYTES;
        audit.hostname = HOSTNAME.clone();
        audit.environment = APP_ENV.clone();

        let keys = KeyManagerConfig {
            rotation_interval: StdDuration::from_secs(*KEY_ROTATION_INTERVAL_SECS),
            retention: seconds(*KEY_RETENTION_SECS),
            purge_interval: StdDuration::from_secs(*KEY_PURGE_INTERVAL_SECS),
        };

        let vault = TokenVaultConfig {
            default_ttl: seconds(*TOKEN_TTL_SECS),
            sweep_interval: StdDuration::from_secs(*TOKEN_SWEEP_INTERVAL_SECS),
            index_retention: seconds(*TOKEN_INDEX_RETENTION_SECS),
        };

        let mut rate_limit = RateLimiterConfig::new(secrets.rate_limit_salt.as_str());
        rate_limit.block_duration = seconds(*RATE_LIMIT_BLOCK_SECS);
        rate_limit.scan_endpoint_threshold = *SCAN_ENDPOINT_THRESHOLD as usize;
        rate_limit.scan_request_threshold = *SCAN_REQUEST_THRESHOLD as usize;
        rate_limit.scan_horizon = seconds(*SCAN_HORIZON_SECS);
        rate_limit.scan_block_duration = seconds(*SCAN_BLOCK_SECS);
        rate_limit.pattern_reset_interval = StdDuration::from_secs(*PATTERN_RESET_INTERVAL_SECS);
        rate_limit.idle_after = seconds(*RATE_LIMIT_IDLE_SECS);

        let validator = ValidatorConfig {
            max_length: *VALIDATOR_MAX_LENGTH as usize,
            ..ValidatorConfig::default()
        };

        Self {
            secrets,
            audit,
            keys,
            vault,
            rate_limit,
            validator,
            idle_sweep_interval: StdDuration::from_secs(*RATE_LIMIT_IDLE_SECS),
        }
    }
}

fn seconds(value: u64) -> Duration {
    // chrono durations top out at i64::MAX milliseconds
    let secs = i64::try_from(value).unwrap_or(i64::MAX).min(i64::MAX / 1_000);
    Duration::seconds(secs)
}

fn positive_env(key: &str, default: u64) -> u64 {
    read_optional_env(key)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// `<NAME>_FILE` wins over `<NAME>` when it names a non-empty file.
fn read_secret<F>(lookup: &F, value_key: &str) -> Result<Option<String>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let file_key = format!("{value_key}_FILE");
    if let Some(path) = lookup(&file_key) {
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Unreadable {
            var: file_key.clone(),
            path: path.clone(),
            source,
        })?;
        let trimmed = contents.trim();
        if !trimmed.is_empty() {
            return Ok(Some(trimmed.to_string()));
        }
    }
    Ok(lookup(value_key))
}

fn required_secret<F>(lookup: &F, key: &str) -> Result<Zeroizing<String>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    read_secret(lookup, key)?
        .map(Zeroizing::new)
        .ok_or_else(|| ConfigError::Missing(key.to_string()))
}
