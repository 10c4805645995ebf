//! Configuration file management for foreman.
//!
//! Provides a TOML-based config file at `~/.config/foreman/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default, for
//! every key spec §6 names ("Configuration keys the core recognizes").

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use foreman_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub distributed: DistributedSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub feature_flags: FeatureFlagsSection,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DistributedSection {
    pub enabled: bool,
    /// Bearer token agents must present; hex-encoded random bytes generated
    /// by `foreman init`, checked as an opaque string (no signing).
    pub auth_token: Option<String>,
    pub queue_enabled: bool,
    pub heartbeat_timeout_ms: i64,
}

impl Default for DistributedSection {
    fn default() -> Self {
        Self {
            enabled: false,
            auth_token: None,
            queue_enabled: false,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DispatchSection {
    pub fallback_local: bool,
    pub max_retries: i32,
    pub retry_backoff_ms: i64,
    pub max_retry_backoff_ms: i64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_reset_ms: u64,
    pub orphan_check_interval_ms: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            fallback_local: true,
            max_retries: 3,
            retry_backoff_ms: 1000,
            max_retry_backoff_ms: 30_000,
            circuit_breaker_threshold: 5,
            circuit_breaker_reset_ms: 60_000,
            orphan_check_interval_ms: 120_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct FeatureFlagsSection {
    pub resource_aware_scheduling: bool,
}

const DEFAULT_HEARTBEAT_TIMEOUT_MS: i64 = 90_000;

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the foreman config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/foreman` or `~/.config/foreman`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("foreman");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("foreman")
}

/// Return the path to the foreman config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Auth token generation
// -----------------------------------------------------------------------

/// Generate a random bearer token: 32 random bytes, hex-encoded (64 chars).
/// Agents and the master must be configured with the same value; this is
/// an opaque shared secret, not a signing key, so no HMAC is involved.
pub fn generate_auth_token() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use by the CLI and `foreman
/// serve`. Every key spec.md §6 names is a field here.
#[derive(Debug)]
pub struct ForemanConfig {
    pub db_config: DbConfig,
    pub distributed_enabled: bool,
    pub auth_token: Option<String>,
    pub queue_enabled: bool,
    pub heartbeat_timeout: chrono::Duration,
    pub fallback_local: bool,
    pub max_retries: i32,
    pub retry_backoff_ms: i64,
    pub max_retry_backoff_ms: i64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_reset: Duration,
    pub orphan_check_interval: Duration,
    pub resource_aware_scheduling: bool,
}

impl ForemanConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// Only the database URL takes a CLI flag today (`--database-url`);
    /// every other key resolves from `FOREMAN_*` env vars, then the config
    /// file, then the built-in default spec.md §6 states.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("FOREMAN_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let distributed = file_config.as_ref().map(|c| &c.distributed);
        let dispatch = file_config.as_ref().map(|c| &c.dispatch);
        let flags = file_config.as_ref().map(|c| &c.feature_flags);

        let distributed_enabled = env_bool("FOREMAN_DISTRIBUTED_ENABLED")
            .unwrap_or_else(|| distributed.map(|d| d.enabled).unwrap_or(false));

        let auth_token = std::env::var("FOREMAN_AUTH_TOKEN")
            .ok()
            .or_else(|| distributed.and_then(|d| d.auth_token.clone()));

        let queue_enabled = env_bool("FOREMAN_QUEUE_ENABLED")
            .unwrap_or_else(|| distributed.map(|d| d.queue_enabled).unwrap_or(false));

        let heartbeat_timeout_ms = distributed
            .map(|d| d.heartbeat_timeout_ms)
            .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT_MS);

        let default_dispatch = DispatchSection::default();
        let fallback_local = dispatch
            .map(|d| d.fallback_local)
            .unwrap_or(default_dispatch.fallback_local);
        let max_retries = dispatch.map(|d| d.max_retries).unwrap_or(default_dispatch.max_retries);
        let retry_backoff_ms = dispatch
            .map(|d| d.retry_backoff_ms)
            .unwrap_or(default_dispatch.retry_backoff_ms);
        let max_retry_backoff_ms = dispatch
            .map(|d| d.max_retry_backoff_ms)
            .unwrap_or(default_dispatch.max_retry_backoff_ms);
        let circuit_breaker_threshold = dispatch
            .map(|d| d.circuit_breaker_threshold)
            .unwrap_or(default_dispatch.circuit_breaker_threshold);
        let circuit_breaker_reset_ms = dispatch
            .map(|d| d.circuit_breaker_reset_ms)
            .unwrap_or(default_dispatch.circuit_breaker_reset_ms);
        let orphan_check_interval_ms = dispatch
            .map(|d| d.orphan_check_interval_ms)
            .unwrap_or(default_dispatch.orphan_check_interval_ms);

        let resource_aware_scheduling = env_bool("FOREMAN_RESOURCE_AWARE_SCHEDULING")
            .unwrap_or_else(|| flags.map(|f| f.resource_aware_scheduling).unwrap_or(false));

        Ok(Self {
            db_config,
            distributed_enabled,
            auth_token,
            queue_enabled,
            heartbeat_timeout: chrono::Duration::milliseconds(heartbeat_timeout_ms),
            fallback_local,
            max_retries,
            retry_backoff_ms,
            max_retry_backoff_ms,
            circuit_breaker_threshold,
            circuit_breaker_reset: Duration::from_millis(circuit_breaker_reset_ms),
            orphan_check_interval: Duration::from_millis(orphan_check_interval_ms),
            resource_aware_scheduling,
        })
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|v| match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    })
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    #[test]
    fn generate_auth_token_is_64_hex_chars() {
        let token = generate_auth_token();
        assert_eq!(token.len(), 64);
        assert!(
            token.chars().all(|c| c.is_ascii_hexdigit()),
            "expected all hex digits, got: {token}"
        );
    }

    #[test]
    fn generate_auth_token_is_random() {
        let a = generate_auth_token();
        let b = generate_auth_token();
        assert_ne!(a, b, "two generated tokens should differ");
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("foreman");
        let path = dir.join("config.toml");

        let original = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://testhost:5432/testdb".to_string(),
            },
            distributed: DistributedSection {
                auth_token: Some("aa".repeat(32)),
                ..Default::default()
            },
            dispatch: DispatchSection::default(),
            feature_flags: FeatureFlagsSection::default(),
        };

        std::fs::create_dir_all(&dir).unwrap();
        let contents = toml::to_string_pretty(&original).unwrap();
        std::fs::write(&path, &contents).unwrap();

        let loaded_contents = std::fs::read_to_string(&path).unwrap();
        let loaded: ConfigFile = toml::from_str(&loaded_contents).unwrap();

        assert_eq!(loaded.database.url, original.database.url);
        assert_eq!(loaded.distributed.auth_token, original.distributed.auth_token);
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("test.toml");
        std::fs::write(&file, "test").unwrap();

        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&file, perms).unwrap();

        let meta = std::fs::metadata(&file).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();

        unsafe { std::env::set_var("FOREMAN_DATABASE_URL", "postgresql://env:5432/envdb") };
        let config = ForemanConfig::resolve(Some("postgresql://cli:5432/clidb")).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");
        unsafe { std::env::remove_var("FOREMAN_DATABASE_URL") };
    }

    #[test]
    fn resolve_with_env_var_overrides_config_file() {
        let _lock = lock_env();

        unsafe { std::env::set_var("FOREMAN_DATABASE_URL", "postgresql://env:5432/envdb") };
        let config = ForemanConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://env:5432/envdb");
        unsafe { std::env::remove_var("FOREMAN_DATABASE_URL") };
    }

    #[test]
    fn resolve_defaults_db_url_when_nothing_set() {
        let _lock = lock_env();

        unsafe { std::env::remove_var("FOREMAN_DATABASE_URL") };
        let config = ForemanConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, DbConfig::DEFAULT_URL);
    }

    #[test]
    fn resolve_defaults_match_spec_without_config_file() {
        let _lock = lock_env();

        unsafe { std::env::remove_var("FOREMAN_DATABASE_URL") };
        unsafe { std::env::remove_var("FOREMAN_DISTRIBUTED_ENABLED") };
        unsafe { std::env::remove_var("FOREMAN_QUEUE_ENABLED") };
        unsafe { std::env::remove_var("FOREMAN_AUTH_TOKEN") };
        unsafe { std::env::remove_var("FOREMAN_RESOURCE_AWARE_SCHEDULING") };

        // Point HOME/XDG at an empty temp dir so no stray config file is found.
        let tmp = tempfile::TempDir::new().unwrap();
        let orig_home = std::env::var("HOME").ok();
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe { std::env::set_var("HOME", tmp.path()) };
        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };

        let config = ForemanConfig::resolve(None).unwrap();

        match orig_home {
            Some(h) => unsafe { std::env::set_var("HOME", h) },
            None => unsafe { std::env::remove_var("HOME") },
        }
        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }

        assert!(!config.distributed_enabled);
        assert!(config.fallback_local);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_backoff_ms, 1000);
        assert_eq!(config.max_retry_backoff_ms, 30_000);
        assert_eq!(config.circuit_breaker_threshold, 5);
        assert_eq!(config.circuit_breaker_reset, Duration::from_millis(60_000));
        assert_eq!(config.orphan_check_interval, Duration::from_millis(120_000));
        assert_eq!(config.heartbeat_timeout, chrono::Duration::milliseconds(90_000));
        assert!(!config.resource_aware_scheduling);
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("foreman/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
