//! Configuration loader
//!
//! Loads engine configuration from environment variables or files.
//!
//! ## Loading Strategy
//! 1. A `.env` file in the working directory (or a parent) is loaded first
//! 2. Environment variables are tried; `CALSYNC_DB_PATH` must be set
//! 3. Otherwise the first config file found by [`probe_config_paths`] is used
//! 4. JSON and TOML are supported, chosen by extension
//!
//! Every section is defaulted, so a file only needs the values it changes.
//! The loaded configuration is validated before it is returned.
//!
//! ## Environment Variables
//! - `CALSYNC_DB_PATH`: database file path (required for env loading)
//! - `CALSYNC_DB_POOL_SIZE`: connection pool size
//! - `CALSYNC_SYNC_ENABLED`: periodic background sync (true/false)
//! - `CALSYNC_SYNC_INTERVAL`: seconds between periodic syncs
//! - `CALSYNC_SYNC_MAX_CONCURRENT`: worker slots shared by passes and deliveries
//! - `CALSYNC_SYNC_PASS_TIMEOUT`: per-pass timeout in seconds
//! - `CALSYNC_QUEUE_MAX_ATTEMPTS`: delivery attempts before abandoning
//! - `CALSYNC_QUEUE_BASE_DELAY_MS` / `CALSYNC_QUEUE_MAX_DELAY_MS`: backoff bounds
//! - `CALSYNC_QUEUE_OPERATION_TIMEOUT`: per-call timeout in seconds
//! - `CALSYNC_LOG_LEVEL`: default `EnvFilter` directive
//! - `CALSYNC_LOG_JSON`: JSON log output (true/false)
//!
//! ## File Locations
//! The loader probes, in order, `calsync.toml`, `calsync.json`,
//! `config.toml` and `config.json` in the working directory, its parent, and
//! next to the executable.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use calsync_domain::{CalSyncError, Config, Result};

const CONFIG_FILE_NAMES: [&str; 4] = ["calsync.toml", "calsync.json", "config.toml", "config.json"];

/// Load configuration with automatic fallback strategy
///
/// # Errors
/// Returns `CalSyncError::Config` if neither source yields a valid
/// configuration.
pub fn load() -> Result<Config> {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!(path = %path.display(), "Loaded .env file"),
        Err(err) => tracing::debug!(error = %err, "No .env file loaded"),
    }

    match load_from_env() {
        Ok(config) => {
            tracing::info!("Configuration loaded from environment variables");
            Ok(config)
        }
        Err(e) => {
            tracing::debug!(error = ?e, "Failed to load from environment, trying file");
            load_from_file(None)
        }
    }
}

/// Load configuration from `CALSYNC_*` environment variables
///
/// Unset optional variables keep their defaults.
///
/// # Errors
/// Returns `CalSyncError::Config` if `CALSYNC_DB_PATH` is missing, a value
/// does not parse, or the result fails validation.
pub fn load_from_env() -> Result<Config> {
    let mut config = Config::default();

    config.database.path = env_var("CALSYNC_DB_PATH")?;
    override_parsed("CALSYNC_DB_POOL_SIZE", &mut config.database.pool_size)?;

    config.sync.enabled = env_bool("CALSYNC_SYNC_ENABLED", config.sync.enabled);
    override_parsed("CALSYNC_SYNC_INTERVAL", &mut config.sync.interval_seconds)?;
    override_parsed("CALSYNC_SYNC_MAX_CONCURRENT", &mut config.sync.max_concurrent_passes)?;
    override_parsed("CALSYNC_SYNC_PASS_TIMEOUT", &mut config.sync.pass_timeout_seconds)?;

    override_parsed("CALSYNC_QUEUE_MAX_ATTEMPTS", &mut config.queue.max_attempts)?;
    override_parsed("CALSYNC_QUEUE_BASE_DELAY_MS", &mut config.queue.base_delay_ms)?;
    override_parsed("CALSYNC_QUEUE_MAX_DELAY_MS", &mut config.queue.max_delay_ms)?;
    override_parsed("CALSYNC_QUEUE_OPERATION_TIMEOUT", &mut config.queue.operation_timeout_seconds)?;

    if let Ok(level) = std::env::var("CALSYNC_LOG_LEVEL") {
        config.logging.level = level;
    }
    config.logging.json = env_bool("CALSYNC_LOG_JSON", config.logging.json);

    config.validate()?;
    Ok(config)
}

/// Load configuration from a file
///
/// If `path` is `None`, probes the standard locations.
///
/// # Errors
/// Returns `CalSyncError::Config` if the file is missing or unreadable, the
/// format is invalid, or the result fails validation.
pub fn load_from_file(path: Option<PathBuf>) -> Result<Config> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(CalSyncError::Config(format!("Config file not found: {}", p.display())));
            }
            p
        }
        None => probe_config_paths().ok_or_else(|| {
            CalSyncError::Config("No config file found in any of the standard locations".to_string())
        })?,
    };

    tracing::info!(path = %config_path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| CalSyncError::Config(format!("Failed to read config file: {e}")))?;

    let config = parse_config(&contents, &config_path)?;
    config.validate()?;
    Ok(config)
}

/// Parse configuration, choosing the format by extension
fn parse_config(contents: &str, path: &Path) -> Result<Config> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| CalSyncError::Config(format!("Invalid TOML format: {e}"))),
        "json" => serde_json::from_str(contents)
            .map_err(|e| CalSyncError::Config(format!("Invalid JSON format: {e}"))),
        _ => Err(CalSyncError::Config(format!("Unsupported config format: {extension}"))),
    }
}

/// First existing config file in the standard locations
pub fn probe_config_paths() -> Option<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd.join(".."));
        roots.insert(0, cwd);
    }
    if let Some(exe_dir) = std::env::current_exe().ok().and_then(|exe| exe.parent().map(Path::to_path_buf)) {
        roots.push(exe_dir);
    }

    roots
        .iter()
        .flat_map(|root| CONFIG_FILE_NAMES.iter().map(move |name| root.join(name)))
        .find(|path| path.exists())
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key)
        .map_err(|_| CalSyncError::Config(format!("Missing required environment variable: {key}")))
}

/// Replace `target` when `key` is set
fn override_parsed<T>(key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| CalSyncError::Config(format!("Invalid value for {key}: {e}")))?;
    }
    Ok(())
}

/// Accepts `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive)
fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map_or(default, |s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}
