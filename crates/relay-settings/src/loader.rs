//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `RELAY_*` environment overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{LogLevel, OversizePolicy, RelaySettings};

/// Largest accepted `maxMessageSize` / transport ceiling (1 GiB).
const MAX_SIZE_LIMIT: usize = 1 << 30;

/// Resolve the path to the settings file (`~/.relay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid merged value is
/// an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: RelaySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `RELAY_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable lookup.
///
/// Invalid values are ignored with a warning and the file/default value is
/// kept.
pub fn apply_overrides(settings: &mut RelaySettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("RELAY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("RELAY_PORT") {
        match parse_u16_range(&v, 0, u16::MAX) {
            Some(port) => settings.server.port = port,
            None => warn_invalid("RELAY_PORT", &v),
        }
    }
    if let Some(v) = read("RELAY_PATH") {
        settings.server.path = v;
    }
    if let Some(v) = read("RELAY_MAX_MESSAGE_SIZE") {
        match parse_usize_range(&v, 1, MAX_SIZE_LIMIT) {
            Some(n) => settings.server.max_message_size = n,
            None => warn_invalid("RELAY_MAX_MESSAGE_SIZE", &v),
        }
    }
    if let Some(v) = read("RELAY_MAX_CONNECTIONS") {
        match parse_usize_range(&v, 1, 1_000_000) {
            Some(n) => settings.server.max_connections = n,
            None => warn_invalid("RELAY_MAX_CONNECTIONS", &v),
        }
    }
    if let Some(v) = read("RELAY_OVERSIZE_POLICY") {
        match serde_json::from_value::<OversizePolicy>(Value::String(v.to_lowercase())) {
            Ok(policy) => settings.server.oversize_policy = policy,
            Err(_) => warn_invalid("RELAY_OVERSIZE_POLICY", &v),
        }
    }
    if let Some(v) = read("RELAY_SHUTDOWN_GRACE_MS") {
        match parse_u64_range(&v, 0, 600_000) {
            Some(n) => settings.server.shutdown_grace_ms = n,
            None => warn_invalid("RELAY_SHUTDOWN_GRACE_MS", &v),
        }
    }
    if let Some(v) = read("RELAY_LOG_LEVEL") {
        match serde_json::from_value::<LogLevel>(Value::String(v.to_lowercase())) {
            Ok(level) => settings.logging.level = level,
            Err(_) => warn_invalid("RELAY_LOG_LEVEL", &v),
        }
    }
    if let Some(v) = read("RELAY_LOG_JSON") {
        match parse_bool(&v) {
            Some(b) => settings.logging.json = b,
            None => warn_invalid("RELAY_LOG_JSON", &v),
        }
    }
}

/// Check cross-field constraints that serde cannot express.
pub fn validate(settings: &RelaySettings) -> Result<()> {
    let server = &settings.server;
    if !server.path.starts_with('/') {
        return Err(SettingsError::InvalidValue(format!(
            "path must start with '/': {:?}",
            server.path
        )));
    }
    if server.max_message_size == 0 {
        return Err(SettingsError::InvalidValue(
            "maxMessageSize must be positive".into(),
        ));
    }
    if server.transport_max_frame_size < server.max_message_size {
        return Err(SettingsError::InvalidValue(format!(
            "transportMaxFrameSize ({}) is below maxMessageSize ({})",
            server.transport_max_frame_size, server.max_message_size
        )));
    }
    if server.send_queue_capacity == 0 {
        return Err(SettingsError::InvalidValue(
            "sendQueueCapacity must be positive".into(),
        ));
    }
    if let Some(health) = &server.health_path {
        if !health.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "healthPath must start with '/': {health:?}"
            )));
        }
    }
    Ok(())
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn warn_invalid(key: &str, value: &str) {
    tracing::warn!(key, value, "invalid env var, ignoring");
}
