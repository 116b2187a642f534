// =============================================================================
// Runtime Configuration — environment-driven engine settings
// =============================================================================
//
// Every tunable in spec §6 lives here, loaded via `dotenv` + `std::env::var`
// with typed defaults, mirroring the donor's `AURORA_SYMBOLS` /
// `AURORA_BIND_ADDR` pattern. A malformed env var is non-fatal: logged and
// the default used, except an invalid bind address, which is fatal at
// startup (spec §7).
// =============================================================================

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "XRPUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

/// Top-level runtime configuration for the depth engine. Every field carries
/// a serde default so an older persisted config missing new fields still
/// deserializes cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_snapshot_min_interval_ms")]
    pub snapshot_min_interval_ms: u64,
    #[serde(default = "default_depth_queue_max")]
    pub depth_queue_max: usize,
    #[serde(default = "default_depth_lag_max_ms")]
    pub depth_lag_max_ms: i64,
    #[serde(default = "default_live_snapshot_fresh_ms")]
    pub live_snapshot_fresh_ms: i64,
    #[serde(default = "default_live_desync_rate_10s_max")]
    pub live_desync_rate_10s_max: usize,
    #[serde(default = "default_depth_levels")]
    pub depth_levels: u32,
    #[serde(default = "default_depth_stream_mode")]
    pub depth_stream_mode: String,
    #[serde(default = "default_ws_update_speed")]
    pub ws_update_speed: String,
    #[serde(default = "default_client_heartbeat_interval_ms")]
    pub client_heartbeat_interval_ms: u64,
    #[serde(default = "default_client_stale_connection_ms")]
    pub client_stale_connection_ms: u64,
    #[serde(default = "default_symbol_concurrency")]
    pub symbol_concurrency: usize,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_snapshot_min_interval_ms() -> u64 {
    1_000
}

fn default_depth_queue_max() -> usize {
    1_000
}

fn default_depth_lag_max_ms() -> i64 {
    5_000
}

fn default_live_snapshot_fresh_ms() -> i64 {
    5 * 60_000
}

fn default_live_desync_rate_10s_max() -> usize {
    5
}

fn default_depth_levels() -> u32 {
    1_000
}

fn default_depth_stream_mode() -> String {
    "diff".to_string()
}

fn default_ws_update_speed() -> String {
    "100ms".to_string()
}

fn default_client_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_client_stale_connection_ms() -> u64 {
    45_000
}

fn default_symbol_concurrency() -> usize {
    5
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            symbols: default_symbols(),
            snapshot_min_interval_ms: default_snapshot_min_interval_ms(),
            depth_queue_max: default_depth_queue_max(),
            depth_lag_max_ms: default_depth_lag_max_ms(),
            live_snapshot_fresh_ms: default_live_snapshot_fresh_ms(),
            live_desync_rate_10s_max: default_live_desync_rate_10s_max(),
            depth_levels: default_depth_levels(),
            depth_stream_mode: default_depth_stream_mode(),
            ws_update_speed: default_ws_update_speed(),
            client_heartbeat_interval_ms: default_client_heartbeat_interval_ms(),
            client_stale_connection_ms: default_client_stale_connection_ms(),
            symbol_concurrency: default_symbol_concurrency(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

/// Parse an env var with a typed fallback; a parse failure logs a warning
/// and falls back to the default rather than aborting startup.
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, raw, "failed to parse environment variable, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_list_or(key: &str, default: Vec<String>) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.split(',').map(|s| s.trim().to_string()).collect(),
        _ => default,
    }
}

impl RuntimeConfig {
    /// Load configuration from the process environment (after `dotenv`
    /// has populated it), falling back field-by-field to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: env_or("PORT", defaults.port),
            symbols: env_list_or("AURORA_SYMBOLS", defaults.symbols),
            snapshot_min_interval_ms: env_or("SNAPSHOT_MIN_INTERVAL_MS", defaults.snapshot_min_interval_ms),
            depth_queue_max: env_or("DEPTH_QUEUE_MAX", defaults.depth_queue_max),
            depth_lag_max_ms: env_or("DEPTH_LAG_MAX_MS", defaults.depth_lag_max_ms),
            live_snapshot_fresh_ms: env_or("LIVE_SNAPSHOT_FRESH_MS", defaults.live_snapshot_fresh_ms),
            live_desync_rate_10s_max: env_or("LIVE_DESYNC_RATE_10S_MAX", defaults.live_desync_rate_10s_max),
            depth_levels: env_or("DEPTH_LEVELS", defaults.depth_levels),
            depth_stream_mode: std::env::var("DEPTH_STREAM_MODE").unwrap_or(defaults.depth_stream_mode),
            ws_update_speed: std::env::var("WS_UPDATE_SPEED").unwrap_or(defaults.ws_update_speed),
            client_heartbeat_interval_ms: env_or(
                "CLIENT_HEARTBEAT_INTERVAL_MS",
                defaults.client_heartbeat_interval_ms,
            ),
            client_stale_connection_ms: env_or("CLIENT_STALE_CONNECTION_MS", defaults.client_stale_connection_ms),
            symbol_concurrency: env_or("SYMBOL_CONCURRENCY", defaults.symbol_concurrency),
            allowed_origins: env_list_or("ALLOWED_ORIGINS", defaults.allowed_origins),
        }
    }

    /// The bind address is the one config error that is fatal at startup.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }

    /// Load configuration from a JSON file at `path` (used for the
    /// persisted-feature-flag path only; the environment is the primary
    /// configuration surface).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        info!(path = %path.display(), symbols = ?config.symbols, "runtime config loaded from file");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to a sibling `.tmp`, then rename) so a crash mid-write never
    /// corrupts the file on disk.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).context("failed to serialize runtime config to JSON")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbols.len(), 5);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.depth_queue_max, 1_000);
        assert_eq!(cfg.ws_update_speed, "100ms");
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbols, default_symbols());
        assert_eq!(cfg.depth_levels, 1_000);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["ETHUSDT"], "port": 9000 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.depth_queue_max, default_depth_queue_max());
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.port, cfg2.port);
    }

    #[test]
    fn bind_addr_parses_valid_host_port() {
        let mut cfg = RuntimeConfig::default();
        cfg.host = "127.0.0.1".to_string();
        cfg.port = 9999;
        assert!(cfg.bind_addr().is_ok());
    }

    #[test]
    fn bind_addr_rejects_invalid_host() {
        let mut cfg = RuntimeConfig::default();
        cfg.host = "not a valid host!!".to_string();
        assert!(cfg.bind_addr().is_err());
    }
}
