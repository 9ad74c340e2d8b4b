//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.skiff/config.json`) and environment.
//! Covers the backend server, streaming/reconciliation tuning, and recovery policy.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Backend server settings (URL, API key).
    #[serde(default)]
    pub server: ServerConfig,

    /// Streaming/reconciliation tuning.
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Recovery/backoff policy for interrupted streams.
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

/// Backend server URL and auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Base URL of the Open-WebUI backend (default "http://127.0.0.1:8080").
    #[serde(default = "default_server_url")]
    pub url: String,

    /// Bearer token for the backend. Overridden by SKIFF_API_KEY env when set.
    pub api_key: Option<String>,
}

/// Tuning knobs for the snapshot-polling reconciliation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingConfig {
    /// Poll interval in milliseconds (default 900).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Consecutive identical polls before the stream is considered complete (default 8).
    /// The backend sends no end-of-generation signal in this flow; this heuristic is
    /// deliberately configurable so it can be tuned against a backend's latency profile.
    #[serde(default = "default_stability_threshold")]
    pub stability_threshold: u32,

    /// Hard wall-clock cap on a single stream in seconds (default 600).
    #[serde(default = "default_max_stream_secs")]
    pub max_stream_secs: u64,
}

/// Recovery sweep policy: bounded exponential backoff for stalled streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryConfig {
    /// Maximum recovery attempts per stream before it is abandoned (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff delay in seconds; attempt N waits base * 2^(N-1) (default 2).
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    /// Silence threshold in seconds after which a live stream is considered
    /// stalled and eligible for recovery (default 120).
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_server_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_poll_interval_ms() -> u64 {
    900
}

fn default_stability_threshold() -> u32 {
    8
}

fn default_max_stream_secs() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_secs() -> u64 {
    2
}

fn default_stale_after_secs() -> u64 {
    120
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            api_key: None,
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stability_threshold: default_stability_threshold(),
            max_stream_secs: default_max_stream_secs(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl StreamingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_stream_duration(&self) -> Duration {
        Duration::from_secs(self.max_stream_secs)
    }
}

/// Resolve the API key: env SKIFF_API_KEY overrides config.
pub fn resolve_api_key(config: &Config) -> Option<String> {
    std::env::var("SKIFF_API_KEY")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .server
                .api_key
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the server base URL: env SKIFF_SERVER_URL overrides config.
pub fn resolve_server_url(config: &Config) -> String {
    std::env::var("SKIFF_SERVER_URL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| config.server.url.clone())
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("SKIFF_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".skiff").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Default path for the persisted stream-recovery snapshot (written on detach).
pub fn default_recovery_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".skiff").join("streams.json"))
        .unwrap_or_else(|| PathBuf::from("streams.json"))
}

/// Load config from the default path (or SKIFF_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_streaming_knobs() {
        let s = StreamingConfig::default();
        assert_eq!(s.poll_interval_ms, 900);
        assert_eq!(s.stability_threshold, 8);
        assert_eq!(s.max_stream_secs, 600);
    }

    #[test]
    fn default_recovery_knobs() {
        let r = RecoveryConfig::default();
        assert_eq!(r.max_attempts, 3);
        assert_eq!(r.base_delay_secs, 2);
        assert_eq!(r.stale_after_secs, 120);
    }

    #[test]
    fn empty_json_parses_to_defaults() {
        let config: Config = serde_json::from_str("{}").expect("parse empty config");
        assert_eq!(config.server.url, "http://127.0.0.1:8080");
        assert_eq!(config.streaming.stability_threshold, 8);
    }

    #[test]
    fn camel_case_overrides_apply() {
        let config: Config = serde_json::from_str(
            r#"{"streaming": {"pollIntervalMs": 500, "stabilityThreshold": 4}}"#,
        )
        .expect("parse config");
        assert_eq!(config.streaming.poll_interval_ms, 500);
        assert_eq!(config.streaming.stability_threshold, 4);
        assert_eq!(config.streaming.max_stream_secs, 600);
    }
}
