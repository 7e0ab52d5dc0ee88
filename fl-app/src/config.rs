//! Fareline configuration loader.

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct FarelineConfig {
    pub gateway: GatewayConfig,
    pub engine: EngineConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub base_url: String,
    #[serde(default = "default_gateway_session_id")]
    pub session_id: String,
    #[serde(default)]
    pub api_token: Option<String>,
    /// Poll interval in milliseconds.
    #[serde(default = "default_gateway_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_gateway_fetch_limit")]
    pub fetch_limit: usize,
    /// Skip messages already visible at startup (avoids backfilling old history).
    #[serde(default = "default_gateway_start_from_latest")]
    pub start_from_latest: bool,
}

fn default_gateway_session_id() -> String {
    "default".to_string()
}

fn default_gateway_poll_interval_ms() -> u64 {
    3000
}

fn default_gateway_fetch_limit() -> usize {
    50
}

fn default_gateway_start_from_latest() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Operator notification endpoint for `notify` side effects.
    #[serde(default)]
    pub notify_url: Option<String>,
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
}

fn default_fallback_reply() -> String {
    "Sorry, something went wrong on our side. An agent will follow up with you shortly."
        .to_string()
}

/// Timing knobs for the processing pipeline. The defaults are the values
/// the platform runs with; deployments tune them per gateway behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Consecutive messages from one sender within this window are merged
    /// into a single processing unit.
    pub aggregation_window_ms: u64,
    /// Minimum spacing between outbound replies to one conversation.
    pub reply_cooldown_ms: u64,
    /// Window within which a byte-identical reply to the same conversation
    /// is suppressed.
    pub duplicate_reply_window_secs: u64,
    /// Retention for identifier-based dedup records.
    pub dedup_id_ttl_secs: u64,
    /// Retention for content-fingerprint dedup records. Shorter than the
    /// identifier TTL: fingerprint collisions on legitimate repeated
    /// phrases are cheaper than identifier misses.
    pub dedup_fingerprint_ttl_secs: u64,
    /// Safety net for crashed or hung workers holding a conversation lock.
    pub lock_timeout_secs: u64,
    /// Idle gap after which a conversation gets a fresh session.
    pub session_timeout_secs: u64,
    /// Bounded recent-history window handed to the decision engine.
    pub history_limit: usize,
    /// Fixed delay between receiving a decision and sending the reply.
    pub send_delay_ms: u64,
    /// Queue drain tick.
    pub drain_interval_ms: u64,
    /// Expiry sweep period.
    pub sweep_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            aggregation_window_ms: 3000,
            reply_cooldown_ms: 4000,
            duplicate_reply_window_secs: 30,
            dedup_id_ttl_secs: 90,
            dedup_fingerprint_ttl_secs: 30,
            lock_timeout_secs: 45,
            session_timeout_secs: 3600,
            history_limit: 30,
            send_delay_ms: 400,
            drain_interval_ms: 500,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub port: u16,
    pub http_timeout_seconds: u64,
    pub http_max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8787,
            http_timeout_seconds: 30,
            http_max_in_flight: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.fareline/data".to_string(),
        }
    }
}

impl FarelineConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg: FarelineConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FARELINE_GATEWAY_URL") {
            if !v.trim().is_empty() {
                self.gateway.base_url = v;
            }
        }
        if let Ok(v) = std::env::var("FARELINE_GATEWAY_SESSION") {
            if !v.trim().is_empty() {
                self.gateway.session_id = v;
            }
        }
        if let Ok(v) = std::env::var("FARELINE_GATEWAY_TOKEN") {
            if !v.trim().is_empty() {
                self.gateway.api_token = Some(v);
            }
        }
        if let Ok(v) = std::env::var("FARELINE_ENGINE_URL") {
            if !v.trim().is_empty() {
                self.engine.base_url = v;
            }
        }
        if let Ok(v) = std::env::var("FARELINE_ENGINE_KEY") {
            if !v.trim().is_empty() {
                self.engine.api_key = Some(v);
            }
        }
    }

    /// Startup-fatal checks. A misconfigured gateway halts the process
    /// rather than letting ingestion spin against nothing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.gateway.base_url.trim().is_empty() {
            return Err(anyhow::anyhow!("gateway.base_url is required"));
        }
        if self.engine.base_url.trim().is_empty() {
            return Err(anyhow::anyhow!("engine.base_url is required"));
        }
        if self.gateway.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("gateway.poll_interval_ms must be > 0"));
        }
        if self.gateway.fetch_limit == 0 {
            return Err(anyhow::anyhow!("gateway.fetch_limit must be > 0"));
        }
        if self.server.enabled && self.server.port == 0 {
            return Err(anyhow::anyhow!("server.port must be > 0"));
        }
        if self.pipeline.aggregation_window_ms == 0 {
            return Err(anyhow::anyhow!("pipeline.aggregation_window_ms must be > 0"));
        }
        if self.pipeline.history_limit == 0 {
            return Err(anyhow::anyhow!("pipeline.history_limit must be > 0"));
        }
        if self.pipeline.lock_timeout_secs == 0 {
            return Err(anyhow::anyhow!("pipeline.lock_timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn data_dir_path(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.storage.data_dir)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".fareline").join("config.toml")
}

pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim().to_string();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen("~", &home, 1)))
}
