use crate::messaging::{FlowMode, PrefetchLimits};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFAULT_CONFIG_PATH: &str = "config/courier.toml";

/// Top-level configuration for courier sessions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Queues declared in the in-memory registry at startup.
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Prefix for tags generated when `subscribe` names no destination.
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
    /// Initial flow mode of new subscriptions.
    #[serde(default)]
    pub default_flow_mode: FlowModeConfig,
    /// Initial session prefetch count (0 = unlimited).
    #[serde(default)]
    pub prefetch_count: u32,
    /// Initial session prefetch size in bytes (0 = unlimited).
    #[serde(default)]
    pub prefetch_size: u64,
    /// Cap on tracked delivery records per session (0 = unlimited).
    #[serde(default)]
    pub max_delivery_records: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tag_prefix: default_tag_prefix(),
            default_flow_mode: FlowModeConfig::default(),
            prefetch_count: 0,
            prefetch_size: 0,
            max_delivery_records: 0,
        }
    }
}

impl SessionConfig {
    pub fn prefetch_limits(&self) -> PrefetchLimits {
        PrefetchLimits::new(self.prefetch_count, self.prefetch_size)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlowModeConfig {
    #[default]
    Credit,
    Window,
}

impl FlowModeConfig {
    pub fn flow_mode(&self) -> FlowMode {
        match self {
            FlowModeConfig::Credit => FlowMode::Credit,
            FlowModeConfig::Window => FlowMode::Window,
        }
    }
}

impl FromStr for FlowModeConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "credit" => Ok(Self::Credit),
            "window" => Ok(Self::Window),
            other => bail!("invalid session.default_flow_mode {}", other),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub log_level: Option<String>,
    /// Emit JSON log lines instead of the human-readable format.
    #[serde(default = "default_json_logs")]
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            json: default_json_logs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub name: String,
}

fn default_tag_prefix() -> String {
    "amq.ctag".into()
}

fn default_json_logs() -> bool {
    true
}

impl Config {
    /// Load configuration from COURIER_CONFIG or `config/courier.toml`, then
    /// apply environment overrides. Defaults apply when neither exists.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let mut cfg = if std::env::var_os("COURIER_CONFIG").is_none() && !path.exists() {
            Self::default()
        } else {
            Self::load(&path)?
        };
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.tag_prefix.is_empty() {
            bail!("session.tag_prefix must be non-empty");
        }
        let mut seen = std::collections::HashSet::new();
        for queue in &self.queues {
            if queue.name.is_empty() {
                bail!("queue names must be non-empty");
            }
            if !seen.insert(queue.name.as_str()) {
                bail!("queue {} declared twice", queue.name);
            }
        }
        if let Some(level) = &self.telemetry.log_level {
            tracing_subscriber::EnvFilter::try_new(level)
                .with_context(|| format!("invalid telemetry.log_level {level}"))?;
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(level) = std::env::var("COURIER_LOG_LEVEL") {
            self.telemetry.log_level = Some(level);
        }
        if let Ok(mode) = std::env::var("COURIER_FLOW_MODE") {
            self.session.default_flow_mode = FlowModeConfig::from_str(&mode)?;
        }
        Ok(())
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("COURIER_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}
