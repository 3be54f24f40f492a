use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use kubestream_client::SessionOptions;
use kubestream_logs::{LineFlush, SessionConfig, TailerConfig};
use kubestream_types::{AlarmRule, DEFAULT_MAX_MESSAGES};

/// Settings loaded from `config.toml`; every field has a default
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub tail: TailSection,
    pub client: ClientSection,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    /// Kubeconfig context; the current one when unset
    pub context: Option<String>,
    pub outbound_capacity: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3883".to_string(),
            context: None,
            outbound_capacity: 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct TailSection {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub queue_capacity: usize,
    pub tail_lines: Option<i64>,
    pub flush: LineFlush,
}

impl Default for TailSection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            queue_capacity: 1000,
            tail_lines: None,
            flush: LineFlush::Terminated,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub server: String,
    pub api_key: Option<String>,
    pub max_messages: usize,
    pub timestamp: bool,
    pub previous: bool,
    pub background_notify: bool,
    pub alarms: Vec<AlarmRule>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server: "ws://127.0.0.1:3883".to_string(),
            api_key: None,
            max_messages: DEFAULT_MAX_MESSAGES,
            timestamp: false,
            previous: false,
            background_notify: true,
            alarms: Vec::new(),
        }
    }
}

impl Config {
    /// Load from an explicit path, else the default location when present, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::read(path),
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::read(&path),
                None => Ok(Self::default()),
            },
        }
    }

    /// `~/.config/kubestream/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| {
            home.join(".config")
                .join("kubestream")
                .join("config.toml")
        })
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("Invalid configuration")
    }

    fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("In {}", path.display()))
    }

    pub fn session_config(&self) -> SessionConfig {
        let tail = &self.tail;
        SessionConfig {
            tailer: TailerConfig {
                tail_lines: tail.tail_lines,
                max_attempts: tail.max_attempts.max(1),
                initial_backoff: Duration::from_millis(tail.initial_backoff_ms),
                max_backoff: Duration::from_millis(tail.max_backoff_ms),
                queue_capacity: tail.queue_capacity.max(1),
                flush: tail.flush,
                ..TailerConfig::default()
            },
            outbound_capacity: self.server.outbound_capacity.max(1),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            max_messages: self.client.max_messages,
            timestamp: self.client.timestamp,
            previous: self.client.previous,
            background_notify: self.client.background_notify,
        }
    }
}
