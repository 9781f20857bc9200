use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::poller::PollTuning;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // Backend connection
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub actor_id: String,

    // Response polling
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_transport_retries")]
    pub max_transport_retries: u32,

    // Per-request HTTP timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_backend_url() -> String {
    "http://127.0.0.1:8787".to_string()
}

fn default_poll_interval_secs() -> u64 {
    1
}

fn default_max_transport_retries() -> u32 {
    3
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            auth_token: None,
            actor_id: String::new(),
            poll_interval_secs: default_poll_interval_secs(),
            max_transport_retries: default_max_transport_retries(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl EngineConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("fabler_config.toml")
    }

    /// Load config from fabler_config.toml (next to executable), falling back
    /// to environment variables.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<EngineConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("FABLER_BACKEND_URL") {
            if !url.trim().is_empty() {
                config.backend_url = url;
            }
        }

        if let Ok(token) = env::var("FABLER_BACKEND_TOKEN") {
            let token = token.trim().to_string();
            if !token.is_empty() {
                config.auth_token = Some(token);
            }
        }

        if let Ok(actor) = env::var("FABLER_ACTOR_ID") {
            config.actor_id = actor;
        }

        if let Ok(interval) = env::var("FABLER_POLL_INTERVAL_SECS") {
            if let Ok(seconds) = interval.parse() {
                config.poll_interval_secs = seconds;
            }
        }

        if let Ok(retries) = env::var("FABLER_MAX_TRANSPORT_RETRIES") {
            if let Ok(count) = retries.parse() {
                config.max_transport_retries = count;
            }
        }

        if let Ok(timeout) = env::var("FABLER_REQUEST_TIMEOUT_SECS") {
            if let Ok(seconds) = timeout.parse() {
                config.request_timeout_secs = seconds;
            }
        }

        config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_tuning(&self) -> PollTuning {
        PollTuning {
            interval: Duration::from_secs(self.poll_interval_secs),
            max_transport_retries: self.max_transport_retries,
        }
    }
}
