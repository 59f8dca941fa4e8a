// src/config.rs

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::invocation::PollBudget;

/// Runtime configuration. Values come from a JSON file, with `PANELFLOW_*`
/// environment variables taking precedence, so a deployment can tweak a
/// single knob without shipping a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub listen_addr: String,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub poll_attempts: u32,
    pub opening_balance: i64,
    pub tariff_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            log_level: "info".to_string(),
            log_dir: None,
            poll_interval_ms: 1500,
            poll_attempts: 20,
            opening_balance: 500,
            tariff_file: None,
        }
    }
}

impl EngineConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                let config: EngineConfig = serde_json::from_str(&raw)?;
                info!("loaded config from {}", path.display());
                config
            }
            None => EngineConfig::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = env::var("PANELFLOW_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(level) = env::var("PANELFLOW_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(dir) = env::var("PANELFLOW_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }
        if let Ok(ms) = env::var("PANELFLOW_POLL_INTERVAL_MS") {
            if let Ok(ms) = ms.parse() {
                self.poll_interval_ms = ms;
            }
        }
        if let Ok(attempts) = env::var("PANELFLOW_POLL_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse() {
                self.poll_attempts = attempts;
            }
        }
        if let Ok(balance) = env::var("PANELFLOW_OPENING_BALANCE") {
            if let Ok(balance) = balance.parse() {
                self.opening_balance = balance;
            }
        }
        if let Ok(file) = env::var("PANELFLOW_TARIFF_FILE") {
            self.tariff_file = Some(PathBuf::from(file));
        }
    }

    pub fn poll_budget(&self) -> PollBudget {
        PollBudget {
            interval: Duration::from_millis(self.poll_interval_ms),
            attempts: self.poll_attempts,
        }
    }
}
