use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_WEBDRIVER_URL: &str = "http://localhost:9515";

/// Every timing constant used by wait sites, in one place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub poll_interval_ms: u64,
    pub step_timeout_secs: u64,
    pub step_attempts: u32,
    pub retry_delay_ms: u64,
    pub retry_jitter_ms: u64,
    pub popup_probe_timeout_ms: u64,
    pub popup_passes: usize,
    pub popup_settle_ms: u64,
    pub result_timeout_secs: u64,
    pub captcha_timeout_secs: u64,
    pub file_timeout_secs: u64,
    pub page_load_timeout_secs: u64,
    pub settle_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            step_timeout_secs: 10,
            step_attempts: 3,
            retry_delay_ms: 1000,
            retry_jitter_ms: 500,
            popup_probe_timeout_ms: 1500,
            popup_passes: 3,
            popup_settle_ms: 300,
            result_timeout_secs: 30,
            captcha_timeout_secs: 120,
            file_timeout_secs: 60,
            page_load_timeout_secs: 60,
            settle_ms: 800,
        }
    }
}

impl Timings {
    /// Load overrides from a JSON file; missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read timings file: {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse timings file: {}", path.display()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn retry_jitter(&self) -> Duration {
        Duration::from_millis(self.retry_jitter_ms)
    }

    pub fn popup_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.popup_probe_timeout_ms)
    }

    pub fn popup_settle(&self) -> Duration {
        Duration::from_millis(self.popup_settle_ms)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.result_timeout_secs)
    }

    pub fn captcha_timeout(&self) -> Duration {
        Duration::from_secs(self.captcha_timeout_secs)
    }

    pub fn file_timeout(&self) -> Duration {
        Duration::from_secs(self.file_timeout_secs)
    }

    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Environment-derived settings shared by every subcommand.
#[derive(Debug, Clone)]
pub struct Settings {
    pub webdriver_url: String,
    pub staging_dir: PathBuf,
    pub assets_dir: PathBuf,
}

impl Settings {
    pub fn from_env() -> Self {
        let webdriver_url = std::env::var("RPA_WEBDRIVER_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_WEBDRIVER_URL.to_string());

        let staging_dir = std::env::var("RPA_STAGING_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("fiscal-rpa-staging"));

        let assets_dir = std::env::var("RPA_ASSETS_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("assets"));

        Self {
            webdriver_url,
            staging_dir,
            assets_dir,
        }
    }
}
