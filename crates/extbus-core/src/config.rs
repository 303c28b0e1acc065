//! Bus configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BusError;
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Path to the extension storage database
    pub database_path: PathBuf,
    /// How long a background page snapshot may take before resolving to null
    pub snapshot_timeout_ms: u64,
    /// How long a context waits for a correlated response
    pub response_timeout_ms: u64,
    /// Smallest accepted `delayInMinutes` / `periodInMinutes` for alarms
    pub min_alarm_delay_minutes: f64,
    /// Cancel the pending timer when an alarm is cleared
    pub cancel_cleared_alarms: bool,
    /// Fallback filter when `RUST_LOG` is unset
    pub log_filter: String,
}

impl BusConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            database_path: data_dir.join("extensions.db"),
            snapshot_timeout_ms: 10_000,
            response_timeout_ms: 30_000,
            min_alarm_delay_minutes: 1.0,
            cancel_cleared_alarms: true,
            log_filter: "info".to_string(),
        }
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|d| d.join("extbus"))
            .unwrap_or_else(|| PathBuf::from(".extbus"))
    }

    /// Read a JSON config file. Missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: BusConfig = serde_json::from_str(&text)
            .map_err(|e| BusError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.min_alarm_delay_minutes.is_finite() || self.min_alarm_delay_minutes <= 0.0 {
            return Err(BusError::Config(format!(
                "min_alarm_delay_minutes must be positive, got {}",
                self.min_alarm_delay_minutes
            )));
        }
        if self.snapshot_timeout_ms == 0 {
            return Err(BusError::Config(
                "snapshot_timeout_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new(Self::data_dir())
    }
}

mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        }
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library/Application Support"))
        }
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_DATA_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".local/share"))
                })
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }
}
