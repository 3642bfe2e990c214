use std::env;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

fn get_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn get_env_bool(key: &str, default: bool) -> bool {
    match get_env(key) {
        None => default,
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"),
    }
}

fn get_env_u64(key: &str, default: u64) -> Result<u64> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<u64>()
            .map_err(|e| anyhow!("{key} invalid int: {e}"))?),
    }
}

fn get_env_string(key: &str, default: &str) -> String {
    get_env(key).unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Backend fleet API
    pub backend_base_url: String,
    pub backend_timeout_secs: u64,

    // Polling. refresh_secs is only the startup value; the live interval is
    // a preference the user can change at runtime (0 pauses polling).
    pub refresh_secs: u64,
    pub status_poll_secs: u64,
    pub history_days: u64,

    // Local storage / HTTP surface
    pub sqlite_path: String,
    pub listen_host: String,
    pub listen_port: u16,
    pub cors_permissive: bool,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let s = Self {
            backend_base_url: get_env_string("FLEET_BACKEND_URL", "http://127.0.0.1:8000"),
            backend_timeout_secs: get_env_u64("FLEET_BACKEND_TIMEOUT_SECS", 10)?,
            refresh_secs: get_env_u64("FLEET_REFRESH_SECS", 60)?,
            status_poll_secs: get_env_u64("FLEET_STATUS_POLL_SECS", 5)?,
            history_days: get_env_u64("FLEET_HISTORY_DAYS", 7)?,
            sqlite_path: get_env_string("FLEET_SQLITE_PATH", "./data/fleetboard.sqlite"),
            listen_host: get_env_string("FLEET_LISTEN_HOST", "127.0.0.1"),
            listen_port: get_env_u64("FLEET_LISTEN_PORT", 8080)? as u16,
            cors_permissive: get_env_bool("FLEET_CORS_PERMISSIVE", true),
        };

        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend_base_url.trim().is_empty() {
            return Err(anyhow!("FLEET_BACKEND_URL is empty"));
        }
        if !self.backend_base_url.starts_with("http://")
            && !self.backend_base_url.starts_with("https://")
        {
            return Err(anyhow!(
                "FLEET_BACKEND_URL must be http(s) (got {})",
                self.backend_base_url
            ));
        }
        if self.backend_timeout_secs < 1 {
            return Err(anyhow!(
                "FLEET_BACKEND_TIMEOUT_SECS must be >= 1 (got {})",
                self.backend_timeout_secs
            ));
        }
        if self.status_poll_secs < 1 {
            return Err(anyhow!(
                "FLEET_STATUS_POLL_SECS must be >= 1 (got {})",
                self.status_poll_secs
            ));
        }
        if self.history_days < 1 {
            return Err(anyhow!(
                "FLEET_HISTORY_DAYS must be >= 1 (got {})",
                self.history_days
            ));
        }
        Ok(())
    }
}
