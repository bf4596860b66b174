//! Client configuration, parsed from JSON at the C boundary.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::SdkError;
use crate::vpn::connection::ConnectionOptions;
use crate::vpn::telemetry::TelemetrySource;

pub const DEFAULT_API_URL: &str = "http://localhost:8080";

const ENV_API_URL: &str = "AUREO_API_URL";
const ENV_SIMULATE: &str = "AUREO_SIMULATE";

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_clock_interval_ms() -> u64 {
    1000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Forwarded as a bearer token. Never refreshed here.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Settings file; the platform config directory when unset.
    #[serde(default)]
    pub settings_path: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_clock_interval_ms")]
    pub clock_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub telemetry_source: TelemetrySource,
    /// Use the in-process backend instead of the control API.
    #[serde(default)]
    pub simulate: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            access_token: None,
            settings_path: None,
            poll_interval_ms: default_poll_interval_ms(),
            clock_interval_ms: default_clock_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            telemetry_source: TelemetrySource::default(),
            simulate: false,
        }
    }
}

fn env_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl ClientConfig {
    /// Parse a JSON config. An empty string means all defaults.
    pub fn from_json(json: &str) -> Result<Self, SdkError> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: ClientConfig = serde_json::from_str(json)
            .map_err(|e| SdkError::Config(format!("Invalid client config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `AUREO_API_URL` and `AUREO_SIMULATE` on top of the parsed
    /// values.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(
            std::env::var(ENV_API_URL).ok(),
            std::env::var(ENV_SIMULATE).ok(),
        )
    }

    fn with_overrides(mut self, api_url: Option<String>, simulate: Option<String>) -> Self {
        if let Some(url) = api_url.filter(|u| !u.trim().is_empty()) {
            log::info!("Using API URL from {}: {}", ENV_API_URL, url);
            self.api_url = url;
        }
        if let Some(flag) = simulate {
            self.simulate = env_flag(&flag);
        }
        self
    }

    pub fn validate(&self) -> Result<(), SdkError> {
        if self.poll_interval_ms == 0 || self.clock_interval_ms == 0 {
            return Err(SdkError::Config("Intervals must be non-zero".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(SdkError::Config("Request timeout must be non-zero".to_string()));
        }
        if !self.simulate && !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            return Err(SdkError::Config(format!("Invalid API URL: {}", self.api_url)));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            clock_interval: Duration::from_millis(self.clock_interval_ms),
            request_timeout: self.request_timeout(),
            telemetry_source: self.telemetry_source,
        }
    }
}
