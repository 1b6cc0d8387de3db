//! Centralized configuration for the ReWork messaging layer.
//!
//! Constant holders carry the defaults; `EngineConfig` is the runtime value
//! handed to an engine, a transport or a surface synchronizer.

use crate::error::{ReworkError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// RPC defaults.
pub struct RpcConfig;

impl RpcConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);
    pub const MAX_PAYLOAD_SIZE: usize = 65_536; // 64KB
    pub const BATCH_INTERVAL: Duration = Duration::from_millis(10);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
}

/// UI surface timing.
pub struct UiConfig;

impl UiConfig {
    pub const RENDER_DELAY: Duration = Duration::from_millis(16); // ~60fps
    pub const RENDER_CHANNEL_CAPACITY: usize = 64;
}

/// Runtime configuration consumed by the engine and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default deadline for `RpcEngine::call`, in milliseconds.
    pub request_timeout_ms: u64,
    /// Largest frame the TCP transport will read or write.
    pub max_payload_size: usize,
    /// Delay between the first `emit` and the batch flush, in milliseconds.
    pub batch_interval_ms: u64,
    /// Delay between the first surface update and the render flush.
    pub render_delay_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: RpcConfig::REQUEST_TIMEOUT.as_millis() as u64,
            max_payload_size: RpcConfig::MAX_PAYLOAD_SIZE,
            batch_interval_ms: RpcConfig::BATCH_INTERVAL.as_millis() as u64,
            render_delay_ms: UiConfig::RENDER_DELAY.as_millis() as u64,
            connect_timeout_ms: RpcConfig::CONNECT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn render_delay(&self) -> Duration {
        Duration::from_millis(self.render_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Override the default call timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_payload_size(mut self, bytes: usize) -> Self {
        self.max_payload_size = bytes;
        self
    }

    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_render_delay(mut self, delay: Duration) -> Self {
        self.render_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(ReworkError::Config {
                message: "request_timeout_ms must be greater than zero".to_string(),
            });
        }
        if self.max_payload_size == 0 || self.max_payload_size > u32::MAX as usize {
            return Err(ReworkError::Config {
                message: format!(
                    "max_payload_size must be between 1 and {} bytes",
                    u32::MAX
                ),
            });
        }
        Ok(())
    }

    /// Load a configuration from a JSON file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ReworkError::Io {
            message: format!("Failed to read config file {}: {}", path.display(), e),
            source: Some(e),
        })?;

        let config: EngineConfig =
            serde_json::from_str(&content).map_err(|e| ReworkError::Json {
                message: format!("Failed to parse config from {}: {}", path.display(), e),
                source: Some(e),
            })?;

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.request_timeout(), RpcConfig::REQUEST_TIMEOUT);
        assert_eq!(config.max_payload_size, 65_536);
        assert_eq!(config.batch_interval(), Duration::from_millis(10));
        assert_eq!(config.render_delay(), Duration::from_millis(16));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = EngineConfig::default().with_request_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(ReworkError::Config { .. })));
    }

    #[test]
    fn test_from_file_fills_missing_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"request_timeout_ms": 250}}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.max_payload_size, RpcConfig::MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_from_file_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        assert!(matches!(
            EngineConfig::from_file(file.path()),
            Err(ReworkError::Json { .. })
        ));
    }
}
