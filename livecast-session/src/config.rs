use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::logging::LogFormat;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub session: SessionConfig,
    pub health: HealthConfig,
    pub quality: QualityConfig,
    pub reconnect: ReconnectConfig,
    pub webrtc: WebRtcConfig,
}

/// Signaling relay server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum inbound WebSocket frame size in bytes
    pub max_message_size: usize,
    /// Per-connection outbound buffer; messages beyond it are dropped
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            max_message_size: 64 * 1024,
            outbound_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "pretty", "compact" or "json"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Offer/answer negotiation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long an offer waits for its answer before it is retried
    pub offer_ack_timeout_ms: u64,
    /// Offer retries after the first dispatch; the next expiry closes the session
    pub max_offer_retries: u32,
    /// A pending offer younger than this blocks a new one
    pub duplicate_offer_window_ms: u64,
    /// How long `createRoom` waits for `roomCreated`
    pub room_create_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            offer_ack_timeout_ms: 10_000,
            max_offer_retries: 3,
            duplicate_offer_window_ms: 5_000,
            room_create_timeout_ms: 10_000,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn offer_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_ack_timeout_ms)
    }

    #[must_use]
    pub const fn duplicate_offer_window(&self) -> Duration {
        Duration::from_millis(self.duplicate_offer_window_ms)
    }

    #[must_use]
    pub const fn room_create_timeout(&self) -> Duration {
        Duration::from_millis(self.room_create_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub sample_interval_ms: u64,
    /// A connected session without a successful sample for longer than this is unhealthy
    pub silence_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 10_000,
            silence_timeout_ms: 10_000,
        }
    }
}

impl HealthConfig {
    #[must_use]
    pub const fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    #[must_use]
    pub const fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }
}

/// Adaptive capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub max_width: u32,
    pub max_height: u32,
    pub max_frame_rate: f64,
    pub min_width: u32,
    pub min_height: u32,
    /// Frame-rate reductions never go below this
    pub min_frame_rate: f64,
    /// Multiplier applied on a frame-rate-only reduction
    pub frame_rate_factor: f64,
    /// Multiplier applied to width/height when stepping resolution down
    /// (its inverse is used to step up)
    pub resolution_step: f64,
    /// Minimum time between two applied adjustments
    pub adjust_cooldown_ms: u64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            max_width: 1920,
            max_height: 1080,
            max_frame_rate: 30.0,
            min_width: 320,
            min_height: 180,
            min_frame_rate: 15.0,
            frame_rate_factor: 0.8,
            resolution_step: 0.75,
            adjust_cooldown_ms: 5_000,
        }
    }
}

impl QualityConfig {
    #[must_use]
    pub const fn adjust_cooldown(&self) -> Duration {
        Duration::from_millis(self.adjust_cooldown_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Pause between the recovery notification and the forced stop
    pub recovery_grace_ms: u64,
    /// Where the recovery snapshot is written
    pub snapshot_path: String,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            recovery_grace_ms: 2_000,
            snapshot_path: "./livecast-recovery.json".to_string(),
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnection attempt `attempt` (1-based): `base * 2^(attempt-1)`
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << exponent))
    }

    #[must_use]
    pub const fn recovery_grace(&self) -> Duration {
        Duration::from_millis(self.recovery_grace_ms)
    }
}

/// ICE servers handed to the WebRTC transport (STUN/TURN are provided externally)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<String>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (LIVECAST_SERVER_PORT, etc.)
        builder = builder.add_source(
            Environment::with_prefix("LIVECAST")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Relay listen address
    #[must_use]
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Check values that would make the session core misbehave
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.session.offer_ack_timeout_ms == 0 {
            errors.push("session.offer_ack_timeout_ms must be greater than 0".to_string());
        }
        if self.health.sample_interval_ms == 0 {
            errors.push("health.sample_interval_ms must be greater than 0".to_string());
        }
        if self.reconnect.max_attempts == 0 {
            errors.push("reconnect.max_attempts must be greater than 0".to_string());
        }
        if self.reconnect.base_delay_ms == 0 {
            errors.push("reconnect.base_delay_ms must be greater than 0".to_string());
        }
        if self.quality.min_frame_rate > self.quality.max_frame_rate {
            errors.push("quality.min_frame_rate exceeds quality.max_frame_rate".to_string());
        }
        if self.quality.min_width > self.quality.max_width
            || self.quality.min_height > self.quality.max_height
        {
            errors.push("quality minimum resolution exceeds the ceiling".to_string());
        }
        if !(0.0..1.0).contains(&self.quality.frame_rate_factor)
            || !(0.0..1.0).contains(&self.quality.resolution_step)
        {
            errors.push("quality factors must be within (0, 1)".to_string());
        }
        if self.logging.format.parse::<LogFormat>().is_err() {
            errors.push(format!("unknown logging.format '{}'", self.logging.format));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.session.offer_ack_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.max_offer_retries, 3);
        assert_eq!(config.health.sample_interval(), Duration::from_secs(10));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_delay() {
        let reconnect = ReconnectConfig::default();

        assert_eq!(reconnect.backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(reconnect.backoff_delay(2), Duration::from_millis(2_000));
        assert_eq!(reconnect.backoff_delay(5), Duration::from_millis(16_000));
    }

    #[test]
    fn test_listen_address() {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 9000,
                ..ServerConfig::default()
            },
            ..Config::default()
        };

        assert_eq!(config.listen_address(), "127.0.0.1:9000");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.reconnect.max_attempts = 0;
        config.logging.format = "xml".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
