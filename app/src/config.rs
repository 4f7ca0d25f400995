// Application Configuration

use anyhow::Result;
use fallwatch_link::Location;
use fallwatch_monitor::{
    AlertConfig, Backoff, ConnectionConfig, DetectionConfig, FallDetectionEngine, MonitorConfig, NotifyAction,
    RegistryConfig, Thresholds,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Calibration file name inside the data directory
pub const CALIBRATION_FILE: &str = "calibration.json";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Live-data source address (host:port)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// User the monitor identifies as
    #[serde(default = "default_user_id")]
    pub user_id: String,

    /// Data directory for fall history and calibration
    #[serde(default = "default_data_dir")]
    pub data_directory: String,

    /// Log output format (text, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// First reconnect delay in milliseconds
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_ms: u64,

    /// Reconnect delay cap in seconds
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_secs: u64,

    /// Reconnect attempts before giving up (0 = never give up)
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_max_attempts: u32,

    /// Subscriber callbacks slower than this are reported (0 = off)
    #[serde(default = "default_slow_callback")]
    pub slow_callback_ms: u64,

    /// Impact threshold (m/s²)
    #[serde(default = "default_impact_threshold")]
    pub impact_threshold: f64,

    /// Rotation threshold (rad/s)
    #[serde(default = "default_rotation_threshold")]
    pub rotation_threshold: f64,

    /// Heart-rate spike threshold (bpm)
    #[serde(default = "default_heart_rate_spike")]
    pub heart_rate_spike: f64,

    /// Minimum sample confidence for detection
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Samples required before detection starts
    #[serde(default = "default_warmup_samples")]
    pub warmup_samples: usize,

    /// Seconds the user has to cancel an alert
    #[serde(default = "default_countdown")]
    pub countdown_secs: u64,

    /// Delivery attempts per emergency notification
    #[serde(default = "default_dispatch_attempts")]
    pub dispatch_attempts: u32,

    /// Seconds to wait for the source to acknowledge a notification
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,

    /// Emergency contacts
    #[serde(default)]
    pub recipients: Vec<String>,

    /// Motion samples to replay instead of (or alongside) the live link
    #[serde(default)]
    pub replay_file: Option<String>,

    /// Replay pacing in milliseconds
    #[serde(default = "default_replay_interval")]
    pub replay_interval_ms: u64,

    /// Fixed location attached to notifications
    #[serde(default)]
    pub location: Option<Location>,

    /// Local action run when a notification cannot be delivered
    #[serde(default)]
    pub escalation: Option<NotifyAction>,

    /// Path to config file (for reference)
    #[serde(skip)]
    pub config_path: PathBuf,
}

fn default_endpoint() -> String { "127.0.0.1:3001".to_string() }
fn default_user_id() -> String { "default".to_string() }
fn default_data_dir() -> String { "/var/lib/fallwatch".to_string() }
fn default_log_format() -> String { "text".to_string() }
fn default_heartbeat_interval() -> u64 { 30 }
fn default_connect_timeout() -> u64 { 10 }
fn default_reconnect_base() -> u64 { 1000 }
fn default_reconnect_max() -> u64 { 30 }
fn default_reconnect_attempts() -> u32 { 5 }
fn default_slow_callback() -> u64 { 250 }
fn default_impact_threshold() -> f64 { 12.0 }
fn default_rotation_threshold() -> f64 { 4.0 }
fn default_heart_rate_spike() -> f64 { 20.0 }
fn default_min_confidence() -> f64 { 0.85 }
fn default_warmup_samples() -> usize { 10 }
fn default_countdown() -> u64 { 30 }
fn default_dispatch_attempts() -> u32 { 3 }
fn default_ack_timeout() -> u64 { 10 }
fn default_replay_interval() -> u64 { 100 }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            user_id: default_user_id(),
            data_directory: default_data_dir(),
            log_format: default_log_format(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            connect_timeout_secs: default_connect_timeout(),
            reconnect_base_ms: default_reconnect_base(),
            reconnect_max_secs: default_reconnect_max(),
            reconnect_max_attempts: default_reconnect_attempts(),
            slow_callback_ms: default_slow_callback(),
            impact_threshold: default_impact_threshold(),
            rotation_threshold: default_rotation_threshold(),
            heart_rate_spike: default_heart_rate_spike(),
            min_confidence: default_min_confidence(),
            warmup_samples: default_warmup_samples(),
            countdown_secs: default_countdown(),
            dispatch_attempts: default_dispatch_attempts(),
            ack_timeout_secs: default_ack_timeout(),
            recipients: Vec::new(),
            replay_file: None,
            replay_interval_ms: default_replay_interval(),
            location: None,
            escalation: None,
            config_path: PathBuf::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from standard paths, falling back to defaults
    pub fn load() -> Result<Self> {
        let config_paths = [
            PathBuf::from("/etc/fallwatch/config.toml"),
            dirs::config_dir()
                .map(|p| p.join("fallwatch/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("./config.toml"),
        ];

        for path in &config_paths {
            if path.exists() {
                return Self::load_from(path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: AppConfig = toml::from_str(&content)?;
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    pub fn history_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_directory)
    }

    pub fn calibration_path(&self) -> PathBuf {
        self.history_dir().join(CALIBRATION_FILE)
    }

    /// Fall detector using the configured thresholds
    pub fn detector(&self) -> FallDetectionEngine {
        FallDetectionEngine::new(self.monitor_config().detection)
    }

    /// Library configuration for the monitor service
    pub fn monitor_config(&self) -> MonitorConfig {
        let reconnect = Backoff::new(
            Duration::from_millis(self.reconnect_base_ms),
            Duration::from_secs(self.reconnect_max_secs),
            (self.reconnect_max_attempts > 0).then_some(self.reconnect_max_attempts),
        );

        let defaults = AlertConfig::default();
        let retry = Backoff {
            max_attempts: Some(self.dispatch_attempts.max(1)),
            ..defaults.retry
        };

        MonitorConfig {
            connection: ConnectionConfig {
                user_id: self.user_id.clone(),
                heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
                reconnect,
                ..Default::default()
            },
            registry: RegistryConfig {
                slow_callback_budget: (self.slow_callback_ms > 0).then(|| Duration::from_millis(self.slow_callback_ms)),
            },
            detection: DetectionConfig {
                thresholds: Thresholds {
                    impact_magnitude: self.impact_threshold,
                    rotation_magnitude: self.rotation_threshold,
                    heart_rate_spike: self.heart_rate_spike,
                    min_confidence: self.min_confidence,
                },
                warmup_samples: self.warmup_samples,
                ..Default::default()
            },
            alert: AlertConfig {
                countdown: Duration::from_secs(self.countdown_secs),
                retry,
                recipients: self.recipients.clone(),
                location: self.location.clone(),
            },
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
        }
    }

    /// Generate example configuration
    pub fn example() -> String {
        let config = Self {
            user_id: "resident-42".to_string(),
            recipients: vec!["+15550100".to_string(), "care-team@example.org".to_string()],
            escalation: Some(NotifyAction::Multiple {
                actions: vec![
                    NotifyAction::Log {
                        level: "error".to_string(),
                        message: "Alert {id} ({severity}) could not reach {recipients}".to_string(),
                    },
                    NotifyAction::Command {
                        command: "notify-send".to_string(),
                        args: vec!["FallWatch".to_string(), "Undelivered {severity} fall alert {id}".to_string()],
                    },
                ],
            }),
            ..Default::default()
        };

        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Helper for getting config directories
mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}
