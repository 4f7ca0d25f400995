//! FallWatch Monitor Library
//!
//! Keeps the live-data link up, fans decoded metrics out to consumers,
//! evaluates motion samples for falls and runs the cancellable
//! emergency-alert protocol.

pub mod alert;
pub mod backoff;
pub mod connection;
pub mod detection;
pub mod history;
pub mod notify;
pub mod service;
pub mod subscription;

use chrono::{DateTime, Utc};
use fallwatch_link::{LinkError, LiveMetric, MotionSample};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use alert::{AlertConfig, AlertEvent, AlertState, AlertStateError, EmergencyAlertStateMachine, PendingAlert};
pub use backoff::Backoff;
pub use connection::{ConnectionConfig, ConnectionManager};
pub use detection::{
    CalibrationModel, Detection, DetectionConfig, FallDetectionEngine, FallRisk, SampleHistory, SeverityPolicy, Thresholds,
};
pub use history::{HistorySink, JsonlHistory, MemoryHistory};
pub use notify::{DispatchError, NotificationDispatcher, NotifyAction};
pub use service::{AlertChannel, LinkDispatcher, MonitorConfig, MonitorService};
pub use subscription::{DispatchReport, RegistryConfig, Subscription, SubscriptionError, SubscriptionRegistry};

/// Fall severity tiers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Move up `steps` tiers, saturating at `Critical`
    pub fn escalate(self, steps: u8) -> Self {
        let index = (self as u8).saturating_add(steps).min(Severity::Critical as u8);
        match index {
            0 => Severity::Low,
            1 => Severity::Medium,
            2 => Severity::High,
            _ => Severity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// How a fall event came to exist
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FallSource {
    Detected,
    Manual,
}

/// Fall incident, created by detection (or a manual trigger) and finalized by
/// the alert state machine as exactly one of confirmed / false alarm
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub source: FallSource,
    /// Recent samples ending with the one that triggered detection
    pub sample_window: Vec<MotionSample>,
    pub confirmed: bool,
    pub false_alarm: bool,
    /// Milliseconds from trigger to resolution
    #[serde(default)]
    pub response_time_ms: Option<u64>,
}

impl FallEvent {
    /// Maximum number of samples kept in `sample_window`
    pub const WINDOW_LIMIT: usize = 11;

    pub fn new(severity: Severity, source: FallSource) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            severity,
            source,
            sample_window: Vec::new(),
            confirmed: false,
            false_alarm: false,
            response_time_ms: None,
        }
    }

    /// Attach the sample window, keeping only the newest entries
    pub fn with_window(mut self, mut window: Vec<MotionSample>) -> Self {
        if window.len() > Self::WINDOW_LIMIT {
            window.drain(..window.len() - Self::WINDOW_LIMIT);
        }
        self.sample_window = window;
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.confirmed || self.false_alarm
    }
}

/// Connection lifecycle phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Derived health of the live channel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DataQuality {
    Offline,
    Poor,
    Good,
    Excellent,
}

impl DataQuality {
    pub const EXCELLENT_LATENCY_MS: f64 = 150.0;
    pub const GOOD_LATENCY_MS: f64 = 500.0;

    /// Quality from link state alone.
    ///
    /// `heartbeat_age` is the time since the last heartbeat reply, `None` if
    /// none arrived yet on this link. A heartbeat older than two intervals
    /// counts as poor regardless of latency.
    pub fn assess(
        connected: bool,
        latency_ms: f64,
        heartbeat_age: Option<Duration>,
        heartbeat_interval: Duration,
    ) -> Self {
        if !connected {
            return DataQuality::Offline;
        }

        if let Some(age) = heartbeat_age {
            if age > heartbeat_interval * 2 {
                return DataQuality::Poor;
            }
        }

        match latency_ms {
            l if l <= Self::EXCELLENT_LATENCY_MS => DataQuality::Excellent,
            l if l <= Self::GOOD_LATENCY_MS => DataQuality::Good,
            _ => DataQuality::Poor,
        }
    }
}

/// Snapshot of the live-data connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub phase: LinkPhase,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub latency_ms: f64,
    pub data_quality: DataQuality,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            connected: false,
            phase: LinkPhase::Disconnected,
            last_heartbeat: None,
            reconnect_attempts: 0,
            latency_ms: 0.0,
            data_quality: DataQuality::Offline,
        }
    }
}

/// Consumer-facing callbacks.
///
/// Dashboards and other collaborators observe the monitor only through
/// this trait; every method has an empty default.
pub trait MonitorObserver: Send + Sync {
    fn on_connection_status_change(&self, _status: &ConnectionStatus) {}

    fn on_live_metric(&self, _metric: &LiveMetric) {}

    fn on_error(&self, _error: &MonitorError) {}

    fn on_fall_event(&self, _event: &FallEvent) {}

    fn on_alert(&self, _event: &AlertEvent) {}
}

/// Observer that writes everything to the log
pub struct LoggingObserver;

impl MonitorObserver for LoggingObserver {
    fn on_connection_status_change(&self, status: &ConnectionStatus) {
        tracing::info!(
            connected = status.connected,
            quality = ?status.data_quality,
            latency_ms = status.latency_ms,
            "Connection {:?} (attempts: {})",
            status.phase,
            status.reconnect_attempts
        );
    }

    fn on_live_metric(&self, metric: &LiveMetric) {
        tracing::debug!(
            device = %metric.device_id,
            confidence = metric.confidence,
            "{}: {} {}",
            metric.metric_type,
            metric.value,
            metric.unit.as_deref().unwrap_or("")
        );
    }

    fn on_error(&self, error: &MonitorError) {
        tracing::warn!("Monitor error: {}", error);
    }

    fn on_fall_event(&self, event: &FallEvent) {
        tracing::warn!(
            severity = %event.severity,
            samples = event.sample_window.len(),
            "Fall detected: {}",
            event.id
        );
    }

    fn on_alert(&self, event: &AlertEvent) {
        tracing::info!("Alert: {}", event);
    }
}

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Transport error: {0}")]
    Transport(#[from] LinkError),

    #[error("Reconnect abandoned after {0} attempts")]
    ReconnectExhausted(u32),

    #[error("Inbound backlog full, dropped {0} frame")]
    Backpressure(&'static str),

    #[error("Subscriber {id} failed: {reason}")]
    Subscriber { id: String, reason: String },

    #[error("Subscriber {id} took {elapsed_ms} ms")]
    SlowSubscriber { id: String, elapsed_ms: u64 },

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    AlertState(#[from] AlertStateError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("History error: {0}")]
    History(String),

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
