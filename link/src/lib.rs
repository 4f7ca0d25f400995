//! FallWatch Link Layer
//!
//! Carries live health metrics and motion samples between a paired
//! wearable/phone and the FallWatch monitor.
//!
//! # Modules
//!
//! - [`frame`] - Typed inbound/outbound frames and the newline-delimited JSON codec
//! - [`tcp`] - TCP connector speaking newline-delimited JSON
//! - [`memory`] - In-process connector with a scriptable remote end
//! - [`provider`] - Local sample sources (scripted sequences, JSONL replays)
//!
//! # Example
//!
//! ```rust,no_run
//! use fallwatch_link::{Connector, InboundFrame, tcp::TcpConnector};
//!
//! #[tokio::main]
//! async fn main() {
//!     let connector = TcpConnector::new("127.0.0.1:3001");
//!     let mut link = connector.connect().await.unwrap();
//!
//!     while let Some(frame) = link.inbound.recv().await {
//!         if let Ok(InboundFrame::LiveHealthUpdate { data, .. }) = frame {
//!             println!("{:?}: {} ({})", data.metric_type, data.value, data.device_id);
//!         }
//!     }
//! }
//! ```

use chrono::{DateTime, Utc};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

pub mod frame;
pub mod provider;

#[cfg(feature = "tcp")]
pub mod tcp;

#[cfg(feature = "memory")]
pub mod memory;

// Re-exports for convenience
pub use frame::{EmergencyNotification, InboundFrame, Location, OutboundFrame};
pub use provider::{JsonlProvider, SampleProvider, ScriptedProvider};

/// Capacity of the per-link frame channels
pub const LINK_CHANNEL_CAPACITY: usize = 1000;

/// Connector trait implemented by every transport
pub trait Connector: Send + Sync {
    /// Human readable endpoint description
    fn endpoint(&self) -> &str;

    /// Open a new link to the live-data source
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<Link, LinkError>> + Send + '_>>;
}

/// An open link.
///
/// The link is closed from the remote side when `inbound` yields `None`;
/// dropping `outbound` closes it from the local side.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::Sender<OutboundFrame>,
    pub inbound: mpsc::Receiver<Result<InboundFrame, LinkError>>,
}

impl Link {
    /// Create a link plus the remote halves of its channels
    pub fn pair() -> (Self, mpsc::Receiver<OutboundFrame>, mpsc::Sender<Result<InboundFrame, LinkError>>) {
        let (out_tx, out_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);

        (Self { outbound: out_tx, inbound: in_rx }, out_rx, in_tx)
    }
}

/// Link error types
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Decode(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Link closed")]
    Closed,

    #[error("Outbound queue full")]
    QueueFull,

    #[error("Timeout")]
    Timeout,

    #[error("Remote error: {0}")]
    Remote(String),
}

impl From<serde_json::Error> for LinkError {
    fn from(e: serde_json::Error) -> Self {
        LinkError::Decode(e.to_string())
    }
}

/// Metric types carried by live health updates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    HeartRate,
    Steps,
    WalkingSteadiness,
    Activity,
    Sleep,
    FallEvent,
    /// Anything the source sends that this build does not know about
    #[serde(other)]
    Unknown,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::HeartRate => "heart_rate",
            MetricType::Steps => "steps",
            MetricType::WalkingSteadiness => "walking_steadiness",
            MetricType::Activity => "activity",
            MetricType::Sleep => "sleep",
            MetricType::FallEvent => "fall_event",
            MetricType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Flag(bool),
    Text(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Number(v)
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Flag(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Number(v) => write!(f, "{}", v),
            MetricValue::Flag(v) => write!(f, "{}", v),
            MetricValue::Text(v) => f.write_str(v),
        }
    }
}

/// One timestamped, typed health reading
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveMetric {
    pub metric_type: MetricType,
    pub value: MetricValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
    pub device_id: String,
}

impl LiveMetric {
    pub fn new(metric_type: MetricType, value: impl Into<MetricValue>, device_id: &str, confidence: f64) -> Self {
        Self {
            metric_type,
            value: value.into(),
            unit: None,
            timestamp: Utc::now(),
            confidence,
            device_id: device_id.to_string(),
        }
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    /// Reject metrics whose confidence is outside `[0, 1]`
    pub fn validate(&self) -> Result<(), LinkError> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(LinkError::InvalidFrame(format!(
                "confidence {} out of range for {} metric",
                self.confidence, self.metric_type
            )));
        }
        Ok(())
    }
}

/// Raw motion sample from the wearable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MotionSample {
    pub timestamp: DateTime<Utc>,
    /// Accelerometer reading (m/s²)
    pub accel: Vector3<f64>,
    /// Gyroscope reading (rad/s)
    pub gyro: Vector3<f64>,
    /// Heart rate (bpm), absent while the sensor is unavailable
    #[serde(default)]
    pub heart_rate: Option<f64>,
    pub confidence: f64,
    #[serde(default)]
    pub device_id: String,
}

impl MotionSample {
    pub fn new(accel: Vector3<f64>, gyro: Vector3<f64>, confidence: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            accel,
            gyro,
            heart_rate: None,
            confidence,
            device_id: String::new(),
        }
    }

    pub fn with_heart_rate(mut self, bpm: f64) -> Self {
        self.heart_rate = Some(bpm);
        self
    }

    pub fn with_device(mut self, device_id: &str) -> Self {
        self.device_id = device_id.to_string();
        self
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        let finite = self.accel.iter().chain(self.gyro.iter()).all(|v| v.is_finite());
        if !finite {
            return Err(LinkError::InvalidFrame("non-finite motion vector".to_string()));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(LinkError::InvalidFrame(format!(
                "confidence {} out of range for motion sample",
                self.confidence
            )));
        }
        Ok(())
    }
}
