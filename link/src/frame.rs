//! Wire frames for the FallWatch link
//!
//! Every frame is one JSON object tagged by `type`, one frame per line.

use crate::{LinkError, LiveMetric, MetricType, MotionSample};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frames received from the live-data source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Greeting sent by the source after the socket opens
    #[serde(rename_all = "camelCase")]
    ConnectionEstablished {
        client_id: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    /// Decoded health metric
    LiveHealthUpdate {
        data: LiveMetric,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    /// Raw motion sample for fall detection
    MotionSample { data: MotionSample },
    /// Heartbeat reply
    Pong { nonce: u64 },
    /// Acknowledgment of a dispatched emergency notification
    #[serde(rename_all = "camelCase")]
    EmergencyAck { alert_id: String },
    /// Error reported by the source
    Error { message: String },
}

impl InboundFrame {
    /// Short frame name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            InboundFrame::ConnectionEstablished { .. } => "connection_established",
            InboundFrame::LiveHealthUpdate { .. } => "live_health_update",
            InboundFrame::MotionSample { .. } => "motion_sample",
            InboundFrame::Pong { .. } => "pong",
            InboundFrame::EmergencyAck { .. } => "emergency_ack",
            InboundFrame::Error { .. } => "error",
        }
    }
}

/// Frames sent to the live-data source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    #[serde(rename_all = "camelCase")]
    ClientIdentification { client_type: String, user_id: String },
    Ping { nonce: u64 },
    #[serde(rename_all = "camelCase")]
    SubscribeHealthUpdates {
        subscription_id: String,
        metrics: Vec<MetricType>,
    },
    #[serde(rename_all = "camelCase")]
    UnsubscribeHealthUpdates { subscription_id: String },
    #[serde(rename_all = "camelCase")]
    EmergencyAlert {
        alert_id: String,
        data: EmergencyNotification,
    },
}

impl OutboundFrame {
    /// Short frame name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundFrame::ClientIdentification { .. } => "client_identification",
            OutboundFrame::Ping { .. } => "ping",
            OutboundFrame::SubscribeHealthUpdates { .. } => "subscribe_health_updates",
            OutboundFrame::UnsubscribeHealthUpdates { .. } => "unsubscribe_health_updates",
            OutboundFrame::EmergencyAlert { .. } => "emergency_alert",
        }
    }
}

/// Emergency notification payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyNotification {
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Severity tier name (`low`, `medium`, `high`, `critical`)
    pub severity: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// Geographic location, if the phone shares one
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
}

/// Decode one inbound line
pub fn decode(line: &str) -> Result<InboundFrame, LinkError> {
    let frame: InboundFrame = serde_json::from_str(line.trim())?;

    match &frame {
        InboundFrame::LiveHealthUpdate { data, .. } => data.validate()?,
        InboundFrame::MotionSample { data } => data.validate()?,
        _ => {}
    }

    Ok(frame)
}

/// Encode one outbound frame, including the trailing newline
pub fn encode(frame: &OutboundFrame) -> Result<String, LinkError> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}
