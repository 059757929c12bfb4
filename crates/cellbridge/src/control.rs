//! App-to-tunnel control messages.
//!
//! The host app sends JSON messages of the form
//! `{"type": "statusRequest", "payload": ...}` and gets a JSON reply, or
//! nothing. Malformed and unsupported messages are silently ignored.

use crate::metrics::{TrafficMetrics, unix_now};
use crate::status::ConnectionStatus;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Something that can answer control queries
pub trait ControlSource {
    /// Current connection status
    fn current_status(&self) -> ConnectionStatus;

    /// Current traffic metrics
    fn metrics(&self) -> TrafficMetrics;
}

/// Message kinds understood on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    StatusRequest,
    MetricsRequest,
    ConfigurationUpdate,
}

/// Control message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ControlMessage {
    /// Message without payload
    pub fn new(kind: MessageType) -> Self {
        Self { kind, payload: None }
    }
}

/// Reply to `statusRequest`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub is_connected: bool,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
}

/// Handle one raw control message, returning the encoded reply if any
pub fn handle_message(source: &impl ControlSource, message: &[u8]) -> Option<Vec<u8>> {
    let message: ControlMessage = match serde_json::from_slice(message) {
        Ok(message) => message,
        Err(e) => {
            debug!("Ignoring malformed control message: {}", e);
            return None;
        }
    };

    trace!("Control message: {:?}", message.kind);

    match message.kind {
        MessageType::StatusRequest => {
            let response = StatusResponse {
                is_connected: source.current_status().connected,
                timestamp: unix_now(),
            };
            serde_json::to_vec(&response).ok()
        }
        MessageType::MetricsRequest => serde_json::to_vec(&source.metrics()).ok(),
        // Accepted on the wire, tunnel settings are fixed per session
        MessageType::ConfigurationUpdate => None,
    }
}
