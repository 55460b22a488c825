//! Shared data models for transports and their observers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of one interactive element, assigned by the remote peer.
pub type ComponentId = String;

/// Which concrete channel backs a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Socket,
    CrossFrame,
    WorkerBridge,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Socket => "socket",
            TransportKind::CrossFrame => "cross_frame",
            TransportKind::WorkerBridge => "worker_bridge",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "socket" | "websocket" => Ok(TransportKind::Socket),
            "cross_frame" | "postmessage" => Ok(TransportKind::CrossFrame),
            "worker_bridge" | "worker" => Ok(TransportKind::WorkerBridge),
            other => Err(format!("unknown transport kind: {other}")),
        }
    }
}

/// Result of a `connect()` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOutcome {
    pub success: bool,
    pub message: String,
}

impl ConnectOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

/// Snapshot of a transport's health and traffic counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub transport: TransportKind,
    pub last_activity: Option<DateTime<Utc>>,
    pub pending_updates: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors: u64,
    /// Milliseconds since the last transition to connected, 0 while disconnected.
    pub uptime_ms: u64,
}

/// Outcome of one item of a bulk update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkItemResult {
    pub component_id: ComponentId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpdateReport {
    pub results: Vec<BulkItemResult>,
    pub total_processed: usize,
    pub success_count: usize,
    pub duration_ms: u64,
}

impl BulkUpdateReport {
    pub fn failures(&self) -> impl Iterator<Item = &BulkItemResult> {
        self.results.iter().filter(|r| !r.success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kind_parses_aliases() {
        assert_eq!("websocket".parse::<TransportKind>(), Ok(TransportKind::Socket));
        assert_eq!("Cross-Frame".parse::<TransportKind>(), Ok(TransportKind::CrossFrame));
        assert_eq!("worker".parse::<TransportKind>(), Ok(TransportKind::WorkerBridge));
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn metrics_serialize_camel_case() {
        let metrics = ConnectionMetrics {
            connected: true,
            transport: TransportKind::CrossFrame,
            last_activity: None,
            pending_updates: 2,
            messages_sent: 3,
            messages_received: 4,
            errors: 0,
            uptime_ms: 10,
        };
        let value = serde_json::to_value(&metrics).unwrap();
        assert_eq!(value["transport"], "cross_frame");
        assert_eq!(value["pendingUpdates"], 2);
    }
}
