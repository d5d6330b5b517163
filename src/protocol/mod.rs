//! Control protocol between the supervisor and its worker processes.
//!
//! Everything crossing the parent↔worker boundary is a typed [`IpcEnvelope`]
//! serialized as one JSON line. The same channel also carries incidental
//! process output, so parsing is lenient: a line that is not a well-formed
//! envelope yields `None` instead of an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod transport;

pub use transport::IpcWriter;

/// One message in transit between the supervisor and a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpcEnvelope {
    #[serde(flatten)]
    pub payload: IpcPayload,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Envelope discriminant plus its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcPayload {
    Command { command: WorkerCommand },
    Event { event: WorkerEvent },
    StatusRequest,
    StatusResponse { status: WorkerStatus },
}

/// Commands the supervisor sends down to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerCommand {
    Shutdown { graceful: bool },
    StatusRequest,
    RestartConnection,
    RefreshAdmins,
    RefreshPermissions,
    RefreshCredentials { payload: serde_json::Value },
}

/// Lifecycle events a worker reports up to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEvent {
    Ready,
    Connected,
    Disconnected { reason: String },
    Kicked,
    ConnectionFailed { attempt: u32 },
    Error { message: String },
    CredentialsUpdated { payload: serde_json::Value },
    RefreshRequested,
    IntentionalLeave,
}

/// Point-in-time worker self-report, produced on demand.
///
/// Consumed by the health monitor to refresh the supervisor-side record;
/// state always flows worker→parent, never the reverse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub state: String,
    pub connected: bool,
    pub uptime_secs: u64,
    pub retry_count: u32,
    pub connection_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl IpcEnvelope {
    pub fn command(command: WorkerCommand) -> Self {
        Self {
            payload: IpcPayload::Command { command },
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn event(event: WorkerEvent) -> Self {
        Self {
            payload: IpcPayload::Event { event },
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn status_request(correlation_id: impl Into<String>) -> Self {
        Self {
            payload: IpcPayload::StatusRequest,
            timestamp: Utc::now(),
            correlation_id: Some(correlation_id.into()),
        }
    }

    /// A `status_response` must echo the correlation ID of the request that
    /// prompted it (if any).
    pub fn status_response(status: WorkerStatus, correlation_id: Option<String>) -> Self {
        Self {
            payload: IpcPayload::StatusResponse { status },
            timestamp: Utc::now(),
            correlation_id,
        }
    }
}

/// Parse one transport line into an envelope.
///
/// Returns `None` for anything that is not a complete envelope: plain text,
/// malformed JSON, or JSON missing the `type` or `timestamp` fields.
pub fn parse_line(line: &str) -> Option<IpcEnvelope> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_envelope_roundtrip() {
        let envelope = IpcEnvelope::command(WorkerCommand::Shutdown { graceful: true });
        let line = serde_json::to_string(&envelope).unwrap();
        let parsed = parse_line(&line).expect("well-formed envelope should parse");
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn status_response_echoes_correlation_id() {
        let request = IpcEnvelope::status_request("req-42");
        let status = WorkerStatus {
            state: "connected".to_string(),
            connected: true,
            uptime_secs: 120,
            retry_count: 0,
            connection_attempts: 1,
            last_error: None,
        };
        let response = IpcEnvelope::status_response(status, request.correlation_id.clone());
        assert_eq!(response.correlation_id.as_deref(), Some("req-42"));

        let line = serde_json::to_string(&response).unwrap();
        let parsed = parse_line(&line).unwrap();
        assert_eq!(parsed.correlation_id.as_deref(), Some("req-42"));
    }

    #[test]
    fn rejects_incidental_process_output() {
        assert!(parse_line("worker started on pid 4242").is_none());
        assert!(parse_line("").is_none());
        assert!(parse_line("   ").is_none());
        // JSON, but not an envelope: no type, no timestamp
        assert!(parse_line(r#"{"message": "hello"}"#).is_none());
        // Has a type but no timestamp
        assert!(parse_line(r#"{"type": "event", "event": {"kind": "ready"}}"#).is_none());
        // Truncated JSON
        assert!(parse_line(r#"{"type": "event", "#).is_none());
    }

    #[test]
    fn event_wire_format_uses_snake_case_kinds() {
        let envelope = IpcEnvelope::event(WorkerEvent::ConnectionFailed { attempt: 2 });
        let line = serde_json::to_string(&envelope).unwrap();
        assert!(line.contains(r#""type":"event""#));
        assert!(line.contains(r#""kind":"connection_failed""#));
        assert!(line.contains(r#""attempt":2"#));
    }

    #[test]
    fn disconnected_reason_survives_roundtrip() {
        let envelope = IpcEnvelope::event(WorkerEvent::Disconnected {
            reason: "mesh closed".to_string(),
        });
        let parsed = parse_line(&serde_json::to_string(&envelope).unwrap()).unwrap();
        match parsed.payload {
            IpcPayload::Event {
                event: WorkerEvent::Disconnected { reason },
            } => assert_eq!(reason, "mesh closed"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
