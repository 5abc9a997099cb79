//! Wire protocol shared by the daemon and its clients.
//!
//! Every message is one JSON object per line:
//! `{"type": "<discriminant>", "id": <u64>, "payload": {...}}`.
//! `id` is assigned by the client on requests and copied into the reply;
//! broadcasts carry none. Unknown discriminants decode fine and are simply
//! not handled by anyone.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::StateChange;
use crate::output::Level;
use crate::runner::{PortCheck, ServiceLogLine};
use crate::service::{ServiceSnapshot, ServiceStatus};

// Requests.
pub const START: &str = "start";
pub const STOP: &str = "stop";
pub const RESTART: &str = "restart";
pub const STATUS: &str = "status";
pub const LOGS: &str = "logs";
pub const CHECK_PORTS: &str = "check_ports";
pub const KILL_PORTS: &str = "kill_ports";
pub const CLEAR_LOGS: &str = "clear_logs";
pub const SHUTDOWN: &str = "shutdown";

// Responses.
pub const STARTED: &str = "started";
pub const STOPPED: &str = "stopped";
pub const RESTARTED: &str = "restarted";
pub const STATUS_RESPONSE: &str = "status_response";
pub const LOGS_RESPONSE: &str = "logs_response";
pub const PORTS_RESPONSE: &str = "ports_response";
pub const KILL_RESPONSE: &str = "kill_response";
pub const LOGS_CLEARED: &str = "logs_cleared";
pub const SHUTTING_DOWN: &str = "shutting_down";

// Broadcasts.
pub const LOG_ENTRY: &str = "log_entry";
pub const SERVICE_STATE: &str = "service_state";

pub const ERROR: &str = "error";

/// The success response paired with a request discriminant.
pub fn response_for(request: &str) -> Option<&'static str> {
    match request {
        START => Some(STARTED),
        STOP => Some(STOPPED),
        RESTART => Some(RESTARTED),
        STATUS => Some(STATUS_RESPONSE),
        LOGS => Some(LOGS_RESPONSE),
        CHECK_PORTS => Some(PORTS_RESPONSE),
        KILL_PORTS => Some(KILL_RESPONSE),
        CLEAR_LOGS => Some(LOGS_CLEARED),
        SHUTDOWN => Some(SHUTTING_DOWN),
        _ => None,
    }
}

/// Envelope for every message on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Message {
    pub fn new<T: Serialize>(kind: &str, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.to_string(),
            id: None,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn with_id(mut self, id: Option<u64>) -> Self {
        self.id = id;
        self
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ERROR.to_string(),
            id: None,
            payload: serde_json::json!({ "error": message.into() }),
        }
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Decodes the payload; a missing payload decodes as `{}`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        if self.payload.is_null() {
            serde_json::from_value(Value::Object(Default::default()))
        } else {
            serde_json::from_value(self.payload.clone())
        }
    }

    /// Error text of an `error` message.
    pub fn error_message(&self) -> Option<String> {
        if !self.is(ERROR) {
            return None;
        }
        let payload: ErrorPayload = self.parse().unwrap_or_default();
        Some(payload.error)
    }

    /// Serializes the message as one newline-terminated line.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartRequest {
    /// Services to start; the configured defaults when empty.
    pub services: Vec<String>,
    /// Kill foreign processes holding the services' ports first.
    pub kill_ports: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartedResponse {
    pub services: Vec<String>,
}

/// Payload of `stop`, `stopped`, `clear_logs` and `logs_cleared`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceTarget {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

/// Payload of `restart` and `restarted`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartRequest {
    pub service: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusResponse {
    pub services: Vec<ServiceSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub lines: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsResponse {
    pub logs: Vec<LogEntry>,
}

/// One log line as sent over the wire, both in `logs_response` and `log_entry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub service: String,
    pub level: Level,
    pub message: String,
}

impl From<ServiceLogLine> for LogEntry {
    fn from(entry: ServiceLogLine) -> Self {
        Self {
            time: entry.line.timestamp,
            service: entry.service,
            level: entry.line.level,
            message: entry.line.text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortStatus {
    pub service: String,
    pub port: u16,
    pub in_use: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl From<PortCheck> for PortStatus {
    fn from(check: PortCheck) -> Self {
        Self {
            service: check.service,
            port: check.port,
            in_use: check.in_use,
            pid: check.pid,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortsResponse {
    pub ports: Vec<PortStatus>,
    pub has_conflict: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KillPortsRequest {
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KillResponse {
    pub killed: Vec<u16>,
    pub failed: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStateEvent {
    pub service: String,
    pub status: ServiceStatus,
    pub running: bool,
    pub exit_code: Option<i32>,
    pub run_count: u32,
}

impl From<StateChange> for ServiceStateEvent {
    fn from(change: StateChange) -> Self {
        Self {
            service: change.service,
            status: change.status,
            running: change.running,
            exit_code: change.exit_code,
            run_count: change.run_count,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPayload {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_request_has_one_response() {
        for (request, response) in [
            (START, STARTED),
            (STOP, STOPPED),
            (RESTART, RESTARTED),
            (STATUS, STATUS_RESPONSE),
            (LOGS, LOGS_RESPONSE),
            (CHECK_PORTS, PORTS_RESPONSE),
            (KILL_PORTS, KILL_RESPONSE),
            (CLEAR_LOGS, LOGS_CLEARED),
            (SHUTDOWN, SHUTTING_DOWN),
        ] {
            assert_eq!(response_for(request), Some(response));
        }
        assert_eq!(response_for(LOG_ENTRY), None);
        assert_eq!(response_for("reboot"), None);
    }

    #[test]
    fn encodes_one_line_with_type_and_id() {
        let message = Message::new(
            START,
            &StartRequest {
                services: vec!["api".into()],
                kill_ports: true,
            },
        )
        .unwrap()
        .with_id(Some(7));
        let line = message.encode().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "start");
        assert_eq!(value["id"], 7);
        assert_eq!(value["payload"]["killPorts"], true);
        assert_eq!(Message::decode(&line).unwrap(), message);
    }

    #[test]
    fn unknown_type_and_missing_payload_decode() {
        let message = Message::decode(r#"{"type":"telemetry"}"#).unwrap();
        assert_eq!(message.kind, "telemetry");
        assert_eq!(message.id, None);
        let target: ServiceTarget = message.parse().unwrap();
        assert_eq!(target.service, None);

        let status: LogsRequest = Message::decode(r#"{"type":"logs","payload":{"service":"api"}}"#)
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(status.service.as_deref(), Some("api"));
        assert_eq!(status.lines, 0);

        assert!(Message::decode("not json").is_err());
    }

    #[test]
    fn error_message_is_extracted() {
        let message = Message::error("unknown service: nope").with_id(Some(3));
        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded.error_message().as_deref(), Some("unknown service: nope"));
        assert_eq!(decoded.id, Some(3));
        assert_eq!(Message::new(STOPPED, &ServiceTarget::default()).unwrap().error_message(), None);
    }

    #[test]
    fn ports_payload_uses_camel_case() {
        let payload = PortsResponse {
            ports: vec![PortStatus {
                service: "api".into(),
                port: 8080,
                in_use: true,
                pid: Some(42),
            }],
            has_conflict: true,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["hasConflict"], true);
        assert_eq!(value["ports"][0]["inUse"], true);
        assert_eq!(value["ports"][0]["pid"], 42);
    }
}
