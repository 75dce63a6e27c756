//! Control-message schemas and inbound notification classification.
//!
//! Control messages are internally tagged on `type` and are exchanged
//! between a connection and the router itself; they are never routed.
//! Routed application payloads always carry a router-injected `sender`
//! field, which is how the peer side tells them apart from control
//! traffic (the router never sets `sender` on its own messages).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fields a connection declares about itself in an `identify` message.
///
/// Everything is optional; absent fields leave the router's record for
/// that connection untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub is_router: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub capabilities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub component: Option<String>,
}

/// One entry of the roster broadcast sent after every membership change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub id: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none", default)]
    pub client_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    pub connected_at: u64,
    pub is_router: bool,
}

/// Connection-to-router control traffic, tagged on `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Peer -> router: declare who this connection is.
    Identify(Identity),
    /// Router -> peer: the assigned connection id.
    #[serde(rename_all = "camelCase")]
    Welcome { client_id: String, timestamp: u64 },
    /// Router -> all: current membership.
    #[serde(rename_all = "camelCase")]
    Roster {
        clients: Vec<RosterEntry>,
        timestamp: u64,
    },
    /// Router -> all: graceful shutdown notice, sent before the grace period.
    #[serde(rename_all = "camelCase")]
    Shutdown {
        reason: String,
        grace_period_ms: u64,
        timestamp: u64,
    },
    /// Router -> peer: liveness probe.
    Ping { timestamp: u64 },
    /// Peer -> router: liveness acknowledgment.
    Pong { timestamp: u64 },
}

/// Coarse log severity, the target scale for forwarded remote logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Maps a fine-grained remote severity name onto the coarse scale.
    ///
    /// Unknown names map to `Info` so a misbehaving sender still gets its
    /// message through.
    #[must_use]
    pub fn from_fine(level: &str) -> Self {
        match level.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "verbose" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" | "critical" | "fatal" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// Classification of an inbound message with no matching pending request.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Progress event for a long-running remote operation.
    Milestone {
        operation_id: String,
        milestone: String,
        data: Option<Value>,
        timestamp: Option<u64>,
    },
    /// A log line forwarded from a remote component.
    Log { level: LogLevel, message: String },
    /// Anything else is passed through opaquely to the application.
    Other(Value),
}

impl Notification {
    /// Classifies an uncorrelated inbound message.
    #[must_use]
    pub fn classify(value: Value) -> Self {
        match value.get("type").and_then(Value::as_str) {
            Some("operationMilestone") => {
                let operation_id = value.get("operationId").and_then(Value::as_str);
                let milestone = value.get("milestone").and_then(Value::as_str);
                if let (Some(operation_id), Some(milestone)) = (operation_id, milestone) {
                    return Self::Milestone {
                        operation_id: operation_id.to_string(),
                        milestone: milestone.to_string(),
                        data: value.get("data").cloned(),
                        timestamp: value.get("timestamp").and_then(Value::as_u64),
                    };
                }
                Self::Other(value)
            }
            Some("log") => {
                let level = value
                    .get("level")
                    .and_then(Value::as_str)
                    .map_or(LogLevel::Info, LogLevel::from_fine);
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Self::Log { level, message }
            }
            _ => Self::Other(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identify_roundtrip() {
        let msg = ControlMessage::Identify(Identity {
            client_type: Some("mcp".into()),
            name: Some("A".into()),
            pid: Some(4242),
            version: Some("1.2.3".into()),
            is_router: Some(false),
            capabilities: Some(vec!["tabs".into(), "dom".into()]),
            component: Some("tool-host".into()),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "identify");
        assert_eq!(value["clientType"], "mcp");
        assert_eq!(value["isRouter"], false);

        let decoded: ControlMessage = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn identify_all_fields_optional() {
        let decoded: ControlMessage = serde_json::from_value(json!({"type": "identify"})).unwrap();
        assert_eq!(decoded, ControlMessage::Identify(Identity::default()));
    }

    #[test]
    fn welcome_uses_camel_case_tag() {
        let msg = ControlMessage::Welcome {
            client_id: "client-7".into(),
            timestamp: 1_700_000_000_000,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "welcome");
        assert_eq!(value["clientId"], "client-7");
    }

    #[test]
    fn roster_roundtrip() {
        let msg = ControlMessage::Roster {
            clients: vec![RosterEntry {
                id: "client-1".into(),
                client_type: Some("mcp".into()),
                name: Some("A".into()),
                connected_at: 1_700_000_000_000,
                is_router: false,
            }],
            timestamp: 1_700_000_000_001,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "roster");
        assert_eq!(value["clients"][0]["type"], "mcp");
        assert_eq!(value["clients"][0]["isRouter"], false);

        let decoded: ControlMessage = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn shutdown_notice_roundtrip() {
        let msg = ControlMessage::Shutdown {
            reason: "takeover".into(),
            grace_period_ms: 3000,
            timestamp: 1_700_000_000_000,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "shutdown");
        assert_eq!(value["gracePeriodMs"], 3000);

        let decoded: ControlMessage = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn routed_payload_is_not_a_control_message() {
        // Routed application payloads carry a sender and arbitrary types;
        // they must fail ControlMessage parsing and stay opaque.
        let routed = json!({"type": "response", "id": 3, "result": "pong", "sender": "client-2"});
        assert!(serde_json::from_value::<ControlMessage>(routed).is_err());
    }

    #[test]
    fn fine_levels_collapse_to_coarse_scale() {
        assert_eq!(LogLevel::from_fine("trace"), LogLevel::Debug);
        assert_eq!(LogLevel::from_fine("verbose"), LogLevel::Debug);
        assert_eq!(LogLevel::from_fine("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from_fine("info"), LogLevel::Info);
        assert_eq!(LogLevel::from_fine("notice"), LogLevel::Info);
        assert_eq!(LogLevel::from_fine("WARNING"), LogLevel::Warn);
        assert_eq!(LogLevel::from_fine("error"), LogLevel::Error);
        assert_eq!(LogLevel::from_fine("critical"), LogLevel::Error);
        assert_eq!(LogLevel::from_fine("fatal"), LogLevel::Error);
        assert_eq!(LogLevel::from_fine("made-up"), LogLevel::Info);
    }

    #[test]
    fn classify_milestone() {
        let value = json!({
            "type": "operationMilestone",
            "operationId": "op-9",
            "milestone": "navigated",
            "data": {"url": "https://example.com"},
            "timestamp": 1_700_000_000_000u64,
        });
        let classified = Notification::classify(value);
        assert_eq!(
            classified,
            Notification::Milestone {
                operation_id: "op-9".into(),
                milestone: "navigated".into(),
                data: Some(json!({"url": "https://example.com"})),
                timestamp: Some(1_700_000_000_000),
            }
        );
    }

    #[test]
    fn classify_milestone_missing_fields_is_opaque() {
        let value = json!({"type": "operationMilestone", "milestone": "half"});
        assert!(matches!(
            Notification::classify(value),
            Notification::Other(_)
        ));
    }

    #[test]
    fn classify_log() {
        let value = json!({"type": "log", "level": "warning", "message": "low disk"});
        assert_eq!(
            Notification::classify(value),
            Notification::Log {
                level: LogLevel::Warn,
                message: "low disk".into(),
            }
        );
    }

    #[test]
    fn classify_unknown_passes_through() {
        let value = json!({"type": "tabUpdated", "tabId": 4});
        assert_eq!(
            Notification::classify(value.clone()),
            Notification::Other(value)
        );
    }
}
