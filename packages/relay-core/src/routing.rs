//! Pure routing rules: envelope + sender + roster in, recipient set and
//! final payload out. No I/O; the router applies the decision.

use serde_json::{Map, Value};

use crate::envelope::Envelope;

/// The slice of connection state routing needs: id and declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterPeer {
    pub id: String,
    pub client_type: Option<String>,
}

/// Outcome of running the routing rules against one envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// `identify` is consumed by the router itself, never routed.
    Identify,
    /// Nothing to deliver (e.g. unicast to an unknown id). Silent no-op.
    Drop,
    /// Deliver `payload` to each recipient id, in roster order.
    Deliver {
        recipients: Vec<String>,
        payload: Value,
    },
}

/// Applies the routing rules, in priority order:
///
/// 1. `identify` — consumed by the router (record merge + roster broadcast).
/// 2. `unicast {targetId, data}` — the single matching connection, or a
///    silent drop when the target does not exist.
/// 3. `multicast {targetType, data}` — every connection except the sender
///    whose declared type matches.
/// 4. `broadcast {data}`, or any unrecognized `type` — every connection
///    except the sender. The fallback is deliberate permissiveness kept for
///    wire compatibility with existing peers.
///
/// Every delivered payload leaves this function with `sender` set to the
/// originating connection id and a `timestamp` (the inbound one when
/// present, otherwise `now_ms`), regardless of which rule matched.
#[must_use]
pub fn route(
    envelope: &Envelope,
    sender_id: &str,
    roster: &[RosterPeer],
    now_ms: u64,
) -> RouteDecision {
    match envelope.kind.as_str() {
        "identify" => RouteDecision::Identify,
        "unicast" => {
            let Some(target_id) = envelope.target_id.as_deref() else {
                return RouteDecision::Drop;
            };
            if roster.iter().any(|peer| peer.id == target_id) {
                RouteDecision::Deliver {
                    recipients: vec![target_id.to_string()],
                    payload: directive_payload(envelope, sender_id, now_ms),
                }
            } else {
                RouteDecision::Drop
            }
        }
        "multicast" => {
            let Some(target_type) = envelope.target_type.as_deref() else {
                return RouteDecision::Drop;
            };
            let recipients: Vec<String> = roster
                .iter()
                .filter(|peer| peer.id != sender_id)
                .filter(|peer| peer.client_type.as_deref() == Some(target_type))
                .map(|peer| peer.id.clone())
                .collect();
            if recipients.is_empty() {
                return RouteDecision::Drop;
            }
            RouteDecision::Deliver {
                recipients,
                payload: directive_payload(envelope, sender_id, now_ms),
            }
        }
        "broadcast" => deliver_to_all(envelope, sender_id, roster, now_ms, true),
        _ => deliver_to_all(envelope, sender_id, roster, now_ms, false),
    }
}

fn deliver_to_all(
    envelope: &Envelope,
    sender_id: &str,
    roster: &[RosterPeer],
    now_ms: u64,
    use_data: bool,
) -> RouteDecision {
    let recipients: Vec<String> = roster
        .iter()
        .filter(|peer| peer.id != sender_id)
        .map(|peer| peer.id.clone())
        .collect();
    if recipients.is_empty() {
        return RouteDecision::Drop;
    }
    let payload = if use_data {
        directive_payload(envelope, sender_id, now_ms)
    } else {
        // Unrecognized type: there is no data contract, forward the whole
        // envelope with attribution injected.
        let value = serde_json::to_value(envelope).unwrap_or(Value::Null);
        inject(value, sender_id, now_ms)
    };
    RouteDecision::Deliver {
        recipients,
        payload,
    }
}

/// Extracts the `data` payload of a routing directive and injects
/// attribution. Non-object data is wrapped so injection always has an
/// object to write into.
fn directive_payload(envelope: &Envelope, sender_id: &str, now_ms: u64) -> Value {
    let data = envelope.data.clone().unwrap_or(Value::Object(Map::new()));
    inject(data, sender_id, now_ms)
}

fn inject(value: Value, sender_id: &str, now_ms: u64) -> Value {
    let mut obj = match value {
        Value::Object(obj) => obj,
        other => {
            let mut wrapped = Map::new();
            wrapped.insert("data".to_string(), other);
            wrapped
        }
    };
    // The sender field is always router-owned; a connection can never
    // attribute a message to someone else.
    obj.insert("sender".to_string(), Value::String(sender_id.to_string()));
    obj.entry("timestamp".to_string())
        .or_insert_with(|| Value::from(now_ms));
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: u64 = 1_700_000_000_000;

    fn roster() -> Vec<RosterPeer> {
        vec![
            RosterPeer {
                id: "client-1".into(),
                client_type: Some("mcp".into()),
            },
            RosterPeer {
                id: "client-2".into(),
                client_type: Some("server".into()),
            },
            RosterPeer {
                id: "client-3".into(),
                client_type: Some("server".into()),
            },
            RosterPeer {
                id: "client-4".into(),
                client_type: None,
            },
        ]
    }

    fn recipients(decision: RouteDecision) -> Vec<String> {
        match decision {
            RouteDecision::Deliver { recipients, .. } => recipients,
            other => panic!("expected Deliver, got {other:?}"),
        }
    }

    #[test]
    fn identify_is_never_routed() {
        let env = Envelope::new("identify");
        assert_eq!(
            route(&env, "client-1", &roster(), NOW),
            RouteDecision::Identify
        );
    }

    #[test]
    fn unicast_delivers_to_single_target() {
        let env = Envelope::unicast("client-2", json!({"hello": true}));
        let decision = route(&env, "client-1", &roster(), NOW);
        let RouteDecision::Deliver {
            recipients,
            payload,
        } = decision
        else {
            panic!("expected Deliver");
        };
        assert_eq!(recipients, vec!["client-2".to_string()]);
        assert_eq!(payload["hello"], true);
        assert_eq!(payload["sender"], "client-1");
        assert_eq!(payload["timestamp"], NOW);
    }

    #[test]
    fn unicast_to_unknown_target_is_silent_noop() {
        let env = Envelope::unicast("client-999", json!({}));
        assert_eq!(route(&env, "client-1", &roster(), NOW), RouteDecision::Drop);
    }

    #[test]
    fn unicast_without_target_id_is_dropped() {
        let mut env = Envelope::new("unicast");
        env.data = Some(json!({}));
        assert_eq!(route(&env, "client-1", &roster(), NOW), RouteDecision::Drop);
    }

    #[test]
    fn multicast_matches_declared_type_and_excludes_sender() {
        let env = Envelope::multicast("server", json!({"id": 1}));
        // client-2 is itself a "server": it must not receive its own message.
        let got = recipients(route(&env, "client-2", &roster(), NOW));
        assert_eq!(got, vec!["client-3".to_string()]);
    }

    #[test]
    fn multicast_excludes_unidentified_connections() {
        let env = Envelope::multicast("server", json!({}));
        let got = recipients(route(&env, "client-1", &roster(), NOW));
        assert_eq!(got, vec!["client-2".to_string(), "client-3".to_string()]);
    }

    #[test]
    fn multicast_with_no_match_is_dropped() {
        let env = Envelope::multicast("extension", json!({}));
        assert_eq!(route(&env, "client-1", &roster(), NOW), RouteDecision::Drop);
    }

    #[test]
    fn broadcast_reaches_everyone_but_sender() {
        let env = Envelope::broadcast(json!({"news": "hi"}));
        let got = recipients(route(&env, "client-3", &roster(), NOW));
        assert_eq!(
            got,
            vec![
                "client-1".to_string(),
                "client-2".to_string(),
                "client-4".to_string()
            ]
        );
    }

    #[test]
    fn unrecognized_type_falls_back_to_broadcast_of_whole_envelope() {
        let raw = json!({"type": "tabEvent", "tabId": 9});
        let env: Envelope = serde_json::from_value(raw).unwrap();
        let decision = route(&env, "client-1", &roster(), NOW);
        let RouteDecision::Deliver {
            recipients,
            payload,
        } = decision
        else {
            panic!("expected Deliver");
        };
        assert_eq!(recipients.len(), 3);
        assert_eq!(payload["type"], "tabEvent");
        assert_eq!(payload["tabId"], 9);
        assert_eq!(payload["sender"], "client-1");
    }

    #[test]
    fn sender_is_always_overwritten() {
        // A connection claiming to be someone else gets corrected on ingress.
        let env = Envelope::broadcast(json!({"sender": "client-999", "x": 1}));
        let decision = route(&env, "client-4", &roster(), NOW);
        let RouteDecision::Deliver { payload, .. } = decision else {
            panic!("expected Deliver");
        };
        assert_eq!(payload["sender"], "client-4");
    }

    #[test]
    fn existing_timestamp_is_preserved() {
        let env = Envelope::broadcast(json!({"timestamp": 42}));
        let RouteDecision::Deliver { payload, .. } = route(&env, "client-1", &roster(), NOW)
        else {
            panic!("expected Deliver");
        };
        assert_eq!(payload["timestamp"], 42);
    }

    #[test]
    fn non_object_data_is_wrapped_before_injection() {
        let env = Envelope::broadcast(json!("just a string"));
        let RouteDecision::Deliver { payload, .. } = route(&env, "client-1", &roster(), NOW)
        else {
            panic!("expected Deliver");
        };
        assert_eq!(payload["data"], "just a string");
        assert_eq!(payload["sender"], "client-1");
    }

    #[test]
    fn empty_roster_drops_broadcast() {
        let env = Envelope::broadcast(json!({}));
        assert_eq!(route(&env, "client-1", &[], NOW), RouteDecision::Drop);
    }
}
