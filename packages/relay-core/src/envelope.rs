//! Wire envelope for routable relay messages.
//!
//! One JSON text frame per message, camelCase field names. Unknown fields
//! are preserved through a flattened map so the permissive routing rules
//! never lose data they do not understand.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current wall-clock time as milliseconds since the Unix epoch.
///
/// Saturates rather than panicking on clock anomalies.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// A routable message unit.
///
/// Routing directives (`broadcast`, `unicast`, `multicast`) carry their
/// payload in `data`; any other `type` is forwarded whole. `sender` and
/// `timestamp` are injected by the router on ingress and are the only
/// fields a connection is never allowed to set itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<u64>,
    /// Fields outside the routing contract, carried verbatim.
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl Envelope {
    /// Creates an envelope of the given `type` with no payload.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            target_id: None,
            target_type: None,
            data: None,
            sender: None,
            timestamp: None,
            rest: Map::new(),
        }
    }

    /// Builds a `broadcast` directive: deliver to every other connection.
    #[must_use]
    pub fn broadcast(data: Value) -> Self {
        let mut env = Self::new("broadcast");
        env.data = Some(data);
        env
    }

    /// Builds a `unicast` directive addressed to a single connection id.
    #[must_use]
    pub fn unicast(target_id: impl Into<String>, data: Value) -> Self {
        let mut env = Self::new("unicast");
        env.target_id = Some(target_id.into());
        env.data = Some(data);
        env
    }

    /// Builds a `multicast` directive addressed to a declared client type.
    #[must_use]
    pub fn multicast(target_type: impl Into<String>, data: Value) -> Self {
        let mut env = Self::new("multicast");
        env.target_type = Some(target_type.into());
        env.data = Some(data);
        env
    }
}
