//! Role election: become the router or a peer of the existing one.
//!
//! The decision runs once per process. The port bind is the actual
//! election; the health probe in front of it only avoids a pointless
//! bind attempt when a live router is already answering.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::client::{ClientEvent, RelayClient};
use crate::config::{ClientIdentity, RelayConfig};
use crate::error::RelayError;
use crate::peer::PeerConnection;
use crate::router::Router;
use relay_core::backoff::PeerState;

/// A bootstrapped relay: always a client, sometimes also the router.
pub struct Relay {
    client: RelayClient,
    router: Option<Arc<Router>>,
}

impl Relay {
    #[must_use]
    pub fn client(&self) -> &RelayClient {
        &self.client
    }

    #[must_use]
    pub fn is_router(&self) -> bool {
        self.router.is_some()
    }

    /// The owned router, when this process won the election.
    #[must_use]
    pub fn router(&self) -> Option<Arc<Router>> {
        self.router.clone()
    }

    /// Waits until the loopback/peer connection is established.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut watch = self.client.peer().state_watch();
        tokio::time::timeout(timeout, watch.wait_for(|s| *s == PeerState::Connected))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Full teardown: rejects pending requests, closes the peer
    /// connection, and stops the router if this process owns it.
    pub async fn shutdown(&self, reason: &str) {
        self.client.graceful_shutdown().await;
        if let Some(router) = &self.router {
            router.stop(reason).await;
        }
    }
}

/// Runs the election and connects.
///
/// Exactly one of any number of processes racing on the same port ends
/// up with `is_router() == true`; the rest connect as peers of the
/// winner. The winner also connects to itself, so application traffic
/// uses one code path regardless of role.
///
/// # Errors
///
/// Any bind failure other than a port conflict is fatal to relay
/// capability for this process and is returned unretried.
pub async fn bootstrap(
    config: RelayConfig,
    identity: ClientIdentity,
) -> Result<(Relay, mpsc::Receiver<ClientEvent>), RelayError> {
    let router = if probe_health(&config).await {
        info!(url = %config.health_url(), "live router found, joining as peer");
        None
    } else {
        match Router::start(config.clone()).await {
            Ok(router) => {
                info!(port = config.port, "won election, this process is the router");
                Some(router)
            }
            Err(RelayError::BindConflict { port }) => {
                // Lost a race between the probe and the bind.
                warn!(port, "bind conflict, falling back to peer");
                None
            }
            Err(err) => return Err(err),
        }
    };

    let is_router = router.is_some();
    let (peer, peer_events) = PeerConnection::connect(config.clone(), identity.to_wire(is_router));
    let (client, client_events) = RelayClient::new(peer, peer_events, config, is_router);

    Ok((Relay { client, router }, client_events))
}

/// Probes the control surface. Only a parseable body with
/// `status: "ok"` counts as a live router.
async fn probe_health(config: &RelayConfig) -> bool {
    let Ok(client) = reqwest::Client::builder()
        .timeout(config.health_probe_timeout)
        .build()
    else {
        return false;
    };
    let Ok(response) = client.get(config.health_url()).send().await else {
        return false;
    };
    if !response.status().is_success() {
        return false;
    }
    match response.json::<Value>().await {
        Ok(body) => body_reports_healthy(&body),
        Err(_) => false,
    }
}

fn body_reports_healthy(body: &Value) -> bool {
    body.get("status").and_then(Value::as_str) == Some("ok")
}
