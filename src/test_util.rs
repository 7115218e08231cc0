//! Helpers shared by the tests of several modules.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::{SiteEntry, WanConfig};
use crate::handler::{PeerFault, PeerFaultHandler, RemoteMessageHandler};
use crate::site::SiteId;

/// a config with the given site table and fast connect retries, everything
///  else at defaults
pub fn test_config(local_site_id: SiteId, sites: &[(SiteId, &str, u16)]) -> WanConfig {
    WanConfig {
        version: 1,
        transport: "tcp".to_string(),
        local_site_id,
        max_payload_size: 64 * 1024,
        window_size: None,
        sites: sites.iter()
            .map(|&(id, ip, port)| SiteEntry {
                id,
                ip: ip.to_string(),
                port,
            })
            .collect(),
        connect_max_attempts: 20,
        connect_backoff_ms: 5,
        connect_backoff_max_ms: 50,
        ack_liveness_timeout_ms: None,
    }
}

/// [RemoteMessageHandler] that records every delivery for later assertions.
#[derive(Debug, Default)]
pub struct TrackingRemoteHandler {
    received: Arc<RwLock<Vec<(SiteId, Vec<u8>)>>>,
}

impl TrackingRemoteHandler {
    pub fn new() -> TrackingRemoteHandler {
        Default::default()
    }

    /// asserts that the oldest unconsumed delivery is `payload` from
    ///  `origin_site`, waiting a little for it to arrive
    pub async fn assert_received(&self, origin_site: SiteId, payload: &[u8]) {
        for _ in 0..500 {
            if !self.received.read().await.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let mut lock = self.received.write().await;
        if lock.is_empty() {
            panic!("no message was delivered");
        }
        let (actual_origin, actual_payload) = lock.remove(0);
        assert_eq!((actual_origin, actual_payload.as_slice()), (origin_site, payload));
    }

    pub async fn assert_nothing_else_received(&self) {
        assert!(
            self.received.read().await
                .is_empty()
        );
    }
}

#[async_trait]
impl RemoteMessageHandler for TrackingRemoteHandler {
    async fn on_remote_message(&self, origin_site: SiteId, payload: &[u8]) {
        self.received.write().await.push((origin_site, payload.to_vec()));
    }
}

/// [PeerFaultHandler] that records every reported fault for later assertions.
#[derive(Debug, Default)]
pub struct TrackingFaultHandler {
    faults: Arc<RwLock<Vec<(SiteId, PeerFault, String)>>>,
}

impl TrackingFaultHandler {
    pub fn new() -> TrackingFaultHandler {
        Default::default()
    }

    /// asserts that a fault of the given kind was reported for `site`,
    ///  waiting a little for it to arrive
    pub async fn assert_fault(&self, site: SiteId, fault: PeerFault) {
        for _ in 0..500 {
            if !self.faults.read().await.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let faults = self.faults.read().await;
        assert!(
            faults.iter().any(|(s, f, _)| (*s, *f) == (site, fault)),
            "expected fault {:?} for site {}, recorded: {:?}", fault, site, *faults,
        );
    }
}

#[async_trait]
impl PeerFaultHandler for TrackingFaultHandler {
    async fn on_peer_fault(&self, site: SiteId, fault: PeerFault, detail: String) {
        self.faults.write().await.push((site, fault, detail));
    }
}
