use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::warn;

use crate::site::SiteId;

/// Application callback for messages replicated from a remote site.
///
/// Messages from one origin arrive in the order that origin sent them (one
///  connection per origin, TCP in-order delivery). There is no ordering
///  guarantee across different origins.
///
/// The acknowledgment for a message is only written after this callback
///  returns, so the origin's stability frontiers reflect completed deliveries.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteMessageHandler: Send + Sync + 'static {
    async fn on_remote_message(&self, origin_site: SiteId, payload: &[u8]);
}

/// Why a peer connection was taken out of service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerFault {
    /// the socket broke, the peer closed it, or the liveness timeout expired
    ConnectionLost,
    /// the byte stream could not be re-segmented into frames
    Framing,
}

/// Asynchronous reporting of per-peer failures on the sender side.
///
/// A failed peer never surfaces as an error from `send()`: delivery stays
///  best-effort to the surviving peers, the dead peer is excluded from
///  frontier denominators, and the application learns of the degraded mesh
///  through this seam.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerFaultHandler: Send + Sync + 'static {
    async fn on_peer_fault(&self, site: SiteId, fault: PeerFault, detail: String);
}

/// fallback fault handler that only logs
#[derive(Debug, Default)]
pub struct LoggingFaultHandler;

#[async_trait]
impl PeerFaultHandler for LoggingFaultHandler {
    async fn on_peer_fault(&self, site: SiteId, fault: PeerFault, detail: String) {
        warn!("peer site {} failed ({:?}): {}", site, fault, detail);
    }
}
