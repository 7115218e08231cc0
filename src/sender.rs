use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::Bytes;
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::ack_tracker::{AckTracker, StabilityCallback, StabilityThreshold};
use crate::config::WanConfig;
use crate::frame::{AckFrame, DataFrame, FrameError};
use crate::handler::{PeerFault, PeerFaultHandler};
use crate::site::{SiteDirectory, SiteId};

/// The sender half of the WAN agent: one outbound TCP connection per remote
///  site, a per-peer writer task fed by a queue (so a slow peer cannot delay
///  delivery to the others), and a per-peer ack-reader task feeding the
///  [AckTracker].
///
/// `send()` assigns strictly increasing sequence numbers starting at 0 and
///  fans every message out to every live peer. Per-message stability is
///  exposed through the tracker's frontiers and the registered stability
///  callbacks.
pub struct WanAgentSender {
    config: WanConfig,
    directory: Arc<SiteDirectory>,
    tracker: Arc<Mutex<AckTracker>>,
    /// guards sequence number assignment plus the fan-out enqueue, so frames
    ///  of concurrent `send` calls cannot arrive interleaved at any one peer
    send_state: Mutex<SendState>,
    all_ack_rx: watch::Receiver<Option<u64>>,
    // keeps the watch channel alive even after all peer tasks exited
    _all_ack_tx: Arc<watch::Sender<Option<u64>>>,
    peers: Vec<PeerLink>,
}

struct SendState {
    next_seq: u64,
}

struct PeerLink {
    site_id: SiteId,
    frame_tx: mpsc::UnboundedSender<Bytes>,
    writer_handle: JoinHandle<()>,
    ack_reader_handle: JoinHandle<()>,
}

impl WanAgentSender {
    /// Connects to every remote site in the configuration (with bounded
    ///  retries, so startup ordering across sites does not matter) and spawns
    ///  the per-peer worker tasks.
    pub async fn new(config: WanConfig, fault_handler: Arc<dyn PeerFaultHandler>) -> anyhow::Result<WanAgentSender> {
        config.validate()?;
        let directory = Arc::new(SiteDirectory::new(&config)?);

        let remote_sites = directory.remote_sites();
        let tracker = Arc::new(Mutex::new(AckTracker::new(remote_sites.iter().map(|(id, _)| *id))));
        let (all_ack_tx, all_ack_rx) = watch::channel(None);
        let all_ack_tx = Arc::new(all_ack_tx);

        let mut peers = Vec::with_capacity(remote_sites.len());
        for (site_id, addr) in remote_sites {
            let stream = connect_with_retry(addr, &config).await
                .with_context(|| format!("connecting to site {} at {}", site_id, addr))?;
            debug!("connected to site {} at {}", site_id, addr);
            let (read_half, write_half) = stream.into_split();

            let (frame_tx, frame_rx) = mpsc::unbounded_channel();
            let writer_handle = tokio::spawn(writer_loop(
                site_id,
                write_half,
                frame_rx,
                tracker.clone(),
                all_ack_tx.clone(),
                fault_handler.clone(),
            ));
            let ack_reader_handle = tokio::spawn(ack_reader_loop(
                site_id,
                read_half,
                tracker.clone(),
                all_ack_tx.clone(),
                fault_handler.clone(),
                config.ack_liveness_timeout(),
            ));

            peers.push(PeerLink {
                site_id,
                frame_tx,
                writer_handle,
                ack_reader_handle,
            });
        }
        info!("WAN agent sender for site {} connected to {} remote sites", directory.local_site_id(), peers.len());

        Ok(WanAgentSender {
            config,
            directory,
            tracker,
            send_state: Mutex::new(SendState { next_seq: 0 }),
            all_ack_rx,
            _all_ack_tx: all_ack_tx,
            peers,
        })
    }

    pub fn local_site_id(&self) -> SiteId {
        self.directory.local_site_id()
    }

    /// Assigns the next sequence number to `payload`, registers it as pending
    ///  and enqueues the encoded frame for every live peer. Returns the
    ///  assigned sequence number.
    ///
    /// If a send window is configured, this blocks while the number of
    ///  sequence numbers above the all-ack frontier is at the window limit,
    ///  and resumes as the frontier advances.
    ///
    /// Per-peer delivery failures do not surface here: a broken peer is
    ///  reported through the fault handler and excluded from the frontier
    ///  denominators, and delivery stays best-effort to the surviving peers.
    pub async fn send(&self, payload: Bytes) -> anyhow::Result<u64> {
        if payload.len() > self.config.max_payload_size {
            bail!("payload of {} bytes exceeds the configured maximum of {}", payload.len(), self.config.max_payload_size);
        }

        let mut state = self.send_state.lock().await;

        if let Some(window) = self.config.window_size {
            self.await_window_slot(state.next_seq, window).await?;
        }

        let seq = state.next_seq;
        let frame = DataFrame {
            seq,
            origin_site: self.directory.local_site_id(),
            payload,
        }
            .to_bytes();

        {
            // registering the pending entry and enqueueing happen under the
            //  tracker lock so no ack can arrive before the entry exists
            let mut tracker = self.tracker.lock().await;
            tracker.record_pending(seq);
            for peer in &self.peers {
                if !tracker.is_live(peer.site_id) {
                    continue;
                }
                if peer.frame_tx.send(frame.clone()).is_err() {
                    // writer task already gone - the fault was reported there
                    debug!("not enqueueing seq {} for site {}, writer is gone", seq, peer.site_id);
                }
            }
        }
        state.next_seq += 1;

        Ok(seq)
    }

    /// blocks until fewer than `window` sequence numbers are in flight above
    ///  the all-ack frontier
    async fn await_window_slot(&self, next_seq: u64, window: u64) -> anyhow::Result<()> {
        let mut all_ack_rx = self.all_ack_rx.clone();
        loop {
            let frontier = *all_ack_rx.borrow_and_update();
            let stable_count = frontier
                .map(|f| f + 1)
                .unwrap_or(0);
            if next_seq - stable_count < window {
                return Ok(());
            }
            if self.tracker.lock().await.num_live_sites() == 0 {
                bail!("send window is full and no live remote sites remain to drain it");
            }
            // watch sender is owned by self, so this cannot fail
            let _ = all_ack_rx.changed().await;
        }
    }

    pub async fn register_stability_callback(&self, threshold: StabilityThreshold, callback: StabilityCallback) {
        self.tracker.lock().await.register_callback(threshold, callback);
    }

    pub async fn stability_frontier(&self, threshold: StabilityThreshold) -> Option<u64> {
        self.tracker.lock().await.frontier(threshold)
    }

    /// snapshot of how many messages each remote site has acknowledged
    pub async fn message_counters(&self) -> FxHashMap<SiteId, u64> {
        self.tracker.lock().await.message_counters()
    }

    /// Stops all per-peer tasks and waits for them to finish. Aborting the
    ///  tasks unblocks any reads or writes pending on the peer sockets, and
    ///  dropping the task-owned socket halves closes the connections.
    pub async fn shutdown_and_wait(self) {
        info!("shutting down WAN agent sender for site {}", self.directory.local_site_id());
        for peer in &self.peers {
            peer.writer_handle.abort();
            peer.ack_reader_handle.abort();
        }
        for peer in self.peers {
            for handle in [peer.writer_handle, peer.ack_reader_handle] {
                match handle.await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => warn!("worker task for site {} failed: {}", peer.site_id, e),
                }
            }
        }
    }
}

/// Opens the outbound connection to a peer, retrying with truncated
///  exponential backoff while the peer is not listening yet. Fails after the
///  configured number of attempts.
async fn connect_with_retry(addr: SocketAddr, config: &WanConfig) -> anyhow::Result<TcpStream> {
    let mut backoff = config.connect_backoff();
    let mut attempt = 1;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if attempt >= config.connect_max_attempts {
                    bail!("giving up on {} after {} connect attempts: {}", addr, attempt, e);
                }
                debug!("connect attempt {} to {} failed ({}), retrying in {:?}", attempt, addr, e, backoff);

                let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
                time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
                backoff = (backoff * 2).min(config.connect_backoff_max());
                attempt += 1;
            }
        }
    }
}

/// Drains the peer's frame queue into its socket. On a write error the peer is
///  marked dead and the task exits - frames already in the queue are dropped,
///  the connection is not re-established.
async fn writer_loop(
    site_id: SiteId,
    mut write_half: OwnedWriteHalf,
    mut frame_rx: mpsc::UnboundedReceiver<Bytes>,
    tracker: Arc<Mutex<AckTracker>>,
    all_ack_tx: Arc<watch::Sender<Option<u64>>>,
    fault_handler: Arc<dyn PeerFaultHandler>,
) {
    while let Some(frame) = frame_rx.recv().await {
        if let Err(e) = write_half.write_all(&frame).await {
            warn!("write to site {} failed: {}", site_id, e);
            mark_peer_dead(site_id, &tracker, &all_ack_tx).await;
            fault_handler.on_peer_fault(site_id, PeerFault::ConnectionLost, e.to_string()).await;
            return;
        }
    }
    debug!("frame queue for site {} closed, writer exiting", site_id);
}

/// Reads ack frames from the peer and feeds them to the tracker. Exits (and
///  marks the peer dead) on connection loss, framing trouble or - if
///  configured - an expired liveness timeout.
///
/// The liveness timeout is only armed while the peer has unacknowledged
///  messages: an idle link is expected to be quiet, and killing it would
///  degrade the mesh for no reason. A peer that goes silent while messages
///  are outstanding is detected within two timeout periods.
async fn ack_reader_loop(
    site_id: SiteId,
    mut read_half: OwnedReadHalf,
    tracker: Arc<Mutex<AckTracker>>,
    all_ack_tx: Arc<watch::Sender<Option<u64>>>,
    fault_handler: Arc<dyn PeerFaultHandler>,
    liveness_timeout: Option<Duration>,
) {
    let mut ack_deadline: Option<Instant> = None;
    loop {
        let result = match liveness_timeout {
            Some(timeout) => {
                let wakeup = ack_deadline.unwrap_or_else(|| Instant::now() + timeout);
                match time::timeout_at(wakeup, AckFrame::read(&mut read_half)).await {
                    Ok(result) => result,
                    Err(_) => {
                        if !tracker.lock().await.has_unacked_messages(site_id) {
                            // idle link, there is nothing to wait for
                            ack_deadline = None;
                            continue;
                        }
                        if ack_deadline.is_none() {
                            // messages became outstanding while we were
                            //  sleeping - arm the timeout now
                            ack_deadline = Some(Instant::now() + timeout);
                            continue;
                        }
                        warn!("no ack from site {} within {:?} while messages are outstanding, marking it dead", site_id, timeout);
                        mark_peer_dead(site_id, &tracker, &all_ack_tx).await;
                        fault_handler.on_peer_fault(site_id, PeerFault::ConnectionLost, format!("no ack within {:?}", timeout)).await;
                        return;
                    }
                }
            }
            None => AckFrame::read(&mut read_half).await,
        };

        match result {
            Ok(ack) => {
                ack_deadline = None;
                debug!("received ack from site {} for seq {}", site_id, ack.seq);
                if ack.site_id != site_id {
                    warn!("ack on the connection to site {} claims to be from site {}, attributing it to site {}", site_id, ack.site_id, site_id);
                }

                // acks are attributed to the connection's peer - a claimed id
                //  in the frame cannot move another site's counters
                let mut tracker = tracker.lock().await;
                tracker.record_ack(ack.seq, site_id);
                tracker.prune_stable();
                all_ack_tx.send_replace(tracker.all_ack_frontier());
            }
            Err(e) => {
                let fault = match &e {
                    FrameError::PayloadTooLarge { .. } => PeerFault::Framing,
                    FrameError::Io(_) => PeerFault::ConnectionLost,
                };
                if e.is_disconnect() {
                    info!("site {} closed the ack connection", site_id);
                }
                else {
                    warn!("ack stream from site {} broke: {}", site_id, e);
                }
                mark_peer_dead(site_id, &tracker, &all_ack_tx).await;
                fault_handler.on_peer_fault(site_id, fault, e.to_string()).await;
                return;
            }
        }
    }
}

async fn mark_peer_dead(site_id: SiteId, tracker: &Arc<Mutex<AckTracker>>, all_ack_tx: &Arc<watch::Sender<Option<u64>>>) {
    let mut tracker = tracker.lock().await;
    tracker.mark_site_dead(site_id);
    // removing a site from the denominator can advance the frontier
    all_ack_tx.send_replace(tracker.all_ack_frontier());
}
