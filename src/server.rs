use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WanConfig;
use crate::frame::{AckFrame, DataFrame};
use crate::handler::RemoteMessageHandler;
use crate::site::{SiteDirectory, SiteId};

/// The receiving half of the WAN agent: accepts one inbound TCP connection
///  per sender peer and runs a dedicated task per connection that decodes data
///  frames, delivers them to the application's [RemoteMessageHandler] and
///  writes back an acknowledgment carrying the original sequence number and
///  this site's id.
///
/// Messages on one connection are delivered in the order the peer wrote them;
///  there is no ordering across connections.
pub struct WanAgentServer {
    local_site_id: SiteId,
    local_addr: SocketAddr,
    accept_handle: JoinHandle<()>,
    connection_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl WanAgentServer {
    /// Binds the local site's configured port and starts accepting. A
    ///  bind/listen failure is fatal; anything after that is local to the
    ///  affected connection.
    pub async fn new(config: WanConfig, handler: Arc<dyn RemoteMessageHandler>) -> anyhow::Result<WanAgentServer> {
        config.validate()?;
        let directory = SiteDirectory::new(&config)?;

        // the configured address of the local site is how peers reach it;
        //  locally we listen on all interfaces of the same family
        let bind_addr = match directory.local_addr() {
            SocketAddr::V4(addr) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), addr.port()),
            SocketAddr::V6(addr) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), addr.port()),
        };
        let listener = TcpListener::bind(bind_addr).await
            .with_context(|| format!("binding WAN agent server socket on {}", bind_addr))?;
        let local_addr = listener.local_addr()?;
        info!("WAN agent server for site {} listening on {}", directory.local_site_id(), local_addr);

        let connection_handles: Arc<Mutex<Vec<JoinHandle<()>>>> = Default::default();
        let accept_handle = tokio::spawn(accept_loop(
            listener,
            directory.num_remote_sites(),
            directory.local_site_id(),
            config.max_payload_size,
            handler,
            connection_handles.clone(),
        ));

        Ok(WanAgentServer {
            local_site_id: directory.local_site_id(),
            local_addr,
            accept_handle,
            connection_handles,
        })
    }

    pub fn local_site_id(&self) -> SiteId {
        self.local_site_id
    }

    /// the actually bound address (relevant when the configured port is 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the accept loop and all per-connection tasks and waits for them.
    ///  Aborting the tasks unblocks reads pending on the sockets, and dropping
    ///  the task-owned sockets closes the connections.
    pub async fn shutdown_and_wait(self) {
        info!("shutting down WAN agent server for site {}", self.local_site_id);
        self.accept_handle.abort();
        let _ = self.accept_handle.await;

        let mut handles = self.connection_handles.lock().await;
        for handle in handles.iter() {
            handle.abort();
        }
        for handle in handles.drain(..) {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("connection task failed: {}", e),
            }
        }
    }
}

/// Accepts until one connection per sender peer is established, spawning a
///  dedicated reader task for each.
async fn accept_loop(
    listener: TcpListener,
    num_peers: usize,
    local_site_id: SiteId,
    max_payload_size: usize,
    handler: Arc<dyn RemoteMessageHandler>,
    connection_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    let mut accepted = 0;
    while accepted < num_peers {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };
        debug!("accepted connection from {}", peer_addr);

        let handle = tokio::spawn(connection_loop(stream, peer_addr, local_site_id, max_payload_size, handler.clone()));
        connection_handles.lock().await.push(handle);
        accepted += 1;
    }
    debug!("all {} sender connections established", num_peers);
}

/// Decode one frame, deliver it, ack it - until the connection ends. Any
///  failure tears down this connection only; the peer has to reconnect through
///  a fresh accept if it comes back.
async fn connection_loop(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    local_site_id: SiteId,
    max_payload_size: usize,
    handler: Arc<dyn RemoteMessageHandler>,
) {
    loop {
        let frame = match DataFrame::read(&mut stream, max_payload_size).await {
            Ok(frame) => frame,
            Err(e) if e.is_disconnect() => {
                debug!("peer {} disconnected", peer_addr);
                return;
            }
            Err(e) => {
                warn!("closing connection from {}: {}", peer_addr, e);
                return;
            }
        };
        debug!("received msg {} from site {}", frame.seq, frame.origin_site);

        handler.on_remote_message(frame.origin_site, &frame.payload).await;

        let mut ack_buf = BytesMut::with_capacity(AckFrame::SERIALIZED_LEN);
        AckFrame {
            seq: frame.seq,
            site_id: local_site_id,
        }
            .ser(&mut ack_buf);
        if let Err(e) = stream.write_all(&ack_buf).await {
            warn!("failed to send ack to {}: {}", peer_addr, e);
            return;
        }
    }
}
