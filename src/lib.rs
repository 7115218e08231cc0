//! WAN replication agent: reliably multicasts byte payloads from one site
//!  (data center) to a set of remote sites over independent TCP connections,
//!  and tracks per message which remote sites have acknowledged receipt.
//!
//! ## Roles
//!
//! A deployment consists of one [sender::WanAgentSender] per originating site
//!  and one [server::WanAgentServer] per receiving site:
//! * The sender opens one TCP connection per configured remote site (retrying
//!    with backoff while a peer is not up yet), assigns each `send()` payload
//!    a strictly increasing sequence number starting at 0 and fans the framed
//!    message out to every peer. Each peer has its own outbound queue and
//!    writer task, so a slow peer delays only itself.
//! * The server accepts one connection per sender peer and runs a dedicated
//!    task per connection: decode a frame, hand it to the application's
//!    remote-message handler, write back an acknowledgment. Delivery order per
//!    origin is the origin's send order; there is no cross-origin ordering.
//!
//! ## Stability
//!
//! The sender maintains three *stability frontiers* over the sequence-number
//!  line - one-ack, majority-ack and all-ack. A frontier is the largest
//!  sequence number N such that every message up to and including N has
//!  reached the frontier's acknowledgment threshold. Frontiers advance as a
//!  contiguous prefix, never skipping a message with too few acks, and the
//!  application can register callbacks that fire as messages become stable
//!  ([ack_tracker::StabilityThreshold]).
//!
//! A peer whose connection breaks is excluded from the frontier denominators
//!  (so it cannot stall the all-ack frontier forever) and is reported through
//!  the [handler::PeerFaultHandler] seam; `send()` itself keeps succeeding
//!  with best-effort delivery to the surviving peers.
//!
//! ## Wire protocol
//!
//! Fixed-header framing over plain TCP, all integers in network byte order (BE):
//!
//! ```ascii
//! data frame:
//! 0:  sequence number (u64)
//! 8:  originating site id (u32)
//! 12: payload length (u64)
//! 20: payload (payload length bytes, no padding, no delimiter)
//!
//! ack frame:
//! 0:  sequence number (u64)
//! 8:  responding site id (u32)
//! ```
//!
//! Encryption and authentication are out of scope - the protocol assumes a
//!  trusted network or a lower transport-security layer.

pub mod ack_tracker;
pub mod config;
pub mod frame;
pub mod handler;
pub mod safe_converter;
pub mod sender;
pub mod server;
pub mod site;
pub mod test_util;
