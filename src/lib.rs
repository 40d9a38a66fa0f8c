//! A reliable, message-oriented transport layered on a single unreliable
//!  UDP socket. One `Host` multiplexes many logical peers over one port, and
//!  each peer connection multiplexes up to 255 independently sequenced
//!  channels.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length
//!   chunks of data, not byte streams), with the delivery class chosen per
//!   message:
//!   * reliable-ordered: retransmitted until acknowledged, delivered in
//!     send order within its channel
//!   * unreliable-sequenced: delivered at most once and only while still
//!     current; late arrivals are dropped rather than delaying fresh data
//!   * unsequenced: delivered at most once in arrival order, deduplicated
//!     through a 1024-group sliding window
//!   * oversized messages are fragmented and reassembled transparently,
//!     under reliable or unreliable semantics
//! * Channels do not synchronize with each other: a lost packet on one
//!   channel never delays delivery on another
//! * Connection setup and teardown are explicit handshakes surfaced to the
//!   application as events; liveness is monitored with automatic pings and
//!   an exponential-backoff retransmission timeout
//! * The volume of unreliable traffic adapts to observed round trip times
//!   (a probabilistic throttle), and host-wide bandwidth budgets are divided
//!   fairly across peers once per second
//! * Datagrams never exceed the configured MTU - the transport does its own
//!   chunking so IP-level fragmentation is avoided
//! * Optional per-datagram compression (an adaptive order-2 PPM range coder
//!   is built in) and checksumming (reflected CRC-32 built in)
//! * The protocol engine is single-threaded and cooperative: one `service`
//!   loop owns the socket and all peer state, blocking only in a poll-style
//!   socket wait bounded by the caller's timeout
//!
//! ## Datagram layout
//!
//! All multi-byte fields are network byte order (BE):
//! ```ascii
//! 0:  peer id word (u16):
//!     * bits 0-11: the recipient's peer id, or 0xFFF for "no known peer"
//!       (only valid for CONNECT)
//!     * bits 12-13: session id, so a reused slot rejects stale traffic
//!     * bit 14: the command section is compressed
//!     * bit 15: a sent-time field follows
//! 2:  sent time (u16, low 16 bits of the sender's service clock) - present
//!      only when bit 15 is set; echoed in ACKs to measure round trip time
//! *:  checksum (u32) - present only when both ends install a checksum;
//!      computed with the connection id in this slot as a pre-image, over
//!      the uncompressed datagram
//! *:  one or more commands, each a 4-byte command header (command byte,
//!      channel id, reliable sequence number) followed by fixed-width
//!      opcode-specific fields; payload bytes of the send commands follow
//!      their record directly
//! ```
//!
//! A datagram carries at most 32 commands and never exceeds the negotiated
//!  MTU. The command byte's low 4 bits are the opcode; bit 7 requests an
//!  acknowledgement and bit 6 marks unsequenced delivery.
//!
//! ## Sequencing
//!
//! Reliable commands on a channel are numbered by a wrapping 16-bit
//!  sequence, organized in 16 windows of 0x1000 numbers; at most 7
//!  consecutive windows may be in flight, so a slow receiver back-pressures
//!  the sender through deferral instead of loss. Unreliable commands carry a
//!  secondary sequence number that resets with each reliable generation;
//!  unsequenced commands carry a group counter deduplicated against a
//!  1024-bit window.
//!
//! ## Related
//!
//! * TCP - single ordered stream; a lost segment delays everything behind
//!   it, which is exactly what per-channel sequencing avoids here
//! * QUIC - connection-based with mandatory TLS and stream multiplexing;
//!   much heavier machinery aimed at the web rather than realtime payloads
//! * UDT - single channel over a dedicated socket pair, optimized for bulk
//!   transfer throughput rather than many small messages

pub mod checksum;
pub mod clock;
pub mod compress;
pub mod config;
pub mod event;
pub mod host;
pub mod packet;
pub mod peer;
pub mod protocol;
pub mod socket;

pub use checksum::crc32;
pub use clock::{Clock, MonotonicClock};
pub use compress::{Compressor, RangeCoder};
pub use config::HostConfig;
pub use event::{Event, PeerId};
pub use host::{Host, InterceptFn, InterceptResult};
pub use packet::{
    Packet, PACKET_FLAG_RELIABLE, PACKET_FLAG_UNRELIABLE_FRAGMENT, PACKET_FLAG_UNSEQUENCED,
};
pub use peer::{Peer, PeerState};
pub use socket::{DatagramSocket, UdpDatagramSocket};

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
