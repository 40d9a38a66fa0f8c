use crate::packet::Packet;

/// Stable handle for a peer slot on a host. Handles stay valid across
///  disconnects (the slot is reused for later connections), so an
///  application holding a stale handle may observe a different connection -
///  events are the authoritative signal for a connection's lifetime.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(pub(crate) usize);

impl PeerId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Application-visible protocol events, surfaced by `Host::service` and
///  `Host::check_events`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// a connection handshake completed; `data` is the 32-bit value the
    ///  remote supplied with its connect or disconnect request
    Connect { peer: PeerId, data: u32 },

    /// the connection ended - by request, by timeout, or by protocol error
    Disconnect { peer: PeerId, data: u32 },

    /// a complete message arrived and is ready for the application
    Receive {
        peer: PeerId,
        channel_id: u8,
        packet: Packet,
    },
}
