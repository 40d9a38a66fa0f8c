use bytes::Bytes;

/// the packet must be received by the target peer and resent until it is
pub const PACKET_FLAG_RELIABLE: u32 = 1 << 0;
/// the packet is not sequenced with other packets on its channel
pub const PACKET_FLAG_UNSEQUENCED: u32 = 1 << 1;
/// an oversized packet is fragmented with unreliable instead of reliable
///  fragments if possible
pub const PACKET_FLAG_UNRELIABLE_FRAGMENT: u32 = 1 << 3;

/// A message payload handed to or received from the transport.
///
/// The payload buffer is shared by reference count: while an oversized packet
///  is in flight, each of its fragment commands holds one clone of `data`, and
///  the buffer is released when the last clone is dropped. Cloning a received
///  packet is therefore cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Bytes,
    pub flags: u32,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, flags: u32) -> Packet {
        Packet {
            data: data.into(),
            flags,
        }
    }

    /// a reliable packet with the given contents
    pub fn reliable(data: impl Into<Bytes>) -> Packet {
        Packet::new(data, PACKET_FLAG_RELIABLE)
    }

    /// a sequenced but unreliable packet with the given contents
    pub fn unreliable(data: impl Into<Bytes>) -> Packet {
        Packet::new(data, 0)
    }

    /// an unsequenced, unreliable packet with the given contents
    pub fn unsequenced(data: impl Into<Bytes>) -> Packet {
        Packet::new(data, PACKET_FLAG_UNSEQUENCED)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        assert_eq!(Packet::reliable(vec![1, 2, 3]).flags, PACKET_FLAG_RELIABLE);
        assert_eq!(Packet::unreliable(vec![1]).flags, 0);
        assert_eq!(
            Packet::unsequenced(vec![]).flags,
            PACKET_FLAG_UNSEQUENCED
        );
        assert_eq!(Packet::reliable(vec![1, 2, 3]).len(), 3);
        assert!(Packet::reliable(vec![]).is_empty());
    }

    #[test]
    fn test_payload_sharing() {
        let packet = Packet::reliable(vec![7; 1024]);
        let clone = packet.clone();
        // clones share the same backing buffer
        assert_eq!(packet.data.as_ptr(), clone.data.as_ptr());
    }
}
