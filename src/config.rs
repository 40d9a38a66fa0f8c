use crate::protocol;
use anyhow::bail;

pub const DEFAULT_MTU: u32 = 1400;
pub const DEFAULT_MAXIMUM_PACKET_SIZE: usize = 32 * 1024 * 1024;
pub const DEFAULT_MAXIMUM_WAITING_DATA: usize = 32 * 1024 * 1024;

/// Host-wide configuration.
///
/// The bandwidth limits shape the connection in two ways: they feed the
///  negotiated reliable window size of every connection, and they drive the
///  periodic cross-peer throttle that divides the available bandwidth fairly
///  among connected peers. A limit of 0 means unlimited.
pub struct HostConfig {
    /// number of peer slots to allocate (and thus the maximum number of
    ///  concurrent connections through this host)
    pub peer_count: usize,

    /// upper bound for the channel count of incoming connections; clamped
    ///  to [1, 255]. 0 means the protocol maximum.
    pub channel_limit: usize,

    /// downstream budget in bytes/second, 0 = unlimited
    pub incoming_bandwidth: u32,
    /// upstream budget in bytes/second, 0 = unlimited
    pub outgoing_bandwidth: u32,

    /// UDP payload size assumed for outgoing datagrams. The transport never
    ///  builds a datagram bigger than the (possibly lower) value negotiated
    ///  with the peer. Discovery is unreliable, so this is configured.
    pub mtu: u32,

    /// refuse to send or deliver messages bigger than this
    pub maximum_packet_size: usize,

    /// per-peer cap on buffered incoming payload bytes not yet claimed by
    ///  the application; a peer exceeding it is treated as misbehaving
    pub maximum_waiting_data: usize,

    /// how many established peers may share one remote address before
    ///  further connects from it are refused. Defaults to the maximum peer
    ///  id, which effectively disables the cap.
    pub duplicate_peers: usize,
}

impl HostConfig {
    pub fn new(peer_count: usize) -> HostConfig {
        HostConfig {
            peer_count,
            channel_limit: protocol::MAXIMUM_CHANNEL_COUNT,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            mtu: DEFAULT_MTU,
            maximum_packet_size: DEFAULT_MAXIMUM_PACKET_SIZE,
            maximum_waiting_data: DEFAULT_MAXIMUM_WAITING_DATA,
            duplicate_peers: protocol::MAXIMUM_PEER_ID as usize,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.peer_count == 0 || self.peer_count > protocol::MAXIMUM_PEER_ID as usize {
            bail!(
                "peer count must be in [1, {}], was {}",
                protocol::MAXIMUM_PEER_ID,
                self.peer_count
            );
        }
        if self.mtu < protocol::MINIMUM_MTU || self.mtu > protocol::MAXIMUM_MTU {
            bail!(
                "mtu must be in [{}, {}], was {}",
                protocol::MINIMUM_MTU,
                protocol::MAXIMUM_MTU,
                self.mtu
            );
        }
        Ok(())
    }

    /// the channel limit with the protocol bounds applied
    pub fn effective_channel_limit(&self) -> usize {
        clamp_channel_limit(self.channel_limit)
    }
}

pub fn clamp_channel_limit(channel_limit: usize) -> usize {
    if channel_limit == 0 || channel_limit > protocol::MAXIMUM_CHANNEL_COUNT {
        protocol::MAXIMUM_CHANNEL_COUNT
    } else if channel_limit < protocol::MINIMUM_CHANNEL_COUNT {
        protocol::MINIMUM_CHANNEL_COUNT
    } else {
        channel_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        assert!(HostConfig::new(32).validate().is_ok());
    }

    #[rstest]
    #[case::zero_peers(0, DEFAULT_MTU, false)]
    #[case::too_many_peers(0x1000, DEFAULT_MTU, false)]
    #[case::max_peers(0xFFF, DEFAULT_MTU, true)]
    #[case::mtu_too_small(1, 575, false)]
    #[case::mtu_minimum(1, 576, true)]
    #[case::mtu_maximum(1, 4096, true)]
    #[case::mtu_too_big(1, 4097, false)]
    fn test_validate(#[case] peer_count: usize, #[case] mtu: u32, #[case] ok: bool) {
        let mut config = HostConfig::new(peer_count);
        config.mtu = mtu;
        assert_eq!(config.validate().is_ok(), ok);
    }

    #[rstest]
    #[case(0, 255)]
    #[case(1, 1)]
    #[case(17, 17)]
    #[case(255, 255)]
    #[case(1000, 255)]
    fn test_clamp_channel_limit(#[case] raw: usize, #[case] expected: usize) {
        assert_eq!(clamp_channel_limit(raw), expected);
    }
}
