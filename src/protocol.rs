use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

pub const MINIMUM_MTU: u32 = 576;
pub const MAXIMUM_MTU: u32 = 4096;
pub const MAXIMUM_PACKET_COMMANDS: usize = 32;
pub const MINIMUM_WINDOW_SIZE: u32 = 4096;
pub const MAXIMUM_WINDOW_SIZE: u32 = 65536;
pub const MINIMUM_CHANNEL_COUNT: usize = 1;
pub const MAXIMUM_CHANNEL_COUNT: usize = 255;
pub const MAXIMUM_PEER_ID: u16 = 0xFFF;
pub const MAXIMUM_FRAGMENT_COUNT: u32 = 1024 * 1024;

/// the receiver must acknowledge this command
pub const COMMAND_FLAG_ACKNOWLEDGE: u8 = 1 << 7;
pub const COMMAND_FLAG_UNSEQUENCED: u8 = 1 << 6;
pub const COMMAND_FLAG_MASK: u8 = COMMAND_FLAG_ACKNOWLEDGE | COMMAND_FLAG_UNSEQUENCED;
pub const COMMAND_MASK: u8 = 0x0F;

pub const HEADER_FLAG_COMPRESSED: u16 = 1 << 14;
pub const HEADER_FLAG_SENT_TIME: u16 = 1 << 15;
pub const HEADER_FLAG_MASK: u16 = HEADER_FLAG_COMPRESSED | HEADER_FLAG_SENT_TIME;

pub const HEADER_SESSION_MASK: u16 = 3 << 12;
pub const HEADER_SESSION_SHIFT: u16 = 12;

/// peer-id word (2 bytes) without the optional sent-time field
pub const HEADER_SIZE_MINIMUM: usize = 2;
/// peer-id word plus sent time
pub const HEADER_SIZE_WITH_SENT_TIME: usize = 4;

pub const COMMAND_HEADER_SIZE: usize = 4;

/// Size on the wire of each command (command header included), indexed by
///  opcode. Opcode 0 is unused.
const COMMAND_SIZES: [usize; 13] = [0, 8, 48, 44, 8, 4, 6, 8, 24, 8, 12, 16, 24];

pub fn command_size(command_byte: u8) -> usize {
    COMMAND_SIZES[(command_byte & COMMAND_MASK) as usize]
}

/// The twelve command records that can be packed into a datagram. Fields are
///  fixed-width and transmitted in network byte order; the payload bytes of
///  the send commands follow the record directly and are not part of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Acknowledge {
        received_reliable_sequence_number: u16,
        received_sent_time: u16,
    },
    Connect {
        outgoing_peer_id: u16,
        incoming_session_id: u8,
        outgoing_session_id: u8,
        mtu: u32,
        window_size: u32,
        channel_count: u32,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
        packet_throttle_interval: u32,
        packet_throttle_acceleration: u32,
        packet_throttle_deceleration: u32,
        connect_id: u32,
        data: u32,
    },
    VerifyConnect {
        outgoing_peer_id: u16,
        incoming_session_id: u8,
        outgoing_session_id: u8,
        mtu: u32,
        window_size: u32,
        channel_count: u32,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
        packet_throttle_interval: u32,
        packet_throttle_acceleration: u32,
        packet_throttle_deceleration: u32,
        connect_id: u32,
    },
    Disconnect {
        data: u32,
    },
    Ping,
    SendReliable {
        data_length: u16,
    },
    SendUnreliable {
        unreliable_sequence_number: u16,
        data_length: u16,
    },
    SendFragment {
        start_sequence_number: u16,
        data_length: u16,
        fragment_count: u32,
        fragment_number: u32,
        total_length: u32,
        fragment_offset: u32,
    },
    SendUnsequenced {
        unsequenced_group: u16,
        data_length: u16,
    },
    BandwidthLimit {
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    },
    ThrottleConfigure {
        packet_throttle_interval: u32,
        packet_throttle_acceleration: u32,
        packet_throttle_deceleration: u32,
    },
    SendUnreliableFragment {
        start_sequence_number: u16,
        data_length: u16,
        fragment_count: u32,
        fragment_number: u32,
        total_length: u32,
        fragment_offset: u32,
    },
}

pub const OPCODE_ACKNOWLEDGE: u8 = 1;
pub const OPCODE_CONNECT: u8 = 2;
pub const OPCODE_VERIFY_CONNECT: u8 = 3;
pub const OPCODE_DISCONNECT: u8 = 4;
pub const OPCODE_PING: u8 = 5;
pub const OPCODE_SEND_RELIABLE: u8 = 6;
pub const OPCODE_SEND_UNRELIABLE: u8 = 7;
pub const OPCODE_SEND_FRAGMENT: u8 = 8;
pub const OPCODE_SEND_UNSEQUENCED: u8 = 9;
pub const OPCODE_BANDWIDTH_LIMIT: u8 = 10;
pub const OPCODE_THROTTLE_CONFIGURE: u8 = 11;
pub const OPCODE_SEND_UNRELIABLE_FRAGMENT: u8 = 12;

impl CommandKind {
    pub fn opcode(&self) -> u8 {
        match self {
            CommandKind::Acknowledge { .. } => OPCODE_ACKNOWLEDGE,
            CommandKind::Connect { .. } => OPCODE_CONNECT,
            CommandKind::VerifyConnect { .. } => OPCODE_VERIFY_CONNECT,
            CommandKind::Disconnect { .. } => OPCODE_DISCONNECT,
            CommandKind::Ping => OPCODE_PING,
            CommandKind::SendReliable { .. } => OPCODE_SEND_RELIABLE,
            CommandKind::SendUnreliable { .. } => OPCODE_SEND_UNRELIABLE,
            CommandKind::SendFragment { .. } => OPCODE_SEND_FRAGMENT,
            CommandKind::SendUnsequenced { .. } => OPCODE_SEND_UNSEQUENCED,
            CommandKind::BandwidthLimit { .. } => OPCODE_BANDWIDTH_LIMIT,
            CommandKind::ThrottleConfigure { .. } => OPCODE_THROTTLE_CONFIGURE,
            CommandKind::SendUnreliableFragment { .. } => OPCODE_SEND_UNRELIABLE_FRAGMENT,
        }
    }

    /// wire size of this command record, command header included
    pub fn wire_size(&self) -> usize {
        COMMAND_SIZES[self.opcode() as usize]
    }
}

/// One command as it travels in a datagram: a 4-byte command header followed
///  by the opcode-specific record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// ACKNOWLEDGE / UNSEQUENCED bits; the opcode lives in `kind`
    pub flags: u8,
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
    pub kind: CommandKind,
}

impl Command {
    pub fn command_byte(&self) -> u8 {
        self.kind.opcode() | self.flags
    }

    pub fn wire_size(&self) -> usize {
        self.kind.wire_size()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.command_byte());
        buf.put_u8(self.channel_id);
        buf.put_u16(self.reliable_sequence_number);

        match &self.kind {
            CommandKind::Acknowledge {
                received_reliable_sequence_number,
                received_sent_time,
            } => {
                buf.put_u16(*received_reliable_sequence_number);
                buf.put_u16(*received_sent_time);
            }
            CommandKind::Connect {
                outgoing_peer_id,
                incoming_session_id,
                outgoing_session_id,
                mtu,
                window_size,
                channel_count,
                incoming_bandwidth,
                outgoing_bandwidth,
                packet_throttle_interval,
                packet_throttle_acceleration,
                packet_throttle_deceleration,
                connect_id,
                data,
            } => {
                buf.put_u16(*outgoing_peer_id);
                buf.put_u8(*incoming_session_id);
                buf.put_u8(*outgoing_session_id);
                buf.put_u32(*mtu);
                buf.put_u32(*window_size);
                buf.put_u32(*channel_count);
                buf.put_u32(*incoming_bandwidth);
                buf.put_u32(*outgoing_bandwidth);
                buf.put_u32(*packet_throttle_interval);
                buf.put_u32(*packet_throttle_acceleration);
                buf.put_u32(*packet_throttle_deceleration);
                buf.put_u32(*connect_id);
                buf.put_u32(*data);
            }
            CommandKind::VerifyConnect {
                outgoing_peer_id,
                incoming_session_id,
                outgoing_session_id,
                mtu,
                window_size,
                channel_count,
                incoming_bandwidth,
                outgoing_bandwidth,
                packet_throttle_interval,
                packet_throttle_acceleration,
                packet_throttle_deceleration,
                connect_id,
            } => {
                buf.put_u16(*outgoing_peer_id);
                buf.put_u8(*incoming_session_id);
                buf.put_u8(*outgoing_session_id);
                buf.put_u32(*mtu);
                buf.put_u32(*window_size);
                buf.put_u32(*channel_count);
                buf.put_u32(*incoming_bandwidth);
                buf.put_u32(*outgoing_bandwidth);
                buf.put_u32(*packet_throttle_interval);
                buf.put_u32(*packet_throttle_acceleration);
                buf.put_u32(*packet_throttle_deceleration);
                buf.put_u32(*connect_id);
            }
            CommandKind::Disconnect { data } => {
                buf.put_u32(*data);
            }
            CommandKind::Ping => {}
            CommandKind::SendReliable { data_length } => {
                buf.put_u16(*data_length);
            }
            CommandKind::SendUnreliable {
                unreliable_sequence_number,
                data_length,
            } => {
                buf.put_u16(*unreliable_sequence_number);
                buf.put_u16(*data_length);
            }
            CommandKind::SendFragment {
                start_sequence_number,
                data_length,
                fragment_count,
                fragment_number,
                total_length,
                fragment_offset,
            }
            | CommandKind::SendUnreliableFragment {
                start_sequence_number,
                data_length,
                fragment_count,
                fragment_number,
                total_length,
                fragment_offset,
            } => {
                buf.put_u16(*start_sequence_number);
                buf.put_u16(*data_length);
                buf.put_u32(*fragment_count);
                buf.put_u32(*fragment_number);
                buf.put_u32(*total_length);
                buf.put_u32(*fragment_offset);
            }
            CommandKind::SendUnsequenced {
                unsequenced_group,
                data_length,
            } => {
                buf.put_u16(*unsequenced_group);
                buf.put_u16(*data_length);
            }
            CommandKind::BandwidthLimit {
                incoming_bandwidth,
                outgoing_bandwidth,
            } => {
                buf.put_u32(*incoming_bandwidth);
                buf.put_u32(*outgoing_bandwidth);
            }
            CommandKind::ThrottleConfigure {
                packet_throttle_interval,
                packet_throttle_acceleration,
                packet_throttle_deceleration,
            } => {
                buf.put_u32(*packet_throttle_interval);
                buf.put_u32(*packet_throttle_acceleration);
                buf.put_u32(*packet_throttle_deceleration);
            }
        }
    }

    /// Parses one command record from the buffer. Payload bytes of the send
    ///  commands are left in the buffer for the caller. Unknown opcodes and
    ///  truncated records are rejected.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Command> {
        let command_byte = buf.try_get_u8()?;
        let channel_id = buf.try_get_u8()?;
        let reliable_sequence_number = buf.try_get_u16()?;

        let flags = command_byte & COMMAND_FLAG_MASK;
        let opcode = command_byte & COMMAND_MASK;

        let kind = match opcode {
            OPCODE_ACKNOWLEDGE => CommandKind::Acknowledge {
                received_reliable_sequence_number: buf.try_get_u16()?,
                received_sent_time: buf.try_get_u16()?,
            },
            OPCODE_CONNECT => CommandKind::Connect {
                outgoing_peer_id: buf.try_get_u16()?,
                incoming_session_id: buf.try_get_u8()?,
                outgoing_session_id: buf.try_get_u8()?,
                mtu: buf.try_get_u32()?,
                window_size: buf.try_get_u32()?,
                channel_count: buf.try_get_u32()?,
                incoming_bandwidth: buf.try_get_u32()?,
                outgoing_bandwidth: buf.try_get_u32()?,
                packet_throttle_interval: buf.try_get_u32()?,
                packet_throttle_acceleration: buf.try_get_u32()?,
                packet_throttle_deceleration: buf.try_get_u32()?,
                connect_id: buf.try_get_u32()?,
                data: buf.try_get_u32()?,
            },
            OPCODE_VERIFY_CONNECT => CommandKind::VerifyConnect {
                outgoing_peer_id: buf.try_get_u16()?,
                incoming_session_id: buf.try_get_u8()?,
                outgoing_session_id: buf.try_get_u8()?,
                mtu: buf.try_get_u32()?,
                window_size: buf.try_get_u32()?,
                channel_count: buf.try_get_u32()?,
                incoming_bandwidth: buf.try_get_u32()?,
                outgoing_bandwidth: buf.try_get_u32()?,
                packet_throttle_interval: buf.try_get_u32()?,
                packet_throttle_acceleration: buf.try_get_u32()?,
                packet_throttle_deceleration: buf.try_get_u32()?,
                connect_id: buf.try_get_u32()?,
            },
            OPCODE_DISCONNECT => CommandKind::Disconnect {
                data: buf.try_get_u32()?,
            },
            OPCODE_PING => CommandKind::Ping,
            OPCODE_SEND_RELIABLE => CommandKind::SendReliable {
                data_length: buf.try_get_u16()?,
            },
            OPCODE_SEND_UNRELIABLE => CommandKind::SendUnreliable {
                unreliable_sequence_number: buf.try_get_u16()?,
                data_length: buf.try_get_u16()?,
            },
            OPCODE_SEND_FRAGMENT => CommandKind::SendFragment {
                start_sequence_number: buf.try_get_u16()?,
                data_length: buf.try_get_u16()?,
                fragment_count: buf.try_get_u32()?,
                fragment_number: buf.try_get_u32()?,
                total_length: buf.try_get_u32()?,
                fragment_offset: buf.try_get_u32()?,
            },
            OPCODE_SEND_UNSEQUENCED => CommandKind::SendUnsequenced {
                unsequenced_group: buf.try_get_u16()?,
                data_length: buf.try_get_u16()?,
            },
            OPCODE_BANDWIDTH_LIMIT => CommandKind::BandwidthLimit {
                incoming_bandwidth: buf.try_get_u32()?,
                outgoing_bandwidth: buf.try_get_u32()?,
            },
            OPCODE_THROTTLE_CONFIGURE => CommandKind::ThrottleConfigure {
                packet_throttle_interval: buf.try_get_u32()?,
                packet_throttle_acceleration: buf.try_get_u32()?,
                packet_throttle_deceleration: buf.try_get_u32()?,
            },
            OPCODE_SEND_UNRELIABLE_FRAGMENT => CommandKind::SendUnreliableFragment {
                start_sequence_number: buf.try_get_u16()?,
                data_length: buf.try_get_u16()?,
                fragment_count: buf.try_get_u32()?,
                fragment_number: buf.try_get_u32()?,
                total_length: buf.try_get_u32()?,
                fragment_offset: buf.try_get_u32()?,
            },
            _ => bail!("unknown command opcode {}", opcode),
        };

        Ok(Command {
            flags,
            channel_id,
            reliable_sequence_number,
            kind,
        })
    }
}

/// packs peer id, session nibble and header flags into the leading header word
pub fn pack_header_word(peer_id: u16, session_id: u8, flags: u16) -> u16 {
    peer_id | ((session_id as u16) << HEADER_SESSION_SHIFT) & HEADER_SESSION_MASK | flags
}

pub struct HeaderWord {
    pub peer_id: u16,
    pub session_id: u8,
    pub flags: u16,
}

pub fn unpack_header_word(word: u16) -> HeaderWord {
    HeaderWord {
        peer_id: word & !(HEADER_FLAG_MASK | HEADER_SESSION_MASK),
        session_id: ((word & HEADER_SESSION_MASK) >> HEADER_SESSION_SHIFT) as u8,
        flags: word & HEADER_FLAG_MASK,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn roundtrip(command: Command) {
        let mut buf = BytesMut::new();
        command.ser(&mut buf);
        assert_eq!(buf.len(), command.wire_size());

        let mut b: &[u8] = &buf;
        let deser = Command::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, command);
    }

    #[rstest]
    #[case::acknowledge(CommandKind::Acknowledge { received_reliable_sequence_number: 17, received_sent_time: 40000 }, 0)]
    #[case::connect(CommandKind::Connect { outgoing_peer_id: 3, incoming_session_id: 1, outgoing_session_id: 2, mtu: 1400, window_size: 0x10000, channel_count: 2, incoming_bandwidth: 0, outgoing_bandwidth: 50000, packet_throttle_interval: 5000, packet_throttle_acceleration: 2, packet_throttle_deceleration: 2, connect_id: 0xDEADBEEF, data: 42 }, COMMAND_FLAG_ACKNOWLEDGE)]
    #[case::verify_connect(CommandKind::VerifyConnect { outgoing_peer_id: 9, incoming_session_id: 0, outgoing_session_id: 3, mtu: 576, window_size: 4096, channel_count: 255, incoming_bandwidth: 1, outgoing_bandwidth: 2, packet_throttle_interval: 5000, packet_throttle_acceleration: 2, packet_throttle_deceleration: 2, connect_id: 7 }, COMMAND_FLAG_ACKNOWLEDGE)]
    #[case::disconnect(CommandKind::Disconnect { data: 0xFFFF_FFFF }, COMMAND_FLAG_UNSEQUENCED)]
    #[case::ping(CommandKind::Ping, COMMAND_FLAG_ACKNOWLEDGE)]
    #[case::send_reliable(CommandKind::SendReliable { data_length: 1000 }, COMMAND_FLAG_ACKNOWLEDGE)]
    #[case::send_unreliable(CommandKind::SendUnreliable { unreliable_sequence_number: 5, data_length: 100 }, 0)]
    #[case::send_fragment(CommandKind::SendFragment { start_sequence_number: 1, data_length: 548, fragment_count: 8, fragment_number: 3, total_length: 4096, fragment_offset: 1644 }, COMMAND_FLAG_ACKNOWLEDGE)]
    #[case::send_unsequenced(CommandKind::SendUnsequenced { unsequenced_group: 1023, data_length: 12 }, COMMAND_FLAG_UNSEQUENCED)]
    #[case::bandwidth_limit(CommandKind::BandwidthLimit { incoming_bandwidth: 1_000_000, outgoing_bandwidth: 0 }, COMMAND_FLAG_ACKNOWLEDGE)]
    #[case::throttle_configure(CommandKind::ThrottleConfigure { packet_throttle_interval: 1000, packet_throttle_acceleration: 4, packet_throttle_deceleration: 1 }, COMMAND_FLAG_ACKNOWLEDGE)]
    #[case::send_unreliable_fragment(CommandKind::SendUnreliableFragment { start_sequence_number: 2, data_length: 100, fragment_count: 2, fragment_number: 0, total_length: 200, fragment_offset: 0 }, 0)]
    fn test_command_roundtrip(#[case] kind: CommandKind, #[case] flags: u8) {
        roundtrip(Command {
            flags,
            channel_id: 3,
            reliable_sequence_number: 0x1234,
            kind,
        });
    }

    #[rstest]
    #[case::opcode_zero(vec![0x00, 0, 0, 0])]
    #[case::opcode_out_of_range(vec![0x0D, 0, 0, 0])]
    #[case::truncated_header(vec![0x05, 0])]
    #[case::truncated_record(vec![0x02, 0xFF, 0, 1, 0, 3])]
    fn test_deser_rejects(#[case] bytes: Vec<u8>) {
        let mut b: &[u8] = &bytes;
        assert!(Command::deser(&mut b).is_err());
    }

    #[rstest]
    #[case(OPCODE_ACKNOWLEDGE, 8)]
    #[case(OPCODE_CONNECT, 48)]
    #[case(OPCODE_VERIFY_CONNECT, 44)]
    #[case(OPCODE_DISCONNECT, 8)]
    #[case(OPCODE_PING, 4)]
    #[case(OPCODE_SEND_RELIABLE, 6)]
    #[case(OPCODE_SEND_UNRELIABLE, 8)]
    #[case(OPCODE_SEND_FRAGMENT, 24)]
    #[case(OPCODE_SEND_UNSEQUENCED, 8)]
    #[case(OPCODE_BANDWIDTH_LIMIT, 12)]
    #[case(OPCODE_THROTTLE_CONFIGURE, 16)]
    #[case(OPCODE_SEND_UNRELIABLE_FRAGMENT, 24)]
    fn test_command_sizes(#[case] opcode: u8, #[case] expected: usize) {
        assert_eq!(command_size(opcode | COMMAND_FLAG_ACKNOWLEDGE), expected);
    }

    #[test]
    fn test_header_word_roundtrip() {
        let word = pack_header_word(0x123, 2, HEADER_FLAG_SENT_TIME);
        let unpacked = unpack_header_word(word);
        assert_eq!(unpacked.peer_id, 0x123);
        assert_eq!(unpacked.session_id, 2);
        assert_eq!(unpacked.flags, HEADER_FLAG_SENT_TIME);
    }
}
