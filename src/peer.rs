use crate::packet::Packet;
use crate::protocol::{
    command_size, Command, CommandKind, COMMAND_FLAG_ACKNOWLEDGE, COMMAND_FLAG_UNSEQUENCED,
    COMMAND_MASK, MAXIMUM_FRAGMENT_COUNT, MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE,
    OPCODE_SEND_UNSEQUENCED,
};
use anyhow::bail;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::net::SocketAddr;
use tracing::debug;

pub const DEFAULT_ROUND_TRIP_TIME: u32 = 500;
pub const DEFAULT_PACKET_THROTTLE: u32 = 32;
pub const PACKET_THROTTLE_SCALE: u32 = 32;
pub const PACKET_THROTTLE_COUNTER: u32 = 7;
pub const PACKET_THROTTLE_ACCELERATION: u32 = 2;
pub const PACKET_THROTTLE_DECELERATION: u32 = 2;
pub const PACKET_THROTTLE_INTERVAL: u32 = 5000;
pub const PACKET_LOSS_SCALE: u32 = 1 << 16;
pub const PACKET_LOSS_INTERVAL: u32 = 10_000;
pub const WINDOW_SIZE_SCALE: u32 = 64 * 1024;
pub const TIMEOUT_LIMIT: u32 = 32;
pub const TIMEOUT_MINIMUM: u32 = 5000;
pub const TIMEOUT_MAXIMUM: u32 = 30_000;
pub const PING_INTERVAL: u32 = 500;
pub const UNSEQUENCED_WINDOW_SIZE: u32 = 1024;
pub const FREE_UNSEQUENCED_WINDOWS: u32 = 32;
pub const RELIABLE_WINDOWS: u16 = 16;
pub const RELIABLE_WINDOW_SIZE: u16 = 0x1000;
pub const FREE_RELIABLE_WINDOWS: u16 = 8;

/// Connection lifecycle of a peer slot. The discriminant order is load
///  bearing: handshake progress is compared with `<`/`>=` in a few places.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    Disconnected,
    Connecting,
    AcknowledgingConnect,
    ConnectionPending,
    ConnectionSucceeded,
    Connected,
    DisconnectLater,
    Disconnecting,
    AcknowledgingDisconnect,
    Zombie,
}

/// A command queued for (re)transmission. Moves by value between the
///  outgoing and sent queues; for payload-carrying commands
///  `fragment_offset`/`fragment_length` select the slice of the shared
///  packet buffer that travels with this command.
#[derive(Debug)]
pub(crate) struct OutgoingCommand {
    pub command: Command,
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
    pub sent_time: u32,
    pub round_trip_timeout: u32,
    pub round_trip_timeout_limit: u32,
    pub fragment_offset: u32,
    pub fragment_length: u16,
    pub send_attempts: u16,
    pub packet: Option<Packet>,
}

/// A received command buffered until it can be delivered in order. For
///  fragmented messages this is the reassembly slot: `data` is pre-sized to
///  the total length and `fragments` tracks which pieces have arrived.
#[derive(Debug)]
pub(crate) struct IncomingCommand {
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
    pub command_byte: u8,
    pub channel_id: u8,
    pub fragment_count: u32,
    pub fragments_remaining: u32,
    pub fragments: Vec<u32>,
    pub data: BytesMut,
    pub packet_flags: u32,
}

/// A pending outbound ACK: enough of the received command to echo its
///  sequence number and sent time in the next datagram.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Acknowledgement {
    pub sent_time: u16,
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
    pub is_disconnect: bool,
}

pub(crate) struct Channel {
    pub outgoing_reliable_sequence_number: u16,
    pub outgoing_unreliable_sequence_number: u16,
    /// bit per reliable window with at least one command in flight
    pub used_reliable_windows: u16,
    /// in-flight reliable command count per window
    pub reliable_windows: [u16; RELIABLE_WINDOWS as usize],
    pub incoming_reliable_sequence_number: u16,
    pub incoming_unreliable_sequence_number: u16,
    pub incoming_reliable_commands: VecDeque<IncomingCommand>,
    pub incoming_unreliable_commands: VecDeque<IncomingCommand>,
}

impl Channel {
    pub fn new() -> Channel {
        Channel {
            outgoing_reliable_sequence_number: 0,
            outgoing_unreliable_sequence_number: 0,
            used_reliable_windows: 0,
            reliable_windows: [0; RELIABLE_WINDOWS as usize],
            incoming_reliable_sequence_number: 0,
            incoming_unreliable_sequence_number: 0,
            incoming_reliable_commands: VecDeque::new(),
            incoming_unreliable_commands: VecDeque::new(),
        }
    }
}

/// Outcome of admitting a received command into a channel queue. `Discarded`
///  covers duplicates, stale generations and commands arriving in states
///  that no longer accept data - silently dropped, not an error.
pub(crate) enum Admission {
    Accepted { unreliable: bool, index: usize },
    Discarded,
}

pub struct Peer {
    pub(crate) incoming_peer_id: u16,
    pub(crate) outgoing_peer_id: u16,
    pub(crate) connect_id: u32,
    pub(crate) outgoing_session_id: u8,
    pub(crate) incoming_session_id: u8,
    pub(crate) address: Option<SocketAddr>,
    pub(crate) state: PeerState,
    pub(crate) channels: Vec<Channel>,
    pub(crate) incoming_bandwidth: u32,
    pub(crate) outgoing_bandwidth: u32,
    pub(crate) incoming_bandwidth_throttle_epoch: u32,
    pub(crate) outgoing_bandwidth_throttle_epoch: u32,
    pub(crate) incoming_data_total: u32,
    pub(crate) outgoing_data_total: u32,
    pub(crate) last_send_time: u32,
    pub(crate) last_receive_time: u32,
    pub(crate) next_timeout: u32,
    pub(crate) earliest_timeout: u32,
    pub(crate) packet_loss_epoch: u32,
    pub(crate) packets_sent: u32,
    pub(crate) packets_lost: u32,
    /// mean loss ratio in units of 1/PACKET_LOSS_SCALE
    pub(crate) packet_loss: u32,
    pub(crate) packet_loss_variance: u32,
    pub(crate) packet_throttle: u32,
    pub(crate) packet_throttle_limit: u32,
    pub(crate) packet_throttle_counter: u32,
    pub(crate) packet_throttle_epoch: u32,
    pub(crate) packet_throttle_acceleration: u32,
    pub(crate) packet_throttle_deceleration: u32,
    pub(crate) packet_throttle_interval: u32,
    pub(crate) ping_interval: u32,
    pub(crate) timeout_limit: u32,
    pub(crate) timeout_minimum: u32,
    pub(crate) timeout_maximum: u32,
    pub(crate) last_round_trip_time: u32,
    pub(crate) lowest_round_trip_time: u32,
    pub(crate) last_round_trip_time_variance: u32,
    pub(crate) highest_round_trip_time_variance: u32,
    pub(crate) round_trip_time: u32,
    pub(crate) round_trip_time_variance: u32,
    pub(crate) mtu: u32,
    /// byte budget of unacknowledged reliable data in flight
    pub(crate) window_size: u32,
    pub(crate) reliable_data_in_transit: u32,
    /// reliable counter for control-channel (0xFF) commands
    pub(crate) outgoing_reliable_sequence_number: u16,
    pub(crate) acknowledgements: VecDeque<Acknowledgement>,
    pub(crate) sent_reliable_commands: VecDeque<OutgoingCommand>,
    pub(crate) sent_unreliable_commands: VecDeque<OutgoingCommand>,
    pub(crate) outgoing_reliable_commands: VecDeque<OutgoingCommand>,
    pub(crate) outgoing_unreliable_commands: VecDeque<OutgoingCommand>,
    pub(crate) dispatched_commands: VecDeque<IncomingCommand>,
    pub(crate) needs_dispatch: bool,
    pub(crate) incoming_unsequenced_group: u16,
    pub(crate) outgoing_unsequenced_group: u16,
    pub(crate) unsequenced_window: [u32; (UNSEQUENCED_WINDOW_SIZE / 32) as usize],
    pub(crate) event_data: u32,
    /// bytes of received payload buffered and not yet claimed by the
    ///  application
    pub(crate) total_waiting_data: usize,
}

impl Peer {
    pub(crate) fn new(incoming_peer_id: u16, mtu: u32) -> Peer {
        let mut peer = Peer {
            incoming_peer_id,
            outgoing_peer_id: MAXIMUM_PEER_ID,
            connect_id: 0,
            outgoing_session_id: 0xFF,
            incoming_session_id: 0xFF,
            address: None,
            state: PeerState::Disconnected,
            channels: Vec::new(),
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            incoming_bandwidth_throttle_epoch: 0,
            outgoing_bandwidth_throttle_epoch: 0,
            incoming_data_total: 0,
            outgoing_data_total: 0,
            last_send_time: 0,
            last_receive_time: 0,
            next_timeout: 0,
            earliest_timeout: 0,
            packet_loss_epoch: 0,
            packets_sent: 0,
            packets_lost: 0,
            packet_loss: 0,
            packet_loss_variance: 0,
            packet_throttle: 0,
            packet_throttle_limit: 0,
            packet_throttle_counter: 0,
            packet_throttle_epoch: 0,
            packet_throttle_acceleration: 0,
            packet_throttle_deceleration: 0,
            packet_throttle_interval: 0,
            ping_interval: 0,
            timeout_limit: 0,
            timeout_minimum: 0,
            timeout_maximum: 0,
            last_round_trip_time: 0,
            lowest_round_trip_time: 0,
            last_round_trip_time_variance: 0,
            highest_round_trip_time_variance: 0,
            round_trip_time: 0,
            round_trip_time_variance: 0,
            mtu,
            window_size: 0,
            reliable_data_in_transit: 0,
            outgoing_reliable_sequence_number: 0,
            acknowledgements: VecDeque::new(),
            sent_reliable_commands: VecDeque::new(),
            sent_unreliable_commands: VecDeque::new(),
            outgoing_reliable_commands: VecDeque::new(),
            outgoing_unreliable_commands: VecDeque::new(),
            dispatched_commands: VecDeque::new(),
            needs_dispatch: false,
            incoming_unsequenced_group: 0,
            outgoing_unsequenced_group: 0,
            unsequenced_window: [0; (UNSEQUENCED_WINDOW_SIZE / 32) as usize],
            event_data: 0,
            total_waiting_data: 0,
        };
        peer.reset(mtu);
        peer
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// smoothed mean round trip time in milliseconds
    pub fn round_trip_time(&self) -> u32 {
        self.round_trip_time
    }

    pub fn round_trip_time_variance(&self) -> u32 {
        self.round_trip_time_variance
    }

    /// mean loss ratio in units of 1/65536
    pub fn packet_loss(&self) -> u32 {
        self.packet_loss
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Clears all connection state except the slot's identity. The caller
    ///  is responsible for host-side bookkeeping (connected-peer counters,
    ///  removal from the dispatch queue).
    pub(crate) fn reset(&mut self, host_mtu: u32) {
        self.outgoing_peer_id = MAXIMUM_PEER_ID;
        self.connect_id = 0;

        self.state = PeerState::Disconnected;

        self.incoming_bandwidth = 0;
        self.outgoing_bandwidth = 0;
        self.incoming_bandwidth_throttle_epoch = 0;
        self.outgoing_bandwidth_throttle_epoch = 0;
        self.incoming_data_total = 0;
        self.outgoing_data_total = 0;
        self.last_send_time = 0;
        self.last_receive_time = 0;
        self.next_timeout = 0;
        self.earliest_timeout = 0;
        self.packet_loss_epoch = 0;
        self.packets_sent = 0;
        self.packets_lost = 0;
        self.packet_loss = 0;
        self.packet_loss_variance = 0;
        self.packet_throttle = DEFAULT_PACKET_THROTTLE;
        self.packet_throttle_limit = PACKET_THROTTLE_SCALE;
        self.packet_throttle_counter = 0;
        self.packet_throttle_epoch = 0;
        self.packet_throttle_acceleration = PACKET_THROTTLE_ACCELERATION;
        self.packet_throttle_deceleration = PACKET_THROTTLE_DECELERATION;
        self.packet_throttle_interval = PACKET_THROTTLE_INTERVAL;
        self.ping_interval = PING_INTERVAL;
        self.timeout_limit = TIMEOUT_LIMIT;
        self.timeout_minimum = TIMEOUT_MINIMUM;
        self.timeout_maximum = TIMEOUT_MAXIMUM;
        self.last_round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.lowest_round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.last_round_trip_time_variance = 0;
        self.highest_round_trip_time_variance = 0;
        self.round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.round_trip_time_variance = 0;
        self.mtu = host_mtu;
        self.reliable_data_in_transit = 0;
        self.outgoing_reliable_sequence_number = 0;
        self.window_size = MAXIMUM_WINDOW_SIZE;
        self.incoming_unsequenced_group = 0;
        self.outgoing_unsequenced_group = 0;
        self.event_data = 0;
        self.total_waiting_data = 0;
        self.unsequenced_window = [0; (UNSEQUENCED_WINDOW_SIZE / 32) as usize];

        self.reset_queues();
    }

    pub(crate) fn reset_queues(&mut self) {
        self.needs_dispatch = false;
        self.acknowledgements.clear();
        self.sent_reliable_commands.clear();
        self.sent_unreliable_commands.clear();
        self.outgoing_reliable_commands.clear();
        self.outgoing_unreliable_commands.clear();
        self.dispatched_commands.clear();
        self.channels.clear();
    }

    /// Adapts the probability of actually transmitting unreliable commands
    ///  from an observed round trip time: faster than the last interval's
    ///  mean accelerates, much slower decelerates, and a jitter-free link
    ///  snaps the throttle to its limit. An RTT equal to the mean changes
    ///  nothing.
    pub(crate) fn throttle(&mut self, rtt: u32) -> i32 {
        if self.last_round_trip_time <= self.last_round_trip_time_variance {
            self.packet_throttle = self.packet_throttle_limit;
        } else if rtt < self.last_round_trip_time {
            self.packet_throttle = self
                .packet_throttle
                .saturating_add(self.packet_throttle_acceleration)
                .min(self.packet_throttle_limit);
            return 1;
        } else if rtt > self.last_round_trip_time + 2 * self.last_round_trip_time_variance {
            self.packet_throttle = self
                .packet_throttle
                .saturating_sub(self.packet_throttle_deceleration);
            return -1;
        }

        0
    }

    /// Assigns sequence numbers per the command's delivery class and places
    ///  it on the matching outgoing queue.
    pub(crate) fn setup_outgoing_command(&mut self, mut outgoing: OutgoingCommand) {
        self.outgoing_data_total +=
            command_size(outgoing.command.command_byte()) as u32 + outgoing.fragment_length as u32;

        if outgoing.command.channel_id == 0xFF {
            self.outgoing_reliable_sequence_number =
                self.outgoing_reliable_sequence_number.wrapping_add(1);

            outgoing.reliable_sequence_number = self.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = 0;
        } else {
            let channel = &mut self.channels[outgoing.command.channel_id as usize];

            if outgoing.command.flags & COMMAND_FLAG_ACKNOWLEDGE != 0 {
                channel.outgoing_reliable_sequence_number =
                    channel.outgoing_reliable_sequence_number.wrapping_add(1);
                channel.outgoing_unreliable_sequence_number = 0;

                outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
                outgoing.unreliable_sequence_number = 0;
            } else if outgoing.command.flags & COMMAND_FLAG_UNSEQUENCED != 0 {
                self.outgoing_unsequenced_group = self.outgoing_unsequenced_group.wrapping_add(1);

                outgoing.reliable_sequence_number = 0;
                outgoing.unreliable_sequence_number = 0;
            } else {
                if outgoing.fragment_offset == 0 {
                    channel.outgoing_unreliable_sequence_number =
                        channel.outgoing_unreliable_sequence_number.wrapping_add(1);
                }

                outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
                outgoing.unreliable_sequence_number = channel.outgoing_unreliable_sequence_number;
            }
        }

        outgoing.send_attempts = 0;
        outgoing.sent_time = 0;
        outgoing.round_trip_timeout = 0;
        outgoing.round_trip_timeout_limit = 0;
        outgoing.command.reliable_sequence_number = outgoing.reliable_sequence_number;

        match &mut outgoing.command.kind {
            CommandKind::SendUnreliable {
                unreliable_sequence_number,
                ..
            } => *unreliable_sequence_number = outgoing.unreliable_sequence_number,
            CommandKind::SendUnsequenced {
                unsequenced_group, ..
            } => *unsequenced_group = self.outgoing_unsequenced_group,
            _ => {}
        }

        if outgoing.command.flags & COMMAND_FLAG_ACKNOWLEDGE != 0 {
            self.outgoing_reliable_commands.push_back(outgoing);
        } else {
            self.outgoing_unreliable_commands.push_back(outgoing);
        }
    }

    pub(crate) fn queue_outgoing_command(
        &mut self,
        command: Command,
        packet: Option<Packet>,
        fragment_offset: u32,
        fragment_length: u16,
    ) {
        self.setup_outgoing_command(OutgoingCommand {
            command,
            reliable_sequence_number: 0,
            unreliable_sequence_number: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            round_trip_timeout_limit: 0,
            fragment_offset,
            fragment_length,
            send_attempts: 0,
            packet,
        });
    }

    /// Queues the outbound ACK for a received command. Commands in the band
    ///  just past the receive window are suppressed - acknowledging them
    ///  would let the sender advance into windows the receiver cannot
    ///  accept yet.
    pub(crate) fn queue_acknowledgement(
        &mut self,
        command_byte: u8,
        channel_id: u8,
        reliable_sequence_number: u16,
        sent_time: u16,
    ) {
        if (channel_id as usize) < self.channels.len() {
            let channel = &self.channels[channel_id as usize];
            let mut reliable_window = reliable_sequence_number / RELIABLE_WINDOW_SIZE;
            let current_window = channel.incoming_reliable_sequence_number / RELIABLE_WINDOW_SIZE;

            if reliable_sequence_number < channel.incoming_reliable_sequence_number {
                reliable_window += RELIABLE_WINDOWS;
            }

            if reliable_window >= current_window + FREE_RELIABLE_WINDOWS - 1
                && reliable_window <= current_window + FREE_RELIABLE_WINDOWS
            {
                return;
            }
        }

        self.outgoing_data_total += command_size(crate::protocol::OPCODE_ACKNOWLEDGE) as u32;

        self.acknowledgements.push_back(Acknowledgement {
            sent_time,
            channel_id,
            reliable_sequence_number,
            is_disconnect: command_byte & COMMAND_MASK == crate::protocol::OPCODE_DISCONNECT,
        });
    }

    /// Removes the sent reliable command matched by an ACK and returns its
    ///  opcode for state-machine post-processing. Falls back to the
    ///  outgoing queue for commands acknowledged before their retransmit
    ///  made it back onto the wire.
    pub(crate) fn remove_sent_reliable_command(
        &mut self,
        reliable_sequence_number: u16,
        channel_id: u8,
    ) -> Option<u8> {
        let mut was_sent = true;

        let mut position = self.sent_reliable_commands.iter().position(|command| {
            command.reliable_sequence_number == reliable_sequence_number
                && command.command.channel_id == channel_id
        });

        let outgoing = match position {
            Some(index) => self.sent_reliable_commands.remove(index).unwrap(),
            None => {
                position = None;
                for (index, command) in self.outgoing_reliable_commands.iter().enumerate() {
                    if command.send_attempts < 1 {
                        return None;
                    }
                    if command.reliable_sequence_number == reliable_sequence_number
                        && command.command.channel_id == channel_id
                    {
                        position = Some(index);
                        break;
                    }
                }
                was_sent = false;
                self.outgoing_reliable_commands.remove(position?).unwrap()
            }
        };

        if (channel_id as usize) < self.channels.len() {
            let channel = &mut self.channels[channel_id as usize];
            let reliable_window = (reliable_sequence_number / RELIABLE_WINDOW_SIZE) as usize;
            if channel.reliable_windows[reliable_window] > 0 {
                channel.reliable_windows[reliable_window] -= 1;
                if channel.reliable_windows[reliable_window] == 0 {
                    channel.used_reliable_windows &= !(1 << reliable_window);
                }
            }
        }

        let opcode = outgoing.command.kind.opcode();

        if outgoing.packet.is_some() && was_sent {
            self.reliable_data_in_transit = self
                .reliable_data_in_transit
                .saturating_sub(outgoing.fragment_length as u32);
        }

        if let Some(front) = self.sent_reliable_commands.front() {
            self.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
        }

        Some(opcode)
    }

    /// Admits a received command into the proper channel queue at its sorted
    ///  position. Returns where it landed, `Discarded` for duplicates and
    ///  stale generations, or an error when flow control or allocation
    ///  limits are violated (which aborts the datagram).
    pub(crate) fn queue_incoming_command(
        &mut self,
        command: &Command,
        data: Option<&[u8]>,
        data_length: usize,
        packet_flags: u32,
        fragment_count: u32,
        maximum_waiting_data: usize,
    ) -> anyhow::Result<Admission> {
        let opcode = command.kind.opcode();
        let channel = &self.channels[command.channel_id as usize];
        let mut unreliable_sequence_number = 0u32;
        let reliable_sequence_number = command.reliable_sequence_number;

        let discard = |fragment_count: u32| -> anyhow::Result<Admission> {
            if fragment_count > 0 {
                bail!("fragment command cannot be discarded silently");
            }
            Ok(Admission::Discarded)
        };

        if self.state == PeerState::DisconnectLater {
            return discard(fragment_count);
        }

        if opcode != OPCODE_SEND_UNSEQUENCED {
            let mut reliable_window = reliable_sequence_number / RELIABLE_WINDOW_SIZE;
            let current_window = channel.incoming_reliable_sequence_number / RELIABLE_WINDOW_SIZE;

            if reliable_sequence_number < channel.incoming_reliable_sequence_number {
                reliable_window += RELIABLE_WINDOWS;
            }

            if reliable_window < current_window
                || reliable_window >= current_window + FREE_RELIABLE_WINDOWS - 1
            {
                return discard(fragment_count);
            }
        }

        let (unreliable, insert_index) = match opcode {
            crate::protocol::OPCODE_SEND_FRAGMENT | crate::protocol::OPCODE_SEND_RELIABLE => {
                if reliable_sequence_number == channel.incoming_reliable_sequence_number {
                    return discard(fragment_count);
                }

                let queue = &channel.incoming_reliable_commands;
                let mut insert_index = 0;
                for index in (0..queue.len()).rev() {
                    let incoming = &queue[index];

                    if reliable_sequence_number >= channel.incoming_reliable_sequence_number {
                        if incoming.reliable_sequence_number
                            < channel.incoming_reliable_sequence_number
                        {
                            continue;
                        }
                    } else if incoming.reliable_sequence_number
                        >= channel.incoming_reliable_sequence_number
                    {
                        insert_index = index + 1;
                        break;
                    }

                    if incoming.reliable_sequence_number <= reliable_sequence_number {
                        if incoming.reliable_sequence_number < reliable_sequence_number {
                            insert_index = index + 1;
                            break;
                        }
                        return discard(fragment_count);
                    }
                }
                (false, insert_index)
            }

            crate::protocol::OPCODE_SEND_UNRELIABLE
            | crate::protocol::OPCODE_SEND_UNRELIABLE_FRAGMENT => {
                unreliable_sequence_number = match &command.kind {
                    CommandKind::SendUnreliable {
                        unreliable_sequence_number,
                        ..
                    } => *unreliable_sequence_number as u32,
                    CommandKind::SendUnreliableFragment {
                        start_sequence_number,
                        ..
                    } => *start_sequence_number as u32,
                    _ => 0,
                };

                if reliable_sequence_number == channel.incoming_reliable_sequence_number
                    && unreliable_sequence_number
                        <= channel.incoming_unreliable_sequence_number as u32
                {
                    return discard(fragment_count);
                }

                let queue = &channel.incoming_unreliable_commands;
                let mut insert_index = 0;
                for index in (0..queue.len()).rev() {
                    let incoming = &queue[index];

                    if reliable_sequence_number >= channel.incoming_reliable_sequence_number {
                        if incoming.reliable_sequence_number
                            < channel.incoming_reliable_sequence_number
                        {
                            continue;
                        }
                    } else if incoming.reliable_sequence_number
                        >= channel.incoming_reliable_sequence_number
                    {
                        insert_index = index + 1;
                        break;
                    }

                    if incoming.reliable_sequence_number < reliable_sequence_number {
                        insert_index = index + 1;
                        break;
                    }
                    if incoming.reliable_sequence_number > reliable_sequence_number {
                        continue;
                    }

                    if incoming.unreliable_sequence_number as u32 <= unreliable_sequence_number {
                        if (incoming.unreliable_sequence_number as u32)
                            < unreliable_sequence_number
                        {
                            insert_index = index + 1;
                            break;
                        }
                        return discard(fragment_count);
                    }
                }
                (true, insert_index)
            }

            OPCODE_SEND_UNSEQUENCED => (true, 0),

            _ => return discard(fragment_count),
        };

        if self.total_waiting_data >= maximum_waiting_data {
            bail!("maximum waiting data exceeded");
        }

        let mut buffer = BytesMut::zeroed(data_length);
        if let Some(data) = data {
            buffer[..data.len()].copy_from_slice(data);
        }

        let fragments = if fragment_count > 0 {
            if fragment_count > MAXIMUM_FRAGMENT_COUNT {
                bail!("fragment count {} out of range", fragment_count);
            }
            vec![0u32; (fragment_count as usize + 31) / 32]
        } else {
            Vec::new()
        };

        self.total_waiting_data += data_length;

        let incoming = IncomingCommand {
            reliable_sequence_number,
            unreliable_sequence_number: unreliable_sequence_number as u16,
            command_byte: command.command_byte(),
            channel_id: command.channel_id,
            fragment_count,
            fragments_remaining: fragment_count,
            fragments,
            data: buffer,
            packet_flags,
        };

        let channel = &mut self.channels[command.channel_id as usize];
        if unreliable {
            channel
                .incoming_unreliable_commands
                .insert(insert_index, incoming);
        } else {
            channel
                .incoming_reliable_commands
                .insert(insert_index, incoming);
        }

        Ok(Admission::Accepted {
            unreliable,
            index: insert_index,
        })
    }

    /// Moves the longest dispatchable prefix of the channel's reliable queue
    ///  to the peer's dispatched queue, advancing the channel's reliable
    ///  sequence number (fragmented messages advance it by their fragment
    ///  count). Returns true if the peer newly needs host-level dispatch.
    pub(crate) fn dispatch_incoming_reliable_commands(&mut self, channel_id: u8) -> bool {
        let Peer {
            channels,
            dispatched_commands,
            needs_dispatch,
            ..
        } = self;
        let channel = &mut channels[channel_id as usize];

        let mut count = 0;
        while count < channel.incoming_reliable_commands.len() {
            let incoming = &channel.incoming_reliable_commands[count];

            if incoming.fragments_remaining > 0
                || incoming.reliable_sequence_number
                    != channel.incoming_reliable_sequence_number.wrapping_add(1)
            {
                break;
            }

            channel.incoming_reliable_sequence_number = incoming.reliable_sequence_number;

            if incoming.fragment_count > 0 {
                channel.incoming_reliable_sequence_number = channel
                    .incoming_reliable_sequence_number
                    .wrapping_add((incoming.fragment_count - 1) as u16);
            }

            count += 1;
        }

        if count == 0 {
            return false;
        }

        channel.incoming_unreliable_sequence_number = 0;
        dispatched_commands.extend(channel.incoming_reliable_commands.drain(..count));

        let mut newly_flagged = !*needs_dispatch;
        *needs_dispatch = true;

        if !channel.incoming_unreliable_commands.is_empty() {
            newly_flagged |= self.dispatch_incoming_unreliable_commands(channel_id);
        }

        newly_flagged
    }

    /// Delivers the unreliable queue: commands of the current reliable
    ///  generation go out in unreliable-sequence order (unsequenced
    ///  commands ride along without affecting the ordering state), commands
    ///  of a nearby future generation stay queued, and everything stale is
    ///  dropped. Returns true if the peer newly needs host-level dispatch.
    pub(crate) fn dispatch_incoming_unreliable_commands(&mut self, channel_id: u8) -> bool {
        let Peer {
            channels,
            dispatched_commands,
            needs_dispatch,
            ..
        } = self;
        let channel = &mut channels[channel_id as usize];
        let queue = &mut channel.incoming_unreliable_commands;

        let mut dispatch_ranges: Vec<(usize, usize)> = Vec::new();
        let mut dropped = 0usize;
        let mut start = 0usize;
        let mut current = 0usize;

        while current < queue.len() {
            let incoming = &queue[current];

            if incoming.command_byte & COMMAND_MASK == OPCODE_SEND_UNSEQUENCED {
                current += 1;
                continue;
            }

            if incoming.reliable_sequence_number == channel.incoming_reliable_sequence_number {
                if incoming.fragments_remaining == 0 {
                    channel.incoming_unreliable_sequence_number =
                        incoming.unreliable_sequence_number;
                    current += 1;
                    continue;
                }

                // an incomplete unreliable fragment blocks here; the run
                //  before it is deliverable
                if start != current {
                    dispatch_ranges.push((start, current));
                    dropped = current;
                } else if dropped != current {
                    dropped = current - 1;
                }
            } else {
                let mut reliable_window =
                    incoming.reliable_sequence_number / RELIABLE_WINDOW_SIZE;
                let current_window =
                    channel.incoming_reliable_sequence_number / RELIABLE_WINDOW_SIZE;
                if incoming.reliable_sequence_number < channel.incoming_reliable_sequence_number {
                    reliable_window += RELIABLE_WINDOWS;
                }
                if reliable_window >= current_window
                    && reliable_window < current_window + FREE_RELIABLE_WINDOWS - 1
                {
                    // near-future generation: defer this and everything after
                    break;
                }

                dropped = current + 1;
                if start != current {
                    dispatch_ranges.push((start, current));
                }
            }

            current += 1;
            start = current;
        }

        if start != current {
            dispatch_ranges.push((start, current));
            dropped = current;
        }

        if dispatch_ranges.is_empty() && dropped == 0 {
            return false;
        }

        let mut is_dispatched = vec![false; queue.len()];
        for &(range_start, range_end) in &dispatch_ranges {
            for flag in &mut is_dispatched[range_start..range_end] {
                *flag = true;
            }
        }

        let mut newly_flagged = false;
        let drained: Vec<IncomingCommand> = queue.drain(..).collect();
        for (index, incoming) in drained.into_iter().enumerate() {
            if is_dispatched[index] {
                dispatched_commands.push_back(incoming);
                if !*needs_dispatch {
                    *needs_dispatch = true;
                    newly_flagged = true;
                }
            } else if index >= dropped {
                queue.push_back(incoming);
            } else {
                debug!(
                    "dropping stale unreliable command #{} on channel {}",
                    incoming.unreliable_sequence_number, channel_id
                );
            }
        }

        newly_flagged
    }

    /// Queues a ping on the control channel. Pings keep idle connections
    ///  alive and feed the round-trip-time estimate.
    pub(crate) fn ping(&mut self) {
        if self.state != PeerState::Connected {
            return;
        }

        self.queue_outgoing_command(
            Command {
                flags: COMMAND_FLAG_ACKNOWLEDGE,
                channel_id: 0xFF,
                reliable_sequence_number: 0,
                kind: CommandKind::Ping,
            },
            None,
            0,
            0,
        );
    }

    /// Dequeues one fully-dispatched message, releasing its flow-control
    ///  budget.
    pub(crate) fn receive(&mut self) -> Option<(u8, Packet)> {
        let incoming = self.dispatched_commands.pop_front()?;

        self.total_waiting_data = self.total_waiting_data.saturating_sub(incoming.data.len());

        Some((
            incoming.channel_id,
            Packet {
                data: incoming.data.freeze(),
                flags: incoming.packet_flags,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn connected_peer(channel_count: usize) -> Peer {
        let mut peer = Peer::new(0, 1400);
        peer.state = PeerState::Connected;
        peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
        peer
    }

    #[rstest]
    // last interval was jitter-free: snap to the limit
    #[case::snap_to_limit(50, 100, 100, 16, 32, 0)]
    // faster than last interval's mean: accelerate
    #[case::accelerate(200, 10, 100, 16, 18, 1)]
    // acceleration is capped by the limit
    #[case::accelerate_capped(200, 10, 100, 31, 32, 1)]
    // much slower than the mean: decelerate
    #[case::decelerate(200, 10, 300, 16, 14, -1)]
    // deceleration floors at zero
    #[case::decelerate_floored(200, 10, 300, 1, 0, -1)]
    // equal to the mean: no change at all
    #[case::equal_rtt_no_change(200, 10, 200, 16, 16, 0)]
    // slower but within 2 variances: no change
    #[case::within_variance(200, 10, 215, 16, 16, 0)]
    fn test_throttle(
        #[case] last_rtt: u32,
        #[case] last_variance: u32,
        #[case] rtt: u32,
        #[case] throttle_before: u32,
        #[case] throttle_after: u32,
        #[case] expected_result: i32,
    ) {
        let mut peer = connected_peer(1);
        peer.last_round_trip_time = last_rtt;
        peer.last_round_trip_time_variance = last_variance;
        peer.packet_throttle = throttle_before;

        assert_eq!(peer.throttle(rtt), expected_result);
        assert_eq!(peer.packet_throttle, throttle_after);
    }

    fn make_command(flags: u8, channel_id: u8, kind: CommandKind) -> Command {
        Command {
            flags,
            channel_id,
            reliable_sequence_number: 0,
            kind,
        }
    }

    #[test]
    fn test_setup_control_channel_bumps_peer_counter() {
        let mut peer = connected_peer(1);

        peer.queue_outgoing_command(
            make_command(COMMAND_FLAG_ACKNOWLEDGE, 0xFF, CommandKind::Ping),
            None,
            0,
            0,
        );
        peer.queue_outgoing_command(
            make_command(COMMAND_FLAG_ACKNOWLEDGE, 0xFF, CommandKind::Ping),
            None,
            0,
            0,
        );

        // the first control-channel reliable sequence number must be 1
        assert_eq!(
            peer.outgoing_reliable_commands[0].reliable_sequence_number,
            1
        );
        assert_eq!(
            peer.outgoing_reliable_commands[1].reliable_sequence_number,
            2
        );
        assert_eq!(peer.channels[0].outgoing_reliable_sequence_number, 0);
    }

    #[test]
    fn test_setup_reliable_resets_channel_unreliable_counter() {
        let mut peer = connected_peer(1);

        peer.queue_outgoing_command(
            make_command(0, 0, CommandKind::SendUnreliable { unreliable_sequence_number: 0, data_length: 1 }),
            Some(Packet::unreliable(vec![0])),
            0,
            1,
        );
        assert_eq!(peer.channels[0].outgoing_unreliable_sequence_number, 1);

        peer.queue_outgoing_command(
            make_command(COMMAND_FLAG_ACKNOWLEDGE, 0, CommandKind::SendReliable { data_length: 1 }),
            Some(Packet::reliable(vec![0])),
            0,
            1,
        );
        assert_eq!(peer.channels[0].outgoing_reliable_sequence_number, 1);
        assert_eq!(peer.channels[0].outgoing_unreliable_sequence_number, 0);

        let unreliable = &peer.outgoing_unreliable_commands[0];
        assert_eq!(unreliable.reliable_sequence_number, 0);
        assert_eq!(unreliable.unreliable_sequence_number, 1);

        let reliable = &peer.outgoing_reliable_commands[0];
        assert_eq!(reliable.reliable_sequence_number, 1);
    }

    #[test]
    fn test_setup_unsequenced_bumps_group() {
        let mut peer = connected_peer(1);

        for _ in 0..3 {
            peer.queue_outgoing_command(
                make_command(
                    COMMAND_FLAG_UNSEQUENCED,
                    0,
                    CommandKind::SendUnsequenced { unsequenced_group: 0, data_length: 1 },
                ),
                Some(Packet::unsequenced(vec![0])),
                0,
                1,
            );
        }

        assert_eq!(peer.outgoing_unsequenced_group, 3);
        match &peer.outgoing_unreliable_commands[2].command.kind {
            CommandKind::SendUnsequenced { unsequenced_group, .. } => {
                assert_eq!(*unsequenced_group, 3)
            }
            other => panic!("unexpected command kind {:?}", other),
        }
    }

    fn incoming_reliable(sequence: u16) -> Command {
        Command {
            flags: COMMAND_FLAG_ACKNOWLEDGE,
            channel_id: 0,
            reliable_sequence_number: sequence,
            kind: CommandKind::SendReliable { data_length: 1 },
        }
    }

    #[test]
    fn test_queue_incoming_rejects_duplicates() {
        let mut peer = connected_peer(1);

        let admission = peer
            .queue_incoming_command(&incoming_reliable(1), Some(&[1]), 1, 0, 0, usize::MAX)
            .unwrap();
        assert!(matches!(admission, Admission::Accepted { unreliable: false, index: 0 }));

        let duplicate = peer
            .queue_incoming_command(&incoming_reliable(1), Some(&[1]), 1, 0, 0, usize::MAX)
            .unwrap();
        assert!(matches!(duplicate, Admission::Discarded));
    }

    #[test]
    fn test_queue_incoming_sorts_out_of_order() {
        let mut peer = connected_peer(1);

        peer.queue_incoming_command(&incoming_reliable(3), Some(&[3]), 1, 0, 0, usize::MAX)
            .unwrap();
        peer.queue_incoming_command(&incoming_reliable(1), Some(&[1]), 1, 0, 0, usize::MAX)
            .unwrap();
        peer.queue_incoming_command(&incoming_reliable(2), Some(&[2]), 1, 0, 0, usize::MAX)
            .unwrap();

        let sequences: Vec<u16> = peer.channels[0]
            .incoming_reliable_commands
            .iter()
            .map(|command| command.reliable_sequence_number)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[test]
    fn test_queue_incoming_enforces_waiting_data_cap() {
        let mut peer = connected_peer(1);
        peer.total_waiting_data = 10;

        assert!(peer
            .queue_incoming_command(&incoming_reliable(1), Some(&[1]), 1, 0, 0, 10)
            .is_err());
    }

    #[test]
    fn test_dispatch_reliable_in_order_prefix() {
        let mut peer = connected_peer(1);

        for sequence in [2u16, 1, 4] {
            peer.queue_incoming_command(
                &incoming_reliable(sequence),
                Some(&[sequence as u8]),
                1,
                0,
                0,
                usize::MAX,
            )
            .unwrap();
        }

        let newly = peer.dispatch_incoming_reliable_commands(0);
        assert!(newly);
        assert!(peer.needs_dispatch);

        // 1 and 2 dispatch; 4 stays queued waiting for 3
        assert_eq!(peer.dispatched_commands.len(), 2);
        assert_eq!(peer.channels[0].incoming_reliable_commands.len(), 1);
        assert_eq!(peer.channels[0].incoming_reliable_sequence_number, 2);

        let (channel_id, packet) = peer.receive().unwrap();
        assert_eq!(channel_id, 0);
        assert_eq!(packet.data.as_ref(), &[1]);
        let (_, packet) = peer.receive().unwrap();
        assert_eq!(packet.data.as_ref(), &[2]);
        assert!(peer.receive().is_none());
    }

    #[test]
    fn test_receive_releases_waiting_data() {
        let mut peer = connected_peer(1);

        peer.queue_incoming_command(&incoming_reliable(1), Some(&[9]), 1, 0, 0, usize::MAX)
            .unwrap();
        assert_eq!(peer.total_waiting_data, 1);

        peer.dispatch_incoming_reliable_commands(0);
        peer.receive().unwrap();
        assert_eq!(peer.total_waiting_data, 0);
    }

    #[test]
    fn test_remove_sent_reliable_command_updates_window() {
        let mut peer = connected_peer(1);

        peer.queue_outgoing_command(
            make_command(COMMAND_FLAG_ACKNOWLEDGE, 0, CommandKind::SendReliable { data_length: 1 }),
            Some(Packet::reliable(vec![0])),
            0,
            1,
        );

        // simulate the send pass moving it to the sent queue
        let mut outgoing = peer.outgoing_reliable_commands.pop_front().unwrap();
        outgoing.send_attempts = 1;
        peer.channels[0].used_reliable_windows |= 1;
        peer.channels[0].reliable_windows[0] = 1;
        peer.reliable_data_in_transit = 1;
        peer.sent_reliable_commands.push_back(outgoing);

        let opcode = peer.remove_sent_reliable_command(1, 0);
        assert_eq!(opcode, Some(crate::protocol::OPCODE_SEND_RELIABLE));
        assert_eq!(peer.reliable_data_in_transit, 0);
        assert_eq!(peer.channels[0].reliable_windows[0], 0);
        assert_eq!(peer.channels[0].used_reliable_windows, 0);

        // unknown sequence numbers are ignored
        assert_eq!(peer.remove_sent_reliable_command(9, 0), None);
    }
}
