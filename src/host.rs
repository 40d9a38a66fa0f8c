use crate::checksum::ChecksumFn;
use crate::clock::{self, Clock, MonotonicClock};
use crate::compress::Compressor;
use crate::config::{clamp_channel_limit, HostConfig};
use crate::event::{Event, PeerId};
use crate::packet::{
    Packet, PACKET_FLAG_RELIABLE, PACKET_FLAG_UNRELIABLE_FRAGMENT, PACKET_FLAG_UNSEQUENCED,
};
use crate::peer::{
    Admission, Channel, Peer, PeerState, FREE_RELIABLE_WINDOWS, FREE_UNSEQUENCED_WINDOWS,
    PACKET_LOSS_INTERVAL, PACKET_LOSS_SCALE, PACKET_THROTTLE_COUNTER, PACKET_THROTTLE_SCALE,
    PING_INTERVAL, RELIABLE_WINDOWS, RELIABLE_WINDOW_SIZE, TIMEOUT_LIMIT, TIMEOUT_MAXIMUM,
    TIMEOUT_MINIMUM, UNSEQUENCED_WINDOW_SIZE, WINDOW_SIZE_SCALE,
};
use crate::protocol::{
    command_size, unpack_header_word, Command, CommandKind, COMMAND_FLAG_ACKNOWLEDGE,
    COMMAND_FLAG_UNSEQUENCED, COMMAND_MASK, HEADER_FLAG_COMPRESSED, HEADER_FLAG_SENT_TIME,
    HEADER_SESSION_SHIFT, MAXIMUM_CHANNEL_COUNT, MAXIMUM_FRAGMENT_COUNT, MAXIMUM_MTU,
    MAXIMUM_PACKET_COMMANDS, MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE, MINIMUM_CHANNEL_COUNT,
    MINIMUM_MTU, MINIMUM_WINDOW_SIZE, OPCODE_ACKNOWLEDGE, OPCODE_CONNECT, OPCODE_DISCONNECT,
    OPCODE_SEND_FRAGMENT, OPCODE_SEND_UNRELIABLE_FRAGMENT, OPCODE_VERIFY_CONNECT,
};
use crate::socket::{DatagramSocket, UdpDatagramSocket, WAIT_INTERRUPT, WAIT_RECEIVE};
use anyhow::bail;
use bytes::{BufMut, BytesMut};
use rand::RngCore;
use std::collections::VecDeque;
use std::net::SocketAddr;
use tracing::{debug, info, trace, warn};

pub const BANDWIDTH_THROTTLE_INTERVAL: u32 = 1000;

/// how many datagrams a single receive pass drains before letting the
///  service loop send again
const RECEIVE_BURST_LIMIT: usize = 256;

/// Result of the raw-datagram intercept hook: hand the datagram to the
///  protocol, consume it (optionally surfacing an event), or abort the
///  service call.
pub enum InterceptResult {
    Pass,
    Consume(Option<Event>),
    Abort,
}

pub type InterceptFn = Box<dyn FnMut(SocketAddr, &[u8]) -> InterceptResult>;

/// The datagram under construction during a send pass: serialized commands
///  (header excluded) plus the budget bookkeeping that decides when the
///  datagram is full.
struct SendPass {
    command_buffer: BytesMut,
    command_count: usize,
    /// bytes the datagram will occupy on the wire, header word included
    packet_size: usize,
    header_flags: u16,
    continue_sending: bool,
}

impl SendPass {
    fn new() -> SendPass {
        SendPass {
            command_buffer: BytesMut::with_capacity(MAXIMUM_MTU as usize),
            command_count: 0,
            packet_size: crate::protocol::HEADER_SIZE_WITH_SENT_TIME,
            header_flags: 0,
            continue_sending: false,
        }
    }
}

/// One endpoint of the transport: a single datagram socket multiplexing up
///  to `peer_count` logical connections, each carrying up to 255
///  independently sequenced channels.
pub struct Host {
    socket: Box<dyn DatagramSocket>,
    clock: Box<dyn Clock>,
    peers: Vec<Peer>,
    dispatch_queue: VecDeque<usize>,
    channel_limit: usize,
    incoming_bandwidth: u32,
    outgoing_bandwidth: u32,
    bandwidth_throttle_epoch: u32,
    recalculate_bandwidth_limits: bool,
    mtu: u32,
    maximum_packet_size: usize,
    maximum_waiting_data: usize,
    duplicate_peers: usize,
    random_seed: u32,
    /// snapshot of the clock taken at the top of the current service tick
    service_time: u32,
    compressor: Option<Box<dyn Compressor>>,
    checksum: Option<ChecksumFn>,
    intercept: Option<InterceptFn>,
    connected_peers: usize,
    bandwidth_limited_peers: usize,
    total_sent_data: u64,
    total_sent_packets: u64,
    total_received_data: u64,
    total_received_packets: u64,
}

impl Host {
    /// Binds a UDP socket at `address` and readies `config.peer_count` peer
    ///  slots.
    pub fn new(address: SocketAddr, config: HostConfig) -> anyhow::Result<Host> {
        let socket = UdpDatagramSocket::bind(address)?;
        info!("bound host socket to {:?}", socket.local_addr()?);
        Host::with_transport(config, Box::new(socket), Box::new(MonotonicClock::new()))
    }

    /// Builds a host over an arbitrary socket and clock. This is the seam
    ///  tests and in-memory transports plug into.
    pub fn with_transport(
        config: HostConfig,
        socket: Box<dyn DatagramSocket>,
        clock: Box<dyn Clock>,
    ) -> anyhow::Result<Host> {
        config.validate()?;

        let peers = (0..config.peer_count)
            .map(|index| Peer::new(index as u16, config.mtu))
            .collect();

        Ok(Host {
            socket,
            clock,
            peers,
            dispatch_queue: VecDeque::new(),
            channel_limit: config.effective_channel_limit(),
            incoming_bandwidth: config.incoming_bandwidth,
            outgoing_bandwidth: config.outgoing_bandwidth,
            bandwidth_throttle_epoch: 0,
            recalculate_bandwidth_limits: false,
            mtu: config.mtu,
            maximum_packet_size: config.maximum_packet_size,
            maximum_waiting_data: config.maximum_waiting_data,
            duplicate_peers: config.duplicate_peers,
            random_seed: rand::rng().next_u32(),
            service_time: 0,
            compressor: None,
            checksum: None,
            intercept: None,
            connected_peers: 0,
            bandwidth_limited_peers: 0,
            total_sent_data: 0,
            total_sent_packets: 0,
            total_received_data: 0,
            total_received_packets: 0,
        })
    }

    pub fn peer(&self, peer: PeerId) -> &Peer {
        &self.peers[peer.0]
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn total_sent_data(&self) -> u64 {
        self.total_sent_data
    }

    pub fn total_sent_packets(&self) -> u64 {
        self.total_sent_packets
    }

    pub fn total_received_data(&self) -> u64 {
        self.total_received_data
    }

    pub fn total_received_packets(&self) -> u64 {
        self.total_received_packets
    }

    /// Installs a per-datagram compressor, or removes it with `None`.
    pub fn set_compressor(&mut self, compressor: Option<Box<dyn Compressor>>) {
        self.compressor = compressor;
    }

    /// Installs the built-in range coder as the per-datagram compressor.
    pub fn compress_with_range_coder(&mut self) {
        self.compressor = Some(Box::new(crate::compress::RangeCoder::new()));
    }

    /// Installs a per-datagram checksum, or removes it with `None`.
    pub fn set_checksum(&mut self, checksum: Option<ChecksumFn>) {
        self.checksum = checksum;
    }

    /// Installs the built-in CRC-32 as the per-datagram checksum.
    pub fn checksum_with_crc32(&mut self) {
        self.checksum = Some(Box::new(crate::checksum::crc32));
    }

    /// Installs a hook that sees every received datagram before the
    ///  protocol does.
    pub fn set_intercept(&mut self, intercept: Option<InterceptFn>) {
        self.intercept = intercept;
    }

    /// Limits the channel count of future incoming connections.
    pub fn set_channel_limit(&mut self, channel_limit: usize) {
        self.channel_limit = clamp_channel_limit(channel_limit);
    }

    /// Adjusts the host bandwidth budgets; the new limits are announced to
    ///  connected peers on the next throttle interval.
    pub fn set_bandwidth_limit(&mut self, incoming_bandwidth: u32, outgoing_bandwidth: u32) {
        self.incoming_bandwidth = incoming_bandwidth;
        self.outgoing_bandwidth = outgoing_bandwidth;
        self.recalculate_bandwidth_limits = true;
    }

    /// Initiates a connection to `address`, allocating `channel_count`
    ///  channels. The connection is complete only once `service` surfaces a
    ///  `Connect` event for the returned peer.
    pub fn connect(
        &mut self,
        address: SocketAddr,
        channel_count: usize,
        data: u32,
    ) -> anyhow::Result<PeerId> {
        let channel_count = channel_count.clamp(MINIMUM_CHANNEL_COUNT, MAXIMUM_CHANNEL_COUNT);

        let index = self
            .peers
            .iter()
            .position(|peer| peer.state == PeerState::Disconnected);
        let Some(index) = index else {
            bail!("no free peer slot for connection to {:?}", address);
        };

        self.random_seed = self.random_seed.wrapping_add(1);
        let connect_id = self.random_seed;

        let outgoing_bandwidth = self.outgoing_bandwidth;
        let incoming_bandwidth = self.incoming_bandwidth;

        let peer = &mut self.peers[index];
        peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
        peer.state = PeerState::Connecting;
        peer.address = Some(address);
        peer.connect_id = connect_id;

        peer.window_size = if outgoing_bandwidth == 0 {
            MAXIMUM_WINDOW_SIZE
        } else {
            ((outgoing_bandwidth / WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE)
                .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE)
        };

        let command = Command {
            flags: COMMAND_FLAG_ACKNOWLEDGE,
            channel_id: 0xFF,
            reliable_sequence_number: 0,
            kind: CommandKind::Connect {
                outgoing_peer_id: peer.incoming_peer_id,
                incoming_session_id: peer.incoming_session_id,
                outgoing_session_id: peer.outgoing_session_id,
                mtu: peer.mtu,
                window_size: peer.window_size,
                channel_count: channel_count as u32,
                incoming_bandwidth,
                outgoing_bandwidth,
                packet_throttle_interval: peer.packet_throttle_interval,
                packet_throttle_acceleration: peer.packet_throttle_acceleration,
                packet_throttle_deceleration: peer.packet_throttle_deceleration,
                connect_id,
                data,
            },
        };

        peer.queue_outgoing_command(command, None, 0, 0);

        debug!("connecting to {:?} as peer {}", address, index);
        Ok(PeerId(index))
    }

    /// Queues a message for delivery on one of the peer's channels. The
    ///  delivery class comes from the packet's flags; payloads bigger than
    ///  what fits alongside a fragment record in one datagram are split
    ///  into fragments sharing the payload buffer.
    pub fn send(&mut self, peer: PeerId, channel_id: u8, packet: Packet) -> anyhow::Result<()> {
        let checksum_overhead = if self.checksum.is_some() { 4 } else { 0 };
        let maximum_packet_size = self.maximum_packet_size;

        let peer = &mut self.peers[peer.0];

        if peer.state != PeerState::Connected {
            bail!("peer is not connected");
        }
        if channel_id as usize >= peer.channels.len() {
            bail!("channel {} out of range", channel_id);
        }
        if packet.data.len() > maximum_packet_size {
            bail!(
                "packet of {} bytes exceeds the maximum packet size",
                packet.data.len()
            );
        }

        let fragment_length = peer.mtu as usize
            - crate::protocol::HEADER_SIZE_WITH_SENT_TIME
            - command_size(OPCODE_SEND_FRAGMENT)
            - checksum_overhead;

        if packet.data.len() > fragment_length {
            let fragment_count = packet.data.len().div_ceil(fragment_length);
            if fragment_count as u32 > MAXIMUM_FRAGMENT_COUNT {
                bail!("packet of {} bytes has too many fragments", packet.data.len());
            }

            let channel = &peer.channels[channel_id as usize];
            let (flags, start_sequence_number, unreliable) = if packet.flags
                & (PACKET_FLAG_RELIABLE | PACKET_FLAG_UNRELIABLE_FRAGMENT)
                == PACKET_FLAG_UNRELIABLE_FRAGMENT
                && channel.outgoing_unreliable_sequence_number < 0xFFFF
            {
                (0, channel.outgoing_unreliable_sequence_number + 1, true)
            } else {
                (
                    COMMAND_FLAG_ACKNOWLEDGE,
                    channel.outgoing_reliable_sequence_number.wrapping_add(1),
                    false,
                )
            };

            let total_length = packet.data.len() as u32;
            let mut fragment_number = 0u32;
            let mut fragment_offset = 0usize;

            while fragment_offset < packet.data.len() {
                let length = fragment_length.min(packet.data.len() - fragment_offset);

                let kind = if unreliable {
                    CommandKind::SendUnreliableFragment {
                        start_sequence_number,
                        data_length: length as u16,
                        fragment_count: fragment_count as u32,
                        fragment_number,
                        total_length,
                        fragment_offset: fragment_offset as u32,
                    }
                } else {
                    CommandKind::SendFragment {
                        start_sequence_number,
                        data_length: length as u16,
                        fragment_count: fragment_count as u32,
                        fragment_number,
                        total_length,
                        fragment_offset: fragment_offset as u32,
                    }
                };

                peer.queue_outgoing_command(
                    Command {
                        flags,
                        channel_id,
                        reliable_sequence_number: 0,
                        kind,
                    },
                    Some(packet.clone()),
                    fragment_offset as u32,
                    length as u16,
                );

                fragment_number += 1;
                fragment_offset += length;
            }

            return Ok(());
        }

        let channel = &peer.channels[channel_id as usize];
        let data_length = packet.data.len() as u16;

        let (flags, kind) = if packet.flags & (PACKET_FLAG_RELIABLE | PACKET_FLAG_UNSEQUENCED)
            == PACKET_FLAG_UNSEQUENCED
        {
            (
                COMMAND_FLAG_UNSEQUENCED,
                CommandKind::SendUnsequenced {
                    unsequenced_group: 0,
                    data_length,
                },
            )
        } else if packet.flags & PACKET_FLAG_RELIABLE != 0
            || channel.outgoing_unreliable_sequence_number >= 0xFFFF
        {
            (
                COMMAND_FLAG_ACKNOWLEDGE,
                CommandKind::SendReliable { data_length },
            )
        } else {
            (
                0,
                CommandKind::SendUnreliable {
                    unreliable_sequence_number: 0,
                    data_length,
                },
            )
        };

        let fragment_length = packet.data.len() as u16;
        peer.queue_outgoing_command(
            Command {
                flags,
                channel_id,
                reliable_sequence_number: 0,
                kind,
            },
            Some(packet),
            0,
            fragment_length,
        );

        Ok(())
    }

    /// Queues a packet for every connected peer.
    pub fn broadcast(&mut self, channel_id: u8, packet: Packet) {
        for index in 0..self.peers.len() {
            if self.peers[index].state != PeerState::Connected {
                continue;
            }
            // per-peer failures (channel range, size) leave the others alone
            let _ = self.send(PeerId(index), channel_id, packet.clone());
        }
    }

    /// Sends a ping on the control channel. Pings are sent automatically at
    ///  the peer's ping interval; this forces one, e.g. for RTT probing.
    pub fn ping(&mut self, peer: PeerId) {
        self.peers[peer.0].ping();
    }

    /// `interval` of 0 restores the default.
    pub fn set_ping_interval(&mut self, peer: PeerId, interval: u32) {
        self.peers[peer.0].ping_interval = if interval != 0 { interval } else { PING_INTERVAL };
    }

    /// Adjusts the retransmission timeout parameters; 0 restores a
    ///  parameter's default.
    pub fn set_timeout(
        &mut self,
        peer: PeerId,
        timeout_limit: u32,
        timeout_minimum: u32,
        timeout_maximum: u32,
    ) {
        let peer = &mut self.peers[peer.0];
        peer.timeout_limit = if timeout_limit != 0 {
            timeout_limit
        } else {
            TIMEOUT_LIMIT
        };
        peer.timeout_minimum = if timeout_minimum != 0 {
            timeout_minimum
        } else {
            TIMEOUT_MINIMUM
        };
        peer.timeout_maximum = if timeout_maximum != 0 {
            timeout_maximum
        } else {
            TIMEOUT_MAXIMUM
        };
    }

    /// Reconfigures the unreliable-traffic throttle and announces the new
    ///  parameters to the remote.
    pub fn throttle_configure(
        &mut self,
        peer: PeerId,
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    ) {
        let peer = &mut self.peers[peer.0];
        peer.packet_throttle_interval = interval;
        peer.packet_throttle_acceleration = acceleration;
        peer.packet_throttle_deceleration = deceleration;

        peer.queue_outgoing_command(
            Command {
                flags: COMMAND_FLAG_ACKNOWLEDGE,
                channel_id: 0xFF,
                reliable_sequence_number: 0,
                kind: CommandKind::ThrottleConfigure {
                    packet_throttle_interval: interval,
                    packet_throttle_acceleration: acceleration,
                    packet_throttle_deceleration: deceleration,
                },
            },
            None,
            0,
            0,
        );
    }

    /// Requests an orderly disconnect: pending queues are dropped, the
    ///  remote acknowledges the disconnect, and a `Disconnect` event is
    ///  surfaced by a later `service` call.
    pub fn disconnect(&mut self, peer: PeerId, data: u32) {
        let index = peer.0;
        let state = self.peers[index].state;

        if matches!(
            state,
            PeerState::Disconnecting
                | PeerState::Disconnected
                | PeerState::AcknowledgingDisconnect
                | PeerState::Zombie
        ) {
            return;
        }

        self.reset_peer_queues(index);

        let connected = matches!(state, PeerState::Connected | PeerState::DisconnectLater);
        let flags = if connected {
            COMMAND_FLAG_ACKNOWLEDGE
        } else {
            COMMAND_FLAG_UNSEQUENCED
        };

        self.peers[index].queue_outgoing_command(
            Command {
                flags,
                channel_id: 0xFF,
                reliable_sequence_number: 0,
                kind: CommandKind::Disconnect { data },
            },
            None,
            0,
            0,
        );

        if connected {
            self.peer_on_disconnect(index);
            self.peers[index].state = PeerState::Disconnecting;
        } else {
            self.flush_internal();
            self.reset_peer_internal(index);
        }
    }

    /// Disconnects once all queued outgoing packets have been delivered.
    pub fn disconnect_later(&mut self, peer: PeerId, data: u32) {
        let index = peer.0;
        let peer_ref = &self.peers[index];

        let connected = matches!(
            peer_ref.state,
            PeerState::Connected | PeerState::DisconnectLater
        );
        let draining = !(peer_ref.outgoing_reliable_commands.is_empty()
            && peer_ref.outgoing_unreliable_commands.is_empty()
            && peer_ref.sent_reliable_commands.is_empty());

        if connected && draining {
            self.peers[index].state = PeerState::DisconnectLater;
            self.peers[index].event_data = data;
        } else {
            self.disconnect(peer, data);
        }
    }

    /// Disconnects immediately: one unsequenced DISCONNECT is flushed out
    ///  and the slot is reset without surfacing an event.
    pub fn disconnect_now(&mut self, peer: PeerId, data: u32) {
        let index = peer.0;
        let state = self.peers[index].state;

        if state == PeerState::Disconnected {
            return;
        }

        if state != PeerState::Zombie && state != PeerState::Disconnecting {
            self.reset_peer_queues(index);

            self.peers[index].queue_outgoing_command(
                Command {
                    flags: COMMAND_FLAG_UNSEQUENCED,
                    channel_id: 0xFF,
                    reliable_sequence_number: 0,
                    kind: CommandKind::Disconnect { data },
                },
                None,
                0,
                0,
            );

            self.flush_internal();
        }

        self.reset_peer_internal(index);
    }

    /// Drops all connection state for the slot without notifying the remote
    ///  (it will time out on its side).
    pub fn reset_peer(&mut self, peer: PeerId) {
        self.reset_peer_internal(peer.0);
    }

    /// Checks for a queued application-visible event without touching the
    ///  socket.
    pub fn check_events(&mut self) -> Option<Event> {
        let mut event = None;
        self.dispatch_incoming_commands(&mut event);
        event
    }

    /// Sends any queued commands without waiting for events or checking
    ///  timeouts.
    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.service_time = self.clock.now();
        let mut event = None;
        self.send_outgoing_commands(&mut event, false, false)?;
        Ok(())
    }

    fn flush_internal(&mut self) {
        if let Err(error) = self.flush() {
            debug!("flush failed: {}", error);
        }
    }

    /// One service tick: shuttles queued commands to and from the socket,
    ///  waits up to `timeout_ms` for socket activity, and returns the first
    ///  application-visible event if one occurred.
    pub fn service(&mut self, timeout_ms: u32) -> anyhow::Result<Option<Event>> {
        let mut event = None;

        if self.dispatch_incoming_commands(&mut event) {
            return Ok(event);
        }

        self.service_time = self.clock.now();
        let deadline = self.service_time.wrapping_add(timeout_ms);

        loop {
            if clock::time_difference(self.service_time, self.bandwidth_throttle_epoch)
                >= BANDWIDTH_THROTTLE_INTERVAL
            {
                self.bandwidth_throttle();
            }

            if self.send_outgoing_commands(&mut event, true, true)? {
                return Ok(event);
            }
            if self.receive_incoming_commands(&mut event)? {
                return Ok(event);
            }
            if self.send_outgoing_commands(&mut event, true, true)? {
                return Ok(event);
            }
            if self.dispatch_incoming_commands(&mut event) {
                return Ok(event);
            }

            if clock::time_greater_equal(self.service_time, deadline) {
                return Ok(None);
            }

            let condition = loop {
                self.service_time = self.clock.now();
                if clock::time_greater_equal(self.service_time, deadline) {
                    return Ok(None);
                }

                let condition = self.socket.wait(
                    WAIT_RECEIVE | WAIT_INTERRUPT,
                    clock::time_difference(deadline, self.service_time),
                )?;
                if condition & WAIT_INTERRUPT != 0 {
                    continue;
                }
                break condition;
            };

            self.service_time = self.clock.now();

            if condition & WAIT_RECEIVE == 0 {
                return Ok(None);
            }
        }
    }

    // ---- dispatch ---------------------------------------------------------

    fn enqueue_dispatch(&mut self, index: usize) {
        self.dispatch_queue.push_back(index);
    }

    fn dispatch_incoming_commands(&mut self, event: &mut Option<Event>) -> bool {
        while let Some(index) = self.dispatch_queue.pop_front() {
            self.peers[index].needs_dispatch = false;

            match self.peers[index].state {
                PeerState::ConnectionPending | PeerState::ConnectionSucceeded => {
                    self.change_state(index, PeerState::Connected);

                    *event = Some(Event::Connect {
                        peer: PeerId(index),
                        data: self.peers[index].event_data,
                    });
                    return true;
                }

                PeerState::Zombie => {
                    self.recalculate_bandwidth_limits = true;

                    *event = Some(Event::Disconnect {
                        peer: PeerId(index),
                        data: self.peers[index].event_data,
                    });

                    self.reset_peer_internal(index);
                    return true;
                }

                PeerState::Connected => {
                    let Some((channel_id, packet)) = self.peers[index].receive() else {
                        continue;
                    };

                    *event = Some(Event::Receive {
                        peer: PeerId(index),
                        channel_id,
                        packet,
                    });

                    if !self.peers[index].dispatched_commands.is_empty() {
                        self.peers[index].needs_dispatch = true;
                        self.dispatch_queue.push_back(index);
                    }
                    return true;
                }

                _ => {}
            }
        }

        false
    }

    // ---- state transitions ------------------------------------------------

    fn peer_on_connect(&mut self, index: usize) {
        let (state, incoming_bandwidth) = {
            let peer = &self.peers[index];
            (peer.state, peer.incoming_bandwidth)
        };
        if state != PeerState::Connected && state != PeerState::DisconnectLater {
            if incoming_bandwidth != 0 {
                self.bandwidth_limited_peers += 1;
            }
            self.connected_peers += 1;
        }
    }

    fn peer_on_disconnect(&mut self, index: usize) {
        let (state, incoming_bandwidth) = {
            let peer = &self.peers[index];
            (peer.state, peer.incoming_bandwidth)
        };
        if state == PeerState::Connected || state == PeerState::DisconnectLater {
            if incoming_bandwidth != 0 {
                self.bandwidth_limited_peers -= 1;
            }
            self.connected_peers -= 1;
        }
    }

    fn change_state(&mut self, index: usize, state: PeerState) {
        if state == PeerState::Connected || state == PeerState::DisconnectLater {
            self.peer_on_connect(index);
        } else {
            self.peer_on_disconnect(index);
        }
        self.peers[index].state = state;
    }

    fn dispatch_state(&mut self, index: usize, state: PeerState) {
        self.change_state(index, state);

        if !self.peers[index].needs_dispatch {
            self.peers[index].needs_dispatch = true;
            self.dispatch_queue.push_back(index);
        }
    }

    fn reset_peer_queues(&mut self, index: usize) {
        if self.peers[index].needs_dispatch {
            self.dispatch_queue.retain(|&queued| queued != index);
        }
        self.peers[index].reset_queues();
    }

    fn reset_peer_internal(&mut self, index: usize) {
        self.peer_on_disconnect(index);
        if self.peers[index].needs_dispatch {
            self.dispatch_queue.retain(|&queued| queued != index);
        }
        let mtu = self.mtu;
        self.peers[index].reset(mtu);
    }

    fn notify_connect(&mut self, index: usize, event: &mut Option<Event>, events_enabled: bool) {
        self.recalculate_bandwidth_limits = true;

        if events_enabled {
            self.change_state(index, PeerState::Connected);

            *event = Some(Event::Connect {
                peer: PeerId(index),
                data: self.peers[index].event_data,
            });
        } else {
            let state = if self.peers[index].state == PeerState::Connecting {
                PeerState::ConnectionSucceeded
            } else {
                PeerState::ConnectionPending
            };
            self.dispatch_state(index, state);
        }
    }

    fn notify_disconnect(&mut self, index: usize, event: &mut Option<Event>, events_enabled: bool) {
        let state = self.peers[index].state;

        if state >= PeerState::ConnectionPending {
            self.recalculate_bandwidth_limits = true;
        }

        if state != PeerState::Connecting && state < PeerState::ConnectionSucceeded {
            self.reset_peer_internal(index);
        } else if events_enabled {
            *event = Some(Event::Disconnect {
                peer: PeerId(index),
                data: 0,
            });
            self.reset_peer_internal(index);
        } else {
            self.peers[index].event_data = 0;
            self.dispatch_state(index, PeerState::Zombie);
        }
    }

    // ---- send pass --------------------------------------------------------

    fn send_outgoing_commands(
        &mut self,
        event: &mut Option<Event>,
        events_enabled: bool,
        check_for_timeouts: bool,
    ) -> anyhow::Result<bool> {
        let mut continue_sending = true;

        while continue_sending {
            continue_sending = false;

            for index in 0..self.peers.len() {
                if matches!(
                    self.peers[index].state,
                    PeerState::Disconnected | PeerState::Zombie
                ) {
                    continue;
                }

                let mut pass = SendPass::new();

                let disconnect_acked = if !self.peers[index].acknowledgements.is_empty() {
                    Self::pack_acknowledgements(&mut self.peers[index], &mut pass)
                } else {
                    false
                };
                if disconnect_acked {
                    self.dispatch_state(index, PeerState::Zombie);
                }

                if check_for_timeouts
                    && !self.peers[index].sent_reliable_commands.is_empty()
                    && clock::time_greater_equal(self.service_time, self.peers[index].next_timeout)
                {
                    let timed_out =
                        Self::check_timeouts(&mut self.peers[index], self.service_time);
                    if timed_out {
                        warn!("peer {} timed out", index);
                        self.notify_disconnect(index, event, events_enabled);
                        if events_enabled && event.is_some() {
                            return Ok(true);
                        }
                        continue;
                    }
                }

                let can_ping = if self.peers[index].outgoing_reliable_commands.is_empty() {
                    true
                } else {
                    Self::pack_reliable_commands(
                        &mut self.peers[index],
                        &mut pass,
                        self.service_time,
                    )
                };

                if can_ping
                    && self.peers[index].sent_reliable_commands.is_empty()
                    && clock::time_difference(
                        self.service_time,
                        self.peers[index].last_receive_time,
                    ) >= self.peers[index].ping_interval
                    && (self.peers[index].mtu as usize).saturating_sub(pass.packet_size)
                        >= command_size(crate::protocol::OPCODE_PING)
                {
                    self.peers[index].ping();
                    Self::pack_reliable_commands(
                        &mut self.peers[index],
                        &mut pass,
                        self.service_time,
                    );
                }

                let should_disconnect = if !self.peers[index].outgoing_unreliable_commands.is_empty()
                {
                    Self::pack_unreliable_commands(&mut self.peers[index], &mut pass)
                } else {
                    false
                };
                if should_disconnect {
                    let data = self.peers[index].event_data;
                    self.disconnect(PeerId(index), data);
                }

                if pass.continue_sending {
                    continue_sending = true;
                }

                if pass.command_count == 0 {
                    continue;
                }

                Self::update_packet_loss(&mut self.peers[index], self.service_time);

                self.send_datagram(index, pass)?;
            }
        }

        Ok(false)
    }

    /// Assembles header + commands into one datagram and hands it to the
    ///  socket, applying compression and checksumming as configured.
    fn send_datagram(&mut self, index: usize, pass: SendPass) -> anyhow::Result<()> {
        let mut header_flags = pass.header_flags;

        // the checksum covers the uncompressed command section, so the
        //  compression decision comes first but the substitution last
        let mut compressed: Option<Vec<u8>> = None;
        if let Some(compressor) = &mut self.compressor {
            let original = &pass.command_buffer[..];
            let mut out = vec![0u8; original.len()];
            let compressed_size = compressor.compress(&[original], &mut out);
            if compressed_size > 0 && compressed_size < original.len() {
                header_flags |= HEADER_FLAG_COMPRESSED;
                out.truncate(compressed_size);
                compressed = Some(out);
                trace!(
                    "peer {}: compressed {} -> {} bytes",
                    index,
                    original.len(),
                    compressed_size
                );
            }
        }

        let (outgoing_peer_id, outgoing_session_id, connect_id, address) = {
            let peer = &self.peers[index];
            (
                peer.outgoing_peer_id,
                peer.outgoing_session_id,
                peer.connect_id,
                peer.address,
            )
        };

        if outgoing_peer_id < MAXIMUM_PEER_ID {
            header_flags |= (outgoing_session_id as u16) << HEADER_SESSION_SHIFT;
        }

        let mut header = BytesMut::with_capacity(8);
        header.put_u16(outgoing_peer_id | header_flags);
        if header_flags & HEADER_FLAG_SENT_TIME != 0 {
            header.put_u16((self.service_time & 0xFFFF) as u16);
        }

        if let Some(checksum) = &self.checksum {
            let preimage = if outgoing_peer_id < MAXIMUM_PEER_ID {
                connect_id
            } else {
                0
            };
            header.put_u32(preimage);
            let value = checksum(&[header.as_ref(), pass.command_buffer.as_ref()]);
            let length = header.len();
            header[length - 4..].copy_from_slice(&value.to_be_bytes());
        }

        self.peers[index].last_send_time = self.service_time;

        let body: &[u8] = compressed.as_deref().unwrap_or(&pass.command_buffer);
        let Some(address) = address else {
            bail!("peer {} has no address", index);
        };

        trace!(
            "sending {} command datagram of {} bytes to {:?}",
            pass.command_count,
            header.len() + body.len(),
            address
        );

        let sent = self.socket.send(address, &[&header, body])?;

        self.peers[index].sent_unreliable_commands.clear();

        self.total_sent_data += sent as u64;
        self.total_sent_packets += 1;

        Ok(())
    }

    /// drains as many pending ACKs into the datagram as fit; returns whether
    ///  an ACK for a DISCONNECT went out (which zombifies the peer)
    fn pack_acknowledgements(peer: &mut Peer, pass: &mut SendPass) -> bool {
        let mut disconnect_acked = false;

        while let Some(acknowledgement) = peer.acknowledgements.front() {
            if pass.command_count >= MAXIMUM_PACKET_COMMANDS
                || (peer.mtu as usize).saturating_sub(pass.packet_size)
                    < command_size(OPCODE_ACKNOWLEDGE)
            {
                pass.continue_sending = true;
                break;
            }

            let acknowledgement = *acknowledgement;
            let _ = peer.acknowledgements.pop_front();

            let command = Command {
                flags: 0,
                channel_id: acknowledgement.channel_id,
                reliable_sequence_number: acknowledgement.reliable_sequence_number,
                kind: CommandKind::Acknowledge {
                    received_reliable_sequence_number: acknowledgement.reliable_sequence_number,
                    received_sent_time: acknowledgement.sent_time,
                },
            };

            command.ser(&mut pass.command_buffer);
            pass.packet_size += command.wire_size();
            pass.command_count += 1;

            if acknowledgement.is_disconnect {
                disconnect_acked = true;
            }
        }

        disconnect_acked
    }

    /// Walks the sent-reliable queue for commands whose retransmission
    ///  timeout elapsed, moving them back to the front of the outgoing
    ///  queue with a doubled timeout. Returns true when the peer itself is
    ///  timed out and must be disconnected.
    fn check_timeouts(peer: &mut Peer, service_time: u32) -> bool {
        let mut index = 0;
        let mut insert_position = 0;

        while index < peer.sent_reliable_commands.len() {
            let command = &peer.sent_reliable_commands[index];

            if clock::time_difference(service_time, command.sent_time)
                < command.round_trip_timeout
            {
                index += 1;
                continue;
            }

            if peer.earliest_timeout == 0
                || clock::time_less(command.sent_time, peer.earliest_timeout)
            {
                peer.earliest_timeout = command.sent_time;
            }

            if peer.earliest_timeout != 0
                && (clock::time_difference(service_time, peer.earliest_timeout)
                    >= peer.timeout_maximum
                    || (command.round_trip_timeout >= command.round_trip_timeout_limit
                        && clock::time_difference(service_time, peer.earliest_timeout)
                            >= peer.timeout_minimum))
            {
                return true;
            }

            let mut command = peer.sent_reliable_commands.remove(index).unwrap();

            if command.packet.is_some() {
                peer.reliable_data_in_transit = peer
                    .reliable_data_in_transit
                    .saturating_sub(command.fragment_length as u32);
            }

            peer.packets_lost += 1;
            command.round_trip_timeout *= 2;

            peer.outgoing_reliable_commands
                .insert(insert_position, command);
            insert_position += 1;

            if index == 0 {
                if let Some(front) = peer.sent_reliable_commands.front() {
                    peer.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
                }
            }
        }

        false
    }

    /// Packs outgoing reliable commands subject to the per-channel window
    ///  occupancy check, the byte-budget window, and the datagram limits.
    ///  Returns whether the datagram has room for a ping (nothing reliable
    ///  was pending).
    fn pack_reliable_commands(peer: &mut Peer, pass: &mut SendPass, service_time: u32) -> bool {
        let mut can_ping = true;
        let mut window_wrap = false;
        let mut window_exceeded = false;

        let mut index = 0;
        while index < peer.outgoing_reliable_commands.len() {
            let command = &peer.outgoing_reliable_commands[index];
            let channel_id = command.command.channel_id as usize;
            let reliable_window = command.reliable_sequence_number / RELIABLE_WINDOW_SIZE;

            if channel_id < peer.channels.len() {
                let channel = &peer.channels[channel_id];

                if !window_wrap
                    && command.send_attempts < 1
                    && command.reliable_sequence_number % RELIABLE_WINDOW_SIZE == 0
                {
                    let previous_window =
                        ((reliable_window + RELIABLE_WINDOWS - 1) % RELIABLE_WINDOWS) as usize;
                    let free_mask = (1u32 << FREE_RELIABLE_WINDOWS) - 1;
                    let wrap_mask = (free_mask << reliable_window)
                        | (free_mask >> (RELIABLE_WINDOWS - reliable_window));

                    if channel.reliable_windows[previous_window] >= RELIABLE_WINDOW_SIZE
                        || channel.used_reliable_windows as u32 & wrap_mask != 0
                    {
                        window_wrap = true;
                    }
                }
                if window_wrap {
                    index += 1;
                    continue;
                }
            }

            if command.packet.is_some() {
                if !window_exceeded {
                    let window_size =
                        (peer.packet_throttle * peer.window_size) / PACKET_THROTTLE_SCALE;

                    if peer.reliable_data_in_transit + command.fragment_length as u32
                        > window_size.max(peer.mtu)
                    {
                        window_exceeded = true;
                    }
                }
                if window_exceeded {
                    index += 1;
                    continue;
                }
            }

            can_ping = false;

            let wire_size = command.command.wire_size();
            let budget = (peer.mtu as usize).saturating_sub(pass.packet_size);
            if pass.command_count >= MAXIMUM_PACKET_COMMANDS
                || budget < wire_size
                || (command.packet.is_some()
                    && budget < wire_size + command.fragment_length as usize)
            {
                pass.continue_sending = true;
                break;
            }

            let mut command = peer.outgoing_reliable_commands.remove(index).unwrap();

            if (command.command.channel_id as usize) < peer.channels.len()
                && command.send_attempts < 1
            {
                let channel = &mut peer.channels[command.command.channel_id as usize];
                channel.used_reliable_windows |= 1 << reliable_window;
                channel.reliable_windows[reliable_window as usize] += 1;
            }

            command.send_attempts += 1;

            if command.round_trip_timeout == 0 {
                command.round_trip_timeout =
                    peer.round_trip_time + 4 * peer.round_trip_time_variance;
                command.round_trip_timeout_limit = peer.timeout_limit * command.round_trip_timeout;
            }

            if peer.sent_reliable_commands.is_empty() {
                peer.next_timeout = service_time.wrapping_add(command.round_trip_timeout);
            }

            command.sent_time = service_time;

            pass.header_flags |= HEADER_FLAG_SENT_TIME;
            command.command.ser(&mut pass.command_buffer);
            pass.packet_size += wire_size;

            if let Some(packet) = &command.packet {
                let offset = command.fragment_offset as usize;
                let length = command.fragment_length as usize;
                pass.command_buffer
                    .put_slice(&packet.data[offset..offset + length]);
                pass.packet_size += length;

                peer.reliable_data_in_transit += command.fragment_length as u32;
            }

            pass.command_count += 1;
            peer.packets_sent += 1;

            peer.sent_reliable_commands.push_back(command);
        }

        can_ping
    }

    /// Packs outgoing unreliable commands, applying the throttle-counter
    ///  drop to the first fragment of each message (and its followers).
    ///  Returns whether a deferred disconnect should fire because all
    ///  queues drained.
    fn pack_unreliable_commands(peer: &mut Peer, pass: &mut SendPass) -> bool {
        let mut index = 0;
        while index < peer.outgoing_unreliable_commands.len() {
            let command = &peer.outgoing_unreliable_commands[index];
            let wire_size = command.command.wire_size();
            let budget = (peer.mtu as usize).saturating_sub(pass.packet_size);

            if pass.command_count >= MAXIMUM_PACKET_COMMANDS
                || budget < wire_size
                || (command.packet.is_some()
                    && budget < wire_size + command.fragment_length as usize)
            {
                pass.continue_sending = true;
                break;
            }

            if command.packet.is_some() && command.fragment_offset == 0 {
                peer.packet_throttle_counter += PACKET_THROTTLE_COUNTER;
                peer.packet_throttle_counter %= PACKET_THROTTLE_SCALE;

                if peer.packet_throttle_counter > peer.packet_throttle {
                    let reliable_sequence_number = command.reliable_sequence_number;
                    let unreliable_sequence_number = command.unreliable_sequence_number;

                    // drop the whole message: this command and any
                    //  following commands with the same sequence pair
                    loop {
                        let _ = peer.outgoing_unreliable_commands.remove(index);

                        let Some(next) = peer.outgoing_unreliable_commands.get(index) else {
                            break;
                        };
                        if next.reliable_sequence_number != reliable_sequence_number
                            || next.unreliable_sequence_number != unreliable_sequence_number
                        {
                            break;
                        }
                    }

                    continue;
                }
            }

            let command = peer.outgoing_unreliable_commands.remove(index).unwrap();

            command.command.ser(&mut pass.command_buffer);
            pass.packet_size += wire_size;
            pass.command_count += 1;

            if let Some(packet) = &command.packet {
                let offset = command.fragment_offset as usize;
                let length = command.fragment_length as usize;
                pass.command_buffer
                    .put_slice(&packet.data[offset..offset + length]);
                pass.packet_size += length;

                peer.sent_unreliable_commands.push_back(command);
            }
        }

        peer.state == PeerState::DisconnectLater
            && peer.outgoing_reliable_commands.is_empty()
            && peer.outgoing_unreliable_commands.is_empty()
            && peer.sent_reliable_commands.is_empty()
    }

    fn update_packet_loss(peer: &mut Peer, service_time: u32) {
        if peer.packet_loss_epoch == 0 {
            peer.packet_loss_epoch = service_time;
            return;
        }

        if clock::time_difference(service_time, peer.packet_loss_epoch) >= PACKET_LOSS_INTERVAL
            && peer.packets_sent > 0
        {
            let packet_loss =
                (peer.packets_lost as u64 * PACKET_LOSS_SCALE as u64 / peer.packets_sent as u64)
                    as u32;

            peer.packet_loss_variance -= peer.packet_loss_variance / 4;

            if packet_loss >= peer.packet_loss {
                peer.packet_loss += (packet_loss - peer.packet_loss) / 8;
                peer.packet_loss_variance += (packet_loss - peer.packet_loss) / 4;
            } else {
                peer.packet_loss -= (peer.packet_loss - packet_loss) / 8;
                peer.packet_loss_variance += (peer.packet_loss - packet_loss) / 4;
            }

            peer.packet_loss_epoch = service_time;
            peer.packets_sent = 0;
            peer.packets_lost = 0;
        }
    }
}

impl Host {
    // ---- receive pass -----------------------------------------------------

    fn receive_incoming_commands(&mut self, event: &mut Option<Event>) -> anyhow::Result<bool> {
        let mut buffer = [0u8; MAXIMUM_MTU as usize];

        for _ in 0..RECEIVE_BURST_LIMIT {
            let Some((address, length)) = self.socket.receive(&mut buffer)? else {
                return Ok(false);
            };

            self.total_received_data += length as u64;
            self.total_received_packets += 1;

            if let Some(intercept) = &mut self.intercept {
                match intercept(address, &buffer[..length]) {
                    InterceptResult::Consume(intercepted) => {
                        if let Some(intercepted) = intercepted {
                            *event = Some(intercepted);
                            return Ok(true);
                        }
                        continue;
                    }
                    InterceptResult::Abort => bail!("datagram intercept aborted"),
                    InterceptResult::Pass => {}
                }
            }

            if self.handle_incoming_datagram(address, &buffer[..length], event)? {
                return Ok(true);
            }
        }

        // burst limit reached; the service loop sends before draining more
        Ok(false)
    }

    fn handle_incoming_datagram(
        &mut self,
        address: SocketAddr,
        data: &[u8],
        event: &mut Option<Event>,
    ) -> anyhow::Result<bool> {
        if data.len() < crate::protocol::HEADER_SIZE_MINIMUM {
            return Ok(false);
        }

        let header = unpack_header_word(u16::from_be_bytes([data[0], data[1]]));

        let has_sent_time = header.flags & HEADER_FLAG_SENT_TIME != 0;
        let mut header_size = if has_sent_time {
            crate::protocol::HEADER_SIZE_WITH_SENT_TIME
        } else {
            crate::protocol::HEADER_SIZE_MINIMUM
        };
        let sent_time = if has_sent_time {
            if data.len() < crate::protocol::HEADER_SIZE_WITH_SENT_TIME {
                return Ok(false);
            }
            u16::from_be_bytes([data[2], data[3]])
        } else {
            0
        };

        let checksum_offset = header_size;
        if self.checksum.is_some() {
            header_size += 4;
        }
        if data.len() < header_size {
            return Ok(false);
        }

        let peer_index = if header.peer_id == MAXIMUM_PEER_ID {
            None
        } else {
            if header.peer_id as usize >= self.peers.len() {
                return Ok(false);
            }
            let peer = &self.peers[header.peer_id as usize];

            if peer.state == PeerState::Disconnected
                || peer.state == PeerState::Zombie
                || peer.address != Some(address)
                || (peer.outgoing_peer_id < MAXIMUM_PEER_ID
                    && header.session_id != peer.incoming_session_id)
            {
                return Ok(false);
            }
            Some(header.peer_id as usize)
        };

        let mut decompressed: Vec<u8>;
        let mut datagram = data;

        if header.flags & HEADER_FLAG_COMPRESSED != 0 {
            let Some(compressor) = &mut self.compressor else {
                return Ok(false);
            };

            let mut out = vec![0u8; MAXIMUM_MTU as usize - header_size];
            let original_size = compressor.decompress(&data[header_size..], &mut out);
            if original_size == 0 || original_size > out.len() {
                debug!("dropping datagram from {:?}: decompression failed", address);
                return Ok(false);
            }

            decompressed = Vec::with_capacity(header_size + original_size);
            decompressed.extend_from_slice(&data[..header_size]);
            decompressed.extend_from_slice(&out[..original_size]);
            datagram = &decompressed;
        }

        if let Some(checksum) = &self.checksum {
            let stored = u32::from_be_bytes(
                datagram[checksum_offset..checksum_offset + 4]
                    .try_into()
                    .unwrap(),
            );
            let preimage = peer_index
                .map(|index| self.peers[index].connect_id)
                .unwrap_or(0);

            let mut head = datagram[..header_size].to_vec();
            head[checksum_offset..checksum_offset + 4].copy_from_slice(&preimage.to_be_bytes());

            if checksum(&[head.as_slice(), &datagram[header_size..]]) != stored {
                debug!("dropping datagram from {:?}: checksum mismatch", address);
                return Ok(false);
            }
        }

        if let Some(index) = peer_index {
            let peer = &mut self.peers[index];
            peer.address = Some(address);
            peer.incoming_data_total += datagram.len() as u32;
        }

        let mut current_peer = peer_index;
        let mut current = &datagram[header_size..];

        while !current.is_empty() {
            let Ok(command) = Command::deser(&mut current) else {
                // truncated or unknown command: stop parsing this datagram
                break;
            };
            let opcode = command.kind.opcode();

            if current_peer.is_none() && opcode != OPCODE_CONNECT {
                break;
            }

            let handled: anyhow::Result<()> = match opcode {
                OPCODE_ACKNOWLEDGE => {
                    self.handle_acknowledge(current_peer.unwrap(), &command, event)
                }
                OPCODE_CONNECT => {
                    if current_peer.is_some() {
                        break;
                    }
                    match self.handle_connect(address, &command) {
                        Some(index) => {
                            current_peer = Some(index);
                            Ok(())
                        }
                        None => break,
                    }
                }
                OPCODE_VERIFY_CONNECT => {
                    self.handle_verify_connect(current_peer.unwrap(), &command, event)
                }
                OPCODE_DISCONNECT => self.handle_disconnect(current_peer.unwrap(), &command),
                crate::protocol::OPCODE_PING => self.handle_ping(current_peer.unwrap()),
                crate::protocol::OPCODE_SEND_RELIABLE => {
                    self.handle_send_reliable(current_peer.unwrap(), &command, &mut current)
                }
                crate::protocol::OPCODE_SEND_UNRELIABLE => {
                    self.handle_send_unreliable(current_peer.unwrap(), &command, &mut current)
                }
                crate::protocol::OPCODE_SEND_UNSEQUENCED => {
                    self.handle_send_unsequenced(current_peer.unwrap(), &command, &mut current)
                }
                OPCODE_SEND_FRAGMENT => {
                    self.handle_send_fragment(current_peer.unwrap(), &command, &mut current)
                }
                crate::protocol::OPCODE_BANDWIDTH_LIMIT => {
                    self.handle_bandwidth_limit(current_peer.unwrap(), &command)
                }
                crate::protocol::OPCODE_THROTTLE_CONFIGURE => {
                    self.handle_throttle_configure(current_peer.unwrap(), &command)
                }
                OPCODE_SEND_UNRELIABLE_FRAGMENT => self.handle_send_unreliable_fragment(
                    current_peer.unwrap(),
                    &command,
                    &mut current,
                ),
                _ => break,
            };

            if let Err(error) = handled {
                debug!(
                    "aborting datagram from {:?} at opcode {}: {}",
                    address, opcode, error
                );
                break;
            }

            let Some(index) = current_peer else { continue };
            if command.flags & COMMAND_FLAG_ACKNOWLEDGE == 0 {
                continue;
            }

            if !has_sent_time {
                break;
            }

            match self.peers[index].state {
                PeerState::Disconnecting
                | PeerState::AcknowledgingConnect
                | PeerState::Disconnected
                | PeerState::Zombie => {}

                PeerState::AcknowledgingDisconnect => {
                    if opcode == OPCODE_DISCONNECT {
                        self.peers[index].queue_acknowledgement(
                            command.command_byte(),
                            command.channel_id,
                            command.reliable_sequence_number,
                            sent_time,
                        );
                    }
                }

                _ => self.peers[index].queue_acknowledgement(
                    command.command_byte(),
                    command.channel_id,
                    command.reliable_sequence_number,
                    sent_time,
                ),
            }
        }

        Ok(event.is_some())
    }

    fn handle_acknowledge(
        &mut self,
        index: usize,
        command: &Command,
        event: &mut Option<Event>,
    ) -> anyhow::Result<()> {
        let service_time = self.service_time;
        let peer = &mut self.peers[index];

        if peer.state == PeerState::Disconnected || peer.state == PeerState::Zombie {
            return Ok(());
        }

        let CommandKind::Acknowledge {
            received_reliable_sequence_number,
            received_sent_time,
        } = command.kind
        else {
            bail!("malformed acknowledge command");
        };

        // reconstruct the full 32-bit sent time from the 16-bit echo
        let mut received_sent_time = received_sent_time as u32 | (service_time & 0xFFFF_0000);
        if (received_sent_time & 0x8000) > (service_time & 0x8000) {
            received_sent_time = received_sent_time.wrapping_sub(0x10000);
        }

        if clock::time_less(service_time, received_sent_time) {
            return Ok(());
        }

        peer.last_receive_time = service_time;
        peer.earliest_timeout = 0;

        let round_trip_time = clock::time_difference(service_time, received_sent_time);

        peer.throttle(round_trip_time);

        peer.round_trip_time_variance -= peer.round_trip_time_variance / 4;

        if round_trip_time >= peer.round_trip_time {
            peer.round_trip_time += (round_trip_time - peer.round_trip_time) / 8;
            peer.round_trip_time_variance += (round_trip_time - peer.round_trip_time) / 4;
        } else {
            peer.round_trip_time -= (peer.round_trip_time - round_trip_time) / 8;
            peer.round_trip_time_variance += (peer.round_trip_time - round_trip_time) / 4;
        }

        if peer.round_trip_time < peer.lowest_round_trip_time {
            peer.lowest_round_trip_time = peer.round_trip_time;
        }
        if peer.round_trip_time_variance > peer.highest_round_trip_time_variance {
            peer.highest_round_trip_time_variance = peer.round_trip_time_variance;
        }

        if peer.packet_throttle_epoch == 0
            || clock::time_difference(service_time, peer.packet_throttle_epoch)
                >= peer.packet_throttle_interval
        {
            peer.last_round_trip_time = peer.lowest_round_trip_time;
            peer.last_round_trip_time_variance = peer.highest_round_trip_time_variance;
            peer.lowest_round_trip_time = peer.round_trip_time;
            peer.highest_round_trip_time_variance = peer.round_trip_time_variance;
            peer.packet_throttle_epoch = service_time;
        }

        let acknowledged_opcode =
            peer.remove_sent_reliable_command(received_reliable_sequence_number, command.channel_id);

        match peer.state {
            PeerState::AcknowledgingConnect => {
                if acknowledged_opcode != Some(OPCODE_VERIFY_CONNECT) {
                    bail!("connect handshake acknowledged the wrong command");
                }
                self.notify_connect(index, event, true);
            }

            PeerState::Disconnecting => {
                if acknowledged_opcode != Some(OPCODE_DISCONNECT) {
                    bail!("disconnect handshake acknowledged the wrong command");
                }
                self.notify_disconnect(index, event, true);
            }

            PeerState::DisconnectLater => {
                if peer.outgoing_reliable_commands.is_empty()
                    && peer.outgoing_unreliable_commands.is_empty()
                    && peer.sent_reliable_commands.is_empty()
                {
                    let data = peer.event_data;
                    self.disconnect(PeerId(index), data);
                }
            }

            _ => {}
        }

        Ok(())
    }

    fn handle_connect(&mut self, address: SocketAddr, command: &Command) -> Option<usize> {
        let CommandKind::Connect {
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
            outgoing_peer_id,
        } = command.kind
        else {
            return None;
        };

        let channel_count = channel_count as usize;
        if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&channel_count) {
            return None;
        }

        let mut slot = None;
        let mut duplicate_peers = 0;
        for (index, peer) in self.peers.iter().enumerate() {
            if peer.state == PeerState::Disconnected {
                if slot.is_none() {
                    slot = Some(index);
                }
            } else if peer.state != PeerState::Connecting
                && peer.address.map(|known| known.ip()) == Some(address.ip())
            {
                if peer.address == Some(address) && peer.connect_id == connect_id {
                    return None;
                }
                duplicate_peers += 1;
            }
        }

        let index = slot?;
        if duplicate_peers >= self.duplicate_peers {
            debug!("refusing connect from {:?}: duplicate peer cap", address);
            return None;
        }

        let channel_count = channel_count.min(self.channel_limit);
        let host_incoming_bandwidth = self.incoming_bandwidth;
        let host_outgoing_bandwidth = self.outgoing_bandwidth;

        let peer = &mut self.peers[index];
        peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
        peer.state = PeerState::AcknowledgingConnect;
        peer.connect_id = connect_id;
        peer.address = Some(address);
        peer.outgoing_peer_id = outgoing_peer_id;
        peer.incoming_bandwidth = incoming_bandwidth;
        peer.outgoing_bandwidth = outgoing_bandwidth;
        peer.packet_throttle_interval = packet_throttle_interval;
        peer.packet_throttle_acceleration = packet_throttle_acceleration;
        peer.packet_throttle_deceleration = packet_throttle_deceleration;
        peer.event_data = data;

        let session_shift = HEADER_SESSION_SHIFT;
        let session_mask = (crate::protocol::HEADER_SESSION_MASK >> session_shift) as u8;

        let mut new_incoming_session = if incoming_session_id == 0xFF {
            peer.outgoing_session_id
        } else {
            incoming_session_id
        };
        new_incoming_session = new_incoming_session.wrapping_add(1) & session_mask;
        if new_incoming_session == peer.outgoing_session_id {
            new_incoming_session = new_incoming_session.wrapping_add(1) & session_mask;
        }
        peer.outgoing_session_id = new_incoming_session;

        let mut new_outgoing_session = if outgoing_session_id == 0xFF {
            peer.incoming_session_id
        } else {
            outgoing_session_id
        };
        new_outgoing_session = new_outgoing_session.wrapping_add(1) & session_mask;
        if new_outgoing_session == peer.incoming_session_id {
            new_outgoing_session = new_outgoing_session.wrapping_add(1) & session_mask;
        }
        peer.incoming_session_id = new_outgoing_session;

        peer.mtu = mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);

        peer.window_size = if host_outgoing_bandwidth == 0 && peer.incoming_bandwidth == 0 {
            MAXIMUM_WINDOW_SIZE
        } else if host_outgoing_bandwidth == 0 || peer.incoming_bandwidth == 0 {
            (host_outgoing_bandwidth.max(peer.incoming_bandwidth) / WINDOW_SIZE_SCALE)
                * MINIMUM_WINDOW_SIZE
        } else {
            (host_outgoing_bandwidth.min(peer.incoming_bandwidth) / WINDOW_SIZE_SCALE)
                * MINIMUM_WINDOW_SIZE
        };
        peer.window_size = peer.window_size.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);

        let mut verify_window_size = if host_incoming_bandwidth == 0 {
            MAXIMUM_WINDOW_SIZE
        } else {
            (host_incoming_bandwidth / WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE
        };
        if verify_window_size > window_size {
            verify_window_size = window_size;
        }
        verify_window_size = verify_window_size.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);

        let verify = Command {
            flags: COMMAND_FLAG_ACKNOWLEDGE,
            channel_id: 0xFF,
            reliable_sequence_number: 0,
            kind: CommandKind::VerifyConnect {
                outgoing_peer_id: peer.incoming_peer_id,
                incoming_session_id: new_incoming_session,
                outgoing_session_id: new_outgoing_session,
                mtu: peer.mtu,
                window_size: verify_window_size,
                channel_count: channel_count as u32,
                incoming_bandwidth: host_incoming_bandwidth,
                outgoing_bandwidth: host_outgoing_bandwidth,
                packet_throttle_interval: peer.packet_throttle_interval,
                packet_throttle_acceleration: peer.packet_throttle_acceleration,
                packet_throttle_deceleration: peer.packet_throttle_deceleration,
                connect_id,
            },
        };

        peer.queue_outgoing_command(verify, None, 0, 0);

        debug!("accepted connect from {:?} into slot {}", address, index);
        Some(index)
    }

    fn handle_verify_connect(
        &mut self,
        index: usize,
        command: &Command,
        event: &mut Option<Event>,
    ) -> anyhow::Result<()> {
        if self.peers[index].state != PeerState::Connecting {
            return Ok(());
        }

        let CommandKind::VerifyConnect {
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
        } = command.kind
        else {
            bail!("malformed verify-connect command");
        };

        let channel_count = channel_count as usize;
        let peer = &mut self.peers[index];

        if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&channel_count)
            || packet_throttle_interval != peer.packet_throttle_interval
            || packet_throttle_acceleration != peer.packet_throttle_acceleration
            || packet_throttle_deceleration != peer.packet_throttle_deceleration
            || connect_id != peer.connect_id
        {
            peer.event_data = 0;
            self.dispatch_state(index, PeerState::Zombie);
            bail!("verify-connect does not match the connect parameters");
        }

        let _ = peer.remove_sent_reliable_command(1, 0xFF);

        if channel_count < peer.channels.len() {
            peer.channels.truncate(channel_count);
        }

        peer.outgoing_peer_id = outgoing_peer_id;
        peer.incoming_session_id = incoming_session_id;
        peer.outgoing_session_id = outgoing_session_id;

        let mtu = mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);
        if mtu < peer.mtu {
            peer.mtu = mtu;
        }

        let window_size = window_size.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);
        if window_size < peer.window_size {
            peer.window_size = window_size;
        }

        peer.incoming_bandwidth = incoming_bandwidth;
        peer.outgoing_bandwidth = outgoing_bandwidth;

        self.notify_connect(index, event, true);
        Ok(())
    }

    fn handle_disconnect(&mut self, index: usize, command: &Command) -> anyhow::Result<()> {
        let CommandKind::Disconnect { data } = command.kind else {
            bail!("malformed disconnect command");
        };

        let state = self.peers[index].state;
        if matches!(
            state,
            PeerState::Disconnected | PeerState::Zombie | PeerState::AcknowledgingDisconnect
        ) {
            return Ok(());
        }

        self.reset_peer_queues(index);

        match state {
            PeerState::ConnectionSucceeded | PeerState::Disconnecting | PeerState::Connecting => {
                self.dispatch_state(index, PeerState::Zombie);
            }
            PeerState::Connected | PeerState::DisconnectLater => {
                if command.flags & COMMAND_FLAG_ACKNOWLEDGE != 0 {
                    self.change_state(index, PeerState::AcknowledgingDisconnect);
                } else {
                    self.dispatch_state(index, PeerState::Zombie);
                }
            }
            _ => {
                if state == PeerState::ConnectionPending {
                    self.recalculate_bandwidth_limits = true;
                }
                self.reset_peer_internal(index);
            }
        }

        if self.peers[index].state != PeerState::Disconnected {
            self.peers[index].event_data = data;
        }

        Ok(())
    }

    fn handle_ping(&mut self, index: usize) -> anyhow::Result<()> {
        if !matches!(
            self.peers[index].state,
            PeerState::Connected | PeerState::DisconnectLater
        ) {
            bail!("ping in invalid state");
        }
        Ok(())
    }

    fn handle_bandwidth_limit(&mut self, index: usize, command: &Command) -> anyhow::Result<()> {
        let CommandKind::BandwidthLimit {
            incoming_bandwidth,
            outgoing_bandwidth,
        } = command.kind
        else {
            bail!("malformed bandwidth-limit command");
        };

        if !matches!(
            self.peers[index].state,
            PeerState::Connected | PeerState::DisconnectLater
        ) {
            bail!("bandwidth limit in invalid state");
        }

        let host_outgoing_bandwidth = self.outgoing_bandwidth;
        let peer = &mut self.peers[index];

        if peer.incoming_bandwidth != 0 {
            self.bandwidth_limited_peers -= 1;
        }

        peer.incoming_bandwidth = incoming_bandwidth;
        peer.outgoing_bandwidth = outgoing_bandwidth;

        if peer.incoming_bandwidth != 0 {
            self.bandwidth_limited_peers += 1;
        }

        peer.window_size = if peer.incoming_bandwidth == 0 && host_outgoing_bandwidth == 0 {
            MAXIMUM_WINDOW_SIZE
        } else if peer.incoming_bandwidth == 0 || host_outgoing_bandwidth == 0 {
            (peer.incoming_bandwidth.max(host_outgoing_bandwidth) / WINDOW_SIZE_SCALE)
                * MINIMUM_WINDOW_SIZE
        } else {
            (peer.incoming_bandwidth.min(host_outgoing_bandwidth) / WINDOW_SIZE_SCALE)
                * MINIMUM_WINDOW_SIZE
        };
        peer.window_size = peer.window_size.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);

        Ok(())
    }

    fn handle_throttle_configure(&mut self, index: usize, command: &Command) -> anyhow::Result<()> {
        let CommandKind::ThrottleConfigure {
            packet_throttle_interval,
            packet_throttle_acceleration,
            packet_throttle_deceleration,
        } = command.kind
        else {
            bail!("malformed throttle-configure command");
        };

        let peer = &mut self.peers[index];
        if !matches!(
            peer.state,
            PeerState::Connected | PeerState::DisconnectLater
        ) {
            bail!("throttle configure in invalid state");
        }

        peer.packet_throttle_interval = packet_throttle_interval;
        peer.packet_throttle_acceleration = packet_throttle_acceleration;
        peer.packet_throttle_deceleration = packet_throttle_deceleration;

        Ok(())
    }

    /// takes the command's payload off the front of the datagram remainder
    fn take_payload<'a>(
        &self,
        peer_index: usize,
        current: &mut &'a [u8],
        data_length: usize,
    ) -> anyhow::Result<&'a [u8]> {
        if data_length > self.maximum_packet_size || data_length > current.len() {
            bail!("payload of {} bytes out of bounds", data_length);
        }
        if !matches!(
            self.peers[peer_index].state,
            PeerState::Connected | PeerState::DisconnectLater
        ) {
            bail!("payload in invalid state");
        }

        let (payload, rest) = current.split_at(data_length);
        *current = rest;
        Ok(payload)
    }

    fn handle_send_reliable(
        &mut self,
        index: usize,
        command: &Command,
        current: &mut &[u8],
    ) -> anyhow::Result<()> {
        let CommandKind::SendReliable { data_length } = command.kind else {
            bail!("malformed reliable send command");
        };
        if command.channel_id as usize >= self.peers[index].channels.len() {
            bail!("channel {} out of range", command.channel_id);
        }

        let payload = self.take_payload(index, current, data_length as usize)?;
        let maximum_waiting_data = self.maximum_waiting_data;

        let peer = &mut self.peers[index];
        let admission = peer.queue_incoming_command(
            command,
            Some(payload),
            data_length as usize,
            PACKET_FLAG_RELIABLE,
            0,
            maximum_waiting_data,
        )?;

        if matches!(admission, Admission::Accepted { .. })
            && peer.dispatch_incoming_reliable_commands(command.channel_id)
        {
            self.enqueue_dispatch(index);
        }

        Ok(())
    }

    fn handle_send_unreliable(
        &mut self,
        index: usize,
        command: &Command,
        current: &mut &[u8],
    ) -> anyhow::Result<()> {
        let CommandKind::SendUnreliable { data_length, .. } = command.kind else {
            bail!("malformed unreliable send command");
        };
        if command.channel_id as usize >= self.peers[index].channels.len() {
            bail!("channel {} out of range", command.channel_id);
        }

        let payload = self.take_payload(index, current, data_length as usize)?;
        let maximum_waiting_data = self.maximum_waiting_data;

        let peer = &mut self.peers[index];
        let admission = peer.queue_incoming_command(
            command,
            Some(payload),
            data_length as usize,
            0,
            0,
            maximum_waiting_data,
        )?;

        if matches!(admission, Admission::Accepted { .. })
            && peer.dispatch_incoming_unreliable_commands(command.channel_id)
        {
            self.enqueue_dispatch(index);
        }

        Ok(())
    }

    fn handle_send_unsequenced(
        &mut self,
        index: usize,
        command: &Command,
        current: &mut &[u8],
    ) -> anyhow::Result<()> {
        let CommandKind::SendUnsequenced {
            unsequenced_group,
            data_length,
        } = command.kind
        else {
            bail!("malformed unsequenced send command");
        };
        if command.channel_id as usize >= self.peers[index].channels.len() {
            bail!("channel {} out of range", command.channel_id);
        }

        let payload = self.take_payload(index, current, data_length as usize)?;
        let maximum_waiting_data = self.maximum_waiting_data;

        let peer = &mut self.peers[index];

        let window_index = unsequenced_group as u32 % UNSEQUENCED_WINDOW_SIZE;
        let mut group = unsequenced_group as u32;
        if group < peer.incoming_unsequenced_group as u32 {
            group += 0x10000;
        }

        if group
            >= peer.incoming_unsequenced_group as u32
                + FREE_UNSEQUENCED_WINDOWS * UNSEQUENCED_WINDOW_SIZE
        {
            return Ok(());
        }

        let group = group & 0xFFFF;

        if group - window_index != peer.incoming_unsequenced_group as u32 {
            peer.incoming_unsequenced_group = (group - window_index) as u16;
            peer.unsequenced_window = [0; (UNSEQUENCED_WINDOW_SIZE / 32) as usize];
        } else if peer.unsequenced_window[(window_index / 32) as usize] & (1 << (window_index % 32))
            != 0
        {
            return Ok(());
        }

        let admission = peer.queue_incoming_command(
            command,
            Some(payload),
            data_length as usize,
            PACKET_FLAG_UNSEQUENCED,
            0,
            maximum_waiting_data,
        )?;

        peer.unsequenced_window[(window_index / 32) as usize] |= 1 << (window_index % 32);

        if matches!(admission, Admission::Accepted { .. })
            && peer.dispatch_incoming_unreliable_commands(command.channel_id)
        {
            self.enqueue_dispatch(index);
        }

        Ok(())
    }

    fn handle_send_fragment(
        &mut self,
        index: usize,
        command: &Command,
        current: &mut &[u8],
    ) -> anyhow::Result<()> {
        let CommandKind::SendFragment {
            start_sequence_number,
            data_length,
            fragment_count,
            fragment_number,
            total_length,
            fragment_offset,
        } = command.kind
        else {
            bail!("malformed fragment command");
        };
        if command.channel_id as usize >= self.peers[index].channels.len() {
            bail!("channel {} out of range", command.channel_id);
        }

        let fragment_data = self.take_payload(index, current, data_length as usize)?;
        let maximum_packet_size = self.maximum_packet_size;
        let maximum_waiting_data = self.maximum_waiting_data;

        let peer = &mut self.peers[index];
        let channel = &peer.channels[command.channel_id as usize];

        let mut start_window = start_sequence_number / RELIABLE_WINDOW_SIZE;
        let current_window = channel.incoming_reliable_sequence_number / RELIABLE_WINDOW_SIZE;
        if start_sequence_number < channel.incoming_reliable_sequence_number {
            start_window += RELIABLE_WINDOWS;
        }
        if start_window < current_window
            || start_window >= current_window + FREE_RELIABLE_WINDOWS - 1
        {
            return Ok(());
        }

        if fragment_count > MAXIMUM_FRAGMENT_COUNT
            || fragment_number >= fragment_count
            || total_length as usize > maximum_packet_size
            || fragment_offset >= total_length
            || data_length as u32 > total_length - fragment_offset
        {
            bail!("fragment metadata out of bounds");
        }

        let mut start_command = None;
        for queued in (0..channel.incoming_reliable_commands.len()).rev() {
            let incoming = &channel.incoming_reliable_commands[queued];

            if start_sequence_number >= channel.incoming_reliable_sequence_number {
                if incoming.reliable_sequence_number < channel.incoming_reliable_sequence_number {
                    continue;
                }
            } else if incoming.reliable_sequence_number
                >= channel.incoming_reliable_sequence_number
            {
                break;
            }

            if incoming.reliable_sequence_number <= start_sequence_number {
                if incoming.reliable_sequence_number < start_sequence_number {
                    break;
                }

                if incoming.command_byte & COMMAND_MASK != OPCODE_SEND_FRAGMENT
                    || total_length as usize != incoming.data.len()
                    || fragment_count != incoming.fragment_count
                {
                    bail!("fragment does not match the existing reassembly");
                }

                start_command = Some(queued);
                break;
            }
        }

        let start_index = match start_command {
            Some(queued) => queued,
            None => {
                let mut reassembly = command.clone();
                reassembly.reliable_sequence_number = start_sequence_number;

                match peer.queue_incoming_command(
                    &reassembly,
                    None,
                    total_length as usize,
                    PACKET_FLAG_RELIABLE,
                    fragment_count,
                    maximum_waiting_data,
                )? {
                    Admission::Accepted { index, .. } => index,
                    Admission::Discarded => bail!("fragment reassembly discarded"),
                }
            }
        };

        let channel = &mut peer.channels[command.channel_id as usize];
        let incoming = &mut channel.incoming_reliable_commands[start_index];

        let word = (fragment_number / 32) as usize;
        let bit = 1u32 << (fragment_number % 32);
        if incoming.fragments[word] & bit == 0 {
            incoming.fragments_remaining -= 1;
            incoming.fragments[word] |= bit;

            let mut length = data_length as usize;
            let offset = fragment_offset as usize;
            if offset + length > incoming.data.len() {
                length = incoming.data.len() - offset;
            }
            incoming.data[offset..offset + length].copy_from_slice(&fragment_data[..length]);

            let complete = incoming.fragments_remaining == 0;
            if complete && peer.dispatch_incoming_reliable_commands(command.channel_id) {
                self.enqueue_dispatch(index);
            }
        }

        Ok(())
    }

    fn handle_send_unreliable_fragment(
        &mut self,
        index: usize,
        command: &Command,
        current: &mut &[u8],
    ) -> anyhow::Result<()> {
        let CommandKind::SendUnreliableFragment {
            start_sequence_number,
            data_length,
            fragment_count,
            fragment_number,
            total_length,
            fragment_offset,
        } = command.kind
        else {
            bail!("malformed unreliable fragment command");
        };
        if command.channel_id as usize >= self.peers[index].channels.len() {
            bail!("channel {} out of range", command.channel_id);
        }

        let fragment_data = self.take_payload(index, current, data_length as usize)?;
        let maximum_packet_size = self.maximum_packet_size;
        let maximum_waiting_data = self.maximum_waiting_data;

        let peer = &mut self.peers[index];
        let channel = &peer.channels[command.channel_id as usize];

        let reliable_sequence_number = command.reliable_sequence_number;
        let mut reliable_window = reliable_sequence_number / RELIABLE_WINDOW_SIZE;
        let current_window = channel.incoming_reliable_sequence_number / RELIABLE_WINDOW_SIZE;
        if reliable_sequence_number < channel.incoming_reliable_sequence_number {
            reliable_window += RELIABLE_WINDOWS;
        }
        if reliable_window < current_window
            || reliable_window >= current_window + FREE_RELIABLE_WINDOWS - 1
        {
            return Ok(());
        }

        if reliable_sequence_number == channel.incoming_reliable_sequence_number
            && start_sequence_number <= channel.incoming_unreliable_sequence_number
        {
            return Ok(());
        }

        if fragment_count > MAXIMUM_FRAGMENT_COUNT
            || fragment_number >= fragment_count
            || total_length as usize > maximum_packet_size
            || fragment_offset >= total_length
            || data_length as u32 > total_length - fragment_offset
        {
            bail!("fragment metadata out of bounds");
        }

        let mut start_command = None;
        for queued in (0..channel.incoming_unreliable_commands.len()).rev() {
            let incoming = &channel.incoming_unreliable_commands[queued];

            if reliable_sequence_number >= channel.incoming_reliable_sequence_number {
                if incoming.reliable_sequence_number < channel.incoming_reliable_sequence_number {
                    continue;
                }
            } else if incoming.reliable_sequence_number
                >= channel.incoming_reliable_sequence_number
            {
                break;
            }

            if incoming.reliable_sequence_number < reliable_sequence_number {
                break;
            }
            if incoming.reliable_sequence_number > reliable_sequence_number {
                continue;
            }

            if incoming.unreliable_sequence_number <= start_sequence_number {
                if incoming.unreliable_sequence_number < start_sequence_number {
                    break;
                }

                if incoming.command_byte & COMMAND_MASK != OPCODE_SEND_UNRELIABLE_FRAGMENT
                    || total_length as usize != incoming.data.len()
                    || fragment_count != incoming.fragment_count
                {
                    bail!("fragment does not match the existing reassembly");
                }

                start_command = Some(queued);
                break;
            }
        }

        let start_index = match start_command {
            Some(queued) => queued,
            None => {
                match peer.queue_incoming_command(
                    command,
                    None,
                    total_length as usize,
                    PACKET_FLAG_UNRELIABLE_FRAGMENT,
                    fragment_count,
                    maximum_waiting_data,
                )? {
                    Admission::Accepted { index, .. } => index,
                    Admission::Discarded => bail!("fragment reassembly discarded"),
                }
            }
        };

        let channel = &mut peer.channels[command.channel_id as usize];
        let incoming = &mut channel.incoming_unreliable_commands[start_index];

        let word = (fragment_number / 32) as usize;
        let bit = 1u32 << (fragment_number % 32);
        if incoming.fragments[word] & bit == 0 {
            incoming.fragments_remaining -= 1;
            incoming.fragments[word] |= bit;

            let mut length = data_length as usize;
            let offset = fragment_offset as usize;
            if offset + length > incoming.data.len() {
                length = incoming.data.len() - offset;
            }
            incoming.data[offset..offset + length].copy_from_slice(&fragment_data[..length]);

            let complete = incoming.fragments_remaining == 0;
            if complete && peer.dispatch_incoming_unreliable_commands(command.channel_id) {
                self.enqueue_dispatch(index);
            }
        }

        Ok(())
    }

    // ---- bandwidth throttle -----------------------------------------------

    /// Redistributes the host's outgoing bandwidth budget across connected
    ///  peers once per throttle interval: peers whose own incoming limit is
    ///  the bottleneck get their individual share locked in, then the
    ///  remainder is spread pro rata over the rest. When the incoming
    ///  budget changed, the fair share per peer is recomputed the same way
    ///  and announced with BANDWIDTH_LIMIT commands.
    fn bandwidth_throttle(&mut self) {
        let time_current = self.clock.now();
        let elapsed_time = time_current.wrapping_sub(self.bandwidth_throttle_epoch);

        if elapsed_time < BANDWIDTH_THROTTLE_INTERVAL {
            return;
        }

        self.bandwidth_throttle_epoch = time_current;

        let mut peers_remaining = self.connected_peers as u32;
        if peers_remaining == 0 {
            return;
        }

        let mut data_total = u64::MAX;
        let mut bandwidth = u64::MAX;
        let mut needs_adjustment = self.bandwidth_limited_peers > 0;

        if self.outgoing_bandwidth != 0 {
            data_total = 0;
            bandwidth = self.outgoing_bandwidth as u64 * elapsed_time as u64 / 1000;

            for peer in &self.peers {
                if !matches!(
                    peer.state,
                    PeerState::Connected | PeerState::DisconnectLater
                ) {
                    continue;
                }
                data_total += peer.outgoing_data_total as u64;
            }
        }

        while peers_remaining > 0 && needs_adjustment {
            needs_adjustment = false;

            let throttle = if data_total <= bandwidth {
                PACKET_THROTTLE_SCALE as u64
            } else {
                bandwidth * PACKET_THROTTLE_SCALE as u64 / data_total
            };

            for peer in &mut self.peers {
                if !matches!(
                    peer.state,
                    PeerState::Connected | PeerState::DisconnectLater
                ) || peer.incoming_bandwidth == 0
                    || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }

                let peer_bandwidth = peer.incoming_bandwidth as u64 * elapsed_time as u64 / 1000;
                if throttle * peer.outgoing_data_total as u64 / PACKET_THROTTLE_SCALE as u64
                    <= peer_bandwidth
                {
                    continue;
                }

                peer.packet_throttle_limit = ((peer_bandwidth
                    * PACKET_THROTTLE_SCALE as u64)
                    / peer.outgoing_data_total.max(1) as u64)
                    .max(1) as u32;
                peer.packet_throttle = peer.packet_throttle.min(peer.packet_throttle_limit);

                peer.outgoing_bandwidth_throttle_epoch = time_current;
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;

                needs_adjustment = true;
                peers_remaining -= 1;
                bandwidth = bandwidth.saturating_sub(peer_bandwidth);
                data_total = data_total.saturating_sub(peer_bandwidth);
            }
        }

        if peers_remaining > 0 {
            let throttle = if data_total <= bandwidth {
                PACKET_THROTTLE_SCALE as u64
            } else {
                bandwidth * PACKET_THROTTLE_SCALE as u64 / data_total
            };

            for peer in &mut self.peers {
                if !matches!(
                    peer.state,
                    PeerState::Connected | PeerState::DisconnectLater
                ) || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }

                peer.packet_throttle_limit = throttle as u32;
                peer.packet_throttle = peer.packet_throttle.min(peer.packet_throttle_limit);

                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;
            }
        }

        if self.recalculate_bandwidth_limits {
            self.recalculate_bandwidth_limits = false;

            let mut peers_remaining = self.connected_peers as u32;
            let mut bandwidth = self.incoming_bandwidth;
            let mut needs_adjustment = true;
            let mut bandwidth_limit = 0;

            if bandwidth != 0 {
                while peers_remaining > 0 && needs_adjustment {
                    needs_adjustment = false;
                    bandwidth_limit = bandwidth / peers_remaining;

                    for peer in &mut self.peers {
                        if !matches!(
                            peer.state,
                            PeerState::Connected | PeerState::DisconnectLater
                        ) || peer.incoming_bandwidth_throttle_epoch == time_current
                        {
                            continue;
                        }

                        if peer.outgoing_bandwidth > 0
                            && peer.outgoing_bandwidth >= bandwidth_limit
                        {
                            continue;
                        }

                        peer.incoming_bandwidth_throttle_epoch = time_current;

                        needs_adjustment = true;
                        peers_remaining -= 1;
                        bandwidth = bandwidth.saturating_sub(peer.outgoing_bandwidth);
                    }
                }
            }

            let outgoing_bandwidth = self.outgoing_bandwidth;
            for peer in &mut self.peers {
                if !matches!(
                    peer.state,
                    PeerState::Connected | PeerState::DisconnectLater
                ) {
                    continue;
                }

                let incoming_bandwidth = if peer.incoming_bandwidth_throttle_epoch == time_current
                {
                    peer.outgoing_bandwidth
                } else {
                    bandwidth_limit
                };

                peer.queue_outgoing_command(
                    Command {
                        flags: COMMAND_FLAG_ACKNOWLEDGE,
                        channel_id: 0xFF,
                        reliable_sequence_number: 0,
                        kind: CommandKind::BandwidthLimit {
                            incoming_bandwidth,
                            outgoing_bandwidth,
                        },
                    },
                    None,
                    0,
                    0,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{MockDatagramSocket, WAIT_NONE};
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::io;
    use std::rc::Rc;

    /// in-memory datagram fabric: loss-free unless told otherwise, shared by
    ///  all sockets of one test
    #[derive(Default)]
    struct Network {
        queues: HashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
        drop_next: usize,
        drop_all: bool,
    }

    struct TestSocket {
        address: SocketAddr,
        network: Rc<RefCell<Network>>,
    }

    impl DatagramSocket for TestSocket {
        fn send(&mut self, to: SocketAddr, buffers: &[&[u8]]) -> io::Result<usize> {
            let datagram: Vec<u8> = buffers.concat();
            let length = datagram.len();

            let mut network = self.network.borrow_mut();
            if network.drop_all {
                return Ok(length);
            }
            if network.drop_next > 0 {
                network.drop_next -= 1;
                return Ok(length);
            }

            network
                .queues
                .entry(to)
                .or_default()
                .push_back((self.address, datagram));
            Ok(length)
        }

        fn receive(&mut self, buf: &mut [u8]) -> io::Result<Option<(SocketAddr, usize)>> {
            let mut network = self.network.borrow_mut();
            let Some(queue) = network.queues.get_mut(&self.address) else {
                return Ok(None);
            };
            let Some((from, datagram)) = queue.pop_front() else {
                return Ok(None);
            };
            buf[..datagram.len()].copy_from_slice(&datagram);
            Ok(Some((from, datagram.len())))
        }

        fn wait(&mut self, _condition: u32, _timeout_ms: u32) -> io::Result<u32> {
            let network = self.network.borrow();
            let pending = network
                .queues
                .get(&self.address)
                .is_some_and(|queue| !queue.is_empty());
            Ok(if pending { WAIT_RECEIVE } else { WAIT_NONE })
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.address)
        }
    }

    struct TestClock(Rc<Cell<u32>>);

    impl Clock for TestClock {
        fn now(&self) -> u32 {
            self.0.get()
        }
    }

    struct Pair {
        a: Host,
        b: Host,
        peer_a: PeerId,
        peer_b: PeerId,
        network: Rc<RefCell<Network>>,
        clock: Rc<Cell<u32>>,
    }

    fn test_host(
        address: SocketAddr,
        mtu: u32,
        network: &Rc<RefCell<Network>>,
        clock: &Rc<Cell<u32>>,
    ) -> Host {
        let mut config = HostConfig::new(4);
        config.mtu = mtu;
        Host::with_transport(
            config,
            Box::new(TestSocket {
                address,
                network: network.clone(),
            }),
            Box::new(TestClock(clock.clone())),
        )
        .unwrap()
    }

    fn pump(a: &mut Host, b: &mut Host, rounds: usize) -> Vec<(char, Event)> {
        let mut events = Vec::new();
        for _ in 0..rounds {
            while let Some(event) = a.service(0).unwrap() {
                events.push(('a', event));
            }
            while let Some(event) = b.service(0).unwrap() {
                events.push(('b', event));
            }
        }
        events
    }

    /// two hosts on an in-memory network, pumped through the full connect
    ///  handshake
    fn connected_pair(mtu: u32, with_checksum: bool) -> Pair {
        let network = Rc::new(RefCell::new(Network::default()));
        let clock = Rc::new(Cell::new(1000u32));

        let address_a: SocketAddr = "10.0.0.1:7001".parse().unwrap();
        let address_b: SocketAddr = "10.0.0.2:7002".parse().unwrap();

        let mut a = test_host(address_a, mtu, &network, &clock);
        let mut b = test_host(address_b, mtu, &network, &clock);
        if with_checksum {
            a.checksum_with_crc32();
            b.checksum_with_crc32();
        }

        let peer_a = a.connect(address_b, 2, 42).unwrap();

        let events = pump(&mut a, &mut b, 4);
        let mut peer_b = None;
        let mut a_connected = false;
        for (side, event) in &events {
            if let Event::Connect { peer, data } = event {
                match side {
                    'a' => {
                        assert_eq!(*peer, peer_a);
                        a_connected = true;
                    }
                    _ => {
                        assert_eq!(*data, 42);
                        peer_b = Some(*peer);
                    }
                }
            }
        }
        assert!(a_connected, "initiator never saw its connect event");
        let peer_b = peer_b.expect("responder never saw its connect event");

        assert_eq!(a.peer(peer_a).state(), PeerState::Connected);
        assert_eq!(b.peer(peer_b).state(), PeerState::Connected);

        Pair {
            a,
            b,
            peer_a,
            peer_b,
            network,
            clock,
        }
    }

    #[test]
    fn test_connect_and_ping() {
        let pair = connected_pair(1400, false);

        // the handshake round trip feeds the RTT estimate
        assert!(pair.a.peer(pair.peer_a).round_trip_time() > 0);
        assert!(pair.b.peer(pair.peer_b).round_trip_time() > 0);
        assert_eq!(pair.a.peer(pair.peer_a).channel_count(), 2);
        assert_eq!(pair.b.peer(pair.peer_b).channel_count(), 2);
    }

    #[test]
    fn test_reliable_in_order() {
        let Pair {
            mut a, mut b, peer_a, ..
        } = connected_pair(1400, false);

        for payload in [vec![0x01], vec![0x02, 0x03], vec![0x04]] {
            a.send(peer_a, 0, Packet::reliable(payload)).unwrap();
        }

        let events = pump(&mut a, &mut b, 4);
        let received: Vec<Vec<u8>> = events
            .iter()
            .filter_map(|(side, event)| match (side, event) {
                ('b', Event::Receive { packet, channel_id, .. }) => {
                    assert_eq!(*channel_id, 0);
                    Some(packet.data.to_vec())
                }
                _ => None,
            })
            .collect();

        assert_eq!(received, vec![vec![0x01], vec![0x02, 0x03], vec![0x04]]);
        assert!(a.peers[peer_a.0].outgoing_reliable_commands.is_empty());
        assert!(a.peers[peer_a.0].sent_reliable_commands.is_empty());
    }

    #[test]
    fn test_fragmentation_with_checksum() {
        let Pair {
            mut a, mut b, peer_a, ..
        } = connected_pair(576, true);

        let payload: Vec<u8> = (0..4096u32).map(|value| value as u8).collect();
        a.send(peer_a, 1, Packet::reliable(payload.clone())).unwrap();

        // eight fragments share one payload buffer
        assert!(a.peers[peer_a.0]
            .outgoing_reliable_commands
            .iter()
            .all(|command| matches!(command.command.kind, CommandKind::SendFragment { .. })));
        assert_eq!(a.peers[peer_a.0].outgoing_reliable_commands.len(), 8);

        let events = pump(&mut a, &mut b, 6);
        let received: Vec<&Event> = events
            .iter()
            .filter(|(side, event)| *side == 'b' && matches!(event, Event::Receive { .. }))
            .map(|(_, event)| event)
            .collect();

        assert_eq!(received.len(), 1);
        let Event::Receive { channel_id, packet, .. } = received[0] else {
            unreachable!();
        };
        assert_eq!(*channel_id, 1);
        assert_eq!(packet.data.as_ref(), payload.as_slice());

        assert!(a.peers[peer_a.0].sent_reliable_commands.is_empty());
        assert_eq!(a.peers[peer_a.0].reliable_data_in_transit, 0);
    }

    #[test]
    fn test_fragment_reassembly_is_arrival_order_insensitive() {
        let Pair {
            mut a,
            mut b,
            peer_a,
            network,
            ..
        } = connected_pair(576, false);

        let payload: Vec<u8> = (0..4096u32).map(|value| (value >> 3) as u8).collect();
        a.send(peer_a, 0, Packet::reliable(payload.clone())).unwrap();
        a.flush().unwrap();

        // deliver the fragment datagrams in reverse order
        let address_b: SocketAddr = "10.0.0.2:7002".parse().unwrap();
        {
            let mut network = network.borrow_mut();
            let queue = network.queues.get_mut(&address_b).unwrap();
            let reversed: VecDeque<(SocketAddr, Vec<u8>)> = queue.drain(..).rev().collect();
            *queue = reversed;
        }

        let events = pump(&mut a, &mut b, 4);
        let received: Vec<Vec<u8>> = events
            .iter()
            .filter_map(|(side, event)| match (side, event) {
                ('b', Event::Receive { packet, .. }) => Some(packet.data.to_vec()),
                _ => None,
            })
            .collect();

        assert_eq!(received, vec![payload]);
    }

    #[test]
    fn test_unreliable_drop_under_throttle() {
        let Pair {
            mut a, mut b, peer_a, ..
        } = connected_pair(1400, false);

        a.peers[peer_a.0].packet_throttle = 0;
        a.peers[peer_a.0].packet_throttle_limit = 0;

        for _ in 0..10 {
            a.send(peer_a, 0, Packet::unreliable(vec![0x55; 100])).unwrap();
        }

        let events = pump(&mut a, &mut b, 4);
        assert!(events
            .iter()
            .all(|(_, event)| !matches!(event, Event::Receive { .. })));
        assert!(a.peers[peer_a.0].outgoing_unreliable_commands.is_empty());
    }

    #[test]
    fn test_retransmission_on_loss() {
        let Pair {
            mut a,
            mut b,
            peer_a,
            network,
            clock,
            ..
        } = connected_pair(1400, false);

        network.borrow_mut().drop_next = 1;
        a.send(peer_a, 0, Packet::reliable(vec![0xAB])).unwrap();

        // the first transmission is lost in transit
        let events = pump(&mut a, &mut b, 2);
        assert!(events
            .iter()
            .all(|(_, event)| !matches!(event, Event::Receive { .. })));
        assert_eq!(a.peers[peer_a.0].sent_reliable_commands.len(), 1);

        // once the per-command timeout elapses it is sent again
        clock.set(clock.get() + 2000);
        let events = pump(&mut a, &mut b, 4);
        let received: Vec<Vec<u8>> = events
            .iter()
            .filter_map(|(side, event)| match (side, event) {
                ('b', Event::Receive { packet, .. }) => Some(packet.data.to_vec()),
                _ => None,
            })
            .collect();

        assert_eq!(received, vec![vec![0xAB]]);
        assert!(a.peers[peer_a.0].sent_reliable_commands.is_empty());
        assert!(a.peers[peer_a.0].packets_lost > 0);
    }

    #[test]
    fn test_timeout_disconnect() {
        let Pair {
            mut a,
            peer_a,
            network,
            clock,
            ..
        } = connected_pair(1400, false);

        network.borrow_mut().drop_all = true;
        a.send(peer_a, 0, Packet::reliable(vec![0xCD])).unwrap();

        let mut disconnect = None;
        // backoff doubles the retransmission timeout up to its limit, so the
        //  final silence-driven disconnect lands near sixty simulated seconds
        for step in 1..130 {
            clock.set(1000 + step * 500);
            if let Some(event) = a.service(0).unwrap() {
                disconnect = Some(event);
                break;
            }
        }

        assert_eq!(
            disconnect,
            Some(Event::Disconnect {
                peer: peer_a,
                data: 0
            })
        );
        assert_eq!(a.peer(peer_a).state(), PeerState::Disconnected);
    }

    #[test]
    fn test_graceful_disconnect() {
        let Pair {
            mut a, mut b, peer_a, peer_b, ..
        } = connected_pair(1400, false);

        a.disconnect(peer_a, 7);
        assert_eq!(a.peer(peer_a).state(), PeerState::Disconnecting);

        let events = pump(&mut a, &mut b, 4);

        assert!(events.contains(&(
            'a',
            Event::Disconnect {
                peer: peer_a,
                data: 0
            }
        )));
        assert!(events.contains(&(
            'b',
            Event::Disconnect {
                peer: peer_b,
                data: 7
            }
        )));
        assert_eq!(a.peer(peer_a).state(), PeerState::Disconnected);
        assert_eq!(b.peer(peer_b).state(), PeerState::Disconnected);
    }

    #[test]
    fn test_exact_mtu_payload_is_not_fragmented() {
        let Pair { mut a, peer_a, .. } = connected_pair(576, false);

        // 576 - header - fragment record = the largest unfragmented payload
        a.send(peer_a, 0, Packet::reliable(vec![7; 548])).unwrap();
        assert!(matches!(
            a.peers[peer_a.0].outgoing_reliable_commands[0].command.kind,
            CommandKind::SendReliable { .. }
        ));

        // one byte more becomes two fragments
        a.send(peer_a, 0, Packet::reliable(vec![7; 549])).unwrap();
        let fragments: Vec<_> = a.peers[peer_a.0]
            .outgoing_reliable_commands
            .iter()
            .skip(1)
            .collect();
        assert_eq!(fragments.len(), 2);
        assert!(fragments
            .iter()
            .all(|command| matches!(command.command.kind, CommandKind::SendFragment { .. })));
    }

    #[test]
    fn test_unreliable_upgrades_to_reliable_at_sequence_exhaustion() {
        let Pair { mut a, peer_a, .. } = connected_pair(1400, false);

        a.peers[peer_a.0].channels[0].outgoing_unreliable_sequence_number = 0xFFFF;
        a.send(peer_a, 0, Packet::unreliable(vec![1])).unwrap();

        let command = a.peers[peer_a.0].outgoing_reliable_commands.front().unwrap();
        assert!(matches!(command.command.kind, CommandKind::SendReliable { .. }));
        assert_ne!(command.command.flags & COMMAND_FLAG_ACKNOWLEDGE, 0);
    }

    #[test]
    fn test_window_occupancy_defers_reliable_send() {
        let Pair { mut a, peer_a, .. } = connected_pair(1400, false);

        // windows ahead of the new command's are still in flight
        a.peers[peer_a.0].channels[0].outgoing_reliable_sequence_number = 0x7FFF;
        a.peers[peer_a.0].channels[0].used_reliable_windows = 0x0200;

        a.send(peer_a, 0, Packet::reliable(vec![9])).unwrap();
        a.flush().unwrap();

        // deferred on the outgoing queue, not dropped
        assert_eq!(a.peers[peer_a.0].outgoing_reliable_commands.len(), 1);
        assert_eq!(
            a.peers[peer_a.0].outgoing_reliable_commands[0].send_attempts,
            0
        );
        assert!(a.peers[peer_a.0].sent_reliable_commands.is_empty());
    }

    #[test]
    fn test_unsequenced_duplicate_is_delivered_once() {
        let Pair {
            mut a,
            mut b,
            peer_a,
            network,
            ..
        } = connected_pair(1400, false);

        a.send(peer_a, 0, Packet::unsequenced(vec![0x11])).unwrap();
        a.flush().unwrap();

        // replay the datagram as the network might
        let address_b: SocketAddr = "10.0.0.2:7002".parse().unwrap();
        {
            let mut network = network.borrow_mut();
            let queue = network.queues.get_mut(&address_b).unwrap();
            let duplicate = queue.back().unwrap().clone();
            queue.push_back(duplicate);
        }

        let events = pump(&mut a, &mut b, 3);
        let received = events
            .iter()
            .filter(|(side, event)| *side == 'b' && matches!(event, Event::Receive { .. }))
            .count();
        assert_eq!(received, 1);
    }

    #[test]
    fn test_flush_on_idle_host_sends_nothing() {
        let mut socket = MockDatagramSocket::new();
        socket.expect_send().never();

        let mut host = Host::with_transport(
            HostConfig::new(1),
            Box::new(socket),
            Box::new(TestClock(Rc::new(Cell::new(0)))),
        )
        .unwrap();

        host.flush().unwrap();
    }

    #[test]
    fn test_datagram_for_unknown_peer_is_ignored() {
        let network = Rc::new(RefCell::new(Network::default()));
        let clock = Rc::new(Cell::new(1000u32));
        let address_a: SocketAddr = "10.0.0.1:7001".parse().unwrap();
        let address_b: SocketAddr = "10.0.0.2:7002".parse().unwrap();

        let mut a = test_host(address_a, 1400, &network, &clock);

        // a datagram addressed to an out-of-range peer slot
        network
            .borrow_mut()
            .queues
            .entry(address_a)
            .or_default()
            .push_back((address_b, vec![0x0F, 0xFE, 0, 0]));

        assert_eq!(a.service(0).unwrap(), None);
        assert_eq!(a.total_received_packets(), 1);
    }
}
