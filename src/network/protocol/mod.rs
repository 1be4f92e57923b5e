//! Peer protocol state machine.
//!
//! One [`UdpProtocol`] exists per remote address. It owns the handshake, the outbound input
//! buffer, the inbound message handler and the keepalive/quality-report timers for that peer.
//! It never touches a socket itself: outbound messages are queued until
//! [`UdpProtocol::send_all_messages`] hands them to a [`NonBlockingSocket`], and inbound
//! messages are fed in through [`UdpProtocol::handle_message`].
//!
//! Every time-dependent operation has an `_at` variant that takes the current [`Instant`],
//! which keeps the state machine deterministic under test.

mod event;
mod state;

pub use event::Event;
pub use state::ProtocolState;

use std::collections::vec_deque::Drain;
use std::collections::VecDeque;

use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::frame_info::GameInput;
use crate::network::bit_vector::BitReader;
use crate::network::codec::encoded_len;
use crate::network::compression::{decode_frame, encode, MAX_COMPRESSED_BITS};
use crate::network::messages::{
    ConnectionStatus, Input, InputAck, Message, MessageBody, MessageHeader, QualityReply,
    QualityReport, SyncReply, SyncRequest,
};
use crate::network::network_stats::NetworkStats;
use crate::report_violation;
use crate::rng::{Pcg32, SeedableRng};
use crate::sessions::config::{ProtocolConfig, SyncConfig};
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::time_sync::{TimeSync, TimeSyncConfig};
use crate::{Frame, NonBlockingSocket, PlayerHandle, RampartError};

const UDP_HEADER_SIZE: usize = 28; // Size of IP + UDP headers

/// Timing parameters shared by every peer of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolTimeouts {
    /// Silence after which the peer is disconnected.
    pub disconnect_timeout: Duration,
    /// Silence after which a [`Event::NetworkInterrupted`] is emitted.
    pub disconnect_notify_start: Duration,
}

impl Default for ProtocolTimeouts {
    fn default() -> Self {
        Self {
            disconnect_timeout: Duration::from_millis(5000),
            disconnect_notify_start: Duration::from_millis(750),
        }
    }
}

/// UDP protocol handler for one remote peer.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
pub struct UdpProtocol<A> {
    handles: Vec<PlayerHandle>,
    send_queue: VecDeque<Message>,
    event_queue: VecDeque<Event>,

    // state
    state: ProtocolState,
    sync_remaining_roundtrips: u32,
    sync_random_request: u32,
    sync_retries: u32,
    connected: bool,
    running_last_quality_report: Instant,
    running_last_network_stats: Instant,
    running_last_input_recv: Instant,
    disconnect_notify_sent: bool,
    disconnect_event_sent: bool,

    // constants
    timeouts: ProtocolTimeouts,
    magic: u16,
    sync_config: SyncConfig,
    protocol_config: ProtocolConfig,

    // the other client
    peer_addr: A,
    remote_magic: u16,
    next_send_seq: u16,
    next_recv_seq: u16,
    peer_connect_status: Vec<ConnectionStatus>,

    // input compression
    pending_output: VecDeque<GameInput>,
    last_acked_input: GameInput,
    last_received_input: GameInput,

    // time sync
    time_sync: TimeSync,
    local_frame_advantage: i32,
    remote_frame_advantage: i32,

    // network
    start_time: Instant,
    stats_start_time: Instant,
    packets_sent: usize,
    bytes_sent: usize,
    kbps_sent: usize,
    round_trip_time: u64,
    last_send_time: Instant,
    last_recv_time: Instant,

    rng: Pcg32,
}

impl<A: std::fmt::Debug> std::fmt::Debug for UdpProtocol<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpProtocol")
            .field("peer_addr", &self.peer_addr)
            .field("handles", &self.handles)
            .field("state", &self.state)
            .field("magic", &self.magic)
            .field("remote_magic", &self.remote_magic)
            .field("pending_output", &self.pending_output.len())
            .field("last_received_frame", &self.last_received_input.frame)
            .finish_non_exhaustive()
    }
}

impl<A: Clone + PartialEq + std::fmt::Debug> UdpProtocol<A> {
    /// Creates the protocol in the `Syncing` state. No message is queued until
    /// [`synchronize`](Self::synchronize) is called or the first retry interval elapses.
    ///
    /// `handles` are the players behind the peer; every input the peer sends holds their
    /// inputs concatenated in handle order. `local_players` is the number of players whose
    /// concatenated inputs this side sends.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mut handles: Vec<PlayerHandle>,
        peer_addr: A,
        num_players: usize,
        input_size: usize,
        local_players: usize,
        timeouts: ProtocolTimeouts,
        sync_config: SyncConfig,
        protocol_config: ProtocolConfig,
        time_sync_config: TimeSyncConfig,
    ) -> Self {
        use crate::rng::Rng as _;

        let mut rng = protocol_config
            .protocol_rng_seed
            .map_or_else(Pcg32::from_entropy, Pcg32::seed_from_u64);
        let magic = rng.gen_nonzero_u16();

        handles.sort_unstable();
        let recv_size = handles.len() * input_size;
        let send_size = local_players * input_size;
        let now = Instant::now();

        Self {
            handles,
            send_queue: VecDeque::new(),
            event_queue: VecDeque::new(),

            state: ProtocolState::Syncing,
            sync_remaining_roundtrips: sync_config.num_sync_packets,
            sync_random_request: 0,
            sync_retries: 0,
            connected: false,
            running_last_quality_report: now,
            running_last_network_stats: now,
            running_last_input_recv: now,
            disconnect_notify_sent: false,
            disconnect_event_sent: false,

            timeouts,
            magic,
            sync_config,
            protocol_config,

            peer_addr,
            remote_magic: 0,
            next_send_seq: 0,
            next_recv_seq: 0,
            peer_connect_status: vec![ConnectionStatus::default(); num_players],

            pending_output: VecDeque::with_capacity(protocol_config.pending_output_limit + 1),
            last_acked_input: GameInput::blank(Frame::NULL, send_size),
            last_received_input: GameInput::blank(Frame::NULL, recv_size),

            time_sync: TimeSync::with_config(time_sync_config),
            local_frame_advantage: 0,
            remote_frame_advantage: 0,

            start_time: now,
            stats_start_time: now,
            packets_sent: 0,
            bytes_sent: 0,
            kbps_sent: 0,
            round_trip_time: 0,
            last_send_time: now,
            last_recv_time: now,

            rng,
        }
    }

    /*
     *  ACCESSORS
     */

    #[must_use]
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == ProtocolState::Running
    }

    /// True once the handshake has completed, even if the peer has disconnected since.
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        self.state != ProtocolState::Syncing
    }

    #[must_use]
    pub fn is_handling_message(&self, addr: &A) -> bool {
        self.peer_addr == *addr
    }

    #[must_use]
    pub fn peer_addr(&self) -> A {
        self.peer_addr.clone()
    }

    /// The players behind this peer, in ascending order.
    #[must_use]
    pub fn handles(&self) -> &[PlayerHandle] {
        &self.handles
    }

    /// Magic number this side stamps on its messages.
    #[must_use]
    pub fn magic(&self) -> u16 {
        self.magic
    }

    /// The peer's magic number, or 0 before the handshake has completed.
    #[must_use]
    pub fn remote_magic(&self) -> u16 {
        self.remote_magic
    }

    /// Frame of the last input received from the peer.
    #[must_use]
    pub fn last_received_frame(&self) -> Frame {
        self.last_received_input.frame
    }

    /// Number of sent inputs the peer has not acknowledged yet.
    #[must_use]
    pub fn pending_output_len(&self) -> usize {
        self.pending_output.len()
    }

    /// The peer's view of `handle`'s connection.
    #[must_use]
    pub fn peer_connect_status(&self, handle: PlayerHandle) -> ConnectionStatus {
        self.peer_connect_status
            .get(handle.as_usize())
            .copied()
            .unwrap_or_default()
    }

    pub fn network_stats(&self) -> Result<NetworkStats, RampartError> {
        if self.state == ProtocolState::Syncing {
            return Err(RampartError::NotSynchronized);
        }
        Ok(NetworkStats {
            send_queue_len: self.pending_output.len(),
            ping: self.round_trip_time,
            kbps_sent: self.kbps_sent,
            local_frames_behind: self.local_frame_advantage,
            remote_frames_behind: self.remote_frame_advantage,
        })
    }

    /// Frames this side should wait to let the peer catch up. See
    /// [`TimeSync::recommend_frame_wait_duration`].
    pub fn recommend_frame_delay(&mut self, require_idle_input: bool) -> u32 {
        self.time_sync.recommend_frame_wait_duration(require_idle_input)
    }

    pub fn update_local_frame_advantage(&mut self, local_frame: Frame) {
        let last_recv_frame = self.last_received_input.frame;
        if !local_frame.is_valid() || !last_recv_frame.is_valid() {
            return;
        }
        // Estimate which frame the peer is on: the last frame it sent plus the frames it
        // simulated while that input was in flight.
        let rtt = i32::try_from(self.round_trip_time).unwrap_or(i32::MAX);
        let fps = i32::try_from(self.protocol_config.fps).unwrap_or(i32::MAX);
        let remote_frame = last_recv_frame + rtt.saturating_mul(fps) / 1000;
        self.local_frame_advantage = remote_frame - local_frame;
    }

    /*
     *  LIFECYCLE
     */

    /// Starts (or restarts) the handshake and queues the first sync request.
    pub fn synchronize(&mut self) {
        self.synchronize_at(Instant::now());
    }

    pub fn synchronize_at(&mut self, now: Instant) {
        debug!("Synchronizing with {:?}", self.peer_addr);
        self.state = ProtocolState::Syncing;
        self.sync_remaining_roundtrips = self.sync_config.num_sync_packets;
        self.sync_retries = 0;
        self.disconnect_notify_sent = false;
        self.disconnect_event_sent = false;
        self.stats_start_time = now;
        self.last_recv_time = now;
        self.send_sync_request(now);
    }

    /// Leaves the session. The next input message tells the peer so.
    pub fn disconnect(&mut self) {
        self.disconnect_at(Instant::now());
    }

    pub fn disconnect_at(&mut self, now: Instant) {
        if self.state == ProtocolState::Disconnected {
            return;
        }
        debug!("Disconnecting from {:?}", self.peer_addr);
        self.state = ProtocolState::Disconnected;
        self.send_pending_output(now, &[]);
    }

    /// Runs the timers and drains pending events.
    pub fn poll(&mut self, connect_status: &[ConnectionStatus]) -> Drain<'_, Event> {
        self.poll_at(Instant::now(), connect_status)
    }

    pub fn poll_at(
        &mut self,
        now: Instant,
        connect_status: &[ConnectionStatus],
    ) -> Drain<'_, Event> {
        match self.state {
            ProtocolState::Syncing => self.poll_syncing(now),
            ProtocolState::Running => self.poll_running(now, connect_status),
            ProtocolState::Disconnected => (),
        }
        self.event_queue.drain(..)
    }

    fn poll_syncing(&mut self, now: Instant) {
        let interval = if self.sync_remaining_roundtrips == self.sync_config.num_sync_packets {
            self.sync_config.first_retry_interval
        } else {
            self.sync_config.retry_interval
        };
        if self.last_send_time + interval >= now {
            return;
        }

        if let Some(max_retries) = self.sync_config.max_sync_retries {
            if self.sync_retries >= max_retries {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::Synchronization,
                    "Giving up on {:?} after {} unanswered sync requests",
                    self.peer_addr,
                    self.sync_retries
                );
                self.state = ProtocolState::Disconnected;
                self.event_queue.push_back(Event::SyncFailed);
                if !self.disconnect_event_sent {
                    self.disconnect_event_sent = true;
                    self.event_queue.push_back(Event::Disconnected);
                }
                return;
            }
        }

        self.sync_retries += 1;
        trace!(
            "No luck syncing with {:?} after {:?}; re-queueing sync request",
            self.peer_addr,
            interval
        );
        self.send_sync_request(now);
    }

    fn poll_running(&mut self, now: Instant, connect_status: &[ConnectionStatus]) {
        // resend pending inputs, if some time has passed without receiving inputs
        if self.running_last_input_recv + self.protocol_config.running_retry_interval < now {
            self.send_pending_output(now, connect_status);
            self.running_last_input_recv = now;
        }

        if self.running_last_quality_report + self.protocol_config.quality_report_interval < now {
            self.send_quality_report(now);
        }

        if self.running_last_network_stats + self.protocol_config.network_stats_interval < now {
            self.update_network_stats(now);
        }

        if self.last_send_time + self.protocol_config.keepalive_interval < now {
            self.send_keep_alive(now);
        }

        if !self.disconnect_notify_sent
            && self.last_recv_time + self.timeouts.disconnect_notify_start < now
        {
            let remaining = self
                .timeouts
                .disconnect_timeout
                .saturating_sub(self.timeouts.disconnect_notify_start);
            debug!(
                "No messages from {:?} for {:?}; disconnecting in {:?}",
                self.peer_addr, self.timeouts.disconnect_notify_start, remaining
            );
            self.event_queue.push_back(Event::NetworkInterrupted {
                disconnect_timeout: remaining.as_millis(),
            });
            self.disconnect_notify_sent = true;
        }

        if self.last_recv_time + self.timeouts.disconnect_timeout < now {
            debug!("Peer {:?} timed out", self.peer_addr);
            self.state = ProtocolState::Disconnected;
            if !self.disconnect_event_sent {
                self.event_queue.push_back(Event::Disconnected);
                self.disconnect_event_sent = true;
            }
        }
    }

    fn update_network_stats(&mut self, now: Instant) {
        self.running_last_network_stats = now;
        let seconds = now.saturating_duration_since(self.stats_start_time).as_secs();
        if seconds == 0 {
            return;
        }
        let total_bytes_sent = self.bytes_sent + self.packets_sent * UDP_HEADER_SIZE;
        self.kbps_sent = total_bytes_sent / seconds as usize / 1024;
        trace!(
            "Network stats for {:?}: {} packets, {} bytes, {} kbps",
            self.peer_addr,
            self.packets_sent,
            total_bytes_sent,
            self.kbps_sent
        );
    }

    /// Drops every pending input up to and including `ack_frame`.
    fn pop_pending_output(&mut self, ack_frame: Frame) {
        while let Some(input) = self.pending_output.front() {
            if input.frame > ack_frame {
                break;
            }
            if let Some(popped) = self.pending_output.pop_front() {
                self.last_acked_input = popped;
            }
        }
    }

    fn millis_since_start(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.start_time).as_millis() as u64
    }

    /*
     *  SENDING MESSAGES
     */

    pub fn send_all_messages(&mut self, socket: &mut dyn NonBlockingSocket<A>) {
        if self.send_queue.is_empty() {
            // avoid log spam if there's nothing to send
            return;
        }

        trace!("Sending {} messages over socket", self.send_queue.len());
        for msg in self.send_queue.drain(..) {
            socket.send_to(&msg, &self.peer_addr);
        }
    }

    /// Queues a local input for the peer and sends the whole unacknowledged window.
    ///
    /// Inputs are only buffered while running; once disconnected the call still sends a
    /// message so the peer learns about the disconnect.
    pub fn send_input(&mut self, input: &GameInput, connect_status: &[ConnectionStatus]) {
        self.send_input_at(Instant::now(), input, connect_status);
    }

    pub fn send_input_at(
        &mut self,
        now: Instant,
        input: &GameInput,
        connect_status: &[ConnectionStatus],
    ) {
        match self.state {
            ProtocolState::Syncing => return,
            ProtocolState::Disconnected => {},
            ProtocolState::Running => {
                if input.size() != self.last_acked_input.size() {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::NetworkProtocol,
                        "Input of {} bytes does not match the {} bytes sent to {:?}",
                        input.size(),
                        self.last_acked_input.size(),
                        self.peer_addr
                    );
                    return;
                }

                // A raised frame delay skips frames that the local queue padded with copies of
                // the previous input. The peer needs the same frames to keep the stream gapless.
                let previous = self
                    .pending_output
                    .back()
                    .copied()
                    .unwrap_or(self.last_acked_input);
                if previous.frame.is_valid() && previous.frame + 1 < input.frame {
                    let mut padding = previous;
                    while padding.frame + 1 < input.frame {
                        padding.frame += 1;
                        self.pending_output.push_back(padding);
                    }
                    trace!(
                        "Padded frames {} to {} for {:?}",
                        previous.frame + 1,
                        padding.frame,
                        self.peer_addr
                    );
                }

                // register the input and advantages in the time sync layer
                self.time_sync.advance_frame(
                    input,
                    self.local_frame_advantage,
                    self.remote_frame_advantage,
                );
                self.pending_output.push_back(*input);

                // the peer stopped acknowledging long ago; treat it as gone
                if self.pending_output.len() > self.protocol_config.pending_output_limit {
                    report_violation!(
                        ViolationSeverity::Warning,
                        ViolationKind::NetworkProtocol,
                        "{} unacknowledged inputs for {:?}; disconnecting",
                        self.pending_output.len(),
                        self.peer_addr
                    );
                    self.state = ProtocolState::Disconnected;
                    if !self.disconnect_event_sent {
                        self.event_queue.push_back(Event::Disconnected);
                        self.disconnect_event_sent = true;
                    }
                }
            },
        }
        self.send_pending_output(now, connect_status);
    }

    fn send_pending_output(&mut self, now: Instant, connect_status: &[ConnectionStatus]) {
        let mut body = Input {
            start_frame: self.last_acked_input.frame + 1,
            input_size: self.last_acked_input.size() as u8,
            ..Input::default()
        };

        if let Some(front) = self.pending_output.front() {
            if self.last_acked_input.frame.is_valid()
                && front.frame != self.last_acked_input.frame + 1
            {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "Input frame sequence violation: last_acked={}, pending_front={}",
                    self.last_acked_input.frame,
                    front.frame
                );
                return;
            }
            body.start_frame = front.frame;
            body.input_size = front.size() as u8;

            let encoded = encode(
                &self.last_acked_input,
                self.pending_output.iter(),
                MAX_COMPRESSED_BITS,
            );
            if encoded.overflowed {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::Encoding,
                    "{} pending inputs for {:?} exceed {} bits; sending the first {}",
                    self.pending_output.len(),
                    self.peer_addr,
                    MAX_COMPRESSED_BITS,
                    encoded.frames
                );
            }
            trace!(
                "Encoded {} pending input(s) starting at frame {} into {} bits",
                encoded.frames,
                body.start_frame,
                encoded.num_bits
            );
            body.num_bits = encoded.num_bits as u16;
            body.bits = encoded.bits;
        }

        body.ack_frame = self.last_received_input.frame;
        body.disconnect_requested = self.state == ProtocolState::Disconnected;
        connect_status.clone_into(&mut body.peer_connect_status);

        self.queue_message(now, MessageBody::Input(body));
    }

    fn send_input_ack(&mut self, now: Instant) {
        let body = InputAck {
            ack_frame: self.last_received_input.frame,
        };
        self.queue_message(now, MessageBody::InputAck(body));
    }

    fn send_keep_alive(&mut self, now: Instant) {
        self.queue_message(now, MessageBody::KeepAlive);
    }

    fn send_sync_request(&mut self, now: Instant) {
        self.sync_random_request = self.rng.next_u32();
        let body = SyncRequest {
            random_request: self.sync_random_request,
            ping: self.millis_since_start(now),
        };
        self.queue_message(now, MessageBody::SyncRequest(body));
    }

    fn send_quality_report(&mut self, now: Instant) {
        self.running_last_quality_report = now;

        let clamped = self
            .local_frame_advantage
            .clamp(i32::from(i16::MIN), i32::from(i16::MAX));
        let body = QualityReport {
            frame_advantage: i16::try_from(clamped).unwrap_or_default(),
            ping: self.millis_since_start(now),
        };
        self.queue_message(now, MessageBody::QualityReport(body));
    }

    fn queue_message(&mut self, now: Instant, body: MessageBody) {
        trace!("Queuing message to {:?}: {:?}", self.peer_addr, body);

        let header = MessageHeader {
            magic: self.magic,
            sequence: self.next_send_seq,
        };
        self.next_send_seq = self.next_send_seq.wrapping_add(1);
        let msg = Message { header, body };

        self.packets_sent += 1;
        self.last_send_time = now;
        self.bytes_sent += encoded_len(&msg);

        self.send_queue.push_back(msg);
    }

    /*
     *  RECEIVING MESSAGES
     */

    pub fn handle_message(&mut self, msg: &Message) {
        self.handle_message_at(Instant::now(), msg);
    }

    pub fn handle_message_at(&mut self, now: Instant, msg: &Message) {
        trace!("Handling message from {:?}: {:?}", self.peer_addr, msg);

        if self.state == ProtocolState::Disconnected {
            trace!("Protocol is disconnected; ignoring message");
            return;
        }

        if !msg.body.is_sync() {
            // filter packets that don't match the magic; before the handshake completes nothing
            // matches
            if msg.header.magic != self.remote_magic {
                trace!("Received message with wrong magic; ignoring");
                return;
            }
            let skipped = msg.header.sequence.wrapping_sub(self.next_recv_seq);
            if skipped > self.protocol_config.max_sequence_distance {
                trace!(
                    "Dropping out of order message (seq {}, expected {})",
                    msg.header.sequence,
                    self.next_recv_seq
                );
                return;
            }
        }
        self.next_recv_seq = msg.header.sequence;

        let handled = match &msg.body {
            MessageBody::SyncRequest(body) => self.on_sync_request(now, msg.header, *body),
            MessageBody::SyncReply(body) => self.on_sync_reply(now, msg.header, *body),
            MessageBody::Input(body) => self.on_input(now, body),
            MessageBody::InputAck(body) => self.on_input_ack(*body),
            MessageBody::QualityReport(body) => self.on_quality_report(now, *body),
            MessageBody::QualityReply(body) => self.on_quality_reply(now, *body),
            MessageBody::KeepAlive => true,
        };

        if handled {
            self.last_recv_time = now;
            // if the connection has been marked as interrupted, signal we are receiving again
            if self.disconnect_notify_sent && self.state == ProtocolState::Running {
                debug!("Received message from {:?} again", self.peer_addr);
                self.disconnect_notify_sent = false;
                self.event_queue.push_back(Event::NetworkResumed);
            }
        }
    }

    /// Answers a `SyncRequest`, unless it comes from a different session than the one the
    /// handshake locked onto.
    fn on_sync_request(&mut self, now: Instant, header: MessageHeader, body: SyncRequest) -> bool {
        if self.remote_magic != 0 && header.magic != self.remote_magic {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Ignoring sync request from unknown endpoint ({} != {})",
                header.magic,
                self.remote_magic
            );
            return false;
        }
        let reply = SyncReply {
            random_reply: body.random_request,
            pong: body.ping,
        };
        self.queue_message(now, MessageBody::SyncReply(reply));
        true
    }

    /// Counts down the handshake on a reply to the outstanding request.
    fn on_sync_reply(&mut self, now: Instant, header: MessageHeader, body: SyncReply) -> bool {
        if self.state != ProtocolState::Syncing {
            trace!("Ignoring SyncReply while {}", self.state);
            return false;
        }
        if body.random_reply != self.sync_random_request {
            trace!(
                "Sync reply {} does not match request {}",
                body.random_reply,
                self.sync_random_request
            );
            return false;
        }

        if !self.connected {
            self.connected = true;
            self.event_queue.push_back(Event::Connected);
        }
        self.round_trip_time = self.millis_since_start(now).saturating_sub(body.pong);
        self.sync_retries = 0;
        self.sync_remaining_roundtrips = self.sync_remaining_roundtrips.saturating_sub(1);

        if self.sync_remaining_roundtrips > 0 {
            let total = self.sync_config.num_sync_packets;
            self.event_queue.push_back(Event::Synchronizing {
                total,
                count: total - self.sync_remaining_roundtrips,
            });
            self.send_sync_request(now);
        } else {
            debug!(
                "Synchronized with {:?} (magic {})",
                self.peer_addr, header.magic
            );
            self.state = ProtocolState::Running;
            self.event_queue.push_back(Event::Synchronized);
            // the remote endpoint is now "authorized"
            self.remote_magic = header.magic;
            self.running_last_quality_report = now;
            self.running_last_network_stats = now;
            self.running_last_input_recv = now;
        }
        true
    }

    fn on_input(&mut self, now: Instant, body: &Input) -> bool {
        if body.disconnect_requested {
            if self.state != ProtocolState::Disconnected && !self.disconnect_event_sent {
                debug!("Disconnecting {:?} on remote request", self.peer_addr);
                self.event_queue.push_back(Event::Disconnected);
                self.disconnect_event_sent = true;
            }
        } else {
            for (local, remote) in self
                .peer_connect_status
                .iter_mut()
                .zip(body.peer_connect_status.iter())
            {
                local.merge(remote);
            }
        }

        if body.num_bits > 0 {
            if usize::from(body.input_size) != self.last_received_input.size() {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "Peer {:?} sent {}-byte inputs, expected {}",
                    self.peer_addr,
                    body.input_size,
                    self.last_received_input.size()
                );
            } else {
                self.decode_inputs(now, body);
            }
        }

        self.pop_pending_output(body.ack_frame);
        true
    }

    /// Walks the encoded frames, skipping those already received and stopping at a gap.
    fn decode_inputs(&mut self, now: Instant, body: &Input) {
        if self.last_received_input.frame.is_null() {
            self.last_received_input.frame = body.start_frame - 1;
        }
        let last_received_frame = self.last_received_input.frame;

        let mut reader = BitReader::new(&body.bits, usize::from(body.num_bits));
        let mut current_frame = body.start_frame;
        while !reader.is_exhausted() {
            let next_frame = self.last_received_input.frame + 1;
            if current_frame > next_frame {
                trace!(
                    "Input from {:?} starts at frame {}, still waiting for {}",
                    self.peer_addr,
                    current_frame,
                    next_frame
                );
                break;
            }
            let use_inputs = current_frame == next_frame;

            let mut decoded = self.last_received_input;
            if let Err(err) = decode_frame(&mut reader, &mut decoded, use_inputs) {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::Encoding,
                    "Failed to decode input from {:?}: {}",
                    self.peer_addr,
                    err
                );
                break;
            }

            if use_inputs {
                decoded.frame = current_frame;
                self.last_received_input = decoded;
                self.running_last_input_recv = now;
                self.event_queue.push_back(Event::Input(decoded));
            } else {
                trace!(
                    "Skipping past frame {} (current is {})",
                    current_frame,
                    self.last_received_input.frame
                );
            }
            current_frame += 1;
        }

        if self.last_received_input.frame > last_received_frame {
            self.send_input_ack(now);
        }
    }

    fn on_input_ack(&mut self, body: InputAck) -> bool {
        self.pop_pending_output(body.ack_frame);
        true
    }

    fn on_quality_report(&mut self, now: Instant, body: QualityReport) -> bool {
        self.remote_frame_advantage = i32::from(body.frame_advantage);
        let reply = QualityReply { pong: body.ping };
        self.queue_message(now, MessageBody::QualityReply(reply));
        true
    }

    fn on_quality_reply(&mut self, now: Instant, body: QualityReply) -> bool {
        self.round_trip_time = self.millis_since_start(now).saturating_sub(body.pong);
        true
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::telemetry::{observe_thread, CollectingObserver};
    use std::net::SocketAddr;
    use std::sync::Arc;

    const MS: Duration = Duration::from_millis(1);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn protocol_with(
        seed: u64,
        sync_config: SyncConfig,
        protocol_config: ProtocolConfig,
        input_size: usize,
    ) -> UdpProtocol<SocketAddr> {
        UdpProtocol::new(
            vec![PlayerHandle::new(1)],
            addr(7000),
            2,
            input_size,
            1,
            ProtocolTimeouts::default(),
            sync_config,
            ProtocolConfig {
                protocol_rng_seed: Some(seed),
                ..protocol_config
            },
            TimeSyncConfig::default(),
        )
    }

    fn protocol(seed: u64) -> UdpProtocol<SocketAddr> {
        protocol_with(seed, SyncConfig::default(), ProtocolConfig::default(), 1)
    }

    fn sent(protocol: &mut UdpProtocol<SocketAddr>) -> Vec<Message> {
        protocol.send_queue.drain(..).collect()
    }

    fn deliver(
        from: &mut UdpProtocol<SocketAddr>,
        to: &mut UdpProtocol<SocketAddr>,
        now: Instant,
    ) -> usize {
        let messages = sent(from);
        for msg in &messages {
            to.handle_message_at(now, msg);
        }
        messages.len()
    }

    fn events(protocol: &mut UdpProtocol<SocketAddr>, now: Instant) -> Vec<Event> {
        protocol.poll_at(now, &[]).collect()
    }

    /// Runs the handshake to completion and clears queues and events on both sides.
    fn running_pair(now: Instant) -> (UdpProtocol<SocketAddr>, UdpProtocol<SocketAddr>) {
        let mut a = protocol(1);
        let mut b = protocol(2);
        a.synchronize_at(now);
        b.synchronize_at(now);
        for _ in 0..10 {
            deliver(&mut a, &mut b, now);
            deliver(&mut b, &mut a, now);
        }
        assert!(a.is_running());
        assert!(b.is_running());
        a.event_queue.clear();
        b.event_queue.clear();
        sent(&mut a);
        sent(&mut b);
        (a, b)
    }

    fn input(frame: i32, value: u8) -> GameInput {
        GameInput::new(Frame::new(frame), &[value]).unwrap()
    }

    #[test]
    fn test_new_protocol_is_syncing() {
        let protocol = protocol(1);
        assert_eq!(protocol.state(), ProtocolState::Syncing);
        assert!(!protocol.is_synchronized());
        assert_ne!(protocol.magic(), 0);
        assert_eq!(protocol.remote_magic(), 0);
        assert!(matches!(
            protocol.network_stats(),
            Err(RampartError::NotSynchronized)
        ));
    }

    #[test]
    fn test_seeded_protocols_are_reproducible() {
        assert_eq!(protocol(5).magic(), protocol(5).magic());
    }

    #[test]
    fn test_handshake_completes_after_configured_roundtrips() {
        let now = Instant::now();
        let mut a = protocol(1);
        let mut b = protocol(2);
        a.synchronize_at(now);
        b.synchronize_at(now);

        let mut a_events = Vec::new();
        let mut late_reply = None;
        for _ in 0..SyncConfig::default().num_sync_packets {
            deliver(&mut a, &mut b, now);
            let replies = sent(&mut b);
            for msg in &replies {
                if matches!(msg.body, MessageBody::SyncReply(_)) {
                    late_reply = Some(msg.clone());
                }
                a.handle_message_at(now, msg);
            }
            a_events.extend(events(&mut a, now));
        }

        assert!(a.is_running());
        assert_eq!(a.remote_magic(), b.magic());
        assert_eq!(a_events.first(), Some(&Event::Connected));
        assert_eq!(a_events.last(), Some(&Event::Synchronized));
        assert!(a_events.contains(&Event::Synchronizing { total: 5, count: 4 }));
        assert_eq!(
            a_events
                .iter()
                .filter(|e| matches!(e, Event::Synchronizing { .. }))
                .count(),
            4
        );

        // a reply arriving after completion is ignored
        let late_reply = late_reply.unwrap();
        let last_recv_time = a.last_recv_time;
        a.handle_message_at(now + 10 * MS, &late_reply);
        assert!(a.is_running());
        assert_eq!(a.last_recv_time, last_recv_time);
        assert!(events(&mut a, now + 10 * MS).is_empty());
    }

    #[test]
    fn test_reply_with_wrong_nonce_is_ignored() {
        let now = Instant::now();
        let mut a = protocol(1);
        a.synchronize_at(now);
        let msg = Message {
            header: MessageHeader {
                magic: 77,
                sequence: 0,
            },
            body: MessageBody::SyncReply(SyncReply {
                random_reply: a.sync_random_request.wrapping_add(1),
                pong: 0,
            }),
        };
        a.handle_message_at(now, &msg);
        assert_eq!(a.sync_remaining_roundtrips, 5);
        assert!(events(&mut a, now).is_empty());
    }

    #[test]
    fn test_sync_request_from_other_session_is_rejected() {
        let now = Instant::now();
        let (mut a, b) = running_pair(now);
        let msg = Message {
            header: MessageHeader {
                magic: b.magic().wrapping_add(1),
                sequence: 0,
            },
            body: MessageBody::SyncRequest(SyncRequest {
                random_request: 1,
                ping: 0,
            }),
        };
        a.handle_message_at(now, &msg);
        assert!(sent(&mut a).is_empty());
    }

    #[test]
    fn test_sync_retries_use_first_then_regular_interval() {
        let now = Instant::now();
        let mut a = protocol(1);
        a.synchronize_at(now);
        assert_eq!(sent(&mut a).len(), 1);

        events(&mut a, now + 499 * MS);
        assert!(sent(&mut a).is_empty());
        events(&mut a, now + 501 * MS);
        assert_eq!(sent(&mut a).len(), 1);

        // once the peer has answered, retries slow down
        a.sync_remaining_roundtrips -= 1;
        events(&mut a, now + 1500 * MS);
        assert!(sent(&mut a).is_empty());
        events(&mut a, now + 2502 * MS);
        assert_eq!(sent(&mut a).len(), 1);
    }

    #[test]
    fn test_sync_fails_after_max_retries() {
        let now = Instant::now();
        let mut a = protocol_with(
            1,
            SyncConfig {
                max_sync_retries: Some(2),
                ..SyncConfig::default()
            },
            ProtocolConfig::default(),
            1,
        );
        a.synchronize_at(now);
        assert!(events(&mut a, now + 501 * MS).is_empty());
        assert!(events(&mut a, now + 1002 * MS).is_empty());
        let failed = events(&mut a, now + 1503 * MS);
        assert_eq!(failed, vec![Event::SyncFailed, Event::Disconnected]);
        assert_eq!(a.state(), ProtocolState::Disconnected);
    }

    #[test]
    fn test_messages_before_handshake_are_dropped() {
        let now = Instant::now();
        let mut a = protocol(1);
        a.synchronize_at(now);
        a.pending_output.push_back(input(0, 1));
        let ack = Message {
            header: MessageHeader {
                magic: 9,
                sequence: 1,
            },
            body: MessageBody::InputAck(InputAck {
                ack_frame: Frame::new(0),
            }),
        };
        a.handle_message_at(now, &ack);
        assert_eq!(a.pending_output_len(), 1);
    }

    #[test]
    fn test_magic_mismatch_is_dropped() {
        let now = Instant::now();
        let (mut a, b) = running_pair(now);
        for frame in 0..3 {
            a.send_input_at(now, &input(frame, 1), &[]);
        }
        assert_eq!(a.pending_output_len(), 3);

        let mut ack = Message {
            header: MessageHeader {
                magic: b.magic().wrapping_add(1),
                sequence: a.next_recv_seq.wrapping_add(1),
            },
            body: MessageBody::InputAck(InputAck {
                ack_frame: Frame::new(2),
            }),
        };
        a.handle_message_at(now, &ack);
        assert_eq!(a.pending_output_len(), 3);

        ack.header.magic = b.magic();
        a.handle_message_at(now, &ack);
        assert_eq!(a.pending_output_len(), 0);
        assert_eq!(a.last_acked_input.frame, Frame::new(2));
    }

    #[test]
    fn test_stale_sequence_is_dropped() {
        let now = Instant::now();
        let (mut a, b) = running_pair(now);
        a.send_input_at(now, &input(0, 1), &[]);
        let expected = a.next_recv_seq;

        let stale = Message {
            header: MessageHeader {
                magic: b.magic(),
                sequence: expected.wrapping_sub(1),
            },
            body: MessageBody::InputAck(InputAck {
                ack_frame: Frame::new(0),
            }),
        };
        a.handle_message_at(now, &stale);
        assert_eq!(a.pending_output_len(), 1);
        assert_eq!(a.next_recv_seq, expected);

        // a forward gap is tolerated
        let ahead = Message {
            header: MessageHeader {
                magic: b.magic(),
                sequence: expected.wrapping_add(100),
            },
            ..stale
        };
        a.handle_message_at(now, &ahead);
        assert_eq!(a.pending_output_len(), 0);
        assert_eq!(a.next_recv_seq, expected.wrapping_add(100));
    }

    #[test]
    fn test_inputs_are_decoded_and_acknowledged() {
        let now = Instant::now();
        let (mut a, mut b) = running_pair(now);
        let connect_status = vec![ConnectionStatus::default(); 2];
        a.send_input_at(now, &input(0, 0b01), &connect_status);
        a.send_input_at(now, &input(1, 0b11), &connect_status);
        a.send_input_at(now, &input(2, 0b10), &connect_status);

        // every send carries the whole window; deliver them all, duplicates included
        deliver(&mut a, &mut b, now);
        let received: Vec<_> = events(&mut b, now)
            .into_iter()
            .filter_map(|e| match e {
                Event::Input(input) => Some((input.frame.as_i32(), input.bytes()[0])),
                _ => None,
            })
            .collect();
        assert_eq!(received, vec![(0, 0b01), (1, 0b11), (2, 0b10)]);
        assert_eq!(b.last_received_frame(), Frame::new(2));

        deliver(&mut b, &mut a, now);
        assert_eq!(a.pending_output_len(), 0);
        assert_eq!(a.last_acked_input.frame, Frame::new(2));

        // inputs after the ack are encoded against the acknowledged input
        a.send_input_at(now, &input(3, 0b10), &connect_status);
        deliver(&mut a, &mut b, now);
        let evts = events(&mut b, now);
        assert!(evts.contains(&Event::Input(input(3, 0b10))));
    }

    #[test]
    fn test_input_after_gap_is_not_delivered() {
        let now = Instant::now();
        let (mut a, mut b) = running_pair(now);
        a.send_input_at(now, &input(0, 1), &[]);
        deliver(&mut a, &mut b, now);
        events(&mut b, now);

        // frames 1 and 2 get lost; later frames arrive encoded against a newer baseline
        a.last_acked_input = input(2, 1);
        a.pending_output.clear();
        a.send_input_at(now, &input(3, 0), &[]);
        deliver(&mut a, &mut b, now);
        assert!(events(&mut b, now)
            .iter()
            .all(|e| !matches!(e, Event::Input(_))));
        assert_eq!(b.last_received_frame(), Frame::new(0));
    }

    #[test]
    fn test_skipped_frames_are_padded_with_previous_input() {
        let now = Instant::now();
        let (mut a, mut b) = running_pair(now);
        a.send_input_at(now, &input(0, 1), &[]);
        a.send_input_at(now, &input(1, 3), &[]);
        deliver(&mut a, &mut b, now);
        deliver(&mut b, &mut a, now);
        events(&mut b, now);
        assert_eq!(a.pending_output_len(), 0);

        // delay raised by two: the next stored frame is 4
        let observer = Arc::new(CollectingObserver::new());
        let _guard = observe_thread(observer.clone());
        a.send_input_at(now, &input(4, 2), &[]);
        assert!(observer.is_empty());
        assert_eq!(a.pending_output_len(), 3);
        deliver(&mut a, &mut b, now);
        let received: Vec<_> = events(&mut b, now)
            .into_iter()
            .filter_map(|e| match e {
                Event::Input(input) => Some((input.frame.as_i32(), input.bytes()[0])),
                _ => None,
            })
            .collect();
        assert_eq!(received, vec![(2, 3), (3, 3), (4, 2)]);

        // the stream keeps flowing afterwards
        a.send_input_at(now, &input(5, 0), &[]);
        deliver(&mut a, &mut b, now);
        assert!(events(&mut b, now).contains(&Event::Input(input(5, 0))));
        assert_eq!(b.last_received_frame(), Frame::new(5));
    }

    #[test]
    fn test_peer_connect_status_is_merged() {
        let now = Instant::now();
        let (mut a, mut b) = running_pair(now);
        let status = vec![
            ConnectionStatus {
                disconnected: false,
                last_frame: Frame::new(4),
            },
            ConnectionStatus {
                disconnected: true,
                last_frame: Frame::new(2),
            },
        ];
        a.send_input_at(now, &input(0, 1), &status);
        deliver(&mut a, &mut b, now);
        assert_eq!(
            b.peer_connect_status(PlayerHandle::new(0)).last_frame,
            Frame::new(4)
        );
        assert!(b.peer_connect_status(PlayerHandle::new(1)).disconnected);
        assert_eq!(
            b.peer_connect_status(PlayerHandle::new(9)),
            ConnectionStatus::default()
        );
    }

    #[test]
    fn test_disconnect_request_emits_event_once() {
        let now = Instant::now();
        let (mut a, mut b) = running_pair(now);
        a.disconnect_at(now);
        assert_eq!(a.state(), ProtocolState::Disconnected);
        let msgs = sent(&mut a);
        assert!(matches!(
            &msgs[0].body,
            MessageBody::Input(body) if body.disconnect_requested
        ));
        b.handle_message_at(now, &msgs[0]);
        b.handle_message_at(now, &msgs[0]);
        let evts = events(&mut b, now);
        assert_eq!(
            evts.iter().filter(|e| **e == Event::Disconnected).count(),
            1
        );
    }

    #[test]
    fn test_interrupt_resume_and_timeout() {
        let now = Instant::now();
        let (mut a, b) = running_pair(now);

        let interrupted = events(&mut a, now + 800 * MS);
        assert!(interrupted.contains(&Event::NetworkInterrupted {
            disconnect_timeout: 4250
        }));

        let keepalive = Message {
            header: MessageHeader {
                magic: b.magic(),
                sequence: a.next_recv_seq.wrapping_add(1),
            },
            body: MessageBody::KeepAlive,
        };
        a.handle_message_at(now + 900 * MS, &keepalive);
        assert_eq!(events(&mut a, now + 900 * MS), vec![Event::NetworkResumed]);

        let timed_out = events(&mut a, now + 5902 * MS);
        assert!(timed_out.contains(&Event::Disconnected));
        assert_eq!(a.state(), ProtocolState::Disconnected);
        assert!(a.is_synchronized());
    }

    #[test]
    fn test_running_timers_queue_messages() {
        let now = Instant::now();
        let (mut a, _) = running_pair(now);
        events(&mut a, now + 201 * MS);
        let kinds: Vec<_> = sent(&mut a)
            .iter()
            .map(|m| m.body.message_type())
            .collect();
        // input resend, keepalive suppressed by the resend
        assert!(kinds.contains(&crate::network::messages::MessageType::Input));
        assert!(!kinds.contains(&crate::network::messages::MessageType::KeepAlive));

        events(&mut a, now + 1002 * MS);
        let kinds: Vec<_> = sent(&mut a)
            .iter()
            .map(|m| m.body.message_type())
            .collect();
        assert!(kinds.contains(&crate::network::messages::MessageType::QualityReport));
    }

    #[test]
    fn test_quality_report_measures_round_trip() {
        let now = Instant::now();
        let (mut a, mut b) = running_pair(now);
        a.local_frame_advantage = 3;
        a.send_quality_report(now + 1000 * MS);
        deliver(&mut a, &mut b, now + 1010 * MS);
        assert_eq!(b.remote_frame_advantage, 3);
        deliver(&mut b, &mut a, now + 1040 * MS);
        assert_eq!(a.round_trip_time, 40);
        assert_eq!(a.network_stats().unwrap().ping, 40);
    }

    #[test]
    fn test_frame_advantage_estimate() {
        let now = Instant::now();
        let (mut a, _) = running_pair(now);
        a.round_trip_time = 100;
        a.last_received_input.frame = Frame::new(10);
        a.update_local_frame_advantage(Frame::new(12));
        assert_eq!(a.local_frame_advantage, 4);

        a.update_local_frame_advantage(Frame::NULL);
        assert_eq!(a.local_frame_advantage, 4);
    }

    #[test]
    fn test_pending_output_limit_disconnects() {
        let now = Instant::now();
        let mut a = protocol_with(
            1,
            SyncConfig::default(),
            ProtocolConfig {
                pending_output_limit: 3,
                ..ProtocolConfig::default()
            },
            1,
        );
        a.state = ProtocolState::Running;
        for frame in 0..4 {
            a.send_input_at(now, &input(frame, 0), &[]);
        }
        assert_eq!(events(&mut a, now), vec![Event::Disconnected]);
        assert_eq!(a.state(), ProtocolState::Disconnected);
    }

    #[test]
    fn test_oversized_window_sends_prefix() {
        let now = Instant::now();
        let mut a = UdpProtocol::new(
            vec![PlayerHandle::new(3)],
            addr(7000),
            4,
            8,
            4,
            ProtocolTimeouts::default(),
            SyncConfig::default(),
            ProtocolConfig::deterministic(1),
            TimeSyncConfig::default(),
        );
        a.state = ProtocolState::Running;
        let ones = [0xFF; 32];
        let zeros = [0x00; 32];
        a.send_input_at(now, &GameInput::new(Frame::new(0), &ones).unwrap(), &[]);
        a.send_input_at(now, &GameInput::new(Frame::new(1), &zeros).unwrap(), &[]);

        let last = sent(&mut a).pop().unwrap();
        let MessageBody::Input(body) = last.body else {
            panic!("expected input message");
        };
        // one full frame of 256 changed bits plus its terminator
        assert_eq!(usize::from(body.num_bits), 256 * 10 + 1);
        assert_eq!(body.start_frame, Frame::new(0));
        assert_eq!(a.pending_output_len(), 2);
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let now = Instant::now();
        let (mut a, _) = running_pair(now);
        a.send_input_at(now, &input(0, 0), &[]);
        a.send_input_at(now, &input(1, 0), &[]);
        let msgs = sent(&mut a);
        assert_eq!(
            msgs[1].header.sequence,
            msgs[0].header.sequence.wrapping_add(1)
        );
        assert!(msgs.iter().all(|m| m.header.magic == a.magic()));
    }
}
