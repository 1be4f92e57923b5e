use std::collections::vec_deque::Drain;
use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, trace};

use crate::checksum::StateChecksum;
use crate::frame_info::GameInput;
use crate::network::messages::ConnectionStatus;
use crate::network::network_stats::NetworkStats;
use crate::network::protocol::{Event, ProtocolTimeouts, UdpProtocol};
use crate::report_violation;
use crate::sessions::config::SessionConfig;
use crate::sync_layer::SyncLayer;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{
    Address, Frame, NonBlockingSocket, PlayerHandle, PlayerType, RampartError, RampartEvent,
    SessionCallbacks, SessionState,
};

/// Maximum number of events to queue before oldest are dropped.
///
/// Events also reach [`SessionCallbacks::on_event`] as they happen, so the queue only bounds
/// memory for applications that never call [`P2PSession::events`].
const MAX_EVENT_QUEUE_SIZE: usize = 100;

/// A [`P2PSession`] connects a fixed table of local and remote players, exchanges their inputs
/// and drives the game through [`SessionCallbacks`], rolling back whenever a prediction turns
/// out wrong.
///
/// One [`UdpProtocol`] is created per distinct remote address; a peer may own several player
/// handles.
///
/// # Frame Loop
///
/// ```text
/// every frame:
///   add_local_input(h, bytes)   for every local handle
///   advance_frame(&mut game)    poll peers, roll back if needed, simulate one frame
/// ```
///
/// Local inputs are staged by [`add_local_input`](Self::add_local_input) and handed to the
/// frame synchronizer at the start of [`advance_frame`](Self::advance_frame), where the
/// callbacks needed for the initial snapshot are available. Once every local player's input
/// for a frame is in, the inputs are concatenated in handle order and sent to every peer.
pub struct P2PSession<A: Address> {
    config: SessionConfig,
    sync_layer: SyncLayer,
    state: SessionState,

    socket: Box<dyn NonBlockingSocket<A>>,
    /// Player table, indexed by handle.
    players: Vec<PlayerType<A>>,
    /// One endpoint per remote address.
    endpoints: Vec<UdpProtocol<A>>,
    local_connect_status: Vec<ConnectionStatus>,

    /// Inputs for the current frame, not yet in the sync layer.
    staged_inputs: BTreeMap<PlayerHandle, GameInput>,
    /// The soonest frame on which a [`RampartEvent::WaitRecommendation`] may be issued again.
    next_recommended_sleep: Frame,
    event_queue: VecDeque<RampartEvent<A>>,
}

impl<A: Address> std::fmt::Debug for P2PSession<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2PSession")
            .field("state", &self.state)
            .field("players", &self.players)
            .field("sync_layer", &self.sync_layer)
            .field("endpoints", &self.endpoints.len())
            .field("local_connect_status", &self.local_connect_status)
            .finish_non_exhaustive()
    }
}

impl<A: Address> P2PSession<A> {
    /// Creates a session for `players`, indexed by handle, and starts the handshake with every
    /// remote peer. A session without remote players is running immediately.
    ///
    /// # Errors
    /// - [`RampartError::InvalidRequest`] if `config` does not validate or the player table
    ///   does not have `config.num_players` entries.
    pub fn new(
        config: SessionConfig,
        players: Vec<PlayerType<A>>,
        socket: impl NonBlockingSocket<A> + 'static,
        checksum: Box<dyn StateChecksum>,
    ) -> Result<Self, RampartError> {
        config.validate()?;
        if players.len() != config.num_players {
            return Err(RampartError::InvalidRequest {
                info: format!(
                    "expected {} players, got {}",
                    config.num_players,
                    players.len()
                ),
            });
        }

        let mut sync_layer = SyncLayer::with_options(
            config.num_players,
            config.input_size,
            config.max_prediction,
            config.input_queue.queue_length,
            checksum,
        )?;

        // group remote handles by address
        let mut remotes: Vec<(A, Vec<PlayerHandle>)> = Vec::new();
        let mut local_players = 0;
        for (index, player) in players.iter().enumerate() {
            let handle = PlayerHandle::new(index);
            match player {
                PlayerType::Local => {
                    local_players += 1;
                    sync_layer.set_frame_delay(handle, config.input_delay)?;
                },
                PlayerType::Remote(addr) => match remotes.iter_mut().find(|(a, _)| a == addr) {
                    Some((_, handles)) => handles.push(handle),
                    None => remotes.push((addr.clone(), vec![handle])),
                },
            }
        }

        let timeouts = ProtocolTimeouts {
            disconnect_timeout: config.disconnect_timeout,
            disconnect_notify_start: config.disconnect_notify_start,
        };
        let endpoints: Vec<UdpProtocol<A>> = remotes
            .into_iter()
            .enumerate()
            .map(|(i, (addr, handles))| {
                let mut protocol_config = config.protocol;
                // distinct magic numbers per peer, even when seeded
                protocol_config.protocol_rng_seed = protocol_config
                    .protocol_rng_seed
                    .map(|seed| seed.wrapping_add(i as u64));
                let mut endpoint = UdpProtocol::new(
                    handles,
                    addr,
                    config.num_players,
                    config.input_size,
                    local_players,
                    timeouts,
                    config.sync,
                    protocol_config,
                    config.time_sync,
                );
                endpoint.synchronize();
                endpoint
            })
            .collect();

        // if there are no endpoints, we don't need a synchronization phase
        let state = if endpoints.is_empty() {
            SessionState::Running
        } else {
            SessionState::Synchronizing
        };
        debug!(
            num_players = config.num_players,
            local_players,
            remotes = endpoints.len(),
            "created P2P session"
        );

        Ok(Self {
            local_connect_status: vec![ConnectionStatus::default(); config.num_players],
            config,
            sync_layer,
            state,
            socket: Box::new(socket),
            players,
            endpoints,
            staged_inputs: BTreeMap::new(),
            next_recommended_sleep: Frame::new(0),
            event_queue: VecDeque::new(),
        })
    }

    /// Stages a local player's input for the current frame. Calling this twice for the same
    /// player before [`advance_frame`](Self::advance_frame) replaces the earlier input.
    ///
    /// # Errors
    /// - [`RampartError::InRollback`] while frames are being replayed.
    /// - [`RampartError::NotSynchronized`] before every peer finished the handshake.
    /// - [`RampartError::InvalidPlayerHandle`] or [`RampartError::InvalidRequest`] if the handle
    ///   is not a local player, or `input` is not `input_size` bytes long.
    /// - [`RampartError::PredictionThreshold`] if the simulation is already `max_prediction`
    ///   frames ahead of the last confirmed frame. Skip this frame and try again.
    pub fn add_local_input(
        &mut self,
        player_handle: PlayerHandle,
        input: &[u8],
    ) -> Result<(), RampartError> {
        if self.sync_layer.in_rollback() {
            return Err(RampartError::InRollback);
        }
        if self.state != SessionState::Running {
            return Err(RampartError::NotSynchronized);
        }
        match self.players.get(player_handle.as_usize()) {
            None => return Err(self.invalid_handle(player_handle)),
            Some(PlayerType::Remote(_)) => {
                return Err(RampartError::InvalidRequest {
                    info: format!("player {} is not a local player", player_handle),
                });
            },
            Some(PlayerType::Local) => {},
        }
        if input.len() != self.config.input_size {
            return Err(RampartError::InvalidRequest {
                info: format!(
                    "input is {} bytes, the session expects {}",
                    input.len(),
                    self.config.input_size
                ),
            });
        }
        self.sync_layer.check_prediction_threshold()?;

        let current_frame = self.sync_layer.current_frame();
        let game_input =
            GameInput::new(current_frame, input).ok_or_else(|| RampartError::InvalidRequest {
                info: format!("input of {} bytes does not fit", input.len()),
            })?;
        self.staged_inputs.insert(player_handle, game_input);
        Ok(())
    }

    /// Advances the session by one frame.
    ///
    /// Polls the peers, rolls back if a prediction was wrong, hands the staged local inputs to
    /// the frame synchronizer and peers, then asks the application to simulate one frame and
    /// saves the result.
    ///
    /// # Errors
    /// - [`RampartError::NotSynchronized`] if the session is still synchronizing.
    /// - [`RampartError::InvalidRequest`] if a local player has no staged input.
    /// - [`RampartError::PredictionThreshold`] if the simulation cannot run further ahead.
    pub fn advance_frame<C>(&mut self, callbacks: &mut C) -> Result<(), RampartError>
    where
        C: SessionCallbacks<A> + ?Sized,
    {
        self.poll_remote_clients(callbacks)?;

        if self.state != SessionState::Running {
            trace!("Session not synchronized; returning error");
            return Err(RampartError::NotSynchronized);
        }

        for handle in self.local_player_handles() {
            if !self.staged_inputs.contains_key(&handle) {
                return Err(RampartError::InvalidRequest {
                    info: format!(
                        "Missing local input for handle {} while calling advance_frame().",
                        handle
                    ),
                });
            }
        }

        // fix any misprediction before new inputs go in
        self.sync_layer
            .check_simulation(callbacks, &self.local_connect_status)?;
        self.sync_layer.check_prediction_threshold()?;

        /*
         *  LOCAL INPUTS
         */

        let staged = std::mem::take(&mut self.staged_inputs);
        let mut outgoing: Option<GameInput> = None;
        let mut dropped = false;
        for (handle, input) in staged {
            let stored = self.sync_layer.add_local_input(handle, input, callbacks)?;
            if stored.is_null() {
                dropped = true;
                continue;
            }
            if let Some(status) = self.local_connect_status.get_mut(handle.as_usize()) {
                status.last_frame = stored;
            }
            match outgoing.as_mut() {
                Some(combined) => {
                    // peers split the packet per handle, so all local players share one frame
                    if combined.frame != stored || !combined.append(input.bytes()) {
                        report_violation!(
                            ViolationSeverity::Error,
                            ViolationKind::InputQueue,
                            "Local inputs for frame {} cannot be combined (player {} at {})",
                            combined.frame,
                            handle,
                            stored
                        );
                        dropped = true;
                    }
                },
                None => {
                    let mut first = input;
                    first.frame = stored;
                    outgoing = Some(first);
                },
            }
        }

        // send the frame's inputs once, with every local player in it
        if let (Some(combined), false) = (outgoing, dropped) {
            for endpoint in &mut self.endpoints {
                endpoint.send_input(&combined, &self.local_connect_status);
                endpoint.send_all_messages(self.socket.as_mut());
            }
        }

        /*
         *  ADVANCE THE STATE
         */

        let inputs = self
            .sync_layer
            .synchronized_inputs(&self.local_connect_status)?;
        callbacks.advance_frame(&inputs);
        self.sync_layer.increment_frame(callbacks)?;
        trace!(frame = %self.sync_layer.current_frame(), "advanced frame");
        crate::debug_check_invariants!(self, "advance_frame");
        Ok(())
    }

    /// Receives packets, runs every peer's timers, handles the resulting events and sends all
    /// queued packets. [`advance_frame`](Self::advance_frame) calls this; call it yourself while
    /// waiting (during synchronization or after a [`RampartEvent::WaitRecommendation`]).
    pub fn poll_remote_clients<C>(&mut self, callbacks: &mut C) -> Result<(), RampartError>
    where
        C: SessionCallbacks<A> + ?Sized,
    {
        // route packets to the endpoint of their sender
        for (from_addr, msg) in self.socket.receive_all_messages() {
            match self
                .endpoints
                .iter_mut()
                .find(|endpoint| endpoint.is_handling_message(&from_addr))
            {
                Some(endpoint) => endpoint.handle_message(&msg),
                None => trace!(addr = ?from_addr, "dropping message from unknown address"),
            }
        }

        // update frame information between remote players
        let current_frame = self.sync_layer.current_frame();
        for endpoint in &mut self.endpoints {
            if endpoint.is_running() {
                endpoint.update_local_frame_advantage(current_frame);
            }
        }

        // poll every endpoint; this may queue more packets
        let mut events = Vec::new();
        for endpoint in &mut self.endpoints {
            let handles = endpoint.handles().to_vec();
            let addr = endpoint.peer_addr();
            for event in endpoint.poll(&self.local_connect_status) {
                events.push((event, handles.clone(), addr.clone()));
            }
        }
        for (event, handles, addr) in events {
            self.handle_event(event, &handles, addr, callbacks)?;
        }

        if self.state == SessionState::Running {
            self.update_player_disconnects(callbacks)?;
            let confirmed_frame = self.confirmed_frame();
            if confirmed_frame.is_valid() {
                self.sync_layer.set_last_confirmed_frame(confirmed_frame);
            }
            self.check_wait_recommendation(callbacks);
        }

        for endpoint in &mut self.endpoints {
            endpoint.send_all_messages(self.socket.as_mut());
        }
        Ok(())
    }

    /// Disconnects a player.
    ///
    /// A remote player is disconnected together with every other player behind the same
    /// address, and the simulation is corrected from the frame after their last input.
    /// Disconnecting a local player leaves the session: every remote peer is disconnected.
    ///
    /// # Errors
    /// - [`RampartError::InvalidPlayerHandle`] for an unknown handle.
    /// - [`RampartError::InvalidRequest`] if the remote player is already disconnected.
    pub fn disconnect_player<C>(
        &mut self,
        player_handle: PlayerHandle,
        callbacks: &mut C,
    ) -> Result<(), RampartError>
    where
        C: SessionCallbacks<A> + ?Sized,
    {
        match self.players.get(player_handle.as_usize()) {
            None => Err(self.invalid_handle(player_handle)),
            Some(PlayerType::Local) => {
                debug!(handle = %player_handle, "local player left the session");
                let remote_handles: Vec<PlayerHandle> = self
                    .endpoints
                    .iter()
                    .flat_map(|endpoint| endpoint.handles().iter().copied())
                    .collect();
                for handle in remote_handles {
                    let status = self.connect_status(handle);
                    if !status.disconnected {
                        self.disconnect_player_at_frame(handle, status.last_frame, callbacks)?;
                    }
                }
                Ok(())
            },
            Some(PlayerType::Remote(_)) => {
                let status = self.connect_status(player_handle);
                if status.disconnected {
                    return Err(RampartError::InvalidRequest {
                        info: "Player already disconnected.".to_owned(),
                    });
                }
                self.disconnect_player_at_frame(player_handle, status.last_frame, callbacks)
            },
        }
    }

    /// Changes a local player's input delay.
    ///
    /// # Errors
    /// - [`RampartError::InvalidRequest`] if the handle is not local or the delay does not fit
    ///   into the input queue.
    pub fn set_frame_delay(
        &mut self,
        player_handle: PlayerHandle,
        delay: usize,
    ) -> Result<(), RampartError> {
        match self.players.get(player_handle.as_usize()) {
            None => Err(self.invalid_handle(player_handle)),
            Some(PlayerType::Remote(_)) => Err(RampartError::InvalidRequest {
                info: "Frame delay can only be set for local players.".to_owned(),
            }),
            Some(PlayerType::Local) => {
                self.config.input_queue.validate_frame_delay(delay)?;
                self.sync_layer.set_frame_delay(player_handle, delay)
            },
        }
    }

    /// Connection quality towards the peer that owns `player_handle`.
    ///
    /// # Errors
    /// - [`RampartError::InvalidRequest`] if the handle refers to a local player.
    /// - [`RampartError::NotSynchronized`] while the peer is still synchronizing.
    pub fn network_stats(&self, player_handle: PlayerHandle) -> Result<NetworkStats, RampartError> {
        match self.players.get(player_handle.as_usize()) {
            None => Err(self.invalid_handle(player_handle)),
            Some(PlayerType::Local) => Err(RampartError::InvalidRequest {
                info: "Network stats are only available for remote players.".to_owned(),
            }),
            Some(PlayerType::Remote(addr)) => self
                .endpoints
                .iter()
                .find(|endpoint| endpoint.is_handling_message(addr))
                .ok_or_else(|| RampartError::InternalError {
                    context: format!("no endpoint for player {}", player_handle),
                })?
                .network_stats(),
        }
    }

    /// [`SessionState::Running`] once every peer finished the handshake.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// The frame the next [`advance_frame`](Self::advance_frame) will simulate.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.sync_layer.current_frame()
    }

    /// The highest frame for which every connected player's input is known.
    #[must_use]
    pub fn confirmed_frame(&self) -> Frame {
        let confirmed = self
            .local_connect_status
            .iter()
            .filter(|status| !status.disconnected)
            .map(|status| status.last_frame)
            .min();
        // with everyone gone, nothing can be mispredicted any more
        confirmed.unwrap_or_else(|| self.sync_layer.current_frame())
    }

    /// True while the session is replaying frames.
    #[must_use]
    pub fn in_rollback(&self) -> bool {
        self.sync_layer.in_rollback()
    }

    /// Drains the buffered session events.
    pub fn events(&mut self) -> Drain<'_, RampartEvent<A>> {
        self.event_queue.drain(..)
    }

    /// Number of players in the session, local and remote.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.players.len()
    }

    /// How many frames the session may run ahead of the last confirmed frame.
    #[must_use]
    pub fn max_prediction(&self) -> usize {
        self.sync_layer.max_prediction()
    }

    /// Handles of the players on this device.
    #[must_use]
    pub fn local_player_handles(&self) -> Vec<PlayerHandle> {
        self.players
            .iter()
            .enumerate()
            .filter(|(_, player)| matches!(player, PlayerType::Local))
            .map(|(i, _)| PlayerHandle::new(i))
            .collect()
    }

    /// Checksum of the state saved at `frame`, while it is inside the rollback window.
    #[must_use]
    pub fn saved_checksum(&self, frame: Frame) -> Option<u32> {
        self.sync_layer.saved_checksum(frame)
    }

    /*
     *  INTERNALS
     */

    fn invalid_handle(&self, handle: PlayerHandle) -> RampartError {
        RampartError::InvalidPlayerHandle {
            handle,
            max_handle: PlayerHandle::new(self.players.len().saturating_sub(1)),
        }
    }

    fn connect_status(&self, handle: PlayerHandle) -> ConnectionStatus {
        self.local_connect_status
            .get(handle.as_usize())
            .copied()
            .unwrap_or_default()
    }

    fn push_event<C>(&mut self, event: RampartEvent<A>, callbacks: &mut C)
    where
        C: SessionCallbacks<A> + ?Sized,
    {
        callbacks.on_event(event.clone());
        self.event_queue.push_back(event);
        // check event queue size and discard oldest events if too big
        while self.event_queue.len() > MAX_EVENT_QUEUE_SIZE {
            self.event_queue.pop_front();
        }
    }

    /// Marks the peer behind `player_handle` as gone after `last_frame` and corrects the
    /// simulation if frames past it were already simulated with predicted inputs.
    fn disconnect_player_at_frame<C>(
        &mut self,
        player_handle: PlayerHandle,
        last_frame: Frame,
        callbacks: &mut C,
    ) -> Result<(), RampartError>
    where
        C: SessionCallbacks<A> + ?Sized,
    {
        let Some(PlayerType::Remote(addr)) = self.players.get(player_handle.as_usize()) else {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::InternalError,
                "Player {} is not remote in disconnect_player_at_frame - ignoring",
                player_handle
            );
            return Ok(());
        };
        let Some(endpoint) = self
            .endpoints
            .iter_mut()
            .find(|endpoint| endpoint.is_handling_message(addr))
        else {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::InternalError,
                "No endpoint found for player {} in disconnect_player_at_frame - ignoring",
                player_handle
            );
            return Ok(());
        };

        // mark the affected players as disconnected
        for &handle in endpoint.handles() {
            if let Some(status) = self.local_connect_status.get_mut(handle.as_usize()) {
                status.disconnected = true;
            }
        }
        endpoint.disconnect();
        debug!(handle = %player_handle, %last_frame, "disconnected player");

        // frames after `last_frame` were simulated with predictions; replay them with the
        // disconnected flag set
        let sync_to = last_frame.next();
        if self.sync_layer.current_frame() > sync_to {
            let first_incorrect = self.sync_layer.first_incorrect_frame();
            let seek_to = if !first_incorrect.is_null() && first_incorrect < sync_to {
                first_incorrect
            } else {
                sync_to
            };
            self.sync_layer
                .adjust_simulation(seek_to, callbacks, &self.local_connect_status)?;
        }

        // check if all remotes are synchronized now
        self.check_initial_sync();
        Ok(())
    }

    /// Change the session state to [`SessionState::Running`] if all endpoints are synchronized.
    fn check_initial_sync(&mut self) {
        if self.state != SessionState::Synchronizing {
            return;
        }
        if self.endpoints.iter().all(UdpProtocol::is_synchronized) {
            debug!("all peers synchronized; session running");
            self.state = SessionState::Running;
        }
    }

    /// Adopts disconnects that other peers have seen before we did.
    fn update_player_disconnects<C>(&mut self, callbacks: &mut C) -> Result<(), RampartError>
    where
        C: SessionCallbacks<A> + ?Sized,
    {
        for handle_idx in 0..self.players.len() {
            let handle = PlayerHandle::new(handle_idx);
            let mut queue_connected = true;
            let mut queue_min_confirmed = Frame::new(i32::MAX);

            for endpoint in self.endpoints.iter().filter(|e| e.is_running()) {
                let status = endpoint.peer_connect_status(handle);
                queue_connected &= !status.disconnected;
                queue_min_confirmed = std::cmp::min(queue_min_confirmed, status.last_frame);
            }

            let local = self.connect_status(handle);
            if !local.disconnected {
                queue_min_confirmed = std::cmp::min(queue_min_confirmed, local.last_frame);
            }

            if !queue_connected && !local.disconnected {
                debug!(handle = %handle, frame = %queue_min_confirmed, "peer reported disconnect");
                self.disconnect_player_at_frame(handle, queue_min_confirmed, callbacks)?;
            }
        }
        Ok(())
    }

    fn check_wait_recommendation<C>(&mut self, callbacks: &mut C)
    where
        C: SessionCallbacks<A> + ?Sized,
    {
        let current_frame = self.sync_layer.current_frame();
        if current_frame <= self.next_recommended_sleep {
            return;
        }
        let require_idle_input = self.config.require_idle_input;
        let skip_frames = self
            .endpoints
            .iter_mut()
            .filter(|endpoint| endpoint.is_running())
            .map(|endpoint| endpoint.recommend_frame_delay(require_idle_input))
            .max()
            .unwrap_or(0);
        if skip_frames > 0 {
            debug!(skip_frames, frame = %current_frame, "recommending a wait");
            self.next_recommended_sleep =
                current_frame + self.config.recommendation_interval as i32;
            self.push_event(RampartEvent::WaitRecommendation { skip_frames }, callbacks);
        }
    }

    fn handle_event<C>(
        &mut self,
        event: Event,
        handles: &[PlayerHandle],
        addr: A,
        callbacks: &mut C,
    ) -> Result<(), RampartError>
    where
        C: SessionCallbacks<A> + ?Sized,
    {
        match event {
            Event::Connected => self.push_event(RampartEvent::Connected { addr }, callbacks),
            Event::Synchronizing { total, count } => {
                self.push_event(RampartEvent::Synchronizing { addr, total, count }, callbacks);
            },
            // check if all remotes are synced, then forward to user
            Event::Synchronized => {
                self.check_initial_sync();
                self.push_event(RampartEvent::Synchronized { addr }, callbacks);
            },
            Event::NetworkInterrupted { disconnect_timeout } => {
                self.push_event(
                    RampartEvent::NetworkInterrupted {
                        addr,
                        disconnect_timeout,
                    },
                    callbacks,
                );
            },
            Event::NetworkResumed => {
                self.push_event(RampartEvent::NetworkResumed { addr }, callbacks);
            },
            // disconnect the players, then forward to user
            Event::Disconnected | Event::SyncFailed => {
                for &handle in handles {
                    let status = self.connect_status(handle);
                    if !status.disconnected {
                        self.disconnect_player_at_frame(handle, status.last_frame, callbacks)?;
                    }
                }
                // a peer that never synced no longer holds up the others
                self.check_initial_sync();
                let forwarded = if event == Event::SyncFailed {
                    RampartEvent::SyncFailed { addr }
                } else {
                    RampartEvent::Disconnected { addr }
                };
                self.push_event(forwarded, callbacks);
            },
            Event::Input(input) => self.add_remote_inputs(&input, handles)?,
        }
        Ok(())
    }

    /// Splits a peer's concatenated input into per-player inputs and queues them.
    fn add_remote_inputs(
        &mut self,
        input: &GameInput,
        handles: &[PlayerHandle],
    ) -> Result<(), RampartError> {
        let input_size = self.config.input_size;
        for (i, &handle) in handles.iter().enumerate() {
            let Some(player_input) = input.chunk(i, input_size) else {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "Input of {} bytes has no slot for player {}",
                    input.size(),
                    handle
                );
                continue;
            };
            let Some(status) = self.local_connect_status.get_mut(handle.as_usize()) else {
                continue;
            };
            if status.disconnected {
                continue;
            }
            // check if the input comes in the correct sequence
            if !status.last_frame.is_null() && status.last_frame.next() != input.frame {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "Input sequence violation for player {}: expected frame {}, got {}",
                    handle,
                    status.last_frame.next(),
                    input.frame
                );
                continue;
            }
            status.last_frame = input.frame;
            self.sync_layer.add_remote_input(handle, &player_input)?;
        }
        Ok(())
    }
}

impl<A: Address> InvariantChecker for P2PSession<A> {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.local_connect_status.len() != self.players.len() {
            return Err(InvariantViolation::new(
                "P2PSession",
                "local_connect_status length does not match the player table",
            )
            .with_details(format!(
                "local_connect_status.len()={}, players={}",
                self.local_connect_status.len(),
                self.players.len()
            )));
        }
        if self.event_queue.len() > MAX_EVENT_QUEUE_SIZE {
            return Err(InvariantViolation::new(
                "P2PSession",
                "event queue exceeds its bound",
            ));
        }
        self.sync_layer.check_invariants()
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
    use crate::checksum::Fletcher32;
    use crate::network::messages::Message;
    use crate::{InputStatus, InputVec};

    #[derive(Default)]
    struct NullSocket;

    impl NonBlockingSocket<u16> for NullSocket {
        fn send_to(&mut self, _msg: &Message, _addr: &u16) {}

        fn receive_all_messages(&mut self) -> Vec<(u16, Message)> {
            Vec::new()
        }
    }

    #[derive(Default)]
    struct Counter {
        frames: Vec<InputVec>,
        value: u32,
        events: Vec<RampartEvent<u16>>,
    }

    impl SessionCallbacks<u16> for Counter {
        fn save_game_state(&mut self, _frame: Frame) -> Vec<u8> {
            self.value.to_le_bytes().to_vec()
        }

        fn load_game_state(&mut self, _frame: Frame, state: &[u8]) {
            self.value = u32::from_le_bytes(state.try_into().unwrap());
        }

        fn advance_frame(&mut self, inputs: &InputVec) {
            for (input, _) in inputs {
                self.value += u32::from(input.bytes()[0]);
            }
            self.frames.push(inputs.clone());
        }

        fn on_event(&mut self, event: RampartEvent<u16>) {
            self.events.push(event);
        }
    }

    fn session(players: Vec<PlayerType<u16>>) -> P2PSession<u16> {
        let mut config = SessionConfig::new(players.len(), 1);
        config.protocol.protocol_rng_seed = Some(1);
        P2PSession::new(config, players, NullSocket, Box::new(Fletcher32)).unwrap()
    }

    #[test]
    fn rejects_player_table_of_wrong_size() {
        let config = SessionConfig::new(2, 1);
        let result = P2PSession::new(config, vec![PlayerType::Local], NullSocket, Box::new(Fletcher32));
        assert!(matches!(result, Err(RampartError::InvalidRequest { .. })));
    }

    #[test]
    fn local_only_session_starts_running() {
        let session = session(vec![PlayerType::Local, PlayerType::Local]);
        assert_eq!(session.current_state(), SessionState::Running);
        assert_eq!(session.current_frame(), Frame::new(0));
        assert_eq!(session.confirmed_frame(), Frame::NULL);
        assert_eq!(session.local_player_handles().len(), 2);
    }

    #[test]
    fn session_with_remote_starts_synchronizing() {
        let mut session = session(vec![PlayerType::Local, PlayerType::Remote(9)]);
        assert_eq!(session.current_state(), SessionState::Synchronizing);
        assert_eq!(
            session.add_local_input(PlayerHandle::new(0), &[1]),
            Err(RampartError::NotSynchronized)
        );
        let mut game = Counter::default();
        assert_eq!(
            session.advance_frame(&mut game),
            Err(RampartError::NotSynchronized)
        );
    }

    #[test]
    fn add_local_input_validates_handle_and_size() {
        let mut session = session(vec![PlayerType::Local, PlayerType::Local]);
        assert!(matches!(
            session.add_local_input(PlayerHandle::new(5), &[1]),
            Err(RampartError::InvalidPlayerHandle { .. })
        ));
        assert!(matches!(
            session.add_local_input(PlayerHandle::new(0), &[1, 2]),
            Err(RampartError::InvalidRequest { .. })
        ));
        assert!(session.add_local_input(PlayerHandle::new(0), &[1]).is_ok());
    }

    #[test]
    fn advance_frame_requires_every_local_input() {
        let mut session = session(vec![PlayerType::Local, PlayerType::Local]);
        let mut game = Counter::default();
        session.add_local_input(PlayerHandle::new(0), &[1]).unwrap();
        assert!(matches!(
            session.advance_frame(&mut game),
            Err(RampartError::InvalidRequest { .. })
        ));

        session.add_local_input(PlayerHandle::new(1), &[2]).unwrap();
        session.advance_frame(&mut game).unwrap();
        assert_eq!(session.current_frame(), Frame::new(1));
        assert_eq!(game.value, 3);
        assert_eq!(game.frames[0][0].1, InputStatus::Confirmed);
        assert!(session.saved_checksum(Frame::new(1)).is_some());
    }

    #[test]
    fn local_session_confirms_its_own_frames() {
        let mut session = session(vec![PlayerType::Local]);
        let mut game = Counter::default();
        for _ in 0..20 {
            session.add_local_input(PlayerHandle::new(0), &[1]).unwrap();
            session.advance_frame(&mut game).unwrap();
        }
        assert_eq!(session.current_frame(), Frame::new(20));
        assert_eq!(game.value, 20);
        session.poll_remote_clients(&mut game).unwrap();
        assert_eq!(session.confirmed_frame(), Frame::new(19));
    }

    #[test]
    fn input_delay_shifts_local_inputs() {
        let mut config = SessionConfig::new(1, 1);
        config.input_delay = 2;
        let mut session =
            P2PSession::new(config, vec![PlayerType::Local], NullSocket, Box::new(Fletcher32))
                .unwrap();
        let mut game = Counter::default();
        for value in 1..=4u8 {
            session.add_local_input(PlayerHandle::new(0), &[value]).unwrap();
            session.advance_frame(&mut game).unwrap();
        }
        let seen: Vec<u8> = game.frames.iter().map(|f| f[0].0.bytes()[0]).collect();
        assert_eq!(seen, vec![0, 0, 1, 2]);
    }

    #[test]
    fn set_frame_delay_only_for_local_players() {
        let mut session = session(vec![PlayerType::Local, PlayerType::Remote(9)]);
        assert!(session.set_frame_delay(PlayerHandle::new(0), 3).is_ok());
        assert!(matches!(
            session.set_frame_delay(PlayerHandle::new(1), 3),
            Err(RampartError::InvalidRequest { .. })
        ));
        assert!(session.set_frame_delay(PlayerHandle::new(0), 500).is_err());
    }

    #[test]
    fn network_stats_require_remote_and_sync() {
        let session = session(vec![PlayerType::Local, PlayerType::Remote(9)]);
        assert!(matches!(
            session.network_stats(PlayerHandle::new(0)),
            Err(RampartError::InvalidRequest { .. })
        ));
        assert_eq!(
            session.network_stats(PlayerHandle::new(1)),
            Err(RampartError::NotSynchronized)
        );
    }

    #[test]
    fn disconnecting_unsynced_remote_lets_session_run() {
        let mut session = session(vec![PlayerType::Local, PlayerType::Remote(9)]);
        let mut game = Counter::default();
        session
            .disconnect_player(PlayerHandle::new(1), &mut game)
            .unwrap();
        assert_eq!(session.current_state(), SessionState::Running);
        assert!(matches!(
            session.disconnect_player(PlayerHandle::new(1), &mut game),
            Err(RampartError::InvalidRequest { .. })
        ));

        session.add_local_input(PlayerHandle::new(0), &[1]).unwrap();
        session.advance_frame(&mut game).unwrap();
        assert_eq!(game.frames[0][1].1, InputStatus::Disconnected);
    }

    #[test]
    fn local_disconnect_drops_every_remote() {
        let mut session = session(vec![
            PlayerType::Local,
            PlayerType::Remote(9),
            PlayerType::Remote(10),
        ]);
        let mut game = Counter::default();
        session
            .disconnect_player(PlayerHandle::new(0), &mut game)
            .unwrap();
        assert!(session.connect_status(PlayerHandle::new(1)).disconnected);
        assert!(session.connect_status(PlayerHandle::new(2)).disconnected);
        assert_eq!(session.current_state(), SessionState::Running);
    }

    #[test]
    fn events_drain() {
        let mut session = session(vec![PlayerType::Local]);
        let mut game = Counter::default();
        session.push_event(RampartEvent::WaitRecommendation { skip_frames: 3 }, &mut game);
        assert_eq!(game.events.len(), 1);
        assert_eq!(session.events().count(), 1);
        assert_eq!(session.events().count(), 0);
    }

    #[test]
    fn event_queue_is_bounded() {
        let mut session = session(vec![PlayerType::Local]);
        let mut game = Counter::default();
        for _ in 0..(MAX_EVENT_QUEUE_SIZE + 10) {
            session.push_event(RampartEvent::WaitRecommendation { skip_frames: 1 }, &mut game);
        }
        assert_eq!(session.events().count(), MAX_EVENT_QUEUE_SIZE);
        assert!(session.check_invariants().is_ok());
    }
}
