//! The network manager facade.
//!
//! [`NetworkManager`] owns every sub-component of the kernel — the
//! deterministic state kernel, the frame state machine, the resend archive,
//! and the wrapper assembler — and exposes the host-facing surface:
//! lifecycle (`init` / `reset` / `dispose`), the paced `update` tick,
//! inbound command dispatch, chat and file-transfer helpers, and the
//! packet-router hooks.
//!
//! All timer decisions are made against a wall-clock reading captured once
//! per call; the `*_at` variants take the reading explicitly so hosts (and
//! tests) with their own clock can drive the kernel deterministically.

pub mod instance;
pub mod user_list;

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};
use web_time::Instant;

use crate::archive::FrameResendArchive;
use crate::assembler::WrapperAssembler;
use crate::config::{clamp_frame_rate, NetworkConfig};
use crate::crc::GameLogicCrcWriters;
use crate::frame_state::{ContinuationGate, DisconnectScreen, FrameStateMachine, ResendRequest};
use crate::inbound::InboundCommand;
use crate::kernel::{CrcConsensus, DeterministicCommand, LockstepKernel};
use crate::wire::codec as wire_codec;
use crate::wire::payload::{ChatText, NetCommand, Payload};
use crate::wire::wrapper::WrapperChunk;
use crate::{
    CommandKind, ConnectionSet, Frame, PlayerSlot, RelayMask, Transport, FRAMES_TO_KEEP,
};
use self::user_list::{parse_user_list, ParsedUsers, UserList};

/// One entry of the local chat history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    /// The slot the chat came from.
    pub sender: PlayerSlot,
    /// The chat text.
    pub text: String,
    /// The recipient mask the chat was addressed with.
    pub mask: i32,
}

/// Latency/FPS metrics reported by a peer.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SlotMetrics {
    /// Average round-trip latency in seconds.
    pub average_latency: f32,
    /// Average frames per second.
    pub average_fps: u16,
}

/// Host callbacks for packet-router traffic.
///
/// The callbacks are `Send` so the manager can live behind the
/// process-wide handle.
pub struct PacketRouterEvents {
    /// Fired when a packet-router query arrives, with the querying slot.
    pub on_packet_router_query_received: Box<dyn FnMut(PlayerSlot) + Send>,
    /// Fired when a packet-router ack arrives, with the acking slot.
    pub on_packet_router_ack_received: Box<dyn FnMut(PlayerSlot) + Send>,
}

impl std::fmt::Debug for PacketRouterEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketRouterEvents").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
struct FileTransfer {
    path: String,
    progress: BTreeMap<PlayerSlot, u8>,
}

// Inbound record with wire bytes folded in; record fields win over decoded
// ones.
struct Resolved {
    kind: CommandKind,
    sender: Option<PlayerSlot>,
    execution_frame: Option<Frame>,
    command_id: Option<u16>,
    frame: Option<Frame>,
    command_count: Option<u16>,
    frame_hash: Option<u32>,
    logic_crc: Option<u32>,
    payload: Payload,
    chunk: Option<WrapperChunk>,
}

/// The deterministic multiplayer network kernel facade.
pub struct NetworkManager {
    config: NetworkConfig,
    started: bool,
    local_slot: PlayerSlot,
    packet_router_slot: Option<PlayerSlot>,
    users: ParsedUsers,
    connected: ConnectionSet,

    kernel: LockstepKernel,
    frames: FrameStateMachine,
    archive: FrameResendArchive,
    assembler: WrapperAssembler,

    transport: Option<Box<dyn Transport + Send>>,
    router_events: Option<PacketRouterEvents>,

    next_command_id: u16,
    run_ahead: u32,
    frame_rate: u32,
    last_execution_frame: Frame,
    last_tick: Option<Instant>,
    current_frame_consumed: bool,

    chat_history: Vec<ChatEntry>,
    file_transfers: BTreeMap<u16, FileTransfer>,
    metrics: BTreeMap<PlayerSlot, SlotMetrics>,
    load_progress: BTreeMap<PlayerSlot, u8>,
    loaded: BTreeSet<PlayerSlot>,
}

impl NetworkManager {
    /// Creates a manager from the given configuration.
    ///
    /// The configuration is sanitized (out-of-range fields revert to their
    /// defaults). Call [`init`](Self::init) to mark the kernel started.
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        let config = config.sanitized();
        let local_slot = PlayerSlot::new(config.local_player_id.min(15) as u8);
        let frames = FrameStateMachine::new(local_slot, &config);
        let run_ahead = config.run_ahead;
        let frame_rate = config.frame_rate;
        Self {
            config,
            started: false,
            local_slot,
            packet_router_slot: Some(PlayerSlot::new(0)),
            users: ParsedUsers::default(),
            connected: ConnectionSet::new(),
            kernel: LockstepKernel::new(),
            frames,
            archive: FrameResendArchive::new(),
            assembler: WrapperAssembler::new(),
            transport: None,
            router_events: None,
            next_command_id: 1,
            run_ahead,
            frame_rate,
            last_execution_frame: Frame::ZERO,
            last_tick: None,
            current_frame_consumed: false,
            chat_history: Vec::new(),
            file_transfers: BTreeMap::new(),
            metrics: BTreeMap::new(),
            load_progress: BTreeMap::new(),
            loaded: BTreeSet::new(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Resets everything to a pristine start-of-game state and marks the
    /// kernel started. The packet router initializes to slot 0.
    pub fn init(&mut self) {
        self.init_at(Instant::now());
    }

    /// [`init`](Self::init) with an explicit clock reading.
    pub fn init_at(&mut self, now: Instant) {
        self.reset_session_state(now);
        self.packet_router_slot = Some(PlayerSlot::new(0));
        self.connected.clear();
        self.connected.insert(self.local_slot);
        for slot in self.users.names.keys() {
            self.connected.insert(*slot);
        }
        self.started = true;
        debug!(local = %self.local_slot, "network kernel started");
    }

    /// Wipes per-session state (frame, ledgers, archives, assemblies,
    /// chat, transfers, metrics) but leaves the kernel started.
    pub fn reset(&mut self) {
        self.reset_session_state(Instant::now());
    }

    fn reset_session_state(&mut self, now: Instant) {
        self.kernel.reset();
        self.frames.reset(now);
        self.frames.start(now);
        self.archive.clear();
        self.assembler.clear();
        self.chat_history.clear();
        self.file_transfers.clear();
        self.metrics.clear();
        self.load_progress.clear();
        self.loaded.clear();
        self.next_command_id = 1;
        self.run_ahead = self.config.run_ahead;
        self.frame_rate = self.config.frame_rate;
        self.last_execution_frame = Frame::ZERO;
        self.last_tick = None;
        self.current_frame_consumed = false;
    }

    /// Clears the command queue and marks the kernel stopped.
    pub fn dispose(&mut self) {
        self.kernel.clear_queue();
        self.started = false;
        debug!("network kernel stopped");
    }

    /// Returns `true` while the kernel is started.
    #[inline]
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Attaches the outbound transport.
    pub fn attach_transport(&mut self, transport: Box<dyn Transport + Send>) {
        self.transport = Some(transport);
    }

    /// Detaches and returns the outbound transport, if any.
    pub fn detach_transport(&mut self) -> Option<Box<dyn Transport + Send>> {
        self.transport.take()
    }

    /// Installs the game-logic CRC section writers; cached remote CRC
    /// values reconcile immediately.
    pub fn install_game_logic_crc_writers(&mut self, writers: GameLogicCrcWriters) {
        self.kernel.install_section_writers(writers);
    }

    /// Installs the packet-router event callbacks.
    pub fn set_packet_router_events(&mut self, events: PacketRouterEvents) {
        self.router_events = Some(events);
    }

    /// Installs the host's extra readiness predicate.
    pub fn set_continuation_gate(&mut self, gate: ContinuationGate) {
        self.frames.set_continuation_gate(gate);
    }

    // =========================================================================
    // User list and connection set
    // =========================================================================

    /// Normalizes lobby metadata into the slot tables and the connection
    /// set. AI and unoccupied slots are excluded.
    pub fn parse_user_list(&mut self, list: &UserList) {
        let parsed = parse_user_list(list, &self.config.local_player_name);
        if let Some(local) = parsed.local_slot {
            self.local_slot = local;
            self.frames.set_local_slot(local);
        }
        self.connected.clear();
        self.connected.insert(self.local_slot);
        for slot in parsed.names.keys() {
            self.connected.insert(*slot);
        }
        self.users = parsed;
    }

    /// The local player's slot.
    #[inline]
    #[must_use]
    pub fn local_slot(&self) -> PlayerSlot {
        self.local_slot
    }

    /// Name of the player in `slot`, when known.
    #[must_use]
    pub fn player_name(&self, slot: PlayerSlot) -> Option<&str> {
        self.users.names.get(&slot).map(String::as_str)
    }

    /// Side of the player in `slot`, when known.
    #[must_use]
    pub fn player_side(&self, slot: PlayerSlot) -> Option<&str> {
        self.users.sides.get(&slot).map(String::as_str)
    }

    /// Returns `true` while `slot` is in the connection set.
    ///
    /// Disconnection is monotonic within a game: once this returns
    /// `false` for a slot, it never returns `true` again in the session.
    #[must_use]
    pub fn is_player_connected(&self, slot: PlayerSlot) -> bool {
        self.connected.contains(slot)
    }

    /// The current packet-router slot, or `None` when no router exists.
    #[inline]
    #[must_use]
    pub fn packet_router_slot(&self) -> Option<PlayerSlot> {
        self.packet_router_slot
    }

    /// Overrides the packet-router slot.
    pub fn set_packet_router_slot(&mut self, slot: Option<PlayerSlot>) {
        self.packet_router_slot = slot;
    }

    fn is_local_packet_router(&self) -> bool {
        self.packet_router_slot == Some(self.local_slot)
    }

    fn mark_disconnected(&mut self, slot: PlayerSlot) {
        if slot == self.local_slot || !self.connected.contains(slot) {
            return;
        }
        debug!(%slot, "peer disconnected");
        self.connected.remove(slot);
        self.frames.forget_peer(slot);
        // A dropped router hands arbitration to the lowest surviving slot.
        if self.packet_router_slot == Some(slot) {
            self.packet_router_slot = self.connected.slots().next();
            debug!(router = ?self.packet_router_slot, "packet router reassigned");
        }
    }

    // =========================================================================
    // Frames
    // =========================================================================

    /// The last frame whose local state has been computed.
    #[inline]
    #[must_use]
    pub fn game_frame(&self) -> Frame {
        self.kernel.game_frame()
    }

    /// The earliest frame into which locally issued commands may be
    /// scheduled: `max(last_execution_frame, game_frame + run_ahead)`.
    #[must_use]
    pub fn execution_frame(&self) -> Frame {
        let ahead = self.kernel.game_frame() + self.run_ahead;
        self.last_execution_frame.max(ahead)
    }

    /// The current run-ahead window.
    #[inline]
    #[must_use]
    pub fn run_ahead(&self) -> u32 {
        self.run_ahead
    }

    /// The current frame rate.
    #[inline]
    #[must_use]
    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    /// Number of commands queued for the current frame.
    #[must_use]
    pub fn queued_command_count(&self) -> usize {
        self.kernel.queued_len()
    }

    /// Returns `true` when the current frame's data is complete per the
    /// readiness protocol.
    #[must_use]
    pub fn is_frame_data_ready(&self) -> bool {
        self.frames
            .is_frame_data_ready(self.kernel.game_frame(), self.connected)
    }

    /// Consumes a ready frame: true exactly once per satisfied frame.
    ///
    /// Clears the frame's expectation entries, prunes the archive, and
    /// advances the validation window.
    pub fn consume_ready_frame(&mut self, frame: Frame) -> bool {
        if !self.frames.consume_ready_frame(frame, self.connected) {
            return false;
        }
        self.archive.prune_history(frame);
        self.kernel
            .prune_before(frame.saturating_sub(FRAMES_TO_KEEP as u32 - 1));
        if frame == self.kernel.game_frame() {
            self.current_frame_consumed = true;
        }
        true
    }

    /// Bumps the pending-notice counter and announces the frame to every
    /// other connected peer with a FrameInfo carrying the current queued
    /// command count.
    pub fn notify_others_of_new_frame(&mut self, frame: Frame) {
        self.frames.notify_new_frame(frame);
        let info = NetCommand::new(CommandKind::FrameInfo)
            .with_sender(self.local_slot)
            .with_execution_frame(frame)
            .with_payload(Payload::FrameInfo {
                command_count: self.kernel.queued_len() as u16,
            });
        let relay = self.connected.relay_mask_excluding(self.local_slot);
        self.send(info, relay);
    }

    /// [`notify_others_of_new_frame`](Self::notify_others_of_new_frame)
    /// for the current game frame.
    pub fn notify_others_of_current_frame(&mut self) {
        self.notify_others_of_new_frame(self.kernel.game_frame());
    }

    /// Frame notices not yet consumed by the host.
    #[must_use]
    pub fn pending_frame_notices(&self) -> u32 {
        self.frames.pending_frame_notices()
    }

    /// The highest frame others have been told about.
    #[must_use]
    pub fn expected_network_frame(&self) -> Frame {
        self.frames.expected_network_frame()
    }

    // =========================================================================
    // Update tick
    // =========================================================================

    /// Advances the kernel against the wall clock.
    ///
    /// Paced to at most one frame per `1000 / frame_rate` ms. A due tick
    /// whose frame data is ready (or already consumed by the host)
    /// records the local frame hash and game-logic CRC, clears the queue,
    /// advances the frame counter, prunes the archive, and marks the new
    /// frame ready. Stall evaluation runs on every call.
    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    /// [`update`](Self::update) with an explicit clock reading.
    pub fn update_at(&mut self, now: Instant) {
        if !self.started {
            return;
        }

        let current = self.kernel.game_frame();
        let evicted = self.frames.evaluate_stall(
            now,
            current,
            self.execution_frame(),
            self.connected,
            self.is_local_packet_router(),
        );
        for slot in evicted {
            self.mark_disconnected(slot);
        }
        self.flush_outbound();

        let due = match self.last_tick {
            None => true,
            Some(last) => now.duration_since(last) >= self.config.frame_interval(),
        };
        if !due {
            return;
        }
        let advance = self.current_frame_consumed
            || self
                .frames
                .is_frame_data_ready(self.kernel.game_frame(), self.connected);
        if !advance {
            return;
        }

        let current = self.kernel.game_frame();
        self.kernel.record_local_frame_hash(current);
        if self.kernel.has_section_writers() {
            self.kernel.compute_game_logic_crc(current);
        }
        self.kernel.clear_queue();
        self.kernel.advance_frame();
        let new_frame = self.kernel.game_frame();
        self.archive.prune_history(new_frame);
        self.frames.record_self_advance(now);
        self.frames.mark_frame_ready(new_frame);
        self.last_tick = Some(now);
        self.current_frame_consumed = false;
        trace!(%new_frame, "frame advanced");
    }

    // =========================================================================
    // Validation accessors
    // =========================================================================

    /// The local frame hash for `frame`, computing and recording it from
    /// the current queue on first use.
    pub fn deterministic_frame_hash(&mut self, frame: Frame) -> u32 {
        self.kernel.record_local_frame_hash(frame)
    }

    /// The local game-logic CRC for `frame`; `None` without section
    /// writers.
    pub fn deterministic_game_logic_crc(&mut self, frame: Frame) -> Option<u32> {
        self.kernel.compute_game_logic_crc(frame)
    }

    /// The sticky mismatch flag.
    #[must_use]
    pub fn saw_crc_mismatch(&self) -> bool {
        self.kernel.saw_crc_mismatch()
    }

    /// Frames with observed frame-hash mismatches.
    #[must_use]
    pub fn frame_hash_mismatch_frames(&self) -> &[Frame] {
        self.kernel.frame_hash_mismatch_frames()
    }

    /// Frames with observed game-logic CRC mismatches.
    #[must_use]
    pub fn game_logic_crc_mismatch_frames(&self) -> &[Frame] {
        self.kernel.game_logic_crc_mismatch_frames()
    }

    /// Game-logic CRC consensus for `frame` across the connection set.
    #[must_use]
    pub fn game_logic_crc_consensus(&self, frame: Frame) -> CrcConsensus {
        self.kernel
            .consensus(frame, self.connected.slots(), self.local_slot)
    }

    /// Returns `true` once any command-count overflow has been observed.
    #[must_use]
    pub fn saw_frame_command_count_mismatch(&self) -> bool {
        self.frames.saw_frame_command_count_mismatch()
    }

    /// Recorded command-count overflows.
    #[must_use]
    pub fn frame_resend_requests(&self) -> &[ResendRequest] {
        self.frames.resend_requests()
    }

    /// Current disconnect screen state.
    #[must_use]
    pub fn disconnect_screen(&self) -> DisconnectScreen {
        self.frames.screen()
    }

    /// Peers silent past the screen-notify timeout while the disconnect
    /// screen is up.
    #[must_use]
    pub fn unresponsive_peers_at(&self, now: Instant) -> Vec<PlayerSlot> {
        self.frames.unresponsive_peers(now, self.connected)
    }

    /// Tally of distinct voters against `target` at `frame`.
    #[must_use]
    pub fn disconnect_vote_count(&self, target: PlayerSlot, frame: Frame) -> usize {
        self.frames.disconnect_vote_count(target, frame)
    }

    /// Metrics last reported by `slot`.
    #[must_use]
    pub fn slot_metrics(&self, slot: PlayerSlot) -> Option<SlotMetrics> {
        self.metrics.get(&slot).copied()
    }

    /// Load-screen progress last reported by `slot`.
    #[must_use]
    pub fn load_progress(&self, slot: PlayerSlot) -> Option<u8> {
        self.load_progress.get(&slot).copied()
    }

    /// Returns `true` once `slot` reported load complete.
    #[must_use]
    pub fn is_loaded(&self, slot: PlayerSlot) -> bool {
        self.loaded.contains(&slot)
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    fn next_command_id(&mut self) -> u16 {
        let id = self.next_command_id;
        self.next_command_id = self.next_command_id.wrapping_add(1).max(1);
        id
    }

    /// Sends a command through the attached transport.
    ///
    /// Commands whose kind requires an id get a fresh one from the local
    /// sequencer when none is set. Without a transport (or in forced
    /// single-player) the send is a no-op.
    pub fn send_local_command_direct(&mut self, command: NetCommand, relay: RelayMask) {
        self.send(command, relay);
    }

    fn send(&mut self, mut command: NetCommand, relay: RelayMask) {
        if command.kind.requires_command_id() && command.command_id.is_none() {
            command.command_id = Some(self.next_command_id());
        }
        if let Some(frame) = command.execution_frame {
            if frame > self.last_execution_frame {
                self.last_execution_frame = frame;
            }
        }
        if self.config.force_single_player {
            return;
        }
        if let Some(transport) = self.transport.as_mut() {
            transport.send_local_command_direct(&command, relay);
        }
    }

    fn deterministic_from(command: &NetCommand, sender: PlayerSlot) -> DeterministicCommand {
        let payload = wire_codec::encode(command);
        let sort_number = command.command_id.map_or(0, i32::from);
        if command.command_id.is_some() {
            DeterministicCommand::keyed(command.kind.code(), sender, sort_number, payload)
        } else {
            DeterministicCommand::new(command.kind.code(), sender, sort_number, payload)
        }
    }

    // Drain the frame state machine's outbound queue: assign ids, stage
    // locally emitted synchronized commands into the queue and archive,
    // and forward to the transport.
    fn flush_outbound(&mut self) {
        for (mut command, relay) in self.frames.drain_outbound() {
            if command.kind.requires_command_id() && command.command_id.is_none() {
                command.command_id = Some(self.next_command_id());
            }
            if command.kind.is_synchronized() {
                let frame = command
                    .execution_frame
                    .unwrap_or_else(|| self.kernel.game_frame());
                self.kernel
                    .enqueue(Self::deterministic_from(&command, self.local_slot));
                self.archive.record_command(self.local_slot, frame, &command);
            }
            self.send(command, relay);
        }
    }

    /// Casts the local vote to disconnect `target`.
    pub fn vote_for_player_disconnect(&mut self, target: PlayerSlot) {
        let ratified = self.frames.vote_for_player_disconnect(
            target,
            self.kernel.game_frame(),
            self.connected,
        );
        self.flush_outbound();
        if let Some(slot) = ratified {
            self.mark_disconnected(slot);
        }
    }

    // =========================================================================
    // Chat
    // =========================================================================

    /// Sends in-game chat to the slots in `mask` and records it in the
    /// local history.
    pub fn send_chat(&mut self, text: &str, mask: i32) {
        self.chat_history.push(ChatEntry {
            sender: self.local_slot,
            text: text.to_string(),
            mask,
        });
        let relay = RelayMask::from_bits((mask as u32 & 0xFFFF) as u16).without(self.local_slot);
        let command = NetCommand::new(CommandKind::Chat)
            .with_sender(self.local_slot)
            .with_payload(Payload::Chat {
                text: ChatText::from(text),
                player_mask: mask,
            });
        self.send(command, relay);
    }

    /// Sends disconnect-screen chat to every other slot.
    pub fn send_disconnect_chat(&mut self, text: &str) {
        let mask = 0xFF ^ (1 << self.local_slot.as_u8());
        self.chat_history.push(ChatEntry {
            sender: self.local_slot,
            text: text.to_string(),
            mask,
        });
        let relay = RelayMask::from_bits(mask as u16).without(self.local_slot);
        let command = NetCommand::new(CommandKind::DisconnectChat)
            .with_sender(self.local_slot)
            .with_payload(Payload::DisconnectChat {
                text: ChatText::from(text),
            });
        self.send(command, relay);
    }

    /// The local chat history, oldest first.
    #[must_use]
    pub fn chat_history(&self) -> &[ChatEntry] {
        &self.chat_history
    }

    // =========================================================================
    // File transfers
    // =========================================================================

    fn known_slots(&self) -> Vec<PlayerSlot> {
        let mut slots: BTreeSet<PlayerSlot> = self.users.names.keys().copied().collect();
        slots.insert(self.local_slot);
        slots.into_iter().collect()
    }

    fn seed_transfer(&mut self, command_id: u16, path: &str, mask: u8) {
        let mut progress = BTreeMap::new();
        for slot in self.known_slots() {
            let is_recipient = u16::from(mask) & (1 << slot.as_u8()) != 0;
            progress.insert(slot, if is_recipient { 0 } else { 100 });
        }
        self.file_transfers.insert(
            command_id,
            FileTransfer {
                path: path.to_string(),
                progress,
            },
        );
    }

    /// Announces a file transfer to the slots in `mask`.
    ///
    /// Allocates a command id, opens a record with zero progress for every
    /// recipient bit (100 for everyone else), and emits the announce.
    /// Returns the allocated id.
    pub fn send_file_announce(&mut self, path: &str, mask: u8) -> u16 {
        let command_id = self.next_command_id();
        self.seed_transfer(command_id, path, mask);
        let relay = self.connected.relay_mask_excluding(self.local_slot);
        let command = NetCommand::new(CommandKind::FileAnnounce)
            .with_sender(self.local_slot)
            .with_payload(Payload::FileAnnounce {
                path: path.to_string(),
                command_id,
                player_mask: mask,
            });
        self.send(command, relay);
        command_id
    }

    /// Sends file bytes to the slots in `mask` and marks those recipients
    /// complete in the transfer record for `path`.
    pub fn send_file(&mut self, path: &str, data: Vec<u8>, mask: u8) {
        for transfer in self.file_transfers.values_mut() {
            if transfer.path == path {
                for (slot, progress) in transfer.progress.iter_mut() {
                    if u16::from(mask) & (1 << slot.as_u8()) != 0 {
                        *progress = 100;
                    }
                }
            }
        }
        let relay = RelayMask::from_bits(u16::from(mask)).without(self.local_slot);
        let command = NetCommand::new(CommandKind::File)
            .with_sender(self.local_slot)
            .with_payload(Payload::File {
                path: path.to_string(),
                data,
            });
        self.send(command, relay);
    }

    /// Transfer progress of `slot` for the file at `path`, when a record
    /// exists.
    #[must_use]
    pub fn file_transfer_progress(&self, slot: PlayerSlot, path: &str) -> Option<u8> {
        self.file_transfers
            .values()
            .find(|t| t.path == path)
            .and_then(|t| t.progress.get(&slot).copied())
    }

    // =========================================================================
    // Inbound dispatch
    // =========================================================================

    /// Processes one inbound command record.
    ///
    /// Resolves the command kind (numeric code, then textual alias, then
    /// wire bytes), stages synchronized kinds into the queue, expectations
    /// and archive, and dispatches to the kind's handler. Returns `true`
    /// iff a command kind could be resolved; malformed payloads beyond
    /// that are dropped with no state mutation.
    pub fn process_incoming_command(&mut self, record: &InboundCommand) -> bool {
        self.process_incoming_command_at(record, Instant::now())
    }

    /// [`process_incoming_command`](Self::process_incoming_command) with
    /// an explicit clock reading.
    pub fn process_incoming_command_at(&mut self, record: &InboundCommand, now: Instant) -> bool {
        let Some(resolved) = Self::resolve(record) else {
            trace!("dropping command with unresolvable type");
            return false;
        };

        if resolved.kind == CommandKind::Wrapper {
            self.handle_wrapper(record, &resolved, now);
            return true;
        }

        if resolved.kind.is_synchronized() {
            if let Some(sender) = resolved.sender {
                let frame = resolved
                    .execution_frame
                    .unwrap_or_else(|| self.kernel.game_frame());
                let reconstructed = NetCommand {
                    kind: resolved.kind,
                    sender: Some(sender),
                    execution_frame: Some(frame),
                    relay: None,
                    command_id: resolved.command_id,
                    payload: resolved.payload.clone(),
                };
                if !self
                    .kernel
                    .enqueue(Self::deterministic_from(&reconstructed, sender))
                {
                    // Duplicate delivery: already counted, already archived.
                    return true;
                }
                self.frames
                    .record_synchronized_command(sender, frame, self.connected);
                self.archive.record_command(sender, frame, &reconstructed);
                self.flush_outbound();
            }
        }

        self.dispatch(&resolved, now);
        true
    }

    fn resolve(record: &InboundCommand) -> Option<Resolved> {
        let decoded = record
            .wire
            .as_deref()
            .and_then(|bytes| match wire_codec::decode(bytes) {
                Ok(command) => Some(command),
                Err(err) => {
                    trace!(%err, "dropping malformed wire payload");
                    None
                },
            });

        let kind = record
            .resolve_kind()
            .or_else(|| decoded.as_ref().map(|c| c.kind))?;

        let decoded_payload = decoded.as_ref().map(|c| c.payload.clone());
        let payload = record
            .payload
            .clone()
            .or(decoded_payload)
            .unwrap_or_default();

        let payload_frame = match &payload {
            Payload::FrameResendRequest { frame_to_resend } => Some(*frame_to_resend),
            Payload::DisconnectFrame { frame } => Some(*frame),
            Payload::DisconnectScreenOff { new_frame } => Some(*new_frame),
            Payload::DisconnectPlayer {
                disconnect_frame, ..
            } => Some(*disconnect_frame),
            _ => None,
        };
        let command_count = record.command_count.or(match &payload {
            Payload::FrameInfo { command_count } => Some(*command_count),
            _ => None,
        });

        Some(Resolved {
            kind,
            sender: record
                .sender_slot()
                .or_else(|| decoded.as_ref().and_then(|c| c.sender)),
            execution_frame: record
                .execution_frame
                .map(Frame::new)
                .or_else(|| decoded.as_ref().and_then(|c| c.execution_frame)),
            command_id: record
                .command_id
                .or_else(|| decoded.as_ref().and_then(|c| c.command_id)),
            frame: record
                .frame
                .map(Frame::new)
                .or(payload_frame)
                .or_else(|| record.execution_frame.map(Frame::new))
                .or_else(|| decoded.as_ref().and_then(|c| c.execution_frame)),
            command_count,
            frame_hash: record.frame_hash,
            logic_crc: record.logic_crc,
            chunk: record.chunk.clone().or(match payload {
                Payload::Wrapper(ref chunk) => Some(chunk.clone()),
                _ => None,
            }),
            payload,
        })
    }

    fn handle_wrapper(&mut self, record: &InboundCommand, resolved: &Resolved, now: Instant) {
        // A reified inner command with a known type takes precedence;
        // chunk metadata in the same message is ignored.
        if let Some(inner) = &record.wrapped {
            if inner.resolve_kind().is_some() {
                self.process_incoming_command_at(inner, now);
                return;
            }
        }
        let Some(chunk) = &resolved.chunk else {
            trace!("wrapper without chunk or inner command");
            return;
        };
        if let Some(buffer) = self.assembler.accept(chunk) {
            match wire_codec::decode(&buffer) {
                Ok(inner) => {
                    let record = InboundCommand::from(inner);
                    self.process_incoming_command_at(&record, now);
                },
                Err(err) => trace!(%err, "reassembled wrapper payload did not parse"),
            }
        }
    }

    fn fire_router_query(&mut self, slot: PlayerSlot) {
        if let Some(events) = self.router_events.as_mut() {
            (events.on_packet_router_query_received)(slot);
        }
    }

    fn fire_router_ack(&mut self, slot: PlayerSlot) {
        if let Some(events) = self.router_events.as_mut() {
            (events.on_packet_router_ack_received)(slot);
        }
    }

    fn dispatch(&mut self, resolved: &Resolved, now: Instant) {
        match resolved.kind {
            CommandKind::FrameInfo => {
                let (Some(sender), Some(frame)) = (resolved.sender, resolved.frame) else {
                    return;
                };
                if let Some(count) = resolved.command_count {
                    self.frames.record_frame_info(sender, frame, u32::from(count));
                    self.archive.record_expected_count(sender, frame, count);
                }
                if let Some(hash) = resolved.frame_hash {
                    self.kernel.record_remote_frame_hash(frame, sender, hash);
                }
                if let Some(crc) = resolved.logic_crc {
                    self.kernel.record_remote_game_logic_crc(frame, sender, crc);
                }
            },
            CommandKind::Chat => {
                if let (Some(sender), Payload::Chat { text, player_mask }) =
                    (resolved.sender, &resolved.payload)
                {
                    self.chat_history.push(ChatEntry {
                        sender,
                        text: text.to_string_lossy(),
                        mask: *player_mask,
                    });
                }
            },
            CommandKind::DisconnectChat => {
                if let (Some(sender), Payload::DisconnectChat { text }) =
                    (resolved.sender, &resolved.payload)
                {
                    self.chat_history.push(ChatEntry {
                        sender,
                        text: text.to_string_lossy(),
                        mask: 0xFF ^ (1 << sender.as_u8()),
                    });
                }
            },
            CommandKind::RunAhead => {
                if let Payload::RunAhead {
                    new_run_ahead,
                    new_frame_rate,
                } = resolved.payload
                {
                    debug!(new_run_ahead, new_frame_rate, "run ahead changed");
                    self.run_ahead = u32::from(new_run_ahead);
                    self.frame_rate = clamp_frame_rate(u32::from(new_frame_rate));
                }
            },
            CommandKind::RunAheadMetrics => {
                let Some(sender) = resolved.sender else { return };
                if !self.connected.contains(sender) {
                    trace!(%sender, "metrics from disconnected slot ignored");
                    return;
                }
                if let Payload::RunAheadMetrics {
                    average_latency,
                    average_fps,
                } = resolved.payload
                {
                    self.metrics.insert(
                        sender,
                        SlotMetrics {
                            average_latency,
                            average_fps,
                        },
                    );
                }
            },
            CommandKind::Progress => {
                if let (Some(sender), Payload::Progress { percentage }) =
                    (resolved.sender, &resolved.payload)
                {
                    self.load_progress.insert(sender, (*percentage).min(100));
                }
            },
            CommandKind::LoadComplete => {
                if let Some(sender) = resolved.sender {
                    self.loaded.insert(sender);
                }
            },
            CommandKind::PlayerLeave => {
                let leaving = match resolved.payload {
                    Payload::PlayerLeave { leaving_slot } => Some(PlayerSlot::new(leaving_slot)),
                    _ => resolved.sender,
                };
                if let Some(slot) = leaving {
                    self.mark_disconnected(slot);
                }
            },
            CommandKind::DisconnectKeepAlive => {
                if let Some(sender) = resolved.sender {
                    self.frames.receive_disconnect_keep_alive(sender, now);
                }
            },
            CommandKind::FrameResendRequest => {
                let (Some(sender), Some(frame)) = (resolved.sender, resolved.frame) else {
                    return;
                };
                self.replay_archive(sender, frame, self.kernel.game_frame());
            },
            CommandKind::DisconnectPlayer => {
                if let Payload::DisconnectPlayer {
                    disconnect_slot, ..
                } = resolved.payload
                {
                    self.mark_disconnected(PlayerSlot::new(disconnect_slot));
                }
            },
            CommandKind::DisconnectVote => {
                let Some(sender) = resolved.sender else { return };
                if let Payload::DisconnectVote {
                    vote_slot,
                    vote_frame,
                } = resolved.payload
                {
                    let ratified = self.frames.receive_disconnect_vote(
                        sender,
                        PlayerSlot::new(vote_slot),
                        vote_frame,
                        self.connected,
                    );
                    if let Some(slot) = ratified {
                        self.mark_disconnected(slot);
                    }
                }
            },
            CommandKind::DisconnectFrame => {
                let (Some(sender), Some(frame)) = (resolved.sender, resolved.frame) else {
                    return;
                };
                let replay =
                    self.frames
                        .record_disconnect_frame(sender, frame, self.kernel.game_frame());
                if let Some((start, end)) = replay {
                    self.replay_archive(sender, start, end);
                }
            },
            CommandKind::DisconnectScreenOff => {
                let (Some(sender), Some(frame)) = (resolved.sender, resolved.frame) else {
                    return;
                };
                let from_router = self.packet_router_slot == Some(sender);
                self.frames
                    .record_disconnect_screen_off(sender, frame, from_router);
            },
            CommandKind::PacketRouterQuery => {
                let Some(sender) = resolved.sender else { return };
                self.fire_router_query(sender);
                if self.is_local_packet_router() {
                    let ack = NetCommand::new(CommandKind::PacketRouterAck)
                        .with_sender(self.local_slot);
                    self.send(ack, sender.mask());
                }
            },
            CommandKind::PacketRouterAck => {
                let Some(sender) = resolved.sender else { return };
                self.fire_router_ack(sender);
                if self.packet_router_slot == Some(sender) {
                    self.frames.acknowledge_packet_router(self.kernel.game_frame());
                }
            },
            CommandKind::File => {
                if let Payload::File { path, .. } = &resolved.payload {
                    let local = self.local_slot;
                    for transfer in self.file_transfers.values_mut() {
                        if &transfer.path == path {
                            transfer.progress.insert(local, 100);
                        }
                    }
                }
            },
            CommandKind::FileAnnounce => {
                if let Payload::FileAnnounce {
                    path,
                    command_id,
                    player_mask,
                } = &resolved.payload
                {
                    let (path, command_id, player_mask) =
                        (path.clone(), *command_id, *player_mask);
                    self.seed_transfer(command_id, &path, player_mask);
                }
            },
            CommandKind::FileProgress => {
                let Some(sender) = resolved.sender else { return };
                if let Payload::FileProgress {
                    command_id,
                    progress,
                } = resolved.payload
                {
                    let capped = progress.clamp(0, 100) as u8;
                    if let Some(transfer) = self.file_transfers.get_mut(&command_id) {
                        let entry = transfer.progress.entry(sender).or_insert(0);
                        // Progress only ever rises.
                        if capped > *entry {
                            *entry = capped;
                        }
                    }
                }
            },
            // Lobby keep-alives, connection acks, NAT mangler traffic, the
            // timeout notification, and the sentinels are consumed with no
            // kernel-state effect.
            CommandKind::KeepAlive
            | CommandKind::AckBoth
            | CommandKind::AckStage1
            | CommandKind::AckStage2
            | CommandKind::ManglerQuery
            | CommandKind::ManglerResponse
            | CommandKind::TimeoutStart
            | CommandKind::DisconnectStart
            | CommandKind::DisconnectEnd => {
                trace!(kind = %resolved.kind, "command consumed");
            },
            // GameCommand and DestroyPlayer are executed by the host via
            // the queue; staging already happened.
            CommandKind::GameCommand | CommandKind::DestroyPlayer => {},
            CommandKind::Wrapper => {
                // Routed by process_incoming_command_at before dispatch.
            },
        }
    }

    // Replay archived frames [start, end] to one peer, with fresh command
    // ids for kinds that require them.
    fn replay_archive(&mut self, target: PlayerSlot, start: Frame, end: Frame) {
        let plan = self
            .archive
            .build_resend_plan(target, start, end, self.connected);
        if plan.is_empty() {
            return;
        }
        debug!(%target, %start, %end, commands = plan.len(), "replaying archive");
        for mut command in plan {
            if command.kind.requires_command_id() {
                command.command_id = Some(self.next_command_id());
            }
            self.send(command, target.mask());
        }
    }
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("started", &self.started)
            .field("local_slot", &self.local_slot)
            .field("game_frame", &self.kernel.game_frame())
            .field("packet_router_slot", &self.packet_router_slot)
            .field("connected", &self.connected.len())
            .finish_non_exhaustive()
    }
}
