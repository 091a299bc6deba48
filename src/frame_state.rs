//! Per-frame readiness and disconnect arbitration.
//!
//! [`FrameStateMachine`] tracks, for every connected peer, how many
//! synchronized commands are expected and received per frame, gates frame
//! consumption on those expectations, and generates resend requests when a
//! peer over-delivers. It also owns the disconnect sub-state: the stall
//! screen, per-peer last-heard timestamps, keep-alive pacing, vote tallies,
//! and disconnect-frame receipts.
//!
//! All timer work happens in [`evaluate_stall`](FrameStateMachine::evaluate_stall),
//! polled from the manager's update tick against a wall-clock reading; the
//! machine never blocks and holds no background task. Outbound commands are
//! pushed onto an internal queue in call order and drained by the manager,
//! which assigns command ids and forwards them to the transport.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use smallvec::SmallVec;
use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::config::NetworkConfig;
use crate::frame_window::FrameWindow;
use crate::wire::payload::{NetCommand, Payload};
use crate::{CommandKind, ConnectionSet, Frame, PlayerSlot, RelayMask, FRAMES_TO_KEEP};

/// Disconnect screen state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DisconnectScreen {
    /// The simulation is running normally.
    #[default]
    Off,
    /// The simulation has stalled; the disconnect screen is up and
    /// keep-alives are being exchanged.
    On,
}

/// A recorded command-count overflow, kept for the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResendRequest {
    /// The slot whose command count overflowed.
    pub player_id: PlayerSlot,
    /// The affected frame.
    pub frame: Frame,
}

#[derive(Debug, Default, Clone, Copy)]
struct CommandExpectation {
    expected: Option<u32>,
    received: u32,
}

type FrameExpectations = BTreeMap<PlayerSlot, CommandExpectation>;

/// Continuation gate: an extra host-supplied readiness predicate.
pub type ContinuationGate = Box<dyn Fn(Frame) -> bool + Send>;

/// Per-player command-count expectations, readiness gating, and the
/// disconnect state machine.
pub struct FrameStateMachine {
    local_slot: PlayerSlot,

    // readiness
    frame_ready: bool,
    expected_network_frame: Frame,
    pending_frame_notices: u32,
    ready_frames: BTreeSet<Frame>,
    expectations: FrameWindow<FrameExpectations>,
    resend_requests: Vec<ResendRequest>,
    saw_count_mismatch: bool,
    continuation_gate: Option<ContinuationGate>,

    // disconnect sub-state
    screen: DisconnectScreen,
    stalled: bool,
    last_advance: Option<Instant>,
    last_keep_alive: Option<Instant>,
    last_heard: BTreeMap<PlayerSlot, Instant>,
    votes: BTreeMap<(PlayerSlot, Frame), BTreeSet<PlayerSlot>>,
    disconnect_frame_by_peer: BTreeMap<PlayerSlot, Frame>,
    disconnect_frame_receipts: BTreeSet<PlayerSlot>,

    // timing constants
    disconnect_timeout: Duration,
    disconnect_player_timeout: Duration,
    disconnect_screen_notify_timeout: Duration,
    disconnect_keep_alive_interval: Duration,

    outbound: VecDeque<(NetCommand, RelayMask)>,
}

impl FrameStateMachine {
    /// Creates a machine for the given local slot with the configured
    /// disconnect timing.
    #[must_use]
    pub fn new(local_slot: PlayerSlot, config: &NetworkConfig) -> Self {
        Self {
            local_slot,
            frame_ready: false,
            expected_network_frame: Frame::ZERO,
            pending_frame_notices: 0,
            ready_frames: BTreeSet::new(),
            expectations: FrameWindow::new(FRAMES_TO_KEEP),
            resend_requests: Vec::new(),
            saw_count_mismatch: false,
            continuation_gate: None,
            screen: DisconnectScreen::Off,
            stalled: false,
            last_advance: None,
            last_keep_alive: None,
            last_heard: BTreeMap::new(),
            votes: BTreeMap::new(),
            disconnect_frame_by_peer: BTreeMap::new(),
            disconnect_frame_receipts: BTreeSet::new(),
            disconnect_timeout: config.disconnect_timeout,
            disconnect_player_timeout: config.disconnect_player_timeout,
            disconnect_screen_notify_timeout: config.disconnect_screen_notify_timeout,
            disconnect_keep_alive_interval: config.disconnect_keep_alive_interval,
            outbound: VecDeque::new(),
        }
    }

    /// Marks the machine started: frame 0 ready, stall timer baselined.
    pub fn start(&mut self, now: Instant) {
        self.frame_ready = true;
        self.ready_frames.insert(Frame::ZERO);
        self.last_advance = Some(now);
    }

    /// Re-homes the machine when a user list reveals the local slot.
    pub fn set_local_slot(&mut self, slot: PlayerSlot) {
        self.local_slot = slot;
    }

    /// Installs the host's extra readiness predicate.
    pub fn set_continuation_gate(&mut self, gate: ContinuationGate) {
        self.continuation_gate = Some(gate);
    }

    /// Removes the host's readiness predicate.
    pub fn clear_continuation_gate(&mut self) {
        self.continuation_gate = None;
    }

    // =========================================================================
    // Readiness protocol
    // =========================================================================

    /// Marks `frame` as having local data ready.
    pub fn mark_frame_ready(&mut self, frame: Frame) {
        self.frame_ready = true;
        self.ready_frames.insert(frame);
    }

    /// Records a FrameInfo receipt: `slot` announced `count` synchronized
    /// commands for `frame`.
    pub fn record_frame_info(&mut self, slot: PlayerSlot, frame: Frame, count: u32) {
        let entry = self.expectations.entry(frame).entry(slot).or_default();
        entry.expected = Some(count);
        trace!(%slot, %frame, count, "frame info recorded");
    }

    /// Records receipt of a synchronized command from `sender` executing in
    /// `frame`.
    ///
    /// When the receipt count rises above the announced expectation — or
    /// when a command arrives before any FrameInfo, in which case the
    /// expectation is treated as zero — a frame-resend-request is emitted
    /// targeted at the sender (or the first other connected slot when the
    /// sender is already out), and the overflow is recorded.
    pub fn record_synchronized_command(
        &mut self,
        sender: PlayerSlot,
        frame: Frame,
        connected: ConnectionSet,
    ) {
        let entry = self.expectations.entry(frame).entry(sender).or_default();
        entry.received += 1;
        let received = entry.received;
        let expected = entry.expected.unwrap_or(0);
        if received > expected {
            self.saw_count_mismatch = true;
            self.resend_requests.push(ResendRequest {
                player_id: sender,
                frame,
            });
            let target = if connected.contains(sender) {
                Some(sender)
            } else {
                connected
                    .slots()
                    .find(|s| *s != self.local_slot && *s != sender)
            };
            if let Some(target) = target {
                debug!(%sender, %frame, received, expected, %target, "command count overflow, requesting resend");
                let request = NetCommand::new(CommandKind::FrameResendRequest)
                    .with_sender(self.local_slot)
                    .with_payload(Payload::FrameResendRequest {
                        frame_to_resend: frame,
                    });
                self.outbound.push_back((request, target.mask()));
            }
        }
    }

    fn expectations_satisfied(&self, frame: Frame, connected: ConnectionSet) -> bool {
        for peer in connected.slots().filter(|s| *s != self.local_slot) {
            let expectation = self
                .expectations
                .get(frame)
                .and_then(|by_slot| by_slot.get(&peer).copied());
            match expectation.and_then(|e| e.expected.map(|ex| (ex, e.received))) {
                // The peer still owes a FrameInfo for this frame.
                None => return false,
                Some((expected, received)) if received < expected => return false,
                Some(_) => {},
            }
        }
        true
    }

    /// Returns `true` when the current frame's data is complete: the frame
    /// is marked ready, every connected peer's expectation is known and
    /// satisfied, and the continuation gate (if any) passes.
    #[must_use]
    pub fn is_frame_data_ready(&self, current: Frame, connected: ConnectionSet) -> bool {
        if !self.frame_ready || !self.ready_frames.contains(&current) {
            return false;
        }
        if !self.expectations_satisfied(current, connected) {
            return false;
        }
        match &self.continuation_gate {
            Some(gate) => gate(current),
            None => true,
        }
    }

    /// Consumes a ready frame.
    ///
    /// Returns `true` exactly once per frame whose readiness is satisfied;
    /// the expectation entries for the frame are cleared and the frame
    /// leaves the ready set. The caller advances the validation window and
    /// prunes the archive on a `true` return.
    pub fn consume_ready_frame(&mut self, frame: Frame, connected: ConnectionSet) -> bool {
        if !self.is_frame_data_ready(frame, connected) {
            return false;
        }
        self.ready_frames.remove(&frame);
        self.expectations.remove(frame);
        self.frame_ready = false;
        true
    }

    /// Bumps the pending notice counter and the expected network frame.
    pub fn notify_new_frame(&mut self, frame: Frame) {
        self.pending_frame_notices += 1;
        if frame > self.expected_network_frame {
            self.expected_network_frame = frame;
        }
    }

    /// Frames with recorded command-count overflows, in observation order.
    #[must_use]
    pub fn resend_requests(&self) -> &[ResendRequest] {
        &self.resend_requests
    }

    /// Returns `true` once any command-count overflow has been observed.
    #[inline]
    #[must_use]
    pub fn saw_frame_command_count_mismatch(&self) -> bool {
        self.saw_count_mismatch
    }

    /// The highest frame others have been told about.
    #[inline]
    #[must_use]
    pub fn expected_network_frame(&self) -> Frame {
        self.expected_network_frame
    }

    /// Number of frame notices not yet consumed by the host.
    #[inline]
    #[must_use]
    pub fn pending_frame_notices(&self) -> u32 {
        self.pending_frame_notices
    }

    // =========================================================================
    // Disconnect stall, keep-alive, and packet-router eviction
    // =========================================================================

    /// Records a local frame advance: the stall timer re-baselines and the
    /// disconnect screen comes down.
    pub fn record_self_advance(&mut self, now: Instant) {
        self.last_advance = Some(now);
        self.stalled = false;
        if self.screen == DisconnectScreen::On {
            debug!("frame advanced, disconnect screen off");
            self.screen = DisconnectScreen::Off;
        }
    }

    /// Polls the stall state.
    ///
    /// On the transition from fresh to stalled, per-peer last-heard
    /// baselines reset and the disconnect screen goes up. While the screen
    /// is up, keep-alives are paced to at most one per configured interval,
    /// and — when the local slot is the packet router — peers silent for
    /// longer than the player timeout are evicted: a disconnect-player and
    /// a destroy-player command are emitted for each, and the evicted slots
    /// are returned for the caller to drop from the connection set and
    /// stage into the queue and archive.
    pub fn evaluate_stall(
        &mut self,
        now: Instant,
        current_frame: Frame,
        execution_frame: Frame,
        connected: ConnectionSet,
        is_packet_router: bool,
    ) -> SmallVec<[PlayerSlot; 2]> {
        let mut evicted = SmallVec::new();
        let Some(last_advance) = self.last_advance else {
            return evicted;
        };

        if !self.stalled {
            if now.duration_since(last_advance) <= self.disconnect_timeout {
                return evicted;
            }
            // Fresh -> stalled: baseline the peers and raise the screen.
            self.stalled = true;
            self.screen = DisconnectScreen::On;
            self.last_keep_alive = None;
            self.last_heard.clear();
            for peer in connected.slots().filter(|s| *s != self.local_slot) {
                self.last_heard.insert(peer, now);
            }
            debug!(%current_frame, "simulation stalled, disconnect screen on");
        }

        if self.screen != DisconnectScreen::On {
            return evicted;
        }

        let others = connected.relay_mask_excluding(self.local_slot);
        let keep_alive_due = match self.last_keep_alive {
            None => true,
            Some(at) => now.duration_since(at) >= self.disconnect_keep_alive_interval,
        };
        if keep_alive_due && !others.is_empty() {
            let keep_alive =
                NetCommand::new(CommandKind::DisconnectKeepAlive).with_sender(self.local_slot);
            self.outbound.push_back((keep_alive, others));
            self.last_keep_alive = Some(now);
        }

        if is_packet_router {
            let silent: Vec<PlayerSlot> = connected
                .slots()
                .filter(|s| *s != self.local_slot)
                .filter(|s| {
                    self.last_heard
                        .get(s)
                        .is_some_and(|heard| now.duration_since(*heard) > self.disconnect_player_timeout)
                })
                .collect();
            for peer in silent {
                debug!(%peer, %current_frame, "packet router evicting silent peer");
                let disconnect = NetCommand::new(CommandKind::DisconnectPlayer)
                    .with_sender(self.local_slot)
                    .with_execution_frame(current_frame)
                    .with_payload(Payload::DisconnectPlayer {
                        disconnect_slot: peer.as_u8(),
                        disconnect_frame: current_frame,
                    });
                let destroy = NetCommand::new(CommandKind::DestroyPlayer)
                    .with_sender(self.local_slot)
                    .with_execution_frame(execution_frame + 1)
                    .with_payload(Payload::DestroyPlayer {
                        player_index: u32::from(peer.as_u8()),
                    });
                self.outbound.push_back((disconnect, others));
                self.outbound.push_back((destroy, others));
                self.last_heard.remove(&peer);
                evicted.push(peer);
            }
        }

        evicted
    }

    /// Records a disconnect keep-alive from `slot`.
    pub fn receive_disconnect_keep_alive(&mut self, slot: PlayerSlot, now: Instant) {
        self.last_heard.insert(slot, now);
    }

    /// Current disconnect screen state.
    #[inline]
    #[must_use]
    pub fn screen(&self) -> DisconnectScreen {
        self.screen
    }

    /// Peers that have been silent past the screen-notify timeout while the
    /// disconnect screen is up, for the host's dialog.
    #[must_use]
    pub fn unresponsive_peers(&self, now: Instant, connected: ConnectionSet) -> Vec<PlayerSlot> {
        if self.screen != DisconnectScreen::On {
            return Vec::new();
        }
        connected
            .slots()
            .filter(|s| *s != self.local_slot)
            .filter(|s| {
                self.last_heard.get(s).is_some_and(|heard| {
                    now.duration_since(*heard) > self.disconnect_screen_notify_timeout
                })
            })
            .collect()
    }

    // =========================================================================
    // Disconnect voting
    // =========================================================================

    fn vote_majority_reached(&self, target: PlayerSlot, frame: Frame, connected: ConnectionSet) -> bool {
        let tally = self
            .votes
            .get(&(target, frame))
            .map_or(0, BTreeSet::len);
        let others = connected.slots().filter(|s| *s != target).count();
        tally * 2 > others
    }

    /// Casts the local vote to disconnect `target` at `current_frame`.
    ///
    /// The vote is tallied locally and a disconnect-vote command is emitted
    /// to all other connected peers. Returns the target when the tally
    /// reaches a majority of the other connected peers.
    pub fn vote_for_player_disconnect(
        &mut self,
        target: PlayerSlot,
        current_frame: Frame,
        connected: ConnectionSet,
    ) -> Option<PlayerSlot> {
        if target == self.local_slot {
            trace!("ignoring vote against the local slot");
            return None;
        }
        let voters = self.votes.entry((target, current_frame)).or_default();
        if !voters.insert(self.local_slot) {
            return None;
        }
        let vote = NetCommand::new(CommandKind::DisconnectVote)
            .with_sender(self.local_slot)
            .with_execution_frame(current_frame)
            .with_payload(Payload::DisconnectVote {
                vote_slot: target.as_u8(),
                vote_frame: current_frame,
            });
        self.outbound
            .push_back((vote, connected.relay_mask_excluding(self.local_slot)));
        self.vote_majority_reached(target, current_frame, connected)
            .then_some(target)
    }

    /// Records a disconnect-vote received from `voter` against `target`.
    ///
    /// Counted iff the voter is connected, has not already voted on this
    /// target's vote frame, and the target is not the local slot (inbound
    /// votes against the local peer are consumed but ignored). Returns the
    /// target when the tally reaches a majority of the other connected
    /// peers.
    pub fn receive_disconnect_vote(
        &mut self,
        voter: PlayerSlot,
        target: PlayerSlot,
        vote_frame: Frame,
        connected: ConnectionSet,
    ) -> Option<PlayerSlot> {
        if target == self.local_slot {
            trace!(%voter, "ignoring vote against the local slot");
            return None;
        }
        if !connected.contains(voter) {
            trace!(%voter, "ignoring vote from disconnected peer");
            return None;
        }
        let voters = self.votes.entry((target, vote_frame)).or_default();
        if !voters.insert(voter) {
            trace!(%voter, %target, "duplicate vote ignored");
            return None;
        }
        self.vote_majority_reached(target, vote_frame, connected)
            .then_some(target)
    }

    /// Tally of distinct voters against `target` at `frame`.
    #[must_use]
    pub fn disconnect_vote_count(&self, target: PlayerSlot, frame: Frame) -> usize {
        self.votes.get(&(target, frame)).map_or(0, BTreeSet::len)
    }

    // =========================================================================
    // Disconnect frames and screen-off
    // =========================================================================

    /// Records a disconnect-frame report: `slot` has reached `frame`.
    ///
    /// Sets the receipt bit. Returns the frame range to replay back to the
    /// peer when the reported frame is behind the local current frame.
    pub fn record_disconnect_frame(
        &mut self,
        slot: PlayerSlot,
        frame: Frame,
        current_frame: Frame,
    ) -> Option<(Frame, Frame)> {
        self.disconnect_frame_by_peer.insert(slot, frame);
        self.disconnect_frame_receipts.insert(slot);
        (frame < current_frame).then_some((frame, current_frame))
    }

    /// Records a disconnect-screen-off from `slot` at `new_frame`.
    ///
    /// Overwrites the peer's disconnect frame and clears its receipt bit.
    /// When the sender is the local packet router, the screen comes down
    /// and a frame notice is raised so the simulation resumes.
    pub fn record_disconnect_screen_off(
        &mut self,
        slot: PlayerSlot,
        new_frame: Frame,
        from_packet_router: bool,
    ) {
        self.disconnect_frame_by_peer.insert(slot, new_frame);
        self.disconnect_frame_receipts.remove(&slot);
        if from_packet_router {
            self.acknowledge_packet_router(new_frame);
        }
    }

    /// Handles an ack from the packet router: screen off plus a pending
    /// frame notice so the simulation resumes.
    pub fn acknowledge_packet_router(&mut self, frame: Frame) {
        if self.screen == DisconnectScreen::On {
            debug!(%frame, "packet router ack, disconnect screen off");
            self.screen = DisconnectScreen::Off;
            self.stalled = false;
            self.pending_frame_notices += 1;
            if frame > self.expected_network_frame {
                self.expected_network_frame = frame;
            }
        }
    }

    /// The last reported disconnect frame for `slot`, if any.
    #[must_use]
    pub fn disconnect_frame_of(&self, slot: PlayerSlot) -> Option<Frame> {
        self.disconnect_frame_by_peer.get(&slot).copied()
    }

    /// Whether a disconnect-frame receipt is held for `slot`.
    #[must_use]
    pub fn has_disconnect_frame_receipt(&self, slot: PlayerSlot) -> bool {
        self.disconnect_frame_receipts.contains(&slot)
    }

    /// Drops every record of `slot` from the disconnect sub-state.
    pub fn forget_peer(&mut self, slot: PlayerSlot) {
        self.last_heard.remove(&slot);
        self.disconnect_frame_by_peer.remove(&slot);
        self.disconnect_frame_receipts.remove(&slot);
    }

    /// Drains the outbound command queue in emission order.
    pub fn drain_outbound(&mut self) -> Vec<(NetCommand, RelayMask)> {
        self.outbound.drain(..).collect()
    }

    /// Wipes per-session state back to pristine; the continuation gate and
    /// timing configuration survive.
    pub fn reset(&mut self, now: Instant) {
        self.frame_ready = false;
        self.expected_network_frame = Frame::ZERO;
        self.pending_frame_notices = 0;
        self.ready_frames.clear();
        self.expectations.clear();
        self.resend_requests.clear();
        self.saw_count_mismatch = false;
        self.screen = DisconnectScreen::Off;
        self.stalled = false;
        self.last_advance = Some(now);
        self.last_keep_alive = None;
        self.last_heard.clear();
        self.votes.clear();
        self.disconnect_frame_by_peer.clear();
        self.disconnect_frame_receipts.clear();
        self.outbound.clear();
    }
}

impl std::fmt::Debug for FrameStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStateMachine")
            .field("local_slot", &self.local_slot)
            .field("frame_ready", &self.frame_ready)
            .field("screen", &self.screen)
            .field("pending_frame_notices", &self.pending_frame_notices)
            .field("saw_count_mismatch", &self.saw_count_mismatch)
            .finish_non_exhaustive()
    }
}
