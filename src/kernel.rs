//! The deterministic state kernel.
//!
//! [`LockstepKernel`] owns the per-frame command queue and the two
//! validation ledgers: per-frame content hashes (computed from the queue
//! itself) and game-logic CRCs (computed by externally supplied section
//! writers). Mismatches between local and remote values never terminate the
//! kernel — they set a sticky flag and record the offending frame so the
//! host can decide when to surface a desync dialog.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::codec;
use crate::crc::{crc32, Crc32, GameLogicCrcWriters};
use crate::frame_window::FrameWindow;
use crate::{Frame, PlayerSlot, FRAMES_TO_KEEP};

/// A command staged for execution on the current frame.
///
/// Commands passed into the kernel are copied into the queue, never
/// aliased; the queue is cleared at the end of every local tick immediately
/// before the frame counter advances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterministicCommand {
    /// Wire code of the command kind.
    pub command_type: u8,
    /// The issuing player.
    pub player_id: PlayerSlot,
    /// Sequencing number within the frame.
    pub sort_number: i32,
    /// Opaque command bytes, hashed into the frame hash.
    pub payload: Vec<u8>,
    /// Dedup key, present when the command carried a command id.
    pub dedupe_key: Option<String>,
}

impl DeterministicCommand {
    /// Creates a command with no dedup key.
    #[must_use]
    pub fn new(command_type: u8, player_id: PlayerSlot, sort_number: i32, payload: Vec<u8>) -> Self {
        Self {
            command_type,
            player_id,
            sort_number,
            payload,
            dedupe_key: None,
        }
    }

    /// Creates a command with the canonical `"type:player:sort"` dedup key.
    #[must_use]
    pub fn keyed(
        command_type: u8,
        player_id: PlayerSlot,
        sort_number: i32,
        payload: Vec<u8>,
    ) -> Self {
        let dedupe_key = Some(format!("{command_type}:{player_id}:{sort_number}"));
        Self {
            command_type,
            player_id,
            sort_number,
            payload,
            dedupe_key,
        }
    }
}

/// Whether the connected peers agree on a frame's game-logic CRC.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConsensusStatus {
    /// At least one connected peer has not reported yet.
    Pending,
    /// Every connected peer reported the validator's value.
    Match,
    /// At least one connected peer reported a different value.
    Mismatch,
}

/// Result of evaluating game-logic CRC consensus for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrcConsensus {
    /// Overall agreement status.
    pub status: ConsensusStatus,
    /// The local (validator) CRC, when available.
    pub validator_crc: Option<u32>,
    /// Peers whose reported value differs from the validator's.
    pub mismatched_player_ids: Vec<PlayerSlot>,
    /// Connected peers that have not reported for the frame.
    pub missing_player_ids: Vec<PlayerSlot>,
}

#[derive(Debug, Default, Clone)]
struct LedgerEntry {
    local: Option<u32>,
    remote: BTreeMap<PlayerSlot, u32>,
}

/// Per-frame command queue plus the frame-hash and game-logic CRC ledgers.
pub struct LockstepKernel {
    game_frame: Frame,
    queue: Vec<DeterministicCommand>,
    frame_hashes: FrameWindow<LedgerEntry>,
    logic_crcs: FrameWindow<LedgerEntry>,
    crc_mismatch: bool,
    frame_hash_mismatches: Vec<Frame>,
    logic_crc_mismatches: Vec<Frame>,
    writers: Option<GameLogicCrcWriters>,
}

impl LockstepKernel {
    /// Creates a kernel at frame 0 with empty ledgers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            game_frame: Frame::ZERO,
            queue: Vec::new(),
            frame_hashes: FrameWindow::new(FRAMES_TO_KEEP),
            logic_crcs: FrameWindow::new(FRAMES_TO_KEEP),
            crc_mismatch: false,
            frame_hash_mismatches: Vec::new(),
            logic_crc_mismatches: Vec::new(),
            writers: None,
        }
    }

    /// The last frame whose local state has been computed.
    #[inline]
    #[must_use]
    pub fn game_frame(&self) -> Frame {
        self.game_frame
    }

    /// Appends a command to the current frame's queue.
    ///
    /// Returns `false` without enqueueing when a command with the same
    /// dedup key is already queued.
    pub fn enqueue(&mut self, command: DeterministicCommand) -> bool {
        if let Some(key) = &command.dedupe_key {
            if self
                .queue
                .iter()
                .any(|queued| queued.dedupe_key.as_deref() == Some(key.as_str()))
            {
                trace!(key = %key, "dropping duplicate queued command");
                return false;
            }
        }
        self.queue.push(command);
        true
    }

    /// Number of commands queued for the current frame.
    #[inline]
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// The commands queued for the current frame, in arrival order.
    #[must_use]
    pub fn queued_commands(&self) -> &[DeterministicCommand] {
        &self.queue
    }

    /// Clears the current frame's queue.
    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    /// Advances the frame counter by one.
    pub fn advance_frame(&mut self) {
        self.game_frame += 1;
    }

    // Canonical fold: frame number and queue length, then per command the
    // type, player, sort number, and a CRC of the payload bytes, all in
    // fixed-int little-endian encoding, in arrival order.
    fn canonical_hash(&self, frame: Frame) -> u32 {
        let mut crc = Crc32::new();
        Self::fold_encoded(&mut crc, &(frame.as_u32(), self.queue.len() as u32));
        for command in &self.queue {
            Self::fold_encoded(
                &mut crc,
                &(
                    command.command_type,
                    command.player_id.as_u8(),
                    command.sort_number,
                    crc32(&command.payload),
                ),
            );
        }
        crc.finish()
    }

    fn fold_encoded<T: serde::Serialize>(crc: &mut Crc32, value: &T) {
        match codec::encode(value) {
            Ok(bytes) => crc.update(&bytes),
            Err(err) => debug!(%err, "canonical encoding failed; skipping fold"),
        }
    }

    /// Computes and records the local frame hash for `frame`.
    ///
    /// Idempotent per frame: the first call folds the current queue, later
    /// calls return the recorded value. Recording a local value compares it
    /// against any remote values already cached for the frame.
    pub fn record_local_frame_hash(&mut self, frame: Frame) -> u32 {
        if let Some(entry) = self.frame_hashes.get(frame) {
            if let Some(local) = entry.local {
                return local;
            }
        }
        let hash = self.canonical_hash(frame);
        let entry = self.frame_hashes.entry(frame);
        entry.local = Some(hash);
        let disagreements: Vec<PlayerSlot> = entry
            .remote
            .iter()
            .filter(|(_, &remote)| remote != hash)
            .map(|(slot, _)| *slot)
            .collect();
        if !disagreements.is_empty() {
            self.flag_frame_hash_mismatch(frame, &disagreements);
        }
        hash
    }

    /// The recorded local frame hash for `frame`, if any.
    #[must_use]
    pub fn local_frame_hash(&self, frame: Frame) -> Option<u32> {
        self.frame_hashes.get(frame).and_then(|entry| entry.local)
    }

    /// Records a remote frame hash report.
    ///
    /// If a local value for the frame exists and differs, the sticky
    /// mismatch flag is set and the frame is appended to the mismatch list.
    pub fn record_remote_frame_hash(&mut self, frame: Frame, slot: PlayerSlot, hash: u32) {
        let entry = self.frame_hashes.entry(frame);
        entry.remote.insert(slot, hash);
        if matches!(entry.local, Some(local) if local != hash) {
            self.flag_frame_hash_mismatch(frame, &[slot]);
        }
    }

    fn flag_frame_hash_mismatch(&mut self, frame: Frame, slots: &[PlayerSlot]) {
        debug!(%frame, ?slots, "frame hash mismatch");
        self.crc_mismatch = true;
        if !self.frame_hash_mismatches.contains(&frame) {
            self.frame_hash_mismatches.push(frame);
        }
    }

    /// Installs the game-logic CRC section writers.
    ///
    /// Remote CRC values cached before the writers existed are reconciled
    /// immediately: the local value is computed for every such frame and
    /// compared.
    pub fn install_section_writers(&mut self, writers: GameLogicCrcWriters) {
        self.writers = Some(writers);
        let pending: Vec<Frame> = self
            .logic_crcs
            .frames()
            .into_iter()
            .filter(|frame| {
                self.logic_crcs
                    .get(*frame)
                    .is_some_and(|entry| entry.local.is_none() && !entry.remote.is_empty())
            })
            .collect();
        for frame in pending {
            self.compute_game_logic_crc(frame);
        }
    }

    /// Returns `true` when section writers are installed.
    #[must_use]
    pub fn has_section_writers(&self) -> bool {
        self.writers.is_some()
    }

    /// Computes and records the local game-logic CRC for `frame`.
    ///
    /// Returns `None` when no section writers are configured. Idempotent
    /// per frame. Recording a local value compares it against any remote
    /// values already cached.
    pub fn compute_game_logic_crc(&mut self, frame: Frame) -> Option<u32> {
        if let Some(entry) = self.logic_crcs.get(frame) {
            if let Some(local) = entry.local {
                return Some(local);
            }
        }
        let crc = self.writers.as_ref()?.compute(frame);
        let entry = self.logic_crcs.entry(frame);
        entry.local = Some(crc);
        let disagreements: Vec<PlayerSlot> = entry
            .remote
            .iter()
            .filter(|(_, &remote)| remote != crc)
            .map(|(slot, _)| *slot)
            .collect();
        if !disagreements.is_empty() {
            self.flag_logic_crc_mismatch(frame, &disagreements);
        }
        Some(crc)
    }

    /// The recorded local game-logic CRC for `frame`, if any.
    #[must_use]
    pub fn local_game_logic_crc(&self, frame: Frame) -> Option<u32> {
        self.logic_crcs.get(frame).and_then(|entry| entry.local)
    }

    /// Records a remote game-logic CRC report.
    ///
    /// Remote values are cached even when no local writers are available;
    /// they are reconciled the moment writers become configured.
    pub fn record_remote_game_logic_crc(&mut self, frame: Frame, slot: PlayerSlot, crc: u32) {
        let entry = self.logic_crcs.entry(frame);
        entry.remote.insert(slot, crc);
        if matches!(entry.local, Some(local) if local != crc) {
            self.flag_logic_crc_mismatch(frame, &[slot]);
        }
    }

    fn flag_logic_crc_mismatch(&mut self, frame: Frame, slots: &[PlayerSlot]) {
        debug!(%frame, ?slots, "game logic CRC mismatch");
        self.crc_mismatch = true;
        if !self.logic_crc_mismatches.contains(&frame) {
            self.logic_crc_mismatches.push(frame);
        }
    }

    /// Evaluates game-logic CRC consensus for `frame` across the connected
    /// peers.
    ///
    /// The local slot acts as the validator; remote peers are compared
    /// against the local value.
    #[must_use]
    pub fn consensus(
        &self,
        frame: Frame,
        connected: impl Iterator<Item = PlayerSlot>,
        local_slot: PlayerSlot,
    ) -> CrcConsensus {
        let entry = self.logic_crcs.get(frame);
        let validator_crc = entry.and_then(|e| e.local);
        let mut mismatched = Vec::new();
        let mut missing = Vec::new();
        for peer in connected.filter(|slot| *slot != local_slot) {
            let reported = entry.and_then(|e| e.remote.get(&peer).copied());
            match (reported, validator_crc) {
                (Some(remote), Some(local)) if remote != local => mismatched.push(peer),
                (Some(_), _) => {},
                (None, _) => missing.push(peer),
            }
        }
        let status = if !mismatched.is_empty() {
            ConsensusStatus::Mismatch
        } else if validator_crc.is_none() || !missing.is_empty() {
            ConsensusStatus::Pending
        } else {
            ConsensusStatus::Match
        };
        CrcConsensus {
            status,
            validator_crc,
            mismatched_player_ids: mismatched,
            missing_player_ids: missing,
        }
    }

    /// Returns the sticky mismatch flag.
    ///
    /// Set the moment any frame-hash or game-logic CRC disagreement is
    /// observed; never cleared within a session.
    #[inline]
    #[must_use]
    pub fn saw_crc_mismatch(&self) -> bool {
        self.crc_mismatch
    }

    /// Frames with observed frame-hash mismatches, in observation order.
    #[must_use]
    pub fn frame_hash_mismatch_frames(&self) -> &[Frame] {
        &self.frame_hash_mismatches
    }

    /// Frames with observed game-logic CRC mismatches, in observation order.
    #[must_use]
    pub fn game_logic_crc_mismatch_frames(&self) -> &[Frame] {
        &self.logic_crc_mismatches
    }

    /// Removes all ledger entries and mismatch marks for frames strictly
    /// less than `frame`.
    pub fn prune_before(&mut self, frame: Frame) {
        self.frame_hashes.prune_before(frame);
        self.logic_crcs.prune_before(frame);
        self.frame_hash_mismatches.retain(|f| *f >= frame);
        self.logic_crc_mismatches.retain(|f| *f >= frame);
    }

    /// Wipes per-session state: frame counter, queue, ledgers, and
    /// mismatch history. Installed section writers are configuration and
    /// survive.
    pub fn reset(&mut self) {
        self.game_frame = Frame::ZERO;
        self.queue.clear();
        self.frame_hashes.clear();
        self.logic_crcs.clear();
        self.crc_mismatch = false;
        self.frame_hash_mismatches.clear();
        self.logic_crc_mismatches.clear();
    }
}

impl Default for LockstepKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockstepKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockstepKernel")
            .field("game_frame", &self.game_frame)
            .field("queued", &self.queue.len())
            .field("crc_mismatch", &self.crc_mismatch)
            .field("has_writers", &self.writers.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::crc::Crc32;

    fn writers_with_tag(tag: &'static [u8]) -> GameLogicCrcWriters {
        GameLogicCrcWriters {
            objects: Box::new(move |crc: &mut Crc32| crc.update(tag)),
            partition_manager: Box::new(|crc: &mut Crc32| crc.update(b"partition")),
            player_list: Box::new(|crc: &mut Crc32| crc.update(b"players")),
            ai: Box::new(|crc: &mut Crc32| crc.update(b"ai")),
        }
    }

    #[test]
    fn enqueue_deduplicates_by_key() {
        let mut kernel = LockstepKernel::new();
        let cmd = DeterministicCommand::keyed(4, PlayerSlot::new(1), 200, vec![1, 2, 3]);
        assert!(kernel.enqueue(cmd.clone()));
        assert!(!kernel.enqueue(cmd));
        assert_eq!(kernel.queued_len(), 1);
    }

    #[test]
    fn keyless_commands_never_deduplicate() {
        let mut kernel = LockstepKernel::new();
        let cmd = DeterministicCommand::new(4, PlayerSlot::new(1), 0, vec![]);
        assert!(kernel.enqueue(cmd.clone()));
        assert!(kernel.enqueue(cmd));
        assert_eq!(kernel.queued_len(), 2);
    }

    #[test]
    fn local_hash_is_idempotent_and_queue_sensitive() {
        let mut kernel = LockstepKernel::new();
        kernel.enqueue(DeterministicCommand::keyed(
            4,
            PlayerSlot::new(1),
            200,
            vec![1],
        ));
        let first = kernel.record_local_frame_hash(Frame::new(5));
        assert_eq!(kernel.record_local_frame_hash(Frame::new(5)), first);

        // A different queue produces a different hash for another frame.
        kernel.enqueue(DeterministicCommand::keyed(
            4,
            PlayerSlot::new(1),
            201,
            vec![2],
        ));
        let second = kernel.record_local_frame_hash(Frame::new(6));
        assert_ne!(first, second);
    }

    #[test]
    fn hash_differs_per_frame_even_with_identical_queue() {
        let mut kernel = LockstepKernel::new();
        let a = kernel.record_local_frame_hash(Frame::new(1));
        let b = kernel.record_local_frame_hash(Frame::new(2));
        assert_ne!(a, b);
    }

    #[test]
    fn remote_mismatch_flags_sticky() {
        let mut kernel = LockstepKernel::new();
        let local = kernel.record_local_frame_hash(Frame::new(5));
        kernel.record_remote_frame_hash(Frame::new(5), PlayerSlot::new(1), local);
        assert!(!kernel.saw_crc_mismatch());

        kernel.record_remote_frame_hash(Frame::new(5), PlayerSlot::new(1), local ^ 1);
        assert!(kernel.saw_crc_mismatch());
        assert_eq!(kernel.frame_hash_mismatch_frames(), &[Frame::new(5)]);

        // Sticky: agreement afterwards does not clear the flag.
        kernel.record_remote_frame_hash(Frame::new(6), PlayerSlot::new(1), 0);
        assert!(kernel.saw_crc_mismatch());
    }

    #[test]
    fn remote_before_local_is_compared_when_local_lands() {
        let mut kernel = LockstepKernel::new();
        kernel.record_remote_frame_hash(Frame::new(3), PlayerSlot::new(2), 0xDEAD);
        assert!(!kernel.saw_crc_mismatch(), "local unknown, nothing to compare");

        let local = kernel.record_local_frame_hash(Frame::new(3));
        assert_ne!(local, 0xDEAD);
        assert!(kernel.saw_crc_mismatch());
        assert_eq!(kernel.frame_hash_mismatch_frames(), &[Frame::new(3)]);
    }

    #[test]
    fn logic_crc_unavailable_without_writers() {
        let mut kernel = LockstepKernel::new();
        assert_eq!(kernel.compute_game_logic_crc(Frame::new(1)), None);
    }

    #[test]
    fn cached_remote_crcs_reconcile_on_writer_install() {
        let mut kernel = LockstepKernel::new();
        kernel.record_remote_game_logic_crc(Frame::new(10), PlayerSlot::new(1), 0x1234);
        assert!(!kernel.saw_crc_mismatch());

        kernel.install_section_writers(writers_with_tag(b"objects"));
        assert!(kernel.saw_crc_mismatch(), "cached remote reconciled on install");
        assert_eq!(kernel.game_logic_crc_mismatch_frames(), &[Frame::new(10)]);
    }

    #[test]
    fn consensus_transitions() {
        let mut kernel = LockstepKernel::new();
        kernel.install_section_writers(writers_with_tag(b"objects"));
        let local = PlayerSlot::new(0);
        let peers = [PlayerSlot::new(0), PlayerSlot::new(1), PlayerSlot::new(2)];
        let frame = Frame::new(30);
        let crc = kernel.compute_game_logic_crc(frame).unwrap();

        let pending = kernel.consensus(frame, peers.iter().copied(), local);
        assert_eq!(pending.status, ConsensusStatus::Pending);
        assert_eq!(
            pending.missing_player_ids,
            vec![PlayerSlot::new(1), PlayerSlot::new(2)]
        );

        kernel.record_remote_game_logic_crc(frame, PlayerSlot::new(1), crc);
        let still_pending = kernel.consensus(frame, peers.iter().copied(), local);
        assert_eq!(still_pending.status, ConsensusStatus::Pending);
        assert_eq!(still_pending.missing_player_ids, vec![PlayerSlot::new(2)]);

        kernel.record_remote_game_logic_crc(frame, PlayerSlot::new(2), crc.wrapping_add(1));
        let mismatch = kernel.consensus(frame, peers.iter().copied(), local);
        assert_eq!(mismatch.status, ConsensusStatus::Mismatch);
        assert_eq!(mismatch.mismatched_player_ids, vec![PlayerSlot::new(2)]);
        assert_eq!(mismatch.validator_crc, Some(crc));
    }

    #[test]
    fn consensus_match_when_all_agree() {
        let mut kernel = LockstepKernel::new();
        kernel.install_section_writers(writers_with_tag(b"objects"));
        let frame = Frame::new(7);
        let crc = kernel.compute_game_logic_crc(frame).unwrap();
        kernel.record_remote_game_logic_crc(frame, PlayerSlot::new(1), crc);

        let result = kernel.consensus(
            frame,
            [PlayerSlot::new(0), PlayerSlot::new(1)].into_iter(),
            PlayerSlot::new(0),
        );
        assert_eq!(result.status, ConsensusStatus::Match);
        assert!(result.mismatched_player_ids.is_empty());
        assert!(result.missing_player_ids.is_empty());
    }

    #[test]
    fn prune_before_clears_history_exactly() {
        let mut kernel = LockstepKernel::new();
        for raw in 0..10u32 {
            kernel.record_local_frame_hash(Frame::new(raw));
            kernel.record_remote_frame_hash(Frame::new(raw), PlayerSlot::new(1), raw);
        }
        assert!(kernel.saw_crc_mismatch());
        let before = kernel.frame_hash_mismatch_frames().len();
        assert!(before > 0);

        kernel.prune_before(Frame::new(6));
        assert!(kernel.local_frame_hash(Frame::new(5)).is_none());
        assert!(kernel.local_frame_hash(Frame::new(6)).is_some());
        assert!(kernel
            .frame_hash_mismatch_frames()
            .iter()
            .all(|f| *f >= Frame::new(6)));
        // The sticky flag survives pruning.
        assert!(kernel.saw_crc_mismatch());
    }

    #[test]
    fn reset_returns_to_pristine_but_keeps_writers() {
        let mut kernel = LockstepKernel::new();
        kernel.install_section_writers(writers_with_tag(b"objects"));
        kernel.enqueue(DeterministicCommand::new(4, PlayerSlot::new(0), 0, vec![]));
        kernel.advance_frame();
        kernel.record_local_frame_hash(Frame::new(1));
        kernel.record_remote_frame_hash(Frame::new(1), PlayerSlot::new(1), 0xBAD);

        kernel.reset();
        assert_eq!(kernel.game_frame(), Frame::ZERO);
        assert_eq!(kernel.queued_len(), 0);
        assert!(!kernel.saw_crc_mismatch());
        assert!(kernel.frame_hash_mismatch_frames().is_empty());
        assert!(kernel.has_section_writers());
    }
}
