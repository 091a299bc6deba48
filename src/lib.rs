//! # Bastion Lockstep
//!
//! Bastion Lockstep is a deterministic multiplayer network kernel for
//! real-time strategy games, written in 100% safe Rust. It keeps every
//! participant of a lockstep simulation executing an identical per-frame
//! command list, validates determinism with per-frame content hashes and
//! game-logic CRCs, and arbitrates peer disconnection through keep-alives,
//! votes, and a packet-router.
//!
//! The kernel is transport-agnostic: hosts feed it inbound command records
//! through [`NetworkManager::process_incoming_command`] and attach a
//! [`Transport`] implementation for outbound traffic. Everything else — the
//! command queue, the frame-hash and CRC ledgers, the resend archive, the
//! wrapper reassembly table, and the disconnect state machine — is owned by
//! the [`NetworkManager`].
//!
//! The kernel is single-threaded by design: all public operations run to
//! completion and there is no internal locking. Timers are polled inside
//! [`NetworkManager::update`] against a wall-clock reading; there is no
//! background task and no async runtime requirement.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use archive::FrameResendArchive;
pub use assembler::WrapperAssembler;
pub use command::CommandKind;
pub use config::NetworkConfig;
pub use crc::{Crc32, CrcSectionWriter, GameLogicCrcWriters};
pub use error::{ChunkRejectReason, WireError};
pub use frame_state::{ContinuationGate, DisconnectScreen, FrameStateMachine, ResendRequest};
pub use inbound::InboundCommand;
pub use kernel::{ConsensusStatus, CrcConsensus, DeterministicCommand, LockstepKernel};
pub use manager::instance::{initialize_network_client, network_client, shutdown_network_client};
pub use manager::user_list::{GameUser, UserKind, UserList};
pub use manager::{ChatEntry, NetworkManager, PacketRouterEvents, SlotMetrics};
pub use wire::payload::{ChatText, NetCommand, Payload};
pub use wire::wrapper::WrapperChunk;

pub mod archive;
pub mod assembler;
pub mod codec;
pub mod command;
pub mod config;
pub mod crc;
pub mod error;
pub mod frame_state;
mod frame_window;
pub mod inbound;
pub mod kernel;
pub mod manager;
#[cfg(test)]
pub(crate) mod test_config;
#[doc(hidden)]
pub mod wire {
    pub mod codec;
    pub mod payload;
    pub mod wrapper;
}

// #############
// # CONSTANTS #
// #############

/// Maximum number of player slots in a game.
///
/// Slots `0..N-1` are occupied for an `N`-player game; slot-to-player
/// identity is fixed for the lifetime of a game and never reassigned.
pub const MAX_SLOTS: usize = 16;

/// Number of frames retained by the bounded ledgers and the resend archive.
///
/// The frame-hash ledger, the game-logic CRC ledger, and the
/// [`FrameResendArchive`] all keep a sliding window of this many frames.
pub const FRAMES_TO_KEEP: usize = 65;

/// A frame is a single step of the lockstep simulation.
///
/// Frames are monotonically increasing and start at 0. The kernel tracks two
/// derived positions: the *game frame* (the last frame whose local state has
/// been computed) and the *execution frame* (the earliest frame into which
/// locally issued commands may be scheduled, `game_frame + run_ahead`).
///
/// # Examples
///
/// ```
/// use bastion_lockstep::Frame;
///
/// let frame = Frame::ZERO;
/// let next = frame + 1;
/// assert_eq!(next.as_u32(), 1);
/// assert!(next > frame);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(u32);

impl Frame {
    /// The first frame of a game.
    pub const ZERO: Frame = Frame(0);

    /// Creates a new `Frame` from a raw frame number.
    #[inline]
    #[must_use]
    pub const fn new(frame: u32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying frame number.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the frame `n` steps earlier, saturating at frame 0.
    #[inline]
    #[must_use]
    pub const fn saturating_sub(self, n: u32) -> Self {
        Frame(self.0.saturating_sub(n))
    }

    /// Ring-buffer index of this frame for a window of `len` slots.
    #[inline]
    #[must_use]
    pub(crate) const fn ring_index(self, len: usize) -> usize {
        (self.0 as usize) % len
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<u32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<u32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = u32;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

impl From<u32> for Frame {
    #[inline]
    fn from(value: u32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for u32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<u32> for Frame {
    #[inline]
    fn eq(&self, other: &u32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<u32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &u32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// Identifies a player slot in `[0, MAX_SLOTS)`.
///
/// Slot-to-player identity is fixed per game. The local slot is always part
/// of the connection set unless the game is terminating; disconnection is
/// monotonic within a game — once out, always out.
///
/// # Examples
///
/// ```
/// use bastion_lockstep::PlayerSlot;
///
/// let slot = PlayerSlot::new(3);
/// assert!(slot.is_valid());
/// assert_eq!(slot.mask().bits(), 0b1000);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerSlot(u8);

impl PlayerSlot {
    /// Creates a new `PlayerSlot` from a raw slot number.
    ///
    /// This does not validate the slot; use [`is_valid`](Self::is_valid).
    #[inline]
    #[must_use]
    pub const fn new(slot: u8) -> Self {
        PlayerSlot(slot)
    }

    /// Returns the underlying slot number.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Returns the slot number as a `usize` index.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Returns `true` if the slot is within `[0, MAX_SLOTS)`.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < MAX_SLOTS
    }

    /// Returns the relay mask addressing only this slot.
    #[inline]
    #[must_use]
    pub const fn mask(self) -> RelayMask {
        RelayMask(1 << self.0)
    }
}

impl std::fmt::Display for PlayerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for PlayerSlot {
    #[inline]
    fn from(value: u8) -> Self {
        PlayerSlot(value)
    }
}

/// Bitmask with one bit per destination slot, used to address a command to a
/// subset of peers via the [`Transport`].
///
/// # Examples
///
/// ```
/// use bastion_lockstep::{PlayerSlot, RelayMask};
///
/// let mask = RelayMask::EMPTY
///     .with(PlayerSlot::new(1))
///     .with(PlayerSlot::new(3));
/// assert!(mask.contains(PlayerSlot::new(1)));
/// assert!(!mask.contains(PlayerSlot::new(2)));
/// assert_eq!(mask.bits(), 0b1010);
/// ```
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub struct RelayMask(u16);

impl RelayMask {
    /// The empty mask, addressing no slots.
    pub const EMPTY: RelayMask = RelayMask(0);

    /// Creates a mask from raw bits.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        RelayMask(bits)
    }

    /// Returns the raw bits of the mask.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Returns `true` if the mask addresses no slots.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if the mask addresses the given slot.
    #[inline]
    #[must_use]
    pub const fn contains(self, slot: PlayerSlot) -> bool {
        self.0 & (1 << slot.as_u8()) != 0
    }

    /// Returns the mask with the given slot added.
    #[inline]
    #[must_use]
    pub const fn with(self, slot: PlayerSlot) -> Self {
        RelayMask(self.0 | (1 << slot.as_u8()))
    }

    /// Returns the mask with the given slot removed.
    #[inline]
    #[must_use]
    pub const fn without(self, slot: PlayerSlot) -> Self {
        RelayMask(self.0 & !(1 << slot.as_u8()))
    }

    /// Iterates over the slots addressed by the mask, in ascending order.
    pub fn slots(self) -> impl Iterator<Item = PlayerSlot> {
        (0..MAX_SLOTS as u8)
            .map(PlayerSlot::new)
            .filter(move |s| self.contains(*s))
    }
}

impl std::fmt::Display for RelayMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018b}", self.0)
    }
}

impl FromIterator<PlayerSlot> for RelayMask {
    fn from_iter<I: IntoIterator<Item = PlayerSlot>>(iter: I) -> Self {
        iter.into_iter().fold(RelayMask::EMPTY, RelayMask::with)
    }
}

/// The subset of slots currently considered connected.
///
/// The local slot is always in the set unless the game is terminating.
/// Removal is monotonic within a game: the kernel never re-adds a slot once
/// it has been dropped.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ConnectionSet {
    mask: u16,
}

impl ConnectionSet {
    /// Creates an empty connection set.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        ConnectionSet { mask: 0 }
    }

    /// Adds a slot to the set. Only meaningful during lobby assembly, before
    /// the game starts; disconnection is monotonic afterwards.
    #[inline]
    pub fn insert(&mut self, slot: PlayerSlot) {
        self.mask |= 1 << slot.as_u8();
    }

    /// Removes a slot from the set.
    #[inline]
    pub fn remove(&mut self, slot: PlayerSlot) {
        self.mask &= !(1 << slot.as_u8());
    }

    /// Returns `true` if the slot is in the set.
    #[inline]
    #[must_use]
    pub const fn contains(self, slot: PlayerSlot) -> bool {
        self.mask & (1 << slot.as_u8()) != 0
    }

    /// Returns the number of connected slots.
    #[inline]
    #[must_use]
    pub const fn len(self) -> usize {
        self.mask.count_ones() as usize
    }

    /// Returns `true` if no slots are connected.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.mask == 0
    }

    /// Iterates over the connected slots in ascending order.
    pub fn slots(self) -> impl Iterator<Item = PlayerSlot> {
        RelayMask(self.mask).slots()
    }

    /// Returns the relay mask addressing every connected slot except `slot`.
    #[inline]
    #[must_use]
    pub const fn relay_mask_excluding(self, slot: PlayerSlot) -> RelayMask {
        RelayMask(self.mask & !(1 << slot.as_u8()))
    }

    /// Returns the first connected slot other than `excluded`, if any.
    #[must_use]
    pub fn first_other(self, excluded: PlayerSlot) -> Option<PlayerSlot> {
        self.slots().find(|s| *s != excluded)
    }

    /// Clears the set.
    #[inline]
    pub fn clear(&mut self) {
        self.mask = 0;
    }
}

// #############
// #  TRAITS   #
// #############

/// Outbound command sink supplied by the host.
///
/// The kernel addresses every outbound command (keep-alives, resend
/// requests, disconnect flows, packet-router acks, archive replay) through
/// this single method with a relay bitmask. How the transport serializes the
/// command on the network is its own concern; [`wire::codec`] and [`codec`]
/// are available when the host wants the kernel's wire formats.
///
/// When no transport is attached, operations that need to send become
/// no-ops; incoming processing proceeds regardless.
pub trait Transport {
    /// Delivers `command` to every slot addressed by `relay`.
    fn send_local_command_direct(&mut self, command: &NetCommand, relay: RelayMask);
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn frame_arithmetic() {
        let frame = Frame::new(10);
        assert_eq!((frame + 5).as_u32(), 15);
        assert_eq!(frame.saturating_sub(3).as_u32(), 7);
        assert_eq!(frame.saturating_sub(100), Frame::ZERO);
        assert_eq!(Frame::new(12) - Frame::new(10), 2);
        assert_eq!(Frame::new(10) - Frame::new(12), 0);
    }

    #[test]
    fn frame_ordering_and_display() {
        assert!(Frame::new(3) < Frame::new(4));
        assert_eq!(Frame::new(7), 7u32);
        assert_eq!(format!("{}", Frame::new(42)), "42");
    }

    #[test]
    fn slot_mask_roundtrip() {
        for raw in 0..MAX_SLOTS as u8 {
            let slot = PlayerSlot::new(raw);
            assert!(slot.is_valid());
            assert!(slot.mask().contains(slot));
        }
        assert!(!PlayerSlot::new(16).is_valid());
    }

    #[test]
    fn relay_mask_set_operations() {
        let mask = RelayMask::EMPTY
            .with(PlayerSlot::new(0))
            .with(PlayerSlot::new(2));
        assert_eq!(mask.bits(), 0b101);
        assert_eq!(mask.without(PlayerSlot::new(0)).bits(), 0b100);
        let slots: Vec<_> = mask.slots().map(PlayerSlot::as_u8).collect();
        assert_eq!(slots, vec![0, 2]);
    }

    #[test]
    fn connection_set_membership() {
        let mut set = ConnectionSet::new();
        set.insert(PlayerSlot::new(0));
        set.insert(PlayerSlot::new(1));
        set.insert(PlayerSlot::new(5));
        assert_eq!(set.len(), 3);
        assert!(set.contains(PlayerSlot::new(5)));

        set.remove(PlayerSlot::new(1));
        assert!(!set.contains(PlayerSlot::new(1)));
        assert_eq!(
            set.relay_mask_excluding(PlayerSlot::new(0)).bits(),
            0b100000
        );
        assert_eq!(
            set.first_other(PlayerSlot::new(0)),
            Some(PlayerSlot::new(5))
        );
    }
}
