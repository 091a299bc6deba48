//! Typed command payloads.
//!
//! Inbound commands arrive as duck-typed records or raw wire bytes; the
//! codec collapses both into a [`NetCommand`] carrying a [`Payload`] sum
//! type, and handlers match on the variant.

use serde::{Deserialize, Serialize};

use crate::wire::wrapper::WrapperChunk;
use crate::{CommandKind, Frame, PlayerSlot};

/// Chat text as a sequence of UTF-16 code units.
///
/// The wire format carries chat as raw UTF-16 LE code units and round-trips
/// them exactly, including unpaired surrogates, so the text is stored as
/// units rather than a `String`.
///
/// # Examples
///
/// ```
/// use bastion_lockstep::ChatText;
///
/// let text = ChatText::from("hello");
/// assert_eq!(text.units().len(), 5);
/// assert_eq!(text.to_string_lossy(), "hello");
/// ```
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChatText(Vec<u16>);

impl ChatText {
    /// Creates chat text from raw UTF-16 code units.
    #[must_use]
    pub fn from_units(units: Vec<u16>) -> Self {
        ChatText(units)
    }

    /// Returns the UTF-16 code units.
    #[must_use]
    pub fn units(&self) -> &[u16] {
        &self.0
    }

    /// Number of code units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the text is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decodes the units into a `String`, replacing unpaired surrogates.
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(&self.0)
    }
}

impl From<&str> for ChatText {
    fn from(text: &str) -> Self {
        ChatText(text.encode_utf16().collect())
    }
}

impl std::fmt::Debug for ChatText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChatText({:?})", self.to_string_lossy())
    }
}

impl std::fmt::Display for ChatText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

/// Kind-specific command payload.
///
/// The wire codec fills the variant matching the command kind; kinds with
/// no payload bytes (acks, keep-alives, mangler traffic, load-complete,
/// timeout-start, packet-router query/ack, sentinels) use
/// [`Payload::Empty`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Payload {
    /// No payload bytes.
    #[default]
    Empty,
    /// In-game chat with a recipient mask.
    Chat {
        /// The chat text.
        text: ChatText,
        /// Recipient player mask.
        player_mask: i32,
    },
    /// Disconnect-screen chat (no recipient mask on the wire).
    DisconnectChat {
        /// The chat text.
        text: ChatText,
    },
    /// Changes the run-ahead window and frame rate.
    RunAhead {
        /// The new run-ahead window, in frames.
        new_run_ahead: u16,
        /// The new frame rate, in frames per second.
        new_frame_rate: u8,
    },
    /// Latency/FPS metrics for run-ahead tuning.
    RunAheadMetrics {
        /// Average round-trip latency in seconds.
        average_latency: f32,
        /// Average frames per second.
        average_fps: u16,
    },
    /// Destroys a player's objects.
    DestroyPlayer {
        /// Index of the player to destroy.
        player_index: u32,
    },
    /// A player is leaving.
    PlayerLeave {
        /// Slot of the leaving player.
        leaving_slot: u8,
    },
    /// Load-screen progress.
    Progress {
        /// Percentage loaded, 0..=100.
        percentage: u8,
    },
    /// Synchronized-command count for a (sender, frame).
    FrameInfo {
        /// Number of synchronized commands the sender issued for the frame.
        command_count: u16,
    },
    /// Asks for the commands of a frame to be resent.
    FrameResendRequest {
        /// The frame to resend.
        frame_to_resend: Frame,
    },
    /// The packet router declares a peer disconnected.
    DisconnectPlayer {
        /// The slot being disconnected.
        disconnect_slot: u8,
        /// The frame at which the disconnect takes effect.
        disconnect_frame: Frame,
    },
    /// A vote to disconnect a peer.
    DisconnectVote {
        /// The slot being voted against.
        vote_slot: u8,
        /// The frame the vote applies to.
        vote_frame: Frame,
    },
    /// The frame a disconnecting peer has reached.
    DisconnectFrame {
        /// The peer's last computed frame.
        frame: Frame,
    },
    /// Dismisses the disconnect screen at a new frame.
    DisconnectScreenOff {
        /// The frame at which the simulation resumes.
        new_frame: Frame,
    },
    /// A file payload.
    File {
        /// ASCII file path.
        path: String,
        /// File bytes.
        data: Vec<u8>,
    },
    /// Announces an upcoming file transfer.
    FileAnnounce {
        /// ASCII file path.
        path: String,
        /// Transfer command id the progress commands will reference.
        command_id: u16,
        /// Recipient player mask.
        player_mask: u8,
    },
    /// Per-recipient file transfer progress.
    FileProgress {
        /// Transfer command id from the announce.
        command_id: u16,
        /// Progress percentage, 0..=100.
        progress: i32,
    },
    /// A fragment of a wrapped command envelope.
    Wrapper(WrapperChunk),
}

/// A fully typed command, as parsed from the wire or assembled by the
/// manager for sending.
///
/// The tag fields before the payload (`sender`, `execution_frame`, `relay`,
/// `command_id`) are each optional on the wire; the relay marker is
/// consumed and ignored by receivers but preserved here so encoding
/// round-trips exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetCommand {
    /// The command kind.
    pub kind: CommandKind,
    /// Sending slot, when present.
    pub sender: Option<PlayerSlot>,
    /// The frame the command executes in, when present.
    pub execution_frame: Option<Frame>,
    /// Relay marker byte, consumed and ignored by receivers.
    pub relay: Option<u8>,
    /// Sequencer-assigned command id, present iff the kind requires one.
    pub command_id: Option<u16>,
    /// Kind-specific payload.
    pub payload: Payload,
}

impl NetCommand {
    /// Creates a command of the given kind with no tag fields and an empty
    /// payload.
    #[must_use]
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            sender: None,
            execution_frame: None,
            relay: None,
            command_id: None,
            payload: Payload::Empty,
        }
    }

    /// Sets the sending slot.
    #[must_use]
    pub fn with_sender(mut self, sender: PlayerSlot) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Sets the execution frame.
    #[must_use]
    pub fn with_execution_frame(mut self, frame: Frame) -> Self {
        self.execution_frame = Some(frame);
        self
    }

    /// Sets the command id.
    #[must_use]
    pub fn with_command_id(mut self, id: u16) -> Self {
        self.command_id = Some(id);
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }
}
