//! The closed command taxonomy.
//!
//! Every command exchanged by the kernel has a fixed numeric code that is
//! wire-compatible across versions. Two predicates drive the rest of the
//! design: [`CommandKind::requires_command_id`] marks the commands that must
//! carry a 16-bit unique id from the local sequencer, and
//! [`CommandKind::is_synchronized`] marks the commands whose execution must
//! be mirrored across peers (the only kinds fed to the resend archive and
//! the frame-expectation tracker).

use serde::{Deserialize, Serialize};

/// Code of the first disconnect-family sentinel (exclusive lower bound).
const DISCONNECT_START: u8 = 22;
/// Code of the last disconnect-family sentinel (exclusive upper bound).
const DISCONNECT_END: u8 = 30;

/// The closed set of command kinds, with wire-compatible `u8` codes.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum CommandKind {
    /// Acknowledges both connection stages.
    AckBoth = 0,
    /// Acknowledges connection stage 1.
    AckStage1 = 1,
    /// Acknowledges connection stage 2.
    AckStage2 = 2,
    /// Announces how many synchronized commands the sender issued for a
    /// frame; also carries frame-hash and game-logic CRC reports.
    FrameInfo = 3,
    /// A game command to be executed by the simulation.
    GameCommand = 4,
    /// A player is leaving the game.
    PlayerLeave = 5,
    /// Average latency and FPS metrics used for run-ahead tuning.
    RunAheadMetrics = 6,
    /// Changes the run-ahead window and frame rate.
    RunAhead = 7,
    /// Destroys a player's objects in the simulation.
    DestroyPlayer = 8,
    /// Lobby-level keep-alive.
    KeepAlive = 9,
    /// Chat shown on the disconnect screen.
    DisconnectChat = 10,
    /// In-game chat.
    Chat = 11,
    /// NAT-mangler address query.
    ManglerQuery = 12,
    /// NAT-mangler address response.
    ManglerResponse = 13,
    /// Load-screen progress percentage.
    Progress = 14,
    /// Load complete notification.
    LoadComplete = 15,
    /// Timeout countdown start notification.
    TimeoutStart = 16,
    /// A fragment of a wrapped command envelope.
    Wrapper = 17,
    /// A file payload.
    File = 18,
    /// Announces an upcoming file transfer.
    FileAnnounce = 19,
    /// Per-recipient file transfer progress.
    FileProgress = 20,
    /// Asks a peer to resend the commands of a frame.
    FrameResendRequest = 21,
    /// Sentinel: start of the disconnect family (not itself a member).
    DisconnectStart = 22,
    /// Keep-alive while the disconnect screen is up.
    DisconnectKeepAlive = 23,
    /// The packet router declares a peer disconnected.
    DisconnectPlayer = 24,
    /// Queries for the packet router.
    PacketRouterQuery = 25,
    /// Packet router acknowledgment.
    PacketRouterAck = 26,
    /// A vote to disconnect a peer.
    DisconnectVote = 27,
    /// Announces the frame a disconnecting peer has reached.
    DisconnectFrame = 28,
    /// Dismisses the disconnect screen at a new frame.
    DisconnectScreenOff = 29,
    /// Sentinel: end of the disconnect family (not itself a member).
    DisconnectEnd = 30,
}

impl CommandKind {
    /// Returns the wire code of this kind.
    #[inline]
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Resolves a numeric wire code, if it names a known kind.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::AckBoth,
            1 => Self::AckStage1,
            2 => Self::AckStage2,
            3 => Self::FrameInfo,
            4 => Self::GameCommand,
            5 => Self::PlayerLeave,
            6 => Self::RunAheadMetrics,
            7 => Self::RunAhead,
            8 => Self::DestroyPlayer,
            9 => Self::KeepAlive,
            10 => Self::DisconnectChat,
            11 => Self::Chat,
            12 => Self::ManglerQuery,
            13 => Self::ManglerResponse,
            14 => Self::Progress,
            15 => Self::LoadComplete,
            16 => Self::TimeoutStart,
            17 => Self::Wrapper,
            18 => Self::File,
            19 => Self::FileAnnounce,
            20 => Self::FileProgress,
            21 => Self::FrameResendRequest,
            22 => Self::DisconnectStart,
            23 => Self::DisconnectKeepAlive,
            24 => Self::DisconnectPlayer,
            25 => Self::PacketRouterQuery,
            26 => Self::PacketRouterAck,
            27 => Self::DisconnectVote,
            28 => Self::DisconnectFrame,
            29 => Self::DisconnectScreenOff,
            30 => Self::DisconnectEnd,
            _ => return None,
        })
    }

    /// Resolves a textual kind identifier.
    ///
    /// Non-alphanumeric characters are stripped, the result is lower-cased,
    /// and an optional `netcommandtype` prefix is removed, so
    /// `"NetCommandType_Chat"`, `"chat"`, and `"CHAT"` all resolve to
    /// [`CommandKind::Chat`].
    #[must_use]
    pub fn from_alias(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let canonical = normalized
            .strip_prefix("netcommandtype")
            .unwrap_or(&normalized);
        Some(match canonical {
            "ackboth" => Self::AckBoth,
            "ackstage1" => Self::AckStage1,
            "ackstage2" => Self::AckStage2,
            "frameinfo" => Self::FrameInfo,
            "gamecommand" => Self::GameCommand,
            "playerleave" => Self::PlayerLeave,
            "runaheadmetrics" => Self::RunAheadMetrics,
            "runahead" => Self::RunAhead,
            "destroyplayer" => Self::DestroyPlayer,
            "keepalive" => Self::KeepAlive,
            "disconnectchat" => Self::DisconnectChat,
            "chat" => Self::Chat,
            "manglerquery" => Self::ManglerQuery,
            "manglerresponse" => Self::ManglerResponse,
            "progress" => Self::Progress,
            "loadcomplete" => Self::LoadComplete,
            "timeoutstart" => Self::TimeoutStart,
            "wrapper" => Self::Wrapper,
            "file" => Self::File,
            "fileannounce" => Self::FileAnnounce,
            "fileprogress" => Self::FileProgress,
            "frameresendrequest" => Self::FrameResendRequest,
            "disconnectstart" => Self::DisconnectStart,
            "disconnectkeepalive" => Self::DisconnectKeepAlive,
            "disconnectplayer" => Self::DisconnectPlayer,
            "packetrouterquery" => Self::PacketRouterQuery,
            "packetrouterack" => Self::PacketRouterAck,
            "disconnectvote" => Self::DisconnectVote,
            "disconnectframe" => Self::DisconnectFrame,
            "disconnectscreenoff" => Self::DisconnectScreenOff,
            "disconnectend" => Self::DisconnectEnd,
            _ => return None,
        })
    }

    /// Returns `true` for members of the disconnect family.
    ///
    /// The sentinel codes 22 and 30 bound the family exclusively and are
    /// not themselves members.
    #[inline]
    #[must_use]
    pub const fn is_disconnect_family(self) -> bool {
        let code = self.code();
        code > DISCONNECT_START && code < DISCONNECT_END
    }

    /// Returns `true` if commands of this kind must carry a 16-bit unique
    /// id generated by the local sequencer.
    ///
    /// The id is used for dedup in the command queue and for
    /// disconnect-vote acknowledgment. Acks, frame-info, wrapper chunks,
    /// and keep-alives carry none.
    #[inline]
    #[must_use]
    pub const fn requires_command_id(self) -> bool {
        self.is_disconnect_family() || matches!(self, Self::FrameResendRequest)
    }

    /// Returns `true` if execution of this kind must be mirrored across
    /// peers.
    ///
    /// Synchronized kinds are the only ones fed to the resend archive and
    /// the frame-expectation tracker. [`CommandKind::FrameInfo`] is a
    /// special case: it carries expectation metadata but is not itself
    /// executed, so it is not synchronized.
    #[inline]
    #[must_use]
    pub const fn is_synchronized(self) -> bool {
        matches!(
            self,
            Self::GameCommand
                | Self::DestroyPlayer
                | Self::RunAhead
                | Self::DisconnectPlayer
                | Self::DisconnectFrame
                | Self::DisconnectScreenOff
                | Self::DisconnectVote
        )
    }

    /// The canonical lower-case name of this kind.
    #[must_use]
    pub const fn canonical_name(self) -> &'static str {
        match self {
            Self::AckBoth => "ackboth",
            Self::AckStage1 => "ackstage1",
            Self::AckStage2 => "ackstage2",
            Self::FrameInfo => "frameinfo",
            Self::GameCommand => "gamecommand",
            Self::PlayerLeave => "playerleave",
            Self::RunAheadMetrics => "runaheadmetrics",
            Self::RunAhead => "runahead",
            Self::DestroyPlayer => "destroyplayer",
            Self::KeepAlive => "keepalive",
            Self::DisconnectChat => "disconnectchat",
            Self::Chat => "chat",
            Self::ManglerQuery => "manglerquery",
            Self::ManglerResponse => "manglerresponse",
            Self::Progress => "progress",
            Self::LoadComplete => "loadcomplete",
            Self::TimeoutStart => "timeoutstart",
            Self::Wrapper => "wrapper",
            Self::File => "file",
            Self::FileAnnounce => "fileannounce",
            Self::FileProgress => "fileprogress",
            Self::FrameResendRequest => "frameresendrequest",
            Self::DisconnectStart => "disconnectstart",
            Self::DisconnectKeepAlive => "disconnectkeepalive",
            Self::DisconnectPlayer => "disconnectplayer",
            Self::PacketRouterQuery => "packetrouterquery",
            Self::PacketRouterAck => "packetrouterack",
            Self::DisconnectVote => "disconnectvote",
            Self::DisconnectFrame => "disconnectframe",
            Self::DisconnectScreenOff => "disconnectscreenoff",
            Self::DisconnectEnd => "disconnectend",
        }
    }

    /// Iterates over every kind in code order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..=DISCONNECT_END).filter_map(Self::from_code)
    }
}

impl TryFrom<u8> for CommandKind {
    type Error = crate::WireError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or(crate::WireError::UnknownCommandType { code })
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.canonical_name())
    }
}
