//! The transport-boundary command record.
//!
//! Transports deliver commands in a variety of shapes: raw wire bytes, a
//! typed record with a numeric command code, a record with a textual kind
//! alias, or a wrapper whose inner command is already reified.
//! [`InboundCommand`] is the adapter that collapses every shape into one
//! struct the manager can dispatch on. Resolution precedence is a pure
//! function of the record: a numeric code wins over a textual alias, and a
//! reified inner command wins over chunk metadata.

use serde::{Deserialize, Serialize};

use crate::wire::payload::{NetCommand, Payload};
use crate::wire::wrapper::WrapperChunk;
use crate::{CommandKind, Frame, PlayerSlot};

/// One inbound command record, in any of the accepted shapes.
///
/// Fields are all optional; handlers read the ones their kind consumes and
/// ignore the rest. Records built from raw wire bytes carry them in
/// [`wire`](Self::wire); the manager decodes and merges them, with record
/// fields taking precedence over decoded ones.
///
/// # Examples
///
/// ```
/// use bastion_lockstep::InboundCommand;
///
/// // Typed record: FrameInfo from slot 1 for frame 5 announcing 2 commands.
/// let record = InboundCommand::typed(3)
///     .with_sender(1)
///     .with_frame(5)
///     .with_command_count(2);
/// assert!(record.resolve_kind().is_some());
///
/// // Textual alias shape.
/// let aliased = InboundCommand::named("NetCommandType_Chat");
/// assert!(aliased.resolve_kind().is_some());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundCommand {
    /// Numeric command type code. Wins over [`type_name`](Self::type_name).
    pub command_type: Option<u8>,
    /// Textual kind alias, resolved per the alias rules when no numeric
    /// code is present.
    pub type_name: Option<String>,
    /// Sending slot.
    pub sender: Option<u8>,
    /// Frame a FrameInfo or disconnect report refers to.
    pub frame: Option<u32>,
    /// Frame the command executes in.
    pub execution_frame: Option<u32>,
    /// Sequencer-assigned command id.
    pub command_id: Option<u16>,
    /// Announced synchronized-command count (FrameInfo).
    pub command_count: Option<u16>,
    /// Reported per-frame content hash (FrameInfo).
    pub frame_hash: Option<u32>,
    /// Reported game-logic CRC (FrameInfo).
    pub logic_crc: Option<u32>,
    /// Structured payload, when the transport already decoded one.
    pub payload: Option<Payload>,
    /// Wrapper chunk metadata, for object-shaped chunks.
    pub chunk: Option<WrapperChunk>,
    /// A reified inner command; takes precedence over
    /// [`chunk`](Self::chunk).
    pub wrapped: Option<Box<InboundCommand>>,
    /// Raw inner-command wire bytes.
    pub wire: Option<Vec<u8>>,
}

impl InboundCommand {
    /// Creates a record with a numeric command type.
    #[must_use]
    pub fn typed(command_type: u8) -> Self {
        Self {
            command_type: Some(command_type),
            ..Self::default()
        }
    }

    /// Creates a record with a textual kind alias.
    #[must_use]
    pub fn named(type_name: &str) -> Self {
        Self {
            type_name: Some(type_name.to_string()),
            ..Self::default()
        }
    }

    /// Creates a record carrying raw wire bytes.
    #[must_use]
    pub fn from_wire(bytes: Vec<u8>) -> Self {
        Self {
            wire: Some(bytes),
            ..Self::default()
        }
    }

    /// Sets the sender slot.
    #[must_use]
    pub fn with_sender(mut self, sender: u8) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Sets the referenced frame.
    #[must_use]
    pub fn with_frame(mut self, frame: u32) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Sets the execution frame.
    #[must_use]
    pub fn with_execution_frame(mut self, frame: u32) -> Self {
        self.execution_frame = Some(frame);
        self
    }

    /// Sets the command id.
    #[must_use]
    pub fn with_command_id(mut self, id: u16) -> Self {
        self.command_id = Some(id);
        self
    }

    /// Sets the announced command count.
    #[must_use]
    pub fn with_command_count(mut self, count: u16) -> Self {
        self.command_count = Some(count);
        self
    }

    /// Sets the reported frame hash.
    #[must_use]
    pub fn with_frame_hash(mut self, hash: u32) -> Self {
        self.frame_hash = Some(hash);
        self
    }

    /// Sets the reported game-logic CRC.
    #[must_use]
    pub fn with_logic_crc(mut self, crc: u32) -> Self {
        self.logic_crc = Some(crc);
        self
    }

    /// Sets the structured payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets wrapper chunk metadata.
    #[must_use]
    pub fn with_chunk(mut self, chunk: WrapperChunk) -> Self {
        self.chunk = Some(chunk);
        self
    }

    /// Sets the reified inner command.
    #[must_use]
    pub fn with_wrapped(mut self, inner: InboundCommand) -> Self {
        self.wrapped = Some(Box::new(inner));
        self
    }

    /// Resolves the command kind from the record's own fields.
    ///
    /// Numeric code wins over the textual alias; an unknown numeric code
    /// resolves nothing (it does not fall through to the alias).
    #[must_use]
    pub fn resolve_kind(&self) -> Option<CommandKind> {
        match self.command_type {
            Some(code) => CommandKind::from_code(code),
            None => self.type_name.as_deref().and_then(CommandKind::from_alias),
        }
    }

    /// The sender as a typed slot.
    #[must_use]
    pub fn sender_slot(&self) -> Option<PlayerSlot> {
        self.sender.map(PlayerSlot::new)
    }

    /// The referenced frame, falling back to the execution frame.
    #[must_use]
    pub fn frame_or_execution_frame(&self) -> Option<Frame> {
        self.frame.or(self.execution_frame).map(Frame::new)
    }
}

impl From<NetCommand> for InboundCommand {
    /// Re-shapes a decoded command (for example a reassembled wrapper
    /// inner command) into the record form the dispatcher consumes.
    fn from(command: NetCommand) -> Self {
        let frame = match &command.payload {
            Payload::FrameResendRequest { frame_to_resend } => Some(frame_to_resend.as_u32()),
            Payload::DisconnectFrame { frame } => Some(frame.as_u32()),
            Payload::DisconnectScreenOff { new_frame } => Some(new_frame.as_u32()),
            _ => command.execution_frame.map(Frame::as_u32),
        };
        let command_count = match &command.payload {
            Payload::FrameInfo { command_count } => Some(*command_count),
            _ => None,
        };
        Self {
            command_type: Some(command.kind.code()),
            type_name: None,
            sender: command.sender.map(PlayerSlot::as_u8),
            frame,
            execution_frame: command.execution_frame.map(Frame::as_u32),
            command_id: command.command_id,
            command_count,
            frame_hash: None,
            logic_crc: None,
            payload: Some(command.payload),
            chunk: None,
            wrapped: None,
            wire: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::wire::payload::ChatText;

    #[test]
    fn numeric_code_wins_over_alias() {
        let record = InboundCommand {
            command_type: Some(CommandKind::Chat.code()),
            type_name: Some("frameinfo".to_string()),
            ..InboundCommand::default()
        };
        assert_eq!(record.resolve_kind(), Some(CommandKind::Chat));
    }

    #[test]
    fn unknown_numeric_code_does_not_fall_back() {
        let record = InboundCommand {
            command_type: Some(200),
            type_name: Some("chat".to_string()),
            ..InboundCommand::default()
        };
        assert_eq!(record.resolve_kind(), None);
    }

    #[test]
    fn alias_resolves_when_no_code() {
        let record = InboundCommand::named("NETCOMMANDTYPE_DISCONNECT_VOTE");
        assert_eq!(record.resolve_kind(), Some(CommandKind::DisconnectVote));
    }

    #[test]
    fn nothing_resolves_nothing() {
        assert_eq!(InboundCommand::default().resolve_kind(), None);
    }

    #[test]
    fn frame_falls_back_to_execution_frame() {
        let record = InboundCommand::typed(3).with_execution_frame(9);
        assert_eq!(record.frame_or_execution_frame(), Some(Frame::new(9)));

        let record = record.with_frame(5);
        assert_eq!(record.frame_or_execution_frame(), Some(Frame::new(5)));
    }

    #[test]
    fn from_net_command_carries_payload_and_tags() {
        let command = NetCommand::new(CommandKind::Chat)
            .with_sender(PlayerSlot::new(1))
            .with_payload(Payload::Chat {
                text: ChatText::from("hello"),
                player_mask: 1,
            });
        let record = InboundCommand::from(command);
        assert_eq!(record.resolve_kind(), Some(CommandKind::Chat));
        assert_eq!(record.sender, Some(1));
        assert!(matches!(record.payload, Some(Payload::Chat { .. })));
    }

    #[test]
    fn from_net_command_extracts_frame_info_count() {
        let command = NetCommand::new(CommandKind::FrameInfo)
            .with_sender(PlayerSlot::new(2))
            .with_execution_frame(Frame::new(12))
            .with_payload(Payload::FrameInfo { command_count: 4 });
        let record = InboundCommand::from(command);
        assert_eq!(record.command_count, Some(4));
        assert_eq!(record.frame, Some(12));
    }

    #[test]
    fn from_net_command_extracts_payload_frames() {
        let command = NetCommand::new(CommandKind::DisconnectFrame)
            .with_sender(PlayerSlot::new(1))
            .with_payload(Payload::DisconnectFrame {
                frame: Frame::new(77),
            });
        let record = InboundCommand::from(command);
        assert_eq!(record.frame, Some(77));
    }
}
