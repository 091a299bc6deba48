//! The inner-command wire format.
//!
//! A command is a little-endian sequence of tagged fields, each introduced
//! by one ASCII marker byte: `T` command type (u8), `P` sender slot (u8),
//! `F` execution frame (u32), `R` relay marker (u8, consumed and ignored by
//! receivers), `C` command id (u16), and `D`, which begins the
//! kind-specific payload. The ordering of tag fields before `D` is not
//! fixed; the parser accepts any permutation and any subset appropriate to
//! the kind. Any truncation or unknown marker is a parse failure and the
//! command is dropped by callers.

use crate::error::WireError;
use crate::wire::payload::{ChatText, NetCommand, Payload};
use crate::wire::wrapper;
use crate::{CommandKind, Frame, PlayerSlot};

const TAG_TYPE: u8 = b'T';
const TAG_PLAYER: u8 = b'P';
const TAG_FRAME: u8 = b'F';
const TAG_RELAY: u8 = b'R';
const TAG_COMMAND_ID: u8 = b'C';
const TAG_DATA: u8 = b'D';

/// Chat text length travels as a single byte of code units.
const MAX_CHAT_UNITS: usize = u8::MAX as usize;

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                field,
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, WireError> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, WireError> {
        let b = self.take(2, field)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, WireError> {
        let b = self.take(4, field)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self, field: &'static str) -> Result<i32, WireError> {
        let b = self.take(4, field)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32(&mut self, field: &'static str) -> Result<f32, WireError> {
        let b = self.take(4, field)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a zero-terminated ASCII string, consuming the terminator.
    fn cstr(&mut self, field: &'static str) -> Result<String, WireError> {
        let start = self.pos;
        while self.pos < self.buf.len() {
            if self.buf[self.pos] == 0 {
                let s = self.buf[start..self.pos]
                    .iter()
                    .map(|&b| char::from(b))
                    .collect();
                self.pos += 1;
                return Ok(s);
            }
            self.pos += 1;
        }
        Err(WireError::Truncated {
            field,
            needed: 1,
            remaining: 0,
        })
    }
}

/// Decodes an inner command from wire bytes.
///
/// Trailing bytes after the payload are tolerated; everything up to and
/// including the payload must be well-formed.
pub fn decode(bytes: &[u8]) -> Result<NetCommand, WireError> {
    let mut reader = Reader::new(bytes);
    let mut kind: Option<CommandKind> = None;
    let mut sender = None;
    let mut execution_frame = None;
    let mut relay = None;
    let mut command_id = None;

    loop {
        if reader.is_empty() {
            // Tag-only commands (no payload section) are tolerated.
            break;
        }
        let offset = reader.pos;
        let marker = reader.u8("marker")?;
        match marker {
            TAG_TYPE => {
                let code = reader.u8("commandType")?;
                kind = Some(CommandKind::try_from(code)?);
            },
            TAG_PLAYER => sender = Some(PlayerSlot::new(reader.u8("sender")?)),
            TAG_FRAME => execution_frame = Some(Frame::new(reader.u32("executionFrame")?)),
            TAG_RELAY => relay = Some(reader.u8("relay")?),
            TAG_COMMAND_ID => command_id = Some(reader.u16("commandId")?),
            TAG_DATA => {
                let kind = kind.ok_or(WireError::MissingCommandType)?;
                let payload = decode_payload(kind, &mut reader)?;
                return Ok(NetCommand {
                    kind,
                    sender,
                    execution_frame,
                    relay,
                    command_id,
                    payload,
                });
            },
            _ => return Err(WireError::UnknownMarker { marker, offset }),
        }
    }

    let kind = kind.ok_or(WireError::MissingCommandType)?;
    Ok(NetCommand {
        kind,
        sender,
        execution_frame,
        relay,
        command_id,
        payload: Payload::Empty,
    })
}

fn decode_chat_text(reader: &mut Reader<'_>) -> Result<ChatText, WireError> {
    let unit_count = reader.u8("chatLength")? as usize;
    let mut units = Vec::with_capacity(unit_count);
    for _ in 0..unit_count {
        units.push(reader.u16("chatUnit")?);
    }
    Ok(ChatText::from_units(units))
}

fn decode_payload(kind: CommandKind, reader: &mut Reader<'_>) -> Result<Payload, WireError> {
    Ok(match kind {
        CommandKind::Chat => {
            let text = decode_chat_text(reader)?;
            let player_mask = reader.i32("playerMask")?;
            Payload::Chat { text, player_mask }
        },
        CommandKind::DisconnectChat => Payload::DisconnectChat {
            text: decode_chat_text(reader)?,
        },
        CommandKind::RunAhead => Payload::RunAhead {
            new_run_ahead: reader.u16("newRunAhead")?,
            new_frame_rate: reader.u8("newFrameRate")?,
        },
        CommandKind::RunAheadMetrics => Payload::RunAheadMetrics {
            average_latency: reader.f32("averageLatency")?,
            average_fps: reader.u16("averageFps")?,
        },
        CommandKind::DestroyPlayer => Payload::DestroyPlayer {
            player_index: reader.u32("playerIndex")?,
        },
        CommandKind::PlayerLeave => Payload::PlayerLeave {
            leaving_slot: reader.u8("leavingPlayerId")?,
        },
        CommandKind::Progress => Payload::Progress {
            percentage: reader.u8("percentage")?,
        },
        CommandKind::FrameInfo => Payload::FrameInfo {
            command_count: reader.u16("commandCount")?,
        },
        CommandKind::FrameResendRequest => Payload::FrameResendRequest {
            frame_to_resend: Frame::new(reader.u32("frameToResend")?),
        },
        CommandKind::DisconnectPlayer => Payload::DisconnectPlayer {
            disconnect_slot: reader.u8("disconnectSlot")?,
            disconnect_frame: Frame::new(reader.u32("disconnectFrame")?),
        },
        CommandKind::DisconnectVote => Payload::DisconnectVote {
            vote_slot: reader.u8("voteSlot")?,
            vote_frame: Frame::new(reader.u32("voteFrame")?),
        },
        CommandKind::DisconnectFrame => Payload::DisconnectFrame {
            frame: Frame::new(reader.u32("disconnectFrame")?),
        },
        CommandKind::DisconnectScreenOff => Payload::DisconnectScreenOff {
            new_frame: Frame::new(reader.u32("newFrame")?),
        },
        CommandKind::File => {
            let path = reader.cstr("filePath")?;
            let len = reader.u32("fileDataLen")? as usize;
            let data = reader.take(len, "fileData")?.to_vec();
            Payload::File { path, data }
        },
        CommandKind::FileAnnounce => Payload::FileAnnounce {
            path: reader.cstr("filePath")?,
            command_id: reader.u16("fileCommandId")?,
            player_mask: reader.u8("playerMask")?,
        },
        CommandKind::FileProgress => Payload::FileProgress {
            command_id: reader.u16("fileCommandId")?,
            progress: reader.i32("fileProgress")?,
        },
        CommandKind::Wrapper => {
            let rest = reader.take(reader.remaining(), "wrapperPayload")?;
            Payload::Wrapper(wrapper::parse_chunk(rest)?)
        },
        // Acks, keep-alives, mangler traffic, load/timeout notifications,
        // packet-router query/ack, and the sentinels carry no payload.
        CommandKind::AckBoth
        | CommandKind::AckStage1
        | CommandKind::AckStage2
        | CommandKind::GameCommand
        | CommandKind::KeepAlive
        | CommandKind::ManglerQuery
        | CommandKind::ManglerResponse
        | CommandKind::LoadComplete
        | CommandKind::TimeoutStart
        | CommandKind::DisconnectStart
        | CommandKind::DisconnectKeepAlive
        | CommandKind::PacketRouterQuery
        | CommandKind::PacketRouterAck
        | CommandKind::DisconnectEnd => Payload::Empty,
    })
}

fn encode_chat_text(text: &ChatText, out: &mut Vec<u8>) {
    let units = text.units();
    let count = units.len().min(MAX_CHAT_UNITS);
    out.push(count as u8);
    for unit in &units[..count] {
        out.extend_from_slice(&unit.to_le_bytes());
    }
}

/// Encodes an inner command into wire bytes.
///
/// Fields are written in the canonical order `T P F R C D`, omitting absent
/// tags; decoders accept any permutation.
#[must_use]
pub fn encode(command: &NetCommand) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.push(TAG_TYPE);
    out.push(command.kind.code());
    if let Some(sender) = command.sender {
        out.push(TAG_PLAYER);
        out.push(sender.as_u8());
    }
    if let Some(frame) = command.execution_frame {
        out.push(TAG_FRAME);
        out.extend_from_slice(&frame.as_u32().to_le_bytes());
    }
    if let Some(relay) = command.relay {
        out.push(TAG_RELAY);
        out.push(relay);
    }
    if let Some(id) = command.command_id {
        out.push(TAG_COMMAND_ID);
        out.extend_from_slice(&id.to_le_bytes());
    }
    out.push(TAG_DATA);
    encode_payload(&command.payload, &mut out);
    out
}

fn encode_payload(payload: &Payload, out: &mut Vec<u8>) {
    match payload {
        Payload::Empty => {},
        Payload::Chat { text, player_mask } => {
            encode_chat_text(text, out);
            out.extend_from_slice(&player_mask.to_le_bytes());
        },
        Payload::DisconnectChat { text } => encode_chat_text(text, out),
        Payload::RunAhead {
            new_run_ahead,
            new_frame_rate,
        } => {
            out.extend_from_slice(&new_run_ahead.to_le_bytes());
            out.push(*new_frame_rate);
        },
        Payload::RunAheadMetrics {
            average_latency,
            average_fps,
        } => {
            out.extend_from_slice(&average_latency.to_le_bytes());
            out.extend_from_slice(&average_fps.to_le_bytes());
        },
        Payload::DestroyPlayer { player_index } => {
            out.extend_from_slice(&player_index.to_le_bytes());
        },
        Payload::PlayerLeave { leaving_slot } => out.push(*leaving_slot),
        Payload::Progress { percentage } => out.push(*percentage),
        Payload::FrameInfo { command_count } => {
            out.extend_from_slice(&command_count.to_le_bytes());
        },
        Payload::FrameResendRequest { frame_to_resend } => {
            out.extend_from_slice(&frame_to_resend.as_u32().to_le_bytes());
        },
        Payload::DisconnectPlayer {
            disconnect_slot,
            disconnect_frame,
        } => {
            out.push(*disconnect_slot);
            out.extend_from_slice(&disconnect_frame.as_u32().to_le_bytes());
        },
        Payload::DisconnectVote {
            vote_slot,
            vote_frame,
        } => {
            out.push(*vote_slot);
            out.extend_from_slice(&vote_frame.as_u32().to_le_bytes());
        },
        Payload::DisconnectFrame { frame } => {
            out.extend_from_slice(&frame.as_u32().to_le_bytes());
        },
        Payload::DisconnectScreenOff { new_frame } => {
            out.extend_from_slice(&new_frame.as_u32().to_le_bytes());
        },
        Payload::File { path, data } => {
            out.extend_from_slice(path.as_bytes());
            out.push(0);
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
        },
        Payload::FileAnnounce {
            path,
            command_id,
            player_mask,
        } => {
            out.extend_from_slice(path.as_bytes());
            out.push(0);
            out.extend_from_slice(&command_id.to_le_bytes());
            out.push(*player_mask);
        },
        Payload::FileProgress {
            command_id,
            progress,
        } => {
            out.extend_from_slice(&command_id.to_le_bytes());
            out.extend_from_slice(&progress.to_le_bytes());
        },
        Payload::Wrapper(chunk) => wrapper::write_chunk(chunk, out),
    }
}


// =============================================================================
// Property-Based Tests
// =============================================================================

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod property_tests {
    use super::*;
    use crate::test_config::miri_case_count;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: miri_case_count(),
            ..ProptestConfig::default()
        })]
        /// Property: arbitrary bytes never panic the decoder.
        #[test]
        fn prop_decode_never_panics(bytes in any::<Vec<u8>>()) {
            let _ = decode(&bytes);
        }

        /// Property: chat text of any code units round-trips exactly.
        #[test]
        fn prop_chat_units_roundtrip(
            units in proptest::collection::vec(any::<u16>(), 0..=255),
            mask in any::<i32>(),
        ) {
            let cmd = NetCommand::new(CommandKind::Chat).with_payload(Payload::Chat {
                text: ChatText::from_units(units.clone()),
                player_mask: mask,
            });
            let decoded = decode(&encode(&cmd)).unwrap();
            match decoded.payload {
                Payload::Chat { text, player_mask } => {
                    prop_assert_eq!(text.units(), units.as_slice());
                    prop_assert_eq!(player_mask, mask);
                }
                other => prop_assert!(false, "unexpected payload {:?}", other),
            }
        }

        /// Property: tag fields round-trip for synchronized commands.
        #[test]
        fn prop_tags_roundtrip(
            sender in 0u8..16,
            frame in any::<u32>(),
            id in any::<u16>(),
        ) {
            let cmd = NetCommand::new(CommandKind::GameCommand)
                .with_sender(PlayerSlot::new(sender))
                .with_execution_frame(Frame::new(frame))
                .with_command_id(id);
            prop_assert_eq!(decode(&encode(&cmd)).unwrap(), cmd);
        }
    }
}
