//! The frame resend archive.
//!
//! Peers that fall behind — or that report an old frame while the
//! disconnect screen is up — are caught up by replaying the synchronized
//! commands the local peer has already seen. The archive keeps a sliding
//! window of [`FRAMES_TO_KEEP`](crate::FRAMES_TO_KEEP) frames of
//! `(sender, frame) -> commands` plus each sender's announced command
//! count, and builds replay plans in frame order.

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::frame_window::FrameWindow;
use crate::wire::payload::{NetCommand, Payload};
use crate::{CommandKind, ConnectionSet, Frame, PlayerSlot, FRAMES_TO_KEEP};

#[derive(Debug, Default, Clone)]
struct ArchivedSender {
    expected_command_count: Option<u16>,
    commands: SmallVec<[NetCommand; 4]>,
}

type ArchivedFrame = BTreeMap<PlayerSlot, ArchivedSender>;

/// Sliding window of archived synchronized commands, used to replay frames
/// for peers that fall behind.
pub struct FrameResendArchive {
    frames: FrameWindow<ArchivedFrame>,
}

impl FrameResendArchive {
    /// Creates an empty archive.
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: FrameWindow::new(FRAMES_TO_KEEP),
        }
    }

    /// Archives a synchronized command from `sender` for `frame`, in
    /// arrival order.
    pub fn record_command(&mut self, sender: PlayerSlot, frame: Frame, command: &NetCommand) {
        self.frames
            .entry(frame)
            .entry(sender)
            .or_default()
            .commands
            .push(command.clone());
    }

    /// Records the command count `sender` announced for `frame`.
    pub fn record_expected_count(&mut self, sender: PlayerSlot, frame: Frame, count: u16) {
        self.frames
            .entry(frame)
            .entry(sender)
            .or_default()
            .expected_command_count = Some(count);
    }

    /// Number of archived commands from `sender` for `frame`.
    #[must_use]
    pub fn archived_command_count(&self, sender: PlayerSlot, frame: Frame) -> usize {
        self.frames
            .get(frame)
            .and_then(|by_sender| by_sender.get(&sender))
            .map_or(0, |archived| archived.commands.len())
    }

    /// Builds the replay plan for a peer that fell behind.
    ///
    /// Returns, in frame order over `start..=current`, the archived
    /// commands (sender order, each sender's commands in arrival order)
    /// followed by a synthesized FrameInfo for every `(sender, frame)` with
    /// a known command count. The caller replays the plan through the
    /// transport with the target's relay mask, assigning fresh command ids
    /// to commands that require them.
    #[must_use]
    pub fn build_resend_plan(
        &self,
        target: PlayerSlot,
        start: Frame,
        current: Frame,
        connected: ConnectionSet,
    ) -> Vec<NetCommand> {
        let mut plan = Vec::new();
        let mut frame = start;
        while frame <= current {
            if let Some(by_sender) = self.frames.get(frame) {
                for (sender, archived) in by_sender {
                    if *sender == target {
                        continue;
                    }
                    plan.extend(archived.commands.iter().cloned());
                }
                for (sender, archived) in by_sender {
                    if *sender == target || !connected.contains(*sender) {
                        continue;
                    }
                    if let Some(count) = archived.expected_command_count {
                        plan.push(
                            NetCommand::new(CommandKind::FrameInfo)
                                .with_sender(*sender)
                                .with_execution_frame(frame)
                                .with_payload(Payload::FrameInfo {
                                    command_count: count,
                                }),
                        );
                    }
                }
            }
            frame += 1;
        }
        plan
    }

    /// Discards entries older than `current - FRAMES_TO_KEEP + 1`.
    pub fn prune_history(&mut self, current: Frame) {
        self.frames
            .prune_before(current.saturating_sub(FRAMES_TO_KEEP as u32 - 1));
    }

    /// Drops every archived frame.
    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Number of frames currently archived.
    #[must_use]
    pub fn archived_frames(&self) -> usize {
        self.frames.len()
    }
}

impl Default for FrameResendArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameResendArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameResendArchive")
            .field("archived_frames", &self.frames.len())
            .finish_non_exhaustive()
    }
}
