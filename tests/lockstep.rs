//! End-to-end lockstep scenarios driven through the manager's public
//! surface with a recording transport.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

mod common;

use bastion_lockstep::crc::Crc32;
use bastion_lockstep::wire::{codec as wire_codec, wrapper};
use bastion_lockstep::{
    ChatText, CommandKind, ConsensusStatus, Frame, GameLogicCrcWriters, InboundCommand,
    NetCommand, Payload, PlayerSlot,
};
use common::{clear_sent, sent_commands, started_manager};
use web_time::Duration;

fn game_command(sender: u8, frame: u32, id: u16) -> InboundCommand {
    InboundCommand::typed(CommandKind::GameCommand.code())
        .with_sender(sender)
        .with_execution_frame(frame)
        .with_command_id(id)
}

fn frame_info(sender: u8, frame: u32, count: u16) -> InboundCommand {
    InboundCommand::typed(CommandKind::FrameInfo.code())
        .with_sender(sender)
        .with_frame(frame)
        .with_command_count(count)
}

fn stub_writers() -> GameLogicCrcWriters {
    GameLogicCrcWriters {
        objects: Box::new(|crc: &mut Crc32| crc.update(b"objects")),
        partition_manager: Box::new(|crc: &mut Crc32| crc.update(b"partition")),
        player_list: Box::new(|crc: &mut Crc32| crc.update(b"players")),
        ai: Box::new(|crc: &mut Crc32| crc.update(b"ai")),
    }
}

#[test]
fn basic_frame_hash_mismatch() {
    let (mut manager, _sent, _t0) = started_manager(2);

    let bare = InboundCommand::typed(3).with_sender(1).with_frame(5);
    assert!(manager.process_incoming_command(&bare));
    let local = manager.deterministic_frame_hash(Frame::new(5));

    let report = InboundCommand::typed(3)
        .with_sender(1)
        .with_frame(5)
        .with_frame_hash(local.wrapping_add(1));
    assert!(manager.process_incoming_command(&report));

    assert!(manager.saw_crc_mismatch());
    assert_eq!(manager.frame_hash_mismatch_frames(), &[Frame::new(5)]);
}

#[test]
fn matching_remote_hash_is_clean() {
    let (mut manager, _sent, _t0) = started_manager(2);
    let local = manager.deterministic_frame_hash(Frame::new(5));
    let report = InboundCommand::typed(3)
        .with_sender(1)
        .with_frame(5)
        .with_frame_hash(local);
    manager.process_incoming_command(&report);
    assert!(!manager.saw_crc_mismatch());
}

#[test]
fn frame_readiness_gate() {
    let (mut manager, _sent, _t0) = started_manager(2);
    assert!(!manager.is_frame_data_ready(), "peer 1 owes a frame info");

    assert!(manager.process_incoming_command(&frame_info(1, 0, 2)));
    assert!(!manager.is_frame_data_ready());

    assert!(manager.process_incoming_command(&game_command(1, 0, 200)));
    assert!(!manager.is_frame_data_ready());
    assert!(manager.process_incoming_command(&game_command(1, 0, 201)));
    assert!(manager.is_frame_data_ready());

    assert!(manager.consume_ready_frame(Frame::ZERO));
    assert!(!manager.is_frame_data_ready());
    assert!(!manager.consume_ready_frame(Frame::ZERO), "fires exactly once");
}

#[test]
fn command_count_overflow_triggers_resend() {
    let (mut manager, sent, _t0) = started_manager(2);
    manager.process_incoming_command(&frame_info(1, 0, 2));
    manager.process_incoming_command(&game_command(1, 0, 200));
    manager.process_incoming_command(&game_command(1, 0, 201));
    assert!(!manager.saw_frame_command_count_mismatch());
    assert!(sent_commands(&sent).is_empty());

    manager.process_incoming_command(&game_command(1, 0, 202));

    assert!(manager.saw_frame_command_count_mismatch());
    let requests = manager.frame_resend_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].player_id, PlayerSlot::new(1));
    assert_eq!(requests[0].frame, Frame::ZERO);

    let log = sent_commands(&sent);
    let resends: Vec<_> = log
        .iter()
        .filter(|(c, _)| c.kind == CommandKind::FrameResendRequest)
        .collect();
    assert_eq!(resends.len(), 1, "exactly one resend request on the wire");
    let (command, relay) = resends[0];
    assert_eq!(command.sender, Some(PlayerSlot::new(0)));
    assert_eq!(
        command.payload,
        Payload::FrameResendRequest {
            frame_to_resend: Frame::ZERO
        }
    );
    assert!(command.command_id.is_some(), "resend requests carry an id");
    assert_eq!(relay.bits(), 1 << 1);
}

#[test]
fn duplicate_synchronized_command_is_idempotent() {
    let (mut manager, sent, _t0) = started_manager(2);
    manager.process_incoming_command(&frame_info(1, 0, 1));

    assert!(manager.process_incoming_command(&game_command(1, 0, 200)));
    assert_eq!(manager.queued_command_count(), 1);

    // Redelivery of the same command id is consumed without effect.
    assert!(manager.process_incoming_command(&game_command(1, 0, 200)));
    assert_eq!(manager.queued_command_count(), 1);
    assert!(!manager.saw_frame_command_count_mismatch());
    assert!(sent_commands(&sent).is_empty());
    assert!(manager.is_frame_data_ready());
}

#[test]
fn packet_router_timeout_evicts_silent_peer() {
    let (mut manager, sent, t0) = started_manager(2);
    assert_eq!(manager.packet_router_slot(), Some(PlayerSlot::new(0)));

    manager.update_at(t0);
    assert!(manager.is_player_connected(PlayerSlot::new(1)));

    // Past the disconnect timeout: screen up, keep-alives flowing.
    let stalled = t0 + Duration::from_secs(11);
    manager.update_at(stalled);

    // Past the player timeout with no keep-alive from slot 1: eviction.
    let deadline = stalled + Duration::from_secs(61);
    manager.update_at(deadline);

    let log = sent_commands(&sent);
    let disconnects: Vec<_> = log
        .iter()
        .filter(|(c, _)| c.kind == CommandKind::DisconnectPlayer)
        .collect();
    assert_eq!(disconnects.len(), 1);
    let (command, relay) = disconnects[0];
    assert_eq!(
        command.payload,
        Payload::DisconnectPlayer {
            disconnect_slot: 1,
            disconnect_frame: Frame::ZERO
        }
    );
    assert_eq!(relay.bits(), 1 << 1);

    let destroys: Vec<_> = log
        .iter()
        .filter(|(c, _)| c.kind == CommandKind::DestroyPlayer)
        .collect();
    assert_eq!(destroys.len(), 1);
    let (command, relay) = destroys[0];
    assert_eq!(command.payload, Payload::DestroyPlayer { player_index: 1 });
    assert_eq!(command.execution_frame, Some(Frame::new(31)));
    assert_eq!(relay.bits(), 1 << 1);

    assert!(!manager.is_player_connected(PlayerSlot::new(1)));
}

#[test]
fn disconnection_is_monotonic() {
    let (mut manager, _sent, t0) = started_manager(2);
    manager.update_at(t0);
    let stalled = t0 + Duration::from_secs(11);
    manager.update_at(stalled);
    manager.update_at(stalled + Duration::from_secs(61));
    assert!(!manager.is_player_connected(PlayerSlot::new(1)));

    // Nothing the evicted peer sends brings it back.
    let keep_alive = InboundCommand::typed(CommandKind::DisconnectKeepAlive.code()).with_sender(1);
    manager.process_incoming_command(&keep_alive);
    manager.process_incoming_command(&frame_info(1, 3, 1));
    assert!(!manager.is_player_connected(PlayerSlot::new(1)));
}

#[test]
fn keep_alive_receipt_prevents_eviction() {
    let (mut manager, _sent, t0) = started_manager(2);
    manager.update_at(t0);
    let stalled = t0 + Duration::from_secs(11);
    manager.update_at(stalled);

    let keep_alive = InboundCommand::typed(CommandKind::DisconnectKeepAlive.code()).with_sender(1);
    manager.process_incoming_command_at(&keep_alive, stalled + Duration::from_secs(59));

    manager.update_at(stalled + Duration::from_secs(61));
    assert!(manager.is_player_connected(PlayerSlot::new(1)));
}

#[test]
fn wrapper_reassembly_preserves_inner_chat() {
    let (mut manager, _sent, _t0) = started_manager(2);

    let inner = NetCommand::new(CommandKind::Chat)
        .with_sender(PlayerSlot::new(1))
        .with_payload(Payload::Chat {
            text: ChatText::from("hello"),
            player_mask: 1,
        });
    let encoded = wire_codec::encode(&inner);
    let chunks = wrapper::split_into_chunks(0x1234, &encoded, encoded.len().div_ceil(2));
    assert_eq!(chunks.len(), 2);

    // Deliver in reverse order.
    let second = InboundCommand::typed(CommandKind::Wrapper.code()).with_chunk(chunks[1].clone());
    let first = InboundCommand::typed(CommandKind::Wrapper.code()).with_chunk(chunks[0].clone());
    assert!(manager.process_incoming_command(&second));
    assert!(manager.chat_history().is_empty());
    assert!(manager.process_incoming_command(&first));

    let history = manager.chat_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].sender, PlayerSlot::new(1));
    assert_eq!(history[0].text, "hello");
    assert_eq!(history[0].mask, 1);
}

#[test]
fn wrapper_chunks_as_wire_bytes_reassemble_identically() {
    let (mut manager, _sent, _t0) = started_manager(2);

    let inner = NetCommand::new(CommandKind::Chat)
        .with_sender(PlayerSlot::new(1))
        .with_payload(Payload::Chat {
            text: ChatText::from("hello"),
            player_mask: 1,
        });
    let encoded = wire_codec::encode(&inner);
    let chunks = wrapper::split_into_chunks(0x77, &encoded, encoded.len().div_ceil(2));

    for chunk in chunks.iter().rev() {
        let wire_command = NetCommand::new(CommandKind::Wrapper)
            .with_payload(Payload::Wrapper(chunk.clone()));
        let record = InboundCommand::from_wire(wire_codec::encode(&wire_command));
        assert!(manager.process_incoming_command(&record));
    }

    assert_eq!(manager.chat_history().len(), 1);
    assert_eq!(manager.chat_history()[0].text, "hello");
}

#[test]
fn reified_inner_command_beats_chunk_metadata() {
    let (mut manager, _sent, _t0) = started_manager(2);

    let inner = InboundCommand::typed(CommandKind::Chat.code())
        .with_sender(1)
        .with_payload(Payload::Chat {
            text: ChatText::from("direct"),
            player_mask: 1,
        });
    let chunks = wrapper::split_into_chunks(5, &[1, 2, 3, 4], 2);
    let record = InboundCommand::typed(CommandKind::Wrapper.code())
        .with_wrapped(inner)
        .with_chunk(chunks[0].clone());
    assert!(manager.process_incoming_command(&record));

    assert_eq!(manager.chat_history().len(), 1);
    assert_eq!(manager.chat_history()[0].text, "direct");
    // The chunk metadata in the same message was ignored: delivering the
    // remaining chunk never completes an assembly.
    let rest = InboundCommand::typed(CommandKind::Wrapper.code()).with_chunk(chunks[1].clone());
    assert!(manager.process_incoming_command(&rest));
    assert_eq!(manager.chat_history().len(), 1);
}

#[test]
fn game_logic_crc_consensus_transitions() {
    let (mut manager, _sent, _t0) = started_manager(3);
    manager.install_game_logic_crc_writers(stub_writers());

    let frame = Frame::new(30);
    let local = manager.deterministic_game_logic_crc(frame).unwrap();

    let report = frame_info(1, 30, 0).with_logic_crc(local);
    manager.process_incoming_command(&report);
    let consensus = manager.game_logic_crc_consensus(frame);
    assert_eq!(consensus.status, ConsensusStatus::Pending);
    assert_eq!(consensus.missing_player_ids, vec![PlayerSlot::new(2)]);
    assert!(consensus.mismatched_player_ids.is_empty());

    let report = frame_info(2, 30, 0).with_logic_crc(local.wrapping_add(1));
    manager.process_incoming_command(&report);
    let consensus = manager.game_logic_crc_consensus(frame);
    assert_eq!(consensus.status, ConsensusStatus::Mismatch);
    assert_eq!(consensus.mismatched_player_ids, vec![PlayerSlot::new(2)]);
    assert_eq!(consensus.validator_crc, Some(local));
    assert!(manager.saw_crc_mismatch());
}

#[test]
fn remote_crc_cached_until_writers_install() {
    let (mut manager, _sent, _t0) = started_manager(2);

    let report = frame_info(1, 12, 0).with_logic_crc(0xDEAD_BEEF);
    manager.process_incoming_command(&report);
    assert!(!manager.saw_crc_mismatch(), "no local value to compare yet");

    manager.install_game_logic_crc_writers(stub_writers());
    assert!(manager.saw_crc_mismatch());
    assert_eq!(
        manager.game_logic_crc_mismatch_frames(),
        &[Frame::new(12)]
    );
}

#[test]
fn disconnect_frame_replays_archive_to_lagging_peer() {
    let (mut manager, sent, t0) = started_manager(3);

    // Frame 0: peer 1 contributes two commands plus its frame info.
    manager.process_incoming_command(&frame_info(1, 0, 2));
    manager.process_incoming_command(&frame_info(2, 0, 0));
    manager.process_incoming_command(&game_command(1, 0, 10));
    manager.process_incoming_command(&game_command(1, 0, 11));

    // Advance two frames.
    manager.update_at(t0);
    manager.process_incoming_command(&frame_info(1, 1, 0));
    manager.process_incoming_command(&frame_info(2, 1, 0));
    manager.update_at(t0 + Duration::from_millis(40));
    assert_eq!(manager.game_frame(), Frame::new(2));
    clear_sent(&sent);

    // Peer 2 reports it is stuck at frame 0.
    let report = InboundCommand::typed(CommandKind::DisconnectFrame.code())
        .with_sender(2)
        .with_command_id(900)
        .with_payload(Payload::DisconnectFrame {
            frame: Frame::ZERO,
        });
    manager.process_incoming_command(&report);

    let log = sent_commands(&sent);
    let replayed: Vec<_> = log
        .iter()
        .filter(|(c, _)| c.kind == CommandKind::GameCommand)
        .collect();
    assert_eq!(replayed.len(), 2, "both archived commands replayed");
    for (_, relay) in &replayed {
        assert_eq!(relay.bits(), 1 << 2);
    }
    let infos: Vec<_> = log
        .iter()
        .filter(|(c, _)| c.kind == CommandKind::FrameInfo)
        .collect();
    assert!(
        infos
            .iter()
            .any(|(c, _)| c.sender == Some(PlayerSlot::new(1))
                && c.payload == Payload::FrameInfo { command_count: 2 }),
        "frame info synthesized from the archived count"
    );
}

#[test]
fn disconnect_vote_majority_evicts_target() {
    let (mut manager, sent, _t0) = started_manager(4);

    // Local vote against peer 3.
    manager.vote_for_player_disconnect(PlayerSlot::new(3));
    assert_eq!(
        manager.disconnect_vote_count(PlayerSlot::new(3), Frame::ZERO),
        1
    );
    assert!(manager.is_player_connected(PlayerSlot::new(3)));
    {
        let log = sent_commands(&sent);
        let votes: Vec<_> = log
            .iter()
            .filter(|(c, _)| c.kind == CommandKind::DisconnectVote)
            .collect();
        assert_eq!(votes.len(), 1);
        assert!(votes[0].0.command_id.is_some());
    }

    // Peer 1 concurs: 2 of 3 others is a majority.
    let vote = InboundCommand::typed(CommandKind::DisconnectVote.code())
        .with_sender(1)
        .with_command_id(700)
        .with_payload(Payload::DisconnectVote {
            vote_slot: 3,
            vote_frame: Frame::ZERO,
        });
    manager.process_incoming_command(&vote);
    assert!(!manager.is_player_connected(PlayerSlot::new(3)));
}

#[test]
fn screen_off_from_router_resumes_simulation() {
    // Local slot 0 is the router's peer here: make peer 0 the router by
    // viewing from slot 1.
    let (mut manager, _sent, t0) = started_manager(3);
    manager.set_packet_router_slot(Some(PlayerSlot::new(1)));

    manager.update_at(t0);
    manager.update_at(t0 + Duration::from_secs(11));
    assert_eq!(
        manager.disconnect_screen(),
        bastion_lockstep::DisconnectScreen::On
    );
    let notices = manager.pending_frame_notices();

    let screen_off = InboundCommand::typed(CommandKind::DisconnectScreenOff.code())
        .with_sender(1)
        .with_command_id(41)
        .with_payload(Payload::DisconnectScreenOff {
            new_frame: Frame::new(1),
        });
    manager.process_incoming_command(&screen_off);
    assert_eq!(
        manager.disconnect_screen(),
        bastion_lockstep::DisconnectScreen::Off
    );
    assert_eq!(manager.pending_frame_notices(), notices + 1);
}

#[test]
fn textual_aliases_resolve_like_codes() {
    let (mut manager, _sent, _t0) = started_manager(2);

    let info = InboundCommand::named("NetCommandType_FrameInfo")
        .with_sender(1)
        .with_frame(0)
        .with_command_count(0);
    assert!(manager.process_incoming_command(&info));
    assert!(manager.is_frame_data_ready());

    assert!(!manager.process_incoming_command(&InboundCommand::named("no-such-kind")));
    assert!(!manager.process_incoming_command(&InboundCommand::default()));
}

#[test]
fn unknown_numeric_code_is_not_consumed() {
    let (mut manager, _sent, _t0) = started_manager(2);
    let record = InboundCommand::typed(250).with_sender(1);
    assert!(!manager.process_incoming_command(&record));
}
