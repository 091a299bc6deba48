//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use bastion_lockstep::{
    GameUser, NetCommand, NetworkConfig, NetworkManager, RelayMask, Transport, UserList,
};
use web_time::Instant;

/// Everything the manager sent, in call order.
pub type SentLog = Arc<Mutex<Vec<(NetCommand, RelayMask)>>>;

/// A transport that records every outbound command.
pub struct RecordingTransport {
    sent: SentLog,
}

impl Transport for RecordingTransport {
    fn send_local_command_direct(&mut self, command: &NetCommand, relay: RelayMask) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((command.clone(), relay));
        }
    }
}

/// Creates a recording transport and the log it writes to.
#[must_use]
pub fn recording_transport() -> (Box<dyn Transport + Send>, SentLog) {
    let sent: SentLog = Arc::new(Mutex::new(Vec::new()));
    (
        Box::new(RecordingTransport { sent: sent.clone() }),
        sent,
    )
}

/// Snapshots the log's contents.
#[must_use]
pub fn sent_commands(log: &SentLog) -> Vec<(NetCommand, RelayMask)> {
    log.lock().expect("sent log poisoned").clone()
}

/// Empties the log.
pub fn clear_sent(log: &SentLog) {
    log.lock().expect("sent log poisoned").clear();
}

/// A user list of `humans` human players named `player0..`, slot 0 local.
#[must_use]
pub fn human_user_list(humans: usize) -> UserList {
    let slots = (0..humans)
        .map(|i| {
            let user = GameUser::human(&format!("player{i}"));
            Some(if i == 0 { user.local() } else { user })
        })
        .collect();
    UserList::Slots(slots)
}

/// A started manager with `humans` human players (slot 0 local), a
/// recording transport, and the clock reading it was started at.
#[must_use]
pub fn started_manager(humans: usize) -> (NetworkManager, SentLog, Instant) {
    let t0 = Instant::now();
    let mut manager = NetworkManager::new(NetworkConfig {
        local_player_name: "player0".to_string(),
        ..NetworkConfig::default()
    });
    let (transport, sent) = recording_transport();
    manager.attach_transport(transport);
    manager.parse_user_list(&human_user_list(humans));
    manager.init_at(t0);
    (manager, sent, t0)
}
