//! User-list normalization.
//!
//! Lobby metadata arrives in several shapes depending on the matchmaking
//! path: an ordered slot array, a slot map, or a legacy comma-separated
//! string. All of them normalize into the same slot-to-name and
//! slot-to-side tables; AI and unoccupied slots are excluded from the
//! connection set.

use std::collections::BTreeMap;

use tracing::trace;

use crate::{PlayerSlot, MAX_SLOTS};

/// Occupancy of one lobby slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum UserKind {
    /// A human player; joins the connection set.
    #[default]
    Human,
    /// An AI player; excluded from the connection set.
    Ai,
    /// An open or closed slot; excluded.
    Open,
}

/// One lobby slot entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GameUser {
    /// Player name.
    pub name: String,
    /// Faction/side, when known.
    pub side: Option<String>,
    /// Occupancy kind.
    pub kind: UserKind,
    /// Marks the local player's slot.
    pub is_local: bool,
}

impl GameUser {
    /// A human entry with the given name.
    #[must_use]
    pub fn human(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Marks this entry as the local player.
    #[must_use]
    pub fn local(mut self) -> Self {
        self.is_local = true;
        self
    }

    /// Sets the faction/side.
    #[must_use]
    pub fn with_side(mut self, side: &str) -> Self {
        self.side = Some(side.to_string());
        self
    }
}

/// The accepted user-list shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserList {
    /// Ordered slot array; the index is the slot number. `None` entries
    /// are open slots.
    Slots(Vec<Option<GameUser>>),
    /// Explicit slot-to-user map.
    Map(BTreeMap<u8, GameUser>),
    /// Legacy comma-separated string: entries of `name[:side]`, a `*`
    /// prefix marking the local slot; empty names, `open`, `closed`, and
    /// `(ai)`-prefixed names are unoccupied or AI slots.
    Legacy(String),
}

/// Normalized user tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedUsers {
    /// Slot-to-name table for human slots.
    pub names: BTreeMap<PlayerSlot, String>,
    /// Slot-to-side table for human slots with a known side.
    pub sides: BTreeMap<PlayerSlot, String>,
    /// The local slot, when the list carries a hint for it.
    pub local_slot: Option<PlayerSlot>,
}

fn parse_legacy_entry(entry: &str) -> Option<GameUser> {
    let trimmed = entry.trim();
    let (is_local, rest) = match trimmed.strip_prefix('*') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let (name, side) = match rest.split_once(':') {
        Some((name, side)) => (name.trim(), Some(side.trim())),
        None => (rest, None),
    };
    let lowered = name.to_ascii_lowercase();
    if name.is_empty() || lowered == "open" || lowered == "closed" {
        return Some(GameUser {
            kind: UserKind::Open,
            ..GameUser::default()
        });
    }
    if lowered.starts_with("(ai)") {
        return Some(GameUser {
            name: name.to_string(),
            kind: UserKind::Ai,
            ..GameUser::default()
        });
    }
    let mut user = GameUser::human(name);
    user.is_local = is_local;
    if let Some(side) = side.filter(|s| !s.is_empty()) {
        user.side = Some(side.to_string());
    }
    Some(user)
}

/// Normalizes any accepted shape into the slot tables.
///
/// `local_name` is the configured local player name; a name match is a
/// local-slot hint when the list carries no explicit marker.
#[must_use]
pub fn parse_user_list(list: &UserList, local_name: &str) -> ParsedUsers {
    let entries: Vec<(u8, GameUser)> = match list {
        UserList::Slots(slots) => slots
            .iter()
            .enumerate()
            .filter_map(|(index, user)| {
                let slot = u8::try_from(index).ok()?;
                user.as_ref().map(|user| (slot, user.clone()))
            })
            .collect(),
        UserList::Map(map) => map.iter().map(|(slot, user)| (*slot, user.clone())).collect(),
        UserList::Legacy(raw) => raw
            .split(',')
            .enumerate()
            .filter_map(|(index, entry)| {
                let slot = u8::try_from(index).ok()?;
                parse_legacy_entry(entry).map(|user| (slot, user))
            })
            .collect(),
    };

    let mut parsed = ParsedUsers::default();
    for (raw_slot, user) in entries {
        let slot = PlayerSlot::new(raw_slot);
        if !slot.is_valid() {
            trace!(slot = raw_slot, "slot beyond {}, ignored", MAX_SLOTS);
            continue;
        }
        if user.kind != UserKind::Human {
            continue;
        }
        if user.is_local || (!local_name.is_empty() && user.name == local_name) {
            parsed.local_slot.get_or_insert(slot);
        }
        parsed.names.insert(slot, user.name);
        if let Some(side) = user.side {
            parsed.sides.insert(slot, side);
        }
    }
    parsed
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn slot_array_shape() {
        let list = UserList::Slots(vec![
            Some(GameUser::human("alice").local().with_side("usa")),
            None,
            Some(GameUser::human("bob")),
            Some(GameUser {
                name: "(AI) Easy".to_string(),
                kind: UserKind::Ai,
                ..GameUser::default()
            }),
        ]);
        let parsed = parse_user_list(&list, "");
        assert_eq!(parsed.names.len(), 2);
        assert_eq!(parsed.names[&PlayerSlot::new(0)], "alice");
        assert_eq!(parsed.names[&PlayerSlot::new(2)], "bob");
        assert_eq!(parsed.sides[&PlayerSlot::new(0)], "usa");
        assert_eq!(parsed.local_slot, Some(PlayerSlot::new(0)));
    }

    #[test]
    fn map_shape() {
        let mut map = BTreeMap::new();
        map.insert(1, GameUser::human("carol"));
        map.insert(4, GameUser::human("dave"));
        let parsed = parse_user_list(&UserList::Map(map), "dave");
        assert_eq!(parsed.names.len(), 2);
        assert_eq!(parsed.local_slot, Some(PlayerSlot::new(4)), "name hint");
    }

    #[test]
    fn legacy_string_shape() {
        let list = UserList::Legacy("*alice:usa, bob:gla, open, (AI) Hard, closed".to_string());
        let parsed = parse_user_list(&list, "");
        assert_eq!(parsed.names.len(), 2);
        assert_eq!(parsed.names[&PlayerSlot::new(0)], "alice");
        assert_eq!(parsed.sides[&PlayerSlot::new(0)], "usa");
        assert_eq!(parsed.names[&PlayerSlot::new(1)], "bob");
        assert_eq!(parsed.local_slot, Some(PlayerSlot::new(0)));
    }

    #[test]
    fn ai_and_open_slots_excluded() {
        let list = UserList::Legacy("open, (ai) bot, carol".to_string());
        let parsed = parse_user_list(&list, "");
        assert_eq!(parsed.names.len(), 1);
        assert_eq!(parsed.names[&PlayerSlot::new(2)], "carol");
    }

    #[test]
    fn slots_beyond_max_are_ignored() {
        let entries: Vec<Option<GameUser>> = (0..20)
            .map(|i| Some(GameUser::human(&format!("p{i}"))))
            .collect();
        let parsed = parse_user_list(&UserList::Slots(entries), "");
        assert_eq!(parsed.names.len(), MAX_SLOTS);
    }

    #[test]
    fn explicit_marker_beats_name_hint() {
        let list = UserList::Slots(vec![
            Some(GameUser::human("alice")),
            Some(GameUser::human("bob").local()),
        ]);
        let parsed = parse_user_list(&list, "alice");
        // Both hints exist; the first hit in slot order wins.
        assert_eq!(parsed.local_slot, Some(PlayerSlot::new(0)));
    }
}
