//! Bounded per-frame storage.
//!
//! The frame-hash ledger, the game-logic CRC ledger, and the resend archive
//! all keep a sliding window of [`FRAMES_TO_KEEP`](crate::FRAMES_TO_KEEP)
//! frames. [`FrameWindow`] implements that window as a small ring indexed by
//! `frame % N`, with a sparse overflow map for late arrivals that fall
//! outside the ring, so pruning stays cheap and nothing is lost before an
//! explicit prune.

use std::collections::BTreeMap;

use crate::Frame;

/// A bounded map from frames to values.
///
/// Values live in a fixed-size ring indexed by `frame % capacity`; when two
/// live frames collide on a ring slot, the older one is displaced into a
/// sparse overflow map. Entries are only ever removed by
/// [`prune_before`](Self::prune_before) or [`clear`](Self::clear): every
/// entry with frame `>= f` survives `prune_before(f)` unchanged.
#[derive(Debug, Clone)]
pub(crate) struct FrameWindow<T> {
    slots: Vec<Option<(Frame, T)>>,
    overflow: BTreeMap<Frame, T>,
}

impl<T> FrameWindow<T> {
    /// Creates a window with the given ring capacity.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity.max(1));
        slots.resize_with(capacity.max(1), || None);
        Self {
            slots,
            overflow: BTreeMap::new(),
        }
    }

    fn slot_index(&self, frame: Frame) -> usize {
        frame.ring_index(self.slots.len())
    }

    /// Returns the value for `frame`, if present.
    pub fn get(&self, frame: Frame) -> Option<&T> {
        match &self.slots[self.slot_index(frame)] {
            Some((f, value)) if *f == frame => Some(value),
            _ => self.overflow.get(&frame),
        }
    }

    /// Returns a mutable reference to the value for `frame`, if present.
    pub fn get_mut(&mut self, frame: Frame) -> Option<&mut T> {
        let index = self.slot_index(frame);
        match &mut self.slots[index] {
            Some((f, value)) if *f == frame => Some(value),
            _ => self.overflow.get_mut(&frame),
        }
    }

    /// Returns a mutable reference to the value for `frame`, inserting a
    /// default if absent.
    pub fn entry(&mut self, frame: Frame) -> &mut T
    where
        T: Default,
    {
        let index = self.slot_index(frame);
        let resident = self.slots[index].as_ref().map(|(f, _)| *f);
        match resident {
            Some(f) if f == frame => {},
            None => self.slots[index] = Some((frame, T::default())),
            Some(f) if frame > f => {
                // Newer frame takes the ring slot; the older resident moves
                // to the overflow so late reads still find it.
                if let Some((old_frame, old_value)) = self.slots[index].take() {
                    self.overflow.insert(old_frame, old_value);
                }
                self.slots[index] = Some((frame, T::default()));
            },
            Some(_) => return self.overflow.entry(frame).or_default(),
        }
        match &mut self.slots[index] {
            Some((_, value)) => value,
            // Every arm above either returned or filled the slot.
            None => unreachable!(),
        }
    }

    /// Removes and returns the value for `frame`.
    pub fn remove(&mut self, frame: Frame) -> Option<T> {
        let index = self.slot_index(frame);
        match &self.slots[index] {
            Some((f, _)) if *f == frame => self.slots[index].take().map(|(_, v)| v),
            _ => self.overflow.remove(&frame),
        }
    }

    /// Removes every entry with frame strictly less than `frame`.
    pub fn prune_before(&mut self, frame: Frame) {
        for slot in &mut self.slots {
            if matches!(slot, Some((f, _)) if *f < frame) {
                *slot = None;
            }
        }
        let kept = self.overflow.split_off(&frame);
        self.overflow = kept;
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.overflow.clear();
    }

    /// The frames currently stored, in ascending order.
    pub fn frames(&self) -> Vec<Frame> {
        let mut frames: Vec<Frame> = self
            .slots
            .iter()
            .filter_map(|slot| slot.as_ref().map(|(f, _)| *f))
            .chain(self.overflow.keys().copied())
            .collect();
        frames.sort_unstable();
        frames
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count() + self.overflow.len()
    }

    /// Returns `true` when no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn entry_and_get() {
        let mut window: FrameWindow<u32> = FrameWindow::new(8);
        *window.entry(Frame::new(3)) = 30;
        *window.entry(Frame::new(5)) = 50;
        assert_eq!(window.get(Frame::new(3)), Some(&30));
        assert_eq!(window.get(Frame::new(5)), Some(&50));
        assert_eq!(window.get(Frame::new(4)), None);
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn ring_collision_displaces_older_to_overflow() {
        let mut window: FrameWindow<u32> = FrameWindow::new(4);
        *window.entry(Frame::new(1)) = 10;
        *window.entry(Frame::new(5)) = 50; // 5 % 4 == 1 % 4
        assert_eq!(window.get(Frame::new(1)), Some(&10));
        assert_eq!(window.get(Frame::new(5)), Some(&50));
    }

    #[test]
    fn late_arrival_goes_to_overflow() {
        let mut window: FrameWindow<u32> = FrameWindow::new(4);
        *window.entry(Frame::new(9)) = 90;
        *window.entry(Frame::new(1)) = 10; // older frame, same slot
        assert_eq!(window.get(Frame::new(9)), Some(&90));
        assert_eq!(window.get(Frame::new(1)), Some(&10));
    }

    #[test]
    fn prune_before_is_exact() {
        let mut window: FrameWindow<u32> = FrameWindow::new(4);
        for raw in 0..10u32 {
            *window.entry(Frame::new(raw)) = raw;
        }
        window.prune_before(Frame::new(6));
        for raw in 0..6u32 {
            assert_eq!(window.get(Frame::new(raw)), None, "frame {raw}");
        }
        for raw in 6..10u32 {
            assert_eq!(window.get(Frame::new(raw)), Some(&raw), "frame {raw}");
        }
    }

    #[test]
    fn remove_hits_ring_and_overflow() {
        let mut window: FrameWindow<u32> = FrameWindow::new(4);
        *window.entry(Frame::new(9)) = 90;
        *window.entry(Frame::new(1)) = 10; // overflow
        assert_eq!(window.remove(Frame::new(1)), Some(10));
        assert_eq!(window.remove(Frame::new(9)), Some(90));
        assert!(window.is_empty());
    }

    #[test]
    fn frames_are_sorted() {
        let mut window: FrameWindow<u32> = FrameWindow::new(4);
        for raw in [7u32, 2, 9, 4] {
            *window.entry(Frame::new(raw)) = raw;
        }
        let frames: Vec<u32> = window.frames().iter().map(|f| f.as_u32()).collect();
        assert_eq!(frames, vec![2, 4, 7, 9]);
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
        /// Property: inserted values are retrievable until pruned, and
        /// pruning removes exactly the frames below the cutoff.
        #[test]
        fn prop_prune_is_exact(
            frames in proptest::collection::btree_set(0u32..500, 1..40),
            cutoff in 0u32..500,
        ) {
            let mut window: FrameWindow<u32> = FrameWindow::new(16);
            for &raw in &frames {
                *window.entry(Frame::new(raw)) = raw;
            }
            for &raw in &frames {
                prop_assert_eq!(window.get(Frame::new(raw)), Some(&raw));
            }

            window.prune_before(Frame::new(cutoff));
            for &raw in &frames {
                let expected = if raw < cutoff { None } else { Some(&raw) };
                let expected = expected.copied();
                prop_assert_eq!(window.get(Frame::new(raw)), expected.as_ref());
            }
        }
    }
}
