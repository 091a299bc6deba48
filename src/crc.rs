//! Deterministic CRC utilities.
//!
//! This module provides the streaming CRC-32 accumulator used for per-frame
//! content hashes and game-logic state validation. Unlike
//! `std::collections::hash_map::DefaultHasher`, which seeds randomly for
//! security, the CRC here is a fixed algorithm: all peers of a lockstep game
//! must agree byte-for-byte on the folded value or desync detection would
//! report false positives.
//!
//! # Algorithm
//!
//! CRC-32 (IEEE 802.3), reflected, table-driven. Not cryptographically
//! secure, which is fine: the value only needs to make divergent game states
//! overwhelmingly likely to produce different results.
//!
//! # Usage
//!
//! ```
//! use bastion_lockstep::crc::{crc32, Crc32};
//!
//! // One-shot
//! let checksum = crc32(b"123456789");
//! assert_eq!(checksum, 0xCBF4_3926);
//!
//! // Streaming
//! let mut crc = Crc32::new();
//! crc.update(b"1234");
//! crc.update(b"56789");
//! assert_eq!(crc.finish(), checksum);
//! ```

use crate::Frame;

/// CRC-32 (IEEE) generator polynomial, reflected form.
const CRC32_POLYNOMIAL: u32 = 0xEDB8_8320;

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32_POLYNOMIAL
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = build_table();

/// A streaming CRC-32 accumulator.
///
/// Section writers and the frame-hash fold push bytes into an accumulator
/// incrementally; [`finish`](Self::finish) produces the final value.
/// Incremental updates are equivalent to a single update over the
/// concatenated bytes.
#[derive(Debug, Clone)]
pub struct Crc32 {
    state: u32,
}

impl Crc32 {
    /// Creates a new accumulator.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self { state: 0xFFFF_FFFF }
    }

    /// Folds `bytes` into the accumulator.
    #[inline]
    pub fn update(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            let index = ((self.state ^ u32::from(byte)) & 0xFF) as usize;
            self.state = CRC32_TABLE[index] ^ (self.state >> 8);
        }
    }

    /// Folds a little-endian `u32` into the accumulator.
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.update(&value.to_le_bytes());
    }

    /// Returns the final CRC value.
    #[inline]
    #[must_use]
    pub const fn finish(&self) -> u32 {
        !self.state
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the CRC-32 of a byte slice in one call.
#[inline]
#[must_use]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(bytes);
    crc.finish()
}

/// A game-logic section that can stream its deterministic state into a CRC.
///
/// The game-logic subsystem supplies one writer per section; the kernel
/// calls them synchronously inside
/// [`LockstepKernel::compute_game_logic_crc`](crate::LockstepKernel::compute_game_logic_crc)
/// and holds no references across updates.
///
/// Any `Fn(&mut Crc32)` closure is a section writer:
///
/// ```
/// use bastion_lockstep::crc::{Crc32, CrcSectionWriter};
///
/// let writer = |crc: &mut Crc32| crc.update(b"object state bytes");
/// let mut crc = Crc32::new();
/// writer.write_section(&mut crc);
/// ```
pub trait CrcSectionWriter {
    /// Streams this section's deterministic state into `crc`.
    fn write_section(&self, crc: &mut Crc32);
}

impl<F: Fn(&mut Crc32)> CrcSectionWriter for F {
    fn write_section(&self, crc: &mut Crc32) {
        self(crc);
    }
}

/// The four game-logic CRC section writers, called in fixed order.
///
/// The order — objects, partition manager, player list, ai — is part of the
/// determinism contract: every peer folds the sections identically. The
/// writers are `Send` so the manager can live behind the process-wide
/// handle.
pub struct GameLogicCrcWriters {
    /// Streams the object table.
    pub objects: Box<dyn CrcSectionWriter + Send>,
    /// Streams the partition manager.
    pub partition_manager: Box<dyn CrcSectionWriter + Send>,
    /// Streams the player list.
    pub player_list: Box<dyn CrcSectionWriter + Send>,
    /// Streams the ai state.
    pub ai: Box<dyn CrcSectionWriter + Send>,
}

impl GameLogicCrcWriters {
    /// Computes the game-logic CRC for `frame`.
    ///
    /// The accumulator is seeded with the frame number before the sections
    /// run, so identical static state still yields per-frame-distinct
    /// values.
    #[must_use]
    pub fn compute(&self, frame: Frame) -> u32 {
        let mut crc = Crc32::new();
        crc.update_u32(frame.as_u32());
        self.objects.write_section(&mut crc);
        self.partition_manager.write_section(&mut crc);
        self.player_list.write_section(&mut crc);
        self.ai.write_section(&mut crc);
        crc.finish()
    }
}

impl std::fmt::Debug for GameLogicCrcWriters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameLogicCrcWriters").finish_non_exhaustive()
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
        /// Property: same input always produces the same CRC.
        #[test]
        fn prop_crc_deterministic(input in any::<Vec<u8>>()) {
            prop_assert_eq!(crc32(&input), crc32(&input));
        }

        /// Property: chunked updates match a single update over the
        /// concatenation.
        #[test]
        fn prop_incremental_consistent(
            part_a in any::<Vec<u8>>(),
            part_b in any::<Vec<u8>>(),
        ) {
            let mut incremental = Crc32::new();
            incremental.update(&part_a);
            incremental.update(&part_b);

            let mut combined = part_a;
            combined.extend_from_slice(&part_b);

            prop_assert_eq!(incremental.finish(), crc32(&combined));
        }

        /// Property: flipping any single byte changes the CRC.
        #[test]
        fn prop_single_byte_flip_detected(
            mut data in proptest::collection::vec(any::<u8>(), 1..256),
            index in any::<prop::sample::Index>(),
        ) {
            let original = crc32(&data);
            let i = index.index(data.len());
            data[i] ^= 0xFF;
            prop_assert_ne!(original, crc32(&data));
        }

        /// Property: adjacent integers hash differently through the fold.
        #[test]
        fn prop_adjacent_u32_distinct(value in 0..u32::MAX) {
            let mut a = Crc32::new();
            a.update_u32(value);
            let mut b = Crc32::new();
            b.update_u32(value + 1);
            prop_assert_ne!(a.finish(), b.finish());
        }
    }
}
