//! Wrapper fragment reassembly.
//!
//! Large commands travel as wrapper envelopes split into chunks (see
//! [`crate::wire::wrapper`]). [`WrapperAssembler`] collects the chunks per
//! wrapped-command id, tracks received indices in a bitmap, and hands back
//! the reassembled inner-command bytes once every chunk has arrived.
//!
//! Malformed chunks are silently dropped without touching an existing
//! assembly, duplicates keep the first write, and assembly metadata is
//! never replaced once allocated. Zero-chunk no-op wrappers never create or
//! disturb an assembly.

use std::collections::BTreeMap;

use tracing::trace;

use crate::wire::wrapper::WrapperChunk;

#[derive(Debug)]
struct Assembly {
    expected_chunks: u32,
    total_length: u32,
    received: Vec<bool>,
    received_count: u32,
    buffer: Vec<u8>,
}

impl Assembly {
    fn from_first_chunk(chunk: &WrapperChunk) -> Self {
        Self {
            expected_chunks: chunk.num_chunks,
            total_length: chunk.total_data_length,
            received: vec![false; chunk.num_chunks as usize],
            received_count: 0,
            buffer: vec![0; chunk.total_data_length as usize],
        }
    }
}

/// Fragment reassembly table, keyed by wrapped-command id.
#[derive(Debug, Default)]
pub struct WrapperAssembler {
    assemblies: BTreeMap<u16, Assembly>,
}

impl WrapperAssembler {
    /// Creates an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk into the table.
    ///
    /// Returns the complete inner-command bytes when this chunk finishes
    /// its assembly; the assembly entry is removed. Chunks that fail
    /// validation against the assembly's recorded metadata are dropped
    /// without disturbing it.
    pub fn accept(&mut self, chunk: &WrapperChunk) -> Option<Vec<u8>> {
        if chunk.is_noop() {
            trace!("zero-chunk wrapper marker, no assembly");
            return None;
        }
        if chunk.validate().is_err() {
            trace!(id = chunk.wrapped_command_id, "dropping malformed chunk");
            return None;
        }

        let assembly = self
            .assemblies
            .entry(chunk.wrapped_command_id)
            .or_insert_with(|| Assembly::from_first_chunk(chunk));

        // Validate against the assembly's own metadata: a later chunk never
        // replaces what the first chunk declared.
        let index = chunk.chunk_number as usize;
        if chunk.chunk_number >= assembly.expected_chunks {
            trace!(
                id = chunk.wrapped_command_id,
                chunk = chunk.chunk_number,
                "chunk index outside assembly"
            );
            return None;
        }
        if assembly.received[index] {
            trace!(
                id = chunk.wrapped_command_id,
                chunk = chunk.chunk_number,
                "duplicate chunk, first write wins"
            );
            return None;
        }
        let start = chunk.data_offset as usize;
        let end = start + chunk.data.len();
        if end > assembly.total_length as usize {
            trace!(
                id = chunk.wrapped_command_id,
                chunk = chunk.chunk_number,
                "chunk span overflows assembly buffer"
            );
            return None;
        }

        assembly.buffer[start..end].copy_from_slice(&chunk.data);
        assembly.received[index] = true;
        assembly.received_count += 1;

        if assembly.received_count == assembly.expected_chunks {
            let done = self.assemblies.remove(&chunk.wrapped_command_id)?;
            trace!(
                id = chunk.wrapped_command_id,
                len = done.total_length,
                "wrapper assembly complete"
            );
            return Some(done.buffer);
        }
        None
    }

    /// Number of assemblies still in flight.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.assemblies.len()
    }

    /// Chunk indices received so far for an in-flight assembly.
    #[must_use]
    pub fn received_chunks(&self, wrapped_command_id: u16) -> Option<u32> {
        self.assemblies
            .get(&wrapped_command_id)
            .map(|a| a.received_count)
    }

    /// Drops every in-flight assembly.
    pub fn clear(&mut self) {
        self.assemblies.clear();
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::wire::wrapper::split_into_chunks;

    #[test]
    fn single_chunk_completes_immediately() {
        let mut assembler = WrapperAssembler::new();
        let inner = vec![1u8, 2, 3, 4];
        let chunks = split_into_chunks(7, &inner, 64);
        assert_eq!(chunks.len(), 1);
        assert_eq!(assembler.accept(&chunks[0]), Some(inner));
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn out_of_order_chunks_reassemble() {
        let mut assembler = WrapperAssembler::new();
        let inner: Vec<u8> = (0..=127).collect();
        let chunks = split_into_chunks(0x1234, &inner, 64);
        assert_eq!(chunks.len(), 2);

        assert_eq!(assembler.accept(&chunks[1]), None);
        assert_eq!(assembler.pending(), 1);
        assert_eq!(assembler.received_chunks(0x1234), Some(1));
        assert_eq!(assembler.accept(&chunks[0]), Some(inner));
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn duplicate_chunk_keeps_first_write() {
        let mut assembler = WrapperAssembler::new();
        let inner: Vec<u8> = (0..=127).collect();
        let chunks = split_into_chunks(9, &inner, 64);

        assert_eq!(assembler.accept(&chunks[0]), None);

        // Same index, different bytes: rejected without disturbing the first.
        let mut forged = chunks[0].clone();
        forged.data = vec![0xFF; 64];
        assert_eq!(assembler.accept(&forged), None);

        let result = assembler.accept(&chunks[1]).unwrap();
        assert_eq!(result, inner, "first write survived the duplicate");
    }

    #[test]
    fn conflicting_length_duplicate_rejected() {
        let mut assembler = WrapperAssembler::new();
        let inner: Vec<u8> = (0..=127).collect();
        let chunks = split_into_chunks(9, &inner, 64);
        assert_eq!(assembler.accept(&chunks[0]), None);

        let mut forged = chunks[0].clone();
        forged.data = vec![0xFF; 10];
        forged.data_length = 10;
        assert_eq!(assembler.accept(&forged), None);
        assert_eq!(assembler.received_chunks(9), Some(1));
    }

    #[test]
    fn metadata_never_replaced() {
        let mut assembler = WrapperAssembler::new();
        let inner: Vec<u8> = (0..=127).collect();
        let chunks = split_into_chunks(5, &inner, 64);
        assert_eq!(assembler.accept(&chunks[0]), None);

        // A second chunk claiming a different envelope shape is judged
        // against the original metadata.
        let mut liar = chunks[1].clone();
        liar.num_chunks = 4;
        liar.chunk_number = 3;
        assert_eq!(assembler.accept(&liar), None);
        assert_eq!(assembler.received_chunks(5), Some(1));

        assert_eq!(assembler.accept(&chunks[1]), Some(inner));
    }

    #[test]
    fn noop_never_creates_or_disturbs() {
        let mut assembler = WrapperAssembler::new();
        let noop = WrapperChunk::default();
        assert_eq!(assembler.accept(&noop), None);
        assert_eq!(assembler.pending(), 0);

        let inner: Vec<u8> = (0..=127).collect();
        let chunks = split_into_chunks(3, &inner, 64);
        assert_eq!(assembler.accept(&chunks[0]), None);

        // A no-op for the same id leaves the partial assembly alone.
        let same_id_noop = WrapperChunk {
            wrapped_command_id: 3,
            ..WrapperChunk::default()
        };
        assert_eq!(assembler.accept(&same_id_noop), None);
        assert_eq!(assembler.received_chunks(3), Some(1));

        assert_eq!(assembler.accept(&chunks[1]), Some(inner));
    }

    #[test]
    fn malformed_chunk_dropped_without_touching_assembly() {
        let mut assembler = WrapperAssembler::new();
        let inner: Vec<u8> = (0..=127).collect();
        let chunks = split_into_chunks(8, &inner, 64);
        assert_eq!(assembler.accept(&chunks[0]), None);

        let mut overflow = chunks[1].clone();
        overflow.data_offset = 100; // 100 + 64 > 128
        assert_eq!(assembler.accept(&overflow), None);
        assert_eq!(assembler.received_chunks(8), Some(1));
    }

    #[test]
    fn interleaved_assemblies_stay_separate() {
        let mut assembler = WrapperAssembler::new();
        let inner_a: Vec<u8> = vec![0xAA; 100];
        let inner_b: Vec<u8> = vec![0xBB; 100];
        let chunks_a = split_into_chunks(1, &inner_a, 64);
        let chunks_b = split_into_chunks(2, &inner_b, 64);

        assert_eq!(assembler.accept(&chunks_a[0]), None);
        assert_eq!(assembler.accept(&chunks_b[0]), None);
        assert_eq!(assembler.pending(), 2);
        assert_eq!(assembler.accept(&chunks_b[1]), Some(inner_b));
        assert_eq!(assembler.accept(&chunks_a[1]), Some(inner_a));
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn clear_drops_in_flight_assemblies() {
        let mut assembler = WrapperAssembler::new();
        let inner: Vec<u8> = (0..=127).collect();
        let chunks = split_into_chunks(1, &inner, 64);
        assembler.accept(&chunks[0]);
        assembler.clear();
        assert_eq!(assembler.pending(), 0);
    }
}

// =============================================================================
// Property-Based Tests
// =============================================================================
