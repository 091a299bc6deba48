//! Wrapper chunk payload codec.
//!
//! Commands too large for a single datagram travel as a "wrapper" envelope:
//! the encoded inner command is split into chunks, each carried in a
//! wrapper command whose payload is a 22-byte little-endian header followed
//! by the chunk bytes. The assembler reconstructs the inner command once
//! every chunk has arrived.

use serde::{Deserialize, Serialize};

use crate::error::{ChunkRejectReason, WireError};

/// Size of the wrapper chunk header in bytes.
pub const WRAPPER_HEADER_LEN: usize = 22;

/// One fragment of a wrapped command envelope.
///
/// The special "zero-chunks" shape — every header field zero and no payload
/// bytes — is a no-op marker, not an assembly entry; see
/// [`is_noop`](Self::is_noop).
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WrapperChunk {
    /// Id of the wrapped command this chunk belongs to.
    pub wrapped_command_id: u16,
    /// Index of this chunk, `0..num_chunks`.
    pub chunk_number: u32,
    /// Total number of chunks in the envelope.
    pub num_chunks: u32,
    /// Total length of the reassembled inner command.
    pub total_data_length: u32,
    /// Number of bytes carried by this chunk.
    pub data_length: u32,
    /// Offset of this chunk in the reassembly buffer.
    pub data_offset: u32,
    /// The chunk bytes.
    pub data: Vec<u8>,
}

impl WrapperChunk {
    /// Returns `true` for the zero-chunks no-op shape.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.num_chunks == 0
            && self.chunk_number == 0
            && self.total_data_length == 0
            && self.data_length == 0
            && self.data_offset == 0
            && self.data.is_empty()
    }

    /// Validates the chunk's internal consistency.
    ///
    /// Checks `chunk_number < num_chunks`, that the byte span fits in the
    /// declared total, and that the carried bytes match `data_length`.
    /// No-op chunks are valid by definition.
    pub fn validate(&self) -> Result<(), WireError> {
        if self.is_noop() {
            return Ok(());
        }
        if self.chunk_number >= self.num_chunks {
            return Err(ChunkRejectReason::ChunkIndexOutOfRange {
                chunk_number: self.chunk_number,
                num_chunks: self.num_chunks,
            }
            .into());
        }
        let end = u64::from(self.data_offset) + u64::from(self.data_length);
        if end > u64::from(self.total_data_length) {
            return Err(ChunkRejectReason::SpanOutOfRange {
                data_offset: self.data_offset,
                data_length: self.data_length,
                total_data_length: self.total_data_length,
            }
            .into());
        }
        if self.data.len() != self.data_length as usize {
            return Err(ChunkRejectReason::PayloadTooShort {
                needed: WRAPPER_HEADER_LEN + self.data_length as usize,
                actual: WRAPPER_HEADER_LEN + self.data.len(),
            }
            .into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for WrapperChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            wrapped_command_id,
            chunk_number,
            num_chunks,
            total_data_length,
            data_length,
            data_offset,
            data,
        } = self;

        f.debug_struct("WrapperChunk")
            .field("wrapped_command_id", wrapped_command_id)
            .field("chunk_number", chunk_number)
            .field("num_chunks", num_chunks)
            .field("total_data_length", total_data_length)
            .field("data_length", data_length)
            .field("data_offset", data_offset)
            .field("data", &BytesDebug(data))
            .finish()
    }
}

struct BytesDebug<'a>(&'a [u8]);

impl std::fmt::Debug for BytesDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Parses a wrapper chunk payload (header plus chunk bytes).
///
/// Validation per the envelope contract: `chunk_number < num_chunks`,
/// `data_offset + data_length <= total_data_length`, and
/// `22 + data_length <= payload.len()`. The zero-chunks no-op shape parses
/// successfully with empty data.
pub fn parse_chunk(payload: &[u8]) -> Result<WrapperChunk, WireError> {
    if payload.len() < WRAPPER_HEADER_LEN {
        return Err(WireError::Truncated {
            field: "wrapperHeader",
            needed: WRAPPER_HEADER_LEN,
            remaining: payload.len(),
        });
    }
    let wrapped_command_id = u16::from_le_bytes([payload[0], payload[1]]);
    let read_u32 = |at: usize| {
        u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
    };
    let chunk_number = read_u32(2);
    let num_chunks = read_u32(6);
    let total_data_length = read_u32(10);
    let data_length = read_u32(14);
    let data_offset = read_u32(18);

    let needed = WRAPPER_HEADER_LEN + data_length as usize;
    if payload.len() < needed {
        return Err(ChunkRejectReason::PayloadTooShort {
            needed,
            actual: payload.len(),
        }
        .into());
    }

    let chunk = WrapperChunk {
        wrapped_command_id,
        chunk_number,
        num_chunks,
        total_data_length,
        data_length,
        data_offset,
        data: payload[WRAPPER_HEADER_LEN..needed].to_vec(),
    };
    chunk.validate()?;
    Ok(chunk)
}

/// Serializes a wrapper chunk payload (header plus chunk bytes).
pub fn write_chunk(chunk: &WrapperChunk, out: &mut Vec<u8>) {
    out.extend_from_slice(&chunk.wrapped_command_id.to_le_bytes());
    out.extend_from_slice(&chunk.chunk_number.to_le_bytes());
    out.extend_from_slice(&chunk.num_chunks.to_le_bytes());
    out.extend_from_slice(&chunk.total_data_length.to_le_bytes());
    out.extend_from_slice(&chunk.data_length.to_le_bytes());
    out.extend_from_slice(&chunk.data_offset.to_le_bytes());
    out.extend_from_slice(&chunk.data);
}

/// Splits an encoded inner command into wrapper chunks of at most
/// `chunk_size` bytes each.
///
/// Returns chunks in offset order; `chunk_size` of zero is treated as one.
#[must_use]
pub fn split_into_chunks(
    wrapped_command_id: u16,
    inner: &[u8],
    chunk_size: usize,
) -> Vec<WrapperChunk> {
    let chunk_size = chunk_size.max(1);
    let num_chunks = inner.len().div_ceil(chunk_size).max(1) as u32;
    let mut chunks = Vec::with_capacity(num_chunks as usize);
    for (index, piece) in inner.chunks(chunk_size).enumerate() {
        chunks.push(WrapperChunk {
            wrapped_command_id,
            chunk_number: index as u32,
            num_chunks,
            total_data_length: inner.len() as u32,
            data_length: piece.len() as u32,
            data_offset: (index * chunk_size) as u32,
            data: piece.to_vec(),
        });
    }
    if chunks.is_empty() {
        // Zero-length inner command still needs one (empty) chunk so the
        // assembler can complete it.
        chunks.push(WrapperChunk {
            wrapped_command_id,
            chunk_number: 0,
            num_chunks: 1,
            total_data_length: 0,
            data_length: 0,
            data_offset: 0,
            data: Vec::new(),
        });
    }
    chunks
}
