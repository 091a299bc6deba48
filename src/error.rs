//! Error types for the lockstep kernel.
//!
//! Nothing inside the kernel is fatal: parse failures cause the offending
//! command to be dropped, validation mismatches are recorded in sticky flags
//! for the host to inspect, and configuration errors fall back to defaults.
//! The error types here exist so that the failure *reason* is structured and
//! inspectable rather than a formatted string:
//!
//! - **Zero-allocation on hot paths**: errors store numeric context directly
//!   and format lazily in their `Display` implementations.
//! - **Programmatically inspectable**: enums with structured fields allow
//!   callers to match on specific failure cases.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

/// Represents why a wrapper chunk was rejected.
///
/// Using an enum instead of a string allows zero-allocation error
/// construction while still producing a descriptive message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ChunkRejectReason {
    /// The chunk index was not below the declared chunk count.
    ChunkIndexOutOfRange {
        /// The chunk number carried by the header.
        chunk_number: u32,
        /// The declared number of chunks.
        num_chunks: u32,
    },
    /// The chunk's byte span does not fit in the reassembly buffer.
    SpanOutOfRange {
        /// The chunk's offset into the reassembly buffer.
        data_offset: u32,
        /// The chunk's byte count.
        data_length: u32,
        /// The declared total reassembly length.
        total_data_length: u32,
    },
    /// The payload is shorter than the header plus the declared chunk bytes.
    PayloadTooShort {
        /// Bytes needed (header plus declared chunk bytes).
        needed: usize,
        /// Bytes actually present.
        actual: usize,
    },
}

impl Display for ChunkRejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChunkIndexOutOfRange {
                chunk_number,
                num_chunks,
            } => {
                write!(
                    f,
                    "chunk number {} not below chunk count {}",
                    chunk_number, num_chunks
                )
            },
            Self::SpanOutOfRange {
                data_offset,
                data_length,
                total_data_length,
            } => {
                write!(
                    f,
                    "chunk span {}+{} exceeds total data length {}",
                    data_offset, data_length, total_data_length
                )
            },
            Self::PayloadTooShort { needed, actual } => {
                write!(
                    f,
                    "chunk payload too short: needed {} bytes, got {}",
                    needed, actual
                )
            },
        }
    }
}

/// Parse failure for the inner-command wire format or a wrapper chunk.
///
/// Callers treat every variant the same way — the command is dropped and no
/// state is mutated — but the structured reason is logged at trace level and
/// available to tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum WireError {
    /// The buffer ended before a field could be fully read.
    Truncated {
        /// The field being read when the buffer ran out.
        field: &'static str,
        /// Bytes needed to read the field.
        needed: usize,
        /// Bytes remaining in the buffer.
        remaining: usize,
    },
    /// An unrecognized marker byte was encountered.
    UnknownMarker {
        /// The offending marker byte.
        marker: u8,
        /// Offset of the marker in the buffer.
        offset: usize,
    },
    /// The command type code is not part of the closed command set.
    UnknownCommandType {
        /// The offending code.
        code: u8,
    },
    /// The payload ended without a command type field.
    MissingCommandType,
    /// A wrapper chunk failed validation.
    BadChunk {
        /// The structured rejection reason.
        reason: ChunkRejectReason,
    },
}

impl Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated {
                field,
                needed,
                remaining,
            } => {
                write!(
                    f,
                    "truncated while reading {}: needed {} bytes, {} remaining",
                    field, needed, remaining
                )
            },
            Self::UnknownMarker { marker, offset } => {
                write!(
                    f,
                    "unknown field marker {:#04x} at offset {}",
                    marker, offset
                )
            },
            Self::UnknownCommandType { code } => {
                write!(f, "unknown command type code {}", code)
            },
            Self::MissingCommandType => write!(f, "no command type field present"),
            Self::BadChunk { reason } => write!(f, "invalid wrapper chunk: {}", reason),
        }
    }
}

impl Error for WireError {}

impl From<ChunkRejectReason> for WireError {
    fn from(reason: ChunkRejectReason) -> Self {
        Self::BadChunk { reason }
    }
}
