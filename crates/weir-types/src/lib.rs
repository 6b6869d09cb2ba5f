#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Absolute sample position within a single channel's stream (0-based).
///
/// This is a unit-carrying wrapper to prevent mixing sample positions with
/// byte offsets or row counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SamplePos(pub u64);

impl SamplePos {
    pub const ZERO: Self = Self(0);

    /// Advance by a sample count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, samples: u64) -> Option<Self> {
        self.0.checked_add(samples).map(Self)
    }

    /// Step back by a sample count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, samples: u64) -> Option<Self> {
        self.0.checked_sub(samples).map(Self)
    }
}

/// Channel index within a recording (0-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u16);

impl ChannelId {
    /// Stride index for this channel within an interleaved row.
    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Validated recording geometry: channel count and rows per block.
///
/// Constructed once up front. Both dimensions are nonzero and the derived
/// per-block sample count is checked against `usize` here, so the write path
/// can use plain indexing without re-validating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    channels: u16,
    samples_per_block: u32,
}

impl Geometry {
    /// Create a `Geometry` if both dimensions are at least 1 and
    /// `channels * samples_per_block` fits `usize`.
    pub fn new(channels: u16, samples_per_block: u32) -> Result<Self, ParseError> {
        if channels == 0 {
            return Err(ParseError::InvalidField {
                field: "channels",
                reason: "must be at least 1",
            });
        }
        if samples_per_block == 0 {
            return Err(ParseError::InvalidField {
                field: "samples_per_block",
                reason: "must be at least 1",
            });
        }
        let geometry = Self {
            channels,
            samples_per_block,
        };
        if geometry.checked_block_samples().is_none() {
            return Err(ParseError::IntegerConversion {
                field: "block_samples",
            });
        }
        Ok(geometry)
    }

    /// Number of interleaved channels per row.
    #[must_use]
    pub fn channels(self) -> usize {
        usize::from(self.channels)
    }

    /// Rows (samples per channel) held by one block.
    #[must_use]
    pub fn samples_per_block(self) -> usize {
        // Checked against usize in `new`.
        self.samples_per_block as usize
    }

    /// Rows per block as a position delta.
    #[must_use]
    pub fn block_span(self) -> u64 {
        u64::from(self.samples_per_block)
    }

    /// Total samples held by one block (`channels * samples_per_block`).
    #[must_use]
    pub fn block_samples(self) -> usize {
        self.channels() * self.samples_per_block()
    }

    /// Buffer index of `(rel_row, channel)` in a row-major interleaved block.
    ///
    /// Callers guarantee `rel_row < samples_per_block` and
    /// `channel < channels`; within those bounds the index cannot overflow.
    #[must_use]
    pub fn interleaved_index(self, rel_row: usize, channel: usize) -> usize {
        rel_row * self.channels() + channel
    }

    /// Bytes occupied by one interleaved row of `sample_bytes`-wide samples.
    #[must_use]
    pub fn row_bytes(self, sample_bytes: usize) -> Option<usize> {
        self.channels().checked_mul(sample_bytes)
    }

    fn checked_block_samples(self) -> Option<usize> {
        let rows = usize::try_from(self.samples_per_block).ok()?;
        usize::from(self.channels).checked_mul(rows)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
    #[error("trailing bytes: {len} is not a multiple of the {sample_bytes}-byte sample width")]
    TrailingBytes { len: usize, sample_bytes: usize },
}

/// Fixed-width little-endian sample codec.
///
/// The on-disk layout is raw interleaved samples with no header, so the
/// element width and byte order are the entire format. Implemented for the
/// sample types acquisition chains commonly produce.
pub trait Sample: Copy + Default + Send + Sync + 'static {
    /// Encoded width in bytes.
    const BYTES: usize;

    /// Encode into exactly `Self::BYTES` bytes at `out`.
    fn put_le(self, out: &mut [u8]);

    /// Decode from exactly `Self::BYTES` bytes at `src`.
    fn get_le(src: &[u8]) -> Self;
}

impl Sample for i16 {
    const BYTES: usize = 2;

    fn put_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn get_le(src: &[u8]) -> Self {
        Self::from_le_bytes([src[0], src[1]])
    }
}

impl Sample for i32 {
    const BYTES: usize = 4;

    fn put_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn get_le(src: &[u8]) -> Self {
        Self::from_le_bytes([src[0], src[1], src[2], src[3]])
    }
}

impl Sample for f32 {
    const BYTES: usize = 4;

    fn put_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn get_le(src: &[u8]) -> Self {
        Self::from_le_bytes([src[0], src[1], src[2], src[3]])
    }
}

/// Append `samples` to `out` as little-endian bytes.
pub fn encode_samples_le<S: Sample>(samples: &[S], out: &mut Vec<u8>) {
    let start = out.len();
    out.resize(start + samples.len() * S::BYTES, 0);
    for (sample, chunk) in samples.iter().zip(out[start..].chunks_exact_mut(S::BYTES)) {
        sample.put_le(chunk);
    }
}

/// Decode a whole buffer of little-endian samples.
pub fn decode_samples_le<S: Sample>(bytes: &[u8]) -> Result<Vec<S>, ParseError> {
    if !bytes.len().is_multiple_of(S::BYTES) {
        return Err(ParseError::TrailingBytes {
            len: bytes.len(),
            sample_bytes: S::BYTES,
        });
    }
    Ok(bytes.chunks_exact(S::BYTES).map(S::get_le).collect())
}

impl fmt::Display for SamplePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} channels x {} samples/block",
            self.channels, self.samples_per_block
        )
    }
}
