#![forbid(unsafe_code)]
//! Error types for weir.
//!
//! # Error Taxonomy
//!
//! weir uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Construction | `ParseError` | `weir-types` | Invalid recording geometry or byte-layout violations |
//! | Runtime | `WeirError` | `weir-error` (this crate) | Errors surfaced by the write path, open, and close |
//!
//! `weir-error` is intentionally independent of `weir-types` so either can be
//! depended on freely without cycles. Geometry validation stays at
//! construction boundaries and never reaches the write path; no conversion
//! between the layers is needed.
//!
//! ## Write-path policy
//!
//! The write path never panics and never unwinds: every failure is a returned
//! [`WeirError`]. Three situations matter operationally:
//!
//! | Situation | Variant | Recovery |
//! |-----------|---------|----------|
//! | No open backing file | `FileUnavailable` | Open failed earlier, or close already ran; the write was rejected before buffering |
//! | Run starts before the retained window | `StaleWrite` | That run is lost; recorder state is unchanged and later runs proceed |
//! | Backing append or flush failed | `Io` | Unflushed blocks stay retained; retry the flush or abandon the file |
//!
//! The remaining variants surface caller bugs (`ChannelOutOfRange`,
//! `BlockOverflow`, `AlreadyOpen`) or position arithmetic that left `u64`
//! range (`PositionOverflow`). All payloads are owned values so the type is
//! `Send + 'static`.

use thiserror::Error;

/// Unified error type for all weir operations.
///
/// Returned by the recording API and CLI surfaces. Construction-time errors
/// (`ParseError` from `weir-types`) stay at their own boundary and do not
/// convert into this type.
#[derive(Debug, Error)]
pub enum WeirError {
    /// Operating system I/O error (wraps `std::io::Error`).
    ///
    /// An append or flush on the backing file failed. Nothing buffered was
    /// dropped: unflushed blocks stay retained, and the caller decides
    /// whether to retry the flush or abandon the file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No backing file is open.
    ///
    /// Returned when a write runs before `open` succeeded or after `close`.
    /// Nothing was buffered or written. Closing an unbound recorder is a
    /// no-op, not an error.
    #[error("no backing file is open")]
    FileUnavailable,

    /// A backing file is already open for this recording.
    #[error("a backing file is already open")]
    AlreadyOpen,

    /// The write targets a block that was already flushed and evicted.
    ///
    /// The run started before the retained window; accepting it would require
    /// rewriting flushed bytes. The write fails before any sample is copied,
    /// so recorder state is unchanged.
    #[error(
        "stale write on channel {channel}: start {start_pos} precedes the retained window at {window_start}"
    )]
    StaleWrite {
        channel: usize,
        start_pos: u64,
        window_start: u64,
    },

    /// Channel index at or beyond the configured channel count.
    #[error("channel {channel} out of range: recording has {channels} channels")]
    ChannelOutOfRange { channel: usize, channels: usize },

    /// A block-level copy would run past the block's row capacity.
    ///
    /// Indicates a bug in run splitting, surfaced as an error instead of a
    /// silent out-of-bounds write.
    #[error("write of {rows} rows at block row {rel_row} exceeds block capacity {samples_per_block}")]
    BlockOverflow {
        rel_row: usize,
        rows: usize,
        samples_per_block: usize,
    },

    /// Sample position arithmetic left `u64` range.
    #[error("sample position overflow: {0}")]
    PositionOverflow(String),
}

/// Result alias using `WeirError`.
pub type Result<T> = std::result::Result<T, WeirError>;
