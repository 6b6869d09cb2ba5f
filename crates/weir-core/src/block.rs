#![forbid(unsafe_code)]
//! Fixed-size in-memory sample blocks.
//!
//! A block buffers `samples_per_block` interleaved rows on their way to the
//! backing sink. Layout is row-major with channel stride: row `r`, channel
//! `c` lives at `r * channels + c`, so one block flushes as a single
//! contiguous append. Blocks flush whole, except the final block of a
//! recording which flushes only up to its fill high-water mark.

use weir_error::{Result, WeirError};
use weir_sink::ByteSink;
use weir_types::{Geometry, Sample, SamplePos, encode_samples_le};

/// One window slot: `samples_per_block` interleaved rows starting at an
/// absolute sample position.
#[derive(Debug, Clone)]
pub struct SampleBlock<S> {
    start: SamplePos,
    geometry: Geometry,
    samples: Vec<S>,
    fill_rows: usize,
}

impl<S> SampleBlock<S> {
    /// Absolute position of row 0.
    #[must_use]
    pub fn start(&self) -> SamplePos {
        self.start
    }

    /// One past the last row this block can hold.
    ///
    /// Window allocation refuses to create a block whose end would leave
    /// `u64`, so the addition cannot overflow.
    #[must_use]
    pub fn end(&self) -> SamplePos {
        SamplePos(self.start.0 + self.geometry.block_span())
    }

    /// High-water mark: largest relative row written plus one.
    #[must_use]
    pub fn fill_rows(&self) -> usize {
        self.fill_rows
    }

    /// Interleaved sample buffer (row-major, channel stride).
    #[must_use]
    pub fn samples(&self) -> &[S] {
        &self.samples
    }
}

impl<S: Sample> SampleBlock<S> {
    /// Create a zero-filled block whose first row is `start`.
    #[must_use]
    pub fn new(geometry: Geometry, start: SamplePos) -> Self {
        Self {
            start,
            geometry,
            samples: vec![S::default(); geometry.block_samples()],
            fill_rows: 0,
        }
    }

    /// Copy `values` into `channel` starting at relative row `rel_row`.
    ///
    /// Bounds are checked before any sample moves: a run that would step past
    /// the block's row capacity or name a channel outside the geometry fails
    /// without touching the buffer. An empty run is accepted at any row and
    /// leaves the buffer and fill mark untouched.
    pub fn write(&mut self, rel_row: usize, channel: usize, values: &[S]) -> Result<()> {
        let rows = self.geometry.samples_per_block();
        let channels = self.geometry.channels();
        if channel >= channels {
            return Err(WeirError::ChannelOutOfRange { channel, channels });
        }
        if values.is_empty() {
            return Ok(());
        }
        let end_row = match rel_row.checked_add(values.len()) {
            Some(end_row) if end_row <= rows => end_row,
            _ => {
                return Err(WeirError::BlockOverflow {
                    rel_row,
                    rows: values.len(),
                    samples_per_block: rows,
                });
            }
        };

        let first = self.geometry.interleaved_index(rel_row, channel);
        for (cell, value) in self.samples[first..]
            .iter_mut()
            .step_by(channels)
            .zip(values)
        {
            *cell = *value;
        }
        self.fill_rows = self.fill_rows.max(end_row);
        Ok(())
    }

    /// Append the whole block to `sink` as little-endian bytes.
    pub fn flush(&self, sink: &mut dyn ByteSink) -> Result<()> {
        self.flush_rows(sink, self.geometry.samples_per_block())
    }

    /// Append only the first `rows` interleaved rows to `sink`.
    ///
    /// Shutdown path for the final block: rows past the fill mark never
    /// reach the file.
    pub fn partial_flush(&self, sink: &mut dyn ByteSink, rows: usize) -> Result<()> {
        if rows > self.geometry.samples_per_block() {
            return Err(WeirError::BlockOverflow {
                rel_row: 0,
                rows,
                samples_per_block: self.geometry.samples_per_block(),
            });
        }
        self.flush_rows(sink, rows)
    }

    fn flush_rows(&self, sink: &mut dyn ByteSink, rows: usize) -> Result<()> {
        if rows == 0 {
            return Ok(());
        }
        let count = rows * self.geometry.channels();
        let mut bytes = Vec::with_capacity(count * S::BYTES);
        encode_samples_le(&self.samples[..count], &mut bytes);
        sink.append_all(&bytes)
    }
}
