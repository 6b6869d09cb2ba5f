#![forbid(unsafe_code)]
//! Block-buffered multichannel sequential recording engine.
//!
//! [`BlockFile`] persists per-channel sample runs, addressed by absolute
//! sample position, into a single append-only file of channel-interleaved
//! little-endian samples. Channels are written independently and drift apart
//! (acquisition hardware delivers them in bursts); a bounded sliding window
//! of fixed-size [`SampleBlock`]s absorbs that skew in memory so the file
//! itself is written strictly in order, with no seeks and no gaps.
//!
//! # Data flow
//!
//! ```text
//! write_channel(ch, start, run)
//!         │
//!         ▼
//!   BlockWindow ── evict finished blocks ──▶ ByteSink (append-only file)
//!   (blocks + per-channel cursors)
//! ```
//!
//! A block leaves memory only when every channel has written past it; a
//! channel that falls behind the retained window loses that run
//! ([`WeirError::StaleWrite`]) rather than corrupting flushed bytes. The
//! explicit [`BlockFile::close`] flushes everything retained and trims the
//! final block to its fill mark, so the file never ends in padding zeros.
//! Dropping an open `BlockFile` flushes nothing; it only logs a warning.
//!
//! # Concurrency
//!
//! One mutex guards the sink, the blocks, and the cursors together, since
//! eviction decisions need a consistent snapshot of all three. Flush I/O runs
//! under that same lock: writers stall while a block drains, which bounds
//! memory instead of queue depth. Share a `BlockFile` across producer threads
//! with `Arc`.
//!
//! # On-disk layout
//!
//! Raw interleaved samples, nothing else: row `r` holds one sample per
//! channel in channel order, `S::BYTES * channels` bytes per row. The sample
//! type is the `S` parameter ([`Sample`]: `i16`, `i32`, `f32`).

pub mod block;
pub mod window;

pub use block::SampleBlock;
pub use weir_error::{Result, WeirError};
pub use weir_sink::{
    ByteSink, DEFAULT_STREAM_BUFFER_BYTES, FileSink, MemorySink, SharedMemorySink, SinkOptions,
};
pub use weir_types::{ChannelId, Geometry, ParseError, Sample, SamplePos};
pub use window::{BlockWindow, RecorderStats};

use parking_lot::Mutex;
use std::path::Path;
use tracing::{info, warn};

struct Inner<S> {
    sink: Option<Box<dyn ByteSink>>,
    window: BlockWindow<S>,
}

/// Append-only multichannel recording backed by a sliding block window.
///
/// All state sits behind one lock; see the crate docs for the model. Methods
/// take `&self` so the file can be shared across threads directly or via
/// `Arc`.
pub struct BlockFile<S> {
    geometry: Geometry,
    inner: Mutex<Inner<S>>,
}

impl<S: Sample> BlockFile<S> {
    /// Recorder for `geometry`, not yet bound to a file.
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            inner: Mutex::new(Inner {
                sink: None,
                window: BlockWindow::new(geometry),
            }),
        }
    }

    /// Create the backing file at `path` with default [`SinkOptions`] and
    /// seed the window with the first block at position 0.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<()> {
        self.open_with(path, SinkOptions::default())
    }

    /// Create the backing file at `path` and seed the window.
    ///
    /// The create retries once over a removed path (see
    /// [`FileSink::create_with`]). Fails with [`WeirError::AlreadyOpen`] if a
    /// sink is installed; on create failure the recorder stays unbound and
    /// writes keep failing with [`WeirError::FileUnavailable`].
    pub fn open_with(&self, path: impl AsRef<Path>, options: SinkOptions) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.sink.is_some() {
            return Err(WeirError::AlreadyOpen);
        }
        let sink = FileSink::create_with(path.as_ref(), options)?;
        info!(
            target: "weir::file",
            path = %path.as_ref().display(),
            geometry = %self.geometry,
            "recording opened"
        );
        inner.window.seed();
        inner.sink = Some(Box::new(sink));
        Ok(())
    }

    /// Bind to an arbitrary sink instead of a file.
    pub fn open_sink(&self, sink: impl ByteSink + 'static) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.sink.is_some() {
            return Err(WeirError::AlreadyOpen);
        }
        info!(
            target: "weir::file",
            sink = sink.name(),
            geometry = %self.geometry,
            "recording opened"
        );
        inner.window.seed();
        inner.sink = Some(Box::new(sink));
        Ok(())
    }

    /// Buffer one channel's run of samples starting at absolute position
    /// `start`.
    ///
    /// Runs may cross block boundaries; blocks are allocated as needed and
    /// finished blocks are flushed to make room. An empty run is accepted and
    /// changes nothing.
    pub fn write_channel(&self, channel: ChannelId, start: SamplePos, data: &[S]) -> Result<()> {
        let mut inner = self.inner.lock();
        let Inner { sink, window } = &mut *inner;
        let Some(sink) = sink.as_mut() else {
            return Err(WeirError::FileUnavailable);
        };
        window.write_channel(sink.as_mut(), channel, start, data)
    }

    /// Flush every retained block in order, trim the final block to its fill
    /// mark, flush the sink, and release it.
    ///
    /// Idempotent: closing an unbound recorder is a no-op. On I/O failure the
    /// sink stays installed so a retry can flush the remaining blocks.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let Inner { sink, window } = &mut *inner;
        let Some(active) = sink.as_mut() else {
            return Ok(());
        };
        let tail_rows = window.flush_all(active.as_mut())?;
        active.flush()?;
        let stats = window.stats();
        info!(
            target: "weir::file",
            blocks_flushed = stats.blocks_flushed,
            bytes_flushed = stats.bytes_flushed,
            tail_rows,
            "recording closed"
        );
        *sink = None;
        Ok(())
    }

    /// Running totals for this recording.
    #[must_use]
    pub fn stats(&self) -> RecorderStats {
        self.inner.lock().window.stats()
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.lock().sink.is_some()
    }
}

impl<S> Drop for BlockFile<S> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.sink.is_some() {
            warn!(
                target: "weir::file",
                retained_blocks = inner.window.len(),
                samples_written = inner.window.stats().samples_written,
                "recording dropped without close; retained blocks were not flushed"
            );
        }
    }
}

impl<S> std::fmt::Debug for BlockFile<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockFile")
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_before_open_fails_fast() {
        let file: BlockFile<i16> = BlockFile::new(Geometry::new(2, 4).unwrap());
        let err = file
            .write_channel(ChannelId(0), SamplePos::ZERO, &[1])
            .expect_err("unbound");
        assert!(matches!(err, WeirError::FileUnavailable));
    }

    #[test]
    fn double_open_is_rejected() {
        let file: BlockFile<i16> = BlockFile::new(Geometry::new(2, 4).unwrap());
        file.open_sink(MemorySink::new()).unwrap();
        let err = file.open_sink(MemorySink::new()).expect_err("double");
        assert!(matches!(err, WeirError::AlreadyOpen));
    }

    #[test]
    fn close_is_idempotent_and_write_after_close_fails() {
        let view = SharedMemorySink::new();
        let file: BlockFile<i16> = BlockFile::new(Geometry::new(1, 4).unwrap());
        file.open_sink(view.clone()).unwrap();

        file.write_channel(ChannelId(0), SamplePos::ZERO, &[1, 2, 3])
            .unwrap();
        file.close().unwrap();
        assert!(!file.is_open());
        assert_eq!(view.len(), 6);

        file.close().unwrap();
        assert_eq!(view.len(), 6);

        let err = file
            .write_channel(ChannelId(0), SamplePos(3), &[4])
            .expect_err("closed");
        assert!(matches!(err, WeirError::FileUnavailable));
    }

    #[test]
    fn close_before_open_is_a_noop() {
        let file: BlockFile<i16> = BlockFile::new(Geometry::new(2, 4).unwrap());
        file.close().unwrap();
    }

    #[test]
    fn drop_without_close_flushes_nothing() {
        let view = SharedMemorySink::new();
        {
            let file: BlockFile<i16> = BlockFile::new(Geometry::new(1, 4).unwrap());
            file.open_sink(view.clone()).unwrap();
            file.write_channel(ChannelId(0), SamplePos::ZERO, &[1, 2, 3])
                .unwrap();
        }
        assert!(view.is_empty());
    }

    #[test]
    fn stats_visible_through_the_file() {
        let file: BlockFile<i16> = BlockFile::new(Geometry::new(2, 4).unwrap());
        file.open_sink(MemorySink::new()).unwrap();
        file.write_channel(ChannelId(0), SamplePos::ZERO, &[1, 2])
            .unwrap();

        let stats = file.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.samples_written, 2);
        assert_eq!(stats.blocks_allocated, 1);
    }
}
