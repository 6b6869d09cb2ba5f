#![forbid(unsafe_code)]
//! Append-only byte sinks backing weir recordings.
//!
//! The recording engine flushes whole blocks in strictly increasing offset
//! order, so the backing store never needs to seek: a sink only appends and
//! flushes. The [`ByteSink`] trait captures that contract, with three
//! implementations:
//!
//! - **[`FileSink`]**: production sink. Buffered file writes
//!   (`BufWriter::with_capacity`), create-or-recreate-once open, optional
//!   fsync on flush.
//! - **[`MemorySink`]**: plain `Vec<u8>` for unit tests.
//! - **[`SharedMemorySink`]**: clone-able `Arc<Mutex<Vec<u8>>>` view so a
//!   test can inspect bytes while the engine still owns the sink.
//!
//! A sink reports `bytes_written` as the total it has accepted, which for an
//! append-only store equals the logical end of the file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use weir_error::Result;

/// Default `FileSink` stream buffer: 160 KiB.
pub const DEFAULT_STREAM_BUFFER_BYTES: usize = 0x28000;

/// Append-only byte sink.
///
/// Implementations accept bytes in call order and never reorder them.
/// `flush` makes previously appended bytes durable to whatever degree the
/// backing store supports.
pub trait ByteSink: Send {
    /// Append every byte of `buf` after all previously appended bytes.
    fn append_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Push buffered bytes down to the backing store.
    fn flush(&mut self) -> Result<()>;

    /// Total bytes accepted so far.
    fn bytes_written(&self) -> u64;

    /// Sink name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Creation and flush behavior for a [`FileSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkOptions {
    /// Capacity handed to `BufWriter::with_capacity`.
    pub stream_buffer_bytes: usize,
    /// Run `File::sync_all` after each successful flush.
    pub sync_on_flush: bool,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            stream_buffer_bytes: DEFAULT_STREAM_BUFFER_BYTES,
            sync_on_flush: true,
        }
    }
}

// ── File sink ───────────────────────────────────────────────────────────────

/// Buffered append-only file sink.
///
/// `create` truncates any existing file at `path`; if that first create
/// fails, the path is removed and created once more before giving up.
pub struct FileSink {
    writer: BufWriter<File>,
    path: PathBuf,
    written: u64,
    sync_on_flush: bool,
}

impl FileSink {
    /// Create (or truncate) the file at `path` with default options.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::create_with(path, SinkOptions::default())
    }

    /// Create (or truncate) the file at `path`.
    ///
    /// On a failed first create the path is removed and the create retried
    /// exactly once; the second failure is returned.
    pub fn create_with(path: impl AsRef<Path>, options: SinkOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = match Self::create_file(path) {
            Ok(file) => {
                tracing::info!(
                    target: "weir::sink",
                    path = %path.display(),
                    stream_buffer_bytes = options.stream_buffer_bytes,
                    "created recording file"
                );
                file
            }
            Err(first) => {
                tracing::warn!(
                    target: "weir::sink",
                    path = %path.display(),
                    error = %first,
                    "create failed, removing and retrying once"
                );
                let _ = std::fs::remove_file(path);
                let file = Self::create_file(path)?;
                tracing::info!(
                    target: "weir::sink",
                    path = %path.display(),
                    "re-created recording file"
                );
                file
            }
        };

        Ok(Self {
            writer: BufWriter::with_capacity(options.stream_buffer_bytes, file),
            path: path.to_owned(),
            written: 0,
            sync_on_flush: options.sync_on_flush,
        })
    }

    /// Path this sink writes to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create_file(path: &Path) -> std::io::Result<File> {
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
    }
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink")
            .field("path", &self.path)
            .field("written", &self.written)
            .field("sync_on_flush", &self.sync_on_flush)
            .finish_non_exhaustive()
    }
}

impl ByteSink for FileSink {
    fn append_all(&mut self, buf: &[u8]) -> Result<()> {
        self.writer.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        if self.sync_on_flush {
            self.writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

// ── In-memory sinks (for testing) ───────────────────────────────────────────

/// In-memory sink over a plain `Vec<u8>`.
#[derive(Debug, Default)]
pub struct MemorySink {
    bytes: Vec<u8>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl ByteSink for MemorySink {
    fn append_all(&mut self, buf: &[u8]) -> Result<()> {
        self.bytes.extend_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// In-memory sink whose buffer stays observable after the engine takes
/// ownership: clones share one buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedMemorySink {
    bytes: Arc<parking_lot::Mutex<Vec<u8>>>,
}

impl SharedMemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything appended so far.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.lock().is_empty()
    }
}

impl ByteSink for SharedMemorySink {
    fn append_all(&mut self, buf: &[u8]) -> Result<()> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn name(&self) -> &'static str {
        "shared-memory"
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
