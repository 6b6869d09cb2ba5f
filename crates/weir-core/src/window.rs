#![forbid(unsafe_code)]
//! Sliding block window: allocation, eviction, and channel cursors.
//!
//! The window owns an ordered run of blocks with contiguous, strictly
//! increasing start positions. Growth happens at the tail when a write lands
//! past current coverage; shrinkage happens at the head, and only up to the
//! slowest channel: `cursors[c]` is the window-relative index of the last
//! retained block channel `c` wrote into, and a block may be flushed and
//! dropped only once every cursor has moved past it. A channel with no
//! cursor (never written, or its blocks already drained) holds the window
//! at block 0 until its next run arrives.
//!
//! Because blocks leave the window front-first, exactly once, and only
//! after the sink accepts their bytes, the bytes a sink receives are the
//! file: strictly increasing offsets, no gaps, no seeks.

use std::collections::VecDeque;

use tracing::{debug, trace, warn};
use weir_error::{Result, WeirError};
use weir_sink::ByteSink;
use weir_types::{ChannelId, Geometry, Sample, SamplePos};

use crate::block::SampleBlock;

/// Initial block-queue capacity, sized for a typical skew of a few dozen
/// blocks between fast and slow channels.
const WINDOW_INIT_BLOCKS: usize = 128;

/// Running totals for one recording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    /// Successful non-empty `write_channel` calls.
    pub writes: u64,
    /// Samples accepted across all channels.
    pub samples_written: u64,
    /// Blocks created, including the block seeded at open.
    pub blocks_allocated: u64,
    /// Blocks flushed by eviction or close (the trimmed tail counts too).
    pub blocks_flushed: u64,
    /// Bytes handed to the sink.
    pub bytes_flushed: u64,
    /// Writes rejected because their target block was already flushed.
    pub stale_writes: u64,
}

/// Bounded sliding window of [`SampleBlock`]s plus per-channel cursors.
pub struct BlockWindow<S> {
    geometry: Geometry,
    blocks: VecDeque<SampleBlock<S>>,
    cursors: Vec<Option<usize>>,
    stats: RecorderStats,
}

impl<S> BlockWindow<S> {
    /// Blocks currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Start position of the oldest retained block.
    #[must_use]
    pub fn window_start(&self) -> Option<SamplePos> {
        self.blocks.front().map(SampleBlock::start)
    }

    /// Window-relative index of the last retained block `channel` wrote, if
    /// any.
    #[must_use]
    pub fn cursor(&self, channel: ChannelId) -> Option<usize> {
        self.cursors.get(channel.index()).copied().flatten()
    }

    /// Snapshot of the running totals.
    #[must_use]
    pub fn stats(&self) -> RecorderStats {
        self.stats
    }
}

impl<S: Sample> BlockWindow<S> {
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            blocks: VecDeque::with_capacity(WINDOW_INIT_BLOCKS),
            cursors: vec![None; geometry.channels()],
            stats: RecorderStats::default(),
        }
    }

    /// Place the first block at position 0. No-op if blocks already exist.
    pub fn seed(&mut self) {
        if self.blocks.is_empty() {
            self.blocks
                .push_back(SampleBlock::new(self.geometry, SamplePos::ZERO));
            self.stats.blocks_allocated += 1;
        }
    }

    /// Buffer one channel's run starting at `start`.
    ///
    /// Extends coverage (evicting finished blocks first) when the run ends
    /// past the tail, locates the owning block by scanning backward from the
    /// newest, then copies with boundary splitting. A run that starts before
    /// the retained window fails with `StaleWrite` before anything is
    /// copied.
    pub fn write_channel(
        &mut self,
        sink: &mut dyn ByteSink,
        channel: ChannelId,
        start: SamplePos,
        data: &[S],
    ) -> Result<()> {
        let ch = channel.index();
        let channels = self.geometry.channels();
        if ch >= channels {
            return Err(WeirError::ChannelOutOfRange { channel: ch, channels });
        }
        if data.is_empty() {
            trace!(
                target: "weir::window",
                channel = ch,
                start = start.0,
                "empty run accepted"
            );
            return Ok(());
        }
        let run_len = data.len() as u64;
        let Some(end) = start.checked_add(run_len) else {
            return Err(WeirError::PositionOverflow(format!(
                "run of {} samples at {start} leaves the position space",
                data.len()
            )));
        };

        self.ensure_coverage(sink, end)?;

        // Recent blocks are the likely target: scan backward from the tail.
        let Some(found) = self.blocks.iter().rposition(|block| block.start() <= start) else {
            let window_start = self.blocks.front().map_or(0, |block| block.start().0);
            self.stats.stale_writes += 1;
            warn!(
                target: "weir::window",
                channel = ch,
                start = start.0,
                samples = data.len(),
                window_start,
                cursors = ?self.cursors,
                "run targets an already-flushed block"
            );
            return Err(WeirError::StaleWrite {
                channel: ch,
                start_pos: start.0,
                window_start,
            });
        };

        // Copy, splitting on block boundaries. Coverage is already ensured,
        // so every block the run touches exists.
        let rows = self.geometry.samples_per_block();
        let mut index = found;
        let mut rel_row = (start.0 - self.blocks[index].start().0) as usize;
        let mut remaining = data;
        loop {
            let take = remaining.len().min(rows - rel_row);
            let (run, rest) = remaining.split_at(take);
            self.blocks[index].write(rel_row, ch, run)?;
            remaining = rest;
            if remaining.is_empty() {
                break;
            }
            index += 1;
            rel_row = 0;
        }

        self.cursors[ch] = Some(index);
        self.stats.writes += 1;
        self.stats.samples_written += run_len;

        trace!(
            target: "weir::window",
            channel = ch,
            start = start.0,
            samples = data.len(),
            first_block = found,
            last_block = index,
            "run buffered"
        );
        Ok(())
    }

    /// Flush every retained block in offset order and empty the window.
    ///
    /// The final block is trimmed to its fill mark so the file ends without
    /// padding. Returns the trimmed block's row count. A block is removed
    /// only after the sink accepts its bytes: a failed drain keeps the
    /// unflushed suffix retained, and a retry resumes where this call
    /// stopped.
    pub fn flush_all(&mut self, sink: &mut dyn ByteSink) -> Result<usize> {
        let mut tail_rows = 0;
        while let Some(block) = self.blocks.front() {
            let rows = if self.blocks.len() == 1 {
                tail_rows = block.fill_rows();
                tail_rows
            } else {
                self.geometry.samples_per_block()
            };
            Self::append_block(self.geometry, &mut self.stats, sink, block, rows)?;
            self.blocks.pop_front();
            self.shift_cursors_after_pop();
        }
        Ok(tail_rows)
    }

    /// Make `[window_start, end)` coverable by the retained blocks.
    ///
    /// Called only when the tail cannot hold an incoming run. Evicts the
    /// longest finished prefix first, then allocates zero-filled blocks at
    /// successive positions until the tail covers `end`.
    fn ensure_coverage(&mut self, sink: &mut dyn ByteSink, end: SamplePos) -> Result<()> {
        if let Some(tail) = self.blocks.back()
            && end <= tail.end()
        {
            return Ok(());
        }
        self.seed();

        let min_block = self
            .cursors
            .iter()
            .map(|cursor| cursor.map_or(0, |index| index))
            .min()
            .unwrap_or(0);
        if min_block > 0 {
            // Pop only after the sink accepts the bytes: a failed append
            // leaves the block and every cursor in place for a retry.
            let full_rows = self.geometry.samples_per_block();
            for _ in 0..min_block {
                let Some(block) = self.blocks.front() else {
                    break;
                };
                Self::append_block(self.geometry, &mut self.stats, sink, block, full_rows)?;
                self.blocks.pop_front();
                self.shift_cursors_after_pop();
            }
            debug!(
                target: "weir::window",
                evicted = min_block,
                window_start = self.blocks.front().map_or(0, |block| block.start().0),
                "evicted finished blocks"
            );
        }

        let mut added = 0_u64;
        loop {
            let tail_end = match self.blocks.back() {
                Some(tail) => tail.end(),
                None => SamplePos::ZERO,
            };
            if end <= tail_end {
                break;
            }
            if tail_end.checked_add(self.geometry.block_span()).is_none() {
                return Err(WeirError::PositionOverflow(format!(
                    "block at {tail_end} would leave the position space"
                )));
            }
            self.blocks
                .push_back(SampleBlock::new(self.geometry, tail_end));
            added += 1;
        }
        if added > 0 {
            self.stats.blocks_allocated += added;
            debug!(
                target: "weir::window",
                blocks_added = added,
                window_len = self.blocks.len(),
                "extended coverage"
            );
        }
        Ok(())
    }

    fn append_block(
        geometry: Geometry,
        stats: &mut RecorderStats,
        sink: &mut dyn ByteSink,
        block: &SampleBlock<S>,
        rows: usize,
    ) -> Result<()> {
        if rows == geometry.samples_per_block() {
            block.flush(sink)?;
        } else {
            block.partial_flush(sink, rows)?;
        }
        stats.blocks_flushed += 1;
        stats.bytes_flushed += (rows * geometry.channels() * S::BYTES) as u64;
        Ok(())
    }

    /// One flushed block left the front: retained indexes shift down and a
    /// cursor that sat on the removed block clears.
    fn shift_cursors_after_pop(&mut self) {
        for cursor in &mut self.cursors {
            *cursor = match *cursor {
                Some(0) | None => None,
                Some(index) => Some(index - 1),
            };
        }
    }
}

impl<S> std::fmt::Debug for BlockWindow<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockWindow")
            .field("geometry", &self.geometry)
            .field("blocks", &self.blocks.len())
            .field("window_start", &self.window_start())
            .field("cursors", &self.cursors)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_sink::MemorySink;

    fn window(channels: u16, samples_per_block: u32) -> BlockWindow<i16> {
        let mut window = BlockWindow::new(Geometry::new(channels, samples_per_block).unwrap());
        window.seed();
        window
    }

    fn ramp(start: i16, len: usize) -> Vec<i16> {
        (0..len as i16).map(|i| start + i).collect()
    }

    /// Memory sink that fails the nth append and then heals.
    struct FlakySink {
        inner: MemorySink,
        appends: usize,
        fail_on_append: usize,
    }

    impl FlakySink {
        fn fail_on(fail_on_append: usize) -> Self {
            Self {
                inner: MemorySink::new(),
                appends: 0,
                fail_on_append,
            }
        }
    }

    impl ByteSink for FlakySink {
        fn append_all(&mut self, buf: &[u8]) -> Result<()> {
            self.appends += 1;
            if self.appends == self.fail_on_append {
                return Err(std::io::Error::other("transient append failure").into());
            }
            self.inner.append_all(buf)
        }

        fn flush(&mut self) -> Result<()> {
            self.inner.flush()
        }

        fn bytes_written(&self) -> u64 {
            self.inner.bytes_written()
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[test]
    fn seed_places_block_zero_once() {
        let mut window = window(2, 4);
        assert_eq!(window.len(), 1);
        assert_eq!(window.window_start(), Some(SamplePos::ZERO));

        window.seed();
        assert_eq!(window.len(), 1);
        assert_eq!(window.stats().blocks_allocated, 1);
    }

    #[test]
    fn write_within_tail_allocates_nothing() {
        let mut window = window(2, 4);
        let mut sink = MemorySink::new();

        window
            .write_channel(&mut sink, ChannelId(0), SamplePos::ZERO, &[1, 2])
            .unwrap();

        assert_eq!(window.len(), 1);
        assert_eq!(window.cursor(ChannelId(0)), Some(0));
        assert_eq!(window.cursor(ChannelId(1)), None);
        assert_eq!(sink.bytes_written(), 0);
    }

    #[test]
    fn run_splits_across_block_boundary() {
        let mut window = window(1, 4);
        let mut sink = MemorySink::new();

        window
            .write_channel(&mut sink, ChannelId(0), SamplePos(2), &ramp(10, 5))
            .unwrap();

        assert_eq!(window.len(), 2);
        assert_eq!(window.cursor(ChannelId(0)), Some(1));

        let flushed = window.flush_all(&mut sink).unwrap();
        assert_eq!(flushed, 3); // tail holds rows 4..7, filled through row 6
        let decoded: Vec<i16> = weir_types::decode_samples_le(sink.as_bytes()).unwrap();
        assert_eq!(decoded, vec![0, 0, 10, 11, 12, 13, 14]);
    }

    #[test]
    fn far_start_allocates_gap_blocks() {
        let mut window = window(1, 4);
        let mut sink = MemorySink::new();

        window
            .write_channel(&mut sink, ChannelId(0), SamplePos(10), &[7])
            .unwrap();

        // Coverage must reach row 10: blocks at 0, 4, and 8.
        assert_eq!(window.len(), 3);
        assert_eq!(window.stats().blocks_allocated, 3);
        assert_eq!(window.cursor(ChannelId(0)), Some(2));
        assert_eq!(sink.bytes_written(), 0);
    }

    #[test]
    fn eviction_waits_for_every_channel() {
        let mut window = window(2, 4);
        let mut sink = MemorySink::new();

        // Channel 0 races three blocks ahead; channel 1 has not written, so
        // nothing may be evicted no matter how far coverage extends.
        window
            .write_channel(&mut sink, ChannelId(0), SamplePos::ZERO, &ramp(1, 12))
            .unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(sink.bytes_written(), 0);

        // Channel 1 writes block 0 only. Its cursor now sits on block 0,
        // which still pins that block: another extension evicts nothing.
        window
            .write_channel(&mut sink, ChannelId(1), SamplePos::ZERO, &ramp(-1, 4))
            .unwrap();
        window
            .write_channel(&mut sink, ChannelId(0), SamplePos(12), &ramp(100, 4))
            .unwrap();
        assert_eq!(window.window_start(), Some(SamplePos::ZERO));
        assert_eq!(window.len(), 4);
        assert_eq!(sink.bytes_written(), 0);

        // Once channel 1 moves into block 1, the next extension may evict
        // exactly block 0.
        window
            .write_channel(&mut sink, ChannelId(1), SamplePos(4), &ramp(-100, 4))
            .unwrap();
        window
            .write_channel(&mut sink, ChannelId(0), SamplePos(16), &ramp(200, 4))
            .unwrap();

        assert_eq!(window.window_start(), Some(SamplePos(4)));
        assert_eq!(window.stats().blocks_flushed, 1);
        assert_eq!(sink.bytes_written(), 4 * 2 * 2);

        // Cursors shifted down with the eviction.
        assert_eq!(window.cursor(ChannelId(0)), Some(3));
        assert_eq!(window.cursor(ChannelId(1)), Some(0));
    }

    #[test]
    fn evicted_bytes_interleave_both_channels() {
        let mut window = window(2, 2);
        let mut sink = MemorySink::new();

        window
            .write_channel(&mut sink, ChannelId(0), SamplePos::ZERO, &[1, 2])
            .unwrap();
        window
            .write_channel(&mut sink, ChannelId(1), SamplePos::ZERO, &[-1, -2])
            .unwrap();
        window
            .write_channel(&mut sink, ChannelId(0), SamplePos(2), &[3])
            .unwrap();
        window
            .write_channel(&mut sink, ChannelId(1), SamplePos(2), &[-3])
            .unwrap();

        // Both cursors have moved past block 0; the next extension evicts it.
        assert_eq!(sink.bytes_written(), 0);
        window
            .write_channel(&mut sink, ChannelId(0), SamplePos(4), &[4])
            .unwrap();

        let decoded: Vec<i16> = weir_types::decode_samples_le(sink.as_bytes()).unwrap();
        assert_eq!(decoded, vec![1, -1, 2, -2]);
    }

    #[test]
    fn stale_run_fails_without_state_change() {
        let mut window = window(1, 4);
        let mut sink = MemorySink::new();

        // Single channel writing densely: each extension past a finished
        // block evicts it, so block 0 is on disk after the third run.
        window
            .write_channel(&mut sink, ChannelId(0), SamplePos::ZERO, &ramp(1, 4))
            .unwrap();
        window
            .write_channel(&mut sink, ChannelId(0), SamplePos(4), &ramp(5, 4))
            .unwrap();
        window
            .write_channel(&mut sink, ChannelId(0), SamplePos(8), &ramp(9, 4))
            .unwrap();
        assert_eq!(window.window_start(), Some(SamplePos(4)));
        let bytes_before = sink.bytes_written();
        let cursor_before = window.cursor(ChannelId(0));

        let err = window
            .write_channel(&mut sink, ChannelId(0), SamplePos(1), &[9])
            .expect_err("stale");
        assert!(matches!(
            err,
            WeirError::StaleWrite {
                channel: 0,
                start_pos: 1,
                window_start: 4,
            }
        ));

        assert_eq!(sink.bytes_written(), bytes_before);
        assert_eq!(window.cursor(ChannelId(0)), cursor_before);
        assert_eq!(window.stats().stale_writes, 1);

        // Later in-window runs still land.
        window
            .write_channel(&mut sink, ChannelId(0), SamplePos(6), &[42])
            .unwrap();
    }

    #[test]
    fn empty_run_is_accepted_and_changes_nothing() {
        let mut window = window(2, 4);
        let mut sink = MemorySink::new();

        window
            .write_channel(&mut sink, ChannelId(0), SamplePos(100), &[])
            .unwrap();

        assert_eq!(window.len(), 1);
        assert_eq!(window.cursor(ChannelId(0)), None);
        assert_eq!(window.stats().writes, 0);
        assert_eq!(window.stats().samples_written, 0);
    }

    #[test]
    fn out_of_range_channel_rejected() {
        let mut window = window(2, 4);
        let mut sink = MemorySink::new();

        let err = window
            .write_channel(&mut sink, ChannelId(2), SamplePos::ZERO, &[1])
            .expect_err("range");
        assert!(matches!(
            err,
            WeirError::ChannelOutOfRange {
                channel: 2,
                channels: 2
            }
        ));
    }

    #[test]
    fn flush_all_orders_blocks_and_trims_tail() {
        let mut window = window(1, 4);
        let mut sink = MemorySink::new();

        window
            .write_channel(&mut sink, ChannelId(0), SamplePos::ZERO, &ramp(1, 6))
            .unwrap();
        let tail_rows = window.flush_all(&mut sink).unwrap();

        assert_eq!(tail_rows, 2);
        assert!(window.is_empty());
        assert_eq!(window.cursor(ChannelId(0)), None);

        let decoded: Vec<i16> = weir_types::decode_samples_le(sink.as_bytes()).unwrap();
        assert_eq!(decoded, vec![1, 2, 3, 4, 5, 6]);

        let stats = window.stats();
        assert_eq!(stats.blocks_flushed, 2);
        assert_eq!(stats.bytes_flushed, 12);
    }

    #[test]
    fn flush_all_with_untouched_tail_writes_full_blocks_only() {
        let mut window = window(1, 4);
        let mut sink = MemorySink::new();

        // Run ends exactly on the boundary; the tail block at 4 was never
        // allocated, so only block 0 exists and it is completely filled.
        window
            .write_channel(&mut sink, ChannelId(0), SamplePos::ZERO, &ramp(1, 4))
            .unwrap();
        assert_eq!(window.len(), 1);

        let tail_rows = window.flush_all(&mut sink).unwrap();
        assert_eq!(tail_rows, 4);
        assert_eq!(sink.bytes_written(), 8);
    }

    #[test]
    fn flush_all_failure_keeps_blocks_for_retry() {
        let mut window = window(1, 4);
        let mut sink = FlakySink::fail_on(1);

        window
            .write_channel(&mut sink, ChannelId(0), SamplePos::ZERO, &ramp(1, 12))
            .unwrap();

        let err = window.flush_all(&mut sink).expect_err("first append fails");
        assert!(matches!(err, WeirError::Io(_)));

        // Nothing reached the sink and nothing was dropped.
        assert_eq!(sink.bytes_written(), 0);
        assert_eq!(window.len(), 3);
        assert_eq!(window.window_start(), Some(SamplePos::ZERO));
        assert_eq!(window.cursor(ChannelId(0)), Some(2));

        let tail_rows = window.flush_all(&mut sink).unwrap();
        assert_eq!(tail_rows, 4);
        assert!(window.is_empty());

        let decoded: Vec<i16> = weir_types::decode_samples_le(sink.inner.as_bytes()).unwrap();
        assert_eq!(decoded, ramp(1, 12));
    }

    #[test]
    fn flush_all_resumes_after_partial_drain() {
        let mut window = window(1, 4);
        let mut sink = FlakySink::fail_on(2);

        window
            .write_channel(&mut sink, ChannelId(0), SamplePos::ZERO, &ramp(1, 12))
            .unwrap();

        let err = window.flush_all(&mut sink).expect_err("second append fails");
        assert!(matches!(err, WeirError::Io(_)));

        // Block 0 made it out; the rest stayed, with the cursor shifted to
        // match.
        assert_eq!(sink.bytes_written(), 8);
        assert_eq!(window.len(), 2);
        assert_eq!(window.window_start(), Some(SamplePos(4)));
        assert_eq!(window.cursor(ChannelId(0)), Some(1));

        window.flush_all(&mut sink).unwrap();
        let decoded: Vec<i16> = weir_types::decode_samples_le(sink.inner.as_bytes()).unwrap();
        assert_eq!(decoded, ramp(1, 12));
    }

    #[test]
    fn eviction_failure_heals_without_losing_rows() {
        let mut window = window(1, 4);
        let mut sink = FlakySink::fail_on(1);

        window
            .write_channel(&mut sink, ChannelId(0), SamplePos::ZERO, &ramp(0, 4))
            .unwrap();
        window
            .write_channel(&mut sink, ChannelId(0), SamplePos(4), &ramp(4, 4))
            .unwrap();

        // Extending past block 1 must evict block 0, and that append fails.
        let err = window
            .write_channel(&mut sink, ChannelId(0), SamplePos(8), &ramp(8, 4))
            .expect_err("eviction fails");
        assert!(matches!(err, WeirError::Io(_)));

        // The unflushed block is still at the front and the cursor still
        // points past it.
        assert_eq!(sink.bytes_written(), 0);
        assert_eq!(window.len(), 2);
        assert_eq!(window.window_start(), Some(SamplePos::ZERO));
        assert_eq!(window.cursor(ChannelId(0)), Some(1));

        // Once the sink heals, the same run lands and the drain yields every
        // row at its recorded position.
        window
            .write_channel(&mut sink, ChannelId(0), SamplePos(8), &ramp(8, 4))
            .unwrap();
        window.flush_all(&mut sink).unwrap();

        let decoded: Vec<i16> = weir_types::decode_samples_le(sink.inner.as_bytes()).unwrap();
        assert_eq!(decoded, ramp(0, 12));
    }

    #[test]
    fn exact_boundary_run_allocates_no_extra_block() {
        let mut window = window(2, 4);
        let mut sink = MemorySink::new();

        window
            .write_channel(&mut sink, ChannelId(0), SamplePos::ZERO, &ramp(1, 4))
            .unwrap();

        // End == tail end: the tail accommodates the run as-is.
        assert_eq!(window.len(), 1);
        assert_eq!(window.stats().blocks_allocated, 1);
    }

    #[test]
    fn stats_accumulate_across_runs() {
        let mut window = window(2, 4);
        let mut sink = MemorySink::new();

        window
            .write_channel(&mut sink, ChannelId(0), SamplePos::ZERO, &ramp(1, 4))
            .unwrap();
        window
            .write_channel(&mut sink, ChannelId(1), SamplePos::ZERO, &ramp(1, 6))
            .unwrap();

        let stats = window.stats();
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.samples_written, 10);
        assert_eq!(stats.blocks_allocated, 2);
        assert_eq!(stats.blocks_flushed, 0);
    }
}
