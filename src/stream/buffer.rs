//! Per-consumer sample buffer.
//!
//! A [`StreamBuffer`] is written by exactly one producer (the proxy's fan-out, running
//! on the instrument's notification thread) and read by exactly one consumer. Values
//! are stored interleaved by row:
//!
//! ```text
//! [row0_ch0, row0_ch1, ..., row1_ch0, row1_ch1, ...]
//! ```
//!
//! with one timestamp per row, taken from the reference channel (subscription index 0)
//! and expressed in milliseconds relative to the first sample received after start.
//!
//! The instrument scans its channels round-robin, so a consumer subscribed to channels
//! `[a, b]` expects indices `0, 1, 0, 1, ...`. A sample whose index does not match
//! the expectation (a channel was skipped) is discarded without touching stored rows.
//!
//! When the ring is full the buffer refuses further samples with
//! [`WavemeterError::Overflow`] and stays overflowed until it is restarted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::error::{Result, WavemeterError};
use crate::proxy::ConsumerId;
use crate::units::ChannelUnit;

/// Default sleep between checks of a blocking read.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of a single [`StreamBuffer::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Value written
    Stored,
    /// Value dropped (misaligned, or buffer not running)
    Discarded,
}

/// Rows read out of a [`StreamBuffer`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunk {
    /// Interleaved values, `rows() * channel_count` long
    pub values: Vec<f64>,
    /// One timestamp per row, ms since stream start
    pub timestamps_ms: Vec<f64>,
    /// Channels per row
    pub channel_count: usize,
}

impl StreamChunk {
    /// Number of complete rows.
    pub fn rows(&self) -> usize {
        self.timestamps_ms.len()
    }

    /// Whether the chunk holds no rows.
    pub fn is_empty(&self) -> bool {
        self.timestamps_ms.is_empty()
    }

    /// Values of one channel (by subscription index).
    pub fn channel(&self, index: usize) -> Vec<f64> {
        if index >= self.channel_count {
            return Vec::new();
        }
        self.values
            .iter()
            .skip(index)
            .step_by(self.channel_count)
            .copied()
            .collect()
    }

    /// Reshape into per-channel vectors.
    pub fn deinterleave(&self) -> Vec<Vec<f64>> {
        let mut channels = vec![Vec::with_capacity(self.rows()); self.channel_count];
        for (i, &v) in self.values.iter().enumerate() {
            channels[i % self.channel_count].push(v);
        }
        channels
    }

    /// Row timestamps in seconds.
    pub fn timestamps_secs(&self) -> Vec<f64> {
        self.timestamps_ms.iter().map(|ms| ms / 1e3).collect()
    }
}

#[derive(Default)]
struct Ring {
    values: Vec<f64>,
    timestamps: Vec<f64>,
    capacity: usize,
    channel_count: usize,
    /// Value slots written, always `< capacity * channel_count + 1`
    cursor: usize,
    overflow: bool,
    stream_start: Option<f64>,
    units: Vec<ChannelUnit>,
}

impl Ring {
    fn rows(&self) -> usize {
        if self.channel_count == 0 {
            0
        } else {
            self.cursor / self.channel_count
        }
    }

    fn expected_index(&self) -> usize {
        if self.channel_count == 0 {
            0
        } else {
            self.cursor % self.channel_count
        }
    }

    fn copy_rows(&self, rows: usize) -> StreamChunk {
        StreamChunk {
            values: self.values[..rows * self.channel_count].to_vec(),
            timestamps_ms: self.timestamps[..rows].to_vec(),
            channel_count: self.channel_count,
        }
    }

    /// Drop the first `rows` rows and shift the remainder (partial row included) to the front.
    fn consume(&mut self, rows: usize) {
        if rows == 0 {
            return;
        }
        let slots = rows * self.channel_count;
        // a partial row already carries its reference timestamp
        let ts_end = self.cursor.div_ceil(self.channel_count);
        self.values.copy_within(slots..self.cursor, 0);
        self.timestamps.copy_within(rows..ts_end, 0);
        self.cursor -= slots;
    }
}

/// Fixed-capacity buffer of one consumer's samples.
pub struct StreamBuffer {
    id: ConsumerId,
    running: AtomicBool,
    poll_interval: Duration,
    ring: Mutex<Ring>,
}

impl StreamBuffer {
    /// Create a stopped buffer with a fresh consumer id.
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Create a stopped buffer that sleeps `poll_interval` between checks of a blocking read.
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            id: ConsumerId::new(),
            running: AtomicBool::new(false),
            poll_interval,
            ring: Mutex::new(Ring::default()),
        }
    }

    /// Identity of the consumer owning this buffer.
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Output unit per subscription index. Missing entries use vacuum wavelength.
    pub fn set_channel_units(&self, units: Vec<ChannelUnit>) {
        self.ring.lock().units = units;
    }

    /// Allocate `capacity` rows of `channel_count` values and start accepting samples.
    pub fn start(&self, capacity: usize, channel_count: usize) -> Result<()> {
        if capacity == 0 || channel_count == 0 {
            return Err(WavemeterError::invalid_config(format!(
                "stream buffer needs a non-zero size (capacity {capacity}, channels {channel_count})"
            )));
        }
        let mut ring = self.ring.lock();
        let slots = capacity * channel_count;
        ring.values.clear();
        ring.values.resize(slots, 0.0);
        ring.timestamps.clear();
        ring.timestamps.resize(capacity, 0.0);
        ring.capacity = capacity;
        ring.channel_count = channel_count;
        ring.cursor = 0;
        ring.overflow = false;
        ring.stream_start = None;
        self.running.store(true, Ordering::Release);
        debug!(consumer = %self.id, capacity, channel_count, "Stream buffer started");
        Ok(())
    }

    /// Stop accepting samples and wake any blocked reader.
    ///
    /// Buffered rows are discarded. An overflow stays visible to readers until the
    /// next [`start`](Self::start).
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        let mut ring = self.ring.lock();
        ring.cursor = 0;
        ring.stream_start = None;
        if was_running {
            debug!(consumer = %self.id, overflow = ring.overflow, "Stream buffer stopped");
        }
    }

    /// Whether the buffer accepts samples.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the buffer overflowed since its last start.
    pub fn has_overflowed(&self) -> bool {
        self.ring.lock().overflow
    }

    /// Rows per channel the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity
    }

    /// Channels per row.
    pub fn channel_count(&self) -> usize {
        self.ring.lock().channel_count
    }

    /// Store one value delivered for subscription index `index`.
    ///
    /// `value` is a vacuum wavelength in nm (NaN for invalid readings) and
    /// `timestamp_ms` the instrument's timestamp.
    pub fn insert(&self, index: usize, value: f64, timestamp_ms: f64) -> Result<InsertOutcome> {
        if !self.is_running() {
            return Ok(InsertOutcome::Discarded);
        }
        let mut ring = self.ring.lock();
        if ring.overflow || ring.cursor >= ring.capacity * ring.channel_count {
            if !ring.overflow {
                warn!(consumer = %self.id, capacity = ring.capacity, "Stream buffer overflow");
            }
            ring.overflow = true;
            return Err(WavemeterError::Overflow {
                capacity: ring.capacity,
            });
        }

        let start = *ring.stream_start.get_or_insert(timestamp_ms);

        if index != ring.expected_index() {
            trace!(
                consumer = %self.id,
                index,
                expected = ring.expected_index(),
                "Discarding misaligned sample"
            );
            return Ok(InsertOutcome::Discarded);
        }

        let unit = ring.units.get(index).copied().unwrap_or_default();
        let cursor = ring.cursor;
        ring.values[cursor] = unit.convert(value);
        if index == 0 {
            let row = cursor / ring.channel_count;
            ring.timestamps[row] = timestamp_ms - start;
        }
        ring.cursor += 1;
        Ok(InsertOutcome::Stored)
    }

    /// Complete rows ready to read.
    pub fn available_rows(&self) -> usize {
        self.ring.lock().rows()
    }

    fn check_readable(&self, ring: &Ring) -> Result<()> {
        if ring.overflow {
            return Err(WavemeterError::Overflow {
                capacity: ring.capacity,
            });
        }
        if !self.is_running() {
            return Err(WavemeterError::NotRunning);
        }
        Ok(())
    }

    /// Sleep-poll until `rows` complete rows are buffered, then return the locked ring.
    fn wait_for_rows(&self, rows: usize) -> Result<MutexGuard<'_, Ring>> {
        loop {
            let ring = self.ring.lock();
            self.check_readable(&ring)?;
            if rows > ring.capacity {
                return Err(WavemeterError::invalid_config(format!(
                    "requested {rows} rows from a buffer holding {}",
                    ring.capacity
                )));
            }
            if ring.rows() >= rows {
                return Ok(ring);
            }
            drop(ring);
            thread::sleep(self.poll_interval);
        }
    }

    /// Block until `rows` rows are available, then consume and return them.
    ///
    /// Returns early with an error when the buffer is stopped or overflows while waiting.
    pub fn read(&self, rows: usize) -> Result<StreamChunk> {
        let mut ring = self.wait_for_rows(rows)?;
        let chunk = ring.copy_rows(rows);
        ring.consume(rows);
        Ok(chunk)
    }

    /// Consume and return up to `max_rows` rows without blocking.
    pub fn read_available(&self, max_rows: usize) -> Result<StreamChunk> {
        let mut ring = self.ring.lock();
        self.check_readable(&ring)?;
        let rows = max_rows.min(ring.rows());
        let chunk = ring.copy_rows(rows);
        ring.consume(rows);
        Ok(chunk)
    }

    /// Block until the provided slices can be filled, then fill them.
    ///
    /// `timestamps_ms.len()` rows are read; `values` must hold at least that many
    /// rows of interleaved values. Returns the number of rows written.
    pub fn read_into(&self, values: &mut [f64], timestamps_ms: &mut [f64]) -> Result<usize> {
        let rows = timestamps_ms.len();
        let mut ring = self.wait_for_rows(rows)?;
        let slots = rows * ring.channel_count;
        if values.len() < slots {
            return Err(WavemeterError::invalid_config(format!(
                "value slice holds {} entries, {slots} needed",
                values.len()
            )));
        }
        values[..slots].copy_from_slice(&ring.values[..slots]);
        timestamps_ms.copy_from_slice(&ring.timestamps[..rows]);
        ring.consume(rows);
        Ok(rows)
    }

    /// Most recent complete row and its timestamp, without consuming anything.
    pub fn read_single_point(&self) -> Result<Option<(Vec<f64>, f64)>> {
        let ring = self.ring.lock();
        self.check_readable(&ring)?;
        let rows = ring.rows();
        if rows == 0 {
            return Ok(None);
        }
        let n = ring.channel_count;
        let row = ring.values[(rows - 1) * n..rows * n].to_vec();
        Ok(Some((row, ring.timestamps[rows - 1])))
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBuffer")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
