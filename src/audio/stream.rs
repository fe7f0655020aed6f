// ABOUTME: Jitter buffer of decoded PCM chunks
// ABOUTME: Timed consumer read with catch-up, underrun and micro-seek policy

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::{PcmChunk, SampleFormat};
use crate::sync::TimeProvider;

/// Data older than this relative to the playout instant is unplayable and
/// gets dropped; younger gaps are bridged with silence.
const TAU_LATE_US: i64 = 100_000;

/// Largest drift absorbed by seeking inside the current chunk.
const TAU_ADJUST_US: i64 = 5_000;

/// Floor for the overflow window so a tiny server buffer cannot thrash.
const MIN_BUFFER_US: i64 = 100_000;

/// What a [`Stream::pull`] produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// Frames were copied. `drift_frames` is the cursor correction applied
    /// to stay on the playout instant (positive = skipped forward).
    Playing { drift_frames: i64 },
    /// No chunk covers the playout instant; the output was zero-filled and
    /// nothing was consumed.
    Silence,
}

/// Ordered queue of decoded chunks between the connection and the player.
///
/// The producer appends in capture order; the consumer asks for the frames
/// whose presentation time matches a playout instant on the server timeline.
/// The deliberate delay between capture and playout is the buffer length,
/// traded for jitter tolerance.
pub struct Stream {
    format: SampleFormat,
    clock: TimeProvider,
    inner: Mutex<Inner>,
}

struct Inner {
    chunks: VecDeque<PcmChunk>,
    buffer_us: i64,
}

impl Stream {
    pub fn new(format: SampleFormat, clock: TimeProvider, buffer_ms: i64) -> Self {
        Stream {
            format,
            clock,
            inner: Mutex::new(Inner {
                chunks: VecDeque::new(),
                buffer_us: buffer_ms.max(0) * 1000,
            }),
        }
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Update the target buffer length without flushing queued audio.
    pub fn set_buffer_len(&self, buffer_ms: i64) {
        self.inner.lock().buffer_us = buffer_ms.max(0) * 1000;
    }

    pub fn clear(&self) {
        self.inner.lock().chunks.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().chunks.is_empty()
    }

    /// Span between the oldest queued sample and the newest, in microseconds.
    pub fn buffered_micros(&self) -> i64 {
        let inner = self.inner.lock();
        match (inner.chunks.front(), inner.chunks.back()) {
            (Some(front), Some(back)) => back.end_micros() - front.start_micros(),
            _ => 0,
        }
    }

    /// Append a chunk. When the buffered span outgrows twice the target
    /// length the oldest chunks are dropped: the server is outrunning the
    /// player and fresh audio wins.
    pub fn push(&self, chunk: PcmChunk) {
        if chunk.frame_count() == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.chunks.push_back(chunk);
        let high_water = 2 * inner.buffer_us.max(MIN_BUFFER_US);
        loop {
            let span = match (inner.chunks.front(), inner.chunks.back()) {
                (Some(front), Some(back)) => back.end_micros() - front.start_micros(),
                _ => break,
            };
            if span <= high_water {
                break;
            }
            log::debug!("jitter buffer overflow, dropping oldest chunk");
            inner.chunks.pop_front();
        }
    }

    /// Fill `out` with the frames due at `server_now + output_delay`.
    pub fn pull(&self, out: &mut [u8], output_delay: Duration) -> PullOutcome {
        let playout = self.clock.server_now_micros() + output_delay.as_micros() as i64;
        self.pull_at(out, playout)
    }

    /// [`pull`](Self::pull) with an explicit playout instant, in
    /// server-timeline microseconds since the Unix epoch.
    pub fn pull_at(&self, out: &mut [u8], playout_us: i64) -> PullOutcome {
        let frame_size = self.format.frame_size();
        let mut inner = self.inner.lock();

        // the sample leaving the DAC at `playout_us` was captured one buffer
        // length earlier
        let target = playout_us - inner.buffer_us;

        // drop chunks that ended too long before the target to be playable
        while inner
            .chunks
            .front()
            .is_some_and(|front| front.end_micros() < target - TAU_LATE_US)
        {
            log::debug!("dropping chunk older than playout window");
            inner.chunks.pop_front();
        }

        // align the cursor of the front chunk with the target instant
        let mut drift_frames = 0i64;
        loop {
            let Some(front) = inner.chunks.front_mut() else {
                zero_fill(out);
                return PullOutcome::Silence;
            };
            let lead = front.start_micros() - target;
            if lead > TAU_ADJUST_US {
                // data is still in the future: silence-fill, consume nothing
                zero_fill(out);
                return PullOutcome::Silence;
            }
            drift_frames += front.seek(self.format.micros_to_frames(-lead));
            if front.is_consumed() {
                inner.chunks.pop_front();
                continue;
            }
            break;
        }

        // copy forward across chunk boundaries
        let want = out.len() / frame_size;
        let mut copied = 0usize;
        while copied < want {
            let Some(front) = inner.chunks.front_mut() else {
                break;
            };
            let n = front.read_frames(&mut out[copied * frame_size..], want - copied);
            if front.is_consumed() {
                inner.chunks.pop_front();
            }
            if n == 0 {
                break;
            }
            copied += n;
        }
        zero_fill(&mut out[copied * frame_size..]);

        PullOutcome::Playing { drift_frames }
    }
}

fn zero_fill(out: &mut [u8]) {
    for byte in out.iter_mut() {
        *byte = 0;
    }
}
