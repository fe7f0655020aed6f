// ABOUTME: Player driver
// ABOUTME: Pulls timed PCM from the jitter buffer, applies volume, feeds the sink

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::output::AudioSink;
use crate::audio::stream::{PullOutcome, Stream};
use crate::audio::SampleFormat;
use crate::error::{Error, Result};

/// Block length the worker pulls per iteration.
const BLOCK: Duration = Duration::from_millis(10);

/// Volume-to-gain mapping, precomputed per volume change.
#[derive(Debug, Clone, Copy)]
pub enum VolumeCurve {
    /// `gain = volume ^ exponent`
    Poly { exponent: f64 },
    /// `gain = base ^ volume / base`
    Exponential { base: f64 },
}

impl Default for VolumeCurve {
    fn default() -> Self {
        VolumeCurve::Poly { exponent: 3.0 }
    }
}

impl VolumeCurve {
    pub fn gain(&self, volume: f64) -> f64 {
        let volume = volume.clamp(0.0, 1.0);
        match *self {
            VolumeCurve::Poly { exponent } => volume.powf(exponent),
            VolumeCurve::Exponential { base } => base.powf(volume) / base,
        }
    }
}

/// Drives one audio sink from one [`Stream`].
///
/// A dedicated worker thread pulls a block at a time at the instant the
/// sink will play it, scales it by the current volume, and submits it. The
/// sink's own backpressure paces the loop while audio flows; silence periods
/// are paced by the block clock.
pub struct Player {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

struct Shared {
    stream: Arc<Stream>,
    curve: VolumeCurve,
    /// Precomputed gain for the current volume.
    gain: Mutex<f64>,
    muted: AtomicBool,
    active: AtomicBool,
}

impl Player {
    pub fn new(stream: Arc<Stream>, curve: VolumeCurve) -> Self {
        Player {
            shared: Arc::new(Shared {
                stream,
                curve,
                gain: Mutex::new(curve.gain(1.0)),
                muted: AtomicBool::new(false),
                active: AtomicBool::new(false),
            }),
            worker: None,
        }
    }

    /// Open the sink for the stream's format and start the worker thread.
    /// `on_error` fires once if the worker dies on a sink failure.
    pub fn start(
        &mut self,
        mut sink: Box<dyn AudioSink>,
        on_error: Box<dyn FnOnce(Error) + Send>,
    ) -> Result<()> {
        sink.open(&self.shared.stream.format())?;
        self.shared.active.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("player".into())
            .spawn(move || {
                if let Err(err) = worker_loop(&shared, sink.as_mut()) {
                    log::error!("player stopped: {err}");
                    on_error(err);
                }
                sink.close();
            })
            .map_err(|e| Error::Sink(format!("spawning player thread: {e}")))?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Stop and join the worker. Idempotent.
    pub fn stop(&mut self) {
        self.shared.active.store(false, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    /// Set the volume in `[0, 1]`; the gain curve is applied here once.
    pub fn set_volume(&self, volume: f64) {
        *self.shared.gain.lock() = self.shared.curve.gain(volume);
    }

    pub fn set_mute(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Release);
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: &Shared, sink: &mut dyn AudioSink) -> Result<()> {
    let format = shared.stream.format();
    let frame_size = format.frame_size();
    let block_frames = (format.rate as usize / 100).max(1);
    let mut buf = vec![0u8; block_frames * frame_size];

    while shared.active.load(Ordering::Acquire) {
        let delay = sink.pending_latency();
        let outcome = shared.stream.pull(&mut buf, delay);
        if let PullOutcome::Playing { drift_frames } = outcome {
            if drift_frames != 0 {
                log::trace!("playout drift corrected by {drift_frames} frames");
            }
        }

        if shared.muted.load(Ordering::Acquire) {
            buf.fill(0);
        } else {
            let gain = *shared.gain.lock();
            if gain < 1.0 {
                scale_frames(&mut buf, &format, gain);
            }
        }

        let mut offset = 0;
        while offset < buf.len() {
            let written = sink.write(&buf[offset..])?;
            if written == 0 {
                if !shared.active.load(Ordering::Acquire) {
                    return Ok(());
                }
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            offset += written * frame_size;
        }

        // while underrun, the block clock paces the loop instead of the sink
        if outcome == PullOutcome::Silence {
            thread::sleep(BLOCK);
        }
    }
    Ok(())
}

/// Scale every sample in place; wire samples are little-endian.
fn scale_frames(buf: &mut [u8], format: &SampleFormat, gain: f64) {
    match format.bits {
        8 => {
            for sample in buf.iter_mut() {
                let centered = *sample as i16 - 128;
                *sample = ((centered as f64 * gain) as i16 + 128) as u8;
            }
        }
        16 => {
            for sample in buf.chunks_exact_mut(2) {
                let value = i16::from_le_bytes([sample[0], sample[1]]);
                let scaled = (value as f64 * gain) as i16;
                sample.copy_from_slice(&scaled.to_le_bytes());
            }
        }
        // 24-bit samples ride in 4-byte containers
        24 | 32 => {
            for sample in buf.chunks_exact_mut(4) {
                let value = i32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
                let scaled = (value as f64 * gain) as i32;
                sample.copy_from_slice(&scaled.to_le_bytes());
            }
        }
        other => log::debug!("no volume scaling for {other}-bit samples"),
    }
}
