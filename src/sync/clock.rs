// ABOUTME: Clock synchronization implementation
// ABOUTME: Smooths round-trip offset samples into a server-clock estimate

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Local wall clock as microseconds since the Unix epoch.
pub fn local_now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Samples of the first burst are taken verbatim; after that the offset is
/// smoothed exponentially.
const BURST_SAMPLES: u32 = 50;
const SMOOTHING: f64 = 1.0 / 16.0;

/// Shared estimate of `server_clock − local_clock`.
///
/// One updater (the task handling `Time` replies) feeds offset samples in;
/// any number of readers call [`server_now_micros`](Self::server_now_micros)
/// to place samples on the server's timeline. Cloning shares the estimate.
#[derive(Debug, Clone, Default)]
pub struct TimeProvider {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    /// Offset in microseconds, `server − local`.
    offset_us: AtomicI64,
    samples: AtomicU32,
    valid: AtomicBool,
}

impl TimeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one round-trip measurement.
    ///
    /// `c2s_us` is the server-reported latency (server receive stamp minus
    /// client send stamp); `s2c_us` is the client receive stamp minus the
    /// server send stamp of the same reply. Each one-way figure mixes the
    /// true network latency with the clock offset in opposite signs, so half
    /// their difference isolates the offset.
    pub fn update(&self, c2s_us: i64, s2c_us: i64) {
        let sample = (c2s_us - s2c_us) / 2;
        let n = self.shared.samples.fetch_add(1, Ordering::AcqRel);
        let next = if n < BURST_SAMPLES {
            sample
        } else {
            let prev = self.shared.offset_us.load(Ordering::Acquire) as f64;
            (SMOOTHING * sample as f64 + (1.0 - SMOOTHING) * prev) as i64
        };
        self.shared.offset_us.store(next, Ordering::Release);
        self.shared.valid.store(true, Ordering::Release);
        log::trace!("time sample {sample} us, offset now {next} us");
    }

    /// Forget the estimate, so the next session's burst starts fresh.
    pub fn reset(&self) {
        self.shared.valid.store(false, Ordering::Release);
        self.shared.samples.store(0, Ordering::Release);
        self.shared.offset_us.store(0, Ordering::Release);
    }

    /// Current offset in microseconds, if at least one sample arrived.
    pub fn offset_micros(&self) -> Option<i64> {
        if self.shared.valid.load(Ordering::Acquire) {
            Some(self.shared.offset_us.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Best estimate of the server clock, as microseconds since the Unix
    /// epoch. Falls back to the raw local clock until the first sample.
    pub fn server_now_micros(&self) -> i64 {
        local_now_micros() + self.shared.offset_us.load(Ordering::Acquire)
    }
}
