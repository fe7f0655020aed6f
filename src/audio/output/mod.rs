// ABOUTME: Audio sink contract
// ABOUTME: Abstracts the playback backend behind open/write/latency/close

pub mod cpal_output;

pub use cpal_output::CpalOutput;

use std::time::Duration;

use crate::audio::SampleFormat;
use crate::error::Result;

/// Playback backend.
///
/// `write` accepts whole frames and may block briefly for pacing; that
/// backpressure is the only rate control the player relies on. Backends are
/// interchangeable; the player never assumes a concrete device.
pub trait AudioSink: Send {
    fn open(&mut self, format: &SampleFormat) -> Result<()>;

    /// Submit whole frames; returns the number of frames accepted.
    fn write(&mut self, frames: &[u8]) -> Result<usize>;

    /// Audio already accepted but not yet out of the device.
    fn pending_latency(&self) -> Duration;

    fn close(&mut self);
}
