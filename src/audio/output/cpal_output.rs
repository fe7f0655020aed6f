// ABOUTME: cpal-based audio output implementation
// ABOUTME: Cross-platform audio sink using the cpal library

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::audio::output::AudioSink;
use crate::audio::SampleFormat;
use crate::error::{Error, Result};

/// Bounded queue of frame buffers between the player and the device
/// callback; at 10 ms blocks this is ~80 ms of pacing backpressure.
const QUEUE_DEPTH: usize = 8;

/// cpal-backed [`AudioSink`].
///
/// cpal's `Stream` is `!Send`, so the stream lives on a dedicated thread
/// spawned by [`open`](AudioSink::open); this handle stays `Send` and feeds
/// the callback through a bounded channel.
pub struct CpalOutput {
    device_name: Option<String>,
    active: Option<Active>,
}

struct Active {
    format: SampleFormat,
    frame_tx: SyncSender<Vec<u8>>,
    queued_frames: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalOutput {
    /// Use the host's default output device.
    pub fn new() -> Self {
        CpalOutput {
            device_name: None,
            active: None,
        }
    }

    /// Use the output device with the given cpal name.
    pub fn with_device(name: impl Into<String>) -> Self {
        CpalOutput {
            device_name: Some(name.into()),
            active: None,
        }
    }
}

impl Default for CpalOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for CpalOutput {
    fn open(&mut self, format: &SampleFormat) -> Result<()> {
        self.close();

        let (frame_tx, frame_rx) = sync_channel::<Vec<u8>>(QUEUE_DEPTH);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::result::Result<(), String>>();
        let queued_frames = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let device_name = self.device_name.clone();
        let thread_format = *format;
        let thread_queued = Arc::clone(&queued_frames);
        let thread_stop = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("audio-out".into())
            .spawn(move || {
                device_thread(
                    device_name,
                    thread_format,
                    frame_rx,
                    thread_queued,
                    thread_stop,
                    ready_tx,
                );
            })
            .map_err(|e| Error::Sink(format!("spawning audio thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(msg)) => {
                let _ = thread.join();
                return Err(Error::Sink(msg));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(Error::Sink("audio thread died during setup".into()));
            }
        }

        self.active = Some(Active {
            format: *format,
            frame_tx,
            queued_frames,
            stop,
            thread: Some(thread),
        });
        Ok(())
    }

    fn write(&mut self, frames: &[u8]) -> Result<usize> {
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| Error::Sink("sink is not open".into()))?;
        let frame_size = active.format.frame_size();
        let count = frames.len() / frame_size;
        if count == 0 {
            return Ok(0);
        }
        active
            .frame_tx
            .send(frames[..count * frame_size].to_vec())
            .map_err(|_| Error::Sink("audio thread is gone".into()))?;
        active.queued_frames.fetch_add(count as u64, Ordering::AcqRel);
        Ok(count)
    }

    fn pending_latency(&self) -> Duration {
        match &self.active {
            Some(active) => {
                let frames = active.queued_frames.load(Ordering::Acquire);
                Duration::from_micros(active.format.frames_to_micros(frames as i64).max(0) as u64)
            }
            None => Duration::ZERO,
        }
    }

    fn close(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.stop.store(true, Ordering::Release);
            drop(active.frame_tx);
            if let Some(handle) = active.thread.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Owns the cpal stream for the lifetime of one `open`.
fn device_thread(
    device_name: Option<String>,
    format: SampleFormat,
    frame_rx: Receiver<Vec<u8>>,
    queued_frames: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    ready_tx: std::sync::mpsc::Sender<std::result::Result<(), String>>,
) {
    let host = cpal::default_host();
    let device = match device_name {
        Some(ref name) => host.output_devices().ok().and_then(|mut devices| {
            devices.find(|d| d.name().map(|n| &n == name).unwrap_or(false))
        }),
        None => host.default_output_device(),
    };
    let Some(device) = device else {
        let _ = ready_tx.send(Err(match device_name {
            Some(name) => format!("output device {name:?} not found"),
            None => "no output device available".into(),
        }));
        return;
    };

    // catch format mismatches early; the OS may resample behind our back
    if let Ok(default) = device.default_output_config() {
        if default.sample_rate().0 != format.rate || default.channels() != format.channels {
            log::warn!(
                "requested {}Hz/{}ch; device default is {}Hz/{}ch",
                format.rate,
                format.channels,
                default.sample_rate().0,
                default.channels()
            );
        }
    }

    let config = StreamConfig {
        channels: format.channels,
        sample_rate: SampleRate(format.rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let sample_size = format.sample_size();
    let channels = format.channels.max(1) as u64;
    let bits = format.bits;
    let mut current: Option<Vec<u8>> = None;
    let mut pos = 0usize;
    let mut samples_in_frame = 0u64;

    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            for out in data.iter_mut() {
                if current
                    .as_ref()
                    .map_or(true, |buf| pos + sample_size > buf.len())
                {
                    current = match frame_rx.try_recv() {
                        Ok(buf) => {
                            pos = 0;
                            Some(buf)
                        }
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
                    };
                }
                match current.as_ref() {
                    Some(buf) if pos + sample_size <= buf.len() => {
                        *out = convert_sample(&buf[pos..pos + sample_size], bits);
                        pos += sample_size;
                        samples_in_frame += 1;
                        if samples_in_frame == channels {
                            samples_in_frame = 0;
                            queued_frames.fetch_sub(1, Ordering::AcqRel);
                        }
                    }
                    _ => *out = 0.0,
                }
            }
        },
        |err| log::error!("audio stream error: {err}"),
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("building output stream: {e}")));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(format!("starting output stream: {e}")));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    while !stop.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(50));
    }
    drop(stream);
}

/// One little-endian sample to the f32 the device callback wants.
fn convert_sample(raw: &[u8], bits: u16) -> f32 {
    match (bits, raw.len()) {
        (8, 1) => (raw[0] as f32 - 128.0) / 128.0,
        (16, 2) => i16::from_le_bytes([raw[0], raw[1]]) as f32 / 32768.0,
        // 24-bit rides in a 4-byte container
        (24, 4) => i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as f32 / 8_388_608.0,
        (32, 4) => i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as f32 / 2_147_483_648.0,
        _ => 0.0,
    }
}
