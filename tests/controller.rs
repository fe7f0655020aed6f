use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::time::timeout;

use snapclient::audio::output::AudioSink;
use snapclient::audio::SampleFormat;
use snapclient::controller::{ClientConfig, Controller, SinkBuilder, State};
use snapclient::protocol::messages::{
    serialize_frame, BaseMessage, CodecHeader, MessageType, ServerSettings, Time, Tv, TypedMessage,
    WireChunk, BASE_MESSAGE_SIZE,
};
use snapclient::sync::local_now_micros;
use snapclient::Result;

// =============================================================================
// Test scaffolding
// =============================================================================

/// Canonical 44-byte RIFF/WAVE header, as the server sends for pcm streams.
fn wave_header(rate: u32, bits: u16, channels: u16) -> Vec<u8> {
    let block_align = channels * (bits / 8);
    let byte_rate = rate * block_align as u32;
    let mut header = Vec::new();
    header.extend_from_slice(b"RIFF");
    header.extend_from_slice(&36u32.to_le_bytes());
    header.extend_from_slice(b"WAVE");
    header.extend_from_slice(b"fmt ");
    header.extend_from_slice(&16u32.to_le_bytes());
    header.extend_from_slice(&1u16.to_le_bytes()); // PCM
    header.extend_from_slice(&channels.to_le_bytes());
    header.extend_from_slice(&rate.to_le_bytes());
    header.extend_from_slice(&byte_rate.to_le_bytes());
    header.extend_from_slice(&block_align.to_le_bytes());
    header.extend_from_slice(&bits.to_le_bytes());
    header.extend_from_slice(b"data");
    header.extend_from_slice(&0u32.to_le_bytes());
    header
}

/// Shared observation point for everything the player feeds the sink.
#[derive(Clone, Default)]
struct SinkProbe {
    opened: Arc<Mutex<Option<SampleFormat>>>,
    data: Arc<Mutex<Vec<u8>>>,
    writes: Arc<AtomicUsize>,
}

impl SinkProbe {
    fn opened_format(&self) -> Option<SampleFormat> {
        *self.opened.lock().unwrap()
    }

    fn data_contains(&self, needle: &[u8]) -> bool {
        self.data
            .lock()
            .unwrap()
            .windows(needle.len())
            .any(|window| window == needle)
    }

    fn all_zero(&self) -> bool {
        self.data.lock().unwrap().iter().all(|&b| b == 0)
    }
}

struct MockSink {
    probe: SinkProbe,
    frame_size: usize,
}

impl AudioSink for MockSink {
    fn open(&mut self, format: &SampleFormat) -> Result<()> {
        self.frame_size = format.frame_size();
        *self.probe.opened.lock().unwrap() = Some(*format);
        Ok(())
    }

    fn write(&mut self, frames: &[u8]) -> Result<usize> {
        self.probe.data.lock().unwrap().extend_from_slice(frames);
        self.probe.writes.fetch_add(1, Ordering::Relaxed);
        // crude pacing so the player loop does not spin unbounded
        std::thread::sleep(Duration::from_millis(2));
        Ok(frames.len() / self.frame_size)
    }

    fn pending_latency(&self) -> Duration {
        Duration::ZERO
    }

    fn close(&mut self) {}
}

fn sink_builder(probe: SinkProbe) -> SinkBuilder {
    Box::new(move |_format| {
        let sink: Box<dyn AudioSink> = Box::new(MockSink {
            probe: probe.clone(),
            frame_size: 4,
        });
        Ok(sink)
    })
}

async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> (BaseMessage, Vec<u8>) {
    let mut header_buf = [0u8; BASE_MESSAGE_SIZE];
    stream.read_exact(&mut header_buf).await.unwrap();
    let header = BaseMessage::decode(&header_buf).unwrap();
    let mut body = vec![0u8; header.size as usize];
    stream.read_exact(&mut body).await.unwrap();
    (header, body)
}

/// One accepted client session: consumes the Hello, then keeps answering
/// `Time` probes in the background while the test pushes server messages.
struct StubSession {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
}

impl StubSession {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut read, write) = stream.into_split();

        let (hello, _) = read_frame(&mut read).await;
        assert_eq!(hello.msg_type, MessageType::Hello as u16);

        let writer = Arc::new(tokio::sync::Mutex::new(write));
        let reply_writer = Arc::clone(&writer);
        tokio::spawn(async move {
            loop {
                let mut header_buf = [0u8; BASE_MESSAGE_SIZE];
                if read.read_exact(&mut header_buf).await.is_err() {
                    break;
                }
                let Ok(header) = BaseMessage::decode(&header_buf) else {
                    break;
                };
                let mut body = vec![0u8; header.size as usize];
                if read.read_exact(&mut body).await.is_err() {
                    break;
                }
                if header.msg_type == MessageType::Time as u16 {
                    let frame = serialize_frame(&Time::default(), 0, header.id).unwrap();
                    if reply_writer.lock().await.write_all(&frame).await.is_err() {
                        break;
                    }
                }
            }
        });

        StubSession { writer }
    }

    async fn send<T: TypedMessage>(&self, msg: &T) {
        let frame = serialize_frame(msg, 0, 0).unwrap();
        self.writer.lock().await.write_all(&frame).await.unwrap();
    }
}

async fn wait_until(limit: Duration, what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn pcm_header() -> CodecHeader {
    CodecHeader {
        codec: "pcm".to_string(),
        payload: wave_header(48_000, 16, 2),
    }
}

async fn start_controller(probe: SinkProbe) -> (Controller, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut config = ClientConfig::new("127.0.0.1", port);
    config.mac = Some("aa:bb:cc:dd:ee:ff".to_string());
    let controller = Controller::new(config, sink_builder(probe));
    controller.start();
    (controller, listener)
}

// =============================================================================
// Codec install and playback
// =============================================================================

#[tokio::test]
async fn test_codec_install_plays_chunk_bytes_through_the_sink() {
    let probe = SinkProbe::default();
    let (controller, listener) = start_controller(probe.clone()).await;
    let session = StubSession::accept(&listener).await;

    session
        .send(&ServerSettings {
            buffer_ms: 80,
            latency: 0,
            volume: 100,
            muted: false,
        })
        .await;
    session.send(&pcm_header()).await;

    wait_until(Duration::from_secs(2), "sink open", || {
        probe.opened_format().is_some()
    })
    .await;
    assert_eq!(probe.opened_format(), Some(SampleFormat::new(48_000, 16, 2)));

    // a 100 ms chunk with a recognizable pattern, capture-stamped now; at
    // volume 100 the bytes must reach the sink unmodified
    let pattern = [0x11u8, 0x22, 0x33, 0x44];
    let mut payload = Vec::with_capacity(4_800 * 4);
    for _ in 0..4_800 {
        payload.extend_from_slice(&pattern);
    }
    session
        .send(&WireChunk {
            timestamp: Tv::from_micros(local_now_micros()),
            payload,
        })
        .await;

    wait_until(Duration::from_secs(5), "pattern in sink output", || {
        probe.data_contains(&[0x11, 0x22, 0x33, 0x44, 0x11, 0x22, 0x33, 0x44])
    })
    .await;

    wait_until(Duration::from_secs(5), "running state", || {
        controller.state() == State::Running
    })
    .await;

    controller.stop().await;
}

#[tokio::test]
async fn test_volume_scales_samples_before_the_sink() {
    let probe = SinkProbe::default();
    let (controller, listener) = start_controller(probe.clone()).await;
    let session = StubSession::accept(&listener).await;

    // volume 50% on the default cubic curve is a gain of 1/8
    session
        .send(&ServerSettings {
            buffer_ms: 80,
            latency: 0,
            volume: 50,
            muted: false,
        })
        .await;
    session.send(&pcm_header()).await;
    wait_until(Duration::from_secs(2), "sink open", || {
        probe.opened_format().is_some()
    })
    .await;

    // every sample 8000 -> expect 1000 after scaling
    let mut payload = Vec::with_capacity(4_800 * 4);
    for _ in 0..4_800 * 2 {
        payload.extend_from_slice(&8000i16.to_le_bytes());
    }
    session
        .send(&WireChunk {
            timestamp: Tv::from_micros(local_now_micros()),
            payload,
        })
        .await;

    let scaled = 1000i16.to_le_bytes();
    wait_until(Duration::from_secs(5), "scaled samples in sink", || {
        probe.data_contains(&[scaled[0], scaled[1], scaled[0], scaled[1]])
    })
    .await;

    controller.stop().await;
}

// =============================================================================
// Underrun
// =============================================================================

#[tokio::test]
async fn test_underrun_feeds_silence_without_blocking() {
    let probe = SinkProbe::default();
    let (controller, listener) = start_controller(probe.clone()).await;
    let session = StubSession::accept(&listener).await;

    session.send(&ServerSettings::default()).await;
    session.send(&pcm_header()).await;
    wait_until(Duration::from_secs(2), "sink open", || {
        probe.opened_format().is_some()
    })
    .await;

    // no chunks at all: the player must keep the sink fed with zeros
    let writes_before = probe.writes.load(Ordering::Relaxed);
    tokio::time::sleep(Duration::from_millis(300)).await;
    let writes_after = probe.writes.load(Ordering::Relaxed);

    assert!(writes_after > writes_before);
    assert!(probe.all_zero());

    controller.stop().await;
}

// =============================================================================
// Reconnect
// =============================================================================

#[tokio::test]
async fn test_reconnect_reissues_hello_after_remote_close() {
    let probe = SinkProbe::default();
    let (controller, listener) = start_controller(probe).await;

    // first session: consume the Hello, then kill the connection
    let (stream, _) = listener.accept().await.unwrap();
    let (mut read, write) = stream.into_split();
    let (hello, _) = read_frame(&mut read).await;
    assert_eq!(hello.msg_type, MessageType::Hello as u16);
    drop(read);
    drop(write);

    // the controller must come back and identify itself again
    let (stream, _) = timeout(Duration::from_secs(4), listener.accept())
        .await
        .expect("no reconnect")
        .unwrap();
    let (mut read, _write) = stream.into_split();
    let (hello, _) = timeout(Duration::from_secs(2), read_frame(&mut read))
        .await
        .expect("no hello on reconnect");
    assert_eq!(hello.msg_type, MessageType::Hello as u16);

    controller.stop().await;
}

#[tokio::test]
async fn test_unsupported_codec_restarts_the_session() {
    let probe = SinkProbe::default();
    let (controller, listener) = start_controller(probe.clone()).await;

    let session = StubSession::accept(&listener).await;
    session
        .send(&CodecHeader {
            codec: "opus".to_string(),
            payload: vec![],
        })
        .await;

    // codec failure is session-fatal; expect a fresh connection and Hello
    let second = timeout(Duration::from_secs(5), StubSession::accept(&listener))
        .await
        .expect("no reconnect after unsupported codec");

    // the sink was never opened along the way
    assert!(probe.opened_format().is_none());

    drop(second);
    controller.stop().await;
}
