// ABOUTME: Session controller
// ABOUTME: Handshake, time-sync bursts, codec install and reconnect loop

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::audio::decode::{create_decoder, Decoder};
use crate::audio::output::AudioSink;
use crate::audio::stream::Stream;
use crate::audio::{PcmChunk, SampleFormat};
use crate::error::{Error, Result};
use crate::player::{Player, VolumeCurve};
use crate::protocol::client::{ClientConnection, MessageReceiver};
use crate::protocol::messages::{
    BaseMessage, CodecHeader, Hello, MessageType, ServerSettings, StreamTags, Time, TypedMessage,
    WireChunk,
};
use crate::sync::TimeProvider;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const BURST_REQUESTS: usize = 50;
const BURST_SPACING: Duration = Duration::from_micros(100);
const PERIODIC_SYNC: Duration = Duration::from_secs(5);
const OPPORTUNISTIC_SYNC: Duration = Duration::from_secs(1);

const FALLBACK_MAC: &str = "00:00:00:00:00:00";

/// Builds a fresh sink whenever the server installs a codec.
pub type SinkBuilder = Box<dyn Fn(&SampleFormat) -> Result<Box<dyn AudioSink>> + Send + Sync>;

/// Optional receiver for `StreamTags` payloads.
pub trait MetadataSink: Send + Sync {
    fn push(&self, tags: &serde_json::Value);
}

/// Endpoint configuration, normally filled from the command line.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Stable identity reported to the server; defaults to the MAC address.
    pub host_id: Option<String>,
    /// Distinguishes several client processes on one host.
    pub instance: u32,
    pub mac: Option<String>,
    /// Local output latency compensation in milliseconds.
    pub latency_ms: i32,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ClientConfig {
            host: host.into(),
            port,
            host_id: None,
            instance: 1,
            mac: None,
            latency_ms: 0,
        }
    }
}

/// Observable lifecycle states of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Disconnected = 0,
    Connecting = 1,
    Hello = 2,
    TimeSync = 3,
    Running = 4,
}

impl State {
    fn from_u8(raw: u8) -> State {
        match raw {
            1 => State::Connecting,
            2 => State::Hello,
            3 => State::TimeSync,
            4 => State::Running,
            _ => State::Disconnected,
        }
    }
}

/// Owns one server connection and the playback pipeline built from it.
///
/// `start` spawns a worker that connects, identifies itself, runs the
/// time-sync burst, then idles while the reader task feeds settings, codec
/// headers and audio through [`MessageReceiver`]. Any session error tears
/// everything down and reconnects after a short backoff, for as long as the
/// controller is active.
pub struct Controller {
    shared: Arc<ControllerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct ControllerShared {
    config: ClientConfig,
    clock: TimeProvider,
    sink_builder: SinkBuilder,
    meta: Option<Arc<dyn MetadataSink>>,
    active: AtomicBool,
    state: AtomicU8,
    connection: Mutex<Option<Arc<ClientConnection>>>,
    session: Mutex<Option<Session>>,
    settings: Mutex<ServerSettings>,
    /// Errors raised off the worker task: reader task, player thread.
    async_error: Arc<Mutex<Option<Error>>>,
    last_time_sync: Mutex<Option<Instant>>,
}

struct Session {
    decoder: Box<dyn Decoder>,
    stream: Arc<Stream>,
    player: Player,
    format: SampleFormat,
}

impl Controller {
    pub fn new(config: ClientConfig, sink_builder: SinkBuilder) -> Self {
        Self::with_metadata(config, sink_builder, None)
    }

    pub fn with_metadata(
        config: ClientConfig,
        sink_builder: SinkBuilder,
        meta: Option<Arc<dyn MetadataSink>>,
    ) -> Self {
        Controller {
            shared: Arc::new(ControllerShared {
                config,
                clock: TimeProvider::new(),
                sink_builder,
                meta,
                active: AtomicBool::new(false),
                state: AtomicU8::new(State::Disconnected as u8),
                connection: Mutex::new(None),
                session: Mutex::new(None),
                settings: Mutex::new(ServerSettings::default()),
                async_error: Arc::new(Mutex::new(None)),
                last_time_sync: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Handle to the shared server-clock estimate.
    pub fn clock(&self) -> TimeProvider {
        self.shared.clock.clone()
    }

    pub fn state(&self) -> State {
        State::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Spawn the worker task. Must be called on a tokio runtime.
    pub fn start(&self) {
        if self.shared.active.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *self.worker.lock() = Some(tokio::spawn(worker(shared)));
    }

    /// Stop the worker, the connection and the playback pipeline.
    pub async fn stop(&self) {
        self.shared.active.store(false, Ordering::Release);
        let connection = self.shared.connection.lock().clone();
        if let Some(connection) = connection {
            connection.stop().await;
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.shared.teardown_session();
        self.shared.set_state(State::Disconnected);
    }
}

impl ControllerShared {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn check_async_error(&self) -> Result<()> {
        match self.async_error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn teardown_session(&self) {
        let session = self.session.lock().take();
        if let Some(mut session) = session {
            session.player.stop();
            session.stream.clear();
        }
    }

    fn buffer_len_ms(&self, settings: &ServerSettings) -> i64 {
        (settings.buffer_ms as i64 - settings.latency as i64 - self.config.latency_ms as i64)
            .max(0)
    }

    fn apply_time_reply(&self, header: &BaseMessage, reply: &Time) {
        let c2s = reply.latency.to_micros();
        let s2c = header.received.to_micros() - header.sent.to_micros();
        self.clock.update(c2s, s2c);
    }

    /// True at most once per `interval`; both sync paths share the stamp.
    fn should_sync(&self, interval: Duration) -> bool {
        let mut last = self.last_time_sync.lock();
        match *last {
            Some(at) if at.elapsed() < interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    fn mark_time_sync(&self) {
        *self.last_time_sync.lock() = Some(Instant::now());
    }

    /// Fire-and-forget `Time` probe, throttled; the reply comes back through
    /// `on_message`.
    fn opportunistic_time_sync(&self) {
        if !self.should_sync(OPPORTUNISTIC_SYNC) {
            return;
        }
        let connection = self.connection.lock().clone();
        if let Some(connection) = connection {
            tokio::spawn(async move {
                if let Err(e) = connection.send(&Time::default()).await {
                    log::debug!("time sync send failed: {e}");
                }
            });
        }
    }

    fn handle_time(&self, header: &BaseMessage, body: &[u8]) {
        match Time::decode_body(body) {
            Ok(reply) => self.apply_time_reply(header, &reply),
            Err(e) => log::warn!("bad time reply: {e}"),
        }
    }

    fn handle_settings(&self, body: &[u8]) {
        let settings = match ServerSettings::decode_body(body) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("bad server settings: {e}");
                return;
            }
        };
        log::info!(
            "server settings: buffer {} ms, latency {} ms, volume {}%, muted {}",
            settings.buffer_ms,
            settings.latency,
            settings.volume,
            settings.muted
        );
        *self.settings.lock() = settings;
        let session = self.session.lock();
        if let Some(session) = session.as_ref() {
            session.player.set_volume(settings.volume as f64 / 100.0);
            session.player.set_mute(settings.muted);
            session.stream.set_buffer_len(self.buffer_len_ms(&settings));
        }
    }

    fn handle_codec_header(&self, body: &[u8]) {
        let header = match CodecHeader::decode_body(body) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("bad codec header: {e}");
                return;
            }
        };
        log::info!("codec: {}", header.codec);
        if let Err(err) = self.install_codec(&header) {
            // session-fatal; the worker picks it up and reconnects
            log::error!("codec setup failed: {err}");
            *self.async_error.lock() = Some(err);
        }
    }

    fn install_codec(&self, header: &CodecHeader) -> Result<()> {
        self.teardown_session();

        let mut decoder = create_decoder(&header.codec)?;
        let format = decoder.set_header(header)?;
        log::info!(
            "sample format: {}:{}:{}",
            format.rate,
            format.bits,
            format.channels
        );

        let settings = *self.settings.lock();
        let stream = Arc::new(Stream::new(
            format,
            self.clock.clone(),
            self.buffer_len_ms(&settings),
        ));
        let sink = (self.sink_builder)(&format)?;

        let mut player = Player::new(Arc::clone(&stream), VolumeCurve::default());
        player.set_volume(settings.volume as f64 / 100.0);
        player.set_mute(settings.muted);
        let error_slot = Arc::clone(&self.async_error);
        player.start(
            sink,
            Box::new(move |err| {
                *error_slot.lock() = Some(err);
            }),
        )?;

        *self.session.lock() = Some(Session {
            decoder,
            stream,
            player,
            format,
        });
        Ok(())
    }

    fn handle_wire_chunk(&self, body: &[u8]) {
        let chunk = match WireChunk::decode_body(body) {
            Ok(chunk) => chunk,
            Err(e) => {
                log::warn!("bad wire chunk: {e}");
                return;
            }
        };
        let mut session = self.session.lock();
        let Some(session) = session.as_mut() else {
            // audio before a codec header; nothing to decode it with
            return;
        };
        let mut pcm = PcmChunk::new(session.format, chunk.timestamp, chunk.payload);
        match session.decoder.decode(&mut pcm) {
            Ok(true) => session.stream.push(pcm),
            Ok(false) => {}
            Err(e) => log::debug!("dropping undecodable chunk: {e}"),
        }
    }

    fn handle_stream_tags(&self, body: &[u8]) {
        match StreamTags::decode_body(body) {
            Ok(tags) => {
                if let Some(meta) = &self.meta {
                    meta.push(&tags.tags);
                }
            }
            Err(e) => log::warn!("bad stream tags: {e}"),
        }
    }
}

impl MessageReceiver for ControllerShared {
    fn on_message(&self, header: &BaseMessage, body: &[u8]) {
        match header.kind() {
            Some(MessageType::WireChunk) => self.handle_wire_chunk(body),
            Some(MessageType::Time) => self.handle_time(header, body),
            Some(MessageType::ServerSettings) => self.handle_settings(body),
            Some(MessageType::CodecHeader) => self.handle_codec_header(body),
            Some(MessageType::StreamTags) => self.handle_stream_tags(body),
            Some(MessageType::Base) | Some(MessageType::Hello) => {
                log::debug!("ignoring unexpected message type {}", header.msg_type);
            }
            None => log::debug!("ignoring unknown message type {}", header.msg_type),
        }
        if header.kind() != Some(MessageType::Time) {
            self.opportunistic_time_sync();
        }
    }

    fn on_exception(&self, error: Error) {
        log::error!("connection error: {error}");
        *self.async_error.lock() = Some(error);
    }
}

async fn worker(shared: Arc<ControllerShared>) {
    while shared.is_active() {
        shared.clock.reset();
        *shared.async_error.lock() = None;
        shared.set_state(State::Connecting);

        let connection = Arc::new(ClientConnection::new(
            shared.config.host.clone(),
            shared.config.port,
        ));
        *shared.connection.lock() = Some(Arc::clone(&connection));

        if let Err(err) = run_session(&shared, &connection).await {
            log::error!("session ended: {err}");
        }

        connection.stop().await;
        *shared.connection.lock() = None;
        shared.teardown_session();
        shared.set_state(State::Disconnected);

        if !shared.is_active() {
            break;
        }
        // sliced so stop() doesn't wait out the whole backoff
        let mut waited = Duration::ZERO;
        while waited < RECONNECT_DELAY && shared.is_active() {
            tokio::time::sleep(Duration::from_millis(100)).await;
            waited += Duration::from_millis(100);
        }
    }
    log::debug!("controller worker stopped");
}

async fn run_session(
    shared: &Arc<ControllerShared>,
    connection: &Arc<ClientConnection>,
) -> Result<()> {
    let receiver: Arc<dyn MessageReceiver> = Arc::clone(shared) as Arc<dyn MessageReceiver>;
    connection.start(receiver).await?;

    shared.set_state(State::Hello);
    let mac = shared
        .config
        .mac
        .clone()
        .unwrap_or_else(|| FALLBACK_MAC.to_string());
    let host_id = shared.config.host_id.clone().unwrap_or_else(|| mac.clone());
    connection
        .send(&Hello::new(&mac, &host_id, shared.config.instance))
        .await?;

    shared.set_state(State::TimeSync);
    for _ in 0..BURST_REQUESTS {
        if !shared.is_active() {
            return Ok(());
        }
        shared.check_async_error()?;
        if let Some((header, reply)) = connection
            .send_typed::<Time, Time>(&Time::default(), REQUEST_TIMEOUT)
            .await?
        {
            shared.apply_time_reply(&header, &reply);
        }
        tokio::time::sleep(BURST_SPACING).await;
    }
    shared.mark_time_sync();
    if let Some(offset) = shared.clock.offset_micros() {
        log::info!("clock offset to server: {:.3} ms", offset as f64 / 1000.0);
    }

    shared.set_state(State::Running);
    loop {
        for _ in 0..10 {
            if !shared.is_active() {
                return Ok(());
            }
            shared.check_async_error()?;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if shared.should_sync(PERIODIC_SYNC) {
            connection.send(&Time::default()).await?;
        }
    }
}
