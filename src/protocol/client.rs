// ABOUTME: TCP client connection for the streaming protocol
// ABOUTME: Reader task, writer mutex and request/response correlation

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::messages::{self, BaseMessage, Tv, TypedMessage, BASE_MESSAGE_SIZE};

/// A session is declared dead once this much unanswered-request time piles up.
const CUMULATIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Request ids wrap within `[1, 9999]`; 0 marks fire-and-forget messages.
const MAX_REQUEST_ID: u16 = 9999;

/// Callbacks for traffic the reader task cannot route to a pending request.
///
/// Both methods are invoked on the reader task; implementations must not
/// block for long or the socket stalls.
pub trait MessageReceiver: Send + Sync {
    fn on_message(&self, header: &BaseMessage, body: &[u8]);

    /// Called once when the reader task terminates on an error. Teardown is
    /// the owner's job; the connection only reports.
    fn on_exception(&self, error: Error);
}

type PendingReply = oneshot::Sender<(BaseMessage, Vec<u8>)>;

/// One TCP session to the server.
///
/// Messages are sent fire-and-forget with [`send`](Self::send) or
/// synchronously with [`send_request`](Self::send_request), which correlates
/// the reply by its `refers_to` header field. Everything else the server
/// pushes lands in the [`MessageReceiver`].
pub struct ClientConnection {
    host: String,
    port: u16,
    inner: Arc<Inner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: Mutex<HashMap<u16, PendingReply>>,
    req_id: Mutex<u16>,
    sum_timeout: Mutex<Duration>,
    active: AtomicBool,
}

impl Inner {
    /// Wake every blocked requester with a closed channel.
    fn fail_pending(&self) {
        self.pending.lock().clear();
    }
}

impl ClientConnection {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ClientConnection {
            host: host.into(),
            port,
            inner: Arc::new(Inner {
                writer: tokio::sync::Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                req_id: Mutex::new(0),
                sum_timeout: Mutex::new(Duration::ZERO),
                active: AtomicBool::new(false),
            }),
            reader: Mutex::new(None),
        }
    }

    /// Connect and spawn the reader task.
    pub async fn start(&self, receiver: Arc<dyn MessageReceiver>) -> Result<()> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| Error::Network(format!("connect {}:{}: {e}", self.host, self.port)))?;
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("set_nodelay failed: {e}");
        }
        match stream.peer_addr() {
            Ok(addr) => log::info!("connected to {addr}"),
            Err(_) => log::info!("connected to {}:{}", self.host, self.port),
        }

        let (read_half, write_half) = stream.into_split();
        *self.inner.writer.lock().await = Some(write_half);
        *self.inner.sum_timeout.lock() = Duration::ZERO;
        self.inner.active.store(true, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(reader_loop(read_half, inner, receiver));
        *self.reader.lock() = Some(handle);
        Ok(())
    }

    /// Shut the socket down and join the reader. Idempotent; blocked
    /// `send_request` callers observe a `Network` error, never a hang.
    pub async fn stop(&self) {
        self.inner.active.store(false, Ordering::Release);
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.inner.fail_pending();
        log::debug!("reader task terminated");
    }

    pub fn active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Send a message without expecting a reply.
    pub async fn send<T: TypedMessage>(&self, msg: &T) -> Result<()> {
        self.send_frame(msg, 0).await
    }

    /// Send a message and wait up to `timeout` for the reply.
    ///
    /// Returns `Ok(None)` on a per-call timeout. Consecutive timeouts
    /// accumulate; the call that pushes the total past 10 s fails with
    /// [`Error::Timeout`]. Any successful reply resets the total.
    pub async fn send_request<T: TypedMessage>(
        &self,
        msg: &T,
        timeout: Duration,
    ) -> Result<Option<(BaseMessage, Vec<u8>)>> {
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);

        if let Err(err) = self.send_frame(msg, id).await {
            self.inner.pending.lock().remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => {
                *self.inner.sum_timeout.lock() = Duration::ZERO;
                Ok(Some(reply))
            }
            Ok(Err(_)) => {
                self.inner.pending.lock().remove(&id);
                Err(Error::Network(
                    "connection closed while waiting for reply".into(),
                ))
            }
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                let total = {
                    let mut sum = self.inner.sum_timeout.lock();
                    *sum += timeout;
                    *sum
                };
                log::warn!("timeout waiting for reply to request {id}, {total:?} accumulated");
                if total > CUMULATIVE_TIMEOUT {
                    Err(Error::Timeout(total))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// [`send_request`](Self::send_request) plus decoding of the reply body.
    pub async fn send_typed<T, R>(
        &self,
        msg: &T,
        timeout: Duration,
    ) -> Result<Option<(BaseMessage, R)>>
    where
        T: TypedMessage,
        R: TypedMessage,
    {
        match self.send_request(msg, timeout).await? {
            Some((header, body)) => {
                let reply = R::decode_body(&body)?;
                Ok(Some((header, reply)))
            }
            None => Ok(None),
        }
    }

    async fn send_frame<T: TypedMessage>(&self, msg: &T, id: u16) -> Result<()> {
        let mut guard = self.inner.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::Network("not connected".into()))?;
        // serialize under the writer lock so the `sent` stamp is taken right
        // before the bytes hit the socket
        let frame = messages::serialize_frame(msg, id, 0)?;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| Error::Network(format!("send failed: {e}")))
    }

    fn next_request_id(&self) -> u16 {
        let mut id = self.inner.req_id.lock();
        *id += 1;
        if *id > MAX_REQUEST_ID {
            *id = 1;
        }
        *id
    }
}

async fn reader_loop(
    mut read: OwnedReadHalf,
    inner: Arc<Inner>,
    receiver: Arc<dyn MessageReceiver>,
) {
    while inner.active.load(Ordering::Acquire) {
        match read_frame(&mut read).await {
            Ok((mut header, body)) => {
                header.received = Tv::now();
                if header.refers_to != 0 {
                    // guard is dropped before signalling the requester
                    let pending = inner.pending.lock().remove(&header.refers_to);
                    if let Some(tx) = pending {
                        let _ = tx.send((header, body));
                        continue;
                    }
                }
                receiver.on_message(&header, &body);
            }
            Err(err) => {
                if inner.active.swap(false, Ordering::AcqRel) {
                    receiver.on_exception(err);
                }
                break;
            }
        }
    }
    inner.fail_pending();
}

async fn read_frame(read: &mut OwnedReadHalf) -> Result<(BaseMessage, Vec<u8>)> {
    let mut header_buf = [0u8; BASE_MESSAGE_SIZE];
    read.read_exact(&mut header_buf).await?;
    let header = BaseMessage::decode(&header_buf)?;
    let mut body = vec![0u8; header.size as usize];
    read.read_exact(&mut body).await?;
    Ok((header, body))
}
