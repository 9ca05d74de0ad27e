//! Bidirectional channels between an adapter and the core (§4.5).
//!
//! Two implementations are provided: [`InProcessCoreSink`] invokes a stored
//! core handler directly and fans outgoing envelopes out to a set of
//! subscriber callbacks; [`ProcessCoreSink`] (adapter side) and
//! [`ProcessCoreSinkServer`] (core side) carry the same traffic across a
//! process boundary over a pair of named POSIX message queues, exactly as
//! the teacher's `PosixMessageQueueTransport` opens and retries against a
//! queue pair, generalized to carry [`QueueFrame`]s instead of benchmark
//! payloads.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::callable::Callable;
use crate::envelope::Envelope;

/// The handler the core side invokes for every envelope a sink receives
/// from its adapter.
pub type CoreHandler = Callable<Envelope, anyhow::Result<()>>;

/// A subscriber notified when the core pushes an outgoing envelope back
/// out through a sink.
pub type OutgoingHandler = Callable<Envelope, ()>;

/// The bidirectional sink protocol: `send`/`send_many` carry adapter→core
/// traffic, `set_outgoing_handler`/`remove_outgoing_handler`/`push_outgoing`
/// carry core→adapter traffic, `close` releases resources.
#[async_trait]
pub trait CoreSink: Send + Sync {
    async fn send(&self, envelope: Envelope) -> anyhow::Result<()>;

    async fn send_many(&self, envelopes: Vec<Envelope>) -> anyhow::Result<()> {
        for envelope in envelopes {
            self.send(envelope).await?;
        }
        Ok(())
    }

    /// Registering `Some(handler)` adds it to the sink's outgoing-handler
    /// set (idempotent: the same handler identity registered twice is a
    /// no-op). Registering `None` is a no-op; use
    /// [`remove_outgoing_handler`](Self::remove_outgoing_handler) to drop a
    /// specific handler.
    async fn set_outgoing_handler(&self, handler: Option<OutgoingHandler>);

    async fn remove_outgoing_handler(&self, handler: &OutgoingHandler);

    async fn push_outgoing(&self, envelope: Envelope);

    async fn close(&self);
}

fn identity(handler: &OutgoingHandler) -> usize {
    handler.ptr_id()
}

#[derive(Default)]
struct OutgoingHandlers(Vec<OutgoingHandler>);

impl OutgoingHandlers {
    fn insert(&mut self, handler: OutgoingHandler) {
        let id = identity(&handler);
        if self.0.iter().any(|existing| identity(existing) == id) {
            return;
        }
        self.0.push(handler);
    }

    fn remove(&mut self, handler: &OutgoingHandler) {
        let id = identity(handler);
        self.0.retain(|existing| identity(existing) != id);
    }

    fn clear(&mut self) {
        self.0.clear();
    }

    fn snapshot(&self) -> Vec<OutgoingHandler> {
        self.0.clone()
    }
}

/// Invokes a stored core handler directly; fans outgoing envelopes out to
/// every subscribed handler. Multiple adapter instances may share one sink
/// and each register their own outgoing handler independently.
pub struct InProcessCoreSink {
    core_handler: CoreHandler,
    outgoing: Mutex<OutgoingHandlers>,
}

impl InProcessCoreSink {
    pub fn new(core_handler: CoreHandler) -> Arc<Self> {
        Arc::new(Self {
            core_handler,
            outgoing: Mutex::new(OutgoingHandlers::default()),
        })
    }
}

#[async_trait]
impl CoreSink for InProcessCoreSink {
    async fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.core_handler.invoke_offloaded(envelope).await
    }

    /// Registering `None` is a no-op, matching the original: clearing the
    /// handler set is [`Self::close`]'s or
    /// [`Self::remove_outgoing_handler`]'s job, not an implicit side effect
    /// of this call.
    async fn set_outgoing_handler(&self, handler: Option<OutgoingHandler>) {
        if let Some(handler) = handler {
            self.outgoing.lock().await.insert(handler);
        }
    }

    async fn remove_outgoing_handler(&self, handler: &OutgoingHandler) {
        self.outgoing.lock().await.remove(handler);
    }

    async fn push_outgoing(&self, envelope: Envelope) {
        let handlers = self.outgoing.lock().await.snapshot();
        if handlers.is_empty() {
            debug!("no outgoing handler registered, dropping envelope");
            return;
        }
        for handler in handlers {
            handler.invoke_offloaded(envelope.clone()).await;
        }
    }

    async fn close(&self) {
        self.outgoing.lock().await.clear();
    }
}

/// Inter-process queue protocol (§6): frames exchanged on the shared pair
/// of POSIX message queues. `payload` is pre-serialized JSON bytes of an
/// [`Envelope`] — the outer frame is bincode-encoded, and bincode cannot
/// deserialize an arbitrary `serde_json::Value` without knowing its shape
/// ahead of time, so the envelope itself travels as an opaque byte string.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum QueueFrame {
    Incoming(Vec<u8>),
    Outgoing(Vec<u8>),
    Control(ControlFrame),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum ControlFrame {
    Stop,
}

fn encode_envelope(envelope: &Envelope) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

fn decode_envelope(bytes: &[u8]) -> anyhow::Result<Envelope> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(target_os = "linux")]
mod mqueue {
    use super::QueueFrame;
    use anyhow::{anyhow, Result};
    use nix::errno::Errno;
    use nix::mqueue::{mq_open, mq_receive, mq_send, mq_unlink, MQ_OFlag, MqAttr, MqdT};
    use nix::sys::stat::Mode;
    use std::os::unix::io::{AsRawFd, FromRawFd};
    use std::time::Duration;

    pub const MAX_MSG_SIZE: usize = 8192;
    const MAX_MSG_COUNT: i64 = 10;
    const MAX_RETRIES: u32 = 100;

    pub fn open(name: &str, create: bool) -> Result<MqdT> {
        let flags = if create {
            MQ_OFlag::O_CREAT | MQ_OFlag::O_RDWR | MQ_OFlag::O_NONBLOCK
        } else {
            MQ_OFlag::O_RDWR | MQ_OFlag::O_NONBLOCK
        };
        let attr = create.then(|| MqAttr::new(0, MAX_MSG_COUNT, MAX_MSG_SIZE as i64, 0));
        mq_open(name, flags, Mode::S_IRUSR | Mode::S_IWUSR, attr.as_ref())
            .map_err(|e| anyhow!("failed to open queue '{name}': {e}"))
    }

    pub fn unlink(name: &str) {
        let _ = mq_unlink(name);
    }

    /// Send `frame` with non-blocking retries and exponential backoff,
    /// mirroring the teacher's queue-full handling.
    pub async fn send_frame(raw_fd: i32, frame: &QueueFrame) -> Result<()> {
        let bytes = bincode::serialize(frame)?;
        let mut delay_ms = 1u64;
        for attempt in 0..MAX_RETRIES {
            let bytes = bytes.clone();
            let result = tokio::task::spawn_blocking(move || {
                let fd = unsafe { MqdT::from_raw_fd(raw_fd) };
                let result = mq_send(&fd, &bytes, 0);
                std::mem::forget(fd);
                result
            })
            .await?;

            match result {
                Ok(()) => return Ok(()),
                Err(Errno::EAGAIN) => {
                    if attempt == MAX_RETRIES - 1 {
                        return Err(anyhow!("send failed after {MAX_RETRIES} attempts: queue full"));
                    }
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms * 2).min(10);
                }
                Err(e) => return Err(anyhow!("failed to send frame: {e}")),
            }
        }
        unreachable!()
    }

    /// Receive a frame with the mirrored non-blocking retry/backoff loop.
    pub async fn receive_frame(raw_fd: i32) -> Result<QueueFrame> {
        let mut delay_ms = 1u64;
        for attempt in 0..MAX_RETRIES {
            let result = tokio::task::spawn_blocking(move || {
                let fd = unsafe { MqdT::from_raw_fd(raw_fd) };
                let mut buffer = vec![0u8; MAX_MSG_SIZE];
                let mut priority = 0u32;
                let result = mq_receive(&fd, &mut buffer, &mut priority);
                std::mem::forget(fd);
                result.map(|n| {
                    buffer.truncate(n);
                    buffer
                })
            })
            .await?;

            match result {
                Ok(buffer) => return Ok(bincode::deserialize(&buffer)?),
                Err(Errno::EAGAIN) => {
                    if attempt == MAX_RETRIES - 1 {
                        return Err(anyhow!("receive failed after {MAX_RETRIES} attempts: queue empty"));
                    }
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms * 2).min(10);
                }
                Err(e) => return Err(anyhow!("failed to receive frame: {e}")),
            }
        }
        unreachable!()
    }

    pub fn raw_fd(mqd: &MqdT) -> i32 {
        mqd.as_raw_fd()
    }
}

#[cfg(target_os = "linux")]
fn queue_names(base: &str) -> (String, String) {
    (format!("/{base}_c2s"), format!("/{base}_s2c"))
}

/// Adapter-side cross-process sink. Opens (or creates) a pair of named
/// POSIX message queues: `{base}_c2s` carries adapter→core traffic,
/// `{base}_s2c` carries core→adapter traffic.
#[cfg(target_os = "linux")]
pub struct ProcessCoreSink {
    base_name: String,
    is_creator: bool,
    send_fd: mqueue::MqdT,
    recv_fd: mqueue::MqdT,
    outgoing: Mutex<Option<OutgoingHandler>>,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

#[cfg(target_os = "linux")]
impl ProcessCoreSink {
    /// `create` should be `true` only when this side is known to start
    /// before its `ProcessCoreSinkServer` counterpart; normally the server
    /// creates the queue pair and the adapter opens what already exists.
    ///
    /// The background listener for core→adapter frames is launched here,
    /// once, rather than lazily from `set_outgoing_handler`: frames that
    /// arrive before a handler is registered are simply dropped with a
    /// debug log, same as the in-process sink's empty-handler-set case.
    pub fn new(base_name: impl Into<String>, create: bool) -> anyhow::Result<Arc<Self>> {
        let base_name = base_name.into();
        let (c2s, s2c) = queue_names(&base_name);
        // Adapter sends on c2s, receives on s2c.
        let send_fd = mqueue::open(&c2s, create)?;
        let recv_fd = mqueue::open(&s2c, create)?;

        let this = Arc::new(Self {
            base_name,
            is_creator: create,
            send_fd,
            recv_fd,
            outgoing: Mutex::new(None),
            listener: std::sync::Mutex::new(None),
        });

        let listener_handle = this.clone();
        let raw_fd = mqueue::raw_fd(&this.recv_fd);
        let handle = tokio::spawn(async move {
            loop {
                let frame = match mqueue::receive_frame(raw_fd).await {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("process sink listener receive failed: {e}");
                        continue;
                    }
                };
                match frame {
                    QueueFrame::Control(ControlFrame::Stop) => break,
                    QueueFrame::Outgoing(bytes) => {
                        let handler = listener_handle.outgoing.lock().await.clone();
                        match handler {
                            Some(handler) => match decode_envelope(&bytes) {
                                Ok(envelope) => handler.invoke_offloaded(envelope).await,
                                Err(e) => error!("failed to decode outgoing envelope: {e}"),
                            },
                            None => debug!("no outgoing handler registered, dropping envelope"),
                        }
                    }
                    QueueFrame::Incoming(_) => {
                        debug!("process sink received unexpected incoming frame, skipping");
                    }
                }
            }
        });
        *this.listener.lock().unwrap() = Some(handle);

        Ok(this)
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl CoreSink for ProcessCoreSink {
    async fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        let bytes = encode_envelope(&envelope)?;
        let raw_fd = mqueue::raw_fd(&self.send_fd);
        mqueue::send_frame(raw_fd, &QueueFrame::Incoming(bytes)).await
    }

    async fn set_outgoing_handler(&self, handler: Option<OutgoingHandler>) {
        *self.outgoing.lock().await = handler;
    }

    async fn remove_outgoing_handler(&self, _handler: &OutgoingHandler) {
        self.outgoing.lock().await.take();
    }

    async fn push_outgoing(&self, _envelope: Envelope) {
        debug!("push_outgoing is a no-op on the adapter side");
    }

    async fn close(&self) {
        // The listener reads `from_core` (s2c); the stop sentinel must
        // travel on that same queue to unblock it, not on `send_fd`.
        let raw_fd = mqueue::raw_fd(&self.recv_fd);
        let _ = mqueue::send_frame(raw_fd, &QueueFrame::Control(ControlFrame::Stop)).await;
        let handle = self.listener.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        if self.is_creator {
            let (c2s, s2c) = queue_names(&self.base_name);
            mqueue::unlink(&c2s);
            mqueue::unlink(&s2c);
        }
    }
}

#[cfg(target_os = "linux")]
impl Drop for ProcessCoreSink {
    fn drop(&mut self) {
        if self.is_creator {
            let (c2s, s2c) = queue_names(&self.base_name);
            mqueue::unlink(&c2s);
            mqueue::unlink(&s2c);
        }
    }
}

/// Core-side cross-process sink. Mirrors [`ProcessCoreSink`]'s queue pair:
/// receives on `{base}_c2s`, sends on `{base}_s2c`.
#[cfg(target_os = "linux")]
pub struct ProcessCoreSinkServer {
    base_name: String,
    is_creator: bool,
    core_handler: CoreHandler,
    send_fd: mqueue::MqdT,
    recv_fd: mqueue::MqdT,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

#[cfg(target_os = "linux")]
impl ProcessCoreSinkServer {
    pub fn new(
        base_name: impl Into<String>,
        create: bool,
        core_handler: CoreHandler,
    ) -> anyhow::Result<Arc<Self>> {
        let base_name = base_name.into();
        let (c2s, s2c) = queue_names(&base_name);
        // Server receives on c2s, sends on s2c.
        let recv_fd = mqueue::open(&c2s, create)?;
        let send_fd = mqueue::open(&s2c, create)?;
        Ok(Arc::new(Self {
            base_name,
            is_creator: create,
            core_handler,
            send_fd,
            recv_fd,
            consumer: Mutex::new(None),
        }))
    }

    /// Launch the consumer task that dispatches adapter→core frames to the
    /// core handler, exiting on the stop sentinel.
    pub async fn start(self: &Arc<Self>) {
        if self.consumer.lock().await.is_some() {
            return;
        }
        let this = self.clone();
        let raw_fd = mqueue::raw_fd(&this.recv_fd);
        let handle = tokio::spawn(async move {
            loop {
                let frame = match mqueue::receive_frame(raw_fd).await {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("process sink server receive failed: {e}");
                        continue;
                    }
                };
                match frame {
                    QueueFrame::Control(ControlFrame::Stop) => break,
                    QueueFrame::Incoming(bytes) => match decode_envelope(&bytes) {
                        Ok(envelope) => {
                            if let Err(e) = this.core_handler.invoke_offloaded(envelope).await {
                                error!("core handler failed: {e:#}");
                            }
                        }
                        Err(e) => error!("failed to decode incoming envelope: {e}"),
                    },
                    QueueFrame::Outgoing(_) => {
                        debug!("process sink server received unexpected outgoing frame, skipping");
                    }
                }
            }
        });
        self.consumer.lock().await.replace(handle);
    }

    pub async fn push_outgoing(&self, envelope: Envelope) -> anyhow::Result<()> {
        let bytes = encode_envelope(&envelope)?;
        let raw_fd = mqueue::raw_fd(&self.send_fd);
        mqueue::send_frame(raw_fd, &QueueFrame::Outgoing(bytes)).await
    }

    pub async fn close(&self) {
        let send_fd = mqueue::raw_fd(&self.send_fd);
        let recv_fd = mqueue::raw_fd(&self.recv_fd);
        let _ = mqueue::send_frame(send_fd, &QueueFrame::Control(ControlFrame::Stop)).await;
        let _ = mqueue::send_frame(recv_fd, &QueueFrame::Control(ControlFrame::Stop)).await;
        if let Some(handle) = self.consumer.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        if self.is_creator {
            let (c2s, s2c) = queue_names(&self.base_name);
            mqueue::unlink(&c2s);
            mqueue::unlink(&s2c);
        }
    }
}

#[cfg(target_os = "linux")]
impl Drop for ProcessCoreSinkServer {
    fn drop(&mut self) {
        if self.is_creator {
            let (c2s, s2c) = queue_names(&self.base_name);
            mqueue::unlink(&c2s);
            mqueue::unlink(&s2c);
        }
    }
}
