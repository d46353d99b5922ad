//! A framed connection with registered command handlers.
//!
//! [`Connection`] owns one bidirectional byte stream. `start` spawns a reader
//! task that decodes frames and dispatches each one to the handler registered
//! for its command (or the default handler). Every handler invocation runs on
//! its own task so a slow handler never stalls the reader; handler *starts*
//! on one connection still follow wire arrival order.
//!
//! Sends are serialized by a mutex around the write half, so concurrent
//! senders can never interleave the bytes of two frames.
//!
//! A connection stops when the peer closes, on the first protocol or I/O
//! error, or when [`Connection::stop`] is called. `running` flips to `false`
//! exactly once; after that no further frames are produced or consumed.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::frame::{Frame, FrameCodec};
use crate::net::Endpoint;

/// Stable identifier for a connection. For accepted TCP streams this is the
/// raw fd at accept time; in-memory test streams use caller-assigned ids.
pub type ConnId = i32;

/// Byte stream a connection can own — a TCP socket in production, an
/// in-memory duplex pipe in tests.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// A registered command handler. Receives the connection (to reply on) and
/// the decoded frame; the payload excludes the command token.
pub type Handler = Arc<dyn Fn(Arc<Connection>, Frame) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<Connection>, Frame) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |conn, frame| Box::pin(f(conn, frame)))
}

/// Tunables carried from configuration.
#[derive(Debug, Clone, Copy)]
pub struct ConnOptions {
    /// Cap on a single frame body. Oversized frames are fatal.
    pub max_frame_size: usize,
    /// Initial read buffer capacity.
    pub read_chunk: usize,
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self {
            max_frame_size: crate::frame::MAX_FRAME_SIZE,
            read_chunk: 4096,
        }
    }
}

#[derive(Default)]
struct HandlerTable {
    by_command: HashMap<String, Handler>,
    default: Option<Handler>,
}

type BoxedStream = Box<dyn Stream>;

pub struct Connection {
    id: ConnId,
    endpoint: Option<Endpoint>,
    writer: Mutex<FramedWrite<WriteHalf<BoxedStream>, FrameCodec>>,
    reader: Mutex<Option<FramedRead<ReadHalf<BoxedStream>, FrameCodec>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    handlers: RwLock<HandlerTable>,
    running: AtomicBool,
    authenticated: AtomicBool,
}

impl Connection {
    /// Wrap an already-connected stream.
    pub fn new(
        stream: impl Stream + 'static,
        id: ConnId,
        endpoint: Option<Endpoint>,
        options: ConnOptions,
    ) -> Arc<Self> {
        let boxed: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);
        let codec = FrameCodec::new(options.max_frame_size);
        Arc::new(Self {
            id,
            endpoint,
            writer: Mutex::new(FramedWrite::new(write_half, codec)),
            reader: Mutex::new(Some(FramedRead::with_capacity(
                read_half,
                codec,
                options.read_chunk,
            ))),
            reader_task: Mutex::new(None),
            handlers: RwLock::new(HandlerTable::default()),
            running: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
        })
    }

    /// Wrap an accepted TCP stream; the connection id is the socket fd and
    /// the endpoint is resolved up front.
    pub fn from_tcp(stream: TcpStream, options: ConnOptions) -> io::Result<Arc<Self>> {
        use std::os::fd::AsRawFd;

        let id = stream.as_raw_fd();
        let endpoint = Endpoint::from_tcp(&stream)?;
        Ok(Self::new(stream, id, Some(endpoint), options))
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn set_authenticated(&self, value: bool) {
        self.authenticated.store(value, Ordering::SeqCst);
    }

    /// Register or replace the handler for a command.
    pub async fn on(&self, command: &str, h: Handler) {
        self.handlers
            .write()
            .await
            .by_command
            .insert(command.to_string(), h);
    }

    /// Set the handler invoked for commands with no registered handler.
    pub async fn set_default_handler(&self, h: Handler) {
        self.handlers.write().await.default = Some(h);
    }

    /// Spawn the reader task. A second call is a no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(frames) = self.reader.lock().await.take() else {
            self.running.store(false, Ordering::SeqCst);
            return;
        };
        let conn = Arc::clone(self);
        let task = tokio::spawn(read_loop(conn, frames));
        *self.reader_task.lock().await = Some(task);
    }

    /// Send one frame. Frame composition and the write are serialized under
    /// the send mutex, so concurrent callers cannot interleave bytes.
    pub async fn send(&self, command: &str, payload: impl Into<Bytes>) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.send(Frame::new(command, payload)).await
    }

    /// Stop the connection: mark not running, cancel the reader, and shut
    /// down the write half. Idempotent, and safe to call from a handler.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame) {
        let handler = {
            let table = self.handlers.read().await;
            table
                .by_command
                .get(&frame.command)
                .cloned()
                .or_else(|| table.default.clone())
        };
        let Some(handler) = handler else {
            debug!(conn_id = self.id, command = %frame.command, "frame with no handler dropped");
            return;
        };
        // Fire-and-forget worker per frame; a panicking handler dies with its
        // task and the reader keeps going.
        let conn = Arc::clone(self);
        tokio::spawn(handler(conn, frame));
    }
}

async fn read_loop(conn: Arc<Connection>, mut frames: FramedRead<ReadHalf<BoxedStream>, FrameCodec>) {
    loop {
        if !conn.is_running() {
            break;
        }
        match frames.next().await {
            Some(Ok(frame)) => conn.dispatch(frame).await,
            Some(Err(e)) => {
                warn!(conn_id = conn.id, error = %e, "connection failed");
                break;
            }
            None => {
                debug!(conn_id = conn.id, "peer closed connection");
                break;
            }
        }
    }
    conn.running.store(false, Ordering::SeqCst);
}
