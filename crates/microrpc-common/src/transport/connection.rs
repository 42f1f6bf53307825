//! Multiplexed client connection.
//!
//! One TCP connection carries many concurrent streams. A writer task drains
//! an outbound frame queue; a reader task routes inbound frames to the
//! stream they belong to. When the socket fails every open stream is
//! terminated with a connection error and the connection moves to
//! [`ConnState::TransientFailure`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::error::{Result, RpcError};
use crate::protocol::{Frame, Metadata, StreamId};
use crate::transport::tcp::{self, DEFAULT_CONNECT_TIMEOUT};

/// Default limit for a single payload in either direction (4 MB).
pub const DEFAULT_MAX_MSG_SIZE: usize = 4 * 1024 * 1024;

const OUTBOUND_QUEUE: usize = 1024;

/// Connectivity state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Idle = 0,
    Connecting = 1,
    Ready = 2,
    TransientFailure = 3,
    Shutdown = 4,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Idle,
            1 => ConnState::Connecting,
            2 => ConnState::Ready,
            3 => ConnState::TransientFailure,
            _ => ConnState::Shutdown,
        }
    }
}

/// Options applied when dialing a connection.
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub connect_timeout: Duration,
    pub max_recv_msg_size: usize,
    pub max_send_msg_size: usize,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_recv_msg_size: DEFAULT_MAX_MSG_SIZE,
            max_send_msg_size: DEFAULT_MAX_MSG_SIZE,
        }
    }
}

#[derive(Debug)]
enum Inbound {
    Message(Vec<u8>),
    Close(Option<String>),
    Reset(String),
}

type StreamTable = HashMap<StreamId, mpsc::UnboundedSender<Inbound>>;

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    streams: Mutex<StreamTable>,
}

impl Shared {
    fn streams(&self) -> MutexGuard<'_, StreamTable> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Moves to `TransientFailure` unless already shut down, and terminates
    /// every open stream.
    fn fail(&self, reason: &str) {
        let _ = self.state.compare_exchange(
            ConnState::Ready as u8,
            ConnState::TransientFailure as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        for (_, tx) in self.streams().drain() {
            let _ = tx.send(Inbound::Reset(reason.to_string()));
        }
    }
}

/// A physical connection able to carry concurrent streams.
#[derive(Debug)]
pub struct Connection {
    address: String,
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Frame>,
    next_stream_id: AtomicU64,
    shutdown: CancellationToken,
    options: DialOptions,
}

impl Connection {
    /// Dials `address` and starts the connection's reader and writer tasks.
    pub async fn dial(address: &str, options: DialOptions) -> Result<Self> {
        let stream = tcp::connect(address, options.connect_timeout).await?;
        let (reader, writer) = stream.into_split();
        tracing::debug!(address = %address, "dialed connection");
        Ok(Self::from_parts(address.to_string(), reader, writer, options))
    }

    fn from_parts<R, W>(address: String, reader: R, writer: W, options: DialOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(ConnState::Connecting as u8),
            streams: Mutex::new(HashMap::new()),
        });
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let shutdown = CancellationToken::new();

        tokio::spawn(write_loop(writer, rx, shared.clone(), shutdown.clone()));
        tokio::spawn(read_loop(reader, shared.clone(), shutdown.clone()));
        shared.set_state(ConnState::Ready);

        Self {
            address,
            shared,
            outbound,
            next_stream_id: AtomicU64::new(1),
            shutdown,
            options,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn options(&self) -> &DialOptions {
        &self.options
    }

    /// Number of streams currently open on this connection.
    pub fn open_streams(&self) -> usize {
        self.shared.streams().len()
    }

    /// Opens a new stream for `method`, sending `headers` with the open frame.
    pub async fn open_stream(&self, method: &str, headers: Metadata) -> Result<ClientStream> {
        if self.state() != ConnState::Ready {
            return Err(RpcError::Connection(format!(
                "connection to {} is not ready ({:?})",
                self.address,
                self.state()
            )));
        }

        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.streams().insert(stream_id, tx);

        let open = Frame::Open {
            stream_id,
            method: method.to_string(),
            headers,
        };
        if self.outbound.send(open).await.is_err() {
            self.shared.streams().remove(&stream_id);
            return Err(RpcError::Connection(format!(
                "connection to {} closed",
                self.address
            )));
        }

        Ok(ClientStream {
            stream_id,
            inbound: rx,
            outbound: self.outbound.clone(),
            shared: self.shared.clone(),
            max_send: self.options.max_send_msg_size,
            max_recv: self.options.max_recv_msg_size,
            send_closed: false,
            finished: false,
        })
    }

    /// Issues a single request/response exchange on a fresh stream.
    pub async fn unary(&self, method: &str, headers: Metadata, payload: Vec<u8>) -> Result<Vec<u8>> {
        let mut stream = self.open_stream(method, headers).await?;
        stream.send(payload).await?;
        stream.close_send().await?;

        let response = match stream.recv().await? {
            Some(response) => response,
            None => return Err(RpcError::Internal("empty response".to_string())),
        };
        match stream.recv().await? {
            None => Ok(response),
            Some(_) => Err(RpcError::Transport(
                "unexpected extra message on unary call".to_string(),
            )),
        }
    }

    /// Shuts the connection down; open streams see a connection error.
    pub fn close(&self) {
        self.shared.set_state(ConnState::Shutdown);
        self.shutdown.cancel();
        self.shared.fail("connection shut down");
        tracing::debug!(address = %self.address, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = tcp::write_frame(&mut writer, &frame).await {
            tracing::debug!(error = %e, "connection write failed");
            shared.fail(&e.to_string());
            shutdown.cancel();
            break;
        }
    }
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>, shutdown: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = tcp::read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(Some(Frame::Message { stream_id, payload })) => {
                if let Some(tx) = shared.streams().get(&stream_id) {
                    let _ = tx.send(Inbound::Message(payload));
                }
            }
            Ok(Some(Frame::Close { stream_id, error })) => {
                if let Some(tx) = shared.streams().remove(&stream_id) {
                    let _ = tx.send(Inbound::Close(error));
                }
            }
            Ok(Some(Frame::Open { stream_id, .. })) => {
                tracing::debug!(stream_id, "ignoring server-initiated stream");
            }
            Ok(None) => {
                shared.fail("connection closed by peer");
                shutdown.cancel();
                break;
            }
            Err(e) => {
                tracing::debug!(error = %e, "connection read failed");
                shared.fail(&e.to_string());
                shutdown.cancel();
                break;
            }
        }
    }
}

/// Client side of one stream on a [`Connection`].
#[derive(Debug)]
pub struct ClientStream {
    stream_id: StreamId,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::Sender<Frame>,
    shared: Arc<Shared>,
    max_send: usize,
    max_recv: usize,
    send_closed: bool,
    finished: bool,
}

impl ClientStream {
    pub fn id(&self) -> StreamId {
        self.stream_id
    }

    /// Sends one payload.
    pub async fn send(&mut self, payload: Vec<u8>) -> Result<()> {
        if self.send_closed {
            return Err(RpcError::Transport("send on a closed stream".to_string()));
        }
        if payload.len() > self.max_send {
            return Err(RpcError::MessageTooLarge {
                size: payload.len(),
                max: self.max_send,
            });
        }
        let frame = Frame::Message {
            stream_id: self.stream_id,
            payload,
        };
        self.outbound
            .send(frame)
            .await
            .map_err(|_| RpcError::Connection("connection closed".to_string()))
    }

    /// Half-closes the sending side; the peer sees end of input.
    pub async fn close_send(&mut self) -> Result<()> {
        if self.send_closed {
            return Ok(());
        }
        self.send_closed = true;
        let frame = Frame::Close {
            stream_id: self.stream_id,
            error: None,
        };
        self.outbound
            .send(frame)
            .await
            .map_err(|_| RpcError::Connection("connection closed".to_string()))
    }

    /// Receives the next payload; `Ok(None)` once the peer finished the
    /// stream successfully.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        match self.inbound.recv().await {
            Some(Inbound::Message(payload)) => {
                if payload.len() > self.max_recv {
                    return Err(RpcError::MessageTooLarge {
                        size: payload.len(),
                        max: self.max_recv,
                    });
                }
                Ok(Some(payload))
            }
            Some(Inbound::Close(None)) => {
                self.finished = true;
                Ok(None)
            }
            Some(Inbound::Close(Some(error))) => {
                self.finished = true;
                Err(RpcError::Remote(error))
            }
            Some(Inbound::Reset(reason)) => {
                self.finished = true;
                Err(RpcError::Connection(reason))
            }
            None => {
                self.finished = true;
                Err(RpcError::Connection("connection closed".to_string()))
            }
        }
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        self.shared.streams().remove(&self.stream_id);
        if !self.send_closed {
            let _ = self.outbound.try_send(Frame::Close {
                stream_id: self.stream_id,
                error: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::server::{Server, ServerStream};

    async fn echo_server() -> (String, CancellationToken) {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            server
                .serve_with_shutdown(
                    |mut stream: ServerStream| async move {
                        if stream.method() == "Fail" {
                            return Err(RpcError::Internal("handler failed".to_string()));
                        }
                        while let Some(msg) = stream.recv().await? {
                            stream.send(msg).await?;
                        }
                        Ok(())
                    },
                    token,
                )
                .await
        });
        (addr, shutdown)
    }

    #[tokio::test]
    async fn test_unary_echo() {
        let (addr, _shutdown) = echo_server().await;
        let conn = Connection::dial(&addr, DialOptions::default()).await.unwrap();
        assert_eq!(conn.state(), ConnState::Ready);

        let reply = conn
            .unary("Echo", Metadata::new(), b"ping".to_vec())
            .await
            .unwrap();
        assert_eq!(reply, b"ping");
    }

    #[tokio::test]
    async fn test_concurrent_streams_share_connection() {
        let (addr, _shutdown) = echo_server().await;
        let conn = Arc::new(Connection::dial(&addr, DialOptions::default()).await.unwrap());

        let handles: Vec<_> = (0..10u8)
            .map(|i| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.unary("Echo", Metadata::new(), vec![i]).await })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), vec![i as u8]);
        }
        assert_eq!(conn.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_is_propagated() {
        let (addr, _shutdown) = echo_server().await;
        let conn = Connection::dial(&addr, DialOptions::default()).await.unwrap();

        let err = conn
            .unary("Fail", Metadata::new(), b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote(msg) if msg.contains("handler failed")));
    }

    #[tokio::test]
    async fn test_send_limit_enforced() {
        let (addr, _shutdown) = echo_server().await;
        let options = DialOptions {
            max_send_msg_size: 4,
            ..DialOptions::default()
        };
        let conn = Connection::dial(&addr, options).await.unwrap();

        let err = conn
            .unary("Echo", Metadata::new(), vec![0u8; 16])
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::MessageTooLarge { size: 16, max: 4 }));
    }

    #[tokio::test]
    async fn test_close_moves_to_shutdown() {
        let (addr, _shutdown) = echo_server().await;
        let conn = Connection::dial(&addr, DialOptions::default()).await.unwrap();
        conn.close();
        assert_eq!(conn.state(), ConnState::Shutdown);
        assert!(conn.open_stream("Echo", Metadata::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_peer_shutdown_marks_transient_failure() {
        let (addr, shutdown) = echo_server().await;
        let conn = Connection::dial(&addr, DialOptions::default()).await.unwrap();
        conn.unary("Echo", Metadata::new(), b"a".to_vec()).await.unwrap();

        shutdown.cancel();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while conn.state() == ConnState::Ready && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(conn.state(), ConnState::TransientFailure);
    }
}
