use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::error::{Result, RpcError};
use crate::protocol::{Frame, Metadata, StreamId};
use crate::transport::tcp;

const OUTBOUND_QUEUE: usize = 1024;

/// Async TCP server speaking the multiplexed frame protocol.
///
/// Every stream opened by a client is handed to the handler as a
/// [`ServerStream`] on its own task. When the handler returns, the stream is
/// closed with the handler's status (`Err` becomes a remote error on the
/// client).
pub struct Server {
    listener: TcpListener,
}

impl Server {
    /// Creates a new server bound to the specified address.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "0.0.0.0:9000")
    pub async fn bind(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(Self { listener })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RpcError::Connection(format!("Failed to get local addr: {}", e)))
    }

    /// Runs the server until the process exits.
    pub async fn serve<F, Fut>(self, handler: F) -> Result<()>
    where
        F: Fn(ServerStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.serve_with_shutdown(handler, CancellationToken::new()).await
    }

    /// Runs the server until `shutdown` is cancelled. Cancelling also closes
    /// every accepted connection.
    pub async fn serve_with_shutdown<F, Fut>(
        self,
        handler: F,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        F: Fn(ServerStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer_addr) = accepted
                .map_err(|e| RpcError::Connection(format!("Failed to accept connection: {}", e)))?;

            tracing::debug!(peer = %peer_addr, "connection established");

            let handler = handler.clone();
            let token = shutdown.child_token();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handler, token).await {
                    tracing::debug!(peer = %peer_addr, error = %e, "connection error");
                }
            });
        }
    }
}

/// Handle a single TCP connection, dispatching each opened stream.
async fn handle_connection<F, Fut>(
    stream: TcpStream,
    handler: Arc<F>,
    token: CancellationToken,
) -> Result<()>
where
    F: Fn(ServerStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (mut reader, writer) = stream.into_split();
    let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);
    let writer_task = tokio::spawn(write_loop(writer, rx, token.clone()));
    let mut streams: HashMap<StreamId, mpsc::UnboundedSender<Vec<u8>>> = HashMap::new();

    let result = loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break Ok(()),
            frame = tcp::read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(Some(Frame::Open {
                stream_id,
                method,
                headers,
            })) => {
                let (tx, inbound) = mpsc::unbounded_channel();
                streams.insert(stream_id, tx);
                let server_stream = ServerStream {
                    stream_id,
                    method,
                    headers,
                    inbound,
                    outbound: outbound.clone(),
                };
                let handler = handler.clone();
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let error = handler(server_stream).await.err().map(|e| e.to_string());
                    let _ = outbound.send(Frame::Close { stream_id, error }).await;
                });
            }
            Ok(Some(Frame::Message { stream_id, payload })) => {
                if let Some(tx) = streams.get(&stream_id) {
                    let _ = tx.send(payload);
                }
            }
            Ok(Some(Frame::Close { stream_id, .. })) => {
                // Dropping the sender ends the handler's input.
                streams.remove(&stream_id);
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    token.cancel();
    let _ = writer_task.await;
    result
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<Frame>, token: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = tcp::write_frame(&mut writer, &frame).await {
            tracing::debug!(error = %e, "failed to write frame");
            token.cancel();
            break;
        }
    }
}

/// Server side of one stream.
#[derive(Debug)]
pub struct ServerStream {
    stream_id: StreamId,
    method: String,
    headers: Metadata,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::Sender<Frame>,
}

impl ServerStream {
    pub fn id(&self) -> StreamId {
        self.stream_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn headers(&self) -> &Metadata {
        &self.headers
    }

    /// Next payload from the client; `None` once the client half-closed.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.inbound.recv().await)
    }

    pub async fn send(&self, payload: Vec<u8>) -> Result<()> {
        self.outbound
            .send(Frame::Message {
                stream_id: self.stream_id,
                payload,
            })
            .await
            .map_err(|_| RpcError::Connection("connection closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::connection::{Connection, DialOptions};

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_invalid_address_fails() {
        assert!(Server::bind("not-an-address").await.is_err());
    }

    #[tokio::test]
    async fn test_handler_sees_method_and_headers() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        tokio::spawn(server.serve(|mut stream: ServerStream| async move {
            let _ = stream.recv().await?;
            let reply = format!(
                "{}:{}",
                stream.method(),
                stream.headers().get("x-rpc-service").unwrap_or("-")
            );
            stream.send(reply.into_bytes()).await
        }));

        let conn = Connection::dial(&addr, DialOptions::default()).await.unwrap();
        let mut headers = Metadata::new();
        headers.insert("x-rpc-service", "users");
        let reply = conn.unary("Users.Get", headers, b"{}".to_vec()).await.unwrap();
        assert_eq!(reply, b"Users.Get:users");
    }

    #[tokio::test]
    async fn test_server_streaming_replies() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        tokio::spawn(server.serve(|mut stream: ServerStream| async move {
            if let Some(first) = stream.recv().await? {
                for _ in 0..3 {
                    stream.send(first.clone()).await?;
                }
            }
            Ok::<(), RpcError>(())
        }));

        let conn = Connection::dial(&addr, DialOptions::default()).await.unwrap();
        let mut stream = conn.open_stream("Ticks", Metadata::new()).await.unwrap();
        stream.send(b"t".to_vec()).await.unwrap();

        let mut received = 0;
        while let Some(msg) = stream.recv().await.unwrap() {
            assert_eq!(msg, b"t");
            received += 1;
        }
        assert_eq!(received, 3);
    }
}
