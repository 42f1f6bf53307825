use std::sync::Arc;

use microrpc_common::protocol::{Metadata, Result, RpcError};
use microrpc_common::transport::{ClientStream, Codec};
use microrpc_common::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::pool::{Pool, PoolConn};

/// A bidirectional stream returned by [`Client::stream`](crate::Client::stream).
///
/// Holds a stream slot on a pooled connection until [`Stream::close`] is
/// called. Dropping an unclosed stream releases the slot in the background.
#[derive(Debug)]
pub struct Stream {
    ctx: Context,
    headers: Metadata,
    codec: Codec,
    pool: Arc<Pool>,
    inner: Option<(ClientStream, PoolConn)>,
}

impl Stream {
    pub(crate) fn new(
        ctx: Context,
        headers: Metadata,
        codec: Codec,
        pool: Arc<Pool>,
        stream: ClientStream,
        conn: PoolConn,
    ) -> Self {
        Self {
            ctx,
            headers,
            codec,
            pool,
            inner: Some((stream, conn)),
        }
    }

    /// Headers sent when the stream was opened.
    pub fn headers(&self) -> &Metadata {
        &self.headers
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Address of the peer serving this stream.
    pub fn address(&self) -> Option<&str> {
        self.inner.as_ref().map(|(_, conn)| conn.address())
    }

    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let payload = self.codec.marshal(msg)?;
        let (stream, _) = self.inner.as_mut().ok_or_else(closed)?;
        tokio::select! {
            err = self.ctx.done() => Err(err),
            sent = stream.send(payload) => sent,
        }
    }

    /// Next message from the server, `Ok(None)` once the server finished.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let (stream, _) = self.inner.as_mut().ok_or_else(closed)?;
        let received = tokio::select! {
            err = self.ctx.done() => return Err(err),
            received = stream.recv() => received?,
        };
        match received {
            Some(payload) => Ok(Some(self.codec.unmarshal(&payload)?)),
            None => Ok(None),
        }
    }

    /// Tells the server no more messages will be sent.
    pub async fn close_send(&mut self) -> Result<()> {
        let (stream, _) = self.inner.as_mut().ok_or_else(closed)?;
        stream.close_send().await
    }

    /// Ends the stream and releases its connection. Closing with an error
    /// also cancels the stream's context.
    pub async fn close(mut self, err: Option<&RpcError>) {
        if let Some((stream, conn)) = self.inner.take() {
            drop(stream);
            self.pool.release(conn, err).await;
        }
        if err.is_some() {
            self.ctx.cancel();
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let Some((stream, conn)) = self.inner.take() else {
            return;
        };
        drop(stream);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pool = self.pool.clone();
            handle.spawn(async move {
                pool.release(conn, None).await;
            });
        }
    }
}

fn closed() -> RpcError {
    RpcError::Transport("stream already closed".to_string())
}
