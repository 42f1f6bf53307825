use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use microrpc_common::protocol::{
    Metadata, Result, RpcError, CONTENT_TYPE, FROM_SERVICE_HEADER, SERVICE_HEADER,
};
use microrpc_common::transport::{ClientStream, Codec, DialOptions};
use microrpc_common::Context;
use microrpc_resolver::{LookupOptions, Next, Resolver, Selector};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinError;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::options::CallOptions;
use crate::pool::{Pool, PoolConn};
use crate::stream::Stream;

/// RPC client: resolves a service, picks an address, and runs the call
/// over a pooled connection with retries.
///
/// The client owns its resolver and pool; share it behind an `Arc`.
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    defaults: CallOptions,
    resolver: RwLock<Arc<Resolver>>,
    selector: Selector,
    pool: Arc<Pool>,
}

/// Everything an attempt needs, fixed before the retry loop starts.
struct Prepared {
    ctx: Context,
    headers: Metadata,
    codec: Codec,
    payload: Vec<u8>,
    next: Next,
    dial: DialOptions,
    backoff: Backoff,
    retry_budget: Duration,
}

impl Client {
    /// Creates a client around an already built resolver.
    pub fn new(config: ClientConfig, resolver: Resolver) -> Result<Self> {
        config.validate()?;
        let defaults = config.call_defaults();
        Ok(Self {
            selector: Selector::new(config.selector),
            pool: Arc::new(Pool::new(config.pool.clone())),
            resolver: RwLock::new(Arc::new(resolver)),
            defaults,
            config,
        })
    }

    /// Creates a client and the resolver described by its config.
    pub async fn from_config(config: ClientConfig) -> Result<Self> {
        let resolver = Resolver::from_config(&config.resolver, Vec::new()).await?;
        Self::new(config, resolver)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn resolver(&self) -> Arc<Resolver> {
        self.resolver.read().await.clone()
    }

    /// Swaps the resolver. The previous one is closed.
    pub async fn set_resolver(&self, resolver: Resolver) {
        let previous = std::mem::replace(&mut *self.resolver.write().await, Arc::new(resolver));
        previous.close();
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Checks out a raw pooled connection to `service`. Hand it back with
    /// [`Client::release`].
    pub async fn conn(&self, ctx: &Context, service: &str) -> Result<PoolConn> {
        let next = self.select(service).await?;
        self.pool
            .get_conn(ctx, &next.next(), &self.config.dial_options())
            .await
    }

    pub async fn release(&self, conn: PoolConn, err: Option<&RpcError>) {
        self.pool.release(conn, err).await;
    }

    /// Unary call of `method` on `service`.
    ///
    /// # Errors
    ///
    /// - `Internal` if `body` serializes to nothing or the response is empty
    /// - `Unavailable` if the service cannot be resolved
    /// - `Canceled` once the context is cancelled or its deadline passes
    /// - the last attempt's error when the retry budget is spent
    pub async fn call<Req, Resp>(
        &self,
        ctx: &Context,
        service: &str,
        method: &str,
        body: &Req,
        opts: CallOptions,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let prepared = self.prepare(ctx, service, body, opts).await?;
        let address = prepared.next.next();
        debug!(service = %service, method = %method, address = %address, "call");

        let response = retry(
            &prepared.ctx,
            &prepared.backoff,
            prepared.retry_budget,
            || {
                self.invoke(
                    &prepared.ctx,
                    &address,
                    method,
                    prepared.headers.clone(),
                    prepared.payload.clone(),
                    &prepared.dial,
                )
            },
        )
        .await?;

        prepared.codec.unmarshal(&response)
    }

    /// Opens a stream to `method` on `service`, sending `body` as the first
    /// message.
    pub async fn stream<Req>(
        &self,
        ctx: &Context,
        service: &str,
        method: &str,
        body: &Req,
        opts: CallOptions,
    ) -> Result<Stream>
    where
        Req: Serialize,
    {
        let prepared = self.prepare(ctx, service, body, opts).await?;
        let address = prepared.next.next();
        debug!(service = %service, method = %method, address = %address, "stream");

        let (stream, conn) = retry(
            &prepared.ctx,
            &prepared.backoff,
            prepared.retry_budget,
            || {
                self.invoke_stream(
                    &prepared.ctx,
                    &address,
                    method,
                    prepared.headers.clone(),
                    prepared.payload.clone(),
                    &prepared.dial,
                )
            },
        )
        .await?;

        Ok(Stream::new(
            prepared.ctx,
            prepared.headers,
            prepared.codec,
            self.pool.clone(),
            stream,
            conn,
        ))
    }

    /// Closes the pool and stops resolver background work.
    pub async fn close(&self) {
        self.pool.close().await;
        self.resolver.read().await.close();
    }

    async fn prepare<Req: Serialize>(
        &self,
        ctx: &Context,
        service: &str,
        body: &Req,
        opts: CallOptions,
    ) -> Result<Prepared> {
        if serde_json::to_value(body)?.is_null() {
            return Err(RpcError::Internal("request body is nil".to_string()));
        }

        let opts = self.defaults.merge(opts);
        let ctx = match opts.request_timeout {
            Some(timeout) if !timeout.is_zero() => ctx.with_timeout(timeout),
            _ => ctx.with_cancel(),
        };

        let headers = self.headers(&ctx, service, &opts)?;
        let codec = match headers.get(CONTENT_TYPE) {
            Some(content_type) => Codec::from_content_type(content_type)?,
            None => Codec::default(),
        };
        let payload = codec.marshal(body)?;

        let next = self.select(service).await?;

        let mut dial = self.config.dial_options();
        if let Some(size) = opts.max_recv_msg_size {
            dial.max_recv_msg_size = size;
        }
        if let Some(size) = opts.max_send_msg_size {
            dial.max_send_msg_size = size;
        }

        let backoff = opts.backoff.unwrap_or_default();
        backoff.reset();

        Ok(Prepared {
            ctx,
            headers,
            codec,
            payload,
            next,
            dial,
            backoff,
            retry_budget: opts.retry_budget.unwrap_or_default(),
        })
    }

    /// Request metadata: context metadata, then explicit headers, then the
    /// headers this client always sets.
    fn headers(&self, ctx: &Context, service: &str, opts: &CallOptions) -> Result<Metadata> {
        let mut headers = ctx.metadata().clone();
        headers.merge(&opts.headers);
        headers.insert(SERVICE_HEADER, service);
        if let Some(subtype) = &opts.content_subtype {
            headers.insert_default(CONTENT_TYPE, Codec::from_subtype(subtype)?.content_type());
        }
        headers.insert_default(CONTENT_TYPE, Codec::default().content_type());
        if let Some(from) = &self.config.service_name {
            headers.insert_default(FROM_SERVICE_HEADER, from.as_str());
        }
        Ok(headers)
    }

    /// Resolves `service` and builds an address picker over its routes.
    async fn select(&self, service: &str) -> Result<Next> {
        let resolver = self.resolver().await;
        let addresses = match resolver.lookup(service, &LookupOptions::default()).await {
            Ok(routes) => routes.into_iter().map(|r| r.address).collect(),
            Err(RpcError::RouteNotFound(_)) => match &self.config.fallback_address {
                Some(fallback) => {
                    debug!(service = %service, address = %fallback, "no route, using fallback address");
                    vec![fallback.clone()]
                }
                None => {
                    return Err(RpcError::Unavailable(format!(
                        "no route for service '{}'",
                        service
                    )))
                }
            },
            Err(e) => {
                return Err(RpcError::Unavailable(format!(
                    "failed to resolve '{}': {}",
                    service, e
                )))
            }
        };
        self.selector.select_for(service, addresses)
    }

    /// One unary attempt. The request runs on its own task so that a done
    /// context returns immediately.
    async fn invoke(
        &self,
        ctx: &Context,
        address: &str,
        method: &str,
        headers: Metadata,
        payload: Vec<u8>,
        dial: &DialOptions,
    ) -> Result<Vec<u8>> {
        let conn = self.pool.get_conn(ctx, address, dial).await?;
        let connection = conn.connection().clone();
        let method = method.to_string();
        let task =
            tokio::spawn(async move { connection.unary(&method, headers, payload).await });

        let result = tokio::select! {
            err = ctx.done() => Err(err),
            joined = task => joined.unwrap_or_else(|e| Err(join_error(e))),
        };
        self.pool.release(conn, result.as_ref().err()).await;
        result
    }

    /// One stream attempt: open the stream and send the first message.
    async fn invoke_stream(
        &self,
        ctx: &Context,
        address: &str,
        method: &str,
        headers: Metadata,
        payload: Vec<u8>,
        dial: &DialOptions,
    ) -> Result<(ClientStream, PoolConn)> {
        let conn = self.pool.get_conn(ctx, address, dial).await?;
        let connection = conn.connection().clone();
        let method = method.to_string();
        let task = tokio::spawn(async move {
            let mut stream = connection.open_stream(&method, headers).await?;
            stream.send(payload).await?;
            Ok::<_, RpcError>(stream)
        });

        let result = tokio::select! {
            err = ctx.done() => Err(err),
            joined = task => joined.unwrap_or_else(|e| Err(join_error(e))),
        };
        match result {
            Ok(stream) => Ok((stream, conn)),
            Err(e) => {
                self.pool.release(conn, Some(&e)).await;
                Err(e)
            }
        }
    }
}

/// Runs `attempt` until it succeeds, the context is done, or the summed
/// backoff delay reaches `budget`. A zero budget means one attempt.
async fn retry<T, F, Fut>(ctx: &Context, backoff: &Backoff, budget: Duration, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut waited = Duration::ZERO;
    loop {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let err = match attempt().await {
            Ok(value) => {
                backoff.reset();
                return Ok(value);
            }
            Err(err) => err,
        };

        let delay = backoff.duration();
        if waited >= budget {
            return Err(err);
        }
        warn!(error = %err, attempt = backoff.attempt(), delay_ms = delay.as_millis() as u64, "attempt failed, retrying");
        waited += delay;

        tokio::select! {
            done = ctx.done() => return Err(done),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn join_error(err: JoinError) -> RpcError {
    RpcError::Internal(format!("call task failed: {}", err))
}
