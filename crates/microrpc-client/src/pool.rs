use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use microrpc_common::protocol::error::{Result, RpcError};
use microrpc_common::transport::{ConnState, Connection, DialOptions};
use microrpc_common::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Connection pool configuration.
///
/// # Fields
///
/// - `size`: connections tracked per address; extra connections are handed
///   out but not retained
/// - `ttl_secs`: age after which an unused connection is closed
/// - `max_streams`: concurrent streams per connection before it is parked
///   on the busy list
/// - `max_idle`: unused connections kept per address
///
/// # Example
///
/// ```rust
/// use microrpc_client::PoolConfig;
///
/// let config = PoolConfig {
///     size: 10,
///     max_streams: 4,
///     ..PoolConfig::default()
/// };
/// assert_eq!(config.ttl().as_secs(), 60);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub size: usize,
    pub ttl_secs: u64,
    pub max_streams: usize,
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 100,
            ttl_secs: 60,
            max_streams: 20,
            max_idle: 50,
        }
    }
}

impl PoolConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_streams == 0 {
            return Err(RpcError::InvalidConfig(
                "pool max_streams must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of one address's pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Tracked connections.
    pub count: usize,
    /// Tracked connections with no stream in flight.
    pub idle: usize,
    pub idle_list: usize,
    pub busy_list: usize,
    /// Streams in flight across tracked connections.
    pub streams: usize,
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// A connection checked out of the [`Pool`].
///
/// Must be handed back with [`Pool::release`] exactly once; `release`
/// consumes it.
#[derive(Debug)]
pub struct PoolConn {
    id: u64,
    address: String,
    created: Instant,
    conn: Arc<Connection>,
}

impl PoolConn {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }
}

const IDLE_HEAD: usize = 0;
const BUSY_HEAD: usize = 1;

#[derive(Debug)]
struct Entry {
    id: u64,
    conn: Arc<Connection>,
    created: Instant,
    streams: usize,
    busy: bool,
}

/// Arena slot. Slots 0 and 1 are the idle and busy list sentinels and
/// never carry an entry.
#[derive(Debug)]
struct Node {
    prev: usize,
    next: usize,
    entry: Option<Entry>,
}

/// Connections to one address, kept on two circular lists (idle and busy)
/// threaded through an index arena.
#[derive(Debug)]
struct StreamsPool {
    nodes: Vec<Node>,
    free: Vec<usize>,
    slots: HashMap<u64, usize>,
    count: usize,
    idle: usize,
}

impl StreamsPool {
    fn new() -> Self {
        Self {
            nodes: vec![
                Node {
                    prev: IDLE_HEAD,
                    next: IDLE_HEAD,
                    entry: None,
                },
                Node {
                    prev: BUSY_HEAD,
                    next: BUSY_HEAD,
                    entry: None,
                },
            ],
            free: Vec::new(),
            slots: HashMap::new(),
            count: 0,
            idle: 0,
        }
    }

    fn link_front(&mut self, head: usize, slot: usize) {
        let first = self.nodes[head].next;
        self.nodes[slot].prev = head;
        self.nodes[slot].next = first;
        self.nodes[first].prev = slot;
        self.nodes[head].next = slot;
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        self.nodes[slot].prev = slot;
        self.nodes[slot].next = slot;
    }

    /// Tracks a new entry at the head of the idle list.
    fn insert(&mut self, entry: Entry) -> usize {
        let id = entry.id;
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot].entry = Some(entry);
                slot
            }
            None => {
                self.nodes.push(Node {
                    prev: 0,
                    next: 0,
                    entry: Some(entry),
                });
                self.nodes.len() - 1
            }
        };
        self.link_front(IDLE_HEAD, slot);
        self.slots.insert(id, slot);
        self.count += 1;
        slot
    }

    /// Untracks and closes the entry in `slot`.
    fn evict(&mut self, slot: usize) {
        self.unlink(slot);
        if let Some(entry) = self.nodes[slot].entry.take() {
            self.slots.remove(&entry.id);
            entry.conn.close();
            tracing::debug!(address = %entry.conn.address(), id = entry.id, "evicted pooled connection");
        }
        self.free.push(slot);
        self.count -= 1;
    }

    fn move_to(&mut self, head: usize, slot: usize) {
        self.unlink(slot);
        self.link_front(head, slot);
        if let Some(entry) = self.nodes[slot].entry.as_mut() {
            entry.busy = head == BUSY_HEAD;
        }
    }

    fn list_len(&self, head: usize) -> usize {
        let mut len = 0;
        let mut cursor = self.nodes[head].next;
        while cursor != head {
            len += 1;
            cursor = self.nodes[cursor].next;
        }
        len
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            count: self.count,
            idle: self.idle,
            idle_list: self.list_len(IDLE_HEAD),
            busy_list: self.list_len(BUSY_HEAD),
            streams: self
                .nodes
                .iter()
                .filter_map(|n| n.entry.as_ref())
                .map(|e| e.streams)
                .sum(),
        }
    }

    fn drain(&mut self) {
        let slots: Vec<usize> = self.slots.values().copied().collect();
        for slot in slots {
            self.evict(slot);
        }
        self.idle = 0;
    }
}

/// Per-address connection pool multiplexing streams over shared
/// connections.
///
/// # Architecture
///
/// - Each address has its own arena with an idle list (connections with
///   spare stream capacity) and a busy list (connections at `max_streams`)
/// - [`get_conn`](Self::get_conn) scans the idle list from the head,
///   evicting broken and expired unused connections on the way
/// - New connections are dialed outside the lock
/// - [`release`](Self::release) gives the stream slot back and decides
///   whether an unused connection stays
///
/// # Thread Safety
///
/// All bookkeeping sits behind one async mutex that is never held across a
/// dial or an RPC.
#[derive(Debug)]
pub struct Pool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
}

#[derive(Debug, Default)]
struct PoolInner {
    pools: HashMap<String, StreamsPool>,
    closed: bool,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns a connection to `address` with a stream slot reserved.
    ///
    /// # Errors
    ///
    /// - the context's error if it is done before or during the dial
    /// - `Unavailable` if dialing fails
    /// - `Unavailable` if the pool was closed
    pub async fn get_conn(
        &self,
        ctx: &Context,
        address: &str,
        options: &DialOptions,
    ) -> Result<PoolConn> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(RpcError::Unavailable("connection pool closed".to_string()));
            }
            let sp = inner
                .pools
                .entry(address.to_string())
                .or_insert_with(StreamsPool::new);
            if let Some(conn) = self.checkout(sp, address) {
                return Ok(conn);
            }
        }

        let dialed = tokio::select! {
            err = ctx.done() => return Err(err),
            dialed = Connection::dial(address, options.clone()) => dialed,
        };
        let conn = Arc::new(dialed.map_err(|e| {
            RpcError::Unavailable(format!("failed to dial {}: {}", address, e))
        })?);
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        let created = Instant::now();

        let mut inner = self.inner.lock().await;
        if inner.closed {
            conn.close();
            return Err(RpcError::Unavailable("connection pool closed".to_string()));
        }
        let sp = inner
            .pools
            .entry(address.to_string())
            .or_insert_with(StreamsPool::new);
        if sp.count < self.config.size {
            sp.insert(Entry {
                id,
                conn: conn.clone(),
                created,
                streams: 1,
                busy: false,
            });
            tracing::debug!(address = %address, id, count = sp.count, "pooled new connection");
        } else {
            tracing::debug!(address = %address, id, "pool full, handing out overflow connection");
        }

        Ok(PoolConn {
            id,
            address: address.to_string(),
            created,
            conn,
        })
    }

    /// Scans the idle list for a usable connection.
    fn checkout(&self, sp: &mut StreamsPool, address: &str) -> Option<PoolConn> {
        let ttl = self.config.ttl();
        let mut cursor = sp.nodes[IDLE_HEAD].next;

        while cursor != IDLE_HEAD {
            let next = sp.nodes[cursor].next;
            let Some(entry) = sp.nodes[cursor].entry.as_ref() else {
                cursor = next;
                continue;
            };
            let unused = entry.streams == 0;

            match entry.conn.state() {
                ConnState::Connecting => {
                    cursor = next;
                    continue;
                }
                ConnState::Shutdown | ConnState::TransientFailure => {
                    if unused {
                        sp.evict(cursor);
                        sp.idle = sp.idle.saturating_sub(1);
                    }
                    cursor = next;
                    continue;
                }
                ConnState::Idle | ConnState::Ready => {}
            }

            if unused && entry.created.elapsed() > ttl {
                sp.evict(cursor);
                sp.idle = sp.idle.saturating_sub(1);
                cursor = next;
                continue;
            }

            if entry.streams >= self.config.max_streams {
                sp.move_to(BUSY_HEAD, cursor);
                cursor = next;
                continue;
            }

            if unused {
                sp.idle = sp.idle.saturating_sub(1);
            }
            let entry = sp.nodes[cursor].entry.as_mut()?;
            entry.streams += 1;
            return Some(PoolConn {
                id: entry.id,
                address: address.to_string(),
                created: entry.created,
                conn: entry.conn.clone(),
            });
        }
        None
    }

    /// Gives back a connection obtained from [`get_conn`](Self::get_conn).
    ///
    /// `err` is the outcome of the work done on it; once the connection has
    /// no stream in flight, an error closes it.
    pub async fn release(&self, conn: PoolConn, err: Option<&RpcError>) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            conn.conn.close();
            return;
        }
        let sp = inner
            .pools
            .entry(conn.address.clone())
            .or_insert_with(StreamsPool::new);

        let slot = match sp.slots.get(&conn.id) {
            Some(&slot) => slot,
            None if sp.count < self.config.size => sp.insert(Entry {
                id: conn.id,
                conn: conn.conn.clone(),
                created: conn.created,
                streams: 1,
                busy: false,
            }),
            None => {
                conn.conn.close();
                return;
            }
        };

        let Some(entry) = sp.nodes[slot].entry.as_mut() else {
            return;
        };
        let was_busy = entry.busy;
        entry.streams = entry.streams.saturating_sub(1);
        let remaining = entry.streams;
        let expired = entry.created.elapsed() > self.config.ttl();

        if was_busy {
            sp.move_to(IDLE_HEAD, slot);
        }
        if remaining > 0 {
            return;
        }

        if err.is_some() || sp.idle >= self.config.max_idle || expired {
            sp.evict(slot);
        } else {
            sp.idle += 1;
        }
    }

    pub async fn stats(&self, address: &str) -> PoolStats {
        self.inner
            .lock()
            .await
            .pools
            .get(address)
            .map(StreamsPool::stats)
            .unwrap_or_default()
    }

    /// Closes every tracked connection. Later checkouts fail.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        for sp in inner.pools.values_mut() {
            sp.drain();
        }
        inner.pools.clear();
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use microrpc_common::transport::{Server, ServerStream};

    async fn echo_server() -> String {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        tokio::spawn(server.serve(|mut stream: ServerStream| async move {
            while let Some(msg) = stream.recv().await? {
                stream.send(msg).await?;
            }
            Ok::<(), RpcError>(())
        }));
        addr
    }

    fn config(size: usize, max_streams: usize) -> PoolConfig {
        PoolConfig {
            size,
            max_streams,
            ..PoolConfig::default()
        }
    }

    fn assert_consistent(stats: PoolStats) {
        assert_eq!(stats.idle_list + stats.busy_list, stats.count);
        assert!(stats.idle <= stats.count);
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let addr = echo_server().await;
        let pool = Pool::new(config(1, 1));
        let ctx = Context::background();
        let opts = DialOptions::default();

        let first = pool.get_conn(&ctx, &addr, &opts).await.unwrap();
        let first_id = first.id();
        pool.release(first, None).await;
        assert_eq!(
            pool.stats(&addr).await,
            PoolStats {
                count: 1,
                idle: 1,
                idle_list: 1,
                busy_list: 0,
                streams: 0
            }
        );

        let second = pool.get_conn(&ctx, &addr, &opts).await.unwrap();
        assert_eq!(second.id(), first_id);
        assert_eq!(pool.stats(&addr).await.idle, 0);
        pool.release(second, None).await;
    }

    #[tokio::test]
    async fn test_saturated_connection_moves_to_busy_and_overflows() {
        let addr = echo_server().await;
        let pool = Pool::new(config(1, 1));
        let ctx = Context::background();
        let opts = DialOptions::default();

        let a = pool.get_conn(&ctx, &addr, &opts).await.unwrap();
        let b = pool.get_conn(&ctx, &addr, &opts).await.unwrap();
        assert_ne!(a.id(), b.id());

        let stats = pool.stats(&addr).await;
        assert_eq!(stats.count, 1);
        assert_eq!(stats.busy_list, 1);
        assert_eq!(stats.idle_list, 0);
        assert_consistent(stats);

        let overflow = b.connection().clone();
        pool.release(b, None).await;
        assert_eq!(overflow.state(), ConnState::Shutdown);

        pool.release(a, None).await;
        let stats = pool.stats(&addr).await;
        assert_eq!(stats.busy_list, 0);
        assert_eq!(stats.idle_list, 1);
        assert_eq!(stats.idle, 1);
        assert_consistent(stats);
    }

    #[tokio::test]
    async fn test_streams_share_one_connection() {
        let addr = echo_server().await;
        let pool = Pool::new(config(4, 3));
        let ctx = Context::background();
        let opts = DialOptions::default();

        let mut conns = Vec::new();
        for _ in 0..3 {
            conns.push(pool.get_conn(&ctx, &addr, &opts).await.unwrap());
        }
        assert!(conns.iter().all(|c| c.id() == conns[0].id()));
        assert_eq!(pool.stats(&addr).await.streams, 3);

        for conn in conns {
            pool.release(conn, None).await;
        }
        let stats = pool.stats(&addr).await;
        assert_eq!(stats.streams, 0);
        assert_eq!(stats.idle, 1);
        assert_consistent(stats);
    }

    #[tokio::test]
    async fn test_release_with_error_closes_unused_connection() {
        let addr = echo_server().await;
        let pool = Pool::new(config(2, 2));
        let ctx = Context::background();

        let conn = pool.get_conn(&ctx, &addr, &DialOptions::default()).await.unwrap();
        let raw = conn.connection().clone();
        pool.release(conn, Some(&RpcError::Transport("boom".to_string()))).await;

        assert_eq!(raw.state(), ConnState::Shutdown);
        assert_eq!(pool.stats(&addr).await.count, 0);
    }

    #[tokio::test]
    async fn test_max_idle_bound() {
        let addr = echo_server().await;
        let pool = Pool::new(PoolConfig {
            size: 10,
            max_streams: 1,
            max_idle: 1,
            ..PoolConfig::default()
        });
        let ctx = Context::background();
        let opts = DialOptions::default();

        let a = pool.get_conn(&ctx, &addr, &opts).await.unwrap();
        let b = pool.get_conn(&ctx, &addr, &opts).await.unwrap();
        assert_eq!(pool.stats(&addr).await.count, 2);

        pool.release(a, None).await;
        pool.release(b, None).await;

        let stats = pool.stats(&addr).await;
        assert_eq!(stats.count, 1);
        assert_eq!(stats.idle, 1);
        assert_consistent(stats);
    }

    #[tokio::test]
    async fn test_expired_connection_closed_on_release() {
        let addr = echo_server().await;
        let pool = Pool::new(PoolConfig {
            ttl_secs: 0,
            ..PoolConfig::default()
        });
        let ctx = Context::background();

        let conn = pool.get_conn(&ctx, &addr, &DialOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.release(conn, None).await;
        assert_eq!(pool.stats(&addr).await.count, 0);
    }

    #[tokio::test]
    async fn test_broken_idle_connection_is_evicted() {
        let addr = echo_server().await;
        let pool = Pool::new(config(2, 2));
        let ctx = Context::background();
        let opts = DialOptions::default();

        let conn = pool.get_conn(&ctx, &addr, &opts).await.unwrap();
        let first_id = conn.id();
        let raw = conn.connection().clone();
        pool.release(conn, None).await;
        raw.close();

        let fresh = pool.get_conn(&ctx, &addr, &opts).await.unwrap();
        assert_ne!(fresh.id(), first_id);
        let stats = pool.stats(&addr).await;
        assert_eq!(stats.count, 1);
        assert_eq!(stats.idle, 0);
        pool.release(fresh, None).await;
    }

    #[tokio::test]
    async fn test_dial_failure_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let pool = Pool::default();
        let result = pool
            .get_conn(&Context::background(), &addr, &DialOptions::default())
            .await;
        assert!(matches!(result, Err(RpcError::Unavailable(_))));
        assert_eq!(pool.stats(&addr).await.count, 0);
    }

    #[tokio::test]
    async fn test_canceled_context_skips_dial() {
        let pool = Pool::default();
        let ctx = Context::background();
        ctx.cancel();

        let result = pool.get_conn(&ctx, "127.0.0.1:1", &DialOptions::default()).await;
        assert!(matches!(result, Err(RpcError::Canceled(_))));
    }

    #[tokio::test]
    async fn test_close_shuts_everything() {
        let addr = echo_server().await;
        let pool = Pool::default();
        let ctx = Context::background();
        let opts = DialOptions::default();

        let conn = pool.get_conn(&ctx, &addr, &opts).await.unwrap();
        let raw = conn.connection().clone();
        pool.release(conn, None).await;

        pool.close().await;
        assert_eq!(raw.state(), ConnState::Shutdown);
        assert!(matches!(
            pool.get_conn(&ctx, &addr, &opts).await,
            Err(RpcError::Unavailable(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        assert!(PoolConfig::default().validate().is_ok());
        assert!(config(1, 0).validate().is_err());
    }
}
