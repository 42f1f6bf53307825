//! End-to-end tests: a [`Client`] calling real servers over loopback TCP
//! through each resolver backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use microrpc::common::protocol::{CONTENT_TYPE, FROM_SERVICE_HEADER, SERVICE_HEADER};
use microrpc::common::transport::{Server, ServerStream};
use microrpc::resolver::{DynamicResolver, FileResolver, MemoryRegistry, WatchConfig};
use microrpc::{
    Backoff, CallOptions, Client, ClientConfig, Context, PoolConfig, PoolStats, ResolverConfig,
    Route, RpcError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tempfile::TempDir;

async fn spawn_server<F, Fut>(handler: F) -> String
where
    F: Fn(ServerStream) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = microrpc::Result<()>> + Send + 'static,
{
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    tokio::spawn(server.serve(handler));
    addr
}

async fn echo(mut stream: ServerStream) -> microrpc::Result<()> {
    while let Some(payload) = stream.recv().await? {
        stream.send(payload).await?;
    }
    Ok(())
}

fn static_config(endpoints: String) -> ClientConfig {
    ClientConfig {
        resolver: ResolverConfig::Static { endpoints },
        ..ClientConfig::default()
    }
}

fn fast_retries(budget: Duration) -> CallOptions {
    CallOptions::default()
        .with_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(5), 2.0))
        .with_retry_budget(budget)
}

// ============================================================================
// Unary calls
// ============================================================================

#[tokio::test]
async fn test_call_through_static_resolver() {
    let addr = spawn_server(echo).await;
    let client = Client::from_config(static_config(format!("users={}", addr)))
        .await
        .unwrap();

    let reply: Value = client
        .call(
            &Context::background(),
            "users",
            "Users.Get",
            &json!({"id": 7}),
            CallOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(reply, json!({"id": 7}));
    client.close().await;
}

#[tokio::test]
async fn test_call_sends_routing_headers() {
    let addr = spawn_server(|mut stream: ServerStream| async move {
        let headers = stream.headers().clone();
        while stream.recv().await?.is_some() {}
        let reply = json!({
            "method": stream.method(),
            "service": headers.get(SERVICE_HEADER),
            "from": headers.get(FROM_SERVICE_HEADER),
            "content_type": headers.get(CONTENT_TYPE),
            "trace": headers.get("x-trace"),
        });
        stream.send(serde_json::to_vec(&reply).unwrap()).await
    })
    .await;

    let config = ClientConfig {
        service_name: Some("frontend".to_string()),
        ..static_config(format!("users={}", addr))
    };
    let client = Client::from_config(config).await.unwrap();

    let reply: Value = client
        .call(
            &Context::background(),
            "users",
            "Users.Get",
            &json!({}),
            CallOptions::default().with_header("X-Trace", "t-1"),
        )
        .await
        .unwrap();

    assert_eq!(
        reply,
        json!({
            "method": "Users.Get",
            "service": "users",
            "from": "frontend",
            "content_type": "application/json",
            "trace": "t-1",
        })
    );
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u64,
    items: Vec<String>,
}

#[tokio::test]
async fn test_call_with_postcard_codec() {
    let addr = spawn_server(echo).await;
    let client = Client::from_config(static_config(format!("orders={}", addr)))
        .await
        .unwrap();

    let order = Order {
        id: 42,
        items: vec!["book".to_string(), "pen".to_string()],
    };
    let reply: Order = client
        .call(
            &Context::background(),
            "orders",
            "Orders.Echo",
            &order,
            CallOptions::default().with_content_subtype("postcard"),
        )
        .await
        .unwrap();

    assert_eq!(reply, order);
}

#[tokio::test]
async fn test_remote_error_is_returned_after_budget() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let addr = spawn_server(move |_stream: ServerStream| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(RpcError::Remote("no such user".to_string()))
        }
    })
    .await;
    let client = Client::from_config(static_config(format!("users={}", addr)))
        .await
        .unwrap();

    let err = client
        .call::<_, Value>(
            &Context::background(),
            "users",
            "Users.Get",
            &json!({"id": 1}),
            fast_retries(Duration::ZERO),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RpcError::Remote(msg) if msg.contains("no such user")));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_call_retries_until_success() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let addr = spawn_server(move |stream: ServerStream| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(RpcError::Remote("warming up".to_string()));
            }
            echo(stream).await
        }
    })
    .await;
    let client = Client::from_config(static_config(format!("users={}", addr)))
        .await
        .unwrap();

    let reply: Value = client
        .call(
            &Context::background(),
            "users",
            "Users.Get",
            &json!("ok"),
            fast_retries(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    assert_eq!(reply, json!("ok"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_request_timeout_exceeded() {
    let addr = spawn_server(|stream: ServerStream| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        echo(stream).await
    })
    .await;
    let client = Client::from_config(static_config(format!("slow={}", addr)))
        .await
        .unwrap();

    let err = client
        .call::<_, Value>(
            &Context::background(),
            "slow",
            "Slow.Run",
            &json!({}),
            CallOptions::default().with_request_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RpcError::Canceled(ref msg) if msg.contains("deadline exceeded")));
    assert!(err.is_canceled());
}

#[tokio::test]
async fn test_expired_context_is_canceled() {
    let addr = spawn_server(echo).await;
    let client = Client::from_config(static_config(format!("users={}", addr)))
        .await
        .unwrap();

    let ctx = Context::background().with_timeout(Duration::from_millis(1));
    tokio::time::sleep(Duration::from_millis(5)).await;
    let err = client
        .call::<_, Value>(&ctx, "users", "Users.Get", &json!({}), CallOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, RpcError::Canceled(ref msg) if msg == "deadline exceeded after 1ms"));
}

#[tokio::test]
async fn test_canceled_context_makes_no_attempt() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let addr = spawn_server(move |stream: ServerStream| {
        counter.fetch_add(1, Ordering::SeqCst);
        echo(stream)
    })
    .await;
    let client = Client::from_config(static_config(format!("users={}", addr)))
        .await
        .unwrap();

    let ctx = Context::background().with_cancel();
    ctx.cancel();
    let err = client
        .call::<_, Value>(&ctx, "users", "Users.Get", &json!({}), CallOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, RpcError::Canceled(_)));
    assert_eq!(attempts.load(Ordering::SeqCst), 0);
    assert_eq!(client.pool().stats(&addr).await, PoolStats::default());
}

#[tokio::test]
async fn test_unreachable_address_is_unavailable() {
    // Reserve a port, then free it so nothing is listening there.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let client = Client::from_config(static_config(format!("users={}", addr)))
        .await
        .unwrap();

    let err = client
        .call::<_, Value>(
            &Context::background(),
            "users",
            "Users.Get",
            &json!({}),
            fast_retries(Duration::from_millis(10)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RpcError::Unavailable(_)));
}

#[tokio::test]
async fn test_unknown_service_without_fallback() {
    let addr = spawn_server(echo).await;
    let config = ClientConfig {
        fallback_address: None,
        ..static_config(format!("users={}", addr))
    };
    let client = Client::from_config(config).await.unwrap();

    let err = client
        .call::<_, Value>(
            &Context::background(),
            "billing",
            "Billing.Charge",
            &json!({}),
            CallOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RpcError::Unavailable(_)));
}

#[tokio::test]
async fn test_round_robin_spreads_calls_over_replicas() {
    let mut counters = Vec::new();
    let mut endpoints = Vec::new();
    for _ in 0..3 {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let addr = spawn_server(move |stream: ServerStream| {
            counter.fetch_add(1, Ordering::SeqCst);
            echo(stream)
        })
        .await;
        endpoints.push(format!("users={}", addr));
        counters.push(hits);
    }
    let client = Client::from_config(static_config(endpoints.join(",")))
        .await
        .unwrap();

    for i in 0..3 {
        let reply: Value = client
            .call(
                &Context::background(),
                "users",
                "Users.Get",
                &json!(i),
                CallOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(reply, json!(i));
    }

    for hits in &counters {
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

// ============================================================================
// Pooling
// ============================================================================

#[tokio::test]
async fn test_sequential_calls_reuse_one_connection() {
    let addr = spawn_server(echo).await;
    let config = ClientConfig {
        pool: PoolConfig {
            size: 1,
            max_streams: 1,
            ..PoolConfig::default()
        },
        ..static_config(format!("users={}", addr))
    };
    let client = Client::from_config(config).await.unwrap();

    for i in 0..5 {
        let reply: Value = client
            .call(
                &Context::background(),
                "users",
                "Users.Get",
                &json!({"n": i}),
                CallOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(reply, json!({"n": i}));
    }

    let stats = client.pool().stats(&addr).await;
    assert_eq!(stats.count, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.streams, 0);
}

#[tokio::test]
async fn test_concurrent_calls_share_multiplexed_connection() {
    let addr = spawn_server(|stream: ServerStream| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        echo(stream).await
    })
    .await;
    let client = Arc::new(
        Client::from_config(static_config(format!("users={}", addr)))
            .await
            .unwrap(),
    );

    let mut calls = Vec::new();
    for i in 0..8 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            client
                .call::<_, Value>(
                    &Context::background(),
                    "users",
                    "Users.Get",
                    &json!(i),
                    CallOptions::default(),
                )
                .await
        }));
    }
    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap().unwrap(), json!(i));
    }

    let stats = client.pool().stats(&addr).await;
    assert!(stats.count >= 1);
    assert_eq!(stats.streams, 0);
    assert_eq!(stats.idle, stats.count);
}

// ============================================================================
// Streams
// ============================================================================

#[tokio::test]
async fn test_stream_round_trip() {
    let addr = spawn_server(echo).await;
    let client = Client::from_config(static_config(format!("chat={}", addr)))
        .await
        .unwrap();

    let mut stream = client
        .stream(
            &Context::background(),
            "chat",
            "Chat.Talk",
            &json!("hello"),
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(stream.address(), Some(addr.as_str()));
    assert_eq!(client.pool().stats(&addr).await.streams, 1);

    stream.send(&json!("how are you")).await.unwrap();
    stream.close_send().await.unwrap();

    let mut received: Vec<Value> = Vec::new();
    while let Some(msg) = stream.recv().await.unwrap() {
        received.push(msg);
    }
    assert_eq!(received, vec![json!("hello"), json!("how are you")]);

    stream.close(None).await;
    let stats = client.pool().stats(&addr).await;
    assert_eq!(stats.streams, 0);
    assert_eq!(stats.idle, 1);
}

#[tokio::test]
async fn test_dropped_stream_releases_connection() {
    let addr = spawn_server(echo).await;
    let client = Client::from_config(static_config(format!("chat={}", addr)))
        .await
        .unwrap();

    let stream = client
        .stream(
            &Context::background(),
            "chat",
            "Chat.Talk",
            &json!("hi"),
            CallOptions::default(),
        )
        .await
        .unwrap();
    drop(stream);

    for _ in 0..50 {
        if client.pool().stats(&addr).await.streams == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.pool().stats(&addr).await.streams, 0);
}

// ============================================================================
// Resolver backends
// ============================================================================

#[tokio::test]
async fn test_call_through_file_resolver() {
    let addr = spawn_server(echo).await;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("routes.json");

    let registration = FileResolver::open(&path, vec![Route::new("orders", &addr)])
        .await
        .unwrap();

    let config = ClientConfig {
        resolver: ResolverConfig::File { path: path.clone() },
        fallback_address: None,
        ..ClientConfig::default()
    };
    let client = Client::from_config(config).await.unwrap();

    let reply: Value = client
        .call(
            &Context::background(),
            "orders",
            "Orders.List",
            &json!([1, 2]),
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(reply, json!([1, 2]));

    registration.deregister_self().await.unwrap();
    let err = client
        .call::<_, Value>(
            &Context::background(),
            "orders",
            "Orders.List",
            &json!([]),
            CallOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Unavailable(_)));
}

#[tokio::test]
async fn test_call_through_dynamic_resolver() {
    let addr = spawn_server(echo).await;
    let registry = Arc::new(MemoryRegistry::new());
    registry.register(Route::new("inventory", &addr)).await;

    let resolver = DynamicResolver::new(registry.clone(), WatchConfig::default());
    let client = Client::new(ClientConfig::default(), resolver.into()).unwrap();

    let reply: Value = client
        .call(
            &Context::background(),
            "inventory",
            "Inventory.Count",
            &json!({"sku": "a-1"}),
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(reply, json!({"sku": "a-1"}));

    client.close().await;
}
