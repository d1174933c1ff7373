//! Request/reply channels across two bridges.
//!
//! The server bridge runs a `service_serve` channel on a bound `rep`
//! endpoint; the client bridge runs the matching `service_call` channel on a
//! connecting `req` endpoint.  The server always starts first.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use zros_middleware::{Bridge, InprocHub, LoopbackBus};
use zros_types::{BridgeError, ChannelConfig, Direction, RequestPolicy, Value};

use common::{settings, start, wait_live};

const LONG: Option<Duration> = Some(Duration::from_secs(5));

fn serve(address: &str) -> ChannelConfig {
    ChannelConfig::new("add", Direction::ServiceServe, "/add_two_ints", "add_two_ints")
        .with_type("example_interfaces/AddTwoInts")
        .with_endpoint(address)
}

fn call(address: &str) -> ChannelConfig {
    ChannelConfig::new("add", Direction::ServiceCall, "/add_two_ints", "add_two_ints")
        .with_type("example_interfaces/AddTwoInts")
        .with_endpoint(address)
}

fn args(a: i64, b: i64) -> Value {
    Value::map([("a", Value::Int(a)), ("b", Value::Int(b))])
}

async fn sum(req: Value) -> Result<Value, String> {
    match (req.get("a"), req.get("b")) {
        (Some(Value::Int(a)), Some(Value::Int(b))) => Ok(Value::map([("sum", Value::Int(a + b))])),
        _ => Err("expected integer fields a and b".to_string()),
    }
}

/// Server and client on `inproc://{name}`, with the client connected.
async fn pair(hub: &InprocHub, name: &str, policy: RequestPolicy) -> (Bridge, Bridge, LoopbackBus) {
    let address = format!("inproc://{name}");
    let server_bus = LoopbackBus::default();
    let server = start(hub, &server_bus, settings(vec![serve(&address)])).await;
    let mut client_settings = settings(vec![call(&address)]);
    client_settings.transport.request_policy = policy;
    let client = start(hub, &LoopbackBus::default(), client_settings).await;
    wait_live(&client, "add").await;
    (server, client, server_bus)
}

#[tokio::test]
async fn requests_are_answered_by_the_bus_service() {
    let hub = InprocHub::new();
    let (server, client, server_bus) = pair(&hub, "bus-service", RequestPolicy::Reject).await;
    server_bus.advertise_service("/add_two_ints", sum);

    let reply = client.call_service("add", args(2, 3), LONG).await.unwrap();
    assert_eq!(reply.get("sum"), Some(&Value::Int(5)));

    let c = client.health("add").unwrap().counters;
    assert_eq!((c.forwarded, c.delivered), (1, 1));
    let s = server.health("add").unwrap().counters;
    assert_eq!((s.delivered, s.forwarded), (1, 1));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn registered_handler_replaces_the_bus_service() {
    let hub = InprocHub::new();
    let (server, client, server_bus) = pair(&hub, "handler", RequestPolicy::Reject).await;
    server_bus.advertise_service("/add_two_ints", sum);
    server
        .serve_service("add", |_req: Value| async move { Ok(Value::map([("sum", Value::Int(42))])) })
        .unwrap();

    let reply = client.call_service("add", args(2, 3), LONG).await.unwrap();
    assert_eq!(reply.get("sum"), Some(&Value::Int(42)));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn handler_failure_reaches_the_caller() {
    let hub = InprocHub::new();
    let (server, client, _) = pair(&hub, "failure", RequestPolicy::Reject).await;
    server.serve_service("add", sum).unwrap();

    let err = client.call_service("add", Value::from("not a map"), LONG).await.unwrap_err();
    assert_eq!(err, BridgeError::ServiceFailed("expected integer fields a and b".to_string()));
    assert!(client.health("add").unwrap().last_error.is_some());

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn missing_bus_service_fails_the_call() {
    let hub = InprocHub::new();
    let (server, client, _) = pair(&hub, "no-service", RequestPolicy::Reject).await;

    let err = client.call_service("add", args(1, 1), LONG).await.unwrap_err();
    assert!(matches!(err, BridgeError::ServiceFailed(ref m) if m.contains("/add_two_ints")));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn call_without_a_link_is_not_connected() {
    let hub = InprocHub::new();
    let client = start(&hub, &LoopbackBus::default(), settings(vec![call("inproc://nobody")])).await;

    let err = client.call_service("add", args(1, 2), LONG).await.unwrap_err();
    assert!(matches!(err, BridgeError::NotConnected(_)));

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn late_reply_is_dropped_after_timeout() {
    let hub = InprocHub::new();
    let (server, client, _) = pair(&hub, "slow", RequestPolicy::Reject).await;
    let first = Arc::new(AtomicBool::new(true));
    server
        .serve_service("add", move |req: Value| {
            let slow = first.swap(false, Ordering::SeqCst);
            async move {
                if slow {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                sum(req).await
            }
        })
        .unwrap();

    let err = client
        .call_service("add", args(1, 1), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert_eq!(err, BridgeError::Timeout(Duration::from_millis(50)));

    // The stale reply to the first call must not satisfy this one.
    let reply = client.call_service("add", args(2, 2), LONG).await.unwrap();
    assert_eq!(reply.get("sum"), Some(&Value::Int(4)));

    client.shutdown().await;
    server.shutdown().await;
}

/// Server whose handler echoes the request after `delay`.
fn slow_echo(server: &Bridge, delay: Duration) {
    server
        .serve_service("add", move |req: Value| async move {
            tokio::time::sleep(delay).await;
            Ok(req)
        })
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn second_caller_is_busy_under_reject() {
    let hub = InprocHub::new();
    let (server, client, _) = pair(&hub, "reject", RequestPolicy::Reject).await;
    slow_echo(&server, Duration::from_millis(200));
    let client = Arc::new(client);

    let first = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call_service("add", Value::Int(1), LONG).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = client.call_service("add", Value::Int(2), LONG).await;
    assert!(matches!(second, Err(BridgeError::Busy(_))));
    assert_eq!(first.await.unwrap(), Ok(Value::Int(1)));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn second_caller_waits_under_queue() {
    let hub = InprocHub::new();
    let (server, client, _) = pair(&hub, "queue", RequestPolicy::Queue).await;
    slow_echo(&server, Duration::from_millis(100));
    let client = Arc::new(client);

    let first = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call_service("add", Value::Int(1), LONG).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = client.call_service("add", Value::Int(2), LONG).await;
    assert_eq!(second, Ok(Value::Int(2)));
    assert_eq!(first.await.unwrap(), Ok(Value::Int(1)));
    assert_eq!(client.health("add").unwrap().counters.delivered, 2);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn removing_the_channel_cancels_its_call() {
    let hub = InprocHub::new();
    let (server, client, _) = pair(&hub, "cancel", RequestPolicy::Reject).await;
    slow_echo(&server, Duration::from_secs(2));
    let client = Arc::new(client);

    let pending = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call_service("add", Value::Int(7), LONG).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(client.remove_channel("add").await);
    assert!(matches!(pending.await.unwrap(), Err(BridgeError::Cancelled(_))));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_outstanding_calls() {
    let hub = InprocHub::new();
    let (server, client, _) = pair(&hub, "shutdown", RequestPolicy::Reject).await;
    slow_echo(&server, Duration::from_secs(2));
    let client = Arc::new(client);

    let pending = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call_service("add", Value::Int(7), LONG).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    client.shutdown().await;
    assert!(matches!(pending.await.unwrap(), Err(BridgeError::Cancelled(_))));
    assert_eq!(client.call_service("add", Value::Int(1), LONG).await, Err(BridgeError::ShuttingDown));

    server.shutdown().await;
}
