//! The same channel pairs over real TCP on the loopback interface.

mod common;

use std::sync::Arc;
use std::time::Duration;

use zros_middleware::{Bridge, Fabric, InprocHub, LoopbackBus};
use zros_types::{BridgeError, ChannelConfig, Direction, Value};

use common::{settings, start, wait_live};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn stream_crosses_tcp() {
    let port = free_port();
    let hub = InprocHub::new();
    let bus_a = LoopbackBus::default();
    let bus_b = LoopbackBus::default();
    let a = start(
        &hub,
        &bus_a,
        settings(vec![
            ChannelConfig::new("odom", Direction::SubscribeFromBus, "/odom", "odom")
                .with_endpoint(format!("tcp://*:{port}")),
        ]),
    )
    .await;
    let b = start(
        &hub,
        &bus_b,
        settings(vec![
            ChannelConfig::new("odom", Direction::PublishToBus, "/odom_remote", "odom")
                .with_endpoint(format!("tcp://127.0.0.1:{port}")),
        ]),
    )
    .await;
    wait_live(&b, "odom").await;
    let mut listener = bus_b.subscribe_topic("/odom_remote");

    // The publisher only fans out to peers it has accepted; keep publishing
    // until the subscriber has joined.
    let msg = Value::map([("x", Value::Float(1.5))]);
    let got = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            a.on_bus_message("odom", msg.clone()).unwrap();
            if let Ok(Some(v)) = tokio::time::timeout(Duration::from_millis(50), listener.recv()).await {
                return v;
            }
        }
    })
    .await
    .expect("message crossed within 5s");
    assert_eq!(got, msg);

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn service_call_crosses_tcp() {
    let port = free_port();
    let hub = InprocHub::new();
    let server = start(
        &hub,
        &LoopbackBus::default(),
        settings(vec![
            ChannelConfig::new("echo", Direction::ServiceServe, "/echo", "echo")
                .with_endpoint(format!("tcp://*:{port}")),
        ]),
    )
    .await;
    server.serve_service("echo", |req: Value| async move { Ok(req) }).unwrap();

    let mut client_settings = settings(vec![
        ChannelConfig::new("echo", Direction::ServiceCall, "/echo", "echo")
            .with_endpoint(format!("tcp://127.0.0.1:{port}")),
    ]);
    client_settings.network.connectivity_check_enabled = true;
    client_settings.network.connectivity_timeout_seconds = 1.0;
    let client = start(&hub, &LoopbackBus::default(), client_settings).await;
    wait_live(&client, "echo").await;

    let reply = client
        .call_service("echo", Value::from("ping"), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(reply, Value::from("ping"));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn bind_conflict_is_fatal_at_startup() {
    let port = free_port();
    let hub = InprocHub::new();
    let bus = LoopbackBus::default();
    let channel = ChannelConfig::new("chatter", Direction::SubscribeFromBus, "/chatter", "chatter")
        .with_endpoint(format!("tcp://*:{port}"));
    let running = start(&hub, &bus, settings(vec![channel.clone()])).await;

    let mut second = settings(vec![channel]);
    second.transport.max_reconnect_attempts = 0;
    let err = Bridge::start(second, Arc::new(bus.clone()), Arc::new(Fabric::with_hub(hub.clone())))
        .await
        .err()
        .expect("second bind fails");
    assert!(matches!(err, BridgeError::TransportFatal(_)));

    running.shutdown().await;
}
