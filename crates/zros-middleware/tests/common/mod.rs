//! Shared fixtures for the integration suites.
//!
//! Every suite runs two bridges inside one test process.  They talk over a
//! shared [`InprocHub`] (or loopback TCP) and each gets its own
//! [`LoopbackBus`], so a bridge never sees its own traffic echoed back.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use zros_middleware::{Bridge, Fabric, InprocHub, LoopbackBus};
use zros_types::{BridgeSettings, ChannelConfig};

/// Settings with fast reconnects and no peer probing.
pub fn settings(channels: Vec<ChannelConfig>) -> BridgeSettings {
    let mut s = BridgeSettings::default();
    s.network.connectivity_check_enabled = false;
    s.transport.reconnect_interval_seconds = 0.05;
    s.transport.max_reconnect_interval_seconds = 0.2;
    s.transport.max_reconnect_attempts = -1;
    s.channels = channels;
    s
}

pub async fn start(hub: &InprocHub, bus: &LoopbackBus, settings: BridgeSettings) -> Bridge {
    Bridge::start(settings, Arc::new(bus.clone()), Arc::new(Fabric::with_hub(hub.clone())))
        .await
        .expect("bridge starts")
}

/// Poll `cond` every 10ms for up to 5s.
pub async fn wait_until<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the endpoint behind channel `key` has a live link.
pub async fn wait_live(bridge: &Bridge, key: &str) {
    wait_until(|| async move { bridge.health(key).is_ok_and(|h| h.endpoint_state.is_live()) }).await;
}
