//! Bus adapter speaking the rosbridge v2 JSON protocol over a WebSocket.
//!
//! [`RosbridgeAdapter`] keeps one WebSocket to a `rosbridge_server` and
//! multiplexes every bus operation over it:
//!
//! | Bridge operation | rosbridge ops |
//! |---|---|
//! | `publish` | `advertise` (once per topic), `publish` |
//! | `subscribe` | `subscribe` on first sink, `unsubscribe` after the last |
//! | `call_service` | `call_service`, answered by `service_response` |
//!
//! The socket is owned by a writer task and a reader task.  When the server
//! goes away every outstanding service call fails and every subscription sink
//! is closed.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use zros_types::{BridgeError, RosbridgeSettings, TypeDescriptor, Value};

use crate::adapter::{BusAdapter, BusSink, SubscriptionHandle};

/// Frames buffered towards the server before publishers wait.
const OUTGOING_CAPACITY: usize = 1024;

type Sinks = Arc<DashMap<String, Vec<(u64, BusSink)>>>;
type Pending = Arc<DashMap<String, oneshot::Sender<Result<Value, BridgeError>>>>;

pub struct RosbridgeAdapter {
    url: String,
    outgoing: mpsc::Sender<String>,
    sinks: Sinks,
    pending: Pending,
    advertised: Mutex<HashSet<String>>,
    next_id: AtomicU64,
    call_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl RosbridgeAdapter {
    /// Connect to `settings.url`, retrying up to `settings.max_retries` times.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Bus`] when the server stays unreachable.
    pub async fn connect(settings: &RosbridgeSettings) -> Result<Self, BridgeError> {
        let connect_timeout = secs(settings.connection_timeout_seconds, 10.0);
        let retry_interval = secs(settings.retry_interval_seconds, 1.0);
        let mut attempt: u32 = 0;
        let ws = loop {
            attempt += 1;
            let reason = match tokio::time::timeout(connect_timeout, connect_async(settings.url.as_str())).await {
                Ok(Ok((ws, _))) => break ws,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "timed out".to_string(),
            };
            if attempt > settings.max_retries {
                return Err(BridgeError::Bus(format!(
                    "rosbridge {} unreachable after {attempt} attempts: {reason}",
                    settings.url
                )));
            }
            warn!(url = %settings.url, attempt, %reason, "rosbridge connect failed; retrying");
            tokio::time::sleep(retry_interval).await;
        };
        info!(url = %settings.url, "connected to rosbridge");

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (outgoing, mut outgoing_rx) = mpsc::channel::<String>(OUTGOING_CAPACITY);
        let sinks: Sinks = Arc::new(DashMap::new());
        let pending: Pending = Arc::new(DashMap::new());

        let writer = tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    error!(error = %e, "rosbridge write failed");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let reader = {
            let sinks = Arc::clone(&sinks);
            let pending = Arc::clone(&pending);
            let url = settings.url.clone();
            tokio::spawn(async move {
                while let Some(msg) = ws_rx.next().await {
                    match msg {
                        Ok(Message::Text(text)) => route(text.as_str(), &sinks, &pending),
                        Ok(Message::Close(_)) => break,
                        Err(e) => {
                            warn!(error = %e, "rosbridge read failed");
                            break;
                        }
                        _ => {}
                    }
                }
                warn!(%url, "rosbridge connection closed");
                sinks.clear();
                let ids: Vec<String> = pending.iter().map(|p| p.key().clone()).collect();
                for id in ids {
                    if let Some((_, tx)) = pending.remove(&id) {
                        let _ = tx.send(Err(BridgeError::Bus("rosbridge connection closed".to_string())));
                    }
                }
            })
        };

        Ok(Self {
            url: settings.url.clone(),
            outgoing,
            sinks,
            pending,
            advertised: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            call_timeout: secs(settings.call_timeout_seconds, 10.0),
            tasks: vec![writer, reader],
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        !self.outgoing.is_closed() && self.tasks.iter().all(|t| !t.is_finished())
    }

    async fn send(&self, op: serde_json::Value) -> Result<(), BridgeError> {
        self.outgoing
            .send(op.to_string())
            .await
            .map_err(|_| BridgeError::Bus(format!("rosbridge {} is disconnected", self.url)))
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}:{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Drop for RosbridgeAdapter {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn secs(value: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_else(|_| Duration::from_secs_f64(fallback))
}

/// Dispatch one inbound rosbridge frame.
fn route(text: &str, sinks: &Sinks, pending: &Pending) {
    let Ok(frame) = serde_json::from_str::<serde_json::Value>(text) else {
        warn!("rosbridge sent malformed JSON");
        return;
    };
    match frame.get("op").and_then(|o| o.as_str()).unwrap_or("") {
        "publish" => {
            let Some(topic) = frame.get("topic").and_then(|t| t.as_str()) else {
                return;
            };
            let value = Value::from(frame.get("msg").cloned().unwrap_or(serde_json::Value::Null));
            if let Some(mut entry) = sinks.get_mut(topic) {
                entry.retain(|(_, sink)| match sink.try_send(value.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!(%topic, "bus subscriber sink full; message dropped");
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                });
            }
        }
        "service_response" => {
            let Some(id) = frame.get("id").and_then(|i| i.as_str()) else {
                warn!("service_response without id");
                return;
            };
            let Some((_, tx)) = pending.remove(id) else {
                debug!(%id, "service_response for unknown call");
                return;
            };
            let values = frame.get("values").cloned().unwrap_or(serde_json::Value::Null);
            let ok = frame.get("result").and_then(|r| r.as_bool()).unwrap_or(true);
            let outcome = if ok {
                Ok(Value::from(values))
            } else {
                Err(BridgeError::ServiceFailed(match values {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                }))
            };
            let _ = tx.send(outcome);
        }
        "status" => {
            let level = frame.get("level").and_then(|l| l.as_str()).unwrap_or("info");
            let msg = frame.get("msg").and_then(|m| m.as_str()).unwrap_or("");
            if level == "error" {
                warn!(%msg, "rosbridge status error");
            } else {
                debug!(%level, %msg, "rosbridge status");
            }
        }
        other => debug!(op = %other, "unhandled rosbridge op"),
    }
}

#[async_trait]
impl BusAdapter for RosbridgeAdapter {
    async fn publish(&self, name: &str, ty: &TypeDescriptor, msg: Value) -> Result<(), BridgeError> {
        let first = self.advertised.lock().insert(name.to_string());
        if first {
            self.send(json!({ "op": "advertise", "topic": name, "type": ty.as_str() }))
                .await?;
        }
        self.send(json!({ "op": "publish", "topic": name, "msg": msg.to_json() }))
            .await
    }

    async fn subscribe(
        &self,
        name: &str,
        ty: &TypeDescriptor,
        sink: BusSink,
    ) -> Result<SubscriptionHandle, BridgeError> {
        let sink_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut entry = self.sinks.entry(name.to_string()).or_default();
            entry.push((sink_id, sink));
            entry.len() == 1
        };
        if first {
            self.send(json!({
                "op": "subscribe",
                "id": format!("subscribe:{name}"),
                "topic": name,
                "type": ty.as_str(),
            }))
            .await?;
        }

        let sinks = Arc::clone(&self.sinks);
        let outgoing = self.outgoing.clone();
        let topic = name.to_string();
        Ok(SubscriptionHandle::new(move || {
            let last = match sinks.get_mut(&topic) {
                Some(mut entry) => {
                    entry.retain(|(id, _)| *id != sink_id);
                    entry.is_empty()
                }
                None => false,
            };
            if last {
                sinks.remove(&topic);
                let op = json!({ "op": "unsubscribe", "id": format!("subscribe:{topic}"), "topic": topic });
                let _ = outgoing.try_send(op.to_string());
            }
        }))
    }

    async fn call_service(&self, name: &str, ty: &TypeDescriptor, request: Value) -> Result<Value, BridgeError> {
        let id = self.next_id("call_service");
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        let sent = self
            .send(json!({
                "op": "call_service",
                "id": id,
                "service": name,
                "type": ty.as_str(),
                "args": request.to_json(),
            }))
            .await;
        if let Err(e) = sent {
            self.pending.remove(&id);
            return Err(e);
        }
        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BridgeError::Bus("rosbridge connection closed".to_string())),
            Err(_) => {
                self.pending.remove(&id);
                Err(BridgeError::Timeout(self.call_timeout))
            }
        }
    }
}
