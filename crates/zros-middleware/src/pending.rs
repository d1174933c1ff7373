//! Outstanding request/reply calls.
//!
//! A request endpoint carries at most one call in flight.  The [`CallSlot`]
//! serializes callers (rejecting or queueing them per [`RequestPolicy`]) and
//! pairs the reply with its caller by correlation id.  Replies that arrive
//! for a call that already timed out or was cancelled are logged and
//! dropped.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedMutexGuard, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;
use zros_types::{BridgeError, RequestPolicy};

pub type CallOutcome = Result<Vec<u8>, BridgeError>;

struct PendingCall {
    id: Uuid,
    channel: String,
    deadline: Instant,
    result: oneshot::Sender<CallOutcome>,
}

pub struct CallSlot {
    endpoint: String,
    policy: RequestPolicy,
    turn: Arc<tokio::sync::Mutex<()>>,
    current: Mutex<Option<PendingCall>>,
}

/// The caller's side of an in-flight call.  Dropping it abandons the call.
pub struct CallTicket {
    pub id: Uuid,
    rx: oneshot::Receiver<CallOutcome>,
    slot: Arc<CallSlot>,
    _turn: OwnedMutexGuard<()>,
}

impl CallSlot {
    pub fn new(endpoint: impl Into<String>, policy: RequestPolicy) -> Arc<Self> {
        Arc::new(Self {
            endpoint: endpoint.into(),
            policy,
            turn: Arc::new(tokio::sync::Mutex::new(())),
            current: Mutex::new(None),
        })
    }

    pub fn policy(&self) -> RequestPolicy {
        self.policy
    }

    /// Take the slot for a call on `channel` that must finish by `deadline`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Busy`] under [`RequestPolicy::Reject`] while another
    /// call is outstanding; [`BridgeError::Timeout`] if a queued caller is
    /// still waiting at `deadline`.
    pub async fn begin(
        self: &Arc<Self>,
        channel: &str,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<CallTicket, BridgeError> {
        let turn = match self.policy {
            RequestPolicy::Reject => Arc::clone(&self.turn)
                .try_lock_owned()
                .map_err(|_| BridgeError::Busy(self.endpoint.clone()))?,
            RequestPolicy::Queue => tokio::time::timeout_at(deadline, Arc::clone(&self.turn).lock_owned())
                .await
                .map_err(|_| BridgeError::Timeout(timeout))?,
        };
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        *self.current.lock() = Some(PendingCall {
            id,
            channel: channel.to_string(),
            deadline,
            result: tx,
        });
        debug!(endpoint = %self.endpoint, %channel, correlation_id = %id, "call started");
        Ok(CallTicket { id, rx, slot: Arc::clone(self), _turn: turn })
    }

    /// Complete the call `id`.  Returns `false` when no such call is waiting.
    pub fn resolve(&self, id: Uuid, outcome: CallOutcome) -> bool {
        let call = {
            let mut current = self.current.lock();
            match current.as_ref() {
                Some(p) if p.id == id && Instant::now() <= p.deadline => current.take(),
                _ => None,
            }
        };
        match call {
            Some(call) => call.result.send(outcome).is_ok(),
            None => {
                warn!(endpoint = %self.endpoint, correlation_id = %id, "late or unknown reply dropped");
                false
            }
        }
    }

    /// Fail the outstanding call, whichever channel it belongs to.
    pub fn cancel(&self, reason: &str) -> bool {
        let call = self.current.lock().take();
        self.fail(call, reason)
    }

    /// Fail the outstanding call if it was made on `channel`.
    pub fn cancel_channel(&self, channel: &str, reason: &str) -> bool {
        let call = {
            let mut current = self.current.lock();
            match current.as_ref() {
                Some(p) if p.channel == channel => current.take(),
                _ => None,
            }
        };
        self.fail(call, reason)
    }

    pub fn outstanding(&self) -> Option<Uuid> {
        self.current.lock().as_ref().map(|p| p.id)
    }

    fn fail(&self, call: Option<PendingCall>, reason: &str) -> bool {
        match call {
            Some(call) => {
                debug!(endpoint = %self.endpoint, correlation_id = %call.id, %reason, "call cancelled");
                call.result.send(Err(BridgeError::Cancelled(reason.to_string()))).is_ok()
            }
            None => false,
        }
    }

    fn discard(&self, id: Uuid) {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|p| p.id == id) {
            current.take();
        }
    }
}

impl CallTicket {
    /// Wait for the reply or cancellation.
    pub async fn outcome(&mut self) -> CallOutcome {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::Cancelled("call abandoned".to_string())),
        }
    }
}

impl Drop for CallTicket {
    fn drop(&mut self) {
        self.slot.discard(self.id);
    }
}
