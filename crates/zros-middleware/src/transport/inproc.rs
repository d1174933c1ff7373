//! In-process transport.
//!
//! A bound name owns a [`PeerTable`]; each connecting link gets a pipe task
//! shuttling frames between its own single peer queue and the binder's.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{DetachOnDrop, Inbound, Link, LinkError, LinkSpec, PeerId, PeerQueue, PeerTable};

struct Binder {
    table: Arc<PeerTable>,
    inbound: mpsc::Sender<Inbound>,
}

/// Registry of bound `inproc://` names.  Clones share the same namespace.
#[derive(Clone, Default)]
pub struct InprocHub {
    binders: Arc<Mutex<HashMap<String, Binder>>>,
}

impl InprocHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.binders
            .lock()
            .get(name)
            .is_some_and(|b| !b.inbound.is_closed())
    }

    pub(crate) fn bind(&self, name: &str, spec: &LinkSpec) -> Result<Link, LinkError> {
        let mut binders = self.binders.lock();
        if binders.get(name).is_some_and(|b| !b.inbound.is_closed()) {
            return Err(LinkError::Bind {
                address: spec.address.to_string(),
                reason: "address in use".to_string(),
            });
        }
        let table = PeerTable::new(spec.pattern, spec.peer_capacity);
        let (tx, rx) = mpsc::channel(spec.peer_capacity.max(1));
        binders.insert(name.to_string(), Binder { table: Arc::clone(&table), inbound: tx });
        debug!(address = %spec.address, "inproc bound");
        Ok(Link::new(table, rx, Vec::new(), spec.address.to_string(), None))
    }

    pub(crate) fn connect(&self, name: &str, spec: &LinkSpec) -> Result<Link, LinkError> {
        let (remote_table, remote_tx) = {
            let binders = self.binders.lock();
            match binders.get(name) {
                Some(b) if !b.inbound.is_closed() => (Arc::clone(&b.table), b.inbound.clone()),
                _ => {
                    return Err(LinkError::Connect {
                        address: spec.address.to_string(),
                        reason: "connection refused".to_string(),
                    });
                }
            }
        };
        let local_table = PeerTable::new(spec.pattern, spec.peer_capacity);
        let (local_tx, local_rx) = mpsc::channel(spec.peer_capacity.max(1));
        let (local_peer, local_queue) = local_table.attach();
        let (remote_peer, remote_queue) = remote_table.attach();

        let pipe = Pipe {
            local: Side {
                queue: local_queue,
                inbound: local_tx,
                peer: local_peer,
                _detach: DetachOnDrop { table: Arc::clone(&local_table), peer: local_peer },
            },
            remote: Side {
                queue: remote_queue,
                inbound: remote_tx,
                peer: remote_peer,
                _detach: DetachOnDrop { table: remote_table, peer: remote_peer },
            },
        };
        let task = tokio::spawn(pipe.run());
        debug!(address = %spec.address, "inproc connected");
        Ok(Link::new(local_table, local_rx, vec![task], spec.address.to_string(), None))
    }
}

struct Side {
    queue: Arc<PeerQueue>,
    inbound: mpsc::Sender<Inbound>,
    peer: PeerId,
    _detach: DetachOnDrop,
}

struct Pipe {
    local: Side,
    remote: Side,
}

impl Pipe {
    async fn run(self) {
        let Pipe { local, remote } = self;
        loop {
            tokio::select! {
                frame = local.queue.next() => {
                    let sent = remote.inbound.send(Inbound { peer: remote.peer, frame }).await;
                    local.queue.done();
                    if sent.is_err() {
                        break;
                    }
                }
                frame = remote.queue.next() => {
                    let sent = local.inbound.send(Inbound { peer: local.peer, frame }).await;
                    remote.queue.done();
                    if sent.is_err() {
                        break;
                    }
                }
                _ = local.inbound.closed() => break,
                _ = remote.inbound.closed() => break,
            }
        }
        debug!("inproc pipe closed");
    }
}
