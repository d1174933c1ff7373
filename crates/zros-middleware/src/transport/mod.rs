//! Socket fabric underneath the endpoints.
//!
//! A [`Link`] is one open transport binding: either a single connection to a
//! remote peer or a bound listener with any number of attached peers.  The
//! link routes outbound frames according to its [`Pattern`]:
//!
//! | Pattern | Outbound routing |
//! |---|---|
//! | `pub` | fan-out to every peer; a full peer loses its oldest frame |
//! | `push`, `req`, `sub`, `pull` | round-robin over peers with room |
//! | `rep` | back to the peer the request came from |
//!
//! Two transports are provided: length-prefixed multipart frames over TCP
//! ([`tcp`]) and an in-process hub ([`inproc`]) with identical semantics.

pub mod envelope;
pub mod inproc;
pub mod tcp;

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;
use zros_types::Pattern;

pub use envelope::Envelope;
pub use inproc::InprocHub;

/// One multipart message: an ordered list of byte parts.
pub type Frame = Vec<Vec<u8>>;

/// Identifier of a peer attached to a link.
pub type PeerId = u64;

/// Frame received from a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub peer: PeerId,
    pub frame: Frame,
}

/// Frame to send; `peer` addresses a reply to one specific peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub peer: Option<PeerId>,
    pub frame: Frame,
}

impl Outbound {
    pub fn broadcast(frame: Frame) -> Self {
        Self { peer: None, frame }
    }

    pub fn to(peer: PeerId, frame: Frame) -> Self {
        Self { peer: Some(peer), frame }
    }

    pub fn len(&self) -> usize {
        self.frame.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("invalid address {0}")]
    Address(String),

    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("bind on {address} failed: {reason}")]
    Bind { address: String, reason: String },

    #[error("no peer attached")]
    NoPeer,

    #[error("peer queue full")]
    Full,

    #[error("link closed")]
    Closed,

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl LinkError {
    /// The link is still usable; the frame may be retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, LinkError::NoPeer | LinkError::Full)
    }
}

/// A frame the link could not take, handed back to the caller.
#[derive(Debug)]
pub struct Rejected {
    pub error: LinkError,
    pub out: Outbound,
}

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

/// Parsed endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// `tcp://host:port`; host `*` means every interface.
    Tcp { host: String, port: u16 },
    /// `inproc://name`
    Inproc(String),
}

impl Address {
    pub fn parse(s: &str) -> Result<Self, LinkError> {
        let bad = || LinkError::Address(s.to_string());
        if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = rest.rsplit_once(':').ok_or_else(bad)?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if host.is_empty() {
                return Err(bad());
            }
            let port = port.parse::<u16>().map_err(|_| bad())?;
            return Ok(Address::Tcp { host: host.to_string(), port });
        }
        if let Some(name) = s.strip_prefix("inproc://") {
            if name.is_empty() {
                return Err(bad());
            }
            return Ok(Address::Inproc(name.to_string()));
        }
        Err(bad())
    }

    /// `tcp://*:port` style address; such endpoints bind by default.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Address::Tcp { host, .. } if host == "*" || host == "0.0.0.0")
    }

    /// Whether an endpoint of `pattern` at this address binds when the
    /// configuration does not say.
    pub fn binds_by_default(&self, pattern: Pattern) -> bool {
        match self {
            Address::Tcp { .. } => self.is_wildcard(),
            Address::Inproc(_) => matches!(pattern, Pattern::Pub | Pattern::Rep | Pattern::Pull),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp { host, port } if host.contains(':') => write!(f, "tcp://[{host}]:{port}"),
            Address::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Address::Inproc(name) => write!(f, "inproc://{name}"),
        }
    }
}

/// Everything a [`Connector`] needs to open a link.
#[derive(Debug, Clone)]
pub struct LinkSpec {
    pub address: Address,
    pub bind: bool,
    pub pattern: Pattern,
    /// Frames queued per peer before backpressure applies.
    pub peer_capacity: usize,
    pub max_message_bytes: usize,
    pub connect_timeout: Duration,
}

/// Opens links.  Implemented by [`Fabric`] and by test doubles.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, spec: &LinkSpec) -> Result<Link, LinkError>;
}

/// Default connector: TCP plus the in-process hub.
#[derive(Clone, Default)]
pub struct Fabric {
    hub: InprocHub,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hub(hub: InprocHub) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &InprocHub {
        &self.hub
    }
}

#[async_trait]
impl Connector for Fabric {
    async fn open(&self, spec: &LinkSpec) -> Result<Link, LinkError> {
        match &spec.address {
            Address::Tcp { host, port } if spec.bind => tcp::bind(host, *port, spec).await,
            Address::Tcp { host, port } => tcp::connect(host, *port, spec).await,
            Address::Inproc(name) if spec.bind => self.hub.bind(name, spec),
            Address::Inproc(name) => self.hub.connect(name, spec),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-peer queue
// ---------------------------------------------------------------------------

/// Bounded outbound queue feeding one peer's writer.
pub(crate) struct PeerQueue {
    frames: Mutex<VecDeque<Frame>>,
    capacity: usize,
    in_flight: AtomicUsize,
    ready: Notify,
    drained: Arc<Notify>,
}

impl PeerQueue {
    fn new(capacity: usize, drained: Arc<Notify>) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            in_flight: AtomicUsize::new(0),
            ready: Notify::new(),
            drained,
        }
    }

    /// Queue `frame`.  When full, either evict the oldest frame or hand the
    /// new one back.
    fn offer(&self, frame: Frame, evict_oldest: bool) -> Result<(), Frame> {
        {
            let mut q = self.frames.lock();
            if q.len() >= self.capacity {
                if !evict_oldest {
                    return Err(frame);
                }
                q.pop_front();
            }
            q.push_back(frame);
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Wait for the next frame.  Call [`PeerQueue::done`] once it is written.
    pub(crate) async fn next(&self) -> Frame {
        loop {
            let next = self.frames.lock().pop_front();
            if let Some(frame) = next {
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                return frame;
            }
            self.ready.notified().await;
        }
    }

    pub(crate) fn done(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.drained.notify_one();
    }

    fn pending(&self) -> usize {
        self.frames.lock().len() + self.in_flight.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Peer table
// ---------------------------------------------------------------------------

/// Peers attached to one link and the routing policy across them.
pub(crate) struct PeerTable {
    pattern: Pattern,
    capacity: usize,
    peers: Mutex<Vec<(PeerId, Arc<PeerQueue>)>>,
    cursor: AtomicUsize,
    next_id: AtomicU64,
    writable: Arc<Notify>,
}

impl PeerTable {
    pub(crate) fn new(pattern: Pattern, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            pattern,
            capacity,
            peers: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            writable: Arc::new(Notify::new()),
        })
    }

    pub(crate) fn attach(&self) -> (PeerId, Arc<PeerQueue>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(PeerQueue::new(self.capacity, Arc::clone(&self.writable)));
        self.peers.lock().push((id, Arc::clone(&queue)));
        self.writable.notify_one();
        (id, queue)
    }

    pub(crate) fn detach(&self, id: PeerId) {
        self.peers.lock().retain(|(p, _)| *p != id);
    }

    fn route(&self, out: Outbound) -> Result<(), Rejected> {
        let peers = self.peers.lock();
        match (self.pattern, out.peer) {
            (_, Some(target)) => match peers.iter().find(|(id, _)| *id == target) {
                Some((_, q)) => q.offer(out.frame, false).map_err(|frame| Rejected {
                    error: LinkError::Full,
                    out: Outbound::to(target, frame),
                }),
                None => {
                    debug!(peer = target, "reply target detached; dropping frame");
                    Ok(())
                }
            },
            (Pattern::Pub, None) => {
                for (_, q) in peers.iter() {
                    let _ = q.offer(out.frame.clone(), true);
                }
                Ok(())
            }
            (_, None) => {
                if peers.is_empty() {
                    return Err(Rejected { error: LinkError::NoPeer, out });
                }
                let n = peers.len();
                let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
                let mut frame = out.frame;
                for i in 0..n {
                    match peers[(start + i) % n].1.offer(frame, false) {
                        Ok(()) => return Ok(()),
                        Err(back) => frame = back,
                    }
                }
                Err(Rejected {
                    error: LinkError::Full,
                    out: Outbound::broadcast(frame),
                })
            }
        }
    }

    fn pending(&self) -> usize {
        self.peers.lock().iter().map(|(_, q)| q.pending()).sum()
    }

    fn len(&self) -> usize {
        self.peers.lock().len()
    }
}

/// Detaches a peer when the task serving it ends or is aborted.
pub(crate) struct DetachOnDrop {
    pub(crate) table: Arc<PeerTable>,
    pub(crate) peer: PeerId,
}

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        self.table.detach(self.peer);
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// An open transport binding.  Dropping it tears the binding down.
pub struct Link {
    peers: Arc<PeerTable>,
    inbound: mpsc::Receiver<Inbound>,
    tasks: Vec<JoinHandle<()>>,
    description: String,
    local_addr: Option<SocketAddr>,
}

impl Link {
    pub(crate) fn new(
        peers: Arc<PeerTable>,
        inbound: mpsc::Receiver<Inbound>,
        tasks: Vec<JoinHandle<()>>,
        description: String,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        Self { peers, inbound, tasks, description, local_addr }
    }

    /// Hand a frame to the peer queues without blocking.
    pub fn send(&self, out: Outbound) -> Result<(), Rejected> {
        self.peers.route(out)
    }

    /// Next inbound frame; `None` once the link is gone.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    /// Notified whenever a peer drains a frame or a new peer attaches.
    pub fn writable(&self) -> Arc<Notify> {
        Arc::clone(&self.peers.writable)
    }

    /// Frames accepted but not yet written to the wire.
    pub fn pending(&self) -> usize {
        self.peers.pending()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Local socket address of a bound TCP link.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("description", &self.description)
            .field("peers", &self.peer_count())
            .finish()
    }
}
