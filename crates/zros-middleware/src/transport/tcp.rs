//! TCP transport.
//!
//! Each frame on the wire is a big-endian `u32` part count followed by every
//! part as a big-endian `u32` length and its bytes.  A frame larger than
//! `max_message_bytes` closes the connection.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{DetachOnDrop, Frame, Inbound, Link, LinkError, LinkSpec, PeerTable};

/// Upper bound on parts per frame.
pub const MAX_PARTS: usize = 16;

pub(crate) async fn connect(host: &str, port: u16, spec: &LinkSpec) -> Result<Link, LinkError> {
    let address = spec.address.to_string();
    let stream = tokio::time::timeout(spec.connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| LinkError::Connect { address: address.clone(), reason: "timed out".to_string() })?
        .map_err(|e| LinkError::Connect { address: address.clone(), reason: e.to_string() })?;
    let _ = stream.set_nodelay(true);

    let table = PeerTable::new(spec.pattern, spec.peer_capacity);
    let (tx, rx) = mpsc::channel(spec.peer_capacity.max(1));
    let task = spawn_peer(stream, Arc::clone(&table), tx, spec.max_message_bytes);
    debug!(%address, "tcp connected");
    Ok(Link::new(table, rx, vec![task], address, None))
}

pub(crate) async fn bind(host: &str, port: u16, spec: &LinkSpec) -> Result<Link, LinkError> {
    let host = if host == "*" { "0.0.0.0" } else { host };
    let listener = TcpListener::bind((host, port)).await.map_err(|e| LinkError::Bind {
        address: spec.address.to_string(),
        reason: e.to_string(),
    })?;
    let local = listener.local_addr().ok();

    let table = PeerTable::new(spec.pattern, spec.peer_capacity);
    let (tx, rx) = mpsc::channel(spec.peer_capacity.max(1));
    let accept = tokio::spawn(accept_loop(listener, Arc::clone(&table), tx, spec.max_message_bytes));
    debug!(address = %spec.address, ?local, "tcp listening");
    Ok(Link::new(table, rx, vec![accept], spec.address.to_string(), local))
}

async fn accept_loop(listener: TcpListener, table: Arc<PeerTable>, inbound: mpsc::Sender<Inbound>, max: usize) {
    loop {
        tokio::select! {
            _ = inbound.closed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(%remote, "peer accepted");
                    let _ = stream.set_nodelay(true);
                    spawn_peer(stream, Arc::clone(&table), inbound.clone(), max);
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

fn spawn_peer(stream: TcpStream, table: Arc<PeerTable>, inbound: mpsc::Sender<Inbound>, max: usize) -> JoinHandle<()> {
    let (peer, queue) = table.attach();
    tokio::spawn(async move {
        let _detach = DetachOnDrop { table, peer };
        let (mut rd, mut wr) = stream.into_split();

        let writer = async {
            loop {
                let frame = queue.next().await;
                let written = write_frame(&mut wr, &frame, max).await;
                queue.done();
                if let Err(e) = written {
                    break e.to_string();
                }
            }
        };
        let reader = async {
            loop {
                match read_frame(&mut rd, max).await {
                    Ok(frame) => {
                        if inbound.send(Inbound { peer, frame }).await.is_err() {
                            break "link dropped".to_string();
                        }
                    }
                    Err(e) => break e.to_string(),
                }
            }
        };

        let reason = tokio::select! {
            r = writer => r,
            r = reader => r,
            _ = inbound.closed() => "link dropped".to_string(),
        };
        debug!(peer, %reason, "peer detached");
    })
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

pub(crate) async fn read_frame<R: AsyncRead + Unpin>(r: &mut R, max: usize) -> io::Result<Frame> {
    let parts = r.read_u32().await? as usize;
    if parts == 0 || parts > MAX_PARTS {
        return Err(invalid(format!("bad part count {parts}")));
    }
    let mut frame = Vec::with_capacity(parts);
    let mut total = 0usize;
    for _ in 0..parts {
        let len = r.read_u32().await? as usize;
        total = total.saturating_add(len);
        if total > max {
            return Err(invalid(format!("frame exceeds {max} bytes")));
        }
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf).await?;
        frame.push(buf);
    }
    Ok(frame)
}

pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame, max: usize) -> io::Result<()> {
    if frame.is_empty() || frame.len() > MAX_PARTS {
        return Err(invalid(format!("bad part count {}", frame.len())));
    }
    let total: usize = frame.iter().map(Vec::len).sum();
    if total > max {
        return Err(invalid(format!("frame exceeds {max} bytes")));
    }
    let mut buf = Vec::with_capacity(4 + frame.len() * 4 + total);
    buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
    for part in frame {
        buf.extend_from_slice(&(part.len() as u32).to_be_bytes());
        buf.extend_from_slice(part);
    }
    w.write_all(&buf).await?;
    w.flush().await
}

/// Check that something accepts TCP connections at `host:port`.
pub async fn probe(host: &str, port: u16, timeout: Duration) -> Result<(), LinkError> {
    let address = format!("{host}:{port}");
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(LinkError::Connect { address, reason: e.to_string() }),
        Err(_) => Err(LinkError::Connect { address, reason: "timed out".to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use zros_types::Pattern;

    use super::*;
    use crate::transport::{Address, Outbound};

    fn spec(address: &str, pattern: Pattern, bind: bool) -> LinkSpec {
        LinkSpec {
            address: Address::parse(address).unwrap(),
            bind,
            pattern,
            peer_capacity: 16,
            max_message_bytes: 64,
            connect_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn frame_codec_round_trip() {
        let frame = vec![b"topic".to_vec(), Vec::new(), vec![7; 10]];
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame, 64).await.unwrap();
        assert_eq!(&buf[..4], &3u32.to_be_bytes());
        let back = read_frame(&mut buf.as_slice(), 64).await.unwrap();
        assert_eq!(back, frame);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let frame = vec![vec![0; 65]];
        let mut buf = Vec::new();
        assert!(write_frame(&mut buf, &frame, 64).await.is_err());

        write_frame(&mut buf, &frame, 1024).await.unwrap();
        assert!(read_frame(&mut buf.as_slice(), 64).await.is_err());
    }

    #[tokio::test]
    async fn push_to_bound_pull_over_loopback() {
        let mut pull = bind("127.0.0.1", 0, &spec("tcp://127.0.0.1:0", Pattern::Pull, true))
            .await
            .unwrap();
        let port = pull.local_addr().unwrap().port();
        let address = format!("tcp://127.0.0.1:{port}");
        let push = connect("127.0.0.1", port, &spec(&address, Pattern::Push, false)).await.unwrap();

        push.send(Outbound::broadcast(vec![b"t".to_vec(), b"hello".to_vec()])).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), pull.recv()).await.unwrap().unwrap();
        assert_eq!(got.frame, vec![b"t".to_vec(), b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn refused_connection_reports_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let address = format!("tcp://127.0.0.1:{port}");
        let err = connect("127.0.0.1", port, &spec(&address, Pattern::Req, false)).await.unwrap_err();
        assert!(matches!(err, LinkError::Connect { .. }));
        assert!(probe("127.0.0.1", port, Duration::from_secs(1)).await.is_err());
    }
}
