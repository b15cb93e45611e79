//! Raft Transport
//!
//! Carries raft messages between nodes over TCP.
//!
//! ## Wire Format
//! ```text
//! ┌──────────────┬─────────────────────────────────────────────────────┐
//! │ Len u32 (BE) │ bincode(Envelope { from_addr, api_addr, message })  │
//! └──────────────┴─────────────────────────────────────────────────────┘
//! ```
//! `message` is the protobuf-encoded `raft::eraftpb::Message`. The sender's
//! raft address lets receivers learn how to reach a peer they have not heard
//! of; its client address is what followers hand out as the leader location.
//!
//! ## Threads
//! - One listener accepting peer connections
//! - One reader per inbound connection, forwarding into one channel
//! - One sender per known peer, owning a persistent outbound connection

use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use prost::Message as ProstMessage;
use raft::eraftpb::Message;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::error::{LedgerError, Result};

/// Frames larger than this are treated as a broken stream
const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Messages queued per peer before new ones are dropped
const PEER_QUEUE_DEPTH: usize = 4096;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    from_addr: String,
    api_addr: String,
    message: Vec<u8>,
}

/// A message received from a peer
#[derive(Debug)]
pub struct Inbound {
    /// Raft address the sender advertises
    pub from_addr: String,
    /// Client address of the sender
    pub api_addr: String,
    pub message: Message,
}

struct PeerLink {
    addr: String,
    queue: Sender<Message>,
}

/// TCP transport for raft messages
pub struct Transport {
    local_addr: SocketAddr,
    advertise_addr: String,
    api_addr: String,
    peers: Mutex<HashMap<u64, PeerLink>>,
    shutdown: Arc<AtomicBool>,
}

impl Transport {
    /// Bind the listener and start accepting peers
    ///
    /// The configured address is what peers are told to dial, except that
    /// port 0 is replaced by the port actually bound.
    pub fn bind(addr: &str, api_addr: &str) -> Result<(Arc<Self>, Receiver<Inbound>)> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| LedgerError::Network(format!("bind raft transport {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let (inbound_tx, inbound_rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));

        // A wildcard port is only known after binding
        let advertise_addr = if addr.ends_with(":0") {
            local_addr.to_string()
        } else {
            addr.to_string()
        };

        let transport = Arc::new(Self {
            local_addr,
            advertise_addr,
            api_addr: api_addr.to_string(),
            peers: Mutex::new(HashMap::new()),
            shutdown: Arc::clone(&shutdown),
        });

        thread::Builder::new()
            .name(format!("raft-listener-{}", local_addr))
            .spawn(move || accept_loop(listener, inbound_tx, shutdown))?;

        info!(addr = %local_addr, "raft transport listening");
        Ok((transport, inbound_rx))
    }

    /// Address other nodes use to reach this one
    pub fn local_addr(&self) -> &str {
        &self.advertise_addr
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue a message for `to` at `addr`; delivery is best effort
    pub fn send(&self, to: u64, addr: &str, message: Message) {
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }

        let mut peers = self.peers.lock();
        let stale = peers.get(&to).map_or(true, |link| link.addr != addr);
        if stale {
            let (queue, rx) = bounded(PEER_QUEUE_DEPTH);
            let peer_addr = addr.to_string();
            let origin = (self.advertise_addr.clone(), self.api_addr.clone());
            let shutdown = Arc::clone(&self.shutdown);
            let spawned = thread::Builder::new()
                .name(format!("raft-peer-{}", to))
                .spawn(move || send_loop(to, peer_addr, origin, rx, shutdown));
            if let Err(e) = spawned {
                warn!(peer = to, error = %e, "cannot start peer sender");
                return;
            }
            // Replacing the link drops the old queue, which ends its thread
            peers.insert(
                to,
                PeerLink {
                    addr: addr.to_string(),
                    queue,
                },
            );
        }

        if let Some(link) = peers.get(&to) {
            match link.queue.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    trace!(peer = to, "peer queue full, dropping message")
                }
                Err(TrySendError::Disconnected(_)) => {
                    peers.remove(&to);
                }
            }
        }
    }

    /// Forget a peer, closing its outbound connection
    pub fn remove_peer(&self, id: u64) {
        if self.peers.lock().remove(&id).is_some() {
            debug!(peer = id, "peer link closed");
        }
    }

    /// Stop accepting and sending
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.peers.lock().clear();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, inbound: Sender<Inbound>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let inbound = inbound.clone();
                let shutdown = Arc::clone(&shutdown);
                let spawned = thread::Builder::new()
                    .name(format!("raft-conn-{}", peer))
                    .spawn(move || {
                        if let Err(e) = read_loop(stream, inbound, shutdown) {
                            debug!(peer = %peer, error = %e, "raft connection closed");
                        }
                    });
                if let Err(e) = spawned {
                    warn!(error = %e, "cannot spawn raft connection reader");
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!(error = %e, "raft accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    debug!("raft listener stopped");
}

fn read_loop(stream: TcpStream, inbound: Sender<Inbound>, shutdown: Arc<AtomicBool>) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let mut reader = BufReader::new(stream);

    while !shutdown.load(Ordering::Relaxed) {
        let frame = match read_frame(&mut reader) {
            Ok(frame) => frame,
            Err(LedgerError::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let envelope: Envelope = bincode::deserialize(&frame)?;
        let message = Message::decode(&envelope.message[..])?;
        if inbound
            .send(Inbound {
                from_addr: envelope.from_addr,
                api_addr: envelope.api_addr,
                message,
            })
            .is_err()
        {
            // Node stopped
            return Ok(());
        }
    }
    Ok(())
}

fn send_loop(
    to: u64,
    addr: String,
    origin: (String, String),
    queue: Receiver<Message>,
    shutdown: Arc<AtomicBool>,
) {
    let mut conn: Option<BufWriter<TcpStream>> = None;

    loop {
        let message = match queue.recv_timeout(Duration::from_secs(1)) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let frame = match encode_frame(&origin.0, &origin.1, &message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = to, error = %e, "cannot encode raft message");
                continue;
            }
        };

        if conn.is_none() {
            match connect(&addr) {
                Ok(stream) => conn = Some(BufWriter::new(stream)),
                Err(e) => {
                    // Raft retransmits; dropping is fine
                    trace!(peer = to, addr = %addr, error = %e, "peer unreachable");
                    continue;
                }
            }
        }

        if let Some(writer) = conn.as_mut() {
            let sent = writer.write_all(&frame).and_then(|_| writer.flush());
            if let Err(e) = sent {
                debug!(peer = to, error = %e, "raft send failed, reconnecting");
                conn = None;
            }
        }
    }
    debug!(peer = to, "peer sender stopped");
}

fn connect(addr: &str) -> std::io::Result<TcpStream> {
    let target = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no address"))?;
    let stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn encode_frame(from_addr: &str, api_addr: &str, message: &Message) -> Result<Vec<u8>> {
    let envelope = Envelope {
        from_addr: from_addr.to_string(),
        api_addr: api_addr.to_string(),
        message: message.encode_to_vec(),
    };
    let body = bincode::serialize(&envelope)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(LedgerError::Network(format!(
            "raft frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft::eraftpb::MessageType;

    #[test]
    fn test_frame_roundtrip() {
        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgHeartbeat);
        msg.from = 1;
        msg.to = 2;
        msg.term = 7;

        let frame = encode_frame("127.0.0.1:7001", "127.0.0.1:5001", &msg).unwrap();
        let body = read_frame(&mut &frame[..]).unwrap();
        let envelope: Envelope = bincode::deserialize(&body).unwrap();
        let decoded = Message::decode(&envelope.message[..]).unwrap();

        assert_eq!(envelope.from_addr, "127.0.0.1:7001");
        assert_eq!(envelope.api_addr, "127.0.0.1:5001");
        assert_eq!(decoded.term, 7);
        assert_eq!(decoded.msg_type(), MessageType::MsgHeartbeat);
    }

    #[test]
    fn test_delivers_between_transports() {
        let (a, _a_rx) = Transport::bind("127.0.0.1:0", "127.0.0.1:5001").unwrap();
        let (b, b_rx) = Transport::bind("127.0.0.1:0", "127.0.0.1:5002").unwrap();

        let mut msg = Message::default();
        msg.from = 1;
        msg.to = 2;
        msg.commit = 42;
        a.send(2, b.local_addr(), msg);

        let inbound = b_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(inbound.message.commit, 42);
        assert_eq!(inbound.from_addr, a.local_addr());
        assert_eq!(inbound.api_addr, "127.0.0.1:5001");
    }
}
