//! TCP Server
//!
//! Accepts client connections and runs each on its own thread.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::api::{ClusterApi, StoreApi};
use crate::config::Config;
use crate::error::{LedgerError, Result};
use crate::protocol::{write_response, Response};

use super::Connection;

/// How often the accept loop checks for shutdown
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// TCP server for LedgerKV clients
///
/// Bound before the raft node starts so the node can advertise the
/// address it actually got.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    read_timeout_ms: u64,
    write_timeout_ms: u64,
    max_connections: usize,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
}

impl Server {
    /// Bind the client listener to `server_bind`
    pub fn bind(config: &Config) -> Result<Self> {
        let listener = TcpListener::bind(&config.server_bind).map_err(|e| {
            LedgerError::Network(format!("bind {}: {}", config.server_bind, e))
        })?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        Ok(Self {
            listener,
            local_addr,
            read_timeout_ms: config.read_timeout_ms,
            write_timeout_ms: config.write_timeout_ms,
            max_connections: config.max_connections,
            shutdown: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Flag that stops `run` when set, for signal handlers
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Signal the server to shutdown gracefully
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Accept connections until shutdown (blocking)
    pub fn run(&self, store: StoreApi, cluster: ClusterApi) -> Result<()> {
        info!(addr = %self.local_addr, "client server listening");

        while !self.shutdown.load(Ordering::SeqCst) {
            let (mut stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
            };

            if self.active.load(Ordering::SeqCst) >= self.max_connections {
                warn!(%peer, limit = self.max_connections, "connection limit reached");
                let _ = stream.set_nonblocking(false);
                let _ = write_response(&mut stream, &Response::error("too many connections"));
                continue;
            }

            let mut connection = match Connection::new(stream, store.clone(), cluster.clone()) {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(%peer, error = %e, "cannot set up connection");
                    continue;
                }
            };
            if let Err(e) = connection.set_timeouts(self.read_timeout_ms, self.write_timeout_ms) {
                warn!(%peer, error = %e, "cannot set timeouts");
                continue;
            }

            let active = Arc::clone(&self.active);
            active.fetch_add(1, Ordering::SeqCst);
            let spawned = thread::Builder::new()
                .name(format!("client-{}", peer))
                .spawn(move || {
                    if let Err(e) = connection.handle() {
                        debug!(peer = %connection.peer_addr(), error = %e, "connection closed with error");
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            if let Err(e) = spawned {
                self.active.fetch_sub(1, Ordering::SeqCst);
                warn!(%peer, error = %e, "cannot spawn connection thread");
            }
        }

        info!(addr = %self.local_addr, "client server stopped");
        Ok(())
    }
}
