//! Connection Handler
//!
//! Handles individual client connections.

use std::io::{BufReader, BufWriter, ErrorKind};
use std::net::TcpStream;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::api::{ClusterApi, StoreApi};
use crate::error::{LedgerError, Result};
use crate::protocol::{read_request, write_response, Request, Response};

/// Handles a single client connection
pub struct Connection {
    /// TCP stream reader (buffered for efficiency)
    reader: BufReader<TcpStream>,

    /// TCP stream writer (buffered for efficiency)
    writer: BufWriter<TcpStream>,

    store: StoreApi,
    cluster: ClusterApi,

    /// Peer address for logging
    peer_addr: String,
}

impl Connection {
    /// Create a new connection handler
    ///
    /// Sets up buffered I/O and configures timeouts
    pub fn new(stream: TcpStream, store: StoreApi, cluster: ClusterApi) -> Result<Self> {
        // Get peer address for logging before we split the stream
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        // Accepted from a non-blocking listener
        stream.set_nonblocking(false)?;
        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        let read_stream = stream.try_clone()?;
        let write_stream = stream;

        Ok(Self {
            reader: BufReader::new(read_stream),
            writer: BufWriter::new(write_stream),
            store,
            cluster,
            peer_addr,
        })
    }

    /// Configure connection timeouts (0 = none)
    pub fn set_timeouts(&mut self, read_ms: u64, write_ms: u64) -> Result<()> {
        if read_ms > 0 {
            self.reader
                .get_ref()
                .set_read_timeout(Some(Duration::from_millis(read_ms)))?;
        }
        if write_ms > 0 {
            self.writer
                .get_ref()
                .set_write_timeout(Some(Duration::from_millis(write_ms)))?;
        }
        Ok(())
    }

    /// Handle the connection (blocking until closed)
    ///
    /// Reads requests in a loop and sends responses.
    /// Returns when the client disconnects or an error occurs.
    pub fn handle(&mut self) -> Result<()> {
        debug!(peer = %self.peer_addr, "connection established");

        loop {
            let request = match read_request(&mut self.reader) {
                Ok(request) => request,
                Err(LedgerError::Io(ref e)) if is_disconnect(e.kind()) => {
                    debug!(peer = %self.peer_addr, kind = ?e.kind(), "client disconnected");
                    return Ok(());
                }
                Err(LedgerError::Io(ref e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    debug!(peer = %self.peer_addr, "read timeout");
                    return Ok(());
                }
                Err(e) => {
                    warn!(peer = %self.peer_addr, error = %e, "bad request");
                    let _ = self.send_response(Response::error(&e.to_string()));
                    return Err(e);
                }
            };

            trace!(peer = %self.peer_addr, ?request, "request received");
            let response = self.execute(request);

            if let Err(e) = self.send_response(response) {
                if let LedgerError::Io(ref io_err) = e {
                    if is_disconnect(io_err.kind()) {
                        debug!(peer = %self.peer_addr, "client left before the response");
                        return Ok(());
                    }
                }
                warn!(peer = %self.peer_addr, error = %e, "write failed");
                return Err(e);
            }
        }
    }

    /// Route a request and turn its outcome into a response
    fn execute(&self, request: Request) -> Response {
        let outcome = match request {
            Request::Ping => Ok(Response::ok(Some(b"PONG".to_vec()))),
            Request::Get { key } => key_str(key).and_then(|key| {
                Ok(match self.store.get(&key)? {
                    Some(value) => Response::ok(Some(serde_json::to_vec(&value)?)),
                    None => Response::not_found(),
                })
            }),
            Request::Put { key, value } => key_str(key).and_then(|key| {
                let value: Value = serde_json::from_slice(&value)?;
                let stored = self.store.put(&key, value)?;
                Ok(Response::ok(Some(serde_json::to_vec(&stored)?)))
            }),
            Request::Delete { key } => key_str(key).and_then(|key| {
                self.store.delete(&key)?;
                Ok(Response::ok(None))
            }),
            Request::Join { id, addr } => self
                .cluster
                .join(id, &addr)
                .map(|()| Response::ok(None)),
            Request::Remove { id } => self.cluster.remove(id).map(|()| Response::ok(None)),
            Request::Stats => self
                .cluster
                .stats()
                .and_then(|stats| Ok(Response::ok(Some(serde_json::to_vec_pretty(&stats)?)))),
        };

        outcome.unwrap_or_else(|e| {
            debug!(peer = %self.peer_addr, error = %e, "request failed");
            Response::from_error(&e)
        })
    }

    /// Send a response to the client
    fn send_response(&mut self, response: Response) -> Result<()> {
        write_response(&mut self.writer, &response)
    }

    /// Get the peer address string
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }
}

fn key_str(key: Vec<u8>) -> Result<String> {
    String::from_utf8(key).map_err(|_| LedgerError::Protocol("key is not UTF-8".to_string()))
}

fn is_disconnect(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
    )
}
