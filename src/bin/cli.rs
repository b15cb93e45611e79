//! LedgerKV CLI Client
//!
//! Command-line interface for interacting with a LedgerKV cluster.
//! Requests that land on a follower are retried against the leader it names.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use ledgerkv::protocol::{read_response, write_request, Request, Response, Status};
use ledgerkv::{LedgerError, Result};
use serde_json::{json, Value};

/// Leader redirects followed before giving up
const MAX_REDIRECTS: usize = 3;

/// Attempts per rset key while the cluster has no leader to offer
const MAX_ATTEMPTS: usize = 5;

const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// LedgerKV CLI
#[derive(Parser, Debug)]
#[command(name = "ledgerkv-cli")]
#[command(about = "CLI for the LedgerKV replicated key-value store")]
#[command(version)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:5000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Set {
        /// The key to set
        key: String,

        /// JSON value; anything that does not parse is stored as a string
        value: String,
    },

    /// Delete a key
    Del {
        /// The key to delete
        key: String,
    },

    /// Ping the server
    Ping,

    /// Add a node to the cluster (send to the leader)
    Join {
        /// Raft id of the new node
        id: u64,

        /// Raft address of the new node
        addr: String,
    },

    /// Remove a node from the cluster
    Remove {
        /// Raft id of the node to remove
        id: u64,
    },

    /// Show node and cluster status
    Stats,

    /// Set generated values for many keys at a steady rate
    Rset {
        /// Number of keys to write
        #[arg(short, long, default_value = "100")]
        count: u64,

        /// Pause between writes in milliseconds
        #[arg(short, long, default_value = "10")]
        interval_ms: u64,

        /// Key prefix
        #[arg(short, long, default_value = "key-")]
        prefix: String,
    },
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    match &args.command {
        Commands::Get { key } => {
            let response = send(&args.server, &Request::Get {
                key: key.as_bytes().to_vec(),
            })?;
            match response.status {
                Status::Ok => println!("{}", pretty(&response)),
                Status::NotFound => println!("(not found)"),
                _ => return Err(failure(&response)),
            }
        }
        Commands::Set { key, value } => {
            let value: Value =
                serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.clone()));
            let response = send(&args.server, &Request::Put {
                key: key.as_bytes().to_vec(),
                value: serde_json::to_vec(&value)?,
            })?;
            expect_ok(&response)?;
            println!("OK {}", pretty(&response));
        }
        Commands::Del { key } => {
            let response = send(&args.server, &Request::Delete {
                key: key.as_bytes().to_vec(),
            })?;
            expect_ok(&response)?;
            println!("OK");
        }
        Commands::Ping => {
            let start = Instant::now();
            let response = send(&args.server, &Request::Ping)?;
            expect_ok(&response)?;
            println!(
                "{} ({:.2} ms)",
                response.payload_str().unwrap_or_default(),
                start.elapsed().as_secs_f64() * 1000.0
            );
        }
        Commands::Join { id, addr } => {
            let response = send(&args.server, &Request::Join {
                id: *id,
                addr: addr.clone(),
            })?;
            expect_ok(&response)?;
            println!("node {} joined", id);
        }
        Commands::Remove { id } => {
            let response = send(&args.server, &Request::Remove { id: *id })?;
            expect_ok(&response)?;
            println!("node {} removed", id);
        }
        Commands::Stats => {
            // Stats describe the node asked, so no redirect
            let response = exchange(&args.server, &Request::Stats)?;
            expect_ok(&response)?;
            println!("{}", response.payload_str().unwrap_or_default());
        }
        Commands::Rset {
            count,
            interval_ms,
            prefix,
        } => rset(&args.server, *count, Duration::from_millis(*interval_ms), prefix)?,
    }
    Ok(())
}

fn rset(server: &str, count: u64, interval: Duration, prefix: &str) -> Result<()> {
    let start = Instant::now();
    let mut failed = 0u64;

    for i in 0..count {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let value = json!({ "seq": i, "token": crc32fast::hash(&nanos.to_be_bytes()) });
        let request = Request::Put {
            key: format!("{}{}", prefix, i).into_bytes(),
            value: serde_json::to_vec(&value)?,
        };

        match send_retrying(server, &request) {
            Ok(()) => {}
            Err(e) => {
                failed += 1;
                eprintln!("{}{}: {}", prefix, i, e);
            }
        }

        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }

    println!(
        "wrote {} of {} keys in {:.2}s",
        count - failed,
        count,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

/// Send a write, retrying while the cluster reports a transient condition
fn send_retrying(server: &str, request: &Request) -> Result<()> {
    let mut attempt = 1;
    loop {
        match send(server, request).and_then(|r| expect_ok(&r)) {
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                attempt += 1;
                thread::sleep(RETRY_BACKOFF * attempt as u32);
            }
            outcome => return outcome,
        }
    }
}

/// Send a request, following NOT_LEADER redirects
fn send(server: &str, request: &Request) -> Result<Response> {
    let mut target = server.to_string();
    for _ in 0..=MAX_REDIRECTS {
        let response = exchange(&target, request)?;
        if response.status != Status::NotLeader {
            return Ok(response);
        }
        match response.payload_str() {
            Some(leader) if !leader.is_empty() && leader != target => target = leader,
            _ => return Err(LedgerError::NotLeader { leader: None }),
        }
    }
    Err(LedgerError::Network(format!(
        "gave up after {} redirects",
        MAX_REDIRECTS
    )))
}

fn exchange(server: &str, request: &Request) -> Result<Response> {
    let stream = TcpStream::connect(server)
        .map_err(|e| LedgerError::Network(format!("connect {}: {}", server, e)))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    write_request(&mut writer, request)?;
    read_response(&mut reader)
}

fn expect_ok(response: &Response) -> Result<()> {
    match response.status {
        Status::Ok => Ok(()),
        _ => Err(failure(response)),
    }
}

fn failure(response: &Response) -> LedgerError {
    match response.status {
        Status::NotLeader => LedgerError::NotLeader {
            leader: response.payload_str().filter(|s| !s.is_empty()),
        },
        _ => LedgerError::Network(
            response
                .payload_str()
                .unwrap_or_else(|| format!("{:?}", response.status)),
        ),
    }
}

/// Payload as indented JSON, raw text if it is not JSON
fn pretty(response: &Response) -> String {
    let Some(payload) = &response.payload else {
        return String::new();
    };
    match serde_json::from_slice::<Value>(payload) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_default(),
        Err(_) => String::from_utf8_lossy(payload).into_owned(),
    }
}
