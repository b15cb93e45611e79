//! End-to-end tests for replicated nodes
//!
//! These tests verify:
//! - A bootstrapped node elects itself and serves SET / GET / DELETE
//! - The client protocol over TCP against a live node
//! - Restart recovery from the raft log and from snapshots
//! - Joining a second node that catches up through a snapshot
//! - Membership changes that would break the cluster are refused
//! - Waiters see Timeout or LeadershipLost when a quorum is unreachable
//! - A follower promoted to leader serves earlier writes
//!
//! Every node binds `127.0.0.1:0` for both listeners, so tests can run in
//! parallel.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ledgerkv::api::{ClusterApi, StoreApi};
use ledgerkv::consensus::{start_node, RaftNode};
use ledgerkv::network::Server;
use ledgerkv::protocol::{read_response, write_request, Request, Response, Status};
use ledgerkv::{Config, Engine, LedgerError};
use serde_json::json;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const WAIT: Duration = Duration::from_secs(15);

fn node_config(volume: &Path, node_id: u64) -> Config {
    Config::builder()
        .server_bind("127.0.0.1:0")
        .raft_bind("127.0.0.1:0")
        .node_id(node_id)
        .volume(volume)
        .request_timeout_ms(10_000)
        .build()
}

fn start(config: &Config, bootstrap: bool) -> (Arc<Engine>, RaftNode) {
    let engine = Arc::new(Engine::open(config.clone()).unwrap());
    let node = start_node(config, Arc::clone(&engine), "127.0.0.1:0", bootstrap).unwrap();
    (engine, node)
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("timed out waiting for {}", what);
}

/// Voter id that never starts; joining it leaves a two-node quorum unreachable
const ABSENT_VOTER: u64 = 99;

fn node_config_with_timeout(volume: &Path, node_id: u64, timeout_ms: u64) -> Config {
    Config {
        request_timeout_ms: timeout_ms,
        ..node_config(volume, node_id)
    }
}

fn is_leader(node: &RaftNode) -> bool {
    node.handle()
        .stats()
        .map(|stats| stats.state == "Leader")
        .unwrap_or(false)
}

fn wait_for_leader(node: &RaftNode) {
    let handle = node.handle();
    wait_until("leadership", || {
        handle
            .stats()
            .map(|stats| stats.state == "Leader")
            .unwrap_or(false)
    });
}

/// Stop the node and hand back exclusive ownership of the engine
fn stop(node: RaftNode, engine: Arc<Engine>) {
    node.shutdown();
    let mut engine = engine;
    let deadline = Instant::now() + WAIT;
    loop {
        match Arc::try_unwrap(engine) {
            Ok(engine) => {
                engine.close().unwrap();
                return;
            }
            Err(shared) if Instant::now() < deadline => {
                engine = shared;
                thread::sleep(Duration::from_millis(20));
            }
            Err(_) => panic!("engine still shared after shutdown"),
        }
    }
}

struct RunningServer {
    server: Arc<Server>,
    thread: Option<JoinHandle<()>>,
}

impl RunningServer {
    fn spawn(config: &Config, node: &RaftNode) -> Self {
        let server = Arc::new(Server::bind(config).unwrap());
        let store = StoreApi::new(node.handle());
        let cluster = ClusterApi::new(node.handle());
        let thread = {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                server.run(store, cluster).unwrap();
            })
        };
        Self {
            server,
            thread: Some(thread),
        }
    }

    fn addr(&self) -> String {
        self.server.local_addr().to_string()
    }

    fn request(&self, request: &Request) -> Response {
        let stream = TcpStream::connect(self.addr()).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = BufWriter::new(stream);
        write_request(&mut writer, request).unwrap();
        read_response(&mut reader).unwrap()
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.server.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// =============================================================================
// Single Node Tests
// =============================================================================

#[test]
fn test_bootstrapped_node_serves_commands() {
    let temp = TempDir::new().unwrap();
    let config = node_config(temp.path(), 1);
    let (engine, node) = start(&config, true);
    wait_for_leader(&node);

    let store = StoreApi::new(node.handle());
    let value = json!({"owner": "ops", "limit": 10});

    assert_eq!(store.put("acct", value.clone()).unwrap(), value);
    assert_eq!(store.get("acct").unwrap(), Some(value));
    // The local engine holds the applied value as JSON
    assert_eq!(
        engine.get(b"acct").unwrap(),
        Some(br#"{"limit":10,"owner":"ops"}"#.to_vec())
    );

    store.delete("acct").unwrap();
    assert_eq!(store.get("acct").unwrap(), None);
    store.delete("acct").unwrap();

    let stats = node.handle().stats().unwrap();
    assert_eq!(stats.node_id, 1);
    assert_eq!(stats.voters, vec![1]);
    assert!(stats.applied_index >= 5);
    assert_eq!(stats.pending_requests, 0);

    stop(node, engine);
}

#[test]
fn test_set_get_delete_then_miss() {
    let temp = TempDir::new().unwrap();
    let config = node_config(temp.path(), 2);
    let (engine, node) = start(&config, true);
    wait_for_leader(&node);
    let store = StoreApi::new(node.handle());

    assert_eq!(store.put("key0", json!("value0")).unwrap(), json!("value0"));
    assert_eq!(store.get("key0").unwrap(), Some(json!("value0")));
    store.delete("key0").unwrap();
    assert_eq!(store.get("key0").unwrap(), None);

    stop(node, engine);
}

#[test]
fn test_bootstrap_refused_on_existing_state() {
    let temp = TempDir::new().unwrap();
    let config = node_config(temp.path(), 1);
    {
        let (engine, node) = start(&config, true);
        wait_for_leader(&node);
        StoreApi::new(node.handle()).put("k", json!(1)).unwrap();
        stop(node, engine);
    }

    let engine = Arc::new(Engine::open(config.clone()).unwrap());
    match start_node(&config, engine, "127.0.0.1:0", true) {
        Err(LedgerError::Config(msg)) => assert!(msg.contains("refusing to bootstrap")),
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("bootstrapped over existing state"),
    }
}

#[test]
fn test_restart_recovers_from_log() {
    let temp = TempDir::new().unwrap();
    let config = node_config(temp.path(), 3);
    {
        let (engine, node) = start(&config, true);
        wait_for_leader(&node);
        let store = StoreApi::new(node.handle());
        store.put("a", json!("one")).unwrap();
        store.put("b", json!("two")).unwrap();
        store.delete("a").unwrap();
        stop(node, engine);
    }

    let (engine, node) = start(&config, false);
    wait_for_leader(&node);
    let store = StoreApi::new(node.handle());

    assert_eq!(store.get("a").unwrap(), None);
    assert_eq!(store.get("b").unwrap(), Some(json!("two")));
    store.put("c", json!(3)).unwrap();
    assert_eq!(store.get("c").unwrap(), Some(json!(3)));

    stop(node, engine);
}

#[test]
fn test_snapshot_taken_and_used_on_restart() {
    let temp = TempDir::new().unwrap();
    let config = Config {
        snapshot_threshold: 5,
        ..node_config(temp.path(), 4)
    };
    {
        let (engine, node) = start(&config, true);
        wait_for_leader(&node);
        let store = StoreApi::new(node.handle());
        for i in 0..12 {
            store.put(&format!("key{}", i), json!(i)).unwrap();
        }

        let handle = node.handle();
        wait_until("a snapshot", || {
            handle
                .stats()
                .map(|stats| stats.last_snapshot_index > 0)
                .unwrap_or(false)
        });
        let stats = handle.stats().unwrap();
        assert!(stats.snapshots_retained >= 1);
        assert!(stats.first_log_index > 1);
        stop(node, engine);
    }

    let (engine, node) = start(&config, false);
    wait_for_leader(&node);
    let store = StoreApi::new(node.handle());
    for i in 0..12 {
        assert_eq!(store.get(&format!("key{}", i)).unwrap(), Some(json!(i)));
    }

    stop(node, engine);
}

#[test]
fn test_follower_rejects_writes_before_election() {
    let temp = TempDir::new().unwrap();
    let config = node_config(temp.path(), 5);
    // Not bootstrapped and no peers: it never learns of a leader
    let (engine, node) = start(&config, false);

    let result = StoreApi::new(node.handle()).put("k", json!(1));
    assert!(matches!(result, Err(LedgerError::NotLeader { leader: None })));
    assert!(ClusterApi::new(node.handle()).join(9, "127.0.0.1:1").is_err());

    stop(node, engine);
}

#[test]
fn test_join_validates_arguments() {
    let temp = TempDir::new().unwrap();
    let config = node_config(temp.path(), 6);
    let (engine, node) = start(&config, true);
    wait_for_leader(&node);
    let cluster = ClusterApi::new(node.handle());

    assert!(cluster.join(0, "127.0.0.1:7000").is_err());
    assert!(cluster.join(7, "").is_err());

    stop(node, engine);
}

// =============================================================================
// Client Protocol Tests
// =============================================================================

#[test]
fn test_tcp_client_roundtrip() {
    let temp = TempDir::new().unwrap();
    let config = node_config(temp.path(), 10);
    let (engine, node) = start(&config, true);
    wait_for_leader(&node);
    let server = RunningServer::spawn(&config, &node);

    let pong = server.request(&Request::Ping);
    assert_eq!(pong.payload_str().as_deref(), Some("PONG"));

    let put = server.request(&Request::Put {
        key: b"color".to_vec(),
        value: br#"["red","green"]"#.to_vec(),
    });
    assert_eq!(put.status, Status::Ok);
    assert_eq!(put.payload_str().as_deref(), Some(r#"["red","green"]"#));

    let get = server.request(&Request::Get {
        key: b"color".to_vec(),
    });
    assert_eq!(get.status, Status::Ok);
    assert_eq!(get.payload_str().as_deref(), Some(r#"["red","green"]"#));

    let del = server.request(&Request::Delete {
        key: b"color".to_vec(),
    });
    assert_eq!(del.status, Status::Ok);

    let miss = server.request(&Request::Get {
        key: b"color".to_vec(),
    });
    assert_eq!(miss.status, Status::NotFound);

    let bad = server.request(&Request::Put {
        key: b"k".to_vec(),
        value: b"{not json".to_vec(),
    });
    assert_eq!(bad.status, Status::Error);

    let stats = server.request(&Request::Stats);
    assert_eq!(stats.status, Status::Ok);
    let parsed: serde_json::Value = serde_json::from_slice(&stats.payload.unwrap()).unwrap();
    assert_eq!(parsed["node_id"], json!(10));
    assert_eq!(parsed["state"], json!("Leader"));

    drop(server);
    stop(node, engine);
}

#[test]
fn test_tcp_follower_answers_not_leader() {
    let temp = TempDir::new().unwrap();
    let config = node_config(temp.path(), 11);
    let (engine, node) = start(&config, false);
    let server = RunningServer::spawn(&config, &node);

    let response = server.request(&Request::Put {
        key: b"k".to_vec(),
        value: b"1".to_vec(),
    });
    assert_eq!(response.status, Status::NotLeader);
    assert_eq!(response.payload, None);

    drop(server);
    stop(node, engine);
}

// =============================================================================
// Membership Tests
// =============================================================================

#[test]
fn test_joined_node_receives_replicated_state() {
    let leader_dir = TempDir::new().unwrap();
    let leader_config = node_config(leader_dir.path(), 21);
    let (leader_engine, leader) = start(&leader_config, true);
    wait_for_leader(&leader);

    let store = StoreApi::new(leader.handle());
    store.put("before", json!("join")).unwrap();

    let follower_dir = TempDir::new().unwrap();
    let follower_config = node_config(follower_dir.path(), 22);
    let (follower_engine, follower) = start(&follower_config, false);

    ClusterApi::new(leader.handle())
        .join(follower.id(), follower.raft_addr())
        .unwrap();

    store.put("after", json!("join")).unwrap();

    wait_until("replication to the new node", || {
        follower_engine.get(b"before").ok().flatten().is_some()
            && follower_engine.get(b"after").ok().flatten().is_some()
    });

    let stats = leader.handle().stats().unwrap();
    assert_eq!(stats.voters, vec![21, 22]);
    assert!(stats.peers.contains_key(&22));

    // Writes on the follower are redirected to the leader
    match StoreApi::new(follower.handle()).put("x", json!(1)) {
        Err(LedgerError::NotLeader { .. }) => {}
        other => panic!("expected NotLeader, got {:?}", other),
    }

    stop(follower, follower_engine);
    stop(leader, leader_engine);
}

#[test]
fn test_sole_voter_cannot_be_removed() {
    let temp = TempDir::new().unwrap();
    let config = node_config(temp.path(), 30);
    {
        let (engine, node) = start(&config, true);
        wait_for_leader(&node);
        let cluster = ClusterApi::new(node.handle());

        match cluster.remove(30) {
            Err(LedgerError::Membership(msg)) => assert!(msg.contains("last voter")),
            other => panic!("expected Membership error, got {:?}", other),
        }
        match cluster.remove(77) {
            Err(LedgerError::Membership(msg)) => assert!(msg.contains("not a member")),
            other => panic!("expected Membership error, got {:?}", other),
        }

        // The node keeps serving after the refusal
        let store = StoreApi::new(node.handle());
        store.put("alive", json!(true)).unwrap();
        assert_eq!(store.get("alive").unwrap(), Some(json!(true)));
        assert_eq!(node.handle().stats().unwrap().voters, vec![30]);
        stop(node, engine);
    }

    let (engine, node) = start(&config, false);
    wait_for_leader(&node);
    let store = StoreApi::new(node.handle());
    assert_eq!(store.get("alive").unwrap(), Some(json!(true)));
    store.put("after", json!("restart")).unwrap();
    assert_eq!(store.get("after").unwrap(), Some(json!("restart")));
    assert_eq!(node.handle().stats().unwrap().voters, vec![30]);

    stop(node, engine);
}

#[test]
fn test_join_then_remove_follower() {
    let leader_dir = TempDir::new().unwrap();
    let leader_config = node_config(leader_dir.path(), 32);
    let (leader_engine, leader) = start(&leader_config, true);
    wait_for_leader(&leader);
    let store = StoreApi::new(leader.handle());
    let cluster = ClusterApi::new(leader.handle());
    store.put("before", json!(1)).unwrap();

    let follower_dir = TempDir::new().unwrap();
    let follower_config = node_config(follower_dir.path(), 33);
    let (follower_engine, follower) = start(&follower_config, false);
    let follower_addr = follower.raft_addr().to_string();
    cluster.join(33, &follower_addr).unwrap();
    wait_until("the new node to catch up", || {
        follower_engine.get(b"before").ok().flatten().is_some()
    });

    // Re-joining an existing voter, or the leader itself, is refused
    assert!(matches!(
        cluster.join(33, "127.0.0.1:1"),
        Err(LedgerError::Membership(_))
    ));
    assert!(matches!(
        cluster.join(32, "127.0.0.1:1"),
        Err(LedgerError::Membership(_))
    ));
    let stats = leader.handle().stats().unwrap();
    assert_eq!(stats.peers.get(&33), Some(&follower_addr));
    assert_eq!(
        stats.peers.get(&32).map(String::as_str),
        Some(leader.raft_addr())
    );

    cluster.remove(33).unwrap();

    let stats = leader.handle().stats().unwrap();
    assert_eq!(stats.voters, vec![32]);
    assert!(!stats.peers.contains_key(&33));

    // A single voter again: writes commit without the removed node
    stop(follower, follower_engine);
    store.put("after", json!(2)).unwrap();
    assert_eq!(store.get("after").unwrap(), Some(json!(2)));

    stop(leader, leader_engine);
}

// =============================================================================
// Failure Tests
// =============================================================================

#[test]
fn test_write_times_out_without_quorum() {
    let temp = TempDir::new().unwrap();
    let config = node_config_with_timeout(temp.path(), 34, 300);
    let (engine, node) = start(&config, true);
    wait_for_leader(&node);

    // Commits on the single-voter configuration, then the quorum is two
    ClusterApi::new(node.handle())
        .join(ABSENT_VOTER, "127.0.0.1:1")
        .unwrap();

    match StoreApi::new(node.handle()).put("k", json!(1)) {
        Err(LedgerError::Timeout(ms)) => assert_eq!(ms, 300),
        other => panic!("expected Timeout, got {:?}", other),
    }

    stop(node, engine);
}

#[test]
fn test_waiters_fail_when_leader_steps_down() {
    let temp = TempDir::new().unwrap();
    let config = node_config(temp.path(), 36);
    let (engine, node) = start(&config, true);
    wait_for_leader(&node);

    ClusterApi::new(node.handle())
        .join(ABSENT_VOTER, "127.0.0.1:1")
        .unwrap();

    // The absent voter never answers, so the leader loses its quorum and
    // steps down while the write is pending
    let started = Instant::now();
    match StoreApi::new(node.handle()).put("k", json!(1)) {
        Err(LedgerError::LeadershipLost) => {}
        other => panic!("expected LeadershipLost, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(10));

    let stats = node.handle().stats().unwrap();
    assert_ne!(stats.state, "Leader");
    assert_eq!(stats.pending_requests, 0);

    stop(node, engine);
}

#[test]
fn test_new_leader_serves_earlier_writes() {
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let configs: Vec<Config> = dirs
        .iter()
        .zip([41u64, 42, 43])
        .map(|(dir, id)| node_config(dir.path(), id))
        .collect();

    let (first_engine, first) = start(&configs[0], true);
    wait_for_leader(&first);
    let store = StoreApi::new(first.handle());
    let cluster = ClusterApi::new(first.handle());

    let mut others = Vec::new();
    for config in &configs[1..] {
        let (engine, node) = start(config, false);
        cluster.join(node.id(), node.raft_addr()).unwrap();
        store.put("marker", json!(node.id())).unwrap();
        wait_until("the new node to catch up", || {
            engine.get(b"marker").ok().flatten() == Some(node.id().to_string().into_bytes())
        });
        others.push((engine, node));
    }
    assert_eq!(first.handle().stats().unwrap().voters, vec![41, 42, 43]);

    store.put("ledger", json!({"balance": 100})).unwrap();
    stop(first, first_engine);

    wait_until("a new leader", || others.iter().any(|(_, node)| is_leader(node)));
    let (_, new_leader) = others
        .iter()
        .find(|(_, node)| is_leader(node))
        .unwrap();

    let store = StoreApi::new(new_leader.handle());
    assert_eq!(
        store.get("ledger").unwrap(),
        Some(json!({"balance": 100}))
    );
    store.put("ledger", json!({"balance": 90})).unwrap();
    assert_eq!(store.get("ledger").unwrap(), Some(json!({"balance": 90})));

    for (engine, node) in others {
        stop(node, engine);
    }
}
