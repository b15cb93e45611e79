//! Raft Node
//!
//! A single worker thread owns the `RawNode`, the durable log and the state
//! machine. Everything else talks to it through [`RaftHandle`] over channels,
//! so no raft state is ever shared between threads.
//!
//! ## Event Loop
//! Each iteration waits for a client request, a peer message, a finished
//! snapshot or the next tick, then drains `Ready`:
//!
//! ```text
//!   send messages → install snapshot → apply committed → persist entries
//!   → persist hard state → send persisted messages → advance
//!   → (LightReady) commit, messages, committed entries → advance_apply
//! ```
//!
//! ## Request Matching
//! Proposals carry a 16 byte tag in the entry context: this node's id and a
//! request id. Only the node that proposed an entry finds a waiter for it;
//! every other node applies it and drops the result.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{select, unbounded, Receiver, RecvTimeoutError, Sender};
use prost::Message as ProstMessage;
use raft::eraftpb::{
    ConfChange, ConfChangeType, ConfChangeV2, ConfState, Entry, EntryType, Message, Snapshot,
};
use raft::{RawNode, StateRole, Storage};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{LedgerError, Result};
use crate::fsm::{ApplyResult, Command, FsmSnapshot, SnapshotSink, StateMachine};

use super::log_cache::LogCache;
use super::log_store::RaftLogStore;
use super::peers::PeerBook;
use super::transport::{Inbound, Transport};

/// Raft logical clock interval
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Ticks without a leader before a follower campaigns (~1s)
pub const ELECTION_TICK: usize = 10;

/// Ticks between leader heartbeats (~300ms)
pub const HEARTBEAT_TICK: usize = 3;

/// Extra time a waiter is kept after its caller gave up
const PENDING_GRACE: Duration = Duration::from_secs(1);

// =============================================================================
// Public Types
// =============================================================================

/// Reported once per change of role or leader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipEvent {
    pub node_id: u64,
    pub role: StateRole,
    pub leader_id: u64,
    pub term: u64,
}

impl LeadershipEvent {
    pub fn is_leader(&self) -> bool {
        self.role == StateRole::Leader
    }
}

/// Membership changes a leader can propose
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    AddVoter { id: u64, addr: String },
    Remove { id: u64 },
}

/// Point-in-time view of the node, served by `stats`
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub node_id: u64,
    pub raft_addr: String,
    pub api_addr: String,
    pub state: String,
    pub leader_id: u64,
    pub leader_addr: Option<String>,
    pub term: u64,
    pub first_log_index: u64,
    pub last_log_index: u64,
    pub commit_index: u64,
    pub applied_index: u64,
    pub last_snapshot_index: u64,
    pub last_snapshot_term: u64,
    pub snapshots_retained: usize,
    pub voters: Vec<u64>,
    pub learners: Vec<u64>,
    pub peers: BTreeMap<u64, String>,
    pub pending_requests: usize,
}

/// Tunables the worker needs
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub id: u64,
    pub snapshot_threshold: u64,
    pub snapshot_interval: Duration,
    pub request_timeout: Duration,
}

// =============================================================================
// Handle
// =============================================================================

type ApplyReply = Sender<Result<Option<ApplyResult>>>;
type MembershipReply = Sender<Result<()>>;

enum Request {
    Propose {
        command: Vec<u8>,
        reply: ApplyReply,
    },
    ChangeMembership {
        change: MembershipChange,
        reply: MembershipReply,
    },
    Stats {
        reply: Sender<NodeStats>,
    },
    Shutdown,
}

/// Cloneable entry point to a running node
#[derive(Clone)]
pub struct RaftHandle {
    id: u64,
    requests: Sender<Request>,
    request_timeout: Duration,
}

impl RaftHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Replicate `command` and wait until this node has applied it
    ///
    /// Fails fast with `NotLeader` on a follower. `Timeout` and
    /// `LeadershipLost` leave the outcome unknown: the entry may still commit.
    pub fn propose(&self, command: &Command) -> Result<Option<ApplyResult>> {
        let (reply, rx) = unbounded();
        self.send(Request::Propose {
            command: command.encode()?,
            reply,
        })?;
        self.wait(rx)
    }

    /// Propose a membership change and wait for it to take effect
    pub fn change_membership(&self, change: MembershipChange) -> Result<()> {
        let (reply, rx) = unbounded();
        self.send(Request::ChangeMembership { change, reply })?;
        self.wait(rx)
    }

    pub fn stats(&self) -> Result<NodeStats> {
        let (reply, rx) = unbounded();
        self.send(Request::Stats { reply })?;
        match rx.recv_timeout(self.request_timeout) {
            Ok(stats) => Ok(stats),
            Err(RecvTimeoutError::Timeout) => {
                Err(LedgerError::Timeout(self.request_timeout.as_millis() as u64))
            }
            Err(RecvTimeoutError::Disconnected) => Err(LedgerError::NodeStopped),
        }
    }

    /// Ask the worker to stop; pending requests fail with `NodeStopped`
    pub fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown);
    }

    fn send(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| LedgerError::NodeStopped)
    }

    fn wait<T>(&self, rx: Receiver<Result<T>>) -> Result<T> {
        match rx.recv_timeout(self.request_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                Err(LedgerError::Timeout(self.request_timeout.as_millis() as u64))
            }
            Err(RecvTimeoutError::Disconnected) => Err(LedgerError::NodeStopped),
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

enum Reply {
    Apply(ApplyReply),
    Membership(MembershipReply),
}

impl Reply {
    fn fail(self, err: LedgerError) {
        match self {
            Reply::Apply(tx) => {
                let _ = tx.send(Err(err));
            }
            Reply::Membership(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

struct Pending {
    reply: Reply,
    deadline: Instant,
}

enum Event {
    Request(Request),
    Peer(Inbound),
    Snapshot(SnapshotOutcome),
    Idle,
    Stop,
}

enum SnapshotOutcome {
    Stored { index: u64, term: u64 },
    Failed { index: u64, error: LedgerError },
}

/// Everything the worker owns, assembled by the bootstrap code
pub(crate) struct WorkerParts {
    pub options: NodeOptions,
    pub raw: RawNode<LogCache>,
    pub cache: LogCache,
    pub log_store: RaftLogStore,
    pub fsm: Box<dyn StateMachine>,
    pub transport: Arc<Transport>,
    pub inbound: Receiver<Inbound>,
    pub peers: PeerBook,
    pub api_addr: String,
    pub conf_state: ConfState,
    pub applied: u64,
    pub last_snapshot: (u64, u64),
    pub leadership: Sender<LeadershipEvent>,
}

struct Worker {
    options: NodeOptions,
    raw: RawNode<LogCache>,
    cache: LogCache,
    log_store: RaftLogStore,
    fsm: Box<dyn StateMachine>,
    transport: Arc<Transport>,
    api_addr: String,

    /// Raft address of each known node
    peers: PeerBook,
    /// Client address of each node we have heard from
    api_addrs: HashMap<u64, String>,

    requests: Receiver<Request>,
    inbound: Receiver<Inbound>,
    snapshot_tx: Sender<SnapshotOutcome>,
    snapshot_rx: Receiver<SnapshotOutcome>,
    leadership: Sender<LeadershipEvent>,

    pending: HashMap<u64, Pending>,
    next_request: u64,

    conf_state: ConfState,
    applied: u64,
    last_snapshot: (u64, u64),
    snapshot_in_flight: bool,
    last_snapshot_check: Instant,

    last_role: StateRole,
    last_leader: u64,
}

/// Start the worker thread and return its handle
pub(crate) fn spawn_worker(parts: WorkerParts) -> Result<RaftHandle> {
    let (requests_tx, requests_rx) = unbounded();
    let (snapshot_tx, snapshot_rx) = unbounded();

    let id = parts.options.id;
    let request_timeout = parts.options.request_timeout;

    let mut peers = parts.peers;
    peers.insert(id, parts.transport.local_addr());
    let mut api_addrs = HashMap::new();
    api_addrs.insert(id, parts.api_addr.clone());

    // Request ids continue past a restart so old log entries never match
    let next_request = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_millis() as u64) << 16)
        .unwrap_or(1);

    let mut worker = Worker {
        options: parts.options,
        raw: parts.raw,
        cache: parts.cache,
        log_store: parts.log_store,
        fsm: parts.fsm,
        transport: parts.transport,
        api_addr: parts.api_addr,
        peers,
        api_addrs,
        requests: requests_rx,
        inbound: parts.inbound,
        snapshot_tx,
        snapshot_rx,
        leadership: parts.leadership,
        pending: HashMap::new(),
        next_request,
        conf_state: parts.conf_state,
        applied: parts.applied,
        last_snapshot: parts.last_snapshot,
        snapshot_in_flight: false,
        last_snapshot_check: Instant::now(),
        last_role: StateRole::Follower,
        last_leader: 0,
    };

    thread::Builder::new()
        .name(format!("raft-worker-{}", id))
        .spawn(move || {
            if let Err(e) = worker.run() {
                error!(node = id, error = %e, "raft worker stopped on fatal error");
            }
            worker.stop();
        })?;

    Ok(RaftHandle {
        id,
        requests: requests_tx,
        request_timeout,
    })
}

impl Worker {
    fn id(&self) -> u64 {
        self.options.id
    }

    fn run(&mut self) -> Result<()> {
        let mut last_tick = Instant::now();
        info!(node = self.id(), applied = self.applied, "raft worker started");

        loop {
            let timeout = TICK_INTERVAL
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);

            let event = select! {
                recv(self.requests) -> request => match request {
                    Ok(Request::Shutdown) | Err(_) => Event::Stop,
                    Ok(request) => Event::Request(request),
                },
                recv(self.inbound) -> inbound => match inbound {
                    Ok(inbound) => Event::Peer(inbound),
                    Err(_) => Event::Stop,
                },
                recv(self.snapshot_rx) -> outcome => match outcome {
                    Ok(outcome) => Event::Snapshot(outcome),
                    Err(_) => Event::Idle,
                },
                default(timeout) => Event::Idle,
            };

            match event {
                Event::Stop => break,
                Event::Request(request) => self.handle_request(request),
                Event::Peer(inbound) => self.step(inbound),
                Event::Snapshot(outcome) => self.finish_snapshot(outcome)?,
                Event::Idle => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.raw.tick();
                last_tick = Instant::now();
                self.expire_pending();
            }

            self.process_ready()?;
            self.observe_leadership();
            self.maybe_snapshot()?;
        }

        info!(node = self.id(), "raft worker shutting down");
        Ok(())
    }

    fn stop(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.reply.fail(LedgerError::NodeStopped);
        }
        self.transport.shutdown();
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Propose { command, reply } => {
                if let Err(e) = self.check_leader() {
                    let _ = reply.send(Err(e));
                    return;
                }
                let (request_id, tag) = self.next_tag();
                match self.raw.propose(tag, command) {
                    Ok(()) => self.track(request_id, Reply::Apply(reply)),
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            Request::ChangeMembership { change, reply } => {
                if let Err(e) = self.check_leader() {
                    let _ = reply.send(Err(e));
                    return;
                }
                if self.raw.raft.pending_conf_index > self.raw.raft.raft_log.applied {
                    let _ = reply.send(Err(LedgerError::Raft(raft::Error::ProposalDropped)));
                    return;
                }
                if let Err(e) = check_membership(&self.conf_state, &change) {
                    warn!(node = self.id(), ?change, error = %e, "membership change rejected");
                    let _ = reply.send(Err(e));
                    return;
                }
                let (request_id, tag) = self.next_tag();
                match self.raw.propose_conf_change(tag, membership_to_conf_change(&change)) {
                    Ok(()) => {
                        info!(node = self.id(), ?change, "membership change proposed");
                        self.track(request_id, Reply::Membership(reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            Request::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Request::Shutdown => {}
        }
    }

    fn check_leader(&self) -> Result<()> {
        if self.raw.raft.state == StateRole::Leader {
            return Ok(());
        }
        let leader = self.raw.raft.leader_id;
        Err(LedgerError::NotLeader {
            leader: self.api_addrs.get(&leader).cloned(),
        })
    }

    fn next_tag(&mut self) -> (u64, Vec<u8>) {
        let request_id = self.next_request;
        self.next_request += 1;
        let mut tag = Vec::with_capacity(16);
        tag.extend_from_slice(&self.id().to_be_bytes());
        tag.extend_from_slice(&request_id.to_be_bytes());
        (request_id, tag)
    }

    fn track(&mut self, request_id: u64, reply: Reply) {
        let deadline = Instant::now() + self.options.request_timeout + PENDING_GRACE;
        self.pending.insert(request_id, Pending { reply, deadline });
    }

    /// Request id of an entry this node proposed
    fn own_request(&self, context: &[u8]) -> Option<u64> {
        if context.len() != 16 {
            return None;
        }
        let mut node = [0u8; 8];
        node.copy_from_slice(&context[..8]);
        if u64::from_be_bytes(node) != self.id() {
            return None;
        }
        let mut request = [0u8; 8];
        request.copy_from_slice(&context[8..]);
        Some(u64::from_be_bytes(request))
    }

    fn expire_pending(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                let waited = self.options.request_timeout.as_millis() as u64;
                pending.reply.fail(LedgerError::Timeout(waited));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Peer messages
    // -------------------------------------------------------------------------

    fn step(&mut self, inbound: Inbound) {
        let from = inbound.message.from;
        if from != 0 && from != self.id() {
            if !inbound.from_addr.is_empty() {
                self.peers.insert(from, &inbound.from_addr);
            }
            if !inbound.api_addr.is_empty() {
                self.api_addrs.insert(from, inbound.api_addr);
            }
        }

        match self.raw.step(inbound.message) {
            Ok(()) => {}
            // Messages from removed or unknown peers are expected during membership changes
            Err(raft::Error::StepPeerNotFound) | Err(raft::Error::StepLocalMsg) => {}
            Err(e) => debug!(node = self.id(), from, error = %e, "step failed"),
        }
    }

    fn send_messages(&mut self, messages: Vec<Message>) {
        for message in messages {
            let to = message.to;
            match self.peers.get(to) {
                Some(addr) => self.transport.send(to, addr, message),
                None => debug!(node = self.id(), to, "no address for peer, dropping message"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Ready handling
    // -------------------------------------------------------------------------

    fn process_ready(&mut self) -> Result<()> {
        while self.raw.has_ready() {
            let mut ready = self.raw.ready();

            if !ready.messages().is_empty() {
                self.send_messages(ready.take_messages());
            }

            if !ready.snapshot().is_empty() {
                self.install_snapshot(ready.snapshot().clone())?;
            }

            self.apply_committed(ready.take_committed_entries())?;

            if !ready.entries().is_empty() {
                self.log_store.append(ready.entries())?;
                self.cache.mem().wl().append(ready.entries())?;
            }

            if let Some(hs) = ready.hs() {
                self.log_store.set_hard_state(hs)?;
                self.cache.mem().wl().set_hardstate(hs.clone());
            }

            if !ready.persisted_messages().is_empty() {
                self.send_messages(ready.take_persisted_messages());
            }

            let mut light_ready = self.raw.advance(ready);

            if let Some(commit) = light_ready.commit_index() {
                let hs = {
                    let mut core = self.cache.mem().wl();
                    core.mut_hard_state().set_commit(commit);
                    core.hard_state().clone()
                };
                self.log_store.set_hard_state(&hs)?;
            }

            self.send_messages(light_ready.take_messages());
            self.apply_committed(light_ready.take_committed_entries())?;
            self.raw.advance_apply();
        }
        Ok(())
    }

    fn apply_committed(&mut self, entries: Vec<Entry>) -> Result<()> {
        for entry in entries {
            if entry.index <= self.applied {
                continue;
            }

            match entry.entry_type() {
                EntryType::EntryNormal => self.apply_normal(&entry),
                EntryType::EntryConfChange => {
                    let cc = ConfChange::decode(&entry.data[..])?;
                    self.apply_conf_change(&entry, &cc)?;
                }
                EntryType::EntryConfChangeV2 => {
                    let cc = ConfChangeV2::decode(&entry.data[..])?;
                    let applied = self.raw.apply_conf_change(&cc);
                    self.commit_conf_state(&entry, applied)?;
                }
            }

            self.applied = entry.index;
        }
        Ok(())
    }

    fn apply_normal(&mut self, entry: &Entry) {
        // Empty entries come from a new leader, or replace a dropped conf change
        let result = if entry.data.is_empty() {
            None
        } else {
            Some(self.fsm.apply(entry))
        };

        let Some(request_id) = self.own_request(&entry.context[..]) else {
            return;
        };
        if let Some(pending) = self.pending.remove(&request_id) {
            match (pending.reply, result) {
                (Reply::Apply(tx), Some(result)) => {
                    let _ = tx.send(Ok(result));
                }
                (reply, _) => reply.fail(LedgerError::Raft(raft::Error::ProposalDropped)),
            }
        }
    }

    fn apply_conf_change(&mut self, entry: &Entry, cc: &ConfChange) -> Result<()> {
        let applied = self.raw.apply_conf_change(cc);
        if !self.commit_conf_state(entry, applied)? {
            return Ok(());
        }

        let node = cc.node_id;
        match cc.change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                let addr = String::from_utf8_lossy(&cc.context[..]).into_owned();
                if !addr.is_empty() && node != self.id() {
                    self.peers.insert(node, &addr);
                }
                info!(node = self.id(), added = node, "node added to cluster");
            }
            ConfChangeType::RemoveNode => {
                if node != self.id() {
                    self.peers.remove(node);
                    self.transport.remove_peer(node);
                }
                info!(node = self.id(), removed = node, "node removed from cluster");
            }
        }
        Ok(())
    }

    /// Persist the outcome of a committed conf change.
    ///
    /// A change raft refuses is skipped and its proposer gets the reason.
    /// Returns whether the change took effect.
    fn commit_conf_state(
        &mut self,
        entry: &Entry,
        applied: raft::Result<ConfState>,
    ) -> Result<bool> {
        match membership_outcome(applied)? {
            Ok(cs) => {
                self.store_conf_state(cs)?;
                self.complete_membership(entry, Ok(()));
                Ok(true)
            }
            Err(reason) => {
                warn!(node = self.id(), index = entry.index, %reason, "conf change skipped");
                self.complete_membership(entry, Err(LedgerError::Membership(reason)));
                Ok(false)
            }
        }
    }

    fn store_conf_state(&mut self, cs: ConfState) -> Result<()> {
        self.log_store.set_conf_state(&cs)?;
        self.cache.mem().wl().set_conf_state(cs.clone());
        self.conf_state = cs;
        Ok(())
    }

    fn complete_membership(&mut self, entry: &Entry, outcome: Result<()>) {
        let Some(request_id) = self.own_request(&entry.context[..]) else {
            return;
        };
        if let Some(pending) = self.pending.remove(&request_id) {
            match (pending.reply, outcome) {
                (Reply::Membership(tx), outcome) => {
                    let _ = tx.send(outcome);
                }
                (reply, _) => reply.fail(LedgerError::Raft(raft::Error::ProposalDropped)),
            }
        }
    }

    /// Replace local state with a snapshot sent by the leader
    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let (index, term) = {
            let md = snapshot.get_metadata();
            (md.index, md.term)
        };
        info!(node = self.id(), index, term, "installing snapshot from leader");

        self.cache.snapshots().save(&snapshot)?;
        let image = snapshot.data[..].to_vec();
        self.fsm.restore(Box::new(Cursor::new(image)))?;

        let conf_state = snapshot.get_metadata().get_conf_state().clone();
        self.cache.mem().wl().apply_snapshot(snapshot)?;

        let hs = self.cache.hard_state();
        self.log_store.compact(index, term, &[], &hs, &conf_state)?;

        self.conf_state = conf_state;
        self.applied = index;
        self.last_snapshot = (index, term);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    fn maybe_snapshot(&mut self) -> Result<()> {
        if self.snapshot_in_flight {
            return Ok(());
        }

        let behind = self.applied.saturating_sub(self.last_snapshot.0);
        let requested = self.cache.take_snapshot_request();
        let interval_due = self.last_snapshot_check.elapsed() >= self.options.snapshot_interval;
        if interval_due {
            self.last_snapshot_check = Instant::now();
        }

        let due = requested
            || (behind > 0 && behind >= self.options.snapshot_threshold)
            || (behind > 0 && interval_due);
        if !due || self.applied == 0 {
            return Ok(());
        }

        self.start_snapshot()
    }

    /// Capture on this thread, persist on another
    fn start_snapshot(&mut self) -> Result<()> {
        let index = self.applied;
        let term = self.cache.term(index)?;
        let mut view = self.fsm.snapshot()?;
        let sink = self
            .cache
            .snapshots()
            .create(index, term, &self.conf_state)?;

        self.snapshot_in_flight = true;
        debug!(node = self.id(), index, term, "snapshot started");

        let done = self.snapshot_tx.clone();
        thread::Builder::new()
            .name(format!("raft-snapshot-{}", index))
            .spawn(move || {
                let mut sink = sink;
                let stored = match view.persist(&mut sink) {
                    Ok(()) => sink.close().map(|_| ()),
                    Err(e) => {
                        let _ = sink.cancel();
                        Err(e)
                    }
                };
                view.release();

                let outcome = match stored {
                    Ok(()) => SnapshotOutcome::Stored { index, term },
                    Err(error) => SnapshotOutcome::Failed { index, error },
                };
                let _ = done.send(outcome);
            })?;
        Ok(())
    }

    fn finish_snapshot(&mut self, outcome: SnapshotOutcome) -> Result<()> {
        self.snapshot_in_flight = false;
        match outcome {
            SnapshotOutcome::Stored { index, term } => {
                if index <= self.last_snapshot.0 {
                    return Ok(());
                }
                self.last_snapshot = (index, term);

                // Keep the entry at `index` so its term stays answerable
                self.cache.mem().wl().compact(index)?;
                let retained = self.cache.entries_after(index);
                let hs = self.cache.hard_state();
                self.log_store
                    .compact(index, term, &retained, &hs, &self.conf_state)?;
                info!(node = self.id(), index, term, "log compacted to snapshot");
            }
            SnapshotOutcome::Failed { index, error } => {
                warn!(node = self.id(), index, error = %error, "snapshot failed");
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Leadership & stats
    // -------------------------------------------------------------------------

    fn observe_leadership(&mut self) {
        let role = self.raw.raft.state;
        let leader = self.raw.raft.leader_id;
        if role == self.last_role && leader == self.last_leader {
            return;
        }

        if self.last_role == StateRole::Leader && role != StateRole::Leader {
            for (_, pending) in self.pending.drain() {
                pending.reply.fail(LedgerError::LeadershipLost);
            }
        }

        self.last_role = role;
        self.last_leader = leader;
        let _ = self.leadership.send(LeadershipEvent {
            node_id: self.id(),
            role,
            leader_id: leader,
            term: self.raw.raft.term,
        });
    }

    fn stats(&self) -> NodeStats {
        let raft = &self.raw.raft;
        let snapshots_retained = self
            .cache
            .snapshots()
            .list()
            .map(|list| list.len())
            .unwrap_or(0);
        let mut voters = self.conf_state.voters.clone();
        voters.sort_unstable();
        let mut learners = self.conf_state.learners.clone();
        learners.sort_unstable();

        NodeStats {
            node_id: self.id(),
            raft_addr: self.transport.local_addr().to_string(),
            api_addr: self.api_addr.clone(),
            state: format!("{:?}", raft.state),
            leader_id: raft.leader_id,
            leader_addr: self.api_addrs.get(&raft.leader_id).cloned(),
            term: raft.term,
            first_log_index: self.cache.first_index().unwrap_or(0),
            last_log_index: self.cache.last_index().unwrap_or(0),
            commit_index: raft.raft_log.committed,
            applied_index: self.applied,
            last_snapshot_index: self.last_snapshot.0,
            last_snapshot_term: self.last_snapshot.1,
            snapshots_retained,
            voters,
            learners,
            peers: self.peers.addrs().clone(),
            pending_requests: self.pending.len(),
        }
    }
}

fn membership_to_conf_change(change: &MembershipChange) -> ConfChange {
    let mut cc = ConfChange::default();
    match change {
        MembershipChange::AddVoter { id, addr } => {
            cc.set_change_type(ConfChangeType::AddNode);
            cc.node_id = *id;
            cc.context = addr.clone().into_bytes().into();
        }
        MembershipChange::Remove { id } => {
            cc.set_change_type(ConfChangeType::RemoveNode);
            cc.node_id = *id;
        }
    }
    cc
}

/// Refuse changes that cannot apply against the current configuration
fn check_membership(conf_state: &ConfState, change: &MembershipChange) -> Result<()> {
    match change {
        MembershipChange::AddVoter { id, .. } => {
            if conf_state.voters.contains(id) {
                return Err(LedgerError::Membership(format!(
                    "node {} is already a voter",
                    id
                )));
            }
        }
        MembershipChange::Remove { id } => {
            let voter = conf_state.voters.contains(id);
            if !voter && !conf_state.learners.contains(id) {
                return Err(LedgerError::Membership(format!(
                    "node {} is not a member",
                    id
                )));
            }
            if voter && conf_state.voters.len() == 1 {
                return Err(LedgerError::Membership(format!(
                    "node {} is the last voter",
                    id
                )));
            }
        }
    }
    Ok(())
}

/// Split a conf-change result into a new configuration, a refused change, or
/// a fatal error
fn membership_outcome(
    applied: raft::Result<ConfState>,
) -> Result<std::result::Result<ConfState, String>> {
    match applied {
        Ok(cs) => Ok(Ok(cs)),
        Err(raft::Error::ConfChangeError(reason)) => Ok(Err(reason)),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft::storage::MemStorage;

    fn single_voter() -> RawNode<MemStorage> {
        let config = raft::Config {
            id: 1,
            ..Default::default()
        };
        let storage = MemStorage::new_with_conf_state(ConfState::from((vec![1], vec![])));
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        RawNode::new(&config, storage, &logger).unwrap()
    }

    fn conf_state(voters: Vec<u64>, learners: Vec<u64>) -> ConfState {
        ConfState::from((voters, learners))
    }

    #[test]
    fn test_removing_last_voter_is_refused() {
        let cs = conf_state(vec![1], vec![]);
        let err = check_membership(&cs, &MembershipChange::Remove { id: 1 }).unwrap_err();
        assert!(matches!(err, LedgerError::Membership(_)));
    }

    #[test]
    fn test_removing_unknown_node_is_refused() {
        let cs = conf_state(vec![1, 2], vec![]);
        let err = check_membership(&cs, &MembershipChange::Remove { id: 9 }).unwrap_err();
        assert!(matches!(err, LedgerError::Membership(_)));
    }

    #[test]
    fn test_removing_one_of_two_voters_is_allowed() {
        let cs = conf_state(vec![1, 2], vec![]);
        assert!(check_membership(&cs, &MembershipChange::Remove { id: 2 }).is_ok());
        assert!(check_membership(&cs, &MembershipChange::Remove { id: 1 }).is_ok());
    }

    #[test]
    fn test_removing_learner_is_allowed() {
        let cs = conf_state(vec![1], vec![4]);
        assert!(check_membership(&cs, &MembershipChange::Remove { id: 4 }).is_ok());
    }

    #[test]
    fn test_adding_existing_voter_is_refused() {
        let cs = conf_state(vec![1, 2], vec![]);
        let existing = MembershipChange::AddVoter {
            id: 2,
            addr: "127.0.0.1:7002".to_string(),
        };
        let fresh = MembershipChange::AddVoter {
            id: 3,
            addr: "127.0.0.1:7003".to_string(),
        };
        assert!(matches!(
            check_membership(&cs, &existing),
            Err(LedgerError::Membership(_))
        ));
        assert!(check_membership(&cs, &fresh).is_ok());
    }

    #[test]
    fn test_committed_removal_of_last_voter_keeps_configuration() {
        let mut raw = single_voter();
        let remove = membership_to_conf_change(&MembershipChange::Remove { id: 1 });

        let outcome = membership_outcome(raw.apply_conf_change(&remove)).unwrap();
        assert!(outcome.is_err());

        // The node still has its voter and can take further changes
        let add = membership_to_conf_change(&MembershipChange::AddVoter {
            id: 2,
            addr: "127.0.0.1:7002".to_string(),
        });
        let mut cs = membership_outcome(raw.apply_conf_change(&add))
            .unwrap()
            .unwrap();
        cs.voters.sort_unstable();
        assert_eq!(cs.voters, vec![1, 2]);
    }

    #[test]
    fn test_other_raft_errors_stay_fatal() {
        assert!(membership_outcome(Err(raft::Error::ProposalDropped)).is_err());
    }

    #[test]
    fn test_add_voter_carries_address() {
        let cc = membership_to_conf_change(&MembershipChange::AddVoter {
            id: 7,
            addr: "10.0.0.7:7000".to_string(),
        });
        assert_eq!(cc.change_type(), ConfChangeType::AddNode);
        assert_eq!(cc.node_id, 7);
        assert_eq!(&cc.context[..], b"10.0.0.7:7000");
    }

    #[test]
    fn test_remove_has_no_context() {
        let cc = membership_to_conf_change(&MembershipChange::Remove { id: 3 });
        assert_eq!(cc.change_type(), ConfChangeType::RemoveNode);
        assert!(cc.context.is_empty());
    }
}
