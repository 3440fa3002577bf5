//! The consensus module: leader election, log replication, and the rules
//! that keep them safe.
//!
//! A node is always in one of three roles. Followers wait for leader
//! liveness and become candidates when it lapses; candidates solicit votes
//! and become leader on a strict majority; leaders replicate their log to
//! every peer on a fixed interval and step down when they observe a higher
//! term. A fourth, operator-driven condition (paused) sits outside the
//! role machine: a paused node ignores all consensus traffic and timing
//! until resumed, which is how the dashboard simulates node failure.
//!
//! All shared state lives behind a single mutex. The driver thread and the
//! message handlers take a consistent snapshot under the lock, release it
//! for any network or disk I/O, and re-acquire it to record outcomes. The
//! election timer is reset through a one-slot wake channel with non-blocking
//! sends, so a handler never blocks on a sleeping follower.
//!
//! Two deliberate simplifications of the full Raft protocol are kept, and
//! documented where they bite: followers do not term-check the entry at
//! prev_index before accepting an append, and the vote predicate does not
//! compare log recency. The leader also applies and acknowledges writes
//! before a quorum confirms them.

use super::log::{Entry, Index, Log, Term};
use super::transport::{AppendResult, Transport};
use crate::error::{Error, Result};
use crate::store::Store;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use itertools::Itertools as _;
use log::{debug, error, info};
use rand::Rng as _;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The interval between leader replication rounds. Rounds double as
/// heartbeats: a caught-up peer receives an empty append.
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// The follower election timeout range in milliseconds. Each wait draws a
/// fresh random duration, so followers rarely time out simultaneously.
const ELECTION_TIMEOUT_MS: std::ops::Range<u64> = 500..1000;

/// How long a candidate collects votes before giving up on the election.
const CANDIDATE_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a paused node sleeps before rechecking its role.
const PAUSE_INTERVAL: Duration = Duration::from_millis(100);

/// A node identifier: the address peers dial to reach it, e.g.
/// `127.0.0.1:8080`.
pub type NodeID = String;

/// A node role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// A point-in-time snapshot of the node, as served by `/status`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub state: Role,
    pub term: Term,
    pub id: NodeID,
    pub log_length: usize,
    pub commit_index: Index,
    pub paused: bool,
}

/// Consensus state, all guarded by one mutex. Network and disk I/O must
/// never happen while it is held.
struct Shared {
    role: Role,
    term: Term,
    voted_for: Option<NodeID>,
    peers: Vec<NodeID>,
    log: Log,
    /// Per peer, the next log index to send (leader only).
    next_index: HashMap<NodeID, Index>,
    /// Per peer, the highest replicated index (leader only).
    match_index: HashMap<NodeID, Index>,
    paused: bool,
}

/// A consensus node. Wrap it in an Arc and call start() to launch the
/// driver thread; message handlers are called by the server from connection
/// threads.
pub struct Node {
    id: NodeID,
    shared: Mutex<Shared>,
    /// Election timer resets. One slot, non-blocking senders: concurrent
    /// wakes coalesce.
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    transport: Arc<dyn Transport>,
    store: Arc<Store>,
}

impl Node {
    /// Creates a node. Membership is static: peers are fixed at startup,
    /// except for additions via JOIN.
    pub fn new(id: &str, peers: Vec<String>, transport: Arc<dyn Transport>, store: Arc<Store>) -> Node {
        let peers: Vec<NodeID> =
            peers.into_iter().filter(|p| !p.is_empty() && p != id).unique().collect();
        let (wake_tx, wake_rx) = channel::bounded(1);
        Node {
            id: id.to_string(),
            shared: Mutex::new(Shared {
                role: Role::Follower,
                term: 0,
                voted_for: None,
                peers,
                log: Log::new(),
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                paused: false,
            }),
            wake_tx,
            wake_rx,
            transport,
            store,
        }
    }

    /// Returns the node ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Starts the consensus driver thread, which runs the role loops for the
    /// lifetime of the process.
    pub fn start(self: &Arc<Self>) {
        let node = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("consensus-{}", self.id))
            .spawn(move || loop {
                let role = match node.shared.lock() {
                    Ok(shared) => shared.role,
                    Err(err) => {
                        error!("[{}] Consensus state poisoned: {err}", node.id);
                        return;
                    }
                };
                let result = match role {
                    Role::Follower => node.run_follower(),
                    Role::Candidate => node.run_candidate(),
                    Role::Leader => node.run_leader(),
                };
                if let Err(err) = result {
                    error!("[{}] Consensus driver error: {err}", node.id);
                }
            })
            .expect("failed to spawn consensus driver");
    }

    /// One follower pass: wait for a leader or vote-grant wake, or time out
    /// and stand for election.
    fn run_follower(&self) -> Result<()> {
        if self.is_paused()? {
            std::thread::sleep(PAUSE_INTERVAL);
            return Ok(());
        }
        // Discard a wake left over from a previous role.
        while self.wake_rx.try_recv().is_ok() {}

        let timeout = Duration::from_millis(rand::thread_rng().gen_range(ELECTION_TIMEOUT_MS));
        match self.wake_rx.recv_timeout(timeout) {
            Ok(()) => Ok(()), // saw the leader (or granted a vote), stay follower
            Err(RecvTimeoutError::Timeout) => {
                let mut shared = self.shared.lock()?;
                if shared.role == Role::Follower && !shared.paused {
                    info!("[{}] Election timeout, becoming candidate", self.id);
                    shared.role = Role::Candidate;
                }
                Ok(())
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Internal("wake channel closed".to_string()))
            }
        }
    }

    /// One election: bump the term, vote for ourself, solicit votes from all
    /// peers in parallel, and tally until quorum or the candidate timeout.
    fn run_candidate(&self) -> Result<()> {
        if self.is_paused()? {
            std::thread::sleep(PAUSE_INTERVAL);
            return Ok(());
        }
        let (term, peers) = {
            let mut shared = self.shared.lock()?;
            if shared.role != Role::Candidate {
                return Ok(());
            }
            shared.term += 1;
            shared.voted_for = Some(self.id.clone());
            (shared.term, shared.peers.clone())
        };
        info!("[{}] Campaigning for term {term}", self.id);

        let quorum = Self::quorum(peers.len());
        let mut votes = 1; // our own
        let (vote_tx, vote_rx) = channel::bounded(peers.len().max(1));
        for peer in peers {
            let transport = Arc::clone(&self.transport);
            let candidate = self.id.clone();
            let vote_tx = vote_tx.clone();
            std::thread::spawn(move || {
                // An unreachable or unresponsive peer counts as a denial.
                let granted = match transport.request_vote(&peer, term, &candidate) {
                    Ok(granted) => granted,
                    Err(err) => {
                        debug!("Vote request to {peer} failed: {err}");
                        false
                    }
                };
                let _ = vote_tx.send(granted);
            });
        }
        drop(vote_tx);

        let deadline = Instant::now() + CANDIDATE_TIMEOUT;
        while votes < quorum {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match vote_rx.recv_timeout(remaining) {
                Ok(true) => votes += 1,
                Ok(false) => {}
                Err(_) => break, // every peer has answered
            }
        }

        let mut shared = self.shared.lock()?;
        if shared.role != Role::Candidate || shared.term != term {
            return Ok(()); // demoted while campaigning, discard the outcome
        }
        if votes >= quorum && !shared.paused {
            info!("[{}] Won election for term {term} with {votes} votes", self.id);
            shared.role = Role::Leader;
            let next = shared.log.len() as Index;
            for peer in shared.peers.clone() {
                shared.next_index.insert(peer.clone(), next);
                shared.match_index.insert(peer, -1);
            }
        } else {
            info!("[{}] Election for term {term} failed ({votes}/{quorum} votes)", self.id);
            shared.role = Role::Follower;
        }
        Ok(())
    }

    /// Leader loop: replicate to all peers every heartbeat interval until
    /// demoted or paused.
    fn run_leader(self: &Arc<Self>) -> Result<()> {
        if self.is_paused()? {
            std::thread::sleep(PAUSE_INTERVAL);
            return Ok(());
        }
        loop {
            self.broadcast_append()?;
            std::thread::sleep(HEARTBEAT_INTERVAL);
            let shared = self.shared.lock()?;
            if shared.role != Role::Leader || shared.paused {
                return Ok(());
            }
        }
    }

    /// Sends one replication round to every peer: the log tail from the
    /// peer's next_index, or an empty append (pure heartbeat) if it is
    /// caught up. Snapshots under the lock, then hands each peer to its own
    /// outbound thread so a slow peer stalls nobody else.
    fn broadcast_append(self: &Arc<Self>) -> Result<()> {
        let batches = {
            let shared = self.shared.lock()?;
            if shared.role != Role::Leader {
                return Ok(());
            }
            let term = shared.term;
            let log_len = shared.log.len() as Index;
            shared
                .peers
                .iter()
                .map(|peer| {
                    let next =
                        shared.next_index.get(peer).copied().unwrap_or(log_len).clamp(0, log_len);
                    (peer.clone(), term, next - 1, shared.log.entries_from(next).to_vec(), log_len)
                })
                .collect::<Vec<_>>()
        };
        for (peer, term, prev_index, entries, log_len) in batches {
            let node = Arc::clone(self);
            std::thread::spawn(move || {
                if let Err(err) = node.replicate_to(&peer, term, prev_index, entries, log_len) {
                    debug!("[{}] Replication to {peer} failed: {err}", node.id);
                }
            });
        }
        Ok(())
    }

    /// Sends one append to one peer and records the outcome: on SUCCESS the
    /// peer has our whole log, so advance its cursors and try to commit; on
    /// CONFLICT back next_index up one and let the next round retry.
    fn replicate_to(
        &self,
        peer: &str,
        term: Term,
        prev_index: Index,
        entries: Vec<Entry>,
        log_len: Index,
    ) -> Result<()> {
        let result = self.transport.append_entries(peer, term, &self.id, prev_index, &entries)?;
        let mut shared = self.shared.lock()?;
        if shared.role != Role::Leader || shared.term != term {
            return Ok(()); // deposed while the call was in flight
        }
        match result {
            AppendResult::Success => {
                shared.next_index.insert(peer.to_string(), log_len);
                shared.match_index.insert(peer.to_string(), log_len - 1);
                let unapplied = Self::advance_commit(&mut shared);
                drop(shared);
                self.apply(unapplied);
            }
            AppendResult::Conflict => {
                debug!("[{}] Append conflict from {peer}, backing up", self.id);
                let next = shared.next_index.entry(peer.to_string()).or_insert(log_len);
                if *next > 0 {
                    *next -= 1;
                }
            }
        }
        Ok(())
    }

    /// Advances the commit cursor to the highest index replicated on a
    /// strict majority (the leader's own log counts), provided the entry
    /// there is from the current term; entries from older terms are only
    /// committed transitively. Returns any newly committed entries that the
    /// optimistic apply path hasn't already applied.
    fn advance_commit(shared: &mut Shared) -> Vec<Entry> {
        let quorum = Self::quorum(shared.peers.len());
        let indexes = (shared.peers.iter().map(|p| shared.match_index.get(p).copied().unwrap_or(-1)))
            .chain(std::iter::once(shared.log.last_index()));
        let Some(candidate) = indexes.sorted_unstable().rev().nth(quorum - 1) else {
            return Vec::new();
        };
        if candidate <= shared.log.commit_index() {
            return Vec::new();
        }
        if shared.log.get(candidate).map(|e| e.term) != Some(shared.term) {
            return Vec::new();
        }
        debug!("Commit index advanced to {candidate}");
        shared.log.commit(candidate);
        shared.log.take_committed_unapplied()
    }

    /// Applies committed SET commands to the state machine, in log order.
    fn apply(&self, entries: Vec<Entry>) {
        for entry in entries {
            let mut parts = entry.command.splitn(3, ' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some("SET"), Some(key), Some(value)) => {
                    if let Err(err) = self.store.set(key, value) {
                        error!("[{}] Failed to apply {:?}: {err}", self.id, entry.command);
                    }
                }
                _ => debug!("[{}] Skipping unrecognized command {:?}", self.id, entry.command),
            }
        }
    }

    /// Accepts a client SET on the leader: appends it to the local log at
    /// the current term, triggers an immediate replication round, and
    /// returns the entry's index. The caller persists the command via the
    /// store, then confirms with mark_applied(); an entry whose store write
    /// failed stays below the apply cursor so the commit path retries it.
    pub fn replicate(self: &Arc<Self>, command: &str) -> Result<Index> {
        let index = {
            let mut shared = self.shared.lock()?;
            if shared.role != Role::Leader {
                return Err(Error::NotLeader);
            }
            let term = shared.term;
            let index = shared.log.append(term, command.to_string());
            debug!("[{}] Queued entry {index}: {command}", self.id);
            index
        };
        self.broadcast_append()?;
        Ok(index)
    }

    /// Records that the entry at the given index has been applied to the
    /// state machine, so commit-time application won't repeat it. Called by
    /// the leader write path once the store write has succeeded.
    pub fn mark_applied(&self, index: Index) -> Result<()> {
        self.shared.lock()?.log.mark_applied(index);
        Ok(())
    }

    /// Appends an entry without triggering a replication round; it rides
    /// along with the next heartbeat. The benchmark path uses this to
    /// measure log and store throughput without per-write network fan-out.
    /// Dropped silently while paused.
    pub fn append_local(&self, command: &str) -> Result<()> {
        let mut shared = self.shared.lock()?;
        if shared.paused {
            return Ok(());
        }
        let term = shared.term;
        let index = shared.log.append(term, command.to_string());
        shared.log.mark_applied(index);
        Ok(())
    }

    /// Handles a VOTEREQUEST from a candidate. Grants iff the candidate's
    /// term is current or newer and we haven't voted for anyone else in it;
    /// a grant adopts the term, demotes to follower, and resets the election
    /// timer. Known simplification: log recency is not compared, so a
    /// candidate with a shorter log can win.
    pub fn handle_vote_request(&self, term: Term, candidate: &str) -> Result<bool> {
        let mut shared = self.shared.lock()?;
        if shared.paused || term < shared.term {
            return Ok(false);
        }
        if term > shared.term {
            shared.term = term;
            shared.role = Role::Follower;
            shared.voted_for = None;
        }
        let grant = match &shared.voted_for {
            None => true,
            Some(vote) => vote == candidate,
        };
        if grant {
            info!("[{}] Granting vote to {candidate} in term {term}", self.id);
            shared.voted_for = Some(candidate.to_string());
            shared.role = Role::Follower;
            self.wake();
        } else {
            debug!(
                "[{}] Denying vote to {candidate} in term {term}, already voted for {:?}",
                self.id, shared.voted_for
            );
        }
        Ok(grant)
    }

    /// Handles a bare HEARTBEAT: adopt the term if current or newer and
    /// reset the election timer. Ignored while paused or from stale terms.
    pub fn handle_heartbeat(&self, term: Term) -> Result<()> {
        let mut shared = self.shared.lock()?;
        if shared.paused || term < shared.term {
            return Ok(());
        }
        if term > shared.term {
            shared.voted_for = None;
        }
        shared.term = term;
        shared.role = Role::Follower;
        self.wake();
        Ok(())
    }

    /// Handles APPENDENTRIES from the leader. A stale term (or a paused
    /// node) rejects with false (CONFLICT on the wire). Otherwise we adopt
    /// the term, follow the leader, and, when entries are present, truncate
    /// our log at prev_index + 1, append the leader's entries, and apply the
    /// new tail to the state machine. Known simplification: the
    /// entry at prev_index is not term-checked against the leader's, so a
    /// divergent tail can be accepted as-is.
    pub fn handle_append_entries(
        &self,
        term: Term,
        leader: &str,
        prev_index: Index,
        entries: Vec<Entry>,
    ) -> Result<bool> {
        let unapplied = {
            let mut shared = self.shared.lock()?;
            if shared.paused {
                return Ok(false);
            }
            if term < shared.term {
                debug!(
                    "[{}] Rejecting append from {leader}: stale term {term} < {}",
                    self.id, shared.term
                );
                return Ok(false);
            }
            if term > shared.term {
                info!("[{}] Following {leader} in term {term}", self.id);
            }
            shared.term = term;
            shared.role = Role::Follower;
            shared.voted_for = None;
            self.wake();

            if entries.is_empty() {
                return Ok(true);
            }
            debug!(
                "[{}] Appending {} entries from {leader} after index {prev_index}",
                self.id,
                entries.len()
            );
            shared.log.truncate_and_append(prev_index + 1, entries);
            shared.log.take_unapplied()
        };
        // Apply outside the lock: the store write blocks on the WAL.
        self.apply(unapplied);
        Ok(true)
    }

    /// Adds a peer to the cluster membership. Self and duplicates are
    /// ignored.
    pub fn add_peer(&self, addr: &str) -> Result<()> {
        let mut shared = self.shared.lock()?;
        if addr == self.id || shared.peers.iter().any(|p| p == addr) {
            return Ok(());
        }
        info!("[{}] Added peer {addr}", self.id);
        shared.peers.push(addr.to_string());
        Ok(())
    }

    /// Suspends consensus participation, simulating a failure.
    pub fn pause(&self) -> Result<()> {
        self.shared.lock()?.paused = true;
        info!("[{}] Node paused", self.id);
        Ok(())
    }

    /// Resumes consensus participation as a follower with a fresh vote.
    pub fn resume(&self) -> Result<()> {
        let mut shared = self.shared.lock()?;
        shared.paused = false;
        shared.role = Role::Follower;
        shared.voted_for = None;
        info!("[{}] Node resumed", self.id);
        Ok(())
    }

    /// Returns whether the node is paused.
    pub fn is_paused(&self) -> Result<bool> {
        Ok(self.shared.lock()?.paused)
    }

    /// Returns whether the node currently believes it is the leader.
    pub fn is_leader(&self) -> Result<bool> {
        Ok(self.shared.lock()?.role == Role::Leader)
    }

    /// Removes all log entries and resets the commit and apply cursors, for
    /// a fresh benchmark run.
    pub fn clear_log(&self) -> Result<()> {
        self.shared.lock()?.log.clear();
        info!("[{}] Log cleared", self.id);
        Ok(())
    }

    /// Returns a point-in-time snapshot of the node.
    pub fn status(&self) -> Result<Status> {
        let shared = self.shared.lock()?;
        Ok(Status {
            state: shared.role,
            term: shared.term,
            id: self.id.clone(),
            log_length: shared.log.len(),
            commit_index: shared.log.commit_index(),
            paused: shared.paused,
        })
    }

    /// Resets the follower election timer. Non-blocking; a wake already in
    /// the slot coalesces with this one.
    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// The quorum size for a cluster of peer_count peers plus ourself: a
    /// strict majority.
    fn quorum(peer_count: usize) -> usize {
        (peer_count + 1) / 2 + 1
    }
}

#[cfg(test)]
impl Node {
    /// Forces the node into a role and term, bypassing elections. Lets other
    /// modules' tests exercise leader-only paths deterministically.
    pub(crate) fn force_role(&self, role: Role, term: Term) {
        let mut shared = self.shared.lock().expect("poisoned");
        shared.role = role;
        shared.term = term;
    }
}
