//! Outbound peer calls.
//!
//! The transport is the consensus module's only seam to the network, kept as
//! a trait so elections and replication can be exercised against in-memory
//! implementations in tests. The TCP implementation opens one connection per
//! message: write the request, read the single-line reply, close. There are
//! no per-call timeouts; a hung peer stalls only the outbound thread that
//! called it.

use super::log::{Entry, Index, Term};
use super::message::{Request, Response};
use crate::error::{Error, Result};

use log::debug;
use std::io::{BufRead as _, BufReader, Write as _};
use std::net::TcpStream;

/// The outcome of an accepted append call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendResult {
    /// The follower accepted the entries (or the heartbeat).
    Success,
    /// The follower rejected the append; back up next_index and retry.
    Conflict,
}

/// A request/response channel to peers.
pub trait Transport: Send + Sync {
    /// Asks a peer to vote for the candidate in the given term.
    fn request_vote(&self, peer: &str, term: Term, candidate: &str) -> Result<bool>;

    /// Sends entries (or a pure heartbeat, if empty) to a peer.
    fn append_entries(
        &self,
        peer: &str,
        term: Term,
        leader: &str,
        prev_index: Index,
        entries: &[Entry],
    ) -> Result<AppendResult>;
}

/// Normalizes a peer address for dialing: `:8080`-style addresses (host
/// omitted) refer to the local host.
pub fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        return format!("127.0.0.1{addr}");
    }
    addr.to_string()
}

/// The production transport: one short-lived TCP connection per message.
pub struct TcpTransport;

impl TcpTransport {
    /// Dials the peer, sends the request, and reads the single-line reply.
    fn call(&self, peer: &str, request: &Request) -> Result<Response> {
        let mut stream = TcpStream::connect(normalize_addr(peer))?;
        writeln!(stream, "{request}")?;
        stream.flush()?;

        let mut reply = String::new();
        BufReader::new(stream).read_line(&mut reply)?;
        debug!("Peer {peer} replied {} to {request:?}", reply.trim_end());
        reply.parse()
    }
}

impl Transport for TcpTransport {
    fn request_vote(&self, peer: &str, term: Term, candidate: &str) -> Result<bool> {
        let request = Request::VoteRequest { term, candidate: candidate.to_string() };
        Ok(self.call(peer, &request)? == Response::VoteGranted)
    }

    fn append_entries(
        &self,
        peer: &str,
        term: Term,
        leader: &str,
        prev_index: Index,
        entries: &[Entry],
    ) -> Result<AppendResult> {
        let request = Request::AppendEntries {
            term,
            leader: leader.to_string(),
            prev_index,
            entries: entries.to_vec(),
        };
        match self.call(peer, &request)? {
            Response::Success => Ok(AppendResult::Success),
            Response::Conflict => Ok(AppendResult::Conflict),
            other => Err(Error::Internal(format!("unexpected append reply {other:?}"))),
        }
    }
}
