//! The line-oriented wire protocol, shared by clients and peers.
//!
//! Every message is a single line of whitespace-separated fields, except
//! `APPENDENTRIES` whose header declares how many `term,command` lines
//! follow. Replies are single lines. There are no length prefixes and no
//! binary framing; the protocol is readable with netcat.

use super::log::{Entry, Index, Term};
use super::node::NodeID;
use crate::errinput;
use crate::error::{Error, Result};

use std::io::BufRead;

/// A request, from a client (`SET`/`GET`/`JOIN`) or a peer (the rest).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// Sets a key to a value. Only the leader accepts this.
    Set { key: String, value: String },
    /// Fetches the value of a key from the local store.
    Get { key: String },
    /// Adds a peer address to the node's peer set.
    Join { addr: String },
    /// A candidate solicits this node's vote for the given term.
    VoteRequest { term: Term, candidate: NodeID },
    /// The leader replicates entries starting after prev_index. An empty
    /// entry list is a pure heartbeat.
    AppendEntries { term: Term, leader: NodeID, prev_index: Index, entries: Vec<Entry> },
    /// A bare leader liveness signal.
    Heartbeat { term: Term },
}

/// A single-line reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// The write was accepted.
    Ok,
    /// The node is not the leader; the client must rediscover and retry.
    NotLeader,
    /// The key does not exist.
    Nil,
    /// The value of a key.
    Value(String),
    /// A malformed or failed request.
    Error(String),
    /// The vote was granted to the candidate.
    VoteGranted,
    /// The vote went to someone else, or the candidate's term was stale.
    VoteDenied,
    /// The append was accepted.
    Success,
    /// The append was rejected; the leader should back up next_index.
    Conflict,
}

impl Request {
    /// Reads the next request from a line-buffered connection. Returns None
    /// at EOF. Empty lines are skipped; for `APPENDENTRIES`, the declared
    /// number of entry lines is consumed from the same reader.
    pub fn receive<R: BufRead>(reader: &mut R) -> Result<Option<Request>> {
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            if !line.trim().is_empty() {
                break;
            }
        }
        let line = line.trim_end_matches(['\r', '\n']);

        let command = line.split_whitespace().next().unwrap_or("");
        match command {
            "SET" => {
                // Split on single spaces so the value keeps its exact
                // spacing, including trailing whitespace.
                let mut parts = line.splitn(3, ' ');
                parts.next(); // SET
                let key = parts.next().unwrap_or("");
                let Some(value) = parts.next() else {
                    return Err(errinput!("usage: SET key value"));
                };
                if key.is_empty() || key.chars().any(char::is_whitespace) {
                    return Err(errinput!("key can't be empty or contain whitespace"));
                }
                // Commas would corrupt the WAL record format, and must be
                // rejected before the command enters the replicated log.
                if key.contains(',') {
                    return Err(errinput!("key can't contain ','"));
                }
                Ok(Some(Request::Set { key: key.to_string(), value: value.to_string() }))
            }

            "GET" => {
                let mut parts = line.split_whitespace();
                parts.next(); // GET
                let Some(key) = parts.next() else {
                    return Err(errinput!("usage: GET key"));
                };
                Ok(Some(Request::Get { key: key.to_string() }))
            }

            "JOIN" => {
                let parts: Vec<&str> = line.split_whitespace().collect();
                let [_, addr] = parts.as_slice() else {
                    return Err(errinput!("usage: JOIN address"));
                };
                Ok(Some(Request::Join { addr: addr.to_string() }))
            }

            "VOTEREQUEST" => {
                let parts: Vec<&str> = line.split_whitespace().collect();
                let [_, term, candidate] = parts.as_slice() else {
                    return Err(errinput!("usage: VOTEREQUEST term candidateID"));
                };
                Ok(Some(Request::VoteRequest {
                    term: term.parse()?,
                    candidate: candidate.to_string(),
                }))
            }

            "APPENDENTRIES" => {
                let parts: Vec<&str> = line.split_whitespace().collect();
                let [_, term, leader, prev_index, count] = parts.as_slice() else {
                    return Err(errinput!("usage: APPENDENTRIES term leaderID prevLogIndex count"));
                };
                let (term, prev_index, count) =
                    (term.parse()?, prev_index.parse()?, count.parse::<usize>()?);
                let mut entries = Vec::with_capacity(count);
                let mut entry_line = String::new();
                for _ in 0..count {
                    entry_line.clear();
                    if reader.read_line(&mut entry_line)? == 0 {
                        break; // truncated body, take what arrived
                    }
                    let entry_line = entry_line.trim_end_matches(['\r', '\n']);
                    let Some((entry_term, command)) = entry_line.split_once(',') else {
                        continue; // malformed entry line, skip it
                    };
                    let Ok(entry_term) = entry_term.parse() else {
                        continue;
                    };
                    entries.push(Entry { term: entry_term, command: command.to_string() });
                }
                Ok(Some(Request::AppendEntries {
                    term,
                    leader: leader.to_string(),
                    prev_index,
                    entries,
                }))
            }

            "HEARTBEAT" => {
                let parts: Vec<&str> = line.split_whitespace().collect();
                let [_, term] = parts.as_slice() else {
                    return Err(errinput!("usage: HEARTBEAT term"));
                };
                Ok(Some(Request::Heartbeat { term: term.parse()? }))
            }

            "" => Err(errinput!("empty command")),
            unknown => Err(errinput!("unknown command {unknown}")),
        }
    }
}

impl std::fmt::Display for Request {
    /// Formats the request in wire form, without the final newline. An
    /// AppendEntries request spans multiple lines.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Set { key, value } => write!(f, "SET {key} {value}"),
            Request::Get { key } => write!(f, "GET {key}"),
            Request::Join { addr } => write!(f, "JOIN {addr}"),
            Request::VoteRequest { term, candidate } => {
                write!(f, "VOTEREQUEST {term} {candidate}")
            }
            Request::AppendEntries { term, leader, prev_index, entries } => {
                write!(f, "APPENDENTRIES {term} {leader} {prev_index} {}", entries.len())?;
                for entry in entries {
                    write!(f, "\n{},{}", entry.term, entry.command)?;
                }
                Ok(())
            }
            Request::Heartbeat { term } => write!(f, "HEARTBEAT {term}"),
        }
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Response::Ok => write!(f, "OK"),
            Response::NotLeader => write!(f, "NOTLEADER"),
            Response::Nil => write!(f, "(nil)"),
            Response::Value(value) => write!(f, "{value}"),
            Response::Error(reason) => write!(f, "ERR {reason}"),
            Response::VoteGranted => write!(f, "VOTEGRANTED"),
            Response::VoteDenied => write!(f, "VOTEDENIED"),
            Response::Success => write!(f, "SUCCESS"),
            Response::Conflict => write!(f, "CONFLICT"),
        }
    }
}

impl std::str::FromStr for Response {
    type Err = Error;

    /// Parses a reply line. Any line that isn't a protocol token is a value;
    /// parsing therefore never fails.
    fn from_str(line: &str) -> Result<Self> {
        Ok(match line.trim_end_matches(['\r', '\n']) {
            "OK" => Response::Ok,
            "NOTLEADER" => Response::NotLeader,
            "(nil)" => Response::Nil,
            "VOTEGRANTED" => Response::VoteGranted,
            "VOTEDENIED" => Response::VoteDenied,
            "SUCCESS" => Response::Success,
            "CONFLICT" => Response::Conflict,
            line => match line.strip_prefix("ERR ") {
                Some(reason) => Response::Error(reason.to_string()),
                None => Response::Value(line.to_string()),
            },
        })
    }
}
