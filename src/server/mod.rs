//! The TCP server and command router.
//!
//! The server accepts connections on the node's main port and hands each one
//! to its own thread, which reads line-framed commands until EOF. The router
//! maps each command onto the consensus module and the store, times SET/GET
//! operations for the metrics surface, and produces the single-line wire
//! reply. It holds no state of its own beyond references to its
//! collaborators.

mod http;
mod metrics;

pub use http::{BenchmarkResult, HttpServer};
pub use metrics::{Metrics, MetricsSnapshot};

use crate::error::{Error, Result};
use crate::raft::{Node, Request, Response};
use crate::store::Store;

use log::{debug, error, info};
use std::io::{BufReader, Write as _};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Instant;

/// The client- and peer-facing TCP server.
#[derive(Clone)]
pub struct Server {
    node: Arc<Node>,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
}

impl Server {
    /// Creates a server routing commands to the given node and store.
    pub fn new(node: Arc<Node>, store: Arc<Store>, metrics: Arc<Metrics>) -> Server {
        Server { node, store, metrics }
    }

    /// Accepts connections forever, one handler thread per connection.
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("[{}] Listening on {}", self.node.id(), listener.local_addr()?);
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    error!("Connection failed: {err}");
                    continue;
                }
            };
            let server = self.clone();
            std::thread::spawn(move || {
                if let Err(err) = server.session(stream) {
                    debug!("Client session ended with error: {err}");
                }
            });
        }
        Ok(())
    }

    /// Serves one connection: read a command, execute it, write the reply,
    /// until the client disconnects. Malformed commands get an ERR reply and
    /// the session continues.
    fn session(&self, stream: TcpStream) -> Result<()> {
        let peer = stream.peer_addr()?;
        debug!("Client {peer} connected");
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = stream;
        loop {
            match Request::receive(&mut reader) {
                Ok(Some(request)) => {
                    if let Some(response) = self.execute(request) {
                        writeln!(writer, "{response}")?;
                    }
                }
                Ok(None) => break, // EOF
                Err(Error::InvalidInput(reason)) => {
                    writeln!(writer, "{}", Response::Error(reason))?;
                }
                Err(err) => return Err(err),
            }
        }
        debug!("Client {peer} disconnected");
        Ok(())
    }

    /// Routes a command. Returns None when the protocol specifies no reply
    /// (bare heartbeats).
    pub fn execute(&self, request: Request) -> Option<Response> {
        Some(match request {
            Request::Set { key, value } => {
                let start = Instant::now();
                match self.set(&key, &value) {
                    Ok(()) => {
                        self.metrics.record_success(start.elapsed());
                        Response::Ok
                    }
                    Err(Error::NotLeader) => Response::NotLeader,
                    Err(err) => {
                        self.metrics.record_failure();
                        Response::Error(err.to_string())
                    }
                }
            }

            Request::Get { key } => {
                let start = Instant::now();
                let response = match self.store.get(&key) {
                    Some(value) => Response::Value(value),
                    None => Response::Nil,
                };
                self.metrics.record_success(start.elapsed());
                response
            }

            Request::Join { addr } => match self.node.add_peer(&addr) {
                Ok(()) => Response::Ok,
                Err(err) => Response::Error(err.to_string()),
            },

            Request::VoteRequest { term, candidate } => {
                match self.node.handle_vote_request(term, &candidate) {
                    Ok(true) => Response::VoteGranted,
                    Ok(false) => Response::VoteDenied,
                    Err(err) => {
                        error!("Vote request failed: {err}");
                        Response::VoteDenied
                    }
                }
            }

            Request::AppendEntries { term, leader, prev_index, entries } => {
                match self.node.handle_append_entries(term, &leader, prev_index, entries) {
                    Ok(true) => Response::Success,
                    Ok(false) => Response::Conflict,
                    Err(err) => {
                        error!("Append failed: {err}");
                        Response::Conflict
                    }
                }
            }

            Request::Heartbeat { term } => {
                if let Err(err) = self.node.handle_heartbeat(term) {
                    error!("Heartbeat failed: {err}");
                }
                return None;
            }
        })
    }

    /// The leader write path: queue the command for replication, persist it
    /// via the WAL-gated store, and only then mark the entry applied. The
    /// reply goes out without waiting for a replication quorum. If the store
    /// write fails, the entry stays below the apply cursor and commit-time
    /// application retries it.
    fn set(&self, key: &str, value: &str) -> Result<()> {
        let index = self.node.replicate(&format!("SET {key} {value}"))?;
        self.store.set(key, value)?;
        self.node.mark_applied(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{Role, TcpTransport};
    use crate::wal::Wal;

    use std::time::Duration;

    fn test_server() -> (Server, Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let wal = Wal::open_with_interval(dir.path().join("server.log"), Duration::from_millis(1))
            .expect("wal open");
        let store = Arc::new(Store::new(wal));
        let node = Arc::new(Node::new(
            "127.0.0.1:7100",
            Vec::new(),
            Arc::new(TcpTransport),
            Arc::clone(&store),
        ));
        (Server::new(node, Arc::clone(&store), Arc::new(Metrics::new())), store, dir)
    }

    fn set(key: &str, value: &str) -> Request {
        Request::Set { key: key.to_string(), value: value.to_string() }
    }

    #[test]
    fn set_on_follower_is_redirected() {
        let (server, store, _dir) = test_server();
        assert_eq!(server.execute(set("x", "y")), Some(Response::NotLeader));
        assert_eq!(store.get("x"), None);
    }

    #[test]
    fn set_on_leader_persists_and_acks() {
        let (server, store, _dir) = test_server();
        server.node.force_role(Role::Leader, 1);

        assert_eq!(server.execute(set("user", "Mathijs")), Some(Response::Ok));
        assert_eq!(store.get("user"), Some("Mathijs".to_string()));
        assert_eq!(
            server.execute(Request::Get { key: "user".to_string() }),
            Some(Response::Value("Mathijs".to_string()))
        );

        let snapshot = server.metrics.snapshot();
        assert_eq!(snapshot.success_count, 2);
    }

    #[test]
    fn get_missing_key_is_nil() {
        let (server, _store, _dir) = test_server();
        assert_eq!(
            server.execute(Request::Get { key: "missing".to_string() }),
            Some(Response::Nil)
        );
    }

    #[test]
    fn set_with_illegal_key_is_an_error() {
        let (server, store, _dir) = test_server();
        server.node.force_role(Role::Leader, 1);

        let Some(Response::Error(_)) = server.execute(set("bad,key", "v")) else {
            panic!("expected an ERR reply");
        };
        assert_eq!(store.get("bad,key"), None);
        assert_eq!(server.metrics.snapshot().fail_count, 1);
    }

    #[test]
    fn join_adds_a_peer() {
        let (server, _store, _dir) = test_server();
        assert_eq!(
            server.execute(Request::Join { addr: "127.0.0.1:7101".to_string() }),
            Some(Response::Ok)
        );
    }

    #[test]
    fn vote_and_append_are_routed_to_consensus() {
        let (server, _store, _dir) = test_server();
        assert_eq!(
            server.execute(Request::VoteRequest { term: 1, candidate: "127.0.0.1:7101".to_string() }),
            Some(Response::VoteGranted)
        );
        assert_eq!(
            server.execute(Request::AppendEntries {
                term: 1,
                leader: "127.0.0.1:7101".to_string(),
                prev_index: -1,
                entries: Vec::new(),
            }),
            Some(Response::Success)
        );
    }

    #[test]
    fn heartbeat_has_no_reply() {
        let (server, _store, _dir) = test_server();
        assert_eq!(server.execute(Request::Heartbeat { term: 1 }), None);
    }
}
