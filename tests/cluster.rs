//! End-to-end tests over real sockets: single-node serving, follower
//! redirects, crash recovery, group commit under concurrency, and a
//! three-node cluster electing a leader, replicating writes, and failing
//! over when the leader is paused.

use replikv::error::Result;
use replikv::raft::{Node, Role, TcpTransport};
use replikv::server::{HttpServer, Metrics, Server};
use replikv::store::Store;
use replikv::wal::{self, Wal};

use serial_test::serial;
use std::io::{BufRead as _, BufReader, Write as _};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A WAL flush interval short enough to keep group-commit waits out of the
/// test runtime.
const FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// One in-process node: consensus, store, and a serving TCP listener.
struct TestNode {
    addr: String,
    node: Arc<Node>,
    store: Arc<Store>,
    wal_path: std::path::PathBuf,
}

impl TestNode {
    /// Builds a node serving on the pre-bound listener, with the given
    /// peers. The consensus driver only runs if `start` is set, so tests can
    /// pin a node in the follower role.
    fn launch(dir: &tempfile::TempDir, listener: TcpListener, peers: Vec<String>, start: bool) -> TestNode {
        let addr = listener.local_addr().expect("local addr").to_string();
        let wal_path = dir.path().join(format!("server_{}.log", addr.replace(':', "_")));
        let wal = Wal::open_with_interval(&wal_path, FLUSH_INTERVAL).expect("wal open");
        let store = Arc::new(Store::new(wal));
        store.restore(wal::recover(&wal_path).expect("recover"));

        let node = Arc::new(Node::new(&addr, peers, Arc::new(TcpTransport), Arc::clone(&store)));
        if start {
            node.start();
        }

        let server = Server::new(Arc::clone(&node), Arc::clone(&store), Arc::new(Metrics::new()));
        std::thread::spawn(move || server.serve(listener));

        TestNode { addr, node, store, wal_path }
    }

    fn role(&self) -> Role {
        self.node.status().expect("status").state
    }

    fn log_length(&self) -> usize {
        self.node.status().expect("status").log_length
    }
}

/// A line-protocol client holding one connection.
struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    fn connect(addr: &str) -> Client {
        let stream = TcpStream::connect(addr).expect("connect");
        Client { reader: BufReader::new(stream.try_clone().expect("clone")), writer: stream }
    }

    /// Sends one command and returns the single-line reply.
    fn send(&mut self, command: &str) -> String {
        writeln!(self.writer, "{command}").expect("send");
        let mut reply = String::new();
        self.reader.read_line(&mut reply).expect("reply");
        reply.trim_end_matches(['\r', '\n']).to_string()
    }
}

/// Polls a condition until it holds or the timeout expires.
fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    false
}

fn bind() -> TcpListener {
    TcpListener::bind("127.0.0.1:0").expect("bind")
}

#[test]
#[serial]
fn single_node_serves_writes_and_reads() {
    let dir = tempfile::tempdir().expect("tempdir");
    let node = TestNode::launch(&dir, bind(), Vec::new(), true);

    // A node with no peers elects itself after the first election timeout.
    assert!(wait_for(Duration::from_secs(2), || node.role() == Role::Leader));

    let mut client = Client::connect(&node.addr);
    assert_eq!(client.send("SET user Mathijs"), "OK");
    assert_eq!(client.send("GET user"), "Mathijs");
    assert_eq!(client.send("GET missing"), "(nil)");
    assert_eq!(client.send("SET"), "ERR usage: SET key value");
    assert_eq!(client.send("FROB x"), "ERR unknown command FROB");

    // The control surface reports the same state over HTTP.
    let http_listener = bind();
    let http_addr = http_listener.local_addr().expect("local addr").to_string();
    let http = HttpServer::new(
        Arc::clone(&node.node),
        Arc::clone(&node.store),
        Arc::new(Metrics::new()),
    );
    std::thread::spawn(move || http.serve(http_listener));

    let mut stream = TcpStream::connect(&http_addr).expect("connect");
    write!(stream, "GET /status HTTP/1.1\r\nHost: test\r\n\r\n").expect("request");
    let mut response = String::new();
    let mut reader = BufReader::new(stream);
    while reader.read_line(&mut response).expect("read") > 0 {}
    assert!(response.starts_with("HTTP/1.1 200 OK"), "bad response: {response}");
    assert!(response.contains("Access-Control-Allow-Origin: *"));
    assert!(response.contains("\"state\":\"Leader\""), "bad response: {response}");
}

#[test]
#[serial]
fn follower_redirects_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    // The driver never runs, so the node stays a follower.
    let node = TestNode::launch(&dir, bind(), vec!["127.0.0.1:1".to_string()], false);

    let mut client = Client::connect(&node.addr);
    assert_eq!(client.send("SET x y"), "NOTLEADER");
    assert_eq!(node.role(), Role::Follower);
}

#[test]
#[serial]
fn crash_recovery_preserves_acknowledged_writes() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let listener = bind();
    let node = TestNode::launch(&dir, listener, Vec::new(), true);
    assert!(wait_for(Duration::from_secs(2), || node.role() == Role::Leader));

    let mut client = Client::connect(&node.addr);
    assert_eq!(client.send("SET k1 v1"), "OK");
    assert_eq!(client.send("SET k2 v2"), "OK");
    assert_eq!(client.send("SET k v1"), "OK");
    assert_eq!(client.send("SET k v2"), "OK");

    // Hard-terminate: no graceful flush beyond what write() already
    // guaranteed. Acknowledged records must be on disk.
    node.store.close()?;

    let recovered = wal::recover(&node.wal_path)?;
    assert_eq!(recovered.get("k1"), Some(&"v1".to_string()));
    assert_eq!(recovered.get("k2"), Some(&"v2".to_string()));
    assert_eq!(recovered.get("k"), Some(&"v2".to_string())); // last writer wins

    // Relaunch with the same WAL path and serve the recovered data.
    let relaunched = TestNode::launch_with_wal(&node.wal_path, bind());
    let mut client = Client::connect(&relaunched.addr);
    assert_eq!(client.send("GET k1"), "v1");
    assert_eq!(client.send("GET k2"), "v2");
    assert_eq!(client.send("GET k"), "v2");
    Ok(())
}

impl TestNode {
    /// Relaunches a node on an existing WAL file, as after a crash.
    fn launch_with_wal(wal_path: &std::path::Path, listener: TcpListener) -> TestNode {
        let addr = listener.local_addr().expect("local addr").to_string();
        let data = wal::recover(wal_path).expect("recover");
        let wal = Wal::open_with_interval(wal_path, FLUSH_INTERVAL).expect("wal open");
        let store = Arc::new(Store::new(wal));
        store.restore(data);

        let node =
            Arc::new(Node::new(&addr, Vec::new(), Arc::new(TcpTransport), Arc::clone(&store)));
        let server = Server::new(Arc::clone(&node), Arc::clone(&store), Arc::new(Metrics::new()));
        std::thread::spawn(move || server.serve(listener));

        TestNode { addr, node, store, wal_path: wal_path.to_path_buf() }
    }
}

#[test]
#[serial]
fn group_commit_handles_concurrent_writers() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let node = TestNode::launch(&dir, bind(), Vec::new(), true);
    assert!(wait_for(Duration::from_secs(2), || node.role() == Role::Leader));

    let writers = 100;
    let writes = 100;
    let addr = node.addr.clone();
    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let addr = addr.clone();
            std::thread::spawn(move || {
                let mut client = Client::connect(&addr);
                for i in 0..writes {
                    assert_eq!(client.send(&format!("SET key_{w}_{i} value_{i}")), "OK");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer panicked");
    }
    node.store.close()?;

    // Every acknowledged write is a complete line, and recovery sees the
    // last value per key.
    let contents = std::fs::read_to_string(&node.wal_path).expect("read wal");
    assert_eq!(contents.lines().count(), writers * writes);
    let recovered = wal::recover(&node.wal_path)?;
    assert_eq!(recovered.len(), writers * writes);
    assert_eq!(recovered.get("key_0_0"), Some(&"value_0".to_string()));
    assert_eq!(recovered.get("key_99_99"), Some(&"value_99".to_string()));
    Ok(())
}

#[test]
#[serial]
fn three_node_cluster_elects_replicates_and_fails_over() {
    let dir = tempfile::tempdir().expect("tempdir");

    // Bind all listeners first so every node knows its peers' addresses.
    let listeners = [bind(), bind(), bind()];
    let addrs: Vec<String> =
        listeners.iter().map(|l| l.local_addr().expect("local addr").to_string()).collect();

    let nodes: Vec<TestNode> = listeners
        .into_iter()
        .map(|listener| TestNode::launch(&dir, listener, addrs.clone(), true))
        .collect();

    // Exactly one node becomes leader, the others follow in the same term.
    assert!(wait_for(Duration::from_secs(10), || {
        nodes.iter().filter(|n| n.role() == Role::Leader).count() == 1
            && nodes.iter().filter(|n| n.role() == Role::Follower).count() == 2
    }));
    let leader = nodes.iter().find(|n| n.role() == Role::Leader).expect("leader");
    let statuses: Vec<_> = nodes.iter().map(|n| n.node.status().expect("status")).collect();
    let leader_term = statuses.iter().map(|s| s.term).max().expect("term");
    assert!(leader_term >= 1);
    assert!(statuses.iter().all(|s| s.term == leader_term));

    // Writes to a follower are redirected.
    let follower = nodes.iter().find(|n| n.role() == Role::Follower).expect("follower");
    assert_eq!(Client::connect(&follower.addr).send("SET a 1"), "NOTLEADER");

    // Writes to the leader replicate everywhere.
    assert_eq!(Client::connect(&leader.addr).send("SET a 1"), "OK");
    assert!(wait_for(Duration::from_secs(2), || nodes.iter().all(|n| n.log_length() >= 1)));
    assert!(wait_for(Duration::from_secs(2), || {
        nodes.iter().all(|n| n.store.get("a") == Some("1".to_string()))
    }));

    // Pause the leader to simulate a failure. The survivors elect a new
    // leader; the pre-failure write is preserved.
    leader.node.pause().expect("pause");
    assert!(wait_for(Duration::from_secs(10), || {
        nodes.iter().any(|n| !n.node.is_paused().expect("paused") && n.role() == Role::Leader)
    }));
    let new_leader = nodes
        .iter()
        .find(|n| !n.node.is_paused().expect("paused") && n.role() == Role::Leader)
        .expect("new leader");
    assert_ne!(new_leader.addr, leader.addr);
    assert_eq!(new_leader.store.get("a"), Some("1".to_string()));

    // The new leader accepts writes; the remaining follower converges.
    assert_eq!(Client::connect(&new_leader.addr).send("SET a 2"), "OK");
    let survivor = nodes
        .iter()
        .find(|n| n.addr != new_leader.addr && !n.node.is_paused().expect("paused"))
        .expect("survivor");
    assert!(wait_for(Duration::from_secs(2), || {
        survivor.store.get("a") == Some("2".to_string())
    }));

    // The old leader rejoins as a follower and catches up.
    leader.node.resume().expect("resume");
    assert!(wait_for(Duration::from_secs(5), || {
        leader.store.get("a") == Some("2".to_string())
    }));
}
