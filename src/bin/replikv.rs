/*
 * replikv is the replicated key/value store server. It recovers its state
 * from the write-ahead log, joins the configured cluster, and serves the
 * line-oriented client/peer protocol on --port with the HTTP control
 * surface on --port + 1000.
 */

#![warn(clippy::all)]

use replikv::errinput;
use replikv::error::Result;
use replikv::raft::{normalize_addr, Node, TcpTransport};
use replikv::server::{HttpServer, Metrics, Server};
use replikv::store::Store;
use replikv::wal::{self, Wal};

use log::{error, info};
use std::net::TcpListener;
use std::sync::Arc;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("port")
                .long("port")
                .help("TCP listen port; the HTTP control port is this plus 1000")
                .default_value("8080"),
        )
        .arg(
            clap::Arg::new("peers")
                .long("peers")
                .help("Comma-separated peer addresses, e.g. :8081,:8082")
                .default_value(""),
        )
        .arg(
            clap::Arg::new("replica")
                .long("replica")
                .help("Replica tag for the WAL filename (server_<tag>.log)")
                .default_value(""),
        )
        .arg(clap::Arg::new("log-level").long("log-level").default_value("info"))
        .get_matches();

    let loglevel = args.get_one::<String>("log-level").unwrap().parse()?;
    simplelog::SimpleLogger::init(loglevel, simplelog::Config::default())?;

    let port: u16 = args.get_one::<String>("port").unwrap().parse()?;
    let http_port = port.checked_add(1000).ok_or(errinput!("port {port} too high"))?;
    let peers: Vec<String> = match args.get_one::<String>("peers").unwrap().as_str() {
        "" => Vec::new(),
        peers => peers.split(',').map(normalize_addr).collect(),
    };

    let replica = args.get_one::<String>("replica").unwrap();
    let wal_file = match replica.as_str() {
        "" => format!("server_{port}.log"),
        tag => format!("server_{tag}.log"),
    };

    info!("Recovering data from {wal_file}");
    let data = wal::recover(&wal_file)?;
    let wal = Wal::open(&wal_file)?;
    let store = Arc::new(Store::new(wal));
    store.restore(data);

    let id = format!("127.0.0.1:{port}");
    let node = Arc::new(Node::new(&id, peers, Arc::new(TcpTransport), Arc::clone(&store)));
    node.start();

    let metrics = Arc::new(Metrics::new());
    let http = HttpServer::new(Arc::clone(&node), Arc::clone(&store), Arc::clone(&metrics));
    let http_listener = TcpListener::bind(("0.0.0.0", http_port))?;
    std::thread::spawn(move || {
        if let Err(err) = http.serve(http_listener) {
            error!("Control surface failed: {err}");
        }
    });

    let listener = TcpListener::bind(("0.0.0.0", port))?;
    Server::new(node, store, metrics).serve(listener)
}
