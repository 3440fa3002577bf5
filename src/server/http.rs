//! The HTTP control surface, on the node's main port plus 1000.
//!
//! Serves the operator dashboard: node status, pause/resume for failure
//! simulation, metrics, and an in-process write benchmark. Requests are
//! single-shot HTTP/1.1 exchanges framed by hand over the same std TCP stack
//! as the peer protocol; every response carries a permissive CORS header so
//! a dashboard served from anywhere can poll it.

use super::metrics::{latency_stats, Metrics};
use crate::error::Result;
use crate::raft::Node;
use crate::store::Store;

use log::{debug, error, info};
use serde::Serialize;
use std::io::{BufRead as _, BufReader, Write as _};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The outcome of a `/benchmark` run.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkResult {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub duration_ms: f64,
    /// Successful writes per second.
    pub throughput: f64,
    pub latency_avg_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
}

/// The control surface server.
#[derive(Clone)]
pub struct HttpServer {
    node: Arc<Node>,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
}

impl HttpServer {
    /// Creates a control surface for the given node, store and metrics.
    pub fn new(node: Arc<Node>, store: Arc<Store>, metrics: Arc<Metrics>) -> HttpServer {
        HttpServer { node, store, metrics }
    }

    /// Accepts control connections forever, one handler thread each.
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("[{}] Control surface on {}", self.node.id(), listener.local_addr()?);
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    error!("Control connection failed: {err}");
                    continue;
                }
            };
            let server = self.clone();
            std::thread::spawn(move || {
                if let Err(err) = server.session(stream) {
                    debug!("Control session ended with error: {err}");
                }
            });
        }
        Ok(())
    }

    /// Serves one request/response exchange and closes the connection.
    fn session(&self, stream: TcpStream) -> Result<()> {
        let mut reader = BufReader::new(stream.try_clone()?);

        let mut request_line = String::new();
        if reader.read_line(&mut request_line)? == 0 {
            return Ok(());
        }
        // Drain the headers; none of them matter here.
        let mut header = String::new();
        loop {
            header.clear();
            if reader.read_line(&mut header)? == 0 || header.trim().is_empty() {
                break;
            }
        }

        let mut parts = request_line.split_whitespace();
        let (method, target) = match (parts.next(), parts.next()) {
            (Some(method), Some(target)) => (method, target),
            _ => return self.respond(stream, 400, "text/plain", "Bad Request"),
        };
        debug!("Control request: {method} {target}");

        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        let (status, content_type, body) = self.route(path, query)?;
        self.respond(stream, status, content_type, &body)
    }

    /// Routes a request to its handler. Like the dashboard expects, routing
    /// is by path alone; the method is not enforced.
    fn route(&self, path: &str, query: &str) -> Result<(u16, &'static str, String)> {
        Ok(match path {
            "/status" => (200, "application/json", serde_json::to_string(&self.node.status()?)?),
            "/pause" => {
                self.node.pause()?;
                (200, "text/plain", "Node paused".to_string())
            }
            "/resume" => {
                self.node.resume()?;
                (200, "text/plain", "Node resumed".to_string())
            }
            "/metrics" => {
                (200, "application/json", serde_json::to_string(&self.metrics.snapshot())?)
            }
            "/metrics/reset" => {
                self.metrics.reset();
                (200, "text/plain", "Metrics reset".to_string())
            }
            "/clear" => {
                self.node.clear_log()?;
                self.metrics.reset();
                (200, "text/plain", "Data cleared".to_string())
            }
            "/benchmark" => {
                let requests = query_param(query, "requests").filter(|&n| n > 0).unwrap_or(10_000);
                let concurrency =
                    query_param(query, "concurrency").filter(|&n| n > 0).unwrap_or(100);
                let result = self.run_benchmark(requests, concurrency)?;
                (200, "application/json", serde_json::to_string(&result)?)
            }
            _ => (404, "text/plain", "Not Found".to_string()),
        })
    }

    /// Writes a minimal HTTP/1.1 response and closes the connection.
    fn respond(
        &self,
        mut stream: TcpStream,
        status: u16,
        content_type: &str,
        body: &str,
    ) -> Result<()> {
        let reason = match status {
            200 => "OK",
            400 => "Bad Request",
            _ => "Not Found",
        };
        write!(
            stream,
            "HTTP/1.1 {status} {reason}\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Content-Type: {content_type}\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {body}",
            body.len(),
        )?;
        Ok(())
    }

    /// Runs an in-process write benchmark: `concurrency` workers each issue
    /// `requests / concurrency` direct store writes, appending to the log
    /// without per-write fan-out (the entries ride along with heartbeats).
    /// Only the leader can run it; workers bail out if leadership is lost or
    /// the node pauses mid-run.
    fn run_benchmark(&self, requests: u64, concurrency: u64) -> Result<BenchmarkResult> {
        if !self.node.is_leader()? {
            return Ok(BenchmarkResult {
                total_requests: requests,
                successful: 0,
                failed: requests,
                duration_ms: 0.0,
                throughput: 0.0,
                latency_avg_ms: 0.0,
                latency_p50_ms: 0.0,
                latency_p95_ms: 0.0,
                latency_p99_ms: 0.0,
            });
        }
        info!("[{}] Benchmark: {requests} requests, {concurrency} workers", self.node.id());

        let per_worker = requests / concurrency.max(1);
        let successful = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let stopped = Arc::new(AtomicBool::new(false));
        let latencies = Arc::new(Mutex::new(Vec::new()));

        let start = Instant::now();
        let workers: Vec<_> = (0..concurrency)
            .map(|worker| {
                let node = Arc::clone(&self.node);
                let store = Arc::clone(&self.store);
                let successful = Arc::clone(&successful);
                let failed = Arc::clone(&failed);
                let stopped = Arc::clone(&stopped);
                let latencies = Arc::clone(&latencies);
                std::thread::spawn(move || {
                    for i in 0..per_worker {
                        if stopped.load(Ordering::Relaxed) {
                            failed.fetch_add(per_worker - i, Ordering::Relaxed);
                            return;
                        }
                        // Recheck leadership periodically, not per-write.
                        if i % 100 == 0
                            && (node.is_paused().unwrap_or(true)
                                || !node.is_leader().unwrap_or(false))
                        {
                            stopped.store(true, Ordering::Relaxed);
                            failed.fetch_add(per_worker - i, Ordering::Relaxed);
                            return;
                        }

                        let key = format!("bench_{worker}_{i}");
                        let value = format!("value_{i}");
                        let op_start = Instant::now();
                        let result = store
                            .set(&key, &value)
                            .and_then(|()| node.append_local(&format!("SET {key} {value}")));
                        match result {
                            Ok(()) => {
                                successful.fetch_add(1, Ordering::Relaxed);
                                latencies.lock().expect("poisoned").push(op_start.elapsed());
                            }
                            Err(_) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().map_err(|_| crate::error::Error::Internal("worker panicked".into()))?;
        }
        let elapsed = start.elapsed();

        let successful = successful.load(Ordering::Relaxed);
        let latencies = latencies.lock().expect("poisoned");
        let (latency_avg_ms, latency_p50_ms, latency_p95_ms, latency_p99_ms) =
            latency_stats(&latencies);
        Ok(BenchmarkResult {
            total_requests: requests,
            successful,
            failed: failed.load(Ordering::Relaxed),
            duration_ms: elapsed.as_micros() as f64 / 1000.0,
            throughput: if elapsed > Duration::ZERO {
                successful as f64 / elapsed.as_secs_f64()
            } else {
                0.0
            },
            latency_avg_ms,
            latency_p50_ms,
            latency_p95_ms,
            latency_p99_ms,
        })
    }
}

/// Extracts an integer query parameter, e.g. `requests` from
/// `requests=500&concurrency=10`.
fn query_param(query: &str, name: &str) -> Option<u64> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .and_then(|(_, value)| value.parse().ok())
}
