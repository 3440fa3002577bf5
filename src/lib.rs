//! replikv is a replicated key/value store: a leader-based consensus engine
//! paired with a durable group-committed write-ahead log and an in-memory
//! key/value state machine. Clients issue `SET`/`GET` over a line-oriented
//! TCP protocol; an HTTP control surface exposes status, failure simulation
//! and benchmarking for the operator dashboard.

#![warn(clippy::all)]

pub mod error;
pub mod raft;
pub mod server;
pub mod store;
pub mod wal;

pub use error::{Error, Result};
