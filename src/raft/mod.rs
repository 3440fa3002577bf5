//! The consensus subsystem: the replicated log, the wire protocol, the peer
//! transport, and the node state machine that ties them together.

mod log;
mod message;
mod node;
mod transport;

pub use self::log::{Entry, Index, Log, Term};
pub use message::{Request, Response};
pub use node::{Node, NodeID, Role, Status};
pub use transport::{normalize_addr, AppendResult, TcpTransport, Transport};
