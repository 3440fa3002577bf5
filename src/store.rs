//! The in-memory key/value state machine.
//!
//! The store is a plain map guarded by a reader/writer lock: many concurrent
//! readers or a single writer. Writes are gated by the WAL: the record must
//! be durable before the map is touched, so an acknowledged `set` survives a
//! crash and a failed WAL write leaves the map unchanged.

use crate::error::Result;
use crate::wal::Wal;

use std::collections::HashMap;
use std::sync::RwLock;

/// A key/value store backed by a write-ahead log.
pub struct Store {
    wal: Wal,
    data: RwLock<HashMap<String, String>>,
}

impl Store {
    /// Creates an empty store writing through the given WAL.
    pub fn new(wal: Wal) -> Store {
        Store { wal, data: RwLock::new(HashMap::new()) }
    }

    /// Sets a key to a value. The record is durable on disk when this
    /// returns; on WAL failure the in-memory map is not updated.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.wal.write(key, value)?;
        self.data.write()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Fetches the value of a key, or None if it doesn't exist.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().expect("store lock poisoned").get(key).cloned()
    }

    /// Replaces the entire contents, typically with the mapping recovered
    /// from the WAL. Called once at startup before serving traffic.
    pub fn restore(&self, data: HashMap<String, String>) {
        *self.data.write().expect("store lock poisoned") = data;
    }

    /// Flushes and closes the underlying WAL.
    pub fn close(&self) -> Result<()> {
        self.wal.close()
    }
}
