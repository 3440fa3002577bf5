//! A durable write-ahead log with group commit.
//!
//! The WAL is an append-only file of line-oriented records `key,value\n`.
//! Every accepted write is durable before the caller is acknowledged:
//! `write()` does not return until the record's bytes have been fsynced.
//!
//! Writers do not touch the file themselves. They enqueue the record together
//! with a completion channel and block on it. A single flusher thread drains
//! the queue every `FLUSH_INTERVAL`, writes the whole batch sequentially,
//! issues one fsync for the batch, and delivers the shared outcome to every
//! waiter. This amortizes the fsync across concurrent writers; no writer in a
//! failed batch is acknowledged.
//!
//! Recovery reads all complete lines and keeps the last value per key. A
//! partial line at EOF denotes a write aborted by a crash and is discarded.
//! The set of recoverable records is therefore always a prefix of the records
//! accepted.

use crate::errinput;
use crate::error::{Error, Result};

use crossbeam::channel::{self, Sender};
use log::{debug, error, info};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead as _, BufReader, Write as _};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// The group commit interval. Pending records are batched and fsynced once
/// per tick.
const FLUSH_INTERVAL: Duration = Duration::from_millis(5);

/// A record waiting for group commit, with the channel its writer blocks on.
struct Pending {
    record: String,
    done: Sender<Result<()>>,
}

/// A write-ahead log. Cheap to share: handles to the queue and file are
/// reference-counted, and the flusher thread holds its own clones.
pub struct Wal {
    /// Pending records awaiting the next flush. The queue lock is only ever
    /// held for push/swap, never across file I/O.
    pending: Arc<Mutex<Vec<Pending>>>,
    /// The log file. The file lock covers writes and fsync, and is never
    /// held together with the queue lock.
    file: Arc<Mutex<File>>,
    /// Set once close() has run; enqueuing into a closed log would leave the
    /// writer blocked forever.
    closed: Arc<Mutex<bool>>,
    /// Signals the flusher to perform a final drain and exit.
    shutdown: Sender<()>,
    /// The flusher thread, joined on close.
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Wal {
    /// Opens (creating if necessary) the log at the given path and starts the
    /// flusher thread.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Wal> {
        Self::open_with_interval(path, FLUSH_INTERVAL)
    }

    /// Opens a log with a custom flush interval. Primarily for tests, which
    /// shorten the interval to keep group-commit latency out of the runtime.
    pub fn open_with_interval<P: AsRef<Path>>(path: P, interval: Duration) -> Result<Wal> {
        let file = OpenOptions::new().append(true).create(true).open(&path)?;
        info!("Opened WAL at {}", path.as_ref().display());

        let pending = Arc::new(Mutex::new(Vec::new()));
        let file = Arc::new(Mutex::new(file));
        let (shutdown, shutdown_rx) = channel::bounded::<()>(1);

        let flush_pending = Arc::clone(&pending);
        let flush_file = Arc::clone(&file);
        let flusher = std::thread::spawn(move || {
            let ticker = channel::tick(interval);
            loop {
                crossbeam::select! {
                    recv(ticker) -> _ => {
                        if let Err(err) = Self::flush(&flush_file, &flush_pending) {
                            error!("WAL flush failed: {err}");
                        }
                    }
                    recv(shutdown_rx) -> _ => return,
                }
            }
        });

        Ok(Wal {
            pending,
            file,
            closed: Arc::new(Mutex::new(false)),
            shutdown,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Appends a record and blocks until it is durable on disk. Returns the
    /// outcome of the batch fsync that covered the record: an error means the
    /// record must be considered lost, and the in-memory state it guards must
    /// not be updated.
    pub fn write(&self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(errinput!("key can't be empty"));
        }
        if key.contains(',') || key.contains('\n') {
            return Err(errinput!("key can't contain ',' or newline"));
        }
        if value.contains('\n') {
            return Err(errinput!("value can't contain newline"));
        }

        let (done, wait) = channel::bounded(1);
        {
            let closed = self.closed.lock()?;
            if *closed {
                return Err(Error::Internal("WAL is closed".to_string()));
            }
            // Enqueue while still holding the closed flag, so close() can't
            // slip its final drain in between the check and the push.
            self.pending.lock()?.push(Pending { record: format!("{key},{value}\n"), done });
        }
        wait.recv()?
    }

    /// Flushes outstanding writes and releases the file. Further writes fail.
    pub fn close(&self) -> Result<()> {
        let Some(flusher) = self.flusher.lock()?.take() else {
            return Ok(()); // already closed
        };
        *self.closed.lock()? = true;
        self.shutdown.send(())?;
        flusher.join().map_err(|_| Error::Internal("WAL flusher panicked".to_string()))?;
        // One final drain for records enqueued since the last tick.
        Self::flush(&self.file, &self.pending)
    }

    /// Drains the pending queue and commits it as one batch: sequential
    /// writes, a single fsync, and the shared result delivered to every
    /// waiter. The queue lock is released before any file I/O.
    fn flush(file: &Mutex<File>, pending: &Mutex<Vec<Pending>>) -> Result<()> {
        let batch = std::mem::take(&mut *pending.lock()?);
        if batch.is_empty() {
            return Ok(());
        }
        debug!("Flushing {} WAL records", batch.len());

        let result = {
            let mut file = file.lock()?;
            batch
                .iter()
                .try_for_each(|p| file.write_all(p.record.as_bytes()))
                .and_then(|()| file.sync_data())
                .map_err(Error::from)
        };
        for p in batch {
            // A writer that gave up (e.g. panicked) just drops its receiver.
            let _ = p.done.send(result.clone());
        }
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!("WAL close failed: {err}");
        }
    }
}

/// Reads the log at the given path and returns the last-writer-wins mapping.
/// A missing file yields an empty map (a fresh node). Lines without a comma
/// are skipped; a trailing partial line is discarded as an aborted write.
pub fn recover<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>> {
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => return Err(err.into()),
    };

    let mut data = HashMap::new();
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let Some(record) = line.strip_suffix('\n') else {
            debug!("Discarding partial WAL record at EOF");
            break;
        };
        let Some((key, value)) = record.split_once(',') else {
            continue;
        };
        data.insert(key.to_string(), value.to_string());
    }
    info!("Recovered {} keys from {}", data.len(), path.as_ref().display());
    Ok(data)
}
