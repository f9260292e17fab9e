//! Writer tier: a few persistence threads, each owning one SQLite
//! connection and one bounded inbox.
//!
//! Files are sharded by a stable hash of their path, so every result for a
//! given file goes through the same writer and the same connection.

use std::path::Path;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rusqlite::Connection;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::error::JobError;
use super::fallback::FallbackPersister;
use super::types::{Delivery, WriterMessage};
use crate::db::{open_database, upsert_results};
use crate::models::ExtractionResult;

/// Shard index for `path` among `shards` writers.
pub fn shard_for(path: &Path, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % shards as u64) as usize
}

/// Hand `result` to its writer shard, or append it to `spill` when the shard
/// does not accept it within `timeout`.
pub fn route_result(
    writers: &[Sender<WriterMessage>],
    timeout: Duration,
    spill: &mut FallbackPersister,
    result: ExtractionResult,
) -> Delivery {
    let shard = shard_for(&result.filepath, writers.len());
    let result = match writers.get(shard) {
        Some(writer) => match writer.send_timeout(WriterMessage::Result(Box::new(result)), timeout) {
            Ok(()) => return Delivery::Writer,
            Err(e) => {
                tracing::warn!(shard, error = %e, "Writer unavailable, spilling result");
                match e.into_inner() {
                    WriterMessage::Result(result) => *result,
                    WriterMessage::Shutdown => return Delivery::Lost,
                }
            }
        },
        None => result,
    };

    match spill.persist(&result) {
        Ok(()) => Delivery::Fallback,
        Err(e) => {
            tracing::error!(file = %result.filepath.display(), error = %e, "Result lost: spill failed");
            Delivery::Lost
        }
    }
}

/// Floor for `batch_interval`; below it an idle writer would wake constantly.
const MIN_BATCH_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    /// Commit once this many rows (or results) are buffered.
    pub batch_rows: usize,
    /// Commit at least this often while anything is buffered.
    pub batch_interval: Duration,
}

impl WriterConfig {
    fn normalized(self) -> Self {
        Self {
            batch_rows: self.batch_rows.max(1),
            batch_interval: self.batch_interval.max(MIN_BATCH_INTERVAL),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    pub writer_id: usize,
    pub results: usize,
    pub rows: usize,
    pub commits: usize,
    pub failed_commits: usize,
    pub spilled: usize,
}

struct ShardWriter {
    id: usize,
    conn: Connection,
    inbox: Receiver<WriterMessage>,
    config: WriterConfig,
    spill: FallbackPersister,
    buffer: Vec<ExtractionResult>,
    buffered_rows: usize,
    stats: WriterStats,
}

impl ShardWriter {
    fn run(mut self) -> WriterStats {
        let _span = tracing::info_span!("writer", writer_id = self.id).entered();
        let mut last_flush = Instant::now();

        loop {
            let wait = self.config.batch_interval.saturating_sub(last_flush.elapsed());
            match self.inbox.recv_timeout(wait) {
                Ok(WriterMessage::Result(result)) => {
                    self.buffered_rows += result.rows.len();
                    self.buffer.push(*result);
                    if self.buffered_rows >= self.config.batch_rows
                        || self.buffer.len() >= self.config.batch_rows
                    {
                        self.flush();
                        last_flush = Instant::now();
                    }
                }
                Ok(WriterMessage::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => {
                    self.flush();
                    last_flush = Instant::now();
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.flush();
        tracing::debug!(
            results = self.stats.results,
            rows = self.stats.rows,
            commits = self.stats.commits,
            "Writer exiting"
        );
        self.stats
    }

    /// Commit the buffer in one transaction. A failed commit spills the
    /// batch so reconciliation can retry it.
    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        self.buffered_rows = 0;

        match upsert_results(&mut self.conn, &batch) {
            Ok(counts) => {
                self.stats.results += counts.results;
                self.stats.rows += counts.rows;
                self.stats.commits += 1;
            }
            Err(e) => {
                self.stats.failed_commits += 1;
                tracing::error!(error = %e, results = batch.len(), "Commit failed, spilling batch");
                for result in &batch {
                    match self.spill.persist(result) {
                        Ok(()) => self.stats.spilled += 1,
                        Err(e) => tracing::error!(
                            file = %result.filepath.display(),
                            error = %e,
                            "Result lost: spill failed"
                        ),
                    }
                }
            }
        }
    }
}

/// The running writer threads and their inboxes.
pub struct WriterPool {
    senders: Vec<Sender<WriterMessage>>,
    handles: Vec<JoinHandle<()>>,
    done: Receiver<WriterStats>,
}

impl WriterPool {
    /// Open one connection per writer and start the threads.
    pub fn start(
        database_path: &Path,
        writers: usize,
        capacity: usize,
        config: WriterConfig,
        fallback_dir: &Path,
    ) -> Result<Self, JobError> {
        let writers = writers.max(1);
        let config = config.normalized();
        let (done_tx, done) = bounded(writers);
        let mut senders = Vec::with_capacity(writers);
        let mut handles = Vec::with_capacity(writers);

        for id in 0..writers {
            let conn = open_database(database_path)?;
            let (tx, inbox) = bounded(capacity.max(1));
            let writer = ShardWriter {
                id,
                conn,
                inbox,
                config,
                spill: FallbackPersister::for_writer(fallback_dir, id),
                buffer: Vec::new(),
                buffered_rows: 0,
                stats: WriterStats {
                    writer_id: id,
                    ..WriterStats::default()
                },
            };
            let done_tx = done_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("bom-writer-{id}"))
                .spawn(move || {
                    let stats = writer.run();
                    let _ = done_tx.send(stats);
                })?;
            senders.push(tx);
            handles.push(handle);
        }

        tracing::info!(writers, capacity, "Writer pool started");
        Ok(Self {
            senders,
            handles,
            done,
        })
    }

    /// Inbox handles, indexed by shard.
    pub fn senders(&self) -> Vec<Sender<WriterMessage>> {
        self.senders.clone()
    }

    /// Send `Shutdown` to every shard and wait up to `timeout` for them to
    /// flush and exit. Writers still running afterwards are detached.
    pub fn shutdown(self, timeout: Duration) -> Vec<WriterStats> {
        let deadline = Instant::now() + timeout;
        for (id, tx) in self.senders.iter().enumerate() {
            if tx.send_deadline(WriterMessage::Shutdown, deadline).is_err() {
                tracing::warn!(writer_id = id, "Could not deliver shutdown to writer");
            }
        }

        let mut stats = Vec::with_capacity(self.handles.len());
        while stats.len() < self.handles.len() {
            match self.done.recv_deadline(deadline) {
                Ok(s) => stats.push(s),
                Err(_) => break,
            }
        }

        let finished: Vec<usize> = stats.iter().map(|s: &WriterStats| s.writer_id).collect();
        for (id, handle) in self.handles.into_iter().enumerate() {
            if finished.contains(&id) {
                let _ = handle.join();
            } else {
                tracing::warn!(writer_id = id, "Writer did not exit in time, force-terminated");
            }
        }
        stats.sort_by_key(|s| s.writer_id);
        stats
    }
}
