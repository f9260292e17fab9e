//! Extraction worker: one OS thread pulling tasks from the shared channel.
//!
//! Per task: announce `Started`, run the pipeline under `catch_unwind`,
//! hand the full result to the file's writer shard (or the spill file), then
//! report a compact `Finished` outcome to the job manager.
//!
//! Both sides time a file from the same `Started` instant. A result that
//! overran `per_file_timeout` is never written by the worker; the manager
//! records the timeout. An on-time result must be delivered before the
//! manager's deadline of `per_file_timeout + TIMEOUT_GRACE`, so a blocked
//! writer shard falls back to the spill file early.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, select, tick, Receiver, Sender, TrySendError};

use super::fallback::FallbackPersister;
use super::types::{Delivery, FileOutcome, Task, WorkerCommand, WorkerEvent, WorkerId, WriterMessage};
use super::writer::route_result;
use crate::hardware::RssSampler;
use crate::models::{ErrorCode, ExtractionMetrics, ExtractionResult};
use crate::pipeline::extraction::ExtractionPipeline;

/// Extra time a started task gets past the per-file timeout before the job
/// manager gives up on its worker.
pub const TIMEOUT_GRACE: Duration = Duration::from_millis(500);

/// Everything a worker needs, cloned into each thread.
#[derive(Clone)]
pub struct WorkerContext {
    pub pipeline: Arc<ExtractionPipeline>,
    /// Writer inboxes indexed by shard.
    pub writers: Vec<Sender<WriterMessage>>,
    pub events: Sender<WorkerEvent>,
    pub fallback_dir: PathBuf,
    pub heartbeat_interval: Duration,
    pub per_file_timeout: Duration,
    pub writer_send_timeout: Duration,
}

pub fn spawn_worker(
    worker_id: WorkerId,
    ctx: WorkerContext,
    tasks: Receiver<WorkerCommand>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("bom-worker-{worker_id}"))
        .spawn(move || Worker::new(worker_id, ctx).run(tasks))
}

/// Sends `Exited` when dropped, including during unwinding.
struct ExitNotice {
    worker_id: WorkerId,
    events: Sender<WorkerEvent>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.events.send(WorkerEvent::Exited {
            worker_id: self.worker_id,
        });
    }
}

struct Worker {
    id: WorkerId,
    ctx: WorkerContext,
    spill: FallbackPersister,
    rss: RssSampler,
}

impl Worker {
    fn new(id: WorkerId, ctx: WorkerContext) -> Self {
        let spill = FallbackPersister::for_worker(&ctx.fallback_dir, id);
        Self {
            id,
            ctx,
            spill,
            rss: RssSampler::new(),
        }
    }

    fn run(mut self, tasks: Receiver<WorkerCommand>) {
        let _span = tracing::info_span!("worker", worker_id = self.id).entered();
        let _exit = ExitNotice {
            worker_id: self.id,
            events: self.ctx.events.clone(),
        };
        let (stop_ticker, ticker_stopped) = bounded::<()>(0);
        let ticker = spawn_ticker(
            self.id,
            self.ctx.events.clone(),
            self.ctx.heartbeat_interval,
            ticker_stopped,
        );
        tracing::debug!("Worker started");

        let mut processed = 0usize;
        loop {
            match tasks.recv() {
                Ok(WorkerCommand::Process(task)) => {
                    self.handle(task);
                    processed += 1;
                }
                Ok(WorkerCommand::Stop) => break,
                Err(_) => break,
            }
        }

        drop(stop_ticker);
        if let Some(ticker) = ticker {
            let _ = ticker.join();
        }
        tracing::debug!(processed, "Worker exiting");
    }

    fn handle(&mut self, task: Task) {
        let started = Instant::now();
        let _ = self.ctx.events.send(WorkerEvent::Started {
            worker_id: self.id,
            task_id: task.id,
            at: started,
        });

        let pipeline = Arc::clone(&self.ctx.pipeline);
        let mut result = match catch_unwind(AssertUnwindSafe(|| pipeline.process(&task.path))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(file = %task.path.display(), panic = %message, "Extraction panicked");
                ExtractionResult::failed(
                    &task.path,
                    ErrorCode::WorkerError,
                    format!("worker panicked: {message}"),
                    ExtractionMetrics {
                        duration_ms: started.elapsed().as_millis() as u64,
                        ..ExtractionMetrics::default()
                    },
                )
            }
        };

        let elapsed = started.elapsed();
        let overran = elapsed > self.ctx.per_file_timeout;
        if overran && result.error_code != ErrorCode::Timeout {
            tracing::warn!(
                file = %task.path.display(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Result arrived after the per-file timeout"
            );
            result = ExtractionResult::failed(
                &task.path,
                ErrorCode::Timeout,
                format!(
                    "processing took {}s, limit is {}s",
                    elapsed.as_secs(),
                    self.ctx.per_file_timeout.as_secs()
                ),
                result.metrics,
            );
        }
        result.attempt = task.attempt;
        result.metrics.memory_peak_mb = self.rss.sample_mb();

        if result.success {
            tracing::info!(file = %result.filename, rows = result.rows.len(), "File processed");
        } else {
            tracing::info!(
                file = %result.filename,
                code = %result.error_code,
                stage = ?result.failing_stage,
                "File failed"
            );
        }

        let mut outcome = FileOutcome::of(task.id, &result, Delivery::Withheld);
        if !overran {
            let budget = self.delivery_budget(started);
            outcome.delivery = route_result(&self.ctx.writers, budget, &mut self.spill, result);
        }
        let _ = self.ctx.events.send(WorkerEvent::Finished {
            worker_id: self.id,
            outcome,
        });
    }

    /// How long the writer send may block: the configured send timeout, cut
    /// short so delivery ends halfway through the manager's grace period.
    fn delivery_budget(&self, started: Instant) -> Duration {
        (self.ctx.per_file_timeout + TIMEOUT_GRACE / 2)
            .saturating_sub(started.elapsed())
            .min(self.ctx.writer_send_timeout)
    }
}

/// Companion thread that emits heartbeats until `stop` disconnects.
fn spawn_ticker(
    worker_id: WorkerId,
    events: Sender<WorkerEvent>,
    interval: Duration,
    stop: Receiver<()>,
) -> Option<JoinHandle<()>> {
    let spawned = std::thread::Builder::new()
        .name(format!("bom-heartbeat-{worker_id}"))
        .spawn(move || {
            let ticks = tick(interval);
            loop {
                select! {
                    recv(ticks) -> at => {
                        let at = at.unwrap_or_else(|_| Instant::now());
                        // A full event channel means the manager is busy; skip the beat.
                        if let Err(TrySendError::Disconnected(_)) =
                            events.try_send(WorkerEvent::Heartbeat { worker_id, at })
                        {
                            break;
                        }
                    }
                    recv(stop) -> _ => break,
                }
            }
        });

    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(worker_id, error = %e, "Heartbeat ticker not started");
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
