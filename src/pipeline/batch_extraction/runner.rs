//! JobManager: runs one batch end to end.
//!
//! Init → Discovering → Dispatching → Draining → ShuttingDown → Reconciling →
//! Reporting → Done. The manager is the only consumer of the event channel
//! and the only owner of counters and checkpoint state; workers and writers
//! talk to it exclusively through bounded channels.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam::channel::{bounded, Receiver, Select, Sender};
use rusqlite::Connection;
use uuid::Uuid;

use super::checkpoint::{CheckpointManager, CheckpointState};
use super::error::JobError;
use super::fallback::{reconcile, FallbackPersister};
use super::report::{export_rows_csv, export_summary_csv, JobReport};
use super::scheduler::{discover_documents, select_tasks, SelectionMode};
use super::supervisor::ProgressSupervisor;
use super::types::{
    new_job_id, Delivery, FileOutcome, JobState, Task, WorkerCommand, WorkerEvent, WorkerId,
};
use super::worker::{spawn_worker, WorkerContext, TIMEOUT_GRACE};
use super::writer::{route_result, WriterConfig, WriterPool};
use crate::config::Settings;
use crate::db::{load_rows, load_summaries, open_database};
use crate::hardware::{detect_host_resources, HostResources};
use crate::models::{ErrorCode, ExtractionMetrics, ExtractionResult};
use crate::pipeline::extraction::pdfium::PdfiumEngine;
use crate::pipeline::extraction::{DocumentEngine, ExtractionPipeline};
use crate::pipeline_config::{derive_plan, WorkerPlan};

/// Longest the manager waits on its channels before re-checking the
/// interrupt flag and the clocks.
const MAX_POLL: Duration = Duration::from_millis(250);

/// Save the checkpoint after this many final outcomes.
const CHECKPOINT_EVERY: usize = 50;

pub struct JobManager {
    settings: Settings,
    engine: Arc<dyn DocumentEngine>,
    host: HostResources,
    interrupt: Arc<AtomicBool>,
}

impl JobManager {
    pub fn new(
        settings: Settings,
        engine: Arc<dyn DocumentEngine>,
        host: HostResources,
        interrupt: Arc<AtomicBool>,
    ) -> Self {
        Self {
            settings,
            engine,
            host,
            interrupt,
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Run the whole job. Per-file failures end up in the report; only setup
    /// and bookkeeping failures return an error.
    pub fn run(&self) -> Result<JobReport, JobError> {
        let mut report = JobReport::new(new_job_id());
        let _span = tracing::info_span!("job", job_id = %report.job_id).entered();
        enter(&mut report, JobState::Init);
        tracing::info!(engine = self.engine.name(), input = %self.settings.input_dir.display(), "Job starting");

        self.settings.validate()?;
        let pipeline = ExtractionPipeline::new(
            Arc::clone(&self.engine),
            self.settings.layout.clone(),
            self.settings.max_file_size_bytes(),
        )?;
        // Creates the schema before any writer shard connects.
        let mut conn = open_database(&self.settings.database_path)?;
        let checkpoints = CheckpointManager::new(self.settings.checkpoint_path.clone());
        let mode = SelectionMode::from_flags(self.settings.resume, self.settings.retry_failed_only);
        let mut checkpoint = load_checkpoint(&checkpoints, mode)?;

        enter(&mut report, JobState::Discovering);
        let discovered = discover_documents(&self.settings.input_dir)?;
        let max_files = (self.settings.max_files > 0).then_some(self.settings.max_files);
        let tasks = select_tasks(&discovered, &checkpoint, mode, max_files);
        report.discovered = discovered.len();
        report.scheduled = tasks.len();

        if self.interrupted() {
            tracing::warn!("Interrupted before workers started");
            report.interrupted = true;
            report.not_started = tasks.len();
        } else {
            if !tasks.is_empty() {
                let plan = derive_plan(&self.host, &self.settings, tasks.len());
                tracing::info!(
                    workers = plan.worker_count,
                    writers = plan.writer_count,
                    memory_per_worker_mb = plan.memory_per_worker_mb,
                    "Worker plan"
                );
                report.plan = Some(plan.clone());
                let pipeline = pipeline.with_memory_budget(plan.memory_per_worker_bytes());
                self.execute(tasks, pipeline, &plan, &mut checkpoint, &checkpoints, &mut report)?;
            }

            enter(&mut report, JobState::Reconciling);
            report.reconciled = reconcile(&self.settings.fallback_dir, &mut conn)?;
            report.checkpoint_corrections = align_checkpoint(&conn, &mut checkpoint)?;
            if report.checkpoint_corrections > 0 {
                if let Err(e) = checkpoints.save(&mut checkpoint) {
                    tracing::error!(path = %checkpoints.path().display(), error = %e, "Checkpoint save failed");
                }
            }
        }

        enter(&mut report, JobState::Reporting);
        let rows = load_rows(&conn)?;
        export_rows_csv(&self.settings.rows_output, &rows)?;
        let summaries = load_summaries(&conn)?;
        export_summary_csv(&self.settings.summary_output, &summaries)?;
        report.finished_at = Some(Utc::now());
        report.log_summary();

        enter(&mut report, JobState::Done);
        Ok(report)
    }

    /// Dispatching through ShuttingDown, plus the final checkpoint save.
    fn execute(
        &self,
        tasks: Vec<Task>,
        pipeline: ExtractionPipeline,
        plan: &WorkerPlan,
        checkpoint: &mut CheckpointState,
        checkpoints: &CheckpointManager,
        report: &mut JobReport,
    ) -> Result<(), JobError> {
        let settings = &self.settings;
        let writers = WriterPool::start(
            &settings.database_path,
            plan.writer_count,
            plan.writer_capacity,
            WriterConfig {
                batch_rows: settings.batch_rows,
                batch_interval: settings.batch_interval(),
            },
            &settings.fallback_dir,
        )?;

        let (task_tx, task_rx) = bounded(plan.task_capacity.max(1));
        let (events_tx, events_rx) = bounded(plan.event_capacity.max(1));
        let ctx = WorkerContext {
            pipeline: Arc::new(pipeline),
            writers: writers.senders(),
            events: events_tx,
            fallback_dir: settings.fallback_dir.clone(),
            heartbeat_interval: settings.heartbeat_interval(),
            per_file_timeout: settings.per_file_timeout(),
            writer_send_timeout: settings.writer_send_timeout(),
        };

        let mut run = Run {
            settings,
            interrupt: &self.interrupt,
            report: &mut *report,
            checkpoint: &mut *checkpoint,
            checkpoints,
            ctx,
            task_tx,
            task_rx,
            events: events_rx,
            workers: HashMap::new(),
            next_worker_id: 0,
            pending: tasks.into(),
            in_flight: HashMap::new(),
            supervisor: ProgressSupervisor::new(settings.heartbeat_interval(), settings.stall_multiple),
            manager_spill: FallbackPersister::for_manager(&settings.fallback_dir),
            since_checkpoint: 0,
            stopping: false,
        };

        enter(run.report, JobState::Dispatching);
        let mut spawn_error = None;
        for _ in 0..plan.worker_count {
            if let Err(e) = run.spawn_worker() {
                tracing::error!(error = %e, "Cannot spawn extraction worker");
                spawn_error = Some(e);
            }
        }
        if run.workers.is_empty() {
            drop(run);
            writers.shutdown(settings.join_timeout());
            return Err(spawn_error
                .map(JobError::Io)
                .unwrap_or_else(|| JobError::Io(std::io::Error::other("no workers"))));
        }

        run.dispatch();
        enter(run.report, JobState::ShuttingDown);
        run.shutdown();
        let stall_events = run.supervisor.stall_events();
        drop(run);

        let stats = writers.shutdown(settings.join_timeout());
        report.force_terminated += plan.writer_count.saturating_sub(stats.len());
        report.writer_stats = stats;
        report.stall_events = stall_events;

        if let Err(e) = checkpoints.save(checkpoint) {
            tracing::error!(path = %checkpoints.path().display(), error = %e, "Final checkpoint save failed");
        }
        Ok(())
    }
}

/// Make every checkpointed file agree with its final summary in the store.
///
/// Spill replay can land a result after the manager already recorded a
/// different outcome for that file; the store wins. Returns the number of
/// entries changed.
fn align_checkpoint(conn: &Connection, checkpoint: &mut CheckpointState) -> Result<usize, JobError> {
    let mut changed = 0;
    for summary in load_summaries(conn)? {
        if checkpoint.is_processed(&summary.file_path) && checkpoint.settle(&summary.file_path, summary.success) {
            tracing::warn!(
                file = %summary.file_path.display(),
                success = summary.success,
                "Checkpoint entry corrected from the store"
            );
            changed += 1;
        }
    }
    Ok(changed)
}

/// Resume modes need a readable checkpoint. A fresh run only extends it,
/// so an unreadable one is replaced.
fn load_checkpoint(
    checkpoints: &CheckpointManager,
    mode: SelectionMode,
) -> Result<CheckpointState, JobError> {
    match checkpoints.load() {
        Ok(state) => Ok(state),
        Err(e) if !mode.uses_checkpoint() => {
            tracing::warn!(error = %e, "Ignoring unreadable checkpoint for a fresh run");
            Ok(CheckpointState::default())
        }
        Err(e) => Err(e.into()),
    }
}

fn enter(report: &mut JobReport, state: JobState) {
    tracing::info!(state = %state, "Job state");
    report.states.push(state);
}

/// Build and run a job with the PDFium engine on the detected host.
pub fn run_job(settings: Settings, interrupt: Arc<AtomicBool>) -> Result<JobReport, JobError> {
    let engine = PdfiumEngine::new(settings.pdfium_library_path.clone())?;
    let host = detect_host_resources();
    JobManager::new(settings, Arc::new(engine), host, interrupt).run()
}

// ═══════════════════════════════════════════
// Dispatch state
// ═══════════════════════════════════════════

struct WorkerSlot {
    handle: Option<JoinHandle<()>>,
    /// Task the worker last reported as started.
    current: Option<Uuid>,
    /// Given up on after a per-file timeout; already replaced.
    abandoned: bool,
}

/// A task sitting in the task channel or running on a worker.
struct InFlight {
    task: Task,
    worker: Option<WorkerId>,
    started_at: Option<Instant>,
}

struct Run<'a> {
    settings: &'a Settings,
    interrupt: &'a AtomicBool,
    report: &'a mut JobReport,
    checkpoint: &'a mut CheckpointState,
    checkpoints: &'a CheckpointManager,
    ctx: WorkerContext,
    task_tx: Sender<WorkerCommand>,
    /// Kept to hand to replacement workers and to take back unstarted tasks.
    task_rx: Receiver<WorkerCommand>,
    events: Receiver<WorkerEvent>,
    workers: HashMap<WorkerId, WorkerSlot>,
    next_worker_id: WorkerId,
    pending: VecDeque<Task>,
    in_flight: HashMap<Uuid, InFlight>,
    supervisor: ProgressSupervisor,
    manager_spill: FallbackPersister,
    since_checkpoint: usize,
    stopping: bool,
}

impl Run<'_> {
    fn spawn_worker(&mut self) -> std::io::Result<()> {
        let id = self.next_worker_id;
        let handle = spawn_worker(id, self.ctx.clone(), self.task_rx.clone())?;
        self.next_worker_id += 1;
        self.workers.insert(
            id,
            WorkerSlot {
                handle: Some(handle),
                current: None,
                abandoned: false,
            },
        );
        self.supervisor.register(id, Instant::now());
        self.report.workers_spawned += 1;
        tracing::debug!(worker_id = id, "Worker spawned");
        Ok(())
    }

    fn spawn_replacement(&mut self) {
        if self.stopping {
            return;
        }
        if let Err(e) = self.spawn_worker() {
            tracing::error!(error = %e, "Cannot spawn replacement worker");
        }
    }

    fn poll_interval(&self) -> Duration {
        self.settings.heartbeat_interval().min(MAX_POLL)
    }

    fn has_work(&self) -> bool {
        !self.pending.is_empty() || !self.in_flight.is_empty()
    }

    /// Feed tasks and consume events until every task has an outcome or
    /// the interrupt flag is raised.
    fn dispatch(&mut self) {
        let poll = self.poll_interval();
        let mut last_check = Instant::now();
        let mut draining = false;

        loop {
            if self.interrupt.load(Ordering::SeqCst) {
                tracing::warn!(
                    pending = self.pending.len(),
                    in_flight = self.in_flight.len(),
                    "Interrupt received"
                );
                self.report.interrupted = true;
                break;
            }
            if self.pending.is_empty() && !draining {
                enter(self.report, JobState::Draining);
                draining = true;
            }
            if !self.has_work() {
                break;
            }
            if self.workers.is_empty() {
                tracing::error!(pending = self.pending.len(), "No live workers left");
                break;
            }

            let ready = {
                let mut sel = Select::new();
                let send_idx = (!self.pending.is_empty()).then(|| sel.send(&self.task_tx));
                sel.recv(&self.events);
                sel.ready_timeout(poll).map(|index| Some(index) == send_idx)
            };
            match ready {
                Ok(true) => self.feed_one(),
                Ok(false) => {
                    if let Ok(event) = self.events.try_recv() {
                        self.on_event(event);
                    }
                }
                Err(_) => {}
            }

            if last_check.elapsed() >= poll {
                last_check = Instant::now();
                self.check_progress(last_check);
            }
        }
    }

    fn feed_one(&mut self) {
        let Some(task) = self.pending.pop_front() else {
            return;
        };
        let entry = InFlight {
            task: task.clone(),
            worker: None,
            started_at: None,
        };
        match self.task_tx.try_send(WorkerCommand::Process(task)) {
            Ok(()) => {
                self.in_flight.insert(entry.task.id, entry);
                self.report.dispatched += 1;
            }
            // Readiness can be spurious.
            Err(e) => {
                if let WorkerCommand::Process(task) = e.into_inner() {
                    self.pending.push_front(task);
                }
            }
        }
    }

    fn on_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Heartbeat { worker_id, at } => {
                self.supervisor.heartbeat(worker_id, at);
            }
            WorkerEvent::Started {
                worker_id,
                task_id,
                at,
            } => {
                self.supervisor.heartbeat(worker_id, at);
                if let Some(slot) = self.workers.get_mut(&worker_id) {
                    slot.current = Some(task_id);
                }
                if let Some(entry) = self.in_flight.get_mut(&task_id) {
                    entry.worker = Some(worker_id);
                    entry.started_at = Some(at);
                }
            }
            WorkerEvent::Finished { worker_id, outcome } => {
                self.supervisor.heartbeat(worker_id, Instant::now());
                if let Some(slot) = self.workers.get_mut(&worker_id) {
                    if slot.current == Some(outcome.task_id) {
                        slot.current = None;
                    }
                }
                match self.in_flight.remove(&outcome.task_id) {
                    Some(entry) if outcome.delivery == Delivery::Withheld => {
                        self.finalize_timeout(entry, Instant::now());
                    }
                    Some(entry) => self.record(entry.task, outcome),
                    None => tracing::debug!(
                        worker_id,
                        file = %outcome.path.display(),
                        "Ignoring late outcome of an abandoned task"
                    ),
                }
            }
            WorkerEvent::Exited { worker_id } => self.on_exit(worker_id),
        }
    }

    fn on_exit(&mut self, worker_id: WorkerId) {
        let Some(slot) = self.workers.remove(&worker_id) else {
            return;
        };
        self.supervisor.remove(worker_id);
        if let Some(handle) = slot.handle {
            if handle.join().is_err() {
                tracing::error!(worker_id, "Worker thread panicked");
            }
        }

        let orphan = slot.current.and_then(|id| self.in_flight.remove(&id));
        if let Some(entry) = orphan {
            tracing::warn!(worker_id, file = %entry.task.path.display(), "Worker exited mid-task");
            let result = ExtractionResult::failed(
                &entry.task.path,
                ErrorCode::WorkerError,
                "worker exited before reporting an outcome",
                ExtractionMetrics::default(),
            );
            self.finalize_here(entry.task, result);
        }

        if !self.stopping {
            tracing::warn!(worker_id, "Worker exited unexpectedly");
            if !slot.abandoned && self.has_work() {
                self.spawn_replacement();
            }
        }
    }

    /// Stall detection and per-file timeouts.
    fn check_progress(&mut self, now: Instant) {
        // Outcomes already queued count as on time.
        for _ in 0..self.events.len() {
            match self.events.try_recv() {
                Ok(event) => self.on_event(event),
                Err(_) => break,
            }
        }

        // Stalls are advisory; the supervisor logs them.
        self.supervisor.check(now);

        let limit = self.settings.per_file_timeout() + TIMEOUT_GRACE;
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.started_at.is_some_and(|t| now.saturating_duration_since(t) > limit))
            .map(|(id, _)| *id)
            .collect();

        for task_id in expired {
            let Some(entry) = self.in_flight.remove(&task_id) else {
                continue;
            };
            if let Some(slot) = entry.worker.and_then(|w| self.workers.get_mut(&w)) {
                slot.abandoned = true;
                slot.current = None;
            }
            tracing::warn!(
                worker_id = ?entry.worker,
                stalled = entry.worker.is_some_and(|w| self.supervisor.is_stalled(w)),
                file = %entry.task.path.display(),
                "Per-file timeout exceeded, abandoning worker"
            );
            self.finalize_timeout(entry, now);
            self.spawn_replacement();
        }
    }

    /// Write and record a `Timeout` for a task that overran its budget.
    fn finalize_timeout(&mut self, entry: InFlight, now: Instant) {
        let elapsed = entry
            .started_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        let result = ExtractionResult::failed(
            &entry.task.path,
            ErrorCode::Timeout,
            format!(
                "exceeded the {}s per-file timeout",
                self.settings.per_file_timeout().as_secs()
            ),
            ExtractionMetrics {
                duration_ms: elapsed.as_millis() as u64,
                ..ExtractionMetrics::default()
            },
        );
        self.finalize_here(entry.task, result);
    }

    /// Deliver a result the manager produced itself, then record it.
    fn finalize_here(&mut self, task: Task, result: ExtractionResult) {
        let result = result.with_attempt(task.attempt);
        let mut outcome = FileOutcome::of(task.id, &result, Delivery::Writer);
        outcome.delivery = route_result(
            &self.ctx.writers,
            self.settings.writer_send_timeout(),
            &mut self.manager_spill,
            result,
        );
        self.record(task, outcome);
    }

    fn should_retry(&self, task: &Task, code: ErrorCode) -> bool {
        let retry = &self.settings.retry;
        retry.enabled && code.is_retryable() && task.attempt <= retry.max_retries
    }

    /// Account for one outcome: either queue a retry or make it final.
    fn record(&mut self, task: Task, outcome: FileOutcome) {
        match outcome.delivery {
            Delivery::Writer => {}
            Delivery::Fallback => self.report.fallback_deliveries += 1,
            Delivery::Lost => self.report.lost_deliveries += 1,
            Delivery::Withheld => {}
        }
        match outcome.error_code {
            ErrorCode::Timeout => self.report.timed_out += 1,
            ErrorCode::WorkerError => self.report.worker_errors += 1,
            _ => {}
        }

        if !outcome.success && self.should_retry(&task, outcome.error_code) {
            let next = task.retry();
            tracing::info!(
                file = %next.path.display(),
                attempt = next.attempt,
                code = %outcome.error_code,
                "Retrying file"
            );
            self.report.retried += 1;
            self.pending.push_back(next);
            return;
        }

        if outcome.success {
            self.report.succeeded += 1;
            self.report.rows += outcome.rows;
            self.checkpoint.mark_completed(&task.path);
        } else {
            self.report.failed += 1;
            self.checkpoint.mark_failed(&task.path);
        }
        *self
            .report
            .error_counts
            .entry(outcome.error_code.as_str().to_string())
            .or_default() += 1;

        self.since_checkpoint += 1;
        if self.since_checkpoint >= CHECKPOINT_EVERY {
            self.since_checkpoint = 0;
            if let Err(e) = self.checkpoints.save(self.checkpoint) {
                tracing::error!(error = %e, "Periodic checkpoint save failed");
            }
        }
    }

    /// Take back unstarted tasks, stop every worker and wait for their exit
    /// notices until the join timeout.
    fn shutdown(&mut self) {
        self.stopping = true;

        while let Ok(command) = self.task_rx.try_recv() {
            if let WorkerCommand::Process(task) = command {
                self.in_flight.remove(&task.id);
                self.pending.push_back(task);
            }
        }

        let deadline = Instant::now() + self.settings.join_timeout();
        for _ in 0..self.workers.len() {
            if self.task_tx.send_deadline(WorkerCommand::Stop, deadline).is_err() {
                tracing::warn!("Could not deliver every stop command");
                break;
            }
        }

        while !self.workers.is_empty() {
            match self.events.recv_deadline(deadline) {
                Ok(event) => self.on_event(event),
                Err(_) => break,
            }
        }

        for (worker_id, slot) in self.workers.drain() {
            tracing::warn!(
                worker_id,
                current = ?slot.current,
                "Worker did not exit in time, force-terminated"
            );
            self.report.force_terminated += 1;
        }

        self.report.not_started = self.pending.len();
        self.report.unfinished = self.in_flight.len();
        if self.report.not_started > 0 || self.report.unfinished > 0 {
            tracing::info!(
                not_started = self.report.not_started,
                unfinished = self.report.unfinished,
                "Files left for a resumed run"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayoutSettings;
    use crate::db::{count_rows, count_rows_for_file};
    use crate::pipeline::extraction::fixtures::{
        bom_page, cover_page, single_row_document, write_fixture, FixtureDocument, FixtureEngine,
    };
    use std::path::Path;

    fn host() -> HostResources {
        HostResources::new(8, 16 * 1024 * 1024 * 1024)
    }

    fn settings_for(root: &Path) -> Settings {
        let input = root.join("input");
        std::fs::create_dir_all(&input).unwrap();
        Settings {
            input_dir: input,
            rows_output: root.join("out").join("rows.csv"),
            summary_output: root.join("out").join("summary.csv"),
            database_path: root.join("state").join("bom.sqlite"),
            checkpoint_path: root.join("state").join("checkpoint.json"),
            fallback_dir: root.join("state").join("fallback"),
            workers: Some(2),
            writer_pool_size: 2,
            heartbeat_interval_ms: 20,
            batch_interval_ms: 20,
            join_timeout_secs: 10,
            ..Settings::default()
        }
    }

    fn run_with(settings: &Settings, engine: Arc<FixtureEngine>) -> JobReport {
        JobManager::new(settings.clone(), engine, host(), Arc::new(AtomicBool::new(false)))
            .run()
            .unwrap()
    }

    fn summaries(settings: &Settings) -> Vec<crate::db::FileSummary> {
        load_summaries(&open_database(&settings.database_path).unwrap()).unwrap()
    }

    fn summary_for(settings: &Settings, name: &str) -> crate::db::FileSummary {
        summaries(settings)
            .into_iter()
            .find(|s| s.file_name == name)
            .unwrap()
    }

    fn input(settings: &Settings) -> &Path {
        &settings.input_dir
    }

    #[test]
    fn three_valid_documents() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(dir.path());
        for (name, pt) in [("a.pdf", "1"), ("b.pdf", "2"), ("c.pdf", "3")] {
            write_fixture(input(&settings), name, &single_row_document(pt));
        }

        let report = run_with(&settings, Arc::new(FixtureEngine::new()));

        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.rows, 3);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(
            report.states,
            vec![
                JobState::Init,
                JobState::Discovering,
                JobState::Dispatching,
                JobState::Draining,
                JobState::ShuttingDown,
                JobState::Reconciling,
                JobState::Reporting,
                JobState::Done,
            ]
        );
        let all = summaries(&settings);
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|s| s.success && s.row_count == 1));
        assert_eq!(count_rows(&open_database(&settings.database_path).unwrap()).unwrap(), 3);

        let csv = std::fs::read_to_string(&settings.rows_output).unwrap();
        assert_eq!(csv.lines().count(), 4);
        assert!(csv.lines().next().unwrap().starts_with("source_path,file_name,page,row_index"));
        assert_eq!(std::fs::read_to_string(&settings.summary_output).unwrap().lines().count(), 4);
    }

    #[test]
    fn empty_file_fails_alone() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(dir.path());
        write_fixture(input(&settings), "a.pdf", &single_row_document("1"));
        std::fs::write(input(&settings).join("b.pdf"), b"").unwrap();
        write_fixture(input(&settings), "c.pdf", &single_row_document("3"));

        let report = run_with(&settings, Arc::new(FixtureEngine::new()));

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.error_counts.get("file_empty"), Some(&1));
        let empty = summary_for(&settings, "b.pdf");
        assert_eq!(empty.error_code, ErrorCode::FileEmpty);
        assert_eq!(empty.row_count, 0);
        assert!(summary_for(&settings, "a.pdf").success);
        assert!(summary_for(&settings, "c.pdf").success);

        let checkpoint = CheckpointManager::new(settings.checkpoint_path.clone()).load().unwrap();
        assert_eq!(checkpoint.completed.len(), 2);
        assert!(checkpoint.failed.contains(&input(&settings).join("b.pdf")));
    }

    #[test]
    fn max_files_then_resume_covers_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_for(dir.path());
        for i in 0..5 {
            write_fixture(input(&settings), &format!("f{i}.pdf"), &single_row_document(&i.to_string()));
        }

        settings.max_files = 2;
        let first = run_with(&settings, Arc::new(FixtureEngine::new()));
        assert_eq!(first.scheduled, 2);
        assert_eq!(summaries(&settings).len(), 2);

        settings.max_files = 0;
        settings.resume = true;
        let engine = Arc::new(FixtureEngine::new());
        let second = run_with(&settings, engine.clone());
        assert_eq!(second.scheduled, 3);
        assert_eq!(engine.load_count(), 3);
        assert_eq!(summaries(&settings).len(), 5);
    }

    #[test]
    fn interrupted_run_resumes_without_rework() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_for(dir.path());
        settings.workers = Some(1);
        for i in 0..6 {
            let doc = FixtureDocument {
                delay_ms: 50,
                ..single_row_document(&i.to_string())
            };
            write_fixture(input(&settings), &format!("f{i}.pdf"), &doc);
        }

        let flag = Arc::new(AtomicBool::new(false));
        let first_engine = Arc::new(FixtureEngine::interrupting_after(2, flag.clone()));
        let first = JobManager::new(settings.clone(), first_engine.clone(), host(), flag)
            .run()
            .unwrap();
        assert!(first.interrupted);
        assert_eq!(first.exit_code(), 2);
        assert!(first.completed() < 6);
        assert_eq!(first.completed(), first_engine.load_count());
        assert!(first.states.contains(&JobState::ShuttingDown));
        assert!(first.states.contains(&JobState::Reconciling));

        settings.resume = true;
        let second_engine = Arc::new(FixtureEngine::new());
        let second = run_with(&settings, second_engine.clone());
        assert!(!second.interrupted);
        assert_eq!(first_engine.load_count() + second_engine.load_count(), 6);
        assert_eq!(summaries(&settings).len(), 6);
        assert_eq!(count_rows(&open_database(&settings.database_path).unwrap()).unwrap(), 6);
    }

    #[test]
    fn worker_count_does_not_change_rows() {
        let dir = tempfile::tempdir().unwrap();
        let base = settings_for(dir.path());
        for i in 0..8 {
            let rows: Vec<[&str; 3]> = vec![["1", "PIPE", "2"], ["2", "ELBOW", "4"], ["3", "FLANGE", "1"]];
            let doc = FixtureDocument {
                pages: vec![cover_page(1), bom_page(2, &rows), bom_page(3, &rows[..1])],
                ..FixtureDocument::default()
            };
            write_fixture(input(&base), &format!("d{i}.pdf"), &doc);
        }

        let mut collected = Vec::new();
        for (workers, db) in [(1, "one.sqlite"), (4, "four.sqlite")] {
            let settings = Settings {
                workers: Some(workers),
                database_path: dir.path().join(db),
                ..base.clone()
            };
            let report = run_with(&settings, Arc::new(FixtureEngine::new()));
            assert_eq!(report.succeeded, 8);
            collected.push(load_rows(&open_database(&settings.database_path).unwrap()).unwrap());
        }
        assert_eq!(collected[0].len(), 32);
        assert_eq!(collected[0], collected[1]);
    }

    #[test]
    fn rerun_does_not_duplicate_rows() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(dir.path());
        for i in 0..3 {
            write_fixture(input(&settings), &format!("f{i}.pdf"), &single_row_document("7"));
        }
        run_with(&settings, Arc::new(FixtureEngine::new()));
        let again = run_with(&settings, Arc::new(FixtureEngine::new()));
        assert_eq!(again.scheduled, 3);
        assert_eq!(count_rows(&open_database(&settings.database_path).unwrap()).unwrap(), 3);
        assert_eq!(summaries(&settings).len(), 3);
    }

    #[test]
    fn stuck_file_times_out_and_others_finish() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_for(dir.path());
        settings.workers = Some(1);
        settings.per_file_timeout_secs = 1;
        let slow = FixtureDocument {
            delay_ms: 2_500,
            ..single_row_document("1")
        };
        write_fixture(input(&settings), "a_slow.pdf", &slow);
        write_fixture(input(&settings), "b.pdf", &single_row_document("2"));
        write_fixture(input(&settings), "c.pdf", &single_row_document("3"));

        let report = run_with(&settings, Arc::new(FixtureEngine::new()));

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert!(report.timed_out >= 1);
        assert_eq!(report.workers_spawned, 2);
        assert_eq!(report.force_terminated, 0);
        let slow = summary_for(&settings, "a_slow.pdf");
        assert_eq!(slow.error_code, ErrorCode::Timeout);
        assert_eq!(slow.row_count, 0);
        assert_eq!(count_rows(&open_database(&settings.database_path).unwrap()).unwrap(), 2);
    }

    #[test]
    fn overrun_inside_grace_is_recorded_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_for(dir.path());
        settings.workers = Some(1);
        settings.per_file_timeout_secs = 1;
        let late = FixtureDocument {
            delay_ms: 1_200,
            ..single_row_document("1")
        };
        write_fixture(input(&settings), "a_late.pdf", &late);
        write_fixture(input(&settings), "b.pdf", &single_row_document("2"));

        let report = run_with(&settings, Arc::new(FixtureEngine::new()));

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.timed_out, 1);
        // The worker came back on its own, so nobody replaced it.
        assert_eq!(report.workers_spawned, 1);
        let late = summary_for(&settings, "a_late.pdf");
        assert_eq!(late.error_code, ErrorCode::Timeout);
        assert_eq!(late.row_count, 0);
        assert!(late.error_message.unwrap().contains("per-file timeout"));
        assert_eq!(count_rows(&open_database(&settings.database_path).unwrap()).unwrap(), 1);
        let checkpoint = CheckpointManager::new(settings.checkpoint_path.clone()).load().unwrap();
        assert!(checkpoint.failed.contains(&input(&settings).join("a_late.pdf")));
    }

    #[test]
    fn file_that_now_fails_loses_its_rows() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(dir.path());
        let a = write_fixture(input(&settings), "a.pdf", &single_row_document("1"));
        write_fixture(input(&settings), "b.pdf", &single_row_document("2"));
        run_with(&settings, Arc::new(FixtureEngine::new()));
        assert_eq!(count_rows_for_file(&open_database(&settings.database_path).unwrap(), &a).unwrap(), 1);

        std::fs::write(&a, b"").unwrap();
        let report = run_with(&settings, Arc::new(FixtureEngine::new()));

        assert_eq!(report.failed, 1);
        let summary = summary_for(&settings, "a.pdf");
        assert_eq!(summary.error_code, ErrorCode::FileEmpty);
        assert_eq!(summary.row_count, 0);
        assert_eq!(count_rows_for_file(&open_database(&settings.database_path).unwrap(), &a).unwrap(), 0);
        let csv = std::fs::read_to_string(&settings.rows_output).unwrap();
        assert_eq!(csv.lines().count(), 2);
        assert!(!csv.contains("a.pdf"));
    }

    #[test]
    fn replayed_spill_corrects_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_for(dir.path());
        let a = write_fixture(input(&settings), "a.pdf", &single_row_document("1"));

        let checkpoints = CheckpointManager::new(settings.checkpoint_path.clone());
        let mut state = CheckpointState::default();
        state.mark_failed(&a);
        checkpoints.save(&mut state).unwrap();

        let pipeline = ExtractionPipeline::new(Arc::new(FixtureEngine::new()), LayoutSettings::default(), 1 << 20).unwrap();
        let delivered_late = pipeline.process(&a);
        assert!(delivered_late.success);
        FallbackPersister::for_worker(&settings.fallback_dir, 0)
            .persist(&delivered_late)
            .unwrap();

        settings.resume = true;
        let report = run_with(&settings, Arc::new(FixtureEngine::new()));

        assert_eq!(report.scheduled, 0);
        assert_eq!(report.reconciled.results, 1);
        assert_eq!(report.checkpoint_corrections, 1);
        assert!(summary_for(&settings, "a.pdf").success);
        let state = checkpoints.load().unwrap();
        assert!(state.completed.contains(&a));
        assert!(state.failed.is_empty());
    }

    #[test]
    fn panicking_document_becomes_worker_error() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(dir.path());
        let bad = FixtureDocument {
            panic: true,
            ..single_row_document("1")
        };
        write_fixture(input(&settings), "bad.pdf", &bad);
        write_fixture(input(&settings), "good.pdf", &single_row_document("2"));

        let report = run_with(&settings, Arc::new(FixtureEngine::new()));

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.worker_errors, 1);
        let bad = summary_for(&settings, "bad.pdf");
        assert_eq!(bad.error_code, ErrorCode::WorkerError);
        assert_eq!(bad.attempt, 1);
    }

    #[test]
    fn retry_policy_gives_one_more_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_for(dir.path());
        settings.retry.enabled = true;
        settings.retry.max_retries = 1;
        let bad = FixtureDocument {
            panic: true,
            ..single_row_document("1")
        };
        write_fixture(input(&settings), "bad.pdf", &bad);
        std::fs::write(input(&settings).join("empty.pdf"), b"").unwrap();

        let report = run_with(&settings, Arc::new(FixtureEngine::new()));

        assert_eq!(report.retried, 1);
        assert_eq!(report.worker_errors, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(summary_for(&settings, "bad.pdf").attempt, 2);
        // Document problems are never retried.
        assert_eq!(summary_for(&settings, "empty.pdf").attempt, 1);
    }

    #[test]
    fn retry_failed_only_reprocesses_failures() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_for(dir.path());
        write_fixture(input(&settings), "a.pdf", &single_row_document("1"));
        write_fixture(input(&settings), "b.pdf", &single_row_document("2"));
        std::fs::write(input(&settings).join("c.pdf"), b"").unwrap();
        run_with(&settings, Arc::new(FixtureEngine::new()));

        write_fixture(input(&settings), "c.pdf", &single_row_document("3"));
        settings.retry_failed_only = true;
        settings.resume = true;
        let engine = Arc::new(FixtureEngine::new());
        let report = run_with(&settings, engine.clone());

        assert_eq!(report.scheduled, 1);
        assert_eq!(engine.load_count(), 1);
        assert!(summary_for(&settings, "c.pdf").success);
        let checkpoint = CheckpointManager::new(settings.checkpoint_path.clone()).load().unwrap();
        assert_eq!(checkpoint.completed.len(), 3);
        assert!(checkpoint.failed.is_empty());
    }

    #[test]
    fn interrupt_before_start_skips_work() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(dir.path());
        for i in 0..3 {
            write_fixture(input(&settings), &format!("f{i}.pdf"), &single_row_document("1"));
        }
        let engine = Arc::new(FixtureEngine::new());
        let report = JobManager::new(settings.clone(), engine.clone(), host(), Arc::new(AtomicBool::new(true)))
            .run()
            .unwrap();

        assert!(report.interrupted);
        assert_eq!(report.exit_code(), 2);
        assert_eq!(report.not_started, 3);
        assert_eq!(engine.load_count(), 0);
        assert_eq!(
            report.states,
            vec![JobState::Init, JobState::Discovering, JobState::Reporting, JobState::Done]
        );
        assert!(summaries(&settings).is_empty());
    }

    #[test]
    fn leftover_spill_files_are_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(dir.path());
        let mut spill = FallbackPersister::for_worker(&settings.fallback_dir, 9);
        spill
            .persist(&ExtractionResult::failed(
                Path::new("/elsewhere/old.pdf"),
                ErrorCode::NoPages,
                "document has no pages",
                ExtractionMetrics::default(),
            ))
            .unwrap();

        let report = run_with(&settings, Arc::new(FixtureEngine::new()));

        assert_eq!(report.scheduled, 0);
        assert_eq!(report.reconciled.results, 1);
        assert_eq!(summary_for(&settings, "old.pdf").error_code, ErrorCode::NoPages);
        assert!(!spill.path().exists());
    }

    #[test]
    fn missing_input_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            input_dir: dir.path().join("nowhere"),
            ..settings_for(dir.path())
        };
        let err = JobManager::new(settings, Arc::new(FixtureEngine::new()), host(), Arc::new(AtomicBool::new(false)))
            .run()
            .unwrap_err();
        assert!(matches!(err, JobError::InputNotFound(_)));
    }
}
