//! Parallel coordinator: fans entity tasks across a worker pool and streams the
//! resulting documents through a single writer.
//!
//! ```text
//!  tasks ──► dispatcher ──(bounded)──► worker 0..N ──(bounded)──► writer (caller thread) ──► sink
//! ```
//!
//! Workers never touch the sink. Each one returns a fully serialized line (or a
//! skip/failure event) and the calling thread appends it, so lines cannot
//! interleave. Both channels are bounded, so at most
//! `num_workers + 2 * queue_depth` tasks or documents are alive at once no matter
//! how many tasks the run has.
//!
//! Each worker moves through `Uninitialized → IndexReady → (Processing)* → Done`.
//! With [`IndexSource::Shared`] the index already exists and the first transition
//! is immediate; with [`IndexSource::PerWorker`] each worker builds its own from
//! the shared read-only store. A build failure is fatal: dispatch stops, tasks
//! already in flight drain, and whatever was written stays written.

use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, error, info, warn};

use crate::common::{EntityTask, Key};
use crate::index::{BuildError, TemporalIndex};
use crate::materialize::Materializer;
use crate::normalize::ScalarNormalizer;
use crate::schema::{RelationSchema, SchemaError};
use crate::store::TabularStore;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Worker threads. Defaults to the available parallelism.
    pub num_workers: usize,
    /// Capacity of the task and result channels. 0 means `num_workers`.
    pub queue_depth: usize,
    /// Draw a progress bar when the task count is known up front.
    pub show_progress: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            num_workers: thread::available_parallelism().map_or(1, |n| n.get()),
            queue_depth: 0,
            show_progress: false,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Self::default()
        }
    }

    fn effective_queue_depth(&self) -> usize {
        if self.queue_depth == 0 {
            self.num_workers
        } else {
            self.queue_depth
        }
    }
}

/// Where workers get their index from.
pub enum IndexSource {
    /// One immutable index read concurrently by every worker.
    Shared(Arc<TemporalIndex>),
    /// Every worker builds a private index from the same store.
    PerWorker {
        store: Arc<dyn TabularStore>,
        schema: Arc<RelationSchema>,
    },
}

// ============================================================================
// Worker state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    IndexReady,
    Processing,
    Done,
}

impl WorkerState {
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Uninitialized, IndexReady)
                | (Uninitialized, Done)
                | (IndexReady, Processing)
                | (Processing, IndexReady)
                | (IndexReady, Done)
        )
    }
}

struct WorkerStatus {
    id: usize,
    state: WorkerState,
}

impl WorkerStatus {
    fn advance(&mut self, next: WorkerState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "worker {}: illegal transition {:?} -> {:?}",
            self.id,
            self.state,
            next
        );
        if next != WorkerState::Processing && self.state != WorkerState::Processing {
            debug!("Worker {}: {:?} -> {:?}", self.id, self.state, next);
        }
        self.state = next;
    }
}

// ============================================================================
// Results
// ============================================================================

/// Counts reported at the end of a run. `processed` counts every task a worker
/// finished, whatever the outcome, so `processed = written + skipped + failed`
/// unless the writer failed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub dispatched: usize,
    pub processed: usize,
    /// Entity not found.
    pub skipped: usize,
    pub failed: usize,
    pub written: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid coordinator config: {0}")]
    Config(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("worker {worker} failed to build its index: {source}")]
    WorkerBuild { worker: usize, source: BuildError },
    #[error("output write failed: {0}")]
    Writer(std::io::Error),
    #[error("failed to spawn thread: {0}")]
    Spawn(std::io::Error),
    #[error("worker {0} panicked")]
    WorkerPanicked(usize),
}

enum WorkerEvent {
    Ready { worker: usize },
    Record { line: String },
    Skipped { entity: Key },
    Failed { entity: Key, error: String },
    Fatal { worker: usize, error: BuildError },
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct Coordinator {
    config: CoordinatorConfig,
    source: IndexSource,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, source: IndexSource) -> Self {
        Self { config, source }
    }

    pub fn with_index(config: CoordinatorConfig, index: Arc<TemporalIndex>) -> Self {
        Self::new(config, IndexSource::Shared(index))
    }

    pub fn per_worker(
        config: CoordinatorConfig,
        store: Arc<dyn TabularStore>,
        schema: Arc<RelationSchema>,
    ) -> Self {
        Self::new(config, IndexSource::PerWorker { store, schema })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Materialize every task and append one line per document to `sink`.
    ///
    /// Per-task failures are logged and counted. Index build failures and write
    /// failures abort the run after in-flight work drains; the sink is flushed
    /// either way.
    pub fn run<I, W>(
        &self,
        tasks: I,
        normalizer: &dyn ScalarNormalizer,
        sink: W,
    ) -> Result<RunStats, RunError>
    where
        I: IntoIterator<Item = EntityTask>,
        I::IntoIter: Send,
        W: Write,
    {
        self.run_with_threads(tasks, normalizer, sink, |id| {
            thread::Builder::new().name(format!("coordinator-worker-{id}"))
        })
    }

    fn run_with_threads<I, W, B>(
        &self,
        tasks: I,
        normalizer: &dyn ScalarNormalizer,
        mut sink: W,
        worker_thread: B,
    ) -> Result<RunStats, RunError>
    where
        I: IntoIterator<Item = EntityTask>,
        I::IntoIter: Send,
        W: Write,
        B: Fn(usize) -> thread::Builder,
    {
        let num_workers = self.config.num_workers;
        if num_workers == 0 {
            return Err(RunError::Config("num_workers must be at least 1".into()));
        }
        if let IndexSource::PerWorker { schema, .. } = &self.source {
            schema.validate()?;
        }
        let queue_depth = self.config.effective_queue_depth();

        let tasks = tasks.into_iter();
        let progress = self.progress_bar(tasks.size_hint());
        info!(
            "Coordinator: {} workers, queue depth {}, {} index",
            num_workers,
            queue_depth,
            match self.source {
                IndexSource::Shared(_) => "shared",
                IndexSource::PerWorker { .. } => "per-worker",
            }
        );

        let shutdown = AtomicBool::new(false);
        let (task_tx, task_rx) = channel::bounded::<EntityTask>(queue_depth);
        let (event_tx, event_rx) = channel::bounded::<WorkerEvent>(queue_depth);

        let mut stats = RunStats::default();
        let mut fatal: Option<RunError> = None;
        let mut write_error: Option<std::io::Error> = None;

        let joined = thread::scope(|s| -> Result<(usize, Vec<usize>), RunError> {
            let shutdown = &shutdown;
            let source = &self.source;

            let dispatcher = thread::Builder::new()
                .name("coordinator-dispatch".into())
                .spawn_scoped(s, move || dispatch_loop(tasks, task_tx, shutdown))
                .map_err(RunError::Spawn)?;

            let mut workers = Vec::with_capacity(num_workers);
            let mut spawn_error = None;
            for id in 0..num_workers {
                let rx = task_rx.clone();
                let tx = event_tx.clone();
                let handle = worker_thread(id)
                    .spawn_scoped(s, move || worker_loop(id, source, normalizer, rx, tx, shutdown));
                match handle {
                    Ok(handle) => workers.push(handle),
                    Err(e) => {
                        // Workers already running may be blocked on a full event
                        // channel, so they are drained and joined before returning.
                        error!("Failed to spawn worker {id}, stopping dispatch: {e}");
                        shutdown.store(true, Ordering::SeqCst);
                        spawn_error = Some(e);
                        break;
                    }
                }
            }
            // Only workers hold these now; the event loop ends when the last one exits.
            drop(task_rx);
            drop(event_tx);

            for event in event_rx.iter() {
                match event {
                    WorkerEvent::Ready { worker } => debug!("Worker {worker} ready"),
                    WorkerEvent::Record { line } => {
                        stats.processed += 1;
                        if write_error.is_none() {
                            match write_line(&mut sink, &line) {
                                Ok(()) => stats.written += 1,
                                Err(e) => {
                                    error!("Output write failed, stopping dispatch: {e}");
                                    shutdown.store(true, Ordering::SeqCst);
                                    write_error = Some(e);
                                }
                            }
                        }
                    }
                    WorkerEvent::Skipped { entity } => {
                        debug!("Entity {entity} not found, task skipped");
                        stats.processed += 1;
                        stats.skipped += 1;
                    }
                    WorkerEvent::Failed { entity, error } => {
                        warn!("Task for entity {entity} failed: {error}");
                        stats.processed += 1;
                        stats.failed += 1;
                    }
                    WorkerEvent::Fatal { worker, error } => {
                        error!("Worker {worker} could not build its index: {error}");
                        shutdown.store(true, Ordering::SeqCst);
                        if fatal.is_none() {
                            fatal = Some(RunError::WorkerBuild {
                                worker,
                                source: error,
                            });
                        }
                    }
                }
                progress.set_position(stats.processed as u64);
            }

            let mut panicked = Vec::new();
            for (id, handle) in workers.into_iter().enumerate() {
                if handle.join().is_err() {
                    panicked.push(id);
                }
            }
            let dispatched = dispatcher.join().unwrap_or_default();
            if let Some(e) = spawn_error {
                return Err(RunError::Spawn(e));
            }
            Ok((dispatched, panicked))
        });

        progress.finish_and_clear();
        let flushed = sink.flush();

        let (dispatched, panicked) = joined?;
        stats.dispatched = dispatched;

        if let Some(e) = write_error {
            return Err(RunError::Writer(e));
        }
        if let Some(e) = fatal {
            return Err(e);
        }
        if let Some(&id) = panicked.first() {
            return Err(RunError::WorkerPanicked(id));
        }
        flushed.map_err(RunError::Writer)?;

        info!(
            "Run complete: {} dispatched, {} processed, {} skipped, {} failed, {} written",
            stats.dispatched, stats.processed, stats.skipped, stats.failed, stats.written
        );
        Ok(stats)
    }

    fn progress_bar(&self, size_hint: (usize, Option<usize>)) -> ProgressBar {
        match size_hint {
            (lower, Some(upper)) if self.config.show_progress && lower == upper => {
                let pb = ProgressBar::new(upper as u64);
                if let Ok(style) = ProgressStyle::with_template(
                    "  Materializing {bar:40.cyan/blue} {pos}/{len} tasks [{elapsed_precise}, ETA {eta_precise}]",
                ) {
                    pb.set_style(style.progress_chars("##-"));
                }
                pb
            }
            _ => ProgressBar::hidden(),
        }
    }
}

fn write_line(sink: &mut impl Write, line: &str) -> std::io::Result<()> {
    sink.write_all(line.as_bytes())?;
    sink.write_all(b"\n")
}

fn dispatch_loop(
    tasks: impl Iterator<Item = EntityTask>,
    tx: Sender<EntityTask>,
    shutdown: &AtomicBool,
) -> usize {
    let mut dispatched = 0;
    for task in tasks {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Dispatcher stopping after {dispatched} tasks");
            break;
        }
        if tx.send(task).is_err() {
            break; // all workers gone
        }
        dispatched += 1;
    }
    dispatched
}

fn worker_loop(
    id: usize,
    source: &IndexSource,
    normalizer: &dyn ScalarNormalizer,
    tasks: Receiver<EntityTask>,
    events: Sender<WorkerEvent>,
    shutdown: &AtomicBool,
) {
    let mut status = WorkerStatus {
        id,
        state: WorkerState::Uninitialized,
    };

    let owned;
    let index: &TemporalIndex = match source {
        IndexSource::Shared(index) => index.as_ref(),
        IndexSource::PerWorker { store, schema } => {
            match TemporalIndex::build(store.as_ref(), Arc::clone(schema)) {
                Ok(index) => {
                    owned = index;
                    &owned
                }
                Err(error) => {
                    shutdown.store(true, Ordering::SeqCst);
                    let _ = events.send(WorkerEvent::Fatal { worker: id, error });
                    status.advance(WorkerState::Done);
                    return;
                }
            }
        }
    };
    status.advance(WorkerState::IndexReady);
    if events.send(WorkerEvent::Ready { worker: id }).is_err() {
        status.advance(WorkerState::Done);
        return;
    }

    let materializer = Materializer::new(index, normalizer);
    while !shutdown.load(Ordering::Relaxed) {
        let Ok(task) = tasks.recv() else {
            break;
        };
        status.advance(WorkerState::Processing);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| materializer.materialize_line(&task)));
        let event = match outcome {
            Ok(Ok(Some(line))) => WorkerEvent::Record { line },
            Ok(Ok(None)) => WorkerEvent::Skipped {
                entity: task.entity_id,
            },
            Ok(Err(e)) => WorkerEvent::Failed {
                entity: task.entity_id,
                error: e.to_string(),
            },
            Err(payload) => WorkerEvent::Failed {
                entity: task.entity_id,
                error: panic_message(payload.as_ref()),
            },
        };
        status.advance(WorkerState::IndexReady);
        if events.send(event).is_err() {
            break;
        }
    }
    status.advance(WorkerState::Done);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}
