//! End-to-end runs through the coordinator: Parquet in, JSONL out.

mod common;

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{event_index, event_schema, event_store, t, write_event_db, write_event_tasks};
use headwater::common::EntityTask;
use headwater::coordinator::{Coordinator, CoordinatorConfig, RunError, RunStats};
use headwater::materialize::Materializer;
use headwater::normalize::DefaultNormalizer;
use headwater::store::{ParquetStore, TabularStore};
use headwater::tasks;

/// Accepts `capacity` lines, then fails every write.
struct FullDisk {
    written: Vec<u8>,
    lines: usize,
    capacity: usize,
}

impl Write for FullDisk {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.lines >= self.capacity {
            return Err(io::Error::other("no space left on device"));
        }
        self.lines += buf.iter().filter(|&&b| b == b'\n').count();
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Records how far task dispatch ran ahead of the writer.
struct LagProbe<'a> {
    pulled: &'a AtomicUsize,
    lines: usize,
    max_lag: usize,
}

impl Write for LagProbe<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let lag = self.pulled.load(Ordering::SeqCst).saturating_sub(self.lines);
        self.max_lag = self.max_lag.max(lag);
        self.lines += buf.iter().filter(|&&b| b == b'\n').count();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn unknown_entities_are_skipped_and_counted() {
    let coordinator = Coordinator::with_index(CoordinatorConfig::with_workers(2), Arc::new(event_index()));
    let tasks = vec![
        EntityTask::full_history("X"),
        EntityTask::full_history(1),
        EntityTask::at(2, t(5)),
    ];
    let mut out = Vec::new();
    let stats = coordinator
        .run(tasks, &DefaultNormalizer::default(), &mut out)
        .unwrap();
    assert_eq!(
        stats,
        RunStats {
            dispatched: 3,
            processed: 3,
            skipped: 1,
            failed: 0,
            written: 2,
        }
    );
    assert_eq!(String::from_utf8(out).unwrap().lines().count(), 2);
}

#[test]
fn writer_failure_aborts_but_keeps_flushed_lines() {
    let coordinator = Coordinator::with_index(CoordinatorConfig::with_workers(3), Arc::new(event_index()));
    let tasks: Vec<EntityTask> = (0..300i64).map(|i| EntityTask::full_history(i % 3 + 1)).collect();
    let mut disk = FullDisk {
        written: Vec::new(),
        lines: 0,
        capacity: 5,
    };
    let err = coordinator
        .run(tasks, &DefaultNormalizer::default(), &mut disk)
        .unwrap_err();
    assert!(matches!(err, RunError::Writer(_)));

    let text = String::from_utf8(disk.written).unwrap();
    assert!(text.ends_with('\n'));
    assert_eq!(text.lines().count(), 5);
    for line in text.lines() {
        serde_json::from_str::<serde_json::Value>(line).unwrap();
    }
}

#[test]
fn dispatch_stays_within_a_bounded_window() {
    let pulled = AtomicUsize::new(0);
    let config = CoordinatorConfig {
        num_workers: 2,
        queue_depth: 2,
        show_progress: false,
    };
    let window = config.num_workers + 2 * config.queue_depth + 2;
    let coordinator = Coordinator::with_index(config, Arc::new(event_index()));
    let tasks = (0..2_000i64)
        .map(|i| EntityTask::full_history(i % 3 + 1))
        .inspect(|_| {
            pulled.fetch_add(1, Ordering::SeqCst);
        });
    let mut probe = LagProbe {
        pulled: &pulled,
        lines: 0,
        max_lag: 0,
    };
    let stats = coordinator
        .run(tasks, &DefaultNormalizer::default(), &mut probe)
        .unwrap();
    assert_eq!(stats.written, 2_000);
    assert!(
        probe.max_lag <= window,
        "dispatch ran {} tasks ahead of the writer (window {})",
        probe.max_lag,
        window
    );
}

#[test]
fn parquet_task_split_round_trip() {
    let db_dir = tempfile::tempdir().unwrap();
    let tasks_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    write_event_db(db_dir.path());
    write_event_tasks(
        tasks_dir.path(),
        "train",
        &[(1, Some(2), 1), (2, Some(100), 0), (9, Some(5), 0), (3, None, 1)],
    );

    let schema = Arc::new(event_schema());
    let spec = schema.tasks["user-attendance"].clone();
    let set = tasks::load_tasks(&tasks::split_path(tasks_dir.path(), "train"), &spec).unwrap();
    assert_eq!(set.len(), 3);
    assert_eq!(set.invalid, 1);

    let store: Arc<dyn TabularStore> = Arc::new(ParquetStore::new(db_dir.path()));
    let coordinator = Coordinator::per_worker(CoordinatorConfig::with_workers(2), store, schema);
    let output = tasks::split_output_path(out_dir.path(), "train");
    let file = std::fs::File::create(&output).unwrap();
    let stats = coordinator
        .run(set.tasks, &DefaultNormalizer::default(), io::BufWriter::new(file))
        .unwrap();
    assert_eq!(stats.written, 2);
    assert_eq!(stats.skipped, 1);

    let text = std::fs::read_to_string(&output).unwrap();
    assert!(text.ends_with('\n'));
    let mut lines: Vec<&str> = text.lines().collect();
    lines.sort();

    // The same documents come out of the in-memory tables.
    let index = event_index();
    let normalizer = DefaultNormalizer::default();
    let m = Materializer::new(&index, &normalizer);
    let mut expected = vec![
        m.materialize_line(&EntityTask::at(1, t(2)).with_label(1i64)).unwrap().unwrap(),
        m.materialize_line(&EntityTask::at(2, t(100)).with_label(0i64)).unwrap().unwrap(),
    ];
    expected.sort();
    assert_eq!(lines, expected);
}

#[test]
fn full_history_run_over_parquet_store() {
    let db_dir = tempfile::tempdir().unwrap();
    write_event_db(db_dir.path());
    let store = ParquetStore::new(db_dir.path());
    let users = store.load_table("users").unwrap();
    let entity_tasks = tasks::full_history_tasks(&users, "user_id").unwrap();
    assert_eq!(entity_tasks.len(), 3);

    let index = Arc::new(
        headwater::index::TemporalIndex::build(&store, Arc::new(event_schema())).unwrap(),
    );
    let coordinator = Coordinator::with_index(CoordinatorConfig::with_workers(4), index);
    let mut out = Vec::new();
    let stats = coordinator
        .run(entity_tasks, &DefaultNormalizer::default(), &mut out)
        .unwrap();
    assert_eq!(stats.written, 3);

    let memory_index = headwater::index::TemporalIndex::build(&event_store(), Arc::new(event_schema())).unwrap();
    let normalizer = DefaultNormalizer::default();
    let m = Materializer::new(&memory_index, &normalizer);
    let text = String::from_utf8(out).unwrap();
    for user in 1..=3i64 {
        let line = m.materialize_line(&EntityTask::full_history(user)).unwrap().unwrap();
        assert!(text.lines().any(|l| l == line), "missing document for user {user}");
    }
}
