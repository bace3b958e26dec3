//! Materialization throughput benchmarks.
//!
//! Runs on a synthetic forum-shaped database (users → posts → comments, plus a
//! badge lookup) whose per-user fan-out follows a log-normal distribution, so a
//! few heavy users dominate the way they do in real activity tables.
//!
//! - **index_build**: partitioning and sorting every relation.
//! - **materialize**: single-threaded document construction under a cutoff.
//! - **coordinator**: a full run into `io::sink()` across worker counts.
//!
//! # Running
//!
//! ```sh
//! cargo bench --bench materialize_throughput
//! ```

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::LogNormal;

use headwater::common::{EntityTask, Table, Timestamp, Value};
use headwater::coordinator::{Coordinator, CoordinatorConfig};
use headwater::index::TemporalIndex;
use headwater::materialize::Materializer;
use headwater::normalize::DefaultNormalizer;
use headwater::schema::{RelationSchema, RelationSpec};
use headwater::store::MemoryStore;

const NUM_USERS: i64 = 5_000;
const NUM_BADGES: i64 = 50;
const HORIZON: i64 = 1_000_000;

// ============================================================================
// Synthetic data
// ============================================================================

fn generate_store(seed: u64) -> MemoryStore {
    let mut rng = StdRng::seed_from_u64(seed);
    // Median around 7 posts per user with a long tail.
    let fan_out = LogNormal::new(2.0, 1.0).unwrap();

    let mut users = Table::new("users", vec!["user_id".into(), "badge_id".into(), "reputation".into()]).unwrap();
    let mut posts = Table::new(
        "posts",
        vec!["post_id".into(), "owner_id".into(), "created_at".into(), "score".into(), "title".into()],
    )
    .unwrap();
    let mut comments = Table::new(
        "comments",
        vec!["comment_id".into(), "post_id".into(), "created_at".into(), "text".into()],
    )
    .unwrap();
    let mut badges = Table::new("badges", vec!["badge_id".into(), "name".into()]).unwrap();

    for b in 0..NUM_BADGES {
        badges.push_row(vec![b.into(), format!("badge-{b}").into()]).unwrap();
    }

    let mut post_id = 0i64;
    let mut comment_id = 0i64;
    for user in 0..NUM_USERS {
        let badge = if rng.random_bool(0.8) {
            Value::Int(rng.random_range(0..NUM_BADGES))
        } else {
            Value::Null
        };
        users
            .push_row(vec![user.into(), badge, rng.random_range(1..10_000i64).into()])
            .unwrap();

        let num_posts = (rng.sample::<f64, _>(&fan_out) as usize).min(500);
        for _ in 0..num_posts {
            let created = rng.random_range(0..HORIZON);
            posts
                .push_row(vec![
                    post_id.into(),
                    user.into(),
                    Value::Timestamp(Timestamp(created)),
                    rng.random_range(-5..100i64).into(),
                    format!("post {post_id} by user {user}").into(),
                ])
                .unwrap();
            for _ in 0..rng.random_range(0..4) {
                comments
                    .push_row(vec![
                        comment_id.into(),
                        post_id.into(),
                        Value::Timestamp(Timestamp(rng.random_range(created..HORIZON))),
                        "looks right to me".into(),
                    ])
                    .unwrap();
                comment_id += 1;
            }
            post_id += 1;
        }
    }

    MemoryStore::new()
        .with_table(users)
        .with_table(posts)
        .with_table(comments)
        .with_table(badges)
}

fn schema() -> Arc<RelationSchema> {
    Arc::new(RelationSchema::new(
        "synthetic-forum",
        "users",
        "user_id",
        vec![
            RelationSpec::one_to_many("users", "posts", "user_id", "owner_id", "posts")
                .with_time_column("created_at"),
            RelationSpec::one_to_many("posts", "comments", "post_id", "post_id", "comments")
                .with_time_column("created_at"),
            RelationSpec::lookup("users", "badges", "badge_id", "badge_id", "badge"),
        ],
    ))
}

fn generate_tasks(count: usize, seed: u64) -> Vec<EntityTask> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            EntityTask::at(
                rng.random_range(0..NUM_USERS),
                Timestamp(rng.random_range(0..HORIZON)),
            )
            .with_label(rng.random_range(0..2i64))
        })
        .collect()
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_index_build(c: &mut Criterion) {
    let store = generate_store(7);
    let schema = schema();

    let mut group = c.benchmark_group("index_build");
    group.sample_size(10);
    group.bench_function("synthetic_forum", |b| {
        b.iter(|| TemporalIndex::build(&store, schema.clone()).unwrap());
    });
    group.finish();
}

fn bench_materialize(c: &mut Criterion) {
    let index = TemporalIndex::build(&generate_store(7), schema()).unwrap();
    let normalizer = DefaultNormalizer::default();
    let materializer = Materializer::new(&index, &normalizer);
    let tasks = generate_tasks(2_000, 11);

    let mut group = c.benchmark_group("materialize");
    group.throughput(Throughput::Elements(tasks.len() as u64));
    group.bench_function("point_in_time", |b| {
        b.iter(|| {
            for task in &tasks {
                let _ = materializer.materialize_line(task).unwrap();
            }
        });
    });
    let full: Vec<EntityTask> = (0..2_000i64).map(EntityTask::full_history).collect();
    group.bench_function("full_history", |b| {
        b.iter(|| {
            for task in &full {
                let _ = materializer.materialize_line(task).unwrap();
            }
        });
    });
    group.finish();
}

fn bench_coordinator(c: &mut Criterion) {
    let index = Arc::new(TemporalIndex::build(&generate_store(7), schema()).unwrap());
    let normalizer = DefaultNormalizer::default();
    let tasks = generate_tasks(20_000, 13);

    let mut group = c.benchmark_group("coordinator");
    group.sample_size(10);
    group.throughput(Throughput::Elements(tasks.len() as u64));
    for workers in [1, 2, 4, 8] {
        let config = CoordinatorConfig {
            show_progress: false,
            ..CoordinatorConfig::with_workers(workers)
        };
        let coordinator = Coordinator::with_index(config, index.clone());
        group.bench_with_input(BenchmarkId::new("run", workers), &workers, |b, _| {
            b.iter(|| {
                coordinator
                    .run(tasks.clone(), &normalizer, std::io::sink())
                    .unwrap()
            });
        });
    }
    group.finish();
}

// ============================================================================
// Criterion main
// ============================================================================

fn main() {
    let mut criterion = Criterion::default()
        .warm_up_time(std::time::Duration::from_secs(2))
        .measurement_time(std::time::Duration::from_secs(10))
        .configure_from_args();

    bench_index_build(&mut criterion);
    bench_materialize(&mut criterion);
    bench_coordinator(&mut criterion);

    criterion.final_summary();
}
