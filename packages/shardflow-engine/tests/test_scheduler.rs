//! Integration tests for the scheduler's admission and ordering guarantees

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shardflow_engine::{
    EngineError, HandlerRegistry, JobContext, JobHandler, JobOutcome, JobSpec, Resources,
    RunStateStore, Scheduler,
};
use shardflow_store::ArtifactStore;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct SpawnParams {
    count: usize,
    child_kind: String,
    child_cores: u32,
}

/// Root job that fans out `count` children of the given kind.
struct SpawnChildren;

#[async_trait]
impl JobHandler for SpawnChildren {
    fn kind(&self) -> &str {
        "t.spawn"
    }

    async fn run(&self, ctx: &mut JobContext) -> shardflow_engine::Result<JobOutcome> {
        let params: SpawnParams = ctx.parse_params()?;
        let mut outcome = JobOutcome::empty();
        for i in 0..params.count {
            outcome = outcome.child(
                JobSpec::new(format!("c{}", i), &params.child_kind)
                    .resources(Resources::new(params.child_cores, 0, 0)),
            );
        }
        Ok(outcome)
    }
}

/// Records how many attempts overlap in time.
struct TrackedSleep {
    current: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for TrackedSleep {
    fn kind(&self) -> &str {
        "t.tracked"
    }

    async fn run(&self, _ctx: &mut JobContext) -> shardflow_engine::Result<JobOutcome> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(JobOutcome::empty())
    }
}

/// Appends its job name to a shared log.
struct RecordOrder {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl JobHandler for RecordOrder {
    fn kind(&self) -> &str {
        "t.record"
    }

    async fn run(&self, ctx: &mut JobContext) -> shardflow_engine::Result<JobOutcome> {
        self.log.lock().unwrap().push(ctx.job_name.clone());
        Ok(JobOutcome::empty())
    }
}

async fn scheduler_with(
    capacity: Resources,
    handlers: Vec<Arc<dyn JobHandler>>,
) -> (Scheduler, PathBuf) {
    let base = std::env::temp_dir().join(format!("shardflow-it-sched-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&base).unwrap();

    let store = Arc::new(ArtifactStore::open(base.join("store")).await.unwrap());
    let state = Arc::new(RunStateStore::in_memory().await.unwrap());
    let mut registry = HandlerRegistry::new();
    for handler in handlers {
        registry.register(handler);
    }

    let scheduler = Scheduler::new(
        store,
        Arc::new(registry),
        state,
        capacity,
        base.join("scratch"),
    );
    (scheduler, base)
}

fn spawn_spec(count: usize, child_kind: &str, child_cores: u32) -> JobSpec {
    JobSpec::new("root", "t.spawn")
        .params(&SpawnParams {
            count,
            child_kind: child_kind.to_string(),
            child_cores,
        })
        .unwrap()
}

#[tokio::test]
async fn test_running_resources_never_exceed_capacity() {
    let current = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let (scheduler, base) = scheduler_with(
        Resources::new(2, 4 << 30, u64::MAX),
        vec![
            Arc::new(SpawnChildren),
            Arc::new(TrackedSleep {
                current: current.clone(),
                max_seen: max_seen.clone(),
            }),
        ],
    )
    .await;

    let result = scheduler
        .run(spawn_spec(6, "t.tracked", 1))
        .await
        .unwrap();
    assert_eq!(result.jobs_executed, 7);

    // Two 1-core jobs fit a 2-core worker; a third never overlaps
    let max = max_seen.load(Ordering::SeqCst);
    assert!(max >= 1, "children never ran");
    assert!(max <= 2, "observed {} concurrent jobs on a 2-core worker", max);

    std::fs::remove_dir_all(&base).ok();
}

#[tokio::test]
async fn test_serial_dispatch_is_fifo_by_submission_order() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let (scheduler, base) = scheduler_with(
        Resources::new(1, 1 << 30, u64::MAX),
        vec![
            Arc::new(SpawnChildren),
            Arc::new(RecordOrder { log: log.clone() }),
        ],
    )
    .await;

    scheduler
        .run(spawn_spec(4, "t.record", 1))
        .await
        .unwrap();

    let order = log.lock().unwrap().clone();
    assert_eq!(order, vec!["c0", "c1", "c2", "c3"]);

    std::fs::remove_dir_all(&base).ok();
}

#[tokio::test]
async fn test_wide_jobs_do_not_starve_under_backfill() {
    // A 2-core job queued behind 1-core jobs on a 2-core worker still runs.
    let (scheduler, base) = scheduler_with(
        Resources::new(2, 4 << 30, u64::MAX),
        vec![
            Arc::new(SpawnChildren),
            Arc::new(TrackedSleep {
                current: Arc::new(AtomicUsize::new(0)),
                max_seen: Arc::new(AtomicUsize::new(0)),
            }),
        ],
    )
    .await;

    let result = scheduler
        .run(spawn_spec(3, "t.tracked", 2))
        .await
        .unwrap();
    assert_eq!(result.jobs_executed, 4);

    std::fs::remove_dir_all(&base).ok();
}

#[tokio::test]
async fn test_cancellation_stops_dispatch() {
    let (scheduler, base) = scheduler_with(
        Resources::new(2, 4 << 30, u64::MAX),
        vec![Arc::new(SpawnChildren)],
    )
    .await;

    scheduler.cancellation_token().cancel();
    let err = scheduler
        .run(spawn_spec(2, "t.record", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Aborted));

    std::fs::remove_dir_all(&base).ok();
}
