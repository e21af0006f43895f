//! Scheduler/executor
//!
//! One event loop owns the job graph, the resource ledger and the checkpoint
//! writes; job attempts run on spawned tasks and report back over a channel.
//! That single serialization point is what rules out double-dispatch of a
//! job and over-commit of the worker.
//!
//! Dispatch policy: RUNNABLE jobs are scanned in submission (FIFO) order and
//! each one whose declared resources fit the remaining headroom is started;
//! jobs that do not fit wait, later jobs may backfill around them. On a
//! permanent failure no new jobs are dispatched, in-flight jobs drain
//! naturally, and the failure is surfaced with the job id.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use shardflow_store::{ArtifactHandle, ArtifactStore};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::{RunStateStore, RunStatus};
use crate::error::{EngineError, ErrorCategory, Result};
use crate::graph::JobGraph;
use crate::job::{HandlerRegistry, JobContext, JobHandler, JobId, JobOutcome, JobSpec, JobState};
use crate::resources::{ResourceLedger, Resources};
use crate::workdir::ScopedWorkDir;

/// Final accounting of a run
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Outputs of the run's result job (the root's terminal follow-on)
    pub final_outputs: Vec<ArtifactHandle>,
    /// Job attempts started by this process (zero when resuming a run that
    /// had already completed)
    pub jobs_executed: usize,
    /// Jobs restored as already succeeded from the run state
    pub jobs_resumed: usize,
    pub duration_ms: u64,
}

struct JobCompletion {
    job_id: JobId,
    resources: Resources,
    result: Result<JobOutcome>,
}

pub struct Scheduler {
    store: Arc<ArtifactStore>,
    registry: Arc<HandlerRegistry>,
    state: Arc<RunStateStore>,
    capacity: Resources,
    scratch_root: PathBuf,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: Arc<ArtifactStore>,
        registry: Arc<HandlerRegistry>,
        state: Arc<RunStateStore>,
        capacity: Resources,
        scratch_root: PathBuf,
    ) -> Self {
        Self {
            store,
            registry,
            state,
            capacity,
            scratch_root,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops new dispatch when cancelled; in-flight jobs finish
    /// naturally.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start a fresh run from one root job.
    pub async fn run(&self, root: JobSpec) -> Result<RunResult> {
        if !self.state.is_fresh().await? {
            return Err(EngineError::config(
                "State database already holds a run; resume it or use a fresh state path",
            ));
        }
        self.validate_spec(&root)?;

        let mut graph = JobGraph::new();
        let root_id = graph.add_root(root)?;
        self.state.save_job(graph.job(root_id)?).await?;
        self.state.set_root(root_id).await?;

        info!(root = %root_id, capacity = %self.capacity, "starting fresh run");
        self.drive(graph, 0).await
    }

    /// Continue a run from its persisted state. Jobs already SUCCEEDED are
    /// never re-executed; attempts that were RUNNING at the time of a crash
    /// are redone from scratch.
    pub async fn resume(&self) -> Result<RunResult> {
        let meta = self
            .state
            .run_meta()
            .await?
            .ok_or_else(|| EngineError::config("No persisted run to resume"))?;

        if meta.status == RunStatus::Complete {
            info!("run already complete; nothing to execute");
            return Ok(RunResult {
                final_outputs: meta.final_outputs.unwrap_or_default(),
                jobs_executed: 0,
                jobs_resumed: 0,
                duration_ms: 0,
            });
        }

        let graph = JobGraph::rebuild(self.state.load_jobs().await?)?;

        // A permanently failed job keeps the run failed across restarts.
        if let Some(node) = graph
            .nodes()
            .find(|n| matches!(n.state, JobState::PermanentlyFailed { .. }))
        {
            let reason = match &node.state {
                JobState::PermanentlyFailed { error, .. } => error.clone(),
                _ => unreachable!(),
            };
            return Err(EngineError::PermanentFailure {
                id: node.id(),
                name: node.spec.name.clone(),
                attempts: node.attempts,
                reason,
            });
        }

        let resumed = graph.counts().succeeded;
        info!(
            jobs = graph.len(),
            resumed,
            "resuming run from persisted state"
        );
        self.drive(graph, resumed).await
    }

    async fn drive(&self, mut graph: JobGraph, jobs_resumed: usize) -> Result<RunResult> {
        let started = Instant::now();
        let (tx, mut rx) = mpsc::unbounded_channel::<JobCompletion>();
        let mut ledger = ResourceLedger::new(self.capacity);
        let mut running: usize = 0;
        let mut executed: usize = 0;
        let mut abort: Option<EngineError> = None;

        for id in graph.promote_ready()? {
            self.state.save_job(graph.job(id)?).await?;
        }

        loop {
            if abort.is_none() && !self.cancel.is_cancelled() {
                if let Err(e) = self
                    .dispatch(&mut graph, &mut ledger, &tx, &mut running, &mut executed)
                    .await
                {
                    error!(error = %e, "dispatch failed, aborting run");
                    abort.get_or_insert(e);
                }
            }

            if running == 0 {
                if let Some(err) = abort.take() {
                    self.state.mark_failed().await?;
                    error!(error = %err, counts = %graph.counts(), "run failed");
                    return Err(err);
                }
                if graph.is_complete() {
                    let result_id = graph.result_job()?;
                    let outputs = graph
                        .job(result_id)?
                        .outputs()
                        .unwrap_or_default()
                        .to_vec();
                    self.state.mark_complete(&outputs).await?;
                    info!(
                        counts = %graph.counts(),
                        executed,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "run complete"
                    );
                    return Ok(RunResult {
                        final_outputs: outputs,
                        jobs_executed: executed,
                        jobs_resumed,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                if self.cancel.is_cancelled() {
                    self.state.mark_failed().await?;
                    warn!("run cancelled; in-flight jobs have drained");
                    return Err(EngineError::Aborted);
                }
                // Runnable work exists but nothing could be admitted with an
                // idle worker: structurally stuck.
                self.state.mark_failed().await?;
                return Err(EngineError::Stalled);
            }

            let Some(completion) = rx.recv().await else {
                return Err(EngineError::Stalled);
            };
            running -= 1;
            ledger.release(&completion.resources);

            if let Err(e) = self.settle(&mut graph, completion).await {
                // Permanent failures and structural errors stop new dispatch;
                // checkpoint write failures land here too, since without
                // durable state the exactly-once guarantee is gone.
                abort.get_or_insert(e);
            }
        }
    }

    /// Start every admissible RUNNABLE job, FIFO with backfill.
    async fn dispatch(
        &self,
        graph: &mut JobGraph,
        ledger: &mut ResourceLedger,
        tx: &mpsc::UnboundedSender<JobCompletion>,
        running: &mut usize,
        executed: &mut usize,
    ) -> Result<()> {
        for id in graph.runnable_fifo() {
            let resources = graph.job(id)?.spec.resources;
            if !ledger.can_admit(&resources) {
                continue;
            }

            // Resolve everything that can fail before committing the start.
            let handler = self.registry.get(&graph.job(id)?.spec.kind)?;
            let inputs = graph.resolve_inputs(id)?;
            let attempt = graph.job_mut(id)?.start()?;
            self.state.save_job(graph.job(id)?).await?;
            ledger.acquire(&resources);
            *running += 1;
            *executed += 1;

            let node = graph.job(id)?;
            info!(
                job = %id,
                name = %node.spec.name,
                attempt,
                in_use = %ledger.in_use(),
                "dispatching job"
            );

            let params = node.spec.params.clone();
            let job_name = node.spec.name.clone();
            let store = self.store.clone();
            let scratch_root = self.scratch_root.clone();
            let cores = resources.cores;
            let tx = tx.clone();

            tokio::spawn(async move {
                // A panicking handler must still produce a completion, or the
                // event loop would wait forever.
                let attempt_future = run_attempt(
                    handler,
                    store,
                    scratch_root,
                    id,
                    job_name,
                    attempt,
                    params,
                    inputs,
                    cores,
                );
                let result = AssertUnwindSafe(attempt_future)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(EngineError::JobFailed("job attempt panicked".to_string()))
                    });
                // The receiver only goes away when the run is over.
                let _ = tx.send(JobCompletion {
                    job_id: id,
                    resources,
                    result,
                });
            });
        }
        Ok(())
    }

    /// Apply one completion under the serialization point: state transition,
    /// checkpoint write, graph expansion, readiness recheck.
    async fn settle(&self, graph: &mut JobGraph, completion: JobCompletion) -> Result<()> {
        let JobCompletion { job_id, result, .. } = completion;

        match result {
            Ok(outcome) => {
                let JobOutcome {
                    outputs,
                    children,
                    follow_ons,
                } = outcome;

                graph.job_mut(job_id)?.succeed(outputs)?;
                let node = graph.job(job_id)?;
                self.state.save_job(node).await?;
                info!(job = %job_id, name = %node.spec.name, "job succeeded");

                if !children.is_empty() || !follow_ons.is_empty() {
                    for spec in children.iter().chain(follow_ons.iter()) {
                        self.validate_spec(spec)?;
                    }
                    let new_ids = graph.apply_outcome(job_id, children, follow_ons)?;
                    for id in &new_ids {
                        self.state.save_job(graph.job(*id)?).await?;
                    }
                    info!(parent = %job_id, spawned = new_ids.len(), "graph expanded");
                }
            }
            Err(err) => {
                let category = err.category();
                let reason = err.to_string();
                graph.job_mut(job_id)?.fail(reason.clone(), category)?;

                let (name, attempts, retries_allowed) = {
                    let node = graph.job(job_id)?;
                    (
                        node.spec.name.clone(),
                        node.attempts,
                        node.spec.retries_allowed,
                    )
                };

                let exhausted = attempts > retries_allowed;
                match category {
                    ErrorCategory::Transient if !exhausted => {
                        graph.job_mut(job_id)?.retry()?;
                        self.state.save_job(graph.job(job_id)?).await?;
                        warn!(
                            job = %job_id,
                            name = %name,
                            attempt = attempts,
                            retries_allowed,
                            error = %reason,
                            "job failed, retrying"
                        );
                    }
                    _ => {
                        graph.job_mut(job_id)?.condemn(reason.clone())?;
                        self.state.save_job(graph.job(job_id)?).await?;
                        error!(
                            job = %job_id,
                            name = %name,
                            attempts,
                            category = %category,
                            error = %reason,
                            "job permanently failed"
                        );
                        return Err(EngineError::PermanentFailure {
                            id: job_id,
                            name,
                            attempts,
                            reason,
                        });
                    }
                }
            }
        }

        for id in graph.promote_ready()? {
            self.state.save_job(graph.job(id)?).await?;
        }
        Ok(())
    }

    fn validate_spec(&self, spec: &JobSpec) -> Result<()> {
        if spec.resources.fits_within(&self.capacity) {
            Ok(())
        } else {
            Err(EngineError::ResourceExceeded(format!(
                "job '{}' requested [{}] but worker capacity is [{}]",
                spec.name, spec.resources, self.capacity
            )))
        }
    }
}

/// One job attempt: scoped work dir in, outcome out. The work dir is removed
/// when the attempt ends, success or failure.
#[allow(clippy::too_many_arguments)]
async fn run_attempt(
    handler: Arc<dyn JobHandler>,
    store: Arc<ArtifactStore>,
    scratch_root: PathBuf,
    job_id: JobId,
    job_name: String,
    attempt: u32,
    params: serde_json::Value,
    inputs: Vec<ArtifactHandle>,
    cores: u32,
) -> Result<JobOutcome> {
    let work = ScopedWorkDir::create(&scratch_root, job_id, attempt)?;
    let mut ctx = JobContext {
        job_id,
        job_name,
        attempt,
        params,
        inputs,
        store,
        work_dir: work.path().to_path_buf(),
        cores,
    };
    let outcome = handler.run(&mut ctx).await;
    drop(work);
    outcome
}
