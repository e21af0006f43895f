//! Job descriptors, the per-job state machine, and the handler seam

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shardflow_store::{ArtifactHandle, ArtifactStore};
use uuid::Uuid;

use crate::error::{EngineError, ErrorCategory, Result};
use crate::resources::Resources;

pub type JobId = Uuid;

/// One input of a job: either a concrete artifact, or a promise for the
/// outputs of another job, resolved at dispatch time once that job has
/// succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum JobInput {
    Artifact(ArtifactHandle),
    OutputOf(JobId),
}

/// A pure, durable description of a unit of work.
///
/// The work itself is named by `kind` (a key into the [`HandlerRegistry`])
/// plus serde-JSON `params`, so a job can be rebuilt from its persisted row
/// on resume. The handler behind `kind` must be deterministic and safely
/// re-runnable: given the same inputs it produces equivalent outputs, and no
/// attempt may assume it is the only one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: JobId,
    pub name: String,
    pub kind: String,
    pub params: serde_json::Value,
    pub inputs: Vec<JobInput>,
    pub resources: Resources,
    pub retries_allowed: u32,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: kind.into(),
            params: serde_json::Value::Null,
            inputs: Vec::new(),
            resources: Resources::default(),
            retries_allowed: 0,
        }
    }

    pub fn params<T: Serialize>(mut self, params: &T) -> Result<Self> {
        self.params = serde_json::to_value(params).map_err(EngineError::serialization)?;
        Ok(self)
    }

    pub fn input(mut self, input: JobInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn inputs(mut self, inputs: impl IntoIterator<Item = JobInput>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn retries(mut self, retries_allowed: u32) -> Self {
        self.retries_allowed = retries_allowed;
        self
    }
}

/// Job state machine:
/// `Pending -> Runnable -> Running -> {Succeeded, Failed}`, with
/// `Failed -> Runnable` while retries remain, else `PermanentlyFailed`.
#[derive(Debug, Clone)]
pub enum JobState {
    /// Waiting on dependencies
    Pending,
    /// Dependencies satisfied, waiting for resource headroom
    Runnable { since: DateTime<Utc> },
    Running {
        started_at: DateTime<Utc>,
        attempt: u32,
    },
    Succeeded {
        completed_at: DateTime<Utc>,
        outputs: Vec<ArtifactHandle>,
    },
    Failed {
        failed_at: DateTime<Utc>,
        error: String,
        category: ErrorCategory,
        attempt: u32,
    },
    PermanentlyFailed {
        failed_at: DateTime<Utc>,
        error: String,
    },
}

impl JobState {
    pub fn state_name(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Runnable { .. } => "runnable",
            JobState::Running { .. } => "running",
            JobState::Succeeded { .. } => "succeeded",
            JobState::Failed { .. } => "failed",
            JobState::PermanentlyFailed { .. } => "permanently_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded { .. } | JobState::PermanentlyFailed { .. }
        )
    }
}

/// Everything a handler attempt gets to work with.
///
/// `work_dir` is an isolated per-attempt scratch directory, created before
/// the attempt starts and removed when it ends regardless of outcome; jobs
/// never touch the process working directory.
pub struct JobContext {
    pub job_id: JobId,
    pub job_name: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub params: serde_json::Value,
    /// Input handles with all `OutputOf` promises resolved, in declared order
    pub inputs: Vec<ArtifactHandle>,
    pub store: Arc<ArtifactStore>,
    pub work_dir: PathBuf,
    /// Cores granted by the scheduler, for tools with a parallelism flag
    pub cores: u32,
}

impl JobContext {
    pub fn parse_params<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(self.params.clone()).map_err(EngineError::serialization)
    }
}

/// What a finished job hands back to the engine: its outputs, plus any jobs
/// it spawned. Children become eligible immediately; follow-ons run only
/// after this job's entire child subtree has succeeded.
#[derive(Debug, Default)]
pub struct JobOutcome {
    pub outputs: Vec<ArtifactHandle>,
    pub children: Vec<JobSpec>,
    pub follow_ons: Vec<JobSpec>,
}

impl JobOutcome {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_outputs(outputs: Vec<ArtifactHandle>) -> Self {
        Self {
            outputs,
            ..Self::default()
        }
    }

    pub fn child(mut self, spec: JobSpec) -> Self {
        self.children.push(spec);
        self
    }

    pub fn follow_on(mut self, spec: JobSpec) -> Self {
        self.follow_ons.push(spec);
        self
    }
}

/// The unit-of-work seam (pluggable job kinds)
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Durable kind key this handler serves
    fn kind(&self) -> &str;

    /// Run one attempt. Must be safe to re-run: the engine retries failed
    /// attempts and redoes attempts that were in flight during a crash.
    async fn run(&self, ctx: &mut JobContext) -> Result<JobOutcome>;
}

/// Maps persisted handler kinds back to implementations on resume.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.kind().to_string(), handler);
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn JobHandler>> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| EngineError::UnknownHandler(kind.to_string()))
    }
}
