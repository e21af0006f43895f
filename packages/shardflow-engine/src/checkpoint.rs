//! Durable run state (SQLite-backed)
//!
//! Every job state transition is written through before the scheduler acts
//! on it, so an interrupted run can be reconstructed exactly: which jobs
//! exist, how they relate, how many attempts each has consumed, and which
//! outputs are already committed. Reads happen once, at resume.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::graph::{JobNode, JobRole};
use crate::job::{JobId, JobInput, JobSpec, JobState};
use crate::resources::Resources;
use shardflow_store::ArtifactHandle;

/// Overall status of the persisted run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Active,
    Complete,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Active => "active",
            RunStatus::Complete => "complete",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(RunStatus::Active),
            "complete" => Ok(RunStatus::Complete),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(EngineError::parse(format!("Invalid run status: {}", s))),
        }
    }
}

/// Run-level metadata row
#[derive(Debug, Clone)]
pub struct RunMeta {
    pub root_id: JobId,
    pub status: RunStatus,
    pub final_outputs: Option<Vec<ArtifactHandle>>,
}

/// Durable snapshot of the job graph's states and outputs.
pub struct RunStateStore {
    pool: SqlitePool,
}

impl RunStateStore {
    /// Open (or create) the state database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory state, for tests. Pinned to one connection so the database
    /// lives as long as the store.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                params TEXT NOT NULL,
                inputs TEXT NOT NULL,
                cores INTEGER NOT NULL,
                memory INTEGER NOT NULL,
                disk INTEGER NOT NULL,
                retries_allowed INTEGER NOT NULL,
                parent TEXT,
                role TEXT NOT NULL,
                seq INTEGER NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                error TEXT,
                outputs BLOB,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS run_meta (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                root_id TEXT NOT NULL,
                status TEXT NOT NULL,
                final_outputs BLOB
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist one job row: description, relations and current state.
    /// Called on insertion and after every state transition.
    pub async fn save_job(&self, node: &JobNode) -> Result<()> {
        // RUNNABLE is derived from dependencies, so it persists as pending.
        let (state, error, outputs): (&str, Option<&str>, Option<Vec<u8>>) = match &node.state {
            JobState::Pending | JobState::Runnable { .. } => ("pending", None, None),
            JobState::Running { .. } => ("running", None, None),
            JobState::Succeeded { outputs, .. } => (
                "succeeded",
                None,
                Some(bincode::serialize(outputs).map_err(EngineError::serialization)?),
            ),
            JobState::Failed { error, .. } => ("failed", Some(error.as_str()), None),
            JobState::PermanentlyFailed { error, .. } => {
                ("permanently_failed", Some(error.as_str()), None)
            }
        };

        sqlx::query(
            "INSERT OR REPLACE INTO jobs \
             (id, name, kind, params, inputs, cores, memory, disk, retries_allowed, \
              parent, role, seq, state, attempts, error, outputs, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        )
        .bind(node.id().to_string())
        .bind(&node.spec.name)
        .bind(&node.spec.kind)
        .bind(serde_json::to_string(&node.spec.params).map_err(EngineError::serialization)?)
        .bind(serde_json::to_string(&node.spec.inputs).map_err(EngineError::serialization)?)
        .bind(node.spec.resources.cores as i64)
        .bind(node.spec.resources.memory as i64)
        .bind(node.spec.resources.disk as i64)
        .bind(node.spec.retries_allowed as i64)
        .bind(node.parent.map(|p| p.to_string()))
        .bind(node.role.as_str())
        .bind(node.seq as i64)
        .bind(state)
        .bind(node.attempts as i64)
        .bind(error)
        .bind(outputs)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(job = %node.id(), state, attempts = node.attempts, "checkpointed job");
        Ok(())
    }

    /// Load every persisted job, ready for [`crate::graph::JobGraph::rebuild`].
    ///
    /// A row still marked RUNNING belonged to an attempt that was in flight
    /// when the previous process died; its effects are untrusted, so it
    /// loads as pending and will be re-dispatched once its dependencies are
    /// re-checked. Attempt counts survive, so retry budgets cannot be reset
    /// by crashing.
    pub async fn load_jobs(&self) -> Result<Vec<JobNode>> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        for row in rows {
            let id = parse_uuid(&row.try_get::<String, _>("id")?)?;
            let parent = row
                .try_get::<Option<String>, _>("parent")?
                .map(|s| parse_uuid(&s))
                .transpose()?;
            let role = JobRole::from_str(&row.try_get::<String, _>("role")?)?;
            let seq = row.try_get::<i64, _>("seq")? as u64;
            let updated_at = parse_timestamp(&row.try_get::<String, _>("updated_at")?)?;

            let spec = JobSpec {
                id,
                name: row.try_get::<String, _>("name")?,
                kind: row.try_get::<String, _>("kind")?,
                params: serde_json::from_str(&row.try_get::<String, _>("params")?)
                    .map_err(EngineError::serialization)?,
                inputs: serde_json::from_str::<Vec<JobInput>>(
                    &row.try_get::<String, _>("inputs")?,
                )
                .map_err(EngineError::serialization)?,
                resources: Resources::new(
                    row.try_get::<i64, _>("cores")? as u32,
                    row.try_get::<i64, _>("memory")? as u64,
                    row.try_get::<i64, _>("disk")? as u64,
                ),
                retries_allowed: row.try_get::<i64, _>("retries_allowed")? as u32,
            };

            let mut node = JobNode::new(spec, role, parent, seq);
            node.attempts = row.try_get::<i64, _>("attempts")? as u32;
            node.state = match row.try_get::<String, _>("state")?.as_str() {
                "pending" | "running" | "failed" => JobState::Pending,
                "succeeded" => {
                    let blob = row
                        .try_get::<Option<Vec<u8>>, _>("outputs")?
                        .unwrap_or_default();
                    let outputs: Vec<ArtifactHandle> = if blob.is_empty() {
                        Vec::new()
                    } else {
                        bincode::deserialize(&blob).map_err(EngineError::serialization)?
                    };
                    JobState::Succeeded {
                        completed_at: updated_at,
                        outputs,
                    }
                }
                "permanently_failed" => JobState::PermanentlyFailed {
                    failed_at: updated_at,
                    error: row
                        .try_get::<Option<String>, _>("error")?
                        .unwrap_or_default(),
                },
                other => {
                    return Err(EngineError::parse(format!(
                        "Invalid persisted job state: {}",
                        other
                    )))
                }
            };
            nodes.push(node);
        }
        Ok(nodes)
    }

    /// Record the root job and mark the run active.
    pub async fn set_root(&self, root: JobId) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO run_meta (id, root_id, status, final_outputs) \
             VALUES (0, ?1, 'active', NULL)",
        )
        .bind(root.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark the run complete with its final artifact handles.
    pub async fn mark_complete(&self, outputs: &[ArtifactHandle]) -> Result<()> {
        let blob = bincode::serialize(&outputs.to_vec()).map_err(EngineError::serialization)?;
        sqlx::query("UPDATE run_meta SET status = 'complete', final_outputs = ?1 WHERE id = 0")
            .bind(blob)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_failed(&self) -> Result<()> {
        sqlx::query("UPDATE run_meta SET status = 'failed' WHERE id = 0")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn run_meta(&self) -> Result<Option<RunMeta>> {
        let row = sqlx::query("SELECT root_id, status, final_outputs FROM run_meta WHERE id = 0")
            .fetch_optional(&self.pool)
            .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let final_outputs = row
                    .try_get::<Option<Vec<u8>>, _>("final_outputs")?
                    .map(|blob| bincode::deserialize(&blob).map_err(EngineError::serialization))
                    .transpose()?;
                Ok(Some(RunMeta {
                    root_id: parse_uuid(&row.try_get::<String, _>("root_id")?)?,
                    status: RunStatus::from_str(&row.try_get::<String, _>("status")?)?,
                    final_outputs,
                }))
            }
        }
    }

    /// Whether this state database has no recorded run at all.
    pub async fn is_fresh(&self) -> Result<bool> {
        Ok(self.run_meta().await?.is_none())
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(EngineError::serialization)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(EngineError::serialization)
}
