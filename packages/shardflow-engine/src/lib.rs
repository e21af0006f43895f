/*
 * Shardflow Engine - Scatter-Gather Job Pipeline
 *
 * A large input is partitioned into independent units, each unit is
 * processed by an expensive external computation, and the partial results
 * are deterministically reassembled into one output.
 *
 * Architecture:
 * - Dynamic Job Graph (children and follow-ons registered at run time)
 * - Resource-Aware Scheduler (single-writer event loop, FIFO + backfill)
 * - Checkpoint/Resume System (SQLite, every transition written through)
 * - Pluggable Job Handlers (split / map / reduce, plus custom kinds)
 * - External Tool Boundary (scoped work dirs, typed report parsing)
 */

// Public modules
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod graph;
pub mod job;
pub mod record;
pub mod resources;
pub mod scatter;
pub mod scheduler;
pub mod table;
pub mod tool;
pub mod workdir;

// Re-exports
pub use checkpoint::{RunMeta, RunStateStore, RunStatus};
pub use config::{init_tracing, EngineConfig, RunOptions};
pub use error::{EngineError, ErrorCategory, Result};
pub use graph::{JobGraph, JobNode, JobRole, StateCounts};
pub use job::{
    HandlerRegistry, JobContext, JobHandler, JobId, JobInput, JobOutcome, JobSpec, JobState,
};
pub use record::{HeaderDelimited, Partitioner};
pub use resources::{default_capacity, parse_memory, ResourceLedger, Resources};
pub use scatter::{
    register_scatter_handlers, MapJob, ReduceJob, ScatterGather, SplitJob, MAP_KIND, REDUCE_KIND,
    SPLIT_KIND,
};
pub use scheduler::{RunResult, Scheduler};
pub use table::{ColumnType, FieldValue, TableRow, TableSchema};
pub use tool::ToolSpec;
pub use workdir::ScopedWorkDir;
