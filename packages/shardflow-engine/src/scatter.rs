//! Scatter-gather pipeline on top of the engine
//!
//! Three job kinds wire the standard shape together:
//!
//! - the **split job** partitions the run input into independent pieces and
//!   registers one map job per piece as children, plus one reduce job as its
//!   follow-on;
//! - each **map job** feeds its piece to the external tool and commits the
//!   tool's output as an artifact, independent of its siblings;
//! - the **reduce job** concatenates the map outputs, in piece order, into
//!   the single final artifact.
//!
//! [`ScatterGather`] is the front door: ingest an input file, run the graph
//! (fresh or resumed), export the final artifact, collect the store.

use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use shardflow_store::{ArtifactHandle, ArtifactStore};
use tracing::{debug, info};

use crate::checkpoint::RunStateStore;
use crate::config::{EngineConfig, RunOptions};
use crate::error::{EngineError, Result};
use crate::job::{
    HandlerRegistry, JobContext, JobHandler, JobInput, JobOutcome, JobSpec,
};
use crate::record::{HeaderDelimited, Partitioner};
use crate::resources::Resources;
use crate::scheduler::{RunResult, Scheduler};
use crate::table::TableSchema;
use crate::tool::ToolSpec;

pub const SPLIT_KIND: &str = "scatter.split";
pub const MAP_KIND: &str = "scatter.map";
pub const REDUCE_KIND: &str = "scatter.reduce";

/// Durable parameters of a split job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitParams {
    /// Number of pieces to partition into (pieces may come out empty when
    /// there are fewer records than pieces)
    pub pieces: usize,
    pub tool: ToolSpec,
    #[serde(default)]
    pub report_schema: Option<TableSchema>,
    pub map_resources: Resources,
    #[serde(default)]
    pub map_retries: u32,
    pub reduce_resources: Resources,
    #[serde(default)]
    pub reduce_retries: u32,
}

/// Durable parameters of a map job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapParams {
    pub tool: ToolSpec,
    #[serde(default)]
    pub report_schema: Option<TableSchema>,
}

/// Partitions the input and registers the map fan-out plus the reduce
/// follow-on. The split factor only exists once this job has run; the graph
/// grows here.
pub struct SplitJob {
    partitioner: Arc<dyn Partitioner>,
}

impl SplitJob {
    pub fn new(partitioner: Arc<dyn Partitioner>) -> Self {
        Self { partitioner }
    }
}

#[async_trait::async_trait]
impl JobHandler for SplitJob {
    fn kind(&self) -> &str {
        SPLIT_KIND
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<JobOutcome> {
        let params: SplitParams = ctx.parse_params()?;
        let input = ctx
            .inputs
            .first()
            .ok_or_else(|| EngineError::config("Split job needs exactly one input artifact"))?;

        let bytes = ctx.store.read_bytes(input).await?;
        let text = String::from_utf8(bytes)
            .map_err(|_| EngineError::JobFailed("Input is not valid UTF-8 text".to_string()))?;

        let records = self.partitioner.count_records(&text);
        let reduce = |inputs: Vec<JobInput>| {
            JobSpec::new("reduce", REDUCE_KIND)
                .inputs(inputs)
                .resources(params.reduce_resources)
                .retries(params.reduce_retries)
        };

        // Zero partitionable units: no map jobs, a reduce over an empty
        // input list, an empty final artifact. Not an error.
        if records == 0 {
            info!(job = %ctx.job_id, "input has no records; reduce will produce an empty artifact");
            return Ok(JobOutcome::empty().follow_on(reduce(Vec::new())));
        }

        let pieces = params.pieces.max(1);
        let piece_texts = self.partitioner.partition(&text, pieces)?;
        info!(
            job = %ctx.job_id,
            records,
            pieces = piece_texts.len(),
            "partitioned input"
        );

        let writes = piece_texts
            .iter()
            .map(|piece| ctx.store.write_bytes(piece.as_bytes()));
        let handles: Vec<ArtifactHandle> = join_all(writes)
            .await
            .into_iter()
            .collect::<std::result::Result<_, _>>()?;

        let map_params = MapParams {
            tool: params.tool.clone(),
            report_schema: params.report_schema.clone(),
        };

        let mut outcome = JobOutcome::with_outputs(handles.clone());
        let mut map_outputs = Vec::with_capacity(handles.len());
        for (i, handle) in handles.into_iter().enumerate() {
            let map = JobSpec::new(format!("map-{}", i), MAP_KIND)
                .params(&map_params)?
                .input(JobInput::Artifact(handle))
                .resources(params.map_resources)
                .retries(params.map_retries);
            map_outputs.push(JobInput::OutputOf(map.id));
            outcome = outcome.child(map);
        }

        Ok(outcome.follow_on(reduce(map_outputs)))
    }
}

/// Runs the external tool against one piece. Siblings are mutually
/// independent and run in any order.
pub struct MapJob;

#[async_trait::async_trait]
impl JobHandler for MapJob {
    fn kind(&self) -> &str {
        MAP_KIND
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<JobOutcome> {
        let params: MapParams = ctx.parse_params()?;
        let input = ctx
            .inputs
            .first()
            .ok_or_else(|| EngineError::config("Map job needs exactly one input artifact"))?;

        // A zero-record piece trivially succeeds with an empty output; the
        // tool is never invoked.
        if ctx.store.size_of(input)? == 0 {
            let empty = ctx.store.write_bytes(&[]).await?;
            debug!(job = %ctx.job_id, "empty piece, skipping tool");
            return Ok(JobOutcome::with_outputs(vec![empty]));
        }

        let local_in = ctx.work_dir.join("piece.in");
        let local_out = ctx.work_dir.join("piece.out");
        ctx.store.read(input, &local_in).await?;

        params
            .tool
            .run(&ctx.work_dir, &local_in, &local_out, ctx.cores)
            .await?;

        if !local_out.exists() {
            return Err(EngineError::ExternalTool {
                status: "exit code 0".to_string(),
                stderr: "tool produced no output file".to_string(),
            });
        }

        if let Some(schema) = &params.report_schema {
            let report = tokio::fs::read_to_string(&local_out).await?;
            let rows = schema.parse_report(&report)?;
            debug!(job = %ctx.job_id, rows = rows.len(), "validated tool report");
        }

        let output = ctx.store.write(&local_out).await?;
        Ok(JobOutcome::with_outputs(vec![output]))
    }
}

/// Streams the sibling map outputs, in piece order, into the final artifact.
/// Runnable only once every sibling has succeeded.
pub struct ReduceJob;

#[async_trait::async_trait]
impl JobHandler for ReduceJob {
    fn kind(&self) -> &str {
        REDUCE_KIND
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<JobOutcome> {
        let output = ctx.store.concatenate(&ctx.inputs).await?;
        info!(
            job = %ctx.job_id,
            inputs = ctx.inputs.len(),
            output = %output,
            "combined map outputs"
        );
        Ok(JobOutcome::with_outputs(vec![output]))
    }
}

/// Register the three scatter-gather handlers with the given split policy.
pub fn register_scatter_handlers(
    registry: &mut HandlerRegistry,
    partitioner: Arc<dyn Partitioner>,
) {
    registry.register(Arc::new(SplitJob::new(partitioner)));
    registry.register(Arc::new(MapJob));
    registry.register(Arc::new(ReduceJob));
}

/// A configured scatter-gather pipeline: one input file in, one output file
/// out, the expensive middle fanned out across the worker.
#[derive(Debug, Clone)]
pub struct ScatterGather {
    tool: ToolSpec,
    pieces: usize,
    split_resources: Resources,
    map_resources: Resources,
    map_retries: u32,
    reduce_resources: Resources,
    reduce_retries: u32,
    report_schema: Option<TableSchema>,
}

impl ScatterGather {
    pub fn new(tool: ToolSpec, pieces: usize) -> Self {
        Self {
            tool,
            pieces,
            split_resources: Resources::default(),
            map_resources: Resources::default(),
            map_retries: 1,
            reduce_resources: Resources::default(),
            reduce_retries: 1,
            report_schema: None,
        }
    }

    pub fn split_resources(mut self, resources: Resources) -> Self {
        self.split_resources = resources;
        self
    }

    pub fn map_resources(mut self, resources: Resources) -> Self {
        self.map_resources = resources;
        self
    }

    pub fn map_retries(mut self, retries: u32) -> Self {
        self.map_retries = retries;
        self
    }

    pub fn reduce_resources(mut self, resources: Resources) -> Self {
        self.reduce_resources = resources;
        self
    }

    pub fn reduce_retries(mut self, retries: u32) -> Self {
        self.reduce_retries = retries;
        self
    }

    pub fn report_schema(mut self, schema: TableSchema) -> Self {
        self.report_schema = Some(schema);
        self
    }

    /// The root split job for an already ingested input.
    pub fn root_spec(&self, input: ArtifactHandle) -> Result<JobSpec> {
        let params = SplitParams {
            pieces: self.pieces,
            tool: self.tool.clone(),
            report_schema: self.report_schema.clone(),
            map_resources: self.map_resources,
            map_retries: self.map_retries,
            reduce_resources: self.reduce_resources,
            reduce_retries: self.reduce_retries,
        };
        Ok(JobSpec::new("split", SPLIT_KIND)
            .params(&params)?
            .input(JobInput::Artifact(input))
            .resources(self.split_resources))
    }

    /// Run the pipeline end to end: ingest `input_path` (or resume the
    /// persisted run), execute the graph, export the final artifact to
    /// `output_path`, and garbage-collect the store unless kept.
    pub async fn execute(
        &self,
        config: &EngineConfig,
        options: RunOptions,
        input_path: &Path,
        output_path: &Path,
    ) -> Result<RunResult> {
        let store = Arc::new(ArtifactStore::open(&config.store_dir).await?);
        let state = Arc::new(RunStateStore::open(&config.state_path).await?);
        std::fs::create_dir_all(&config.scratch_root)?;

        let mut registry = HandlerRegistry::new();
        register_scatter_handlers(&mut registry, Arc::new(HeaderDelimited));

        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(registry),
            state,
            config.capacity,
            config.scratch_root.clone(),
        );

        let result = if options.resume {
            scheduler.resume().await?
        } else {
            let input = store.import_file(input_path).await?;
            scheduler.run(self.root_spec(input)?).await?
        };

        let final_handle = result
            .final_outputs
            .first()
            .ok_or_else(|| EngineError::config("Run completed without a final artifact"))?;
        store.export_file(final_handle, output_path).await?;

        if !options.keep_store {
            store.gc().await?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_params_serde_defaults() {
        let json = serde_json::json!({
            "pieces": 4,
            "tool": { "program": "masker", "args": ["{input}", "{output}"] },
            "map_resources": { "cores": 2, "memory": 0, "disk": 0 },
            "reduce_resources": { "cores": 1, "memory": 0, "disk": 0 },
        });
        let params: SplitParams = serde_json::from_value(json).unwrap();
        assert_eq!(params.pieces, 4);
        assert_eq!(params.map_retries, 0);
        assert_eq!(params.reduce_retries, 0);
        assert!(params.report_schema.is_none());
    }

    #[test]
    fn test_root_spec_shape() {
        let pipeline = ScatterGather::new(
            ToolSpec::new("masker", vec!["-pa", "{cores}", "{input}", "{output}"]),
            3,
        )
        .map_resources(Resources::new(2, 1 << 30, 0))
        .map_retries(2);

        let input: ArtifactHandle =
            "sha256:eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee/5"
                .parse()
                .unwrap();
        let spec = pipeline.root_spec(input.clone()).unwrap();

        assert_eq!(spec.kind, SPLIT_KIND);
        assert_eq!(spec.inputs, vec![JobInput::Artifact(input)]);

        let params: SplitParams = serde_json::from_value(spec.params).unwrap();
        assert_eq!(params.pieces, 3);
        assert_eq!(params.map_retries, 2);
        assert_eq!(params.map_resources.cores, 2);
    }

    #[test]
    fn test_handler_kinds_are_distinct() {
        let split = SplitJob::new(Arc::new(HeaderDelimited));
        assert_eq!(split.kind(), SPLIT_KIND);
        assert_eq!(MapJob.kind(), MAP_KIND);
        assert_eq!(ReduceJob.kind(), REDUCE_KIND);
    }
}
