//! Dynamic job graph
//!
//! The graph is not known statically: a running job may append children and
//! follow-ons (the split factor only exists once the split job has read its
//! input). Expansion is a single atomic mutation applied by the scheduler's
//! event loop; nothing else writes the graph.
//!
//! Edges encode the execution order:
//! - parent -> child and parent -> follow-on (a spawned job never starts
//!   before its spawner has succeeded),
//! - producer -> consumer for every `OutputOf` input promise,
//! - subtree barriers: every job added under a parent as part of a child
//!   subtree must finish before each follow-on of that parent (and of every
//!   ancestor it sits under the same way), so a follow-on waits for the
//!   whole subtree including descendants spawned later at run time.

use std::collections::HashMap;

use chrono::Utc;
use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use shardflow_store::ArtifactHandle;
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, ErrorCategory, Result};
use crate::job::{JobId, JobInput, JobSpec, JobState};

/// How a job entered the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRole {
    Root,
    Child,
    FollowOn,
}

impl JobRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRole::Root => "root",
            JobRole::Child => "child",
            JobRole::FollowOn => "follow_on",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "root" => Ok(JobRole::Root),
            "child" => Ok(JobRole::Child),
            "follow_on" => Ok(JobRole::FollowOn),
            _ => Err(EngineError::parse(format!("Invalid job role: {}", s))),
        }
    }
}

/// A job plus its live scheduling state
#[derive(Debug)]
pub struct JobNode {
    pub spec: JobSpec,
    pub state: JobState,
    /// Failed attempts so far
    pub attempts: u32,
    /// Submission order, the FIFO tiebreaker
    pub seq: u64,
    pub parent: Option<JobId>,
    pub role: JobRole,
    pub children: Vec<JobId>,
    pub follow_ons: Vec<JobId>,
}

impl JobNode {
    pub fn new(spec: JobSpec, role: JobRole, parent: Option<JobId>, seq: u64) -> Self {
        Self {
            spec,
            state: JobState::Pending,
            attempts: 0,
            seq,
            parent,
            role,
            children: Vec::new(),
            follow_ons: Vec::new(),
        }
    }

    pub fn id(&self) -> JobId {
        self.spec.id
    }

    pub fn outputs(&self) -> Option<&[ArtifactHandle]> {
        match &self.state {
            JobState::Succeeded { outputs, .. } => Some(outputs),
            _ => None,
        }
    }

    /// Transition: PENDING -> RUNNABLE (dependencies satisfied)
    pub fn make_runnable(&mut self) -> Result<()> {
        match self.state {
            JobState::Pending => {
                self.state = JobState::Runnable { since: Utc::now() };
                Ok(())
            }
            _ => Err(self.invalid("runnable")),
        }
    }

    /// Transition: RUNNABLE -> RUNNING. Returns the 1-based attempt number.
    pub fn start(&mut self) -> Result<u32> {
        match self.state {
            JobState::Runnable { .. } => {
                let attempt = self.attempts + 1;
                self.state = JobState::Running {
                    started_at: Utc::now(),
                    attempt,
                };
                Ok(attempt)
            }
            _ => Err(self.invalid("running")),
        }
    }

    /// Transition: RUNNING -> SUCCEEDED
    pub fn succeed(&mut self, outputs: Vec<ArtifactHandle>) -> Result<()> {
        match self.state {
            JobState::Running { .. } => {
                self.state = JobState::Succeeded {
                    completed_at: Utc::now(),
                    outputs,
                };
                Ok(())
            }
            _ => Err(self.invalid("succeeded")),
        }
    }

    /// Transition: RUNNING -> FAILED, consuming one attempt
    pub fn fail(&mut self, error: String, category: ErrorCategory) -> Result<()> {
        match self.state {
            JobState::Running { .. } => {
                self.attempts += 1;
                self.state = JobState::Failed {
                    failed_at: Utc::now(),
                    error,
                    category,
                    attempt: self.attempts,
                };
                Ok(())
            }
            _ => Err(self.invalid("failed")),
        }
    }

    /// Transition: FAILED -> RUNNABLE (retry within budget)
    pub fn retry(&mut self) -> Result<()> {
        match self.state {
            JobState::Failed { .. } => {
                self.state = JobState::Runnable { since: Utc::now() };
                Ok(())
            }
            _ => Err(self.invalid("runnable (retry)")),
        }
    }

    /// Transition: FAILED -> PERMANENTLY_FAILED (budget exhausted or
    /// non-retryable)
    pub fn condemn(&mut self, error: String) -> Result<()> {
        match self.state {
            JobState::Failed { .. } => {
                self.state = JobState::PermanentlyFailed {
                    failed_at: Utc::now(),
                    error,
                };
                Ok(())
            }
            _ => Err(self.invalid("permanently_failed")),
        }
    }

    fn invalid(&self, to: &str) -> EngineError {
        EngineError::InvalidStateTransition {
            from: self.state.state_name().to_string(),
            to: to.to_string(),
        }
    }
}

/// Per-state job counts, for run narration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub pending: usize,
    pub runnable: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub permanently_failed: usize,
}

impl std::fmt::Display for StateCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pending={} runnable={} running={} succeeded={} failed={} permanently_failed={}",
            self.pending,
            self.runnable,
            self.running,
            self.succeeded,
            self.failed,
            self.permanently_failed
        )
    }
}

/// The set of all jobs plus their ordering edges, rooted at one top-level job.
#[derive(Debug, Default)]
pub struct JobGraph {
    nodes: HashMap<JobId, JobNode>,
    deps: DiGraphMap<JobId, ()>,
    root: Option<JobId>,
    next_seq: u64,
}

impl JobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> Option<JobId> {
        self.root
    }

    pub fn job(&self, id: JobId) -> Result<&JobNode> {
        self.nodes.get(&id).ok_or(EngineError::JobNotFound(id))
    }

    pub fn job_mut(&mut self, id: JobId) -> Result<&mut JobNode> {
        self.nodes.get_mut(&id).ok_or(EngineError::JobNotFound(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &JobNode> {
        self.nodes.values()
    }

    /// Seed the graph with the top-level job.
    pub fn add_root(&mut self, spec: JobSpec) -> Result<JobId> {
        if !self.is_empty() {
            return Err(EngineError::config("Graph already has a root job"));
        }
        let id = self.insert(spec, None, JobRole::Root)?;
        self.root = Some(id);
        self.wire_edges(id)?;
        Ok(id)
    }

    /// Atomically append the children and follow-ons a finished job emitted.
    ///
    /// All nodes are inserted first, then edges are wired, so subtree
    /// barriers see the complete sibling set. Returns the new job ids in
    /// insertion (FIFO) order.
    pub fn apply_outcome(
        &mut self,
        parent: JobId,
        children: Vec<JobSpec>,
        follow_ons: Vec<JobSpec>,
    ) -> Result<Vec<JobId>> {
        self.job(parent)?;

        let mut new_ids = Vec::with_capacity(children.len() + follow_ons.len());
        for spec in children {
            let id = self.insert(spec, Some(parent), JobRole::Child)?;
            self.job_mut(parent)?.children.push(id);
            new_ids.push(id);
        }
        for spec in follow_ons {
            let id = self.insert(spec, Some(parent), JobRole::FollowOn)?;
            self.job_mut(parent)?.follow_ons.push(id);
            new_ids.push(id);
        }

        for id in &new_ids {
            self.wire_edges(*id)?;
        }

        if is_cyclic_directed(&self.deps) {
            return Err(EngineError::CycleDetected(parent));
        }

        debug!(
            parent = %parent,
            added = new_ids.len(),
            total = self.len(),
            "graph expanded"
        );
        Ok(new_ids)
    }

    /// Promote every PENDING job whose dependencies are all SUCCEEDED.
    /// Returns the newly runnable ids.
    pub fn promote_ready(&mut self) -> Result<Vec<JobId>> {
        let mut ready = Vec::new();
        for node in self.nodes.values() {
            if !matches!(node.state, JobState::Pending) {
                continue;
            }
            let id = node.id();
            let satisfied = self
                .deps
                .neighbors_directed(id, Direction::Incoming)
                .all(|dep| {
                    self.nodes
                        .get(&dep)
                        .map_or(false, |n| matches!(n.state, JobState::Succeeded { .. }))
                });
            if satisfied {
                ready.push(id);
            }
        }

        ready.sort_by_key(|id| self.nodes[id].seq);
        for id in &ready {
            self.job_mut(*id)?.make_runnable()?;
        }
        Ok(ready)
    }

    /// RUNNABLE jobs in submission order, the scheduler's dispatch queue.
    pub fn runnable_fifo(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .nodes
            .values()
            .filter(|n| matches!(n.state, JobState::Runnable { .. }))
            .map(|n| n.id())
            .collect();
        ids.sort_by_key(|id| self.nodes[id].seq);
        ids
    }

    /// Resolve a job's declared inputs to concrete handles, in order.
    /// `OutputOf` promises require the producer to have succeeded.
    pub fn resolve_inputs(&self, id: JobId) -> Result<Vec<ArtifactHandle>> {
        let node = self.job(id)?;
        let mut handles = Vec::with_capacity(node.spec.inputs.len());
        for input in &node.spec.inputs {
            match input {
                JobInput::Artifact(handle) => handles.push(handle.clone()),
                JobInput::OutputOf(producer) => {
                    let outputs = self
                        .job(*producer)?
                        .outputs()
                        .ok_or(EngineError::UnresolvedInput {
                            consumer: id,
                            producer: *producer,
                        })?;
                    handles.extend(outputs.iter().cloned());
                }
            }
        }
        Ok(handles)
    }

    /// The job whose outputs are the run's result: follow the follow-on
    /// chain from the root, taking the most recently registered follow-on at
    /// each level.
    pub fn result_job(&self) -> Result<JobId> {
        let mut id = self
            .root
            .ok_or_else(|| EngineError::config("Graph has no root job"))?;
        while let Some(last) = self.job(id)?.follow_ons.last() {
            id = *last;
        }
        Ok(id)
    }

    pub fn all_terminal(&self) -> bool {
        self.nodes.values().all(|n| n.state.is_terminal())
    }

    pub fn is_complete(&self) -> bool {
        self.nodes
            .values()
            .all(|n| matches!(n.state, JobState::Succeeded { .. }))
    }

    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for node in self.nodes.values() {
            match node.state {
                JobState::Pending => counts.pending += 1,
                JobState::Runnable { .. } => counts.runnable += 1,
                JobState::Running { .. } => counts.running += 1,
                JobState::Succeeded { .. } => counts.succeeded += 1,
                JobState::Failed { .. } => counts.failed += 1,
                JobState::PermanentlyFailed { .. } => counts.permanently_failed += 1,
            }
        }
        counts
    }

    /// Reconstruct a graph from persisted nodes (children/follow-on lists
    /// are rebuilt from parent pointers; pass them empty).
    pub fn rebuild(mut persisted: Vec<JobNode>) -> Result<Self> {
        persisted.sort_by_key(|n| n.seq);

        let mut graph = Self::new();
        for node in persisted {
            let id = node.id();
            if graph.nodes.contains_key(&id) {
                return Err(EngineError::config(format!("Duplicate job id {}", id)));
            }
            if node.role == JobRole::Root {
                if graph.root.is_some() {
                    return Err(EngineError::config("Multiple root jobs in run state"));
                }
                graph.root = Some(id);
            }
            graph.next_seq = graph.next_seq.max(node.seq + 1);
            graph.deps.add_node(id);
            if let Some(parent) = node.parent {
                let parent_node = graph
                    .nodes
                    .get_mut(&parent)
                    .ok_or(EngineError::JobNotFound(parent))?;
                match node.role {
                    JobRole::Child => parent_node.children.push(id),
                    JobRole::FollowOn => parent_node.follow_ons.push(id),
                    JobRole::Root => {
                        return Err(EngineError::config("Root job cannot have a parent"))
                    }
                }
            }
            graph.nodes.insert(id, node);
        }

        let mut ids: Vec<JobId> = graph.nodes.keys().copied().collect();
        ids.sort_by_key(|id| graph.nodes[id].seq);
        for id in ids {
            graph.wire_edges(id)?;
        }

        if is_cyclic_directed(&graph.deps) {
            return Err(EngineError::CycleDetected(
                graph.root.unwrap_or_else(Uuid::nil),
            ));
        }
        Ok(graph)
    }

    fn insert(&mut self, spec: JobSpec, parent: Option<JobId>, role: JobRole) -> Result<JobId> {
        let id = spec.id;
        if self.nodes.contains_key(&id) {
            return Err(EngineError::config(format!("Duplicate job id {}", id)));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.deps.add_node(id);
        self.nodes.insert(id, JobNode::new(spec, role, parent, seq));
        Ok(id)
    }

    fn wire_edges(&mut self, id: JobId) -> Result<()> {
        let (parent, inputs) = {
            let node = self.job(id)?;
            (node.parent, node.spec.inputs.clone())
        };

        if let Some(parent) = parent {
            self.deps.add_edge(parent, id, ());
        }

        for input in inputs {
            if let JobInput::OutputOf(producer) = input {
                if !self.nodes.contains_key(&producer) {
                    return Err(EngineError::JobNotFound(producer));
                }
                if producer != id {
                    self.deps.add_edge(producer, id, ());
                }
            }
        }

        // Subtree barriers: walking up the spawn tree, this job precedes the
        // follow-ons of every ancestor it is under via a child step.
        let mut cur = id;
        while let Some(parent) = self.job(cur)?.parent {
            if self.job(cur)?.role == JobRole::Child {
                let barriers = self.job(parent)?.follow_ons.clone();
                for follow_on in barriers {
                    if follow_on != id {
                        self.deps.add_edge(id, follow_on, ());
                    }
                }
            }
            cur = parent;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;

    fn spec(name: &str) -> JobSpec {
        JobSpec::new(name, "test.nop")
    }

    fn succeed(graph: &mut JobGraph, id: JobId) {
        let node = graph.job_mut(id).unwrap();
        node.make_runnable().ok();
        node.start().unwrap();
        node.succeed(vec![]).unwrap();
    }

    #[test]
    fn test_root_then_expansion_readiness() {
        let mut graph = JobGraph::new();
        let root = graph.add_root(spec("split")).unwrap();

        // Root has no dependencies
        assert_eq!(graph.promote_ready().unwrap(), vec![root]);
        graph.job_mut(root).unwrap().start().unwrap();
        graph.job_mut(root).unwrap().succeed(vec![]).unwrap();

        let map_a = spec("map-0");
        let map_b = spec("map-1");
        let reduce = spec("reduce")
            .input(crate::job::JobInput::OutputOf(map_a.id))
            .input(crate::job::JobInput::OutputOf(map_b.id));
        let (a, b, r) = (map_a.id, map_b.id, reduce.id);

        graph
            .apply_outcome(root, vec![map_a, map_b], vec![reduce])
            .unwrap();

        // Maps become runnable, the follow-on does not
        let ready = graph.promote_ready().unwrap();
        assert_eq!(ready, vec![a, b]);
        assert!(matches!(graph.job(r).unwrap().state, JobState::Pending));

        // One sibling done is not enough
        graph.job_mut(a).unwrap().start().unwrap();
        graph.job_mut(a).unwrap().succeed(vec![]).unwrap();
        assert!(graph.promote_ready().unwrap().is_empty());

        graph.job_mut(b).unwrap().start().unwrap();
        graph.job_mut(b).unwrap().succeed(vec![]).unwrap();
        assert_eq!(graph.promote_ready().unwrap(), vec![r]);
    }

    #[test]
    fn test_follow_on_waits_for_descendants_spawned_later() {
        let mut graph = JobGraph::new();
        let root = graph.add_root(spec("root")).unwrap();
        succeed(&mut graph, root);

        let child = spec("child");
        let follow = spec("follow");
        let (c, f) = (child.id, follow.id);
        graph.apply_outcome(root, vec![child], vec![follow]).unwrap();

        assert_eq!(graph.promote_ready().unwrap(), vec![c]);
        succeed(&mut graph, c);

        // The child spawned a grandchild before finishing; the follow-on
        // must now also wait for it.
        let grandchild = spec("grandchild");
        let g = grandchild.id;
        graph.apply_outcome(c, vec![grandchild], vec![]).unwrap();

        assert_eq!(graph.promote_ready().unwrap(), vec![g]);
        assert!(matches!(graph.job(f).unwrap().state, JobState::Pending));

        succeed(&mut graph, g);
        assert_eq!(graph.promote_ready().unwrap(), vec![f]);
    }

    #[test]
    fn test_sibling_follow_ons_run_in_parallel() {
        let mut graph = JobGraph::new();
        let root = graph.add_root(spec("root")).unwrap();
        succeed(&mut graph, root);

        let f1 = spec("follow-1");
        let f2 = spec("follow-2");
        let (a, b) = (f1.id, f2.id);
        graph.apply_outcome(root, vec![], vec![f1, f2]).unwrap();

        // Neither blocks the other
        assert_eq!(graph.promote_ready().unwrap(), vec![a, b]);
    }

    #[test]
    fn test_resolve_inputs_preserves_order() {
        let mut graph = JobGraph::new();
        let root = graph.add_root(spec("root")).unwrap();
        succeed(&mut graph, root);

        let m0 = spec("map-0");
        let m1 = spec("map-1");
        let reduce = spec("reduce")
            .input(JobInput::OutputOf(m0.id))
            .input(JobInput::OutputOf(m1.id));
        let (a, b, r) = (m0.id, m1.id, reduce.id);
        graph.apply_outcome(root, vec![m0, m1], vec![reduce]).unwrap();
        graph.promote_ready().unwrap();

        let h0: ArtifactHandle =
            "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa/1"
                .parse()
                .unwrap();
        let h1: ArtifactHandle =
            "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb/2"
                .parse()
                .unwrap();

        // Finish out of order; resolution still follows declared order
        graph.job_mut(b).unwrap().start().unwrap();
        graph.job_mut(b).unwrap().succeed(vec![h1.clone()]).unwrap();
        graph.job_mut(a).unwrap().start().unwrap();
        graph.job_mut(a).unwrap().succeed(vec![h0.clone()]).unwrap();

        assert_eq!(graph.resolve_inputs(r).unwrap(), vec![h0, h1]);
    }

    #[test]
    fn test_resolve_inputs_unfinished_producer_fails() {
        let mut graph = JobGraph::new();
        let root = graph.add_root(spec("root")).unwrap();
        succeed(&mut graph, root);

        let m = spec("map-0");
        let reduce = spec("reduce").input(JobInput::OutputOf(m.id));
        let r = reduce.id;
        graph.apply_outcome(root, vec![m], vec![reduce]).unwrap();

        let err = graph.resolve_inputs(r).unwrap_err();
        assert!(matches!(err, EngineError::UnresolvedInput { .. }));
    }

    #[test]
    fn test_result_job_follows_follow_on_chain() {
        let mut graph = JobGraph::new();
        let root = graph.add_root(spec("root")).unwrap();
        assert_eq!(graph.result_job().unwrap(), root);

        succeed(&mut graph, root);
        let reduce = spec("reduce");
        let r = reduce.id;
        graph.apply_outcome(root, vec![], vec![reduce]).unwrap();
        assert_eq!(graph.result_job().unwrap(), r);
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let mut graph = JobGraph::new();
        let root = graph.add_root(spec("root")).unwrap();

        // Pending cannot start directly
        let err = graph.job_mut(root).unwrap().start().unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));

        graph.job_mut(root).unwrap().make_runnable().unwrap();
        graph.job_mut(root).unwrap().start().unwrap();

        // Running cannot be retried
        let err = graph.job_mut(root).unwrap().retry().unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_fail_consumes_attempt() {
        let mut graph = JobGraph::new();
        let root = graph.add_root(spec("root")).unwrap();
        graph.job_mut(root).unwrap().make_runnable().unwrap();

        assert_eq!(graph.job_mut(root).unwrap().start().unwrap(), 1);
        graph
            .job_mut(root)
            .unwrap()
            .fail("flaky".to_string(), ErrorCategory::Transient)
            .unwrap();
        assert_eq!(graph.job(root).unwrap().attempts, 1);

        graph.job_mut(root).unwrap().retry().unwrap();
        assert_eq!(graph.job_mut(root).unwrap().start().unwrap(), 2);
    }

    #[test]
    fn test_rebuild_detects_cycle_from_corrupt_state() {
        // A root whose input promises the output of its own child: the
        // persisted state is structurally broken and must be rejected.
        let child_spec = spec("child");
        let child_id = child_spec.id;
        let mut root_spec = spec("root");
        root_spec.inputs.push(JobInput::OutputOf(child_id));
        let root_id = root_spec.id;

        let nodes = vec![
            JobNode::new(root_spec, JobRole::Root, None, 0),
            JobNode::new(child_spec, JobRole::Child, Some(root_id), 1),
        ];

        let err = JobGraph::rebuild(nodes).unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected(_)));
    }

    #[test]
    fn test_rebuild_restores_structure() {
        let mut graph = JobGraph::new();
        let root = graph.add_root(spec("root")).unwrap();
        succeed(&mut graph, root);

        let m = spec("map-0");
        let reduce = spec("reduce").input(JobInput::OutputOf(m.id));
        let (m_id, r_id) = (m.id, reduce.id);
        graph.apply_outcome(root, vec![m], vec![reduce]).unwrap();

        // Simulate persistence: carry over spec/role/parent/seq, drop edges
        let persisted: Vec<JobNode> = graph
            .nodes()
            .map(|n| JobNode::new(n.spec.clone(), n.role, n.parent, n.seq))
            .collect();

        let rebuilt = JobGraph::rebuild(persisted).unwrap();
        assert_eq!(rebuilt.root(), Some(root));
        assert_eq!(rebuilt.job(root).unwrap().children, vec![m_id]);
        assert_eq!(rebuilt.job(root).unwrap().follow_ons, vec![r_id]);
        assert_eq!(rebuilt.result_job().unwrap(), r_id);
    }

    #[test]
    fn test_counts() {
        let mut graph = JobGraph::new();
        let root = graph.add_root(spec("root")).unwrap();
        graph.promote_ready().unwrap();

        let counts = graph.counts();
        assert_eq!(counts.runnable, 1);
        assert_eq!(counts.succeeded, 0);

        succeed(&mut graph, root);
        assert_eq!(graph.counts().succeeded, 1);
        assert!(graph.all_terminal());
        assert!(graph.is_complete());
    }
}
