//! Phase status tracking for the workflow runner.
//!
//! The scheduler owns the status of every phase and answers one question for
//! the runner: which phases may launch now. A phase is launchable once each
//! of its dependencies has reached a state that satisfies dependents
//! (`completed`, `completed_with_errors` or `skipped`). A failed phase blocks
//! its transitive dependents; independent branches are unaffected.

use crate::dag::builder::{DependencyGraph, PhaseIndex};
use crate::dag::state::DagState;
use crate::plan::PhaseId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Configuration for the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagConfig {
    /// Maximum phases in flight job-wide
    pub max_parallel: usize,
    /// Stop launching new phases after the first failure
    pub fail_fast: bool,
}

impl Default for DagConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            fail_fast: false,
        }
    }
}

impl DagConfig {
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

/// Status of a phase within one job run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Waiting on dependencies or a free slot
    #[default]
    Pending,
    Running { started_at_ms: u64 },
    Completed,
    /// Per-item phase where some, but not all, items failed
    CompletedWithErrors { failed_items: usize },
    Failed { error: String },
    /// A dependency failed; this phase never launches
    Blocked { by: String },
    /// Skipped by the plan's `skip` flag
    Skipped,
    /// Never launched because the job was cancelled
    Cancelled,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running { .. })
    }

    /// Whether dependents may launch after this status.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithErrors { .. } | Self::Skipped
        )
    }

    /// Whether this status makes the job fail.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Blocked { .. })
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Short label used in storage and status reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running { .. } => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors { .. } => "completed_with_errors",
            Self::Failed { .. } => "failed",
            Self::Blocked { .. } => "blocked",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A phase with its current status.
#[derive(Debug, Clone)]
pub struct PhaseNode {
    pub id: PhaseId,
    pub status: PhaseStatus,
    pub index: PhaseIndex,
}

/// Tracks phase statuses over a dependency graph.
#[derive(Debug)]
pub struct DagScheduler {
    graph: DependencyGraph,
    nodes: Vec<PhaseNode>,
    config: DagConfig,
    /// Phases whose status satisfies dependents
    satisfied: HashSet<PhaseIndex>,
    /// Set once a fail-fast failure stops new launches
    halted: bool,
}

impl DagScheduler {
    pub fn new(graph: DependencyGraph, config: DagConfig) -> Self {
        let nodes = graph
            .phases()
            .iter()
            .enumerate()
            .map(|(index, p)| PhaseNode {
                id: p.id.clone(),
                status: PhaseStatus::Pending,
                index,
            })
            .collect();

        Self {
            graph,
            nodes,
            config,
            satisfied: HashSet::new(),
            halted: false,
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn phase_count(&self) -> usize {
        self.graph.len()
    }

    pub fn config(&self) -> &DagConfig {
        &self.config
    }

    pub fn nodes(&self) -> &[PhaseNode] {
        &self.nodes
    }

    pub fn get_node(&self, id: &PhaseId) -> Option<&PhaseNode> {
        self.graph.get_index(id).and_then(|i| self.nodes.get(i))
    }

    pub fn status(&self, index: PhaseIndex) -> Option<&PhaseStatus> {
        self.nodes.get(index).map(|n| &n.status)
    }

    /// Pending phases whose dependencies all satisfy dependents, in plan order.
    pub fn ready_phases(&self) -> Vec<PhaseIndex> {
        if self.halted {
            return Vec::new();
        }
        self.nodes
            .iter()
            .filter(|node| matches!(node.status, PhaseStatus::Pending))
            .filter(|node| self.graph.dependencies_satisfied(node.index, &self.satisfied))
            .map(|node| node.index)
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.status.is_running()).count()
    }

    pub fn mark_running(&mut self, index: PhaseIndex) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.status = PhaseStatus::Running {
                started_at_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
            };
        }
    }

    /// Record a terminal status for a phase and propagate its consequences.
    ///
    /// Returns the indices of phases newly blocked as a result.
    pub fn mark_finished(&mut self, index: PhaseIndex, status: PhaseStatus) -> Vec<PhaseIndex> {
        let Some(node) = self.nodes.get_mut(index) else {
            return Vec::new();
        };
        node.status = status.clone();

        if status.satisfies_dependents() {
            self.satisfied.insert(index);
            return Vec::new();
        }

        if matches!(status, PhaseStatus::Failed { .. }) {
            let by = self.nodes[index].id.to_string();
            let mut blocked = self.block_dependents(index, &by);
            if self.config.fail_fast {
                self.halted = true;
                blocked.extend(self.block_all_pending(&by));
            }
            return blocked;
        }

        Vec::new()
    }

    /// Block every transitive dependent of a failed phase.
    fn block_dependents(&mut self, failed: PhaseIndex, by: &str) -> Vec<PhaseIndex> {
        let mut blocked = Vec::new();
        for dep_idx in self.graph.transitive_dependents(failed) {
            if let Some(node) = self.nodes.get_mut(dep_idx)
                && !node.status.is_terminal()
                && !node.status.is_running()
            {
                node.status = PhaseStatus::Blocked { by: by.to_string() };
                blocked.push(dep_idx);
            }
        }
        blocked
    }

    fn block_all_pending(&mut self, by: &str) -> Vec<PhaseIndex> {
        let mut blocked = Vec::new();
        for node in self.nodes.iter_mut() {
            if matches!(node.status, PhaseStatus::Pending) {
                node.status = PhaseStatus::Blocked { by: by.to_string() };
                blocked.push(node.index);
            }
        }
        blocked
    }

    /// Mark every pending phase as cancelled. Running phases are left to finish.
    pub fn cancel_pending(&mut self) -> Vec<PhaseIndex> {
        let mut cancelled = Vec::new();
        for node in self.nodes.iter_mut() {
            if matches!(node.status, PhaseStatus::Pending) {
                node.status = PhaseStatus::Cancelled;
                cancelled.push(node.index);
            }
        }
        cancelled
    }

    pub fn all_terminal(&self) -> bool {
        self.nodes.iter().all(|n| n.status.is_terminal())
    }

    pub fn has_failures(&self) -> bool {
        self.nodes.iter().any(|n| n.status.is_failure())
    }

    /// Job-level state implied by the phase statuses.
    pub fn final_state(&self, cancelled: bool) -> DagState {
        if cancelled && self.nodes.iter().any(|n| n.status == PhaseStatus::Cancelled) {
            DagState::Cancelled
        } else if self.has_failures() {
            DagState::Failed
        } else if self.all_terminal() {
            DagState::Completed
        } else {
            DagState::Running
        }
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.nodes.is_empty() {
            return 100.0;
        }
        let terminal = self.nodes.iter().filter(|n| n.status.is_terminal()).count();
        (terminal as f64 / self.nodes.len() as f64) * 100.0
    }
}
