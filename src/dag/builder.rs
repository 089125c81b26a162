//! Plan resolution: validates a plan document and builds its dependency graph.
//!
//! Resolution is pure. It classifies every phase once into a [`PhaseKind`]
//! and a [`PhaseScope`], so downstream components switch on explicit enums
//! instead of re-inspecting optional plan fields.

use crate::errors::{PlanError, ReferenceKind};
use crate::plan::{Depth, ExecutionPlan, ItemOverride, ItemSource, OperationDef, PhaseId, ScopeKind};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Index into the phase list.
pub type PhaseIndex = usize;

/// One operation inside a resolved chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainStep {
    pub key: String,
    pub operation: OperationDef,
}

/// What backs a phase.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseKind {
    SingleOperation {
        key: String,
        operation: OperationDef,
    },
    Chain {
        key: String,
        steps: Vec<ChainStep>,
        pass_context: bool,
    },
}

impl PhaseKind {
    pub fn key(&self) -> &str {
        match self {
            PhaseKind::SingleOperation { key, .. } | PhaseKind::Chain { key, .. } => key,
        }
    }

    pub fn is_chain(&self) -> bool {
        matches!(self, PhaseKind::Chain { .. })
    }
}

/// How many times a phase runs.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseScope {
    Aggregated,
    PerItem { source: ItemSource },
}

/// A plan phase after validation and classification.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPhase {
    pub id: PhaseId,
    pub name: String,
    pub kind: PhaseKind,
    pub scope: PhaseScope,
    /// Declared dependencies, in declaration order, without duplicates.
    pub depends_on: Vec<PhaseId>,
    pub depth: Option<Depth>,
    pub model_hint: Option<String>,
    pub item_overrides: BTreeMap<String, ItemOverride>,
    pub context_budget: Option<usize>,
    pub item_concurrency: Option<usize>,
    pub synthesize: bool,
    pub skip: bool,
}

impl ResolvedPhase {
    pub fn is_per_item(&self) -> bool {
        matches!(self.scope, PhaseScope::PerItem { .. })
    }
}

/// A directed acyclic graph of resolved phases.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Phases in plan declaration order
    phases: Vec<ResolvedPhase>,
    /// Map from phase id to index
    index_map: HashMap<PhaseId, PhaseIndex>,
    /// index -> phases that depend on it
    forward_edges: Vec<Vec<PhaseIndex>>,
    /// index -> phases it depends on, in declaration order
    reverse_edges: Vec<Vec<PhaseIndex>>,
}

impl DependencyGraph {
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn get_phase(&self, index: PhaseIndex) -> Option<&ResolvedPhase> {
        self.phases.get(index)
    }

    pub fn get_phase_by_id(&self, id: &PhaseId) -> Option<&ResolvedPhase> {
        self.index_map.get(id).and_then(|&i| self.phases.get(i))
    }

    pub fn get_index(&self, id: &PhaseId) -> Option<PhaseIndex> {
        self.index_map.get(id).copied()
    }

    pub fn phases(&self) -> &[ResolvedPhase] {
        &self.phases
    }

    /// Phases that depend on the given phase (forward edges).
    pub fn dependents(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Phases the given phase depends on (reverse edges).
    pub fn dependencies(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Every phase reachable through forward edges from `index`.
    pub fn transitive_dependents(&self, index: PhaseIndex) -> Vec<PhaseIndex> {
        let mut seen = HashSet::new();
        let mut stack: Vec<PhaseIndex> = self.dependents(index).to_vec();
        let mut out = Vec::new();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                out.push(next);
                stack.extend_from_slice(self.dependents(next));
            }
        }
        out.sort_unstable();
        out
    }

    /// Phases with no dependencies (entry points).
    pub fn root_phases(&self) -> Vec<PhaseIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Phases that no other phase depends on (exit points).
    pub fn leaf_phases(&self) -> Vec<PhaseIndex> {
        self.forward_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Check if every dependency of a phase is in `terminal`.
    pub fn dependencies_satisfied(&self, index: PhaseIndex, terminal: &HashSet<PhaseIndex>) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| terminal.contains(dep))
    }

    /// Groups of phase ids that could run together if every phase succeeded.
    ///
    /// Informational only; the runner launches from a live frontier rather
    /// than in lock-step waves.
    pub fn compute_waves(&self) -> Vec<Vec<PhaseId>> {
        let mut waves = Vec::new();
        let mut done: HashSet<PhaseIndex> = HashSet::new();

        loop {
            let ready: Vec<PhaseIndex> = (0..self.phases.len())
                .filter(|i| !done.contains(i) && self.dependencies_satisfied(*i, &done))
                .collect();

            if ready.is_empty() {
                break;
            }

            let mut ids: Vec<PhaseId> = ready.iter().map(|&i| self.phases[i].id.clone()).collect();
            ids.sort();
            done.extend(ready);
            waves.push(ids);
        }

        waves
    }
}

/// Builder that validates a plan and produces its [`DependencyGraph`].
pub struct DagBuilder<'a> {
    plan: &'a ExecutionPlan,
}

impl<'a> DagBuilder<'a> {
    pub fn new(plan: &'a ExecutionPlan) -> Self {
        Self { plan }
    }

    /// Build the graph.
    ///
    /// Validates that:
    /// - phase ids are unique
    /// - each phase names exactly one existing operation or chain
    /// - every dependency and item source references an existing phase
    /// - the dependency relation is acyclic
    pub fn build(self) -> Result<DependencyGraph, PlanError> {
        let mut index_map = HashMap::new();
        for (i, phase) in self.plan.phases.iter().enumerate() {
            if index_map.insert(phase.id.clone(), i).is_some() {
                return Err(PlanError::DuplicatePhase(phase.id.to_string()));
            }
        }

        let mut phases = Vec::with_capacity(self.plan.phases.len());
        let mut forward_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); self.plan.phases.len()];
        let mut reverse_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); self.plan.phases.len()];

        for (to_idx, phase) in self.plan.phases.iter().enumerate() {
            let mut depends_on = Vec::new();
            for dep in &phase.depends_on {
                let from_idx = *index_map.get(dep).ok_or_else(|| PlanError::UnknownReference {
                    phase: phase.id.to_string(),
                    kind: ReferenceKind::Phase,
                    reference: dep.to_string(),
                })?;

                if depends_on.contains(dep) {
                    continue;
                }
                depends_on.push(dep.clone());
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }

            let kind = self.classify_kind(phase)?;
            let scope = match phase.scope {
                ScopeKind::Aggregated => PhaseScope::Aggregated,
                ScopeKind::PerItem => {
                    let source = phase.item_source.clone().ok_or_else(|| {
                        PlanError::MissingItemSource {
                            phase: phase.id.to_string(),
                        }
                    })?;
                    if let ItemSource::PhaseOutput { phase: source_phase } = &source {
                        if !index_map.contains_key(source_phase) {
                            return Err(PlanError::UnknownReference {
                                phase: phase.id.to_string(),
                                kind: ReferenceKind::Phase,
                                reference: source_phase.to_string(),
                            });
                        }
                        if !depends_on.contains(source_phase) {
                            return Err(PlanError::ItemSourceNotDependency {
                                phase: phase.id.to_string(),
                                source_phase: source_phase.to_string(),
                            });
                        }
                    }
                    PhaseScope::PerItem { source }
                }
            };

            phases.push(ResolvedPhase {
                id: phase.id.clone(),
                name: phase.display_name(),
                kind,
                scope,
                depends_on,
                depth: phase.depth,
                model_hint: phase.model_hint.clone(),
                item_overrides: phase.item_overrides.clone(),
                context_budget: phase.context_budget,
                item_concurrency: phase.item_concurrency,
                synthesize: phase.synthesize,
                skip: phase.skip,
            });
        }

        let graph = DependencyGraph {
            phases,
            index_map,
            forward_edges,
            reverse_edges,
        };

        Self::validate_no_cycles(&graph)?;

        Ok(graph)
    }

    fn classify_kind(&self, phase: &crate::plan::PlanPhase) -> Result<PhaseKind, PlanError> {
        let operation = phase.operation.as_deref().filter(|s| !s.is_empty());
        let chain = phase.chain.as_deref().filter(|s| !s.is_empty());

        match (operation, chain) {
            (Some(key), None) => {
                let operation = self.lookup_operation(&phase.id, key)?;
                Ok(PhaseKind::SingleOperation {
                    key: key.to_string(),
                    operation,
                })
            }
            (None, Some(key)) => {
                let def = self
                    .plan
                    .chains
                    .get(key)
                    .ok_or_else(|| PlanError::UnknownReference {
                        phase: phase.id.to_string(),
                        kind: ReferenceKind::Chain,
                        reference: key.to_string(),
                    })?;
                if def.operations.is_empty() {
                    return Err(PlanError::EmptyChain {
                        chain: key.to_string(),
                    });
                }
                let steps = def
                    .operations
                    .iter()
                    .map(|op_key| {
                        Ok(ChainStep {
                            key: op_key.clone(),
                            operation: self.lookup_operation(&phase.id, op_key)?,
                        })
                    })
                    .collect::<Result<Vec<_>, PlanError>>()?;
                Ok(PhaseKind::Chain {
                    key: key.to_string(),
                    steps,
                    pass_context: def.pass_context,
                })
            }
            _ => Err(PlanError::InvalidPhaseKind {
                phase: phase.id.to_string(),
            }),
        }
    }

    fn lookup_operation(&self, phase: &PhaseId, key: &str) -> Result<OperationDef, PlanError> {
        self.plan
            .operations
            .get(key)
            .cloned()
            .ok_or_else(|| PlanError::UnknownReference {
                phase: phase.to_string(),
                kind: ReferenceKind::Operation,
                reference: key.to_string(),
            })
    }

    /// Validate that the graph has no cycles using Kahn's algorithm.
    fn validate_no_cycles(graph: &DependencyGraph) -> Result<(), PlanError> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<PhaseIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;

            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            let phases: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| graph.get_phase(i).map(|p| p.id.to_string()))
                .collect();

            return Err(PlanError::CyclicDependency { phases });
        }

        Ok(())
    }
}

/// Validate `plan` and build its dependency graph.
pub fn resolve(plan: &ExecutionPlan) -> Result<DependencyGraph, PlanError> {
    DagBuilder::new(plan).build()
}
