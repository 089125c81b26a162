//! Execution plan documents.
//!
//! This module provides:
//! - `ExecutionPlan`, the validated document produced by the external planner
//! - `PlanPhase`, one node of the plan before resolution
//! - `OperationDef` / `ChainDef`, the metadata snapshot the plan carries so a
//!   job can resume against exactly the plan that was approved
//! - JSON and YAML loading
//!
//! Plans are consumed, not generated, here. Structural validation (cycles,
//! unknown references) lives in [`crate::dag::DagBuilder`].

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::PlanError;

/// Numeric phase identifier. Fractional ids (e.g. `1.5`) express insertion
/// between integer phases.
///
/// Stored in canonical form: `1.0` and `"1"` both become `1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhaseId(String);

impl PhaseId {
    pub fn parse(raw: &str) -> Result<Self, PlanError> {
        let value: f64 = raw
            .trim()
            .parse()
            .map_err(|_| PlanError::InvalidPhaseId(raw.to_string()))?;
        Self::from_f64(value).ok_or_else(|| PlanError::InvalidPhaseId(raw.to_string()))
    }

    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        Some(Self(format!("{}", value)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value used for ordering.
    pub fn ordinal(&self) -> f64 {
        self.0.parse().unwrap_or(f64::MAX)
    }
}

impl std::fmt::Display for PhaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<f64> for PhaseId {
    /// Panics on negative or non-finite input; intended for literals.
    fn from(value: f64) -> Self {
        match Self::from_f64(value) {
            Some(id) => id,
            None => panic!("invalid phase id literal: {}", value),
        }
    }
}

impl Ord for PhaseId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordinal()
            .total_cmp(&other.ordinal())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for PhaseId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for PhaseId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.ordinal())
    }
}

impl<'de> Deserialize<'de> for PhaseId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => PhaseId::from_f64(n)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid phase id {}", n))),
            Raw::Text(s) => PhaseId::parse(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// Analytical depth of an operation. Determines how many passes run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Depth {
    Surface,
    #[default]
    Standard,
    Deep,
}

impl Depth {
    /// Number of passes to run given how many stances the operation declares.
    ///
    /// surface=1, standard=2, deep=every declared stance (3–4). Never more
    /// passes than declared stances, never fewer than one.
    pub fn pass_count(self, declared: usize) -> usize {
        let wanted = match self {
            Depth::Surface => 1,
            Depth::Standard => 2,
            Depth::Deep => 4,
        };
        wanted.min(declared.max(1))
    }
}

impl std::fmt::Display for Depth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Depth::Surface => write!(f, "surface"),
            Depth::Standard => write!(f, "standard"),
            Depth::Deep => write!(f, "deep"),
        }
    }
}

/// Whether a phase runs once, or once per item of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    #[default]
    Aggregated,
    PerItem,
}

/// Where a per-item phase gets its items from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemSource {
    /// Each input document of the job is one item.
    Documents,
    /// Items listed inline in the plan.
    List { items: Vec<ListItem> },
    /// Items extracted from an upstream phase's output.
    PhaseOutput { phase: PhaseId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListItem {
    /// Stable key; defaults to the item's position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub text: String,
}

/// Differential settings applied to a single item of a per-item phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<Depth>,
    /// Extra instruction text appended for this item only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// One phase as written in the plan document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPhase {
    pub id: PhaseId,
    #[serde(default)]
    pub name: String,
    /// Single operation key. Exactly one of `operation` / `chain` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<PhaseId>,
    #[serde(default)]
    pub scope: ScopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_source: Option<ItemSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<Depth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hint: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub item_overrides: BTreeMap<String, ItemOverride>,
    /// Character budget for assembled upstream context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_budget: Option<usize>,
    /// Item pool size for this phase; falls back to the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_concurrency: Option<usize>,
    /// Run one synthesis call over the successful item outputs.
    #[serde(default)]
    pub synthesize: bool,
    #[serde(default)]
    pub skip: bool,
}

impl PlanPhase {
    /// Aggregated phase backed by a single operation.
    pub fn operation(id: f64, operation: &str, depends_on: &[f64]) -> Self {
        Self {
            id: PhaseId::from(id),
            name: String::new(),
            operation: Some(operation.to_string()),
            chain: None,
            depends_on: depends_on.iter().map(|d| PhaseId::from(*d)).collect(),
            scope: ScopeKind::Aggregated,
            item_source: None,
            depth: None,
            model_hint: None,
            item_overrides: BTreeMap::new(),
            context_budget: None,
            item_concurrency: None,
            synthesize: false,
            skip: false,
        }
    }

    /// Aggregated phase backed by a chain.
    pub fn chain(id: f64, chain: &str, depends_on: &[f64]) -> Self {
        Self {
            operation: None,
            chain: Some(chain.to_string()),
            ..Self::operation(id, "", depends_on)
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn per_item(mut self, source: ItemSource) -> Self {
        self.scope = ScopeKind::PerItem;
        self.item_source = Some(source);
        self
    }

    pub fn with_depth(mut self, depth: Depth) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn with_item_concurrency(mut self, size: usize) -> Self {
        self.item_concurrency = Some(size);
        self
    }

    pub fn with_synthesis(mut self) -> Self {
        self.synthesize = true;
        self
    }

    pub fn skipped(mut self) -> Self {
        self.skip = true;
        self
    }

    /// Display name, falling back to the phase id.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("Phase {}", self.id)
        } else {
            self.name.clone()
        }
    }
}

/// Operation metadata: a named unit of analytical work.
///
/// `prompt` is the already-composed instruction text; the engine treats it
/// as opaque. `stances` lists the cognitive stance of each pass in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDef {
    #[serde(default)]
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub stances: Vec<String>,
    #[serde(default)]
    pub default_depth: Depth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl OperationDef {
    pub fn new(prompt: &str, stances: &[&str]) -> Self {
        Self {
            name: String::new(),
            prompt: prompt.to_string(),
            stances: stances.iter().map(|s| s.to_string()).collect(),
            default_depth: Depth::default(),
            model: None,
        }
    }

    /// Stances for the passes that run at `depth`. An operation without
    /// declared stances runs a single unstanced pass.
    pub fn stances_for(&self, depth: Depth) -> Vec<Option<String>> {
        if self.stances.is_empty() {
            return vec![None];
        }
        self.stances
            .iter()
            .take(depth.pass_count(self.stances.len()))
            .cloned()
            .map(Some)
            .collect()
    }
}

/// Chain metadata: operations run in order within one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDef {
    pub operations: Vec<String>,
    /// Thread each operation's output into the next one's input.
    #[serde(default = "default_pass_context")]
    pub pass_context: bool,
}

fn default_pass_context() -> bool {
    true
}

/// The full plan document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionPlan {
    #[serde(default)]
    pub name: String,
    pub phases: Vec<PlanPhase>,
    #[serde(default)]
    pub operations: BTreeMap<String, OperationDef>,
    #[serde(default)]
    pub chains: BTreeMap<String, ChainDef>,
}

impl ExecutionPlan {
    /// Load a plan from a `.json`, `.yaml` or `.yml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;

        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));

        if is_yaml {
            Self::from_yaml(&content)
                .with_context(|| format!("Failed to parse plan YAML: {}", path.display()))
        } else {
            Self::from_json(&content)
                .with_context(|| format!("Failed to parse plan JSON: {}", path.display()))
        }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Invalid plan JSON")
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Invalid plan YAML")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize plan")
    }

    /// SHA-256 of the serialized plan, hex encoded.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&json))
    }

    pub fn with_operation(mut self, key: &str, def: OperationDef) -> Self {
        self.operations.insert(key.to_string(), def);
        self
    }

    pub fn with_chain(mut self, key: &str, operations: &[&str], pass_context: bool) -> Self {
        self.chains.insert(
            key.to_string(),
            ChainDef {
                operations: operations.iter().map(|s| s.to_string()).collect(),
                pass_context,
            },
        );
        self
    }

    pub fn with_phase(mut self, phase: PlanPhase) -> Self {
        self.phases.push(phase);
        self
    }
}
