//! Plan validation: `dossier validate`.

use std::path::Path;

use anyhow::{Context, Result};

use dossier::dag::{PhaseKind, PhaseScope, resolve};
use dossier::plan::ExecutionPlan;

pub fn cmd_validate(plan_path: &Path) -> Result<()> {
    let plan = ExecutionPlan::load(plan_path)?;
    let graph = resolve(&plan)
        .with_context(|| format!("Plan {} is invalid", plan_path.display()))?;

    println!();
    println!(
        "Plan {} is valid: {} phase(s)",
        if plan.name.is_empty() { plan_path.display().to_string() } else { plan.name.clone() },
        graph.len()
    );
    println!();

    for (wave, ids) in graph.compute_waves().iter().enumerate() {
        println!("Wave {}:", wave);
        for id in ids {
            let Some(phase) = graph.phases().iter().find(|p| &p.id == id) else {
                continue;
            };
            let kind = match &phase.kind {
                PhaseKind::SingleOperation { key, .. } => format!("operation {}", key),
                PhaseKind::Chain { key, steps, .. } => {
                    format!("chain {} ({} steps)", key, steps.len())
                }
            };
            let scope = match &phase.scope {
                PhaseScope::Aggregated => "aggregated".to_string(),
                PhaseScope::PerItem { .. } => {
                    if phase.synthesize {
                        "per item + synthesis".to_string()
                    } else {
                        "per item".to_string()
                    }
                }
            };
            let deps = if phase.depends_on.is_empty() {
                String::new()
            } else {
                format!(
                    " after [{}]",
                    phase
                        .depends_on
                        .iter()
                        .map(|d| d.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            };
            let skip = if phase.skip { " (skipped)" } else { "" };
            println!("  {} {}: {}, {}{}{}", phase.id, phase.name, kind, scope, deps, skip);
        }
    }
    println!();
    Ok(())
}
