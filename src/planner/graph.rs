//! Structural validation of a plan's task graph. A plan that fails here is
//! never adopted.

use anyhow::{Result, bail};
use conductor_common::{Plan, TaskId, TaskSpec};
use std::collections::HashMap;

/// Check that `plan` is a well-formed task graph:
/// - phase and task ids are unique
/// - every input names a planned task in the same or an earlier phase
/// - the input schema matches what that task declares
/// - there are no cycles
///
/// Edges run from the producer of an input to the task consuming it.
pub fn validate(plan: &Plan) -> Result<()> {
    if plan.phases.is_empty() {
        bail!("Plan has no phases");
    }

    let mut tasks: Vec<&TaskSpec> = Vec::new();
    let mut phase_of = Vec::new();
    let mut index_map: HashMap<&TaskId, usize> = HashMap::new();
    let mut seen_phases = Vec::new();
    for (p, phase) in plan.phases.iter().enumerate() {
        if seen_phases.contains(&&phase.id) {
            bail!("Duplicate phase id: {}", phase.id);
        }
        seen_phases.push(&phase.id);
        for task in &phase.tasks {
            if task.phase != phase.id {
                bail!(
                    "Task '{}' declares phase '{}' but is listed under '{}'",
                    task.id,
                    task.phase,
                    phase.id
                );
            }
            if index_map.insert(&task.id, tasks.len()).is_some() {
                bail!("Duplicate task id: {}", task.id);
            }
            tasks.push(task);
            phase_of.push(p);
        }
    }

    // index -> tasks consuming its output
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
    let mut in_degree: Vec<usize> = vec![0; tasks.len()];

    for (to_idx, task) in tasks.iter().enumerate() {
        for input in &task.inputs {
            let from_idx = *index_map.get(&input.task).ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown dependency '{}' in task '{}': no task with that id is planned",
                    input.task,
                    task.id
                )
            })?;
            let producer = tasks[from_idx];
            if phase_of[from_idx] > phase_of[to_idx] {
                bail!(
                    "Task '{}' depends on '{}' from a later phase",
                    task.id,
                    producer.id
                );
            }
            if producer.output != input.schema {
                bail!(
                    "Schema mismatch: '{}' expects {} from '{}', which produces {}",
                    task.id,
                    input.schema,
                    producer.id,
                    producer.output
                );
            }
            dependents[from_idx].push(to_idx);
            in_degree[to_idx] += 1;
        }
        if let Some(base) = &task.revision_of
            && !index_map.contains_key(base)
        {
            bail!("Task '{}' revises unknown task '{}'", task.id, base);
        }
    }

    // Kahn's algorithm; any node left with in-degree > 0 sits on a cycle
    let mut queue: Vec<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(i, _)| i)
        .collect();
    let mut processed = 0;
    while let Some(node) = queue.pop() {
        processed += 1;
        for &dependent in &dependents[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push(dependent);
            }
        }
    }

    if processed != tasks.len() {
        let cycle_tasks: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg > 0)
            .map(|(i, _)| tasks[i].id.as_str())
            .collect();
        bail!(
            "Cycle detected in task dependencies. Involved tasks: {:?}",
            cycle_tasks
        );
    }
    Ok(())
}
