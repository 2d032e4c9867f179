//! Step-graph validation — run this before registering or executing a
//! workflow.
//!
//! Rules enforced:
//! 1. Step ids must be unique within the workflow.
//! 2. Every declared dependency must reference an existing step id.
//! 3. The dependency graph must be acyclic (topological sort must succeed).
//!
//! Returns a topologically-sorted list of step ids on success.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::{models::Workflow, EngineError};

/// Validate the workflow's step graph and return ids in a valid execution
/// order. Steps appear after all of their dependencies; independent steps
/// keep their definition order.
///
/// # Errors
/// - [`EngineError::DuplicateStepId`] if two steps share an id.
/// - [`EngineError::UnknownDependency`] if a dependency names a missing step.
/// - [`EngineError::CyclicDependency`] if the graph is not acyclic.
pub fn validate_dag(workflow: &Workflow) -> Result<Vec<String>, EngineError> {
    // -----------------------------------------------------------------------
    // 1. Ensure step ids are unique
    // -----------------------------------------------------------------------
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        if !seen_ids.insert(step.id.as_str()) {
            return Err(EngineError::DuplicateStepId(step.id.clone()));
        }
    }

    let step_set: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();

    // -----------------------------------------------------------------------
    // 2. Validate dependency references
    // -----------------------------------------------------------------------
    for step in &workflow.steps {
        for dep in &step.depends_on {
            if !step_set.contains(dep.as_str()) {
                return Err(EngineError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // 3. Topological sort (Kahn's algorithm)
    // -----------------------------------------------------------------------
    // dependents: dep id -> steps that declare it.
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();

    for step in &workflow.steps {
        in_degree.insert(step.id.as_str(), step.depends_on.len());
        for dep in &step.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.id.as_str());
        }
    }

    // Seed with dependency-free steps, in definition order for determinism.
    let mut queue: VecDeque<&str> = workflow
        .steps
        .iter()
        .filter(|s| s.depends_on.is_empty())
        .map(|s| s.id.as_str())
        .collect();

    let mut sorted: Vec<String> = Vec::with_capacity(workflow.steps.len());

    while let Some(step_id) = queue.pop_front() {
        sorted.push(step_id.to_owned());

        if let Some(children) = dependents.get(step_id) {
            for &child in children {
                let deg = in_degree.entry(child).or_insert(0);
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(child);
                }
            }
        }
    }

    // If we didn't visit every step the graph contains a cycle.
    if sorted.len() != workflow.steps.len() {
        return Err(EngineError::CyclicDependency);
    }

    Ok(sorted)
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Step, StepKind, Trigger};

    fn make_step(id: &str, deps: &[&str]) -> Step {
        Step {
            id: id.to_string(),
            kind: StepKind::CustomFunction { function: "noop".into() },
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            timeout: None,
        }
    }

    fn make_workflow(steps: Vec<Step>) -> Workflow {
        Workflow::new("test", Trigger::EventDriven { event: "manual".into() }, steps)
    }

    #[test]
    fn valid_linear_dag_returns_sorted_order() {
        // a → b → c
        let workflow = make_workflow(vec![
            make_step("a", &[]),
            make_step("b", &["a"]),
            make_step("c", &["b"]),
        ]);

        let sorted = validate_dag(&workflow).expect("should be valid");
        assert_eq!(sorted, vec!["a", "b", "c"]);
    }

    #[test]
    fn valid_diamond_dag() {
        //   a
        //  / \
        // b   c
        //  \ /
        //   d
        let workflow = make_workflow(vec![
            make_step("a", &[]),
            make_step("b", &["a"]),
            make_step("c", &["a"]),
            make_step("d", &["b", "c"]),
        ]);

        let sorted = validate_dag(&workflow).expect("should be valid");
        // 'a' must be first, 'd' must be last.
        assert_eq!(sorted.first().unwrap(), "a");
        assert_eq!(sorted.last().unwrap(), "d");
        assert_eq!(sorted.len(), 4);
    }

    #[test]
    fn duplicate_step_id_is_rejected() {
        let workflow = make_workflow(vec![
            make_step("a", &[]),
            make_step("a", &[]), // duplicate!
        ]);
        assert!(matches!(
            validate_dag(&workflow),
            Err(EngineError::DuplicateStepId(id)) if id == "a"
        ));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let workflow = make_workflow(vec![make_step("a", &["ghost"])]);
        assert!(matches!(
            validate_dag(&workflow),
            Err(EngineError::UnknownDependency { dependency, .. }) if dependency == "ghost"
        ));
    }

    #[test]
    fn cycle_is_detected() {
        // a → b → c → a  (cycle!)
        let workflow = make_workflow(vec![
            make_step("a", &["c"]),
            make_step("b", &["a"]),
            make_step("c", &["b"]),
        ]);
        assert!(matches!(
            validate_dag(&workflow),
            Err(EngineError::CyclicDependency)
        ));
    }

    #[test]
    fn single_step_no_deps_is_valid() {
        let workflow = make_workflow(vec![make_step("solo", &[])]);
        let sorted = validate_dag(&workflow).expect("single step should be valid");
        assert_eq!(sorted, vec!["solo"]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let workflow = make_workflow(vec![make_step("a", &["a"])]);
        assert!(matches!(
            validate_dag(&workflow),
            Err(EngineError::CyclicDependency)
        ));
    }
}
