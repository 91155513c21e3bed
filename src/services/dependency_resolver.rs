use std::collections::{BTreeSet, HashMap, HashSet};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Aggregation, WorkflowDefinition};

/// A node in a dependency graph: id plus the ids it depends on.
pub type GraphNode = (String, Vec<String>);

/// A unit the executor schedules: a single step, or a whole parallel group
/// whose members run together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionUnit {
    Step(String),
    Group {
        id: String,
        steps: Vec<String>,
        aggregation: Aggregation,
    },
}

impl ExecutionUnit {
    /// Step ids covered by this unit.
    pub fn steps(&self) -> Vec<&str> {
        match self {
            Self::Step(id) => vec![id.as_str()],
            Self::Group { steps, .. } => steps.iter().map(String::as_str).collect(),
        }
    }

    fn key(&self) -> String {
        match self {
            Self::Step(id) => id.clone(),
            Self::Group { id, .. } => format!("[{id}]"),
        }
    }
}

/// Service for ordering workflow steps and detecting circular dependencies
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver;

// Standalone helper for cycle detection (no self needed)
fn detect_cycle_util<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(neighbors) = graph.get(node) {
        for &neighbor in neighbors {
            if !visited.contains(neighbor) {
                if detect_cycle_util(neighbor, graph, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(neighbor) {
                if let Some(cycle_start) = path.iter().position(|&id| id == neighbor) {
                    path.drain(0..cycle_start);
                    path.push(neighbor);
                    return true;
                }
            }
        }
    }

    rec_stack.remove(node);
    path.pop();
    false
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Find a dependency cycle, returned as a closed path (`a -> b -> a`).
    pub fn detect_cycle(&self, nodes: &[GraphNode]) -> Option<Vec<String>> {
        let graph: HashMap<&str, Vec<&str>> = nodes
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.iter().map(String::as_str).collect()))
            .collect();

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        // Declaration order keeps the reported path deterministic.
        for (id, _) in nodes {
            if !visited.contains(id.as_str())
                && detect_cycle_util(id, &graph, &mut visited, &mut rec_stack, &mut path)
            {
                return Some(path.into_iter().map(str::to_string).collect());
            }
        }
        None
    }

    /// Kahn's algorithm. Dependencies come before dependents; ties are broken
    /// by declaration order. Dependencies on unknown ids are ignored.
    pub fn topological_sort(&self, nodes: &[GraphNode]) -> DomainResult<Vec<String>> {
        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, (id, _))| (id.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (i, (_, deps)) in nodes.iter().enumerate() {
            let unique: BTreeSet<usize> = deps.iter().filter_map(|d| index.get(d.as_str()).copied()).collect();
            for dep in unique {
                dependents[dep].push(i);
                in_degree[i] += 1;
            }
        }

        let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut sorted = Vec::with_capacity(nodes.len());

        while let Some(next) = ready.pop_first() {
            sorted.push(nodes[next].0.clone());
            for &dependent in &dependents[next] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if sorted.len() != nodes.len() {
            let cycle = self.detect_cycle(nodes).unwrap_or_else(|| {
                nodes
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| in_degree[*i] > 0)
                    .map(|(_, (id, _))| id.clone())
                    .collect()
            });
            return Err(DomainError::CycleDetected(cycle));
        }

        Ok(sorted)
    }

    /// Step ids of a workflow in execution order.
    pub fn execution_order(&self, definition: &WorkflowDefinition) -> DomainResult<Vec<String>> {
        let nodes: Vec<GraphNode> = definition
            .steps
            .iter()
            .map(|s| (s.id.clone(), s.depends_on.clone()))
            .collect();
        self.topological_sort(&nodes)
    }

    /// Scheduling units in execution order. Each parallel group collapses to
    /// one unit that depends on everything its members depend on.
    pub fn execution_units(&self, definition: &WorkflowDefinition) -> DomainResult<Vec<ExecutionUnit>> {
        let mut units: Vec<ExecutionUnit> = Vec::new();
        let mut unit_of_step: HashMap<&str, usize> = HashMap::new();
        let mut unit_of_group: HashMap<&str, usize> = HashMap::new();

        for step in &definition.steps {
            let unit_index = match definition.group_of(&step.id) {
                Some(group) => *unit_of_group.entry(group.id.as_str()).or_insert_with(|| {
                    units.push(ExecutionUnit::Group {
                        id: group.id.clone(),
                        steps: group.steps.clone(),
                        aggregation: group.aggregation,
                    });
                    units.len() - 1
                }),
                None => {
                    units.push(ExecutionUnit::Step(step.id.clone()));
                    units.len() - 1
                }
            };
            unit_of_step.insert(step.id.as_str(), unit_index);
        }

        let keys: Vec<String> = units.iter().map(ExecutionUnit::key).collect();
        let mut unit_deps: Vec<Vec<String>> = vec![Vec::new(); units.len()];
        for step in &definition.steps {
            let Some(&unit) = unit_of_step.get(step.id.as_str()) else { continue };
            for dep in &step.depends_on {
                if let Some(&dep_unit) = unit_of_step.get(dep.as_str()) {
                    if dep_unit != unit && !unit_deps[unit].contains(&keys[dep_unit]) {
                        unit_deps[unit].push(keys[dep_unit].clone());
                    }
                }
            }
        }

        let nodes: Vec<GraphNode> = keys.iter().cloned().zip(unit_deps).collect();
        let order = self.topological_sort(&nodes)?;

        let mut by_key: HashMap<String, ExecutionUnit> = keys.into_iter().zip(units).collect();
        Ok(order.into_iter().filter_map(|key| by_key.remove(&key)).collect())
    }

    /// Full registration-time validation: structure, step cycles and unit
    /// cycles introduced by collapsing parallel groups.
    pub fn validate(&self, definition: &WorkflowDefinition) -> DomainResult<Vec<ExecutionUnit>> {
        definition.validate_structure()?;
        self.execution_order(definition)?;
        self.execution_units(definition)
    }

    /// Dependency depth of each step: 0 for roots, else 1 + deepest dependency.
    pub fn depths(&self, definition: &WorkflowDefinition) -> DomainResult<HashMap<String, u32>> {
        let order = self.execution_order(definition)?;
        let mut depths: HashMap<String, u32> = HashMap::new();
        for step_id in order {
            let depth = definition
                .step(&step_id)
                .map(|step| {
                    step.depends_on
                        .iter()
                        .filter_map(|d| depths.get(d))
                        .max()
                        .map_or(0, |d| d + 1)
                })
                .unwrap_or(0);
            depths.insert(step_id, depth);
        }
        Ok(depths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ParallelGroup, WorkflowStep};

    fn node(id: &str, deps: &[&str]) -> GraphNode {
        (id.to_string(), deps.iter().map(|d| (*d).to_string()).collect())
    }

    #[test]
    fn test_detect_cycle_no_cycle() {
        let resolver = DependencyResolver::new();
        assert!(resolver.detect_cycle(&[node("a", &[]), node("b", &["a"])]).is_none());
    }

    #[test]
    fn test_detect_cycle_with_cycle() {
        let resolver = DependencyResolver::new();
        let cycle = resolver
            .detect_cycle(&[node("a", &["b"]), node("b", &["a"])])
            .unwrap();
        assert_eq!(cycle, vec!["a", "b", "a"]);
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let resolver = DependencyResolver::new();
        let err = resolver.topological_sort(&[node("a", &["a"])]).unwrap_err();
        assert!(matches!(err, DomainError::CycleDetected(path) if path == vec!["a", "a"]));
    }

    #[test]
    fn test_topological_sort_simple() {
        let resolver = DependencyResolver::new();
        let sorted = resolver
            .topological_sort(&[node("c", &["b"]), node("a", &[]), node("b", &["a"])])
            .unwrap();
        assert_eq!(sorted, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_topological_sort_ties_follow_declaration_order() {
        let resolver = DependencyResolver::new();
        let sorted = resolver
            .topological_sort(&[node("z", &[]), node("y", &[]), node("x", &["z"]), node("w", &[])])
            .unwrap();
        assert_eq!(sorted, vec!["z", "y", "x", "w"]);
    }

    #[test]
    fn test_group_collapse_creates_unit_cycle() {
        // a and c share a group; c depends on b which depends on a.
        let def = WorkflowDefinition::new("wf", "wf", "t")
            .with_step(WorkflowStep::new("a", "x"))
            .with_step(WorkflowStep::new("b", "x").depends_on("a"))
            .with_step(WorkflowStep::new("c", "x").depends_on("b"))
            .with_group(ParallelGroup::new("g", &["a", "c"], Aggregation::All));

        let resolver = DependencyResolver::new();
        assert!(resolver.execution_order(&def).is_ok());
        assert!(matches!(resolver.validate(&def), Err(DomainError::CycleDetected(_))));
    }

    #[test]
    fn test_execution_units() {
        let def = WorkflowDefinition::new("wf", "wf", "t")
            .with_step(WorkflowStep::new("fetch", "x"))
            .with_step(WorkflowStep::new("left", "x").depends_on("fetch"))
            .with_step(WorkflowStep::new("right", "x").depends_on("fetch"))
            .with_step(WorkflowStep::new("merge", "x").depends_on("left").depends_on("right"))
            .with_group(ParallelGroup::new("fan", &["left", "right"], Aggregation::Majority));

        let units = DependencyResolver::new().validate(&def).unwrap();
        assert_eq!(units.len(), 3);
        assert_eq!(units[0], ExecutionUnit::Step("fetch".into()));
        assert_eq!(units[1].steps(), vec!["left", "right"]);
        assert_eq!(units[2], ExecutionUnit::Step("merge".into()));
    }

    #[test]
    fn test_depths() {
        let def = WorkflowDefinition::new("wf", "wf", "t")
            .with_step(WorkflowStep::new("a", "x"))
            .with_step(WorkflowStep::new("b", "x").depends_on("a"))
            .with_step(WorkflowStep::new("c", "x").depends_on("b").depends_on("a"));
        let depths = DependencyResolver::new().depths(&def).unwrap();
        assert_eq!(depths["a"], 0);
        assert_eq!(depths["b"], 1);
        assert_eq!(depths["c"], 2);
    }
}
