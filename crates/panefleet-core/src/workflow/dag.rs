//! Dependency graph over a workflow's flattened steps.
//!
//! Nested parallel members and loop bodies are indexed alongside top-level
//! steps, with their container recorded in a parent table. Cycles are found
//! with petgraph's strongly-connected components; levels use Kahn's algorithm.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use panefleet_types::error::{DependencyError, DependencyErrorKind};
use panefleet_types::workflow::{Step, Workflow};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;

/// Resolved execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    /// Step ids in topological order.
    pub order: Vec<String>,
    /// Sets of ids whose dependencies are satisfied by all earlier levels.
    pub levels: Vec<Vec<String>>,
    pub valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<DependencyError>,
}

#[derive(Debug, thiserror::Error)]
#[error("step '{0}' not found")]
pub struct UnknownStep(pub String);

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    steps: BTreeMap<String, Step>,
    /// Top-level ids in declaration order.
    roots: Vec<String>,
    edges: BTreeMap<String, Vec<String>>,
    reverse: BTreeMap<String, Vec<String>>,
    parent: HashMap<String, String>,
    executed: HashSet<String>,
}

impl DependencyGraph {
    pub fn build(workflow: &Workflow) -> Self {
        let mut graph = Self::default();
        for step in &workflow.steps {
            graph.roots.push(step.id.clone());
            graph.insert(step, None);
        }
        graph
    }

    fn insert(&mut self, step: &Step, parent: Option<&str>) {
        let id = step.id.clone();
        for dep in &step.depends_on {
            self.reverse.entry(dep.clone()).or_default().push(id.clone());
        }
        self.edges.insert(id.clone(), step.depends_on.clone());
        if let Some(parent) = parent {
            self.parent.insert(id.clone(), parent.to_string());
        }
        for child in step.children() {
            self.insert(child, Some(&id));
        }
        self.steps.insert(id, step.clone());
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Structural errors: missing dependencies and cycles.
    ///
    /// Dependents of a missing or cyclic step are not reported separately;
    /// the root cause already blocks the run.
    pub fn validate(&self) -> Vec<DependencyError> {
        let mut errors = Vec::new();

        for (id, deps) in &self.edges {
            for dep in deps {
                if !self.steps.contains_key(dep) {
                    errors.push(DependencyError {
                        kind: DependencyErrorKind::MissingDep,
                        steps: vec![id.clone(), dep.clone()],
                        message: format!("step '{id}' depends on non-existent step '{dep}'"),
                    });
                }
            }
        }

        let cycles = self.cycles();
        for cycle in &cycles {
            errors.push(DependencyError {
                kind: DependencyErrorKind::Cycle,
                steps: cycle.members.clone(),
                message: format!("circular dependency: {}", cycle.path.join(" -> ")),
            });
        }

        errors
    }

    /// Cycles as strongly-connected components with more than one member,
    /// or a single member that depends on itself.
    fn cycles(&self) -> Vec<Cycle> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let index: HashMap<&str, NodeIndex> = self
            .steps
            .keys()
            .map(|id| (id.as_str(), graph.add_node(id.as_str())))
            .collect();

        for (id, deps) in &self.edges {
            for dep in deps {
                if let (Some(&from), Some(&to)) =
                    (index.get(id.as_str()), index.get(dep.as_str()))
                {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let mut cycles: Vec<Cycle> = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || graph.find_edge(scc[0], scc[0]).is_some())
            .map(|scc| {
                let mut members: Vec<String> =
                    scc.iter().map(|&n| graph[n].to_string()).collect();
                members.sort();
                let path = self.cycle_path(&members);
                Cycle { members, path }
            })
            .collect();
        cycles.sort_by(|a, b| a.members.cmp(&b.members));
        cycles
    }

    /// A concrete loop through `members`, starting and ending at the
    /// smallest id.
    fn cycle_path(&self, members: &[String]) -> Vec<String> {
        let set: HashSet<&str> = members.iter().map(String::as_str).collect();
        let start = members[0].as_str();

        let mut path = vec![start.to_string()];
        let mut visited = HashSet::from([start]);
        if self.walk_to(start, start, &set, &mut visited, &mut path) {
            return path;
        }
        members.to_vec()
    }

    fn walk_to<'s>(
        &'s self,
        current: &'s str,
        target: &str,
        set: &HashSet<&str>,
        visited: &mut HashSet<&'s str>,
        path: &mut Vec<String>,
    ) -> bool {
        let mut deps: Vec<&str> = self
            .dependencies(current)
            .iter()
            .map(String::as_str)
            .filter(|d| set.contains(d))
            .collect();
        deps.sort_unstable();

        for dep in deps {
            if dep == target {
                path.push(dep.to_string());
                return true;
            }
            if visited.insert(dep) {
                path.push(dep.to_string());
                if self.walk_to(dep, target, set, visited, path) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    pub fn resolve(&self) -> ExecutionPlan {
        let errors = self.validate();
        if !errors.is_empty() {
            return ExecutionPlan {
                errors,
                ..Default::default()
            };
        }

        let mut in_degree: BTreeMap<&str, usize> = self
            .edges
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.len()))
            .collect();

        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut plan = ExecutionPlan {
            valid: true,
            ..Default::default()
        };

        while !queue.is_empty() {
            queue.sort_unstable();
            let mut next = Vec::new();
            for &id in &queue {
                for dependent in self.dependents(id) {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(dependent.as_str());
                        }
                    }
                }
            }
            let level: Vec<String> = queue.iter().map(|s| s.to_string()).collect();
            plan.order.extend(level.iter().cloned());
            plan.levels.push(level);
            queue = next;
        }

        if plan.order.len() != self.steps.len() {
            plan.valid = false;
            let scheduled: HashSet<&str> = plan.order.iter().map(String::as_str).collect();
            for id in self.steps.keys().filter(|id| !scheduled.contains(id.as_str())) {
                plan.errors.push(DependencyError {
                    kind: DependencyErrorKind::Unschedulable,
                    steps: vec![id.clone()],
                    message: format!("step '{id}' could not be scheduled"),
                });
            }
        }

        plan
    }

    // -----------------------------------------------------------------------
    // Incremental execution
    // -----------------------------------------------------------------------

    /// Unexecuted steps whose dependencies have all executed, sorted.
    pub fn ready_steps(&self) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(id, deps)| {
                !self.executed.contains(*id) && deps.iter().all(|d| self.executed.contains(d))
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn mark_executed(&mut self, id: &str) -> Result<(), UnknownStep> {
        if !self.steps.contains_key(id) {
            return Err(UnknownStep(id.to_string()));
        }
        self.executed.insert(id.to_string());
        Ok(())
    }

    pub fn is_executed(&self, id: &str) -> bool {
        self.executed.contains(id)
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.get(id)
    }

    pub fn dependencies(&self, id: &str) -> &[String] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn dependents(&self, id: &str) -> &[String] {
        self.reverse.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// The parallel or loop container of a nested step.
    pub fn parent(&self, id: &str) -> Option<&str> {
        self.parent.get(id).map(String::as_str)
    }

    /// Top-level step ids in declaration order.
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// All nested ids under `id`, at any depth.
    pub fn descendants(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(step) = self.steps.get(id) {
            let mut stack: Vec<&Step> = step.children().collect();
            while let Some(child) = stack.pop() {
                out.push(child.id.clone());
                stack.extend(child.children());
            }
        }
        out
    }

    /// Dependencies of `id` and its descendants that point outside the
    /// subtree rooted at `id`.
    pub fn external_dependencies(&self, id: &str) -> Vec<String> {
        let mut inside: HashSet<String> = self.descendants(id).into_iter().collect();
        inside.insert(id.to_string());

        let mut deps: BTreeSet<String> = BTreeSet::new();
        for member in &inside {
            for dep in self.dependencies(member) {
                if !inside.contains(dep) {
                    deps.insert(dep.clone());
                }
            }
        }
        deps.into_iter().collect()
    }

    pub fn size(&self) -> usize {
        self.steps.len()
    }
}

struct Cycle {
    members: Vec<String>,
    path: Vec<String>,
}
