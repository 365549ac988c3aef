//! Dependency graph for managing task dependencies.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges must be kept in sync

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::domain::TaskId;

/// Dependency graph for tracking task dependencies.
///
/// Sets are ordered so every walk visits nodes in id order, which keeps
/// cycle paths and cascades deterministic.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Forward edges: task -> tasks it depends on (waits for)
    edges: BTreeMap<TaskId, BTreeSet<TaskId>>,

    /// Reverse edges: task -> tasks that depend on it (waiting tasks)
    reverse_edges: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    /// On the current DFS path.
    Gray,
    /// Fully explored.
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dependency: `task` depends on `depends_on`.
    ///
    /// Example: add_dependency(task_b, task_a) means "B waits for A"
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.edges.entry(task).or_default().insert(depends_on);
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(task);
    }

    /// Tasks that directly wait for `task`.
    ///
    /// Includes tasks with other unresolved dependencies; the caller checks
    /// readiness.
    pub fn get_waiting_tasks(&self, task: TaskId) -> Vec<TaskId> {
        self.reverse_edges
            .get(&task)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn get_dependencies(&self, task: TaskId) -> Vec<TaskId> {
        self.edges
            .get(&task)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Check whether making `task` depend on `dependencies` would close a cycle.
    ///
    /// Walks the existing graph from each proposed dependency with a visited
    /// set. Returns the cycle as `[task, dep, ..., task]` if a walk reaches
    /// `task` (a self-dependency yields `[task, task]`).
    pub fn would_create_cycle(&self, task: TaskId, dependencies: &[TaskId]) -> Option<Vec<TaskId>> {
        let mut visited = BTreeSet::new();
        for &dep in dependencies {
            if dep == task {
                return Some(vec![task, task]);
            }
            let mut prev: HashMap<TaskId, TaskId> = HashMap::new();
            let mut stack = vec![dep];
            if !visited.insert(dep) {
                continue;
            }
            while let Some(node) = stack.pop() {
                for next in self.get_dependencies(node) {
                    if next == task {
                        let mut path = vec![task, node];
                        let mut cur = node;
                        while let Some(&p) = prev.get(&cur) {
                            path.push(p);
                            cur = p;
                        }
                        // path is [task, node, ..., dep]; flip the walk part.
                        path[1..].reverse();
                        path.push(task);
                        return Some(path);
                    }
                    if visited.insert(next) {
                        prev.insert(next, node);
                        stack.push(next);
                    }
                }
            }
        }
        None
    }

    /// Detect a cycle anywhere in the graph.
    ///
    /// Three-colour DFS, O(V + E). Returns the first cycle found as
    /// `[a, b, ..., a]` following "depends on" edges, or None for a DAG.
    pub fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        let mut colors: HashMap<TaskId, Color> = HashMap::new();
        let mut path = Vec::new();
        for &start in self.edges.keys() {
            if colors.contains_key(&start) {
                continue;
            }
            if let Some(cycle) = self.dfs_cycle(start, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: TaskId,
        colors: &mut HashMap<TaskId, Color>,
        path: &mut Vec<TaskId>,
    ) -> Option<Vec<TaskId>> {
        colors.insert(node, Color::Gray);
        path.push(node);

        for dep in self.get_dependencies(node) {
            match colors.get(&dep) {
                Some(Color::Gray) => {
                    let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Some(Color::Black) => {}
                None => {
                    if let Some(cycle) = self.dfs_cycle(dep, colors, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        colors.insert(node, Color::Black);
        path.pop();
        None
    }
}
