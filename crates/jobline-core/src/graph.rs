//! Step dependency graph and execution ordering.
//!
//! An edge `A → B` means "B depends on A": A must finish before B may run.
//! Ordering uses Kahn's algorithm; ties are broken by insertion order so the
//! plan is stable across runs.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use crate::domain::step::StepConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate step `{0}`")]
    DuplicateStep(String),

    #[error("step `{step}` depends on unknown step `{dependency}`")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle through steps: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// Directed acyclic graph over step ids.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    /// `node → dependencies`
    upstream: Vec<BTreeSet<usize>>,
    /// `node → dependents`
    downstream: Vec<BTreeSet<usize>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph for a list of steps, in declaration order.
    pub fn from_steps(steps: &[StepConfig]) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for step in steps {
            graph.add_node(&step.id)?;
        }
        for step in steps {
            for dep in &step.depends_on {
                if !graph.index.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                graph.add_dependency(dep, &step.id)?;
            }
        }
        Ok(graph)
    }

    pub fn add_node(&mut self, id: &str) -> Result<(), GraphError> {
        if self.index.contains_key(id) {
            return Err(GraphError::DuplicateStep(id.to_string()));
        }
        self.index.insert(id.to_string(), self.ids.len());
        self.ids.push(id.to_string());
        self.upstream.push(BTreeSet::new());
        self.downstream.push(BTreeSet::new());
        Ok(())
    }

    /// Record that `dependent` depends on `dependency`.
    ///
    /// Rejected when `dependency` is already reachable from `dependent`,
    /// which would close a cycle.
    pub fn add_dependency(&mut self, dependency: &str, dependent: &str) -> Result<(), GraphError> {
        let from = self.lookup(dependency, dependent)?;
        let to = self.lookup(dependent, dependency)?;

        if let Some(mut path) = self.path_between(to, from) {
            path.push(self.ids[to].clone());
            return Err(GraphError::Cycle(path));
        }

        self.downstream[from].insert(to);
        self.upstream[to].insert(from);
        Ok(())
    }

    fn lookup(&self, id: &str, referrer: &str) -> Result<usize, GraphError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::UnknownDependency {
                step: referrer.to_string(),
                dependency: id.to_string(),
            })
    }

    /// Depth-first search for a downstream path `start → … → goal`.
    fn path_between(&self, start: usize, goal: usize) -> Option<Vec<String>> {
        let mut stack = vec![(start, vec![start])];
        let mut seen = BTreeSet::new();
        while let Some((node, path)) = stack.pop() {
            if node == goal {
                return Some(path.iter().map(|&i| self.ids[i].clone()).collect());
            }
            if !seen.insert(node) {
                continue;
            }
            for &next in &self.downstream[node] {
                let mut next_path = path.clone();
                next_path.push(next);
                stack.push((next, next_path));
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Direct dependencies of `id`, in insertion order.
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| self.upstream[i].iter().map(|&d| self.ids[d].as_str()).collect())
            .unwrap_or_default()
    }

    /// Step ids with every dependency before its dependents.
    pub fn topological_order(&self) -> Result<Vec<&str>, GraphError> {
        let mut in_degree: Vec<usize> = self.upstream.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.ids.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut sorted = Vec::with_capacity(self.ids.len());

        while let Some(node) = ready.pop_first() {
            sorted.push(self.ids[node].as_str());
            for &next in &self.downstream[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if sorted.len() != self.ids.len() {
            let stuck = (0..self.ids.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.ids[i].clone())
                .collect();
            return Err(GraphError::Cycle(stuck));
        }
        Ok(sorted)
    }

    /// Steps grouped so each group depends only on earlier groups.
    ///
    /// Steps in the same level have no ordering constraint between them.
    pub fn levels(&self) -> Result<Vec<Vec<&str>>, GraphError> {
        let order = self.topological_order()?;
        let mut level_of = vec![0usize; self.ids.len()];
        let mut levels: Vec<Vec<&str>> = Vec::new();

        for id in order {
            let i = self.index[id];
            let level = self.upstream[i]
                .iter()
                .map(|&d| level_of[d] + 1)
                .max()
                .unwrap_or(0);
            level_of[i] = level;
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(id);
        }
        Ok(levels)
    }
}
