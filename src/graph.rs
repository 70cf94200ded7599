use std::collections::{BTreeSet, HashMap};
use crate::{GraphError, Task, find_cycle};

struct Node {
    task: Task,
    /// Position in insertion order; used as the topological tie-break.
    index: usize,
    dependents: Vec<String>,
}

/// Adjacency structure over task ids. Edges point from a dependency to its
/// dependent. Acyclic after every successful insertion.
#[derive(Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, Node>,
    order: Vec<String>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task and its dependency edges. Atomic: on any error the
    /// graph is exactly as it was before the call.
    pub fn add_task(&mut self, task: Task) -> Result<(), GraphError> {
        let id = task.id().to_string();
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateTask(id));
        }

        for dep in task.dependencies() {
            if *dep == id {
                return Err(GraphError::Cycle {
                    path: vec![id.clone(), id.clone()],
                });
            }
            if !self.nodes.contains_key(dep) {
                return Err(GraphError::UnknownDependency {
                    task_id: id,
                    dependency: dep.clone(),
                });
            }
        }

        let ids = self
            .order
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(id.as_str()));
        let cycle = find_cycle(ids, |node| {
            if node == id {
                task.dependencies()
            } else {
                self.dependencies(node)
            }
        });
        if let Some(path) = cycle {
            return Err(GraphError::Cycle { path });
        }

        for dep in task.dependencies() {
            if let Some(parent) = self.nodes.get_mut(dep) {
                parent.dependents.push(id.clone());
            }
        }
        let index = self.order.len();
        self.order.push(id.clone());
        self.nodes.insert(
            id,
            Node {
                task,
                index,
                dependents: Vec::new(),
            },
        );
        Ok(())
    }

    /// Kahn's algorithm. Among tasks whose dependencies are all placed, the
    /// one inserted earliest comes first, so the order is a pure function of
    /// insertion order.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let mut in_degrees: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|(id, node)| (id.as_str(), node.task.dependencies().len()))
            .collect();

        let mut ready: BTreeSet<usize> = self
            .nodes
            .values()
            .filter(|node| node.task.dependencies().is_empty())
            .map(|node| node.index)
            .collect();

        let mut sorted = Vec::with_capacity(self.order.len());
        while let Some(index) = ready.pop_first() {
            let id = &self.order[index];
            sorted.push(id.clone());
            for child in self.dependents(id) {
                if let Some(degree) = in_degrees.get_mut(child.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        if let Some(node) = self.nodes.get(child) {
                            ready.insert(node.index);
                        }
                    }
                }
            }
        }

        if sorted.len() != self.order.len() {
            let path = find_cycle(self.order.iter().map(String::as_str), |id| {
                self.dependencies(id)
            })
            .unwrap_or_default();
            return Err(GraphError::Cycle { path });
        }
        Ok(sorted)
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.nodes.get(id).map(|node| &node.task)
    }

    /// All tasks in insertion order.
    pub fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id).map(|node| &node.task))
    }

    pub fn dependencies(&self, id: &str) -> &[String] {
        self.nodes
            .get(id)
            .map(|node| node.task.dependencies())
            .unwrap_or(&[])
    }

    pub fn dependents(&self, id: &str) -> &[String] {
        self.nodes
            .get(id)
            .map(|node| node.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Every task reachable downstream of `id`, excluding `id` itself, in
    /// insertion order.
    pub fn downstream_of(&self, id: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = self.dependents(id).iter().map(String::as_str).collect();
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.get(next) {
                if seen.insert(node.index) {
                    stack.extend(node.dependents.iter().map(String::as_str));
                }
            }
        }
        seen.into_iter().map(|i| self.order[i].clone()).collect()
    }

    /// `(dependency, dependent)` pairs in insertion order of the dependent.
    pub fn edges(&self) -> Vec<(String, String)> {
        self.all_tasks()
            .flat_map(|task| {
                task.dependencies()
                    .iter()
                    .map(move |dep| (dep.clone(), task.id().to_string()))
            })
            .collect()
    }

    /// Tasks without dependencies, in insertion order.
    pub fn roots(&self) -> Vec<String> {
        self.all_tasks()
            .filter(|task| task.dependencies().is_empty())
            .map(|task| task.id().to_string())
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
