//! A thin wrapper over the task dependency graph.
//!
//! Traversal order and scheduling policy belong to the caller; this
//! type only stores tasks, their edges, and the adjacency accessors the
//! engine exposes.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::TaskError;
use crate::task::{IdentityKey, Task};

#[derive(Default)]
pub struct TaskDag {
    graph: DiGraph<Task, ()>,
    index: HashMap<IdentityKey, NodeIndex>,
}

impl TaskDag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, task: Task) -> NodeIndex {
        let key = task.identity_key();
        let index = self.graph.add_node(task);
        self.index.insert(key, index);
        index
    }

    /// Declares that `to` consumes what `from` produces.
    pub fn add_dependency(&mut self, from: NodeIndex, to: NodeIndex) {
        self.graph.add_edge(from, to, ());
    }

    pub fn task(&self, index: NodeIndex) -> &Task {
        &self.graph[index]
    }

    pub fn task_mut(&mut self, index: NodeIndex) -> &mut Task {
        &mut self.graph[index]
    }

    pub fn find(&self, key: &IdentityKey) -> Option<NodeIndex> {
        self.index.get(key).copied()
    }

    /// Tasks that consume this task's outputs.
    pub fn next_tasks(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.graph.neighbors_directed(index, Direction::Outgoing).collect()
    }

    /// Tasks whose outputs this task consumes.
    pub fn prev_tasks(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.graph.neighbors_directed(index, Direction::Incoming).collect()
    }

    /// A dependency-respecting order over all tasks; detects cycles.
    pub fn toposort(&self) -> Result<Vec<NodeIndex>, TaskError> {
        petgraph::algo::toposort(&self.graph, None).map_err(|_| TaskError::Cycle)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::FnLogic;

    fn task(name: &str, output: &str) -> Task {
        let logic = FnLogic::new(name, "fn body() {}", |_ctx| Ok(()));
        Task::builder(logic)
            .output("out", format!("/build/{output}"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_adjacency() {
        let mut dag = TaskDag::new();
        let a = dag.add_task(task("a", "a.txt"));
        let b = dag.add_task(task("b", "b.txt"));
        let c = dag.add_task(task("c", "c.txt"));
        dag.add_dependency(a, b);
        dag.add_dependency(a, c);

        assert_eq!(dag.prev_tasks(a), vec![]);
        let mut next = dag.next_tasks(a);
        next.sort();
        assert_eq!(next, vec![b, c]);
        assert_eq!(dag.prev_tasks(c), vec![a]);
    }

    #[test]
    fn test_find_by_identity() {
        let mut dag = TaskDag::new();
        let index = dag.add_task(task("a", "a.txt"));
        let key = dag.task(index).identity_key();

        assert_eq!(dag.find(&key), Some(index));
    }

    #[test]
    fn test_cycle_detection() {
        let mut dag = TaskDag::new();
        let a = dag.add_task(task("a", "a.txt"));
        let b = dag.add_task(task("b", "b.txt"));
        dag.add_dependency(a, b);
        assert!(dag.toposort().is_ok());

        dag.add_dependency(b, a);
        assert!(matches!(dag.toposort(), Err(TaskError::Cycle)));
    }
}
