use std::collections::HashMap;
use std::fmt;

use petgraph::graph::{DiGraph, NodeIndex};

use crate::key::{CaseKey, TaskKey};

/// A node of the exported DAG: one value the flow can produce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DagNode {
    pub task_key: TaskKey,
    /// Short unique name, `entity` or `entity[ix]`.
    pub name: String,
    pub entity_name: String,
    pub case_key: CaseKey,
    /// Position among the entity's task keys, ordered by case key.
    pub task_ix: usize,
    pub doc: Option<String>,
}

/// The task graph of a flow, with an edge from each task key to every key
/// depending on it.
#[derive(Debug, Default)]
pub struct FlowDag {
    pub graph: DiGraph<DagNode, ()>,
    indices: HashMap<TaskKey, NodeIndex>,
}

impl FlowDag {
    pub(crate) fn add_node(&mut self, node: DagNode) -> NodeIndex {
        let key = node.task_key.clone();
        let index = self.graph.add_node(node);
        self.indices.insert(key, index);
        index
    }

    /// Adds an edge if both ends are part of the DAG.
    pub(crate) fn add_edge(&mut self, from: &TaskKey, to: &TaskKey) {
        if let (Some(&a), Some(&b)) = (self.indices.get(from), self.indices.get(to))
            && self.graph.find_edge(a, b).is_none()
        {
            self.graph.add_edge(a, b, ());
        }
    }

    pub fn node(&self, key: &TaskKey) -> Option<&DagNode> {
        self.indices.get(key).map(|&index| &self.graph[index])
    }

    pub fn node_by_name(&self, name: &str) -> Option<&DagNode> {
        self.graph.node_weights().find(|node| node.name == name)
    }

    pub fn contains_edge(&self, from: &TaskKey, to: &TaskKey) -> bool {
        match (self.indices.get(from), self.indices.get(to)) {
            (Some(&a), Some(&b)) => self.graph.contains_edge(a, b),
            _ => false,
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

/// Renders the DAG as a Mermaid flowchart.
impl fmt::Display for FlowDag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let label = node.task_key.to_string().replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), label)?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {} --> {}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}
