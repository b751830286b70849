use thiserror::Error;

use crate::ir::OpDesc;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("node {0:?} does not exist")]
    NoSuchNode(NodeId),
    #[error("argument '{0}' already has a producer")]
    MultipleProducers(String),
    #[error("node {node:?} outside the removal set still links to {target:?}")]
    DanglingEdge { node: NodeId, target: NodeId },
    #[error("expected an {expected} node at {id:?}")]
    KindMismatch { id: NodeId, expected: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone)]
pub struct Argument {
    pub name: String,
    pub is_weight: bool,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Arg(Argument),
    Op(OpDesc),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub inlinks: Vec<NodeId>,
    pub outlinks: Vec<NodeId>,
}

impl Node {
    pub fn as_arg(&self) -> Option<&Argument> {
        match &self.kind {
            NodeKind::Arg(a) => Some(a),
            NodeKind::Op(_) => None,
        }
    }

    pub fn as_op(&self) -> Option<&OpDesc> {
        match &self.kind {
            NodeKind::Op(d) => Some(d),
            NodeKind::Arg(_) => None,
        }
    }
}

/// Directed dataflow graph over argument and operator nodes. Ids are stable
/// for the lifetime of the graph; removal leaves a hole in the slot vector.
///
/// Invariants kept by the mutators: acyclic, at most one producer per
/// argument, and edges only between live nodes.
#[derive(Debug, Default, Clone)]
pub struct Graph {
    nodes: Vec<Option<Node>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_arg(&mut self, name: impl Into<String>, is_weight: bool) -> NodeId {
        self.insert(NodeKind::Arg(Argument {
            name: name.into(),
            is_weight,
        }))
    }

    pub fn add_op(&mut self, desc: OpDesc) -> NodeId {
        self.insert(NodeKind::Op(desc))
    }

    fn insert(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(Node {
            kind,
            inlinks: Vec::new(),
            outlinks: Vec::new(),
        }));
        id
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(GraphError::NoSuchNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(GraphError::NoSuchNode(id))
    }

    pub fn arg(&self, id: NodeId) -> Result<&Argument, GraphError> {
        self.node(id)?.as_arg().ok_or(GraphError::KindMismatch {
            id,
            expected: "argument",
        })
    }

    pub fn op_desc(&self, id: NodeId) -> Result<&OpDesc, GraphError> {
        self.node(id)?.as_op().ok_or(GraphError::KindMismatch {
            id,
            expected: "operator",
        })
    }

    pub fn op_desc_mut(&mut self, id: NodeId) -> Result<&mut OpDesc, GraphError> {
        match &mut self.node_mut(id)?.kind {
            NodeKind::Op(d) => Ok(d),
            NodeKind::Arg(_) => Err(GraphError::KindMismatch {
                id,
                expected: "operator",
            }),
        }
    }

    /// Live node ids in insertion order; the basis for deterministic
    /// matching.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_some())
            .map(|(i, _)| NodeId(i))
    }

    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn arg_by_name(&self, name: &str) -> Option<NodeId> {
        self.node_ids().find(|&id| {
            self.node(id)
                .ok()
                .and_then(Node::as_arg)
                .is_some_and(|a| a.name == name)
        })
    }

    pub fn producer(&self, id: NodeId) -> Result<Option<NodeId>, GraphError> {
        Ok(self.node(id)?.inlinks.first().copied())
    }

    pub fn consumers(&self, id: NodeId) -> Result<Vec<NodeId>, GraphError> {
        Ok(self.node(id)?.outlinks.clone())
    }

    pub fn link(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        self.node(to)?;
        let from_node = self.node(from)?;
        if from_node.outlinks.contains(&to) {
            return Ok(());
        }
        if let NodeKind::Arg(arg) = &self.node(to)?.kind {
            if !self.node(to)?.inlinks.is_empty() {
                return Err(GraphError::MultipleProducers(arg.name.clone()));
            }
        }
        self.node_mut(from)?.outlinks.push(to);
        self.node_mut(to)?.inlinks.push(from);
        Ok(())
    }

    pub fn unlink(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        self.node_mut(from)?.outlinks.retain(|&id| id != to);
        self.node_mut(to)?.inlinks.retain(|&id| id != from);
        Ok(())
    }

    /// Removes a node set atomically. Fails without modifying the graph if
    /// any node outside the set still holds an edge into or out of it.
    pub fn remove_node_set(&mut self, ids: &[NodeId]) -> Result<(), GraphError> {
        for &id in ids {
            let node = self.node(id)?;
            for &neighbor in node.inlinks.iter().chain(node.outlinks.iter()) {
                if !ids.contains(&neighbor) {
                    return Err(GraphError::DanglingEdge {
                        node: neighbor,
                        target: id,
                    });
                }
            }
        }
        for &id in ids {
            self.nodes[id.0] = None;
        }
        Ok(())
    }

    /// Checks the structural invariants; used by tests after every rewrite.
    pub fn verify(&self) -> Result<(), String> {
        for id in self.node_ids() {
            let node = self.node(id).map_err(|e| e.to_string())?;
            for &neighbor in node.inlinks.iter().chain(node.outlinks.iter()) {
                if self.node(neighbor).is_err() {
                    return Err(format!("{id:?} links to removed node {neighbor:?}"));
                }
            }
            match &node.kind {
                NodeKind::Arg(arg) => {
                    if node.inlinks.len() > 1 {
                        return Err(format!("argument '{}' has multiple producers", arg.name));
                    }
                }
                NodeKind::Op(desc) => {
                    for name in desc.input_names().chain(desc.output_names()) {
                        if self.arg_by_name(name).is_none() {
                            return Err(format!(
                                "op '{}' references missing argument '{name}'",
                                desc.op_type
                            ));
                        }
                    }
                }
            }
        }
        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<(), String> {
        // Kahn's algorithm over live nodes.
        let mut indegree: Vec<usize> = self
            .nodes
            .iter()
            .map(|n| n.as_ref().map_or(0, |n| n.inlinks.len()))
            .collect();
        let mut queue: Vec<NodeId> = self
            .node_ids()
            .filter(|&id| indegree[id.0] == 0)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop() {
            visited += 1;
            if let Ok(node) = self.node(id) {
                for &next in &node.outlinks {
                    indegree[next.0] -= 1;
                    if indegree[next.0] == 0 {
                        queue.push(next);
                    }
                }
            }
        }
        if visited == self.len() {
            Ok(())
        } else {
            Err("graph contains a cycle".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_rejects_second_producer() {
        let mut g = Graph::new();
        let a = g.add_arg("a", false);
        let op1 = g.add_op(OpDesc::new("relu"));
        let op2 = g.add_op(OpDesc::new("relu"));
        g.link(op1, a).unwrap();
        assert!(matches!(
            g.link(op2, a),
            Err(GraphError::MultipleProducers(_))
        ));
    }

    #[test]
    fn remove_node_set_rejects_external_edge() {
        let mut g = Graph::new();
        let a = g.add_arg("a", false);
        let op = g.add_op(OpDesc::new("relu"));
        let out = g.add_arg("out", false);
        g.link(a, op).unwrap();
        g.link(op, out).unwrap();
        // `a` still feeds `op` from outside the set.
        assert!(g.remove_node_set(&[op, out]).is_err());
        assert_eq!(g.len(), 3);
        g.remove_node_set(&[a, op, out]).unwrap();
        assert_eq!(g.len(), 0);
    }

    #[test]
    fn verify_flags_missing_argument_reference() {
        let mut g = Graph::new();
        let mut desc = OpDesc::new("conv2d");
        desc.set_input("Input", vec!["phantom".to_string()]);
        g.add_op(desc);
        assert!(g.verify().is_err());
    }

    #[test]
    fn verify_accepts_chain() {
        let mut g = Graph::new();
        let a = g.add_arg("a", false);
        let mut desc = OpDesc::new("relu");
        desc.set_input("X", vec!["a".to_string()]);
        desc.set_output("Out", vec!["b".to_string()]);
        let op = g.add_op(desc);
        let b = g.add_arg("b", false);
        g.link(a, op).unwrap();
        g.link(op, b).unwrap();
        g.verify().unwrap();
    }
}
