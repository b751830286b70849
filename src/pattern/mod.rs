use crate::ir::graph::{Graph, NodeId, NodeKind};

pub mod matcher;

/// Whether a matched node sits on the boundary of the pattern or belongs to
/// the region a rewrite is expected to delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Retained,
    Input,
    Output,
    Intermediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderKind {
    Var,
    Op,
}

/// Closed predicate set evaluated against a candidate node; patterns carry
/// no closures so they stay inert data.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// The node is an operator of the given type.
    IsOp(String),
    /// The argument is consumed by an operator of the given type, at the
    /// given input slot if one is named.
    IsOpInput {
        op_type: String,
        slot: Option<String>,
    },
    /// The argument is produced by an operator of the given type, at the
    /// given output slot if one is named.
    IsOpOutput {
        op_type: String,
        slot: Option<String>,
    },
    /// The operator carries the named attribute, of any value.
    HasAttr(String),
}

impl Predicate {
    pub(crate) fn eval(&self, graph: &Graph, id: NodeId) -> bool {
        let Ok(node) = graph.node(id) else {
            return false;
        };
        match self {
            Predicate::IsOp(op_type) => node.as_op().is_some_and(|d| d.op_type == *op_type),
            Predicate::IsOpInput { op_type, slot } => {
                let Some(arg) = node.as_arg() else {
                    return false;
                };
                node.outlinks.iter().any(|&consumer| {
                    graph.node(consumer).ok().is_some_and(|c| match &c.kind {
                        NodeKind::Op(desc) if desc.op_type == *op_type => match slot {
                            Some(slot) => desc
                                .input(slot)
                                .is_some_and(|names| names.iter().any(|n| *n == arg.name)),
                            None => desc.input_names().any(|n| n == arg.name),
                        },
                        _ => false,
                    })
                })
            }
            Predicate::IsOpOutput { op_type, slot } => {
                let Some(arg) = node.as_arg() else {
                    return false;
                };
                node.inlinks.iter().any(|&producer| {
                    graph.node(producer).ok().is_some_and(|p| match &p.kind {
                        NodeKind::Op(desc) if desc.op_type == *op_type => match slot {
                            Some(slot) => desc
                                .output(slot)
                                .is_some_and(|names| names.iter().any(|n| *n == arg.name)),
                            None => desc.output_names().any(|n| n == arg.name),
                        },
                        _ => false,
                    })
                })
            }
            Predicate::HasAttr(name) => node.as_op().is_some_and(|d| d.attr(name).is_some()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Placeholder {
    pub name: String,
    pub kind: PlaceholderKind,
    pub predicates: Vec<Predicate>,
    pub role: Role,
}

/// Handle to a placeholder within one pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PNode(pub(crate) usize);

/// A declared subgraph shape: placeholders plus required producer->consumer
/// edges between them. Built once per fuser invocation and discarded after
/// its matches are processed.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub name: String,
    pub(crate) placeholders: Vec<Placeholder>,
    pub(crate) links: Vec<(PNode, PNode)>,
}

impl Pattern {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            placeholders: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn var_node(&mut self, name: impl Into<String>) -> PNodeRef<'_> {
        self.push(name.into(), PlaceholderKind::Var)
    }

    pub fn op_node(&mut self, name: impl Into<String>, op_type: &str) -> PNodeRef<'_> {
        let r = self.push(name.into(), PlaceholderKind::Op);
        r.assert_is_op(op_type)
    }

    fn push(&mut self, name: String, kind: PlaceholderKind) -> PNodeRef<'_> {
        self.placeholders.push(Placeholder {
            name,
            kind,
            predicates: Vec::new(),
            role: Role::default(),
        });
        let idx = self.placeholders.len() - 1;
        PNodeRef { pattern: self, idx }
    }

    /// Declares that `consumer` must receive an edge from each listed
    /// producer.
    pub fn links_from(&mut self, consumer: PNode, producers: &[PNode]) {
        for &p in producers {
            self.links.push((p, consumer));
        }
    }

    pub fn placeholder(&self, node: PNode) -> &Placeholder {
        &self.placeholders[node.0]
    }
}

/// Builder handle; chains predicate and role markers onto one placeholder.
pub struct PNodeRef<'a> {
    pattern: &'a mut Pattern,
    idx: usize,
}

impl<'a> PNodeRef<'a> {
    pub fn id(&self) -> PNode {
        PNode(self.idx)
    }

    fn add(self, pred: Predicate) -> Self {
        self.pattern.placeholders[self.idx].predicates.push(pred);
        self
    }

    pub fn assert_is_op(self, op_type: &str) -> Self {
        self.add(Predicate::IsOp(op_type.to_string()))
    }

    pub fn assert_is_op_input(self, op_type: &str, slot: Option<&str>) -> Self {
        self.add(Predicate::IsOpInput {
            op_type: op_type.to_string(),
            slot: slot.map(str::to_string),
        })
    }

    pub fn assert_is_op_output(self, op_type: &str, slot: Option<&str>) -> Self {
        self.add(Predicate::IsOpOutput {
            op_type: op_type.to_string(),
            slot: slot.map(str::to_string),
        })
    }

    pub fn assert_has_attr(self, name: &str) -> Self {
        self.add(Predicate::HasAttr(name.to_string()))
    }

    fn role(self, role: Role) -> Self {
        self.pattern.placeholders[self.idx].role = role;
        self
    }

    pub fn as_input(self) -> Self {
        self.role(Role::Input)
    }

    pub fn as_output(self) -> Self {
        self.role(Role::Output)
    }

    pub fn as_intermediate(self) -> Self {
        self.role(Role::Intermediate)
    }
}
