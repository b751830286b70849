use std::collections::{HashMap, HashSet};

use crate::ir::graph::{Graph, NodeId};
use crate::pattern::{Pattern, PlaceholderKind, Role};

/// One occurrence of a pattern: placeholder name -> concrete node. Valid only
/// until the next graph mutation; never persisted across rewrites.
#[derive(Debug, Clone)]
pub struct MatchBinding {
    nodes: HashMap<String, NodeId>,
}

impl MatchBinding {
    pub fn get(&self, placeholder: &str) -> Option<NodeId> {
        self.nodes.get(placeholder).copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.nodes.iter().map(|(k, &v)| (k.as_str(), v))
    }
}

/// Enumerates every occurrence of `pattern` in `graph`.
///
/// Deterministic for a fixed graph: placeholders are tried in declaration
/// order and candidates in node-id order. Occurrences never share an operator
/// or intermediate node, so one pass cannot rewrite the same region twice;
/// boundary arguments may appear in several matches. An empty result is
/// normal, not an error.
pub fn find_all(graph: &Graph, pattern: &Pattern) -> Vec<MatchBinding> {
    let mut matches = Vec::new();
    let mut consumed: HashSet<NodeId> = HashSet::new();
    let mut assignment: Vec<Option<NodeId>> = vec![None; pattern.placeholders.len()];

    search(graph, pattern, 0, &mut assignment, &mut consumed, &mut matches);
    log::debug!(
        "pattern '{}' matched {} occurrence(s)",
        pattern.name,
        matches.len()
    );
    matches
}

fn search(
    graph: &Graph,
    pattern: &Pattern,
    depth: usize,
    assignment: &mut Vec<Option<NodeId>>,
    consumed: &mut HashSet<NodeId>,
    matches: &mut Vec<MatchBinding>,
) {
    if depth == pattern.placeholders.len() {
        let binding = MatchBinding {
            nodes: pattern
                .placeholders
                .iter()
                .enumerate()
                .map(|(i, p)| (p.name.clone(), assignment[i].unwrap()))
                .collect(),
        };
        for (i, p) in pattern.placeholders.iter().enumerate() {
            if exclusive(p.kind, p.role) {
                consumed.insert(assignment[i].unwrap());
            }
        }
        matches.push(binding);
        return;
    }

    let ids: Vec<NodeId> = graph.node_ids().collect();
    for id in ids {
        if !candidate_fits(graph, pattern, depth, id, assignment, consumed) {
            continue;
        }
        assignment[depth] = Some(id);
        search(graph, pattern, depth + 1, assignment, consumed, matches);
        assignment[depth] = None;
        // A match below may have consumed a node bound at a shallower depth;
        // no disjoint occurrence can complete under this partial assignment.
        let stale = (0..depth).any(|i| {
            let p = &pattern.placeholders[i];
            exclusive(p.kind, p.role)
                && assignment[i].is_some_and(|bound| consumed.contains(&bound))
        });
        if stale {
            return;
        }
    }
}

fn candidate_fits(
    graph: &Graph,
    pattern: &Pattern,
    depth: usize,
    id: NodeId,
    assignment: &[Option<NodeId>],
    consumed: &HashSet<NodeId>,
) -> bool {
    let placeholder = &pattern.placeholders[depth];
    let Ok(node) = graph.node(id) else {
        return false;
    };
    let kind_ok = match placeholder.kind {
        PlaceholderKind::Var => node.as_arg().is_some(),
        PlaceholderKind::Op => node.as_op().is_some(),
    };
    if !kind_ok {
        return false;
    }
    if exclusive(placeholder.kind, placeholder.role) && consumed.contains(&id) {
        return false;
    }
    // Bindings are injective.
    if assignment.iter().take(depth).any(|a| *a == Some(id)) {
        return false;
    }
    if !placeholder.predicates.iter().all(|p| p.eval(graph, id)) {
        return false;
    }
    // Link relations against already-bound neighbors.
    for &(producer, consumer) in &pattern.links {
        let (p_idx, c_idx) = (producer.0, consumer.0);
        let bound = |idx: usize| {
            if idx == depth {
                Some(id)
            } else {
                assignment.get(idx).copied().flatten()
            }
        };
        if let (Some(p_id), Some(c_id)) = (bound(p_idx), bound(c_idx)) {
            let has_edge = graph
                .node(c_id)
                .is_ok_and(|c| c.inlinks.contains(&p_id));
            if !has_edge {
                return false;
            }
        }
    }
    true
}

/// Operator and intermediate placeholders may appear in at most one match
/// per pass.
fn exclusive(kind: PlaceholderKind, role: Role) -> bool {
    kind == PlaceholderKind::Op || role == Role::Intermediate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::OpDesc;

    fn quant_graph(n: usize) -> Graph {
        let mut g = Graph::new();
        for i in 0..n {
            let x = g.add_arg(format!("x{i}"), false);
            let mut desc = OpDesc::new("fake_quantize_abs_max");
            desc.set_input("X", vec![format!("x{i}")]);
            desc.set_output("Out", vec![format!("x{i}_q")]);
            let q = g.add_op(desc);
            let out = g.add_arg(format!("x{i}_q"), false);
            g.link(x, q).unwrap();
            g.link(q, out).unwrap();
        }
        g
    }

    fn quant_pattern() -> Pattern {
        let mut p = Pattern::new("quant");
        let x = p
            .var_node("x")
            .assert_is_op_input("fake_quantize_abs_max", Some("X"))
            .id();
        let q = p.op_node("q", "fake_quantize_abs_max").id();
        let out = p
            .var_node("out")
            .assert_is_op_output("fake_quantize_abs_max", Some("Out"))
            .id();
        p.links_from(q, &[x]);
        p.links_from(out, &[q]);
        p
    }

    #[test]
    fn finds_every_occurrence_once() {
        let g = quant_graph(3);
        let matches = find_all(&g, &quant_pattern());
        assert_eq!(matches.len(), 3);
        let ops: Vec<NodeId> = matches.iter().map(|m| m.get("q").unwrap()).collect();
        let unique: HashSet<NodeId> = ops.iter().copied().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn no_match_is_empty_not_error() {
        let mut g = Graph::new();
        g.add_arg("a", false);
        assert!(find_all(&g, &quant_pattern()).is_empty());
    }

    #[test]
    fn slot_predicate_rejects_wrong_slot() {
        let mut g = Graph::new();
        let x = g.add_arg("x", false);
        let mut desc = OpDesc::new("fake_quantize_abs_max");
        desc.set_input("InScale", vec!["x".to_string()]);
        desc.set_output("Out", vec!["y".to_string()]);
        let q = g.add_op(desc);
        let y = g.add_arg("y", false);
        g.link(x, q).unwrap();
        g.link(q, y).unwrap();
        // `x` feeds the op at InScale, not X.
        assert!(find_all(&g, &quant_pattern()).is_empty());
    }

    #[test]
    fn link_constraint_rejects_unconnected_nodes() {
        let mut g = quant_graph(1);
        // A second quant op whose input arg belongs to the first chain by
        // name pattern but is not linked to it.
        let mut desc = OpDesc::new("fake_quantize_abs_max");
        desc.set_input("X", vec!["x0".to_string()]);
        desc.set_output("Out", vec!["stray".to_string()]);
        let q2 = g.add_op(desc);
        let stray = g.add_arg("stray", false);
        g.link(q2, stray).unwrap();
        let matches = find_all(&g, &quant_pattern());
        // Only the fully linked chain matches.
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn deterministic_order() {
        let g = quant_graph(2);
        let a = find_all(&g, &quant_pattern());
        let b = find_all(&g, &quant_pattern());
        let ids = |ms: &[MatchBinding]| -> Vec<NodeId> {
            ms.iter().map(|m| m.get("q").unwrap()).collect()
        };
        assert_eq!(ids(&a), ids(&b));
    }
}
