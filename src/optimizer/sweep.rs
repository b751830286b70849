use crate::ir::graph::Graph;

/// Drops nodes with no remaining edges. Fusers remove their matched regions
/// explicitly, so this normally finds nothing; it exists so a rewrite that
/// only relinks cannot leak detached nodes into later passes.
pub fn remove_unreferenced_nodes(graph: &mut Graph) -> usize {
    let orphans: Vec<_> = graph
        .node_ids()
        .filter(|&id| {
            graph
                .node(id)
                .is_ok_and(|n| n.inlinks.is_empty() && n.outlinks.is_empty())
        })
        .collect();
    if !orphans.is_empty() {
        log::trace!("sweeping {} unreferenced node(s)", orphans.len());
        // Degree-zero nodes cannot produce a dangling edge.
        let _ = graph.remove_node_set(&orphans);
    }
    orphans.len()
}
