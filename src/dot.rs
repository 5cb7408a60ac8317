//! Graphviz rendering of the search DAG for visual inspection.
//!
//! One vertex per position, one labeled arc per realized move node.
//! Vertices are numbered in discovery order of a depth-first walk that
//! takes children in edge-index order, so the output is deterministic for
//! a given graph state. Transposed positions are drawn with a double
//! border and revisited rather than re-expanded, keeping the dump finite
//! on DAGs.

use std::collections::HashMap;
use std::fmt::Write;

use crate::node::{MoveNode, PositionNode};

/// Render the graph reachable from `root` as a Graphviz digraph. Moves
/// alternate point of view ply by ply when `as_opponent` is set for the
/// root's side.
pub fn graph_string(root: &MoveNode, as_opponent: bool) -> String {
    let mut out = String::from("digraph search {\n");
    out.push_str("  node [shape=box, fontname=\"Courier\"];\n");
    let mut ids: HashMap<*const PositionNode, usize> = HashMap::new();
    out.push_str(&format!("  head [label=\"{}\"];\n", arc_label(root)));
    if let Some(child) = root.child() {
        let id = vertex(&mut out, &mut ids, child, !as_opponent);
        let _ = writeln!(out, "  head -> p{id};");
    }
    out.push('}');
    out
}

/// Emit the vertex for `position` (and, recursively, everything below it)
/// unless it was already drawn; return its id either way.
fn vertex(
    out: &mut String,
    ids: &mut HashMap<*const PositionNode, usize>,
    position: &PositionNode,
    as_opponent: bool,
) -> usize {
    if let Some(&id) = ids.get(&(position as *const PositionNode)) {
        return id;
    }
    let id = ids.len();
    ids.insert(position as *const PositionNode, id);

    let peripheries = if position.is_transposition() { 2 } else { 1 };
    let _ = writeln!(
        out,
        "  p{id} [label=\"{}\", peripheries={peripheries}];",
        position_label(position),
    );
    for index in 0..position.num_edges() {
        if let Some(node) = position.get_child_at(index) {
            if let Some(child) = node.child() {
                let child_id = vertex(out, ids, child, !as_opponent);
                let _ = writeln!(
                    out,
                    "  p{id} -> p{child_id} [label=\"{} {}\"];",
                    node.mv(as_opponent),
                    arc_label(node),
                );
            } else {
                // Realized arc with no position yet: draw a stub leaf.
                let _ = writeln!(
                    out,
                    "  p{id}e{index} [label=\"{}\", style=dashed];",
                    arc_label(node),
                );
                let _ = writeln!(
                    out,
                    "  p{id} -> p{id}e{index} [label=\"{}\", style=dashed];",
                    node.mv(as_opponent),
                );
            }
        }
    }
    id
}

fn arc_label(node: &MoveNode) -> String {
    format!("N={} Q={:+.3} P={:.3}", node.n(), node.wl(), node.p())
}

fn position_label(position: &PositionNode) -> String {
    format!(
        "N={} WL={:+.3} D={:.2} M={:.1} E={}",
        position.n(),
        position.wl(),
        position.d(),
        position.m(),
        position.num_edges(),
    )
}
