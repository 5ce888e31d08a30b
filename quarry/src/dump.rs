//! Human-readable dump of the branching tree.

use std::io::{self, Write};

use crate::tree::{BranchingTree, NodeId, Successor};

fn format_value(value: f64) -> String {
    if value.is_finite() {
        format!("{value:.3}")
    } else {
        "inf".to_string()
    }
}

fn dump_node(
    tree: &BranchingTree,
    id: NodeId,
    depth: usize,
    out: &mut impl Write,
) -> io::Result<()> {
    let node = tree.node(id);
    let mut flags = String::new();
    for (set, mark) in [
        (node.sensitivity_performed, 'S'),
        (node.typed_minimization_performed, 'T'),
        (node.minimization_performed, 'M'),
        (node.bitshare_performed, 'B'),
        (node.closed, 'C'),
        (node.boundary_hit, '!'),
    ] {
        flags.push(if set { mark } else { '.' });
    }
    writeln!(
        out,
        "{:indent$}#{} {:?} [{}] false={} true={} sensitive_bits={}",
        "",
        node.guid,
        node.id,
        flags,
        format_value(node.best_value(false)),
        format_value(node.best_value(true)),
        node.sensitive_stdin_bits.len(),
        indent = depth * 2,
    )?;
    for direction in [false, true] {
        match node.successor(direction) {
            Successor::Node(child) => dump_node(tree, child, depth + 1, out)?,
            Successor::End(kind) => writeln!(
                out,
                "{:indent$}`{} {:?}",
                "",
                if direction { "true" } else { "false" },
                kind,
                indent = (depth + 1) * 2,
            )?,
            Successor::Unexplored => {}
        }
    }
    Ok(())
}

/// Write the whole tree, root first, one node per line. Flag marks:
/// sensitivity / typed / minimization / bitshare performed, closed,
/// boundary hit.
pub fn dump_tree(tree: &BranchingTree, out: &mut impl Write) -> io::Result<()> {
    match tree.root() {
        Some(root) => dump_node(tree, root, 0, out),
        None => writeln!(out, "(empty tree)"),
    }
}
