//! Text dumps of a built map.

use crate::core::symbols::SymbolSource;
use crate::error::Result;
use crate::map::builder::GraphState;
use crate::map::node::{MemoryMapNode, NodeId};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

fn pretty_name(node: &MemoryMapNode, symbols: &dyn SymbolSource) -> String {
    node.type_id
        .and_then(|t| symbols.type_by_id(t))
        .map_or_else(|| "?".to_string(), |t| t.pretty_name().to_string())
}

/// Whether another node overlapping `node` is more probable. Ties go to
/// the older node.
fn shadowed(state: &GraphState, node: &MemoryMapNode) -> bool {
    state
        .vindex
        .objects_in_range(node.address, node.end)
        .iter()
        .filter(|e| e.node != node.id)
        .filter_map(|e| state.arena.get(e.node))
        .any(|o| o.probability > node.probability || (o.probability == node.probability && o.id < node.id))
}

/// One line per node in address order, skipping nodes shadowed by a more
/// probable overlapping node. Returns the number of lines written.
pub fn write_dump<W: Write>(state: &GraphState, symbols: &dyn SymbolSource, out: &mut W) -> Result<usize> {
    let mut nodes: Vec<&MemoryMapNode> = state.arena.iter().collect();
    nodes.sort_by_key(|n| (n.address, n.id));
    let mut lines = 0;
    for node in nodes {
        if shadowed(state, node) {
            continue;
        }
        writeln!(
            out,
            "0x{:016x} {:6} {:.4} 0x{:08x} \"{}\"",
            node.address,
            node.size,
            node.probability,
            node.type_id.map_or(0, |t| t.0),
            pretty_name(node, symbols)
        )?;
        lines += 1;
    }
    Ok(lines)
}

pub fn dump<P: AsRef<Path>>(state: &GraphState, symbols: &dyn SymbolSource, path: P) -> Result<usize> {
    let path = path.as_ref();
    let mut out = BufWriter::new(File::create(path)?);
    let lines = write_dump(state, symbols, &mut out)?;
    out.flush()?;
    info!(path = %path.display(), lines, "Memory map written");
    Ok(lines)
}

/// Indented child tree below `root`, `depth` levels deep. Nodes whose
/// candidate group is still open are marked `[!]`.
pub fn write_tree<W: Write>(
    state: &GraphState,
    symbols: &dyn SymbolSource,
    root: NodeId,
    depth: usize,
    out: &mut W,
) -> Result<()> {
    let mut stack = vec![(root, 0usize)];
    while let Some((id, level)) = stack.pop() {
        let Some(node) = state.arena.get(id) else {
            continue;
        };
        writeln!(
            out,
            "{} |-0x{:016x} {:.4} \"{}\" ({}){}",
            "\t".repeat(level),
            node.address,
            node.probability,
            state.arena.full_name(id),
            pretty_name(node, symbols),
            if node.has_pending_candidates() { " [!]" } else { "" }
        )?;
        if level < depth {
            stack.extend(node.children.iter().rev().map(|&c| (c, level + 1)));
        }
    }
    Ok(())
}

pub fn dump_tree<P: AsRef<Path>>(
    state: &GraphState,
    symbols: &dyn SymbolSource,
    root: NodeId,
    depth: usize,
    path: P,
) -> Result<()> {
    let mut out = BufWriter::new(File::create(path.as_ref())?);
    write_tree(state, symbols, root, depth, &mut out)?;
    out.flush()?;
    Ok(())
}
