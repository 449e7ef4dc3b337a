//! Comparison of two physical memory snapshots.
//!
//! [`diff_streams`] makes one pass over both streams and records every
//! granularity-aligned chunk that holds at least one differing byte.
//! Adjacent differing chunks are merged into one [`DiffEntry`]. The
//! resulting index is then matched against the nodes of two maps to tell
//! which typed objects changed.

use crate::config::DiffConfig;
use crate::core::data_type::TypeId;
use crate::core::symbols::SymbolSource;
use crate::error::{MapError, Result};
use crate::map::builder::GraphState;
use crate::map::node::NodeId;
use crate::rangetree::{AddressRangeTree, DiffEntry, DiffProperties};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Runs of differing physical bytes.
pub type DifferenceIndex = AddressRangeTree<DiffEntry, DiffProperties>;

/// Snapshot handed to diff progress callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiffProgress {
    pub compared: u64,
    pub total: u64,
    pub percent: f32,
}

pub type DiffProgressFn<'a> = &'a (dyn Fn(&DiffProgress) + Send + Sync);

/// Caller-side controls of one comparison.
#[derive(Clone, Default)]
pub struct DiffOptions<'a> {
    pub cancel: Option<CancellationToken>,
    pub progress: Option<DiffProgressFn<'a>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffReport {
    pub run_count: usize,
    /// Bytes inside differing chunks.
    pub differing_bytes: u64,
    pub total_compared: u64,
    pub cancelled: bool,
}

/// Read until `buf` is full or the stream ends.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Pending run of differing chunks.
#[derive(Debug, Default)]
struct RunBuilder {
    start: Option<u64>,
    end: u64,
}

impl RunBuilder {
    fn extend(&mut self, start: u64, end: u64) {
        self.start.get_or_insert(start);
        self.end = end;
    }

    fn flush(&mut self, index: &mut DifferenceIndex) {
        if let Some(start) = self.start.take() {
            index.insert(DiffEntry {
                start,
                length: self.end - start,
            });
        }
    }
}

fn percent(compared: u64, total: u64) -> f32 {
    if total == 0 {
        100.0
    } else {
        (compared as f64 * 100.0 / total as f64).min(100.0) as f32
    }
}

/// Compare two streams of physical memory from offset zero.
///
/// Comparison stops at the end of the shorter stream. `total` is only used
/// for progress reporting.
pub fn diff_streams<A: Read, B: Read>(
    mut a: A,
    mut b: B,
    total: u64,
    config: &DiffConfig,
    options: &DiffOptions<'_>,
) -> Result<(DifferenceIndex, DiffReport)> {
    let granularity = config.granularity;
    if granularity == 0 || config.block_size == 0 || config.block_size as u64 % granularity != 0 {
        return Err(MapError::InvalidConfig(format!(
            "diff granularity {granularity} must divide block size {}",
            config.block_size
        )));
    }
    let interval = Duration::from_millis(config.progress_interval_ms);
    info!(granularity, block_size = config.block_size, total, "Comparing physical memory");

    let mut index = DifferenceIndex::new();
    let mut run = RunBuilder::default();
    let mut buf_a = vec![0u8; config.block_size];
    let mut buf_b = vec![0u8; config.block_size];
    let mut offset = 0u64;
    let mut cancelled = false;
    let mut last_report = Instant::now();

    loop {
        if options.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            cancelled = true;
            break;
        }
        let na = fill(&mut a, &mut buf_a)?;
        let nb = fill(&mut b, &mut buf_b)?;
        let n = na.min(nb);
        if n == 0 {
            break;
        }

        for (i, (ca, cb)) in buf_a[..n]
            .chunks(granularity as usize)
            .zip(buf_b[..n].chunks(granularity as usize))
            .enumerate()
        {
            let chunk_start = offset + i as u64 * granularity;
            if ca != cb {
                run.extend(chunk_start, chunk_start + ca.len() as u64);
            } else {
                run.flush(&mut index);
            }
        }
        offset += n as u64;

        if let Some(report) = options.progress {
            if last_report.elapsed() >= interval {
                report(&DiffProgress {
                    compared: offset,
                    total,
                    percent: percent(offset, total),
                });
                last_report = Instant::now();
            }
        }
        if n < config.block_size {
            break;
        }
    }
    run.flush(&mut index);

    if let Some(report) = options.progress {
        report(&DiffProgress {
            compared: offset,
            total,
            percent: percent(offset, total),
        });
    }
    let props = index.properties();
    let report = DiffReport {
        run_count: props.run_count,
        differing_bytes: props.bytes,
        total_compared: offset,
        cancelled,
    };
    info!(
        runs = report.run_count,
        bytes = report.differing_bytes,
        compared = report.total_compared,
        cancelled,
        "Physical memory compared"
    );
    Ok((index, report))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// The other map holds the same type at the same address.
    ValueChanged,
    /// The other map holds something else there, or nothing.
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedObject {
    pub node: NodeId,
    pub address: u64,
    pub type_id: Option<TypeId>,
    pub type_name: String,
    pub kind: ChangeKind,
}

/// Per-type count of changed objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeChanges {
    pub type_name: String,
    pub value_changed: usize,
    pub replaced: usize,
}

/// Nodes of `this` whose physical bytes fall into a differing run, each
/// classified by what `other` holds at the same virtual address.
pub fn changed_objects(
    this: &GraphState,
    other: &GraphState,
    diff: &DifferenceIndex,
    symbols: &dyn SymbolSource,
) -> Vec<ChangedObject> {
    let runs: Vec<&DiffEntry> = diff.iter().collect();
    let mut changes: Vec<ChangedObject> = runs
        .par_iter()
        .flat_map_iter(|run| {
            let pieces = this.pindex.objects_in_range(run.start, run.start + run.length.max(1) - 1);
            pieces.into_iter().filter_map(|piece| {
                let node = this.arena.get(piece.node)?;
                let same = other
                    .vindex
                    .objects_at(node.address)
                    .iter()
                    .any(|e| e.start == node.address && e.type_hash == node.type_hash);
                let type_name = node
                    .type_id
                    .and_then(|t| symbols.type_by_id(t))
                    .map_or_else(|| node.name.clone(), |t| t.pretty_name().to_string());
                Some(ChangedObject {
                    node: node.id,
                    address: node.address,
                    type_id: node.type_id,
                    type_name,
                    kind: if same { ChangeKind::ValueChanged } else { ChangeKind::Replaced },
                })
            })
        })
        .collect();

    // A node spanning several runs is reported once.
    changes.sort_by_key(|c| (c.address, c.node));
    changes.dedup_by_key(|c| c.node);
    debug!(runs = runs.len(), changed = changes.len(), "Changed objects collected");
    changes
}

/// Aggregate changed objects per type.
pub fn changed_types(changes: &[ChangedObject]) -> BTreeMap<Option<TypeId>, TypeChanges> {
    let mut by_type: BTreeMap<Option<TypeId>, TypeChanges> = BTreeMap::new();
    for c in changes {
        let entry = by_type.entry(c.type_id).or_insert_with(|| TypeChanges {
            type_name: c.type_name.clone(),
            ..Default::default()
        });
        match c.kind {
            ChangeKind::ValueChanged => entry.value_changed += 1,
            ChangeKind::Replaced => entry.replaced += 1,
        }
    }
    by_type
}
