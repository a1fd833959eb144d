use std::cmp::Ordering;
use std::collections::HashSet;

use serde::Serialize;

use super::meta::FIRST_DATA_PAGE;
use super::page::{NodeKind, NodeView};
use super::tree::{TreeShared, MAX_TREE_HEIGHT};
use crate::storage::layout::Layout;
use crate::types::{PageId, Result};

/// Findings of a full walk over a tree.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    /// Levels from the root to the leaves.
    pub height: usize,
    /// Reachable leaf pages.
    pub leaf_pages: u64,
    /// Reachable internal pages.
    pub internal_pages: u64,
    /// Entries stored in leaves.
    pub entries: u64,
    /// Pages held by the allocator.
    pub free_pages: u64,
    /// Pages holding the durable free list.
    pub trunk_pages: u64,
    /// First page id never allocated.
    pub high_water: u64,
    /// Non-root nodes below the minimum fill.
    pub underfull_nodes: u64,
    /// Violations found, one line each.
    pub errors: Vec<String>,
}

impl ConsistencyReport {
    /// Returns true when no violation was found.
    pub fn is_consistent(&self) -> bool {
        self.errors.is_empty()
    }
}

struct Visit {
    id: PageId,
    low: Option<Vec<u8>>,
    high: Option<Vec<u8>>,
    depth: usize,
}

/// Walks the tree under the operation latch.
pub(crate) fn check<L: Layout>(shared: &TreeShared<L>) -> Result<ConsistencyReport> {
    let _serial = shared.checkpoint_lock.lock();
    let _op = shared.op_latch.lock();
    let layout = &shared.layout;
    let unstable = shared.clock.unstable();
    let mut report = ConsistencyReport::default();
    let mut seen = HashSet::new();
    let mut leaf_depth = None;
    let mut stack = vec![Visit {
        id: shared.root().id,
        low: None,
        high: None,
        depth: 1,
    }];

    while let Some(visit) = stack.pop() {
        let id = visit.id;
        if !seen.insert(id) {
            report.errors.push(format!("page {} reached twice", id.0));
            continue;
        }
        if visit.depth > MAX_TREE_HEIGHT {
            report.errors.push(format!("page {} deeper than {MAX_TREE_HEIGHT}", id.0));
            continue;
        }
        let page = shared.file.pin(id)?;
        let buf = page.read();
        let view = match NodeView::parse(&buf, shared.geometry) {
            Ok(view) => view,
            Err(err) => {
                report.errors.push(format!("page {}: {err}", id.0));
                continue;
            }
        };
        if let Some((successor, _)) = view.state().successor() {
            report
                .errors
                .push(format!("reachable page {} superseded by {}", id.0, successor.0));
        }
        if view.generation() > unstable {
            report.errors.push(format!(
                "page {} generation {} ahead of unstable {}",
                id.0,
                view.generation().0,
                unstable.0
            ));
        }
        if view.low_fence() != visit.low.as_deref() || view.high_fence() != visit.high.as_deref() {
            report
                .errors
                .push(format!("page {} fences disagree with parent separators", id.0));
        }
        for idx in 0..view.len() {
            let key = view.key(idx);
            if !view.covers(layout, key) {
                report.errors.push(format!("page {} key {idx} outside fences", id.0));
            }
            if idx > 0 && layout.compare_encoded(view.key(idx - 1), key) != Ordering::Less {
                report.errors.push(format!("page {} keys out of order at {idx}", id.0));
            }
        }
        let min_fill = shared
            .geometry
            .min_fill(view.kind(), shared.options.min_fill_percent);
        if visit.depth > 1 && view.len() < min_fill {
            report.underfull_nodes += 1;
        }

        match view.kind() {
            NodeKind::Leaf => {
                report.leaf_pages += 1;
                report.entries += view.len() as u64;
                match leaf_depth {
                    None => leaf_depth = Some(visit.depth),
                    Some(depth) if depth != visit.depth => {
                        report.errors.push(format!(
                            "leaf {} at depth {} instead of {depth}",
                            id.0, visit.depth
                        ));
                    }
                    Some(_) => {}
                }
            }
            NodeKind::Internal => {
                report.internal_pages += 1;
                for idx in (0..=view.len()).rev() {
                    let child = match view.child(idx) {
                        Ok(child) => child,
                        Err(err) => {
                            report.errors.push(format!("page {} child {idx}: {err}", id.0));
                            continue;
                        }
                    };
                    let low = if idx == 0 {
                        visit.low.clone()
                    } else {
                        Some(view.key(idx - 1).to_vec())
                    };
                    let high = if idx == view.len() {
                        visit.high.clone()
                    } else {
                        Some(view.key(idx).to_vec())
                    };
                    stack.push(Visit {
                        id: child,
                        low,
                        high,
                        depth: visit.depth + 1,
                    });
                }
            }
        }
    }
    report.height = leaf_depth.unwrap_or(0);

    let freelist = shared.freelist.lock();
    report.high_water = freelist.high_water();
    report.free_pages = freelist.len() as u64;
    report.trunk_pages = freelist.trunks().len() as u64;
    let mut accounted = seen.clone();
    for id in freelist.free_pages().chain(freelist.trunks().iter().copied()) {
        if id.0 < FIRST_DATA_PAGE || id.0 >= report.high_water {
            report.errors.push(format!("free page {} outside allocated range", id.0));
        }
        if !accounted.insert(id) {
            let what = if seen.contains(&id) { "reachable" } else { "already free" };
            report.errors.push(format!("free page {} is {what}", id.0));
        }
    }
    let allocated = report.high_water.saturating_sub(FIRST_DATA_PAGE);
    if accounted.len() as u64 != allocated {
        report.errors.push(format!(
            "{} pages accounted for out of {allocated} allocated",
            accounted.len()
        ));
    }
    Ok(report)
}
