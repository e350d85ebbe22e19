//! C5: EH-tree flattener (§4.5).
//!
//! Grounded on `bitcode.rs::Block`'s nested-container shape: a tree walked
//! alongside a linear byte stream, parent/child relationships resolved to
//! indices once the whole walk is finished rather than kept as pointers.
//! Here the tree is the function's exception-node arena and the stream is
//! its laid-out block sequence.

use crate::model::{ExnInfo, ExnNode, ExnNodeId, Function};

/// Root-to-`node` path, root first.
fn exn_path(function: &Function, node: ExnNodeId) -> Vec<ExnNodeId> {
    let mut path = Vec::new();
    let mut current = Some(node);
    while let Some(id) = current {
        path.push(id);
        current = function.exn_node(id).parent;
    }
    path.reverse();
    path
}

fn entry_block(node: &ExnNode) -> crate::model::BlockId {
    match node.info {
        ExnInfo::Catch { catch_entry, .. } => catch_entry,
        ExnInfo::Fault { fault_entry, .. } => fault_entry,
    }
}

/// Two nodes dispatch to the same runtime handler along their whole
/// ancestor chain (§3 "handle-equivalent").
fn handle_equivalent(function: &Function, a: Option<ExnNodeId>, b: Option<ExnNodeId>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(_), None) | (None, Some(_)) => false,
        (Some(a), Some(b)) => {
            let na = function.exn_node(a);
            let nb = function.exn_node(b);
            if na.depth != nb.depth {
                return false;
            }
            if entry_block(na) != entry_block(nb) {
                return false;
            }
            handle_equivalent(function, na.parent, nb.parent)
        }
    }
}

/// Ascend `a` and `b` to a common, handle-equivalent ancestor (§4.5
/// `commonParent`), used by the fall-through `regionsToPop` computation.
pub fn common_parent(
    function: &Function,
    mut a: Option<ExnNodeId>,
    mut b: Option<ExnNodeId>,
) -> Option<ExnNodeId> {
    let depth = |id: Option<ExnNodeId>| id.map_or(0, |id| function.exn_node(id).depth);
    while depth(a) > depth(b) {
        a = function.exn_node(a.unwrap()).parent;
    }
    while depth(b) > depth(a) {
        b = function.exn_node(b.unwrap()).parent;
    }
    while !handle_equivalent(function, a, b) {
        a = a.and_then(|id| function.exn_node(id).parent);
        b = b.and_then(|id| function.exn_node(id).parent);
    }
    a
}

fn shared_prefix_len(a: &[ExnNodeId], b: &[ExnNodeId]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// One EH region before it has been assigned a parent index (§3 "EH region
/// (derived)"). `parent` is the index of this region's parent in the same
/// `Vec<OpenRegion>` returned by [`flatten`], resolved once at sort time.
#[derive(Debug, Clone)]
pub struct OpenRegion {
    pub node: ExnNodeId,
    pub parent: Option<usize>,
    pub start: u32,
    pub past: u32,
}

/// Per-block driving input: its exception node (if any), its laid-out
/// start offset, its end (`past`) offset, and how many active regions its
/// emitted fall-through jump additionally exits (§4.3's `regionsToPop`).
pub struct BlockSpan {
    pub exn_node: Option<ExnNodeId>,
    pub start: u32,
    pub past: u32,
    pub regions_to_pop: u32,
}

/// Walk the laid-out block sequence, opening and closing EH regions as the
/// active exception-node path changes (§4.5 algorithm).
pub fn flatten(function: &Function, spans: &[BlockSpan]) -> Vec<OpenRegion> {
    let mut regions: Vec<OpenRegion> = Vec::new();
    // Stack of (node, region-index) pairs mirroring the path from the root.
    let mut active: Vec<(ExnNodeId, usize)> = Vec::new();
    let mut last_past = 0u32;

    for span in spans {
        last_past = span.past;
        let path = span.exn_node.map_or_else(Vec::new, |n| exn_path(function, n));
        let active_path: Vec<ExnNodeId> = active.iter().map(|(n, _)| *n).collect();
        let prefix = shared_prefix_len(&path, &active_path);

        while active.len() > prefix {
            let (_, idx) = active.pop().unwrap();
            regions[idx].past = span.start;
        }

        for &node in &path[prefix..] {
            let parent = active.last().map(|(_, idx)| *idx);
            let idx = regions.len();
            regions.push(OpenRegion {
                node,
                parent,
                start: span.start,
                past: span.start,
            });
            active.push((node, idx));
        }

        for _ in 0..span.regions_to_pop {
            if let Some((_, idx)) = active.pop() {
                regions[idx].past = span.past;
            } else {
                break;
            }
        }
    }

    while let Some((_, idx)) = active.pop() {
        regions[idx].past = last_past;
    }

    regions
}

/// §4.5 total order over flattened regions: by ascending start, then
/// descending past (wider region first at equal start), then ancestors
/// before descendants at equal start and past.
pub fn sort_key_less(function: &Function, regions: &[OpenRegion], a: usize, b: usize) -> bool {
    let ra = &regions[a];
    let rb = &regions[b];
    if ra.start != rb.start {
        return ra.start < rb.start;
    }
    if ra.past != rb.past {
        return ra.past > rb.past;
    }
    // Equal start and past: order ancestors before descendants.
    exn_path(function, rb.node).contains(&ra.node)
}
