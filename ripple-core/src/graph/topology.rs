//! Provenance Maintenance
//!
//! Every node's provenance set must equal its own ids plus the union of its
//! predecessors' sets. Edge edits break that, so after each edit the affected
//! subgraph is brought back in line:
//!
//! - adding an edge can only add ancestry, so the new ids are pushed down
//!   until a node already has them ([`widen_provenance`])
//! - removing an edge can drop ancestry, so the child and every descendant
//!   are recomputed in topological order ([`refresh_provenance`])
//!
//! [`reach`] walks the same successor edges to find every node a set of
//! inputs can wake.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::node::{Node, NodeId};
use super::source_set::SourceIdSet;

/// Union `extra` into `root` and every descendant that lacks it.
pub fn widen_provenance(root: &Arc<Node>, extra: &SourceIdSet) {
    let mut stack = vec![Arc::clone(root)];
    while let Some(node) = stack.pop() {
        // Descendants always hold a superset, so stop where nothing changed.
        if node.widen_sources(extra) {
            stack.extend(node.successors());
        }
    }
}

/// Recompute the provenance of `root` and all of its descendants.
pub fn refresh_provenance(root: &Arc<Node>) {
    for node in descendants_in_order(root) {
        node.recompute_sources();
    }
}

/// Ids of every node reachable from `inputs`, inputs included.
pub fn reach<'a>(inputs: impl IntoIterator<Item = &'a Arc<Node>>) -> SourceIdSet {
    let mut seen = HashSet::new();
    let mut stack: Vec<Arc<Node>> = inputs.into_iter().cloned().collect();

    while let Some(node) = stack.pop() {
        if seen.insert(node.id()) {
            stack.extend(node.successors());
        }
    }

    seen.into_iter().collect()
}

/// `root` and its descendants, parents before children.
///
/// Kahn's algorithm restricted to the subgraph below `root`; only edges
/// inside that subgraph count towards in-degree.
fn descendants_in_order(root: &Arc<Node>) -> Vec<Arc<Node>> {
    let mut members: HashMap<NodeId, Arc<Node>> = HashMap::new();
    let mut stack = vec![Arc::clone(root)];
    while let Some(node) = stack.pop() {
        if members.contains_key(&node.id()) {
            continue;
        }
        stack.extend(node.successors());
        members.insert(node.id(), node);
    }

    let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
    let mut queue = VecDeque::new();
    for (&id, node) in &members {
        let degree = node
            .predecessor_ids()
            .iter()
            .filter(|pred| members.contains_key(pred))
            .count();
        in_degree.insert(id, degree);
        if degree == 0 {
            queue.push_back(id);
        }
    }

    let mut ordered = Vec::with_capacity(members.len());
    while let Some(id) = queue.pop_front() {
        let Some(node) = members.get(&id) else {
            continue;
        };
        for succ in node.successor_ids() {
            if let Some(degree) = in_degree.get_mut(&succ) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    queue.push_back(succ);
                }
            }
        }
        ordered.push(Arc::clone(node));
    }

    ordered
}
