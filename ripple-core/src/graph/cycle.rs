//! Cycle Detection
//!
//! Reachability walk used to reject edges that would close a cycle. It knows
//! nothing about how nodes are stored: callers supply a key function and a
//! neighbour function, so the same walk runs over `Arc` handles in the engine
//! and over plain adjacency maps in tests.

use std::collections::HashSet;
use std::hash::Hash;

/// Depth-first search from `start` following `neighbours`.
///
/// Returns `true` if a node whose key equals `target` is reached, including
/// `start` itself.
pub fn reaches<N, K, I>(
    start: N,
    target: K,
    key: impl Fn(&N) -> K,
    mut neighbours: impl FnMut(&N) -> I,
) -> bool
where
    K: Eq + Hash + Copy,
    I: IntoIterator<Item = N>,
{
    let mut visited = HashSet::new();
    let mut stack = vec![start];

    while let Some(node) = stack.pop() {
        let k = key(&node);
        if k == target {
            return true;
        }
        if !visited.insert(k) {
            continue;
        }
        stack.extend(neighbours(&node));
    }

    false
}
