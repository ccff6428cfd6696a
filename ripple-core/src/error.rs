//! Engine errors.

use thiserror::Error;

use crate::graph::NodeId;
use crate::propagation::TurnId;

/// Errors raised by the propagation engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Wiring `parent -> node` would make `node` reachable from itself.
    /// The edge is never committed.
    #[error("attaching {node} below {parent} would create a cycle")]
    CyclicGraph { node: NodeId, parent: NodeId },

    /// A node was nudged, pulsed or shifted by a turn it is not recorded
    /// as belonging to. This means the topological-order invariant broke.
    #[error("node {node} is owned by {found}, but {expected} tried to advance it")]
    InvalidTurnState {
        node: NodeId,
        expected: TurnId,
        found: TurnId,
    },

    /// The edge breaks a node-kind rule (inputs have no predecessors,
    /// effects have no successors).
    #[error("cannot attach {node} below {parent}: {reason}")]
    InvalidEdge {
        parent: NodeId,
        node: NodeId,
        reason: &'static str,
    },

    /// A queuing engine refused a shift whose new parent another in-flight
    /// turn can reach. The graph is left unchanged.
    #[error("shifting {node} below {parent} would join {turn} with in-flight {other}")]
    ShiftConflict {
        node: NodeId,
        parent: NodeId,
        turn: TurnId,
        other: TurnId,
    },

    /// The worker pool could not be started.
    #[error("thread pool error: {0}")]
    ThreadPool(String),

    /// Engine configuration could not be parsed.
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
