//! Propagation Graph
//!
//! This module implements the node graph that turns walk.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes are computations (or inputs) registered by an outer layer
//! - Edges are dependencies: if B reads A, there is an edge from A to B
//!
//! # Design Decisions
//!
//! 1. Nodes are shared handles (`Arc<Node>`) owned by whoever built them.
//!    Edges hold `Weak` references, so neither the graph nor the engine
//!    decides when a node dies.
//!
//! 2. Each node carries a provenance set: its own id plus the ids of every
//!    ancestor. A turn uses it to tell which predecessors still owe a pulse,
//!    without a global topological sort.
//!
//! 3. Locking is per node rather than per graph, so unrelated subgraphs
//!    propagate and mutate concurrently.

mod cycle;
mod node;
mod source_set;
mod topology;

pub use cycle::reaches;
pub use node::{Node, NodeFlags, NodeId, NodeKind, ShiftOutcome, Wave};
pub use source_set::SourceIdSet;
pub use topology::{reach, refresh_provenance, widen_provenance};
