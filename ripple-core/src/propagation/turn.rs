//! Turns
//!
//! A turn is one atomic propagation wave. It is assembled by registering the
//! input nodes that changed, then handed to the engine, which consumes it.

use std::fmt;
use std::ops::BitOr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::graph::{Node, NodeId, SourceIdSet};

/// Unique, increasing identifier of a turn. Never reused within an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TurnId(u64);

impl TurnId {
    /// Marks a node no turn has reached yet.
    pub const NONE: TurnId = TurnId(0);

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TurnId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "turn#{}", self.0)
    }
}

/// Behavioural options of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TurnFlags(u32);

impl TurnFlags {
    pub const NONE: TurnFlags = TurnFlags(0);

    /// Never admit this turn alongside another one, even when provenance
    /// sets are disjoint.
    pub const EXCLUSIVE: TurnFlags = TurnFlags(1 << 0);

    pub fn contains(self, other: TurnFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TurnFlags {
    type Output = TurnFlags;

    fn bitor(self, rhs: TurnFlags) -> TurnFlags {
        TurnFlags(self.0 | rhs.0)
    }
}

/// One propagation wave.
pub struct Turn {
    id: TurnId,
    flags: TurnFlags,
    sources: SourceIdSet,
    inputs: Vec<Arc<Node>>,
    /// Nodes reparented during propagation; their provenance is refreshed
    /// once the turn drains.
    shifted: Mutex<Vec<Weak<Node>>>,
}

impl Turn {
    pub fn new(id: TurnId, flags: TurnFlags) -> Self {
        Self {
            id,
            flags,
            sources: SourceIdSet::new(),
            inputs: Vec::new(),
            shifted: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TurnId {
        self.id
    }

    pub fn flags(&self) -> TurnFlags {
        self.flags
    }

    /// The provenance set accumulated so far.
    pub fn sources(&self) -> &SourceIdSet {
        &self.sources
    }

    /// Record a touched source id.
    pub fn add_source_id(&mut self, id: NodeId) -> bool {
        self.sources.insert(id)
    }

    /// Input nodes registered on this turn, in registration order.
    pub fn inputs(&self) -> &[Arc<Node>] {
        &self.inputs
    }

    /// Register `node` as a root of this turn. Its own source ids join the
    /// provenance set. Returns `false` if it was already registered.
    pub(crate) fn add_input(&mut self, node: &Arc<Node>) -> bool {
        if self.inputs.iter().any(|input| input.id() == node.id()) {
            return false;
        }
        for id in node.own_sources().iter() {
            self.sources.insert(id);
        }
        self.inputs.push(Arc::clone(node));
        true
    }

    pub(crate) fn record_shift(&self, node: &Arc<Node>) {
        self.shifted.lock().push(Arc::downgrade(node));
    }

    pub(crate) fn take_shifted(&self) -> Vec<Arc<Node>> {
        std::mem::take(&mut *self.shifted.lock())
            .into_iter()
            .filter_map(|node| node.upgrade())
            .collect()
    }
}

impl fmt::Debug for Turn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Turn")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("sources", &self.sources)
            .field("inputs", &self.inputs.len())
            .finish()
    }
}
