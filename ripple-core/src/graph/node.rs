//! Graph Nodes
//!
//! A node is one vertex of the propagation graph. It does not know what it
//! computes; its logic is an opaque [`NodeLogic`] supplied by the layer that
//! builds the graph. What the node does own is the bookkeeping the engine
//! needs to decide *when* that logic may run:
//!
//! - predecessor and successor edges (non-owning, `Weak`)
//! - a provenance set: its own source ids plus those of every ancestor
//! - per-turn state: flags, the tick threshold, and the id of the turn
//!   currently driving it
//!
//! # Locking
//!
//! Every node carries two independent locks:
//!
//! - the **nudge lock** (`parking_lot::FairMutex`) guards the per-turn state.
//!   Predecessors pulsing concurrently queue on it and are served in arrival
//!   order.
//! - the **shift lock** (`parking_lot::Mutex`) serializes structural changes
//!   where this node is the child: attach, detach, shift and destroy.
//!
//! Edge lists and provenance sets live behind short-lived `RwLock`s that are
//! never held while waiting on another lock of the same node. A call path
//! never holds both the nudge lock and the shift lock of one node.

use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{FairMutex, Mutex, RwLock};
use smallvec::SmallVec;

use super::cycle;
use super::source_set::SourceIdSet;
use super::topology;
use crate::error::{EngineError, Result};
use crate::propagation::{NodeLogic, Turn, TurnId};

/// Unique identifier for a node. Also serves as the node's source id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// The kind of node in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// An input node. Changes enter the graph here; it has no predecessors.
    Source,

    /// A computed node with predecessors and possibly successors.
    Derived,

    /// A leaf that produces side effects. It has no successors.
    Effect,
}

/// Per-turn flag word of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeFlags(u8);

impl NodeFlags {
    /// The node has been reached by the current turn.
    pub const VISITED: NodeFlags = NodeFlags(1 << 0);
    /// At least one predecessor changed value this turn.
    pub const UPDATED: NodeFlags = NodeFlags(1 << 1);
    /// An upstream edge was rewired this turn; the node's provenance set is
    /// stale until the turn drains.
    pub const INVALIDATED: NodeFlags = NodeFlags(1 << 2);

    pub const fn empty() -> Self {
        NodeFlags(0)
    }

    pub fn contains(self, other: NodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: NodeFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: NodeFlags) {
        self.0 &= !other.0;
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for NodeFlags {
    type Output = NodeFlags;

    fn bitor(self, rhs: NodeFlags) -> NodeFlags {
        NodeFlags(self.0 | rhs.0)
    }
}

/// Result of reparenting a node in the middle of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOutcome {
    /// The new parent is settled for this turn; the node may keep ticking.
    Ready,
    /// The new parent still owes a pulse. The node will be ticked again once
    /// it arrives.
    Pending,
}

/// Nodes that became eligible during a pulse.
pub type Wave = SmallVec<[Arc<Node>; 4]>;

type EdgeList = IndexMap<NodeId, Weak<Node>>;

/// Own source ids plus everything inherited from predecessors.
#[derive(Debug, Default)]
struct Provenance {
    own: SourceIdSet,
    all: SourceIdSet,
}

/// State guarded by the nudge lock.
#[derive(Debug)]
struct TurnState {
    turn: TurnId,
    flags: NodeFlags,
    /// Predecessor pulses still owed this turn.
    tick_threshold: i32,
    /// Handed to the scheduler; cleared only when a deferred tick releases it.
    claimed: bool,
    /// Threshold hit zero again while the node was still claimed.
    rearmed: bool,
    pulsed: bool,
}

impl TurnState {
    fn new() -> Self {
        Self {
            turn: TurnId::NONE,
            flags: NodeFlags::empty(),
            tick_threshold: 0,
            claimed: false,
            rearmed: false,
            pulsed: false,
        }
    }

    /// Reset for `turn` if this is the first time it is seen.
    fn begin(&mut self, turn: TurnId) -> bool {
        if self.turn == turn {
            return false;
        }
        *self = Self::new();
        self.turn = turn;
        self.flags = NodeFlags::VISITED;
        true
    }

    fn try_claim(&mut self) -> bool {
        if self.tick_threshold != 0 {
            return false;
        }
        if self.claimed {
            self.rearmed = true;
            false
        } else {
            self.claimed = true;
            true
        }
    }
}

/// A vertex of the propagation graph.
pub struct Node {
    id: NodeId,
    kind: NodeKind,
    logic: Box<dyn NodeLogic>,

    predecessors: RwLock<EdgeList>,
    successors: RwLock<EdgeList>,
    sources: RwLock<Provenance>,

    /// Notification lock.
    turn_state: FairMutex<TurnState>,
    /// Structural lock.
    shift_lock: Mutex<()>,

    /// Mirror of `turn_state.turn`, readable without the nudge lock.
    cur_turn: AtomicU64,
    /// Last turn whose pulse has snapshotted the successor list.
    last_pulsed: AtomicU64,
}

impl Node {
    /// Create a detached node. The engine's `on_node_create` hook must see
    /// it before it is wired into the graph.
    pub fn new(id: NodeId, kind: NodeKind, logic: Box<dyn NodeLogic>) -> Self {
        Self {
            id,
            kind,
            logic,
            predecessors: RwLock::new(EdgeList::new()),
            successors: RwLock::new(EdgeList::new()),
            sources: RwLock::new(Provenance::default()),
            turn_state: FairMutex::new(TurnState::new()),
            shift_lock: Mutex::new(()),
            cur_turn: AtomicU64::new(TurnId::NONE.raw()),
            last_pulsed: AtomicU64::new(TurnId::NONE.raw()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn logic(&self) -> &dyn NodeLogic {
        self.logic.as_ref()
    }

    /// Mark this node as (also) a source carrying `id`.
    ///
    /// The id is inherited by every current descendant.
    pub fn add_source_id(self: &Arc<Self>, id: NodeId) {
        let fresh = {
            let mut sources = self.sources.write();
            let fresh = sources.own.insert(id);
            sources.all.insert(id);
            fresh
        };
        if fresh {
            let extra: SourceIdSet = std::iter::once(id).collect();
            for succ in self.successors() {
                topology::widen_provenance(&succ, &extra);
            }
        }
    }

    /// Source ids attached directly to this node.
    pub fn own_sources(&self) -> SourceIdSet {
        self.sources.read().own.clone()
    }

    /// Source ids of this node and all of its ancestors.
    pub fn sources(&self) -> SourceIdSet {
        self.sources.read().all.clone()
    }

    /// Live predecessors, in attach order.
    pub fn predecessors(&self) -> Vec<Arc<Node>> {
        self.predecessors.read().values().filter_map(Weak::upgrade).collect()
    }

    /// Live successors, in attach order.
    pub fn successors(&self) -> Vec<Arc<Node>> {
        self.successors.read().values().filter_map(Weak::upgrade).collect()
    }

    pub fn predecessor_ids(&self) -> Vec<NodeId> {
        live_ids(&self.predecessors.read())
    }

    pub fn successor_ids(&self) -> Vec<NodeId> {
        live_ids(&self.successors.read())
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    /// Add the edge `self -> node`.
    ///
    /// Cycle checking is the caller's job (see [`Node::check_for_cycles`]).
    /// The child and its descendants inherit this node's provenance.
    pub fn attach_successor(self: &Arc<Self>, node: &Arc<Node>) {
        {
            let _structure = node.shift_lock.lock();
            let mut succ = self.successors.write();
            node.predecessors
                .write()
                .insert(self.id, Arc::downgrade(self));
            succ.insert(node.id, Arc::downgrade(node));
        }

        let inherited = self.sources();
        topology::widen_provenance(node, &inherited);
    }

    /// Remove the edge `self -> node` and recompute the child's provenance.
    pub fn detach_successor(&self, node: &Arc<Node>) {
        {
            let _structure = node.shift_lock.lock();
            let mut succ = self.successors.write();
            node.predecessors.write().shift_remove(&self.id);
            succ.shift_remove(&node.id);
        }

        topology::refresh_provenance(node);
    }

    /// Fail with [`EngineError::CyclicGraph`] if `start` is this node or one
    /// of its ancestors, i.e. if wiring `self -> start` would close a cycle.
    pub fn check_for_cycles(&self, start: NodeId) -> Result<()> {
        let cyclic = self.id == start
            || self.predecessors().into_iter().any(|pred| {
                cycle::reaches(pred, start, |n| n.id, |n| n.predecessors())
            });

        if cyclic {
            Err(EngineError::CyclicGraph {
                node: start,
                parent: self.id,
            })
        } else {
            Ok(())
        }
    }

    /// Atomically move the edge `old_parent -> self` to `new_parent -> self`
    /// while `turn` is processing this node.
    ///
    /// Concurrent nudges observe either the old or the new predecessor list,
    /// never a mix. The node is flagged `INVALIDATED` and recorded on the
    /// turn so its provenance is recomputed once the turn drains.
    ///
    /// The nudge lock and the shift lock are taken one after the other. The
    /// node is armed for one more pulse before the new edge becomes visible,
    /// so a nudge from `new_parent` can land as soon as the edge exists; the
    /// extra count is handed back if `new_parent` turns out to owe nothing.
    pub fn shift(
        self: &Arc<Self>,
        old_parent: &Arc<Node>,
        new_parent: &Arc<Node>,
        turn: &Turn,
    ) -> Result<ShiftOutcome> {
        {
            let mut state = self.turn_state.lock();
            if state.turn != turn.id() {
                return Err(self.wrong_turn(turn.id(), state.turn));
            }
            state.flags.insert(NodeFlags::INVALIDATED | NodeFlags::UPDATED);
            state.rearmed = false;
            state.tick_threshold += 1;
        }

        let pending = {
            let _structure = self.shift_lock.lock();
            old_parent.successors.write().shift_remove(&self.id);

            let mut succ = new_parent.successors.write();
            {
                let mut preds = self.predecessors.write();
                preds.shift_remove(&old_parent.id);
                preds.insert(new_parent.id, Arc::downgrade(new_parent));
            }
            succ.insert(self.id, Arc::downgrade(self));

            // `last_pulsed` is written under the same successor lock, so the
            // parent either already snapshotted us or will see us.
            new_parent.owes_pulse(turn)
                && new_parent.last_pulsed.load(Ordering::Acquire) != turn.id().raw()
        };

        let outcome = if pending {
            ShiftOutcome::Pending
        } else {
            self.turn_state.lock().tick_threshold -= 1;
            ShiftOutcome::Ready
        };

        let inherited = new_parent.sources();
        topology::widen_provenance(self, &inherited);
        turn.record_shift(self);

        Ok(outcome)
    }

    /// Detach from every neighbour.
    ///
    /// The caller guarantees no turn can still reach this node.
    pub fn destroy(&self) {
        let _structure = self.shift_lock.lock();

        let preds = std::mem::take(&mut *self.predecessors.write());
        for pred in preds.values().filter_map(Weak::upgrade) {
            pred.successors.write().shift_remove(&self.id);
        }

        let succs = std::mem::take(&mut *self.successors.write());
        for succ in succs.values().filter_map(Weak::upgrade) {
            {
                let _child = succ.shift_lock.lock();
                succ.predecessors.write().shift_remove(&self.id);
            }
            topology::refresh_provenance(&succ);
        }
    }

    // ------------------------------------------------------------------
    // Turn bookkeeping
    // ------------------------------------------------------------------

    /// Whether `turn` has already reached this node.
    pub fn is_dependency(&self, turn: &Turn) -> bool {
        self.current_turn() == turn.id()
    }

    /// Whether this node descends from one of the turn's sources.
    pub fn depends_on(&self, turn: &Turn) -> bool {
        self.sources.read().all.intersects(turn.sources())
    }

    /// Returns `true` exactly once per turn: the first time this node is
    /// asked. Flips the node into the `VISITED` state for that turn.
    ///
    /// The engine enters input nodes through this call. Derived nodes are
    /// entered by their first nudge instead, which also sets the threshold;
    /// logic layers may still use it as a once-per-turn guard of their own.
    pub fn check_current_turn(&self, turn: &Turn) -> bool {
        let mut state = self.turn_state.lock();
        let first = state.begin(turn.id());
        if first {
            self.cur_turn.store(turn.id().raw(), Ordering::Release);
        }
        first
    }

    /// Flags recorded for `turn`.
    pub fn flags_for(&self, turn: &Turn) -> Result<NodeFlags> {
        let state = self.turn_state.lock();
        if state.turn != turn.id() {
            return Err(self.wrong_turn(turn.id(), state.turn));
        }
        Ok(state.flags)
    }

    /// Deliver one predecessor pulse.
    ///
    /// The first nudge of a turn resets the node and sets its threshold to
    /// the number of predecessors that owe it a pulse. Returns `true` if this
    /// call made the node eligible to run.
    pub fn nudge(&self, turn: &Turn, update: bool, invalidate: bool) -> Result<bool> {
        let mut state = self.turn_state.lock();

        if state.begin(turn.id()) {
            self.cur_turn.store(turn.id().raw(), Ordering::Release);
            state.tick_threshold = self.count_owed_pulses(turn);
        }

        if update {
            state.flags.insert(NodeFlags::UPDATED);
        }
        if invalidate {
            state.flags.insert(NodeFlags::INVALIDATED);
        }

        state.tick_threshold -= 1;
        if state.tick_threshold < 0 || state.pulsed {
            return Err(self.wrong_turn(turn.id(), state.turn));
        }

        Ok(state.try_claim())
    }

    /// Notify every successor that this node has run.
    ///
    /// `updated` says whether this node's value changed. Returns the
    /// successors that became eligible; the engine decides whether each one
    /// ticks or idle-pulses.
    pub fn pulse(&self, turn: &Turn, updated: bool) -> Result<Wave> {
        let invalidate = {
            let mut state = self.turn_state.lock();
            if state.turn != turn.id() || state.pulsed {
                return Err(self.wrong_turn(turn.id(), state.turn));
            }
            state.pulsed = true;
            state.flags.contains(NodeFlags::INVALIDATED)
        };

        let targets: Wave = {
            let succ = self.successors.read();
            self.last_pulsed.store(turn.id().raw(), Ordering::Release);
            succ.values().filter_map(Weak::upgrade).collect()
        };

        let mut ready = Wave::new();
        for succ in targets {
            if succ.nudge(turn, updated, invalidate)? {
                ready.push(succ);
            }
        }
        Ok(ready)
    }

    /// First half of input registration: claim the node for `turn` and mark
    /// it updated. Returns `false` for a repeated registration.
    pub(crate) fn begin_input(&self, turn: &Turn) -> bool {
        let first = self.check_current_turn(turn);
        self.turn_state.lock().flags.insert(NodeFlags::UPDATED);
        first
    }

    /// Second half of input registration, once every input of the turn has
    /// been claimed. Returns `true` if no predecessor owes this node a pulse.
    pub(crate) fn arm_input(&self, turn: &Turn) -> Result<bool> {
        let mut state = self.turn_state.lock();
        if state.turn != turn.id() {
            return Err(self.wrong_turn(turn.id(), state.turn));
        }
        state.tick_threshold = self.count_owed_pulses(turn);
        Ok(state.try_claim())
    }

    /// Called after a tick that ended with a pending shift. Returns `true` if
    /// the awaited pulse already arrived and the node must tick again now.
    pub(crate) fn release_deferred(&self, turn: &Turn) -> Result<bool> {
        let mut state = self.turn_state.lock();
        if state.turn != turn.id() {
            return Err(self.wrong_turn(turn.id(), state.turn));
        }
        if state.rearmed {
            state.rearmed = false;
            Ok(true)
        } else {
            state.claimed = false;
            Ok(false)
        }
    }

    /// Will this node pulse (or has it pulsed) during `turn`?
    pub(crate) fn owes_pulse(&self, turn: &Turn) -> bool {
        self.is_dependency(turn) || self.depends_on(turn)
    }

    fn count_owed_pulses(&self, turn: &Turn) -> i32 {
        // Upgrade first: the last handle of a predecessor may drop here, and
        // its destructor writes to our edge list.
        let count = self
            .predecessors()
            .into_iter()
            .filter(|pred| pred.owes_pulse(turn))
            .count();
        i32::try_from(count).unwrap_or(i32::MAX)
    }

    fn current_turn(&self) -> TurnId {
        TurnId::from(self.cur_turn.load(Ordering::Acquire))
    }

    fn wrong_turn(&self, expected: TurnId, found: TurnId) -> EngineError {
        EngineError::InvalidTurnState {
            node: self.id,
            expected,
            found,
        }
    }

    // ------------------------------------------------------------------
    // Provenance maintenance (driven by `topology`)
    // ------------------------------------------------------------------

    /// Union `extra` into the inherited set. Returns `true` if it grew.
    pub(crate) fn widen_sources(&self, extra: &SourceIdSet) -> bool {
        let mut sources = self.sources.write();
        let before = sources.all.len();
        sources.all.extend_from(extra);
        sources.all.len() != before
    }

    /// Rebuild the inherited set from own ids and current predecessors.
    pub(crate) fn recompute_sources(&self) {
        let mut all = self.sources.read().own.clone();
        for pred in self.predecessors() {
            all.extend_from(&pred.sources.read().all);
        }
        self.sources.write().all = all;
    }
}

impl Drop for Node {
    /// Unlink from neighbours that outlive this node. A node released
    /// through [`Node::destroy`] has no edges left by now.
    fn drop(&mut self) {
        let preds = std::mem::take(self.predecessors.get_mut());
        for pred in preds.values().filter_map(Weak::upgrade) {
            pred.successors.write().shift_remove(&self.id);
        }

        let succs = std::mem::take(self.successors.get_mut());
        for succ in succs.values().filter_map(Weak::upgrade) {
            succ.predecessors.write().shift_remove(&self.id);
            topology::refresh_provenance(&succ);
        }
    }
}

fn live_ids(edges: &EdgeList) -> Vec<NodeId> {
    edges
        .iter()
        .filter(|(_, node)| node.strong_count() > 0)
        .map(|(&id, _)| id)
        .collect()
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("predecessors", &self.predecessor_ids())
            .field("successors", &self.successor_ids())
            .finish()
    }
}
