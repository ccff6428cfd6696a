//! Propagation Engine
//!
//! The engine observes the graph's lifecycle and drives turns from input
//! registration through full propagation.
//!
//! # How a turn runs
//!
//! 1. The caller creates a turn and registers each changed input with
//!    `on_turn_input_change`. This only fills the turn's provenance set.
//!
//! 2. `on_turn_propagate` asks the engine's [`TurnPolicy`] for admission.
//!    Once admitted, inputs are marked `UPDATED` for the turn and every input
//!    with no owing predecessor seeds the wave.
//!
//! 3. Each eligible node ticks (if updated) or idle-pulses (if not). A pulse
//!    nudges every successor; a successor becomes eligible when its tick
//!    threshold reaches zero, which enforces topological order without a
//!    sort.
//!
//! 4. The call returns after the wave is exhausted and the provenance of
//!    nodes shifted during the turn has been recomputed.
//!
//! # Variants
//!
//! [`BasicEngine`] admits one turn at a time. [`QueuingEngine`] admits turns
//! concurrently when they cannot meet. Node scheduling inside a turn is the
//! same for both.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::graph::{Node, NodeFlags, NodeId, NodeKind, ShiftOutcome, Wave};

use super::policy::{Queuing, Sequential, ShiftGuard, TurnPolicy};
use super::scheduler::{self, TurnStats, WaveCounters};
use super::tick::{InputLogic, NodeLogic, PulseListener, Tick, TickContext};
use super::turn::{Turn, TurnFlags, TurnId};

/// Engine that runs turns strictly one after another.
pub type BasicEngine = Engine<Sequential>;

/// Engine that runs independent turns concurrently.
pub type QueuingEngine = Engine<Queuing>;

/// Counters describing an engine's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub live_nodes: usize,
    pub turns_started: u64,
    pub turns_completed: u64,
}

/// State and hooks shared by every engine variant.
pub struct EngineCore {
    config: EngineConfig,
    pool: Option<rayon::ThreadPool>,

    next_node: AtomicU64,
    next_turn: AtomicU64,
    turns_started: AtomicU64,
    turns_completed: AtomicU64,

    /// Non-owning view of live nodes, for lookup and diagnostics.
    nodes: DashMap<NodeId, Weak<Node>>,
    /// Registry size after the last sweep of dead entries.
    swept_at: AtomicUsize,
    listener: RwLock<Option<Arc<dyn PulseListener>>>,
}

impl EngineCore {
    fn new(config: EngineConfig) -> Result<Self> {
        let pool = if config.parallel {
            Some(config.build_pool()?)
        } else {
            None
        };

        Ok(Self {
            config,
            pool,
            next_node: AtomicU64::new(1),
            next_turn: AtomicU64::new(1),
            turns_started: AtomicU64::new(0),
            turns_completed: AtomicU64::new(0),
            nodes: DashMap::new(),
            swept_at: AtomicUsize::new(0),
            listener: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn on_node_create(&self, node: &Arc<Node>) {
        node.add_source_id(node.id());
        self.nodes.insert(node.id(), Arc::downgrade(node));
        self.sweep_registry();
        trace!(node = %node.id(), kind = ?node.kind(), "node created");
    }

    /// Drop registry entries of nodes released without `destroy_node`.
    /// Runs each time the registry doubles, so creation stays amortized O(1).
    fn sweep_registry(&self) {
        const MIN_SWEEP: usize = 64;

        let len = self.nodes.len();
        let mark = self.swept_at.load(Ordering::Relaxed).max(MIN_SWEEP / 2);
        if len < mark * 2 {
            return;
        }
        self.nodes.retain(|_, node| node.strong_count() > 0);
        let live = self.nodes.len();
        self.swept_at.store(live, Ordering::Relaxed);
        trace!(before = len, live, "node registry swept");
    }

    pub fn on_node_destroy(&self, node: &Node) {
        self.nodes.remove(&node.id());
        trace!(node = %node.id(), "node destroyed");
    }

    /// Wire `parent -> node`. Fails, leaving the graph untouched, if the
    /// edge would close a cycle or break a node-kind rule.
    pub fn on_node_attach(&self, node: &Arc<Node>, parent: &Arc<Node>) -> Result<()> {
        check_kinds(node, parent)?;
        parent.check_for_cycles(node.id())?;
        parent.attach_successor(node);
        debug!(parent = %parent.id(), node = %node.id(), "edge attached");
        Ok(())
    }

    pub fn on_node_detach(&self, node: &Arc<Node>, parent: &Arc<Node>) {
        parent.detach_successor(node);
        debug!(parent = %parent.id(), node = %node.id(), "edge detached");
    }

    /// Register `node` as a changed input of `turn`.
    ///
    /// Node state is left alone until the turn is admitted, since a
    /// conflicting turn may still be propagating through it.
    pub fn on_turn_input_change(&self, node: &Arc<Node>, turn: &mut Turn) {
        if turn.add_input(node) {
            trace!(node = %node.id(), turn = %turn.id(), "input registered");
        }
    }

    /// Pulse `node` as changed; returns the successors it made eligible.
    pub fn on_node_pulse(&self, node: &Arc<Node>, turn: &Turn) -> Result<Wave> {
        self.notify(node, turn, true);
        node.pulse(turn, true)
    }

    /// Pulse `node` as visited but unchanged.
    pub fn on_node_idle_pulse(&self, node: &Arc<Node>, turn: &Turn) -> Result<Wave> {
        self.notify(node, turn, false);
        node.pulse(turn, false)
    }

    /// Move `node`'s dependency from `old_parent` to `new_parent` while
    /// `turn` is running it. The new edge is checked for cycles first.
    ///
    /// This bypasses the admission policy; engines route shifts through
    /// their policy's [`ShiftGuard`] before landing here.
    pub fn on_node_shift(
        &self,
        node: &Arc<Node>,
        old_parent: &Arc<Node>,
        new_parent: &Arc<Node>,
        turn: &Turn,
    ) -> Result<ShiftOutcome> {
        check_kinds(node, new_parent)?;
        new_parent.check_for_cycles(node.id())?;
        let outcome = node.shift(old_parent, new_parent, turn)?;
        debug!(
            node = %node.id(),
            from = %old_parent.id(),
            to = %new_parent.id(),
            turn = %turn.id(),
            ?outcome,
            "node shifted"
        );
        Ok(outcome)
    }

    fn notify(&self, node: &Node, turn: &Turn, updated: bool) {
        trace!(node = %node.id(), turn = %turn.id(), updated, "pulse");
        if let Some(listener) = self.listener.read().as_ref() {
            listener.on_pulse(node.id(), turn.id(), updated);
        }
    }

    /// Run one eligible node and return the successors it woke.
    pub(crate) fn process(
        &self,
        guard: &dyn ShiftGuard,
        node: &Arc<Node>,
        turn: &Turn,
        counters: &WaveCounters,
    ) -> Result<Wave> {
        loop {
            let flags = node.flags_for(turn)?;
            if !flags.contains(NodeFlags::UPDATED) {
                counters.pulse(false);
                return self.on_node_idle_pulse(node, turn);
            }

            let mut ctx = TickContext::new(self, guard, node, turn, flags);
            counters.tick();
            let tick = node.logic().tick(&mut ctx)?;

            if ctx.is_deferred() {
                counters.deferral();
                if node.release_deferred(turn)? {
                    continue;
                }
                return Ok(Wave::new());
            }

            let updated = tick == Tick::Changed;
            counters.pulse(updated);
            return if updated {
                self.on_node_pulse(node, turn)
            } else {
                self.on_node_idle_pulse(node, turn)
            };
        }
    }

    /// Propagate an admitted turn to completion.
    fn propagate(&self, guard: &dyn ShiftGuard, turn: &Turn) -> Result<TurnStats> {
        self.turns_started.fetch_add(1, Ordering::Relaxed);
        for input in turn.inputs() {
            input.begin_input(turn);
        }
        let mut seeds = Wave::new();
        for input in turn.inputs() {
            if input.arm_input(turn)? {
                seeds.push(Arc::clone(input));
            }
        }

        let stats = match &self.pool {
            Some(pool) => scheduler::drain_parallel(self, guard, pool, turn, seeds),
            None => scheduler::drain_sequential(self, guard, turn, seeds),
        };

        let stats = match stats {
            Ok(stats) => stats,
            Err(err) => {
                warn!(turn = %turn.id(), error = %err, "turn aborted");
                return Err(err);
            }
        };

        for node in turn.take_shifted() {
            crate::graph::refresh_provenance(&node);
        }

        self.turns_completed.fetch_add(1, Ordering::Relaxed);
        debug!(
            turn = %turn.id(),
            pulses = stats.pulses,
            idle = stats.idle_pulses,
            ticks = stats.ticks,
            "turn complete"
        );
        Ok(stats)
    }
}

fn check_kinds(node: &Node, parent: &Node) -> Result<()> {
    let reason = if parent.kind() == NodeKind::Effect {
        "effect nodes have no successors"
    } else if node.kind() == NodeKind::Source {
        "source nodes have no predecessors"
    } else {
        return Ok(());
    };

    Err(EngineError::InvalidEdge {
        parent: parent.id(),
        node: node.id(),
        reason,
    })
}

/// A propagation engine parameterised by its turn admission policy.
pub struct Engine<P: TurnPolicy> {
    core: EngineCore,
    policy: P,
}

impl<P: TurnPolicy> Engine<P> {
    /// Engine with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        Ok(Self {
            core: EngineCore::new(config)?,
            policy: P::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        self.core.config()
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Observe every pulse. Replaces any previous listener.
    pub fn set_listener(&self, listener: Arc<dyn PulseListener>) {
        *self.core.listener.write() = Some(listener);
    }

    // ------------------------------------------------------------------
    // Graph lifecycle
    // ------------------------------------------------------------------

    /// Allocate a node with a fresh id and register it.
    pub fn create_node(&self, kind: NodeKind, logic: impl NodeLogic + 'static) -> Arc<Node> {
        let id = NodeId::from(self.core.next_node.fetch_add(1, Ordering::Relaxed));
        let node = Arc::new(Node::new(id, kind, Box::new(logic)));
        self.on_node_create(&node);
        node
    }

    /// Allocate an input node.
    pub fn create_input(&self) -> Arc<Node> {
        self.create_node(NodeKind::Source, InputLogic)
    }

    /// Detach `node` from the graph and forget it.
    pub fn destroy_node(&self, node: &Arc<Node>) {
        node.destroy();
        self.on_node_destroy(node);
    }

    /// Look up a live node by id.
    pub fn node(&self, id: NodeId) -> Option<Arc<Node>> {
        let node = self.core.nodes.get(&id).and_then(|entry| entry.value().upgrade());
        if node.is_none() {
            self.core.nodes.remove_if(&id, |_, weak| weak.strong_count() == 0);
        }
        node
    }

    pub fn on_node_create(&self, node: &Arc<Node>) {
        self.core.on_node_create(node);
    }

    pub fn on_node_destroy(&self, node: &Node) {
        self.core.on_node_destroy(node);
    }

    pub fn on_node_attach(&self, node: &Arc<Node>, parent: &Arc<Node>) -> Result<()> {
        self.core.on_node_attach(node, parent)
    }

    pub fn on_node_detach(&self, node: &Arc<Node>, parent: &Arc<Node>) {
        self.core.on_node_detach(node, parent);
    }

    /// Shift through the admission policy, which may refuse it.
    pub fn on_node_shift(
        &self,
        node: &Arc<Node>,
        old_parent: &Arc<Node>,
        new_parent: &Arc<Node>,
        turn: &Turn,
    ) -> Result<ShiftOutcome> {
        self.policy.guard_shift(turn, node, new_parent, &mut || {
            self.core.on_node_shift(node, old_parent, new_parent, turn)
        })
    }

    // ------------------------------------------------------------------
    // Turns
    // ------------------------------------------------------------------

    /// Start assembling a turn with the next identifier.
    pub fn new_turn(&self, flags: TurnFlags) -> Turn {
        let id = TurnId::from(self.core.next_turn.fetch_add(1, Ordering::Relaxed));
        Turn::new(id, flags)
    }

    pub fn on_turn_input_change(&self, node: &Arc<Node>, turn: &mut Turn) {
        self.core.on_turn_input_change(node, turn);
    }

    /// Wait for admission, then propagate `turn` until its wave settles.
    pub fn on_turn_propagate(&self, turn: Turn) -> Result<TurnStats> {
        let _permit = self.policy.admit(&turn);
        self.core.propagate(&self.policy, &turn)
    }

    pub fn on_node_pulse(&self, node: &Arc<Node>, turn: &Turn) -> Result<Wave> {
        self.core.on_node_pulse(node, turn)
    }

    pub fn on_node_idle_pulse(&self, node: &Arc<Node>, turn: &Turn) -> Result<Wave> {
        self.core.on_node_idle_pulse(node, turn)
    }

    /// Build, fill and propagate a turn in one call.
    pub fn run_turn(&self, flags: TurnFlags, inputs: &[&Arc<Node>]) -> Result<TurnStats> {
        let mut turn = self.new_turn(flags);
        for input in inputs {
            self.on_turn_input_change(input, &mut turn);
        }
        self.on_turn_propagate(turn)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            live_nodes: self
                .core
                .nodes
                .iter()
                .filter(|entry| entry.value().strong_count() > 0)
                .count(),
            turns_started: self.core.turns_started.load(Ordering::Relaxed),
            turns_completed: self.core.turns_completed.load(Ordering::Relaxed),
        }
    }
}
