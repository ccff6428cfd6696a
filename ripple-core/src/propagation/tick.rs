//! Node Logic
//!
//! The engine never interprets what a node computes. The layer that builds
//! the graph hands each node a [`NodeLogic`]; the engine calls it when the
//! node is allowed to run and reads back whether the value changed.

use std::sync::Arc;

use crate::error::Result;
use crate::graph::{Node, NodeFlags, NodeId, ShiftOutcome};

use super::engine::EngineCore;
use super::policy::ShiftGuard;
use super::turn::{Turn, TurnId};

/// Outcome of running a node's computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The value changed; successors are pulsed as updated.
    Changed,
    /// Recomputed to the same value; successors get an idle pulse.
    Unchanged,
}

/// A node's computation, supplied by the graph-building layer.
pub trait NodeLogic: Send + Sync {
    /// Run the computation for the turn in `ctx`.
    fn tick(&self, ctx: &mut TickContext<'_>) -> Result<Tick>;
}

/// [`NodeLogic`] backed by a closure. Built with [`logic_fn`].
pub struct FnLogic<F>(F);

impl<F> NodeLogic for FnLogic<F>
where
    F: Fn(&mut TickContext<'_>) -> Result<Tick> + Send + Sync,
{
    fn tick(&self, ctx: &mut TickContext<'_>) -> Result<Tick> {
        (self.0)(ctx)
    }
}

/// Wrap a closure as node logic.
pub fn logic_fn<F>(f: F) -> FnLogic<F>
where
    F: Fn(&mut TickContext<'_>) -> Result<Tick> + Send + Sync,
{
    FnLogic(f)
}

/// Logic of input nodes. Their value is written before the turn is
/// submitted, so reaching them always counts as a change.
pub(crate) struct InputLogic;

impl NodeLogic for InputLogic {
    fn tick(&self, _ctx: &mut TickContext<'_>) -> Result<Tick> {
        Ok(Tick::Changed)
    }
}

/// Observer of every pulse the engine issues.
pub trait PulseListener: Send + Sync {
    fn on_pulse(&self, node: NodeId, turn: TurnId, updated: bool);
}

/// What a node's logic can see and do while it ticks.
pub struct TickContext<'a> {
    engine: &'a EngineCore,
    guard: &'a dyn ShiftGuard,
    node: &'a Arc<Node>,
    turn: &'a Turn,
    flags: NodeFlags,
    deferred: bool,
}

impl<'a> TickContext<'a> {
    pub(crate) fn new(
        engine: &'a EngineCore,
        guard: &'a dyn ShiftGuard,
        node: &'a Arc<Node>,
        turn: &'a Turn,
        flags: NodeFlags,
    ) -> Self {
        Self {
            engine,
            guard,
            node,
            turn,
            flags,
            deferred: false,
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        self.node
    }

    pub fn turn(&self) -> &Turn {
        self.turn
    }

    /// An upstream edge of this node was rewired during the current turn.
    pub fn is_invalidated(&self) -> bool {
        self.flags.contains(NodeFlags::INVALIDATED)
    }

    /// Swap the dependency on `old_parent` for one on `new_parent`.
    ///
    /// On [`ShiftOutcome::Pending`] the tick's result is discarded and the
    /// node is ticked again once `new_parent` has pulsed; the logic should
    /// return promptly. Shift at most once per tick.
    ///
    /// A queuing engine fails with `ShiftConflict` when another in-flight
    /// turn can reach `new_parent`; the graph is then left as it was.
    pub fn shift(&mut self, old_parent: &Arc<Node>, new_parent: &Arc<Node>) -> Result<ShiftOutcome> {
        let (engine, node, turn) = (self.engine, self.node, self.turn);
        let outcome = self.guard.guard_shift(turn, node, new_parent, &mut || {
            engine.on_node_shift(node, old_parent, new_parent, turn)
        })?;
        self.deferred = outcome == ShiftOutcome::Pending;
        self.flags.insert(NodeFlags::INVALIDATED);
        Ok(outcome)
    }

    pub(crate) fn is_deferred(&self) -> bool {
        self.deferred
    }
}
