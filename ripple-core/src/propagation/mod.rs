//! Turn-Based Propagation
//!
//! This module drives change through the graph one turn at a time.
//!
//! # Concepts
//!
//! ## Turns
//!
//! A turn is one atomic propagation wave, triggered by one or more inputs
//! changing together. It carries a provenance set: the source ids it
//! touched. Two turns whose provenance (and reach) do not overlap cannot
//! observe each other.
//!
//! ## Pulses and nudges
//!
//! When a node runs it *pulses*, which *nudges* each successor. A successor
//! runs once every predecessor that owes it a pulse this turn has nudged it.
//! Nodes reached only through unchanged values get an idle pulse: they do not
//! recompute, but still release their own successors.
//!
//! ## Shifts
//!
//! A node's logic may swap one of its dependencies for another mid-turn.
//! If the new dependency has not run yet, the node waits for it and ticks
//! again.

mod engine;
mod policy;
mod scheduler;
mod tick;
mod turn;

pub use engine::{BasicEngine, Engine, EngineCore, EngineStats, QueuingEngine};
pub use policy::{Admission, Queuing, Sequential, ShiftGuard, TurnPolicy};
pub use scheduler::TurnStats;
pub use tick::{logic_fn, FnLogic, NodeLogic, PulseListener, Tick, TickContext};
pub use turn::{Turn, TurnFlags, TurnId};
