//! Ripple Core
//!
//! This crate provides the propagation engine underneath a reactive dataflow
//! library. It implements:
//!
//! - A node graph with per-node locking and cycle rejection
//! - Turns: atomic propagation waves with a source provenance set
//! - Topologically ordered, parallel pulse scheduling
//! - Dynamic reparenting of nodes while a turn is running
//! - Concurrent admission of independent turns
//!
//! What a node computes is not this crate's business. The layer that builds
//! signals and events supplies a [`NodeLogic`](propagation::NodeLogic) per
//! node and submits input changes as turns.
//!
//! # Architecture
//!
//! - `graph`: nodes, edges, provenance sets and cycle detection
//! - `propagation`: turns, engines, admission policies and the wave scheduler
//! - `config`: engine tunables
//! - `error`: the engine's error type
//!
//! # Example
//!
//! ```rust
//! use ripple_core::graph::NodeKind;
//! use ripple_core::propagation::{logic_fn, BasicEngine, Tick, TurnFlags};
//!
//! let engine = BasicEngine::new()?;
//!
//! let input = engine.create_input();
//! let doubled = engine.create_node(NodeKind::Derived, logic_fn(|_| Ok(Tick::Changed)));
//! engine.on_node_attach(&doubled, &input)?;
//!
//! // The combinator layer writes the new input value, then:
//! let stats = engine.run_turn(TurnFlags::NONE, &[&input])?;
//! assert_eq!(stats.pulses, 2);
//! # Ok::<(), ripple_core::EngineError>(())
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod propagation;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
