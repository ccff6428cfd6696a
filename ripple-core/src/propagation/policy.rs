//! Turn Admission
//!
//! A policy decides when a submitted turn may start propagating.
//!
//! - [`Sequential`] runs one turn at a time, in submission order.
//! - [`Queuing`] runs turns side by side as long as they cannot meet: their
//!   provenance sets are disjoint and so is the set of nodes each can reach.
//!   A conflicting turn waits until every earlier conflicting turn is done;
//!   non-conflicting turns behind it may overtake it.
//!
//! Admission blocks the submitting thread only. Worker threads already
//! propagating other turns are never parked here.
//!
//! A shift can bring a node into the reach of a turn it was never admitted
//! alongside. Every shift therefore passes through [`ShiftGuard`]: `Queuing`
//! refuses one whose new parent another in-flight turn can reach, instead
//! of parking a worker until that turn ends.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, FairMutex, FairMutexGuard, Mutex};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::graph::{self, Node, ShiftOutcome, SourceIdSet};

use super::turn::{Turn, TurnFlags, TurnId};

/// Vets a shift made by `turn` before it is applied.
pub trait ShiftGuard: Send + Sync {
    /// Run `apply` if `turn` may wire `node` below `new_parent`.
    fn guard_shift(
        &self,
        turn: &Turn,
        node: &Arc<Node>,
        new_parent: &Arc<Node>,
        apply: &mut dyn FnMut() -> Result<ShiftOutcome>,
    ) -> Result<ShiftOutcome>;
}

/// Decides when turns may propagate.
pub trait TurnPolicy: ShiftGuard {
    /// Held for the whole propagation of one turn. Dropping it releases the
    /// turn's claim.
    type Permit<'a>
    where
        Self: 'a;

    fn new() -> Self;

    /// Block until `turn` may propagate.
    fn admit<'a>(&'a self, turn: &Turn) -> Self::Permit<'a>;
}

/// One turn at a time. The gate is a fair mutex, so turns enter in the
/// order they queued on it.
pub struct Sequential {
    gate: FairMutex<()>,
}

impl TurnPolicy for Sequential {
    type Permit<'a> = FairMutexGuard<'a, ()>;

    fn new() -> Self {
        Self {
            gate: FairMutex::new(()),
        }
    }

    fn admit<'a>(&'a self, _turn: &Turn) -> Self::Permit<'a> {
        self.gate.lock()
    }
}

impl ShiftGuard for Sequential {
    /// The running turn is the only one; nothing to collide with.
    fn guard_shift(
        &self,
        _turn: &Turn,
        _node: &Arc<Node>,
        _new_parent: &Arc<Node>,
        apply: &mut dyn FnMut() -> Result<ShiftOutcome>,
    ) -> Result<ShiftOutcome> {
        apply()
    }
}

/// What an admitted or waiting turn may touch.
#[derive(Debug, Clone)]
struct Claim {
    turn: TurnId,
    exclusive: bool,
    sources: SourceIdSet,
    inputs: Vec<Arc<Node>>,
    /// Node ids reachable from `inputs`. Recomputed under the admission lock
    /// while the turn waits, and frozen once it is admitted: every later
    /// shift is checked against it.
    reach: SourceIdSet,
}

impl Claim {
    fn for_turn(turn: &Turn) -> Self {
        let mut claim = Self {
            turn: turn.id(),
            exclusive: turn.flags().contains(TurnFlags::EXCLUSIVE),
            sources: turn.sources().clone(),
            inputs: turn.inputs().to_vec(),
            reach: SourceIdSet::new(),
        };
        claim.refresh_reach();
        claim
    }

    fn refresh_reach(&mut self) {
        self.reach = graph::reach(&self.inputs);
    }

    fn conflicts_with(&self, other: &Claim) -> bool {
        self.exclusive
            || other.exclusive
            || self.sources.intersects(&other.sources)
            || self.reach.intersects(&other.reach)
    }
}

#[derive(Debug, Default)]
struct Admissions {
    in_flight: Vec<Claim>,
    /// Arrival order.
    waiting: VecDeque<Claim>,
}

impl Admissions {
    /// Index of `turn` in `waiting` if it may start now.
    ///
    /// Waiting claims are re-walked first, since in-flight turns may have
    /// rewired the graph since they were queued.
    fn ready(&mut self, turn: TurnId) -> Option<usize> {
        for claim in self.waiting.iter_mut() {
            claim.refresh_reach();
        }
        let pos = self.waiting.iter().position(|c| c.turn == turn)?;
        let claim = &self.waiting[pos];

        let blocked = self.in_flight.iter().any(|c| c.conflicts_with(claim))
            || self.waiting.iter().take(pos).any(|c| c.conflicts_with(claim));

        (!blocked).then_some(pos)
    }
}

/// Concurrent admission of independent turns.
pub struct Queuing {
    state: Mutex<Admissions>,
    released: Condvar,
}

impl Queuing {
    /// Number of turns currently propagating.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    fn release(&self, turn: TurnId) {
        let mut state = self.state.lock();
        state.in_flight.retain(|c| c.turn != turn);
        drop(state);
        self.released.notify_all();
    }
}

impl TurnPolicy for Queuing {
    type Permit<'a> = Admission<'a>;

    fn new() -> Self {
        Self {
            state: Mutex::new(Admissions::default()),
            released: Condvar::new(),
        }
    }

    fn admit<'a>(&'a self, turn: &Turn) -> Admission<'a> {
        let mut state = self.state.lock();
        state.waiting.push_back(Claim::for_turn(turn));

        loop {
            if let Some(pos) = state.ready(turn.id()) {
                if let Some(claim) = state.waiting.remove(pos) {
                    state.in_flight.push(claim);
                }
                break;
            }
            debug!(turn = %turn.id(), "turn queued behind a conflicting turn");
            self.released.wait(&mut state);
        }

        let concurrent = state.in_flight.len();
        drop(state);
        // A removal from `waiting` can unblock turns queued behind this one.
        self.released.notify_all();

        debug!(turn = %turn.id(), concurrent, "turn admitted");
        Admission {
            queue: self,
            turn: turn.id(),
        }
    }
}

impl ShiftGuard for Queuing {
    /// Holds the admission lock across the shift, so no turn is admitted
    /// against a reach that is about to change.
    fn guard_shift(
        &self,
        turn: &Turn,
        node: &Arc<Node>,
        new_parent: &Arc<Node>,
        apply: &mut dyn FnMut() -> Result<ShiftOutcome>,
    ) -> Result<ShiftOutcome> {
        let state = self.state.lock();
        let other = state
            .in_flight
            .iter()
            .find(|c| c.turn != turn.id() && c.reach.contains(new_parent.id()));

        if let Some(other) = other {
            warn!(
                node = %node.id(),
                parent = %new_parent.id(),
                turn = %turn.id(),
                other = %other.turn,
                "shift refused: parent is reachable from another turn"
            );
            return Err(EngineError::ShiftConflict {
                node: node.id(),
                parent: new_parent.id(),
                turn: turn.id(),
                other: other.turn,
            });
        }

        apply()
    }
}

/// Permit of a turn admitted by [`Queuing`].
pub struct Admission<'a> {
    queue: &'a Queuing,
    turn: TurnId,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.queue.release(self.turn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Node, NodeId, NodeKind};
    use crate::propagation::{logic_fn, Tick};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn input(id: u64) -> Arc<Node> {
        let node = Arc::new(Node::new(
            NodeId::from(id),
            NodeKind::Source,
            Box::new(logic_fn(|_| Ok(Tick::Changed))),
        ));
        node.add_source_id(node.id());
        node
    }

    fn turn(id: u64, inputs: &[&Arc<Node>], flags: TurnFlags) -> Turn {
        let mut turn = Turn::new(TurnId::from(id), flags);
        for node in inputs {
            turn.add_input(node);
        }
        turn
    }

    #[test]
    fn disjoint_turns_run_together() {
        let queue = Queuing::new();
        let (a, b) = (input(1), input(2));
        let t1 = turn(1, &[&a], TurnFlags::NONE);
        let t2 = turn(2, &[&b], TurnFlags::NONE);

        let p1 = queue.admit(&t1);
        let p2 = queue.admit(&t2);
        assert_eq!(queue.in_flight(), 2);
        drop(p1);
        drop(p2);
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn shared_descendant_is_a_conflict() {
        let (a, b) = (input(1), input(2));
        let sink = input(3);
        a.attach_successor(&sink);
        b.attach_successor(&sink);

        let c1 = Claim::for_turn(&turn(1, &[&a], TurnFlags::NONE));
        let c2 = Claim::for_turn(&turn(2, &[&b], TurnFlags::NONE));
        assert!(c1.sources.is_disjoint(&c2.sources));
        assert!(c1.conflicts_with(&c2));
    }

    #[test]
    fn shift_into_foreign_reach_is_refused() {
        let queue = Queuing::new();
        let (a, b) = (input(1), input(2));
        let n = input(3);
        let x = input(4);
        a.attach_successor(&n);
        b.attach_successor(&x);

        let t1 = turn(1, &[&a], TurnFlags::NONE);
        let t2 = turn(2, &[&b], TurnFlags::NONE);
        let _p1 = queue.admit(&t1);
        let p2 = queue.admit(&t2);

        let mut applied = 0;
        let err = queue
            .guard_shift(&t1, &n, &x, &mut || {
                applied += 1;
                Ok(ShiftOutcome::Ready)
            })
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::ShiftConflict {
                node: n.id(),
                parent: x.id(),
                turn: t1.id(),
                other: t2.id(),
            }
        );

        drop(p2);
        let outcome = queue.guard_shift(&t1, &n, &x, &mut || {
            applied += 1;
            Ok(ShiftOutcome::Ready)
        });
        assert_eq!(outcome, Ok(ShiftOutcome::Ready));
        assert_eq!(applied, 1);
    }

    #[test]
    fn waiting_claim_sees_new_edges() {
        let (a, b) = (input(1), input(2));
        let sink = input(3);
        a.attach_successor(&sink);

        let mut admissions = Admissions::default();
        admissions.in_flight.push(Claim::for_turn(&turn(1, &[&a], TurnFlags::NONE)));
        admissions
            .waiting
            .push_back(Claim::for_turn(&turn(2, &[&b], TurnFlags::NONE)));
        assert_eq!(admissions.ready(TurnId::from(2)), Some(0));

        // b now shares a's descendant.
        b.attach_successor(&sink);
        assert_eq!(admissions.ready(TurnId::from(2)), None);
    }

    #[test]
    fn exclusive_conflicts_with_everything() {
        let (a, b) = (input(1), input(2));
        let c1 = Claim::for_turn(&turn(1, &[&a], TurnFlags::EXCLUSIVE));
        let c2 = Claim::for_turn(&turn(2, &[&b], TurnFlags::NONE));
        assert!(c1.conflicts_with(&c2));
        assert!(c2.conflicts_with(&c1));
    }

    #[test]
    fn overlapping_turn_waits_for_release() {
        let queue = Arc::new(Queuing::new());
        let a = input(1);
        let t1 = turn(1, &[&a], TurnFlags::NONE);
        let t2 = turn(2, &[&a], TurnFlags::NONE);

        let permit = queue.admit(&t1);
        let (tx, rx) = mpsc::channel();
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let _permit = queue.admit(&t2);
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(permit);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }
}
