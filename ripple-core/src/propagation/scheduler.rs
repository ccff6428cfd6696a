//! Wave Scheduler
//!
//! Drains a turn's wavefront. Every node that becomes eligible is a task:
//! when a pulse wakes several successors, all but one are spawned on the
//! engine's rayon pool and the last continues on the current thread. The
//! `rayon::scope` returns once every task has finished, i.e. once nothing
//! in the turn is left to pulse.
//!
//! The first error aborts the wave: tasks that have not started yet return
//! without touching their node.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::graph::{Node, Wave};

use super::engine::EngineCore;
use super::policy::ShiftGuard;
use super::turn::{Turn, TurnId};

/// Summary of one propagated turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TurnStats {
    pub turn: TurnId,
    /// Nodes pulsed as changed.
    pub pulses: usize,
    /// Nodes pulsed as unchanged.
    pub idle_pulses: usize,
    /// Logic invocations, including re-ticks after a pending shift.
    pub ticks: usize,
    /// Ticks that ended waiting on a new parent.
    pub deferrals: usize,
}

#[derive(Debug, Default)]
pub(crate) struct WaveCounters {
    pulses: AtomicUsize,
    idle_pulses: AtomicUsize,
    ticks: AtomicUsize,
    deferrals: AtomicUsize,
}

impl WaveCounters {
    pub(crate) fn pulse(&self, updated: bool) {
        let counter = if updated {
            &self.pulses
        } else {
            &self.idle_pulses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn deferral(&self) {
        self.deferrals.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, turn: TurnId) -> TurnStats {
        TurnStats {
            turn,
            pulses: self.pulses.load(Ordering::Relaxed),
            idle_pulses: self.idle_pulses.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            deferrals: self.deferrals.load(Ordering::Relaxed),
        }
    }
}

struct WaveRun<'a> {
    engine: &'a EngineCore,
    guard: &'a dyn ShiftGuard,
    turn: &'a Turn,
    counters: WaveCounters,
    failed: AtomicBool,
    failure: Mutex<Option<EngineError>>,
}

impl<'a> WaveRun<'a> {
    fn new(engine: &'a EngineCore, guard: &'a dyn ShiftGuard, turn: &'a Turn) -> Self {
        Self {
            engine,
            guard,
            turn,
            counters: WaveCounters::default(),
            failed: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    fn fail(&self, err: EngineError) {
        self.failed.store(true, Ordering::Release);
        self.failure.lock().get_or_insert(err);
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn run<'s>(&'s self, scope: &rayon::Scope<'s>, node: Arc<Node>) {
        let mut current = Some(node);
        while let Some(node) = current.take() {
            if self.is_failed() {
                return;
            }
            let outcome = self
                .engine
                .process(self.guard, &node, self.turn, &self.counters);
            match outcome {
                Ok(mut next) => {
                    current = next.pop();
                    for other in next {
                        scope.spawn(move |scope| self.run(scope, other));
                    }
                }
                Err(err) => {
                    self.fail(err);
                    return;
                }
            }
        }
    }

    fn finish(self) -> Result<TurnStats> {
        match self.failure.into_inner() {
            Some(err) => Err(err),
            None => Ok(self.counters.snapshot(self.turn.id())),
        }
    }
}

/// Propagate from `seeds` on the engine's pool until the wave is exhausted.
pub(crate) fn drain_parallel(
    engine: &EngineCore,
    guard: &dyn ShiftGuard,
    pool: &rayon::ThreadPool,
    turn: &Turn,
    seeds: Wave,
) -> Result<TurnStats> {
    let run = WaveRun::new(engine, guard, turn);
    pool.scope(|scope| {
        for seed in seeds {
            let run = &run;
            scope.spawn(move |scope| run.run(scope, seed));
        }
    });
    run.finish()
}

/// Propagate from `seeds` on the calling thread, breadth first.
pub(crate) fn drain_sequential(
    engine: &EngineCore,
    guard: &dyn ShiftGuard,
    turn: &Turn,
    seeds: Wave,
) -> Result<TurnStats> {
    let counters = WaveCounters::default();
    let mut queue: VecDeque<Arc<Node>> = seeds.into_iter().collect();

    while let Some(node) = queue.pop_front() {
        queue.extend(engine.process(guard, &node, turn, &counters)?);
    }

    Ok(counters.snapshot(turn.id()))
}
