//! Reusable, reconfigurable rendezvous for the phase protocol.
//!
//! [`FlexiBarrier`] is a cyclic barrier built from a mutex, a condition
//! variable and a generation counter. The arrival that completes a round
//! resets the count, bumps the generation and wakes every waiter; it is
//! also told it was the *leader*, which the scheduler uses to elect exactly
//! one thread for the bookkeeping that follows each phase.
//!
//! Two extensions over a textbook barrier:
//!
//! - **Broadcast abort.** [`abort()`](FlexiBarrier::abort) releases every
//!   current waiter with [`BarrierError::Aborted`] and makes every later
//!   `wait()` fail the same way, so a failed thread can never leave its
//!   siblings blocked.
//! - **Stall diagnostic.** With a [`StallConfig`], a waiter that sits in
//!   one generation longer than the timeout logs a scheduler-stall warning
//!   and, under [`StallPolicy::Abort`], aborts the barrier.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::warn;

use crate::config::{StallConfig, StallPolicy};

// ── Errors ──────────────────────────────────────────────────────

/// Errors from [`FlexiBarrier`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BarrierError {
    /// The barrier was aborted; no further rounds will complete.
    #[error("barrier aborted")]
    Aborted,
    /// A waiter timed out and the stall policy is `Abort`.
    #[error(
        "scheduler stall on barrier '{barrier}': generation {generation} \
         has {arrived}/{participants} arrivals"
    )]
    Stalled {
        /// Barrier name.
        barrier: String,
        /// Generation that never completed.
        generation: u64,
        /// Arrivals seen before the timeout.
        arrived: usize,
        /// Configured participant count.
        participants: usize,
    },
    /// `configure()` was called while threads were waiting.
    #[error("cannot reconfigure barrier with {arrived} waiter(s) in progress")]
    WaitInProgress {
        /// Threads already waiting in the current generation.
        arrived: usize,
    },
}

// ── BarrierWaitResult ───────────────────────────────────────────

/// Outcome of one successful [`FlexiBarrier::wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarrierWaitResult {
    leader: bool,
    generation: u64,
}

impl BarrierWaitResult {
    /// Whether this caller's arrival completed the round.
    ///
    /// Exactly one waiter per generation sees `true`.
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// The generation this wait belonged to.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

// ── FlexiBarrier ────────────────────────────────────────────────

#[derive(Debug)]
struct BarrierState {
    participants: usize,
    arrived: usize,
    generation: u64,
    aborted: bool,
}

/// A cyclic barrier whose participant count can change between rounds.
#[derive(Debug)]
pub struct FlexiBarrier {
    name: String,
    state: Mutex<BarrierState>,
    released: Condvar,
    stall: Option<StallConfig>,
    stall_events: AtomicU64,
}

// Compile-time assertion: FlexiBarrier must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<FlexiBarrier>();
};

impl FlexiBarrier {
    /// Create a barrier for `participants` threads.
    pub fn new(name: impl Into<String>, participants: usize) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(BarrierState {
                participants,
                arrived: 0,
                generation: 0,
                aborted: false,
            }),
            released: Condvar::new(),
            stall: None,
            stall_events: AtomicU64::new(0),
        }
    }

    /// Enable the stall diagnostic.
    pub fn with_stall_detection(mut self, stall: StallConfig) -> Self {
        self.stall = Some(stall);
        self
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the participant count for the next round.
    pub fn configure(&self, participants: usize) -> Result<(), BarrierError> {
        let mut st = self.lock();
        if st.arrived > 0 {
            return Err(BarrierError::WaitInProgress {
                arrived: st.arrived,
            });
        }
        st.participants = participants;
        Ok(())
    }

    /// Block until every participant of the current generation has arrived.
    ///
    /// With zero or one participant this returns immediately as leader.
    pub fn wait(&self) -> Result<BarrierWaitResult, BarrierError> {
        let mut st = self.lock();
        if st.aborted {
            return Err(BarrierError::Aborted);
        }

        let generation = st.generation;
        st.arrived += 1;
        if st.arrived >= st.participants {
            st.arrived = 0;
            st.generation = st.generation.wrapping_add(1);
            drop(st);
            self.released.notify_all();
            return Ok(BarrierWaitResult {
                leader: true,
                generation,
            });
        }

        loop {
            st = match self.stall {
                None => self
                    .released
                    .wait(st)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(stall) => {
                    let (guard, timeout) = self
                        .released
                        .wait_timeout(st, stall.timeout)
                        .unwrap_or_else(PoisonError::into_inner);
                    let mut guard = guard;
                    if timeout.timed_out() && guard.generation == generation && !guard.aborted {
                        self.stall_events.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            barrier = %self.name,
                            generation,
                            arrived = guard.arrived,
                            participants = guard.participants,
                            "scheduler stall: barrier wait exceeded {:?}",
                            stall.timeout,
                        );
                        if stall.policy == StallPolicy::Abort {
                            let err = BarrierError::Stalled {
                                barrier: self.name.clone(),
                                generation,
                                arrived: guard.arrived,
                                participants: guard.participants,
                            };
                            guard.aborted = true;
                            drop(guard);
                            self.released.notify_all();
                            return Err(err);
                        }
                    }
                    guard
                }
            };

            // A completed round wins over a later abort.
            if st.generation != generation {
                return Ok(BarrierWaitResult {
                    leader: false,
                    generation,
                });
            }
            if st.aborted {
                return Err(BarrierError::Aborted);
            }
        }
    }

    /// Release every waiter with [`BarrierError::Aborted`] and fail all
    /// future waits. Idempotent.
    pub fn abort(&self) {
        let mut st = self.lock();
        if !st.aborted {
            st.aborted = true;
            drop(st);
            self.released.notify_all();
        }
    }

    /// Whether [`abort()`](Self::abort) has been called.
    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    /// Number of completed rounds.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Configured participant count.
    pub fn participants(&self) -> usize {
        self.lock().participants
    }

    /// Number of stall warnings emitted so far.
    pub fn stall_events(&self) -> u64 {
        self.stall_events.load(Ordering::Relaxed)
    }

    /// Barrier name, used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }
}
