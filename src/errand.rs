//! Cooperative errand scheduler.
//!
//! spec.md §9 names the errand as a first-class abstraction —
//! `Errand { deadline, predicate, step }` living in a sorted pending set,
//! with a thin runtime popping ready entries — and §5 describes the
//! scheduling model it serves: a single event loop, no preemption between
//! errand bodies, interrupts delivered as IPC that may land between any
//! two bodies. This module gives that abstraction a concrete shape,
//! generalizing the queued-operation bookkeeping style of
//! `examples/RedHatOnTop-kernel-performed-illegal-operation/kernel/src/io/executor.rs`
//! to deadline-driven polling rather than a flat process-and-complete loop.

use alloc::boxed::Box;
use alloc::collections::BinaryHeap;
use core::cmp::Ordering;

/// Monotonic microsecond time source. Supplied externally — a `no_std`
/// driver core has no wall-clock access of its own.
pub trait Clock {
    fn now_us(&self) -> u64;
}

/// Outcome of one [`Poll`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate became true.
    Ready,
    /// Not yet true; budget remains.
    Pending,
    /// Budget exhausted before the predicate became true.
    TimedOut,
}

/// The `poll(interval, budget, predicate)` primitive `initialize`'s
/// bring-up chain is built from (spec §4.5): re-check `predicate` no more
/// often than every `interval_us`, give up once `budget_us` has elapsed
/// since the poll began.
pub struct Poll<F: FnMut() -> bool> {
    interval_us: u64,
    deadline_us: u64,
    next_check_us: u64,
    predicate: F,
}

impl<F: FnMut() -> bool> Poll<F> {
    pub fn new(clock: &dyn Clock, interval_us: u64, budget_us: u64, predicate: F) -> Self {
        let now = clock.now_us();
        Self {
            interval_us,
            deadline_us: now + budget_us,
            next_check_us: now,
            predicate,
        }
    }

    /// Evaluate the predicate if `interval_us` has elapsed since the last
    /// check; otherwise report `Pending` without touching it. Never blocks.
    pub fn step(&mut self, clock: &dyn Clock) -> PollOutcome {
        let now = clock.now_us();
        if now < self.next_check_us {
            return PollOutcome::Pending;
        }
        if (self.predicate)() {
            return PollOutcome::Ready;
        }
        if now >= self.deadline_us {
            return PollOutcome::TimedOut;
        }
        self.next_check_us = now + self.interval_us;
        PollOutcome::Pending
    }

    /// Run to completion by repeatedly stepping with the caller-supplied
    /// clock, useful in tests where the clock advances synchronously with
    /// each check rather than through a real event loop.
    pub fn run_to_completion(&mut self, clock: &dyn Clock, mut advance: impl FnMut()) -> PollOutcome {
        loop {
            match self.step(clock) {
                PollOutcome::Pending => advance(),
                outcome => return outcome,
            }
        }
    }
}

/// Result of stepping a scheduled continuation.
pub enum StepResult {
    /// The errand is finished.
    Done,
    /// Re-run this same continuation after `delay_us` more microseconds.
    Reschedule(u64),
    /// Replace this continuation with the next stage of a multi-step
    /// errand (e.g. `initialize`'s clear-bit -> poll -> clear-bit -> poll
    /// chain), due immediately.
    Chain(Box<dyn Continuation>),
}

/// One deferred unit of work. Implementors hold whatever state a single
/// errand body needs (a `Poll`, a port index, ...).
pub trait Continuation {
    fn step(&mut self, now_us: u64) -> StepResult;
}

struct Entry {
    due_us: u64,
    seq: u64,
    cont: Box<dyn Continuation>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due_us == other.due_us && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the earliest due time first.
        other.due_us.cmp(&self.due_us).then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of pending continuations keyed by due time. The single
/// event loop calls `run_ready` whenever it is idle (between IPC waits).
pub struct Scheduler {
    pending: BinaryHeap<Entry>,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            pending: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Schedule `cont` to run `delay_us` microseconds from `now_us`.
    pub fn schedule(&mut self, now_us: u64, delay_us: u64, cont: Box<dyn Continuation>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(Entry {
            due_us: now_us + delay_us,
            seq,
            cont,
        });
    }

    /// Pop and run every continuation whose due time has arrived,
    /// following `Reschedule`/`Chain` results until nothing more is ready.
    /// Returns the number of `step` invocations performed.
    pub fn run_ready(&mut self, now_us: u64) -> usize {
        let mut steps = 0;
        loop {
            let Some(top) = self.pending.peek() else {
                break;
            };
            if top.due_us > now_us {
                break;
            }
            let mut entry = self.pending.pop().unwrap();
            steps += 1;
            match entry.cont.step(now_us) {
                StepResult::Done => {}
                StepResult::Reschedule(delay_us) => {
                    entry.due_us = now_us + delay_us;
                    self.pending.push(entry);
                }
                StepResult::Chain(next) => {
                    entry.cont = next;
                    entry.due_us = now_us;
                    self.pending.push(entry);
                }
            }
        }
        steps
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct FakeClock {
        now: Cell<u64>,
    }
    impl Clock for FakeClock {
        fn now_us(&self) -> u64 {
            self.now.get()
        }
    }

    #[test]
    fn poll_reaches_ready_before_budget() {
        let clock = FakeClock { now: Cell::new(0) };
        let mut tries = 0;
        let mut poll = Poll::new(&clock, 10, 50_000, move || {
            tries += 1;
            tries >= 3
        });
        let outcome = poll.run_to_completion(&clock, || {
            clock.now.set(clock.now.get() + 10);
        });
        assert_eq!(outcome, PollOutcome::Ready);
    }

    #[test]
    fn poll_times_out_when_budget_exceeded() {
        let clock = FakeClock { now: Cell::new(0) };
        let mut poll = Poll::new(&clock, 10, 50, || false);
        let outcome = poll.run_to_completion(&clock, || {
            clock.now.set(clock.now.get() + 10);
        });
        assert_eq!(outcome, PollOutcome::TimedOut);
    }

    struct CountingContinuation {
        remaining: u32,
    }
    impl Continuation for CountingContinuation {
        fn step(&mut self, _now_us: u64) -> StepResult {
            if self.remaining == 0 {
                StepResult::Done
            } else {
                self.remaining -= 1;
                StepResult::Reschedule(5)
            }
        }
    }

    #[test]
    fn scheduler_reschedules_until_done() {
        let mut sched = Scheduler::new();
        sched.schedule(0, 0, Box::new(CountingContinuation { remaining: 2 }));
        assert_eq!(sched.run_ready(0), 1);
        assert!(!sched.is_empty());
        assert_eq!(sched.run_ready(5), 1);
        assert_eq!(sched.run_ready(10), 1);
        assert!(sched.is_empty());
    }

    #[test]
    fn scheduler_respects_due_time() {
        let mut sched = Scheduler::new();
        sched.schedule(0, 100, Box::new(CountingContinuation { remaining: 0 }));
        assert_eq!(sched.run_ready(50), 0);
        assert_eq!(sched.run_ready(100), 1);
    }
}
