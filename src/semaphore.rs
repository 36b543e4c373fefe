//! # Counting Semaphore
//!
//! The smallest client of the suspension engine: a counting semaphore
//! whose waiters park on an embedded [`Condition`], FIFO by default or
//! priority-ordered on request. A release wakes every waiter; each one
//! re-validates the count under the lock and the losers simply park
//! again, per the engine's wake semantics.

use core::cell::Cell;

use crate::condition::{Condition, ConditionFlags, ConditionOps, Resume, Suspend, SuspendEngine, WaitParam};
use crate::error::Error;
use crate::scheduler::{Deadline, Scheduler};

pub struct Semaphore {
    count: Cell<u8>,
    max_count: u8,
    condition: Condition,
}

impl Semaphore {
    /// A semaphore holding `count` of `max_count` permits. With
    /// `priority`, contended permits go to the most urgent waiter
    /// instead of the longest-waiting one.
    pub fn new(count: u8, max_count: u8, priority: bool) -> Self {
        assert!(max_count > 0 && count <= max_count);
        let flags = if priority { ConditionFlags::PRIORITY } else { ConditionFlags::empty() };
        Semaphore { count: Cell::new(count), max_count, condition: Condition::new(flags) }
    }

    pub fn count(&self) -> u8 {
        self.count.get()
    }

    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    /// Take a permit if one is free; never blocks.
    pub fn try_obtain(&self, sched: &dyn Scheduler) -> bool {
        sched.lock_scheduler();
        let count = self.count.get();
        let won = count > 0;
        if won {
            self.count.set(count - 1);
        }
        sched.unlock_scheduler();
        won
    }

    /// Take a permit, parking until one frees up or `deadline` passes.
    pub fn obtain(
        &self,
        engine: &SuspendEngine,
        sched: &dyn Scheduler,
        deadline: Deadline,
    ) -> Result<(), Error> {
        loop {
            if self.try_obtain(sched) {
                return Ok(());
            }
            engine.wait(sched, &self.condition, self, Suspend::with_deadline(WaitParam::None, deadline))?;
        }
    }

    /// Return a permit and wake the waiters.
    pub fn release(&self, engine: &SuspendEngine, sched: &dyn Scheduler) {
        sched.lock_scheduler();
        let count = self.count.get();
        assert!(count < self.max_count, "semaphore released above its maximum");
        self.count.set(count + 1);
        sched.unlock_scheduler();
        engine.resume(sched, &self.condition, self, &Resume::normal());
    }
}

impl ConditionOps for Semaphore {
    fn lock(&self, sched: &dyn Scheduler) {
        sched.lock_scheduler();
    }

    fn unlock(&self, sched: &dyn Scheduler) {
        sched.unlock_scheduler();
    }

    fn should_suspend(&self, _param: &WaitParam) -> bool {
        self.count.get() == 0
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
