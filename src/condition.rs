//! # Conditions and the Suspension Engine
//!
//! A [`Condition`] stands for one blockable resource: "this pool has a
//! free segment", "this descriptor has data", "this link came up". Each
//! owns a fixed-capacity queue of pending wait attempts; the behavior the
//! owner supplies (its lock, its wake hooks, its wait predicate) travels
//! as a [`ConditionOps`] trait object.
//!
//! The [`SuspendEngine`] is the algorithm on top: it parks the calling
//! task on one condition ([`SuspendEngine::wait`]) or on an arbitrary set
//! at once ([`SuspendEngine::wait_any`]), and wakes matching waiters from
//! the other side ([`SuspendEngine::resume`]).
//!
//! ## Locking protocol
//!
//! ```text
//! lock_scheduler()
//! lock owners: plain locks first, LOCK_NO_SUSPEND locks last (innermost)
//! loop:
//!   any predicate satisfied (or PING posted)?  → done
//!   register on every wait queue, record the wait set, arm the deadline
//!   ┌─ critical section ───────────────────────────────┐
//!   │ unlock owners (reverse order) · deschedule()     │
//!   └──────────────────────────────────────────────────┘
//!   re-lock owners, classify the wake, prune stale queue entries
//! unlock owners (reverse order)
//! unlock_scheduler()
//! ```
//!
//! Acquiring every owner lock in one global order — suspendable locks
//! before interrupt-masking ones — is what prevents deadlock when two
//! tasks wait on overlapping condition sets in different orders. The
//! critical section around the hand-off keeps an interrupt-driven resume
//! from observing a half-parked task.
//!
//! ## Wake semantics
//!
//! A normal resume is a hint, not a grant: the woken task re-evaluates its
//! predicate under the locks and may find a higher-priority task consumed
//! the resource first, in which case it simply parks again. When a task
//! waits on several conditions and more than one becomes satisfiable in
//! the same instant, whichever resumer runs first claims the task; which
//! one that is, is deliberately unspecified.

use bitflags::bitflags;
use core::cell::{Cell, RefCell};

use crate::config::{MAX_TASKS, MAX_WAIT_CONDITIONS};
use crate::error::Error;
use crate::scheduler::{Deadline, Scheduler, TaskId, Tick};
use crate::sync;

// ---------------------------------------------------------------------------
// Flags and wait parameters
// ---------------------------------------------------------------------------

bitflags! {
    /// Per-condition behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConditionFlags: u8 {
        /// Order waiters by task priority (lower value first) instead of
        /// arrival order. Equal priorities keep FIFO order among themselves.
        const PRIORITY = 0b001;
        /// A one-shot manual wake is pending: the next wait attempt counts
        /// as satisfied without a real state change, then clears the flag.
        const PING = 0b010;
        /// The owner's lock masks interrupts. Such a lock is acquired last,
        /// released first, and never held across a park.
        const LOCK_NO_SUSPEND = 0b100;
    }
}

/// What a waiter is waiting *for* — the predicate arguments carried by a
/// wait attempt and interpreted by the owning resource's
/// [`ConditionOps::should_suspend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitParam {
    /// No arguments; wait until an explicit resume (or ping) arrives.
    None,
    /// Replenishment level: proceed once `amount` free items of `kind`
    /// are available in the owner's pool.
    Level { kind: LevelKind, amount: usize },
    /// Owner-interpreted token.
    Token(u32),
}

/// Which pooled resource a [`WaitParam::Level`] counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelKind {
    /// Individual buffer segments.
    Items,
    /// Segment chains (lists).
    Lists,
}

// ---------------------------------------------------------------------------
// Suspend / resume records
// ---------------------------------------------------------------------------

/// One wait attempt: the predicate arguments (re-evaluated fresh on every
/// pass, since the awaited state may change between wake and run) and the
/// absolute deadline. One per task per condition; never shared.
#[derive(Debug, Clone, Copy)]
pub struct Suspend {
    pub param: WaitParam,
    pub deadline: Deadline,
}

impl Suspend {
    /// Wait indefinitely for `param`.
    pub const fn new(param: WaitParam) -> Self {
        Suspend { param, deadline: Deadline::Never }
    }

    /// Wait for `param`, giving up at `deadline`.
    pub const fn with_deadline(param: WaitParam, deadline: Deadline) -> Self {
        Suspend { param, deadline }
    }
}

/// The status a resume stamps on each task it wakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeStatus {
    /// Normal wake: the awaited state presumably holds; re-check it.
    Resumed,
    /// The sleep deadline elapsed. Stamped only by the sleep facility via
    /// [`SuspendEngine::on_sleep_expired`].
    TimedOut,
    /// The resource was torn down while the task waited.
    Deleted,
    /// Owner-defined status, delivered to the waiter verbatim.
    Custom(i32),
}

impl WakeStatus {
    fn into_result(self) -> Result<(), Error> {
        match self {
            WakeStatus::Resumed => Ok(()),
            WakeStatus::TimedOut => Err(Error::ConditionTimeout),
            WakeStatus::Deleted => Err(Error::NodeDeleted),
            WakeStatus::Custom(code) => Err(Error::Stamped(code)),
        }
    }
}

/// A wake request, built on the resumer's stack. The matcher selects which
/// waiters this state change actually satisfies (`None` means anyone);
/// every accepted waiter is stamped with `status` and handed back to the
/// scheduler.
pub struct Resume<'m> {
    pub matcher: Option<&'m dyn Fn(&WaitParam) -> bool>,
    pub status: WakeStatus,
}

impl<'m> Resume<'m> {
    /// Wake every waiter normally.
    pub const fn normal() -> Self {
        Resume { matcher: None, status: WakeStatus::Resumed }
    }

    /// Wake every waiter with an explicit status.
    pub const fn with_status(status: WakeStatus) -> Self {
        Resume { matcher: None, status }
    }

    /// Wake only the waiters the matcher accepts.
    pub const fn matching(matcher: &'m dyn Fn(&WaitParam) -> bool, status: WakeStatus) -> Self {
        Resume { matcher: Some(matcher), status }
    }
}

// ---------------------------------------------------------------------------
// Owner behavior
// ---------------------------------------------------------------------------

/// Behavior supplied by the resource that owns a condition.
///
/// `lock`/`unlock` guard the owner's shared state; the engine brackets
/// every queue operation and predicate evaluation with them, and never
/// holds them across a park. `pre_suspend` runs just before the caller
/// gives up the CPU, `post_resume` right after it gets it back.
pub trait ConditionOps {
    fn lock(&self, _sched: &dyn Scheduler) {}
    fn unlock(&self, _sched: &dyn Scheduler) {}
    fn pre_suspend(&self, _sched: &dyn Scheduler) {}
    fn post_resume(&self, _sched: &dyn Scheduler) {}

    /// Whether the waiter described by `param` still has to wait. The
    /// default never satisfies on its own, which models purely
    /// resume-driven conditions (timers, pings, tear-downs).
    fn should_suspend(&self, _param: &WaitParam) -> bool {
        true
    }
}

/// Owner for conditions with no state of their own.
pub struct NoOwner;

impl ConditionOps for NoOwner {}

// ---------------------------------------------------------------------------
// Condition object
// ---------------------------------------------------------------------------

type CondToken = usize;

/// One waiter registered on a condition's queue.
#[derive(Debug, Clone, Copy)]
struct Entry {
    task: TaskId,
    priority: u8,
    param: WaitParam,
}

const EMPTY_ENTRY: Entry = Entry { task: 0, priority: 0, param: WaitParam::None };

/// Fixed-capacity wait queue, ordered by arrival or by priority.
struct WaitQueue {
    entries: [Entry; MAX_TASKS],
    len: usize,
}

impl WaitQueue {
    const fn new() -> Self {
        WaitQueue { entries: [EMPTY_ENTRY; MAX_TASKS], len: 0 }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> Entry {
        debug_assert!(index < self.len);
        self.entries[index]
    }

    fn insert(&mut self, entry: Entry, by_priority: bool) {
        assert!(self.len < MAX_TASKS, "condition wait queue full");
        assert!(
            !self.entries[..self.len].iter().any(|e| e.task == entry.task),
            "task {} already registered on condition",
            entry.task
        );
        let at = if by_priority {
            // Ahead of the first strictly less urgent waiter; equal
            // priorities stay FIFO.
            self.entries[..self.len]
                .iter()
                .position(|e| e.priority > entry.priority)
                .unwrap_or(self.len)
        } else {
            self.len
        };
        self.entries.copy_within(at..self.len, at + 1);
        self.entries[at] = entry;
        self.len += 1;
    }

    fn remove(&mut self, index: usize) -> Entry {
        debug_assert!(index < self.len);
        let entry = self.entries[index];
        self.entries.copy_within(index + 1..self.len, index);
        self.len -= 1;
        entry
    }

    fn remove_task(&mut self, task: TaskId) -> bool {
        match self.entries[..self.len].iter().position(|e| e.task == task) {
            Some(index) => {
                self.remove(index);
                true
            }
            None => false,
        }
    }
}

/// A blockable resource: behavior flags plus the queue of pending wait
/// attempts. Embedded by its owner (a pool, a descriptor, a semaphore)
/// and only ever touched under that owner's lock.
///
/// Invariant: at most one entry per task; an entry leaves the queue
/// exactly once — popped by the resume that claims the task, pruned by
/// the waiter after a timeout or a wake on a sibling condition, or never
/// added because the predicate already held.
pub struct Condition {
    flags: Cell<ConditionFlags>,
    queue: RefCell<WaitQueue>,
}

impl Condition {
    pub const fn new(flags: ConditionFlags) -> Self {
        Condition { flags: Cell::new(flags), queue: RefCell::new(WaitQueue::new()) }
    }

    pub fn flags(&self) -> ConditionFlags {
        self.flags.get()
    }

    /// Number of tasks currently queued on this condition.
    pub fn waiters(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Stable identity for the duration of a wait (conditions are borrowed
    /// by every waiter, so the address cannot be reused underneath one).
    fn token(&self) -> CondToken {
        self as *const Condition as CondToken
    }

    fn set_ping(&self) {
        self.flags.set(self.flags.get() | ConditionFlags::PING);
    }

    fn clear_ping(&self) {
        self.flags.set(self.flags.get() - ConditionFlags::PING);
    }
}

// ---------------------------------------------------------------------------
// Wait targets and the per-task wait table
// ---------------------------------------------------------------------------

/// One condition of a multi-condition wait set: the condition, its owner's
/// behavior, and this task's wait attempt on it.
pub struct WaitTarget<'a> {
    pub condition: &'a Condition,
    pub owner: &'a dyn ConditionOps,
    pub suspend: Suspend,
}

impl<'a> WaitTarget<'a> {
    pub fn new(condition: &'a Condition, owner: &'a dyn ConditionOps, suspend: Suspend) -> Self {
        WaitTarget { condition, owner, suspend }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitPhase {
    Idle,
    Parked,
    Woken(WakeStatus),
}

/// The transient wait fields owned by the engine for one task: what it is
/// parked on, and how it was woken.
#[derive(Debug, Clone, Copy)]
struct WaitSlot {
    phase: WaitPhase,
    resumed_by: Option<CondToken>,
    wait_set: [Option<CondToken>; MAX_WAIT_CONDITIONS],
}

impl WaitSlot {
    const IDLE: WaitSlot =
        WaitSlot { phase: WaitPhase::Idle, resumed_by: None, wait_set: [None; MAX_WAIT_CONDITIONS] };

    fn parked(tokens: impl Iterator<Item = CondToken>) -> Self {
        let mut wait_set = [None; MAX_WAIT_CONDITIONS];
        for (slot, token) in wait_set.iter_mut().zip(tokens) {
            *slot = Some(token);
        }
        WaitSlot { phase: WaitPhase::Parked, resumed_by: None, wait_set }
    }

    fn woken(mut self, status: WakeStatus, by: Option<CondToken>) -> Self {
        self.phase = WaitPhase::Woken(status);
        self.resumed_by = by;
        self
    }

    fn waits_on(&self, token: CondToken) -> bool {
        self.wait_set.iter().flatten().any(|&t| t == token)
    }
}

// ---------------------------------------------------------------------------
// The engine
// ---------------------------------------------------------------------------

/// The suspension/resumption engine. One per system; constructed by the
/// system owner and passed explicitly to everything that blocks.
pub struct SuspendEngine {
    waits: [Cell<WaitSlot>; MAX_TASKS],
}

impl SuspendEngine {
    pub fn new() -> Self {
        SuspendEngine { waits: core::array::from_fn(|_| Cell::new(WaitSlot::IDLE)) }
    }

    /// Whether a task is currently parked through this engine.
    pub fn is_parked(&self, task: TaskId) -> bool {
        self.waits[task].get().phase == WaitPhase::Parked
    }

    /// Block the calling task on a single condition until `suspend.param`
    /// is satisfied, the deadline passes, or a resume stamps a status.
    pub fn wait(
        &self,
        sched: &dyn Scheduler,
        condition: &Condition,
        owner: &dyn ConditionOps,
        suspend: Suspend,
    ) -> Result<(), Error> {
        self.wait_any(sched, &[WaitTarget::new(condition, owner, suspend)]).map(|_| ())
    }

    /// Block the calling task until any condition in the set is satisfied.
    /// Returns the index of the satisfied condition.
    ///
    /// Task context only: parking performs a full cooperative switch.
    pub fn wait_any(&self, sched: &dyn Scheduler, targets: &[WaitTarget<'_>]) -> Result<usize, Error> {
        assert!(
            !targets.is_empty() && targets.len() <= MAX_WAIT_CONDITIONS,
            "wait set of {} conditions out of range",
            targets.len()
        );

        sched.lock_scheduler();
        let task = sched.current_task();
        assert!(task < MAX_TASKS, "task id {} out of range", task);
        let priority = sched.task_priority(task);

        lock_all(sched, targets);
        let deadline = nearest_deadline(targets, sched.now());

        let outcome = loop {
            if let Some(index) = first_satisfied(targets) {
                break Ok(index);
            }

            // Register on every queue and record the wait set while all
            // owner locks are held; no resume can slip in between.
            for target in targets {
                let by_priority = target.condition.flags().contains(ConditionFlags::PRIORITY);
                target
                    .condition
                    .queue
                    .borrow_mut()
                    .insert(Entry { task, priority, param: target.suspend.param }, by_priority);
            }
            self.waits[task].set(WaitSlot::parked(targets.iter().map(|t| t.condition.token())));
            if let Deadline::At(tick) = deadline {
                sched.sleep_after(task, tick);
            }
            for target in targets {
                target.owner.pre_suspend(sched);
            }

            log::trace!("task {} parking on {} condition(s)", task, targets.len());

            // The hand-off: give up every lock and switch away, without a
            // window in which an interrupt-driven resume could observe a
            // half-parked task.
            sync::critical_section(|_| {
                unlock_all(sched, targets);
                sched.deschedule();
            });

            lock_all(sched, targets);
            for target in targets {
                target.owner.post_resume(sched);
            }

            let slot = self.waits[task].get();
            let status = match slot.phase {
                WaitPhase::Woken(status) => status,
                phase => unreachable!("task {} resumed while {:?}", task, phase),
            };

            if status == WakeStatus::TimedOut {
                // The sleep facility woke us; every queue entry is still
                // ours to prune.
                for target in targets {
                    target.condition.queue.borrow_mut().remove_task(task);
                }
                log::debug!("task {} wait timed out", task);
                break Err(Error::ConditionTimeout);
            }

            // The resume popped our entry on the condition that fired;
            // prune the rest, since only one wake can claim us.
            let fired = slot
                .resumed_by
                .and_then(|token| targets.iter().position(|t| t.condition.token() == token));
            for (index, target) in targets.iter().enumerate() {
                if Some(index) != fired {
                    target.condition.queue.borrow_mut().remove_task(task);
                }
            }

            if let Err(error) = status.into_result() {
                break Err(error);
            }
            // Normal wake: loop and re-check. The resource may already be
            // gone again if a higher-priority waiter ran first. That is
            // ordinary wake semantics, not a failure.
        };

        if let Ok(index) = outcome {
            if targets[index].condition.flags().contains(ConditionFlags::PING) {
                targets[index].condition.clear_ping();
            }
        }
        self.waits[task].set(WaitSlot::IDLE);
        unlock_all(sched, targets);
        sched.unlock_scheduler();
        outcome
    }

    /// Wake the waiters of `condition` that `resume` matches.
    ///
    /// Walks the queue in order (so FIFO and priority disciplines hold),
    /// skips entries whose task was already claimed by a wake on a sibling
    /// condition, and for each genuine waiter cancels its sleep
    /// registration, stamps the status and the winning condition, and
    /// hands it back to the scheduler. Callable from interrupt context:
    /// the scan runs under a critical section and never blocks.
    pub fn resume(
        &self,
        sched: &dyn Scheduler,
        condition: &Condition,
        owner: &dyn ConditionOps,
        resume: &Resume<'_>,
    ) {
        owner.lock(sched);
        sched.lock_scheduler();

        let token = condition.token();
        sync::critical_section(|_| {
            let mut woken: [Option<TaskId>; MAX_TASKS] = [None; MAX_TASKS];
            let mut count = 0;
            {
                let mut queue = condition.queue.borrow_mut();
                let mut index = 0;
                while index < queue.len() {
                    let entry = queue.get(index);
                    let wanted = resume.matcher.map_or(true, |matcher| matcher(&entry.param));
                    if !wanted {
                        index += 1;
                        continue;
                    }
                    let slot = self.waits[entry.task].get();
                    if slot.phase != WaitPhase::Parked || !slot.waits_on(token) {
                        // Claimed by a wake on another condition; the
                        // task prunes this entry itself when it runs.
                        index += 1;
                        continue;
                    }
                    queue.remove(index);
                    self.waits[entry.task].set(slot.woken(resume.status, Some(token)));
                    woken[count] = Some(entry.task);
                    count += 1;
                }
            }
            for task in woken.iter().flatten() {
                log::trace!("resuming task {} ({:?})", task, resume.status);
                sched.sleep_cancel(*task);
                sched.make_ready(*task);
                sched.reschedule();
            }
        });

        sched.unlock_scheduler();
        owner.unlock(sched);
    }

    /// Post a one-shot manual wake: wakes current waiters normally and
    /// leaves the ping latched for the next wait attempt if nobody is
    /// parked yet.
    pub fn ping(&self, sched: &dyn Scheduler, condition: &Condition, owner: &dyn ConditionOps) {
        condition.set_ping();
        self.resume(sched, condition, owner, &Resume::normal());
    }

    /// Entry point for the sleep facility: a task's deadline elapsed.
    /// Stamps the timeout and readies the task if it is still parked;
    /// a task already claimed by a resume is left alone.
    pub fn on_sleep_expired(&self, sched: &dyn Scheduler, task: TaskId) {
        assert!(task < MAX_TASKS, "task id {} out of range", task);
        let slot = self.waits[task].get();
        if slot.phase != WaitPhase::Parked {
            return;
        }
        self.waits[task].set(slot.woken(WakeStatus::TimedOut, None));
        sched.make_ready(task);
    }
}

impl Default for SuspendEngine {
    fn default() -> Self {
        SuspendEngine::new()
    }
}

// ---------------------------------------------------------------------------
// Lock ordering helpers
// ---------------------------------------------------------------------------

fn no_suspend(target: &WaitTarget<'_>) -> bool {
    target.condition.flags().contains(ConditionFlags::LOCK_NO_SUSPEND)
}

/// Acquire every owner lock in the global order: suspendable locks first,
/// interrupt-masking locks last (innermost).
fn lock_all(sched: &dyn Scheduler, targets: &[WaitTarget<'_>]) {
    for target in targets.iter().filter(|t| !no_suspend(t)) {
        target.owner.lock(sched);
    }
    for target in targets.iter().filter(|t| no_suspend(t)) {
        target.owner.lock(sched);
    }
}

/// Release in reverse acquisition order.
fn unlock_all(sched: &dyn Scheduler, targets: &[WaitTarget<'_>]) {
    for target in targets.iter().rev().filter(|t| no_suspend(t)) {
        target.owner.unlock(sched);
    }
    for target in targets.iter().rev().filter(|t| !no_suspend(t)) {
        target.owner.unlock(sched);
    }
}

/// First condition whose predicate no longer demands a wait, or which has
/// a ping posted.
fn first_satisfied(targets: &[WaitTarget<'_>]) -> Option<usize> {
    targets.iter().position(|target| {
        target.condition.flags().contains(ConditionFlags::PING)
            || !target.owner.should_suspend(&target.suspend.param)
    })
}

/// The deadline with the fewest ticks remaining, computed once per wait.
fn nearest_deadline(targets: &[WaitTarget<'_>], now: Tick) -> Deadline {
    let mut best: Option<Tick> = None;
    for target in targets {
        if let Deadline::At(tick) = target.suspend.deadline {
            let sooner = match best {
                Some(current) => tick.saturating_sub(now) < current.saturating_sub(now),
                None => true,
            };
            if sooner {
                best = Some(tick);
            }
        }
    }
    match best {
        Some(tick) => Deadline::At(tick),
        None => Deadline::Never,
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::testing::ScriptSched;
    use std::vec::Vec;

    /// A one-bit resource: closed means wait, open means go.
    struct Gate {
        open: Cell<bool>,
    }

    impl Gate {
        fn closed() -> Self {
            Gate { open: Cell::new(false) }
        }

        fn open(&self) {
            self.open.set(true);
        }
    }

    impl ConditionOps for Gate {
        fn should_suspend(&self, _param: &WaitParam) -> bool {
            !self.open.get()
        }
    }

    /// A counted resource for exercising the re-check race.
    struct Units {
        available: Cell<usize>,
    }

    impl Units {
        fn none() -> Self {
            Units { available: Cell::new(0) }
        }

        fn put(&self, n: usize) {
            self.available.set(self.available.get() + n);
        }

        fn take(&self, n: usize) {
            self.available.set(self.available.get().checked_sub(n).unwrap());
        }
    }

    impl ConditionOps for Units {
        fn should_suspend(&self, param: &WaitParam) -> bool {
            match *param {
                WaitParam::Level { amount, .. } => self.available.get() < amount,
                _ => true,
            }
        }
    }

    /// Records lock/unlock calls for lock-ordering assertions.
    struct LockProbe<'l> {
        name: &'static str,
        log: &'l RefCell<Vec<(&'static str, &'static str)>>,
    }

    impl ConditionOps for LockProbe<'_> {
        fn lock(&self, _sched: &dyn Scheduler) {
            self.log.borrow_mut().push((self.name, "lock"));
        }

        fn unlock(&self, _sched: &dyn Scheduler) {
            self.log.borrow_mut().push((self.name, "unlock"));
        }

        fn should_suspend(&self, _param: &WaitParam) -> bool {
            false
        }
    }

    fn forever() -> Suspend {
        Suspend::new(WaitParam::None)
    }

    #[test]
    fn satisfied_predicate_returns_without_parking() {
        let engine = SuspendEngine::new();
        let gate = Gate::closed();
        gate.open();
        let cond = Condition::new(ConditionFlags::empty());
        let sched = ScriptSched::new(&engine);

        engine.wait(&sched, &cond, &gate, forever()).unwrap();
        assert_eq!(cond.waiters(), 0);
        assert!(sched.wake_order.borrow().is_empty());
        assert!(sched.lock_balanced());
    }

    #[test]
    fn fifo_wake_order() {
        let engine = SuspendEngine::new();
        let gate = Gate::closed();
        let cond = Condition::new(ConditionFlags::empty());
        let sched = ScriptSched::new(&engine);

        // Task 0 parks first; the hook parks task 1 behind it; the second
        // hook opens the gate and resumes everyone.
        sched.on_park(|s| {
            s.switch_to(1);
            engine.wait(s, &cond, &gate, forever()).unwrap();
        });
        sched.on_park(|s| {
            gate.open();
            engine.resume(s, &cond, &gate, &Resume::normal());
        });

        engine.wait(&sched, &cond, &gate, forever()).unwrap();

        assert_eq!(*sched.wake_order.borrow(), vec![0, 1]);
        assert_eq!(cond.waiters(), 0);
        assert!(sched.hooks_consumed());
        assert!(sched.lock_balanced());
    }

    #[test]
    fn priority_wake_order() {
        let engine = SuspendEngine::new();
        let gate = Gate::closed();
        let cond = Condition::new(ConditionFlags::PRIORITY);
        let sched = ScriptSched::new(&engine);
        sched.set_priority(0, 5);
        sched.set_priority(1, 1);

        // Task 0 (priority 5) registers first, task 1 (priority 1) after;
        // the more urgent task must still be woken first.
        sched.on_park(|s| {
            s.switch_to(1);
            engine.wait(s, &cond, &gate, forever()).unwrap();
        });
        sched.on_park(|s| {
            gate.open();
            engine.resume(s, &cond, &gate, &Resume::normal());
        });

        engine.wait(&sched, &cond, &gate, forever()).unwrap();

        assert_eq!(*sched.wake_order.borrow(), vec![1, 0]);
        assert_eq!(cond.waiters(), 0);
    }

    #[test]
    fn timeout_surfaces_and_dequeues() {
        let engine = SuspendEngine::new();
        let gate = Gate::closed();
        let cond = Condition::new(ConditionFlags::empty());
        let sched = ScriptSched::new(&engine);

        let suspend = Suspend::with_deadline(WaitParam::None, Deadline::At(100));
        let result = engine.wait(&sched, &cond, &gate, suspend);

        assert_eq!(result, Err(Error::ConditionTimeout));
        assert_eq!(sched.now(), 100);
        assert_eq!(cond.waiters(), 0);
        assert!(!engine.is_parked(0));
        assert!(sched.lock_balanced());
    }

    #[test]
    fn multi_condition_data_beats_deadline() {
        let engine = SuspendEngine::new();
        let data = Gate::closed();
        let data_cond = Condition::new(ConditionFlags::empty());
        let timer_cond = Condition::new(ConditionFlags::empty());
        let timer_owner = NoOwner;
        let sched = ScriptSched::new(&engine);

        // Data arrives at t=1000, well before the t=2000 deadline.
        sched.on_park(|s| {
            s.advance(1000);
            data.open();
            engine.resume(s, &data_cond, &data, &Resume::normal());
        });

        let targets = [
            WaitTarget::new(&data_cond, &data, forever()),
            WaitTarget::new(
                &timer_cond,
                &timer_owner,
                Suspend::with_deadline(WaitParam::None, Deadline::At(2000)),
            ),
        ];
        let index = engine.wait_any(&sched, &targets).unwrap();

        assert_eq!(index, 0);
        // The entry on the condition that did not fire has been pruned.
        assert_eq!(timer_cond.waiters(), 0);
        assert_eq!(data_cond.waiters(), 0);
        assert!(sched.lock_balanced());
    }

    #[test]
    fn multi_condition_timeout_when_nothing_fires() {
        let engine = SuspendEngine::new();
        let data = Gate::closed();
        let data_cond = Condition::new(ConditionFlags::empty());
        let timer_cond = Condition::new(ConditionFlags::empty());
        let timer_owner = NoOwner;
        let sched = ScriptSched::new(&engine);

        let targets = [
            WaitTarget::new(&data_cond, &data, forever()),
            WaitTarget::new(
                &timer_cond,
                &timer_owner,
                Suspend::with_deadline(WaitParam::None, Deadline::At(2000)),
            ),
        ];
        let result = engine.wait_any(&sched, &targets);

        assert_eq!(result, Err(Error::ConditionTimeout));
        assert_eq!(sched.now(), 2000);
        assert_eq!(data_cond.waiters(), 0);
        assert_eq!(timer_cond.waiters(), 0);
    }

    #[test]
    fn ping_latches_until_consumed() {
        let engine = SuspendEngine::new();
        let cond = Condition::new(ConditionFlags::empty());
        let sched = ScriptSched::new(&engine);

        // Nobody is waiting: the ping latches.
        engine.ping(&sched, &cond, &NoOwner);
        assert!(cond.flags().contains(ConditionFlags::PING));

        // The next wait consumes it without parking.
        engine.wait(&sched, &cond, &NoOwner, forever()).unwrap();
        assert!(!cond.flags().contains(ConditionFlags::PING));
    }

    #[test]
    fn ping_wakes_a_parked_waiter() {
        let engine = SuspendEngine::new();
        let gate = Gate::closed();
        let cond = Condition::new(ConditionFlags::empty());
        let sched = ScriptSched::new(&engine);

        sched.on_park(|s| {
            engine.ping(s, &cond, &gate);
        });

        // The gate never opens; the ping alone satisfies the wait.
        engine.wait(&sched, &cond, &gate, forever()).unwrap();
        assert!(!cond.flags().contains(ConditionFlags::PING));
        assert_eq!(cond.waiters(), 0);
    }

    #[test]
    fn abnormal_wake_propagates_status() {
        let engine = SuspendEngine::new();
        let gate = Gate::closed();
        let cond = Condition::new(ConditionFlags::empty());
        let sched = ScriptSched::new(&engine);

        sched.on_park(|s| {
            engine.resume(s, &cond, &gate, &Resume::with_status(WakeStatus::Deleted));
        });

        let result = engine.wait(&sched, &cond, &gate, forever());
        assert_eq!(result, Err(Error::NodeDeleted));

        sched.on_park(|s| {
            engine.resume(s, &cond, &gate, &Resume::with_status(WakeStatus::Custom(-42)));
        });

        let result = engine.wait(&sched, &cond, &gate, forever());
        assert_eq!(result, Err(Error::Stamped(-42)));
        assert!(sched.lock_balanced());
    }

    #[test]
    fn two_phase_lock_ordering() {
        let engine = SuspendEngine::new();
        let log = RefCell::new(Vec::new());
        let irq_owner = LockProbe { name: "irq", log: &log };
        let plain_owner = LockProbe { name: "plain", log: &log };
        let irq_cond = Condition::new(ConditionFlags::LOCK_NO_SUSPEND);
        let plain_cond = Condition::new(ConditionFlags::empty());
        let sched = ScriptSched::new(&engine);

        // The interrupt-masking lock is listed first, but must still be
        // acquired last and released first.
        let targets = [
            WaitTarget::new(&irq_cond, &irq_owner, forever()),
            WaitTarget::new(&plain_cond, &plain_owner, forever()),
        ];
        engine.wait_any(&sched, &targets).unwrap();

        assert_eq!(
            *log.borrow(),
            vec![
                ("plain", "lock"),
                ("irq", "lock"),
                ("irq", "unlock"),
                ("plain", "unlock"),
            ]
        );
    }

    #[test]
    fn losing_the_race_parks_again() {
        let engine = SuspendEngine::new();
        let units = Units::none();
        let cond = Condition::new(ConditionFlags::empty());
        let want = Suspend::new(WaitParam::Level { kind: LevelKind::Items, amount: 1 });
        let sched = ScriptSched::new(&engine);

        // Task 0 waits for one unit. Task 1 parks behind it, and when a
        // unit shows up both are woken; task 1 happens to run first and
        // takes it, so task 0 re-checks, finds nothing, and parks again
        // until the second unit arrives.
        sched.on_park(|s| {
            s.switch_to(1);
            engine.wait(s, &cond, &units, want).unwrap();
            units.take(1); // task 1 claims the unit it was woken for
        });
        sched.on_park(|s| {
            units.put(1);
            engine.resume(s, &cond, &units, &Resume::normal());
        });
        sched.on_park(|s| {
            units.put(1);
            engine.resume(s, &cond, &units, &Resume::normal());
        });

        engine.wait(&sched, &cond, &units, want).unwrap();

        // Woken twice: once for the unit it lost, once for the one it got.
        assert_eq!(*sched.wake_order.borrow(), vec![0, 1, 0]);
        assert_eq!(cond.waiters(), 0);
        assert!(sched.hooks_consumed());
        assert!(sched.lock_balanced());
    }

    #[test]
    fn matcher_selects_waiters() {
        let engine = SuspendEngine::new();
        let units = Units::none();
        let cond = Condition::new(ConditionFlags::empty());
        let sched = ScriptSched::new(&engine);

        // Task 0 needs 2 units, task 1 needs 1. One unit arrives: only
        // task 1's request is satisfiable, and FIFO order must not let
        // task 0 absorb the wake.
        sched.on_park(|s| {
            s.switch_to(1);
            engine
                .wait(s, &cond, &units, Suspend::new(WaitParam::Level { kind: LevelKind::Items, amount: 1 }))
                .unwrap();
            units.take(1);
            // Later, enough for task 0 as well.
            units.put(2);
            let matcher = |param: &WaitParam| match *param {
                WaitParam::Level { amount, .. } => 2 >= amount,
                _ => true,
            };
            engine.resume(s, &cond, &units, &Resume::matching(&matcher, WakeStatus::Resumed));
        });
        sched.on_park(|s| {
            units.put(1);
            let matcher = |param: &WaitParam| match *param {
                WaitParam::Level { amount, .. } => 1 >= amount,
                _ => true,
            };
            engine.resume(s, &cond, &units, &Resume::matching(&matcher, WakeStatus::Resumed));
        });

        engine
            .wait(&sched, &cond, &units, Suspend::new(WaitParam::Level { kind: LevelKind::Items, amount: 2 }))
            .unwrap();

        // First wake goes to task 1 alone, then task 0.
        assert_eq!(*sched.wake_order.borrow(), vec![1, 0]);
        assert_eq!(cond.waiters(), 0);
    }
}
