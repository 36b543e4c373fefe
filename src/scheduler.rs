//! # Scheduler Boundary
//!
//! The dispatch side of the system (ready queues, context switch, sleep
//! list) lives outside this crate. Everything the suspension engine and
//! its clients need from it crosses the [`Scheduler`] trait defined here.
//!
//! ## Contract
//!
//! - All methods are callable from task context; `deschedule` performs a
//!   full cooperative switch and therefore must never be reached from an
//!   interrupt handler.
//! - `lock_scheduler`/`unlock_scheduler` disable and re-enable preemption
//!   and nest (a counting lock). `reschedule` posted while the scheduler
//!   is locked takes effect once the lock is fully released.
//! - The sleep facility wakes an expired task by calling
//!   [`SuspendEngine::on_sleep_expired`] before making it ready, so the
//!   waiter can tell a deadline wake from a resume.
//!
//! [`SuspendEngine::on_sleep_expired`]: crate::condition::SuspendEngine::on_sleep_expired

/// Identity of a task, as assigned by the external scheduler.
/// Always below [`crate::config::MAX_TASKS`].
pub type TaskId = usize;

/// Monotonic system time in ticks of [`crate::config::TICK_HZ`].
pub type Tick = u32;

/// When a wait attempt gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Wait until explicitly resumed.
    Never,
    /// Give up at this absolute tick.
    At(Tick),
}

/// The external scheduler collaborator.
///
/// One implementation exists per system; the engine borrows it for the
/// duration of each call rather than owning it.
pub trait Scheduler {
    /// Identity of the running task.
    fn current_task(&self) -> TaskId;

    /// Scheduling priority of a task; lower numeric value is more urgent.
    fn task_priority(&self, task: TaskId) -> u8;

    /// Disable preemption. Nests.
    fn lock_scheduler(&self);

    /// Re-enable preemption once the lock count returns to zero.
    fn unlock_scheduler(&self);

    /// Current system tick.
    fn now(&self) -> Tick;

    /// Register an absolute-deadline wake-up for a task.
    fn sleep_after(&self, task: TaskId, deadline: Tick);

    /// Drop a task's sleep registration, if any.
    fn sleep_cancel(&self, task: TaskId);

    /// Park the calling task until another context makes it ready.
    /// Called with interrupts masked; the switch path owns re-enabling.
    fn deschedule(&self);

    /// Hand a parked task back to its scheduling class.
    fn make_ready(&self, task: TaskId);

    /// Cooperative hint that a newly readied task may outrank the caller.
    fn reschedule(&self);
}

// ---------------------------------------------------------------------------
// Scripted scheduler (host tests)
// ---------------------------------------------------------------------------
