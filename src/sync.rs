//! # Synchronization Primitives
//!
//! Interrupt-safe critical section abstraction. The suspension engine
//! runs its two hand-off sequences inside a critical section: releasing
//! every owner lock and descheduling (suspend side), and the wait-queue
//! scan that stamps and readies waiters (resume side). A resume driven
//! from an interrupt handler therefore cannot interleave with the act of
//! suspending.
//!
//! On target the implementation comes from `cortex-m` with the
//! `critical-section-single-core` feature; host tests link the `std`
//! implementation of the `critical-section` crate so the same code paths
//! run unchanged.
//!
//! # Performance
//! Keep critical sections as short as possible to minimize interrupt
//! latency; both engine sections touch only queue bookkeeping.

use critical_section::CriticalSection;

/// Execute a closure within a critical section (interrupts disabled).
///
/// Nesting is supported; the previous restore state is reinstated on
/// exit, so a resume running inside the suspend hand-off section is fine.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}
