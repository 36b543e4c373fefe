//! # Keel Configuration
//!
//! Compile-time constants governing the kernel core. All limits are fixed
//! at compile time — no dynamic allocation.

/// Maximum number of tasks the system can manage simultaneously.
/// Bounds the suspension engine's per-task wait table and the wait queue
/// embedded in every condition.
pub const MAX_TASKS: usize = 8;

/// Maximum number of conditions a single task may wait on at once.
/// Bounds the wait-set record kept while a task is parked.
pub const MAX_WAIT_CONDITIONS: usize = 4;

/// System tick frequency in Hz. Deadlines passed to the suspension engine
/// are absolute ticks at this rate.
pub const TICK_HZ: u32 = 1000;

/// Size in bytes of one buffer segment, the pool's allocation unit.
/// Every segment carries this much storage; the valid window floats
/// inside it to give zero-copy head and tail room.
pub const SEGMENT_SIZE: usize = 128;

/// Number of segments in a buffer pool's arena.
pub const POOL_SEGMENTS: usize = 16;

/// Number of chains (segment lists) in a buffer pool's arena. Each chain
/// describes one logical message; a pool never needs more chains than it
/// could populate with single-segment messages.
pub const POOL_CHAINS: usize = 8;
