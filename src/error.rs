//! # Error Codes
//!
//! The status values that cross the kernel-core boundary. Everything here
//! is recoverable by caller policy (retry, drop, backpressure). Structural
//! contract violations such as double registration or out-of-range ids
//! are assertions instead, since nothing can safely continue past a
//! broken invariant in a no-allocation kernel.

use core::fmt;

/// Errors surfaced by the suspension engine and the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The wait deadline elapsed before any condition was satisfied.
    /// Never retried internally; the caller decides what a timeout means.
    ConditionTimeout,

    /// The pool cannot satisfy the request: suspension was disallowed,
    /// or allowed and exhausted without replenishment.
    NoSpace,

    /// The resource a task was waiting on was torn down under it.
    NodeDeleted,

    /// An owner-defined status stamped by whichever resume woke the task,
    /// delivered verbatim.
    Stamped(i32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConditionTimeout => write!(f, "condition wait timed out"),
            Error::NoSpace => write!(f, "no buffer space available"),
            Error::NodeDeleted => write!(f, "node deleted while waiting"),
            Error::Stamped(code) => write!(f, "resumed with status {}", code),
        }
    }
}
