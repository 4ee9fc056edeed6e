//! Error kinds for conditions beyond plain transport/protocol failures
//! (which are represented as ordinary `anyhow::Error`).

use std::fmt;

/// A design invariant was violated (unequal-length modified-time strings,
/// identical timestamps with differing hashes, a path missing from both
/// indexes during deletion cleanup). These are logged prominently and the
/// affected operation is skipped; they never tear down the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalError(pub String);

impl fmt::Display for LogicalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "logical error: {}", self.0)
    }
}

impl std::error::Error for LogicalError {}

/// The three-way outcome an opcode handler communicates back to the
/// dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// Continue the dispatch loop.
    Continue,
    /// Orderly termination: tear down the session cleanly.
    Terminal,
    /// Fatal transport/protocol error: tear down the session.
    Fatal,
}
