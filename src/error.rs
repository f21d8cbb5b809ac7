//! Error taxonomy. Only two conditions are surfaced to the host as
//! `Result::Err`; everything else (finalizer errors, reentrancy) is
//! swallowed at its boundary instead of propagated.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GcError {
    /// An emergency full collection ran and the mutator's allocation
    /// still could not be satisfied.
    #[error("allocation of {requested} bytes failed even after an emergency collection")]
    AllocationFailed { requested: usize },

    /// The heap is shutting down (`free_all` in progress or completed);
    /// finalizer registration and new allocations are refused.
    #[error("operation refused: garbage collector is closing")]
    ClosingState,
}
