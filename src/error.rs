use thiserror::Error;

/// Errors surfaced by the allocation engine.
///
/// An instance with zero eligible tutor/slot pairs is not represented here:
/// it produces a well-formed empty result instead of failing.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The request violates the input contract (duplicate records,
    /// out-of-range values, missing solver parameters). Detected before any
    /// worker is spawned and never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The run was stopped by an explicit cancellation request.
    #[error("run cancelled")]
    Cancelled,

    /// An internal invariant was violated inside a solver. Fatal to the run,
    /// never downgraded to a partial result.
    #[error("solver fault: {0}")]
    SolverFault(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
