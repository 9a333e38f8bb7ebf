//! Error types for the saddle-point core.

use thiserror::Error;

/// Errors raised by the core components.
///
/// Non-convergence is deliberately *not* an error: the driver reports it
/// through [`SolveResult::succeeded`](crate::problem::SolveResult) together
/// with a failure reason and the last residuals. The variants below cover
/// caller bugs and unrecoverable evaluation failures only.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A vector or matrix was handed in with the wrong dimension.
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimMismatch {
        /// Which argument or operation detected the mismatch
        context: &'static str,
        /// Expected dimension
        expected: usize,
        /// Dimension actually received
        actual: usize,
    },

    /// The objective evaluation produced NaN/Inf at the initial guess.
    #[error("objective evaluation produced NaN/Inf at the initial guess")]
    NonFiniteInit,

    /// The constraint coefficient matrix lost all numerical rank.
    #[error("constraint matrix lost all numerical rank ({rows} rows, rank 0)")]
    RankCollapse {
        /// Number of constraint rows in the matrix
        rows: usize,
    },

    /// A basic/non-basic swap was requested on a numerically zero pivot.
    #[error("numerically zero pivot S({ib}, {jn}) in basic/non-basic swap")]
    PivotBreakdown {
        /// Index of the basic slot involved in the swap
        ib: usize,
        /// Index of the non-basic slot involved in the swap
        jn: usize,
    },
}
