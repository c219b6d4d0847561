//! Unified error types for the VeraGrid core.
//!
//! Domain failures are modelled explicitly so drivers can distinguish fatal
//! model defects (`MalformedGrid`, `MalformedBlock`, `UnboundVariable`) from
//! recoverable numerical conditions (`DidNotConverge`, `SingularJacobian`)
//! and from user cancellation.

use thiserror::Error;

/// Unified error type for all core operations.
#[derive(Error, Debug)]
pub enum VgError {
    /// Invariant violation in the grid model: dangling branch endpoint,
    /// duplicate uid, transformer voltage mismatch. Fatal before solving.
    #[error("Malformed grid: {0}")]
    MalformedGrid(String),

    /// An island has no voltage source and the options disallow it.
    /// Fatal for that island only; other islands still solve.
    #[error("Island {island} has no slack or source")]
    NoSlackInIsland { island: usize },

    /// An island contains no injection source at all.
    #[error("Island {island} has no injection source")]
    IslandWithoutSource { island: usize },

    /// Newton reached `max_iter`. Non-fatal: results carry the last iterate.
    #[error("Did not converge after {iterations} iterations (|F|inf = {mismatch:.3e})")]
    DidNotConverge { iterations: usize, mismatch: f64 },

    /// Sparse LU factorization failed.
    #[error("Singular Jacobian: {0}")]
    SingularJacobian(String),

    /// Symbolic code generation found a variable with no slot mapping.
    #[error("Unbound variable '{name}' (uid {uid})")]
    UnboundVariable { name: String, uid: u64 },

    /// Block composition invariant violation.
    #[error("Malformed block: {0}")]
    MalformedBlock(String),

    /// An outage leaves a zero denominator in the LODF closed form.
    #[error("Contingency on branch {branch} is not representable")]
    ContingencyNotApplicable { branch: usize },

    /// The user cancelled the driver; partial results are returned.
    #[error("Cancelled")]
    Cancelled,

    /// The persistence container is missing tables or required columns.
    #[error("Broken archive: {0}")]
    BrokenArchive(String),

    /// I/O errors from the persistence boundary.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing/deserialization errors.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Generic wrapper for external errors.
    #[error("{0}")]
    Other(String),
}

/// Convenience alias for Results using [`VgError`].
pub type VgResult<T> = Result<T, VgError>;

impl From<anyhow::Error> for VgError {
    fn from(err: anyhow::Error) -> Self {
        VgError::Other(err.to_string())
    }
}

impl From<String> for VgError {
    fn from(s: String) -> Self {
        VgError::Other(s)
    }
}

impl From<&str> for VgError {
    fn from(s: &str) -> Self {
        VgError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VgError::DidNotConverge {
            iterations: 20,
            mismatch: 1.5e-3,
        };
        assert!(err.to_string().contains("20 iterations"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: VgError = io_err.into();
        assert!(matches!(err, VgError::Io(_)));
    }

    #[test]
    fn test_question_mark_operator() {
        fn inner() -> VgResult<()> {
            Err(VgError::MalformedGrid("test".into()))
        }
        fn outer() -> VgResult<()> {
            inner()?;
            Ok(())
        }
        assert!(outer().is_err());
    }
}
