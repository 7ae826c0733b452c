//! Errors that indicate a bug in the build cache itself.
//!
//! Compile failures and damaged caches are ordinary outcomes and travel
//! through the build report. An `InternalError` means the cache can no longer
//! trust its own bookkeeping, so the build stops without persisting anything.

/// Result of an operation that can only fail on a broken invariant.
pub type KilnResult<T> = Result<T, InternalError>;

/// A broken invariant inside the build cache.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InternalError {
    /// A module tried to leave its state machine.
    #[error("illegal module state transition {from} -> {to}")]
    IllegalTransition {
        /// State the module was in.
        from: String,
        /// State it tried to enter.
        to: String,
    },

    /// Intra-module propagation scheduled more compiles than the module has
    /// units, so it can never reach a fixed point.
    #[error(
        "propagation in module '{module}' did not terminate: \
         {compiles} compiles scheduled for {units} units"
    )]
    PropagationNonTermination {
        /// Module being propagated.
        module: String,
        /// Compiles scheduled so far, including the rejected batch.
        compiles: usize,
        /// Units in the module, which bounds the compiles.
        units: usize,
    },

    /// Any other bookkeeping inconsistency, such as a unit without a partial
    /// artifact at merge time.
    #[error("build cache invariant violated: {0}")]
    Invariant(String),
}

impl InternalError {
    /// Creates an [`InternalError::Invariant`] with the given description.
    pub fn new(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_names_both_states() {
        let err = InternalError::IllegalTransition {
            from: "succeeded".into(),
            to: "failed".into(),
        };
        assert_eq!(
            err.to_string(),
            "illegal module state transition succeeded -> failed"
        );
    }

    #[test]
    fn non_termination_reports_the_bound() {
        let err = InternalError::PropagationNonTermination {
            module: "lib".into(),
            compiles: 4,
            units: 3,
        };
        assert_eq!(
            err.to_string(),
            "propagation in module 'lib' did not terminate: 4 compiles scheduled for 3 units"
        );
    }

    #[test]
    fn new_is_an_invariant_violation() {
        let err = InternalError::new("unit 'lib/g.kl' has no partial artifact");
        assert!(matches!(err, InternalError::Invariant(ref m) if m.contains("lib/g.kl")));
    }
}
