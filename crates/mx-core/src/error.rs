//! Error types for microx

use thiserror::Error;

/// microx error type
#[derive(Error, Debug)]
pub enum Error {
    /// A variable role required by the model is absent from the sample.
    #[error("missing role `{role}` ({context})")]
    MissingRole {
        /// Role name (e.g. `treatment`).
        role: String,
        /// Model or stage that requires it.
        context: String,
    },

    /// A Jacobian or linear system could not be inverted.
    #[error("singular system in {stage} ({dim}x{dim})")]
    SingularSystem {
        /// Stage that produced the system (e.g. `OLS normal equations`).
        stage: String,
        /// Dimension of the square system.
        dim: usize,
    },

    /// Iterative optimization exhausted its budget.
    #[error("{stage} did not converge after {iterations} iterations (|grad|={grad_norm:.3e})")]
    NonConvergence {
        /// Estimator that failed.
        stage: String,
        /// Iterations performed.
        iterations: usize,
        /// Max-abs gradient of the mean objective at the last iterate.
        grad_norm: f64,
    },

    /// Subsetting or trimming removed every observation.
    #[error("empty sample: {context}")]
    EmptySample {
        /// What removed the rows.
        context: String,
    },

    /// A correlation structure does not cover the requested observations.
    #[error("incompatible correlation structure: {0}")]
    IncompatibleStructure(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for [`Error::MissingRole`].
    pub fn missing_role(role: impl Into<String>, context: impl Into<String>) -> Self {
        Error::MissingRole { role: role.into(), context: context.into() }
    }

    /// Shorthand for [`Error::SingularSystem`].
    pub fn singular(stage: impl Into<String>, dim: usize) -> Self {
        Error::SingularSystem { stage: stage.into(), dim }
    }

    /// Shorthand for [`Error::EmptySample`].
    pub fn empty(context: impl Into<String>) -> Self {
        Error::EmptySample { context: context.into() }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
