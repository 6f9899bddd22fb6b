//! Error type shared by every part of the engine.

use thiserror::Error;

/// Result alias with [`Error`] as the failure type.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while building or evaluating a spin system.
///
/// Configuration problems are reported as soon as the offending object is
/// built. Numerical degeneracy that LAPACK does not itself reject is not an
/// error and shows up as non-finite values downstream.
#[derive(Debug, Error)]
pub enum Error {
    /// The basis topology identifier is not in the table.
    #[error("unknown basis topology '{0}'")]
    UnknownTopology(String),

    /// The basis extension is not one of `""`, `"dq"`, `"tq"`.
    #[error("unknown basis extension '{0}'")]
    UnknownExtension(String),

    /// The spin-pair letters do not name a supported spin system.
    #[error("unknown spin system '{0}'")]
    UnknownSpinSystem(String),

    /// Exchange-state counts are limited to `1..=4`.
    #[error("number of exchange states must be between 1 and 4, got {0}")]
    StateCount(usize),

    /// A component or vector name absent from the basis.
    #[error("unknown basis component '{0}'")]
    UnknownComponent(String),

    /// A detection expression that could not be parsed.
    #[error("malformed detection expression '{0}'")]
    Detection(String),

    /// Two ensemble stacks whose replica counts cannot be broadcast.
    #[error("cannot broadcast ensemble stacks with {0} and {1} replicas")]
    Replicas(usize, usize),

    /// Operands whose basis dimensions disagree.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    Dimension { expected: usize, got: usize },

    /// Invalid values/weights for a discrete distribution.
    #[error("invalid distribution: {0}")]
    Distribution(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Failure inside the eigensolver or the matrix inverse.
    #[error(transparent)]
    Linalg(#[from] ndarray_linalg::error::LinalgError),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}
