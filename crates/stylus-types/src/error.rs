// ─────────────────────────────────────────────────────────────────────
// Stylus Kernel — Error Hierarchy
// ─────────────────────────────────────────────────────────────────────

use thiserror::Error;

/// Root error type for all Stylus kernel failures.
///
/// Every variant is fatal for the run that raised it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StyleError {
    /// Inputs violate a run precondition (image shapes, batch size, channels).
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// Feature extractor contains a layer kind the pipeline cannot host.
    #[error("unrecognized layer at position {position}: {type_name}")]
    UnrecognizedLayer { position: usize, type_name: String },

    /// Pipeline construction failed (duplicate names, no probe positions).
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Tensor or layer shapes disagree.
    #[error("shape error: {0}")]
    Shape(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Numerical error (NaN/Inf in the total loss).
    #[error("numerical error: {0}")]
    Numerical(String),
}

pub type StyleResult<T> = Result<T, StyleError>;
