use thiserror::Error;

use crate::params::ParamName;

/// Errors raised by batching, the parameter tree and the recurrent layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LstmError {
    /// An array did not have the shape the operation needs.
    #[error("shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Number of sequences differs from the batch the operation belongs to.
    #[error("batch size mismatch: expected {expected} sequences, got {got}")]
    BatchSizeMismatch { expected: usize, got: usize },

    /// A parameter was read before it was declared on its node.
    #[error("parameter {param} is not allocated on node '{node}'")]
    UnallocatedParameter { node: String, param: ParamName },

    /// A backprop tape was handed to a layer that did not produce it.
    #[error("backprop tape belongs to a different layer")]
    ForeignTape,

    /// The layer's weights changed between the forward pass and backprop.
    #[error("backprop tape is stale: weights were updated after the forward pass")]
    StaleTape,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, LstmError>;
