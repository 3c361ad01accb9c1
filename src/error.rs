use thiserror::Error;

/// Errors raised at the boundary of a flow, transform or distribution call.
///
/// Constructors that validate structure return these as `Err`. Tensor-path
/// violations are raised immediately through [`raise`], since a bijection
/// fed the wrong shape has no meaningful value to return.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FlowError {
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("batch size mismatch in {context}: {left} vs {right}")]
    BatchMismatch {
        context: &'static str,
        left: usize,
        right: usize,
    },

    #[error("class label out of range: got [{min}, {max}], expected [0, {num_classes})")]
    LabelOutOfRange { min: i64, max: i64, num_classes: usize },

    #[error("{context}: dimension {dim} of size {size} is not divisible by {factor}")]
    NotDivisible {
        context: &'static str,
        dim: usize,
        size: usize,
        factor: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("multiscale levels disagree: {bases} bases, {flows} flow stacks, {merges} merges")]
    LevelMismatch {
        bases: usize,
        flows: usize,
        merges: usize,
    },
}

pub type Result<T> = std::result::Result<T, FlowError>;

/// Panics with the error message when a tensor-path check fails.
#[track_caller]
pub(crate) fn raise(check: Result<()>) {
    if let Err(err) = check {
        panic!("{err}");
    }
}
