use ir_tensor::TensorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("operator `{op_type}` failed: {source}")]
    Operator {
        op_type: String,
        #[source]
        source: Box<ExecutorError>,
    },
    #[error("operator `{op_type}` reached the end of its input")]
    EndOfInput { op_type: String },
    #[error("operator `{op_type}` panicked: {message}")]
    Panic { op_type: String, message: String },
    #[error("operator `{op_type}` produced NaN or Inf in variable `{var}`")]
    NanOrInf { op_type: String, var: String },
    #[error("fatal: {0}")]
    InvariantViolation(String),
    #[error("variable not found: {0}")]
    VarNotFound(String),
    #[error("operator type `{0}` is not registered")]
    UnregisteredOp(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("expected {expected} feed tensors, got {got}")]
    FeedMismatch { expected: usize, got: usize },
    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),
    #[error("failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl ExecutorError {
    /// Shorthand used by operators that exhaust a data source.
    pub fn end_of_input(op_type: impl Into<String>) -> Self {
        ExecutorError::EndOfInput {
            op_type: op_type.into(),
        }
    }

    pub fn is_end_of_input(&self) -> bool {
        matches!(self, ExecutorError::EndOfInput { .. })
    }

    /// Attach the failing operator to a kernel error.
    ///
    /// End-of-input signals and errors that already name their operator are
    /// returned unchanged.
    pub(crate) fn in_operator(self, op_type: &str) -> Self {
        match self {
            e @ (ExecutorError::Operator { .. }
            | ExecutorError::EndOfInput { .. }
            | ExecutorError::Panic { .. }
            | ExecutorError::NanOrInf { .. }) => e,
            other => ExecutorError::Operator {
                op_type: op_type.to_string(),
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
