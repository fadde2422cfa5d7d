//! Typed failures raised by the churn pipeline.
//!
//! Orchestration code returns [`crate::Result`]; these variants travel inside it
//! and can be recovered with `err.downcast_ref::<ChurnError>()`.

use thiserror::Error;

/// Errors that can occur while preparing data, training or scoring.
#[derive(Error, Debug)]
pub enum ChurnError {
    /// Required feature columns are absent from the input.
    #[error("Missing columns in input: [{}]", .0.join(", "))]
    MissingColumns(Vec<String>),

    /// A single record carried fields the model was not trained on.
    #[error("Unexpected fields in record: [{}]", .0.join(", "))]
    UnexpectedFields(Vec<String>),

    /// The label column is not present in the training table.
    #[error("Target column '{0}' not found")]
    MissingTarget(String),

    /// Cleaning removed every row.
    #[error("Training set is empty after cleaning")]
    EmptyTrainingSet,

    /// Every training label has the same value.
    #[error("Training labels contain a single class ({class}); both churn and stay examples are required")]
    SingleClass { class: usize },

    /// A label token outside the recognized yes/no vocabulary under the strict policy.
    #[error("Unrecognized label value '{0}'")]
    UnrecognizedLabel(String),

    /// A numeric feature holds text that is neither blank nor a number.
    #[error("Column '{column}' expects a number, got '{value}'")]
    NonNumericValue { column: String, value: String },

    /// Not enough rows to carry out a split or fit.
    #[error("Insufficient data: need at least {required} {what}, got {actual}")]
    InsufficientData {
        what: &'static str,
        required: usize,
        actual: usize,
    },

    /// Invalid parameter value.
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// Batch output would overwrite an existing input column.
    #[error("Input already contains output column '{0}'")]
    OutputColumnExists(String),

    /// Error bubbled up from the linfa dataset layer.
    #[error(transparent)]
    Linfa(#[from] linfa::Error),
}

impl ChurnError {
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
