//! ChurnForge: telecom customer churn prediction
//!
//! This library cleans historical customer tables, learns a type-aware
//! feature transformation together with a random-forest classifier, and
//! scores single customers or whole tables with the persisted model.

pub mod cli;
pub mod data;
pub mod error;
pub mod inference;
pub mod metrics;
pub mod model;
pub mod preprocess;
pub mod record;
pub mod train;

// Re-export public items for easier access
pub use cli::Args;
pub use data::{clean, read_table, split_features, write_table, CleanConfig, LabelPolicy, MissingPolicy};
pub use error::ChurnError;
pub use inference::{load, predict_batch, predict_one, ModelArtifact, ModelService, Prediction};
pub use model::{ForestParams, RandomForest};
pub use preprocess::{build_preprocessor, FittedTransformation, Preprocessor};
pub use record::{CustomerRecord, FieldValue, TELCO_FEATURE_COLUMNS};
pub use train::{train, train_table, ParamGrid, TrainConfig, TrainReport};

/// Common result type used throughout the application
pub type Result<T> = anyhow::Result<T>;
