//! Model artifact persistence and churn scoring.
//!
//! The artifact bundles the fitted transformation with the fitted forest so
//! that every future input goes through exactly the preprocessing learned at
//! training time. It is immutable once written.

use crate::error::ChurnError;
use crate::model::{classify, ForestParams, RandomForest};
use crate::preprocess::FittedTransformation;
use crate::record::CustomerRecord;
use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Default location of the persisted model.
pub const DEFAULT_MODEL_PATH: &str = "models/churn_model.pkl";

/// Column holding the predicted label in batch output.
pub const PREDICTION_COLUMN: &str = "Churn_Pred";

/// Column holding the churn probability (percent) in batch output.
pub const PROBABILITY_COLUMN: &str = "Churn_Prob";

/// Facts about the training run stored alongside the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub target_column: String,
    pub params: ForestParams,
    pub cv_roc_auc: f64,
    pub holdout_roc_auc: f64,
    pub trained_at: DateTime<Utc>,
}

/// Fitted transformation and classifier persisted as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub transformation: FittedTransformation,
    pub classifier: RandomForest,
    pub metadata: ArtifactMetadata,
}

/// Outcome of scoring one customer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// 1 = churns, 0 = stays.
    pub label: usize,
    /// P(churn) in [0, 1].
    pub probability: f64,
}

impl Prediction {
    fn from_probability(probability: f64) -> Self {
        Self {
            label: classify(probability),
            probability,
        }
    }

    pub fn percent(&self) -> f64 {
        self.probability * 100.0
    }

    pub fn outcome(&self) -> &'static str {
        if self.label == 1 {
            "Churn"
        } else {
            "Stay"
        }
    }
}

impl ModelArtifact {
    /// Write the artifact, creating parent directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, self)
            .map_err(|e| anyhow::anyhow!("Cannot write model to {}: {}", path.display(), e))?;
        info!(path = %path.display(), "saved model artifact");
        Ok(())
    }

    /// Score one record.
    pub fn predict_one(&self, record: &CustomerRecord) -> crate::Result<Prediction> {
        let features = self.transformation.transform_record(record)?;
        let probability = self.classifier.predict_proba_row(features.view())?;
        Ok(Prediction::from_probability(probability))
    }

    /// Score every row of `table` and return a copy with the label and
    /// percentage probability appended.
    pub fn predict_batch(&self, table: &DataFrame) -> crate::Result<DataFrame> {
        for name in [PREDICTION_COLUMN, PROBABILITY_COLUMN] {
            if table.get_column_names().iter().any(|c| c.as_str() == name) {
                return Err(ChurnError::OutputColumnExists(name.to_string()).into());
            }
        }

        let features = self.transformation.transform_frame(table)?;
        let probabilities = self.classifier.predict_proba(features.view())?;

        let labels: Vec<i32> = probabilities.iter().map(|&p| classify(p) as i32).collect();
        let percents: Vec<f64> = probabilities
            .iter()
            .map(|&p| (p * 100.0 * 100.0).round() / 100.0)
            .collect();

        let mut out = table.clone();
        out.with_column(Series::new(PREDICTION_COLUMN.into(), labels))?;
        out.with_column(Series::new(PROBABILITY_COLUMN.into(), percents))?;
        debug!(rows = out.height(), "scored batch");
        Ok(out)
    }

    /// Raw input columns a record or table must provide.
    pub fn required_columns(&self) -> Vec<String> {
        self.transformation.input_columns()
    }
}

/// Load an artifact; `Ok(None)` when nothing exists at `path`.
pub fn load(path: impl AsRef<Path>) -> crate::Result<Option<ModelArtifact>> {
    let path = path.as_ref();
    if !path.exists() {
        debug!(path = %path.display(), "no model artifact");
        return Ok(None);
    }
    let reader = BufReader::new(File::open(path)?);
    let artifact: ModelArtifact = bincode::deserialize_from(reader)
        .map_err(|e| anyhow::anyhow!("Cannot decode model at {}: {}", path.display(), e))?;
    info!(
        path = %path.display(),
        trees = artifact.classifier.n_trees(),
        features = artifact.transformation.n_features(),
        "loaded model artifact"
    );
    Ok(Some(artifact))
}

/// Score one record with `artifact`.
pub fn predict_one(artifact: &ModelArtifact, record: &CustomerRecord) -> crate::Result<Prediction> {
    artifact.predict_one(record)
}

/// Score a table with `artifact`.
pub fn predict_batch(artifact: &ModelArtifact, table: &DataFrame) -> crate::Result<DataFrame> {
    artifact.predict_batch(table)
}

/// Loads the artifact at a fixed path once and shares it for the life of the service.
#[derive(Debug)]
pub struct ModelService {
    path: PathBuf,
    artifact: OnceLock<Option<Arc<ModelArtifact>>>,
}

impl ModelService {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            artifact: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The shared artifact, loading it on first use. Absence is memoized too.
    pub fn artifact(&self) -> crate::Result<Option<Arc<ModelArtifact>>> {
        if let Some(cached) = self.artifact.get() {
            return Ok(cached.clone());
        }
        let loaded = load(&self.path)?.map(Arc::new);
        // Another thread may have won the race; either value came from the same file.
        let _ = self.artifact.set(loaded);
        Ok(self.artifact.get().cloned().flatten())
    }

    /// Forget the cached artifact so the next call reloads from disk.
    pub fn invalidate(&mut self) {
        self.artifact.take();
    }

    pub fn predict_one(&self, record: &CustomerRecord) -> crate::Result<Option<Prediction>> {
        self.artifact()?
            .map(|artifact| artifact.predict_one(record))
            .transpose()
    }

    pub fn predict_batch(&self, table: &DataFrame) -> crate::Result<Option<DataFrame>> {
        self.artifact()?
            .map(|artifact| artifact.predict_batch(table))
            .transpose()
    }
}

impl Default for ModelService {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL_PATH)
    }
}
