//! Offline training: stratified holdout, cross-validated grid search, final fit.

use crate::data::{churn_distribution, clean, read_table, split_features, CleanConfig, LabelPolicy};
use crate::error::ChurnError;
use crate::inference::{ArtifactMetadata, ModelArtifact};
use crate::metrics::{roc_auc, ClassificationReport};
use crate::model::{classify, ForestParams, MaxFeatures};
use crate::preprocess::{build_preprocessor, Preprocessor, RawFeatures};
use crate::record::DEFAULT_TARGET;
use chrono::Utc;
use linfa::prelude::*;
use ndarray::Array1;
use polars::prelude::DataFrame;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info};

/// Default location of the training data.
pub const DEFAULT_DATA_PATH: &str = "data/Telco-Customer-Churn.csv";

/// Hyperparameter grid searched under cross-validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGrid {
    pub n_estimators: Vec<usize>,
    pub max_depth: Vec<Option<usize>>,
}

impl Default for ParamGrid {
    fn default() -> Self {
        Self {
            n_estimators: vec![100, 200],
            max_depth: vec![Some(8), Some(12), None],
        }
    }
}

impl ParamGrid {
    /// Every combination, ensemble size varying slowest.
    pub fn candidates(&self, seed: u64) -> Vec<ForestParams> {
        self.n_estimators
            .iter()
            .flat_map(|&n| {
                self.max_depth
                    .iter()
                    .map(move |&depth| ForestParams::new(n, depth).seed(seed))
            })
            .collect()
    }
}

/// Training run configuration.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub data_path: PathBuf,
    pub model_out: PathBuf,
    pub target_column: String,
    pub clean: CleanConfig,
    pub labels: LabelPolicy,
    /// Fraction of rows held out for the final report.
    pub test_size: f64,
    pub cv_folds: usize,
    pub seed: u64,
    pub grid: ParamGrid,
    pub max_features: MaxFeatures,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from(DEFAULT_DATA_PATH),
            model_out: PathBuf::from(crate::inference::DEFAULT_MODEL_PATH),
            target_column: DEFAULT_TARGET.to_string(),
            clean: CleanConfig::default(),
            labels: LabelPolicy::default(),
            test_size: 0.2,
            cv_folds: 3,
            seed: 42,
            grid: ParamGrid::default(),
            max_features: MaxFeatures::Sqrt,
        }
    }
}

impl TrainConfig {
    fn validate(&self) -> Result<(), ChurnError> {
        if !(self.test_size > 0.0 && self.test_size < 1.0) {
            return Err(ChurnError::invalid("test_size", "must be strictly between 0 and 1"));
        }
        if self.cv_folds < 2 {
            return Err(ChurnError::invalid("cv_folds", "must be at least 2"));
        }
        if self.grid.n_estimators.is_empty() || self.grid.max_depth.is_empty() {
            return Err(ChurnError::invalid("grid", "every grid axis needs at least one value"));
        }
        Ok(())
    }
}

/// Mean cross-validated ROC-AUC of one grid candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateScore {
    pub params: ForestParams,
    pub fold_scores: Vec<f64>,
    pub mean_auc: f64,
}

/// What a training run measured.
#[derive(Debug, Clone)]
pub struct TrainReport {
    pub n_rows: usize,
    pub n_train: usize,
    pub n_test: usize,
    /// Churn share (0-1) of the cleaned table, train partition and holdout.
    pub churn_rate: f64,
    pub train_churn_rate: f64,
    pub test_churn_rate: f64,
    pub candidates: Vec<CandidateScore>,
    pub best_params: ForestParams,
    pub best_cv_auc: f64,
    pub accuracy: f64,
    pub roc_auc: f64,
    pub report: ClassificationReport,
}

impl fmt::Display for TrainReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Rows: {} (train {}, holdout {})",
            self.n_rows, self.n_train, self.n_test
        )?;
        writeln!(
            f,
            "Churn rate: {:.1}% overall, {:.1}% train, {:.1}% holdout",
            self.churn_rate * 100.0,
            self.train_churn_rate * 100.0,
            self.test_churn_rate * 100.0
        )?;
        writeln!(f, "Best params: {} (CV ROC AUC {:.4})", self.best_params, self.best_cv_auc)?;
        writeln!(f, "Accuracy: {:.4}", self.accuracy)?;
        writeln!(f, "ROC AUC: {:.4}", self.roc_auc)?;
        write!(f, "{}", self.report)
    }
}

/// Preprocessing plus classifier, fit as one unit so transformation statistics
/// only ever come from the rows the classifier is trained on.
#[derive(Debug, Clone)]
pub struct ChurnPipeline {
    pub preprocessor: Preprocessor,
    pub params: ForestParams,
}

impl ChurnPipeline {
    pub fn new(preprocessor: Preprocessor, params: ForestParams) -> Self {
        Self {
            preprocessor,
            params,
        }
    }

    /// Fit the transformation and the forest on `raw`, returning the fitted pair.
    pub fn fit(
        &self,
        raw: &RawFeatures,
        labels: &[usize],
    ) -> crate::Result<(crate::preprocess::FittedTransformation, crate::model::RandomForest)> {
        let transformation = self.preprocessor.fit(raw)?;
        let x = transformation.transform(raw)?;
        let dataset = Dataset::new(x, Array1::from(labels.to_vec()));
        let forest = self.params.fit(&dataset)?;
        Ok((transformation, forest))
    }

    /// Fit on `train` rows and return churn probabilities for `eval` rows.
    fn fit_score(
        &self,
        raw: &RawFeatures,
        labels: &[usize],
        train: &[usize],
        eval: &[usize],
    ) -> crate::Result<Vec<f64>> {
        let train_labels: Vec<usize> = train.iter().map(|&i| labels[i]).collect();
        let (transformation, forest) = self.fit(&raw.select(train), &train_labels)?;
        let x_eval = transformation.transform(&raw.select(eval))?;
        Ok(forest.predict_proba(x_eval.view())?.to_vec())
    }
}

/// Stratified train/holdout partition: each class contributes `round(count * test_size)` rows to the holdout.
pub fn stratified_split(labels: &[usize], test_size: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();
    for class in [0, 1] {
        let mut idx: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == class).collect();
        idx.shuffle(&mut rng);
        let n_test = (idx.len() as f64 * test_size).round() as usize;
        test.extend_from_slice(&idx[..n_test]);
        train.extend_from_slice(&idx[n_test..]);
    }
    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

/// Stratified k-fold over `rows`: each class is dealt round-robin across folds.
/// Returns `(train, validation)` index pairs into the original table.
pub fn stratified_folds(
    rows: &[usize],
    labels: &[usize],
    k: usize,
    seed: u64,
) -> Vec<(Vec<usize>, Vec<usize>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut assignment: Vec<Vec<usize>> = vec![Vec::new(); k];
    for class in [0, 1] {
        let mut idx: Vec<usize> = rows.iter().copied().filter(|&i| labels[i] == class).collect();
        idx.shuffle(&mut rng);
        for (pos, row) in idx.into_iter().enumerate() {
            assignment[pos % k].push(row);
        }
    }
    (0..k)
        .map(|fold| {
            let mut validation = assignment[fold].clone();
            validation.sort_unstable();
            let mut train: Vec<usize> = assignment
                .iter()
                .enumerate()
                .filter(|(other, _)| *other != fold)
                .flat_map(|(_, rows)| rows.iter().copied())
                .collect();
            train.sort_unstable();
            (train, validation)
        })
        .collect()
}

fn churn_rate(labels: &[usize], rows: &[usize]) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    rows.iter().filter(|&&i| labels[i] == 1).count() as f64 / rows.len() as f64
}

/// Load, clean, fit and persist according to `config`.
pub fn train(config: &TrainConfig) -> crate::Result<TrainReport> {
    let raw = read_table(&config.data_path)?;
    let (artifact, report) = train_table(&raw, config)?;
    artifact.save(&config.model_out)?;
    Ok(report)
}

/// Run the full training procedure on an already loaded table.
pub fn train_table(table: &DataFrame, config: &TrainConfig) -> crate::Result<(ModelArtifact, TrainReport)> {
    config.validate()?;

    let cleaned = clean(table, &config.clean)?;
    if cleaned.height() == 0 {
        return Err(ChurnError::EmptyTrainingSet.into());
    }
    let (features, labels) = split_features(&cleaned, &config.target_column, config.labels)?;
    let (stay, churn) = churn_distribution(&labels);
    info!(rows = labels.len(), stay_pct = stay, churn_pct = churn, "class distribution");

    let labels = labels.to_vec();
    let positives = labels.iter().filter(|&&l| l == 1).count();
    if positives == 0 || positives == labels.len() {
        return Err(ChurnError::SingleClass {
            class: usize::from(positives > 0),
        }
        .into());
    }

    let preprocessor = build_preprocessor(&features);
    let raw = preprocessor.extract(&features)?;

    let (train_rows, test_rows) = stratified_split(&labels, config.test_size, config.seed);
    let smallest_class = [0, 1]
        .iter()
        .map(|&c| train_rows.iter().filter(|&&i| labels[i] == c).count())
        .min()
        .unwrap_or(0);
    if smallest_class < config.cv_folds {
        return Err(ChurnError::InsufficientData {
            what: "training rows per class for cross-validation",
            required: config.cv_folds,
            actual: smallest_class,
        }
        .into());
    }
    let test_positives = test_rows.iter().filter(|&&i| labels[i] == 1).count();
    if test_positives == 0 || test_positives == test_rows.len() {
        return Err(ChurnError::InsufficientData {
            what: "holdout rows per class",
            required: 1,
            actual: test_positives.min(test_rows.len() - test_positives),
        }
        .into());
    }
    info!(
        train = train_rows.len(),
        holdout = test_rows.len(),
        train_churn = churn_rate(&labels, &train_rows),
        holdout_churn = churn_rate(&labels, &test_rows),
        "stratified split"
    );

    let candidates: Vec<ForestParams> = config
        .grid
        .candidates(config.seed)
        .into_iter()
        .map(|p| ForestParams {
            max_features: config.max_features,
            ..p
        })
        .collect();
    let folds = stratified_folds(&train_rows, &labels, config.cv_folds, config.seed);

    let jobs: Vec<(usize, usize)> = (0..candidates.len())
        .flat_map(|c| (0..folds.len()).map(move |f| (c, f)))
        .collect();
    let scores: Vec<(usize, f64)> = jobs
        .par_iter()
        .map(|&(c, f)| -> crate::Result<(usize, f64)> {
            let (fold_train, fold_eval) = &folds[f];
            let pipeline = ChurnPipeline::new(preprocessor.clone(), candidates[c].clone());
            let probs = pipeline.fit_score(&raw, &labels, fold_train, fold_eval)?;
            let truth: Vec<usize> = fold_eval.iter().map(|&i| labels[i]).collect();
            Ok((c, roc_auc(&truth, &probs)?))
        })
        .collect::<crate::Result<Vec<_>>>()?;

    let ranked: Vec<CandidateScore> = candidates
        .iter()
        .enumerate()
        .map(|(c, params)| {
            let fold_scores: Vec<f64> = scores
                .iter()
                .filter(|(idx, _)| *idx == c)
                .map(|(_, s)| *s)
                .collect();
            let mean_auc = fold_scores.iter().sum::<f64>() / fold_scores.len() as f64;
            debug!(params = %params, mean_auc, "cross-validated candidate");
            CandidateScore {
                params: params.clone(),
                fold_scores,
                mean_auc,
            }
        })
        .collect();

    // Earliest candidate wins ties.
    let best = ranked
        .iter()
        .fold(None::<&CandidateScore>, |best, c| match best {
            Some(b) if b.mean_auc >= c.mean_auc => Some(b),
            _ => Some(c),
        })
        .ok_or_else(|| ChurnError::invalid("grid", "no candidates"))?
        .clone();
    info!(params = %best.params, cv_auc = best.mean_auc, "selected hyperparameters");

    let pipeline = ChurnPipeline::new(preprocessor, best.params.clone());
    let train_labels: Vec<usize> = train_rows.iter().map(|&i| labels[i]).collect();
    let (transformation, classifier) = pipeline.fit(&raw.select(&train_rows), &train_labels)?;

    let x_test = transformation.transform(&raw.select(&test_rows))?;
    let test_probs = classifier.predict_proba(x_test.view())?.to_vec();
    let test_truth: Vec<usize> = test_rows.iter().map(|&i| labels[i]).collect();
    let test_pred: Vec<usize> = test_probs.iter().map(|&p| classify(p)).collect();
    let holdout_auc = roc_auc(&test_truth, &test_probs)?;
    let report = ClassificationReport::new(&test_truth, &test_pred);
    info!(accuracy = report.accuracy, roc_auc = holdout_auc, "holdout evaluation");

    let artifact = ModelArtifact {
        transformation,
        classifier,
        metadata: ArtifactMetadata {
            target_column: config.target_column.clone(),
            params: best.params.clone(),
            cv_roc_auc: best.mean_auc,
            holdout_roc_auc: holdout_auc,
            trained_at: Utc::now(),
        },
    };

    let report = TrainReport {
        n_rows: labels.len(),
        n_train: train_rows.len(),
        n_test: test_rows.len(),
        churn_rate: churn / 100.0,
        train_churn_rate: churn_rate(&labels, &train_rows),
        test_churn_rate: churn_rate(&labels, &test_rows),
        best_params: best.params,
        best_cv_auc: best.mean_auc,
        candidates: ranked,
        accuracy: report.accuracy,
        roc_auc: holdout_auc,
        report,
    };
    Ok((artifact, report))
}
