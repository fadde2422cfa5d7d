//! Random-forest churn classifier
//!
//! Bagged CART trees grown on Gini impurity with a random feature subset per
//! split. The churn probability is the mean over trees of the class-1
//! fraction in the leaf a sample falls into.

use crate::error::ChurnError;
use linfa::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How many candidate features each split considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MaxFeatures {
    #[default]
    Sqrt,
    All,
}

impl MaxFeatures {
    fn count(self, n_features: usize) -> usize {
        match self {
            MaxFeatures::Sqrt => ((n_features as f64).sqrt() as usize).max(1),
            MaxFeatures::All => n_features.max(1),
        }
    }
}

/// Random-forest hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    /// `None` grows trees until leaves are pure or too small to split.
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub max_features: MaxFeatures,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: None,
            min_samples_split: 2,
            max_features: MaxFeatures::Sqrt,
            seed: 42,
        }
    }
}

impl ForestParams {
    pub fn new(n_estimators: usize, max_depth: Option<usize>) -> Self {
        Self {
            n_estimators,
            max_depth,
            ..Self::default()
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn validate(&self) -> Result<(), ChurnError> {
        if self.n_estimators == 0 {
            return Err(ChurnError::invalid("n_estimators", "must be at least 1"));
        }
        if self.max_depth == Some(0) {
            return Err(ChurnError::invalid("max_depth", "must be at least 1 or unlimited"));
        }
        if self.min_samples_split < 2 {
            return Err(ChurnError::invalid("min_samples_split", "must be at least 2"));
        }
        Ok(())
    }
}

impl fmt::Display for ForestParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max_depth {
            Some(depth) => write!(f, "n_estimators={}, max_depth={}", self.n_estimators, depth),
            None => write!(f, "n_estimators={}, max_depth=None", self.n_estimators),
        }
    }
}

impl Fit<Array2<f64>, Array1<usize>, ChurnError> for ForestParams {
    type Object = RandomForest;

    fn fit(&self, dataset: &DatasetBase<Array2<f64>, Array1<usize>>) -> Result<RandomForest, ChurnError> {
        self.validate()?;

        let records = dataset.records();
        let targets = dataset.targets();
        let (n_samples, n_features) = records.dim();
        if n_samples == 0 {
            return Err(ChurnError::InsufficientData {
                what: "training samples",
                required: 1,
                actual: 0,
            });
        }
        if targets.len() != n_samples {
            return Err(ChurnError::invalid(
                "targets",
                format!("{} labels for {} samples", targets.len(), n_samples),
            ));
        }
        if let Some(bad) = targets.iter().find(|&&t| t > 1) {
            return Err(ChurnError::invalid("targets", format!("label {} is not binary", bad)));
        }

        let x = records.view();
        let y = targets.as_slice().map(<[usize]>::to_vec).unwrap_or_else(|| targets.to_vec());
        let trees = (0..self.n_estimators)
            .into_par_iter()
            .map(|tree_idx| {
                let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(tree_idx as u64));
                let bootstrap: Vec<usize> = (0..n_samples).map(|_| rng.gen_range(0..n_samples)).collect();
                DecisionTree::grow(x, &y, bootstrap, self, &mut rng)
            })
            .collect();

        Ok(RandomForest {
            trees,
            n_features,
            params: self.clone(),
        })
    }
}

/// Fitted random forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    trees: Vec<DecisionTree>,
    n_features: usize,
    params: ForestParams,
}

impl RandomForest {
    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// P(churn) for one feature vector.
    pub fn predict_proba_row(&self, features: ArrayView1<f64>) -> crate::Result<f64> {
        if features.len() != self.n_features {
            anyhow::bail!(
                "Feature vector must have exactly {} dimensions, got {}",
                self.n_features,
                features.len()
            );
        }
        let total: f64 = self.trees.iter().map(|t| t.leaf_probability(features)).sum();
        Ok(total / self.trees.len() as f64)
    }

    /// P(churn) for every row of `features`.
    pub fn predict_proba(&self, features: ArrayView2<f64>) -> crate::Result<Array1<f64>> {
        features
            .outer_iter()
            .map(|row| self.predict_proba_row(row))
            .collect::<crate::Result<Vec<f64>>>()
            .map(Array1::from)
    }

    /// Hard labels at the 0.5 threshold.
    pub fn predict(&self, features: ArrayView2<f64>) -> crate::Result<Array1<usize>> {
        Ok(self.predict_proba(features)?.mapv(classify))
    }
}

/// Label for a churn probability: 1 iff `probability >= 0.5`.
pub fn classify(probability: f64) -> usize {
    usize::from(probability >= 0.5)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf {
        probability: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// CART tree stored as a node arena; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DecisionTree {
    nodes: Vec<Node>,
}

struct Split {
    feature: usize,
    threshold: f64,
    impurity: f64,
}

impl DecisionTree {
    fn grow(
        x: ArrayView2<f64>,
        y: &[usize],
        samples: Vec<usize>,
        params: &ForestParams,
        rng: &mut StdRng,
    ) -> Self {
        let mut tree = DecisionTree { nodes: Vec::new() };
        tree.build(x, y, samples, 0, params, rng);
        tree
    }

    fn build(
        &mut self,
        x: ArrayView2<f64>,
        y: &[usize],
        samples: Vec<usize>,
        depth: usize,
        params: &ForestParams,
        rng: &mut StdRng,
    ) -> usize {
        let n = samples.len();
        let positives = samples.iter().filter(|&&i| y[i] == 1).count();
        let probability = if n == 0 { 0.0 } else { positives as f64 / n as f64 };
        let node_idx = self.nodes.len();
        self.nodes.push(Node::Leaf { probability });

        let pure = positives == 0 || positives == n;
        let depth_reached = params.max_depth.is_some_and(|d| depth >= d);
        if pure || depth_reached || n < params.min_samples_split {
            return node_idx;
        }

        let Some(split) = best_split(x, y, &samples, positives, params.max_features, rng) else {
            return node_idx;
        };

        let (left_samples, right_samples): (Vec<usize>, Vec<usize>) = samples
            .into_iter()
            .partition(|&i| x[[i, split.feature]] <= split.threshold);

        let left = self.build(x, y, left_samples, depth + 1, params, rng);
        let right = self.build(x, y, right_samples, depth + 1, params, rng);
        self.nodes[node_idx] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        node_idx
    }

    fn leaf_probability(&self, features: ArrayView1<f64>) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { probability } => return *probability,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if features[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

fn gini(positives: usize, n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = positives as f64 / n as f64;
    2.0 * p * (1.0 - p)
}

/// Lowest weighted Gini split over a random feature subset, if any split separates the samples.
fn best_split(
    x: ArrayView2<f64>,
    y: &[usize],
    samples: &[usize],
    positives: usize,
    max_features: MaxFeatures,
    rng: &mut StdRng,
) -> Option<Split> {
    let n = samples.len();
    let n_features = x.ncols();
    let parent = gini(positives, n);
    let mut best: Option<Split> = None;

    let candidates = sample(rng, n_features, max_features.count(n_features).min(n_features));
    let mut column: Vec<(f64, usize)> = Vec::with_capacity(n);
    for feature in candidates.iter() {
        column.clear();
        column.extend(samples.iter().map(|&i| (x[[i, feature]], y[i])));
        column.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut left_n = 0;
        let mut left_pos = 0;
        for k in 0..n - 1 {
            left_n += 1;
            left_pos += column[k].1;
            let (here, next) = (column[k].0, column[k + 1].0);
            if here == next {
                continue;
            }
            let right_n = n - left_n;
            let right_pos = positives - left_pos;
            let impurity = (left_n as f64 * gini(left_pos, left_n)
                + right_n as f64 * gini(right_pos, right_n))
                / n as f64;
            if impurity < parent && best.as_ref().map_or(true, |b| impurity < b.impurity) {
                best = Some(Split {
                    feature,
                    threshold: here + (next - here) / 2.0,
                    impurity,
                });
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn separable() -> (Array2<f64>, Array1<usize>) {
        let x = array![
            [0.1, 5.0],
            [0.2, 3.0],
            [0.3, 4.0],
            [0.4, 1.0],
            [0.6, 2.0],
            [0.7, 5.0],
            [0.8, 3.0],
            [0.9, 1.0],
        ];
        let y = array![0, 0, 0, 0, 1, 1, 1, 1];
        (x, y)
    }

    #[test]
    fn test_fit_forest() {
        let (x, y) = separable();
        let dataset = Dataset::new(x, y);
        let forest = ForestParams::new(25, None).fit(&dataset).unwrap();

        assert_eq!(forest.n_trees(), 25);
        assert_eq!(forest.n_features(), 2);
    }

    #[test]
    fn test_separable_data_is_learned() {
        let (x, y) = separable();
        let dataset = Dataset::new(x.clone(), y.clone());
        let params = ForestParams {
            max_features: MaxFeatures::All,
            ..ForestParams::new(30, None)
        };
        let forest = params.fit(&dataset).unwrap();

        let low = forest.predict_proba_row(array![0.05, 3.0].view()).unwrap();
        let high = forest.predict_proba_row(array![0.95, 3.0].view()).unwrap();
        assert!(low < 0.5, "low = {low}");
        assert!(high > 0.5, "high = {high}");
    }

    #[test]
    fn test_probabilities_bounded_and_labels_consistent() {
        let (x, y) = separable();
        let dataset = Dataset::new(x.clone(), y);
        let forest = ForestParams::new(15, Some(2)).fit(&dataset).unwrap();

        let probs = forest.predict_proba(x.view()).unwrap();
        let labels = forest.predict(x.view()).unwrap();
        for (p, l) in probs.iter().zip(labels.iter()) {
            assert!((0.0..=1.0).contains(p));
            assert_eq!(*l, usize::from(*p >= 0.5));
        }
    }

    #[test]
    fn test_same_seed_same_forest() {
        let (x, y) = separable();
        let dataset = Dataset::new(x, y);
        let a = ForestParams::new(10, None).seed(7).fit(&dataset).unwrap();
        let b = ForestParams::new(10, None).seed(7).fit(&dataset).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_depth_limit() {
        let (x, y) = separable();
        let dataset = Dataset::new(x, y);
        let forest = ForestParams::new(5, Some(1)).fit(&dataset).unwrap();
        // A stump has at most one split and two leaves.
        assert!(forest.trees.iter().all(|t| t.nodes.len() <= 3));
    }

    #[test]
    fn test_invalid_params() {
        let (x, y) = separable();
        let dataset = Dataset::new(x, y);
        assert!(ForestParams::new(0, None).fit(&dataset).is_err());
        assert!(ForestParams::new(5, Some(0)).fit(&dataset).is_err());
    }

    #[test]
    fn test_non_binary_targets_rejected() {
        let (x, _) = separable();
        let dataset = Dataset::new(x, array![0, 1, 2, 0, 1, 0, 1, 0]);
        assert!(matches!(
            ForestParams::new(3, None).fit(&dataset),
            Err(ChurnError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_wrong_width_rejected() {
        let (x, y) = separable();
        let forest = ForestParams::new(3, None).fit(&Dataset::new(x, y)).unwrap();
        assert!(forest.predict_proba_row(array![0.1].view()).is_err());
    }

    #[test]
    fn test_classify_threshold() {
        assert_eq!(classify(0.5), 1);
        assert_eq!(classify(0.4999), 0);
        assert_eq!(classify(1.0), 1);
        assert_eq!(classify(0.0), 0);
    }

    #[test]
    fn test_gini() {
        assert_eq!(gini(0, 10), 0.0);
        assert_eq!(gini(10, 10), 0.0);
        assert!((gini(5, 10) - 0.5).abs() < 1e-12);
    }
}
