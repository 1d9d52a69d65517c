//! Ensemble classifier: decision trees fit on bootstrap samples, each over a
//! random subset of the feature columns. The positive-class probability is
//! the fraction of members voting for a stroke.

use std::fmt;

use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::tree::decision_tree_classifier::{
    DecisionTreeClassifier, DecisionTreeClassifierParameters,
};

use crate::error::ModelError;
use crate::transform::FeatureMatrix;

type Tree = DecisionTreeClassifier<f64, i32, DenseMatrix<f64>, Vec<i32>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_depth: u16,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Columns per tree; square root of the feature count when unset.
    pub max_features: Option<usize>,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 10,
            min_samples_split: 5,
            min_samples_leaf: 2,
            max_features: None,
            seed: 42,
        }
    }
}

impl ForestParams {
    fn features_per_tree(&self, n_features: usize) -> usize {
        let k = self
            .max_features
            .unwrap_or_else(|| (n_features as f64).sqrt().round() as usize);
        k.clamp(1, n_features)
    }

    fn tree_parameters(&self) -> DecisionTreeClassifierParameters {
        DecisionTreeClassifierParameters::default()
            .with_max_depth(self.max_depth)
            .with_min_samples_split(self.min_samples_split)
            .with_min_samples_leaf(self.min_samples_leaf)
    }
}

#[derive(Serialize, Deserialize)]
enum Member {
    Tree { features: Vec<usize>, tree: Tree },
    /// Bootstrap sample held a single class.
    Constant(i32),
}

#[derive(Serialize, Deserialize)]
pub struct StrokeForest {
    n_features: usize,
    members: Vec<Member>,
}

impl fmt::Debug for StrokeForest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrokeForest")
            .field("n_features", &self.n_features)
            .field("n_trees", &self.members.len())
            .finish()
    }
}

impl StrokeForest {
    pub fn fit(x: &FeatureMatrix, y: &[i32], params: &ForestParams) -> Result<Self, ModelError> {
        if x.nrows() != y.len() {
            return Err(ModelError::Classifier(format!(
                "{} rows but {} labels",
                x.nrows(),
                y.len()
            )));
        }
        if x.nrows() == 0 || params.n_trees == 0 {
            return Err(ModelError::Classifier(
                "cannot fit a forest without rows or trees".to_string(),
            ));
        }

        let n = x.nrows();
        let k = params.features_per_tree(x.ncols());
        let tree_params = params.tree_parameters();
        let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
        let mut members = Vec::with_capacity(params.n_trees);

        for _ in 0..params.n_trees {
            let rows: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            let mut features = index::sample(&mut rng, x.ncols(), k).into_vec();
            features.sort_unstable();

            let labels: Vec<i32> = rows.iter().map(|&r| y[r]).collect();
            if labels.iter().all(|&label| label == labels[0]) {
                members.push(Member::Constant(labels[0]));
                continue;
            }

            let sample = x.select(&rows, &features).to_dense();
            let tree: Tree = DecisionTreeClassifier::fit(&sample, &labels, tree_params.clone())
                .map_err(|e| ModelError::Classifier(e.to_string()))?;
            members.push(Member::Tree { features, tree });
        }

        log::debug!(
            "fitted forest of {} members over {} rows, {} features per tree",
            members.len(),
            n,
            k
        );

        Ok(Self {
            n_features: x.ncols(),
            members,
        })
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.members.len()
    }

    /// Positive-class probability for every row.
    pub fn predict_proba(&self, x: &FeatureMatrix) -> Result<Vec<f64>, ModelError> {
        if x.ncols() != self.n_features {
            return Err(ModelError::FeatureCount {
                expected: self.n_features,
                found: x.ncols(),
            });
        }
        if self.members.is_empty() {
            return Err(ModelError::Classifier("forest has no members".to_string()));
        }

        let all_rows: Vec<usize> = (0..x.nrows()).collect();
        let mut votes = vec![0usize; x.nrows()];
        for member in &self.members {
            match member {
                Member::Constant(label) => {
                    if *label == 1 {
                        votes.iter_mut().for_each(|v| *v += 1);
                    }
                }
                Member::Tree { features, tree } => {
                    let sample = x.select(&all_rows, features).to_dense();
                    let predicted = tree
                        .predict(&sample)
                        .map_err(|e| ModelError::Classifier(e.to_string()))?;
                    for (vote, label) in votes.iter_mut().zip(predicted) {
                        if label == 1 {
                            *vote += 1;
                        }
                    }
                }
            }
        }

        let total = self.members.len() as f64;
        Ok(votes.into_iter().map(|v| v as f64 / total).collect())
    }

    /// Class labels; ties go to the negative class.
    pub fn predict(&self, x: &FeatureMatrix) -> Result<Vec<i32>, ModelError> {
        Ok(self
            .predict_proba(x)?
            .into_iter()
            .map(label_for)
            .collect())
    }
}

pub fn label_for(probability: f64) -> i32 {
    if probability > 0.5 {
        1
    } else {
        0
    }
}
