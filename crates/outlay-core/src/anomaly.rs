//! Isolation-forest anomaly scoring
//!
//! An ensemble of randomized partition trees scores how isolated a new
//! expense is relative to the user's own history. Splits are fully random —
//! no information-gain criterion — which makes path length sensitive to
//! isolation rather than classification quality. The decision threshold is
//! calibrated per user from the training-score distribution, and the
//! human-readable explanation is computed independently of the ensemble.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::features::{normalize_label, FeatureBuilder, FeatureVector, Vocabulary};
use crate::models::{AnomalyExplanation, AnomalyOutcome, AnomalyResult, ExpenseRecord};

const EULER_MASCHERONI: f64 = 0.577_215_664_901_532_9;

/// Anomaly detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Number of trees in the ensemble
    pub tree_count: usize,
    /// Maximum points sampled per tree
    pub subsample_size: usize,
    /// Minimum historical records before the detector will score at all;
    /// below this it abstains
    pub min_history: usize,
    /// Expected fraction of history that is truly anomalous; calibrates the
    /// decision threshold as the (1 − contamination) training-score quantile
    pub contamination: f64,
    /// Minimum records in a category before a statistical explanation is
    /// attempted
    pub min_category_history: usize,
    /// Seed for tree construction; pinned so scoring is reproducible
    pub seed: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            tree_count: 100,
            subsample_size: 256,
            min_history: 20,
            contamination: 0.1,
            min_category_history: 3,
            seed: 42,
        }
    }
}

/// Historical amount statistics for one category
#[derive(Debug, Clone, Copy)]
struct CategoryStats {
    count: usize,
    mean: f64,
    /// Population standard deviation
    std: f64,
}

#[derive(Debug, Clone)]
enum TreeNode {
    Split {
        dimension: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
    Leaf {
        size: usize,
    },
}

/// Expected path length of an unsuccessful search in a binary search tree of
/// `n` points; normalizes raw path lengths into comparable scores
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_MASCHERONI) - 2.0 * (n - 1.0) / n
        }
    }
}

fn grow_tree(
    data: &[Vec<f64>],
    indices: &[usize],
    depth: usize,
    max_depth: usize,
    rng: &mut StdRng,
) -> TreeNode {
    if indices.len() <= 1 || depth >= max_depth {
        return TreeNode::Leaf {
            size: indices.len(),
        };
    }

    // Only dimensions with spread can separate anything
    let dimension_count = data[0].len();
    let mut candidates = Vec::new();
    for d in 0..dimension_count {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &i in indices {
            min = min.min(data[i][d]);
            max = max.max(data[i][d]);
        }
        if max > min {
            candidates.push((d, min, max));
        }
    }

    if candidates.is_empty() {
        // All points identical on every dimension
        return TreeNode::Leaf {
            size: indices.len(),
        };
    }

    let (dimension, min, max) = candidates[rng.gen_range(0..candidates.len())];
    let threshold = rng.gen_range(min..max);

    let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
        .iter()
        .copied()
        .partition(|&i| data[i][dimension] < threshold);

    TreeNode::Split {
        dimension,
        threshold,
        left: Box::new(grow_tree(data, &left_idx, depth + 1, max_depth, rng)),
        right: Box::new(grow_tree(data, &right_idx, depth + 1, max_depth, rng)),
    }
}

fn path_length(node: &TreeNode, values: &[f64], depth: f64) -> f64 {
    match node {
        TreeNode::Leaf { size } => depth + average_path_length(*size),
        TreeNode::Split {
            dimension,
            threshold,
            left,
            right,
        } => {
            if values[*dimension] < *threshold {
                path_length(left, values, depth + 1.0)
            } else {
                path_length(right, values, depth + 1.0)
            }
        }
    }
}

/// Total order on feature vectors so the fit depends only on the training
/// multiset, not the order records were supplied in
fn compare_vectors(a: &[f64], b: &[f64]) -> std::cmp::Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.partial_cmp(y) {
            Some(std::cmp::Ordering::Equal) | None => continue,
            Some(ordering) => return ordering,
        }
    }
    std::cmp::Ordering::Equal
}

/// A fitted ensemble, ready to score records against the history it was
/// trained on
///
/// Carries the frozen vocabulary it was fitted with; a record scored here is
/// featurized under that vocabulary so dimensionality always matches.
#[derive(Debug, Clone)]
pub struct FittedDetector {
    trees: Vec<TreeNode>,
    /// c(sample_size), the path-length normalizer
    normalization: f64,
    threshold: f64,
    vocabulary: Vocabulary,
    category_stats: HashMap<String, CategoryStats>,
    trained_records: usize,
    min_category_history: usize,
}

impl FittedDetector {
    /// Isolation score in (0, 1] for an already-built feature vector
    pub fn score(&self, vector: &FeatureVector) -> Result<f64> {
        if vector.dimension() != self.vocabulary.dimension() {
            return Err(Error::DimensionMismatch {
                expected: self.vocabulary.dimension(),
                actual: vector.dimension(),
            });
        }

        let total: f64 = self
            .trees
            .iter()
            .map(|tree| path_length(tree, vector.as_slice(), 0.0))
            .sum();
        let mean_path = total / self.trees.len() as f64;
        Ok(2f64.powf(-mean_path / self.normalization))
    }

    /// Score and threshold a record, attaching the category-statistics
    /// explanation
    pub fn classify(&self, record: &ExpenseRecord) -> Result<AnomalyResult> {
        let vector = FeatureBuilder::build(record, &self.vocabulary);
        let score = self.score(&vector)?;
        Ok(AnomalyResult {
            record_id: record.id,
            is_anomaly: score > self.threshold,
            score,
            explanation: self.explain(record),
        })
    }

    /// Compare the record's amount to its category's historical mean and
    /// standard deviation
    ///
    /// Independent of the isolation score: the two can disagree, and both
    /// are reported.
    pub fn explain(&self, record: &ExpenseRecord) -> AnomalyExplanation {
        let category = normalize_label(&record.category);
        let stats = match self.category_stats.get(&category) {
            Some(stats) if stats.count >= self.min_category_history => *stats,
            _ => return AnomalyExplanation::Generic { category },
        };

        if stats.std > 0.0 {
            AnomalyExplanation::ZScore {
                category,
                amount: record.amount,
                category_mean: stats.mean,
                category_std: stats.std,
                z_score: (record.amount - stats.mean) / stats.std,
            }
        } else if stats.mean > 0.0 {
            // Zero-variance category: a z-score is undefined, degrade to a
            // ratio against the single observed value
            AnomalyExplanation::Ratio {
                category,
                amount: record.amount,
                category_mean: stats.mean,
                ratio: record.amount / stats.mean,
            }
        } else {
            AnomalyExplanation::Generic { category }
        }
    }

    /// Calibrated decision threshold (the (1 − contamination) training-score
    /// quantile)
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Number of records the ensemble was fitted on
    pub fn trained_records(&self) -> usize {
        self.trained_records
    }
}

/// Builds fitted ensembles from user history
#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    config: DetectorConfig,
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn has_sufficient_history(&self, record_count: usize) -> bool {
        record_count >= self.config.min_history
    }

    /// Fit an ensemble on a user's history
    ///
    /// Callers that want abstention semantics instead of an error should go
    /// through [`AnomalyDetector::evaluate`] or check
    /// [`AnomalyDetector::has_sufficient_history`] first.
    pub fn fit(&self, history: &[ExpenseRecord]) -> Result<FittedDetector> {
        if !self.has_sufficient_history(history.len()) {
            return Err(Error::InvalidData(format!(
                "need at least {} records to fit, got {}",
                self.config.min_history,
                history.len()
            )));
        }

        let vocabulary = Vocabulary::from_records(history);
        let mut data: Vec<Vec<f64>> = FeatureBuilder::build_all(history, &vocabulary)
            .into_iter()
            .map(|v| v.as_slice().to_vec())
            .collect();
        // Canonical ordering: the fit is a function of the training multiset
        // and the seed, not the order records arrived in
        data.sort_by(|a, b| compare_vectors(a, b));

        let n = data.len();
        let sample_size = n.min(self.config.subsample_size.max(2));
        let max_depth = (sample_size as f64).log2().ceil().max(1.0) as usize;
        let mut rng = StdRng::seed_from_u64(self.config.seed);

        let mut trees = Vec::with_capacity(self.config.tree_count);
        for _ in 0..self.config.tree_count {
            let indices: Vec<usize> = if n > sample_size {
                rand::seq::index::sample(&mut rng, n, sample_size).into_vec()
            } else {
                (0..n).collect()
            };
            trees.push(grow_tree(&data, &indices, 0, max_depth, &mut rng));
        }

        let mut fitted = FittedDetector {
            trees,
            normalization: average_path_length(sample_size).max(f64::EPSILON),
            threshold: 0.0,
            vocabulary,
            category_stats: category_statistics(history),
            trained_records: n,
            min_category_history: self.config.min_category_history,
        };
        fitted.threshold = self.calibrate_threshold(&fitted, &data);

        debug!(
            records = n,
            trees = fitted.trees.len(),
            threshold = fitted.threshold,
            "Fitted anomaly ensemble"
        );
        Ok(fitted)
    }

    /// One-shot evaluation: fit on history, score the record, abstain when
    /// history is too thin
    pub fn evaluate(
        &self,
        history: &[ExpenseRecord],
        record: &ExpenseRecord,
    ) -> Result<AnomalyOutcome> {
        if !self.has_sufficient_history(history.len()) {
            return Ok(AnomalyOutcome::InsufficientHistory {
                available: history.len(),
                required: self.config.min_history,
            });
        }
        let fitted = self.fit(history)?;
        Ok(AnomalyOutcome::Scored(fitted.classify(record)?))
    }

    /// The decision threshold is the (1 − contamination) quantile of the
    /// training-set score distribution — self-calibrating per user rather
    /// than a fixed constant
    fn calibrate_threshold(&self, fitted: &FittedDetector, data: &[Vec<f64>]) -> f64 {
        let mut scores: Vec<f64> = data
            .iter()
            .map(|values| {
                let total: f64 = fitted
                    .trees
                    .iter()
                    .map(|tree| path_length(tree, values, 0.0))
                    .sum();
                let mean_path = total / fitted.trees.len() as f64;
                2f64.powf(-mean_path / fitted.normalization)
            })
            .collect();
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let quantile = (1.0 - self.config.contamination.clamp(0.0, 0.5)).clamp(0.5, 1.0);
        let index = ((scores.len() - 1) as f64 * quantile).round() as usize;
        scores[index]
    }
}

fn category_statistics(history: &[ExpenseRecord]) -> HashMap<String, CategoryStats> {
    let mut amounts: HashMap<String, Vec<f64>> = HashMap::new();
    for record in history {
        amounts
            .entry(normalize_label(&record.category))
            .or_default()
            .push(record.amount);
    }

    amounts
        .into_iter()
        .map(|(category, values)| {
            let count = values.len();
            let mean = values.iter().sum::<f64>() / count as f64;
            let variance =
                values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
            (
                category,
                CategoryStats {
                    count,
                    mean,
                    std: variance.sqrt(),
                },
            )
        })
        .collect()
}
