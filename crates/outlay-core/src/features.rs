//! Feature construction and daily aggregation
//!
//! Turns raw expense records into the fixed-width numeric vectors the
//! anomaly detector scores, and into the gap-free daily series the
//! forecaster consumes. Numeric features are left unnormalized for tree
//! scoring (partition trees are scale-invariant per dimension); z-score
//! normalization is provided separately for the seasonal model.

use std::collections::HashMap;

use chrono::{Datelike, NaiveDate, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{CategorySpend, DailySeries, DailyTotal, ExpenseRecord, SpendingSummary};

/// Number of numeric (non-one-hot) features: amount, hour, day-of-week,
/// day-of-month
const NUMERIC_FEATURES: usize = 4;

/// Category and payment-method vocabularies, frozen at fit time
///
/// Versioned with the fitted model: inference must reuse the vocabularies the
/// detector was fitted on so dimensionality stays stable. Unseen labels map
/// to an explicit "unknown" slot rather than failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    categories: Vec<String>,
    payment_methods: Vec<String>,
}

impl Vocabulary {
    /// Freeze vocabularies from a user's historical records
    pub fn from_records(records: &[ExpenseRecord]) -> Self {
        let mut categories: Vec<String> = records
            .iter()
            .map(|r| normalize_label(&r.category))
            .collect();
        categories.sort();
        categories.dedup();

        let mut payment_methods: Vec<String> = records
            .iter()
            .map(|r| normalize_label(&r.payment_method))
            .collect();
        payment_methods.sort();
        payment_methods.dedup();

        Self {
            categories,
            payment_methods,
        }
    }

    /// Total feature dimensionality under this vocabulary, including the
    /// unknown slots
    pub fn dimension(&self) -> usize {
        NUMERIC_FEATURES + self.categories.len() + 1 + self.payment_methods.len() + 1
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    /// Offset of the category one-hot slot for `label`; the last slot is the
    /// unknown bucket
    fn category_slot(&self, label: &str) -> usize {
        let normalized = normalize_label(label);
        self.categories
            .iter()
            .position(|c| *c == normalized)
            .unwrap_or(self.categories.len())
    }

    fn payment_slot(&self, label: &str) -> usize {
        let normalized = normalize_label(label);
        self.payment_methods
            .iter()
            .position(|p| *p == normalized)
            .unwrap_or(self.payment_methods.len())
    }
}

/// Fixed-width numeric feature vector for one expense record
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: Vec<f64>,
}

impl FeatureVector {
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }
}

/// Builds feature vectors and daily aggregates from raw records
pub struct FeatureBuilder;

impl FeatureBuilder {
    /// Build the feature vector for a single record under frozen vocabularies
    pub fn build(record: &ExpenseRecord, vocabulary: &Vocabulary) -> FeatureVector {
        let mut values = vec![0.0; vocabulary.dimension()];

        values[0] = record.amount;
        values[1] = f64::from(record.timestamp.hour());
        values[2] = f64::from(record.timestamp.weekday().num_days_from_monday());
        values[3] = f64::from(record.timestamp.day());

        let category_base = NUMERIC_FEATURES;
        values[category_base + vocabulary.category_slot(&record.category)] = 1.0;

        let payment_base = NUMERIC_FEATURES + vocabulary.categories.len() + 1;
        values[payment_base + vocabulary.payment_slot(&record.payment_method)] = 1.0;

        FeatureVector { values }
    }

    /// Build vectors for a whole history slice
    pub fn build_all(records: &[ExpenseRecord], vocabulary: &Vocabulary) -> Vec<FeatureVector> {
        records
            .iter()
            .map(|r| Self::build(r, vocabulary))
            .collect()
    }

    /// Aggregate records into a gap-free daily series over `[start, end]`
    ///
    /// Days without spend get an explicit zero entry; the result always has
    /// `(end - start).num_days() + 1` points.
    pub fn aggregate(
        records: &[ExpenseRecord],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<DailySeries> {
        if end < start {
            return Err(Error::InvalidDateRange { start, end });
        }

        let mut by_day: HashMap<NaiveDate, f64> = HashMap::new();
        for record in records {
            let date = record.timestamp.date_naive();
            if date >= start && date <= end {
                *by_day.entry(date).or_insert(0.0) += record.amount;
            }
        }

        let mut points = Vec::new();
        let mut date = start;
        while date <= end {
            points.push(DailyTotal {
                date,
                total: by_day.get(&date).copied().unwrap_or(0.0),
            });
            date = date.succ_opt().ok_or_else(|| Error::InvalidDateRange {
                start,
                end,
            })?;
        }

        DailySeries::new(points)
    }

    /// Summarize spending over a window: total, daily average, and a
    /// per-category breakdown sorted descending by amount
    pub fn summarize(
        records: &[ExpenseRecord],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<SpendingSummary> {
        if end < start {
            return Err(Error::InvalidDateRange { start, end });
        }

        let mut by_category: HashMap<String, (f64, usize)> = HashMap::new();
        let mut total_spend = 0.0;
        for record in records {
            let date = record.timestamp.date_naive();
            if date < start || date > end {
                continue;
            }
            let entry = by_category
                .entry(normalize_label(&record.category))
                .or_insert((0.0, 0));
            entry.0 += record.amount;
            entry.1 += 1;
            total_spend += record.amount;
        }

        let mut categories: Vec<CategorySpend> = by_category
            .into_iter()
            .map(|(category, (amount, transaction_count))| CategorySpend {
                category,
                amount,
                share_of_total: if total_spend > 0.0 {
                    amount / total_spend
                } else {
                    0.0
                },
                transaction_count,
            })
            .collect();
        categories.sort_by(|a, b| {
            b.amount
                .partial_cmp(&a.amount)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let window_days = (end - start).num_days() + 1;
        Ok(SpendingSummary {
            start_date: start,
            end_date: end,
            total_spend,
            daily_average: total_spend / window_days as f64,
            categories,
        })
    }

    /// Z-score normalize a series; zero-variance input maps to all zeros
    /// rather than dividing by zero
    pub fn zscore(values: &[f64]) -> (Vec<f64>, f64, f64) {
        if values.is_empty() {
            return (Vec::new(), 0.0, 1.0);
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        let std = variance.sqrt();
        if std == 0.0 {
            return (vec![0.0; values.len()], mean, 1.0);
        }
        let normalized = values.iter().map(|v| (v - mean) / std).collect();
        (normalized, mean, std)
    }
}

/// Normalize a free-form label from the upstream parser
pub(crate) fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn record(id: i64, amount: f64, category: &str, payment: &str, day: u32) -> ExpenseRecord {
        ExpenseRecord {
            id,
            user_id: 1,
            amount,
            category: category.to_string(),
            payment_method: payment.to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, day, 12, 30, 0).unwrap(),
            description: String::new(),
        }
    }

    #[test]
    fn test_vocabulary_freezes_sorted_unique_labels() {
        let records = vec![
            record(1, 100.0, "Food", "UPI", 1),
            record(2, 50.0, "food ", "cash", 2),
            record(3, 900.0, "rent", "upi", 3),
        ];
        let vocab = Vocabulary::from_records(&records);
        assert_eq!(vocab.categories(), &["food".to_string(), "rent".to_string()]);
        // 4 numeric + 2 categories + unknown + 2 payment methods + unknown
        assert_eq!(vocab.dimension(), 9);
    }

    #[test]
    fn test_build_sets_numeric_and_one_hot_features() {
        let history = vec![
            record(1, 100.0, "food", "upi", 1),
            record(2, 50.0, "rent", "cash", 2),
        ];
        let vocab = Vocabulary::from_records(&history);
        let vector = FeatureBuilder::build(&history[0], &vocab);

        assert_eq!(vector.dimension(), vocab.dimension());
        let values = vector.as_slice();
        assert!((values[0] - 100.0).abs() < 1e-9); // amount
        assert!((values[1] - 12.0).abs() < 1e-9); // hour
        assert!((values[3] - 1.0).abs() < 1e-9); // day of month
        assert!((values[4] - 1.0).abs() < 1e-9); // "food" one-hot
    }

    #[test]
    fn test_unseen_category_maps_to_unknown_slot() {
        let history = vec![
            record(1, 100.0, "food", "upi", 1),
            record(2, 50.0, "rent", "cash", 2),
        ];
        let vocab = Vocabulary::from_records(&history);
        let novel = record(3, 75.0, "electronics", "upi", 3);
        let vector = FeatureBuilder::build(&novel, &vocab);

        // Dimensionality stays stable and the unknown category slot is hot
        assert_eq!(vector.dimension(), vocab.dimension());
        let unknown_slot = NUMERIC_FEATURES + vocab.categories().len();
        assert!((vector.as_slice()[unknown_slot] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_zero_fills_gaps() {
        // Spend on days 1, 2, and 6 — days 3, 4, 5 are a gap
        let records = vec![
            record(1, 100.0, "food", "upi", 1),
            record(2, 40.0, "food", "upi", 2),
            record(3, 60.0, "rent", "cash", 6),
        ];
        let start = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2026, 3, 6).unwrap();
        let series = FeatureBuilder::aggregate(&records, start, end).unwrap();

        assert_eq!(series.len() as i64, (end - start).num_days() + 1);
        let totals = series.totals();
        assert_eq!(&totals[2..5], &[0.0, 0.0, 0.0]);
        assert!((totals[0] - 100.0).abs() < 1e-9);
        assert!((totals[5] - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_sums_same_day_records() {
        let records = vec![
            record(1, 100.0, "food", "upi", 1),
            record(2, 25.0, "transport", "cash", 1),
        ];
        let start = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let series = FeatureBuilder::aggregate(&records, start, start).unwrap();
        assert_eq!(series.len(), 1);
        assert!((series.totals()[0] - 125.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_rejects_inverted_range() {
        let start = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let end = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert!(FeatureBuilder::aggregate(&[], start, end).is_err());
    }

    #[test]
    fn test_summarize_shares_and_ordering() {
        let records = vec![
            record(1, 300.0, "rent", "upi", 1),
            record(2, 100.0, "food", "upi", 2),
            record(3, 100.0, "food", "cash", 3),
        ];
        let start = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2026, 3, 5).unwrap();
        let summary = FeatureBuilder::summarize(&records, start, end).unwrap();

        assert!((summary.total_spend - 500.0).abs() < 1e-9);
        assert!((summary.daily_average - 100.0).abs() < 1e-9);
        assert_eq!(summary.categories[0].category, "rent");
        assert!((summary.categories[0].share_of_total - 0.6).abs() < 1e-9);
        assert_eq!(summary.categories[1].transaction_count, 2);
    }

    #[test]
    fn test_zscore_degenerate_input() {
        let (normalized, mean, std) = FeatureBuilder::zscore(&[5.0, 5.0, 5.0]);
        assert_eq!(normalized, vec![0.0, 0.0, 0.0]);
        assert!((mean - 5.0).abs() < 1e-9);
        assert!((std - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_zscore_round_trips() {
        let values = [1.0, 2.0, 3.0, 4.0];
        let (normalized, mean, std) = FeatureBuilder::zscore(&values);
        for (n, v) in normalized.iter().zip(values.iter()) {
            assert!((n * std + mean - v).abs() < 1e-9);
        }
    }
}
