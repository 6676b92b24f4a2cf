//! Domain models for the expense analytics core

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque user identifier assigned by the persistence collaborator
pub type UserId = i64;

/// A single expense record
///
/// Owned by the persistence collaborator; the core only reads it. The
/// `description` field is opaque here — natural-language understanding
/// happens upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpenseRecord {
    pub id: i64,
    pub user_id: UserId,
    /// Positive, currency-agnostic amount
    pub amount: f64,
    /// Open label set produced by the upstream parser (e.g. "food", "rent")
    pub category: String,
    /// Open label set (e.g. "upi", "cash", "credit card")
    pub payment_method: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
}

/// Total spend for one calendar day
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyTotal {
    pub date: NaiveDate,
    pub total: f64,
}

/// Ordered daily spend series with no calendar gaps
///
/// Days without spend carry an explicit zero entry — absence of spend is a
/// signal, not missing data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySeries {
    points: Vec<DailyTotal>,
}

impl DailySeries {
    /// Build a series, validating the gap-free invariant.
    ///
    /// Dates must be strictly increasing by exactly one day. Prefer
    /// [`crate::features::FeatureBuilder::aggregate`] which constructs valid
    /// series from raw records.
    pub fn new(points: Vec<DailyTotal>) -> Result<Self> {
        if points.is_empty() {
            return Err(Error::InvalidData("daily series cannot be empty".into()));
        }
        for pair in points.windows(2) {
            let expected = pair[0].date.succ_opt();
            if expected != Some(pair[1].date) {
                return Err(Error::InvalidDateRange {
                    start: pair[0].date,
                    end: pair[1].date,
                });
            }
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[DailyTotal] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn start_date(&self) -> NaiveDate {
        self.points[0].date
    }

    pub fn end_date(&self) -> NaiveDate {
        self.points[self.points.len() - 1].date
    }

    /// Daily totals without dates, in calendar order
    pub fn totals(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.total).collect()
    }

    pub fn total_spend(&self) -> f64 {
        self.points.iter().map(|p| p.total).sum()
    }

    /// Number of days with non-zero spend
    pub fn nonzero_days(&self) -> usize {
        self.points.iter().filter(|p| p.total > 0.0).count()
    }
}

/// One forecasted day of spend with an uncertainty interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub date: NaiveDate,
    pub predicted_amount: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    /// Set for per-category forecasts, `None` for the total series
    pub category: Option<String>,
}

/// Which model produced a forecast
///
/// The choice is a runtime branch on data sufficiency; each variant carries
/// enough metadata to tell the caller what was actually fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ForecastModel {
    /// Piecewise-linear trend + Fourier seasonality
    Seasonal {
        yearly: bool,
        changepoints: usize,
    },
    /// Low-order AR on differenced daily totals
    Autoregressive { order: usize },
    /// Moving-average baseline
    Naive { window_days: usize },
}

impl ForecastModel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Seasonal { .. } => "seasonal",
            Self::Autoregressive { .. } => "autoregressive",
            Self::Naive { .. } => "naive",
        }
    }

    pub fn is_fallback(&self) -> bool {
        !matches!(self, Self::Seasonal { .. })
    }
}

impl std::fmt::Display for ForecastModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A complete forecast for the days after a series' end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub model: ForecastModel,
    pub points: Vec<ForecastPoint>,
    pub total_predicted: f64,
}

impl Forecast {
    /// Sum of predicted amounts over the first `days` of the horizon
    pub fn predicted_through(&self, days: usize) -> f64 {
        self.points
            .iter()
            .take(days)
            .map(|p| p.predicted_amount)
            .sum()
    }
}

/// Forecast for one category's series, with summary statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryForecast {
    pub category: String,
    pub daily_average: f64,
    /// Population standard deviation of the category's daily totals
    pub volatility: f64,
    /// Points carry the category label
    pub forecast: Forecast,
}

/// Structured comparison of an amount against its category history
///
/// Generated independently of the isolation score; the two can disagree and
/// both are reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalyExplanation {
    /// Amount expressed in standard deviations from the category mean
    ZScore {
        category: String,
        amount: f64,
        category_mean: f64,
        category_std: f64,
        z_score: f64,
    },
    /// Zero-variance category: fall back to a ratio against the single
    /// observed value
    Ratio {
        category: String,
        amount: f64,
        category_mean: f64,
        ratio: f64,
    },
    /// Too little category history for a statistical comparison
    Generic { category: String },
}

impl AnomalyExplanation {
    /// Render the comparison as a human-readable sentence
    pub fn summary(&self) -> String {
        match self {
            Self::ZScore {
                category,
                amount,
                z_score,
                ..
            } => {
                let direction = if *z_score >= 0.0 { "above" } else { "below" };
                format!(
                    "₹{:.2} is {:.1} standard deviations {} your usual {} spend",
                    amount,
                    z_score.abs(),
                    direction,
                    category
                )
            }
            Self::Ratio {
                category,
                amount,
                category_mean,
                ratio,
            } => format!(
                "₹{:.2} is {:.1}x your usual {} spend of ₹{:.2}",
                amount, ratio, category, category_mean
            ),
            Self::Generic { category } => format!(
                "Not enough {} history for a statistical comparison",
                category
            ),
        }
    }
}

/// Anomaly classification for a single record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub record_id: i64,
    pub is_anomaly: bool,
    /// Isolation score in (0, 1]; near 1 = strongly isolated, near 0.5 = typical
    pub score: f64,
    pub explanation: AnomalyExplanation,
}

/// Outcome of an anomaly evaluation request
///
/// The detector abstains rather than inventing a score when history is too
/// thin, so callers always get something actionable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AnomalyOutcome {
    Scored(AnomalyResult),
    InsufficientHistory { available: usize, required: usize },
}

impl AnomalyOutcome {
    pub fn as_scored(&self) -> Option<&AnomalyResult> {
        match self {
            Self::Scored(result) => Some(result),
            Self::InsufficientHistory { .. } => None,
        }
    }
}

/// Budget envelope derived from the user's income and savings goal
///
/// Supplied by the user-preferences collaborator; immutable input here.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetEnvelope {
    pub monthly_income: f64,
    /// Fraction of income the user wants to save, in [0, 1]
    pub savings_goal_fraction: f64,
}

impl BudgetEnvelope {
    pub fn new(monthly_income: f64, savings_goal_fraction: f64) -> Result<Self> {
        if !monthly_income.is_finite() || monthly_income <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "monthly income must be positive, got {}",
                monthly_income
            )));
        }
        if !(0.0..=1.0).contains(&savings_goal_fraction) {
            return Err(Error::InvalidConfig(format!(
                "savings goal fraction must be in [0, 1], got {}",
                savings_goal_fraction
            )));
        }
        Ok(Self {
            monthly_income,
            savings_goal_fraction,
        })
    }

    /// Maximum spend for the period: income × (1 − savings goal)
    pub fn derived_budget(&self) -> f64 {
        self.monthly_income * (1.0 - self.savings_goal_fraction)
    }
}

/// Budget-overrun projection for the current period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub projected_total: f64,
    pub actual_spend_so_far: f64,
    pub envelope: BudgetEnvelope,
    pub derived_budget: f64,
    pub exceeds: bool,
    /// Signed difference projected − budget; negative means margin remaining
    pub overage_amount: f64,
    pub days_remaining_in_period: i64,
}

/// Outcome of a budget evaluation request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BudgetEvaluation {
    Evaluated(BudgetAlert),
    /// No envelope supplied (user has not set an income); never guessed
    Unconfigured,
}

impl BudgetEvaluation {
    pub fn as_alert(&self) -> Option<&BudgetAlert> {
        match self {
            Self::Evaluated(alert) => Some(alert),
            Self::Unconfigured => None,
        }
    }
}

/// Spend in one category over a summary window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorySpend {
    pub category: String,
    pub amount: f64,
    /// Fraction of the window's total spend, in [0, 1]
    pub share_of_total: f64,
    pub transaction_count: usize,
}

/// Aggregate spending statistics for a date window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendingSummary {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub total_spend: f64,
    pub daily_average: f64,
    /// Sorted descending by amount
    pub categories: Vec<CategorySpend>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn test_daily_series_rejects_gaps() {
        let points = vec![
            DailyTotal {
                date: day(1),
                total: 10.0,
            },
            DailyTotal {
                date: day(3),
                total: 5.0,
            },
        ];
        assert!(DailySeries::new(points).is_err());
    }

    #[test]
    fn test_daily_series_rejects_empty() {
        assert!(DailySeries::new(vec![]).is_err());
    }

    #[test]
    fn test_daily_series_accessors() {
        let series = DailySeries::new(vec![
            DailyTotal {
                date: day(1),
                total: 10.0,
            },
            DailyTotal {
                date: day(2),
                total: 0.0,
            },
            DailyTotal {
                date: day(3),
                total: 5.0,
            },
        ])
        .unwrap();

        assert_eq!(series.len(), 3);
        assert_eq!(series.start_date(), day(1));
        assert_eq!(series.end_date(), day(3));
        assert_eq!(series.nonzero_days(), 2);
        assert!((series.total_spend() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_envelope_derived_budget() {
        let envelope = BudgetEnvelope::new(100_000.0, 0.5).unwrap();
        assert!((envelope.derived_budget() - 50_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_envelope_validation() {
        assert!(BudgetEnvelope::new(-1.0, 0.2).is_err());
        assert!(BudgetEnvelope::new(50_000.0, 1.5).is_err());
    }

    #[test]
    fn test_explanation_summaries() {
        let above = AnomalyExplanation::ZScore {
            category: "food".to_string(),
            amount: 2500.0,
            category_mean: 400.0,
            category_std: 150.0,
            z_score: 14.0,
        };
        assert!(above.summary().contains("above your usual food spend"));

        let ratio = AnomalyExplanation::Ratio {
            category: "rent".to_string(),
            amount: 30000.0,
            category_mean: 15000.0,
            ratio: 2.0,
        };
        assert!(ratio.summary().contains("2.0x"));
    }

    #[test]
    fn test_forecast_model_name() {
        let model = ForecastModel::Autoregressive { order: 3 };
        assert_eq!(model.name(), "autoregressive");
        assert!(model.is_fallback());
        assert!(!ForecastModel::Seasonal {
            yearly: false,
            changepoints: 5
        }
        .is_fallback());
    }
}
