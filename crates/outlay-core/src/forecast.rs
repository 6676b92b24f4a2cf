//! Daily spend forecasting
//!
//! The primary model is an additive decomposition: changepoint-aware
//! piecewise-linear trend plus Fourier-basis weekly (and, with enough
//! history, yearly) seasonality, fit by ridge-regularized least squares.
//! When history is too short for seasonal estimation the forecaster falls
//! back to a low-order autoregressive model on differenced daily totals, and
//! below that to a moving-average baseline. The branch is a runtime decision
//! on data sufficiency, reported to the caller via the model tag on the
//! result. Every path is deterministic for identical input and config.

use std::collections::HashMap;
use std::f64::consts::TAU;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::features::{normalize_label, FeatureBuilder};
use crate::models::{
    CategoryForecast, DailySeries, ExpenseRecord, Forecast, ForecastModel, ForecastPoint,
};

/// Days per week and per (average) year, as Fourier periods
const WEEKLY_PERIOD: f64 = 7.0;
const YEARLY_PERIOD: f64 = 365.25;

/// Forecaster configuration
///
/// The fallback thresholds are tunable policy, not hard contracts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecasterConfig {
    /// Days to forecast past the end of the series
    pub horizon_days: usize,
    /// Minimum non-zero spend days before the seasonal model is attempted
    pub min_seasonal_days: usize,
    /// Minimum series length before the autoregressive model is attempted
    pub min_ar_points: usize,
    /// Maximum autoregressive order
    pub ar_order: usize,
    /// Maximum candidate trend changepoints
    pub changepoint_count: usize,
    /// Fourier order for weekly seasonality
    pub weekly_fourier_order: usize,
    /// Fourier order for yearly seasonality
    pub yearly_fourier_order: usize,
    /// Minimum series length before yearly seasonality is included
    pub yearly_min_days: usize,
    /// Ridge regularization strength for the least-squares fits
    pub ridge_lambda: f64,
    /// Coverage of the uncertainty interval (e.g. 0.9 → 5%/95% residual
    /// quantiles)
    pub interval_quantile: f64,
    /// Days in the moving-average baseline window
    pub naive_window_days: usize,
}

impl Default for ForecasterConfig {
    fn default() -> Self {
        Self {
            horizon_days: 30,
            min_seasonal_days: 14,
            min_ar_points: 2,
            ar_order: 3,
            changepoint_count: 8,
            weekly_fourier_order: 3,
            yearly_fourier_order: 10,
            yearly_min_days: 365,
            ridge_lambda: 0.1,
            interval_quantile: 0.9,
            naive_window_days: 7,
        }
    }
}

/// Internal result of fitting one model: raw horizon predictions plus the
/// in-sample residuals used for interval width
struct ModelFit {
    model: ForecastModel,
    predictions: Vec<f64>,
    residuals: Vec<f64>,
}

/// Produces daily spend forecasts with uncertainty intervals
#[derive(Debug, Clone, Default)]
pub struct SeriesForecaster {
    config: ForecasterConfig,
}

impl SeriesForecaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ForecasterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ForecasterConfig {
        &self.config
    }

    /// Forecast the days after the series' end
    ///
    /// Never fails: data-sufficiency and fit problems degrade through the
    /// autoregressive and naive fallbacks instead.
    pub fn forecast(&self, series: &DailySeries) -> Forecast {
        self.forecast_labeled(series, None)
    }

    fn forecast_labeled(&self, series: &DailySeries, category: Option<String>) -> Forecast {
        let totals = series.totals();
        let horizon = self.config.horizon_days.max(1);

        let fit = if series.nonzero_days() >= self.config.min_seasonal_days {
            self.fit_seasonal(&totals, horizon).or_else(|| {
                warn!(
                    days = totals.len(),
                    "Seasonal fit did not converge, falling back to autoregressive"
                );
                self.fit_autoregressive(&totals, horizon)
            })
        } else if totals.len() >= self.config.min_ar_points {
            self.fit_autoregressive(&totals, horizon)
        } else {
            None
        };
        let fit = fit.unwrap_or_else(|| self.fit_naive(&totals, horizon));

        debug!(
            model = fit.model.name(),
            days = totals.len(),
            horizon,
            "Forecast complete"
        );
        self.assemble(series, fit, category)
    }

    /// Forecast each category's series independently
    ///
    /// Categories with too little history fall back individually; one sparse
    /// category never degrades another's model choice.
    pub fn forecast_by_category(
        &self,
        records: &[ExpenseRecord],
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    ) -> Result<Vec<CategoryForecast>> {
        let mut groups: HashMap<String, Vec<ExpenseRecord>> = HashMap::new();
        for record in records {
            groups
                .entry(normalize_label(&record.category))
                .or_default()
                .push(record.clone());
        }

        let mut forecasts = Vec::with_capacity(groups.len());
        for (category, group) in groups {
            let series = FeatureBuilder::aggregate(&group, start, end)?;
            let forecast = self.forecast_labeled(&series, Some(category.clone()));

            let totals = series.totals();
            let daily_average = series.total_spend() / series.len() as f64;
            let variance = totals
                .iter()
                .map(|v| (v - daily_average).powi(2))
                .sum::<f64>()
                / totals.len() as f64;

            forecasts.push(CategoryForecast {
                category,
                daily_average,
                volatility: variance.sqrt(),
                forecast,
            });
        }

        forecasts.sort_by(|a, b| {
            b.forecast
                .total_predicted
                .partial_cmp(&a.forecast.total_predicted)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(forecasts)
    }

    /// Additive trend + seasonality fit
    ///
    /// Returns `None` on numerical non-convergence; the caller falls back.
    fn fit_seasonal(&self, totals: &[f64], horizon: usize) -> Option<ModelFit> {
        let n = totals.len();
        // The seasonal model assumes roughly stationary residuals, so fit on
        // the z-scored series and denormalize afterwards
        let (y, mean, std) = FeatureBuilder::zscore(totals);

        let changepoints = self.config.changepoint_count.min(n / 4);
        let yearly = n >= self.config.yearly_min_days;
        let denominator = (n.max(2) - 1) as f64;

        let row = |day: usize| -> Vec<f64> {
            let t = day as f64 / denominator;
            let mut features = vec![1.0, t];
            for j in 1..=changepoints {
                let cp = j as f64 / (changepoints + 1) as f64;
                features.push((t - cp).max(0.0));
            }
            for k in 1..=self.config.weekly_fourier_order {
                let phase = TAU * k as f64 * day as f64 / WEEKLY_PERIOD;
                features.push(phase.sin());
                features.push(phase.cos());
            }
            if yearly {
                for k in 1..=self.config.yearly_fourier_order {
                    let phase = TAU * k as f64 * day as f64 / YEARLY_PERIOD;
                    features.push(phase.sin());
                    features.push(phase.cos());
                }
            }
            features
        };

        let design: Vec<Vec<f64>> = (0..n).map(row).collect();
        let beta = solve_ridge(&design, &y, self.config.ridge_lambda)?;

        let predict = |day: usize| -> f64 {
            let features = row(day);
            let normalized: f64 = features.iter().zip(beta.iter()).map(|(x, b)| x * b).sum();
            normalized * std + mean
        };

        let residuals: Vec<f64> = (0..n).map(|i| totals[i] - predict(i)).collect();
        let predictions: Vec<f64> = (1..=horizon).map(|h| predict(n - 1 + h)).collect();

        Some(ModelFit {
            model: ForecastModel::Seasonal {
                yearly,
                changepoints,
            },
            predictions,
            residuals,
        })
    }

    /// Low-order AR on the differenced series, handling non-stationarity in
    /// the levels
    fn fit_autoregressive(&self, totals: &[f64], horizon: usize) -> Option<ModelFit> {
        let diffs: Vec<f64> = totals.windows(2).map(|w| w[1] - w[0]).collect();
        if diffs.is_empty() {
            return None;
        }

        let order = self.config.ar_order.min(diffs.len() / 2).max(1);
        if diffs.len() <= order {
            return None;
        }

        // Row i: intercept plus lags 1..=order, predicting diffs[i]
        let design: Vec<Vec<f64>> = (order..diffs.len())
            .map(|i| {
                let mut features = vec![1.0];
                for lag in 1..=order {
                    features.push(diffs[i - lag]);
                }
                features
            })
            .collect();
        let targets: Vec<f64> = diffs[order..].to_vec();
        let beta = solve_ridge(&design, &targets, self.config.ridge_lambda)?;

        let predict_diff = |recent: &[f64]| -> f64 {
            // recent[0] is the most recent diff
            beta[0]
                + recent
                    .iter()
                    .zip(beta[1..].iter())
                    .map(|(d, b)| d * b)
                    .sum::<f64>()
        };

        // In-sample one-step residuals on levels
        let residuals: Vec<f64> = (order..diffs.len())
            .map(|i| {
                let recent: Vec<f64> = (1..=order).map(|lag| diffs[i - lag]).collect();
                let predicted_level = totals[i] + predict_diff(&recent);
                totals[i + 1] - predicted_level
            })
            .collect();

        let mut recent: Vec<f64> = (0..order).map(|k| diffs[diffs.len() - 1 - k]).collect();
        let mut level = totals[totals.len() - 1];
        let mut predictions = Vec::with_capacity(horizon);
        for _ in 0..horizon {
            let next_diff = predict_diff(&recent);
            level += next_diff;
            predictions.push(level);
            recent.rotate_right(1);
            recent[0] = next_diff;
        }

        Some(ModelFit {
            model: ForecastModel::Autoregressive { order },
            predictions,
            residuals,
        })
    }

    /// Moving-average baseline; always succeeds
    fn fit_naive(&self, totals: &[f64], horizon: usize) -> ModelFit {
        let window = self.config.naive_window_days.max(1).min(totals.len());
        let tail = &totals[totals.len() - window..];
        let mean = tail.iter().sum::<f64>() / window as f64;

        ModelFit {
            model: ForecastModel::Naive {
                window_days: window,
            },
            predictions: vec![mean; horizon],
            residuals: tail.iter().map(|v| v - mean).collect(),
        }
    }

    /// Attach dates and uncertainty bounds
    ///
    /// Bounds come from empirical residual quantiles, widened proportionally
    /// as the horizon grows; spend is clamped at zero throughout.
    fn assemble(&self, series: &DailySeries, fit: ModelFit, category: Option<String>) -> Forecast {
        let horizon = fit.predictions.len();
        let (q_low, q_high) = residual_quantiles(&fit.residuals, self.config.interval_quantile);

        let mut points = Vec::with_capacity(horizon);
        for (step, raw) in fit.predictions.iter().enumerate() {
            let h = step + 1;
            let predicted = raw.max(0.0);
            let widen = (1.0 + h as f64 / horizon as f64).sqrt();
            let lower = (predicted + q_low * widen).clamp(0.0, predicted);
            let upper = (predicted + q_high * widen).max(predicted);
            points.push(ForecastPoint {
                date: series.end_date() + Duration::days(h as i64),
                predicted_amount: predicted,
                lower_bound: lower,
                upper_bound: upper,
                category: category.clone(),
            });
        }

        let total_predicted = points.iter().map(|p| p.predicted_amount).sum();
        Forecast {
            model: fit.model,
            points,
            total_predicted,
        }
    }
}

/// Empirical quantiles of the residual distribution; the degenerate cases
/// (no residuals, single residual) collapse to a zero-width interval
fn residual_quantiles(residuals: &[f64], coverage: f64) -> (f64, f64) {
    if residuals.len() < 2 {
        return (0.0, 0.0);
    }
    let mut sorted = residuals.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let coverage = coverage.clamp(0.0, 1.0);
    let tail = (1.0 - coverage) / 2.0;
    (
        interpolated_quantile(&sorted, tail),
        interpolated_quantile(&sorted, 1.0 - tail),
    )
}

fn interpolated_quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let low = position.floor() as usize;
    let high = position.ceil() as usize;
    let fraction = position - low as f64;
    sorted[low] * (1.0 - fraction) + sorted[high] * fraction
}

/// Solve the ridge-regularized normal equations (XᵀX + λI)β = Xᵀy by
/// Gaussian elimination with partial pivoting
///
/// Returns `None` when the system is numerically singular, which callers
/// treat as model-fit failure and recover from by falling back.
fn solve_ridge(design: &[Vec<f64>], targets: &[f64], lambda: f64) -> Option<Vec<f64>> {
    let p = design.first()?.len();

    let mut a = vec![vec![0.0; p]; p];
    let mut b = vec![0.0; p];
    for (row, &target) in design.iter().zip(targets.iter()) {
        for i in 0..p {
            for j in 0..p {
                a[i][j] += row[i] * row[j];
            }
            b[i] += row[i] * target;
        }
    }
    for (i, row) in a.iter_mut().enumerate() {
        row[i] += lambda;
    }

    // Forward elimination with partial pivoting
    for col in 0..p {
        let pivot_row = (col..p)
            .max_by(|&x, &y| {
                a[x][col]
                    .abs()
                    .partial_cmp(&a[y][col].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(col);
        if a[pivot_row][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot_row);
        b.swap(col, pivot_row);

        for row in col + 1..p {
            let factor = a[row][col] / a[col][col];
            for k in col..p {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    // Back substitution
    let mut beta = vec![0.0; p];
    for col in (0..p).rev() {
        let mut value = b[col];
        for k in col + 1..p {
            value -= a[col][k] * beta[k];
        }
        beta[col] = value / a[col][col];
    }
    Some(beta)
}
