//! Budget-overrun evaluation
//!
//! Combines a forecast with the user's budget envelope to project period-end
//! spend. The overage is reported signed so callers can render "margin
//! remaining" as well as overruns.

use chrono::{Datelike, Duration, NaiveDate};
use tracing::debug;

use crate::models::{BudgetAlert, BudgetEnvelope, BudgetEvaluation, ForecastPoint};

/// Decides whether projected spend exceeds the budget envelope
pub struct BudgetAlertEngine;

impl BudgetAlertEngine {
    /// Evaluate projected period-end spend against the envelope
    ///
    /// `projected_total` is spend already incurred plus the forecast for the
    /// remaining days through `period_end`. A missing envelope yields an
    /// explicit [`BudgetEvaluation::Unconfigured`] — the engine never guesses
    /// a default budget.
    pub fn evaluate(
        forecast: &[ForecastPoint],
        actual_spend_so_far: f64,
        envelope: Option<&BudgetEnvelope>,
        today: NaiveDate,
        period_end: NaiveDate,
    ) -> BudgetEvaluation {
        let Some(envelope) = envelope else {
            return BudgetEvaluation::Unconfigured;
        };

        let remaining_forecast: f64 = forecast
            .iter()
            .filter(|p| p.date > today && p.date <= period_end)
            .map(|p| p.predicted_amount)
            .sum();

        let projected_total = actual_spend_so_far + remaining_forecast;
        let derived_budget = envelope.derived_budget();
        let overage_amount = projected_total - derived_budget;
        let exceeds = projected_total > derived_budget;

        debug!(
            projected_total,
            derived_budget, exceeds, "Budget evaluation complete"
        );

        BudgetEvaluation::Evaluated(BudgetAlert {
            projected_total,
            actual_spend_so_far,
            envelope: *envelope,
            derived_budget,
            exceeds,
            overage_amount,
            days_remaining_in_period: (period_end - today).num_days().max(0),
        })
    }
}

/// Last calendar day of the month containing `date`
pub fn month_end(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).expect("first of month always valid")
        - Duration::days(1)
}

/// First calendar day of the month containing `date`
pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).expect("day 1 always valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_forecast(start: NaiveDate, days: i64, per_day: f64) -> Vec<ForecastPoint> {
        (0..days)
            .map(|i| ForecastPoint {
                date: start + Duration::days(i + 1),
                predicted_amount: per_day,
                lower_bound: per_day * 0.8,
                upper_bound: per_day * 1.2,
                category: None,
            })
            .collect()
    }

    #[test]
    fn test_overrun_sign_convention() {
        // 40000 spent + 15000 forecast vs a 50000 budget → overage 5000
        let today = NaiveDate::from_ymd_opt(2026, 3, 16).unwrap();
        let period_end = NaiveDate::from_ymd_opt(2026, 3, 31).unwrap();
        let forecast = flat_forecast(today, 15, 1000.0);
        let envelope = BudgetEnvelope::new(100_000.0, 0.5).unwrap();

        let evaluation =
            BudgetAlertEngine::evaluate(&forecast, 40_000.0, Some(&envelope), today, period_end);
        let alert = evaluation.as_alert().expect("should be evaluated");

        assert!((alert.projected_total - 55_000.0).abs() < 1e-9);
        assert!(alert.exceeds);
        assert!((alert.overage_amount - 5_000.0).abs() < 1e-9);
        assert_eq!(alert.days_remaining_in_period, 15);
    }

    #[test]
    fn test_margin_remaining_is_negative_overage() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 21).unwrap();
        let period_end = NaiveDate::from_ymd_opt(2026, 3, 31).unwrap();
        let forecast = flat_forecast(today, 10, 500.0);
        let envelope = BudgetEnvelope::new(60_000.0, 0.25).unwrap();

        let evaluation =
            BudgetAlertEngine::evaluate(&forecast, 20_000.0, Some(&envelope), today, period_end);
        let alert = evaluation.as_alert().unwrap();

        // 25000 projected vs 45000 budget → 20000 of margin left
        assert!(!alert.exceeds);
        assert!((alert.overage_amount - (-20_000.0)).abs() < 1e-9);
    }

    #[test]
    fn test_unconfigured_without_envelope() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 16).unwrap();
        let period_end = NaiveDate::from_ymd_opt(2026, 3, 31).unwrap();
        let forecast = flat_forecast(today, 15, 1000.0);

        let evaluation = BudgetAlertEngine::evaluate(&forecast, 40_000.0, None, today, period_end);
        assert!(matches!(evaluation, BudgetEvaluation::Unconfigured));
    }

    #[test]
    fn test_forecast_days_past_period_end_ignored() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 26).unwrap();
        let period_end = NaiveDate::from_ymd_opt(2026, 3, 31).unwrap();
        // 30-day forecast, but only 5 days fall inside the period
        let forecast = flat_forecast(today, 30, 1000.0);
        let envelope = BudgetEnvelope::new(100_000.0, 0.5).unwrap();

        let evaluation =
            BudgetAlertEngine::evaluate(&forecast, 10_000.0, Some(&envelope), today, period_end);
        let alert = evaluation.as_alert().unwrap();
        assert!((alert.projected_total - 15_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_month_boundaries() {
        let mid_march = NaiveDate::from_ymd_opt(2026, 3, 16).unwrap();
        assert_eq!(
            month_start(mid_march),
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
        );
        assert_eq!(
            month_end(mid_march),
            NaiveDate::from_ymd_opt(2026, 3, 31).unwrap()
        );

        let december = NaiveDate::from_ymd_opt(2026, 12, 5).unwrap();
        assert_eq!(
            month_end(december),
            NaiveDate::from_ymd_opt(2026, 12, 31).unwrap()
        );

        // February in a leap year
        let leap = NaiveDate::from_ymd_opt(2028, 2, 10).unwrap();
        assert_eq!(
            month_end(leap),
            NaiveDate::from_ymd_opt(2028, 2, 29).unwrap()
        );
    }
}
