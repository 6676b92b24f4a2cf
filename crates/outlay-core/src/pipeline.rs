//! Pipeline orchestration and the per-user model cache
//!
//! The pipeline performs no algorithmic work of its own: it routes
//! new-expense events through feature construction to the anomaly detector,
//! and stats/forecast requests through aggregation to the forecaster and
//! budget engine. Fitted models are cached per user so the expensive
//! operations (tree construction, seasonal decomposition) do not run on
//! every request; scoring against an already-fitted ensemble stays on the
//! request path. A stale-but-valid model keeps serving until the caller
//! runs a refit as its own unit of work.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::anomaly::{AnomalyDetector, DetectorConfig, FittedDetector};
use crate::budget::{month_end, month_start, BudgetAlertEngine};
use crate::error::Result;
use crate::features::FeatureBuilder;
use crate::forecast::{ForecasterConfig, SeriesForecaster};
use crate::models::{
    AnomalyOutcome, BudgetEnvelope, BudgetEvaluation, CategoryForecast, DailySeries,
    ExpenseRecord, Forecast, SpendingSummary, UserId,
};

/// Model cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Refit once history has grown by this many records
    pub refit_record_delta: usize,
    /// Refit once a fitted model is older than this many seconds
    pub ttl_secs: u64,
    /// Maximum users with cached models; least-recently-used beyond this
    /// are evicted
    pub max_users: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refit_record_delta: 25,
            ttl_secs: 6 * 60 * 60,
            max_users: 1024,
        }
    }
}

/// Top-level pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub detector: DetectorConfig,
    pub forecaster: ForecasterConfig,
    pub cache: CacheConfig,
}

/// Cache activity counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub refits: u64,
    pub evictions: u64,
}

struct CachedDetector {
    fitted: Arc<FittedDetector>,
    fitted_at: Instant,
}

struct CachedForecast {
    series_len: usize,
    series_end: NaiveDate,
    series_total: f64,
    forecast: Forecast,
    fitted_at: Instant,
}

#[derive(Default)]
struct CacheEntry {
    detector: Option<CachedDetector>,
    forecast: Option<CachedForecast>,
    last_accessed: Option<Instant>,
}

/// Keyed per-user cache for fitted models
///
/// Bounded explicitly: entries are created on the first sufficient-data
/// request, refreshed on refit, evicted LRU past `max_users`, and sweepable
/// by inactivity — never an ambient global.
pub struct ModelCache {
    entries: RwLock<HashMap<UserId, CacheEntry>>,
    stats: RwLock<CacheStats>,
    config: CacheConfig,
}

impl ModelCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stats: RwLock::new(CacheStats::default()),
            config,
        }
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.read().expect("stats lock poisoned")
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs)
    }

    fn detector(&self, user_id: UserId) -> Option<Arc<FittedDetector>> {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        let found = entries.get_mut(&user_id).and_then(|entry| {
            entry.last_accessed = Some(Instant::now());
            entry.detector.as_ref().map(|d| d.fitted.clone())
        });

        let mut stats = self.stats.write().expect("stats lock poisoned");
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        found
    }

    /// Whether the cached ensemble should be refit for this history size.
    /// Scoring on the stale model remains valid in the meantime.
    fn detector_is_stale(&self, user_id: UserId, history_len: usize) -> bool {
        let entries = self.entries.read().expect("cache lock poisoned");
        match entries.get(&user_id).and_then(|e| e.detector.as_ref()) {
            Some(cached) => {
                history_len >= cached.fitted.trained_records() + self.config.refit_record_delta
                    || cached.fitted_at.elapsed() >= self.ttl()
            }
            None => true,
        }
    }

    fn store_detector(&self, user_id: UserId, fitted: Arc<FittedDetector>) {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        let entry = entries.entry(user_id).or_default();
        entry.detector = Some(CachedDetector {
            fitted,
            fitted_at: Instant::now(),
        });
        entry.last_accessed = Some(Instant::now());
        drop(entries);
        self.enforce_capacity(user_id);
    }

    fn forecast(&self, user_id: UserId, series: &DailySeries) -> Option<Forecast> {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        let found = entries.get_mut(&user_id).and_then(|entry| {
            entry.last_accessed = Some(Instant::now());
            entry.forecast.as_ref().and_then(|cached| {
                let fresh = cached.series_len == series.len()
                    && cached.series_end == series.end_date()
                    && cached.series_total == series.total_spend()
                    && cached.fitted_at.elapsed() < self.ttl();
                fresh.then(|| cached.forecast.clone())
            })
        });

        let mut stats = self.stats.write().expect("stats lock poisoned");
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        found
    }

    fn store_forecast(&self, user_id: UserId, series: &DailySeries, forecast: Forecast) {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        let entry = entries.entry(user_id).or_default();
        entry.forecast = Some(CachedForecast {
            series_len: series.len(),
            series_end: series.end_date(),
            series_total: series.total_spend(),
            forecast,
            fitted_at: Instant::now(),
        });
        entry.last_accessed = Some(Instant::now());
        drop(entries);
        self.enforce_capacity(user_id);
    }

    /// Drop a user's cached models, e.g. after their history was rewritten
    pub fn invalidate(&self, user_id: UserId) {
        self.entries
            .write()
            .expect("cache lock poisoned")
            .remove(&user_id);
    }

    /// Evict users idle longer than `max_idle`; returns how many were dropped
    pub fn evict_inactive(&self, max_idle: Duration) -> usize {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| match entry.last_accessed {
            Some(at) => at.elapsed() <= max_idle,
            None => false,
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            self.stats.write().expect("stats lock poisoned").evictions += evicted as u64;
            debug!(evicted, "Evicted inactive cached models");
        }
        evicted
    }

    fn enforce_capacity(&self, just_touched: UserId) {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        while entries.len() > self.config.max_users.max(1) {
            let lru = entries
                .iter()
                .filter(|(&id, _)| id != just_touched)
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(&id, _)| id);
            match lru {
                Some(id) => {
                    entries.remove(&id);
                    self.stats.write().expect("stats lock poisoned").evictions += 1;
                }
                None => break,
            }
        }
    }
}

/// Orchestrates the analytics components over a per-user model cache
pub struct AnalyticsPipeline {
    detector: AnomalyDetector,
    forecaster: SeriesForecaster,
    cache: ModelCache,
}

impl Default for AnalyticsPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalyticsPipeline {
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            detector: AnomalyDetector::with_config(config.detector),
            forecaster: SeriesForecaster::with_config(config.forecaster),
            cache: ModelCache::new(config.cache),
        }
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    /// New-expense event: score the record against the user's cached
    /// ensemble
    ///
    /// `history` is the user's prior records, excluding `record` itself. A
    /// cached model serves even when stale; the first sufficient-data
    /// request fits one inline. With fewer than the configured minimum of
    /// records the detector abstains.
    pub fn evaluate_expense(
        &self,
        history: &[ExpenseRecord],
        record: &ExpenseRecord,
    ) -> Result<AnomalyOutcome> {
        let user_id = record.user_id;

        if let Some(fitted) = self.cache.detector(user_id) {
            if self.cache.detector_is_stale(user_id, history.len()) {
                debug!(user_id, "Scoring on stale ensemble; refit recommended");
            }
            return Ok(AnomalyOutcome::Scored(fitted.classify(record)?));
        }

        if !self.detector.has_sufficient_history(history.len()) {
            return Ok(AnomalyOutcome::InsufficientHistory {
                available: history.len(),
                required: self.detector.config().min_history,
            });
        }

        let fitted = Arc::new(self.detector.fit(history)?);
        self.cache.store_detector(user_id, fitted.clone());
        info!(user_id, records = history.len(), "Fitted anomaly model");
        Ok(AnomalyOutcome::Scored(fitted.classify(record)?))
    }

    /// Whether the user's cached ensemble should be refit for this history
    /// size
    pub fn needs_refit(&self, user_id: UserId, history_len: usize) -> bool {
        self.cache.detector_is_stale(user_id, history_len)
    }

    /// Refit the user's ensemble; intended to run as its own deferred unit
    /// of work while scoring continues on the stale model
    ///
    /// Returns `false` when history is still below the fitting minimum.
    pub fn refit(&self, user_id: UserId, history: &[ExpenseRecord]) -> Result<bool> {
        if !self.detector.has_sufficient_history(history.len()) {
            return Ok(false);
        }
        let fitted = Arc::new(self.detector.fit(history)?);
        self.cache.store_detector(user_id, fitted);
        self.cache.stats.write().expect("stats lock poisoned").refits += 1;
        info!(user_id, records = history.len(), "Refitted anomaly model");
        Ok(true)
    }

    /// Forecast daily spend past `end`, reusing a cached forecast when the
    /// underlying series has not changed
    pub fn forecast_spend(
        &self,
        user_id: UserId,
        records: &[ExpenseRecord],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Forecast> {
        let series = FeatureBuilder::aggregate(records, start, end)?;
        if let Some(cached) = self.cache.forecast(user_id, &series) {
            return Ok(cached);
        }
        let forecast = self.forecaster.forecast(&series);
        self.cache.store_forecast(user_id, &series, forecast.clone());
        Ok(forecast)
    }

    /// Per-category forecasts; uncached since each request may slice
    /// categories differently
    pub fn forecast_by_category(
        &self,
        records: &[ExpenseRecord],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CategoryForecast>> {
        self.forecaster.forecast_by_category(records, start, end)
    }

    /// Spending statistics for a window
    pub fn spending_summary(
        &self,
        records: &[ExpenseRecord],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<SpendingSummary> {
        FeatureBuilder::summarize(records, start, end)
    }

    /// Month-to-date budget check: forecast the rest of the month from the
    /// supplied history and evaluate against the envelope
    ///
    /// `records` should cover the user's recent history (it may extend
    /// before the current month; earlier data improves the forecast).
    pub fn check_budget(
        &self,
        user_id: UserId,
        records: &[ExpenseRecord],
        envelope: Option<&BudgetEnvelope>,
        today: NaiveDate,
    ) -> Result<BudgetEvaluation> {
        let period_start = month_start(today);

        let history_start = records
            .iter()
            .map(|r| r.timestamp.date_naive())
            .min()
            .unwrap_or(period_start)
            .min(period_start);

        let forecast = self.forecast_spend(user_id, records, history_start, today)?;
        let actual = FeatureBuilder::aggregate(records, period_start, today)?.total_spend();

        Ok(BudgetAlertEngine::evaluate(
            &forecast.points,
            actual,
            envelope,
            today,
            month_end(today),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn record(id: i64, user_id: UserId, amount: f64, category: &str, day_offset: i64) -> ExpenseRecord {
        ExpenseRecord {
            id,
            user_id,
            amount,
            category: category.to_string(),
            payment_method: "upi".to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
                + ChronoDuration::days(day_offset),
            description: String::new(),
        }
    }

    fn history(user_id: UserId, count: usize) -> Vec<ExpenseRecord> {
        (0..count)
            .map(|i| {
                record(
                    i as i64,
                    user_id,
                    100.0 + (i % 5) as f64 * 15.0,
                    if i % 2 == 0 { "food" } else { "transport" },
                    (i % 60) as i64,
                )
            })
            .collect()
    }

    #[test]
    fn test_insufficient_history_abstains() {
        let pipeline = AnalyticsPipeline::new();
        let records = history(1, 5);
        let new_expense = record(100, 1, 300.0, "food", 61);

        let outcome = pipeline.evaluate_expense(&records, &new_expense).unwrap();
        assert!(matches!(
            outcome,
            AnomalyOutcome::InsufficientHistory {
                available: 5,
                required: 20
            }
        ));
        // No model was cached for an abstention
        assert!(pipeline.cache().is_empty());
    }

    #[test]
    fn test_first_fit_then_cache_hit() {
        let pipeline = AnalyticsPipeline::new();
        let records = history(1, 30);
        let new_expense = record(100, 1, 120.0, "food", 61);

        let first = pipeline.evaluate_expense(&records, &new_expense).unwrap();
        assert!(first.as_scored().is_some());
        assert_eq!(pipeline.cache().stats().misses, 1);

        let second = pipeline.evaluate_expense(&records, &new_expense).unwrap();
        assert!(second.as_scored().is_some());
        assert_eq!(pipeline.cache().stats().hits, 1);
    }

    #[test]
    fn test_refit_delta_policy() {
        let mut config = PipelineConfig::default();
        config.cache.refit_record_delta = 5;
        let pipeline = AnalyticsPipeline::with_config(config);

        let records = history(1, 30);
        let new_expense = record(100, 1, 120.0, "food", 61);
        pipeline.evaluate_expense(&records, &new_expense).unwrap();

        // Grown by 2 records: still fresh. Grown by 5: due for refit.
        assert!(!pipeline.needs_refit(1, 32));
        assert!(pipeline.needs_refit(1, 35));

        assert!(pipeline.refit(1, &history(1, 35)).unwrap());
        assert!(!pipeline.needs_refit(1, 35));
        assert_eq!(pipeline.cache().stats().refits, 1);
    }

    #[test]
    fn test_ttl_expiry_marks_stale() {
        let mut config = PipelineConfig::default();
        config.cache.ttl_secs = 0;
        let pipeline = AnalyticsPipeline::with_config(config);

        let records = history(1, 30);
        pipeline
            .evaluate_expense(&records, &record(100, 1, 120.0, "food", 61))
            .unwrap();
        // Zero TTL: stale immediately, but scoring still works on it
        assert!(pipeline.needs_refit(1, 30));
        let outcome = pipeline
            .evaluate_expense(&records, &record(101, 1, 120.0, "food", 61))
            .unwrap();
        assert!(outcome.as_scored().is_some());
    }

    #[test]
    fn test_lru_eviction_bounds_cache() {
        let mut config = PipelineConfig::default();
        config.cache.max_users = 2;
        let pipeline = AnalyticsPipeline::with_config(config);

        for user_id in 1..=4 {
            let records = history(user_id, 25);
            pipeline
                .evaluate_expense(&records, &record(900 + user_id, user_id, 110.0, "food", 61))
                .unwrap();
        }

        assert!(pipeline.cache().len() <= 2);
        assert!(pipeline.cache().stats().evictions >= 2);
    }

    #[test]
    fn test_inactivity_sweep() {
        let pipeline = AnalyticsPipeline::new();
        let records = history(1, 25);
        pipeline
            .evaluate_expense(&records, &record(100, 1, 110.0, "food", 61))
            .unwrap();

        assert_eq!(pipeline.cache().len(), 1);
        let evicted = pipeline.cache().evict_inactive(Duration::ZERO);
        assert_eq!(evicted, 1);
        assert!(pipeline.cache().is_empty());
    }

    #[test]
    fn test_forecast_reused_until_series_changes() {
        let pipeline = AnalyticsPipeline::new();
        let records = history(1, 40);
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap().date_naive();
        let end = start + ChronoDuration::days(59);

        let first = pipeline.forecast_spend(1, &records, start, end).unwrap();
        let second = pipeline.forecast_spend(1, &records, start, end).unwrap();
        assert_eq!(first, second);
        assert_eq!(pipeline.cache().stats().hits, 1);

        // A new record on the last day changes the series and invalidates
        let mut grown = records.clone();
        grown.push(record(200, 1, 999.0, "food", 59));
        let third = pipeline.forecast_spend(1, &grown, start, end).unwrap();
        assert_ne!(second, third);
    }

    #[test]
    fn test_check_budget_exceeds() {
        let pipeline = AnalyticsPipeline::new();
        // Flat 2000/day for 75 days ending mid-March
        let records: Vec<ExpenseRecord> = (0..75)
            .map(|i| record(i, 1, 2000.0, "food", i))
            .collect();
        let today = Utc
            .with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
            .unwrap()
            .date_naive()
            + ChronoDuration::days(74); // 2026-03-16

        let envelope = BudgetEnvelope::new(100_000.0, 0.5).unwrap();
        let evaluation = pipeline
            .check_budget(1, &records, Some(&envelope), today)
            .unwrap();
        let alert = evaluation.as_alert().expect("should be evaluated");

        // ~2000/day projected across 31 days dwarfs the 50000 budget
        assert!(alert.exceeds);
        assert!(alert.overage_amount > 0.0);
        assert_eq!(alert.days_remaining_in_period, 15);
        assert!((alert.actual_spend_so_far - 32_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_check_budget_unconfigured() {
        let pipeline = AnalyticsPipeline::new();
        let records = history(1, 30);
        let today = Utc
            .with_ymd_and_hms(2026, 2, 15, 0, 0, 0)
            .unwrap()
            .date_naive();

        let evaluation = pipeline.check_budget(1, &records, None, today).unwrap();
        assert!(matches!(evaluation, BudgetEvaluation::Unconfigured));
    }
}
