//! Outlay Core Library
//!
//! Analytics core for the Outlay expense tracker:
//! - Feature construction and daily spend aggregation
//! - Isolation-forest anomaly detection with plain-language explanations
//! - Seasonal daily-spend forecasting with autoregressive and naive fallbacks
//! - Budget-overrun evaluation against a derived monthly envelope
//! - Pipeline orchestration with a per-user model cache

pub mod anomaly;
pub mod budget;
pub mod error;
pub mod features;
pub mod forecast;
pub mod models;
pub mod pipeline;

pub use anomaly::{AnomalyDetector, DetectorConfig, FittedDetector};
pub use budget::{month_end, month_start, BudgetAlertEngine};
pub use error::{Error, Result};
pub use features::{FeatureBuilder, FeatureVector, Vocabulary};
pub use forecast::{ForecasterConfig, SeriesForecaster};
pub use models::{
    AnomalyExplanation, AnomalyOutcome, AnomalyResult, BudgetAlert, BudgetEnvelope,
    BudgetEvaluation, CategoryForecast, CategorySpend, DailySeries, DailyTotal, ExpenseRecord,
    Forecast, ForecastModel, ForecastPoint, SpendingSummary, UserId,
};
pub use pipeline::{AnalyticsPipeline, CacheConfig, CacheStats, ModelCache, PipelineConfig};
