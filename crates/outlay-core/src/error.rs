//! Error types for the analytics core
//!
//! Only caller misuse is an `Error`. Data-quality conditions with a defined
//! answer (insufficient history, unconfigured budget, degenerate
//! distributions) are modeled as distinguished result variants on the
//! relevant output types, not as errors.

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid date range: {start} to {end}")]
    InvalidDateRange { start: NaiveDate, end: NaiveDate },

    #[error("Feature dimension mismatch: model fitted on {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;
