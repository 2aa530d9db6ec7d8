//! Error types for the threshold pipeline

use std::fmt;

use thiserror::Error;

/// Errors raised while resolving, analysing or configuring KPI thresholds.
#[derive(Debug, Error)]
pub enum ThresholdError {
    /// Malformed training window string or `Thresholds` payload
    #[error("configuration parse error: {0}")]
    ConfigParse(String),

    /// An analysis result references a KPI that is not part of the batch
    #[error("unknown service for {kpi_id} KPI ID: {row}")]
    UnknownServiceForKpi { kpi_id: String, row: String },

    /// Algorithm/flag combination that cannot be turned into a policy
    #[error("{context} {algorithm} ({flag}) recommendation is not supported yet")]
    UnsupportedAlgorithm {
        context: String,
        algorithm: String,
        flag: String,
    },

    /// A recommendation row is missing a field or carries an unusable value
    #[error("{context} {message}")]
    InvalidRecommendation { context: String, message: String },

    /// Search failed, or returned empty/partial results when disallowed
    #[error("search failed: {0}")]
    Search(String),

    /// Saving a service document failed
    #[error("[{service}] failed to save service: {message}")]
    Persist { service: String, message: String },

    /// Listing services from the object store failed
    #[error("object store error: {0}")]
    Store(String),

    /// A service or KPI document lacks a required field
    #[error("malformed document: {0}")]
    MalformedDocument(String),

    /// Operator input that cannot be honoured
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A fan-out worker panicked or was cancelled
    #[error("worker task failed: {0}")]
    TaskFailed(String),

    /// Every failure collected by one bounded fan-out
    #[error("{0}")]
    Aggregate(AggregateError),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ThresholdError>;

impl ThresholdError {
    /// Join a list of failures into one error, or `Ok` when the list is empty.
    ///
    /// Nested aggregates are flattened.
    pub fn join(errors: Vec<ThresholdError>) -> Result<()> {
        let mut flat = Vec::with_capacity(errors.len());
        for err in errors {
            match err {
                ThresholdError::Aggregate(inner) => flat.extend(inner.0),
                other => flat.push(other),
            }
        }

        if flat.is_empty() {
            Ok(())
        } else {
            Err(ThresholdError::Aggregate(AggregateError(flat)))
        }
    }

    /// Number of leaf failures carried by this error
    pub fn failure_count(&self) -> usize {
        match self {
            ThresholdError::Aggregate(inner) => {
                inner.0.iter().map(ThresholdError::failure_count).sum()
            }
            _ => 1,
        }
    }
}

/// Individual failures of a fan-out, displayed one per line.
#[derive(Debug)]
pub struct AggregateError(pub Vec<ThresholdError>);

impl AggregateError {
    pub fn errors(&self) -> &[ThresholdError] {
        &self.0
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}
