//! KPI threshold automation library
//!
//! This crate provides the core functionality for:
//! - Service and KPI selection over a paginated service catalog
//! - Training-window batching and parallelism planning
//! - ML recommendation searches and policy synthesis
//! - Threshold reset to the disabled baseline
//! - Run metrics and error aggregation

pub mod analysis;
pub mod batcher;
pub mod error;
pub mod executor;
pub mod models;
pub mod observability;
pub mod planner;
pub mod search;
pub mod selector;
pub mod store;
pub mod synthesis;
pub mod thresholds;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{AggregateError, Result, ThresholdError};
pub use models::{Document, KpiRef, ServiceRef, TrainingConfig};
pub use observability::{RunMetrics, RunSummary};
pub use search::{SearchClient, SearchRequest, SearchRow};
pub use store::{ObjectStore, ServiceFilter, ServiceStream};
pub use synthesis::InsufficientDataAction;
pub use workflow::{
    RecommendOptions, ThresholdRecommendationWorkflow, ThresholdResetWorkflow, WorkflowOptions,
};
