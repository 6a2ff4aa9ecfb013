//! Broker error types.
//!
//! Only real failures live here. Expected non-fatal outcomes (no
//! candidates, insufficient improvement, reroute ceiling) are variants of
//! the outcome enums in `broker`, so a full monitoring cycle never aborts
//! on one workload's "nothing to do".

use thiserror::Error;

use greengrid_migrate::MigrateError;
use greengrid_slices::SliceError;
use greengrid_state::{StateError, WorkloadStatus};

/// Result type alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("workload not found: {0}")]
    WorkloadNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("workload {0} is not routable in status {1:?}")]
    NotRoutable(String, WorkloadStatus),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("slice error: {0}")]
    Slices(#[from] SliceError),

    #[error("migration error: {0}")]
    Migrate(#[from] MigrateError),
}
