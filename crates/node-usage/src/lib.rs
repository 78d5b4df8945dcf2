// Node usage metering - registry of instances, counter deltas, collector submission
use node_common::NodeError;
use thiserror::Error;

mod collector;
mod delta;
mod job;
mod meter;
mod registry;

pub use collector::{HttpUsageCollector, UsageCollector, API_KEY_HEADER, DEFAULT_COLLECTOR_PATH};
pub use delta::{compute_delta, is_counter_reset};
pub use job::MeteringJob;
pub use meter::{CycleSummary, UsageMeter};
pub use registry::InstanceRegistry;

// Error Types
#[derive(Error, Debug)]
pub enum UsageError {
    #[error("Registry I/O error at {path}: {source}")]
    RegistryIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Registry document is malformed: {0}")]
    RegistryFormat(#[from] serde_json::Error),
    #[error("Registry task failed: {0}")]
    RegistryTask(String),
    #[error("Collector request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Collector rejected report with status {status}: {body}")]
    CollectorRejected { status: u16, body: String },
    #[error("Invalid collector configuration: {0}")]
    CollectorConfig(String),
}

pub type Result<T> = std::result::Result<T, UsageError>;

impl From<UsageError> for NodeError {
    fn from(err: UsageError) -> Self {
        match err {
            UsageError::RegistryIo { .. }
            | UsageError::RegistryFormat(_)
            | UsageError::RegistryTask(_) => NodeError::Registry(err.to_string()),
            UsageError::Http(_)
            | UsageError::CollectorRejected { .. }
            | UsageError::CollectorConfig(_) => NodeError::Collector(err.to_string()),
        }
    }
}
