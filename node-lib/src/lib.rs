pub mod api_routes;
pub mod api_server;
pub mod config;
pub mod context;
pub mod restorer;

pub use config::{ConfigError, NodeConfig};
pub use context::{NodeContext, NodeLibError};
pub use restorer::{RestoreSummary, RuleRestorer};
