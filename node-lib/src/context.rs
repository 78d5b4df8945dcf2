use crate::config::NodeConfig;
use node_common::RuntimeAdapter;
use node_orchestrator::{Orchestrator, OrchestratorConfig};
use node_runtime::{DockerRuntime, RuntimeError};
use node_usage::{HttpUsageCollector, InstanceRegistry, UsageError, UsageMeter};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum NodeLibError {
    #[error("Container runtime initialization failed: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("Usage metering initialization failed: {0}")]
    Usage(#[from] UsageError),
}

/// Shared handles for every component of the agent.
#[derive(Clone)]
pub struct NodeContext {
    pub config: NodeConfig,
    pub runtime: Arc<dyn RuntimeAdapter>,
    pub registry: Arc<InstanceRegistry>,
    pub orchestrator: Arc<Orchestrator>,
}

impl NodeContext {
    /// Connects to the local engine and opens the registry.
    pub fn new(config: NodeConfig) -> Result<Self, NodeLibError> {
        info!(
            "Connecting to container engine at {}",
            config.runtime.docker_socket.display()
        );
        let runtime = DockerRuntime::connect(config.runtime.clone())?;
        Ok(Self::with_runtime(config, Arc::new(runtime)))
    }

    pub fn with_runtime(config: NodeConfig, runtime: Arc<dyn RuntimeAdapter>) -> Self {
        let registry = Arc::new(InstanceRegistry::new(&config.registry_path));
        let orchestrator = Arc::new(Orchestrator::new(
            runtime.clone(),
            registry.clone(),
            OrchestratorConfig {
                data_root: config.data_root.clone(),
                network: config.container_network.clone(),
            },
        ));
        Self {
            config,
            runtime,
            registry,
            orchestrator,
        }
    }

    /// `None` when no collector is configured.
    pub fn usage_meter(&self) -> Result<Option<UsageMeter>, NodeLibError> {
        let Some(collector) = &self.config.collector else {
            return Ok(None);
        };
        let collector = HttpUsageCollector::new(
            &collector.url,
            &collector.path,
            collector.api_key.clone(),
            collector.timeout,
        )?;
        info!(endpoint = %collector.endpoint(), "Usage collector configured");
        Ok(Some(UsageMeter::new(
            self.registry.clone(),
            self.orchestrator.clone(),
            Arc::new(collector),
            self.config.stats_timeout,
        )))
    }
}
