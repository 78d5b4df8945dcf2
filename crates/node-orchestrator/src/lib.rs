use async_trait::async_trait;
use node_common::{
    container_name, ContainerSpec, InstanceId, InstanceRecord, NodeError, PortMapping,
    ProvisionRequest, ProvisionResult, Protocol, RuntimeAdapter, TrafficSnapshot, TrafficSource,
    VolumeMapping,
};
use node_usage::{InstanceRegistry, UsageError};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

pub mod validation;

pub use node_common as common;
pub use validation::{validate_request, ValidatedPorts};

/// Where the proxy image expects its client certificate directory.
pub const CERT_MOUNT_DIR: &str = "/var/lib/marzban-node/ssl";
pub const CERT_FILE_NAME: &str = "node.pem";
pub const XRAY_CONTAINER_PORT: u16 = 62051;
pub const API_CONTAINER_PORT: u16 = 62050;

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid provision request: {0}")]
    Validation(String),
    #[error("Runtime error: {source}")]
    Runtime {
        #[from]
        source: NodeError,
    },
    #[error("Registry error: {source}")]
    Registry {
        #[from]
        source: UsageError,
    },
}
pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl From<OrchestratorError> for NodeError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Validation(msg) => NodeError::Validation(msg),
            OrchestratorError::Runtime { source } => source,
            OrchestratorError::Registry { source } => source.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Parent of the per-instance directories.
    pub data_root: PathBuf,
    /// Network mode for proxy containers; engine default when `None`.
    pub network: Option<String>,
}

/// Which teardown steps failed. Steps that failed are logged and skipped;
/// the registry record is removed regardless.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeprovisionOutcome {
    pub instance_id: InstanceId,
    pub record_found: bool,
    pub failed_steps: Vec<String>,
}

impl DeprovisionOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed_steps.is_empty()
    }
}

impl fmt::Display for DeprovisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            write!(f, "Instance {} deprovisioned", self.instance_id)
        } else {
            write!(
                f,
                "Instance {} deprovisioned with failures: {}",
                self.instance_id,
                self.failed_steps.join("; ")
            )
        }
    }
}

// --- Orchestrator Implementation ---
#[derive(Clone)]
pub struct Orchestrator {
    runtime: Arc<dyn RuntimeAdapter>,
    registry: Arc<InstanceRegistry>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<dyn RuntimeAdapter>,
        registry: Arc<InstanceRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            runtime,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn instance_dir(&self, id: InstanceId) -> PathBuf {
        self.config.data_root.join(id.to_string())
    }

    pub fn certificate_path(&self, id: InstanceId) -> PathBuf {
        self.instance_dir(id).join("ssl").join(CERT_FILE_NAME)
    }

    /// Stands up one proxy instance. Never fails across this boundary: every
    /// error becomes a failure result, and a failure result means no registry
    /// record was written.
    #[instrument(skip(self, request), fields(instance_id = request.instance_id))]
    pub async fn provision(&self, request: ProvisionRequest) -> ProvisionResult {
        match self.try_provision(&request).await {
            Ok(runtime_id) => {
                info!(%runtime_id, "Instance provisioned");
                ProvisionResult::succeeded(request.instance_id, runtime_id)
            }
            Err(e) => {
                error!(error = %e, "Provisioning failed");
                ProvisionResult::failed(request.instance_id, e)
            }
        }
    }

    async fn try_provision(&self, request: &ProvisionRequest) -> Result<String> {
        let ports = validate_request(request)?;
        let id = request.instance_id;

        // Opened ports are not rolled back if a later step fails.
        for port in ports.all() {
            self.runtime.open_firewall_port(port, Protocol::Tcp).await?;
        }
        self.runtime.add_traffic_counting_rule(ports.inbound).await?;

        let cert_path = self.certificate_path(id);
        let cert_dir = cert_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.instance_dir(id));
        self.runtime.create_host_directory(&cert_dir).await?;
        self.runtime
            .write_host_file(&cert_path, &request.certificate_key)
            .await?;

        let spec = self.container_spec(request, ports, cert_dir);
        let runtime_id = self.runtime.create_container(&spec).await?;
        self.runtime.start_container(&runtime_id).await?;

        let record = InstanceRecord::new(id, ports.inbound);
        if !self.registry.add(record.clone()).await? {
            // Recreated container: its counters start over.
            warn!(instance_id = id, "Instance was already registered, resetting its counters");
            self.registry.update(record).await?;
        }
        Ok(runtime_id)
    }

    fn container_spec(
        &self,
        request: &ProvisionRequest,
        ports: ValidatedPorts,
        cert_dir: PathBuf,
    ) -> ContainerSpec {
        let mut env = BTreeMap::new();
        env.insert("SERVICE_PROTOCOL".to_string(), "rest".to_string());
        env.insert(
            "SSL_CLIENT_CERT_FILE".to_string(),
            format!("{CERT_MOUNT_DIR}/{CERT_FILE_NAME}"),
        );

        ContainerSpec {
            image: request.image_name.trim().to_string(),
            name: container_name(request.instance_id),
            port_mappings: vec![
                PortMapping::tcp(ports.inbound, ports.inbound),
                PortMapping::tcp(ports.xray, XRAY_CONTAINER_PORT),
                PortMapping::tcp(ports.api, API_CONTAINER_PORT),
            ],
            env,
            volumes: vec![VolumeMapping::read_only(cert_dir, CERT_MOUNT_DIR)],
            command: None,
            network_mode: self.config.network.clone(),
        }
    }

    /// Best-effort teardown. Every step runs even if an earlier one failed,
    /// so calling it again converges.
    #[instrument(skip(self))]
    pub async fn deprovision(&self, instance_id: InstanceId) -> DeprovisionOutcome {
        let mut outcome = DeprovisionOutcome {
            instance_id,
            ..Default::default()
        };
        let name = container_name(instance_id);

        let record = match self.registry.get(instance_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Could not read registry, continuing without record");
                outcome.failed_steps.push(format!("lookup record: {e}"));
                None
            }
        };
        outcome.record_found = record.is_some();
        if record.is_none() {
            info!("No registry record, skipping firewall cleanup");
        }

        step(&mut outcome, "stop container", self.runtime.stop_container(&name).await);
        step(&mut outcome, "delete container", self.runtime.delete_container(&name).await);

        if let Some(record) = &record {
            step(
                &mut outcome,
                "remove traffic counting rule",
                self.runtime
                    .remove_traffic_counting_rule(record.inbound_port)
                    .await,
            );
            step(
                &mut outcome,
                "close inbound port",
                self.runtime
                    .close_firewall_port(record.inbound_port, Protocol::Tcp)
                    .await,
            );
        }

        step(
            &mut outcome,
            "remove host directory",
            self.runtime
                .remove_host_directory(&self.instance_dir(instance_id))
                .await,
        );

        if let Err(e) = self.registry.remove(instance_id).await {
            error!(error = %e, "Failed to remove registry record");
            outcome.failed_steps.push(format!("remove record: {e}"));
        }

        if outcome.is_clean() {
            info!("Instance deprovisioned");
        } else {
            warn!(failed = ?outcome.failed_steps, "Instance deprovisioned with failures");
        }
        outcome
    }

    pub async fn status(&self, instance_id: InstanceId) -> String {
        self.runtime
            .container_status(&container_name(instance_id))
            .await
    }

    pub async fn logs(&self, instance_id: InstanceId) -> Result<String> {
        Ok(self
            .runtime
            .container_logs(&container_name(instance_id))
            .await?)
    }

    pub async fn pause(&self, instance_id: InstanceId) -> Result<String> {
        let name = container_name(instance_id);
        self.runtime.pause_container(&name).await?;
        info!(container = %name, "Container paused");
        Ok(format!("Container {name} paused"))
    }

    pub async fn resume(&self, instance_id: InstanceId) -> Result<String> {
        let name = container_name(instance_id);
        self.runtime.unpause_container(&name).await?;
        info!(container = %name, "Container resumed");
        Ok(format!("Container {name} resumed"))
    }

    pub async fn instance_traffic(&self, instance_id: InstanceId) -> Result<TrafficSnapshot> {
        Ok(self
            .runtime
            .container_traffic(&container_name(instance_id))
            .await?)
    }

    pub async fn list_instances(&self) -> Result<Vec<InstanceRecord>> {
        Ok(self.registry.get_all().await?)
    }
}

#[async_trait]
impl TrafficSource for Orchestrator {
    async fn instance_traffic(&self, instance_id: InstanceId) -> node_common::Result<TrafficSnapshot> {
        Orchestrator::instance_traffic(self, instance_id)
            .await
            .map_err(NodeError::from)
    }
}

fn step(outcome: &mut DeprovisionOutcome, name: &str, result: node_common::Result<()>) {
    match result {
        Ok(()) => {}
        // Already gone.
        Err(NodeError::NotFound(_)) => debug!(step = name, "Nothing to clean up"),
        Err(e) => {
            warn!(step = name, error = %e, "Deprovision step failed");
            outcome.failed_steps.push(format!("{name}: {e}"));
        }
    }
}
