// Re-export dependencies used in public interfaces of common types

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Validation Error: {0}")]
    Validation(String),

    #[error("Engine Error: {0}")]
    Engine(String),

    #[error("Host Command Error: {0}")]
    HostCommand(String),

    #[error("Traffic Fetch Error: {0}")]
    Traffic(String),

    #[error("Registry Error: {0}")]
    Registry(String),

    #[error("Collector Error: {0}")]
    Collector(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

// Define the primary Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

/// Tenant-facing identifier of a provisioned instance.
pub type InstanceId = i64;

/// Every proxy container is named `<prefix><instance id>`.
pub const CONTAINER_NAME_PREFIX: &str = "xray-node-";

/// Returned by status polling when the engine cannot inspect the container.
pub const UNKNOWN_STATUS: &str = "unknown";

pub fn container_name(instance_id: InstanceId) -> String {
    format!("{CONTAINER_NAME_PREFIX}{instance_id}")
}

/// Registry entry for one provisioned instance.
///
/// `last_total_rx`/`last_total_tx` always hold the most recent successfully
/// observed counters for the instance's container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub inbound_port: u16,
    #[serde(default)]
    pub last_total_rx: u64,
    #[serde(default)]
    pub last_total_tx: u64,
}

impl InstanceRecord {
    pub fn new(id: InstanceId, inbound_port: u16) -> Self {
        Self {
            id,
            inbound_port,
            last_total_rx: 0,
            last_total_tx: 0,
        }
    }

    pub fn last_snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot::new(self.last_total_rx, self.last_total_tx)
    }

    pub fn advance_to(&mut self, snapshot: TrafficSnapshot) {
        self.last_total_rx = snapshot.total_bytes_in;
        self.last_total_tx = snapshot.total_bytes_out;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub instance_id: InstanceId,
    pub certificate_key: String,
    pub image_name: String,
    pub customer_id: i64,
    pub inbound_port: i32,
    pub xray_port: i32,
    pub api_port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionResult {
    pub instance_id: InstanceId,
    pub success: bool,
    pub error_message: Option<String>,
    pub container_runtime_id: Option<String>,
    pub user_uuid: Option<String>,
}

impl ProvisionResult {
    pub fn succeeded(instance_id: InstanceId, container_runtime_id: String) -> Self {
        Self {
            instance_id,
            success: true,
            error_message: None,
            container_runtime_id: Some(container_runtime_id),
            user_uuid: None,
        }
    }

    pub fn failed(instance_id: InstanceId, error: impl Display) -> Self {
        Self {
            instance_id,
            success: false,
            error_message: Some(error.to_string()),
            container_runtime_id: None,
            user_uuid: None,
        }
    }
}

impl Display for ProvisionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ProvisionResult(instance_id: {}, success: {}, container: {:?}, error: {:?})",
            self.instance_id, self.success, self.container_runtime_id, self.error_message
        )
    }
}

/// Cumulative byte counters of a running container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSnapshot {
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
}

impl TrafficSnapshot {
    pub fn new(total_bytes_in: u64, total_bytes_out: u64) -> Self {
        Self {
            total_bytes_in,
            total_bytes_out,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceUsage {
    pub instance_id: InstanceId,
    pub total_usage_in_bytes: u64,
}

/// Usage collected during one metering cycle, in registry order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub usages: Vec<InstanceUsage>,
}

impl UsageReport {
    pub fn push(&mut self, instance_id: InstanceId, total_usage_in_bytes: u64) {
        self.usages.push(InstanceUsage {
            instance_id,
            total_usage_in_bytes,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.usages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.usages.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl PortMapping {
    pub fn tcp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
            protocol: Protocol::Tcp,
        }
    }

    /// Engine key for the container side, e.g. `62051/tcp`.
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMapping {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl VolumeMapping {
    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }
}

/// Everything the engine needs to create (not start) a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub port_mappings: Vec<PortMapping>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMapping>,
    pub command: Option<Vec<String>>,
    pub network_mode: Option<String>,
}

/// The only seam allowed to touch the container engine or run privileged
/// host commands. Implementations are stateless and safe to share.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Pulls the image if missing, force-removes any container with the same
    /// name, then creates the container. Returns the engine's runtime id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    async fn stop_container(&self, id: &str) -> Result<()>;
    async fn pause_container(&self, id: &str) -> Result<()>;
    async fn unpause_container(&self, id: &str) -> Result<()>;
    /// Force removal regardless of running state.
    async fn delete_container(&self, id: &str) -> Result<()>;
    /// Never fails; yields [`UNKNOWN_STATUS`] when inspection fails.
    async fn container_status(&self, id: &str) -> String;
    async fn container_logs(&self, id: &str) -> Result<String>;
    /// Trimmed stdout of the command. An empty string is a valid result.
    async fn exec_in_container(&self, id: &str, argv: &[String]) -> Result<String>;
    async fn container_traffic(&self, id: &str) -> Result<TrafficSnapshot>;

    async fn create_host_directory(&self, path: &Path) -> Result<()>;
    async fn remove_host_directory(&self, path: &Path) -> Result<()>;
    async fn write_host_file(&self, path: &Path, content: &str) -> Result<()>;
    async fn open_firewall_port(&self, port: u16, protocol: Protocol) -> Result<()>;
    async fn close_firewall_port(&self, port: u16, protocol: Protocol) -> Result<()>;
    async fn add_traffic_counting_rule(&self, port: u16) -> Result<()>;
    async fn remove_traffic_counting_rule(&self, port: u16) -> Result<()>;
}

/// Current cumulative counters for a registered instance.
#[async_trait]
pub trait TrafficSource: Send + Sync {
    async fn instance_traffic(&self, instance_id: InstanceId) -> Result<TrafficSnapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name_uses_prefix() {
        assert_eq!(container_name(42), "xray-node-42");
    }

    #[test]
    fn test_registry_file_format() {
        let record = InstanceRecord {
            id: 7,
            inbound_port: 8443,
            last_total_rx: 100,
            last_total_tx: 50,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["inboundPort"], 8443);
        assert_eq!(json["lastTotalRx"], 100);
        assert_eq!(json["lastTotalTx"], 50);

        let parsed: InstanceRecord =
            serde_json::from_str(r#"{"id": 9, "inboundPort": 2053}"#).unwrap();
        assert_eq!(parsed, InstanceRecord::new(9, 2053));
    }

    #[test]
    fn test_traffic_snapshot_wire_format() {
        let json = serde_json::to_value(TrafficSnapshot::new(10, 20)).unwrap();
        assert_eq!(json, serde_json::json!({"totalBytesIn": 10, "totalBytesOut": 20}));
    }

    #[test]
    fn test_usage_report_wire_format() {
        let mut report = UsageReport::default();
        assert!(report.is_empty());
        report.push(3, 4096);
        let json = serde_json::to_string(&report).unwrap();
        assert_eq!(json, r#"{"usages":[{"instanceId":3,"totalUsageInBytes":4096}]}"#);
    }

    #[test]
    fn test_port_mapping_key() {
        assert_eq!(PortMapping::tcp(9000, 62051).container_key(), "62051/tcp");
    }
}
