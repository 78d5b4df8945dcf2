#![allow(dead_code)]

use async_trait::async_trait;
use node_agent_lib::{NodeConfig, NodeContext};
use node_common::{ContainerSpec, NodeError, Protocol, RuntimeAdapter, TrafficSnapshot};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// In-memory runtime: containers named `xray-node-<id>` exist once created.
#[derive(Default)]
pub struct FakeRuntime {
    pub calls: Mutex<Vec<String>>,
    pub containers: Mutex<HashSet<String>>,
    pub traffic: Mutex<HashMap<String, TrafficSnapshot>>,
    pub failing_ports: Mutex<HashSet<u16>>,
}

impl FakeRuntime {
    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn exists(&self, name: &str) -> node_common::Result<()> {
        if self.containers.lock().unwrap().contains(name) {
            Ok(())
        } else {
            Err(NodeError::NotFound(format!("no such container: {name}")))
        }
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RuntimeAdapter for FakeRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> node_common::Result<String> {
        self.log(format!("create {}", spec.name));
        self.containers.lock().unwrap().insert(spec.name.clone());
        Ok(format!("{}-runtime", spec.name))
    }
    async fn start_container(&self, id: &str) -> node_common::Result<()> {
        self.log(format!("start {id}"));
        Ok(())
    }
    async fn stop_container(&self, id: &str) -> node_common::Result<()> {
        self.log(format!("stop {id}"));
        self.exists(id)
    }
    async fn pause_container(&self, id: &str) -> node_common::Result<()> {
        self.log(format!("pause {id}"));
        self.exists(id)
    }
    async fn unpause_container(&self, id: &str) -> node_common::Result<()> {
        self.log(format!("unpause {id}"));
        self.exists(id)
    }
    async fn delete_container(&self, id: &str) -> node_common::Result<()> {
        self.log(format!("delete {id}"));
        self.exists(id)?;
        self.containers.lock().unwrap().remove(id);
        Ok(())
    }
    async fn container_status(&self, id: &str) -> String {
        if self.exists(id).is_ok() {
            "running".to_string()
        } else {
            "unknown".to_string()
        }
    }
    async fn container_logs(&self, id: &str) -> node_common::Result<String> {
        self.exists(id)?;
        Ok("xray started\n---stderr---\nwarning".to_string())
    }
    async fn exec_in_container(&self, id: &str, _argv: &[String]) -> node_common::Result<String> {
        self.exists(id)?;
        Ok(String::new())
    }
    async fn container_traffic(&self, id: &str) -> node_common::Result<TrafficSnapshot> {
        self.exists(id)?;
        Ok(self
            .traffic
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or_default())
    }
    async fn create_host_directory(&self, path: &Path) -> node_common::Result<()> {
        self.log(format!("mkdir {}", path.display()));
        Ok(())
    }
    async fn remove_host_directory(&self, path: &Path) -> node_common::Result<()> {
        self.log(format!("rmdir {}", path.display()));
        Ok(())
    }
    async fn write_host_file(&self, path: &Path, _content: &str) -> node_common::Result<()> {
        self.log(format!("write {}", path.display()));
        Ok(())
    }
    async fn open_firewall_port(&self, port: u16, protocol: Protocol) -> node_common::Result<()> {
        self.log(format!("open {port}/{protocol}"));
        Ok(())
    }
    async fn close_firewall_port(&self, port: u16, protocol: Protocol) -> node_common::Result<()> {
        self.log(format!("close {port}/{protocol}"));
        Ok(())
    }
    async fn add_traffic_counting_rule(&self, port: u16) -> node_common::Result<()> {
        self.log(format!("count {port}"));
        if self.failing_ports.lock().unwrap().contains(&port) {
            return Err(NodeError::HostCommand(format!(
                "iptables -A PROXY_ACCOUNTING --dport {port}: permission denied"
            )));
        }
        Ok(())
    }
    async fn remove_traffic_counting_rule(&self, port: u16) -> node_common::Result<()> {
        self.log(format!("uncount {port}"));
        Ok(())
    }
}

pub fn test_context(dir: &tempfile::TempDir, runtime: Arc<FakeRuntime>) -> NodeContext {
    let data_root = dir.path().to_string_lossy().into_owned();
    let config = NodeConfig::from_lookup(|key| match key {
        "NODE_DATA_ROOT" => Some(data_root.clone()),
        _ => None,
    })
    .unwrap();
    NodeContext::with_runtime(config, runtime)
}
