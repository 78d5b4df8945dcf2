use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::CreateExecOptions;
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{
    HostConfig, Mount, MountTypeEnum, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::Docker;
use futures::StreamExt;
use node_common::{
    ContainerSpec, NodeError, Protocol, Result as CommonResult, RuntimeAdapter, TrafficSnapshot,
    UNKNOWN_STATUS,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

// Re-export dependencies potentially needed by consumers (like the orchestrator)
pub use bollard;
pub use node_common as common;

pub mod demux;
pub mod engine_socket;
pub mod firewall;
pub mod host;
pub mod traffic;

use demux::DemuxedOutput;
use engine_socket::EngineSocket;
use firewall::Firewall;
use host::{CommandRunner, HostShell, SystemCommandRunner};
use traffic::{sum_network_stats, TrafficProbe};

pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("{operation} failed for {target}: {source}")]
    Engine {
        operation: &'static str,
        target: String,
        #[source]
        source: BollardError,
    },
    #[error("{operation} rejected for {target} (status {status}): {message}")]
    EngineRejected {
        operation: &'static str,
        target: String,
        status: u16,
        message: String,
    },
    #[error("{operation} request to {target} failed: {source}")]
    Transport {
        operation: &'static str,
        target: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Host command '{command}' failed (exit {code:?}): {stderr}")]
    HostCommand {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Malformed multiplexed stream: {0}")]
    Framing(String),
    #[error("Stream from {target} cancelled after {after:?}")]
    StreamTimeout { target: String, after: Duration },
    #[error("Traffic read failed for {target}: {message}")]
    Traffic { target: String, message: String },
    #[error("Invalid container spec for {target}: {message}")]
    InvalidSpec { target: String, message: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    fn engine<'a>(operation: &'static str, target: &'a str) -> impl FnOnce(BollardError) -> Self + 'a {
        move |source| RuntimeError::Engine {
            operation,
            target: target.to_string(),
            source,
        }
    }

    fn transport<'a, E>(operation: &'static str, target: &'a str) -> impl FnOnce(E) -> Self + 'a
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        move |source| RuntimeError::Transport {
            operation,
            target: target.to_string(),
            source: Box::new(source),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            RuntimeError::Engine {
                source: BollardError::DockerResponseServerError { status_code, .. },
                ..
            } => *status_code == 404,
            RuntimeError::EngineRejected { status, .. } => *status == 404,
            _ => false,
        }
    }
}

// Implement conversion from RuntimeError to the common NodeError
impl From<RuntimeError> for NodeError {
    fn from(err: RuntimeError) -> Self {
        if err.is_not_found() {
            return NodeError::NotFound(err.to_string());
        }
        match err {
            RuntimeError::HostCommand { .. } => NodeError::HostCommand(err.to_string()),
            RuntimeError::Traffic { .. } => NodeError::Traffic(err.to_string()),
            RuntimeError::InvalidSpec { .. } => NodeError::Validation(err.to_string()),
            RuntimeError::Io(e) => NodeError::Io(e),
            other => NodeError::Engine(other.to_string()),
        }
    }
}

// Define local Result using the crate's Error type
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub docker_socket: PathBuf,
    pub stream_timeout: Duration,
    pub accounting_chain: String,
    pub rules_save_path: PathBuf,
    pub use_sudo: bool,
    pub traffic_probe: TrafficProbe,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_socket: PathBuf::from(DEFAULT_DOCKER_SOCKET),
            stream_timeout: Duration::from_secs(30),
            accounting_chain: firewall::DEFAULT_ACCOUNTING_CHAIN.to_string(),
            rules_save_path: PathBuf::from(firewall::DEFAULT_RULES_SAVE_PATH),
            use_sudo: true,
            traffic_probe: TrafficProbe::default(),
        }
    }
}

// --- DockerRuntime Implementation ---

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
    socket: EngineSocket,
    shell: HostShell,
    firewall: Firewall,
    probe: TrafficProbe,
}

impl DockerRuntime {
    pub fn new(docker: Arc<Docker>, runner: Arc<dyn CommandRunner>, config: RuntimeConfig) -> Self {
        let shell = HostShell::new(runner);
        Self {
            docker,
            socket: EngineSocket::new(&config.docker_socket, config.stream_timeout),
            firewall: Firewall::new(
                shell.clone(),
                config.accounting_chain,
                config.rules_save_path,
            ),
            shell,
            probe: config.traffic_probe,
        }
    }

    /// Connects to the engine socket named in `config` and runs host commands
    /// as real processes.
    pub fn connect(config: RuntimeConfig) -> Result<Self> {
        let socket = config.docker_socket.to_string_lossy().into_owned();
        let docker = Docker::connect_with_unix(&socket, 120, bollard::API_DEFAULT_VERSION)
            .map_err(RuntimeError::engine("connect", &socket))?;
        let runner = Arc::new(SystemCommandRunner::new(config.use_sudo));
        Ok(Self::new(Arc::new(docker), runner, config))
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        let mut filters = HashMap::new();
        filters.insert("reference".to_string(), vec![image.to_string()]);
        let present = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                filters,
                ..Default::default()
            }))
            .await
            .map_err(RuntimeError::engine("list images", image))?;
        if !present.is_empty() {
            return Ok(());
        }

        info!(%image, "Pulling image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress.map_err(RuntimeError::engine("pull image", image))?;
        }
        Ok(())
    }

    async fn remove_existing(&self, name: &str) -> Result<()> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![format!("^/{name}$")]);
        let existing = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(RuntimeError::engine("list containers", name))?;

        let wanted = format!("/{name}");
        for container in existing {
            let same_name = container
                .names
                .as_ref()
                .map_or(false, |names| names.iter().any(|n| *n == wanted));
            let Some(id) = container.id.filter(|_| same_name) else {
                continue;
            };
            warn!(%name, %id, "Removing existing container");
            self.docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
                .map_err(RuntimeError::engine("remove container", name))?;
        }
        Ok(())
    }

    async fn engine_stats(&self, id: &str) -> Result<TrafficSnapshot> {
        let mut samples = self.docker.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        while let Some(sample) = samples.next().await {
            let sample = sample.map_err(RuntimeError::engine("stats", id))?;
            if let Some(networks) = sample.networks.as_ref().filter(|n| !n.is_empty()) {
                return Ok(sum_network_stats(networks));
            }
        }
        Err(RuntimeError::Traffic {
            target: id.to_string(),
            message: "no stats sample carried network counters".to_string(),
        })
    }

    #[instrument(skip(self, argv), fields(container = %id))]
    async fn exec(&self, id: &str, argv: &[String]) -> Result<DemuxedOutput> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(argv.to_vec()),
                    ..Default::default()
                },
            )
            .await
            .map_err(RuntimeError::engine("create exec", id))?;

        let output = self.socket.start_exec(&exec.id).await?;

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(RuntimeError::engine("inspect exec", id))?;
        let stderr = output.stderr_text();
        match inspect.exit_code {
            Some(code) if code != 0 => {
                return Err(RuntimeError::EngineRejected {
                    operation: "exec",
                    target: id.to_string(),
                    status: 500,
                    message: format!("`{}` exited with {code}: {}", argv.join(" "), stderr.trim()),
                });
            }
            _ => {}
        }
        if !stderr.trim().is_empty() {
            warn!(command = %argv.join(" "), stderr = %stderr.trim(), "Exec wrote to stderr");
        }
        Ok(output)
    }
}

/// Translates a [`ContainerSpec`] into the engine's create body.
pub fn build_container_config(spec: &ContainerSpec) -> Result<Config<String>> {
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();

    for mapping in &spec.port_mappings {
        if mapping.host_port == 0 || mapping.container_port == 0 {
            return Err(RuntimeError::InvalidSpec {
                target: spec.name.clone(),
                message: format!(
                    "invalid port mapping {}:{}",
                    mapping.host_port,
                    mapping.container_key()
                ),
            });
        }
        let key = mapping.container_key();
        port_bindings
            .entry(key.clone())
            .or_insert_with(|| Some(Vec::new()))
            .get_or_insert_with(Vec::new)
            .push(PortBinding {
                host_ip: None,
                host_port: Some(mapping.host_port.to_string()),
            });
        exposed_ports.insert(key, HashMap::new());
    }

    let mounts = spec
        .volumes
        .iter()
        .map(|volume| Mount {
            typ: Some(MountTypeEnum::BIND),
            source: Some(volume.source.to_string_lossy().into_owned()),
            target: Some(volume.target.clone()),
            read_only: Some(volume.read_only),
            ..Default::default()
        })
        .collect();

    let env = spec
        .env
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    Ok(Config {
        image: Some(spec.image.clone()),
        env: Some(env),
        cmd: spec.command.clone(),
        tty: Some(false),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            network_mode: spec.network_mode.clone(),
            port_bindings: Some(port_bindings),
            mounts: Some(mounts),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::ALWAYS),
                maximum_retry_count: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[async_trait]
impl RuntimeAdapter for DockerRuntime {
    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create_container(&self, spec: &ContainerSpec) -> CommonResult<String> {
        let config = build_container_config(spec)?;
        self.ensure_image(&spec.image).await?;
        self.remove_existing(&spec.name).await?;

        info!("Creating container");
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(RuntimeError::engine("create container", &spec.name))?;
        for warning in &created.warnings {
            warn!(%warning, "Engine warning on create");
        }
        info!(container_id = %created.id, "Container created");
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> CommonResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(RuntimeError::engine("start container", id))?;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> CommonResult<()> {
        match self.docker.stop_container(id, None).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(RuntimeError::engine("stop container", id)(e).into()),
        }
    }

    async fn pause_container(&self, id: &str) -> CommonResult<()> {
        self.docker
            .pause_container(id)
            .await
            .map_err(RuntimeError::engine("pause container", id))?;
        Ok(())
    }

    async fn unpause_container(&self, id: &str) -> CommonResult<()> {
        self.docker
            .unpause_container(id)
            .await
            .map_err(RuntimeError::engine("unpause container", id))?;
        Ok(())
    }

    async fn delete_container(&self, id: &str) -> CommonResult<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(RuntimeError::engine("remove container", id))?;
        Ok(())
    }

    async fn container_status(&self, id: &str) -> String {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect
                .state
                .and_then(|state| state.status)
                .map(|status| status.to_string())
                .filter(|status| !status.is_empty())
                .unwrap_or_else(|| UNKNOWN_STATUS.to_string()),
            Err(e) => {
                debug!(container = %id, error = %e, "Inspect failed, reporting unknown status");
                UNKNOWN_STATUS.to_string()
            }
        }
    }

    #[instrument(skip(self), fields(container = %id))]
    async fn container_logs(&self, id: &str) -> CommonResult<String> {
        let output = self.socket.container_logs(id).await?;
        Ok(output.combined_logs())
    }

    async fn exec_in_container(&self, id: &str, argv: &[String]) -> CommonResult<String> {
        let output = self.exec(id, argv).await?;
        Ok(output.stdout_text().trim().to_string())
    }

    async fn container_traffic(&self, id: &str) -> CommonResult<TrafficSnapshot> {
        match self.probe.exec_argv() {
            None => Ok(self.engine_stats(id).await?),
            Some(argv) => {
                let output = self.exec(id, &argv).await?;
                Ok(self.probe.parse_exec_output(id, &output.stdout_text())?)
            }
        }
    }

    async fn create_host_directory(&self, path: &Path) -> CommonResult<()> {
        Ok(self.shell.create_directory(path).await?)
    }

    async fn remove_host_directory(&self, path: &Path) -> CommonResult<()> {
        Ok(self.shell.remove_directory(path).await?)
    }

    async fn write_host_file(&self, path: &Path, content: &str) -> CommonResult<()> {
        Ok(self.shell.write_file(path, content).await?)
    }

    async fn open_firewall_port(&self, port: u16, protocol: Protocol) -> CommonResult<()> {
        Ok(self.firewall.open_port(port, protocol).await?)
    }

    async fn close_firewall_port(&self, port: u16, protocol: Protocol) -> CommonResult<()> {
        Ok(self.firewall.close_port(port, protocol).await?)
    }

    async fn add_traffic_counting_rule(&self, port: u16) -> CommonResult<()> {
        Ok(self.firewall.add_counting_rule(port).await?)
    }

    async fn remove_traffic_counting_rule(&self, port: u16) -> CommonResult<()> {
        Ok(self.firewall.remove_counting_rule(port).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_common::{PortMapping, VolumeMapping};
    use std::collections::BTreeMap;

    fn proxy_spec() -> ContainerSpec {
        let mut env = BTreeMap::new();
        env.insert("SERVICE_PROTOCOL".to_string(), "rest".to_string());
        ContainerSpec {
            image: "gozargah/marzban-node:latest".to_string(),
            name: "xray-node-1".to_string(),
            port_mappings: vec![
                PortMapping::tcp(8443, 8443),
                PortMapping::tcp(9001, 62051),
                PortMapping::tcp(9002, 62050),
            ],
            env,
            volumes: vec![VolumeMapping::read_only(
                "/var/lib/proxy-node/1/ssl",
                "/var/lib/marzban-node/ssl",
            )],
            command: None,
            network_mode: Some("bridge".to_string()),
        }
    }

    #[test]
    fn test_container_config_bindings() {
        let config = build_container_config(&proxy_spec()).unwrap();
        assert_eq!(config.image.as_deref(), Some("gozargah/marzban-node:latest"));
        assert_eq!(config.env.unwrap(), vec!["SERVICE_PROTOCOL=rest".to_string()]);
        assert_eq!(config.exposed_ports.unwrap().len(), 3);

        let host = config.host_config.unwrap();
        let bindings = host.port_bindings.unwrap();
        let xray = bindings["62051/tcp"].as_ref().unwrap();
        assert_eq!(xray[0].host_port.as_deref(), Some("9001"));
        assert_eq!(
            host.restart_policy.unwrap().name,
            Some(RestartPolicyNameEnum::ALWAYS)
        );

        let mounts = host.mounts.unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].typ, Some(MountTypeEnum::BIND));
        assert_eq!(mounts[0].read_only, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("bridge"));
    }

    #[test]
    fn test_zero_port_is_rejected() {
        let mut spec = proxy_spec();
        spec.port_mappings.push(PortMapping::tcp(0, 80));
        let err = build_container_config(&spec).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidSpec { .. }));
        assert!(matches!(NodeError::from(err), NodeError::Validation(_)));
    }

    #[test]
    fn test_not_found_maps_to_common_not_found() {
        let err = RuntimeError::EngineRejected {
            operation: "logs",
            target: "xray-node-9".to_string(),
            status: 404,
            message: "No such container".to_string(),
        };
        assert!(matches!(NodeError::from(err), NodeError::NotFound(_)));

        let host = RuntimeError::HostCommand {
            command: "ufw allow 1/tcp".to_string(),
            code: Some(1),
            stderr: "boom".to_string(),
        };
        assert!(matches!(NodeError::from(host), NodeError::HostCommand(_)));
    }
}
