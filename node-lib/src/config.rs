use node_runtime::traffic::{TrafficProbe, DEFAULT_SIDECAR_URL};
use node_runtime::RuntimeConfig;
use node_usage::DEFAULT_COLLECTOR_PATH;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_DATA_ROOT: &str = "/var/lib/proxy-node";
pub const REGISTRY_FILE_NAME: &str = "instances.json";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorConfig {
    pub url: String,
    pub path: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub api_host: String,
    pub api_port: u16,
    pub data_root: PathBuf,
    pub registry_path: PathBuf,
    /// `None` leaves the engine's default network.
    pub container_network: Option<String>,
    /// Metering is disabled when no collector is configured.
    pub collector: Option<CollectorConfig>,
    pub metering_interval: Duration,
    pub stats_timeout: Duration,
    pub restore_delay: Duration,
    pub runtime: RuntimeConfig,
}

impl NodeConfig {
    /// Reads `NODE_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let data_root = get("NODE_DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT));
        let registry_path = get("NODE_REGISTRY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_root.join(REGISTRY_FILE_NAME));

        let collector = match get("NODE_COLLECTOR_URL") {
            Some(url) => Some(CollectorConfig {
                url,
                path: get("NODE_COLLECTOR_PATH")
                    .unwrap_or_else(|| DEFAULT_COLLECTOR_PATH.to_string()),
                api_key: get("NODE_COLLECTOR_API_KEY"),
                timeout: secs(&get, "NODE_COLLECTOR_TIMEOUT_SECS", 30)?,
            }),
            None => None,
        };

        let mut traffic_probe: TrafficProbe =
            parse(&get, "NODE_TRAFFIC_PROBE", TrafficProbe::EngineStats)?;
        if let TrafficProbe::Sidecar { url } = &mut traffic_probe {
            *url = get("NODE_SIDECAR_URL").unwrap_or_else(|| DEFAULT_SIDECAR_URL.to_string());
        }

        let defaults = RuntimeConfig::default();
        let runtime = RuntimeConfig {
            docker_socket: get("NODE_DOCKER_SOCKET")
                .map(PathBuf::from)
                .unwrap_or(defaults.docker_socket),
            stream_timeout: secs(&get, "NODE_STREAM_TIMEOUT_SECS", 30)?,
            accounting_chain: get("NODE_ACCOUNTING_CHAIN").unwrap_or(defaults.accounting_chain),
            rules_save_path: get("NODE_RULES_SAVE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.rules_save_path),
            use_sudo: parse(&get, "NODE_USE_SUDO", true)?,
            traffic_probe,
        };

        Ok(Self {
            api_host: get("NODE_API_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            api_port: parse(&get, "NODE_API_PORT", 8080)?,
            data_root,
            registry_path,
            container_network: Some(
                get("NODE_CONTAINER_NETWORK").unwrap_or_else(|| "bridge".to_string()),
            ),
            collector,
            metering_interval: secs(&get, "NODE_METERING_INTERVAL_SECS", 60)?,
            stats_timeout: secs(&get, "NODE_STATS_TIMEOUT_SECS", 15)?,
            restore_delay: Duration::from_secs(parse(&get, "NODE_RESTORE_DELAY_SECS", 10)?),
            runtime,
        })
    }
}

fn parse<T>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    let Some(value) = get(var) else {
        return Ok(default);
    };
    match value.parse::<T>() {
        Ok(parsed) => Ok(parsed),
        Err(e) => Err(ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

/// A positive number of seconds.
fn secs(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let value = parse(get, var, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: "0".to_string(),
            reason: "must be at least one second".to_string(),
        });
    }
    Ok(Duration::from_secs(value))
}
