use crate::{Result, RuntimeError};
use bollard::container::NetworkStats;
use node_common::TrafficSnapshot;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_SIDECAR_URL: &str = "http://127.0.0.1:62050/traffic";

/// Where a container's cumulative byte counters are read from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TrafficProbe {
    /// First engine stats sample carrying network counters, summed over all
    /// interfaces.
    #[default]
    EngineStats,
    /// `/proc/net/dev` read inside the container, loopback excluded.
    ProcNetDev,
    /// JSON `{"in": .., "out": ..}` from a metrics endpoint only reachable
    /// from the container's network namespace.
    Sidecar { url: String },
}

impl TrafficProbe {
    /// Command run inside the container for the exec based probes.
    pub fn exec_argv(&self) -> Option<Vec<String>> {
        match self {
            TrafficProbe::EngineStats => None,
            TrafficProbe::ProcNetDev => Some(vec!["cat".to_string(), "/proc/net/dev".to_string()]),
            TrafficProbe::Sidecar { url } => Some(vec![
                "wget".to_string(),
                "-qO-".to_string(),
                url.clone(),
            ]),
        }
    }

    pub fn parse_exec_output(&self, target: &str, output: &str) -> Result<TrafficSnapshot> {
        match self {
            TrafficProbe::EngineStats => Err(RuntimeError::Traffic {
                target: target.to_string(),
                message: "engine stats are not read through exec".to_string(),
            }),
            TrafficProbe::ProcNetDev => parse_proc_net_dev(output).map_err(|message| {
                RuntimeError::Traffic {
                    target: target.to_string(),
                    message,
                }
            }),
            TrafficProbe::Sidecar { .. } => parse_sidecar_payload(output).map_err(|message| {
                RuntimeError::Traffic {
                    target: target.to_string(),
                    message,
                }
            }),
        }
    }
}

impl FromStr for TrafficProbe {
    type Err = String;

    /// `engine-stats`, `proc-net-dev` or `sidecar` (which uses the default
    /// sidecar url until overridden).
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "engine-stats" | "stats" => Ok(TrafficProbe::EngineStats),
            "proc-net-dev" | "procfs" => Ok(TrafficProbe::ProcNetDev),
            "sidecar" => Ok(TrafficProbe::Sidecar {
                url: DEFAULT_SIDECAR_URL.to_string(),
            }),
            other => Err(format!("unknown traffic probe '{other}'")),
        }
    }
}

impl fmt::Display for TrafficProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficProbe::EngineStats => f.write_str("engine-stats"),
            TrafficProbe::ProcNetDev => f.write_str("proc-net-dev"),
            TrafficProbe::Sidecar { url } => write!(f, "sidecar({url})"),
        }
    }
}

pub fn sum_network_stats(networks: &HashMap<String, NetworkStats>) -> TrafficSnapshot {
    networks
        .values()
        .fold(TrafficSnapshot::default(), |acc, net| {
            TrafficSnapshot::new(
                acc.total_bytes_in.saturating_add(net.rx_bytes),
                acc.total_bytes_out.saturating_add(net.tx_bytes),
            )
        })
}

/// Sums receive and transmit byte columns of every non-loopback interface.
pub fn parse_proc_net_dev(text: &str) -> std::result::Result<TrafficSnapshot, String> {
    let mut snapshot = TrafficSnapshot::default();
    let mut interfaces = 0;

    for line in text.lines() {
        let Some((name, counters)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() || name.contains('|') {
            continue;
        }
        let fields: Vec<&str> = counters.split_whitespace().collect();
        if fields.len() < 9 {
            return Err(format!("interface {name} has {} counter columns", fields.len()));
        }
        if name == "lo" {
            continue;
        }
        let rx: u64 = fields[0]
            .parse()
            .map_err(|_| format!("bad rx byte counter for {name}: {}", fields[0]))?;
        let tx: u64 = fields[8]
            .parse()
            .map_err(|_| format!("bad tx byte counter for {name}: {}", fields[8]))?;
        snapshot.total_bytes_in = snapshot.total_bytes_in.saturating_add(rx);
        snapshot.total_bytes_out = snapshot.total_bytes_out.saturating_add(tx);
        interfaces += 1;
    }

    if interfaces == 0 {
        return Err("no network interfaces found".to_string());
    }
    Ok(snapshot)
}

/// Body served by the sidecar. Both counters are required.
#[derive(Debug, Deserialize)]
struct SidecarCounters {
    #[serde(rename = "in")]
    bytes_in: u64,
    #[serde(rename = "out")]
    bytes_out: u64,
}

pub fn parse_sidecar_payload(text: &str) -> std::result::Result<TrafficSnapshot, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("empty traffic payload".to_string());
    }
    let counters: SidecarCounters =
        serde_json::from_str(trimmed).map_err(|e| format!("malformed traffic payload: {e}"))?;
    Ok(TrafficSnapshot::new(counters.bytes_in, counters.bytes_out))
}
