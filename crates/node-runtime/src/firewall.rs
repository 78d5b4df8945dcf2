use crate::host::HostShell;
use crate::Result;
use node_common::Protocol;
use std::path::PathBuf;
use tracing::{debug, info};

pub const DEFAULT_ACCOUNTING_CHAIN: &str = "PROXY_ACCOUNTING";
pub const DEFAULT_RULES_SAVE_PATH: &str = "/etc/iptables/rules.v4";

/// Built-in chains that jump into the accounting chain. FORWARD carries the
/// traffic of published container ports.
const HOOK_CHAINS: [&str; 3] = ["INPUT", "OUTPUT", "FORWARD"];

/// Host firewall (ufw) plus a dedicated iptables chain holding one
/// byte-counting rule per direction for every accounted port.
#[derive(Clone)]
pub struct Firewall {
    shell: HostShell,
    chain: String,
    rules_save_path: PathBuf,
}

impl Firewall {
    pub fn new(shell: HostShell, chain: impl Into<String>, rules_save_path: impl Into<PathBuf>) -> Self {
        Self {
            shell,
            chain: chain.into(),
            rules_save_path: rules_save_path.into(),
        }
    }

    pub async fn open_port(&self, port: u16, protocol: Protocol) -> Result<()> {
        info!(port, %protocol, "Opening firewall port");
        self.shell
            .run_idempotent("ufw", &["allow".to_string(), format!("{port}/{protocol}")])
            .await
            .map(|_| ())
    }

    pub async fn close_port(&self, port: u16, protocol: Protocol) -> Result<()> {
        info!(port, %protocol, "Closing firewall port");
        self.shell
            .run_idempotent(
                "ufw",
                &[
                    "delete".to_string(),
                    "allow".to_string(),
                    format!("{port}/{protocol}"),
                ],
            )
            .await
            .map(|_| ())
    }

    /// Creates the accounting chain and hooks it into the built-in chains.
    /// Safe to call repeatedly.
    pub async fn ensure_chain(&self) -> Result<()> {
        self.shell
            .run_idempotent("iptables", &["-N".to_string(), self.chain.clone()])
            .await?;

        for hook in HOOK_CHAINS {
            let jump = vec!["-j".to_string(), self.chain.clone()];
            if self.shell.probe("iptables", &rule_args("-C", hook, &jump)).await? {
                continue;
            }
            debug!(chain = %self.chain, hook, "Hooking accounting chain");
            self.shell
                .run("iptables", &insert_args(hook, &jump))
                .await?;
        }
        Ok(())
    }

    pub async fn add_counting_rule(&self, port: u16) -> Result<()> {
        self.ensure_chain().await?;

        for rule in counting_rules(port) {
            if self
                .shell
                .probe("iptables", &rule_args("-C", &self.chain, &rule))
                .await?
            {
                debug!(port, chain = %self.chain, "Counting rule already present");
                continue;
            }
            self.shell
                .run("iptables", &rule_args("-A", &self.chain, &rule))
                .await?;
        }

        info!(port, chain = %self.chain, "Traffic counting rule installed");
        self.persist().await
    }

    pub async fn remove_counting_rule(&self, port: u16) -> Result<()> {
        for rule in counting_rules(port) {
            self.shell
                .run_idempotent("iptables", &rule_args("-D", &self.chain, &rule))
                .await?;
        }

        info!(port, chain = %self.chain, "Traffic counting rule removed");
        self.persist().await
    }

    /// Saves the live rule set so it is reloaded after a host reboot.
    async fn persist(&self) -> Result<()> {
        if let Some(dir) = self.rules_save_path.parent() {
            self.shell.create_directory(dir).await?;
        }
        let save = format!(
            "iptables-save > {}",
            self.rules_save_path.to_string_lossy()
        );
        self.shell
            .run("sh", &["-c".to_string(), save])
            .await
            .map(|_| ())
    }
}

/// Match arguments of the two rules that count bytes to and from `port`.
pub fn counting_rules(port: u16) -> [Vec<String>; 2] {
    let rule = |direction: &str| {
        vec![
            "-p".to_string(),
            "tcp".to_string(),
            direction.to_string(),
            port.to_string(),
            "-j".to_string(),
            "RETURN".to_string(),
        ]
    };
    [rule("--dport"), rule("--sport")]
}

fn rule_args(op: &str, chain: &str, rule: &[String]) -> Vec<String> {
    let mut args = vec![op.to_string(), chain.to_string()];
    args.extend_from_slice(rule);
    args
}

fn insert_args(chain: &str, rule: &[String]) -> Vec<String> {
    let mut args = vec!["-I".to_string(), chain.to_string(), "1".to_string()];
    args.extend_from_slice(rule);
    args
}
