use node_common::RuntimeAdapter;
use node_usage::{InstanceRegistry, UsageError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: usize,
    pub failed: usize,
}

/// Replays the traffic-counting rule of every registered instance once,
/// after the engine has had time to come up.
pub struct RuleRestorer {
    registry: Arc<InstanceRegistry>,
    runtime: Arc<dyn RuntimeAdapter>,
    delay: Duration,
}

impl RuleRestorer {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        runtime: Arc<dyn RuntimeAdapter>,
        delay: Duration,
    ) -> Self {
        Self {
            registry,
            runtime,
            delay,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!(error = %e, "Firewall rule restore failed");
            }
        })
    }

    pub async fn run(&self) -> Result<RestoreSummary, UsageError> {
        if !self.delay.is_zero() {
            info!("Restoring traffic counting rules in {:?}", self.delay);
            tokio::time::sleep(self.delay).await;
        }
        self.restore().await
    }

    /// Individual failures are logged and counted; only an unreadable
    /// registry is an error.
    pub async fn restore(&self) -> Result<RestoreSummary, UsageError> {
        let records = self.registry.get_all().await?;
        let mut summary = RestoreSummary::default();
        for record in &records {
            match self
                .runtime
                .add_traffic_counting_rule(record.inbound_port)
                .await
            {
                Ok(()) => summary.restored += 1,
                Err(e) => {
                    warn!(
                        instance_id = record.id,
                        port = record.inbound_port,
                        error = %e,
                        "Failed to restore traffic counting rule"
                    );
                    summary.failed += 1;
                }
            }
        }
        info!(
            restored = summary.restored,
            failed = summary.failed,
            "Traffic counting rules restored"
        );
        Ok(summary)
    }
}
