use color_eyre::eyre;
use node_agent_lib::api_server::{ApiServer, ApiServerConfig, ApiState};
use node_agent_lib::{NodeConfig, NodeContext, RuleRestorer};
use node_usage::MeteringJob;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str =
    "info,node_agent=debug,node_agent_lib=debug,node_orchestrator=debug,node_usage=debug,node_runtime=debug";

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    info!("Starting proxy node agent...");

    let config = NodeConfig::from_env()?;
    info!(
        registry = %config.registry_path.display(),
        data_root = %config.data_root.display(),
        probe = %config.runtime.traffic_probe,
        "Configuration loaded"
    );

    let context = NodeContext::new(config.clone())?;

    // One-shot replay of counting rules lost across a restart
    RuleRestorer::new(
        context.registry.clone(),
        context.runtime.clone(),
        config.restore_delay,
    )
    .spawn();

    let metering = match context.usage_meter()? {
        Some(meter) => Some(MeteringJob::spawn(Arc::new(meter), config.metering_interval)),
        None => {
            warn!("NODE_COLLECTOR_URL is not set, usage metering disabled");
            None
        }
    };

    let api_config = ApiServerConfig {
        host: config.api_host.clone(),
        port: config.api_port,
    };
    let state = ApiState {
        orchestrator: context.orchestrator.clone(),
    };
    ApiServer::new(api_config, state)
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await?;

    if let Some(job) = metering {
        job.stop().await;
    }
    info!("Proxy node agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_filter_parses() {
        let filter = EnvFilter::try_new(DEFAULT_LOG_FILTER).unwrap();
        assert!(filter.to_string().contains("node_usage=debug"));
    }
}
