use crate::{Result, UsageError};
use async_trait::async_trait;
use node_common::UsageReport;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_COLLECTOR_PATH: &str = "/api/usage/report";
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Remote sink for per-cycle usage reports.
#[async_trait]
pub trait UsageCollector: Send + Sync {
    async fn submit(&self, report: &UsageReport) -> Result<()>;
}

pub struct HttpUsageCollector {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpUsageCollector {
    pub fn new(
        base_url: &str,
        path: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base = base_url.trim().trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(UsageError::CollectorConfig(format!(
                "collector url must be http(s), got '{base_url}'"
            )));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{base}/{}", path.trim().trim_start_matches('/')),
            api_key: api_key.filter(|key| !key.is_empty()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl UsageCollector for HttpUsageCollector {
    async fn submit(&self, report: &UsageReport) -> Result<()> {
        debug!(endpoint = %self.endpoint, instances = report.len(), "Submitting usage report");
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(report);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), %body, "Collector rejected usage report");
            return Err(UsageError::CollectorRejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
