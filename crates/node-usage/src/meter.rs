use crate::collector::UsageCollector;
use crate::delta::{compute_delta, is_counter_reset};
use crate::registry::InstanceRegistry;
use crate::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use node_common::{InstanceRecord, TrafficSnapshot, TrafficSource, UsageReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of one metering cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    /// Records found in the registry at the start of the cycle.
    pub instances: usize,
    /// Instances with a positive delta in the report.
    pub reported: usize,
    pub failed_fetches: usize,
    pub counter_resets: usize,
    /// Records removed or replaced while their traffic was being fetched.
    pub superseded: usize,
    pub total_bytes: u64,
    /// True only when a non-empty report was accepted by the collector.
    pub submitted: bool,
}

impl CycleSummary {
    fn new(started_at: DateTime<Utc>, instances: usize) -> Self {
        Self {
            started_at,
            instances,
            reported: 0,
            failed_fetches: 0,
            counter_resets: 0,
            superseded: 0,
            total_bytes: 0,
            submitted: false,
        }
    }
}

pub struct UsageMeter {
    registry: Arc<InstanceRegistry>,
    traffic: Arc<dyn TrafficSource>,
    collector: Arc<dyn UsageCollector>,
    stats_timeout: Duration,
    // Held for a whole cycle; a tick arriving mid-cycle waits its turn.
    in_flight: Mutex<()>,
}

impl UsageMeter {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        traffic: Arc<dyn TrafficSource>,
        collector: Arc<dyn UsageCollector>,
        stats_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            traffic,
            collector,
            stats_timeout,
            in_flight: Mutex::new(()),
        }
    }

    /// Measures every registered instance, advances the stored counters and
    /// submits the non-zero deltas as one report.
    ///
    /// Only registry failures abort the cycle. Fetch failures are isolated per
    /// instance and a rejected submission is logged and dropped.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let _cycle = self.in_flight.lock().await;
        let records = self.registry.get_all().await?;
        let mut summary = CycleSummary::new(Utc::now(), records.len());

        if records.is_empty() {
            debug!("No instances registered, skipping metering cycle");
            return Ok(summary);
        }

        let fetches = records.iter().map(|record| self.fetch(record));
        let observations = join_all(fetches).await;

        let mut observed = Vec::with_capacity(records.len());
        for (record, fetched) in records.into_iter().zip(observations) {
            match fetched {
                Some(current) => observed.push((record, current)),
                None => summary.failed_fetches += 1,
            }
        }

        // Counters move only for records nobody touched while we were fetching;
        // a re-provisioned instance keeps its fresh record and is billed next cycle.
        let advanced = self.registry.advance_counters(&observed).await?;

        let mut report = UsageReport::default();
        for (record, current) in &observed {
            if !advanced.contains(&record.id) {
                summary.superseded += 1;
                continue;
            }

            let last = record.last_snapshot();
            if is_counter_reset(last, *current) {
                warn!(
                    instance_id = record.id,
                    last_rx = last.total_bytes_in,
                    last_tx = last.total_bytes_out,
                    rx = current.total_bytes_in,
                    tx = current.total_bytes_out,
                    "Traffic counters went backward, not billing this cycle"
                );
                summary.counter_resets += 1;
            }

            let delta = compute_delta(last, *current);
            if delta > 0 {
                report.push(record.id, delta);
                summary.reported += 1;
                summary.total_bytes = summary.total_bytes.saturating_add(delta);
            }
        }

        if report.is_empty() {
            debug!(instances = summary.instances, "No new usage this cycle");
            return Ok(summary);
        }

        match self.collector.submit(&report).await {
            Ok(()) => {
                summary.submitted = true;
                info!(
                    instances = summary.reported,
                    total_bytes = summary.total_bytes,
                    "Usage report submitted"
                );
            }
            Err(e) => {
                error!(error = %e, instances = summary.reported, "Usage report dropped");
            }
        }
        Ok(summary)
    }

    async fn fetch(&self, record: &InstanceRecord) -> Option<TrafficSnapshot> {
        match timeout(self.stats_timeout, self.traffic.instance_traffic(record.id)).await {
            Ok(Ok(snapshot)) => Some(snapshot),
            Ok(Err(e)) => {
                warn!(instance_id = record.id, error = %e, "Traffic fetch failed, skipping instance");
                None
            }
            Err(_) => {
                warn!(
                    instance_id = record.id,
                    "Traffic fetch timed out after {:?}, skipping instance", self.stats_timeout
                );
                None
            }
        }
    }
}
