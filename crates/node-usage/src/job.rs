use crate::meter::UsageMeter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

/// Background task running [`UsageMeter::run_cycle`] every period. The first
/// cycle runs one full period after spawning.
pub struct MeteringJob {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MeteringJob {
    pub fn spawn(meter: Arc<UsageMeter>, period: Duration) -> Self {
        let (shutdown, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            info!(?period, "Usage metering job started");
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = meter.run_cycle().await {
                            error!(error = %e, "Metering cycle failed");
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
            info!("Usage metering job stopped");
        });
        Self { shutdown, handle }
    }

    /// Signals the loop and waits for it to exit. A cycle already in
    /// progress runs to completion first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Metering job task ended abnormally");
        }
    }
}
