use crate::probe::SamplePublisher;
use crate::{ProviderError, StatsSample, SystemStatsProvider};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Samples a process through a [SystemStatsProvider], once per tick.
#[derive(Clone)]
pub struct NativeStatsProbe {
    provider: Arc<dyn SystemStatsProvider>,
}

impl Debug for NativeStatsProbe {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeStatsProbe")
            .field("provider", &"non-debug < Arc<dyn SystemStatsProvider> >")
            .finish()
    }
}

impl NativeStatsProbe {
    pub fn new(provider: Arc<dyn SystemStatsProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn SystemStatsProvider> {
        &self.provider
    }

    /// Runs one tick: samples `pid` and publishes the result.
    ///
    /// Provider failures only skip this tick.
    pub async fn monitor(&self, run_id: &str, pid: u32, publisher: &SamplePublisher) {
        if !self.provider.is_ready() {
            tracing::debug!(run_id, pid, "System stats provider not ready, skipping tick");
            return;
        }

        let provider = Arc::clone(&self.provider);
        match tokio::task::spawn_blocking(move || provider.sample(pid)).await {
            Ok(Ok(raw)) => publisher.publish(StatsSample::from_raw(run_id, pid, raw)),
            Ok(Err(ProviderError::ProcessNotFound { .. })) => {
                // Expected once the process exited and was reaped.
                tracing::debug!(run_id, pid, "Process is gone, skipping tick");
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    run_id,
                    pid,
                    error = %err,
                    "Could not sample process, skipping tick"
                );
            }
            Err(err) => {
                tracing::warn!(run_id, pid, error = %err, "Sampling task failed");
            }
        }
    }
}
