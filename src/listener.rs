use crate::StatsSample;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Receives the samples a [crate::ProcessProbe] publishes.
///
/// Every registered listener is driven by its own task, so a slow listener never delays
/// publication. It may lose samples instead, if it falls behind by more than the channel capacity.
///
/// Implemented for all `Fn(&StatsSample) + Send + Sync + 'static` closures.
pub trait SampleListener: Send + Sync + 'static {
    fn on_sample(&self, sample: &StatsSample);
}

impl<F> SampleListener for F
where
    F: Fn(&StatsSample) + Send + Sync + 'static,
{
    fn on_sample(&self, sample: &StatsSample) {
        self(sample)
    }
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("The listener task could not be joined/terminated: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("The listener task did not finish within {0:?}")]
    Timeout(Duration),
}

/// Handle to the task forwarding samples to one listener.
///
/// The task ends on its own once the probe it listens to is dropped and every sample published
/// before that was delivered. Dropping the handle aborts the task.
pub struct ListenerHandle {
    pub(crate) task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Checks if the forwarding task has finished.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    /// Waits for the forwarding task to deliver all remaining samples.
    ///
    /// This only completes once the probe was dropped. The wait is bounded by `timeout`; when it
    /// elapses, the task is aborted.
    pub async fn wait(mut self, timeout: Duration) -> Result<(), ListenerError> {
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => joined.map_err(ListenerError::TaskJoin),
            Err(_elapsed) => {
                task.abort();
                Err(ListenerError::Timeout(timeout))
            }
        }
    }

    /// Lets the forwarding task run on its own. It still ends once the probe is gone.
    pub fn detach(mut self) {
        drop(self.task.take());
    }

    /// Stops forwarding samples.
    pub fn abort(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub(crate) fn forward_samples(
    mut receiver: broadcast::Receiver<StatsSample>,
    listener: Arc<dyn SampleListener>,
) -> ListenerHandle {
    let task = tokio::spawn(async move {
        let mut lagged: u64 = 0;
        loop {
            match receiver.recv().await {
                Ok(sample) => {
                    if lagged > 0 {
                        tracing::debug!(lagged, "Sample listener is lagging behind");
                        lagged = 0;
                    }
                    listener.on_sample(&sample);
                }
                Err(RecvError::Lagged(skipped)) => {
                    lagged += skipped;
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
    .in_current_span());
    ListenerHandle { task: Some(task) }
}

/// A listener keeping every sample it receives, in order.
#[derive(Debug, Default)]
pub struct SampleRecorder {
    samples: Mutex<Vec<StatsSample>>,
}

impl SampleRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of all samples recorded so far.
    pub fn samples(&self) -> Vec<StatsSample> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Takes all samples recorded so far, leaving the recorder empty.
    pub fn take(&self) -> Vec<StatsSample> {
        std::mem::take(&mut *self.samples.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SampleListener for SampleRecorder {
    fn on_sample(&self, sample: &StatsSample) {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sample.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawStats;
    use assertr::prelude::*;
    use tracing_test::traced_test;

    fn sample(pid: u32) -> StatsSample {
        StatsSample::from_raw("run", pid, RawStats::default())
    }

    #[tokio::test]
    async fn forwards_samples_in_order_until_channel_closes() {
        let (sender, receiver) = broadcast::channel(16);
        let recorder = Arc::new(SampleRecorder::new());
        let handle = forward_samples(receiver, recorder.clone());

        for pid in 1..=5 {
            sender.send(sample(pid)).unwrap();
        }
        drop(sender);
        handle.wait(Duration::from_secs(1)).await.unwrap();

        let pids: Vec<u32> = recorder.samples().iter().map(|s| s.pid).collect();
        assert_that(pids).contains_exactly(&[1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    #[traced_test]
    async fn lagging_listener_skips_samples_instead_of_blocking() {
        let (sender, receiver) = broadcast::channel(2);
        let recorder = Arc::new(SampleRecorder::new());

        // Publish before the forwarding task gets to run, overflowing the channel.
        for pid in 1..=6 {
            let _ = sender.send(sample(pid));
        }
        let handle = forward_samples(receiver, recorder.clone());
        drop(sender);
        handle.wait(Duration::from_secs(1)).await.unwrap();

        let pids: Vec<u32> = recorder.samples().iter().map(|s| s.pid).collect();
        assert_that(pids).contains_exactly(&[5, 6]);
        assert!(logs_contain("Sample listener is lagging behind"));
    }

    #[tokio::test]
    async fn wait_times_out_while_channel_stays_open() {
        let (sender, receiver) = broadcast::channel::<StatsSample>(2);
        let handle = forward_samples(receiver, Arc::new(SampleRecorder::new()));

        let result = handle.wait(Duration::from_millis(50)).await;

        assert!(matches!(result, Err(ListenerError::Timeout(_))));
        drop(sender);
    }

    #[tokio::test]
    async fn detached_listener_still_receives_remaining_samples() {
        let (sender, receiver) = broadcast::channel(16);
        let recorder = Arc::new(SampleRecorder::new());
        forward_samples(receiver, recorder.clone()).detach();

        sender.send(sample(1)).unwrap();
        drop(sender);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_that(recorder.len()).is_equal_to(1);
    }

    #[tokio::test]
    async fn aborted_listener_stops_receiving() {
        let (sender, receiver) = broadcast::channel(16);
        let recorder = Arc::new(SampleRecorder::new());
        forward_samples(receiver, recorder.clone()).abort();

        let _ = sender.send(sample(1));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_that(recorder.is_empty()).is_true();
    }

    #[test]
    fn recorder_take_empties_it() {
        let recorder = SampleRecorder::new();
        recorder.on_sample(&sample(7));

        assert_that(recorder.take().len()).is_equal_to(1);
        assert_that(recorder.is_empty()).is_true();
    }
}
