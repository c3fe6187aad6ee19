//! Periodic resource sampling of a single process.
//!
//! A [ProcessProbe] owns the schedule for one pid. Each tick asks the probe's [ProbeBackend] for
//! a [StatsSample] and publishes it on a broadcast channel, from which every registered
//! [SampleListener] is fed by its own task.

mod native;
mod selector;
mod text_tool;

pub use native::NativeStatsProbe;
pub use selector::ProbeSelector;
pub use text_tool::{TextToolProbe, parse_row};

use crate::listener::{ListenerHandle, SampleListener, forward_samples};
use crate::options::DEFAULT_SAMPLE_CHANNEL_CAPACITY;
use crate::StatsSample;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

/// When a probe produces samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSchedule {
    /// Delay before the first tick.
    pub initial_delay: Duration,

    /// Time between two consecutive ticks.
    pub period: Duration,

    /// Cancels the schedule once elapsed. `None` keeps it running until cancelled.
    pub duration: Option<Duration>,
}

/// How a probe acquires statistics. Chosen once, when the probe is created.
#[derive(Debug)]
pub enum ProbeBackend {
    /// Ask a [crate::SystemStatsProvider] on every tick.
    Native(NativeStatsProbe),

    /// Run an external monitoring tool for the whole schedule and parse its output.
    TextTool(TextToolProbe),
}

impl ProbeBackend {
    pub fn is_native(&self) -> bool {
        matches!(self, ProbeBackend::Native(_))
    }
}

/// Publishes samples to all current subscribers of a probe.
#[derive(Debug, Clone)]
pub struct SamplePublisher {
    sender: broadcast::Sender<StatsSample>,
}

impl SamplePublisher {
    pub fn new(sender: broadcast::Sender<StatsSample>) -> Self {
        Self { sender }
    }

    pub fn publish(&self, sample: StatsSample) {
        match self.sender.send(sample) {
            Ok(_received_by) => {}
            Err(err) => {
                // No receivers: All already dropped or none was yet created.
                tracing::debug!(
                    pid = err.0.pid,
                    "No active listeners for the sample, dropping it"
                );
            }
        }
    }
}

struct Schedule {
    generation: u64,
    stop: oneshot::Sender<()>,
    driver: JoinHandle<()>,
    deadline: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ScheduleState {
    started: AtomicBool,
    generations: AtomicU64,
    current: Mutex<Option<Schedule>>,
}

impl ScheduleState {
    fn cancel(&self) -> bool {
        self.cancel_generation(None)
    }

    /// Cancels the current schedule. With `Some(generation)`, only if it is that schedule.
    fn cancel_generation(&self, generation: Option<u64>) -> bool {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(schedule) =
            current.take_if(|schedule| generation.is_none_or(|g| schedule.generation == g))
        else {
            return false;
        };
        self.started.store(false, Ordering::SeqCst);
        drop(current);

        // The driver observes the stop signal between ticks and then ends on its own.
        let _ = schedule.stop.send(());
        drop(schedule.driver);
        if let Some(deadline) = schedule.deadline {
            deadline.abort();
        }
        true
    }
}

/// Samples one process on a schedule.
///
/// The probe is either idle or scheduled. [ProcessProbe::start] and [ProcessProbe::cancel] move
/// between the two and may be called any number of times, in any order. Dropping the probe
/// cancels it and closes the sample channel. Listener tasks then end after delivering the samples
/// already published.
pub struct ProcessProbe {
    run_id: Arc<str>,
    pid: u32,
    backend: Arc<ProbeBackend>,
    publisher: SamplePublisher,
    state: Arc<ScheduleState>,
}

impl Debug for ProcessProbe {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessProbe")
            .field("run_id", &self.run_id)
            .field("pid", &self.pid)
            .field("backend", &self.backend)
            .field("scheduled", &self.is_scheduled())
            .finish()
    }
}

impl ProcessProbe {
    pub fn new(run_id: impl Into<Arc<str>>, pid: u32, backend: ProbeBackend) -> Self {
        Self::with_channel_capacity(run_id, pid, backend, DEFAULT_SAMPLE_CHANNEL_CAPACITY)
    }

    pub fn with_channel_capacity(
        run_id: impl Into<Arc<str>>,
        pid: u32,
        backend: ProbeBackend,
        channel_capacity: usize,
    ) -> Self {
        // Only the sender is kept. Receivers are created per listener.
        let (sender, receiver) = broadcast::channel(channel_capacity.max(1));
        drop(receiver);
        Self {
            run_id: run_id.into(),
            pid,
            backend: Arc::new(backend),
            publisher: SamplePublisher::new(sender),
            state: Arc::new(ScheduleState::default()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn backend(&self) -> &ProbeBackend {
        &self.backend
    }

    /// Subscribes `listener` to all samples published from now on.
    pub fn register_listener(&self, listener: Arc<dyn SampleListener>) -> ListenerHandle {
        forward_samples(self.publisher.sender.subscribe(), listener)
    }

    /// Schedules sampling. Returns `false`, changing nothing, if the probe is already scheduled.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn start(&self, schedule: ProbeSchedule) -> bool {
        let mut current = self
            .state
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self
            .state
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        tracing::debug!(
            run_id = %self.run_id,
            pid = self.pid,
            native = self.backend.is_native(),
            ?schedule,
            "Starting process probe"
        );

        let generation = self.state.generations.fetch_add(1, Ordering::SeqCst);
        let (stop_tx, stop_rx) = oneshot::channel();
        let driver = tokio::spawn(
            drive(
                self.backend.clone(),
                self.run_id.clone(),
                self.pid,
                schedule,
                self.publisher.clone(),
                stop_rx,
            )
            .in_current_span(),
        );
        let deadline = schedule.duration.map(|duration| {
            let state = Arc::downgrade(&self.state);
            tokio::spawn(
                async move {
                    tokio::time::sleep(duration).await;
                    // A later schedule is left alone.
                    if let Some(state) = state.upgrade() {
                        if state.cancel_generation(Some(generation)) {
                            tracing::debug!(?duration, "Probe schedule ran out, cancelled");
                        }
                    }
                }
                .in_current_span(),
            )
        });

        *current = Some(Schedule {
            generation,
            stop: stop_tx,
            driver,
            deadline,
        });
        true
    }

    /// Cancels the schedule. A tick already in progress still completes and publishes.
    ///
    /// Does nothing when the probe is idle.
    pub fn cancel(&self) {
        if self.state.cancel() {
            tracing::debug!(run_id = %self.run_id, pid = self.pid, "Cancelled process probe");
        }
    }

    /// Same as [ProcessProbe::cancel].
    pub fn stop(&self) {
        self.cancel();
    }

    pub fn is_scheduled(&self) -> bool {
        self.state.started.load(Ordering::SeqCst)
    }
}

impl Drop for ProcessProbe {
    fn drop(&mut self) {
        self.state.cancel();
    }
}

async fn drive(
    backend: Arc<ProbeBackend>,
    run_id: Arc<str>,
    pid: u32,
    schedule: ProbeSchedule,
    publisher: SamplePublisher,
    mut stop: oneshot::Receiver<()>,
) {
    match backend.as_ref() {
        ProbeBackend::Native(native) => {
            tokio::select! {
                _ = &mut stop => return,
                _ = tokio::time::sleep(schedule.initial_delay) => {}
            }
            let mut ticks = tokio::time::interval(schedule.period.max(Duration::from_millis(1)));
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop => break,
                    _ = ticks.tick() => {}
                }
                native.monitor(&run_id, pid, &publisher).await;
            }
        }
        ProbeBackend::TextTool(text_tool) => {
            // Dropping the monitor kills the tool.
            tokio::select! {
                _ = &mut stop => {}
                _ = text_tool.monitor(&run_id, pid, &publisher) => {}
            }
        }
    }
}
