//! Public entry point: run a [CommandSpec] under its time limit.

use crate::options::ExecutorOptions;
use crate::probe::ProbeSelector;
use crate::provider::{SysinfoStatsProvider, SystemStatsProvider};
use crate::runner::ProcessRunner;
use crate::{CommandError, CommandResult, CommandSpec};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tracing::Instrument;

/// Executes commands, each run on its own task of a caller-supplied runtime.
///
/// Every call is an independent run and resolves to exactly one result or one error. However a
/// call ends, including the caller dropping its future, the process and all helper tasks of the
/// run are torn down.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use tokio_command_probe::{CommandExecutor, CommandSpec};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let spec = CommandSpec::new("build-1", ["cargo", "build"])?
///     .with_time_limit(Duration::from_secs(600));
/// let result = CommandExecutor::new()
///     .execute(&spec, &tokio::runtime::Handle::current())
///     .await?;
/// println!("{} samples, output:\n{}", result.samples().len(), result.output());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CommandExecutor {
    provider: Option<Arc<dyn SystemStatsProvider>>,
    options: ExecutorOptions,
}

impl Debug for CommandExecutor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("native", &self.provider.is_some())
            .field("options", &self.options)
            .finish()
    }
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

enum Stopped {
    TimedOut,
    Interrupted,
}

/// Aborts the run when the calling future is dropped before the run ended.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl CommandExecutor {
    /// Probes with a [SysinfoStatsProvider], falling back to the text tool where it is not
    /// supported.
    pub fn new() -> Self {
        Self::with_provider(Arc::new(SysinfoStatsProvider::new()))
    }

    pub fn with_provider(provider: Arc<dyn SystemStatsProvider>) -> Self {
        Self {
            provider: Some(provider),
            options: ExecutorOptions::default(),
        }
    }

    /// Always probes with the external text tool.
    pub fn text_tool_only() -> Self {
        Self {
            provider: None,
            options: ExecutorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    fn selector(&self) -> ProbeSelector {
        ProbeSelector::new(self.provider.clone(), self.options.probe.text_tool.clone())
            .with_channel_capacity(self.options.sample_channel_capacity)
    }

    /// Runs `spec` on `runtime` and waits at most its time limit for the result.
    pub async fn execute(
        &self,
        spec: &CommandSpec,
        runtime: &Handle,
    ) -> Result<CommandResult, CommandError> {
        self.execute_until(spec, runtime, std::future::pending()).await
    }

    /// Like [CommandExecutor::execute], but stops the run with [CommandError::Interrupted] as soon
    /// as `interrupt` completes.
    pub async fn execute_until(
        &self,
        spec: &CommandSpec,
        runtime: &Handle,
        interrupt: impl Future<Output = ()>,
    ) -> Result<CommandResult, CommandError> {
        let run_id = spec.id().to_owned();
        let time_limit = spec.time_limit();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let runner = ProcessRunner::new(spec.clone(), self.selector(), self.options.clone());
        let mut run = AbortOnDrop(runtime.spawn(runner.run(cancel_rx).in_current_span()));

        tokio::pin!(interrupt);
        let stopped = tokio::select! {
            joined = tokio::time::timeout(time_limit, &mut run.0) => match joined {
                Ok(joined) => return flatten(run_id, joined),
                Err(_elapsed) => Stopped::TimedOut,
            },
            () = &mut interrupt => Stopped::Interrupted,
        };

        match stopped {
            Stopped::TimedOut => {
                tracing::debug!(run_id = %run_id, ?time_limit, "Command timed out, cancelling run");
            }
            Stopped::Interrupted => {
                tracing::debug!(run_id = %run_id, "Command interrupted, cancelling run");
            }
        }

        // Ask the runner to terminate the process, then wait for its cleanup.
        let _ = cancel_tx.send(());
        let cleanup_timeout = self.options.cleanup_timeout;
        if tokio::time::timeout(cleanup_timeout, &mut run.0)
            .await
            .is_err()
        {
            tracing::warn!(
                run_id = %run_id,
                ?cleanup_timeout,
                "Run did not clean up in time, aborting it"
            );
            run.0.abort();
        }

        Err(match stopped {
            Stopped::TimedOut => CommandError::TimedOut { run_id, time_limit },
            Stopped::Interrupted => CommandError::Interrupted { run_id },
        })
    }

    /// Blocking variant of [CommandExecutor::execute].
    ///
    /// May be called from outside any runtime, or from within a multi-threaded runtime.
    ///
    /// # Panics
    ///
    /// Panics when called from within a current-thread runtime.
    pub fn execute_blocking(
        &self,
        spec: &CommandSpec,
        runtime: &Handle,
    ) -> Result<CommandResult, CommandError> {
        let execution = self.execute(spec, runtime);
        match Handle::try_current() {
            Ok(_) => tokio::task::block_in_place(|| runtime.block_on(execution)),
            Err(_) => runtime.block_on(execution),
        }
    }
}

fn flatten(
    run_id: String,
    joined: Result<Result<CommandResult, CommandError>, JoinError>,
) -> Result<CommandResult, CommandError> {
    match joined {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => Err(CommandError::Interrupted { run_id }),
        Err(err) => {
            tracing::error!(run_id = %run_id, error = %err, "Command runner panicked");
            Err(CommandError::ExecutionFailed {
                run_id,
                reason: "The command runner panicked".into(),
                pid: None,
                output: None,
                source: Some(Box::new(err)),
            })
        }
    }
}
