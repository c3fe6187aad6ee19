//! One supervised execution of a [CommandSpec].

use crate::listener::{ListenerHandle, SampleRecorder};
use crate::options::ExecutorOptions;
use crate::output_capture::OutputCapture;
use crate::probe::{ProbeSchedule, ProbeSelector, ProcessProbe};
use crate::running_process::{RunningProcess, exit_code};
use crate::{CommandError, CommandResult, CommandSpec};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::unix::pipe;
use tokio::sync::oneshot;

/// How long the runner waits for its internal recorder to receive the last samples.
const RECORDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs a command to completion: spawn, capture output, probe, wait, validate the exit code.
///
/// Teardown of the process, the output capture and the probe happens on every path out of
/// [ProcessRunner::run]. When the runner's task is aborted instead, the same resources are
/// released by their `Drop` implementations.
#[derive(Debug)]
pub(crate) struct ProcessRunner {
    spec: CommandSpec,
    selector: ProbeSelector,
    options: ExecutorOptions,
}

struct Completed {
    exit_code: i32,
    output: String,
    elapsed: Duration,
}

impl ProcessRunner {
    pub(crate) fn new(spec: CommandSpec, selector: ProbeSelector, options: ExecutorOptions) -> Self {
        Self {
            spec,
            selector,
            options,
        }
    }

    /// Runs the command. Resolving `cancel` (or dropping its sender) stops the run early with
    /// [CommandError::Interrupted], after the process was terminated.
    pub(crate) async fn run(
        self,
        cancel: oneshot::Receiver<()>,
    ) -> Result<CommandResult, CommandError> {
        let run_id = self.spec.id().to_owned();

        let (mut process, output) =
            RunningProcess::spawn(&self.spec).map_err(|source| CommandError::SpawnFailed {
                run_id: run_id.clone(),
                process_name: self.spec.display_name(),
                source,
            })?;
        let pid = process.pid();
        tracing::debug!(run_id = %run_id, pid, process = %process.name, "Spawned process");

        let mut capture = OutputCapture::new(output);
        capture.start();

        let probe = self.selector.select(&run_id, pid);
        let listeners: Vec<ListenerHandle> = self
            .spec
            .listeners()
            .iter()
            .map(|listener| probe.register_listener(Arc::clone(listener)))
            .collect();
        let recorder = Arc::new(SampleRecorder::new());
        let recorder_handle = probe.register_listener(recorder.clone());
        probe.start(ProbeSchedule {
            initial_delay: self.options.probe.initial_delay,
            period: self.options.probe.period,
            duration: Some(self.spec.time_limit()),
        });

        let outcome = self
            .supervise(&run_id, &mut process, &mut capture, &probe, cancel)
            .await;

        self.cleanup(&mut process, &mut capture, &probe).await;

        // Closing the sample channel lets all listener tasks finish once they caught up.
        drop(probe);
        for listener in listeners {
            listener.detach();
        }
        if let Err(err) = recorder_handle.wait(RECORDER_DRAIN_TIMEOUT).await {
            tracing::warn!(run_id = %run_id, pid, error = %err, "Could not collect all samples");
        }

        let completed = outcome?;
        tracing::debug!(
            run_id = %run_id,
            pid,
            exit_code = completed.exit_code,
            elapsed = ?completed.elapsed,
            "Command completed"
        );
        Ok(CommandResult {
            run_id,
            pid,
            exit_code: completed.exit_code,
            output: completed.output,
            elapsed: completed.elapsed,
            samples: recorder.take(),
        })
    }

    async fn supervise(
        &self,
        run_id: &str,
        process: &mut RunningProcess,
        capture: &mut OutputCapture<pipe::Receiver>,
        probe: &ProcessProbe,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<Completed, CommandError> {
        let pid = process.pid();
        let status = tokio::select! {
            status = process.wait() => status,
            _ = &mut cancel => {
                tracing::debug!(run_id, pid, "Run cancelled while process was running");
                return Err(CommandError::Interrupted {
                    run_id: run_id.to_owned(),
                });
            }
        };

        let status = match status {
            Ok(status) => status,
            Err(err) => {
                return Err(CommandError::ExecutionFailed {
                    run_id: run_id.to_owned(),
                    reason: "Could not wait for the process to exit".into(),
                    pid: Some(pid),
                    output: Some(capture.output()),
                    source: Some(Box::new(err)),
                });
            }
        };

        probe.stop();
        let output = capture.freeze(self.options.output_grace).await;

        let exit_code = exit_code(status);
        let accepted = self.spec.successful_exit_codes().contains(&exit_code);
        let elapsed = process.started_at().elapsed();

        if !accepted {
            tracing::debug!(run_id, pid, exit_code, "Process exited with non-whitelisted code");
            return Err(CommandError::NonZeroExit {
                run_id: run_id.to_owned(),
                pid,
                exit_code,
                output,
            });
        }

        Ok(Completed {
            exit_code,
            output,
            elapsed,
        })
    }

    /// Never fails. Problems are logged so that they do not mask the outcome of the run.
    async fn cleanup(
        &self,
        process: &mut RunningProcess,
        capture: &mut OutputCapture<pipe::Receiver>,
        probe: &ProcessProbe,
    ) {
        if let Err(err) = process.terminate(self.options.terminate_timeout).await {
            tracing::warn!(
                process = %process.name,
                pid = process.pid(),
                error = %err,
                "Could not terminate process during cleanup"
            );
        }
        capture.destroy();
        probe.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{ProbeOptions, TextToolOptions};
    use crate::provider::MockSystemStatsProvider;
    use crate::signal::is_alive;
    use crate::{RawStats, StatsSample};
    use assertr::prelude::*;
    use std::sync::Mutex;

    fn options() -> ExecutorOptions {
        ExecutorOptions::default()
            .probe(ProbeOptions {
                initial_delay: Duration::from_millis(10),
                period: Duration::from_millis(20),
                ..Default::default()
            })
            .output_grace(Duration::from_millis(200))
            .terminate_timeout(Duration::from_millis(200))
    }

    fn selector() -> ProbeSelector {
        let mut provider = MockSystemStatsProvider::new();
        provider.expect_is_ready().return_const(true);
        provider
            .expect_sample()
            .returning(|_pid| Ok(RawStats::default()));
        ProbeSelector::new(Some(Arc::new(provider)), TextToolOptions::default())
    }

    fn runner(spec: CommandSpec) -> ProcessRunner {
        ProcessRunner::new(spec, selector(), options())
    }

    #[tokio::test]
    async fn collects_output_exit_code_and_samples() {
        let spec = CommandSpec::new("run-1", ["sh", "-c", "echo hi; sleep 0.2; exit 3"])
            .unwrap()
            .with_successful_exit_codes([0, 3])
            .unwrap();
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let result = runner(spec).run(cancel_rx).await.unwrap();

        assert_that(result.run_id()).is_equal_to("run-1");
        assert_that(result.exit_code()).is_equal_to(3);
        assert_that(result.output()).is_equal_to("hi\n");
        assert_that(result.samples().is_empty()).is_false();
        assert!(result.samples().iter().all(|s| s.pid == result.pid()));
        assert!(result.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn spec_listeners_receive_the_same_samples() {
        let seen = Arc::new(Mutex::new(Vec::<u32>::new()));
        let sink = seen.clone();
        let spec = CommandSpec::new("run-1", ["sleep", "0.2"])
            .unwrap()
            .with_listener(Arc::new(move |sample: &StatsSample| {
                sink.lock().unwrap().push(sample.pid);
            }));
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let result = runner(spec).run(cancel_rx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = seen.lock().unwrap();
        assert_that(seen.len()).is_equal_to(result.samples().len());
        assert!(seen.iter().all(|pid| *pid == result.pid()));
    }

    #[tokio::test]
    async fn rejected_exit_code_carries_output() {
        let spec = CommandSpec::new("run-1", ["sh", "-c", "echo oops >&2; exit 2"]).unwrap();
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let err = runner(spec).run(cancel_rx).await.unwrap_err();

        match err {
            CommandError::NonZeroExit {
                exit_code, output, ..
            } => {
                assert_that(exit_code).is_equal_to(2);
                assert_that(output.as_str()).is_equal_to("oops\n");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let spec = CommandSpec::new("run-1", ["/definitely/not/a/program"]).unwrap();
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let err = runner(spec).run(cancel_rx).await.unwrap_err();

        assert!(matches!(err, CommandError::SpawnFailed { .. }));
        assert_that(err.run_id()).is_equal_to("run-1");
    }

    #[tokio::test]
    async fn cancel_terminates_the_process() {
        let spec = CommandSpec::new("run-1", ["sh", "-c", "echo $$; exec sleep 5"]).unwrap();
        let pids = Arc::new(Mutex::new(Vec::<u32>::new()));
        let sink = pids.clone();
        let spec = spec.with_listener(Arc::new(move |sample: &StatsSample| {
            sink.lock().unwrap().push(sample.pid);
        }));
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let run = tokio::spawn(runner(spec).run(cancel_rx));
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel_tx.send(()).unwrap();
        let err = run.await.unwrap().unwrap_err();

        assert!(matches!(err, CommandError::Interrupted { .. }));
        let pid = pids.lock().unwrap().first().copied().unwrap();
        assert_that(is_alive(pid)).is_false();
    }
}
