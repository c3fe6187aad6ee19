use crate::CommandSpec;
use crate::signal;
use std::borrow::Cow;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::net::unix::pipe;
use tokio::process::Child;

/// Represents the running state of a process.
#[derive(Debug)]
pub(crate) enum RunningState {
    /// Process is still running.
    Running,

    /// Process has terminated with the given exit status.
    Terminated(ExitStatus),

    /// Failed to determine process state.
    Uncertain(io::Error),
}

/// An OS process spawned for one run, with stdout and stderr both writing into one pipe.
///
/// The child is spawned with `kill_on_drop`, so dropping this without terminating the process
/// first still kills it.
#[derive(Debug)]
pub(crate) struct RunningProcess {
    pub(crate) name: Cow<'static, str>,
    child: Child,
    pid: u32,
    started_at: Instant,
}

impl RunningProcess {
    /// Spawns the command described by `spec`, returning the process and the read end of its
    /// combined output stream.
    pub(crate) fn spawn(spec: &CommandSpec) -> io::Result<(Self, pipe::Receiver)> {
        let (reader, writer) = io::pipe()?;

        let mut cmd = tokio::process::Command::new(spec.program());
        cmd.args(spec.args());
        if let Some(directory) = spec.working_directory() {
            cmd.current_dir(directory);
        }
        if !spec.inherits_environment() {
            cmd.env_clear();
        }
        cmd.envs(spec.environment());
        cmd.stdin(Stdio::null());
        cmd.stdout(writer.try_clone()?);
        cmd.stderr(writer);
        cmd.kill_on_drop(true);

        let spawned = cmd.spawn();
        // The command still holds our copies of the write end. The stream only reaches EOF once
        // they are closed.
        drop(cmd);
        let child = spawned?;

        let Some(pid) = child.id() else {
            return Err(io::Error::other("spawned process has no pid"));
        };
        let started_at = Instant::now();
        let output = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;

        Ok((
            Self {
                name: spec.display_name(),
                child,
                pid,
                started_at,
            },
            output,
        ))
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn started_at(&self) -> Instant {
        self.started_at
    }

    //noinspection RsSelfConvention
    pub(crate) fn is_running(&mut self) -> RunningState {
        match self.child.try_wait() {
            Ok(None) => RunningState::Running,
            Ok(Some(exit_status)) => RunningState::Terminated(exit_status),
            Err(err) => RunningState::Uncertain(err),
        }
    }

    pub(crate) async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Terminates the process unless it already exited: `SIGTERM` first, `SIGKILL` once
    /// `terminate_timeout` elapsed. The process is reaped before this returns.
    pub(crate) async fn terminate(&mut self, terminate_timeout: Duration) -> io::Result<ExitStatus> {
        match self.is_running() {
            RunningState::Running => {}
            RunningState::Terminated(exit_status) => return Ok(exit_status),
            RunningState::Uncertain(err) => {
                tracing::debug!(
                    process = %self.name,
                    pid = self.pid,
                    error = %err,
                    "Could not determine process state, terminating anyway"
                );
            }
        }

        // Try a graceful shutdown first.
        let graceful = match signal::send_terminate(&self.child) {
            Ok(()) => match tokio::time::timeout(terminate_timeout, self.child.wait()).await {
                Ok(exit_status) => exit_status,
                Err(elapsed) => Err(elapsed.into()),
            },
            Err(err) => Err(err),
        };

        match graceful {
            Ok(exit_status) => Ok(exit_status),
            Err(graceful_err) => {
                tracing::warn!(
                    process = %self.name,
                    pid = self.pid,
                    error = %graceful_err,
                    "Graceful termination failed, killing process"
                );
                self.child.kill().await?;
                self.child.wait().await
            }
        }
    }
}

/// The exit code of a process. Processes ended by a signal report `128 + signal`, the way shells
/// do.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}
