//! Error types for command execution and process probing.

use std::borrow::Cow;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when executing a command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The process could not be started.
    #[error("Failed to spawn command '{run_id}' ({process_name}): {source}")]
    SpawnFailed {
        /// The id of the run.
        run_id: String,
        /// The display name of the command.
        process_name: Cow<'static, str>,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The process ran to completion, but its exit code is not in the accepted set.
    #[error("Command '{run_id}' (pid {pid}) exited with non-whitelisted code {exit_code}")]
    NonZeroExit {
        /// The id of the run.
        run_id: String,
        /// The OS process id.
        pid: u32,
        /// The exit code the process reported.
        exit_code: i32,
        /// Everything the process wrote to its combined output stream.
        output: String,
    },

    /// An unexpected internal fault ended the run.
    #[error("Command '{run_id}' failed unexpectedly: {reason}")]
    ExecutionFailed {
        /// The id of the run.
        run_id: String,
        /// What went wrong.
        reason: Cow<'static, str>,
        /// The OS process id, if the process was started.
        pid: Option<u32>,
        /// Output captured so far, if any.
        output: Option<String>,
        /// The underlying error, if there is one.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The process did not complete within the configured time limit.
    #[error("Command '{run_id}' did not complete within {time_limit:?}")]
    TimedOut {
        /// The id of the run.
        run_id: String,
        /// The time limit that was exceeded.
        time_limit: Duration,
    },

    /// The caller cancelled the run while waiting for it.
    #[error("Command '{run_id}' was interrupted")]
    Interrupted {
        /// The id of the run.
        run_id: String,
    },
}

impl CommandError {
    /// The id of the run this error belongs to.
    pub fn run_id(&self) -> &str {
        match self {
            CommandError::SpawnFailed { run_id, .. }
            | CommandError::NonZeroExit { run_id, .. }
            | CommandError::ExecutionFailed { run_id, .. }
            | CommandError::TimedOut { run_id, .. }
            | CommandError::Interrupted { run_id } => run_id,
        }
    }

    /// Whether the run failed in the process itself: it could not start, it exited with a
    /// rejected code, or the run hit an unexpected fault.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            CommandError::SpawnFailed { .. }
                | CommandError::NonZeroExit { .. }
                | CommandError::ExecutionFailed { .. }
        )
    }

    /// The OS process id, if the process was started before the run failed.
    pub fn pid(&self) -> Option<u32> {
        match self {
            CommandError::NonZeroExit { pid, .. } => Some(*pid),
            CommandError::ExecutionFailed { pid, .. } => *pid,
            CommandError::SpawnFailed { .. }
            | CommandError::TimedOut { .. }
            | CommandError::Interrupted { .. } => None,
        }
    }

    /// Output captured before the run failed, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            CommandError::NonZeroExit { output, .. } => Some(output),
            CommandError::ExecutionFailed { output, .. } => output.as_deref(),
            CommandError::SpawnFailed { .. }
            | CommandError::TimedOut { .. }
            | CommandError::Interrupted { .. } => None,
        }
    }
}

/// Errors raised when building an invalid [crate::CommandSpec].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("Command id must not be empty")]
    EmptyId,

    #[error("Command must contain at least the program to run")]
    EmptyCommand,

    #[error("The set of successful exit codes must not be empty")]
    NoSuccessfulExitCodes,
}

/// Errors a [crate::SystemStatsProvider] may report for a single sample.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider is not able to sample processes on this host.
    #[error("System stats provider is not ready")]
    NotReady,

    /// The process is gone or was never visible to the provider.
    #[error("Process {pid} could not be found")]
    ProcessNotFound {
        /// The process id that was asked for.
        pid: u32,
    },

    /// Reading the statistics failed.
    #[error("Failed to read statistics of process {pid}: {source}")]
    Io {
        /// The process id that was asked for.
        pid: u32,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },
}
