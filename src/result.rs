use crate::StatsSample;
use std::time::Duration;

/// Outcome of a command that ran to completion with an accepted exit code.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub(crate) run_id: String,
    pub(crate) pid: u32,
    pub(crate) exit_code: i32,
    pub(crate) output: String,
    pub(crate) elapsed: Duration,
    pub(crate) samples: Vec<StatsSample>,
}

impl CommandResult {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// One of the command's successful exit codes.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Everything the process wrote to stdout and stderr, in the order the OS delivered it.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Time from spawning the process until its exit code was checked.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn elapsed_nanos(&self) -> u128 {
        self.elapsed.as_nanos()
    }

    /// All samples taken while the process ran, in tick order.
    pub fn samples(&self) -> &[StatsSample] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<StatsSample> {
        self.samples
    }
}
