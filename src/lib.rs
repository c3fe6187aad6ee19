#[cfg(not(unix))]
compile_error!("tokio-command-probe only supports unix platforms");

mod error;
mod executor;
mod listener;
mod options;
mod output_capture;
pub mod probe;
mod provider;
mod result;
mod runner;
mod running_process;
mod sample;
mod signal;
mod spec;

pub use error::{CommandError, ProviderError, SpecError};
pub use executor::CommandExecutor;
pub use listener::{ListenerError, ListenerHandle, SampleListener, SampleRecorder};
pub use options::{
    DEFAULT_SAMPLE_CHANNEL_CAPACITY, DEFAULT_TEXT_TOOL_PROGRAM, ExecutorOptions, ProbeOptions,
    TextToolOptions,
};
pub use output_capture::{DEFAULT_CHUNK_SIZE, OutputCapture};
pub use probe::{ProbeBackend, ProbeSchedule, ProbeSelector, ProcessProbe};
pub use provider::{SysinfoStatsProvider, SystemStatsProvider};
pub use result::CommandResult;
pub use sample::{CpuUsage, MemoryUsage, RawStats, SchedulingState, StatsSample};
pub use signal::is_alive;
pub use spec::{CommandSpec, DEFAULT_TIME_LIMIT};
