use std::borrow::Cow;
use std::time::Duration;

pub const DEFAULT_TEXT_TOOL_PROGRAM: &str = "pidstat";

/// Channel capacity of the sample broadcast. Listeners lagging further behind lose samples.
pub const DEFAULT_SAMPLE_CHANNEL_CAPACITY: usize = 128;

/// Options for the external text-based monitoring tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextToolOptions {
    /// The program to run. It is invoked as `<program> -p <pid> -r -u -d -h <interval>`.
    ///
    /// default: `pidstat`
    pub program: Cow<'static, str>,

    /// The sampling interval handed to the tool. Sub-second parts are rounded up.
    ///
    /// default: 1 second
    pub interval: Duration,
}

impl Default for TextToolOptions {
    fn default() -> Self {
        Self {
            program: Cow::Borrowed(DEFAULT_TEXT_TOOL_PROGRAM),
            interval: Duration::from_secs(1),
        }
    }
}

/// Options controlling how a running command is probed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOptions {
    /// Delay before the first tick.
    ///
    /// default: 1 second
    pub initial_delay: Duration,

    /// Time between two consecutive ticks.
    ///
    /// default: 1 second
    pub period: Duration,

    pub text_tool: TextToolOptions,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            period: Duration::from_secs(1),
            text_tool: TextToolOptions::default(),
        }
    }
}

/// Options of a [crate::CommandExecutor].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tokio_command_probe::{ExecutorOptions, ProbeOptions};
///
/// let options = ExecutorOptions::default()
///     .probe(ProbeOptions {
///         initial_delay: Duration::from_millis(50),
///         period: Duration::from_millis(100),
///         ..Default::default()
///     })
///     .output_grace(Duration::from_millis(250));
/// assert_eq!(options.probe.period, Duration::from_millis(100));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOptions {
    pub probe: ProbeOptions,

    /// How long to wait, after the process exited, for its output stream to reach end-of-stream
    /// before the captured output is frozen.
    ///
    /// default: 1 second
    pub output_grace: Duration,

    /// How long a process still alive during cleanup is given to exit after `SIGTERM`, before it
    /// is killed.
    ///
    /// default: 2 seconds
    pub terminate_timeout: Duration,

    /// How long the executor waits for a cancelled run to clean up before aborting it.
    ///
    /// default: 5 seconds
    pub cleanup_timeout: Duration,

    /// Capacity of the channel samples are published on.
    ///
    /// default: [DEFAULT_SAMPLE_CHANNEL_CAPACITY]
    pub sample_channel_capacity: usize,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            probe: ProbeOptions::default(),
            output_grace: Duration::from_secs(1),
            terminate_timeout: Duration::from_secs(2),
            cleanup_timeout: Duration::from_secs(5),
            sample_channel_capacity: DEFAULT_SAMPLE_CHANNEL_CAPACITY,
        }
    }
}

impl ExecutorOptions {
    pub fn probe(mut self, probe: ProbeOptions) -> Self {
        self.probe = probe;
        self
    }

    pub fn output_grace(mut self, output_grace: Duration) -> Self {
        self.output_grace = output_grace;
        self
    }

    pub fn terminate_timeout(mut self, terminate_timeout: Duration) -> Self {
        self.terminate_timeout = terminate_timeout;
        self
    }

    pub fn cleanup_timeout(mut self, cleanup_timeout: Duration) -> Self {
        self.cleanup_timeout = cleanup_timeout;
        self
    }

    pub fn sample_channel_capacity(mut self, capacity: usize) -> Self {
        self.sample_channel_capacity = capacity.max(1);
        self
    }
}
