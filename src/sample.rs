//! Point-in-time resource snapshots of a supervised process.

use jiff::Timestamp;

/// Scheduling state of a process as reported by the operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SchedulingState {
    /// Interruptible sleep, waiting for an event.
    Sleeping,

    /// Running or runnable.
    Running,

    /// Uninterruptible sleep, usually waiting on disk IO.
    DiskWait,

    /// Terminated but not yet reaped by its parent.
    Zombie,

    /// Stopped by a signal or traced.
    Stopped,

    /// Paging.
    Paging,

    /// Idle kernel thread.
    Idle,

    /// Not reported, or not known to this crate.
    #[default]
    Unknown,
}

impl SchedulingState {
    /// Maps the single-letter state code used by `/proc/<pid>/stat` and `ps`.
    pub fn from_code(code: char) -> Self {
        match code {
            'S' => Self::Sleeping,
            'R' => Self::Running,
            'D' => Self::DiskWait,
            'Z' | 'X' => Self::Zombie,
            'T' | 't' => Self::Stopped,
            'W' => Self::Paging,
            'I' => Self::Idle,
            _ => Self::Unknown,
        }
    }
}

/// CPU usage of a process.
///
/// Times are cumulative since process start. Percentages refer to the interval since the previous
/// sample and may exceed 100 on multi-core hosts.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CpuUsage {
    /// Time spent in user mode, in milliseconds.
    pub user_time_ms: u64,

    /// Time spent in kernel mode, in milliseconds.
    pub system_time_ms: u64,

    /// `user_time_ms + system_time_ms`.
    pub total_time_ms: u64,

    /// Share of CPU time used in user mode, if the backend reports it.
    pub user_percent: Option<f64>,

    /// Share of CPU time used in kernel mode, if the backend reports it.
    pub system_percent: Option<f64>,

    /// Total share of CPU time used.
    pub percent: f64,
}

/// Memory usage of a process.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MemoryUsage {
    /// Resident set size in bytes.
    pub resident_bytes: u64,

    /// Virtual memory size in bytes.
    pub virtual_bytes: u64,

    /// Minor page faults. Cumulative for the native backend, per second for the text tool.
    pub minor_faults: f64,

    /// Major page faults. Cumulative for the native backend, per second for the text tool.
    pub major_faults: f64,

    /// Share of physical memory used, if the backend reports it.
    pub percent: Option<f64>,
}

impl MemoryUsage {
    /// Minor and major page faults combined.
    pub fn page_faults(&self) -> f64 {
        self.minor_faults + self.major_faults
    }
}

/// Raw statistics of one process, as returned by a [crate::SystemStatsProvider].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawStats {
    pub cpu: CpuUsage,
    pub memory: MemoryUsage,
    pub state: SchedulingState,
    pub threads: Option<u64>,
    pub file_descriptors: Option<u64>,
}

/// One resource snapshot of a supervised process, produced once per probe tick.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSample {
    /// Id of the run that produced this sample.
    pub run_id: String,

    /// The OS process id.
    pub pid: u32,

    /// When the sample was taken.
    pub timestamp: Timestamp,

    pub cpu: CpuUsage,

    pub memory: MemoryUsage,

    pub state: SchedulingState,

    /// Number of threads, if the backend reports it.
    pub threads: Option<u64>,

    /// Number of open file descriptors, if the backend reports it.
    pub file_descriptors: Option<u64>,
}

impl StatsSample {
    /// Stamps raw provider statistics with the run, the pid and the current time.
    pub fn from_raw(run_id: impl Into<String>, pid: u32, raw: RawStats) -> Self {
        Self {
            run_id: run_id.into(),
            pid,
            timestamp: Timestamp::now(),
            cpu: raw.cpu,
            memory: raw.memory,
            state: raw.state,
            threads: raw.threads,
            file_descriptors: raw.file_descriptors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assertr::prelude::*;

    #[test]
    fn maps_proc_state_codes() {
        assert_that(SchedulingState::from_code('S')).is_equal_to(SchedulingState::Sleeping);
        assert_that(SchedulingState::from_code('R')).is_equal_to(SchedulingState::Running);
        assert_that(SchedulingState::from_code('D')).is_equal_to(SchedulingState::DiskWait);
        assert_that(SchedulingState::from_code('Z')).is_equal_to(SchedulingState::Zombie);
        assert_that(SchedulingState::from_code('T')).is_equal_to(SchedulingState::Stopped);
        assert_that(SchedulingState::from_code('W')).is_equal_to(SchedulingState::Paging);
        assert_that(SchedulingState::from_code('?')).is_equal_to(SchedulingState::Unknown);
    }

    #[test]
    fn from_raw_keeps_provider_values() {
        let raw = RawStats {
            cpu: CpuUsage {
                user_time_ms: 30,
                system_time_ms: 12,
                total_time_ms: 42,
                percent: 3.5,
                ..Default::default()
            },
            state: SchedulingState::Running,
            threads: Some(4),
            ..Default::default()
        };

        let sample = StatsSample::from_raw("run-1", 1234, raw);

        assert_that(sample.run_id.as_str()).is_equal_to("run-1");
        assert_that(sample.pid).is_equal_to(1234);
        assert_that(sample.cpu.total_time_ms).is_equal_to(42);
        assert_that(sample.state).is_equal_to(SchedulingState::Running);
        assert_that(sample.threads).is_some().is_equal_to(4);
        assert_that(sample.file_descriptors).is_none();
    }
}
