//! The native system statistics capability.
//!
//! The host application creates a provider once and hands it to the executor (see
//! [crate::CommandExecutor::with_provider]). Nothing in this crate keeps provider state globally.

use crate::ProviderError;
use crate::sample::{CpuUsage, MemoryUsage, RawStats, SchedulingState};
use std::fmt::{Debug, Formatter};
use std::sync::{Mutex, PoisonError};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

/// Native access to OS-level statistics of a single process.
#[cfg_attr(test, mockall::automock)]
pub trait SystemStatsProvider: Send + Sync {
    /// Whether this provider can sample processes on this host.
    fn is_ready(&self) -> bool;

    /// Takes one snapshot of the process with the given id.
    ///
    /// This may block for a short time and is therefore called from the blocking thread pool.
    fn sample(&self, pid: u32) -> Result<RawStats, ProviderError>;
}

/// A [SystemStatsProvider] backed by the `sysinfo` crate.
///
/// CPU percentages are computed between two consecutive samples, so the first sample of a
/// process always reports 0%. On Linux, CPU times, page faults, thread and file descriptor counts
/// and the scheduling state are read from `/proc/<pid>`.
pub struct SysinfoStatsProvider {
    system: Mutex<System>,
}

impl Debug for SysinfoStatsProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoStatsProvider")
            .field("supported", &sysinfo::IS_SUPPORTED_SYSTEM)
            .finish()
    }
}

impl Default for SysinfoStatsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoStatsProvider {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl SystemStatsProvider for SysinfoStatsProvider {
    fn is_ready(&self) -> bool {
        sysinfo::IS_SUPPORTED_SYSTEM
    }

    fn sample(&self, pid: u32) -> Result<RawStats, ProviderError> {
        if !self.is_ready() {
            return Err(ProviderError::NotReady);
        }

        let sys_pid = Pid::from_u32(pid);
        let mut raw = {
            let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
            system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
            let process = system
                .process(sys_pid)
                .ok_or(ProviderError::ProcessNotFound { pid })?;

            RawStats {
                cpu: CpuUsage {
                    percent: f64::from(process.cpu_usage()),
                    ..Default::default()
                },
                memory: MemoryUsage {
                    resident_bytes: process.memory(),
                    virtual_bytes: process.virtual_memory(),
                    ..Default::default()
                },
                state: scheduling_state(process.status()),
                threads: None,
                file_descriptors: None,
            }
        };

        #[cfg(target_os = "linux")]
        procfs::enrich(pid, &mut raw)?;

        Ok(raw)
    }
}

fn scheduling_state(status: ProcessStatus) -> SchedulingState {
    match status {
        ProcessStatus::Run => SchedulingState::Running,
        ProcessStatus::Sleep => SchedulingState::Sleeping,
        ProcessStatus::Idle => SchedulingState::Idle,
        ProcessStatus::UninterruptibleDiskSleep => SchedulingState::DiskWait,
        ProcessStatus::Stop | ProcessStatus::Tracing => SchedulingState::Stopped,
        ProcessStatus::Zombie | ProcessStatus::Dead => SchedulingState::Zombie,
        _ => SchedulingState::Unknown,
    }
}

#[cfg(target_os = "linux")]
mod procfs {
    use crate::ProviderError;
    use crate::sample::{RawStats, SchedulingState};
    use nix::unistd::{SysconfVar, sysconf};
    use std::fs;
    use std::io;
    use std::sync::OnceLock;

    /// Fields of `/proc/<pid>/stat` we care about, counted from the state field (field 3).
    const STATE: usize = 0;
    const MINFLT: usize = 7;
    const MAJFLT: usize = 9;
    const UTIME: usize = 11;
    const STIME: usize = 12;
    const NUM_THREADS: usize = 17;

    fn clock_ticks_per_second() -> u64 {
        static TICKS: OnceLock<u64> = OnceLock::new();
        *TICKS.get_or_init(|| match sysconf(SysconfVar::CLK_TCK) {
            Ok(Some(ticks)) if ticks > 0 => ticks as u64,
            _ => 100,
        })
    }

    pub(super) fn enrich(pid: u32, raw: &mut RawStats) -> Result<(), ProviderError> {
        let stat = fs::read_to_string(format!("/proc/{pid}/stat")).map_err(|source| {
            match source.kind() {
                io::ErrorKind::NotFound => ProviderError::ProcessNotFound { pid },
                _ => ProviderError::Io { pid, source },
            }
        })?;
        let fields = parse_stat(&stat).ok_or_else(|| ProviderError::Io {
            pid,
            source: io::Error::new(io::ErrorKind::InvalidData, "malformed /proc/<pid>/stat"),
        })?;

        let ticks = clock_ticks_per_second();
        let to_millis = |value: &str| value.parse::<u64>().unwrap_or(0) * 1000 / ticks;

        if let Some(code) = fields[STATE].chars().next() {
            raw.state = SchedulingState::from_code(code);
        }
        raw.cpu.user_time_ms = to_millis(fields[UTIME]);
        raw.cpu.system_time_ms = to_millis(fields[STIME]);
        raw.cpu.total_time_ms = raw.cpu.user_time_ms + raw.cpu.system_time_ms;
        raw.memory.minor_faults = fields[MINFLT].parse().unwrap_or(0.0);
        raw.memory.major_faults = fields[MAJFLT].parse().unwrap_or(0.0);
        raw.threads = fields[NUM_THREADS].parse().ok();
        raw.file_descriptors = fs::read_dir(format!("/proc/{pid}/fd"))
            .ok()
            .map(|entries| entries.count() as u64);
        Ok(())
    }

    /// Splits a `/proc/<pid>/stat` line into the fields following the command name.
    ///
    /// The command name is enclosed in parentheses and may itself contain spaces and parentheses.
    pub(super) fn parse_stat(stat: &str) -> Option<Vec<&str>> {
        let (_, rest) = stat.rsplit_once(')')?;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        (fields.len() > NUM_THREADS).then_some(fields)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use assertr::prelude::*;

    #[test]
    fn samples_the_current_process() {
        let provider = SysinfoStatsProvider::new();
        assert_that(provider.is_ready()).is_true();

        let raw = provider.sample(std::process::id()).unwrap();

        assert!(raw.memory.resident_bytes > 0);
        assert!(raw.memory.virtual_bytes >= raw.memory.resident_bytes);
        #[cfg(target_os = "linux")]
        {
            assert!(raw.threads.unwrap_or(0) >= 1);
            assert!(raw.file_descriptors.unwrap_or(0) >= 1);
            assert!(raw.state != SchedulingState::Unknown);
        }
    }

    #[test]
    fn unknown_process_is_reported() {
        let provider = SysinfoStatsProvider::new();

        let err = provider.sample(0x3fff_fff0).unwrap_err();

        assert!(matches!(err, ProviderError::ProcessNotFound { pid: 0x3fff_fff0 }));
    }
}
