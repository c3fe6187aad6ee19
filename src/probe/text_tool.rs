use crate::options::TextToolOptions;
use crate::probe::SamplePublisher;
use crate::sample::{CpuUsage, MemoryUsage, SchedulingState};
use crate::StatsSample;
use jiff::Timestamp;
use std::process::Stdio;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Number of columns of a `pidstat -r -u -d -h` row:
/// `Time UID PID %usr %system %guest %CPU CPU minflt/s majflt/s VSZ RSS %MEM kB_rd/s kB_wr/s
/// kB_ccwr/s Command`.
const COLUMNS: usize = 17;

const TIME: usize = 0;
const PID: usize = 2;
const USER_PERCENT: usize = 3;
const SYSTEM_PERCENT: usize = 4;
const CPU_PERCENT: usize = 6;
const MINOR_FAULTS: usize = 8;
const MAJOR_FAULTS: usize = 9;
const VIRTUAL_KIB: usize = 10;
const RESIDENT_KIB: usize = 11;
const MEMORY_PERCENT: usize = 12;

/// Samples a process by running an external monitoring tool (`pidstat` by default) and parsing
/// its tabular output.
///
/// The tool is started once per schedule and reports at its own interval
/// ([TextToolOptions::interval]). It does not report CPU times, thread or descriptor counts or
/// the scheduling state.
#[derive(Debug, Clone, Default)]
pub struct TextToolProbe {
    options: TextToolOptions,
}

impl TextToolProbe {
    pub fn new(options: TextToolOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &TextToolOptions {
        &self.options
    }

    fn interval_seconds(&self) -> u64 {
        let interval = self.options.interval;
        let seconds = interval
            .as_secs()
            .saturating_add(u64::from(interval.subsec_nanos() > 0));
        seconds.max(1)
    }

    /// Runs the tool against `pid` and publishes one sample per parsed row, until the tool exits.
    ///
    /// Dropping the returned future kills the tool.
    pub async fn monitor(&self, run_id: &str, pid: u32, publisher: &SamplePublisher) {
        let program = self.options.program.as_ref();
        let mut cmd = tokio::process::Command::new(program);
        cmd.arg("-p")
            .arg(pid.to_string())
            .args(["-r", "-u", "-d", "-h"])
            .arg(self.interval_seconds().to_string())
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(
                    run_id,
                    pid,
                    program,
                    error = %err,
                    "Could not start monitoring tool, no samples will be produced"
                );
                return;
            }
        };
        let Some(stdout) = child.stdout.take() else {
            return;
        };

        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(sample) = parse_row(run_id, &line) {
                        publisher.publish(sample);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(run_id, pid, program, error = %err, "Could not read tool output");
                    break;
                }
            }
        }

        match child.wait().await {
            Ok(status) => tracing::debug!(run_id, pid, program, %status, "Monitoring tool exited"),
            Err(err) => tracing::warn!(run_id, pid, program, error = %err, "Could not reap monitoring tool"),
        }
    }
}

/// Parses one line of `pidstat -r -u -d -h` output into a sample tagged with `run_id`.
///
/// Returns `None` for blank lines, `#` header lines, the banner line and any row not consisting
/// of exactly 17 well-formed columns.
pub fn parse_row(run_id: &str, line: &str) -> Option<StatsSample> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let columns: Vec<&str> = line.split_whitespace().collect();
    if columns.len() != COLUMNS {
        tracing::trace!(line, columns = columns.len(), "Skipping unexpected tool output");
        return None;
    }

    let sample = sample_from_columns(run_id, &columns);

    if sample.is_none() {
        tracing::trace!(line, "Skipping malformed tool row");
    }
    sample
}

fn sample_from_columns(run_id: &str, columns: &[&str]) -> Option<StatsSample> {
    let timestamp = Timestamp::from_second(column::<i64>(columns, TIME)?).ok()?;
    Some(StatsSample {
        run_id: run_id.to_owned(),
        pid: column(columns, PID)?,
        timestamp,
        cpu: CpuUsage {
            user_percent: Some(column(columns, USER_PERCENT)?),
            system_percent: Some(column(columns, SYSTEM_PERCENT)?),
            percent: column(columns, CPU_PERCENT)?,
            ..Default::default()
        },
        memory: MemoryUsage {
            resident_bytes: column::<u64>(columns, RESIDENT_KIB)?.saturating_mul(1024),
            virtual_bytes: column::<u64>(columns, VIRTUAL_KIB)?.saturating_mul(1024),
            minor_faults: column(columns, MINOR_FAULTS)?,
            major_faults: column(columns, MAJOR_FAULTS)?,
            percent: Some(column(columns, MEMORY_PERCENT)?),
        },
        state: SchedulingState::Unknown,
        threads: None,
        file_descriptors: None,
    })
}

fn column<T: FromStr>(columns: &[&str], index: usize) -> Option<T> {
    columns.get(index)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::forward_samples;
    use crate::SampleRecorder;
    use assertr::prelude::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tracing_test::traced_test;

    const ROW: &str =
        "1700000000      1000      4242    1.00    0.50    0.00    1.50     3    120.00      0.00   10240    2048   0.10      0.00      0.00      0.00  sleep";

    #[test]
    fn parses_a_complete_row() {
        let sample = parse_row("run-1", ROW).unwrap();

        assert_that(sample.run_id.as_str()).is_equal_to("run-1");
        assert_that(sample.pid).is_equal_to(4242);
        assert_that(sample.timestamp.as_second()).is_equal_to(1_700_000_000);
        assert_that(sample.cpu.user_percent).is_some().is_equal_to(1.0);
        assert_that(sample.cpu.system_percent).is_some().is_equal_to(0.5);
        assert_that(sample.cpu.percent).is_equal_to(1.5);
        assert_that(sample.cpu.total_time_ms).is_equal_to(0);
        assert_that(sample.memory.minor_faults).is_equal_to(120.0);
        assert_that(sample.memory.major_faults).is_equal_to(0.0);
        assert_that(sample.memory.virtual_bytes).is_equal_to(10240 * 1024);
        assert_that(sample.memory.resident_bytes).is_equal_to(2048 * 1024);
        assert_that(sample.memory.percent).is_some().is_equal_to(0.1);
        assert_that(sample.state).is_equal_to(SchedulingState::Unknown);
        assert_that(sample.threads).is_none();
    }

    #[test]
    fn skips_banner_headers_and_blank_lines() {
        let banner = "Linux 6.1.0 (host) \t01/01/2024 \t_x86_64_\t(8 CPU)";
        let header = "#      Time   UID       PID    %usr %system  %guest    %CPU   CPU  minflt/s  majflt/s     VSZ     RSS   %MEM   kB_rd/s   kB_wr/s kB_ccwr/s  Command";

        assert_that(parse_row("run", banner)).is_none();
        assert_that(parse_row("run", header)).is_none();
        assert_that(parse_row("run", "")).is_none();
        assert_that(parse_row("run", "   ")).is_none();
    }

    #[test]
    fn skips_rows_with_unexpected_column_count() {
        let with_extra_columns = format!("{ROW} 0.00 0");
        let truncated = "1700000000 1000 4242 1.00 0.50";

        assert_that(parse_row("run", &with_extra_columns)).is_none();
        assert_that(parse_row("run", truncated)).is_none();
    }

    #[test]
    fn skips_rows_with_malformed_numbers() {
        let row = ROW.replace("10240", "lots");

        assert_that(parse_row("run", &row)).is_none();
    }

    #[test]
    fn rounds_interval_up_to_whole_seconds() {
        let probe = |interval| {
            TextToolProbe::new(TextToolOptions {
                interval,
                ..Default::default()
            })
        };

        assert_that(probe(Duration::from_millis(200)).interval_seconds()).is_equal_to(1);
        assert_that(probe(Duration::from_secs(2)).interval_seconds()).is_equal_to(2);
        assert_that(probe(Duration::from_millis(2500)).interval_seconds()).is_equal_to(3);
        assert_that(probe(Duration::MAX).interval_seconds()).is_equal_to(u64::MAX);
    }

    #[tokio::test]
    async fn publishes_rows_of_the_tool_output() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("fake-pidstat");
        let script = format!(
            "#!/bin/sh\necho 'Linux 6.1.0 (host)  01/01/2024  _x86_64_  (8 CPU)'\necho\necho '# Time UID PID'\necho '{ROW}'\necho '{ROW}'\n"
        );
        std::fs::write(&tool, script).unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let probe = TextToolProbe::new(TextToolOptions {
            program: tool.to_string_lossy().into_owned().into(),
            ..Default::default()
        });
        let (sender, receiver) = broadcast::channel(16);
        let recorder = Arc::new(SampleRecorder::new());
        let handle = forward_samples(receiver, recorder.clone());

        probe
            .monitor("run-1", 4242, &SamplePublisher::new(sender))
            .await;
        handle.wait(Duration::from_secs(1)).await.unwrap();

        let samples = recorder.samples();
        assert_that(samples.len()).is_equal_to(2);
        assert!(samples.iter().all(|s| s.pid == 4242 && s.run_id == "run-1"));
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_tool_produces_no_samples() {
        let probe = TextToolProbe::new(TextToolOptions {
            program: "/definitely/not/pidstat".into(),
            ..Default::default()
        });
        let (sender, receiver) = broadcast::channel(16);
        let recorder = Arc::new(SampleRecorder::new());
        let handle = forward_samples(receiver, recorder.clone());

        probe.monitor("run-1", 4242, &SamplePublisher::new(sender)).await;
        handle.wait(Duration::from_secs(1)).await.unwrap();

        assert_that(recorder.is_empty()).is_true();
        assert!(logs_contain("Could not start monitoring tool"));
    }
}
