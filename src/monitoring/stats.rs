//! Process statistics via /proc
//!
//! Reads memory, CPU time, thread count, I/O counters and descriptor count of a
//! process and turns consecutive snapshots into telemetry samples.

use std::fs;
use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::errors::{JailwatchError, Result};
use crate::monitoring::tailer::TelemetrySample;

/// Process state from the stat state letter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Sleeping,
    Zombie,
    Unknown,
}

impl ProcessState {
    pub fn from_char(c: char) -> Self {
        match c {
            'R' => ProcessState::Running,
            'S' | 'D' => ProcessState::Sleeping,
            'Z' => ProcessState::Zombie,
            _ => ProcessState::Unknown,
        }
    }
}

/// Process statistics snapshot
#[derive(Debug, Clone)]
pub struct ProcessStats {
    pub pid: u32,
    /// Virtual memory size in bytes
    pub vsize: u64,
    /// Resident set size in bytes
    pub rss: u64,
    /// User plus system CPU time in milliseconds
    pub cpu_time_ms: u64,
    pub num_threads: u32,
    pub state: ProcessState,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub fds_open: u32,
    pub taken_at: Instant,
}

impl ProcessStats {
    /// Snapshot `pid` from the real /proc
    pub fn collect(pid: u32) -> Result<Self> {
        Self::from_proc(Path::new("/proc"), pid)
    }

    /// Snapshot `pid` from a /proc-shaped tree rooted at `proc_root`
    pub fn from_proc(proc_root: &Path, pid: u32) -> Result<Self> {
        let dir = proc_root.join(pid.to_string());
        let stat_path = dir.join("stat");
        let stat_content = fs::read_to_string(&stat_path).map_err(|e| {
            JailwatchError::ProcessMonitoring(format!(
                "Failed to read {}: {}",
                stat_path.display(),
                e
            ))
        })?;

        let fields = parse_stat_fields(&stat_content)?;
        let state = ProcessState::from_char(fields.state);

        let clk_tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        let cpu_time_ms = if clk_tck > 0 {
            ((fields.utime + fields.stime) * 1000) / clk_tck as u64
        } else {
            0
        };

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if page_size > 0 { page_size as u64 } else { 4096 };

        let (read_bytes, write_bytes) = read_io(&dir.join("io"));
        let fds_open = count_fds(&dir.join("fd"));

        Ok(ProcessStats {
            pid,
            vsize: fields.vsize,
            rss: fields.rss_pages * page_size,
            cpu_time_ms,
            num_threads: fields.num_threads,
            state,
            read_bytes,
            write_bytes,
            fds_open,
            taken_at: Instant::now(),
        })
    }
}

struct StatFields {
    state: char,
    utime: u64,
    stime: u64,
    num_threads: u32,
    vsize: u64,
    rss_pages: u64,
}

// The command name may contain spaces and parentheses, so fields are counted
// from the last ')'. Index 0 after it is the state (field 3 in proc(5)).
fn parse_stat_fields(content: &str) -> Result<StatFields> {
    let invalid = |what: &str| JailwatchError::ProcessMonitoring(format!("Invalid {} in stat", what));

    let after = content
        .rfind(')')
        .map(|idx| &content[idx + 1..])
        .ok_or_else(|| invalid("command name"))?;
    let parts: Vec<&str> = after.split_whitespace().collect();
    if parts.len() < 22 {
        return Err(JailwatchError::ProcessMonitoring(
            "Invalid /proc stat format".to_string(),
        ));
    }

    Ok(StatFields {
        state: parts[0].chars().next().unwrap_or('?'),
        utime: parts[11].parse().map_err(|_| invalid("utime"))?,
        stime: parts[12].parse().map_err(|_| invalid("stime"))?,
        num_threads: parts[17].parse().map_err(|_| invalid("num_threads"))?,
        vsize: parts[20].parse().map_err(|_| invalid("vsize"))?,
        rss_pages: parts[21].parse().map_err(|_| invalid("rss"))?,
    })
}

fn read_io(path: &Path) -> (u64, u64) {
    let Ok(content) = fs::read_to_string(path) else {
        return (0, 0);
    };
    let mut read_bytes = 0;
    let mut write_bytes = 0;
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("read_bytes:") {
            read_bytes = value.trim().parse().unwrap_or(0);
        } else if let Some(value) = line.strip_prefix("write_bytes:") {
            write_bytes = value.trim().parse().unwrap_or(0);
        }
    }
    (read_bytes, write_bytes)
}

fn count_fds(path: &Path) -> u32 {
    fs::read_dir(path)
        .map(|entries| entries.count() as u32)
        .unwrap_or(0)
}

/// Derives CPU percentage from consecutive snapshots
#[derive(Debug, Default)]
pub struct CpuTracker {
    last: Option<(u64, Instant)>,
}

impl CpuTracker {
    /// CPU used since the previous snapshot as a percentage of one core.
    /// The first snapshot reports 0.
    pub fn update(&mut self, stats: &ProcessStats) -> f64 {
        let percent = match self.last {
            Some((last_cpu, last_at)) => {
                let wall_ms = stats.taken_at.duration_since(last_at).as_secs_f64() * 1000.0;
                if wall_ms > 0.0 {
                    stats.cpu_time_ms.saturating_sub(last_cpu) as f64 / wall_ms * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last = Some((stats.cpu_time_ms, stats.taken_at));
        percent
    }
}

/// Turn a snapshot into a telemetry record
pub fn to_sample(stats: &ProcessStats, cpu_percent: f64, timestamp: DateTime<Utc>) -> TelemetrySample {
    TelemetrySample {
        timestamp,
        cpu_percent,
        rss_bytes: stats.rss,
        vms_bytes: stats.vsize,
        threads: stats.num_threads,
        fds_open: stats.fds_open,
        read_bytes: stats.read_bytes,
        write_bytes: stats.write_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    const STAT: &str = "1234 (my (odd) cmd) S 1 1234 1234 0 -1 4194560 100 0 0 0 250 50 0 0 20 0 3 0 500 104857600 2560 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0";

    #[test]
    fn test_process_state_from_char() {
        assert_eq!(ProcessState::from_char('R'), ProcessState::Running);
        assert_eq!(ProcessState::from_char('S'), ProcessState::Sleeping);
        assert_eq!(ProcessState::from_char('Z'), ProcessState::Zombie);
        assert_eq!(ProcessState::from_char('X'), ProcessState::Unknown);
    }

    #[test]
    fn stat_parsing_survives_parentheses_in_name() {
        let fields = parse_stat_fields(STAT).unwrap();
        assert_eq!(fields.state, 'S');
        assert_eq!(fields.utime, 250);
        assert_eq!(fields.stime, 50);
        assert_eq!(fields.num_threads, 3);
        assert_eq!(fields.vsize, 104857600);
        assert_eq!(fields.rss_pages, 2560);
    }

    #[test]
    fn truncated_stat_is_an_error() {
        assert!(parse_stat_fields("1 (x) S 1 2").is_err());
        assert!(parse_stat_fields("garbage").is_err());
    }

    #[test]
    fn from_fake_proc_reads_io_and_fds() {
        let root = tempdir().unwrap();
        let dir = root.path().join("1234");
        fs::create_dir_all(dir.join("fd")).unwrap();
        fs::write(dir.join("stat"), STAT).unwrap();
        fs::write(
            dir.join("io"),
            "rchar: 10\nwchar: 20\nread_bytes: 4096\nwrite_bytes: 8192\n",
        )
        .unwrap();
        fs::write(dir.join("fd/0"), "").unwrap();
        fs::write(dir.join("fd/1"), "").unwrap();

        let stats = ProcessStats::from_proc(root.path(), 1234).unwrap();
        assert_eq!(stats.read_bytes, 4096);
        assert_eq!(stats.write_bytes, 8192);
        assert_eq!(stats.fds_open, 2);
        assert_eq!(stats.num_threads, 3);
        assert!(stats.rss > 0);
    }

    #[test]
    fn own_process_stats_are_readable() {
        let stats = ProcessStats::collect(std::process::id()).unwrap();
        assert!(stats.rss > 0);
        assert!(stats.num_threads >= 1);
        assert!(stats.fds_open > 0);
    }

    #[test]
    fn missing_process_is_error() {
        let root = tempdir().unwrap();
        assert!(ProcessStats::from_proc(root.path(), 99).is_err());
    }

    #[test]
    fn cpu_tracker_uses_deltas() {
        let base = ProcessStats::collect(std::process::id()).unwrap();
        let mut tracker = CpuTracker::default();
        assert_eq!(tracker.update(&base), 0.0);

        let mut later = base.clone();
        later.cpu_time_ms += 500;
        later.taken_at = base.taken_at + Duration::from_secs(1);
        let percent = tracker.update(&later);
        assert!((percent - 50.0).abs() < 1e-6);
    }

    #[test]
    fn sample_copies_counters() {
        let stats = ProcessStats::collect(std::process::id()).unwrap();
        let now = Utc::now();
        let sample = to_sample(&stats, 12.5, now);
        assert_eq!(sample.timestamp, now);
        assert_eq!(sample.rss_bytes, stats.rss);
        assert_eq!(sample.threads, stats.num_threads);
        assert_eq!(sample.cpu_percent, 12.5);
    }
}
