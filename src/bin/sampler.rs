//! jailwatch-sampler: append /proc telemetry for one process as JSON lines

use clap::Parser;
use jailwatch::logging::init_logger;
use jailwatch::monitoring::stats::{to_sample, ProcessState};
use jailwatch::monitoring::{CpuTracker, ProcessStats};
use log::{debug, info};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "jailwatch-sampler")]
#[command(about = "Sample a process through /proc until it exits", long_about = None)]
struct Args {
    /// Process to sample
    #[arg(long)]
    pid: u32,

    /// Seconds between samples
    #[arg(long, default_value_t = 1.0)]
    interval: f64,

    /// Execution the samples belong to
    #[arg(long)]
    run_id: Option<String>,

    /// File the JSON lines are appended to
    #[arg(long)]
    output: PathBuf,

    /// Stop after this many samples
    #[arg(long)]
    count: Option<u64>,

    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    init_logger(args.verbose);

    match sample(&args) {
        Ok(written) => info!("Wrote {} samples for pid {}", written, args.pid),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn open_output(path: &Path) -> std::io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

/// Sample until the process is gone or `count` is reached; returns the number written
fn sample(args: &Args) -> Result<u64, Box<dyn std::error::Error>> {
    if !(args.interval.is_finite() && args.interval > 0.0) {
        return Err(format!("Interval must be positive, got {}", args.interval).into());
    }
    let interval = Duration::from_secs_f64(args.interval);
    let mut out = open_output(&args.output)?;
    let mut cpu = CpuTracker::default();
    let mut written = 0;

    debug!(
        "Sampling pid {} for run {} every {:?}",
        args.pid,
        args.run_id.as_deref().unwrap_or("-"),
        interval
    );

    loop {
        let stats = match ProcessStats::collect(args.pid) {
            Ok(stats) if stats.state == ProcessState::Zombie => {
                debug!("Stopping: pid {} is a zombie", args.pid);
                break;
            }
            Ok(stats) => stats,
            Err(e) => {
                debug!("Stopping: {}", e);
                break;
            }
        };

        let record = to_sample(&stats, cpu.update(&stats), chrono::Utc::now());
        writeln!(out, "{}", serde_json::to_string(&record)?)?;
        out.flush()?;
        written += 1;

        if args.count.is_some_and(|count| written >= count) {
            break;
        }
        std::thread::sleep(interval);
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jailwatch::TelemetrySample;
    use tempfile::tempdir;

    fn args_for(pid: u32, output: PathBuf) -> Args {
        Args {
            pid,
            interval: 0.01,
            run_id: Some("test".to_string()),
            output,
            count: Some(3),
            verbose: false,
        }
    }

    #[test]
    fn samples_self_as_json_lines() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("samples.jsonl");
        let written = sample(&args_for(std::process::id(), output.clone())).unwrap();
        assert_eq!(written, 3);

        let contents = std::fs::read_to_string(&output).unwrap();
        let samples: Vec<TelemetrySample> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.rss_bytes > 0 && s.threads >= 1));
    }

    #[test]
    fn missing_process_writes_nothing() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("none.jsonl");
        assert_eq!(sample(&args_for(u32::MAX - 1, output)).unwrap(), 0);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let dir = tempdir().unwrap();
        let mut args = args_for(1, dir.path().join("x.jsonl"));
        args.interval = 0.0;
        assert!(sample(&args).is_err());
    }
}
