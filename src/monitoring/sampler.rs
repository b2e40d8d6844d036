//! Sampler supervisor
//!
//! Runs the external telemetry sampler next to the monitored process and owns
//! the tailer that reads what it writes. Sampler problems are logged, never
//! surfaced: telemetry is best effort and must not affect the execution.

use std::fs;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::execution::output::short_id;
use crate::monitoring::tailer::{spawn_tailer, TailerConfig, TelemetryBatch};
use crate::schedule::{Clock, ShutdownOutcome, Worker};

/// How the external sampler is run
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    /// Sampler executable
    pub program: PathBuf,
    /// Arguments placed before the standard ones
    pub args: Vec<String>,
    /// Directory holding one newline-delimited JSON file per run
    pub output_dir: PathBuf,
    /// Sampling interval passed to the sampler
    pub interval: Duration,
    pub tailer: TailerConfig,
    /// How long the tailer gets to acknowledge a stop
    pub stop_grace: Duration,
}

impl SamplerConfig {
    pub fn new(program: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            output_dir: output_dir.into(),
            interval: Duration::from_secs(1),
            tailer: TailerConfig::default(),
            stop_grace: Duration::from_millis(500),
        }
    }

    /// Telemetry file of one run
    pub fn output_path(&self, run_id: &str) -> PathBuf {
        self.output_dir.join(format!("jailwatch-{}.jsonl", run_id))
    }

    /// Full argument list for monitoring `pid`
    pub fn command_args(&self, pid: u32, run_id: &str) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend([
            "--pid".to_string(),
            pid.to_string(),
            "--interval".to_string(),
            format!("{:.1}", self.interval.as_secs_f64()),
            "--run-id".to_string(),
            run_id.to_string(),
            "--output".to_string(),
            self.output_path(run_id).display().to_string(),
        ]);
        args
    }
}

/// External sampler plus its tailer, for one execution
pub struct SamplerSupervisor {
    process: Option<Child>,
    tailer: Option<Worker>,
    output_path: PathBuf,
    stop_grace: Duration,
}

impl SamplerSupervisor {
    /// Start the sampler for `pid` and begin tailing its output.
    ///
    /// Never fails: a sampler that cannot be started leaves a supervisor with
    /// nothing to deliver.
    pub fn start<F>(
        config: &SamplerConfig,
        pid: u32,
        run_id: &str,
        clock: Arc<dyn Clock>,
        consumer: F,
    ) -> Self
    where
        F: FnMut(TelemetryBatch) + Send + 'static,
    {
        let output_path = config.output_path(run_id);
        remove_output(&output_path);

        let process = spawn_sampler(config, pid, run_id);

        let name = format!("tail-{}", short_id(run_id));
        let tailer = match spawn_tailer(name, &output_path, config.tailer, clock, consumer) {
            Ok(worker) => Some(worker),
            Err(e) => {
                warn!("Failed to start telemetry tailer: {}", e);
                None
            }
        };

        Self {
            process,
            tailer,
            output_path,
            stop_grace: config.stop_grace,
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn is_sampling(&self) -> bool {
        self.process.is_some()
    }

    /// Stop the tailer (final read, bounded by the grace period), kill the sampler
    /// and delete the run's telemetry file. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(mut tailer) = self.tailer.take() {
            if tailer.shutdown(self.stop_grace) == ShutdownOutcome::Forced {
                warn!("Telemetry tailer was cancelled after {:?}", self.stop_grace);
            }
        }

        if let Some(mut process) = self.process.take() {
            match process.kill() {
                Ok(()) => debug!("Sampler {} killed", process.id()),
                Err(e) if e.kind() == ErrorKind::InvalidInput => {
                    debug!("Sampler {} had already exited", process.id())
                }
                Err(e) => warn!("Failed to kill sampler {}: {}", process.id(), e),
            }
            match process.wait() {
                Ok(status) if !status.success() => debug!("Sampler ended with {}", status),
                Ok(_) => {}
                Err(e) => debug!("Failed to reap sampler: {}", e),
            }
        }
        remove_output(&self.output_path);
    }
}

impl Drop for SamplerSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn remove_output(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed telemetry file {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove telemetry file {}: {}", path.display(), e),
    }
}

fn spawn_sampler(config: &SamplerConfig, pid: u32, run_id: &str) -> Option<Child> {
    let mut child = match Command::new(&config.program)
        .args(config.command_args(pid, run_id))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(
                "Failed to start sampler {}: {}",
                config.program.display(),
                e
            );
            return None;
        }
    };

    info!("Sampler {} watching pid {}", child.id(), pid);

    if let Some(stderr) = child.stderr.take() {
        let spawned = thread::Builder::new()
            .name(format!("sampler-err-{}", short_id(run_id)))
            .spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    debug!("sampler: {}", line);
                }
            });
        if let Err(e) = spawned {
            debug!("Sampler stderr will not be logged: {}", e);
        }
    }

    Some(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::SystemClock;
    use crate::test_support::serial_guard;
    use std::sync::mpsc::channel;
    use tempfile::tempdir;

    #[test]
    fn command_args_follow_sampler_contract() {
        let config = SamplerConfig::new("/usr/bin/sampler", "/tmp");
        assert_eq!(
            config.command_args(42, "run-1"),
            [
                "--pid",
                "42",
                "--interval",
                "1.0",
                "--run-id",
                "run-1",
                "--output",
                "/tmp/jailwatch-run-1.jsonl"
            ]
        );
    }

    #[test]
    fn missing_sampler_is_tolerated_and_stale_file_removed() {
        let tmp = tempdir().unwrap();
        let config = SamplerConfig::new("/definitely/missing/sampler", tmp.path());
        let output = config.output_path("run-x");
        fs::write(&output, "stale\n").unwrap();

        let mut supervisor =
            SamplerSupervisor::start(&config, 1, "run-x", Arc::new(SystemClock), |_| {});

        assert!(!output.exists());
        assert!(!supervisor.is_sampling());
        supervisor.stop();
        supervisor.stop();
    }

    #[test]
    fn script_sampler_output_is_tailed() {
        let _guard = serial_guard();
        let tmp = tempdir().unwrap();

        // Stand-in sampler: writes three records to the path after --output
        let script = tmp.path().join("sampler.sh");
        fs::write(
            &script,
            "#!/bin/sh\nwhile [ \"$1\" != \"--output\" ]; do shift; done\n\
             for i in 1 2 3; do echo \"{\\\"timestamp\\\":\\\"2024-05-01T12:00:0${i}Z\\\",\\\"cpu_percent\\\":$i}\" >> \"$2\"; done\n\
             exec sleep 30\n",
        )
        .unwrap();

        let mut config = SamplerConfig::new("/bin/sh", tmp.path());
        config.args = vec![script.display().to_string()];
        config.tailer.read_period = Duration::from_millis(20);
        config.tailer.batch_period = Duration::from_millis(20);

        let (tx, rx) = channel();
        let mut supervisor =
            SamplerSupervisor::start(&config, std::process::id(), "run-s", Arc::new(SystemClock), move |b| {
                let _ = tx.send(b);
            });
        assert!(supervisor.is_sampling());
        assert_eq!(supervisor.output_path(), config.output_path("run-s"));

        let mut cpus = Vec::new();
        while cpus.len() < 3 {
            let batch = rx.recv_timeout(Duration::from_secs(5)).expect("telemetry batch");
            cpus.extend(batch.samples.iter().map(|s| s.cpu_percent));
        }
        assert_eq!(cpus, vec![1.0, 2.0, 3.0]);
        assert!(config.output_path("run-s").exists());

        supervisor.stop();
        assert!(!supervisor.is_sampling());
        assert!(!config.output_path("run-s").exists());
    }

    #[test]
    fn runs_get_separate_files() {
        let config = SamplerConfig::new("/usr/bin/sampler", "/var/tmp");
        assert_ne!(config.output_path("run-a"), config.output_path("run-b"));
        assert_eq!(
            config.output_path("run-a"),
            Path::new("/var/tmp/jailwatch-run-a.jsonl")
        );
    }
}
