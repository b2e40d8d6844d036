//! Telemetry tailer
//!
//! Follows the append-only newline-delimited JSON file written by the sampler.
//! Each complete line becomes one [`TelemetrySample`]; a trailing partial line is
//! held until its newline arrives. Samples are grouped into bounded batches and
//! delivered in file order, each record exactly once.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, trace};
use serde::{Deserialize, Serialize, Serializer};

use crate::errors::Result;
use crate::schedule::{Clock, Worker};

/// One telemetry record as written by the sampler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub rss_bytes: u64,
    #[serde(default)]
    pub vms_bytes: u64,
    #[serde(default)]
    pub threads: u32,
    #[serde(default)]
    pub fds_open: u32,
    #[serde(default)]
    pub read_bytes: u64,
    #[serde(default)]
    pub write_bytes: u64,
}

impl TelemetrySample {
    /// Short human-readable form
    pub fn summary(&self) -> String {
        format!(
            "cpu {:.1}% rss {} KiB threads {} fds {}",
            self.cpu_percent,
            self.rss_bytes / 1024,
            self.threads,
            self.fds_open
        )
    }
}

/// Published form of a sample inside a `telemetryBatch` event
#[derive(Serialize)]
struct PublishedSample<'a> {
    cpu: f64,
    memory: u64,
    timestamp: &'a DateTime<Utc>,
}

impl<'a> From<&'a TelemetrySample> for PublishedSample<'a> {
    fn from(sample: &'a TelemetrySample) -> Self {
        Self {
            cpu: sample.cpu_percent,
            memory: sample.rss_bytes,
            timestamp: &sample.timestamp,
        }
    }
}

fn published_samples<S: Serializer>(
    samples: &[TelemetrySample],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(samples.iter().map(PublishedSample::from))
}

/// Samples delivered together, in file order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetryBatch {
    #[serde(serialize_with = "published_samples")]
    pub samples: Vec<TelemetrySample>,
}

impl TelemetryBatch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Incremental reader over a growing file
#[derive(Debug)]
pub struct TelemetryTail {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl TelemetryTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            partial: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse every line completed since the last call
    pub fn read_new(&mut self) -> Vec<TelemetrySample> {
        let bytes = match self.read_appended() {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                debug!("Telemetry read of {} failed: {}", self.path.display(), e);
                return Vec::new();
            }
        };
        if bytes.is_empty() {
            return Vec::new();
        }

        self.partial.extend_from_slice(&bytes);
        let Some(last_newline) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);

        complete
            .split(|b| *b == b'\n')
            .filter_map(|line| parse_line(line, &self.path))
            .collect()
    }

    fn read_appended(&mut self) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        if len < self.offset {
            debug!("Telemetry file {} was truncated; rereading", self.path.display());
            self.offset = 0;
            self.partial.clear();
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        self.offset += bytes.len() as u64;
        Ok(bytes)
    }
}

fn parse_line(line: &[u8], path: &Path) -> Option<TelemetrySample> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(sample) => Some(sample),
        Err(e) => {
            debug!("Skipping malformed telemetry line in {}: {}", path.display(), e);
            None
        }
    }
}

/// Bounded grouping of samples into batches
#[derive(Debug)]
pub struct BatchAccumulator {
    pending: VecDeque<TelemetrySample>,
    max_batch: usize,
}

impl BatchAccumulator {
    pub fn new(max_batch: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            max_batch: max_batch.max(1),
        }
    }

    pub fn extend(&mut self, samples: impl IntoIterator<Item = TelemetrySample>) {
        self.pending.extend(samples);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Next batch of at most `max_batch` samples
    pub fn take_batch(&mut self) -> Option<TelemetryBatch> {
        if self.pending.is_empty() {
            return None;
        }
        let count = self.pending.len().min(self.max_batch);
        Some(TelemetryBatch {
            samples: self.pending.drain(..count).collect(),
        })
    }
}

/// Tailer timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailerConfig {
    /// How often the file is checked for new lines
    pub read_period: Duration,
    /// How often accumulated samples are delivered
    pub batch_period: Duration,
    /// Largest batch
    pub max_batch: usize,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            read_period: Duration::from_millis(250),
            batch_period: Duration::from_secs(2),
            max_batch: 32,
        }
    }
}

/// Run the tailer on a [`Worker`].
///
/// On a stop request it does one final read and delivers everything pending
/// before acknowledging. Nothing is delivered once the worker's gate is closed.
pub fn spawn_tailer<F>(
    name: impl Into<String>,
    path: impl Into<PathBuf>,
    config: TailerConfig,
    clock: Arc<dyn Clock>,
    mut consumer: F,
) -> Result<Worker>
where
    F: FnMut(TelemetryBatch) + Send + 'static,
{
    let path = path.into();
    Worker::spawn(name, move |ctx| {
        let mut tail = TelemetryTail::new(path);
        let mut batches = BatchAccumulator::new(config.max_batch);
        let mut since_delivery = Duration::ZERO;

        loop {
            let stopping = ctx.wait_for_stop(clock.as_ref(), config.read_period);
            batches.extend(tail.read_new());

            if !stopping {
                since_delivery += config.read_period;
                if since_delivery < config.batch_period {
                    continue;
                }
                since_delivery = Duration::ZERO;
            }

            while let Some(batch) = batches.take_batch() {
                if !ctx.is_open() {
                    trace!("Tailer gate closed; dropping {} samples", batch.len());
                    return;
                }
                consumer(batch);
            }

            if stopping {
                debug!("Telemetry tailer for {} finished", tail.path().display());
                break;
            }
        }
    })
}
