//! Monitoring layer: jail checks, telemetry and anomaly guarding
//!
//! This module observes a running execution without ever touching the
//! orchestrator's state; everything it finds is pushed upward as events.
//!
//! # Features
//!
//! - **FD resolution**: open descriptors resolved through /proc
//! - **Jail monitor**: periodic escape detection against root and whitelist
//! - **Sampler supervision**: external sampler process with a tailed output file
//! - **Telemetry batching**: bounded, ordered, exactly-once delivery of records
//! - **Process statistics**: /proc snapshots for the bundled sampler
//! - **Telemetry guard**: oracle-scored termination of anomalous processes
//!
//! # Examples
//!
//! ```ignore
//! use jailwatch::monitoring::{DescriptorSource, ProcFdResolver};
//!
//! let resolver = ProcFdResolver::default();
//! let scan = resolver.open_targets(std::process::id());
//! println!("{:?}", scan);
//! ```

pub mod fd;
pub mod guard;
pub mod jail;
pub mod sampler;
pub mod stats;
pub mod tailer;
pub use fd::{DescriptorScan, DescriptorSource, ProcFdResolver};
pub use guard::{
    AnomalyOracle, AnomalyReport, Assessment, GuardAction, GuardPolicy, GuardTarget,
    ProcessGroupTarget, RunContext, ScoringRequest, TelemetryGuard,
};
pub use jail::{JailMonitor, MonitorState, Violation};
pub use sampler::{SamplerConfig, SamplerSupervisor};
pub use stats::{CpuTracker, ProcessStats};
pub use tailer::{TailerConfig, TelemetryBatch, TelemetrySample, TelemetryTail};
