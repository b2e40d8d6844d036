//! jailwatch: run untrusted commands in a jail and watch them
//!
//! Launches an arbitrary command with its working directory confined to a jail root,
//! optional network-namespace isolation and OS-level resource ceilings, then observes it
//! while it runs: batched stdout/stderr, resource telemetry from an external sampler,
//! and descriptors that escape the jail.
//!
//! # Modules
//!
//! - **isolation**: Jail roots, whitelists, network wrapping and jail preparation
//! - **execution**: Requests, launching, output batching and execution handles
//! - **monitoring**: Descriptor resolution, jail polling, sampler supervision, telemetry tailing
//! - **events**: Channel-based publish contract for everything the orchestrator reports
//! - **schedule**: Clocks, periodic tasks and two-phase worker cancellation
//! - **controller**: Lifecycle manager owning at most one live execution
//!
//! # Example
//!
//! ```ignore
//! use jailwatch::{events, ExecutionRequest, Orchestrator, OrchestratorConfig};
//!
//! let (sink, stream) = events::channel();
//! let mut orchestrator = Orchestrator::new(OrchestratorConfig::default(), sink);
//!
//! let outcome = orchestrator.start(ExecutionRequest::new("/bin/echo", ["hi"]));
//! assert!(outcome.is_accepted());
//!
//! for envelope in stream {
//!     println!("{:?}", envelope.event);
//!     if envelope.event.is_terminal() {
//!         break;
//!     }
//! }
//! ```

// Core modules
pub mod config;
pub mod errors;
pub mod logging;
pub mod schedule;
pub mod utils;

// Layered modules
pub mod events;
pub mod execution;
pub mod isolation;
pub mod monitoring;

// Lifecycle manager
pub mod controller;

// Public API
pub use config::{OrchestratorBuilder, OrchestratorConfig};
pub use controller::{CommandResult, Orchestrator, StartOutcome, StopOutcome};
pub use errors::{JailwatchError, RejectionKind, Result};
pub use events::{Event, EventEnvelope, EventSink, EventStream, StreamKind};
pub use execution::{ExecutionHandle, ExecutionRequest, ExecutionStatus};
pub use isolation::{HostPlatform, JailConfig, NetworkIsolation, Whitelist};
pub use monitoring::{
    AnomalyOracle, JailMonitor, SamplerConfig, SamplerSupervisor, TelemetryBatch,
    TelemetrySample, Violation,
};
pub use schedule::{Clock, ManualClock, SystemClock};
