//! Execution layer: requests, launching and output handling
//!
//! This module turns an [`ExecutionRequest`] into a running, isolated child and
//! carries its output upward at a bounded rate.
//!
//! # Features
//!
//! - **Requests**: camelCase wire form with optional resource ceilings
//! - **Launcher**: network wrapping, compatibility shim, jail working directory
//! - **Process groups**: each child leads its own session and is killed as a group
//! - **Resource ceilings**: memory, process count and file size via setrlimit
//! - **Output batching**: interleaved chunks on a timer, cumulative buffers at the end
//!
//! # Examples
//!
//! ```ignore
//! use jailwatch::execution::{ExecutionRequest, SandboxLauncher};
//!
//! let request = ExecutionRequest::new("/bin/echo", ["hello"]).without_network();
//! let plan = SandboxLauncher::default().plan(&request, None)?;
//! println!("{}", plan.command_line());
//! ```

pub mod handle;
pub mod launcher;
pub mod output;
pub mod request;
pub mod rlimit;
pub mod stream;
pub use handle::{ExecutionHandle, ExecutionStatus};
pub use launcher::{kill_process_group, LaunchPlan, LaunchedProcess, SandboxLauncher};
pub use output::{FinalOutput, OutputBatcher, DEFAULT_CHUNK_CAP};
pub use request::ExecutionRequest;
pub use rlimit::RlimitConfig;
pub use stream::OutputReaders;
