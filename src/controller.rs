//! Lifecycle manager
//!
//! [`Orchestrator`] owns at most one live execution. Starting a new one first
//! tears the previous one down; every subsystem of an execution (output
//! batching, jail monitoring, sampler supervision, anomaly guarding) is created
//! here and destroyed here, exactly once, before the single terminal event of the
//! run is published.

use std::os::unix::process::ExitStatusExt;
use std::process::Child;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::errors::{JailwatchError, RejectionKind, Result};
use crate::events::{Emitter, Event, EventSink};
use crate::execution::output::short_id;
use crate::execution::{
    kill_process_group, ExecutionHandle, ExecutionRequest, LaunchedProcess, OutputBatcher,
    OutputReaders, SandboxLauncher,
};
use crate::isolation::{HostPlatform, JailConfig};
use crate::monitoring::{
    AnomalyOracle, DescriptorSource, JailMonitor, ProcFdResolver, ProcessGroupTarget, RunContext,
    SamplerSupervisor, TelemetryBatch, TelemetryGuard,
};
use crate::schedule::{lock, Clock, PeriodicTask, SystemClock};
use crate::utils;

/// Answer to a start request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Accepted { run_id: String, pid: u32 },
    Rejected { kind: RejectionKind, reason: String },
}

impl StartOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, StartOutcome::Accepted { .. })
    }

    pub fn run_id(&self) -> Option<&str> {
        match self {
            StartOutcome::Accepted { run_id, .. } => Some(run_id),
            StartOutcome::Rejected { .. } => None,
        }
    }
}

/// Answer to a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NoOp,
}

/// `{success, message}` reply for launch and stop requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
}

impl From<&StartOutcome> for CommandResult {
    fn from(outcome: &StartOutcome) -> Self {
        match outcome {
            StartOutcome::Accepted { run_id, pid } => CommandResult {
                success: true,
                message: format!("Execution {} started with pid {}", run_id, pid),
            },
            StartOutcome::Rejected { reason, .. } => CommandResult {
                success: false,
                message: reason.clone(),
            },
        }
    }
}

impl From<StopOutcome> for CommandResult {
    fn from(outcome: StopOutcome) -> Self {
        CommandResult {
            success: true,
            message: match outcome {
                StopOutcome::Stopped => "Execution stopped".to_string(),
                StopOutcome::NoOp => "No active execution".to_string(),
            },
        }
    }
}

/// How the child ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum Termination {
    Exited {
        code: Option<i32>,
        signal: Option<String>,
    },
    Failed(String),
}

/// Everything that lives only as long as one execution
struct Subsystems {
    emitter: Emitter,
    batcher: OutputBatcher,
    flush_task: Option<PeriodicTask>,
    jail_monitor: Option<JailMonitor>,
    sampler: Option<SamplerSupervisor>,
    guard: Option<Arc<Mutex<TelemetryGuard>>>,
}

/// Exactly-once teardown shared by the waiter thread and `stop`
struct Teardown {
    subsystems: Mutex<Option<Subsystems>>,
    handle: Arc<Mutex<ExecutionHandle>>,
}

impl Teardown {
    /// Stop every subsystem and publish the terminal event.
    /// Returns `false` when teardown already happened.
    ///
    /// The lock is held throughout, so a racing caller returns only once the
    /// first one has finished.
    fn run(&self, termination: Termination) -> bool {
        let mut slot = lock(&self.subsystems);
        let Some(mut subsystems) = slot.take() else {
            return false;
        };

        if let Some(task) = subsystems.flush_task.as_mut() {
            task.cancel();
        }
        if let Some(monitor) = subsystems.jail_monitor.as_mut() {
            monitor.stop();
        }
        if let Some(sampler) = subsystems.sampler.as_mut() {
            sampler.stop();
        }
        if let Some(guard) = &subsystems.guard {
            let final_report = match guard.try_lock() {
                Ok(mut guard) => guard.finish(),
                Err(TryLockError::Poisoned(poison)) => poison.into_inner().finish(),
                Err(TryLockError::WouldBlock) => {
                    debug!("Guard still busy with a cancelled scoring call");
                    None
                }
            };
            if let Some(report) = final_report {
                subsystems.emitter.emit(Event::Anomaly(report));
            }
        }

        let output = subsystems.batcher.finish();
        let event = {
            let mut handle = lock(&self.handle);
            match termination {
                Termination::Exited { code, signal } => {
                    info!(
                        "Execution {} (pid {}) exited: code {:?}, signal {:?}",
                        handle.run_id, handle.pid, code, signal
                    );
                    handle.mark_exited(code, signal.clone());
                    Event::Exit {
                        code,
                        signal,
                        final_stdout: output.stdout,
                        final_stderr: output.stderr,
                    }
                }
                Termination::Failed(message) => {
                    warn!("Execution {} failed: {}", handle.run_id, message);
                    handle.mark_errored(message.clone());
                    Event::Error { message }
                }
            }
        };
        subsystems.emitter.emit_terminal(event);
        true
    }

    fn is_done(&self) -> bool {
        lock(&self.subsystems).is_none()
    }
}

/// The single live execution
struct ActiveExecution {
    run_id: String,
    pid: u32,
    handle: Arc<Mutex<ExecutionHandle>>,
    teardown: Arc<Teardown>,
    done_rx: Receiver<()>,
    waiter: Option<JoinHandle<()>>,
}

impl ActiveExecution {
    fn join_waiter(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            if waiter.join().is_err() {
                warn!("Waiter of execution {} panicked", self.run_id);
            }
        }
    }
}

/// Top-level coordinator for isolated executions
pub struct Orchestrator {
    config: OrchestratorConfig,
    launcher: SandboxLauncher,
    sink: EventSink,
    clock: Arc<dyn Clock>,
    fd_source: Arc<dyn DescriptorSource>,
    oracle: Option<Arc<dyn AnomalyOracle>>,
    current: Option<ActiveExecution>,
}

impl Orchestrator {
    /// Create an orchestrator for the detected host, publishing into `sink`
    pub fn new(config: OrchestratorConfig, sink: EventSink) -> Self {
        let platform = HostPlatform::detect().with_compat_shim(config.compat_shim.clone());
        let launcher = SandboxLauncher::new(config.network.clone(), platform);
        Self {
            config,
            launcher,
            sink,
            clock: Arc::new(SystemClock),
            fd_source: Arc::new(ProcFdResolver::default()),
            oracle: None,
            current: None,
        }
    }

    /// Drive periodic work from `clock`
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override host detection
    pub fn with_platform(mut self, platform: HostPlatform) -> Self {
        self.launcher = SandboxLauncher::new(self.config.network.clone(), platform);
        self
    }

    /// Install an anomaly oracle; executions with telemetry get a guard
    pub fn with_oracle(mut self, oracle: Arc<dyn AnomalyOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_descriptor_source(mut self, source: Arc<dyn DescriptorSource>) -> Self {
        self.fd_source = source;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn platform(&self) -> &HostPlatform {
        self.launcher.platform()
    }

    /// Launch `request`, tearing down any previous execution first
    pub fn start(&mut self, request: ExecutionRequest) -> StartOutcome {
        if self.stop() == StopOutcome::Stopped {
            debug!("Previous execution torn down before start");
        }

        match self.launch(&request) {
            Ok(active) => {
                let outcome = StartOutcome::Accepted {
                    run_id: active.run_id.clone(),
                    pid: active.pid,
                };
                self.current = Some(active);
                outcome
            }
            Err(e) => {
                warn!("Rejected execution of {:?}: {}", request.command, e);
                StartOutcome::Rejected {
                    kind: e.rejection_kind(),
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Kill the active execution and wait for its teardown.
    ///
    /// Returns [`StopOutcome::NoOp`] when nothing is running. Once this returns,
    /// no periodic work of the stopped execution runs anymore.
    pub fn stop(&mut self) -> StopOutcome {
        let Some(mut active) = self.current.take() else {
            return StopOutcome::NoOp;
        };

        if active.teardown.is_done() {
            active.join_waiter();
            return StopOutcome::NoOp;
        }

        info!("Stopping execution {} (pid {})", active.run_id, active.pid);
        lock(&active.handle).mark_stopping();
        if let Err(e) = kill_process_group(active.pid) {
            warn!("Failed to kill process group {}: {}", active.pid, e);
        }

        match active.done_rx.recv_timeout(self.config.stop_grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => active.join_waiter(),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Execution {} did not finish within {:?}; tearing down",
                    active.run_id, self.config.stop_grace
                );
                active.teardown.run(Termination::Exited {
                    code: None,
                    signal: Some(utils::signal_name(libc::SIGKILL)),
                });
            }
        }

        StopOutcome::Stopped
    }

    /// Snapshot of the current (or most recently finished) execution
    pub fn current(&self) -> Option<ExecutionHandle> {
        self.current
            .as_ref()
            .map(|active| lock(&active.handle).clone())
    }

    pub fn is_active(&self) -> bool {
        self.current()
            .is_some_and(|handle| !handle.status.is_terminal())
    }

    fn launch(&self, request: &ExecutionRequest) -> Result<ActiveExecution> {
        request.validate()?;
        let jail = request.jail_config(&self.config.whitelist)?;
        let launched = self.launcher.launch(request, jail.as_ref())?;
        self.supervise(request, jail, launched)
    }

    fn supervise(
        &self,
        request: &ExecutionRequest,
        jail: Option<JailConfig>,
        launched: LaunchedProcess,
    ) -> Result<ActiveExecution> {
        let LaunchedProcess { mut child, pid, .. } = launched;
        let run_id = Uuid::new_v4().to_string();
        let emitter = Emitter::new(&run_id, self.sink.clone());
        let handle = Arc::new(Mutex::new(ExecutionHandle::new(
            run_id.clone(),
            pid,
            self.clock.now(),
        )));

        let (subsystems, readers) =
            match self.wire(request, jail, &run_id, pid, &emitter, &mut child) {
                Ok(wired) => wired,
                Err(e) => {
                    abandon(pid, &mut child);
                    return Err(e);
                }
            };

        let teardown = Arc::new(Teardown {
            subsystems: Mutex::new(Some(subsystems)),
            handle: Arc::clone(&handle),
        });

        lock(&handle).mark_running();
        let (done_tx, done_rx) = channel();
        let waiter = spawn_waiter(
            &run_id,
            child,
            readers,
            Arc::clone(&teardown),
            self.config.drain_grace,
            done_tx,
        )
        .inspect_err(|_| {
            // The child handle went down with the thread closure; kill the group.
            let _ = kill_process_group(pid);
            teardown.run(Termination::Failed("Failed to start waiter".to_string()));
        })?;

        info!("Execution {} running as pid {}", run_id, pid);
        Ok(ActiveExecution {
            run_id,
            pid,
            handle,
            teardown,
            done_rx,
            waiter: Some(waiter),
        })
    }

    /// Create the subsystems for a freshly spawned child
    fn wire(
        &self,
        request: &ExecutionRequest,
        jail: Option<JailConfig>,
        run_id: &str,
        pid: u32,
        emitter: &Emitter,
        child: &mut Child,
    ) -> Result<(Subsystems, OutputReaders)> {
        let native = self.launcher.platform().is_native();

        let batcher = OutputBatcher::new(emitter.clone(), self.config.flush_chunk_bytes);
        let readers = OutputReaders::spawn(run_id, child.stdout.take(), child.stderr.take(), &batcher)?;
        let flush_task =
            batcher.spawn_flush_task(self.config.flush_interval, Arc::clone(&self.clock))?;

        let jail_root = jail.as_ref().map(|j| j.root().to_path_buf());

        let jail_monitor = match jail {
            Some(jail) if native => {
                let mut monitor =
                    JailMonitor::new(pid, jail, Arc::clone(&self.fd_source), emitter.clone());
                monitor.start(self.config.poll_interval, Arc::clone(&self.clock))?;
                Some(monitor)
            }
            Some(_) => {
                info!("Jail monitoring unavailable on this host; only the working directory is set");
                None
            }
            None => None,
        };

        let mut guard = None;
        let sampler = match &self.config.sampler {
            Some(sampler_config) if native => {
                guard = self.oracle.as_ref().map(|oracle| {
                    let mut command = vec![request.command.clone()];
                    command.extend(request.args.iter().cloned());
                    let context = RunContext {
                        run_id: run_id.to_string(),
                        pid,
                        command,
                        jail_root: jail_root.clone(),
                    };
                    let target =
                        ProcessGroupTarget::new(pid, jail_root.clone(), Arc::clone(&self.fd_source));
                    Arc::new(Mutex::new(TelemetryGuard::new(
                        self.config.guard_policy.clone(),
                        Arc::clone(oracle),
                        Box::new(target),
                        context,
                    )))
                });

                let consumer = telemetry_consumer(emitter.clone(), guard.clone());
                Some(SamplerSupervisor::start(
                    sampler_config,
                    pid,
                    run_id,
                    Arc::clone(&self.clock),
                    consumer,
                ))
            }
            _ => None,
        };

        Ok((
            Subsystems {
                emitter: emitter.clone(),
                batcher,
                flush_task: Some(flush_task),
                jail_monitor,
                sampler,
                guard,
            },
            readers,
        ))
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Publish each telemetry batch and let the guard judge it
fn telemetry_consumer(
    emitter: Emitter,
    guard: Option<Arc<Mutex<TelemetryGuard>>>,
) -> impl FnMut(TelemetryBatch) + Send + 'static {
    move |batch: TelemetryBatch| {
        let report = guard.as_ref().and_then(|g| lock(g).observe(&batch));
        emitter.emit(Event::TelemetryBatch(batch));
        if let Some(report) = report {
            emitter.emit(Event::Anomaly(report));
        }
    }
}

/// Kill and reap a child whose supervision could not be set up
fn abandon(pid: u32, child: &mut Child) {
    if let Err(e) = kill_process_group(pid) {
        warn!("Failed to kill abandoned pid {}: {}", pid, e);
    }
    if let Err(e) = child.wait() {
        debug!("Failed to reap abandoned pid {}: {}", pid, e);
    }
}

fn spawn_waiter(
    run_id: &str,
    mut child: Child,
    mut readers: OutputReaders,
    teardown: Arc<Teardown>,
    drain_grace: std::time::Duration,
    done_tx: Sender<()>,
) -> Result<JoinHandle<()>> {
    let pid = child.id();
    thread::Builder::new()
        .name(format!("wait-{}", short_id(run_id)))
        .spawn(move || {
            let termination = match child.wait() {
                Ok(status) => Termination::Exited {
                    code: status.code(),
                    signal: status.signal().map(utils::signal_name),
                },
                Err(e) => Termination::Failed(format!("Failed to wait for pid {}: {}", pid, e)),
            };

            if !readers.wait_drained(drain_grace) {
                debug!("Output of pid {} still open after {:?}", pid, drain_grace);
            }

            teardown.run(termination);
            let _ = done_tx.send(());
        })
        .map_err(JailwatchError::from)
}
