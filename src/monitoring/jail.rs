//! File jail monitor
//!
//! Polls the descriptor table of the monitored process and reports every
//! resolved path that is neither whitelisted nor under the jail root. Reports are
//! at-least-once: a descriptor that stays open is reported again every cycle.

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;

use crate::errors::Result;
use crate::events::{Emitter, Event};
use crate::execution::output::short_id;
use crate::isolation::{JailConfig, PathClass};
use crate::monitoring::fd::{DescriptorScan, DescriptorSource};
use crate::schedule::{lock, Clock, PeriodicTask};

/// Monitor lifecycle: idle until started, polling until stopped or the process is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Idle,
    Polling,
    Stopped,
}

/// A descriptor that escaped the jail
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub path: PathBuf,
    pub detected_at: DateTime<Utc>,
    pub pid: u32,
}

/// One poll cycle: `None` once the process is gone
pub fn poll_once(
    source: &dyn DescriptorSource,
    jail: &JailConfig,
    pid: u32,
    now: DateTime<Utc>,
) -> Option<Vec<Violation>> {
    let targets = match source.open_targets(pid) {
        DescriptorScan::Targets(targets) => targets,
        DescriptorScan::ProcessGone => return None,
    };

    let mut violations: Vec<Violation> = Vec::new();
    for path in targets {
        if jail.classify(&path) != PathClass::Violation {
            continue;
        }
        // Several descriptors on one file count once per cycle
        if violations.iter().any(|v| v.path == path) {
            continue;
        }
        violations.push(Violation {
            path,
            detected_at: now,
            pid,
        });
    }
    Some(violations)
}

/// Periodic jail checker for one execution
pub struct JailMonitor {
    pid: u32,
    jail: JailConfig,
    source: Arc<dyn DescriptorSource>,
    emitter: Emitter,
    state: Arc<Mutex<MonitorState>>,
    task: Option<PeriodicTask>,
}

impl JailMonitor {
    pub fn new(
        pid: u32,
        jail: JailConfig,
        source: Arc<dyn DescriptorSource>,
        emitter: Emitter,
    ) -> Self {
        Self {
            pid,
            jail,
            source,
            emitter,
            state: Arc::new(Mutex::new(MonitorState::Idle)),
            task: None,
        }
    }

    /// Begin polling every `period`. Starting twice, or after stop, does nothing.
    pub fn start(&mut self, period: Duration, clock: Arc<dyn Clock>) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if *state != MonitorState::Idle {
                return Ok(());
            }
            *state = MonitorState::Polling;
        }

        let pid = self.pid;
        let jail = self.jail.clone();
        let source = Arc::clone(&self.source);
        let emitter = self.emitter.clone();
        let state = Arc::clone(&self.state);
        let tick_clock = Arc::clone(&clock);

        info!(
            "Jail monitor polling pid {} against {}",
            pid,
            jail.root().display()
        );

        let name = format!("jail-{}", short_id(self.emitter.run_id()));
        let task = PeriodicTask::spawn(name, period, clock, move || {
            match poll_once(source.as_ref(), &jail, pid, tick_clock.now()) {
                Some(violations) => {
                    for violation in violations {
                        debug!("Jail violation by {}: {}", pid, violation.path.display());
                        emitter.emit(Event::Violation(violation));
                    }
                    ControlFlow::Continue(())
                }
                None => {
                    debug!("Descriptor table of {} is gone; jail monitor stopping", pid);
                    *lock(&state) = MonitorState::Stopped;
                    ControlFlow::Break(())
                }
            }
        });

        match task {
            Ok(task) => {
                self.task = Some(task);
                Ok(())
            }
            Err(e) => {
                *lock(&self.state) = MonitorState::Stopped;
                Err(e)
            }
        }
    }

    /// Cancel polling; no cycle runs after this returns
    pub fn stop(&mut self) {
        if let Some(mut task) = self.task.take() {
            task.cancel();
        }
        *lock(&self.state) = MonitorState::Stopped;
    }

    pub fn state(&self) -> MonitorState {
        *lock(&self.state)
    }
}

impl Drop for JailMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
