//! Execution handle and its status machine

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Starting,
    Running,
    Stopping,
    Exited,
    Errored,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Exited | ExecutionStatus::Errored)
    }
}

/// Snapshot of the single live execution
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionHandle {
    pub run_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub error: Option<String>,
}

impl ExecutionHandle {
    pub fn new(run_id: impl Into<String>, pid: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            pid,
            started_at,
            status: ExecutionStatus::Starting,
            exit_code: None,
            signal: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        if self.status == ExecutionStatus::Starting {
            self.status = ExecutionStatus::Running;
        }
    }

    pub fn mark_stopping(&mut self) {
        if !self.status.is_terminal() {
            self.status = ExecutionStatus::Stopping;
        }
    }

    /// Terminal states are final; later transitions are ignored
    pub fn mark_exited(&mut self, code: Option<i32>, signal: Option<String>) {
        if !self.status.is_terminal() {
            self.status = ExecutionStatus::Exited;
            self.exit_code = code;
            self.signal = signal;
        }
    }

    pub fn mark_errored(&mut self, message: impl Into<String>) {
        if !self.status.is_terminal() {
            self.status = ExecutionStatus::Errored;
            self.error = Some(message.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_lifecycle() {
        let mut handle = ExecutionHandle::new("r", 42, Utc::now());
        assert_eq!(handle.status, ExecutionStatus::Starting);

        handle.mark_running();
        assert_eq!(handle.status, ExecutionStatus::Running);

        handle.mark_stopping();
        handle.mark_exited(None, Some("SIGKILL".to_string()));
        assert_eq!(handle.status, ExecutionStatus::Exited);
        assert_eq!(handle.signal.as_deref(), Some("SIGKILL"));
    }

    #[test]
    fn terminal_state_is_sticky() {
        let mut handle = ExecutionHandle::new("r", 42, Utc::now());
        handle.mark_running();
        handle.mark_exited(Some(0), None);

        handle.mark_errored("late");
        handle.mark_stopping();
        handle.mark_running();

        assert_eq!(handle.status, ExecutionStatus::Exited);
        assert_eq!(handle.exit_code, Some(0));
        assert!(handle.error.is_none());
    }

    #[test]
    fn serializes_lowercase_status() {
        let handle = ExecutionHandle::new("r", 7, Utc::now());
        let json = serde_json::to_value(&handle).unwrap();
        assert_eq!(json["status"], "starting");
        assert_eq!(json["runId"], "r");
    }
}
