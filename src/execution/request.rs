//! Launch requests as submitted by operators

use serde::{Deserialize, Serialize};

use crate::errors::{JailwatchError, Result};
use crate::execution::rlimit::RlimitConfig;
use crate::isolation::{JailConfig, Whitelist};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Everything needed to launch one execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// Program to run (absolute path or name resolved through PATH)
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// CPU ceiling in percent; delegated to the host sandbox, not enforced here
    #[serde(default)]
    pub cpu_limit: Option<f64>,
    /// Address-space ceiling in megabytes
    #[serde(default)]
    pub mem_limit: Option<u64>,
    /// Maximum number of processes for the owning user
    #[serde(default)]
    pub proc_limit: Option<u64>,
    /// Maximum size in bytes of any file the process writes
    #[serde(default)]
    pub file_size_limit: Option<u64>,
    #[serde(default)]
    pub is_jail_enabled: bool,
    #[serde(default)]
    pub jail_path: Option<String>,
    #[serde(default)]
    pub is_network_disabled: bool,
}

impl ExecutionRequest {
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Confine the process to `path`
    pub fn with_jail(mut self, path: impl Into<String>) -> Self {
        self.is_jail_enabled = true;
        self.jail_path = Some(path.into());
        self
    }

    pub fn without_network(mut self) -> Self {
        self.is_network_disabled = true;
        self
    }

    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.mem_limit = Some(mb);
        self
    }

    pub fn with_cpu_limit(mut self, percent: f64) -> Self {
        self.cpu_limit = Some(percent);
        self
    }

    pub fn with_process_limit(mut self, procs: u64) -> Self {
        self.proc_limit = Some(procs);
        self
    }

    pub fn with_file_size_limit(mut self, bytes: u64) -> Self {
        self.file_size_limit = Some(bytes);
        self
    }

    /// Check everything that can be checked without touching the filesystem
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(JailwatchError::InvalidRequest(
                "Command is required".to_string(),
            ));
        }

        if let Some(cpu) = self.cpu_limit {
            if !cpu.is_finite() || cpu <= 0.0 {
                return Err(JailwatchError::InvalidRequest(format!(
                    "CPU limit must be a positive percentage, got {}",
                    cpu
                )));
            }
        }

        if self.mem_limit == Some(0) {
            return Err(JailwatchError::InvalidRequest(
                "Memory limit must be greater than 0".to_string(),
            ));
        }

        if self.proc_limit == Some(0) {
            return Err(JailwatchError::InvalidRequest(
                "Process limit must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Validated jail for this request, or `None` when the jail is disabled
    pub fn jail_config(&self, whitelist: &Whitelist) -> Result<Option<JailConfig>> {
        if !self.is_jail_enabled {
            return Ok(None);
        }
        let path = self.jail_path.as_deref().unwrap_or_default();
        JailConfig::validate(path, whitelist.clone()).map(Some)
    }

    /// OS ceilings handed to the child before exec
    pub fn rlimits(&self) -> Result<RlimitConfig> {
        let max_memory = match self.mem_limit {
            Some(mb) => Some(mb.checked_mul(BYTES_PER_MB).ok_or_else(|| {
                JailwatchError::InvalidRequest(format!("Memory limit too large: {} MB", mb))
            })?),
            None => None,
        };

        Ok(RlimitConfig {
            max_memory,
            max_processes: self.proc_limit,
            max_file_size: self.file_size_limit,
        })
    }
}
