//! Jail preparation collaborators
//!
//! Preparing a jail (populating it with files, fixing ownership) happens before
//! launch and outside the orchestrator. The server calls a [`JailPreparer`]
//! synchronously and reports what it did; a failed preparation never touches a
//! running execution.

use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process::{Command, Stdio};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::errors::{JailwatchError, Result};

/// Outcome of a preparation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparationReport {
    /// "ok" or "failed"
    pub status: String,
    pub return_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl PreparationReport {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: "ok".to_string(),
            return_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Something that can get a jail root ready for use
pub trait JailPreparer: Send + Sync {
    fn prepare(&self, jail_root: &Path) -> Result<PreparationReport>;
}

/// Reject roots that must never be prepared
fn check_root(jail_root: &Path) -> Result<()> {
    let bytes = jail_root.as_os_str().as_bytes();
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(JailwatchError::JailPreparation(
            "Jail path is required".to_string(),
        ));
    }
    if bytes.iter().all(|b| *b == b'/') {
        return Err(JailwatchError::JailPreparation(
            "Refusing to prepare the filesystem root (/)".to_string(),
        ));
    }
    if !jail_root.is_absolute() {
        return Err(JailwatchError::JailPreparation(format!(
            "Jail path must be absolute: {}",
            jail_root.display()
        )));
    }
    Ok(())
}

/// Runs an external program with the jail root as its last argument
#[derive(Debug, Clone)]
pub struct CommandJailPreparer {
    program: String,
    args: Vec<String>,
}

impl CommandJailPreparer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl JailPreparer for CommandJailPreparer {
    fn prepare(&self, jail_root: &Path) -> Result<PreparationReport> {
        check_root(jail_root)?;
        info!("Preparing jail {} with {}", jail_root.display(), self.program);

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(jail_root)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                JailwatchError::JailPreparation(format!(
                    "Failed to run {}: {}",
                    self.program, e
                ))
            })?;

        let return_code = output.status.code();
        debug!("Jail preparation exited with {:?}", return_code);

        Ok(PreparationReport {
            status: if output.status.success() { "ok" } else { "failed" }.to_string(),
            return_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Creates the jail directory tree and nothing else
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryJailPreparer;

impl JailPreparer for DirectoryJailPreparer {
    fn prepare(&self, jail_root: &Path) -> Result<PreparationReport> {
        check_root(jail_root)?;
        fs::create_dir_all(jail_root).map_err(|e| {
            JailwatchError::JailPreparation(format!(
                "Failed to create {}: {}",
                jail_root.display(),
                e
            ))
        })?;
        Ok(PreparationReport::ok(format!(
            "created {}",
            jail_root.display()
        )))
    }
}
