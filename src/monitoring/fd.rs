//! Descriptor resolution through /proc
//!
//! Resolves the open descriptors of a process to the absolute paths they point
//! at. Anything that is not a filesystem path (`pipe:[..]`, `socket:[..]`,
//! `anon_inode:..`) is skipped, and per-descriptor races (a descriptor closed
//! between listing and reading it) are swallowed.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, trace};

/// Result of enumerating one process's descriptors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorScan {
    /// Absolute targets of the open descriptors, in directory order
    Targets(Vec<PathBuf>),
    /// The descriptor directory no longer exists
    ProcessGone,
}

/// Read-only view of per-process descriptor tables
pub trait DescriptorSource: Send + Sync {
    fn open_targets(&self, pid: u32) -> DescriptorScan;

    /// Current working directory of `pid`, if it can be resolved
    fn process_cwd(&self, pid: u32) -> Option<PathBuf>;
}

/// /proc-backed resolver; the root is configurable so tests can point it at a fake tree
#[derive(Debug, Clone)]
pub struct ProcFdResolver {
    proc_root: PathBuf,
}

impl Default for ProcFdResolver {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFdResolver {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    fn process_dir(&self, pid: u32) -> PathBuf {
        self.proc_root.join(pid.to_string())
    }
}

impl DescriptorSource for ProcFdResolver {
    fn open_targets(&self, pid: u32) -> DescriptorScan {
        let fd_dir = self.process_dir(pid).join("fd");
        let entries = match fs::read_dir(&fd_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return DescriptorScan::ProcessGone,
            Err(e) => {
                debug!("Cannot list {}: {}", fd_dir.display(), e);
                return DescriptorScan::Targets(Vec::new());
            }
        };

        let targets = entries
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry.path()),
                Err(e) => {
                    trace!("Skipping descriptor entry: {}", e);
                    None
                }
            })
            .filter_map(|link| match fs::read_link(&link) {
                Ok(target) => Some(target),
                Err(e) => {
                    trace!("Descriptor {} vanished: {}", link.display(), e);
                    None
                }
            })
            .filter(|target| target.is_absolute())
            .collect();

        DescriptorScan::Targets(targets)
    }

    fn process_cwd(&self, pid: u32) -> Option<PathBuf> {
        fs::read_link(self.process_dir(pid).join("cwd")).ok()
    }
}
