//! setrlimit-based resource ceilings applied in the child before exec
//!
//! These run inside `pre_exec`, between fork and exec, so they only touch
//! async-signal-safe libc calls and report failures as `io::Error`.

use std::io;

/// Ceilings handed to the OS for one execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RlimitConfig {
    /// Maximum address space size in bytes (RLIMIT_AS)
    pub max_memory: Option<u64>,
    /// Maximum number of processes (RLIMIT_NPROC)
    pub max_processes: Option<u64>,
    /// Maximum file size in bytes (RLIMIT_FSIZE)
    pub max_file_size: Option<u64>,
}

impl RlimitConfig {
    pub fn is_empty(&self) -> bool {
        self.max_memory.is_none() && self.max_processes.is_none() && self.max_file_size.is_none()
    }

    /// Apply the limits to the calling process.
    /// Call in the child after fork.
    pub fn apply(&self) -> io::Result<()> {
        if let Some(mem) = self.max_memory {
            set_rlimit(libc::RLIMIT_AS, mem)?;
        }
        if let Some(nproc) = self.max_processes {
            set_rlimit(libc::RLIMIT_NPROC, nproc)?;
        }
        if let Some(fsize) = self.max_file_size {
            set_rlimit(libc::RLIMIT_FSIZE, fsize)?;
        }
        Ok(())
    }
}

fn set_rlimit(resource: libc::__rlimit_resource_t, limit: u64) -> io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };

    let ret = unsafe { libc::setrlimit(resource, &rlim) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
