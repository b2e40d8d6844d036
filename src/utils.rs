//! Utility functions shared by the launcher, monitors and binaries

use crate::errors::{JailwatchError, Result};
use nix::sys::signal::Signal;
use std::path::{Path, PathBuf};

/// Check if running as root
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Get current UID
pub fn get_uid() -> u32 {
    unsafe { libc::geteuid() }
}

/// Get current GID
pub fn get_gid() -> u32 {
    unsafe { libc::getegid() }
}

/// Check whether per-process descriptor tables can be read through /proc
pub fn has_proc_fd_introspection() -> bool {
    cfg!(target_os = "linux") && Path::new("/proc/self/fd").is_dir()
}

/// Locate an executable by name using PATH semantics
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return path.is_file().then_some(path);
    }

    const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
    let path_value = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());

    path_value
        .split(':')
        .map(|entry| if entry.is_empty() { "." } else { entry })
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| candidate.is_file())
}

/// Human readable name for a raw signal number (e.g. 9 -> "SIGKILL")
pub fn signal_name(signal: i32) -> String {
    match Signal::try_from(signal) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("SIG{}", signal),
    }
}

/// Parse memory size string (e.g., "100M", "1G")
pub fn parse_memory_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('G') {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024u64 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024u64)
    } else if let Some(n) = s.strip_suffix('B') {
        (n, 1u64)
    } else {
        (s.as_str(), 1u64)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| JailwatchError::InvalidConfig(format!("Invalid memory size: {}", s)))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| JailwatchError::InvalidConfig(format!("Memory size overflow: {}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_size_bytes() {
        assert_eq!(parse_memory_size("100").unwrap(), 100);
        assert_eq!(parse_memory_size("100B").unwrap(), 100);
    }

    #[test]
    fn test_parse_memory_size_units() {
        assert_eq!(parse_memory_size("10K").unwrap(), 10 * 1024);
        assert_eq!(parse_memory_size("100M").unwrap(), 100 * 1024 * 1024);
        assert_eq!(parse_memory_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_size_case_and_whitespace() {
        assert_eq!(parse_memory_size("  1m ").unwrap(), 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_size_invalid() {
        assert!(parse_memory_size("not_a_number").is_err());
        assert!(parse_memory_size("10X").is_err());
    }

    #[test]
    fn test_is_root_matches_uid() {
        assert_eq!(is_root(), get_uid() == 0);
    }

    #[test]
    fn signal_names_are_symbolic() {
        assert_eq!(signal_name(9), "SIGKILL");
        assert_eq!(signal_name(15), "SIGTERM");
        assert_eq!(signal_name(4242), "SIG4242");
    }

    #[test]
    fn find_in_path_resolves_shell() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-real-binary-xyz").is_none());
        assert!(find_in_path("/bin/sh").is_some());
    }

    #[test]
    fn proc_introspection_is_available_on_linux() {
        if cfg!(target_os = "linux") {
            assert!(has_proc_fd_introspection());
        }
    }
}
