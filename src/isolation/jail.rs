//! Jail root validation and path classification

use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::errors::{JailwatchError, Result};

/// Prefixes a jailed process may always hold open: devices, kernel views,
/// the dynamic loader's libraries and locale/timezone data.
pub const DEFAULT_WHITELIST: &[&str] = &[
    "/dev",
    "/proc",
    "/sys",
    "/lib",
    "/lib64",
    "/usr/lib",
    "/usr/lib64",
    "/usr/share/locale",
    "/usr/share/zoneinfo",
    "/etc/ld.so.cache",
    "/etc/localtime",
];

/// Fixed set of path prefixes exempt from jail violation checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Whitelist {
    prefixes: Vec<PathBuf>,
}

impl Default for Whitelist {
    fn default() -> Self {
        Self::from_prefixes(DEFAULT_WHITELIST.iter().map(PathBuf::from))
    }
}

impl Whitelist {
    /// Build from explicit prefixes (relative entries are ignored)
    pub fn from_prefixes<I, P>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut list = Self {
            prefixes: Vec::new(),
        };
        list.extend(prefixes);
        list
    }

    /// Nothing is exempt
    pub fn empty() -> Self {
        Self {
            prefixes: Vec::new(),
        }
    }

    /// Append extra prefixes, skipping relative paths and duplicates
    pub fn extend<I, P>(&mut self, prefixes: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for prefix in prefixes {
            let prefix = prefix.into();
            if prefix.is_absolute() && !self.prefixes.contains(&prefix) {
                self.prefixes.push(prefix);
            }
        }
    }

    pub fn with_extra<I, P>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.extend(prefixes);
        self
    }

    /// Component-wise prefix test: `/dev` covers `/dev/null` but not `/devices`
    pub fn covers(&self, path: &Path) -> bool {
        self.prefixes.iter().any(|prefix| path.starts_with(prefix))
    }

    pub fn prefixes(&self) -> &[PathBuf] {
        &self.prefixes
    }
}

/// Where a resolved descriptor target falls relative to the jail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    Whitelisted,
    InsideJail,
    Violation,
}

/// A validated jail: canonical root directory plus its whitelist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailConfig {
    root: PathBuf,
    whitelist: Whitelist,
}

impl JailConfig {
    /// Validate a user-supplied jail path.
    ///
    /// Rejects a blank path, relative paths, the filesystem root, paths that do not
    /// exist and paths that are not directories. Any other path is checked exactly
    /// as given. The stored root is canonical, so descriptor targets (which the
    /// kernel reports canonically) compare correctly.
    pub fn validate(path: impl AsRef<Path>, whitelist: Whitelist) -> Result<Self> {
        let path = path.as_ref();

        if path.as_os_str().as_bytes().iter().all(u8::is_ascii_whitespace) {
            return Err(JailwatchError::InvalidJail(
                "Jail path is required when the jail is enabled".to_string(),
            ));
        }

        if is_filesystem_root(path) {
            return Err(JailwatchError::InvalidJail(
                "Jail root cannot be the filesystem root (/)".to_string(),
            ));
        }

        if !path.is_absolute() {
            return Err(JailwatchError::InvalidJail(format!(
                "Jail path must be absolute: {}",
                path.display()
            )));
        }

        if !path.exists() {
            return Err(JailwatchError::InvalidJail(format!(
                "Jail path does not exist: {}",
                path.display()
            )));
        }

        if !path.is_dir() {
            return Err(JailwatchError::InvalidJail(format!(
                "Jail path is not a directory: {}",
                path.display()
            )));
        }

        let root = path.canonicalize().map_err(|e| {
            JailwatchError::InvalidJail(format!(
                "Failed to resolve jail path {}: {}",
                path.display(),
                e
            ))
        })?;

        if is_filesystem_root(&root) {
            return Err(JailwatchError::InvalidJail(format!(
                "Jail path {} resolves to the filesystem root",
                path.display()
            )));
        }

        Ok(Self { root, whitelist })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    /// Whether `path` is the jail root or below it
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    pub fn classify(&self, path: &Path) -> PathClass {
        if self.whitelist.covers(path) {
            PathClass::Whitelisted
        } else if self.contains(path) {
            PathClass::InsideJail
        } else {
            PathClass::Violation
        }
    }
}

fn is_filesystem_root(path: &Path) -> bool {
    path.has_root() && path.parent().is_none()
}
