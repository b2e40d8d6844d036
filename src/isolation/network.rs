//! Network isolation wrapper and host platform detection

use serde::{Deserialize, Serialize};

use crate::errors::{JailwatchError, Result};
use crate::utils;

/// Prefix used to run a command in a fresh, unprivileged network namespace
pub const DEFAULT_NETWORK_WRAPPER: &[&str] = &["unshare", "--net", "--map-root-user", "--"];

/// What the host can do natively
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPlatform {
    /// Process namespaces and /proc descriptor tables are available
    native: bool,
    /// Command prefix that runs the whole invocation in a compatible environment
    compat_shim: Option<Vec<String>>,
}

impl HostPlatform {
    /// Probe the running host
    pub fn detect() -> Self {
        Self {
            native: utils::has_proc_fd_introspection(),
            compat_shim: None,
        }
    }

    pub fn native() -> Self {
        Self {
            native: true,
            compat_shim: None,
        }
    }

    /// A non-native host that runs every command through `shim`
    pub fn shimmed<I, S>(shim: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let shim: Vec<String> = shim.into_iter().map(Into::into).collect();
        Self {
            native: false,
            compat_shim: (!shim.is_empty()).then_some(shim),
        }
    }

    /// Attach a shim, used only when the host is not native
    pub fn with_compat_shim(mut self, shim: Vec<String>) -> Self {
        self.compat_shim = (!shim.is_empty()).then_some(shim);
        self
    }

    pub fn is_native(&self) -> bool {
        self.native
    }

    pub fn compat_shim(&self) -> Option<&[String]> {
        self.compat_shim.as_deref()
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::detect()
    }
}

/// Wraps commands so they run without network access
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIsolation {
    wrapper: Vec<String>,
}

impl Default for NetworkIsolation {
    fn default() -> Self {
        Self {
            wrapper: DEFAULT_NETWORK_WRAPPER.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl NetworkIsolation {
    /// Use a custom prefix; it must name at least a program
    pub fn with_wrapper<I, S>(wrapper: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let wrapper: Vec<String> = wrapper.into_iter().map(Into::into).collect();
        if wrapper.first().map_or(true, |p| p.trim().is_empty()) {
            return Err(JailwatchError::InvalidConfig(
                "Network wrapper must name a program".to_string(),
            ));
        }
        Ok(Self { wrapper })
    }

    pub fn wrapper(&self) -> &[String] {
        &self.wrapper
    }

    /// Prefix `program args...` with the wrapper
    pub fn wrap(&self, program: &str, args: &[String]) -> (String, Vec<String>) {
        prefix_command(&self.wrapper, program, args)
    }

    /// Whether the wrapper program can be found on this host
    pub fn is_available(&self) -> bool {
        self.wrapper
            .first()
            .is_some_and(|program| utils::find_in_path(program).is_some())
    }
}

/// Put `prefix` in front of `program args...`; an empty prefix leaves the command alone
pub(crate) fn prefix_command(
    prefix: &[String],
    program: &str,
    args: &[String],
) -> (String, Vec<String>) {
    match prefix.split_first() {
        Some((head, rest)) => {
            let mut wrapped = rest.to_vec();
            wrapped.push(program.to_string());
            wrapped.extend(args.iter().cloned());
            (head.clone(), wrapped)
        }
        None => (program.to_string(), args.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_wrapper_is_unshare() {
        let net = NetworkIsolation::default();
        let (program, args) = net.wrap("/bin/echo", &["hi".to_string()]);
        assert_eq!(program, "unshare");
        assert_eq!(args, ["--net", "--map-root-user", "--", "/bin/echo", "hi"]);
    }

    #[test]
    fn custom_wrapper_must_name_program() {
        assert!(NetworkIsolation::with_wrapper(Vec::<String>::new()).is_err());
        assert!(NetworkIsolation::with_wrapper([" "]).is_err());

        let net = NetworkIsolation::with_wrapper(["firejail", "--net=none"]).unwrap();
        let (program, args) = net.wrap("ls", &[]);
        assert_eq!(program, "firejail");
        assert_eq!(args, ["--net=none", "ls"]);
    }

    #[test]
    fn empty_prefix_is_identity() {
        let (program, args) = prefix_command(&[], "ls", &["-l".to_string()]);
        assert_eq!(program, "ls");
        assert_eq!(args, ["-l"]);
    }

    #[test]
    fn shimmed_platform_is_not_native() {
        let platform = HostPlatform::shimmed(["wsl", "--exec"]);
        assert!(!platform.is_native());
        assert_eq!(platform.compat_shim().unwrap(), ["wsl", "--exec"]);

        let bare = HostPlatform::shimmed(Vec::<String>::new());
        assert!(bare.compat_shim().is_none());
    }

    #[test]
    fn detect_matches_proc_introspection() {
        assert_eq!(
            HostPlatform::detect().is_native(),
            utils::has_proc_fd_introspection()
        );
    }
}
