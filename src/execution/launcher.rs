//! Sandbox launcher: turns a request into a spawned, isolated child
//!
//! The launch plan is computed first and is pure, so the command line that would
//! run can be inspected (and tested) without spawning anything.

use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::errors::{JailwatchError, Result};
use crate::execution::request::ExecutionRequest;
use crate::execution::rlimit::RlimitConfig;
use crate::isolation::network::prefix_command;
use crate::isolation::{HostPlatform, JailConfig, NetworkIsolation};

/// The exact invocation a request turns into
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory; the jail root when the jail is enabled
    pub cwd: Option<PathBuf>,
    pub rlimits: RlimitConfig,
    pub network_isolated: bool,
    /// The invocation is routed through the host's compatibility shim
    pub shimmed: bool,
}

impl LaunchPlan {
    /// Full command line, for logs
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A child that was spawned successfully
#[derive(Debug)]
pub struct LaunchedProcess {
    pub child: Child,
    pub pid: u32,
    pub plan: LaunchPlan,
}

/// Builds launch plans and spawns them
#[derive(Debug, Clone, Default)]
pub struct SandboxLauncher {
    network: NetworkIsolation,
    platform: HostPlatform,
}

impl SandboxLauncher {
    pub fn new(network: NetworkIsolation, platform: HostPlatform) -> Self {
        Self { network, platform }
    }

    pub fn platform(&self) -> &HostPlatform {
        &self.platform
    }

    pub fn network(&self) -> &NetworkIsolation {
        &self.network
    }

    /// Compute the invocation for `request` without spawning it
    pub fn plan(&self, request: &ExecutionRequest, jail: Option<&JailConfig>) -> Result<LaunchPlan> {
        request.validate()?;

        let (mut program, mut args) = (request.command.clone(), request.args.clone());

        if request.is_network_disabled {
            (program, args) = self.network.wrap(&program, &args);
        }

        let mut shimmed = false;
        if !self.platform.is_native() {
            match self.platform.compat_shim() {
                Some(shim) => {
                    (program, args) = prefix_command(shim, &program, &args);
                    shimmed = true;
                }
                None => warn!("Host is not native and no compatibility shim is configured"),
            }
        }

        if let Some(cpu) = request.cpu_limit {
            info!(
                "CPU ceiling of {}% is delegated to the host sandbox and not enforced by setrlimit",
                cpu
            );
        }

        Ok(LaunchPlan {
            program,
            args,
            cwd: jail.map(|j| j.root().to_path_buf()),
            rlimits: request.rlimits()?,
            network_isolated: request.is_network_disabled,
            shimmed,
        })
    }

    /// Spawn the request in its own session with piped output
    pub fn launch(
        &self,
        request: &ExecutionRequest,
        jail: Option<&JailConfig>,
    ) -> Result<LaunchedProcess> {
        let plan = self.plan(request, jail)?;
        debug!("Launching: {}", plan.command_line());

        let mut cmd = Command::new(&plan.program);
        cmd.args(&plan.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(cwd) = &plan.cwd {
            cmd.current_dir(cwd);
        }

        let rlimits = plan.rlimits;
        unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                rlimits.apply()
            });
        }

        let mut child = cmd.spawn().map_err(|e| {
            JailwatchError::Spawn(format!("Failed to start {}: {}", plan.program, e))
        })?;

        let pid = child.id();
        if pid == 0 {
            let _ = child.kill();
            let _ = child.wait();
            return Err(JailwatchError::Spawn(format!(
                "No process id was assigned to {}",
                plan.program
            )));
        }

        info!("Launched {} as pid {}", plan.program, pid);
        Ok(LaunchedProcess { child, pid, plan })
    }
}

/// SIGKILL the whole process group led by `pid`; an already-gone group is not an error
pub fn kill_process_group(pid: u32) -> Result<()> {
    let pgid = i32::try_from(pid)
        .map_err(|_| JailwatchError::Syscall(format!("Invalid process id {}", pid)))?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(JailwatchError::Syscall(format!(
            "killpg({}) failed: {}",
            pgid, e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::Whitelist;
    use tempfile::tempdir;

    fn native_launcher() -> SandboxLauncher {
        SandboxLauncher::new(NetworkIsolation::default(), HostPlatform::native())
    }

    #[test]
    fn plan_runs_command_directly_by_default() {
        let plan = native_launcher()
            .plan(&ExecutionRequest::new("/bin/echo", ["hi"]), None)
            .unwrap();
        assert_eq!(plan.program, "/bin/echo");
        assert_eq!(plan.args, ["hi"]);
        assert!(plan.cwd.is_none());
        assert!(!plan.network_isolated);
        assert!(!plan.shimmed);
    }

    #[test]
    fn plan_wraps_network_disabled_requests() {
        let plan = native_launcher()
            .plan(&ExecutionRequest::new("curl", ["example.com"]).without_network(), None)
            .unwrap();
        assert_eq!(plan.program, "unshare");
        assert_eq!(plan.command_line(), "unshare --net --map-root-user -- curl example.com");
    }

    #[test]
    fn plan_routes_non_native_hosts_through_shim() {
        let launcher = SandboxLauncher::new(
            NetworkIsolation::default(),
            HostPlatform::shimmed(["wsl", "--exec"]),
        );
        let plan = launcher
            .plan(&ExecutionRequest::new("ls", ["-l"]).without_network(), None)
            .unwrap();
        assert!(plan.shimmed);
        assert_eq!(
            plan.command_line(),
            "wsl --exec unshare --net --map-root-user -- ls -l"
        );
    }

    #[test]
    fn plan_sets_jail_as_cwd() {
        let tmp = tempdir().unwrap();
        let jail = JailConfig::validate(tmp.path(), Whitelist::default()).unwrap();
        let plan = native_launcher()
            .plan(&ExecutionRequest::new("pwd", Vec::<String>::new()), Some(&jail))
            .unwrap();
        assert_eq!(plan.cwd.as_deref(), Some(jail.root()));
    }

    #[test]
    fn plan_rejects_empty_command() {
        let err = native_launcher()
            .plan(&ExecutionRequest::default(), None)
            .unwrap_err();
        assert!(matches!(err, JailwatchError::InvalidRequest(_)));
    }

    #[test]
    fn launch_missing_binary_is_spawn_error() {
        let err = native_launcher()
            .launch(
                &ExecutionRequest::new("/definitely/not/here", Vec::<String>::new()),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, JailwatchError::Spawn(_)));
    }

    #[test]
    fn launched_child_leads_its_own_process_group() {
        let _guard = crate::test_support::serial_guard();
        let mut launched = native_launcher()
            .launch(&ExecutionRequest::new("/bin/sleep", ["5"]), None)
            .unwrap();

        let pgid = nix::unistd::getpgid(Some(Pid::from_raw(launched.pid as i32))).unwrap();
        assert_eq!(pgid.as_raw(), launched.pid as i32);

        kill_process_group(launched.pid).unwrap();
        let status = launched.child.wait().unwrap();
        assert!(!status.success());

        // Group is gone now; killing again is harmless
        kill_process_group(launched.pid).unwrap();
    }
}
