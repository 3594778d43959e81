//! # Launcher seam: how slave processes actually get started.
//!
//! The supervisor does not execute binaries itself; it hands a
//! [`LaunchBundle`] to a [`Launcher`] and classifies the result. The status
//! taxonomy matters: retryable failures arm the relaunch timer, fatal ones
//! route straight to the fault handler.
//!
//! [`CommandLauncher`] is the provided Unix implementation: it spawns the
//! target binary with the bundle exported as environment variables, keeps
//! child handles so the embedder can reap exit notices, and terminates with
//! SIGTERM.

use std::fmt;

use thiserror::Error;

use crate::error::Error;
use crate::slave::Pid;

/// Bundle key carrying the slave name.
pub const BUNDLE_SLAVE_NAME: &str = "SLAVE_NAME";
/// Bundle key carrying the isolation flag, `"true"` or `"false"`.
pub const BUNDLE_SLAVE_SECURED: &str = "SLAVE_SECURED";
/// Bundle key carrying the abi tag.
pub const BUNDLE_SLAVE_ABI: &str = "SLAVE_ABI";

/// Parameter bundle handed to the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchBundle {
    /// Slave name, unique within the registry.
    pub name: String,
    /// Whether the slave hosts a single package.
    pub secured: bool,
    /// Binary-interface tag.
    pub abi: String,
}

impl LaunchBundle {
    /// The bundle as the wire-format string map.
    pub fn entries(&self) -> [(&'static str, String); 3] {
        [
            (BUNDLE_SLAVE_NAME, self.name.clone()),
            (
                BUNDLE_SLAVE_SECURED,
                if self.secured { "true" } else { "false" }.to_string(),
            ),
            (BUNDLE_SLAVE_ABI, self.abi.clone()),
        ]
    }
}

/// Successful launch report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Launched {
    /// Process id of the new slave.
    pub pid: Pid,
    /// The target launched inside the caller's own process context.
    pub local: bool,
}

/// Launcher status codes.
///
/// The retryable family means "try the same launch again shortly"; the
/// fatal family means the launch can never succeed as requested.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// The launch request timed out.
    #[error("launch timed out")]
    Timeout,

    /// Communication with the launcher service failed.
    #[error("launcher communication error")]
    Comm,

    /// The target is currently terminating; retry once it is gone.
    #[error("target is terminating")]
    Terminating,

    /// The request was canceled.
    #[error("launch canceled")]
    Canceled,

    /// The caller may not launch this target.
    #[error("illegal access to launch target")]
    IllegalAccess,

    /// The request arguments are unusable.
    #[error("invalid launch request")]
    Invalid,

    /// The launcher service is not initialized.
    #[error("launcher not initialized")]
    NotInitialized,

    /// No launchpad is available to service the request.
    #[error("no launchpad available")]
    NoLaunchpad,

    /// Any other launcher failure.
    #[error("launch failed: {0}")]
    Failed(String),
}

impl LaunchError {
    /// Whether another attempt at the same launch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LaunchError::Timeout
                | LaunchError::Comm
                | LaunchError::Terminating
                | LaunchError::Canceled
        )
    }

    /// Whether the launch can never succeed as requested.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }

    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            LaunchError::Timeout => "launch_timeout",
            LaunchError::Comm => "launch_comm",
            LaunchError::Terminating => "launch_terminating",
            LaunchError::Canceled => "launch_canceled",
            LaunchError::IllegalAccess => "launch_illegal_access",
            LaunchError::Invalid => "launch_invalid",
            LaunchError::NotInitialized => "launch_not_initialized",
            LaunchError::NoLaunchpad => "launch_no_launchpad",
            LaunchError::Failed(_) => "launch_failed",
        }
    }
}

/// Executes and terminates slave processes on behalf of the supervisor.
pub trait Launcher {
    /// Starts `target` with the given bundle.
    fn launch(&mut self, target: &str, bundle: &LaunchBundle) -> Result<Launched, LaunchError>;

    /// Delivers a terminate signal to a previously launched process.
    fn terminate(&mut self, pid: Pid) -> Result<(), Error>;
}

impl fmt::Debug for dyn Launcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Launcher")
    }
}

#[cfg(unix)]
pub use self::command::CommandLauncher;

#[cfg(unix)]
mod command {
    use std::collections::HashMap;
    use std::io;
    use std::process::{Child, Command, Stdio};

    use log::{debug, warn};

    use super::{LaunchBundle, LaunchError, Launched, Launcher};
    use crate::error::Error;
    use crate::slave::Pid;

    /// Launcher backed by `std::process::Command`.
    ///
    /// Child handles are retained so the embedder can poll
    /// [`CommandLauncher::try_reap`] and feed exit notices back into the
    /// supervisor; otherwise finished slaves would linger as zombies.
    #[derive(Debug, Default)]
    pub struct CommandLauncher {
        children: HashMap<u32, Child>,
    }

    impl CommandLauncher {
        pub fn new() -> Self {
            Self::default()
        }

        /// Polls every retained child once; returns the pids that have
        /// exited together with their success flag.
        pub fn try_reap(&mut self) -> Vec<(Pid, bool)> {
            let mut reaped = Vec::new();
            self.children.retain(|raw, child| match child.try_wait() {
                Ok(Some(status)) => {
                    reaped.push((Pid(*raw), status.success()));
                    false
                }
                Ok(None) => true,
                Err(err) => {
                    warn!("reaping pid {raw} failed: {err}");
                    true
                }
            });
            reaped
        }

        fn classify(err: &io::Error) -> LaunchError {
            match err.kind() {
                io::ErrorKind::TimedOut => LaunchError::Timeout,
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => LaunchError::Comm,
                io::ErrorKind::PermissionDenied => LaunchError::IllegalAccess,
                io::ErrorKind::NotFound => LaunchError::Invalid,
                _ => LaunchError::Failed(err.to_string()),
            }
        }
    }

    impl Launcher for CommandLauncher {
        fn launch(&mut self, target: &str, bundle: &LaunchBundle) -> Result<Launched, LaunchError> {
            let mut cmd = Command::new(target);
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            for (key, value) in bundle.entries() {
                cmd.env(key, value);
            }

            let child = cmd.spawn().map_err(|err| Self::classify(&err))?;
            let pid = child.id();
            self.children.insert(pid, child);
            debug!("launched {target} as pid {pid} ({})", bundle.name);

            Ok(Launched {
                pid: Pid(pid),
                local: false,
            })
        }

        fn terminate(&mut self, pid: Pid) -> Result<(), Error> {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd;

            kill(unistd::Pid::from_raw(pid.0 as i32), Signal::SIGTERM)
                .map_err(|err| Error::fault(format!("terminate pid {pid}: {err}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_families() {
        assert!(LaunchError::Timeout.is_retryable());
        assert!(LaunchError::Comm.is_retryable());
        assert!(LaunchError::Terminating.is_retryable());
        assert!(LaunchError::Canceled.is_retryable());

        assert!(LaunchError::IllegalAccess.is_fatal());
        assert!(LaunchError::Invalid.is_fatal());
        assert!(LaunchError::NotInitialized.is_fatal());
        assert!(LaunchError::NoLaunchpad.is_fatal());
        assert!(LaunchError::Failed("x".into()).is_fatal());
    }

    #[test]
    fn bundle_wire_format() {
        let bundle = LaunchBundle {
            name: "s1".into(),
            secured: true,
            abi: "c".into(),
        };
        let entries = bundle.entries();
        assert_eq!(entries[0], (BUNDLE_SLAVE_NAME, "s1".to_string()));
        assert_eq!(entries[1], (BUNDLE_SLAVE_SECURED, "true".to_string()));
        assert_eq!(entries[2], (BUNDLE_SLAVE_ABI, "c".to_string()));
    }

    #[cfg(unix)]
    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[test]
    fn command_launcher_spawns_and_reaps() {
        let mut launcher = CommandLauncher::new();
        let bundle = LaunchBundle {
            name: "probe".into(),
            secured: false,
            abi: "c".into(),
        };

        let launched = launcher.launch("/bin/true", &bundle).unwrap();
        assert!(launched.pid.0 > 0);

        // The child is short-lived; poll until it is reaped.
        let mut reaped = Vec::new();
        for _ in 0..50 {
            reaped = launcher.try_reap();
            if !reaped.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].0, launched.pid);
        assert!(reaped[0].1);
    }

    #[cfg(unix)]
    #[cfg_attr(miri, ignore)]
    #[test]
    fn command_launcher_maps_missing_binary() {
        let mut launcher = CommandLauncher::new();
        let bundle = LaunchBundle {
            name: "probe".into(),
            secured: false,
            abi: "c".into(),
        };
        let err = launcher
            .launch("/nonexistent/render-slave-binary", &bundle)
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
