//! # The single-threaded event loop that drives the supervisor.
//!
//! Everything the outside world tells the core (handshakes, exit notices,
//! pause/resume acks, display-monitor transitions, plugin call/return
//! announcements) arrives as a [`Notice`] on one unbounded channel. The
//! [`Mainloop`] selects over that channel, a shutdown token, and the next
//! timer deadline, and is the only task that ever touches the
//! [`Supervisor`].
//!
//! ## High-level architecture
//!
//! ```text
//!   wire server ──┐
//!   launcher reap ├──► NoticeSender ──► Mainloop::run()
//!   display watch ┘                        │
//!                        ┌─────────────────┼──────────────────┐
//!                  shutdown token    notice channel    sleep_until(next
//!                        │                 │            timer deadline)
//!                        ▼                 ▼                  ▼
//!                      break        dispatch(notice)   Supervisor::advance
//! ```
//!
//! Helper threads never touch the supervisor; they send notices and the
//! loop applies them between timer fires.

use std::time::Instant;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::slave::Pid;
use crate::supervisor::Supervisor;

/// One externally observed event fed into the core.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// A freshly launched slave delivered its activation handshake.
    Hello {
        /// Slave name carried in the handshake.
        name: String,
        /// Pid the slave reports for itself.
        pid: Pid,
        /// Wire connection handle the handshake arrived on.
        rpc_handle: i32,
    },
    /// A slave process exited cleanly.
    Exited { pid: Pid },
    /// A slave process died abnormally.
    Faulted { pid: Pid },
    /// Reply to a pause request; `None` when the request itself failed.
    PauseAck { pid: Pid, status: Option<i32> },
    /// Reply to a resume request; `None` when the request itself failed.
    ResumeAck { pid: Pid, status: Option<i32> },
    /// The display monitor reports the system went to the background.
    DisplayPaused,
    /// The display monitor reports the system came back.
    DisplayResumed,
    /// A slave announced entry into a plugin function.
    PluginCall {
        pid: Pid,
        package: String,
        filename: String,
        function: String,
    },
    /// A slave announced return from a plugin function.
    PluginReturn {
        pid: Pid,
        package: String,
        filename: String,
        function: String,
    },
}

/// Cloneable handle for feeding [`Notice`]s into the loop.
#[derive(Debug, Clone)]
pub struct NoticeSender(mpsc::UnboundedSender<Notice>);

impl NoticeSender {
    /// Enqueues a notice; returns `false` when the loop is gone.
    pub fn send(&self, notice: Notice) -> bool {
        self.0.send(notice).is_ok()
    }
}

/// Owns the supervisor and applies notices and timer fires serially.
pub struct Mainloop {
    sup: Supervisor,
    rx: mpsc::UnboundedReceiver<Notice>,
    shutdown: CancellationToken,
}

impl Mainloop {
    /// Wraps a supervisor; returns the loop and the notice handle.
    pub fn new(sup: Supervisor) -> (Self, NoticeSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                sup,
                rx,
                shutdown: CancellationToken::new(),
            },
            NoticeSender(tx),
        )
    }

    /// Token that stops the loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Read access for tests and status surfaces before the loop starts.
    pub fn supervisor(&self) -> &Supervisor {
        &self.sup
    }

    /// Runs until shutdown, handing the supervisor back for teardown.
    pub async fn run(mut self) -> Supervisor {
        loop {
            self.sup.advance(Instant::now());
            let deadline = self.sup.next_deadline();

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                notice = self.rx.recv() => match notice {
                    Some(notice) => self.dispatch(notice),
                    None => break,
                },
                _ = sleep_until_or_forever(deadline) => {}
            }
        }
        self.sup
    }

    fn dispatch(&mut self, notice: Notice) {
        match notice {
            Notice::Hello {
                name,
                pid,
                rpc_handle,
            } => {
                let Some(id) = self.sup.registry().find_by_name(&name) else {
                    warn!("hello from unknown slave {name} (pid {pid})");
                    return;
                };
                let _ = self.sup.set_pid(id, pid);
                let _ = self.sup.set_rpc_handle(id, rpc_handle);
                if let Err(err) = self.sup.on_hello(id) {
                    warn!("handshake for {name} failed: {err}");
                }
            }
            Notice::Exited { pid } => match self.sup.registry().find_by_pid(pid) {
                Some(id) => {
                    let _ = self.sup.on_exit(id);
                }
                None => debug!("exit notice for unknown pid {pid}"),
            },
            Notice::Faulted { pid } => match self.sup.registry().find_by_pid(pid) {
                Some(id) => {
                    let _ = self.sup.on_fault_exit(id);
                }
                None => debug!("fault notice for unknown pid {pid}"),
            },
            Notice::PauseAck { pid, status } => {
                if let Some(id) = self.sup.registry().find_by_pid(pid) {
                    self.sup.on_pause_ack(id, status);
                }
            }
            Notice::ResumeAck { pid, status } => {
                if let Some(id) = self.sup.registry().find_by_pid(pid) {
                    self.sup.on_resume_ack(id, status);
                }
            }
            Notice::DisplayPaused => self.sup.on_display_paused(),
            Notice::DisplayResumed => self.sup.on_display_resumed(),
            Notice::PluginCall {
                pid,
                package,
                filename,
                function,
            } => {
                if let Some(id) = self.sup.registry().find_by_pid(pid) {
                    let _ = self.sup.plugin_call(id, &package, &filename, &function);
                }
            }
            Notice::PluginReturn {
                pid,
                package,
                filename,
                function,
            } => {
                if let Some(id) = self.sup.registry().find_by_pid(pid) {
                    if let Err(err) = self.sup.plugin_return(id, &package, &filename, &function) {
                        debug!("unmatched plugin return from pid {pid}: {err}");
                    }
                }
            }
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

/// Completes when the process receives a termination signal.
///
/// On Unix this covers SIGINT, SIGTERM, and SIGQUIT, with
/// [`tokio::signal::ctrl_c`] as a fallback; elsewhere only Ctrl-C is
/// awaited.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Completes when the process receives a termination signal.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::Error;
    use crate::launcher::{LaunchBundle, LaunchError, Launched, Launcher};
    use crate::packages::MemoryPackages;
    use crate::rpc::{LogLink, LogSink};
    use crate::slave::SlaveState;
    use std::time::Duration;

    struct StaticLauncher;

    impl Launcher for StaticLauncher {
        fn launch(&mut self, _target: &str, _bundle: &LaunchBundle) -> Result<Launched, LaunchError> {
            Ok(Launched {
                pid: Pid(500),
                local: false,
            })
        }

        fn terminate(&mut self, _pid: Pid) -> Result<(), Error> {
            Ok(())
        }
    }

    fn supervisor() -> Supervisor {
        let mut cfg = Config::default();
        cfg.log_path = std::env::temp_dir().join("boxvisor-runtime-none");
        Supervisor::new(
            cfg,
            Box::new(StaticLauncher),
            Box::new(LogLink),
            Box::new(LogSink),
            Box::new(MemoryPackages::new()),
        )
    }

    #[tokio::test(flavor = "current_thread")]
    async fn loop_applies_notices_and_stops_on_cancel() {
        let mut sup = supervisor();
        let id = sup.create("s1", false, "c", "libexe-w", false);
        sup.activate(id).unwrap();

        let (mainloop, tx) = Mainloop::new(sup);
        let token = mainloop.shutdown_token();

        let local = tokio::task::LocalSet::new();
        let sup = local
            .run_until(async move {
                let handle = tokio::task::spawn_local(mainloop.run());

                assert!(tx.send(Notice::Hello {
                    name: "s1".into(),
                    pid: Pid(500),
                    rpc_handle: 9,
                }));
                // Let the loop drain the channel before stopping it.
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel();
                handle.await.expect("loop task panicked")
            })
            .await;

        let id = sup.registry().find_by_pid(Pid(500)).expect("slave resolved");
        assert_eq!(sup.registry().get(id).unwrap().state(), SlaveState::Resumed);
        assert_eq!(sup.registry().find_by_rpc_handle(9), Some(id));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn loop_fires_due_timers() {
        let mut cfg = Config::default();
        cfg.activate_time = Duration::from_millis(30);
        cfg.log_path = std::env::temp_dir().join("boxvisor-runtime-none");
        let mut sup = Supervisor::new(
            cfg,
            Box::new(StaticLauncher),
            Box::new(LogLink),
            Box::new(LogSink),
            Box::new(MemoryPackages::new()),
        );
        let id = sup.create("s1", false, "c", "libexe-w", false);
        sup.activate(id).unwrap();

        let (mainloop, _tx) = Mainloop::new(sup);
        let token = mainloop.shutdown_token();

        let local = tokio::task::LocalSet::new();
        let sup = local
            .run_until(async move {
                let handle = tokio::task::spawn_local(mainloop.run());
                // The handshake never arrives; the timeout fires inside the
                // loop and tears the instanceless record down.
                tokio::time::sleep(Duration::from_millis(80)).await;
                token.cancel();
                handle.await.expect("loop task panicked")
            })
            .await;

        assert!(sup.registry().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unknown_pids_are_ignored() {
        let (mainloop, tx) = Mainloop::new(supervisor());
        let token = mainloop.shutdown_token();

        let local = tokio::task::LocalSet::new();
        let sup = local
            .run_until(async move {
                let handle = tokio::task::spawn_local(mainloop.run());
                assert!(tx.send(Notice::Exited { pid: Pid(12345) }));
                assert!(tx.send(Notice::Faulted { pid: Pid(12345) }));
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel();
                handle.await.expect("loop task panicked")
            })
            .await;

        assert!(sup.registry().is_empty());
    }
}
