//! # boxvisor
//!
//! **Boxvisor** is the supervisory core of a content-provider master
//! daemon: it launches, tracks, and reaps the short-lived worker processes
//! ("slaves") that host third-party content-renderer packages, and
//! attributes their crashes back to the package at fault.
//!
//! ## Features
//!
//! | Area            | Description                                                        | Key types / traits                        |
//! |-----------------|--------------------------------------------------------------------|-------------------------------------------|
//! | **Supervision** | Per-slave state machine: launch, handshake, pause/resume, TTL.     | [`Supervisor`], [`SlaveState`]            |
//! | **Registry**    | Directory of slave records with policy-driven reuse selection.     | [`Registry`], [`SlaveId`]                 |
//! | **Faults**      | Shadow call stack and crash-log attribution, broadcast to clients. | [`FaultManager`], [`Attribution`]         |
//! | **Timers**      | Monotonic deadline scheduler with freeze/thaw and drift control.   | [`TimerService`], [`TimerId`]             |
//! | **Hooks**       | Per-event observer callbacks with votes and self-removal.          | [`SlaveEvent`], [`HookVerdict`]           |
//! | **Seams**       | Launcher, wire link, fault broadcast, and package store traits.    | [`Launcher`], [`SlaveLink`], [`FaultSink`] |
//! | **Runtime**     | Current-thread event loop feeding notices into the core.           | [`Mainloop`], [`Notice`]                  |
//!
//! ```no_run
//! use boxvisor::{
//!     Config, LogLink, LogSink, Mainloop, MemoryPackages, Notice, Pid, Supervisor,
//! };
//! # #[cfg(unix)]
//! use boxvisor::CommandLauncher;
//!
//! # #[cfg(unix)]
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = Config::default();
//!     let mut sup = Supervisor::new(
//!         cfg,
//!         Box::new(CommandLauncher::new()),
//!         Box::new(LogLink),
//!         Box::new(LogSink),
//!         Box::new(MemoryPackages::new()),
//!     );
//!
//!     // Ask for a secured worker and start it.
//!     let slave = sup.create("renderer-0", true, "c", "/usr/bin/render-slave", false);
//!     sup.activate(slave)?;
//!
//!     let (mainloop, notices) = Mainloop::new(sup);
//!     let shutdown = mainloop.shutdown_token();
//!
//!     // Somewhere, a wire server feeds handshakes and exits:
//!     notices.send(Notice::Hello { name: "renderer-0".into(), pid: Pid(100), rpc_handle: 1 });
//!
//!     tokio::task::LocalSet::new()
//!         .run_until(async move {
//!             let loop_task = tokio::task::spawn_local(mainloop.run());
//!             boxvisor::wait_for_shutdown_signal().await?;
//!             shutdown.cancel();
//!             loop_task.await?;
//!             Ok(())
//!         })
//!         .await
//! }
//! # #[cfg(not(unix))]
//! # fn main() {}
//! ```
//!
//! ---

pub mod config;
pub mod error;
pub mod fault;
pub mod launcher;
pub mod packages;
pub mod registry;
pub mod rpc;
pub mod runtime;
pub mod slave;
pub mod supervisor;
pub mod timer;

// ---- Public re-exports ----

pub use config::Config;
pub use error::Error;
pub use fault::{Attribution, FaultCall, FaultManager};
#[cfg(unix)]
pub use launcher::CommandLauncher;
pub use launcher::{LaunchBundle, LaunchError, Launched, Launcher};
pub use packages::{FaultRecord, MemoryPackages, PackageStore};
pub use registry::Registry;
pub use rpc::{FaultSink, LogLink, LogSink, SlaveLink};
pub use runtime::{wait_for_shutdown_signal, Mainloop, Notice, NoticeSender};
pub use slave::{
    HookId, HookVerdict, Pid, SlaveEvent, SlaveFate, SlaveHook, SlaveId, SlaveNode, SlaveState,
    SlaveView,
};
pub use supervisor::Supervisor;
pub use timer::{wall_timestamp, Expired, TimerId, TimerService};
