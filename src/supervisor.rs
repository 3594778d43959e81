//! # The per-slave state machine.
//!
//! The [`Supervisor`] drives every slave from launch request through the
//! activation handshake, pause/resume cycles, TTL expiry, and termination,
//! and decides when a dead slave comes back.
//!
//! ```text
//!  Terminated ─launch─▶ RequestedLaunch ─hello─▶ Resumed
//!                     │                       │
//!                     └─activate_timeout──────┤
//!                                             ├─pause_req──▶ RequestedPause ─ack──▶ Paused
//!                                             ├─resume_req─▶ RequestedResume ─ack─▶ Resumed
//!                                             ├─ttl_expiry──┐
//!                                             ├─no_instances┤
//!                                             ├─exit_notice─┤
//!                                             └─fault───────┴─▶ RequestedTerminate ─exit─▶ Terminated
//! ```
//!
//! ## Rules
//! - Everything runs on the main loop; no operation here is reentered by
//!   another thread. Reentrancy comes only from hooks, and every sweep
//!   revalidates the [`SlaveId`] after each hook.
//! - A timer callback clears its handle field in the record before taking
//!   any action that could cascade into another timer or a destruction, and
//!   a popped timer whose handle no longer matches the record is stale and
//!   is dropped.
//! - Operations that can tear the record down return [`SlaveFate`] so the
//!   caller knows whether the id still resolves.

use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::config::Config;
use crate::error::Error;
use crate::fault::FaultManager;
use crate::launcher::{LaunchBundle, Launcher};
use crate::packages::PackageStore;
use crate::registry::Registry;
use crate::rpc::{FaultSink, SlaveLink};
use crate::slave::{
    HookEntry, HookId, HookVerdict, Pid, SlaveEvent, SlaveFate, SlaveHook, SlaveId, SlaveNode,
    SlaveState,
};
use crate::timer::{wall_timestamp, Expired, TimerService};

/// Which per-slave timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// TTL of a secured slave: cycle it to reclaim resources.
    Ttl,
    /// The activation handshake did not arrive in time.
    Activate,
    /// Retry a launch that failed with a retryable status.
    Relaunch,
}

#[derive(Debug, Clone, Copy)]
struct TimerEvent {
    slave: SlaveId,
    kind: TimerKind,
}

/// Supervises slave records: launch, handshake, pause/resume, TTL cycling,
/// fault-driven teardown, and reactivation policy.
pub struct Supervisor {
    cfg: Config,
    reg: Registry,
    timers: TimerService<TimerEvent>,
    faults: FaultManager,
    launcher: Box<dyn Launcher>,
    link: Box<dyn SlaveLink>,
    sink: Box<dyn FaultSink>,
    packages: Box<dyn PackageStore>,
    /// Nested quiesce scopes; only the outermost pair acts.
    quiesce_depth: u32,
    /// Last display-monitor notification.
    display_paused: bool,
    /// Instant adopted from the event loop by [`Supervisor::advance`].
    now: Instant,
    next_hook_id: u64,
}

impl Supervisor {
    /// Creates a supervisor over the given collaborator seams.
    pub fn new(
        cfg: Config,
        launcher: Box<dyn Launcher>,
        link: Box<dyn SlaveLink>,
        sink: Box<dyn FaultSink>,
        packages: Box<dyn PackageStore>,
    ) -> Self {
        let faults = FaultManager::new(cfg.log_path.clone());
        Self {
            cfg,
            reg: Registry::new(),
            timers: TimerService::new(),
            faults,
            launcher,
            link,
            sink,
            packages,
            quiesce_depth: 0,
            display_paused: false,
            now: Instant::now(),
            next_hook_id: 0,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn registry(&self) -> &Registry {
        &self.reg
    }

    pub fn faults(&self) -> &FaultManager {
        &self.faults
    }

    /// The instant last adopted from the event loop.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Earliest timer deadline, for the loop's sleep.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// True while at least one quiesce scope is open.
    pub fn quiesced(&self) -> bool {
        self.quiesce_depth > 0
    }

    // ---- Record management ----

    /// Finds or creates the record for `name`.
    ///
    /// Idempotent on the name; an existing record is returned as-is, with a
    /// report when its isolation flag disagrees with the request.
    pub fn create(
        &mut self,
        name: &str,
        secured: bool,
        abi: &str,
        package: &str,
        network: bool,
    ) -> SlaveId {
        if let Some(existing) = self.reg.find_by_name(name) {
            if let Some(node) = self.reg.get(existing) {
                if node.is_secured() != secured {
                    error!("slave {name} exists with a different isolation flag");
                }
            }
            return existing;
        }

        let node = SlaveNode::new(name, secured, abi, package, network, self.cfg.relaunch_count);
        let id = self.reg.insert(node);
        // The registry's own strong reference.
        self.ref_slave(id);
        debug!("slave {name} created as {id}");
        id
    }

    /// Takes a strong reference on the record.
    pub fn ref_slave(&mut self, id: SlaveId) {
        if let Some(node) = self.reg.get_mut(id) {
            node.refcount += 1;
        }
    }

    /// Drops a strong reference; the last one (with no live pid) destroys
    /// the record after its delete hooks ran.
    pub fn unref_slave(&mut self, id: SlaveId) -> SlaveFate {
        let Some(node) = self.reg.get_mut(id) else {
            return SlaveFate::Destroyed;
        };
        if node.refcount == 0 {
            error!("slave {} refcount is not valid", node.name());
            return SlaveFate::Alive;
        }
        node.refcount -= 1;
        if node.refcount == 0 {
            return self.destroy(id);
        }
        SlaveFate::Alive
    }

    fn destroy(&mut self, id: SlaveId) -> SlaveFate {
        {
            let Some(node) = self.reg.get_mut(id) else {
                return SlaveFate::Destroyed;
            };
            if node.pid.is_some() {
                error!("slave {} is not deactivated; destruction refused", node.name());
                return SlaveFate::Alive;
            }
            if node.dying {
                return SlaveFate::Alive;
            }
            node.dying = true;
        }

        self.invoke_hooks(id, SlaveEvent::Delete);

        let Some(node) = self.reg.get_mut(id) else {
            return SlaveFate::Destroyed;
        };
        for timer in [
            node.ttl_timer.take(),
            node.activate_timer.take(),
            node.relaunch_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.timers.cancel(timer);
        }
        node.clear_hooks();
        node.clear_data();
        debug!("slave {} destroyed", node.name());
        self.reg.remove(id);
        SlaveFate::Destroyed
    }

    // ---- Hooks ----

    /// Registers a hook for `event`; the newest registration runs first.
    pub fn add_hook(
        &mut self,
        id: SlaveId,
        event: SlaveEvent,
        hook: SlaveHook,
    ) -> Result<HookId, Error> {
        let node = self.reg.get_mut(id).ok_or(Error::NotExist)?;
        self.next_hook_id += 1;
        let hook_id = HookId(self.next_hook_id);
        node.add_hook(event, hook_id, hook);
        Ok(hook_id)
    }

    /// Unregisters a hook.
    pub fn remove_hook(&mut self, id: SlaveId, event: SlaveEvent, hook: HookId) -> Result<(), Error> {
        let node = self.reg.get_mut(id).ok_or(Error::NotExist)?;
        if node.remove_hook(event, hook) {
            Ok(())
        } else {
            Err(Error::NotExist)
        }
    }

    /// Sweeps the hook list for `event`, returning the reactivation votes.
    ///
    /// The list is detached for the sweep: hooks added meanwhile wait for
    /// the next sweep, a hook returning [`HookVerdict::Remove`] is dropped
    /// after its own invocation, and the sweep stops as soon as a hook tears
    /// the record down.
    fn invoke_hooks(&mut self, id: SlaveId, event: SlaveEvent) -> usize {
        let Some(node) = self.reg.get_mut(id) else {
            return 0;
        };
        let list = node.take_hooks(event);
        let mut kept: Vec<HookEntry> = Vec::with_capacity(list.len());
        let mut votes = 0;

        for mut entry in list {
            let verdict = (entry.hook)(self, id);
            match verdict {
                HookVerdict::Remove => {}
                HookVerdict::Reactivate => {
                    votes += 1;
                    kept.push(entry);
                }
                HookVerdict::Keep => kept.push(entry),
            }
            if !self.reg.contains(id) {
                return votes;
            }
        }

        if let Some(node) = self.reg.get_mut(id) {
            node.restore_hooks(event, kept);
        }
        votes
    }

    // ---- Launch and activation ----

    /// Requests a launch for the slave.
    ///
    /// Idempotent: a record that already owns a pid, or that is already
    /// waiting on the launcher, reports [`Error::Already`], re-arming the
    /// reactivation flag when the record is on its way down, so the next
    /// exit notice brings it back.
    pub fn activate(&mut self, id: SlaveId) -> Result<(), Error> {
        {
            let node = self.reg.get_mut(id).ok_or(Error::NotExist)?;
            if node.pid.is_some() {
                if node.state == SlaveState::RequestedTerminate {
                    node.reactivate_slave = true;
                }
                return Err(Error::Already);
            }
            if node.state == SlaveState::RequestedLaunch {
                debug!("slave {} launch already requested", node.name());
                return Err(Error::Already);
            }
        }

        if self.cfg.debug_mode {
            let node = self.reg.get(id).ok_or(Error::NotExist)?;
            debug!(
                "debug mode: waiting for external launch of {} (secured {}, abi {})",
                node.name(),
                node.is_secured(),
                node.abi()
            );
        } else {
            let (target, bundle) = {
                let node = self.reg.get_mut(id).ok_or(Error::NotExist)?;
                node.relaunch_count = self.cfg.relaunch_count;
                (
                    node.package.clone(),
                    LaunchBundle {
                        name: node.name.clone(),
                        secured: node.secured,
                        abi: node.abi.clone(),
                    },
                )
            };

            match self.launcher.launch(&target, &bundle) {
                Ok(launched) => {
                    debug!("slave {target} launched with pid {}", launched.pid);
                    if let Some(node) = self.reg.get_mut(id) {
                        node.pid = Some(launched.pid);
                    }
                }
                Err(err) if err.is_retryable() => {
                    warn!("retryable launch failure for {target} ({}); will retry", err.as_label());
                    let timer = self.timers.add(
                        self.now,
                        self.cfg.relaunch_time,
                        TimerEvent {
                            slave: id,
                            kind: TimerKind::Relaunch,
                        },
                    );
                    if let Some(node) = self.reg.get_mut(id) {
                        node.relaunch_timer = Some(timer);
                    }
                }
                Err(err) => {
                    error!("failed to launch a new slave {target}: {err}");
                    self.fault_handler(id);
                    return Err(Error::fault(err.to_string()));
                }
            }

            let timer = self.timers.add(
                self.now,
                self.cfg.activate_time,
                TimerEvent {
                    slave: id,
                    kind: TimerKind::Activate,
                },
            );
            if let Some(node) = self.reg.get_mut(id) {
                node.activate_timer = Some(timer);
            }
        }

        {
            let node = self.reg.get_mut(id).ok_or(Error::NotExist)?;
            node.state = SlaveState::RequestedLaunch;
        }
        // Hold the record across the launch sequence so it cannot be
        // orphaned before the handshake settles it.
        self.ref_slave(id);
        Ok(())
    }

    /// Completes the activation handshake after the slave's hello arrived.
    pub fn on_hello(&mut self, id: SlaveId) -> Result<(), Error> {
        {
            let node = self.reg.get_mut(id).ok_or(Error::NotExist)?;
            node.state = SlaveState::Resumed;
        }

        if self.display_paused {
            let _ = self.pause(id);
        }

        {
            let node = self.reg.get_mut(id).ok_or(Error::NotExist)?;
            if node.secured {
                debug!("ttl timer armed for {} ({:?})", node.name, self.cfg.ttl);
                let timer = self.timers.add(
                    self.now,
                    self.cfg.ttl,
                    TimerEvent {
                        slave: id,
                        kind: TimerKind::Ttl,
                    },
                );
                node.ttl_timer = Some(timer);
            }
        }

        self.invoke_hooks(id, SlaveEvent::Activate);

        let now = self.now;
        let node = self.reg.get_mut(id).ok_or(Error::NotExist)?;
        node.reactivate_slave = false;
        node.reactivate_instances = false;
        node.activated_at = Some(now);
        for timer in [node.activate_timer.take(), node.relaunch_timer.take()]
            .into_iter()
            .flatten()
        {
            self.timers.cancel(timer);
        }
        Ok(())
    }

    /// Counts a fault, sweeps the fault hooks, disables auto-restart, and
    /// force-terminates any candidate pid.
    fn fault_handler(&mut self, id: SlaveId) {
        {
            let Some(node) = self.reg.get_mut(id) else {
                return;
            };
            node.fault_count += 1;
        }
        self.invoke_hooks(id, SlaveEvent::Fault);

        let pid = {
            let Some(node) = self.reg.get_mut(id) else {
                return;
            };
            node.reactivate_slave = false;
            node.reactivate_instances = false;
            node.pid.filter(|pid| pid.0 > 0)
        };

        if let Some(pid) = pid {
            debug!("try to terminate pid {pid}");
            if let Err(err) = self.launcher.terminate(pid) {
                error!("terminate failed for pid {pid}: {err}");
            }
        }
    }

    // ---- Deactivation ----

    /// Sends the terminate signal and marks the record as on its way down.
    pub fn deactivate(&mut self, id: SlaveId) -> SlaveFate {
        {
            let Some(node) = self.reg.get_mut(id) else {
                return SlaveFate::Destroyed;
            };
            if !node.is_active() {
                warn!("slave {} is already deactivated", node.name());
                if node.loaded_instance == 0 {
                    return self.unref_slave(id);
                }
                return SlaveFate::Alive;
            }
            node.state = SlaveState::RequestedTerminate;
        }

        let pid = self.reg.get(id).and_then(|node| node.pid).filter(|pid| pid.0 > 0);
        if let Some(pid) = pid {
            debug!("terminate slave pid {pid}");
            if let Err(err) = self.launcher.terminate(pid) {
                error!("terminate slave failed, pid {pid}: {err}");
                return self.on_exit(id);
            }
        }
        SlaveFate::Alive
    }

    /// Settles the record after the process-exit notice.
    ///
    /// Clears the pid and all timers, sweeps the deactivate hooks counting
    /// reactivation votes, drops the launch-sequence reference, and then
    /// either relaunches (votes plus the record's own flag) or lets an
    /// instanceless record go.
    pub fn on_exit(&mut self, id: SlaveId) -> SlaveFate {
        {
            let Some(node) = self.reg.get_mut(id) else {
                return SlaveFate::Destroyed;
            };
            node.pid = None;
            node.state = SlaveState::Terminated;
            for timer in [
                node.ttl_timer.take(),
                node.activate_timer.take(),
                node.relaunch_timer.take(),
            ]
            .into_iter()
            .flatten()
            {
                self.timers.cancel(timer);
            }
        }

        let votes = self.invoke_hooks(id, SlaveEvent::Deactivate);

        if self.unref_slave(id) == SlaveFate::Destroyed {
            debug!("slave record destroyed on exit");
            return SlaveFate::Destroyed;
        }

        let (reactivate, loaded_instance) = {
            let Some(node) = self.reg.get(id) else {
                return SlaveFate::Destroyed;
            };
            (node.reactivate_slave, node.loaded_instance)
        };

        if votes > 0 && reactivate {
            debug!("need to reactivate the slave");
            match self.activate(id) {
                Ok(()) | Err(Error::Already) => {}
                Err(err) => error!("failed to reactivate the slave: {err}"),
            }
        } else if loaded_instance == 0 {
            // No instances left: nothing will ask for this record again.
            return self.unref_slave(id);
        }

        if self.reg.contains(id) {
            SlaveFate::Alive
        } else {
            SlaveFate::Destroyed
        }
    }

    /// Settles a slave that died abnormally: attribution, pid termination,
    /// and the fast-crash reactivation policy.
    pub fn on_fault_exit(&mut self, id: SlaveId) -> SlaveFate {
        {
            let Some(node) = self.reg.get(id) else {
                return SlaveFate::Destroyed;
            };
            if !node.is_active() {
                debug!("deactivation already in progress");
                if node.loaded_instance == 0 {
                    return self.unref_slave(id);
                }
                return SlaveFate::Alive;
            }
        }

        {
            let node = self.reg.get_mut(id).expect("checked above");
            node.fault_count += 1;
        }

        {
            let view = self.reg.get(id).expect("checked above").view(id);
            let _ = self
                .faults
                .check_slave(&view, &mut *self.packages, &mut *self.sink);
        }

        let pid = self.reg.get(id).and_then(|node| node.pid).filter(|pid| pid.0 > 0);
        if let Some(pid) = pid {
            debug!("try to terminate pid {pid}");
            if let Err(err) = self.launcher.terminate(pid) {
                error!("terminate failed, pid {pid}: {err}");
            }
        }

        let mut reactivate = true;
        let mut reactivate_instances = true;
        let now = self.now;
        let minimum = self.cfg.minimum_reactivation_time;
        let max_load = self.cfg.max_load;

        let tripped = {
            let Some(node) = self.reg.get_mut(id) else {
                return SlaveFate::Destroyed;
            };
            let fast = node
                .activated_at
                .map(|at| now.saturating_duration_since(at) < minimum)
                .unwrap_or(false);
            if fast {
                node.critical_fault_count += 1;
                if node.loaded_instance == 0 || node.critical_fault_count >= max_load {
                    error!(
                        "slave {} crashes too fast and too often; auto reactivation stops",
                        node.name()
                    );
                    reactivate = false;
                    reactivate_instances = false;
                    node.critical_fault_count = 0;
                    true
                } else {
                    false
                }
            } else {
                node.critical_fault_count = 0;
                false
            }
        };

        if tripped {
            // Fault hooks may still access the record.
            self.invoke_hooks(id, SlaveEvent::Fault);
            if !self.reg.contains(id) {
                return SlaveFate::Destroyed;
            }
        }

        {
            let Some(node) = self.reg.get_mut(id) else {
                return SlaveFate::Destroyed;
            };
            node.reactivate_slave = reactivate;
            node.reactivate_instances = reactivate_instances;
        }

        self.on_exit(id)
    }

    // ---- Pause / resume ----

    /// Requests a pause. Idempotent while paused or pausing; invalid for
    /// launching, terminating, and terminated slaves.
    pub fn pause(&mut self, id: SlaveId) -> Result<(), Error> {
        {
            let node = self.reg.get(id).ok_or(Error::NotExist)?;
            match node.state {
                SlaveState::RequestedLaunch
                | SlaveState::RequestedTerminate
                | SlaveState::Terminated => return Err(Error::Invalid),
                SlaveState::Paused | SlaveState::RequestedPause => return Ok(()),
                _ => {}
            }
        }

        let timestamp = wall_timestamp();
        if let Some(node) = self.reg.get_mut(id) {
            node.state = SlaveState::RequestedPause;
        }
        let view = self.reg.get(id).ok_or(Error::NotExist)?.view(id);
        self.link.send_pause(&view, timestamp)
    }

    /// Requests a resume. Idempotent while resumed or resuming; invalid for
    /// launching, terminating, and terminated slaves.
    pub fn resume(&mut self, id: SlaveId) -> Result<(), Error> {
        {
            let node = self.reg.get(id).ok_or(Error::NotExist)?;
            match node.state {
                SlaveState::RequestedLaunch
                | SlaveState::RequestedTerminate
                | SlaveState::Terminated => return Err(Error::Invalid),
                SlaveState::Resumed | SlaveState::RequestedResume => return Ok(()),
                _ => {}
            }
        }

        let timestamp = wall_timestamp();
        if let Some(node) = self.reg.get_mut(id) {
            node.state = SlaveState::RequestedResume;
        }
        let view = self.reg.get(id).ok_or(Error::NotExist)?.view(id);
        self.link.send_resume(&view, timestamp)
    }

    /// Applies the slave's reply to a pause request. `None` means the
    /// request itself failed and the previous state is restored.
    pub fn on_pause_ack(&mut self, id: SlaveId, status: Option<i32>) {
        {
            let Some(node) = self.reg.get_mut(id) else {
                return;
            };
            if node.state == SlaveState::RequestedTerminate {
                debug!("slave is terminating; pause result ignored");
                return;
            }
            match status {
                None => {
                    error!("failed to pause slave {}", node.name());
                    node.state = SlaveState::Resumed;
                    return;
                }
                Some(0) => {
                    node.state = SlaveState::Paused;
                }
                Some(status) => {
                    warn!("pause rejected by {} with status {status}", node.name());
                    return;
                }
            }
        }

        let view = self.reg.get(id).expect("still present").view(id);
        self.link.ping_freeze(&view);
        self.invoke_hooks(id, SlaveEvent::Pause);
    }

    /// Applies the slave's reply to a resume request. `None` means the
    /// request itself failed and the previous state is restored.
    pub fn on_resume_ack(&mut self, id: SlaveId, status: Option<i32>) {
        {
            let Some(node) = self.reg.get_mut(id) else {
                return;
            };
            if node.state == SlaveState::RequestedTerminate {
                debug!("slave is terminating; resume result ignored");
                return;
            }
            match status {
                None => {
                    error!("failed to resume slave {}", node.name());
                    node.state = SlaveState::Paused;
                    return;
                }
                Some(0) => {
                    node.state = SlaveState::Resumed;
                }
                Some(status) => {
                    warn!("resume rejected by {} with status {status}", node.name());
                    return;
                }
            }
        }

        let view = self.reg.get(id).expect("still present").view(id);
        self.link.ping_thaw(&view);
        self.invoke_hooks(id, SlaveEvent::Resume);
    }

    // ---- TTL ----

    /// Tops the TTL back up to its full value. Secured slaves only.
    pub fn extend_ttl(&mut self, id: SlaveId) -> Result<(), Error> {
        let node = self.reg.get(id).ok_or(Error::NotExist)?;
        if !node.secured {
            return Err(Error::Invalid);
        }
        let timer = node.ttl_timer.ok_or(Error::Invalid)?;
        let pending = self.timers.pending(timer, self.now).unwrap_or_default();
        self.timers.delay(timer, self.cfg.ttl.saturating_sub(pending));
        Ok(())
    }

    /// Suspends the TTL countdown without losing the remaining time.
    pub fn freeze_ttl(&mut self, id: SlaveId) -> Result<(), Error> {
        let node = self.reg.get(id).ok_or(Error::NotExist)?;
        if !node.secured {
            return Err(Error::Invalid);
        }
        let timer = node.ttl_timer.ok_or(Error::Invalid)?;
        self.timers.freeze(timer, self.now);
        Ok(())
    }

    /// Resumes the TTL countdown and tops it back up to the full value.
    pub fn thaw_ttl(&mut self, id: SlaveId) -> Result<(), Error> {
        let node = self.reg.get(id).ok_or(Error::NotExist)?;
        if !node.secured {
            return Err(Error::Invalid);
        }
        let timer = node.ttl_timer.ok_or(Error::Invalid)?;
        self.timers.thaw(timer, self.now);
        let pending = self.timers.pending(timer, self.now).unwrap_or_default();
        self.timers.delay(timer, self.cfg.ttl.saturating_sub(pending));
        Ok(())
    }

    /// Remaining TTL, when armed.
    pub fn ttl_remaining(&self, id: SlaveId) -> Option<Duration> {
        let timer = self.reg.get(id)?.ttl_timer?;
        self.timers.pending(timer, self.now)
    }

    /// Whether a TTL timer exists on the record. This does not mean the TTL
    /// has elapsed; see [`Supervisor::ttl_remaining`] for that.
    pub fn ttl_armed(&self, id: SlaveId) -> bool {
        self.reg
            .get(id)
            .map(|node| node.is_secured() && node.ttl_timer.is_some())
            .unwrap_or(false)
    }

    // ---- Load bookkeeping ----

    /// Counts a package assignment onto the slave.
    pub fn load_package(&mut self, id: SlaveId) -> Result<(), Error> {
        let node = self.reg.get_mut(id).ok_or(Error::NotExist)?;
        node.loaded_package += 1;
        Ok(())
    }

    /// Removes a package assignment.
    pub fn unload_package(&mut self, id: SlaveId) -> Result<(), Error> {
        let node = self.reg.get_mut(id).ok_or(Error::NotExist)?;
        if node.loaded_package == 0 {
            error!("slave {} loaded package is not correct", node.name());
            return Err(Error::Invalid);
        }
        node.loaded_package -= 1;
        Ok(())
    }

    /// Counts a live content instance onto the slave.
    pub fn load_instance(&mut self, id: SlaveId) -> Result<(), Error> {
        let node = self.reg.get_mut(id).ok_or(Error::NotExist)?;
        node.loaded_instance += 1;
        debug!("instance: ({:?}) {}", node.pid, node.loaded_instance);
        Ok(())
    }

    /// Removes a live content instance; an active slave left with none is
    /// deactivated with its reactivation flags cleared.
    pub fn unload_instance(&mut self, id: SlaveId) -> SlaveFate {
        {
            let Some(node) = self.reg.get_mut(id) else {
                return SlaveFate::Destroyed;
            };
            if node.loaded_instance == 0 {
                error!("slave {} loaded instance is not correct", node.name());
                return SlaveFate::Alive;
            }
            node.loaded_instance -= 1;
            debug!("instance: ({:?}) {}", node.pid, node.loaded_instance);
            if node.loaded_instance != 0 || !node.is_active() {
                return SlaveFate::Alive;
            }
            node.reactivate_slave = false;
            node.reactivate_instances = false;
        }
        self.deactivate(id)
    }

    // ---- Flags and identity feed ----

    pub fn set_reactivation(&mut self, id: SlaveId, flag: bool) {
        if let Some(node) = self.reg.get_mut(id) {
            node.reactivate_slave = flag;
        }
    }

    pub fn set_reactivate_instances(&mut self, id: SlaveId, flag: bool) {
        if let Some(node) = self.reg.get_mut(id) {
            node.reactivate_instances = flag;
        }
    }

    /// Adopts the pid reported by an externally launched slave.
    pub fn set_pid(&mut self, id: SlaveId, pid: Pid) -> Result<(), Error> {
        let node = self.reg.get_mut(id).ok_or(Error::NotExist)?;
        debug!("slave pid is updated to {pid} from {:?}", node.pid);
        node.pid = Some(pid);
        Ok(())
    }

    /// Binds the wire connection handle used by [`Registry::find_by_rpc_handle`].
    pub fn set_rpc_handle(&mut self, id: SlaveId, handle: i32) -> Result<(), Error> {
        let node = self.reg.get_mut(id).ok_or(Error::NotExist)?;
        node.rpc_handle = Some(handle);
        Ok(())
    }

    pub fn set_network(&mut self, id: SlaveId, network: bool) -> Result<(), Error> {
        let node = self.reg.get_mut(id).ok_or(Error::NotExist)?;
        node.network = network;
        Ok(())
    }

    /// Attaches a tagged opaque entry to the record's scratchpad.
    pub fn set_data(
        &mut self,
        id: SlaveId,
        tag: &str,
        data: Box<dyn std::any::Any>,
    ) -> Result<(), Error> {
        let node = self.reg.get_mut(id).ok_or(Error::NotExist)?;
        node.set_data(tag, data);
        Ok(())
    }

    /// Detaches the first scratchpad entry under `tag`.
    pub fn take_data(&mut self, id: SlaveId, tag: &str) -> Option<Box<dyn std::any::Any>> {
        self.reg.get_mut(id)?.take_data(tag)
    }

    // ---- Bulk operations ----

    /// Opens a quiesce scope. Only the first of nested calls deactivates;
    /// returns how many slaves were swept, zero for the inner calls.
    pub fn deactivate_all(&mut self, reactivate: bool, reactivate_instances: bool) -> usize {
        self.quiesce_depth += 1;
        if self.quiesce_depth > 1 {
            return 0;
        }
        debug!("deactivate all");

        let mut count = 0;
        for id in self.reg.ids() {
            if !self.reg.contains(id) {
                continue;
            }
            if let Some(node) = self.reg.get_mut(id) {
                node.reactivate_slave = reactivate;
                node.reactivate_instances = reactivate_instances;
            }
            let _ = self.deactivate(id);
            count += 1;
        }
        count
    }

    /// Closes a quiesce scope. Only the outermost call reactivates; returns
    /// how many slaves were swept, zero for the inner calls.
    pub fn activate_all(&mut self) -> usize {
        self.quiesce_depth = self.quiesce_depth.saturating_sub(1);
        if self.quiesce_depth > 0 {
            return 0;
        }
        debug!("activate all");

        let mut count = 0;
        for id in self.reg.ids() {
            if !self.reg.contains(id) {
                continue;
            }
            match self.activate(id) {
                Ok(()) | Err(Error::Already) => {}
                Err(err) => warn!("activate failed in bulk sweep: {err}"),
            }
            count += 1;
        }
        count
    }

    // ---- Display monitor feed ----

    /// System-wide pause notification: every slave is asked to pause, and
    /// slaves activating from now on pause right after their handshake.
    pub fn on_display_paused(&mut self) {
        self.display_paused = true;
        for id in self.reg.ids() {
            let _ = self.pause(id);
        }
    }

    /// System-wide resume notification.
    pub fn on_display_resumed(&mut self) {
        self.display_paused = false;
        for id in self.reg.ids() {
            let _ = self.resume(id);
        }
    }

    // ---- Fault feed ----

    /// Records entry into a plugin function on this slave.
    pub fn plugin_call(
        &mut self,
        id: SlaveId,
        package: &str,
        filename: &str,
        function: &str,
    ) -> Result<(), Error> {
        if !self.reg.contains(id) {
            return Err(Error::NotExist);
        }
        self.faults.call(id, package, filename, function);
        Ok(())
    }

    /// Records a matched return from a plugin function.
    pub fn plugin_return(
        &mut self,
        id: SlaveId,
        package: &str,
        filename: &str,
        function: &str,
    ) -> Result<(), Error> {
        self.faults.ret(id, package, filename, function)
    }

    /// Explicit fault report from a live slave.
    pub fn report_fault(
        &mut self,
        id: SlaveId,
        package: &str,
        filename: &str,
        function: &str,
    ) -> Result<(), Error> {
        let view = self.reg.get(id).ok_or(Error::NotExist)?.view(id);
        self.faults.mark_set(
            &view,
            package,
            filename,
            function,
            &mut *self.packages,
            &mut *self.sink,
        )
    }

    // ---- Timer dispatch ----

    /// Adopts the loop's instant and dispatches every due timer.
    pub fn advance(&mut self, now: Instant) {
        self.now = now;
        for expired in self.timers.take_due(now) {
            match expired.event.kind {
                TimerKind::Ttl => self.on_ttl_expired(expired),
                TimerKind::Activate => self.on_activate_timeout(expired),
                TimerKind::Relaunch => self.on_relaunch_tick(expired),
            }
        }
    }

    fn on_ttl_expired(&mut self, expired: Expired<TimerEvent>) {
        let id = expired.event.slave;
        {
            let Some(node) = self.reg.get_mut(id) else {
                return;
            };
            if node.ttl_timer != Some(expired.id) {
                return;
            }
            // Cleared before deactivation so fault checks can tell an
            // expired TTL from a crash.
            node.ttl_timer = None;
            node.reactivate_slave = false;
            node.reactivate_instances = true;
        }

        if self.deactivate(id) == SlaveFate::Destroyed {
            debug!("slave destroyed on ttl expiry");
        }
    }

    fn on_activate_timeout(&mut self, expired: Expired<TimerEvent>) {
        let id = expired.event.slave;
        {
            let Some(node) = self.reg.get_mut(id) else {
                return;
            };
            if node.activate_timer != Some(expired.id) {
                return;
            }
            node.activate_timer = None;
            if let Some(timer) = node.relaunch_timer.take() {
                self.timers.cancel(timer);
            }
            node.fault_count += 1;
        }

        self.invoke_hooks(id, SlaveEvent::Fault);
        if !self.reg.contains(id) {
            return;
        }

        let pid = {
            let node = self.reg.get_mut(id).expect("checked above");
            node.reactivate_slave = false;
            node.reactivate_instances = false;
            node.pid.filter(|pid| pid.0 > 0)
        };
        if let Some(pid) = pid {
            debug!("try to terminate pid {pid}");
            if let Err(err) = self.launcher.terminate(pid) {
                error!("terminate failed, pid {pid}: {err}");
            }
        }

        error!(
            "slave is not activated in {:?} ({})",
            self.cfg.activate_time,
            self.reg.get(id).map(|node| node.name().to_string()).unwrap_or_default()
        );
        let _ = self.on_exit(id);
    }

    fn on_relaunch_tick(&mut self, expired: Expired<TimerEvent>) {
        let id = expired.event.slave;
        let (handshake_armed, budget) = {
            let Some(node) = self.reg.get(id) else {
                return;
            };
            if node.relaunch_timer != Some(expired.id) {
                return;
            }
            (node.activate_timer.is_some(), node.relaunch_count)
        };

        if !handshake_armed {
            error!("handshake timeout is not armed; giving up the relaunch");
            self.give_up_launch(id, false);
            return;
        }
        if budget == 0 {
            error!("relaunch budget is exhausted");
            self.give_up_launch(id, true);
            return;
        }

        let (target, bundle) = {
            let Some(node) = self.reg.get(id) else {
                return;
            };
            (
                node.package.clone(),
                LaunchBundle {
                    name: node.name.clone(),
                    secured: node.is_secured(),
                    abi: node.abi.clone(),
                },
            )
        };

        match self.launcher.launch(&target, &bundle) {
            Ok(launched) => {
                debug!("slave {target} launched with pid {} on retry", launched.pid);
                if let Some(node) = self.reg.get_mut(id) {
                    node.pid = Some(launched.pid);
                    node.relaunch_timer = None;
                    if let Some(timer) = node.activate_timer {
                        self.timers.reset(timer, self.now);
                    }
                }
            }
            Err(err) if err.is_retryable() => {
                let remaining = {
                    let Some(node) = self.reg.get_mut(id) else {
                        return;
                    };
                    node.relaunch_count -= 1;
                    node.relaunch_count
                };
                warn!("relaunch of {target} failed again ({}); {remaining} attempts left", err.as_label());

                if remaining == 0 {
                    // The final retryable failure gives up right away
                    // instead of arming another attempt.
                    self.give_up_launch(id, true);
                    return;
                }
                if let Some(node) = self.reg.get_mut(id) {
                    if let Some(timer) = node.activate_timer {
                        self.timers.reset(timer, self.now);
                    }
                }
                self.timers.restore(expired, self.now);
            }
            Err(err) => {
                error!("failed to launch a new slave {target}: {err}");
                if let Some(node) = self.reg.get_mut(id) {
                    node.pid = None;
                }
                self.give_up_launch(id, true);
            }
        }
    }

    /// Abandons a launch sequence from the relaunch path: clears the launch
    /// timers, runs the fault handler, and settles the record.
    fn give_up_launch(&mut self, id: SlaveId, clear_handshake: bool) {
        {
            let Some(node) = self.reg.get_mut(id) else {
                return;
            };
            if let Some(timer) = node.relaunch_timer.take() {
                self.timers.cancel(timer);
            }
            if clear_handshake {
                if let Some(timer) = node.activate_timer.take() {
                    self.timers.cancel(timer);
                }
            }
        }
        self.fault_handler(id);
        if self.reg.contains(id) {
            let _ = self.on_exit(id);
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("slaves", &self.reg.len())
            .field("timers", &self.timers.len())
            .field("quiesce_depth", &self.quiesce_depth)
            .field("display_paused", &self.display_paused)
            .finish_non_exhaustive()
    }
}
