//! # The slave record: one launched (or launchable) worker process.
//!
//! A [`SlaveNode`] tracks a worker through its whole life: launch request,
//! activation handshake, pause/resume cycles, termination. Records are owned
//! by the [`Registry`](crate::registry::Registry) and addressed by
//! [`SlaveId`], an opaque handle that is never reused, so a stale id simply
//! stops resolving instead of aliasing a newer record.
//!
//! Collaborators observe a slave through per-event hook lists
//! ([`SlaveEvent`]): ordered newest-first, safely iterable while hooks
//! mutate the lists or tear the record down, with self-removal via
//! [`HookVerdict::Remove`]. The deactivate list additionally votes for
//! reactivation with [`HookVerdict::Reactivate`].

use std::any::Any;
use std::fmt;
use std::mem;
use std::time::Instant;

use crate::supervisor::Supervisor;
use crate::timer::TimerId;

/// Operating-system process id of a launched slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque, non-reused handle to a slave record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlaveId(pub(crate) u64);

impl fmt::Display for SlaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slave#{}", self.0)
    }
}

/// Lifecycle states of a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveState {
    /// Launcher invoked; waiting for the activation handshake.
    RequestedLaunch,
    /// Handshake complete; running.
    Resumed,
    /// Pause acknowledged.
    Paused,
    /// Pause requested; ack outstanding.
    RequestedPause,
    /// Resume requested; ack outstanding.
    RequestedResume,
    /// Terminate signal sent; exit notice outstanding.
    RequestedTerminate,
    /// Not running.
    Terminated,
    /// Diagnostic only; never entered by normal transitions.
    Error,
}

impl SlaveState {
    /// Stable diagnostic string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SlaveState::RequestedLaunch => "RequestedLaunch",
            SlaveState::Resumed => "Resumed",
            SlaveState::Paused => "Paused",
            SlaveState::RequestedPause => "RequestedPause",
            SlaveState::RequestedResume => "RequestedResume",
            SlaveState::RequestedTerminate => "RequestedTerminate",
            SlaveState::Terminated => "Terminated",
            SlaveState::Error => "Error",
        }
    }
}

impl fmt::Display for SlaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event kinds a hook can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveEvent {
    /// Activation handshake completed.
    Activate,
    /// Process exited (cleanly or not); votes decide reactivation.
    Deactivate,
    /// Record is being destroyed.
    Delete,
    /// Pause acknowledged.
    Pause,
    /// Resume acknowledged.
    Resume,
    /// A fault was detected on this slave.
    Fault,
}

const EVENT_KINDS: usize = 6;

impl SlaveEvent {
    fn index(self) -> usize {
        match self {
            SlaveEvent::Activate => 0,
            SlaveEvent::Deactivate => 1,
            SlaveEvent::Delete => 2,
            SlaveEvent::Pause => 3,
            SlaveEvent::Resume => 4,
            SlaveEvent::Fault => 5,
        }
    }
}

/// What a hook wants done after running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookVerdict {
    /// Stay registered.
    Keep,
    /// Unregister this hook after the current invocation.
    Remove,
    /// Stay registered and vote for reactivating the slave. Only meaningful
    /// from the deactivate list; elsewhere it acts as [`HookVerdict::Keep`].
    Reactivate,
}

/// Observer callback invoked on lifecycle events.
///
/// Hooks run on the main loop and may reenter the supervisor, including
/// operations that destroy the very record they were invoked on; the sweep
/// revalidates the id after every hook.
pub type SlaveHook = Box<dyn FnMut(&mut Supervisor, SlaveId) -> HookVerdict>;

/// Handle for removing a registered hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(pub(crate) u64);

pub(crate) struct HookEntry {
    pub(crate) id: HookId,
    pub(crate) hook: SlaveHook,
}

/// One slave worker record.
pub struct SlaveNode {
    pub(crate) name: String,
    /// Launcher target binary.
    pub(crate) package: String,
    pub(crate) abi: String,
    /// A secured slave hosts at most one package.
    pub(crate) secured: bool,
    pub(crate) network: bool,
    pub(crate) state: SlaveState,
    pub(crate) pid: Option<Pid>,
    pub(crate) refcount: u32,
    pub(crate) rpc_handle: Option<i32>,
    pub(crate) loaded_package: u32,
    pub(crate) loaded_instance: u32,
    pub(crate) fault_count: u32,
    pub(crate) critical_fault_count: u32,
    pub(crate) reactivate_slave: bool,
    pub(crate) reactivate_instances: bool,
    pub(crate) relaunch_count: u32,
    pub(crate) activated_at: Option<Instant>,
    pub(crate) ttl_timer: Option<TimerId>,
    pub(crate) activate_timer: Option<TimerId>,
    pub(crate) relaunch_timer: Option<TimerId>,
    hooks: [Vec<HookEntry>; EVENT_KINDS],
    data: Vec<(String, Box<dyn Any>)>,
    /// Set while delete hooks run, so reentrant unrefs cannot re-destroy.
    pub(crate) dying: bool,
}

impl SlaveNode {
    pub(crate) fn new(
        name: &str,
        secured: bool,
        abi: &str,
        package: &str,
        network: bool,
        relaunch_count: u32,
    ) -> Self {
        Self {
            name: name.to_string(),
            package: package.to_string(),
            abi: abi.to_string(),
            secured,
            network,
            state: SlaveState::Terminated,
            pid: None,
            refcount: 0,
            rpc_handle: None,
            loaded_package: 0,
            loaded_instance: 0,
            fault_count: 0,
            critical_fault_count: 0,
            reactivate_slave: false,
            reactivate_instances: false,
            relaunch_count,
            activated_at: None,
            ttl_timer: None,
            activate_timer: None,
            relaunch_timer: None,
            hooks: Default::default(),
            data: Vec::new(),
            dying: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Launcher target binary this slave runs.
    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn abi(&self) -> &str {
        &self.abi
    }

    pub fn is_secured(&self) -> bool {
        self.secured
    }

    pub fn network(&self) -> bool {
        self.network
    }

    pub fn state(&self) -> SlaveState {
        self.state
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn rpc_handle(&self) -> Option<i32> {
        self.rpc_handle
    }

    pub fn loaded_package(&self) -> u32 {
        self.loaded_package
    }

    pub fn loaded_instance(&self) -> u32 {
        self.loaded_instance
    }

    pub fn fault_count(&self) -> u32 {
        self.fault_count
    }

    pub fn critical_fault_count(&self) -> u32 {
        self.critical_fault_count
    }

    pub fn need_to_reactivate(&self) -> bool {
        self.reactivate_slave
    }

    pub fn need_to_reactivate_instances(&self) -> bool {
        self.reactivate_instances
    }

    /// Whether the slave counts as active for scheduling purposes.
    ///
    /// Terminating and terminated slaves do not; every other state does.
    pub fn is_active(&self) -> bool {
        match self.state {
            SlaveState::RequestedTerminate | SlaveState::Terminated => false,
            SlaveState::Error => self.pid.is_some(),
            _ => true,
        }
    }

    /// Snapshot handed to collaborator seams.
    pub fn view(&self, id: SlaveId) -> SlaveView<'_> {
        SlaveView {
            id,
            name: &self.name,
            package: &self.package,
            abi: &self.abi,
            pid: self.pid,
            secured: self.secured,
        }
    }

    // ---- Hook lists ----

    pub(crate) fn add_hook(&mut self, event: SlaveEvent, id: HookId, hook: SlaveHook) {
        // Prepend: the most recently registered hook runs first.
        self.hooks[event.index()].insert(0, HookEntry { id, hook });
    }

    pub(crate) fn remove_hook(&mut self, event: SlaveEvent, id: HookId) -> bool {
        let list = &mut self.hooks[event.index()];
        match list.iter().position(|entry| entry.id == id) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Detaches the hook list for a sweep; hooks registered during the sweep
    /// land in the fresh list and are not invoked until the next one.
    pub(crate) fn take_hooks(&mut self, event: SlaveEvent) -> Vec<HookEntry> {
        mem::take(&mut self.hooks[event.index()])
    }

    /// Reattaches the surviving entries behind anything registered during
    /// the sweep, preserving newest-first order overall.
    pub(crate) fn restore_hooks(&mut self, event: SlaveEvent, kept: Vec<HookEntry>) {
        self.hooks[event.index()].extend(kept);
    }

    pub(crate) fn clear_hooks(&mut self) {
        for list in &mut self.hooks {
            list.clear();
        }
    }

    // ---- Scratchpad ----

    /// Attaches a tagged opaque entry for a collaborator. Tags may repeat;
    /// removal takes the first match.
    pub fn set_data(&mut self, tag: &str, data: Box<dyn Any>) {
        self.data.push((tag.to_string(), data));
    }

    /// Detaches and returns the first entry under `tag`.
    pub fn take_data(&mut self, tag: &str) -> Option<Box<dyn Any>> {
        let pos = self.data.iter().position(|(t, _)| t == tag)?;
        Some(self.data.remove(pos).1)
    }

    /// Borrows the first entry under `tag`.
    pub fn data(&self, tag: &str) -> Option<&dyn Any> {
        self.data
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, d)| d.as_ref())
    }

    pub(crate) fn clear_data(&mut self) {
        self.data.clear();
    }
}

impl fmt::Debug for SlaveNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlaveNode")
            .field("name", &self.name)
            .field("package", &self.package)
            .field("abi", &self.abi)
            .field("secured", &self.secured)
            .field("network", &self.network)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .field("refcount", &self.refcount)
            .field("loaded_package", &self.loaded_package)
            .field("loaded_instance", &self.loaded_instance)
            .field("fault_count", &self.fault_count)
            .finish_non_exhaustive()
    }
}

/// Borrowed snapshot of a slave record, handed to collaborator seams.
#[derive(Debug, Clone, Copy)]
pub struct SlaveView<'a> {
    /// The record's handle.
    pub id: SlaveId,
    /// Unique identity within the registry.
    pub name: &'a str,
    /// Launcher target binary.
    pub package: &'a str,
    /// Binary-interface tag.
    pub abi: &'a str,
    /// Current process id, if launched.
    pub pid: Option<Pid>,
    /// Single-package isolation flag.
    pub secured: bool,
}

/// Result of an operation that may tear down the record it ran on.
///
/// Callers must re-fetch the record through the registry after receiving
/// [`SlaveFate::Alive`]; after [`SlaveFate::Destroyed`] the id no longer
/// resolves.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveFate {
    /// The record still exists.
    Alive,
    /// The record was destroyed during the operation.
    Destroyed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> SlaveNode {
        SlaveNode::new("s", false, "c", "libexe-s", false, 3)
    }

    #[test]
    fn fresh_record_is_inactive() {
        let n = node();
        assert_eq!(n.state(), SlaveState::Terminated);
        assert!(!n.is_active());
        assert!(n.pid().is_none());
    }

    #[test]
    fn active_states() {
        let mut n = node();
        for state in [
            SlaveState::RequestedLaunch,
            SlaveState::Resumed,
            SlaveState::Paused,
            SlaveState::RequestedPause,
            SlaveState::RequestedResume,
        ] {
            n.state = state;
            assert!(n.is_active(), "{state} should be active");
        }
        for state in [SlaveState::RequestedTerminate, SlaveState::Terminated] {
            n.state = state;
            assert!(!n.is_active(), "{state} should be inactive");
        }
        // Error falls back to pid presence.
        n.state = SlaveState::Error;
        assert!(!n.is_active());
        n.pid = Some(Pid(9));
        assert!(n.is_active());
    }

    #[test]
    fn scratchpad_takes_first_match() {
        let mut n = node();
        n.set_data("tag", Box::new(1u32));
        n.set_data("tag", Box::new(2u32));

        let first = n.take_data("tag").unwrap();
        assert_eq!(*first.downcast::<u32>().unwrap(), 1);
        let second = n.data("tag").unwrap();
        assert_eq!(*second.downcast_ref::<u32>().unwrap(), 2);
        assert!(n.take_data("other").is_none());
    }

    #[test]
    fn hooks_prepend() {
        let mut n = node();
        n.add_hook(SlaveEvent::Activate, HookId(1), Box::new(|_, _| HookVerdict::Keep));
        n.add_hook(SlaveEvent::Activate, HookId(2), Box::new(|_, _| HookVerdict::Keep));

        let list = n.take_hooks(SlaveEvent::Activate);
        let ids: Vec<HookId> = list.iter().map(|e| e.id).collect();
        assert_eq!(ids, [HookId(2), HookId(1)]);
    }

    #[test]
    fn remove_hook_by_id() {
        let mut n = node();
        n.add_hook(SlaveEvent::Fault, HookId(7), Box::new(|_, _| HookVerdict::Keep));
        assert!(n.remove_hook(SlaveEvent::Fault, HookId(7)));
        assert!(!n.remove_hook(SlaveEvent::Fault, HookId(7)));
    }
}
