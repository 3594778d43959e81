//! # Process-wide directory of slave records.
//!
//! The [`Registry`] owns every [`SlaveNode`] and hands out [`SlaveId`]s.
//! Records are kept in insertion order, which is also the scan order of the
//! multiplex selection in [`Registry::find_available`].
//!
//! The registry is pure storage: reference counting and destruction are
//! orchestrated by the [`Supervisor`](crate::supervisor::Supervisor),
//! because delete hooks run there.

use std::collections::HashMap;

use log::warn;

use crate::config::Config;
use crate::slave::{Pid, SlaveId, SlaveNode, SlaveState};

/// Insertion-ordered directory of slave records.
#[derive(Default)]
pub struct Registry {
    slaves: HashMap<SlaveId, SlaveNode>,
    order: Vec<SlaveId>,
    next_id: u64,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, node: SlaveNode) -> SlaveId {
        self.next_id += 1;
        let id = SlaveId(self.next_id);
        self.slaves.insert(id, node);
        self.order.push(id);
        id
    }

    pub(crate) fn remove(&mut self, id: SlaveId) -> Option<SlaveNode> {
        let node = self.slaves.remove(&id)?;
        self.order.retain(|other| *other != id);
        Some(node)
    }

    /// Borrows a record.
    pub fn get(&self, id: SlaveId) -> Option<&SlaveNode> {
        self.slaves.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: SlaveId) -> Option<&mut SlaveNode> {
        self.slaves.get_mut(&id)
    }

    /// Whether the id still resolves.
    pub fn contains(&self, id: SlaveId) -> bool {
        self.slaves.contains_key(&id)
    }

    /// Number of registered records.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (SlaveId, &SlaveNode)> {
        self.order
            .iter()
            .filter_map(move |id| self.slaves.get(id).map(|node| (*id, node)))
    }

    /// Snapshot of ids in insertion order, for sweeps that mutate the set.
    pub fn ids(&self) -> Vec<SlaveId> {
        self.order.clone()
    }

    pub fn find_by_name(&self, name: &str) -> Option<SlaveId> {
        self.iter()
            .find(|(_, node)| node.name() == name)
            .map(|(id, _)| id)
    }

    pub fn find_by_pid(&self, pid: Pid) -> Option<SlaveId> {
        self.iter()
            .find(|(_, node)| node.pid() == Some(pid))
            .map(|(id, _)| id)
    }

    /// Finds the record bound to a wire connection handle. Non-positive
    /// handles never match.
    pub fn find_by_rpc_handle(&self, handle: i32) -> Option<SlaveId> {
        if handle <= 0 {
            warn!("invalid rpc handle: {handle}");
            return None;
        }
        self.iter()
            .find(|(_, node)| node.rpc_handle() == Some(handle))
            .map(|(id, _)| id)
    }

    /// Finds a relaunch candidate: a record for `package` whose process is
    /// gone.
    pub fn find_by_package(&self, package: &str) -> Option<SlaveId> {
        self.iter()
            .find(|(_, node)| node.package() == package && node.pid().is_none())
            .map(|(id, _)| id)
    }

    /// Picks the first slave, in insertion order, that can take another
    /// package under the multiplexing rules.
    ///
    /// A candidate must match `secured`, must not be scheduled for death
    /// (terminating with no instances left), and must match `abi` case-
    /// insensitively. Secured slaves are only reusable while hosting no
    /// package at all; unsecured slaves must match `network` and, on the
    /// default abi, stay under the load cap.
    pub fn find_available(
        &self,
        cfg: &Config,
        abi: &str,
        secured: bool,
        network: bool,
    ) -> Option<SlaveId> {
        for (id, node) in self.iter() {
            if node.is_secured() != secured {
                continue;
            }

            // Terminating with no instances: the record is about to be
            // destroyed and cannot be reused.
            if node.state() == SlaveState::RequestedTerminate && node.loaded_instance() == 0 {
                continue;
            }

            if !node.abi().eq_ignore_ascii_case(abi) {
                continue;
            }

            if node.is_secured() {
                if node.loaded_package() == 0 {
                    return Some(id);
                }
            } else if node.network() == network {
                if abi.eq_ignore_ascii_case(&cfg.default_abi) {
                    if node.loaded_package() < cfg.max_load {
                        return Some(id);
                    }
                } else {
                    return Some(id);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config::default()
    }

    fn add(reg: &mut Registry, name: &str, secured: bool, abi: &str, network: bool) -> SlaveId {
        reg.insert(SlaveNode::new(name, secured, abi, "libexe-w", network, 3))
    }

    #[test]
    fn lookups_by_name_pid_and_handle() {
        let mut reg = Registry::new();
        let a = add(&mut reg, "a", false, "c", false);
        let b = add(&mut reg, "b", true, "c", false);

        reg.get_mut(a).unwrap().pid = Some(Pid(100));
        reg.get_mut(b).unwrap().rpc_handle = Some(7);

        assert_eq!(reg.find_by_name("a"), Some(a));
        assert_eq!(reg.find_by_name("zz"), None);
        assert_eq!(reg.find_by_pid(Pid(100)), Some(a));
        assert_eq!(reg.find_by_rpc_handle(7), Some(b));
        assert_eq!(reg.find_by_rpc_handle(0), None);
        assert_eq!(reg.find_by_rpc_handle(-3), None);
    }

    #[test]
    fn package_lookup_wants_a_dead_process() {
        let mut reg = Registry::new();
        let a = add(&mut reg, "a", false, "c", false);
        assert_eq!(reg.find_by_package("libexe-w"), Some(a));

        reg.get_mut(a).unwrap().pid = Some(Pid(5));
        assert_eq!(reg.find_by_package("libexe-w"), None);
    }

    #[test]
    fn available_scans_in_insertion_order() {
        let mut reg = Registry::new();
        let first = add(&mut reg, "first", false, "c", false);
        add(&mut reg, "second", false, "c", false);

        assert_eq!(reg.find_available(&cfg(), "c", false, false), Some(first));
    }

    #[test]
    fn available_skips_dying_records() {
        let mut reg = Registry::new();
        let a = add(&mut reg, "a", false, "c", false);
        let b = add(&mut reg, "b", false, "c", false);

        {
            let node = reg.get_mut(a).unwrap();
            node.state = SlaveState::RequestedTerminate;
        }
        assert_eq!(reg.find_available(&cfg(), "c", false, false), Some(b));

        // With instances still loaded, a terminating record is reusable.
        {
            let node = reg.get_mut(a).unwrap();
            node.loaded_instance = 1;
        }
        assert_eq!(reg.find_available(&cfg(), "c", false, false), Some(a));
    }

    #[test]
    fn abi_match_is_case_insensitive() {
        let mut reg = Registry::new();
        let a = add(&mut reg, "a", false, "C", false);
        assert_eq!(reg.find_available(&cfg(), "c", false, false), Some(a));
    }

    #[test]
    fn secured_slaves_host_one_package() {
        let mut reg = Registry::new();
        let a = add(&mut reg, "a", true, "c", false);

        assert_eq!(reg.find_available(&cfg(), "c", true, false), Some(a));
        reg.get_mut(a).unwrap().loaded_package = 1;
        assert_eq!(reg.find_available(&cfg(), "c", true, false), None);
    }

    #[test]
    fn unsecured_default_abi_respects_load_cap() {
        let mut config = cfg();
        config.max_load = 2;

        let mut reg = Registry::new();
        let a = add(&mut reg, "a", false, "c", false);

        reg.get_mut(a).unwrap().loaded_package = 1;
        assert_eq!(reg.find_available(&config, "c", false, false), Some(a));
        reg.get_mut(a).unwrap().loaded_package = 2;
        assert_eq!(reg.find_available(&config, "c", false, false), None);

        // Off the default abi the cap does not apply.
        let b = add(&mut reg, "b", false, "web", false);
        reg.get_mut(b).unwrap().loaded_package = 50;
        assert_eq!(reg.find_available(&config, "web", false, false), Some(b));
    }

    #[test]
    fn unsecured_network_flag_must_match() {
        let mut reg = Registry::new();
        add(&mut reg, "a", false, "c", true);
        assert_eq!(reg.find_available(&cfg(), "c", false, false), None);
        assert!(reg.find_available(&cfg(), "c", false, true).is_some());
    }

    #[test]
    fn remove_keeps_order_consistent() {
        let mut reg = Registry::new();
        let a = add(&mut reg, "a", false, "c", false);
        let b = add(&mut reg, "b", false, "c", false);

        assert!(reg.remove(a).is_some());
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.ids(), vec![b]);
        assert!(!reg.contains(a));
    }
}
