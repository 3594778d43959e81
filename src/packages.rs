//! # Package-store seam consumed by fault attribution.
//!
//! Package metadata lives outside this crate; attribution only needs three
//! questions answered: does the package exist, which package does a secured
//! slave host, and where do we persist an attributed fault.

use std::collections::HashMap;

use crate::error::Error;
use crate::slave::SlaveView;

/// A persisted fault attribution.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultRecord {
    /// Wall timestamp of the attributed event.
    pub timestamp: f64,
    /// Source file reported by the shadow call stack; empty when unknown.
    pub filename: String,
    /// Function reported by the shadow call stack; empty when unknown.
    pub function: String,
}

/// The package directory as seen by the fault manager.
pub trait PackageStore {
    /// Whether `package` is a known package.
    fn contains(&self, package: &str) -> bool;

    /// Persists a fault attribution onto the package record.
    fn set_fault(&mut self, package: &str, record: FaultRecord) -> Result<(), Error>;

    /// The single package hosted by a secured slave, if there is exactly
    /// one.
    fn find_by_secured_slave(&self, slave: &SlaveView<'_>) -> Option<String>;
}

/// In-memory [`PackageStore`], sufficient for tests and single-process
/// embeddings.
#[derive(Debug, Default)]
pub struct MemoryPackages {
    entries: HashMap<String, PackageEntry>,
}

#[derive(Debug, Default)]
struct PackageEntry {
    fault: Option<FaultRecord>,
    secured_host: Option<String>,
}

impl MemoryPackages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a package id.
    pub fn register(&mut self, package: &str) {
        self.entries.entry(package.to_string()).or_default();
    }

    /// Records that `package` is hosted by the secured slave `slave_name`.
    pub fn assign_secured(&mut self, package: &str, slave_name: &str) {
        self.entries
            .entry(package.to_string())
            .or_default()
            .secured_host = Some(slave_name.to_string());
    }

    /// The persisted fault for a package, if any.
    pub fn fault(&self, package: &str) -> Option<&FaultRecord> {
        self.entries.get(package)?.fault.as_ref()
    }
}

impl PackageStore for MemoryPackages {
    fn contains(&self, package: &str) -> bool {
        self.entries.contains_key(package)
    }

    fn set_fault(&mut self, package: &str, record: FaultRecord) -> Result<(), Error> {
        match self.entries.get_mut(package) {
            Some(entry) => {
                entry.fault = Some(record);
                Ok(())
            }
            None => Err(Error::NotExist),
        }
    }

    fn find_by_secured_slave(&self, slave: &SlaveView<'_>) -> Option<String> {
        if !slave.secured {
            return None;
        }
        self.entries
            .iter()
            .find(|(_, entry)| entry.secured_host.as_deref() == Some(slave.name))
            .map(|(package, _)| package.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slave::SlaveId;

    fn view<'a>(name: &'a str, secured: bool) -> SlaveView<'a> {
        SlaveView {
            id: SlaveId(1),
            name,
            package: "libexe-w",
            abi: "c",
            pid: None,
            secured,
        }
    }

    #[test]
    fn set_fault_requires_registration() {
        let mut store = MemoryPackages::new();
        let record = FaultRecord {
            timestamp: 1.0,
            filename: String::new(),
            function: String::new(),
        };
        assert!(matches!(
            store.set_fault("ghost", record.clone()),
            Err(Error::NotExist)
        ));

        store.register("foo");
        store.set_fault("foo", record.clone()).unwrap();
        assert_eq!(store.fault("foo"), Some(&record));
    }

    #[test]
    fn secured_lookup_matches_host_name() {
        let mut store = MemoryPackages::new();
        store.register("foo");
        store.assign_secured("foo", "s1");

        assert_eq!(
            store.find_by_secured_slave(&view("s1", true)),
            Some("foo".to_string())
        );
        assert_eq!(store.find_by_secured_slave(&view("s2", true)), None);
        // An unsecured slave never attributes through this rule.
        assert_eq!(store.find_by_secured_slave(&view("s1", false)), None);
    }
}
