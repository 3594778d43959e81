//! # Crash attribution for terminated slaves.
//!
//! When a slave dies abnormally the daemon wants to know *which package*
//! inside it was at fault. Three sources of truth are consulted in order:
//!
//! 1. **Crash-log breadcrumb**: the slave writes
//!    `<log_path>/slave.<pid>` as it enters plugin code; the first line
//!    names the suspect module as `liblive-<package>.so`.
//! 2. **Secured-slave rule**: a secured slave hosts one package, so the
//!    culprit is known by construction.
//! 3. **Shadow call stack**: every announced plugin entry without a
//!    matching return is still on the call list; the most recent one for
//!    the dead slave takes the blame, earlier ones are dumped as false
//!    logs.
//!
//! Every attribution is persisted onto the package record and broadcast to
//! clients as `fault_package`. A slave that crashed before leaving any
//! breadcrumb yields no attribution; that is an informational condition,
//! not an error.

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};

use crate::error::Error;
use crate::packages::{FaultRecord, PackageStore};
use crate::rpc::FaultSink;
use crate::slave::{Pid, SlaveId, SlaveView};
use crate::timer::wall_timestamp;

/// Module file-name prefix the crash log is expected to carry.
const LOG_PREFIX: &str = "liblive-";
/// Module file-name suffix the crash log is expected to carry.
const LOG_SUFFIX: &str = ".so";

/// One plugin entry without a matching return yet.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultCall {
    /// The slave executing the call.
    pub slave: SlaveId,
    /// Package owning the entry point.
    pub package: String,
    /// Source file of the entry point.
    pub filename: String,
    /// Function name of the entry point.
    pub function: String,
    /// Wall timestamp of the entry.
    pub timestamp: f64,
}

/// A published `(package, file, function)` attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribution {
    pub package: String,
    pub filename: String,
    pub function: String,
}

/// Shadow call stack plus crash-log attribution.
#[derive(Debug)]
pub struct FaultManager {
    calls: Vec<FaultCall>,
    /// Outstanding-call marker: bumped on every call-enter and explicit
    /// set-fault, dropped on matched returns, reset by attribution.
    mark_count: i32,
    log_path: PathBuf,
}

impl FaultManager {
    /// Creates a manager reading crash logs under `log_path`.
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            calls: Vec::new(),
            mark_count: 0,
            log_path: log_path.into(),
        }
    }

    /// Whether any plugin call is outstanding anywhere.
    pub fn fault_pending(&self) -> bool {
        self.mark_count != 0
    }

    /// Raw mark counter, for diagnostics.
    pub fn mark_count(&self) -> i32 {
        self.mark_count
    }

    /// Outstanding call records, append-ordered.
    pub fn calls(&self) -> &[FaultCall] {
        &self.calls
    }

    /// Records entry into a plugin function.
    pub fn call(&mut self, slave: SlaveId, package: &str, filename: &str, function: &str) {
        self.calls.push(FaultCall {
            slave,
            package: package.to_string(),
            filename: filename.to_string(),
            function: function.to_string(),
            timestamp: wall_timestamp(),
        });
        self.mark_count += 1;
    }

    /// Removes the matching entry record on plugin-function return.
    pub fn ret(
        &mut self,
        slave: SlaveId,
        package: &str,
        filename: &str,
        function: &str,
    ) -> Result<(), Error> {
        let pos = self.calls.iter().position(|call| {
            call.slave == slave
                && call.package == package
                && call.filename == filename
                && call.function == function
        });
        match pos {
            Some(pos) => {
                self.calls.remove(pos);
                self.mark_count -= 1;
                Ok(())
            }
            None => Err(Error::NotExist),
        }
    }

    /// Explicit fault report from a live slave: persist, dump, broadcast.
    pub fn mark_set(
        &mut self,
        slave: &SlaveView<'_>,
        package: &str,
        filename: &str,
        function: &str,
        packages: &mut dyn PackageStore,
        sink: &mut dyn FaultSink,
    ) -> Result<(), Error> {
        if !packages.contains(package) {
            return Err(Error::NotExist);
        }
        packages.set_fault(
            package,
            FaultRecord {
                timestamp: wall_timestamp(),
                filename: filename.to_string(),
                function: function.to_string(),
            },
        )?;

        dump_fault(slave, package, filename, function);
        sink.broadcast(package, filename, function);
        self.mark_count += 1;
        Ok(())
    }

    /// Attributes a terminated slave's crash.
    ///
    /// Always resets the mark counter and consumes both the crash log and
    /// the slave's call records, whether or not an attribution was found.
    pub fn check_slave(
        &mut self,
        slave: &SlaveView<'_>,
        packages: &mut dyn PackageStore,
        sink: &mut dyn FaultSink,
    ) -> Option<Attribution> {
        let attribution = self.attribute(slave, packages, sink);

        self.mark_count = 0;
        if let Some(pid) = slave.pid {
            self.clear_log(pid);
        }

        match &attribution {
            Some(found) => debug!(
                "fault on {} attributed to {} ({}:{})",
                slave.name, found.package, found.filename, found.function
            ),
            None => info!("no fault attribution for {}", slave.name),
        }
        attribution
    }

    fn attribute(
        &mut self,
        slave: &SlaveView<'_>,
        packages: &mut dyn PackageStore,
        sink: &mut dyn FaultSink,
    ) -> Option<Attribution> {
        // First step: the crash-log breadcrumb.
        if let Some(package) = self.probe_log(slave) {
            if packages.contains(&package) {
                self.purge_calls(slave.id);
                return Some(publish(slave, &package, "", "", wall_timestamp(), packages, sink));
            }
            warn!("crash log names unknown package {package}");
        }

        // Second step: a secured slave hosts exactly one package.
        if let Some(package) = packages.find_by_secured_slave(slave) {
            if packages.contains(&package) {
                self.purge_calls(slave.id);
                return Some(publish(slave, &package, "", "", wall_timestamp(), packages, sink));
            }
        }

        // Last step: the pair of function call and return marks. Walk
        // newest-first; the most recent outstanding call takes the blame.
        let mut attribution = None;
        for pos in (0..self.calls.len()).rev() {
            if self.calls[pos].slave != slave.id {
                continue;
            }
            let call = self.calls.remove(pos);

            if attribution.is_none() {
                if packages.contains(&call.package) {
                    attribution = Some(publish(
                        slave,
                        &call.package,
                        &call.filename,
                        &call.function,
                        call.timestamp,
                        packages,
                        sink,
                    ));
                } else {
                    error!("call record names unknown package {}", call.package);
                }
            } else {
                debug!("treated as a false log");
                dump_fault(slave, &call.package, &call.filename, &call.function);
            }
        }

        attribution
    }

    fn purge_calls(&mut self, slave: SlaveId) {
        self.calls.retain(|call| call.slave != slave);
    }

    fn log_file(&self, pid: Pid) -> PathBuf {
        self.log_path.join(format!("slave.{pid}"))
    }

    /// Reads the suspect package name out of the crash log, consuming the
    /// file on success. A trailing newline on the first line is tolerated.
    fn probe_log(&self, slave: &SlaveView<'_>) -> Option<String> {
        let pid = slave.pid?;
        let path = self.log_file(pid);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                debug!("no crash log found at {}: {err}", path.display());
                return None;
            }
        };

        let mut first = String::new();
        if BufReader::new(file).read_line(&mut first).is_err() {
            warn!("unreadable crash log {}", path.display());
            return None;
        }

        let line = first.trim_end_matches(['\r', '\n']);
        let Some(stem) = line.strip_prefix(LOG_PREFIX) else {
            warn!("crash log pattern not matched: {line}");
            return None;
        };
        let Some(package) = stem.strip_suffix(LOG_SUFFIX) else {
            warn!("crash log extension not matched: {line}");
            return None;
        };
        if package.is_empty() {
            return None;
        }

        remove_log(&path);
        Some(package.to_string())
    }

    fn clear_log(&self, pid: Pid) {
        remove_log(&self.log_file(pid));
    }
}

fn remove_log(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove crash log {}: {err}", path.display());
        }
    }
}

fn publish(
    slave: &SlaveView<'_>,
    package: &str,
    filename: &str,
    function: &str,
    timestamp: f64,
    packages: &mut dyn PackageStore,
    sink: &mut dyn FaultSink,
) -> Attribution {
    let result = packages.set_fault(
        package,
        FaultRecord {
            timestamp,
            filename: filename.to_string(),
            function: function.to_string(),
        },
    );
    if let Err(err) = result {
        error!("persisting fault on {package} failed: {err}");
    }
    dump_fault(slave, package, filename, function);
    sink.broadcast(package, filename, function);

    Attribution {
        package: package.to_string(),
        filename: filename.to_string(),
        function: function.to_string(),
    }
}

fn dump_fault(slave: &SlaveView<'_>, package: &str, filename: &str, function: &str) {
    let pid = slave.pid.map(|p| p.0 as i64).unwrap_or(-1);
    error!(
        "slave: {}[{pid}] package: {package} filename: {filename} funcname: {function}",
        slave.name
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::MemoryPackages;

    #[derive(Default)]
    struct RecordingSink {
        broadcasts: Vec<(String, String, String)>,
    }

    impl FaultSink for RecordingSink {
        fn broadcast(&mut self, package: &str, filename: &str, function: &str) {
            self.broadcasts
                .push((package.into(), filename.into(), function.into()));
        }
    }

    fn view(id: u64, name: &'static str, pid: Option<u32>, secured: bool) -> SlaveView<'static> {
        SlaveView {
            id: SlaveId(id),
            name,
            package: "libexe-w",
            abi: "c",
            pid: pid.map(Pid),
            secured,
        }
    }

    #[test]
    fn call_then_ret_restores_state() {
        let mut fm = FaultManager::new("/nonexistent");
        let s = SlaveId(1);

        fm.call(s, "foo", "f.c", "do_work");
        assert!(fm.fault_pending());
        assert_eq!(fm.calls().len(), 1);

        fm.ret(s, "foo", "f.c", "do_work").unwrap();
        assert!(!fm.fault_pending());
        assert!(fm.calls().is_empty());
    }

    #[test]
    fn mismatched_ret_is_not_exist() {
        let mut fm = FaultManager::new("/nonexistent");
        let s = SlaveId(1);
        fm.call(s, "foo", "f.c", "do_work");

        assert!(matches!(
            fm.ret(s, "foo", "f.c", "other"),
            Err(Error::NotExist)
        ));
        assert!(matches!(
            fm.ret(SlaveId(2), "foo", "f.c", "do_work"),
            Err(Error::NotExist)
        ));
        assert_eq!(fm.calls().len(), 1);
    }

    #[test]
    fn log_probe_attributes_and_consumes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slave.200");
        fs::write(&path, "liblive-foo.so\nbacktrace follows\n").unwrap();

        let mut fm = FaultManager::new(dir.path());
        let mut packages = MemoryPackages::new();
        packages.register("foo");
        let mut sink = RecordingSink::default();

        let slave = view(1, "s1", Some(200), false);
        fm.call(slave.id, "bar", "g.c", "other");

        let found = fm.check_slave(&slave, &mut packages, &mut sink).unwrap();
        assert_eq!(found.package, "foo");
        assert_eq!(found.filename, "");
        assert_eq!(found.function, "");

        assert_eq!(
            sink.broadcasts,
            vec![("foo".into(), String::new(), String::new())]
        );
        assert!(!path.exists());
        assert!(fm.calls().is_empty());
        assert_eq!(fm.mark_count(), 0);
        assert!(packages.fault("foo").is_some());
    }

    #[test]
    fn log_probe_requires_module_pattern() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("slave.7"), "garbage first line\n").unwrap();

        let mut fm = FaultManager::new(dir.path());
        let mut packages = MemoryPackages::new();
        let mut sink = RecordingSink::default();

        let slave = view(1, "s1", Some(7), false);
        assert!(fm.check_slave(&slave, &mut packages, &mut sink).is_none());
        assert!(sink.broadcasts.is_empty());
        // The malformed log is still consumed.
        assert!(!dir.path().join("slave.7").exists());
    }

    #[test]
    fn secured_slave_attributes_its_single_package() {
        let dir = tempfile::tempdir().unwrap();
        let mut fm = FaultManager::new(dir.path());
        let mut packages = MemoryPackages::new();
        packages.register("foo");
        packages.assign_secured("foo", "s1");
        let mut sink = RecordingSink::default();

        let slave = view(1, "s1", Some(300), true);
        let found = fm.check_slave(&slave, &mut packages, &mut sink).unwrap();
        assert_eq!(found.package, "foo");
        assert_eq!(found.filename, "");
    }

    #[test]
    fn call_walk_blames_most_recent_and_dumps_false_logs() {
        let dir = tempfile::tempdir().unwrap();
        let mut fm = FaultManager::new(dir.path());
        let mut packages = MemoryPackages::new();
        packages.register("foo");
        packages.register("bar");
        let mut sink = RecordingSink::default();

        let slave = view(1, "s1", Some(42), false);
        fm.call(slave.id, "foo", "f.c", "do_work");
        fm.call(slave.id, "bar", "g.c", "other");
        // A different slave's record must survive untouched.
        fm.call(SlaveId(2), "baz", "h.c", "unrelated");

        let found = fm.check_slave(&slave, &mut packages, &mut sink).unwrap();
        assert_eq!(found.package, "bar");
        assert_eq!(found.filename, "g.c");
        assert_eq!(found.function, "other");

        assert_eq!(fm.calls().len(), 1);
        assert_eq!(fm.calls()[0].slave, SlaveId(2));
        assert_eq!(fm.mark_count(), 0);
        assert_eq!(sink.broadcasts.len(), 1);
    }

    #[test]
    fn crash_without_breadcrumbs_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut fm = FaultManager::new(dir.path());
        let mut packages = MemoryPackages::new();
        let mut sink = RecordingSink::default();

        let slave = view(1, "s1", Some(9), false);
        assert!(fm.check_slave(&slave, &mut packages, &mut sink).is_none());
        assert_eq!(fm.mark_count(), 0);
    }

    #[test]
    fn explicit_set_fault_broadcasts_and_marks() {
        let mut fm = FaultManager::new("/nonexistent");
        let mut packages = MemoryPackages::new();
        packages.register("foo");
        let mut sink = RecordingSink::default();

        let slave = view(1, "s1", Some(5), false);
        fm.mark_set(&slave, "foo", "f.c", "render", &mut packages, &mut sink)
            .unwrap();

        assert!(fm.fault_pending());
        assert_eq!(sink.broadcasts.len(), 1);
        assert_eq!(packages.fault("foo").unwrap().function, "render");

        assert!(matches!(
            fm.mark_set(&slave, "ghost", "", "", &mut packages, &mut sink),
            Err(Error::NotExist)
        ));
    }
}
