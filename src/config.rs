//! # Startup tunables for the master daemon core.
//!
//! [`Config`] is read once at startup and never reloaded. It controls the
//! timing of the slave lifecycle (TTL cycling, activation handshake window,
//! relaunch pacing), the multiplexing cap, the fast-crash policy, and where
//! slaves drop their crash-log breadcrumbs.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use boxvisor::Config;
//!
//! let mut cfg = Config::default();
//! cfg.activate_time = Duration::from_secs(10);
//! cfg.relaunch_count = 5;
//!
//! assert_eq!(cfg.relaunch_count, 5);
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// Global configuration for the slave supervisor and fault manager.
#[derive(Clone, Debug)]
pub struct Config {
    /// Time-to-live for secured slaves; on expiry the slave is cycled to
    /// reclaim resources while its instances are preserved.
    pub ttl: Duration,
    /// How long a freshly launched slave may take to deliver its activation
    /// handshake before it is treated as faulted.
    pub activate_time: Duration,
    /// Delay between relaunch attempts after a retryable launcher failure.
    pub relaunch_time: Duration,
    /// Relaunch attempts allowed within a single launch sequence.
    pub relaunch_count: u32,
    /// Maximum packages multiplexed onto one default-abi slave; doubles as
    /// the consecutive fast-crash budget.
    pub max_load: u32,
    /// A crash earlier than this after activation counts as a fast crash.
    pub minimum_reactivation_time: Duration,
    /// The abi tag whose slaves are subject to the multiplex cap.
    pub default_abi: String,
    /// When set, slaves are launched externally (by a debugger); the
    /// launcher is not invoked and no handshake timeout is armed.
    pub debug_mode: bool,
    /// Directory where slaves write their crash-log breadcrumbs.
    pub log_path: PathBuf,
}

impl Default for Config {
    /// Provides the daemon's shipped defaults:
    /// - `ttl = 30s`, `activate_time = 30s`
    /// - `relaunch_time = 3s`, `relaunch_count = 3`
    /// - `max_load = 30`, `minimum_reactivation_time = 10s`
    /// - `default_abi = "c"`, `debug_mode = false`
    /// - `log_path = "/tmp/boxvisor/log"`
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            activate_time: Duration::from_secs(30),
            relaunch_time: Duration::from_secs(3),
            relaunch_count: 3,
            max_load: 30,
            minimum_reactivation_time: Duration::from_secs(10),
            default_abi: "c".to_string(),
            debug_mode: false,
            log_path: PathBuf::from("/tmp/boxvisor/log"),
        }
    }
}
