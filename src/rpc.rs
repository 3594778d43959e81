//! # Wire seams toward slaves and clients.
//!
//! The supervisor talks to its workers and its clients through two small
//! traits. Both are fire-and-forget from the core's perspective: a pause or
//! resume request is queued here, and the reply comes back later as an ack
//! notice on the main loop.
//!
//! - [`SlaveLink`] carries the `pause`/`resume` requests (each stamped with
//!   a wall timestamp) and the liveness-ping freeze/thaw that accompanies
//!   completed transitions.
//! - [`FaultSink`] broadcasts `fault_package(pkgname, filename, funcname)`
//!   to every connected client, no ack expected.
//!
//! [`LogLink`] and [`LogSink`] are provided no-op implementations that only
//! log; useful for demos and as defaults while wiring a daemon up.

use log::debug;

use crate::error::Error;
use crate::slave::SlaveView;

/// Outbound request channel toward one slave process.
pub trait SlaveLink {
    /// Queues a `pause(timestamp)` request. The ack arrives later as a
    /// pause-ack notice.
    fn send_pause(&mut self, slave: &SlaveView<'_>, timestamp: f64) -> Result<(), Error>;

    /// Queues a `resume(timestamp)` request. The ack arrives later as a
    /// resume-ack notice.
    fn send_resume(&mut self, slave: &SlaveView<'_>, timestamp: f64) -> Result<(), Error>;

    /// Suspends the liveness ping while the slave is paused.
    fn ping_freeze(&mut self, slave: &SlaveView<'_>);

    /// Resumes the liveness ping.
    fn ping_thaw(&mut self, slave: &SlaveView<'_>);
}

/// Outbound no-ack broadcast channel toward every connected client.
pub trait FaultSink {
    /// Broadcasts a `fault_package` notification.
    fn broadcast(&mut self, package: &str, filename: &str, function: &str);
}

/// [`SlaveLink`] that only logs the requests.
#[derive(Debug, Default)]
pub struct LogLink;

impl SlaveLink for LogLink {
    fn send_pause(&mut self, slave: &SlaveView<'_>, timestamp: f64) -> Result<(), Error> {
        debug!("pause -> {} at {timestamp}", slave.name);
        Ok(())
    }

    fn send_resume(&mut self, slave: &SlaveView<'_>, timestamp: f64) -> Result<(), Error> {
        debug!("resume -> {} at {timestamp}", slave.name);
        Ok(())
    }

    fn ping_freeze(&mut self, slave: &SlaveView<'_>) {
        debug!("ping freeze: {}", slave.name);
    }

    fn ping_thaw(&mut self, slave: &SlaveView<'_>) {
        debug!("ping thaw: {}", slave.name);
    }
}

/// [`FaultSink`] that only logs the broadcast.
#[derive(Debug, Default)]
pub struct LogSink;

impl FaultSink for LogSink {
    fn broadcast(&mut self, package: &str, filename: &str, function: &str) {
        debug!("fault_package broadcast: {package} {filename} {function}");
    }
}
