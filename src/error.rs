//! # Error types used by the supervisory core.
//!
//! [`Error`] is the taxonomy every public operation reports through:
//!
//! - [`Error::Already`]: idempotent no-op; the requested condition holds.
//! - [`Error::Invalid`]: caller misuse, or the record's state does not
//!   permit the operation.
//! - [`Error::NotExist`]: lookup miss. Lookups never create sentinel
//!   records.
//! - [`Error::Fault`]: an external subsystem (launcher, wire link, package
//!   store) failed.
//!
//! Launcher status codes have their own enum, [`LaunchError`], because they
//! are the only errors that feed back into relaunch policy.
//!
//! [`LaunchError`]: crate::launcher::LaunchError

use thiserror::Error;

/// Errors produced by the supervisory core.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// The requested condition already holds; nothing was done.
    #[error("already in the requested condition")]
    Already,

    /// The operation is not permitted for the record's current state,
    /// or the arguments are unusable.
    #[error("invalid request for the current state")]
    Invalid,

    /// No record matched the lookup.
    #[error("no such record")]
    NotExist,

    /// An external subsystem failed.
    #[error("external subsystem failure: {reason}")]
    Fault {
        /// What failed, for the log line.
        reason: String,
    },
}

impl Error {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::Already => "already",
            Error::Invalid => "invalid",
            Error::NotExist => "not_exist",
            Error::Fault { .. } => "fault",
        }
    }

    /// Builds an [`Error::Fault`] from anything printable.
    pub fn fault(reason: impl Into<String>) -> Self {
        Error::Fault {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        assert_eq!(Error::Already.as_label(), "already");
        assert_eq!(Error::Invalid.as_label(), "invalid");
        assert_eq!(Error::NotExist.as_label(), "not_exist");
        assert_eq!(Error::fault("launcher").as_label(), "fault");
    }
}
