//! Error types for the drover runtime core.
//!
//! Each layer raises its own enum: [`LinkError`] for the firmware link,
//! [`ConnError`] for command futures, [`RunError`] for controllers,
//! runnables, and the runner. Conversions happen at boundaries only; a
//! transport `io::Error` becomes a `RunError` when it terminates a task,
//! not before.

use std::{fmt, io};

use drover_proto::{ProtocolError, messages::CommandErr};
use thiserror::Error;

/// Errors surfaced by the firmware link.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The link is not synchronized yet; the caller may retry after the
    /// next state change.
    #[error("link not ready")]
    NotReady,

    /// A reply arrived for a later command. The firmware processes
    /// commands strictly in order and never replies backwards, so every
    /// earlier pending command is failed with this error.
    #[error("no reply")]
    NoReply,

    /// The firmware replied with the error bit set.
    #[error("command error {code}")]
    Command {
        /// Firmware error code (reply code with the error bit cleared).
        code: u8,
    },

    /// The link driver stopped; no result will ever arrive.
    #[error("link closed")]
    Closed,

    /// Wire-format violation on the send path.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Byte channel failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors delivered on typed command futures.
#[derive(Error, Debug)]
pub enum ConnError {
    /// No reply arrived within the command expiration.
    #[error("command expired")]
    Expired,

    /// The connection was torn down before a reply arrived.
    #[error("connection closed")]
    Closed,

    /// The controller replied with a failure.
    #[error(transparent)]
    Remote(#[from] CommandErr),

    /// The command could not be written to the transport.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors from controllers, runnables, and the runner.
#[derive(Error, Debug)]
pub enum RunError {
    /// The cancellation scope was cancelled; not a failure.
    #[error("cancelled")]
    Cancelled,

    /// A second interrupt forced the runner to give up waiting.
    #[error("forced exit")]
    ForcedExit,

    /// Wire-format violation.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Firmware link failure.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Transport failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Anything without a structured representation.
    #[error("{0}")]
    Other(String),

    /// Several tasks failed; the individual errors are preserved.
    #[error("{0}")]
    Aggregate(ErrorList),
}

impl RunError {
    /// True for the non-failure exits (`Cancelled`).
    pub fn is_cancel(&self) -> bool {
        matches!(self, RunError::Cancelled)
    }
}

/// Collects errors from multiple tasks into one report.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<RunError>);

impl ErrorList {
    /// Records the error of a finished task; `Ok` is skipped.
    pub fn add(&mut self, res: Result<(), RunError>) {
        if let Err(err) = res {
            self.0.push(err);
        }
    }

    /// Recorded errors.
    pub fn errors(&self) -> &[RunError] {
        &self.0
    }

    /// Folds into a single result: `Ok` when empty, the sole error when
    /// one, an aggregate otherwise.
    pub fn aggregate(mut self) -> Result<(), RunError> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(RunError::Aggregate(self)),
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "multiple errors:")?;
        for err in &self.0 {
            write!(f, "\n{err}")?;
        }
        Ok(())
    }
}
