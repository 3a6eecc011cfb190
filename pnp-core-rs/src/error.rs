//! Command error taxonomy
//!
//! Every failure a textual command can run into maps onto one of these
//! variants. They are plain data so an actuator node can report its own
//! rejections inside a `RESPONSE` packet and the router can render them
//! unchanged.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for command routing and feeder operations
pub type Result<T> = std::result::Result<T, Error>;

/// Command failure, rendered to the operator as `error: <reason>`
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Error {
    /// Motion requested while the system enablement flag is off
    #[error("system disabled, enable with M610 S1")]
    SystemDisabled,

    /// Identity unknown to the registration table, or known but stale
    #[error("not registered: N{}{}", .feeder, offline_suffix(.stale))]
    NotRegistered { feeder: u8, stale: bool },

    /// Out-of-range identity, length, angle or flag
    #[error("invalid parameter: {reason}")]
    InvalidParameter { reason: String },

    /// Another command owns the feeder or its state forbids the transition
    #[error("busy: {reason}")]
    Busy { reason: String },

    /// Tape presence was not confirmed at the end of a motion
    #[error("feedback fault (errors: {error_count})")]
    FeedbackFault { error_count: u32 },

    /// No completion signal within the dispatch bound
    #[error("timeout after {after_ms} ms")]
    Timeout { after_ms: u64 },

    /// The datagram could not be handed to the link
    #[error("link failure: {reason}")]
    Link { reason: String },

    /// Line did not parse as a known command
    #[error("unknown command: {line}")]
    UnknownCommand { line: String },
}

fn offline_suffix(stale: &bool) -> &'static str {
    if *stale {
        " (offline)"
    } else {
        ""
    }
}

impl Error {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Error::InvalidParameter {
            reason: reason.into(),
        }
    }

    pub fn busy(reason: impl Into<String>) -> Self {
        Error::Busy {
            reason: reason.into(),
        }
    }

    pub fn link(reason: impl Into<String>) -> Self {
        Error::Link {
            reason: reason.into(),
        }
    }
}
