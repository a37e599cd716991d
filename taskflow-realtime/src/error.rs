//! Error taxonomy for the collaboration core.
//!
//! Transport failures are recovered by the reconnect state machine until the
//! retry budget is spent. Lock and version conflicts are business outcomes:
//! they are returned as values (`LockResult`, `SubmitOutcome`) and only turn
//! into errors when a caller asks for that explicitly.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{UserRef, Version};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RealtimeError {
    /// A coordination call was made outside `ConnectionState::Connected`.
    #[error("Not connected")]
    NotConnected,

    #[error("Lock held by {}: {reason}", holder_name(.held_by))]
    LockConflict {
        held_by: Option<UserRef>,
        reason: String,
    },

    #[error("Version conflict (server is at {current:?})")]
    VersionConflict { current: Option<Version> },

    /// Socket error or dropped link. The outcome of any in-flight request is unknown.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// The server answered but refused the request.
    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

fn holder_name(held_by: &Option<UserRef>) -> &str {
    held_by.as_ref().map_or("another session", UserRef::display_name)
}

impl RealtimeError {
    /// Whether the request may have reached the server anyway.
    ///
    /// Callers must re-verify state before retrying anything for which this
    /// returns `true`.
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(self, Self::TransportFailure(_) | Self::Timeout(_))
    }
}

impl From<serde_json::Error> for RealtimeError {
    fn from(e: serde_json::Error) -> Self {
        RealtimeError::Serialization(e.to_string())
    }
}
