//! JSON wire protocol shared by the client core and the coordination server.
//!
//! Every frame on the socket has the same shape, inbound and outbound:
//! ```text
//! { "channel": "task.42.comments", "resourceId": "42", "data": {...}, "requestId": 7 }
//!                                   └── optional ──┘                 └── optional ──┘
//! ```
//!
//! Channels under `system.`, `edit.` plus `presence`/`typing` are reserved
//! (see [`channels`]). Frames carrying a `requestId` are request/response
//! pairs and never reach channel listeners.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RealtimeError;

/// Reserved channel names.
pub mod channels {
    pub const SUBSCRIBE: &str = "system.subscribe";
    pub const UNSUBSCRIBE: &str = "system.unsubscribe";
    pub const PING: &str = "system.ping";
    pub const PONG: &str = "system.pong";
    pub const ERROR: &str = "system.error";
    pub const LOCK_ACQUIRE: &str = "edit.lock.acquire";
    pub const LOCK_RELEASE: &str = "edit.lock.release";
    pub const OPERATION_SUBMIT: &str = "edit.operation.submit";
    pub const OPERATION_APPLIED: &str = "edit.operation.applied";
    pub const PRESENCE: &str = "presence";
    pub const TYPING: &str = "typing";

    /// Prefix for protocol plumbing that is never dispatched to listeners.
    pub const SYSTEM_PREFIX: &str = "system.";
}

/// Identity of a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl UserRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Name for UI notices; falls back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Monotonically increasing resource version. The server is the arbiter.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    pub const INITIAL: Version = Version(0);

    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Addressing for a lockable / editable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub resource_type: String,
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
}

impl ResourceRef {
    pub fn new(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            section_id: None,
        }
    }

    pub fn with_section(mut self, section_id: impl Into<String>) -> Self {
        self.section_id = Some(section_id.into());
        self
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.section_id {
            Some(section) => write!(f, "{}/{}#{}", self.resource_type, self.resource_id, section),
            None => write!(f, "{}/{}", self.resource_type, self.resource_id),
        }
    }
}

/// A single frame on the persistent connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

impl Frame {
    /// Plain pub/sub frame.
    pub fn publish(channel: impl Into<String>, resource_id: Option<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            resource_id,
            data,
            request_id: None,
        }
    }

    /// Wire-level subscribe for one `(channel, resourceId)` key.
    pub fn subscribe(channel: &str, resource_id: Option<&str>) -> Self {
        Self::subscription_control(channels::SUBSCRIBE, channel, resource_id)
    }

    /// Wire-level unsubscribe for one `(channel, resourceId)` key.
    pub fn unsubscribe(channel: &str, resource_id: Option<&str>) -> Self {
        Self::subscription_control(channels::UNSUBSCRIBE, channel, resource_id)
    }

    fn subscription_control(control: &str, channel: &str, resource_id: Option<&str>) -> Self {
        let request = SubscriptionRequest {
            channel: channel.to_string(),
            resource_id: resource_id.map(str::to_string),
        };
        Self {
            channel: control.to_string(),
            resource_id: None,
            data: serde_json::to_value(request).unwrap_or(Value::Null),
            request_id: None,
        }
    }

    /// Request frame awaiting a correlated response.
    pub fn request<T: Serialize>(
        channel: &str,
        request_id: u64,
        payload: &T,
    ) -> Result<Self, RealtimeError> {
        Ok(Self {
            channel: channel.to_string(),
            resource_id: None,
            data: serde_json::to_value(payload)?,
            request_id: Some(request_id),
        })
    }

    /// Response to `self`, echoing channel and request id.
    pub fn respond<T: Serialize>(&self, payload: &T) -> Result<Self, RealtimeError> {
        Ok(Self {
            channel: self.channel.clone(),
            resource_id: self.resource_id.clone(),
            data: serde_json::to_value(payload)?,
            request_id: self.request_id,
        })
    }

    pub fn ping() -> Self {
        Self::publish(channels::PING, None, Value::Null)
    }

    pub fn pong() -> Self {
        Self::publish(channels::PONG, None, Value::Null)
    }

    /// Whether this frame is protocol plumbing rather than application traffic.
    pub fn is_system(&self) -> bool {
        self.channel.starts_with(channels::SYSTEM_PREFIX)
    }

    /// Deserialize `data` into a typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, RealtimeError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, RealtimeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, RealtimeError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Body of `system.subscribe` / `system.unsubscribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

// ───────────────────────────────────────────────────────────────────
// Edit locks
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    #[serde(flatten)]
    pub resource: ResourceRef,
    pub user: UserRef,
}

/// Server verdict on a lock acquisition.
///
/// The client never assumes a lock for which it did not receive
/// `success: true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub held_by: Option<UserRef>,
    /// Unix milliseconds. Informational; expiry is enforced server-side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl LockResult {
    pub fn granted(lock_id: impl Into<String>, expires_at: Option<u64>) -> Self {
        Self {
            success: true,
            lock_id: Some(lock_id.into()),
            error: None,
            held_by: None,
            expires_at,
        }
    }

    pub fn denied(held_by: Option<UserRef>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            lock_id: None,
            error: Some(error.into()),
            held_by,
            expires_at: None,
        }
    }

    /// Convert into a grant, or a `LockConflict` error the UI can surface.
    pub fn into_grant(self) -> Result<LockGrant, RealtimeError> {
        match (self.success, self.lock_id) {
            (true, Some(lock_id)) => Ok(LockGrant {
                lock_id,
                expires_at: self.expires_at,
            }),
            (true, None) => Err(RealtimeError::Serialization(
                "lock granted without a lock id".into(),
            )),
            (false, _) => Err(RealtimeError::LockConflict {
                held_by: self.held_by,
                reason: self.error.unwrap_or_else(|| "lock unavailable".into()),
            }),
        }
    }
}

/// A lock the server confirmed as ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub lock_id: String,
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseResult {
    pub released: bool,
}

// ───────────────────────────────────────────────────────────────────
// Optimistic operations
// ───────────────────────────────────────────────────────────────────

/// A caller-defined edit delta plus the resource it targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditOperation {
    pub target: ResourceRef,
    pub payload: Value,
}

impl EditOperation {
    pub fn new(target: ResourceRef, payload: Value) -> Self {
        Self { target, payload }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    pub operation: Value,
    #[serde(flatten)]
    pub resource: ResourceRef,
    pub version: Version,
    pub user: UserRef,
}

/// Wire form of the server's verdict on a submitted operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_version: Option<Version>,
    #[serde(default)]
    pub conflict: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationResult {
    pub fn accepted(new_version: Version) -> Self {
        Self {
            success: true,
            new_version: Some(new_version),
            conflict: false,
            server_state: None,
            error: None,
        }
    }

    pub fn conflict(current: Version, server_state: Value) -> Self {
        Self {
            success: false,
            new_version: Some(current),
            conflict: true,
            server_state: Some(server_state),
            error: Some(format!("stale base version, server is at {current}")),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            new_version: None,
            conflict: false,
            server_state: None,
            error: Some(reason.into()),
        }
    }
}

/// Exhaustive outcome of an optimistic submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Adopt `new_version` as the baseline for the next edit.
    Accepted { new_version: Version },
    /// The base version was stale. Discard optimistic state and resync.
    Conflict {
        current_version: Option<Version>,
        server_state: Option<Value>,
    },
    /// The server refused the operation for another reason.
    Failed { reason: String },
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SubmitOutcome::Conflict { .. })
    }

    /// New baseline version, or the conflict/failure as an error.
    pub fn into_version(self) -> Result<Version, RealtimeError> {
        match self {
            SubmitOutcome::Accepted { new_version } => Ok(new_version),
            SubmitOutcome::Conflict {
                current_version, ..
            } => Err(RealtimeError::VersionConflict {
                current: current_version,
            }),
            SubmitOutcome::Failed { reason } => Err(RealtimeError::Rejected(reason)),
        }
    }
}

impl From<OperationResult> for SubmitOutcome {
    fn from(result: OperationResult) -> Self {
        if result.conflict {
            return SubmitOutcome::Conflict {
                current_version: result.new_version,
                server_state: result.server_state,
            };
        }
        match (result.success, result.new_version) {
            (true, Some(new_version)) => SubmitOutcome::Accepted { new_version },
            (true, None) => SubmitOutcome::Failed {
                reason: "accepted without a new version".into(),
            },
            (false, _) => SubmitOutcome::Failed {
                reason: result.error.unwrap_or_else(|| "operation rejected".into()),
            },
        }
    }
}

/// Broadcast on `edit.operation.applied` after the server accepts an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationApplied {
    pub resource_type: String,
    pub version: Version,
    pub operation: Value,
    pub user: UserRef,
}

// ───────────────────────────────────────────────────────────────────
// Presence & typing
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub user: UserRef,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_view: Option<String>,
    /// Sender clock in Unix milliseconds; receivers keep the latest.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUpdate {
    pub user: UserRef,
    pub resource_type: String,
    pub is_typing: bool,
    pub timestamp: u64,
}

/// Current wall clock in Unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
