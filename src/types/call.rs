use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an account, as used for inbox addressing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier of a single call session.
///
/// Generated as 32 uppercase hex characters, e.g.
/// `AC90CFD09DF712D981142B172706F9F2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random call id.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared room channel identifier for one call.
///
/// Both participants derive the same room id independently from the
/// order-independent pair of their account ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the room id for a pair of participants.
    ///
    /// The pair is sorted first, so `for_participants(a, b)` and
    /// `for_participants(b, a)` name the same room.
    pub fn for_participants(a: &AccountId, b: &AccountId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("call:{}-{}", low, high))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether the local account initiated the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Media requested for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Why a call session ended.
///
/// `ConnectionFailed` is kept distinct from the hangup reasons so the UI
/// layer can word it differently ("check your connection").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndCallReason {
    /// Ended locally after being connected or while ringing out.
    UserEnded,
    /// The peer hung up.
    RemoteEnded,
    /// The call was declined (by us or by the peer).
    Declined,
    /// The callee was already in another call.
    Busy,
    /// An outgoing call rang out without an answer.
    NoAnswer,
    /// An incoming call rang out without being answered.
    Missed,
    /// Camera/microphone permission was denied.
    PermissionDenied,
    /// The media transport failed to connect or dropped.
    ConnectionFailed,
    /// The signaling transport became unavailable mid-setup.
    TransportFailed,
}

impl EndCallReason {
    /// True for reasons that are failures rather than ordinary outcomes.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied | Self::ConnectionFailed | Self::TransportFailed
        )
    }
}

impl fmt::Display for EndCallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UserEnded => "user_ended",
            Self::RemoteEnded => "remote_ended",
            Self::Declined => "declined",
            Self::Busy => "busy",
            Self::NoAnswer => "no_answer",
            Self::Missed => "missed",
            Self::PermissionDenied => "permission_denied",
            Self::ConnectionFailed => "connection_failed",
            Self::TransportFailed => "transport_failed",
        };
        f.write_str(s)
    }
}

/// One row of the call history.
///
/// Created when a session starts and completed by teardown; an entry with
/// no `ended_at` is still pending.
#[derive(Debug, Clone, Serialize)]
pub struct CallLogEntry {
    pub call_id: CallId,
    pub peer_id: AccountId,
    pub direction: CallDirection,
    pub media_kind: MediaKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub reason: Option<EndCallReason>,
    /// Seconds between acceptance and teardown, if the call was accepted.
    pub duration_secs: Option<i64>,
}

impl CallLogEntry {
    pub fn is_pending(&self) -> bool {
        self.ended_at.is_none()
    }
}
