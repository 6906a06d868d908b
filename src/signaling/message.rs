//! Wire records exchanged over the signaling transport.
//!
//! Every message between two call participants is a [`CallSignal`]: a small
//! JSON record carrying the signal kind, the participant ids, and a
//! kind-dependent payload (SDP for offer/answer, an ICE candidate for
//! candidate exchange). Signals are delivered best-effort and unordered
//! across channels; the session coordinator's guards absorb duplicates and
//! reordering.

use crate::types::call::{AccountId, CallId, MediaKind, RoomId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Signal kinds used for call control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Initial call invitation, sent to the callee's inbox.
    CallRequest,
    /// The callee's device is alerting. Advisory; sent into the room.
    CallRinging,
    /// The callee accepted. Triggers offer creation on the caller side.
    CallAccept,
    /// The call was declined, or the callee was busy.
    CallReject,
    /// The call ended. Can be sent by either party at any time.
    CallEnd,
    /// SDP offer from the caller.
    Offer,
    /// SDP answer from the callee.
    Answer,
    /// A single ICE candidate for connectivity establishment.
    IceCandidate,
}

impl SignalKind {
    /// Wire tag for this kind.
    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::CallRequest => "call-request",
            Self::CallRinging => "call-ringing",
            Self::CallAccept => "call-accept",
            Self::CallReject => "call-reject",
            Self::CallEnd => "call-end",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }

    /// Parse from a wire tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "call-request" => Some(Self::CallRequest),
            "call-ringing" => Some(Self::CallRinging),
            "call-accept" => Some(Self::CallAccept),
            "call-reject" => Some(Self::CallReject),
            "call-end" => Some(Self::CallEnd),
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "ice-candidate" => Some(Self::IceCandidate),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_name())
    }
}

/// An ICE candidate as exchanged between peers.
///
/// Field names follow the WebRTC candidate-init JSON shape so the payload
/// can be handed to the media engine unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_mline_index(mut self, index: u16) -> Self {
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Kind-dependent signal payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalPayload {
    /// SDP blob for `offer` / `answer`.
    Sdp(String),
    /// Candidate data for `ice-candidate`.
    Candidate(IceCandidate),
}

/// A single signaling record, exchanged verbatim over the transport.
///
/// `sender_id` identifies the publishing account: room channels deliver to
/// every subscriber, so each side drops signals it published itself.
/// `timestamp` is informational only and never used for ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSignal {
    pub kind: SignalKind,
    pub call_id: CallId,
    pub room_id: RoomId,
    pub sender_id: AccountId,
    pub caller_id: AccountId,
    pub callee_id: AccountId,
    pub media_kind: MediaKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<SignalPayload>,
    pub timestamp: DateTime<Utc>,
}

impl CallSignal {
    pub fn new(
        kind: SignalKind,
        call_id: CallId,
        room_id: RoomId,
        sender_id: AccountId,
        caller_id: AccountId,
        callee_id: AccountId,
        media_kind: MediaKind,
    ) -> Self {
        Self {
            kind,
            call_id,
            room_id,
            sender_id,
            caller_id,
            callee_id,
            media_kind,
            payload: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_sdp(mut self, sdp: impl Into<String>) -> Self {
        self.payload = Some(SignalPayload::Sdp(sdp.into()));
        self
    }

    pub fn with_candidate(mut self, candidate: IceCandidate) -> Self {
        self.payload = Some(SignalPayload::Candidate(candidate));
        self
    }

    /// SDP payload, if this is an offer/answer signal.
    pub fn sdp(&self) -> Option<&str> {
        match &self.payload {
            Some(SignalPayload::Sdp(sdp)) => Some(sdp),
            _ => None,
        }
    }

    /// Candidate payload, if this is an ice-candidate signal.
    pub fn candidate(&self) -> Option<&IceCandidate> {
        match &self.payload {
            Some(SignalPayload::Candidate(c)) => Some(c),
            _ => None,
        }
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse from the JSON wire form.
    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}

/// Payload delivered by the push-wake collaborator while the process is
/// not running. Equivalent to receiving a `call-request` on the inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallPayload {
    pub call_id: CallId,
    pub caller_id: AccountId,
    pub caller_name: Option<String>,
    pub media_kind: MediaKind,
    pub room_id: RoomId,
}

impl IncomingCallPayload {
    /// Reconstruct the `call-request` signal this payload stands in for.
    pub fn into_signal(self, callee_id: AccountId) -> CallSignal {
        CallSignal::new(
            SignalKind::CallRequest,
            self.call_id,
            self.room_id,
            self.caller_id.clone(),
            self.caller_id,
            callee_id,
            self.media_kind,
        )
    }
}
