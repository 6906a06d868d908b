//! Native call UI mirroring.
//!
//! The bridge is a pure side channel: it translates coordinator
//! transitions into calls against the platform's native call UI and hands
//! native user actions back to the coordinator as [`NativeUiEvent`]s. The
//! coordinator's own transitions never depend on it; on platforms without
//! a native call UI, [`NoopCallUi`] is plugged in and everything else
//! behaves identically.

use crate::session::state::ActiveCallSession;
use crate::types::call::{AccountId, CallId, EndCallReason, MediaKind};
use async_trait::async_trait;
use std::sync::Arc;

/// The platform-native call UI capability (e.g. CallKit, ConnectionService).
#[async_trait]
pub trait NativeCallUi: Send + Sync {
    /// Show the native incoming-call screen.
    async fn display_incoming(
        &self,
        call_id: &CallId,
        caller_id: &AccountId,
        caller_name: &str,
        media_kind: MediaKind,
    );

    /// Register an outgoing call with the native UI.
    async fn start_outgoing(&self, call_id: &CallId, callee_name: &str, media_kind: MediaKind);

    /// Mark the call as connected (starts the native call timer).
    async fn report_connected(&self, call_id: &CallId);

    /// Dismiss the native call UI.
    async fn end_call(&self, call_id: &CallId, reason: EndCallReason);
}

/// No-op variant for builds/platforms without a native call UI.
#[derive(Debug, Default)]
pub struct NoopCallUi;

#[async_trait]
impl NativeCallUi for NoopCallUi {
    async fn display_incoming(
        &self,
        _call_id: &CallId,
        _caller_id: &AccountId,
        _caller_name: &str,
        _media_kind: MediaKind,
    ) {
    }

    async fn start_outgoing(&self, _call_id: &CallId, _callee_name: &str, _media_kind: MediaKind) {}

    async fn report_connected(&self, _call_id: &CallId) {}

    async fn end_call(&self, _call_id: &CallId, _reason: EndCallReason) {}
}

/// User actions raised by the native call UI.
///
/// Hold maps onto mute: the negotiation engine offers no hold primitive,
/// so holding silences the local media instead.
#[derive(Debug, Clone)]
pub enum NativeUiEvent {
    Answer { call_id: CallId },
    End { call_id: CallId },
    Mute { call_id: CallId },
    Unmute { call_id: CallId },
    Hold { call_id: CallId },
    Unhold { call_id: CallId },
}

impl NativeUiEvent {
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::Answer { call_id }
            | Self::End { call_id }
            | Self::Mute { call_id }
            | Self::Unmute { call_id }
            | Self::Hold { call_id }
            | Self::Unhold { call_id } => call_id,
        }
    }
}

/// Mirrors coordinator transitions into the native call UI.
pub struct NativeUiBridge {
    ui: Arc<dyn NativeCallUi>,
}

impl NativeUiBridge {
    pub fn new(ui: Arc<dyn NativeCallUi>) -> Self {
        Self { ui }
    }

    pub async fn on_outgoing_started(&self, session: &ActiveCallSession) {
        let name = session
            .peer_name
            .as_deref()
            .unwrap_or_else(|| session.peer_id.as_str());
        self.ui
            .start_outgoing(&session.call_id, name, session.media_kind)
            .await;
    }

    pub async fn on_incoming_offered(&self, session: &ActiveCallSession) {
        let name = session
            .peer_name
            .as_deref()
            .unwrap_or_else(|| session.peer_id.as_str());
        self.ui
            .display_incoming(&session.call_id, &session.peer_id, name, session.media_kind)
            .await;
    }

    pub async fn on_connected(&self, session: &ActiveCallSession) {
        self.ui.report_connected(&session.call_id).await;
    }

    pub async fn on_ended(&self, session: &ActiveCallSession, reason: EndCallReason) {
        self.ui.end_call(&session.call_id, reason).await;
    }
}
