//! Shared test doubles for the call subsystem.

use crate::negotiation::engine::{
    ConnectionState, EngineError, EngineEvent, MediaEngine, MediaEngineFactory, SdpKind,
};
use crate::session::log::CallLog;
use crate::signaling::message::IceCandidate;
use crate::types::call::{AccountId, CallId, CallLogEntry, EndCallReason, MediaKind};
use crate::ui::bridge::NativeCallUi;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Scripted media engine. Offers and answers are canned SDP strings; the
/// test drives connection-state and candidate events by hand.
pub struct MockMediaEngine {
    deny_permission: bool,
    events: broadcast::Sender<EngineEvent>,
    media_acquired: AtomicBool,
    muted: AtomicBool,
    offers_created: AtomicUsize,
    answers_created: AtomicUsize,
    release_calls: AtomicUsize,
    close_calls: AtomicUsize,
    remote_descriptions: Mutex<Vec<(SdpKind, String)>>,
    applied_candidates: Mutex<Vec<IceCandidate>>,
}

impl MockMediaEngine {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    /// An engine whose media acquisition fails with a permission error.
    pub fn denying_permission() -> Arc<Self> {
        Self::build(true)
    }

    fn build(deny_permission: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            deny_permission,
            events,
            media_acquired: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            offers_created: AtomicUsize::new(0),
            answers_created: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            remote_descriptions: Mutex::new(Vec::new()),
            applied_candidates: Mutex::new(Vec::new()),
        })
    }

    pub fn emit_connection_state(&self, state: ConnectionState) {
        let _ = self.events.send(EngineEvent::ConnectionState(state));
    }

    pub fn emit_candidate(&self, candidate: IceCandidate) {
        let _ = self.events.send(EngineEvent::IceCandidate(candidate));
    }

    pub fn emit_remote_media(&self) {
        let _ = self.events.send(EngineEvent::RemoteMedia);
    }

    pub fn media_acquired(&self) -> bool {
        self.media_acquired.load(Ordering::SeqCst)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn offers_created(&self) -> usize {
        self.offers_created.load(Ordering::SeqCst)
    }

    pub fn answers_created(&self) -> usize {
        self.answers_created.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn remote_descriptions(&self) -> Vec<(SdpKind, String)> {
        self.remote_descriptions.lock().unwrap().clone()
    }

    /// Candidates in the order they reached the engine.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied_candidates.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn acquire_media(&self, _kind: MediaKind) -> Result<(), EngineError> {
        if self.deny_permission {
            return Err(EngineError::PermissionDenied(
                "microphone access denied".to_string(),
            ));
        }
        self.media_acquired.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn release_media(&self) {
        self.media_acquired.store(false, Ordering::SeqCst);
        self.release_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    async fn create_offer(&self) -> Result<String, EngineError> {
        let n = self.offers_created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("v=0 mock-offer-{}", n))
    }

    async fn create_answer(&self) -> Result<String, EngineError> {
        let n = self.answers_created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("v=0 mock-answer-{}", n))
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), EngineError> {
        self.remote_descriptions.lock().unwrap().push((kind, sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.applied_candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

/// Factory that records every engine it hands out, so tests can reach the
/// engine created for a call.
pub struct MockEngineFactory {
    deny_permission: bool,
    engines: Mutex<Vec<Arc<MockMediaEngine>>>,
}

impl MockEngineFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            deny_permission: false,
            engines: Mutex::new(Vec::new()),
        })
    }

    pub fn denying_permission() -> Arc<Self> {
        Arc::new(Self {
            deny_permission: true,
            engines: Mutex::new(Vec::new()),
        })
    }

    pub fn engines(&self) -> Vec<Arc<MockMediaEngine>> {
        self.engines.lock().unwrap().clone()
    }

    pub fn last_engine(&self) -> Option<Arc<MockMediaEngine>> {
        self.engines.lock().unwrap().last().cloned()
    }
}

impl MediaEngineFactory for MockEngineFactory {
    fn create_engine(&self) -> Arc<dyn MediaEngine> {
        let engine = if self.deny_permission {
            MockMediaEngine::denying_permission()
        } else {
            MockMediaEngine::new()
        };
        self.engines.lock().unwrap().push(engine.clone());
        engine
    }
}

/// Native call UI double that records every invocation as a line of text.
#[derive(Default)]
pub struct RecordingCallUi {
    calls: Mutex<Vec<String>>,
}

impl RecordingCallUi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, line: String) {
        self.calls.lock().unwrap().push(line);
    }
}

#[async_trait]
impl NativeCallUi for RecordingCallUi {
    async fn display_incoming(
        &self,
        call_id: &CallId,
        caller_id: &AccountId,
        _caller_name: &str,
        _media_kind: MediaKind,
    ) {
        self.record(format!("display_incoming {} {}", call_id, caller_id));
    }

    async fn start_outgoing(&self, call_id: &CallId, _callee_name: &str, _media_kind: MediaKind) {
        self.record(format!("start_outgoing {}", call_id));
    }

    async fn report_connected(&self, call_id: &CallId) {
        self.record(format!("report_connected {}", call_id));
    }

    async fn end_call(&self, call_id: &CallId, reason: EndCallReason) {
        self.record(format!("end_call {} {}", call_id, reason));
    }
}

/// Call log double counting completions, for teardown idempotency checks.
#[derive(Default)]
pub struct CountingCallLog {
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl CountingCallLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CallLog for CountingCallLog {
    async fn call_started(&self, _entry: CallLogEntry) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    async fn call_finished(
        &self,
        _call_id: &CallId,
        _reason: EndCallReason,
        _duration_secs: Option<i64>,
    ) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}
