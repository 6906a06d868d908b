//! Call history capability.
//!
//! Storage is the embedding application's concern; the coordinator only
//! guarantees that every entry it opens is completed by teardown, on every
//! exit path.

use crate::types::call::{CallId, CallLogEntry, EndCallReason};
use async_trait::async_trait;
use std::sync::Mutex;

/// Sink for call history entries.
#[async_trait]
pub trait CallLog: Send + Sync {
    /// A session was created; the entry is pending.
    async fn call_started(&self, entry: CallLogEntry);

    /// The session was torn down; completes the pending entry.
    async fn call_finished(
        &self,
        call_id: &CallId,
        reason: EndCallReason,
        duration_secs: Option<i64>,
    );
}

/// Discards all entries.
#[derive(Debug, Default)]
pub struct NoopCallLog;

#[async_trait]
impl CallLog for NoopCallLog {
    async fn call_started(&self, _entry: CallLogEntry) {}

    async fn call_finished(
        &self,
        _call_id: &CallId,
        _reason: EndCallReason,
        _duration_secs: Option<i64>,
    ) {
    }
}

/// Keeps entries in memory, in insertion order.
#[derive(Debug, Default)]
pub struct MemoryCallLog {
    entries: Mutex<Vec<CallLogEntry>>,
}

impl MemoryCallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<CallLogEntry> {
        self.entries.lock().expect("call log lock").clone()
    }
}

#[async_trait]
impl CallLog for MemoryCallLog {
    async fn call_started(&self, entry: CallLogEntry) {
        self.entries.lock().expect("call log lock").push(entry);
    }

    async fn call_finished(
        &self,
        call_id: &CallId,
        reason: EndCallReason,
        duration_secs: Option<i64>,
    ) {
        let mut entries = self.entries.lock().expect("call log lock");
        if let Some(entry) = entries
            .iter_mut()
            .rev()
            .find(|e| &e.call_id == call_id && e.is_pending())
        {
            entry.ended_at = Some(chrono::Utc::now());
            entry.reason = Some(reason);
            entry.duration_secs = duration_secs;
        }
    }
}
