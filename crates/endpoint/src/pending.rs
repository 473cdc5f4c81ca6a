//! Pending registry: correlation ids, queued calls and completion handles.
//!
//! Requests and events share one table keyed by integer id. Request ids
//! count up from 1 and event ids count down from 2^53 - 1, so the two spaces
//! never meet within the lifetime of a connection.
//!
//! ```text
//!   application call
//!         │
//!         ▼
//!   ┌──────────────┐  transport open   ┌──────────┐  response   ┌─────────┐
//!   │  ToBeSent    │ ───────────────▶ │   Sent   │ ──────────▶ │ removed │
//!   └──────────────┘  (housekeeping)   └──────────┘  timeout    └─────────┘
//!         │                                  │       close
//!         └──────────── close ───────────────┘
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use xmn_protocol::{Payload, ProtocolError, Result, WireObject, WireResponse};

/// First request sequence id on a connection.
pub const FIRST_REQUEST_SEQ: u64 = 1;

/// First event id on a connection (largest integer exactly representable by
/// a JavaScript peer).
pub const FIRST_EVENT_ID: u64 = (1 << 53) - 1;

/// Sender half of a completion handle.
pub type Completion = oneshot::Sender<Result<Payload>>;

/// Receiver half of a completion handle, held by the caller.
pub type CompletionHandle = oneshot::Receiver<Result<Payload>>;

/// Kind of pending call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    /// Awaits a correlated response.
    Request,
    /// Completes once written.
    Event,
}

/// Lifecycle status of a pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    /// Queued until the transport is open and unblocked.
    ToBeSent,
    /// Written; waiting for its response.
    Sent,
}

/// An in-flight or queued call.
#[derive(Debug)]
pub struct PendingEntry {
    kind: PendingKind,
    name: String,
    /// Retained until the entry is written.
    data: Option<Payload>,
    ts: u64,
    status: PendingStatus,
    seq: u64,
    order: u64,
    sent_at: Option<Instant>,
    completion: Option<Completion>,
}

impl PendingEntry {
    /// Call kind.
    pub fn kind(&self) -> PendingKind {
        self.kind
    }

    /// Api or event name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status.
    pub fn status(&self) -> PendingStatus {
        self.status
    }

    /// Correlation id.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Timestamp captured when the call was issued.
    pub fn ts(&self) -> u64 {
        self.ts
    }

    fn to_wire(&self) -> WireObject {
        let data = self.data.clone().unwrap_or_default();
        match self.kind {
            PendingKind::Request => WireObject::request(&self.name, self.seq, self.ts, data),
            PendingKind::Event => WireObject::event(&self.name, self.ts, data),
        }
    }

    fn complete(&mut self, result: Result<Payload>) {
        if let Some(completion) = self.completion.take() {
            // The caller may have dropped its handle.
            let _ = completion.send(result);
        }
    }
}

/// Tracks every pending call of one connection.
#[derive(Debug)]
pub struct PendingRegistry {
    entries: HashMap<u64, PendingEntry>,
    next_request_seq: u64,
    next_event_id: u64,
    next_order: u64,
}

impl PendingRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_request_seq: FIRST_REQUEST_SEQ,
            next_event_id: FIRST_EVENT_ID,
            next_order: 0,
        }
    }

    /// Allocates the next request sequence id.
    pub fn next_request_seq(&mut self) -> u64 {
        let seq = self.next_request_seq;
        self.next_request_seq += 1;
        seq
    }

    /// Allocates the next event id.
    pub fn next_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id -= 1;
        id
    }

    /// Queues a request; returns its sequence id.
    pub fn queue_request(
        &mut self,
        api: impl Into<String>,
        ts: u64,
        data: Payload,
        completion: Completion,
    ) -> u64 {
        let seq = self.next_request_seq();
        self.insert(PendingKind::Request, api.into(), seq, ts, data, completion);
        seq
    }

    /// Queues an event; returns its id.
    pub fn queue_event(
        &mut self,
        name: impl Into<String>,
        ts: u64,
        data: Payload,
        completion: Completion,
    ) -> u64 {
        let id = self.next_event_id();
        self.insert(PendingKind::Event, name.into(), id, ts, data, completion);
        id
    }

    fn insert(
        &mut self,
        kind: PendingKind,
        name: String,
        seq: u64,
        ts: u64,
        data: Payload,
        completion: Completion,
    ) {
        let order = self.next_order;
        self.next_order += 1;
        self.entries.insert(
            seq,
            PendingEntry {
                kind,
                name,
                data: Some(data),
                ts,
                status: PendingStatus::ToBeSent,
                seq,
                order,
                sent_at: None,
                completion: Some(completion),
            },
        );
    }

    /// Returns an entry by id.
    pub fn get(&self, seq: u64) -> Option<&PendingEntry> {
        self.entries.get(&seq)
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wire form of a queued entry.
    pub fn wire_object(&self, seq: u64) -> Option<WireObject> {
        self.entries
            .get(&seq)
            .filter(|e| e.status == PendingStatus::ToBeSent)
            .map(PendingEntry::to_wire)
    }

    /// Every queued entry in issuance order, as `(id, wire object)`.
    pub fn flushable(&self) -> Vec<(u64, WireObject)> {
        let mut queued: Vec<&PendingEntry> = self
            .entries
            .values()
            .filter(|e| e.status == PendingStatus::ToBeSent)
            .collect();
        queued.sort_by_key(|e| e.order);
        queued.into_iter().map(|e| (e.seq, e.to_wire())).collect()
    }

    /// Records that an entry was written.
    ///
    /// Requests move to `Sent` and drop their payload. Events are removed and
    /// their completion resolves.
    pub fn mark_sent(&mut self, seq: u64, now: Instant) {
        let Some(entry) = self.entries.get_mut(&seq) else {
            return;
        };

        match entry.kind {
            PendingKind::Request => {
                entry.status = PendingStatus::Sent;
                entry.data = None;
                entry.sent_at = Some(now);
            }
            PendingKind::Event => {
                if let Some(mut entry) = self.entries.remove(&seq) {
                    entry.complete(Ok(Payload::Empty));
                }
            }
        }
    }

    /// Resolves the request a response correlates to.
    ///
    /// Returns `false` if no request with that sequence id is pending, which
    /// happens for duplicates and for responses arriving after a timeout.
    pub fn resolve(&mut self, response: WireResponse) -> bool {
        let pending_request = self
            .entries
            .get(&response.seq)
            .is_some_and(|e| e.kind == PendingKind::Request);
        if !pending_request {
            tracing::warn!(seq = response.seq, "Response for unknown request, dropping");
            return false;
        }

        let Some(mut entry) = self.entries.remove(&response.seq) else {
            return false;
        };

        let result = match response.error {
            None => Ok(response.data),
            Some(code) => Err(remote_error(&code, response.data)),
        };

        tracing::debug!(
            seq = entry.seq,
            api = %entry.name,
            ok = result.is_ok(),
            "Resolved request"
        );
        entry.complete(result);
        true
    }

    /// Rejects every sent request older than `timeout` with `Timeout`.
    ///
    /// Returns the number of requests rejected.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> usize {
        let expired: Vec<u64> = self
            .entries
            .values()
            .filter(|e| {
                e.status == PendingStatus::Sent
                    && e.sent_at
                        .is_some_and(|at| now.saturating_duration_since(at) >= timeout)
            })
            .map(|e| e.seq)
            .collect();

        for seq in &expired {
            if let Some(mut entry) = self.entries.remove(seq) {
                tracing::warn!(seq = entry.seq, api = %entry.name, "Request timed out");
                entry.complete(Err(ProtocolError::Timeout(format!(
                    "{} timed out after {}ms",
                    entry.name,
                    timeout.as_millis()
                ))));
            }
        }
        expired.len()
    }

    /// Fails every entry with `NotConnected` and empties the registry.
    ///
    /// Returns the number of entries failed.
    pub fn fail_all(&mut self) -> usize {
        let count = self.entries.len();
        for (_, mut entry) in self.entries.drain() {
            entry.complete(Err(ProtocolError::NotConnected));
        }
        if count > 0 {
            tracing::debug!(count, "Failed pending entries");
        }
        count
    }
}

impl Default for PendingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps an error response from the peer to a local error.
fn remote_error(code: &str, data: Payload) -> ProtocolError {
    let message = match data.into_json() {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    };

    match code {
        "UnknownApi" => ProtocolError::UnknownApi(message),
        "UnknownEvent" => ProtocolError::UnknownEvent(message),
        "PermissionDenied" => ProtocolError::PermissionDenied(message),
        _ => ProtocolError::handler_fault(code, message),
    }
}
