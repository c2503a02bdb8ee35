//! Client-side sequence number issuance.
//!
//! Every RPC that wants exactly-once semantics takes a sequence number from
//! its client's `RequestTracker` before the first attempt and hands it back
//! with [`RequestTracker::rpc_completed`] once the client no longer needs the
//! result. The smallest number still outstanding is piggybacked on later
//! requests so servers know which cached results they may discard.

use std::collections::BTreeSet;

use corelib::{RequestId, SequenceNumber};
use parking_lot::Mutex;

/// Issues strictly increasing sequence numbers and tracks which are
/// still outstanding.
///
/// # Invariants
///
/// - Sequence numbers are never reused and never go backward
/// - `first_incomplete()` is ≤ every outstanding sequence number, and equals
///   the next number to be issued when none are outstanding
#[derive(Debug)]
pub struct RequestTracker {
    client_id: String,
    inner: Mutex<TrackerState>,
}

#[derive(Debug)]
struct TrackerState {
    next: SequenceNumber,
    incomplete: BTreeSet<SequenceNumber>,
}

impl TrackerState {
    fn first_incomplete(&self) -> SequenceNumber {
        self.incomplete.first().copied().unwrap_or(self.next)
    }
}

impl RequestTracker {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            inner: Mutex::new(TrackerState {
                next: 0,
                incomplete: BTreeSet::new(),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Take the next sequence number and mark it outstanding.
    pub fn new_seq_no(&self) -> SequenceNumber {
        let mut inner = self.inner.lock();
        let seq_no = inner.next;
        inner.next += 1;
        inner.incomplete.insert(seq_no);
        seq_no
    }

    /// Like [`new_seq_no`](Self::new_seq_no) but returns a complete first
    /// attempt identifier. The watermark is read under the same lock, so it
    /// never exceeds the number it travels with.
    pub fn new_request_id(&self) -> RequestId {
        let mut inner = self.inner.lock();
        let seq_no = inner.next;
        inner.next += 1;
        inner.incomplete.insert(seq_no);
        RequestId::new(self.client_id.clone(), seq_no, inner.first_incomplete(), 0)
    }

    /// Smallest outstanding sequence number, or the next one to be issued if
    /// nothing is outstanding.
    pub fn first_incomplete(&self) -> SequenceNumber {
        self.inner.lock().first_incomplete()
    }

    /// Mark `seq_no` as no longer needed. Completions may arrive in any order.
    pub fn rpc_completed(&self, seq_no: SequenceNumber) {
        let removed = self.inner.lock().incomplete.remove(&seq_no);
        if !removed {
            tracing::warn!(
                client_id = %self.client_id,
                seq_no,
                "completed a sequence number that was not outstanding"
            );
        }
    }

    /// Number of sequence numbers still outstanding.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().incomplete.len()
    }
}
