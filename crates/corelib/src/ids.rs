//! Identifiers shared by the client and server halves of the tracking
//! protocol.
//!
//! A retried RPC keeps its `(client_id, seq_no)` pair for its whole life and
//! bumps only `attempt_no`, which is what lets the server collapse retries
//! into a single execution.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-client sequence number. Strictly increasing, never reused.
pub type SequenceNumber = i64;

/// Attempt counter distinguishing concurrent retries of one sequence number.
pub type AttemptNumber = i64;

/// Sentinel for "no sequence number" (and "no driver attempt").
pub const NO_SEQ_NO: SequenceNumber = -1;

/// Identifies one exactly-once execution unit on the wire.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct RequestId {
    /// Stable identity of the issuing client.
    pub client_id: String,
    /// Sequence number assigned by the client's request tracker.
    pub seq_no: SequenceNumber,
    /// Client's low-water mark at send time; every sequence number below it
    /// has been fully processed by the client.
    pub first_incomplete_seq_no: SequenceNumber,
    /// Retry counter for this sequence number.
    pub attempt_no: AttemptNumber,
}

impl RequestId {
    pub fn new(
        client_id: impl Into<String>,
        seq_no: SequenceNumber,
        first_incomplete_seq_no: SequenceNumber,
        attempt_no: AttemptNumber,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            seq_no,
            first_incomplete_seq_no,
            attempt_no,
        }
    }

    /// Same request, next retry.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt_no: self.attempt_no + 1,
            ..self.clone()
        }
    }

    /// Same request, new attempt number.
    pub fn with_attempt(&self, attempt_no: AttemptNumber) -> Self {
        Self {
            attempt_no,
            ..self.clone()
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} (attempt {}, first incomplete {})",
            self.client_id, self.seq_no, self.attempt_no, self.first_incomplete_seq_no
        )
    }
}
