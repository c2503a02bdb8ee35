//! Per-client and per-request bookkeeping.

use std::collections::BTreeSet;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use corelib::{AccountedMap, AttemptNumber, ErrorStatus, MemoryBudget, MemoryFootprint, RpcErrorCode, SequenceNumber, StalePolicy};
use tracing::debug;

use super::RpcState;
use crate::context::RpcContext;

/// A reply computed under the tracker lock and delivered after releasing it.
pub(crate) enum Reply {
    Success(Arc<dyn RpcContext>, Bytes),
    Failure(Arc<dyn RpcContext>, ErrorStatus),
}

impl Reply {
    pub(crate) fn send(self) {
        match self {
            Reply::Success(context, response) => context.reply_success(response),
            Reply::Failure(context, status) => context.reply_failure(status),
        }
    }
}

pub(crate) fn send_all(replies: Vec<Reply>) {
    for reply in replies {
        reply.send();
    }
}

pub(crate) fn stale_status(client_id: &str, seq_no: SequenceNumber, stale_before: SequenceNumber) -> ErrorStatus {
    ErrorStatus::new(
        RpcErrorCode::RequestStale,
        format!("request {client_id}:{seq_no} is below the client's first incomplete sequence number {stale_before}"),
    )
}

/// One attempt waiting for the outcome of a request.
pub(crate) struct OngoingRpc {
    pub context: Arc<dyn RpcContext>,
    pub attempt_no: AttemptNumber,
}

pub(crate) struct CompletionRecord {
    pub state: RpcState,
    /// [`NO_SEQ_NO`](corelib::NO_SEQ_NO) while nobody is driving.
    pub driver_attempt_no: AttemptNumber,
    pub last_updated: Instant,
    pub response: Option<Bytes>,
    pub ongoing: Vec<OngoingRpc>,
}

impl CompletionRecord {
    pub fn new(driver_attempt_no: AttemptNumber, context: Arc<dyn RpcContext>, now: Instant) -> Self {
        Self {
            state: RpcState::InProgress,
            driver_attempt_no,
            last_updated: now,
            response: None,
            ongoing: vec![OngoingRpc {
                context,
                attempt_no: driver_attempt_no,
            }],
        }
    }

    pub fn enqueue(&mut self, context: Arc<dyn RpcContext>, attempt_no: AttemptNumber, now: Instant) {
        self.ongoing.push(OngoingRpc { context, attempt_no });
        self.last_updated = now;
    }

    /// True while some queued entry of the driver can still be answered.
    pub fn driver_reachable(&self) -> bool {
        self.ongoing
            .iter()
            .any(|o| o.attempt_no == self.driver_attempt_no && o.context.is_reachable())
    }

    /// Remove and return every queued entry `handler_attempt_no` must answer.
    pub fn take_handled(&mut self, handler_attempt_no: AttemptNumber) -> Vec<OngoingRpc> {
        let ongoing = mem::take(&mut self.ongoing);
        let (handled, kept): (Vec<_>, Vec<_>) = ongoing
            .into_iter()
            .partition(|o| must_handle_rpc(handler_attempt_no, self, o));
        self.ongoing = kept;
        handled
    }
}

/// Whether the attempt reporting an outcome answers `ongoing`.
///
/// An attempt always answers its own entries. Once the record is COMPLETED
/// the driver also answers everyone else, since they all get the cached
/// response. Every other combination is left alone so that no entry is
/// answered twice.
pub(crate) fn must_handle_rpc(
    handler_attempt_no: AttemptNumber,
    record: &CompletionRecord,
    ongoing: &OngoingRpc,
) -> bool {
    if ongoing.attempt_no == handler_attempt_no {
        return true;
    }
    record.state == RpcState::Completed && record.driver_attempt_no == handler_attempt_no
}

impl MemoryFootprint for CompletionRecord {
    fn memory_footprint(&self) -> usize {
        mem::size_of::<Self>()
            + self.response.as_ref().map_or(0, Bytes::len)
            + self.ongoing.capacity() * mem::size_of::<OngoingRpc>()
    }
}

impl fmt::Display for CompletionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (driver attempt {}, {} waiting",
            self.state.name(),
            self.driver_attempt_no,
            self.ongoing.len()
        )?;
        if let Some(response) = &self.response {
            write!(f, ", {} byte response", response.len())?;
        }
        write!(f, ")")
    }
}

pub(crate) struct ClientState {
    pub last_heard_from: Instant,
    /// Every sequence number below this is known complete on the client.
    pub stale_before_seq_no: SequenceNumber,
    pub records: AccountedMap<SequenceNumber, CompletionRecord>,
    /// Sequence numbers whose record was dropped under
    /// [`StalePolicy::AbandonEarly`] while the driver was still running. The
    /// client is kept until each of those drivers reports.
    pub abandoned: BTreeSet<SequenceNumber>,
}

impl ClientState {
    pub fn new(budget: Arc<MemoryBudget>, now: Instant) -> Self {
        Self {
            last_heard_from: now,
            stale_before_seq_no: 0,
            records: AccountedMap::new(budget),
            abandoned: BTreeSet::new(),
        }
    }

    /// Move the watermark up to `first_incomplete` and settle every record
    /// that falls below it.
    ///
    /// IN_PROGRESS records become STALE. Under [`StalePolicy::AbandonEarly`]
    /// their waiters are released and the record dropped; the driver finds out
    /// through `is_current_driver`. NEW records have no driver left, so their
    /// waiters are released immediately. COMPLETED records are left for GC.
    pub fn advance_watermark(
        &mut self,
        client_id: &str,
        first_incomplete: SequenceNumber,
        policy: StalePolicy,
        replies: &mut Vec<Reply>,
    ) {
        if first_incomplete <= self.stale_before_seq_no {
            return;
        }
        let previous = mem::replace(&mut self.stale_before_seq_no, first_incomplete);
        debug!(client_id, previous, stale_before = first_incomplete, "advanced client watermark");

        self.records.retain(|&seq_no, record| {
            if seq_no >= first_incomplete {
                return true;
            }
            let release = match record.state {
                RpcState::Completed | RpcState::Stale => false,
                RpcState::New => true,
                RpcState::InProgress => {
                    record.state = RpcState::Stale;
                    policy == StalePolicy::AbandonEarly
                }
            };
            if release && record.state == RpcState::Stale {
                self.abandoned.insert(seq_no);
            }
            if !release {
                return true;
            }
            for o in record.ongoing.drain(..) {
                replies.push(Reply::Failure(o.context, stale_status(client_id, seq_no, first_incomplete)));
            }
            false
        });
    }

    /// Settle the late report of an abandoned driver. Returns false if
    /// `seq_no` was never abandoned.
    pub fn forget_abandoned(&mut self, seq_no: SequenceNumber) -> bool {
        self.abandoned.remove(&seq_no)
    }

    /// Records whose driver has not reported yet.
    pub fn outstanding(&self) -> usize {
        self.records
            .values()
            .filter(|r| matches!(r.state, RpcState::InProgress | RpcState::Stale))
            .count()
    }
}

impl MemoryFootprint for ClientState {
    fn memory_footprint(&self) -> usize {
        // Records are charged by the inner map.
        mem::size_of::<Self>() + self.abandoned.len() * mem::size_of::<SequenceNumber>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullContext;

    impl RpcContext for NullContext {
        fn reply_success(&self, _response: Bytes) {}
        fn reply_failure(&self, _status: ErrorStatus) {}
    }

    fn entry(attempt_no: AttemptNumber) -> OngoingRpc {
        OngoingRpc {
            context: Arc::new(NullContext),
            attempt_no,
        }
    }

    #[test]
    fn test_must_handle_own_entries_only_while_in_progress() {
        let record = CompletionRecord::new(0, Arc::new(NullContext), Instant::now());
        assert!(must_handle_rpc(0, &record, &entry(0)));
        assert!(!must_handle_rpc(0, &record, &entry(1)));
        assert!(must_handle_rpc(1, &record, &entry(1)));
    }

    #[test]
    fn test_completed_driver_handles_everyone() {
        let mut record = CompletionRecord::new(2, Arc::new(NullContext), Instant::now());
        record.state = RpcState::Completed;
        assert!(must_handle_rpc(2, &record, &entry(0)));
        assert!(must_handle_rpc(2, &record, &entry(5)));
        assert!(!must_handle_rpc(1, &record, &entry(5)));
    }

    #[test]
    fn test_take_handled_partitions_queue() {
        let now = Instant::now();
        let mut record = CompletionRecord::new(0, Arc::new(NullContext), now);
        record.enqueue(Arc::new(NullContext), 1, now);
        record.enqueue(Arc::new(NullContext), 0, now);

        let handled = record.take_handled(0);
        assert_eq!(handled.len(), 2);
        assert_eq!(record.ongoing.len(), 1);
        assert_eq!(record.ongoing[0].attempt_no, 1);
    }

    #[test]
    fn test_footprint_counts_response() {
        let mut record = CompletionRecord::new(0, Arc::new(NullContext), Instant::now());
        let before = record.memory_footprint();
        record.response = Some(Bytes::from(vec![0u8; 4096]));
        assert_eq!(record.memory_footprint(), before + 4096);
    }

    #[test]
    fn test_watermark_marks_in_progress_stale() {
        let now = Instant::now();
        let mut client = ClientState::new(MemoryBudget::unlimited("test"), now);
        client.records.insert(1, CompletionRecord::new(0, Arc::new(NullContext), now));
        client.records.insert(5, CompletionRecord::new(0, Arc::new(NullContext), now));

        let mut replies = Vec::new();
        client.advance_watermark("c", 3, StalePolicy::AlwaysComplete, &mut replies);
        assert!(replies.is_empty());
        assert_eq!(client.stale_before_seq_no, 3);
        assert_eq!(client.records.get(&1).unwrap().state, RpcState::Stale);
        assert_eq!(client.records.get(&5).unwrap().state, RpcState::InProgress);

        // Never moves backwards.
        client.advance_watermark("c", 2, StalePolicy::AlwaysComplete, &mut replies);
        assert_eq!(client.stale_before_seq_no, 3);
    }

    #[test]
    fn test_watermark_abandon_early_releases_waiters() {
        let now = Instant::now();
        let mut client = ClientState::new(MemoryBudget::unlimited("test"), now);
        let mut record = CompletionRecord::new(0, Arc::new(NullContext), now);
        record.enqueue(Arc::new(NullContext), 1, now);
        client.records.insert(1, record);

        let mut replies = Vec::new();
        client.advance_watermark("c", 2, StalePolicy::AbandonEarly, &mut replies);
        assert_eq!(replies.len(), 2);
        assert!(client.records.is_empty());
        assert!(client.abandoned.contains(&1));

        assert!(client.forget_abandoned(1));
        assert!(!client.forget_abandoned(1));
        assert!(client.abandoned.is_empty());
    }

    #[test]
    fn test_released_new_record_is_not_abandoned() {
        let now = Instant::now();
        let mut client = ClientState::new(MemoryBudget::unlimited("test"), now);
        let mut record = CompletionRecord::new(0, Arc::new(NullContext), now);
        record.state = RpcState::New;
        client.records.insert(1, record);

        let mut replies = Vec::new();
        client.advance_watermark("c", 2, StalePolicy::AbandonEarly, &mut replies);
        assert_eq!(replies.len(), 1);
        assert!(client.abandoned.is_empty());
    }
}
