//! Server-side exactly-once bookkeeping.
//!
//! # Protocol
//!
//! Every tracked request carries a [`RequestId`]. The first attempt to reach
//! [`ResultTracker::track_rpc`] for a given `(client_id, seq_no)` becomes the
//! *driver* and executes the request; concurrent retries are queued behind it.
//! When the driver calls [`ResultTracker::record_completion_and_respond`], the
//! response is cached and every queued attempt receives the same bytes. Later
//! retries are answered straight from the cache.
//!
//! A failed driver does not poison the record: failures are never cached and
//! the next attempt to arrive takes over.
//!
//! # Record States
//!
//! ```text
//!            track_rpc                 record_completion
//!   (none) ───────────► IN_PROGRESS ─────────────────────► COMPLETED ──► (GC)
//!                         │     ▲  │
//!          fail_and_      │     │  │ watermark passes seq_no
//!          respond        ▼     │  ▼
//!                         NEW ──┘  STALE ──► COMPLETED / erased
//! ```
//!
//! # Concurrency Model
//!
//! All state lives behind one mutex. Replies are collected while it is held
//! and delivered after it is released, so a [`RpcContext`] may call back into
//! the tracker.

mod gc;
mod record;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use corelib::{
    AccountedMap, AccountedMut, AttemptNumber, ErrorStatus, MemoryBudget, RequestId,
    ResultTrackerConfig, RpcErrorCode, SequenceNumber, NO_SEQ_NO,
};
use metrics::counter;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::RpcContext;
use record::{send_all, stale_status, ClientState, CompletionRecord, Reply};

pub use gc::{EvictionCandidate, GcThreadHandle};

/// Outcome of tracking one attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RpcState {
    /// The caller is the driver and must execute the request.
    New,
    /// Another attempt is driving; the caller will be answered when it finishes.
    InProgress,
    /// The caller has already been answered from the cache.
    Completed,
    /// The request is below the client's watermark. The caller either waits
    /// for the driver or has been answered with `RequestStale`.
    Stale,
}

impl RpcState {
    pub fn name(self) -> &'static str {
        match self {
            RpcState::New => "NEW",
            RpcState::InProgress => "IN_PROGRESS",
            RpcState::Completed => "COMPLETED",
            RpcState::Stale => "STALE",
        }
    }
}

impl fmt::Display for RpcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResultTrackerError {
    #[error("request {0} already completed; keeping the cached response")]
    AlreadyCompleted(RequestId),

    #[error("request {request_id} is not driving (driver attempt {driver_attempt_no})")]
    NotDriver {
        request_id: RequestId,
        driver_attempt_no: AttemptNumber,
    },

    #[error("request {0} fell below its client's watermark and was abandoned")]
    Stale(RequestId),
}

pub struct ResultTracker {
    config: ResultTrackerConfig,
    budget: Arc<MemoryBudget>,
    clients: Mutex<AccountedMap<String, ClientState>>,
}

impl ResultTracker {
    pub fn new(config: ResultTrackerConfig) -> Self {
        let budget = MemoryBudget::new("result-tracker", config.memory_limit_bytes);
        Self::with_budget(config, budget)
    }

    /// Charge all cached state to an existing budget.
    pub fn with_budget(config: ResultTrackerConfig, budget: Arc<MemoryBudget>) -> Self {
        Self {
            clients: Mutex::new(AccountedMap::new(Arc::clone(&budget))),
            budget,
            config,
        }
    }

    pub fn config(&self) -> &ResultTrackerConfig {
        &self.config
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    /// Track an incoming attempt. Only a [`RpcState::New`] result obliges
    /// the caller to execute the request; in every other case the context is
    /// answered by the tracker.
    pub fn track_rpc(&self, request_id: &RequestId, context: Arc<dyn RpcContext>) -> RpcState {
        self.track(request_id, context, false)
    }

    /// Like [`track_rpc`](Self::track_rpc), but lets this attempt take over an
    /// IN_PROGRESS record whose driver can no longer be answered, provided
    /// its attempt number is higher than the driver's.
    pub fn track_rpc_or_change_driver(&self, request_id: &RequestId, context: Arc<dyn RpcContext>) -> RpcState {
        self.track(request_id, context, true)
    }

    fn track(&self, request_id: &RequestId, context: Arc<dyn RpcContext>, change_driver: bool) -> RpcState {
        let mut replies = Vec::new();
        let state = {
            let mut clients = self.clients.lock();
            self.track_locked(&mut clients, request_id, context, change_driver, &mut replies)
        };
        counter!("rpc.result_tracker.track", "state" => state.name()).increment(1);
        debug!(request_id = %request_id, state = state.name(), "tracked rpc");
        send_all(replies);
        state
    }

    fn track_locked(
        &self,
        clients: &mut AccountedMap<String, ClientState>,
        request_id: &RequestId,
        context: Arc<dyn RpcContext>,
        change_driver: bool,
        replies: &mut Vec<Reply>,
    ) -> RpcState {
        let now = Instant::now();
        let policy = self.config.stale_policy;
        let mut client = clients.get_or_insert_with(request_id.client_id.clone(), || {
            ClientState::new(Arc::clone(&self.budget), now)
        });
        client.last_heard_from = now;
        client.advance_watermark(
            &request_id.client_id,
            request_id.first_incomplete_seq_no,
            policy,
            replies,
        );

        let seq_no = request_id.seq_no;
        let stale_before = client.stale_before_seq_no;
        if let Some(mut record) = client.records.get_mut(&seq_no) {
            return track_existing(&mut record, request_id, context, change_driver, now, replies);
        }
        if seq_no < stale_before {
            replies.push(Reply::Failure(
                context,
                stale_status(&request_id.client_id, seq_no, stale_before),
            ));
            return RpcState::Stale;
        }
        client
            .records
            .insert(seq_no, CompletionRecord::new(request_id.attempt_no, context, now));
        RpcState::New
    }

    /// Whether `request_id`'s attempt is still the driver and should keep
    /// working. False once the request was abandoned, completed or taken over.
    pub fn is_current_driver(&self, request_id: &RequestId) -> bool {
        let clients = self.clients.lock();
        let Some(record) = clients
            .get(&request_id.client_id)
            .and_then(|client| client.records.get(&request_id.seq_no))
        else {
            return false;
        };
        matches!(record.state, RpcState::InProgress | RpcState::Stale)
            && record.driver_attempt_no == request_id.attempt_no
    }

    /// Cache the driver's response and deliver it to every waiting attempt.
    ///
    /// A record is never overwritten: if it is already COMPLETED the caller's
    /// own waiters get the cached response instead of `response`.
    ///
    /// # Panics
    ///
    /// Completing a request that was never tracked is a programming error.
    pub fn record_completion_and_respond(&self, request_id: &RequestId, response: Bytes) -> Result<(), ResultTrackerError> {
        let mut replies = Vec::new();
        let result = {
            let mut clients = self.clients.lock();
            Self::complete_locked(&mut clients, request_id, response, &mut replies)
        };
        if let Err(err) = &result {
            warn!(request_id = %request_id, error = %err, "completion not recorded");
        }
        send_all(replies);
        result
    }

    fn complete_locked(
        clients: &mut AccountedMap<String, ClientState>,
        request_id: &RequestId,
        response: Bytes,
        replies: &mut Vec<Reply>,
    ) -> Result<(), ResultTrackerError> {
        let mut client = find_client_or_die(clients, request_id);
        let stale_before = client.stale_before_seq_no;
        if !client.records.contains_key(&request_id.seq_no) {
            client.forget_abandoned(request_id.seq_no);
            return Err(untracked(request_id, stale_before));
        }
        let Some(mut record) = client.records.get_mut(&request_id.seq_no) else {
            return Err(untracked(request_id, stale_before));
        };
        let handler = request_id.attempt_no;
        check_reporter(&mut record, request_id, replies)?;

        record.state = RpcState::Completed;
        record.response = Some(response.clone());
        record.last_updated = Instant::now();
        for o in record.take_handled(handler) {
            replies.push(Reply::Success(o.context, response.clone()));
        }
        Ok(())
    }

    pub fn fail_and_respond(&self, request_id: &RequestId, code: RpcErrorCode, message: impl Into<String>) -> Result<(), ResultTrackerError> {
        self.fail_and_respond_with_status(request_id, ErrorStatus::new(code, message))
    }

    pub fn fail_and_respond_with_app_error(
        &self,
        request_id: &RequestId,
        error_ext_id: i32,
        message: impl Into<String>,
        payload: Bytes,
    ) -> Result<(), ResultTrackerError> {
        self.fail_and_respond_with_status(
            request_id,
            ErrorStatus::application(error_ext_id, message, payload.to_vec()),
        )
    }

    /// Deliver a failure to the driver's own waiters and release the record.
    ///
    /// The failure is not cached: other waiting attempts stay queued and the
    /// next of them to be tracked becomes the driver. A STALE record has no
    /// retries coming, so all of its waiters get the failure and it is erased.
    ///
    /// # Panics
    ///
    /// Failing a request that was never tracked is a programming error.
    pub fn fail_and_respond_with_status(&self, request_id: &RequestId, status: ErrorStatus) -> Result<(), ResultTrackerError> {
        let mut replies = Vec::new();
        let result = {
            let mut clients = self.clients.lock();
            Self::fail_locked(&mut clients, request_id, status, &mut replies)
        };
        counter!("rpc.result_tracker.failures").increment(1);
        if let Err(err) = &result {
            warn!(request_id = %request_id, error = %err, "failure not recorded");
        }
        send_all(replies);
        result
    }

    fn fail_locked(
        clients: &mut AccountedMap<String, ClientState>,
        request_id: &RequestId,
        status: ErrorStatus,
        replies: &mut Vec<Reply>,
    ) -> Result<(), ResultTrackerError> {
        let mut client = find_client_or_die(clients, request_id);
        let stale_before = client.stale_before_seq_no;
        if !client.records.contains_key(&request_id.seq_no) {
            client.forget_abandoned(request_id.seq_no);
            return Err(untracked(request_id, stale_before));
        }
        let Some(mut record) = client.records.get_mut(&request_id.seq_no) else {
            return Err(untracked(request_id, stale_before));
        };
        check_reporter(&mut record, request_id, replies)?;

        let erase = if record.state == RpcState::Stale {
            for o in record.ongoing.drain(..) {
                replies.push(Reply::Failure(o.context, status.clone()));
            }
            true
        } else {
            for o in record.take_handled(request_id.attempt_no) {
                replies.push(Reply::Failure(o.context, status.clone()));
            }
            record.state = RpcState::New;
            record.driver_attempt_no = NO_SEQ_NO;
            record.last_updated = Instant::now();
            record.ongoing.is_empty()
        };
        drop(record);
        if erase {
            client.records.remove(&request_id.seq_no);
        }
        Ok(())
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn record_state(&self, client_id: &str, seq_no: SequenceNumber) -> Option<RpcState> {
        let clients = self.clients.lock();
        let record = clients.get(client_id)?.records.get(&seq_no)?;
        Some(record.state)
    }

    /// Attempts queued on a record, driver included.
    pub fn waiting_count(&self, client_id: &str, seq_no: SequenceNumber) -> Option<usize> {
        let clients = self.clients.lock();
        let record = clients.get(client_id)?.records.get(&seq_no)?;
        Some(record.ongoing.len())
    }

    pub fn stale_before(&self, client_id: &str) -> Option<SequenceNumber> {
        let clients = self.clients.lock();
        clients
            .get(client_id)
            .map(|client| client.stale_before_seq_no)
    }

    /// Records of `client_id` whose driver has not reported yet.
    pub fn outstanding(&self, client_id: &str) -> usize {
        let clients = self.clients.lock();
        clients
            .get(client_id)
            .map_or(0, ClientState::outstanding)
    }

    pub fn record_count(&self) -> usize {
        self.clients
            .lock()
            .values()
            .map(|client| client.records.len())
            .sum()
    }
}

fn track_existing(
    record: &mut CompletionRecord,
    request_id: &RequestId,
    context: Arc<dyn RpcContext>,
    change_driver: bool,
    now: Instant,
    replies: &mut Vec<Reply>,
) -> RpcState {
    let attempt_no = request_id.attempt_no;
    match record.state {
        RpcState::Completed => {
            if let Some(response) = &record.response {
                replies.push(Reply::Success(context, response.clone()));
            }
            counter!("rpc.result_tracker.replays").increment(1);
            RpcState::Completed
        }
        RpcState::InProgress => {
            let take_over =
                change_driver && attempt_no > record.driver_attempt_no && !record.driver_reachable();
            record.enqueue(context, attempt_no, now);
            if take_over {
                debug!(
                    request_id = %request_id,
                    previous_driver = record.driver_attempt_no,
                    "driver unreachable; changing driver"
                );
                record.driver_attempt_no = attempt_no;
                return RpcState::New;
            }
            RpcState::InProgress
        }
        RpcState::New => {
            // The previous driver failed; this attempt takes over.
            record.state = RpcState::InProgress;
            record.driver_attempt_no = attempt_no;
            record.enqueue(context, attempt_no, now);
            RpcState::New
        }
        // Records only stay STALE under StalePolicy::AlwaysComplete.
        RpcState::Stale => {
            record.enqueue(context, attempt_no, now);
            RpcState::Stale
        }
    }
}

/// Reject outcomes from anyone but the driver of a live record.
fn check_reporter(
    record: &mut CompletionRecord,
    request_id: &RequestId,
    replies: &mut Vec<Reply>,
) -> Result<(), ResultTrackerError> {
    if record.state == RpcState::Completed {
        if let Some(cached) = record.response.clone() {
            for o in record.take_handled(request_id.attempt_no) {
                replies.push(Reply::Success(o.context, cached.clone()));
            }
        }
        return Err(ResultTrackerError::AlreadyCompleted(request_id.clone()));
    }
    if record.driver_attempt_no != request_id.attempt_no {
        return Err(ResultTrackerError::NotDriver {
            request_id: request_id.clone(),
            driver_attempt_no: record.driver_attempt_no,
        });
    }
    Ok(())
}

fn find_client_or_die<'a>(
    clients: &'a mut AccountedMap<String, ClientState>,
    request_id: &RequestId,
) -> AccountedMut<'a, ClientState> {
    match clients.get_mut(&request_id.client_id) {
        Some(client) => client,
        None => panic!("outcome reported for untracked client of request {request_id}"),
    }
}

/// A missing record is expected only once the watermark abandoned it.
fn untracked(request_id: &RequestId, stale_before: SequenceNumber) -> ResultTrackerError {
    if request_id.seq_no < stale_before {
        ResultTrackerError::Stale(request_id.clone())
    } else {
        panic!("outcome reported for untracked request {request_id}")
    }
}

impl fmt::Display for ResultTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clients = self.clients.lock();
        let now = Instant::now();
        writeln!(
            f,
            "ResultTracker: {} clients, {} bytes ({:?} policy)",
            clients.len(),
            self.budget.consumption(),
            self.config.stale_policy
        )?;
        for (client_id, client) in clients.iter() {
            writeln!(
                f,
                "  client {client_id}: stale before {}, last heard from {:?} ago",
                client.stale_before_seq_no,
                now.saturating_duration_since(client.last_heard_from)
            )?;
            for (seq_no, record) in client.records.iter() {
                writeln!(f, "    {seq_no}: {record}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ResultTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultTracker")
            .field("config", &self.config)
            .field("clients", &self.client_count())
            .field("bytes", &self.budget.consumption())
            .finish()
    }
}
