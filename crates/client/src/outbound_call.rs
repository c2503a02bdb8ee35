//! Client-side call state machine.
//!
//! # States
//!
//! ```text
//! READY ─► ON_OUTBOUND_QUEUE ─► SENDING ─► SENT ─► FINISHED_SUCCESS
//!   │              │               │   └──────┴──► FINISHED_ERROR
//!   └──────────────┴───────────────┴──────────────► TIMED_OUT / FINISHED_ERROR
//! ```
//!
//! A response may overtake the transport's "send finished" notification, so
//! FINISHED_SUCCESS is reachable from SENDING as well as SENT. The three
//! terminal states absorb every later transition: a response that lands after
//! a timeout is dropped, as is a timeout firing after the response.
//!
//! # Concurrency Model
//!
//! The reactor thread drives the send states, a timer drives TIMED_OUT and
//! the response path drives FINISHED_*. Each transition is a check-and-set
//! under one short-held lock; whichever thread performs the first terminal
//! transition takes the callback out under that lock and runs it after
//! releasing it, so the callback fires exactly once and never under the lock.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use corelib::wire::{self, RequestHeader, MAX_PAYLOAD_SLICES, MAX_SIDECARS};
use corelib::{ConnectionId, Error, RemoteMethod, RequestId, Result, RpcError, RpcFeatureFlag};
use parking_lot::Mutex;

use crate::callback::{CallOutcome, ResponseCallback};
use crate::response::CallResponse;

/// Lifecycle of an outbound call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallState {
    Ready,
    OnOutboundQueue,
    Sending,
    Sent,
    TimedOut,
    FinishedError,
    FinishedSuccess,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::TimedOut | CallState::FinishedError | CallState::FinishedSuccess
        )
    }

    /// The transition table. Terminal states have no outgoing edges.
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (Ready, OnOutboundQueue) | (OnOutboundQueue, Sending) | (Sending, Sent) => true,
            (Sending | Sent, FinishedSuccess) => true,
            (_, TimedOut | FinishedError) => true,
            _ => false,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CallState::Ready => "READY",
            CallState::OnOutboundQueue => "ON_OUTBOUND_QUEUE",
            CallState::Sending => "SENDING",
            CallState::Sent => "SENT",
            CallState::TimedOut => "TIMED_OUT",
            CallState::FinishedError => "FINISHED_ERROR",
            CallState::FinishedSuccess => "FINISHED_SUCCESS",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of asking a call to change state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The call had already finished; nothing changed.
    AlreadyTerminal(CallState),
    /// The edge is not in the transition table; nothing changed.
    Rejected { from: CallState, to: CallState },
}

impl Transition {
    pub fn is_applied(self) -> bool {
        matches!(self, Transition::Applied)
    }
}

/// Per-call settings captured from the controller when the call starts.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    /// Absolute deadline the caller asked for. Takes precedence over
    /// `start_time + timeout`.
    pub deadline: Option<Instant>,
    pub request_id: Option<RequestId>,
    /// Application feature flags the server must support.
    pub required_server_features: BTreeSet<u32>,
    /// Request sidecars sent after the main message.
    pub sidecars: Vec<Bytes>,
}

/// Point-in-time description of a call, for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallSnapshot {
    pub call_id: Option<i32>,
    pub remote_method: RemoteMethod,
    pub state: CallState,
    pub elapsed: Duration,
    pub timeout: Option<Duration>,
}

struct CallInner {
    state: CallState,
    status: Option<RpcError>,
    response: Option<CallResponse>,
    header_buf: Option<Bytes>,
    callback: Option<ResponseCallback>,
}

impl CallInner {
    fn outcome(&self) -> CallOutcome {
        match self.state {
            CallState::FinishedSuccess => Ok(self
                .response
                .as_ref()
                .map(|r| r.serialized_response().clone())
                .unwrap_or_default()),
            _ => Err(self
                .status
                .clone()
                .unwrap_or_else(|| RpcError::Aborted("call finished without a status".to_string()))),
        }
    }
}

/// One RPC attempt from the client's point of view.
pub struct OutboundCall {
    conn_id: ConnectionId,
    remote_method: RemoteMethod,
    options: CallOptions,
    /// Caller's already-serialized request message.
    request: Bytes,
    call_id: OnceLock<i32>,
    start_time: Instant,
    inner: Mutex<CallInner>,
}

impl OutboundCall {
    pub fn new(
        conn_id: ConnectionId,
        remote_method: RemoteMethod,
        options: CallOptions,
        request: Bytes,
        callback: ResponseCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn_id,
            remote_method,
            options,
            request,
            call_id: OnceLock::new(),
            start_time: Instant::now(),
            inner: Mutex::new(CallInner {
                state: CallState::Ready,
                status: None,
                response: None,
                header_buf: None,
                callback: Some(callback),
            }),
        })
    }

    pub fn conn_id(&self) -> &ConnectionId {
        &self.conn_id
    }

    pub fn remote_method(&self) -> &RemoteMethod {
        &self.remote_method
    }

    pub fn options(&self) -> &CallOptions {
        &self.options
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.options.request_id.as_ref()
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.options.timeout
    }

    /// The caller's deadline, else start time plus timeout; `None` for calls
    /// without a timeout.
    pub fn deadline(&self) -> Option<Instant> {
        self.options
            .deadline
            .or_else(|| self.options.timeout.map(|t| self.start_time + t))
    }

    /// Assign the connection-scoped call id. May be done once.
    pub fn set_call_id(&self, call_id: i32) -> Result<()> {
        self.call_id.set(call_id).map_err(|_| {
            Error::IllegalState(format!(
                "call id already assigned to {} RPC",
                self.remote_method
            ))
        })
    }

    pub fn call_id(&self) -> Option<i32> {
        self.call_id.get().copied()
    }

    pub fn call_id_assigned(&self) -> bool {
        self.call_id.get().is_some()
    }

    /// Connection-level features the server must have negotiated.
    pub fn required_rpc_features(&self) -> BTreeSet<RpcFeatureFlag> {
        let mut features = BTreeSet::new();
        if !self.options.required_server_features.is_empty() {
            features.insert(RpcFeatureFlag::ApplicationFeatureFlags);
        }
        features
    }

    /// Fail the call before it is sent if the server lacks a required feature.
    pub fn check_server_features(
        &self,
        server_features: &BTreeSet<RpcFeatureFlag>,
    ) -> std::result::Result<(), RpcError> {
        let missing: Vec<String> = self
            .required_rpc_features()
            .difference(server_features)
            .map(|f| f.name().to_string())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        let err = RpcError::FeatureNotSupported(missing);
        self.set_failed(err.clone());
        Err(err)
    }

    /// Slices to write for this call: frame prefix with header, the caller's
    /// request message, then each sidecar. The header is encoded once per
    /// call; every slice shares storage with buffers the call already owns.
    pub fn serialize_to(&self, max_message_size: usize) -> Result<Vec<Bytes>> {
        let call_id = self.call_id().ok_or_else(|| {
            Error::IllegalState(format!(
                "{} RPC serialized before a call id was assigned",
                self.remote_method
            ))
        })?;

        let cached = self.inner.lock().header_buf.clone();
        let header_buf = match cached {
            Some(buf) => buf,
            None => {
                let buf = self.encode_header(call_id, max_message_size)?;
                self.inner.lock().header_buf.get_or_insert(buf).clone()
            }
        };

        let mut slices = Vec::with_capacity(2 + self.options.sidecars.len());
        slices.push(header_buf);
        slices.push(self.request.clone());
        slices.extend(self.options.sidecars.iter().cloned());
        if slices.len() > MAX_PAYLOAD_SLICES {
            return Err(Error::TooManySidecars { max: MAX_SIDECARS });
        }
        Ok(slices)
    }

    fn encode_header(&self, call_id: i32, max_message_size: usize) -> Result<Bytes> {
        let sidecars = &self.options.sidecars;
        let sidecar_offsets = wire::sidecar_offsets(self.request.len(), sidecars)?;
        let body_len = self.request.len() + sidecars.iter().map(Bytes::len).sum::<usize>();
        let header = RequestHeader {
            call_id,
            remote_method: self.remote_method.clone(),
            timeout_millis: self
                .options
                .timeout
                .map(|t| u32::try_from(t.as_millis()).unwrap_or(u32::MAX)),
            required_feature_flags: self.options.required_server_features.iter().copied().collect(),
            request_id: self.options.request_id.clone(),
            sidecar_offsets,
        };
        wire::encode_frame_prefix(&header, body_len, max_message_size)
    }

    pub fn set_queued(&self) -> Transition {
        self.transition(CallState::OnOutboundQueue, |_| {})
    }

    pub fn set_sending(&self) -> Transition {
        self.transition(CallState::Sending, |_| {})
    }

    pub fn set_sent(&self) -> Transition {
        self.transition(CallState::Sent, |_| {})
    }

    pub fn set_failed(&self, status: RpcError) -> Transition {
        self.transition(CallState::FinishedError, move |inner| {
            inner.status = Some(status);
        })
    }

    /// Give up waiting. Says nothing about whether the server ran the call.
    pub fn set_timed_out(&self) -> Transition {
        let status = RpcError::TimedOut {
            method: self.remote_method.to_string(),
            remote: self.conn_id.remote.to_string(),
            timeout: self.options.timeout.unwrap_or_default(),
        };
        let transition = self.transition(CallState::TimedOut, move |inner| {
            inner.status = Some(status);
        });
        if transition.is_applied() {
            metrics::counter!("rpc.outbound.timeouts").increment(1);
        }
        transition
    }

    /// Finish the call with a parsed response frame.
    pub fn set_response(&self, response: CallResponse) -> Transition {
        if response.is_success() {
            return self.transition(CallState::FinishedSuccess, move |inner| {
                inner.response = Some(response);
            });
        }
        let status = match response.error_status() {
            Ok(err) => RpcError::Remote(err),
            Err(e) => RpcError::InvalidResponse(e.to_string()),
        };
        self.transition(CallState::FinishedError, move |inner| {
            inner.status = Some(status);
            inner.response = Some(response);
        })
    }

    /// Time the call out if its deadline is at or before `now`.
    pub fn check_deadline(&self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.set_timed_out().is_applied(),
            _ => false,
        }
    }

    fn transition(&self, next: CallState, update: impl FnOnce(&mut CallInner)) -> Transition {
        let fired = {
            let mut inner = self.inner.lock();
            let current = inner.state;
            if current.is_terminal() {
                tracing::trace!(
                    method = %self.remote_method,
                    state = current.name(),
                    ignored = next.name(),
                    "outbound call already finished"
                );
                return Transition::AlreadyTerminal(current);
            }
            if !current.can_transition_to(next) {
                tracing::warn!(
                    method = %self.remote_method,
                    from = current.name(),
                    to = next.name(),
                    "rejected outbound call state transition"
                );
                return Transition::Rejected {
                    from: current,
                    to: next,
                };
            }

            update(&mut inner);
            inner.state = next;
            tracing::trace!(
                method = %self.remote_method,
                call_id = ?self.call_id(),
                from = current.name(),
                to = next.name(),
                "outbound call transition"
            );

            if next.is_terminal() {
                let callback = inner.callback.take();
                callback.map(|cb| (cb, inner.outcome()))
            } else {
                None
            }
        };

        if let Some((callback, outcome)) = fired {
            callback.invoke(outcome);
        }
        Transition::Applied
    }

    pub fn state(&self) -> CallState {
        self.inner.lock().state
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_timed_out(&self) -> bool {
        self.state() == CallState::TimedOut
    }

    /// Failure status of a finished call; `None` while running or on success.
    pub fn status(&self) -> Option<RpcError> {
        self.inner.lock().status.clone()
    }

    /// Parsed response frame, once one has been accepted.
    pub fn response(&self) -> Option<CallResponse> {
        self.inner.lock().response.clone()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.call_id(),
            remote_method: self.remote_method.clone(),
            state: self.state(),
            elapsed: self.start_time.elapsed(),
            timeout: self.options.timeout,
        }
    }
}

impl fmt::Display for OutboundCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC call {} -> {}", self.remote_method, self.conn_id)?;
        if let Some(call_id) = self.call_id() {
            write!(f, " (call id {})", call_id)?;
        }
        write!(f, " [{}]", self.state())
    }
}

impl fmt::Debug for OutboundCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundCall")
            .field("conn_id", &self.conn_id)
            .field("remote_method", &self.remote_method)
            .field("call_id", &self.call_id())
            .field("state", &self.state())
            .finish()
    }
}
