//! Server-side view of one received request.
//!
//! An [`InboundCall`] owns the transfer buffer the request arrived in; the
//! request message and every sidecar are byte ranges into it. The call is
//! answered exactly once through one of the `respond_*` methods, which
//! serialize a response frame and hand it to the originating connection.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use corelib::wire::{self, RequestHeader, ResponseHeader, MAX_SIDECARS};
use corelib::{
    Error, ErrorStatus, RemoteMethod, RequestId, Result, RpcConfig, RpcErrorCode,
};
use metrics::histogram;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::connection::{Connection, OutboundResponse};
use crate::context::RpcContext;

/// Timestamps of a call's trip through the server.
#[derive(Clone, Copy, Debug)]
pub struct InboundCallTiming {
    pub time_received: Instant,
    pub time_handled: Option<Instant>,
    pub time_completed: Option<Instant>,
}

impl InboundCallTiming {
    /// Time spent queued before a handler picked the call up.
    pub fn queue_time(&self) -> Option<Duration> {
        self.time_handled
            .map(|handled| handled.saturating_duration_since(self.time_received))
    }

    pub fn processing_time(&self) -> Option<Duration> {
        let completed = self.time_completed?;
        let started = self.time_handled.unwrap_or(self.time_received);
        Some(completed.saturating_duration_since(started))
    }

    pub fn total_time(&self) -> Option<Duration> {
        self.time_completed
            .map(|completed| completed.saturating_duration_since(self.time_received))
    }
}

#[derive(Default)]
struct ResponseState {
    sidecars: Vec<Bytes>,
    responded: bool,
}

pub struct InboundCall {
    conn: Arc<dyn Connection>,
    header: RequestHeader,
    transfer: Bytes,
    request: Range<usize>,
    inbound_sidecars: Vec<Range<usize>>,
    max_message_size: usize,
    timing: Mutex<InboundCallTiming>,
    response: Mutex<ResponseState>,
}

impl InboundCall {
    /// Parse a complete request frame received on `conn`.
    pub fn parse_from(conn: Arc<dyn Connection>, transfer: Bytes, config: &RpcConfig) -> Result<Self> {
        let time_received = Instant::now();
        let frame = wire::parse_frame::<RequestHeader>(&transfer, config.max_message_size)?;
        let layout = wire::split_body(frame.body.len(), &frame.header.sidecar_offsets)?
            .offset_by(frame.body.start);

        let call = Self {
            conn,
            header: frame.header,
            transfer,
            request: layout.message,
            inbound_sidecars: layout.sidecars,
            max_message_size: config.max_message_size,
            timing: Mutex::new(InboundCallTiming {
                time_received,
                time_handled: None,
                time_completed: None,
            }),
            response: Mutex::new(ResponseState::default()),
        };
        debug!(call = %call, sidecars = call.inbound_sidecars.len(), "parsed inbound call");
        Ok(call)
    }

    pub fn header(&self) -> &RequestHeader {
        &self.header
    }

    pub fn call_id(&self) -> i32 {
        self.header.call_id
    }

    pub fn remote_method(&self) -> &RemoteMethod {
        &self.header.remote_method
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.header.request_id.as_ref()
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    pub fn remote_address(&self) -> std::net::SocketAddr {
        self.conn.remote_address()
    }

    /// The request message, without header or sidecars.
    pub fn serialized_request(&self) -> &[u8] {
        &self.transfer[self.request.clone()]
    }

    pub fn inbound_sidecar_count(&self) -> usize {
        self.inbound_sidecars.len()
    }

    pub fn get_inbound_sidecar(&self, idx: usize) -> Result<&[u8]> {
        let range = self
            .inbound_sidecars
            .get(idx)
            .ok_or(Error::SidecarOutOfRange {
                index: idx,
                count: self.inbound_sidecars.len(),
            })?;
        Ok(&self.transfer[range.clone()])
    }

    pub fn required_features(&self) -> &[u32] {
        &self.header.required_feature_flags
    }

    /// Required application features missing from `supported`.
    pub fn unsupported_features(&self, supported: &BTreeSet<u32>) -> Vec<u32> {
        self.header
            .required_feature_flags
            .iter()
            .copied()
            .filter(|flag| !supported.contains(flag))
            .collect()
    }

    /// Deadline the client will stop waiting at, if it sent a timeout.
    pub fn client_deadline(&self) -> Option<Instant> {
        let timeout = Duration::from_millis(u64::from(self.header.timeout_millis?));
        Some(self.timing.lock().time_received + timeout)
    }

    pub fn client_timed_out(&self) -> bool {
        self.client_deadline()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Attach a sidecar to the (successful) response. Returns its index.
    pub fn add_rpc_sidecar(&self, sidecar: Bytes) -> Result<usize> {
        let mut state = self.response.lock();
        if state.responded {
            return Err(Error::IllegalState(format!(
                "{self}: sidecar added after the response was sent"
            )));
        }
        if state.sidecars.len() >= MAX_SIDECARS {
            return Err(Error::TooManySidecars { max: MAX_SIDECARS });
        }
        state.sidecars.push(sidecar);
        Ok(state.sidecars.len() - 1)
    }

    pub fn has_responded(&self) -> bool {
        self.response.lock().responded
    }

    pub fn timing(&self) -> InboundCallTiming {
        *self.timing.lock()
    }

    /// Restart the clock when the transport hands the call to the service
    /// queue. Parsing already stamps it.
    pub fn record_call_received(&self) {
        self.timing.lock().time_received = Instant::now();
    }

    /// Mark the moment a handler starts working on the call.
    pub fn record_handling_started(&self) {
        let mut timing = self.timing.lock();
        let now = Instant::now();
        timing.time_handled = Some(now);
        histogram!("rpc.inbound.queue_time_seconds")
            .record(now.saturating_duration_since(timing.time_received).as_secs_f64());
    }

    fn record_handling_completed(&self) {
        let mut timing = self.timing.lock();
        timing.time_completed = Some(Instant::now());
        if let Some(processing) = timing.processing_time() {
            histogram!("rpc.inbound.processing_time_seconds").record(processing.as_secs_f64());
        }
    }

    pub fn respond_success(&self, response: Bytes) {
        self.respond(response, true);
    }

    pub fn respond_failure(&self, code: RpcErrorCode, message: impl Into<String>) {
        self.respond_error_status(ErrorStatus::new(code, message));
    }

    pub fn respond_unsupported_feature(&self, unsupported: Vec<u32>) {
        self.respond_error_status(ErrorStatus::unsupported_features(unsupported));
    }

    pub fn respond_application_error(&self, error_ext_id: i32, message: impl Into<String>, payload: Bytes) {
        self.respond_error_status(ErrorStatus::application(error_ext_id, message, payload.to_vec()));
    }

    pub fn respond_error_status(&self, status: ErrorStatus) {
        match bincode::serialize(&status) {
            Ok(body) => self.respond(Bytes::from(body), false),
            Err(err) => {
                // The call still counts as answered.
                error!(call = %self, error = %err, "failed to encode error status");
                self.respond(Bytes::new(), false);
            }
        }
    }

    /// # Panics
    ///
    /// Responding twice to one call is a programming error.
    fn respond(&self, body: Bytes, is_success: bool) {
        let sidecars = {
            let mut state = self.response.lock();
            assert!(!state.responded, "{self}: response already sent");
            state.responded = true;
            std::mem::take(&mut state.sidecars)
        };
        self.record_handling_completed();

        // Error responses never carry sidecars.
        let sidecars = if is_success { sidecars } else { Vec::new() };
        match self.serialize_response(body, is_success, sidecars) {
            Ok(slices) => {
                if !self.conn.is_alive() {
                    warn!(call = %self, "connection closed before the response was queued");
                }
                self.conn.queue_response(OutboundResponse {
                    call_id: self.call_id(),
                    slices,
                });
            }
            Err(err) => error!(call = %self, error = %err, "failed to serialize response; dropping it"),
        }
    }

    fn serialize_response(&self, body: Bytes, is_success: bool, sidecars: Vec<Bytes>) -> Result<Vec<Bytes>> {
        let header = ResponseHeader {
            call_id: self.call_id(),
            is_error: !is_success,
            sidecar_offsets: wire::sidecar_offsets(body.len(), &sidecars)?,
        };
        let body_len = body.len() + sidecars.iter().map(Bytes::len).sum::<usize>();
        let prefix = wire::encode_frame_prefix(&header, body_len, self.max_message_size)?;

        let mut slices = Vec::with_capacity(2 + sidecars.len());
        slices.push(prefix);
        slices.push(body);
        slices.extend(sidecars);
        Ok(slices)
    }
}

impl RpcContext for InboundCall {
    fn reply_success(&self, response: Bytes) {
        self.respond_success(response);
    }

    fn reply_failure(&self, status: ErrorStatus) {
        self.respond_error_status(status);
    }

    fn is_reachable(&self) -> bool {
        self.conn.is_alive() && !self.client_timed_out()
    }
}

impl fmt::Display for InboundCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Call {} from {} (call id {}",
            self.header.remote_method,
            self.conn.remote_address(),
            self.header.call_id
        )?;
        if let Some(request_id) = &self.header.request_id {
            write!(f, ", request id {request_id}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for InboundCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundCall")
            .field("header", &self.header)
            .field("remote", &self.conn.remote_address())
            .field("timing", &self.timing())
            .finish()
    }
}
