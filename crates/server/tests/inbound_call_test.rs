//! Client and server halves wired back to back over an in-memory connection:
//! outbound call → request frame → inbound call → result tracker → response
//! frame → client callback.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use client::{CallRegistry, CallState, OutboundCall, RequestTracker, ResponseCallback, RpcController};
use corelib::{ConnectionId, RemoteMethod, RequestId, RpcConfig, RpcError, RpcErrorCode, UserCredentials};
use crossbeam::channel::{self, Receiver, Sender};
use server::{Connection, InboundCall, OutboundResponse, ResultTracker, RpcState};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct LoopbackConnection {
    responses: Sender<Bytes>,
}

impl Connection for LoopbackConnection {
    fn remote_address(&self) -> SocketAddr {
        "10.0.0.7:40100".parse().unwrap()
    }

    fn queue_response(&self, response: OutboundResponse) {
        let _ = self.responses.send(response.to_frame());
    }
}

/// A server that executes `Counter.Increment` exactly once per request id.
struct Server {
    tracker: ResultTracker,
    conn: Arc<LoopbackConnection>,
    executions: AtomicUsize,
    config: RpcConfig,
    supported_features: BTreeSet<u32>,
}

impl Server {
    fn new() -> (Self, Receiver<Bytes>) {
        let (tx, rx) = channel::unbounded();
        let server = Self {
            tracker: ResultTracker::new(Default::default()),
            conn: Arc::new(LoopbackConnection { responses: tx }),
            executions: AtomicUsize::new(0),
            config: RpcConfig::default(),
            supported_features: [1].into_iter().collect(),
        };
        (server, rx)
    }

    /// Parse and dispatch one request frame.
    fn handle(&self, frame: Bytes) -> anyhow::Result<Option<RpcState>> {
        let conn: Arc<dyn Connection> = self.conn.clone();
        let call = Arc::new(InboundCall::parse_from(conn, frame, &self.config)?);
        call.record_handling_started();

        let unsupported = call.unsupported_features(&self.supported_features);
        if !unsupported.is_empty() {
            call.respond_unsupported_feature(unsupported);
            return Ok(None);
        }

        let Some(request_id) = call.request_id().cloned() else {
            call.respond_failure(RpcErrorCode::InvalidRequest, "missing request id");
            return Ok(None);
        };
        let state = self.tracker.track_rpc(&request_id, call.clone());
        if state == RpcState::New {
            let n = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
            let mut body = BytesMut::from(call.serialized_request());
            body.extend_from_slice(format!("#{n}").as_bytes());
            self.tracker
                .record_completion_and_respond(&request_id, body.freeze())?;
        }
        Ok(Some(state))
    }
}

fn conn_id() -> ConnectionId {
    ConnectionId::new("10.0.0.7:40100".parse().unwrap(), UserCredentials::new("svc"))
}

fn increment() -> RemoteMethod {
    RemoteMethod::new("Counter", "Increment")
}

/// Register, "send" and serialize a call, returning the frame the server sees.
fn send(registry: &CallRegistry, call: &Arc<OutboundCall>, config: &RpcConfig) -> anyhow::Result<Bytes> {
    registry.register(Arc::clone(call))?;
    call.set_queued();
    call.set_sending();
    let mut frame = BytesMut::new();
    for slice in call.serialize_to(config.max_message_size)? {
        frame.extend_from_slice(&slice);
    }
    call.set_sent();
    Ok(frame.freeze())
}

fn start(request_id: Option<RequestId>, body: &'static [u8]) -> anyhow::Result<(RpcController, Receiver<client::CallOutcome>)> {
    let mut controller = RpcController::new();
    controller.set_timeout(Duration::from_secs(5));
    if let Some(request_id) = request_id {
        controller.set_request_id(request_id);
    }
    let (callback, outcome) = ResponseCallback::channel();
    controller.start_call(conn_id(), increment(), Bytes::from_static(body), callback)?;
    Ok((controller, outcome))
}

#[test]
fn test_retry_after_lost_response_replays() -> anyhow::Result<()> {
    init_tracing();
    let config = RpcConfig::default();
    let (server, responses) = Server::new();
    let registry = CallRegistry::new(&config);
    let tracker = RequestTracker::new("client-7");
    let request_id = tracker.new_request_id();

    // First attempt executes, but its response is "lost".
    let (first, _lost) = start(Some(request_id.clone()), b"inc")?;
    let call = first.call().unwrap();
    let frame = send(&registry, call, &config)?;
    assert_eq!(server.handle(frame)?, Some(RpcState::New));
    let _dropped = responses.recv_timeout(Duration::from_secs(1))?;
    call.set_timed_out();

    // The retry is answered from the cache without executing again.
    let (retry, outcome) = start(Some(request_id.next_attempt()), b"inc")?;
    let frame = send(&registry, retry.call().unwrap(), &config)?;
    assert_eq!(server.handle(frame)?, Some(RpcState::Completed));
    assert!(registry.handle_response(responses.recv_timeout(Duration::from_secs(1))?)?);

    let body = outcome.recv_timeout(Duration::from_secs(1))??;
    assert_eq!(body, Bytes::from_static(b"inc#1"));
    assert_eq!(retry.response_body(), Some(Bytes::from_static(b"inc#1")));
    assert_eq!(server.executions.load(Ordering::SeqCst), 1);

    tracker.rpc_completed(request_id.seq_no);
    assert_eq!(tracker.outstanding(), 0);
    Ok(())
}

#[test]
fn test_sequential_requests_advance_watermark() -> anyhow::Result<()> {
    init_tracing();
    let config = RpcConfig::default();
    let (server, responses) = Server::new();
    let registry = CallRegistry::new(&config);
    let tracker = RequestTracker::new("client-8");

    for i in 1..=3 {
        let request_id = tracker.new_request_id();
        let (controller, outcome) = start(Some(request_id.clone()), b"inc")?;
        let frame = send(&registry, controller.call().unwrap(), &config)?;
        assert_eq!(server.handle(frame)?, Some(RpcState::New));
        assert!(registry.handle_response(responses.recv_timeout(Duration::from_secs(1))?)?);
        assert_eq!(outcome.recv_timeout(Duration::from_secs(1))??, Bytes::from(format!("inc#{i}")));
        tracker.rpc_completed(request_id.seq_no);
    }

    // The last request carried watermark 2, so sequence numbers 0 and 1 go.
    assert_eq!(server.tracker.stale_before("client-8"), Some(2));
    assert_eq!(server.tracker.gc_results(), 2);
    assert_eq!(server.tracker.record_count(), 1);
    assert!(registry.is_empty());
    Ok(())
}

#[test]
fn test_unsupported_feature_fails_call() -> anyhow::Result<()> {
    init_tracing();
    let config = RpcConfig::default();
    let (server, responses) = Server::new();
    let registry = CallRegistry::new(&config);

    let mut controller = RpcController::new();
    controller.require_server_feature(42);
    let (callback, outcome) = ResponseCallback::channel();
    let call = controller.start_call(conn_id(), increment(), Bytes::from_static(b"inc"), callback)?;
    let frame = send(&registry, &call, &config)?;
    assert_eq!(server.handle(frame)?, None);
    assert!(registry.handle_response(responses.recv_timeout(Duration::from_secs(1))?)?);

    let err = outcome.recv_timeout(Duration::from_secs(1))?.unwrap_err();
    let status = err.remote_error().expect("remote error");
    assert_eq!(status.code, RpcErrorCode::InvalidRequest);
    assert_eq!(status.unsupported_feature_flags, vec![42]);
    assert_eq!(controller.error_response().map(|s| s.code), Some(RpcErrorCode::InvalidRequest));
    assert_eq!(call.state(), CallState::FinishedError);
    assert_eq!(server.executions.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn test_untracked_call_is_rejected() -> anyhow::Result<()> {
    let config = RpcConfig::default();
    let (server, responses) = Server::new();
    let registry = CallRegistry::new(&config);

    let (controller, outcome) = start(None, b"inc")?;
    let frame = send(&registry, controller.call().unwrap(), &config)?;
    server.handle(frame)?;
    registry.handle_response(responses.recv_timeout(Duration::from_secs(1))?)?;

    match outcome.recv_timeout(Duration::from_secs(1))? {
        Err(RpcError::Remote(status)) => assert_eq!(status.code, RpcErrorCode::InvalidRequest),
        other => panic!("unexpected outcome {other:?}"),
    }
    Ok(())
}

#[test]
fn test_response_sidecars_round_trip() -> anyhow::Result<()> {
    let config = RpcConfig::default();
    let (tx, rx) = channel::unbounded();
    let conn: Arc<dyn Connection> = Arc::new(LoopbackConnection { responses: tx });
    let registry = CallRegistry::new(&config);

    let mut controller = RpcController::new();
    controller.add_outbound_sidecar(Bytes::from_static(b"upload"))?;
    let (callback, outcome) = ResponseCallback::channel();
    let call = controller.start_call(conn_id(), increment(), Bytes::from_static(b"scan"), callback)?;
    let frame = send(&registry, &call, &config)?;

    let inbound = InboundCall::parse_from(conn, frame, &config)?;
    assert_eq!(inbound.serialized_request(), b"scan");
    assert_eq!(inbound.get_inbound_sidecar(0)?, b"upload");
    inbound.add_rpc_sidecar(Bytes::from_static(b"rows-a"))?;
    inbound.add_rpc_sidecar(Bytes::from_static(b"rows-b"))?;
    inbound.respond_success(Bytes::from_static(b"scan-ok"));

    assert!(registry.handle_response(rx.recv_timeout(Duration::from_secs(1))?)?);
    assert_eq!(outcome.recv_timeout(Duration::from_secs(1))??, Bytes::from_static(b"scan-ok"));
    assert_eq!(controller.get_sidecar(0)?, Bytes::from_static(b"rows-a"));
    assert_eq!(controller.get_sidecar(1)?, Bytes::from_static(b"rows-b"));
    assert!(controller.get_sidecar(2).is_err());
    Ok(())
}
