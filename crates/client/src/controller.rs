//! Caller-facing handle for one RPC.
//!
//! The controller collects per-call settings (timeout, request id, required
//! server features, request sidecars), starts the [`OutboundCall`] and, once
//! the call has finished, exposes its status, error payload and response
//! sidecars. A controller drives at most one call at a time; call
//! [`reset`](RpcController::reset) before reusing it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use corelib::wire::MAX_SIDECARS;
use corelib::{
    ConnectionId, Error, ErrorStatus, RemoteMethod, RequestId, Result, RpcConfig, RpcError,
};

use crate::callback::ResponseCallback;
use crate::outbound_call::{CallOptions, CallState, OutboundCall};

#[derive(Debug, Default)]
pub struct RpcController {
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    required_server_features: BTreeSet<u32>,
    request_id: Option<RequestId>,
    outbound_sidecars: Vec<Bytes>,
    call: Option<Arc<OutboundCall>>,
}

impl RpcController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Controller pre-loaded with the configured default timeout.
    pub fn with_config(config: &RpcConfig) -> Self {
        Self {
            timeout: config.default_timeout(),
            ..Self::default()
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
        self.deadline = None;
    }

    /// Express the timeout as an absolute deadline. The call expires at
    /// `deadline` no matter when it is started.
    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
        self.timeout = None;
    }

    /// Time left before the call must finish. A deadline in the past gives a
    /// zero timeout.
    pub fn timeout(&self) -> Option<Duration> {
        match self.deadline {
            Some(deadline) => Some(deadline.saturating_duration_since(Instant::now())),
            None => self.timeout,
        }
    }

    pub fn set_request_id(&mut self, request_id: RequestId) {
        self.request_id = Some(request_id);
    }

    pub fn has_request_id(&self) -> bool {
        self.request_id.is_some()
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    /// Require the server to support application feature `feature`; checked
    /// during negotiation before the call is sent.
    pub fn require_server_feature(&mut self, feature: u32) {
        self.required_server_features.insert(feature);
    }

    pub fn required_server_features(&self) -> &BTreeSet<u32> {
        &self.required_server_features
    }

    /// Attach a request sidecar, returning its index.
    pub fn add_outbound_sidecar(&mut self, sidecar: Bytes) -> Result<usize> {
        if self.outbound_sidecars.len() >= MAX_SIDECARS {
            return Err(Error::TooManySidecars { max: MAX_SIDECARS });
        }
        self.outbound_sidecars.push(sidecar);
        Ok(self.outbound_sidecars.len() - 1)
    }

    /// Create the call for this controller.
    pub fn start_call(
        &mut self,
        conn_id: ConnectionId,
        remote_method: RemoteMethod,
        request: Bytes,
        callback: ResponseCallback,
    ) -> Result<Arc<OutboundCall>> {
        if let Some(call) = &self.call {
            return Err(Error::IllegalState(format!(
                "controller already used for {}; reset it first",
                call
            )));
        }
        let options = CallOptions {
            timeout: self.timeout(),
            deadline: self.deadline,
            request_id: self.request_id.clone(),
            required_server_features: self.required_server_features.clone(),
            sidecars: std::mem::take(&mut self.outbound_sidecars),
        };
        let call = OutboundCall::new(conn_id, remote_method, options, request, callback);
        self.call = Some(Arc::clone(&call));
        Ok(call)
    }

    pub fn call(&self) -> Option<&Arc<OutboundCall>> {
        self.call.as_ref()
    }

    pub fn finished(&self) -> bool {
        self.call.as_ref().map_or(false, |c| c.is_finished())
    }

    /// `Ok` unless the call finished unsuccessfully.
    pub fn status(&self) -> std::result::Result<(), RpcError> {
        match self.call.as_ref().and_then(|c| c.status()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The server's error payload, if the call failed remotely.
    pub fn error_response(&self) -> Option<ErrorStatus> {
        self.call
            .as_ref()
            .and_then(|c| c.status())
            .and_then(|err| err.remote_error().cloned())
    }

    /// Main response message of a successfully finished call.
    pub fn response_body(&self) -> Option<Bytes> {
        let call = self.call.as_ref()?;
        if call.state() != CallState::FinishedSuccess {
            return None;
        }
        call.response().map(|r| r.serialized_response().clone())
    }

    /// Response sidecar `idx` of a successfully finished call.
    pub fn get_sidecar(&self, idx: usize) -> Result<Bytes> {
        let response = self
            .call
            .as_ref()
            .filter(|c| c.state() == CallState::FinishedSuccess)
            .and_then(|c| c.response())
            .ok_or_else(|| {
                Error::IllegalState("sidecars are only available after a successful call".into())
            })?;
        response.get_sidecar(idx)
    }

    /// Clear all settings and the finished call so the controller can be reused.
    pub fn reset(&mut self) -> Result<()> {
        if let Some(call) = &self.call {
            if !call.is_finished() {
                return Err(Error::IllegalState(format!(
                    "cannot reset controller while {} is in flight",
                    call
                )));
            }
        }
        *self = Self::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelib::UserCredentials;

    fn conn() -> ConnectionId {
        ConnectionId::new("127.0.0.1:7050".parse().unwrap(), UserCredentials::default())
    }

    #[test]
    fn test_settings_flow_into_call() {
        let mut controller = RpcController::new();
        controller.set_timeout(Duration::from_secs(2));
        controller.set_request_id(RequestId::new("c", 1, 0, 0));
        controller.require_server_feature(4);
        assert_eq!(controller.add_outbound_sidecar(Bytes::from_static(b"a")).unwrap(), 0);

        let call = controller
            .start_call(
                conn(),
                RemoteMethod::new("svc", "m"),
                Bytes::new(),
                ResponseCallback::noop(),
            )
            .unwrap();

        assert_eq!(call.timeout(), Some(Duration::from_secs(2)));
        assert_eq!(call.request_id().map(|r| r.seq_no), Some(1));
        assert_eq!(call.options().sidecars.len(), 1);
        assert!(call
            .required_rpc_features()
            .contains(&corelib::RpcFeatureFlag::ApplicationFeatureFlags));
    }

    #[test]
    fn test_sidecar_limit() {
        let mut controller = RpcController::new();
        for _ in 0..MAX_SIDECARS {
            controller.add_outbound_sidecar(Bytes::new()).unwrap();
        }
        assert!(matches!(
            controller.add_outbound_sidecar(Bytes::new()),
            Err(Error::TooManySidecars { .. })
        ));
    }

    #[test]
    fn test_one_call_per_controller_until_reset() {
        let mut controller = RpcController::new();
        let call = controller
            .start_call(conn(), RemoteMethod::new("s", "m"), Bytes::new(), ResponseCallback::noop())
            .unwrap();

        assert!(controller
            .start_call(conn(), RemoteMethod::new("s", "m"), Bytes::new(), ResponseCallback::noop())
            .is_err());
        assert!(controller.reset().is_err());

        call.set_failed(RpcError::Aborted("test".into()));
        assert!(controller.finished());
        assert!(matches!(controller.status(), Err(RpcError::Aborted(_))));
        assert!(controller.get_sidecar(0).is_err());

        controller.reset().unwrap();
        assert!(!controller.finished());
        assert!(controller.status().is_ok());
        assert!(controller.call().is_none());
    }

    #[test]
    fn test_deadline_in_past_is_zero_timeout() {
        let mut controller = RpcController::new();
        let past = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        controller.set_deadline(past);
        assert_eq!(controller.timeout(), Some(Duration::ZERO));
    }

    #[test]
    fn test_deadline_fixed_when_set() {
        let mut controller = RpcController::new();
        let deadline = Instant::now() + Duration::from_millis(200);
        controller.set_deadline(deadline);
        std::thread::sleep(Duration::from_millis(5));

        let call = controller
            .start_call(conn(), RemoteMethod::new("s", "m"), Bytes::new(), ResponseCallback::noop())
            .unwrap();
        assert_eq!(call.deadline(), Some(deadline));
        assert!(call.timeout().unwrap() < Duration::from_millis(200));
        assert!(!call.check_deadline(deadline - Duration::from_millis(1)));
        assert!(call.check_deadline(deadline));
    }

    #[test]
    fn test_with_config_default_timeout() {
        let config = RpcConfig {
            default_timeout_ms: Some(250),
            ..RpcConfig::default()
        };
        let controller = RpcController::with_config(&config);
        assert_eq!(controller.timeout(), Some(Duration::from_millis(250)));
    }
}
