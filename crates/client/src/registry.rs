//! Calls awaiting a response on one connection.
//!
//! The connection assigns each call an id when it is queued, and routes every
//! response frame back to the call carrying that id. A response for an id
//! that is no longer registered (the call timed out and was reaped, or the
//! id is bogus) is dropped. Calls that finish without a response are reaped
//! on the timer path by [`CallRegistry::expire`].

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use corelib::{Error, Result, RpcConfig, RpcError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::outbound_call::OutboundCall;
use crate::response::CallResponse;
use crate::timeout::TimeoutQueue;

pub struct CallRegistry {
    next_call_id: AtomicI32,
    calls: DashMap<i32, Arc<OutboundCall>>,
    max_message_size: usize,
}

impl CallRegistry {
    pub fn new(config: &RpcConfig) -> Self {
        Self {
            next_call_id: AtomicI32::new(0),
            calls: DashMap::new(),
            max_message_size: config.max_message_size,
        }
    }

    /// Assign a call id to `call` and start waiting for its response.
    ///
    /// Ids wrap around; an id still held by an in-flight call is refused
    /// rather than reused.
    pub fn register(&self, call: Arc<OutboundCall>) -> Result<i32> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed) & i32::MAX;
        match self.calls.entry(call_id) {
            Entry::Occupied(_) => Err(Error::IllegalState(format!(
                "call id {call_id} is still in flight"
            ))),
            Entry::Vacant(slot) => {
                call.set_call_id(call_id)?;
                slot.insert(call);
                Ok(call_id)
            }
        }
    }

    pub fn get(&self, call_id: i32) -> Option<Arc<OutboundCall>> {
        self.calls.get(&call_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, call_id: i32) -> Option<Arc<OutboundCall>> {
        self.calls.remove(&call_id).map(|(_, call)| call)
    }

    /// Parse a response frame and finish the call it belongs to. Returns
    /// whether a call was finished by it.
    pub fn handle_response(&self, transfer: Bytes) -> Result<bool> {
        let response = CallResponse::parse_from(transfer, self.max_message_size)?;
        let call_id = response.call_id();
        match self.remove(call_id) {
            Some(call) => Ok(call.set_response(response).is_applied()),
            None => {
                tracing::debug!(call_id, "dropping response for unknown call");
                Ok(false)
            }
        }
    }

    /// Fail every registered call, e.g. when the connection is torn down.
    pub fn abort_all(&self, status: RpcError) -> usize {
        let ids: Vec<i32> = self.calls.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.remove(id))
            .filter(|call| call.set_failed(status.clone()).is_applied())
            .count()
    }

    /// Time out the calls `timeouts` finds due at `now`, then stop waiting on
    /// every finished call. Returns how many calls timed out.
    pub fn expire(&self, timeouts: &TimeoutQueue, now: Instant) -> usize {
        let expired = timeouts.expire(now);
        self.reap_finished();
        expired
    }

    /// Forget calls that reached a terminal state without a response.
    pub fn reap_finished(&self) -> usize {
        let mut reaped = 0;
        self.calls.retain(|_, call| {
            let finished = call.is_finished();
            if finished {
                reaped += 1;
            }
            !finished
        });
        if reaped > 0 {
            tracing::debug!(reaped, "reaped finished calls");
        }
        reaped
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::ResponseCallback;
    use crate::outbound_call::CallOptions;
    use corelib::{ConnectionId, RemoteMethod, UserCredentials};

    fn call() -> Arc<OutboundCall> {
        OutboundCall::new(
            ConnectionId::new("127.0.0.1:1".parse().unwrap(), UserCredentials::default()),
            RemoteMethod::new("s", "m"),
            CallOptions::default(),
            Bytes::new(),
            ResponseCallback::noop(),
        )
    }

    #[test]
    fn test_wrapped_id_in_flight_is_refused() {
        let registry = CallRegistry::new(&RpcConfig::default());
        assert_eq!(registry.register(call()).unwrap(), 0);

        // The next fetch_add masks back to id 0.
        registry.next_call_id.store(i32::MIN, Ordering::Relaxed);
        let second = call();
        assert!(matches!(
            registry.register(Arc::clone(&second)),
            Err(Error::IllegalState(_))
        ));
        assert!(!second.call_id_assigned());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.register(second).unwrap(), 1);
    }

    #[test]
    fn test_reap_keeps_unfinished_calls() {
        let registry = CallRegistry::new(&RpcConfig::default());
        let failed = call();
        registry.register(Arc::clone(&failed)).unwrap();
        registry.register(call()).unwrap();
        assert!(failed.set_failed(RpcError::Network("reset".into())).is_applied());

        assert_eq!(registry.reap_finished(), 1);
        assert_eq!(registry.len(), 1);
    }
}
