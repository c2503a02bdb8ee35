//! Deadline bookkeeping for in-flight calls.
//!
//! The transport's timer decides *when* to look; this queue decides *what*
//! has expired. Calls are held weakly so a call that finished and was dropped
//! never lingers until its deadline.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use priority_queue::PriorityQueue;

use crate::outbound_call::OutboundCall;

#[derive(Default)]
pub struct TimeoutQueue {
    inner: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    next_key: u64,
    deadlines: PriorityQueue<u64, Reverse<Instant>>,
    calls: HashMap<u64, Weak<OutboundCall>>,
}

impl TimeoutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `call` until its deadline. Calls without a timeout are ignored
    /// and `false` is returned.
    pub fn schedule(&self, call: &Arc<OutboundCall>) -> bool {
        let Some(deadline) = call.deadline() else {
            return false;
        };
        let mut state = self.inner.lock();
        let key = state.next_key;
        state.next_key += 1;
        state.deadlines.push(key, Reverse(deadline));
        state.calls.insert(key, Arc::downgrade(call));
        true
    }

    /// Time out every unfinished call whose deadline is at or before `now`.
    /// Returns how many calls this pass moved to TIMED_OUT.
    pub fn expire(&self, now: Instant) -> usize {
        let due: Vec<Arc<OutboundCall>> = {
            let mut state = self.inner.lock();
            let mut due = Vec::new();
            while state
                .deadlines
                .peek()
                .map_or(false, |(_, Reverse(deadline))| *deadline <= now)
            {
                let Some((key, _)) = state.deadlines.pop() else {
                    break;
                };
                if let Some(call) = state.calls.remove(&key).and_then(|weak| weak.upgrade()) {
                    due.push(call);
                }
            }
            due
        };

        // Callbacks run from check_deadline; never under our lock.
        let expired = due.iter().filter(|call| call.check_deadline(now)).count();
        if expired > 0 {
            tracing::debug!(expired, "timed out outbound calls");
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .lock()
            .deadlines
            .peek()
            .map(|(_, Reverse(deadline))| *deadline)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::ResponseCallback;
    use crate::outbound_call::{CallOptions, CallState};
    use bytes::Bytes;
    use corelib::{ConnectionId, RemoteMethod, RpcError, UserCredentials};
    use std::time::Duration;

    fn call(timeout: Option<Duration>) -> Arc<OutboundCall> {
        OutboundCall::new(
            ConnectionId::new("127.0.0.1:1".parse().unwrap(), UserCredentials::default()),
            RemoteMethod::new("s", "m"),
            CallOptions {
                timeout,
                ..Default::default()
            },
            Bytes::new(),
            ResponseCallback::noop(),
        )
    }

    #[test]
    fn test_expires_in_deadline_order() {
        let queue = TimeoutQueue::new();
        let short = call(Some(Duration::from_millis(10)));
        let long = call(Some(Duration::from_secs(60)));
        assert!(queue.schedule(&long));
        assert!(queue.schedule(&short));
        assert_eq!(queue.next_deadline(), short.deadline());

        let now = short.start_time() + Duration::from_millis(20);
        assert_eq!(queue.expire(now), 1);
        assert_eq!(short.state(), CallState::TimedOut);
        assert_eq!(long.state(), CallState::Ready);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_finished_and_dropped_calls_are_skipped() {
        let queue = TimeoutQueue::new();
        let finished = call(Some(Duration::from_millis(1)));
        finished.set_failed(RpcError::Network("gone".into()));
        queue.schedule(&finished);

        let dropped = call(Some(Duration::from_millis(1)));
        queue.schedule(&dropped);
        drop(dropped);

        assert_eq!(queue.expire(Instant::now() + Duration::from_secs(1)), 0);
        assert!(queue.is_empty());
        assert_eq!(finished.state(), CallState::FinishedError);
    }

    #[test]
    fn test_calls_without_timeout_not_scheduled() {
        let queue = TimeoutQueue::new();
        assert!(!queue.schedule(&call(None)));
        assert!(queue.is_empty());
        assert_eq!(queue.next_deadline(), None);
    }
}
