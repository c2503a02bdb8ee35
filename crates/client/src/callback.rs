//! Completion continuations for outbound calls.

use std::fmt;

use bytes::Bytes;
use corelib::RpcError;
use crossbeam::channel::{self, Receiver};

/// What a finished call reports: the response body, or why there is none.
pub type CallOutcome = std::result::Result<Bytes, RpcError>;

/// One-shot continuation run when a call reaches a terminal state.
///
/// Consumed on invocation, so it cannot run twice; the call additionally
/// takes it out of its state under the transition lock.
pub struct ResponseCallback(Box<dyn FnOnce(CallOutcome) + Send + 'static>);

impl ResponseCallback {
    pub fn new(f: impl FnOnce(CallOutcome) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Callback that forwards the outcome into a channel.
    pub fn channel() -> (Self, Receiver<CallOutcome>) {
        let (tx, rx) = channel::bounded(1);
        let callback = Self::new(move |outcome| {
            // Receiver may be gone if the caller stopped waiting.
            let _ = tx.send(outcome);
        });
        (callback, rx)
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub(crate) fn invoke(self, outcome: CallOutcome) {
        (self.0)(outcome)
    }
}

impl fmt::Debug for ResponseCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseCallback")
    }
}
