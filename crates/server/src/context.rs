//! Reply target for a tracked RPC.

use bytes::Bytes;
use corelib::ErrorStatus;

/// Somewhere a response for one RPC attempt can be delivered.
///
/// The result tracker holds one context per waiting attempt and answers each
/// of them exactly once, always outside its lock. Implemented by
/// [`InboundCall`](crate::InboundCall); tests and in-process callers may
/// provide their own.
pub trait RpcContext: Send + Sync {
    fn reply_success(&self, response: Bytes);

    fn reply_failure(&self, status: ErrorStatus);

    /// Whether the attempt's caller can still receive a reply.
    fn is_reachable(&self) -> bool {
        true
    }
}
