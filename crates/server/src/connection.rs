//! The transport connection an inbound call arrived on.
//!
//! Socket I/O lives outside this crate; a call only needs to know who sent
//! it, whether they are still there, and where to queue its response.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use corelib::UserCredentials;

/// A fully serialized response ready for the connection's write queue.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub call_id: i32,
    /// Frame prefix with header, message, then sidecars.
    pub slices: Vec<Bytes>,
}

impl OutboundResponse {
    pub fn total_len(&self) -> usize {
        self.slices.iter().map(Bytes::len).sum()
    }

    /// Concatenate the slices into one contiguous frame.
    pub fn to_frame(&self) -> Bytes {
        let mut frame = BytesMut::with_capacity(self.total_len());
        for slice in &self.slices {
            frame.extend_from_slice(slice);
        }
        frame.freeze()
    }
}

pub trait Connection: Send + Sync {
    fn remote_address(&self) -> SocketAddr;

    fn remote_user(&self) -> UserCredentials {
        UserCredentials::default()
    }

    /// Hand a response to the write path. Must not block on socket I/O.
    fn queue_response(&self, response: OutboundResponse);

    /// False once the peer has disconnected; responses queued afterwards are
    /// discarded by the transport.
    fn is_alive(&self) -> bool {
        true
    }
}
