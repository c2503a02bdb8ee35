//! Parsed response frames.

use bytes::Bytes;
use corelib::wire::{self, ResponseHeader, MAX_SIDECARS};
use corelib::{Error, ErrorStatus, Result};

/// A response frame split into header, message and sidecars.
///
/// The message and sidecars are views into the received transfer buffer;
/// nothing is copied.
#[derive(Debug, Clone)]
pub struct CallResponse {
    header: ResponseHeader,
    serialized_response: Bytes,
    sidecars: Vec<Bytes>,
}

impl CallResponse {
    /// Parse a complete response frame.
    pub fn parse_from(transfer: Bytes, max_message_size: usize) -> Result<Self> {
        let frame = wire::parse_frame::<ResponseHeader>(&transfer, max_message_size)?;
        let body_start = frame.body.start;
        let layout = wire::split_body(frame.body.len(), &frame.header.sidecar_offsets)?
            .offset_by(body_start);
        debug_assert!(layout.sidecars.len() <= MAX_SIDECARS);

        let serialized_response = transfer.slice(layout.message);
        let sidecars = layout
            .sidecars
            .into_iter()
            .map(|range| transfer.slice(range))
            .collect();

        Ok(Self {
            header: frame.header,
            serialized_response,
            sidecars,
        })
    }

    pub fn is_success(&self) -> bool {
        !self.header.is_error
    }

    pub fn call_id(&self) -> i32 {
        self.header.call_id
    }

    pub fn header(&self) -> &ResponseHeader {
        &self.header
    }

    /// The main response message (an encoded `ErrorStatus` for error responses).
    pub fn serialized_response(&self) -> &Bytes {
        &self.serialized_response
    }

    /// Decode the error body of an error response.
    pub fn error_status(&self) -> Result<ErrorStatus> {
        if self.is_success() {
            return Err(Error::IllegalState(format!(
                "response to call {} is not an error",
                self.call_id()
            )));
        }
        Ok(bincode::deserialize(&self.serialized_response)?)
    }

    pub fn sidecar_count(&self) -> usize {
        self.sidecars.len()
    }

    pub fn get_sidecar(&self, idx: usize) -> Result<Bytes> {
        self.sidecars
            .get(idx)
            .cloned()
            .ok_or(Error::SidecarOutOfRange {
                index: idx,
                count: self.sidecars.len(),
            })
    }
}
