//! Frame prefix encoding and zero-copy body slicing.

use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{LENGTH_FIELD_SIZE, MAX_SIDECARS};
use crate::error::{Error, Result};

/// Header plus the byte range of the body within the parsed buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame<H> {
    pub header: H,
    pub body: Range<usize>,
}

/// Message and sidecar ranges inside a body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyLayout {
    pub message: Range<usize>,
    pub sidecars: Vec<Range<usize>>,
}

impl BodyLayout {
    /// Rebase every range by `base` so they index the enclosing buffer.
    pub fn offset_by(self, base: usize) -> Self {
        let shift = |r: Range<usize>| (r.start + base)..(r.end + base);
        Self {
            message: shift(self.message),
            sidecars: self.sidecars.into_iter().map(shift).collect(),
        }
    }
}

/// Encode `total_len ‖ header_len ‖ header` for a body of `body_len` bytes.
///
/// The body itself is never copied: callers send the returned prefix followed
/// by their own body slices.
pub fn encode_frame_prefix<H: Serialize>(
    header: &H,
    body_len: usize,
    max_message_size: usize,
) -> Result<Bytes> {
    let header_bytes = bincode::serialize(header)?;
    let total_len = LENGTH_FIELD_SIZE + header_bytes.len() + body_len;
    let frame_size = LENGTH_FIELD_SIZE + total_len;
    if frame_size > max_message_size {
        return Err(Error::MessageTooLarge {
            size: frame_size,
            limit: max_message_size,
        });
    }
    let too_large = || Error::MessageTooLarge {
        size: frame_size,
        limit: u32::MAX as usize,
    };
    let total_len = u32::try_from(total_len).map_err(|_| too_large())?;
    let header_len = u32::try_from(header_bytes.len()).map_err(|_| too_large())?;

    let mut buf = BytesMut::with_capacity(2 * LENGTH_FIELD_SIZE + header_bytes.len());
    buf.put_u32(total_len);
    buf.put_u32(header_len);
    buf.put_slice(&header_bytes);
    Ok(buf.freeze())
}

/// Validate a complete frame and decode its header.
pub fn parse_frame<H: DeserializeOwned>(data: &[u8], max_message_size: usize) -> Result<ParsedFrame<H>> {
    if data.len() > max_message_size {
        return Err(Error::MessageTooLarge {
            size: data.len(),
            limit: max_message_size,
        });
    }
    if data.len() < 2 * LENGTH_FIELD_SIZE {
        return Err(Error::InvalidFrame(format!(
            "frame of {} bytes is shorter than its length prefix",
            data.len()
        )));
    }

    let total_len = read_u32(&data[..LENGTH_FIELD_SIZE]) as usize;
    let carried = data.len() - LENGTH_FIELD_SIZE;
    if total_len != carried {
        return Err(Error::InvalidFrame(format!(
            "frame declares {} bytes but carries {}",
            total_len, carried
        )));
    }

    let header_len = read_u32(&data[LENGTH_FIELD_SIZE..2 * LENGTH_FIELD_SIZE]) as usize;
    let header_start = 2 * LENGTH_FIELD_SIZE;
    let header_end = header_start
        .checked_add(header_len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| {
            Error::InvalidFrame(format!(
                "header of {} bytes overruns a {} byte frame",
                header_len,
                data.len()
            ))
        })?;

    let header = bincode::deserialize(&data[header_start..header_end])?;
    Ok(ParsedFrame {
        header,
        body: header_end..data.len(),
    })
}

/// Split a body of `body_len` bytes into the main message and its sidecars.
///
/// Offsets must be non-decreasing and lie within the body.
pub fn split_body(body_len: usize, sidecar_offsets: &[u32]) -> Result<BodyLayout> {
    if sidecar_offsets.len() > MAX_SIDECARS {
        return Err(Error::TooManySidecars { max: MAX_SIDECARS });
    }

    let bounds: Vec<usize> = sidecar_offsets.iter().map(|o| *o as usize).collect();
    let message_end = bounds.first().copied().unwrap_or(body_len);
    if message_end > body_len {
        return Err(Error::InvalidFrame(format!(
            "sidecar offset {} beyond body of {} bytes",
            message_end, body_len
        )));
    }

    let mut sidecars = Vec::with_capacity(bounds.len());
    for (idx, start) in bounds.iter().enumerate() {
        let end = bounds.get(idx + 1).copied().unwrap_or(body_len);
        if *start > end || end > body_len {
            return Err(Error::InvalidFrame(format!(
                "sidecar {} spans {}..{} in a body of {} bytes",
                idx, start, end, body_len
            )));
        }
        sidecars.push(*start..end);
    }

    Ok(BodyLayout {
        message: 0..message_end,
        sidecars,
    })
}

/// Offsets for sidecars appended after a message of `message_len` bytes.
pub fn sidecar_offsets(message_len: usize, sidecars: &[Bytes]) -> Result<Vec<u32>> {
    if sidecars.len() > MAX_SIDECARS {
        return Err(Error::TooManySidecars { max: MAX_SIDECARS });
    }
    let mut offsets = Vec::with_capacity(sidecars.len());
    let mut offset = message_len;
    for sidecar in sidecars {
        let encoded = u32::try_from(offset).map_err(|_| Error::MessageTooLarge {
            size: offset,
            limit: u32::MAX as usize,
        })?;
        offsets.push(encoded);
        offset += sidecar.len();
    }
    Ok(offsets)
}

#[inline]
fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
