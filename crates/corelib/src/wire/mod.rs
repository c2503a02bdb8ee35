//! Wire-level fields this core reads and writes.
//!
//! Only the framing needed to slice a transfer into header, message and
//! sidecars lives here; socket I/O and negotiation belong to the transport.
//!
//! ```text
//! ┌──────────────┬───────────────┬────────────────┬────────────────────────────┐
//! │ total_len u32│ header_len u32│ header (bincode)│ body: msg ‖ sidecar 0 ‖ … │
//! └──────────────┴───────────────┴────────────────┴────────────────────────────┘
//! ```
//!
//! `total_len` counts every byte after itself. Sidecar offsets in the header
//! are relative to the start of the body.

pub mod frame;
pub mod header;

pub use frame::{encode_frame_prefix, parse_frame, sidecar_offsets, split_body, BodyLayout, ParsedFrame};
pub use header::{AppError, ErrorStatus, RequestHeader, ResponseHeader, RpcErrorCode};

/// Maximum number of slices a single outbound transfer may reference.
pub const MAX_PAYLOAD_SLICES: usize = 10;

/// Maximum number of sidecars per call: the header and the main message take
/// the remaining two slices.
pub const MAX_SIDECARS: usize = MAX_PAYLOAD_SLICES - 2;

/// Size of each big-endian length field in the frame prefix.
pub const LENGTH_FIELD_SIZE: usize = 4;
