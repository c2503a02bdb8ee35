//! Server half of the RPC call lifecycle.
//!
//! This crate provides:
//! - `InboundCall`: a parsed request, its sidecars and its single response
//! - `ResultTracker`: exactly-once execution and response replay for
//!   requests carrying a `RequestId`
//! - `Connection` and `RpcContext`: the seams to the transport and to the
//!   handler that answers a tracked attempt

pub mod connection;
pub mod context;
pub mod inbound_call;
pub mod result_tracker;

pub use connection::{Connection, OutboundResponse};
pub use context::RpcContext;
pub use inbound_call::{InboundCall, InboundCallTiming};
pub use result_tracker::{EvictionCandidate, GcThreadHandle, ResultTracker, ResultTrackerError, RpcState};
