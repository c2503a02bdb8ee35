//! Client half of the RPC call lifecycle.
//!
//! This crate provides:
//! - `RequestTracker`: per-client sequence numbers and low-water mark
//! - `OutboundCall`: the call state machine, serialization and timeout policy
//! - `RpcController`: the caller-facing handle for one call
//! - `CallResponse`: zero-copy view of a response frame
//! - `TimeoutQueue` and `CallRegistry`: the bookkeeping a connection needs to
//!   expire calls and route responses to them

pub mod callback;
pub mod controller;
pub mod outbound_call;
pub mod registry;
pub mod request_tracker;
pub mod response;
pub mod timeout;

pub use callback::{CallOutcome, ResponseCallback};
pub use controller::RpcController;
pub use outbound_call::{CallOptions, CallSnapshot, CallState, OutboundCall, Transition};
pub use registry::CallRegistry;
pub use request_tracker::RequestTracker;
pub use response::CallResponse;
pub use timeout::TimeoutQueue;
