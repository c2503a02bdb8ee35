//! Core library for exactly-once RPC tracking.
//!
//! This crate provides the vocabulary shared by the client and server halves:
//! - Sequence numbers and request identifiers
//! - Connection identity, remote methods and feature flags
//! - Request/response headers and zero-copy frame slicing
//! - Memory budgets and size-accounted maps for caches
//! - Configuration and error types

pub mod config;
pub mod connection;
pub mod error;
pub mod features;
pub mod ids;
pub mod memory;
pub mod method;
pub mod wire;

pub use config::{ResultTrackerConfig, RpcConfig, StalePolicy};
pub use connection::{ConnectionId, UserCredentials};
pub use error::{Error, Result, RpcError};
pub use features::{supported_server_features, RpcFeatureFlag};
pub use ids::{AttemptNumber, RequestId, SequenceNumber, NO_SEQ_NO};
pub use memory::{AccountedMap, AccountedMut, MemoryBudget, MemoryFootprint};
pub use method::RemoteMethod;
pub use wire::{ErrorStatus, RequestHeader, ResponseHeader, RpcErrorCode};
