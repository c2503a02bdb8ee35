//! Runtime configuration.
//!
//! Both structs deserialize from JSON with every field optional; missing
//! fields take the defaults below.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default upper bound on a single frame (50 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Settings shared by the client and server call paths.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Frames above this size are rejected on both send and receive.
    pub max_message_size: usize,
    /// Timeout applied to calls whose controller does not set one.
    pub default_timeout_ms: Option<u64>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            default_timeout_ms: None,
        }
    }
}

impl RpcConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

/// What the server does with an in-flight request whose sequence number
/// falls below the client's low-water mark.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalePolicy {
    /// Keep the driver authoritative and answer every waiter when it finishes.
    #[default]
    AlwaysComplete,
    /// Answer waiters with `RequestStale` immediately and tell the driver it
    /// may stop.
    AbandonEarly,
}

/// Settings for the server-side result cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultTrackerConfig {
    /// Period of the background GC thread.
    pub gc_interval_ms: u64,
    /// A client not heard from for this long has its completed results
    /// dropped and, once nothing is in flight, its state removed.
    pub client_inactivity_ttl_ms: u64,
    /// Under memory pressure, completed results at least this old are
    /// evicted even above the client's watermark.
    pub memory_pressure_min_age_ms: u64,
    /// Soft limit for the cache's memory budget; `None` disables the
    /// memory-pressure pass.
    pub memory_limit_bytes: Option<i64>,
    pub stale_policy: StalePolicy,
}

impl Default for ResultTrackerConfig {
    fn default() -> Self {
        Self {
            gc_interval_ms: 1_000,
            client_inactivity_ttl_ms: 60 * 60 * 1_000,
            memory_pressure_min_age_ms: 10_000,
            memory_limit_bytes: None,
            stale_policy: StalePolicy::AlwaysComplete,
        }
    }
}

impl ResultTrackerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    pub fn client_inactivity_ttl(&self) -> Duration {
        Duration::from_millis(self.client_inactivity_ttl_ms)
    }

    pub fn memory_pressure_min_age(&self) -> Duration {
        Duration::from_millis(self.memory_pressure_min_age_ms)
    }
}
