//! RPC feature flags negotiated per connection.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection-level features a peer may advertise during negotiation.
///
/// Application-level feature requirements are plain `u32`s carried in the
/// request header; a call that carries any of them also requires the peer
/// to understand `ApplicationFeatureFlags`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RpcFeatureFlag {
    ApplicationFeatureFlags,
}

impl RpcFeatureFlag {
    pub fn name(&self) -> &'static str {
        match self {
            RpcFeatureFlag::ApplicationFeatureFlags => "APPLICATION_FEATURE_FLAGS",
        }
    }
}

impl fmt::Display for RpcFeatureFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Features a server advertises by default.
pub fn supported_server_features() -> BTreeSet<RpcFeatureFlag> {
    BTreeSet::from([RpcFeatureFlag::ApplicationFeatureFlags])
}
