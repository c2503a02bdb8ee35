//! Connection identity.
//!
//! Calls are routed to a connection by the pair (remote address, user
//! credentials): two proxies talking to the same server as different users
//! never share a socket.

use std::fmt;
use std::net::SocketAddr;

/// Credentials a connection is negotiated with.
///
/// Keep this struct small and cheap to clone; it is copied into every
/// outbound call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct UserCredentials {
    /// Effective user the connection authenticates as.
    pub real_user: Option<String>,
}

impl UserCredentials {
    pub fn new(real_user: impl Into<String>) -> Self {
        Self {
            real_user: Some(real_user.into()),
        }
    }
}

impl fmt::Display for UserCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.real_user {
            Some(user) => write!(f, "{{real_user={}}}", user),
            None => write!(f, "{{}}"),
        }
    }
}

/// Key identifying one client-side connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub remote: SocketAddr,
    pub user_credentials: UserCredentials,
}

impl ConnectionId {
    pub fn new(remote: SocketAddr, user_credentials: UserCredentials) -> Self {
        Self {
            remote,
            user_credentials,
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{remote={}, user_credentials={}}}",
            self.remote, self.user_credentials
        )
    }
}
