//! Remote method naming.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fully qualified name of a remote method.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteMethod {
    pub service_name: String,
    pub method_name: String,
}

impl RemoteMethod {
    pub fn new(service_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            method_name: method_name.into(),
        }
    }
}

impl fmt::Display for RemoteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service_name, self.method_name)
    }
}
