use serde::{Deserialize, Serialize};

/// An authenticated identity bound to an opaque API key string.
///
/// Principals are created by external provisioning tooling, loaded in bulk
/// by the key store at startup, and never mutated in place at runtime --
/// only a full store reload replaces them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    #[serde(rename = "key")]
    pub key: String,
    pub name: String,
    pub email: String,
}

impl Principal {
    pub fn new(key: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            email: email.into(),
        }
    }
}
