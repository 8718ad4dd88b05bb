use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Stable key of one plugin installation, e.g. `langgenius/openai:0.0.1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginIdentity(Arc<str>);

impl PluginIdentity {
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(Arc::from(value.as_ref()))
    }

    /// Build the canonical `author/name:version` identity.
    pub fn from_parts(author: &str, name: &str, version: &str) -> Self {
        Self::new(format!("{author}/{name}:{version}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PluginIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PluginIdentity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PluginIdentity {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}
