//! Plugin manifest (`manifest.yaml`)
//!
//! Only the fields the daemon acts on are typed; everything else is kept
//! verbatim so that a load/save cycle does not lose data.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub author: String,
    pub name: String,
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Asset name of the plugin icon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(default)]
    pub runner: RunnerSpec,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl PluginManifest {
    pub fn from_yaml(yaml: &str) -> crate::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> crate::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// How the plugin is run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerSpec {
    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Module started with `-m`
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
}

fn default_language() -> String {
    "python".to_string()
}

fn default_entrypoint() -> String {
    "main".to_string()
}

impl Default for RunnerSpec {
    fn default() -> Self {
        Self {
            language: default_language(),
            version: None,
            entrypoint: default_entrypoint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
author: acme
name: weather
version: 0.2.1
icon: icon.svg
runner:
  language: python
  version: "3.12"
  entrypoint: main
meta:
  arch: [amd64, arm64]
"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = PluginManifest::from_yaml(MANIFEST).unwrap();
        assert_eq!(manifest.author, "acme");
        assert_eq!(manifest.runner.version.as_deref(), Some("3.12"));
        assert_eq!(manifest.icon.as_deref(), Some("icon.svg"));
        assert!(manifest.extra.contains_key("meta"));
    }

    #[test]
    fn test_runner_defaults() {
        let manifest =
            PluginManifest::from_yaml("author: acme\nname: echo\nversion: 0.0.1\n").unwrap();
        assert_eq!(manifest.runner, RunnerSpec::default());
    }

    #[test]
    fn test_unknown_fields_survive() {
        let manifest = PluginManifest::from_yaml(MANIFEST).unwrap();
        let again = PluginManifest::from_yaml(&manifest.to_yaml().unwrap()).unwrap();
        assert_eq!(manifest, again);
    }
}
