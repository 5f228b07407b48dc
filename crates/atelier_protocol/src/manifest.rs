//! Plugin manifest (`plugin.json`)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

/// File name the worker looks for in each plugin directory
pub const MANIFEST_FILE_NAME: &str = "plugin.json";

/// Error type for manifest parsing
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Manifest has an empty id")]
    EmptyId,
}

/// Declarative description of a plugin, independent of runtime state.
///
/// Immutable once discovered. Missing fields take defaults so that hand
/// written manifests only need an `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PluginManifest {
    /// Unique plugin identifier, the registry key
    pub id: String,
    /// Human-readable name (defaults to the id)
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default = "default_category")]
    pub category: String,
    /// Interface the plugin claims to implement (e.g. `text-to-speech`)
    #[serde(default)]
    pub contract: String,
    #[serde(default, alias = "entryPoint")]
    pub entry_point: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(
        default,
        alias = "minHostVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_host_version: Option<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_category() -> String {
    "custom".to_string()
}

impl PluginManifest {
    /// Create a manifest with every optional field defaulted
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: default_version(),
            description: String::new(),
            author: String::new(),
            category: default_category(),
            contract: String::new(),
            entry_point: String::new(),
            dependencies: Vec::new(),
            tags: Vec::new(),
            min_host_version: None,
        }
    }

    /// Validate and normalise a manifest received as raw JSON
    pub fn from_value(value: Value) -> Result<Self, ManifestError> {
        let mut manifest: PluginManifest = serde_json::from_value(value)?;
        manifest.id = manifest.id.trim().to_string();
        if manifest.id.is_empty() {
            return Err(ManifestError::EmptyId);
        }
        if manifest.name.trim().is_empty() {
            manifest.name = manifest.id.clone();
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_fields_take_defaults() {
        let manifest = PluginManifest::from_value(json!({"id": "tts_kokoro"})).unwrap();
        assert_eq!(manifest.name, "tts_kokoro");
        assert_eq!(manifest.version, "1.0.0");
        assert_eq!(manifest.category, "custom");
        assert!(manifest.dependencies.is_empty());
        assert!(manifest.tags.is_empty());
        assert!(manifest.min_host_version.is_none());
    }

    #[test]
    fn test_snake_case_and_camel_case_are_accepted() {
        let snake = PluginManifest::from_value(json!({
            "id": "vision",
            "entry_point": "main.py",
            "min_host_version": "0.2.0"
        }))
        .unwrap();
        let camel = PluginManifest::from_value(json!({
            "id": "vision",
            "entryPoint": "main.py",
            "minHostVersion": "0.2.0"
        }))
        .unwrap();
        assert_eq!(snake, camel);
        assert_eq!(snake.entry_point, "main.py");
    }

    #[test]
    fn test_id_is_required() {
        assert!(matches!(
            PluginManifest::from_value(json!({"name": "nameless"})),
            Err(ManifestError::Parse(_))
        ));
        assert!(matches!(
            PluginManifest::from_value(json!({"id": "  "})),
            Err(ManifestError::EmptyId)
        ));
        assert!(PluginManifest::from_value(json!(["not", "an", "object"])).is_err());
    }
}
