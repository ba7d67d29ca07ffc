//! Per-character configuration.
//!
//! A character folder may carry a `config.json`. It is deep-merged over
//! [`CharacterConfig::defaults`]: objects merge key by key, every other
//! JSON value replaces the default outright.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::CoreError;

/// Name of the optional configuration file inside a character folder.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Default negative prompt used when a character does not override it.
pub const DEFAULT_NEGATIVE_PROMPT: &str = "bright tones, overexposed, static, blurred details, \
subtitles, style, works, paintings, images, static, overall gray, worst quality, low quality, \
JPEG compression residue, ugly, incomplete, extra fingers, poorly drawn hands, poorly drawn faces, \
deformed, disfigured, misshapen limbs, fused fingers, still picture, messy background";

/// Effective configuration of one character after merging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterConfig {
    #[serde(default)]
    pub positive_prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    /// Extra template parameters (e.g. `temperature`, `top_k`).
    #[serde(default)]
    pub workflow_params: Map<String, Value>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CharacterConfig {
    /// Built-in defaults.
    pub fn defaults() -> Self {
        let mut workflow_params = Map::new();
        workflow_params.insert("temperature".into(), json!(0.8));
        workflow_params.insert("top_k".into(), json!(30));
        workflow_params.insert("top_p".into(), json!(0.8));
        workflow_params.insert("num_beams".into(), json!(3));

        Self {
            positive_prompt: "A person talking naturally".to_string(),
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            workflow_params,
            description: String::new(),
            tags: Vec::new(),
        }
    }

    /// Built-in defaults as raw JSON (the merge base).
    pub fn defaults_json() -> Value {
        let defaults = Self::defaults();
        json!({
            "positive_prompt": defaults.positive_prompt,
            "negative_prompt": defaults.negative_prompt,
            "workflow_params": defaults.workflow_params,
            "description": defaults.description,
            "tags": defaults.tags,
        })
    }

    fn from_value(value: Value) -> Result<Self, CoreError> {
        serde_json::from_value(value)
            .map_err(|e| CoreError::Config(format!("Invalid character config: {e}")))
    }

    /// Load `config.json` from `character_dir` and merge it over the
    /// defaults. A missing file yields the defaults.
    pub fn load(character_dir: &Path) -> Result<Self, CoreError> {
        let mut merged = Self::defaults_json();
        if let Some(overrides) = read_config_file(character_dir)? {
            merge_json(&mut merged, overrides);
        }
        Self::from_value(merged)
    }

    /// Write the default configuration into `character_dir`.
    pub fn write_default(character_dir: &Path) -> Result<(), CoreError> {
        let path = character_dir.join(CONFIG_FILE_NAME);
        let body = serde_json::to_string_pretty(&Self::defaults_json())
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        std::fs::write(&path, body).map_err(|e| CoreError::io(path, e))
    }
}

/// Read and parse `config.json` if present.
pub fn read_config_file(character_dir: &Path) -> Result<Option<Value>, CoreError> {
    let path = character_dir.join(CONFIG_FILE_NAME);
    if !path.is_file() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path).map_err(|e| CoreError::io(&path, e))?;
    let value: Value = serde_json::from_str(&raw).map_err(|e| {
        CoreError::Config(format!("Failed to parse {}: {e}", path.display()))
    })?;
    if !value.is_object() {
        return Err(CoreError::Config(format!(
            "{} must contain a JSON object",
            path.display()
        )));
    }
    Ok(Some(value))
}

/// Deep-merge `overlay` into `base`.
///
/// Objects are merged recursively; any other overlay value (including
/// arrays and `null`) replaces the base value.
pub fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_replaces_scalars_and_recurses_into_objects() {
        let mut base = json!({"a": 1, "nested": {"x": 1, "y": 2}, "list": [1, 2]});
        merge_json(
            &mut base,
            json!({"a": 2, "nested": {"y": 3, "z": 4}, "list": [9]}),
        );
        assert_eq!(
            base,
            json!({"a": 2, "nested": {"x": 1, "y": 3, "z": 4}, "list": [9]})
        );
    }

    #[test]
    fn missing_config_yields_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = CharacterConfig::load(dir.path()).expect("load");
        assert_eq!(config, CharacterConfig::defaults());
        assert_eq!(config.positive_prompt, "A person talking naturally");
        assert_eq!(config.workflow_params["top_k"], 30);
    }

    #[test]
    fn partial_config_overrides_only_given_keys() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{"positive_prompt": "A woman passionately talking", "workflow_params": {"top_k": 10}}"#,
        )
        .expect("write");

        let config = CharacterConfig::load(dir.path()).expect("load");
        assert_eq!(config.positive_prompt, "A woman passionately talking");
        assert_eq!(config.negative_prompt, DEFAULT_NEGATIVE_PROMPT);
        assert_eq!(config.workflow_params["top_k"], 10);
        assert_eq!(config.workflow_params["num_beams"], 3);
    }

    #[test]
    fn malformed_config_is_a_config_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{not json").expect("write");
        let err = CharacterConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)), "got {err:?}");
    }

    #[test]
    fn non_object_config_is_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "[1, 2]").expect("write");
        assert!(CharacterConfig::load(dir.path()).is_err());
    }

    #[test]
    fn write_default_round_trips() {
        let dir = tempfile::tempdir().expect("temp dir");
        CharacterConfig::write_default(dir.path()).expect("write");
        let config = CharacterConfig::load(dir.path()).expect("load");
        assert_eq!(config, CharacterConfig::defaults());
    }
}
