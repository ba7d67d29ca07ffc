//! Workflow templates and job descriptors.
//!
//! A template is a ComfyUI API-format graph: an object keyed by node id
//! whose values carry an `inputs` object. A [`JobDescriptor`] is built by
//! overriding inputs that the template already declares. Anything else is
//! rejected, so a typo in a node id or input name never silently produces
//! a different job.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use dhgen_core::error::CoreError;
use serde_json::{Map, Value};

/// Template file used when none is configured.
pub const DEFAULT_WORKFLOW_FILE: &str = "voice-video-04-api.json";

/// A loaded API-format workflow graph.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    graph: Map<String, Value>,
    source: Option<PathBuf>,
}

impl WorkflowTemplate {
    /// Validate and wrap an in-memory graph.
    pub fn from_value(graph: Value) -> Result<Self, CoreError> {
        let Value::Object(graph) = graph else {
            return Err(CoreError::Validation(
                "workflow template must be a JSON object keyed by node id".into(),
            ));
        };
        if graph.is_empty() {
            return Err(CoreError::Validation("workflow template has no nodes".into()));
        }
        for (node_id, node) in &graph {
            if !node.get("inputs").is_some_and(Value::is_object) {
                return Err(CoreError::Validation(format!(
                    "workflow node '{node_id}' has no inputs object"
                )));
            }
        }
        Ok(Self {
            graph,
            source: None,
        })
    }

    /// Read a template from disk.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path).map_err(|e| CoreError::io(path, e))?;
        let graph: Value = serde_json::from_str(&raw).map_err(|e| {
            CoreError::Validation(format!("{} is not valid JSON: {e}", path.display()))
        })?;
        let mut template = Self::from_value(graph)?;
        template.source = Some(path.to_path_buf());
        tracing::debug!(path = %path.display(), nodes = template.graph.len(), "Loaded workflow template");
        Ok(template)
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.graph.keys().map(String::as_str)
    }

    /// Whether `node` declares `input`.
    pub fn declares(&self, binding: &InputBinding) -> bool {
        self.graph
            .get(&binding.node)
            .and_then(|node| node.get("inputs"))
            .and_then(Value::as_object)
            .is_some_and(|inputs| inputs.contains_key(&binding.input))
    }

    /// Start a descriptor from a copy of this template.
    pub fn builder(&self) -> DescriptorBuilder {
        DescriptorBuilder {
            graph: self.graph.clone(),
            assets: BTreeSet::new(),
        }
    }
}

/// Address of one input on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBinding {
    pub node: String,
    pub input: String,
}

impl InputBinding {
    pub fn new(node: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            input: input.into(),
        }
    }
}

impl std::fmt::Display for InputBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.node, self.input)
    }
}

/// Mutable copy of a template being turned into a [`JobDescriptor`].
#[derive(Debug)]
pub struct DescriptorBuilder {
    graph: Map<String, Value>,
    assets: BTreeSet<String>,
}

impl DescriptorBuilder {
    fn inputs_mut(&mut self, binding: &InputBinding) -> Result<&mut Map<String, Value>, CoreError> {
        self.graph
            .get_mut(&binding.node)
            .and_then(|node| node.get_mut("inputs"))
            .and_then(Value::as_object_mut)
            .ok_or_else(|| {
                CoreError::Validation(format!("workflow has no node '{}'", binding.node))
            })
    }

    /// Override an input the template declares.
    pub fn set(&mut self, binding: &InputBinding, value: impl Into<Value>) -> Result<(), CoreError> {
        let inputs = self.inputs_mut(binding)?;
        match inputs.get_mut(&binding.input) {
            Some(slot) => {
                *slot = value.into();
                Ok(())
            }
            None => Err(CoreError::Validation(format!(
                "workflow node '{}' has no input '{}'",
                binding.node, binding.input
            ))),
        }
    }

    /// Point an input at an uploaded asset and record the reference.
    pub fn bind_asset(&mut self, binding: &InputBinding, asset_id: &str) -> Result<(), CoreError> {
        self.set(binding, asset_id)?;
        self.assets.insert(asset_id.to_string());
        Ok(())
    }

    /// Apply each parameter to every node that declares it. Returns the
    /// keys no node declares; those leave the graph untouched.
    pub fn apply_params(&mut self, params: &Map<String, Value>) -> Vec<String> {
        let mut unmatched = Vec::new();
        for (key, value) in params {
            let mut applied = false;
            for node in self.graph.values_mut() {
                if let Some(slot) = node
                    .get_mut("inputs")
                    .and_then(Value::as_object_mut)
                    .and_then(|inputs| inputs.get_mut(key))
                {
                    *slot = value.clone();
                    applied = true;
                }
            }
            if !applied {
                unmatched.push(key.clone());
            }
        }
        unmatched
    }

    pub fn build(self) -> JobDescriptor {
        JobDescriptor {
            graph: Value::Object(self.graph),
            assets: self.assets,
        }
    }
}

/// An immutable job graph ready for submission, plus the asset
/// identifiers it references.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    graph: Value,
    assets: BTreeSet<String>,
}

impl JobDescriptor {
    /// Assemble a descriptor from a raw graph and its asset references.
    pub fn from_parts(graph: Value, assets: impl IntoIterator<Item = String>) -> Self {
        Self {
            graph,
            assets: assets.into_iter().collect(),
        }
    }

    pub fn graph(&self) -> &Value {
        &self.graph
    }

    /// Asset identifiers that must have been uploaded before submission.
    pub fn asset_refs(&self) -> impl Iterator<Item = &str> {
        self.assets.iter().map(String::as_str)
    }
}

/// Where the digital-human template takes each of its inputs.
#[derive(Debug, Clone)]
pub struct DigitalHumanBindings {
    pub audio: InputBinding,
    /// Cleared when present so the UI-side audio preview does not
    /// override the uploaded file.
    pub audio_ui: Option<InputBinding>,
    pub visual: InputBinding,
    pub text: InputBinding,
    pub positive_prompt: InputBinding,
    pub negative_prompt: InputBinding,
}

impl Default for DigitalHumanBindings {
    fn default() -> Self {
        Self {
            audio: InputBinding::new("1", "audio"),
            audio_ui: Some(InputBinding::new("1", "audioUI")),
            visual: InputBinding::new("5", "video"),
            text: InputBinding::new("3", "multi_line_prompt"),
            positive_prompt: InputBinding::new("21", "positive_prompt"),
            negative_prompt: InputBinding::new("21", "negative_prompt"),
        }
    }
}

/// Values for one digital-human job.
#[derive(Debug, Clone, Copy)]
pub struct DigitalHumanRequest<'a> {
    /// Uploaded reference audio.
    pub audio_asset: &'a str,
    /// Uploaded reference image or video.
    pub visual_asset: &'a str,
    /// Text to speak.
    pub text: &'a str,
    pub positive_prompt: &'a str,
    pub negative_prompt: &'a str,
    pub params: &'a Map<String, Value>,
}

impl DigitalHumanBindings {
    /// Fill `template` for one request.
    pub fn describe(
        &self,
        template: &WorkflowTemplate,
        request: &DigitalHumanRequest<'_>,
    ) -> Result<JobDescriptor, CoreError> {
        let mut builder = template.builder();

        builder.bind_asset(&self.audio, request.audio_asset)?;
        if let Some(audio_ui) = self.audio_ui.as_ref().filter(|b| template.declares(b)) {
            builder.set(audio_ui, "")?;
        }
        builder.bind_asset(&self.visual, request.visual_asset)?;
        builder.set(&self.text, request.text)?;
        builder.set(&self.positive_prompt, request.positive_prompt)?;
        builder.set(&self.negative_prompt, request.negative_prompt)?;

        let unmatched = builder.apply_params(request.params);
        if !unmatched.is_empty() {
            tracing::warn!(
                params = ?unmatched,
                "Workflow parameters not declared by any template node were skipped",
            );
        }

        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn template() -> WorkflowTemplate {
        WorkflowTemplate::from_value(json!({
            "1": {"class_type": "LoadAudio", "inputs": {"audio": "placeholder.wav", "audioUI": "preview"}},
            "3": {"class_type": "TextInput", "inputs": {"multi_line_prompt": ""}},
            "5": {"class_type": "LoadImage", "inputs": {"video": "placeholder.png"}},
            "21": {"class_type": "Sampler", "inputs": {"positive_prompt": "", "negative_prompt": "", "temperature": 1.0}},
            "30": {"class_type": "Tts", "inputs": {"temperature": 1.0, "top_k": 50}}
        }))
        .unwrap()
    }

    fn request<'a>(params: &'a Map<String, Value>) -> DigitalHumanRequest<'a> {
        DigitalHumanRequest {
            audio_asset: "voice.wav",
            visual_asset: "face.png",
            text: "Hello there",
            positive_prompt: "smiling",
            negative_prompt: "blurry",
            params,
        }
    }

    #[test]
    fn default_bindings_fill_template() {
        let params = Map::new();
        let descriptor = DigitalHumanBindings::default()
            .describe(&template(), &request(&params))
            .unwrap();

        let graph = descriptor.graph();
        assert_eq!(graph["1"]["inputs"]["audio"], "voice.wav");
        assert_eq!(graph["1"]["inputs"]["audioUI"], "");
        assert_eq!(graph["5"]["inputs"]["video"], "face.png");
        assert_eq!(graph["3"]["inputs"]["multi_line_prompt"], "Hello there");
        assert_eq!(graph["21"]["inputs"]["positive_prompt"], "smiling");
        assert_eq!(graph["21"]["inputs"]["negative_prompt"], "blurry");
        assert_eq!(
            descriptor.asset_refs().collect::<Vec<_>>(),
            vec!["face.png", "voice.wav"]
        );
    }

    #[test]
    fn params_apply_to_every_declaring_node() {
        let mut params = Map::new();
        params.insert("temperature".into(), json!(0.8));
        params.insert("top_k".into(), json!(30));
        params.insert("num_beams".into(), json!(3));

        let mut builder = template().builder();
        let unmatched = builder.apply_params(&params);
        assert_eq!(unmatched, vec!["num_beams".to_string()]);

        let descriptor = builder.build();
        assert_eq!(descriptor.graph()["21"]["inputs"]["temperature"], 0.8);
        assert_eq!(descriptor.graph()["30"]["inputs"]["temperature"], 0.8);
        assert_eq!(descriptor.graph()["30"]["inputs"]["top_k"], 30);
        assert!(descriptor.graph()["30"]["inputs"].get("num_beams").is_none());
    }

    #[test]
    fn unknown_node_or_input_is_rejected() {
        let mut builder = template().builder();
        assert_matches!(
            builder.set(&InputBinding::new("99", "audio"), "x"),
            Err(CoreError::Validation(_))
        );
        assert_matches!(
            builder.set(&InputBinding::new("1", "volume"), 3),
            Err(CoreError::Validation(_))
        );
    }

    #[test]
    fn missing_audio_ui_is_not_an_error() {
        let tpl = WorkflowTemplate::from_value(json!({
            "1": {"inputs": {"audio": ""}},
            "3": {"inputs": {"multi_line_prompt": ""}},
            "5": {"inputs": {"video": ""}},
            "21": {"inputs": {"positive_prompt": "", "negative_prompt": ""}}
        }))
        .unwrap();
        let params = Map::new();
        let descriptor = DigitalHumanBindings::default()
            .describe(&tpl, &request(&params))
            .unwrap();
        assert!(descriptor.graph()["1"]["inputs"].get("audioUI").is_none());
    }

    #[test]
    fn malformed_templates_are_rejected() {
        assert_matches!(
            WorkflowTemplate::from_value(json!([1, 2])),
            Err(CoreError::Validation(_))
        );
        assert_matches!(
            WorkflowTemplate::from_value(json!({})),
            Err(CoreError::Validation(_))
        );
        assert_matches!(
            WorkflowTemplate::from_value(json!({"1": {"class_type": "X"}})),
            Err(CoreError::Validation(_))
        );
    }

    #[test]
    fn load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.json");
        std::fs::write(&path, r#"{"7": {"inputs": {"seed": 1}}}"#).unwrap();

        let tpl = WorkflowTemplate::load(&path).unwrap();
        assert_eq!(tpl.source(), Some(path.as_path()));
        assert_eq!(tpl.node_ids().collect::<Vec<_>>(), vec!["7"]);

        assert_matches!(
            WorkflowTemplate::load(&dir.path().join("missing.json")),
            Err(CoreError::Io { .. })
        );
    }
}
