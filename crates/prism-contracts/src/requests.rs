use std::collections::BTreeMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use regex::Regex;
use serde_json::{Map, Value};

use crate::models::{Modality, ModelSpec};

/// A local file staged for upload. The gateway takes inline `data:` URLs, so
/// the bytes are read eagerly and the original path is kept only for display.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub path: String,
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|err| anyhow::anyhow!("failed reading {}: {err}", path.display()))?;
        Ok(Self {
            path: path.to_string_lossy().to_string(),
            mime: mime_for_path(path).unwrap_or("application/octet-stream"),
            bytes,
        })
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, BASE64.encode(&self.bytes))
    }
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "mp3" => Some("audio/mpeg"),
        "wav" => Some("audio/wav"),
        "mp4" => Some("video/mp4"),
        _ => None,
    }
}

/// A validated, JSON-serializable generation request. Immutable once built;
/// the submit payload is derived, never mutated in place.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub modality: Modality,
    pub prompt: String,
    pub fields: BTreeMap<String, String>,
    pub images: Vec<String>,
    pub options: Map<String, Value>,
}

impl GenerationRequest {
    /// Builds a request for `model`, enforcing the model's input rules before
    /// anything touches the network. Violations come back as user-facing
    /// messages.
    pub fn build(
        model: &ModelSpec,
        prompt: &str,
        attachments: &[Attachment],
        options: Map<String, Value>,
    ) -> Result<GenerationRequest, String> {
        let prompt = prompt.trim();

        if model.requires_image() && attachments.is_empty() {
            return Err(format!(
                "Model '{}' requires an input image attachment.",
                model.name
            ));
        }
        if model.requires_instruction() && prompt.is_empty() {
            return Err(format!(
                "Model '{}' requires a text instruction.",
                model.name
            ));
        }
        if prompt.is_empty() && attachments.is_empty() {
            return Err("Nothing to send: the prompt is empty.".to_string());
        }

        let mut fields = BTreeMap::new();
        if let Some(keys) = model.structured_keys() {
            let extracted = extract_structured_fields(prompt);
            for key in keys {
                match extracted.get(key) {
                    Some(value) => {
                        fields.insert(key.clone(), value.clone());
                    }
                    None => {
                        return Err(format!(
                            "Model '{}' requires '{key}: \u{2026}' in the prompt \
                             (format: KEY: value | KEY: value).",
                            model.name
                        ));
                    }
                }
            }
        }

        Ok(GenerationRequest {
            model: model.name.clone(),
            modality: model.modality,
            prompt: prompt.to_string(),
            fields,
            images: attachments
                .iter()
                .map(Attachment::data_url)
                .collect::<Vec<String>>(),
            options,
        })
    }

    /// The outbound JSON body. Options are merged last but never override the
    /// built-in keys.
    pub fn payload(&self) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("model".to_string(), Value::String(self.model.clone()));
        payload.insert(
            "modality".to_string(),
            Value::String(self.modality.as_str().to_string()),
        );
        payload.insert("prompt".to_string(), Value::String(self.prompt.clone()));
        if !self.images.is_empty() {
            payload.insert(
                "images".to_string(),
                Value::Array(self.images.iter().cloned().map(Value::String).collect()),
            );
        }
        if !self.fields.is_empty() {
            let mut fields = Map::new();
            for (key, value) in &self.fields {
                fields.insert(key.clone(), Value::String(value.clone()));
            }
            payload.insert("fields".to_string(), Value::Object(fields));
        }
        for (key, value) in &self.options {
            if payload.contains_key(key) {
                continue;
            }
            payload.insert(key.clone(), value.clone());
        }
        payload
    }
}

/// Pulls `KEY: value` pairs out of a `KEY: value | KEY: value` prompt. Keys
/// are uppercase identifiers; values run to the next `|` separator.
pub fn extract_structured_fields(prompt: &str) -> BTreeMap<String, String> {
    let pattern = Regex::new(r"([A-Z][A-Z0-9_]*)\s*:\s*([^|]*)").expect("structured field pattern");
    let mut fields = BTreeMap::new();
    for segment in prompt.split('|') {
        if let Some(captures) = pattern.captures(segment) {
            let key = captures[1].to_string();
            let value = captures[2].trim().to_string();
            if !value.is_empty() {
                fields.entry(key).or_insert(value);
            }
        }
    }
    fields
}
