use std::fmt;

use indexmap::IndexMap;

/// Output media type of a model. The wire form is lowercase (`"3d"` for
/// `ThreeD`); cross-modal models (image-to-video and friends) are classified
/// by what they produce, with their inputs described by [`InputRule`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    Text,
    Image,
    Video,
    Audio,
    ThreeD,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image => "image",
            Modality::Video => "video",
            Modality::Audio => "audio",
            Modality::ThreeD => "3d",
        }
    }

    pub fn parse(raw: &str) -> Option<Modality> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" | "chat" => Some(Modality::Text),
            "image" => Some(Modality::Image),
            "video" => Some(Modality::Video),
            "audio" | "music" | "speech" => Some(Modality::Audio),
            "3d" | "threed" | "model" => Some(Modality::ThreeD),
            _ => None,
        }
    }

    /// Status checks allowed before an async task is declared timed out.
    /// Video renders run long, so they get twice the budget (roughly 120s
    /// against 60s at the fixed 2-second tick).
    pub fn poll_attempt_budget(&self) -> u32 {
        match self {
            Modality::Video => 60,
            _ => 30,
        }
    }

    /// Noun used in user-facing messages ("Failed to generate {noun}").
    pub fn artifact_noun(&self) -> &'static str {
        match self {
            Modality::Text => "response",
            Modality::Image => "image",
            Modality::Video => "video",
            Modality::Audio => "audio",
            Modality::ThreeD => "3D model",
        }
    }

    pub fn all() -> &'static [Modality] {
        &[
            Modality::Text,
            Modality::Image,
            Modality::Video,
            Modality::Audio,
            Modality::ThreeD,
        ]
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input a model insists on before a request may be submitted. Violations are
/// caught client-side; no network call is made for an invalid request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRule {
    /// Model consumes an input image (image editing, image-to-video,
    /// image-to-3D).
    ImageAttachment,
    /// Model needs a non-empty text instruction even when an image is
    /// attached.
    TextInstruction,
    /// Prompt must carry a `KEY: value | KEY: value` mini-syntax with these
    /// keys present.
    StructuredPrompt { keys: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub name: String,
    pub modality: Modality,
    pub pricing_key: Option<String>,
    pub input_rules: Vec<InputRule>,
    pub context_window: Option<u64>,
}

impl ModelSpec {
    pub fn requires_image(&self) -> bool {
        self.input_rules
            .iter()
            .any(|rule| matches!(rule, InputRule::ImageAttachment))
    }

    pub fn requires_instruction(&self) -> bool {
        self.input_rules
            .iter()
            .any(|rule| matches!(rule, InputRule::TextInstruction))
    }

    pub fn structured_keys(&self) -> Option<&[String]> {
        self.input_rules.iter().find_map(|rule| match rule {
            InputRule::StructuredPrompt { keys } => Some(keys.as_slice()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_modality(&self, modality: Modality) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.modality == modality)
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, modality: Modality) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.modality == modality {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str,
                      modality: Modality,
                      input_rules: Vec<InputRule>,
                      context_window: Option<u64>,
                      pricing_key: Option<&str>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                modality,
                pricing_key: pricing_key.map(str::to_string),
                input_rules,
                context_window,
            },
        );
    };

    insert(
        "qwen3-32b",
        Modality::Text,
        vec![InputRule::TextInstruction],
        Some(32768),
        Some("qwen3-32b"),
    );
    insert(
        "deepseek-v3",
        Modality::Text,
        vec![InputRule::TextInstruction],
        Some(64000),
        Some("deepseek-v3"),
    );
    insert(
        "flux-schnell",
        Modality::Image,
        vec![InputRule::TextInstruction],
        None,
        Some("flux-schnell"),
    );
    insert(
        "sdxl-lightning",
        Modality::Image,
        vec![InputRule::TextInstruction],
        None,
        Some("sdxl-lightning"),
    );
    insert(
        "recraft-v3",
        Modality::Image,
        vec![InputRule::TextInstruction],
        None,
        Some("recraft-v3"),
    );
    insert(
        "wan-2.1-t2v",
        Modality::Video,
        vec![InputRule::TextInstruction],
        None,
        Some("wan-2.1-t2v"),
    );
    insert(
        "kling-1.6-standard",
        Modality::Video,
        vec![InputRule::TextInstruction],
        None,
        Some("kling-1.6-standard"),
    );
    insert(
        "kling-1.6-pro-i2v",
        Modality::Video,
        vec![InputRule::ImageAttachment, InputRule::TextInstruction],
        None,
        Some("kling-1.6-pro-i2v"),
    );
    insert(
        "vace-1.3b",
        Modality::Video,
        vec![
            InputRule::ImageAttachment,
            InputRule::StructuredPrompt {
                keys: vec!["SOURCE".to_string(), "EDIT".to_string()],
            },
        ],
        None,
        Some("vace-1.3b"),
    );
    insert(
        "musicgen-stereo",
        Modality::Audio,
        vec![InputRule::TextInstruction],
        None,
        Some("musicgen-stereo"),
    );
    insert(
        "kokoro-tts",
        Modality::Audio,
        vec![InputRule::TextInstruction],
        None,
        Some("kokoro-tts"),
    );
    insert(
        "hunyuan3d-2",
        Modality::ThreeD,
        vec![InputRule::ImageAttachment],
        None,
        Some("hunyuan3d-2"),
    );
    insert(
        "trellis-3d",
        Modality::ThreeD,
        vec![InputRule::ImageAttachment],
        None,
        Some("trellis-3d"),
    );

    map
}
