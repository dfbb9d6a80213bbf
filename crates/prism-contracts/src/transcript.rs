use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const TRANSCRIPT_SCHEMA_VERSION: u64 = 1;

/// One playground message. `body` is the rendered fragment shown to the
/// user; `artifact_url` keeps the raw media URL for tools (export) that
/// need it without re-parsing HTML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntry {
    pub message_id: String,
    pub role: String,
    pub modality: String,
    pub body: String,
    pub artifact_url: Option<String>,
    pub cost_usd: Option<f64>,
    pub task_id: Option<String>,
    pub created_at: String,
}

/// The session's message list, persisted as pretty JSON. Loading is lenient:
/// entries that fail to parse are skipped rather than poisoning the session.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub path: PathBuf,
    pub schema_version: u64,
    pub session_id: String,
    pub created_at: String,
    pub messages: Vec<MessageEntry>,
}

impl Transcript {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema_version: TRANSCRIPT_SCHEMA_VERSION,
            session_id: Uuid::new_v4().to_string(),
            created_at: now_utc_iso(),
            messages: Vec::new(),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut transcript = Self::new(path.clone());
        let payload = read_json(&path).unwrap_or(Value::Object(Map::new()));
        let Some(obj) = payload.as_object() else {
            return transcript;
        };

        transcript.schema_version = obj
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(transcript.schema_version);
        transcript.session_id = obj
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(transcript.session_id);
        transcript.created_at = obj
            .get("created_at")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(transcript.created_at);

        if let Some(messages) = obj.get("messages").and_then(Value::as_array) {
            for item in messages {
                if let Ok(parsed) = serde_json::from_value::<MessageEntry>(item.clone()) {
                    transcript.messages.push(parsed);
                }
            }
        }
        transcript
    }

    pub fn add_message(
        &mut self,
        role: &str,
        modality: &str,
        body: String,
        artifact_url: Option<String>,
        cost_usd: Option<f64>,
        task_id: Option<String>,
    ) -> MessageEntry {
        let entry = MessageEntry {
            message_id: self.next_message_id(),
            role: role.to_string(),
            modality: modality.to_string(),
            body,
            artifact_url,
            cost_usd,
            task_id,
            created_at: now_utc_iso(),
        };
        self.messages.push(entry.clone());
        entry
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let mut payload = Map::new();
        payload.insert(
            "schema_version".to_string(),
            Value::Number(self.schema_version.into()),
        );
        payload.insert(
            "session_id".to_string(),
            Value::String(self.session_id.clone()),
        );
        payload.insert(
            "created_at".to_string(),
            Value::String(self.created_at.clone()),
        );
        payload.insert(
            "messages".to_string(),
            Value::Array(
                self.messages
                    .iter()
                    .map(|entry| serde_json::to_value(entry).unwrap_or(Value::Null))
                    .collect(),
            ),
        );
        write_json(&self.path, Value::Object(payload))
    }

    fn next_message_id(&self) -> String {
        format!("m{}", self.messages.len() + 1)
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json(path: &Path, payload: Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&payload)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::Transcript;

    #[test]
    fn transcript_roundtrip() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("transcript.json");
        let mut transcript = Transcript::new(&path);

        transcript.add_message("user", "image", "a red fox".to_string(), None, None, None);
        transcript.add_message(
            "assistant",
            "image",
            "<img src=\"https://cdn.example/fox.png\" />".to_string(),
            Some("https://cdn.example/fox.png".to_string()),
            Some(0.02),
            None,
        );
        transcript.save()?;

        let loaded = Transcript::load(&path);
        assert_eq!(loaded.session_id, transcript.session_id);
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].message_id, "m1");
        assert_eq!(loaded.messages[1].cost_usd, Some(0.02));
        assert_eq!(
            loaded.messages[1].artifact_url.as_deref(),
            Some("https://cdn.example/fox.png")
        );
        Ok(())
    }

    #[test]
    fn malformed_entries_are_skipped_on_load() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("transcript.json");
        std::fs::write(
            &path,
            r#"{
                "schema_version": 1,
                "session_id": "s-1",
                "created_at": "2026-08-06T00:00:00+00:00",
                "messages": [
                    {"not": "a message"},
                    {
                        "message_id": "m1",
                        "role": "user",
                        "modality": "text",
                        "body": "hello",
                        "artifact_url": null,
                        "cost_usd": null,
                        "task_id": null,
                        "created_at": "2026-08-06T00:00:01+00:00"
                    }
                ]
            }"#,
        )?;

        let loaded = Transcript::load(&path);
        assert_eq!(loaded.session_id, "s-1");
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.messages[0].body, "hello");
        Ok(())
    }

    #[test]
    fn missing_file_starts_fresh() {
        let transcript = Transcript::load("/nonexistent/transcript.json");
        assert!(transcript.messages.is_empty());
        assert!(!transcript.session_id.is_empty());
    }
}
