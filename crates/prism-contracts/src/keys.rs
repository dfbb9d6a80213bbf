use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

/// JSON-file-backed credential cache: API keys, the last known account
/// balance, and the key-management JWT. Reads are lenient (a missing or
/// corrupt file is an empty store) and flushes merge dirty keys into
/// whatever is on disk, so two processes sharing the file do not clobber
/// each other's fields.
#[derive(Debug, Clone)]
pub struct KeyStore {
    path: PathBuf,
    payload: Option<Map<String, Value>>,
    dirty_keys: Vec<String>,
}

impl KeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: None,
            dirty_keys: Vec::new(),
        }
    }

    /// `~/.prism/credentials.json`, when a home directory exists.
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".prism").join("credentials.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn api_keys(&mut self) -> Vec<String> {
        self.ensure_loaded()
            .get("api_keys")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.as_str().map(str::trim).map(str::to_string))
                    .filter(|row| !row.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_api_keys(&mut self, keys: Vec<String>) -> anyhow::Result<()> {
        let value = Value::Array(keys.into_iter().map(Value::String).collect());
        self.set("api_keys", value)
    }

    pub fn balance(&mut self) -> Option<f64> {
        self.ensure_loaded().get("balance").and_then(Value::as_f64)
    }

    pub fn set_balance(&mut self, balance: f64) -> anyhow::Result<()> {
        let number = serde_json::Number::from_f64(balance)
            .ok_or_else(|| anyhow::anyhow!("balance is not a finite number"))?;
        self.set("balance", Value::Number(number))
    }

    pub fn jwt(&mut self) -> Option<String> {
        self.ensure_loaded()
            .get("jwt")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|row| !row.is_empty())
            .map(str::to_string)
    }

    pub fn set_jwt(&mut self, jwt: &str) -> anyhow::Result<()> {
        self.set("jwt", Value::String(jwt.to_string()))
    }

    fn set(&mut self, key: &str, value: Value) -> anyhow::Result<()> {
        let payload = self.ensure_loaded();
        if payload.get(key) == Some(&value) {
            return Ok(());
        }
        payload.insert(key.to_string(), value);
        if !self.dirty_keys.iter().any(|row| row == key) {
            self.dirty_keys.push(key.to_string());
        }
        self.flush()
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        if self.payload.is_none() || self.dirty_keys.is_empty() {
            return Ok(());
        }

        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        if let Some(payload) = &self.payload {
            for key in &self.dirty_keys {
                if let Some(value) = payload.get(key) {
                    on_disk.insert(key.clone(), value.clone());
                }
            }
        }
        write_json_object(&self.path, &on_disk)?;
        self.payload = Some(on_disk);
        self.dirty_keys.clear();
        Ok(())
    }

    fn ensure_loaded(&mut self) -> &mut Map<String, Value> {
        self.payload = Some(read_json_object(&self.path).unwrap_or_default());
        self.payload.as_mut().expect("key store payload initialized")
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}
