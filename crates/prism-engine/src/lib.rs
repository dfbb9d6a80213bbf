use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use prism_contracts::events::{EventPayload, EventWriter};
use prism_contracts::keys::KeyStore;
use prism_contracts::models::{Modality, ModelSelector, ModelSpec};
use prism_contracts::requests::{Attachment, GenerationRequest};
use prism_contracts::session::SessionTotals;
use prism_contracts::transcript::Transcript;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

const DEFAULT_PRICING_TABLES_JSON: &str = include_str!("../resources/default_pricing.json");
const DEFAULT_API_BASE: &str = "https://api.prism.run/v1";

/// Charged when a response carries no `_cost_info.cost_usd` figure.
pub const DEFAULT_GENERATION_COST_USD: f64 = 0.20;

/// Fixed delay between task status checks.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Shared cancellation flag checked on every poll tick.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Remote task state as reported by the gateway. Unknown strings read as
/// `Pending` so an odd status only costs another tick, never a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn parse(raw: &str) -> TaskStatus {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "completed" | "succeeded" | "success" => TaskStatus::Completed,
            "failed" | "error" | "canceled" | "cancelled" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }
}

/// Identifier for an async generation; exists only between submit and the
/// result fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub task_id: String,
    pub submitted_at: String,
}

/// What a submit response turned out to be.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// The response already carried the artifact; no polling needed.
    Completed(Value),
    /// The gateway queued a task to poll.
    Queued(TaskHandle),
}

/// Terminal state of a poll loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed,
    Failed(String),
    TimedOut,
    Cancelled,
}

/// The one artifact a generation resolves to, decoded once at the gateway
/// boundary so downstream code matches on a closed set of variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactPayload {
    Text(String),
    ImageUrl(String),
    VideoUrl(String),
    AudioUrl(String),
    ModelUrl(String),
}

impl ArtifactPayload {
    pub fn url(&self) -> Option<&str> {
        match self {
            ArtifactPayload::Text(_) => None,
            ArtifactPayload::ImageUrl(url)
            | ArtifactPayload::VideoUrl(url)
            | ArtifactPayload::AudioUrl(url)
            | ArtifactPayload::ModelUrl(url) => Some(url),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub api_key: Option<String>,
    pub user_id: Option<String>,
    pub limit: Option<u64>,
}

impl LogQuery {
    fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(api_key) = self.api_key.as_deref() {
            pairs.push(("api_key".to_string(), api_key.to_string()));
        }
        if let Some(user_id) = self.user_id.as_deref() {
            pairs.push(("user_id".to_string(), user_id.to_string()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs
    }
}

/// One row of the usage table. Decoded leniently: unknown fields are
/// ignored, missing ones default.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub id: String,
    pub model: String,
    pub modality: String,
    pub status: String,
    pub cost_usd: Option<f64>,
    pub latency_s: Option<f64>,
    pub created_at: Option<String>,
}

pub fn parse_usage_records(payload: &Value) -> Vec<UsageRecord> {
    let rows = payload
        .get("logs")
        .and_then(Value::as_array)
        .cloned()
        .or_else(|| payload.as_array().cloned())
        .unwrap_or_default();

    let mut out = Vec::new();
    for row in rows {
        let Some(obj) = row.as_object() else {
            continue;
        };
        let id = obj
            .get("id")
            .map(|value| match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        let field = |name: &str| {
            obj.get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        out.push(UsageRecord {
            id,
            model: field("model"),
            modality: field("modality"),
            status: field("status"),
            cost_usd: obj.get("cost_usd").and_then(parse_value_to_f64),
            latency_s: obj.get("latency_s").and_then(parse_value_to_f64),
            created_at: obj
                .get("created_at")
                .and_then(Value::as_str)
                .map(str::to_string),
        });
    }
    out
}

/// The REST gateway the playground talks to. Generation calls carry the
/// bearer API key; key-management calls carry the account JWT.
pub trait Gateway: Send + Sync {
    fn name(&self) -> &str;
    fn submit(&self, payload: &Map<String, Value>, modality: Modality, api_key: &str)
        -> Result<Value>;
    fn task_status(&self, task_id: &str, api_key: &str) -> Result<Value>;
    fn task_result(&self, task_id: &str, api_key: &str) -> Result<Value>;
    fn usage_logs(&self, query: &LogQuery, api_key: &str) -> Result<Value>;
    fn list_api_keys(&self, jwt: &str) -> Result<Value>;
    fn create_api_key(&self, name: &str, jwt: &str) -> Result<Value>;
}

pub struct HttpGateway {
    api_base: String,
    http: HttpClient,
}

impl HttpGateway {
    pub fn new() -> Self {
        Self {
            api_base: env::var("PRISM_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            http: HttpClient::new(),
        }
    }

    fn submit_endpoint(&self, modality: Modality) -> String {
        match modality {
            Modality::Text => format!("{}/chat/completions", self.api_base),
            _ => format!("{}/completions", self.api_base),
        }
    }
}

impl Default for HttpGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway for HttpGateway {
    fn name(&self) -> &str {
        "http"
    }

    fn submit(
        &self,
        payload: &Map<String, Value>,
        modality: Modality,
        api_key: &str,
    ) -> Result<Value> {
        let endpoint = self.submit_endpoint(modality);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&Value::Object(payload.clone()))
            .send()
            .with_context(|| format!("submit request failed ({endpoint})"))?;
        response_json_or_error("submit", response)
    }

    fn task_status(&self, task_id: &str, api_key: &str) -> Result<Value> {
        let endpoint = format!("{}/completions/status/{task_id}", self.api_base);
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(api_key)
            .send()
            .with_context(|| format!("status request failed ({endpoint})"))?;
        response_json_or_error("status", response)
    }

    fn task_result(&self, task_id: &str, api_key: &str) -> Result<Value> {
        let endpoint = format!("{}/completions/result/{task_id}", self.api_base);
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(api_key)
            .send()
            .with_context(|| format!("result request failed ({endpoint})"))?;
        response_json_or_error("result", response)
    }

    fn usage_logs(&self, query: &LogQuery, api_key: &str) -> Result<Value> {
        let endpoint = format!("{}/logs", self.api_base);
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(api_key)
            .query(&query.query_pairs())
            .send()
            .with_context(|| format!("logs request failed ({endpoint})"))?;
        response_json_or_error("logs", response)
    }

    fn list_api_keys(&self, jwt: &str) -> Result<Value> {
        if jwt.trim().is_empty() {
            bail!("PRISM_JWT not set; cannot fetch API keys");
        }
        let endpoint = format!("{}/api-keys", self.api_base);
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(jwt)
            .send()
            .with_context(|| format!("api-keys request failed ({endpoint})"))?;
        response_json_or_error("api-keys", response)
    }

    fn create_api_key(&self, name: &str, jwt: &str) -> Result<Value> {
        if jwt.trim().is_empty() {
            bail!("PRISM_JWT not set; cannot create an API key");
        }
        let endpoint = format!("{}/api-keys", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(jwt)
            .json(&json!({ "name": name }))
            .send()
            .with_context(|| format!("api-keys request failed ({endpoint})"))?;
        response_json_or_error("api-keys", response)
    }
}

/// Offline gateway with a scripted task lifecycle: text and image submit
/// synchronously, the other modalities queue a task that reports PENDING for
/// a couple of ticks before completing. Request options steer it:
/// `dryrun_fail` makes the task FAIL, `dryrun_stall` keeps it PENDING
/// forever, `dryrun_cost` overrides the reported cost, and
/// `dryrun_pending_ticks` sets how many PENDING polls precede completion.
#[derive(Clone, Default)]
pub struct DryrunGateway {
    state: Arc<Mutex<DryrunState>>,
}

#[derive(Default)]
struct DryrunState {
    tasks: BTreeMap<String, DryrunTask>,
    submits: u64,
    status_calls: u64,
}

struct DryrunTask {
    modality: Modality,
    remaining_ticks: u32,
    fail: bool,
    stall: bool,
    cost_usd: Option<f64>,
}

impl DryrunGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit_calls(&self) -> u64 {
        self.state.lock().map(|state| state.submits).unwrap_or(0)
    }

    pub fn status_calls(&self) -> u64 {
        self.state
            .lock()
            .map(|state| state.status_calls)
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, DryrunState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("dryrun gateway state poisoned"))
    }
}

impl Gateway for DryrunGateway {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn submit(
        &self,
        payload: &Map<String, Value>,
        modality: Modality,
        _api_key: &str,
    ) -> Result<Value> {
        let mut state = self.lock()?;
        state.submits += 1;
        let serial = state.submits;
        let cost_usd = payload.get("dryrun_cost").and_then(parse_value_to_f64);

        match modality {
            Modality::Text => {
                let prompt = payload
                    .get("prompt")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok(json!({
                    "choices": [{
                        "message": {
                            "role": "assistant",
                            "content": format!("dryrun response for '{}'", truncate_text(prompt, 80)),
                        }
                    }],
                    "usage": { "total_tokens": 48 },
                    "_cost_info": { "cost_usd": cost_usd.unwrap_or(0.001) },
                }))
            }
            Modality::Image => Ok(json!({
                "images": [format!("https://dryrun.invalid/artifact-{serial}.png")],
                "_cost_info": { "cost_usd": cost_usd.unwrap_or(0.02) },
            })),
            _ => {
                let task_id = format!("dryrun-task-{serial}");
                let remaining_ticks = payload
                    .get("dryrun_pending_ticks")
                    .and_then(Value::as_u64)
                    .unwrap_or(2) as u32;
                state.tasks.insert(
                    task_id.clone(),
                    DryrunTask {
                        modality,
                        remaining_ticks,
                        fail: payload.get("dryrun_fail").and_then(Value::as_bool) == Some(true),
                        stall: payload.get("dryrun_stall").and_then(Value::as_bool) == Some(true),
                        cost_usd,
                    },
                );
                Ok(json!({ "task_id": task_id }))
            }
        }
    }

    fn task_status(&self, task_id: &str, _api_key: &str) -> Result<Value> {
        let mut state = self.lock()?;
        state.status_calls += 1;
        let Some(task) = state.tasks.get_mut(task_id) else {
            bail!("dryrun task '{task_id}' not found");
        };
        if task.fail {
            return Ok(json!({
                "status": "FAILED",
                "error": "dryrun scripted failure",
            }));
        }
        if task.stall {
            return Ok(json!({ "status": "PENDING" }));
        }
        if task.remaining_ticks > 0 {
            task.remaining_ticks -= 1;
            return Ok(json!({ "status": "PENDING" }));
        }
        Ok(json!({ "status": "COMPLETED" }))
    }

    fn task_result(&self, task_id: &str, _api_key: &str) -> Result<Value> {
        let state = self.lock()?;
        let Some(task) = state.tasks.get(task_id) else {
            bail!("dryrun task '{task_id}' not found");
        };
        let cost = task.cost_usd;
        Ok(match task.modality {
            Modality::Video => json!({
                "video": { "url": format!("https://dryrun.invalid/{task_id}.mp4") },
                "_cost_info": { "cost_usd": cost.unwrap_or(0.2) },
            }),
            Modality::Audio => json!({
                "audios": [format!("https://dryrun.invalid/{task_id}.mp3")],
                "_cost_info": { "cost_usd": cost.unwrap_or(0.017) },
            }),
            Modality::ThreeD => json!({
                "model_url": format!("https://dryrun.invalid/{task_id}.glb"),
                "_cost_info": { "cost_usd": cost.unwrap_or(0.15) },
            }),
            _ => json!({
                "images": [format!("https://dryrun.invalid/{task_id}.png")],
                "_cost_info": { "cost_usd": cost.unwrap_or(0.02) },
            }),
        })
    }

    fn usage_logs(&self, query: &LogQuery, _api_key: &str) -> Result<Value> {
        let limit = query.limit.unwrap_or(20).min(3);
        let rows: Vec<Value> = (0..limit)
            .map(|idx| {
                json!({
                    "id": format!("log-{idx}"),
                    "model": "flux-schnell",
                    "modality": "image",
                    "status": "COMPLETED",
                    "cost_usd": 0.003,
                    "latency_s": 1.8,
                    "created_at": "2026-08-06T00:00:00+00:00",
                })
            })
            .collect();
        Ok(json!({ "logs": rows }))
    }

    fn list_api_keys(&self, _jwt: &str) -> Result<Value> {
        Ok(json!({
            "api_keys": ["pk-dryrun-local"],
            "balance": 42.0,
        }))
    }

    fn create_api_key(&self, name: &str, _jwt: &str) -> Result<Value> {
        Ok(json!({ "api_key": format!("pk-dryrun-{name}") }))
    }
}

/// Branch policy for a submit response: a payload already carrying media (or
/// chat choices) short-circuits polling; otherwise a `task_id` is required;
/// neither is a hard error.
pub fn inspect_submit_response(payload: &Value, modality: Modality) -> Result<SubmitOutcome> {
    if decode_artifact(payload, modality).is_some() {
        return Ok(SubmitOutcome::Completed(payload.clone()));
    }

    let task_id = payload
        .get("task_id")
        .or_else(|| payload.get("data").and_then(|data| data.get("task_id")))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(task_id) = task_id {
        return Ok(SubmitOutcome::Queued(TaskHandle {
            task_id: task_id.to_string(),
            submitted_at: now_utc_iso(),
        }));
    }

    bail!("gateway response carried neither a result nor a task_id");
}

/// Decodes the gateway's per-adapter response shapes into one tagged
/// artifact. Backends disagree on field names (`video.url`,
/// `output.videos[0]`, `videos[0]`, ...), so each modality probes its union
/// of known spellings here, once, and nowhere else.
pub fn decode_artifact(payload: &Value, modality: Modality) -> Option<ArtifactPayload> {
    match modality {
        Modality::Text => {
            let text = payload
                .get("choices")
                .and_then(Value::as_array)
                .and_then(|rows| rows.first())
                .and_then(|row| row.get("message"))
                .and_then(|message| message.get("content"))
                .and_then(Value::as_str)
                .or_else(|| {
                    payload
                        .get("output")
                        .and_then(|output| output.get("text"))
                        .and_then(Value::as_str)
                })
                .or_else(|| payload.get("text").and_then(Value::as_str))
                .map(str::trim)
                .filter(|value| !value.is_empty())?;
            Some(ArtifactPayload::Text(text.to_string()))
        }
        Modality::Image => {
            let url = payload
                .get("images")
                .and_then(first_url_in_list)
                .or_else(|| {
                    payload
                        .get("output")
                        .and_then(|output| output.get("images"))
                        .and_then(first_url_in_list)
                })
                .or_else(|| payload.get("image").and_then(url_from))
                .or_else(|| payload.get("data").and_then(first_url_in_list))?;
            Some(ArtifactPayload::ImageUrl(url))
        }
        Modality::Video => {
            let url = payload
                .get("video")
                .and_then(url_from)
                .or_else(|| {
                    payload
                        .get("output")
                        .and_then(|output| output.get("videos"))
                        .and_then(first_url_in_list)
                })
                .or_else(|| payload.get("videos").and_then(first_url_in_list))?;
            Some(ArtifactPayload::VideoUrl(url))
        }
        Modality::Audio => {
            let url = payload
                .get("audio")
                .and_then(url_from)
                .or_else(|| {
                    payload
                        .get("output")
                        .and_then(|output| output.get("audios"))
                        .and_then(first_url_in_list)
                })
                .or_else(|| {
                    payload
                        .get("output")
                        .and_then(|output| output.get("audio"))
                        .and_then(url_from)
                })
                .or_else(|| payload.get("audios").and_then(first_url_in_list))?;
            Some(ArtifactPayload::AudioUrl(url))
        }
        Modality::ThreeD => {
            let url = payload
                .get("model_url")
                .and_then(url_from)
                .or_else(|| {
                    payload
                        .get("output")
                        .and_then(|output| output.get("model"))
                        .and_then(url_from)
                })
                .or_else(|| payload.get("model").and_then(url_from))?;
            Some(ArtifactPayload::ModelUrl(url))
        }
    }
}

fn url_from(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return None;
            }
            Some(trimmed.to_string())
        }
        Value::Object(obj) => obj.get("url").and_then(url_from),
        _ => None,
    }
}

fn first_url_in_list(value: &Value) -> Option<String> {
    value.as_array()?.first().and_then(url_from)
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollConfig {
    pub fn for_modality(modality: Modality) -> Self {
        Self {
            interval: POLL_INTERVAL,
            max_attempts: modality.poll_attempt_budget(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Fixed-interval poll loop. COMPLETED and FAILED break immediately;
/// running past the attempt budget is an explicit `TimedOut`, not a generic
/// failure. Transport errors propagate; there are no retries anywhere in
/// this flow.
pub fn poll_task(
    gateway: &dyn Gateway,
    api_key: &str,
    handle: &TaskHandle,
    config: &PollConfig,
    cancel: &CancelToken,
) -> Result<PollOutcome> {
    for attempt in 0..config.max_attempts {
        if cancel.is_cancelled() {
            return Ok(PollOutcome::Cancelled);
        }
        let payload = gateway.task_status(&handle.task_id, api_key)?;
        let status_text = payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match TaskStatus::parse(status_text) {
            TaskStatus::Completed => return Ok(PollOutcome::Completed),
            TaskStatus::Failed => {
                let reason = payload
                    .get("error")
                    .or_else(|| payload.get("failure_reason"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("task reported status '{status_text}'"));
                return Ok(PollOutcome::Failed(reason));
            }
            TaskStatus::Pending => {}
        }
        if attempt + 1 < config.max_attempts {
            thread::sleep(config.interval);
        }
    }
    Ok(PollOutcome::TimedOut)
}

pub fn load_pricing_tables() -> BTreeMap<String, Map<String, Value>> {
    let mut merged = parse_pricing_table_rows(DEFAULT_PRICING_TABLES_JSON);
    if let Some(path) = pricing_override_path() {
        if let Ok(raw) = fs::read_to_string(path) {
            merge_pricing_table_rows(&mut merged, &raw);
        }
    }
    merged
}

fn pricing_override_path() -> Option<PathBuf> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .map(|home| home.join(".prism").join("pricing_overrides.json"))
}

pub fn parse_pricing_table_rows(raw: &str) -> BTreeMap<String, Map<String, Value>> {
    let mut rows = BTreeMap::new();
    merge_pricing_table_rows(&mut rows, raw);
    rows
}

fn merge_pricing_table_rows(rows: &mut BTreeMap<String, Map<String, Value>>, raw: &str) {
    let Ok(payload) = serde_json::from_str::<Value>(raw) else {
        return;
    };
    let Some(table) = payload.as_object() else {
        return;
    };
    for (pricing_key, row_value) in table {
        let Some(row) = row_value.as_object() else {
            continue;
        };
        let entry = rows.entry(pricing_key.to_string()).or_default();
        for (field, field_value) in row {
            entry.insert(field.to_string(), field_value.clone());
        }
    }
}

/// Client-side cost estimate for the plan preview. Text prices by expected
/// tokens, video and audio by duration when the row is per-second, and
/// everything else by a flat per-generation figure. `None` means the model
/// has no pricing row.
pub fn estimate_generation_cost(
    pricing_tables: &BTreeMap<String, Map<String, Value>>,
    model: &ModelSpec,
    options: &Map<String, Value>,
) -> Option<f64> {
    let pricing_key = model
        .pricing_key
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())?;
    let row = pricing_tables.get(pricing_key)?;

    match model.modality {
        Modality::Text => {
            let rate = row.get("cost_per_1m_tokens_usd").and_then(parse_value_to_f64)?;
            let tokens = options
                .get("max_tokens")
                .and_then(parse_value_to_f64)
                .or_else(|| row.get("assumed_tokens").and_then(parse_value_to_f64))
                .unwrap_or(800.0);
            Some(rate * tokens / 1_000_000.0)
        }
        Modality::Video | Modality::Audio => {
            if let Some(per_second) = row.get("cost_per_second_usd").and_then(parse_value_to_f64) {
                let duration = options
                    .get("duration_s")
                    .and_then(parse_value_to_f64)
                    .or_else(|| row.get("default_duration_s").and_then(parse_value_to_f64))
                    .unwrap_or(5.0);
                return Some(per_second * duration);
            }
            row.get("cost_per_generation_usd").and_then(parse_value_to_f64)
        }
        _ => row.get("cost_per_generation_usd").and_then(parse_value_to_f64),
    }
}

/// Reads `_cost_info.cost_usd` from whichever response carried it. Tolerant
/// of string-encoded numbers.
pub fn extract_cost_usd(payload: &Value) -> Option<f64> {
    payload
        .get("_cost_info")
        .and_then(|info| info.get("cost_usd"))
        .and_then(parse_value_to_f64)
        .filter(|value| value.is_finite())
}

/// Maps a decoded artifact to its displayable fragment: inline HTML for
/// media URLs, escaped text for chat, and a JSON descriptor for 3D assets
/// consumed by a model-viewer element.
pub fn render_artifact(artifact: &ArtifactPayload) -> String {
    match artifact {
        ArtifactPayload::Text(text) => escape_html(text),
        ArtifactPayload::ImageUrl(url) => format!("<img src=\"{}\" />", escape_attr(url)),
        ArtifactPayload::VideoUrl(url) => {
            format!("<video src=\"{}\" controls></video>", escape_attr(url))
        }
        ArtifactPayload::AudioUrl(url) => {
            format!("<audio src=\"{}\" controls></audio>", escape_attr(url))
        }
        ArtifactPayload::ModelUrl(url) => json!({
            "kind": "model-viewer",
            "src": url,
        })
        .to_string(),
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(raw: &str) -> String {
    escape_html(raw).replace('"', "&quot;")
}

#[derive(Debug, Clone)]
pub struct PlanPreview {
    pub model: String,
    pub modality: Modality,
    pub estimated_cost_usd: f64,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenerationReport {
    pub rendered: String,
    pub artifact: ArtifactPayload,
    pub model: String,
    pub modality: Modality,
    pub cost_usd: f64,
    pub task_id: Option<String>,
    pub latency_s: f64,
    pub fallback_reason: Option<String>,
}

/// Orchestrates one playground session: request building, submit, poll,
/// result fetch, cost recording, rendering, and the transcript/event trail.
/// One generation at a time; the busy flag is advisory, matching the UI it
/// replaces, and the cancel token stops an in-flight poll loop.
pub struct PlaygroundEngine {
    session_dir: PathBuf,
    events: EventWriter,
    transcript: Transcript,
    keys: KeyStore,
    totals: SessionTotals,
    model_selector: ModelSelector,
    modality: Modality,
    model: Option<String>,
    gateway: Box<dyn Gateway>,
    pricing_tables: BTreeMap<String, Map<String, Value>>,
    poll_interval: Duration,
    cancel: CancelToken,
    busy: bool,
}

impl PlaygroundEngine {
    pub fn new(
        session_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        gateway: Box<dyn Gateway>,
        model: Option<String>,
        modality: Modality,
    ) -> Result<Self> {
        let session_dir = session_dir.into();
        fs::create_dir_all(&session_dir)?;
        let session_id = session_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("session")
            .to_string();
        let events = EventWriter::new(events_path.into(), session_id);
        let transcript_path = session_dir.join("transcript.json");
        let transcript = if transcript_path.exists() {
            Transcript::load(&transcript_path)
        } else {
            Transcript::new(&transcript_path)
        };
        let keys = KeyStore::new(
            KeyStore::default_path().unwrap_or_else(|| session_dir.join("credentials.json")),
        );

        events.emit(
            "session_started",
            map_object(json!({
                "session_dir": session_dir.to_string_lossy().to_string(),
                "gateway": gateway.name(),
            })),
        )?;

        Ok(Self {
            session_dir,
            events,
            transcript,
            keys,
            totals: SessionTotals::new(),
            model_selector: ModelSelector::new(None),
            modality,
            model,
            gateway,
            pricing_tables: load_pricing_tables(),
            poll_interval: POLL_INTERVAL,
            cancel: CancelToken::new(),
            busy: false,
        })
    }

    pub fn with_key_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.keys = KeyStore::new(path.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn set_model(&mut self, model: Option<String>) {
        self.model = model;
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn set_modality(&mut self, modality: Modality) {
        self.modality = modality;
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn totals(&self) -> &SessionTotals {
        &self.totals
    }

    pub fn registry(&self) -> &prism_contracts::models::ModelRegistry {
        &self.model_selector.registry
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    pub fn emit_event(&self, event_type: &str, payload: EventPayload) -> Result<Value> {
        self.events.emit(event_type, payload)
    }

    pub fn preview(&self, options: &Map<String, Value>) -> Result<PlanPreview> {
        let selection = self
            .model_selector
            .select(self.model.as_deref(), self.modality)
            .map_err(anyhow::Error::msg)?;
        let estimated_cost_usd =
            estimate_generation_cost(&self.pricing_tables, &selection.model, options)
                .unwrap_or(DEFAULT_GENERATION_COST_USD);
        Ok(PlanPreview {
            model: selection.model.name,
            modality: self.modality,
            estimated_cost_usd,
            fallback_reason: selection.fallback_reason,
        })
    }

    pub fn generate(
        &mut self,
        prompt: &str,
        attachments: &[Attachment],
        options: Map<String, Value>,
    ) -> Result<GenerationReport> {
        if self.busy {
            bail!("a generation is already in flight for this session");
        }
        self.busy = true;
        let result = self.generate_inner(prompt, attachments, options);
        self.busy = false;
        result
    }

    fn generate_inner(
        &mut self,
        prompt: &str,
        attachments: &[Attachment],
        options: Map<String, Value>,
    ) -> Result<GenerationReport> {
        let selection = self
            .model_selector
            .select(self.model.as_deref(), self.modality)
            .map_err(anyhow::Error::msg)?;
        let model_spec = selection.model;
        let fallback_reason = selection.fallback_reason;
        let modality = model_spec.modality;
        let noun = modality.artifact_noun();

        let request = match GenerationRequest::build(&model_spec, prompt, attachments, options) {
            Ok(request) => request,
            Err(message) => {
                self.events.emit(
                    "validation_failed",
                    map_object(json!({
                        "model": model_spec.name,
                        "error": message,
                    })),
                )?;
                bail!("{message}");
            }
        };

        let estimated_cost_usd =
            estimate_generation_cost(&self.pricing_tables, &model_spec, &request.options)
                .unwrap_or(DEFAULT_GENERATION_COST_USD);
        self.events.emit(
            "plan_preview",
            map_object(json!({
                "model": model_spec.name,
                "modality": modality.as_str(),
                "estimated_cost_usd": estimated_cost_usd,
                "fallback_reason": fallback_reason,
            })),
        )?;

        let api_key = self.ensure_api_key()?;

        self.transcript
            .add_message("user", modality.as_str(), prompt.to_string(), None, None, None);
        self.transcript.save()?;
        self.events.emit(
            "request_submitted",
            map_object(json!({
                "model": model_spec.name,
                "modality": modality.as_str(),
            })),
        )?;

        let started = Instant::now();
        let submit_payload =
            match self
                .gateway
                .submit(&request.payload(), request.modality, &api_key)
            {
                Ok(payload) => payload,
                Err(err) => {
                    return Err(self.fail(
                        "submit",
                        None,
                        &error_chain_text(&err, 2048),
                        err.context(format!("failed to generate {noun}")),
                    ));
                }
            };

        let outcome = match inspect_submit_response(&submit_payload, modality) {
            Ok(outcome) => outcome,
            Err(err) => {
                return Err(self.fail(
                    "submit",
                    None,
                    &error_chain_text(&err, 2048),
                    err.context(format!("failed to generate {noun}")),
                ));
            }
        };

        let (result_payload, task_id) = match outcome {
            SubmitOutcome::Completed(payload) => (payload, None),
            SubmitOutcome::Queued(handle) => {
                self.events.emit(
                    "task_queued",
                    map_object(json!({ "task_id": handle.task_id })),
                )?;
                let config =
                    PollConfig::for_modality(modality).with_interval(self.poll_interval);
                let outcome = match poll_task(
                    self.gateway.as_ref(),
                    &api_key,
                    &handle,
                    &config,
                    &self.cancel,
                ) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        return Err(self.fail(
                            "poll",
                            Some(&handle.task_id),
                            &error_chain_text(&err, 2048),
                            err.context(format!("failed to generate {noun}")),
                        ));
                    }
                };
                match outcome {
                    PollOutcome::Completed => {
                        self.events.emit(
                            "task_status",
                            map_object(json!({
                                "task_id": handle.task_id,
                                "status": "COMPLETED",
                            })),
                        )?;
                        let payload = match self.gateway.task_result(&handle.task_id, &api_key) {
                            Ok(payload) => payload,
                            Err(err) => {
                                return Err(self.fail(
                                    "result",
                                    Some(&handle.task_id),
                                    &error_chain_text(&err, 2048),
                                    err.context(format!("failed to generate {noun}")),
                                ));
                            }
                        };
                        (payload, Some(handle.task_id.clone()))
                    }
                    PollOutcome::Failed(reason) => {
                        return Err(self.fail(
                            "task",
                            Some(&handle.task_id),
                            &reason,
                            anyhow::anyhow!("failed to generate {noun}: {reason}"),
                        ));
                    }
                    PollOutcome::TimedOut => {
                        self.events.emit(
                            "generation_timed_out",
                            map_object(json!({
                                "task_id": handle.task_id,
                                "attempts": config.max_attempts,
                            })),
                        )?;
                        self.totals.record_failed();
                        bail!(
                            "timed out waiting for the {noun} after {} status checks",
                            config.max_attempts
                        );
                    }
                    PollOutcome::Cancelled => {
                        self.events.emit(
                            "generation_cancelled",
                            map_object(json!({ "task_id": handle.task_id })),
                        )?;
                        bail!("generation cancelled");
                    }
                }
            }
        };

        let Some(artifact) = decode_artifact(&result_payload, modality) else {
            let message =
                format!("the gateway response had no recognizable {noun} field");
            return Err(self.fail(
                "decode",
                task_id.as_deref(),
                &message,
                anyhow::anyhow!("failed to generate {noun}: {message}"),
            ));
        };

        let cost_usd = extract_cost_usd(&result_payload).unwrap_or(DEFAULT_GENERATION_COST_USD);
        let latency_s = started.elapsed().as_secs_f64();
        self.totals.record_cost(cost_usd);
        self.totals.record_completed();
        if modality == Modality::Text {
            let tokens = result_payload
                .get("usage")
                .and_then(|usage| usage.get("total_tokens"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            if tokens > 0 {
                self.totals.record_tokens(tokens);
                let tps = if latency_s > 0.0 {
                    tokens as f64 / latency_s
                } else {
                    0.0
                };
                self.totals.record_text_timing(latency_s, tps);
            }
        }
        self.events.emit(
            "cost_update",
            map_object(json!({
                "cost_usd": cost_usd,
                "total_cost_usd": self.totals.total_cost_usd,
            })),
        )?;

        let rendered = render_artifact(&artifact);
        self.transcript.add_message(
            "assistant",
            modality.as_str(),
            rendered.clone(),
            artifact.url().map(str::to_string),
            Some(cost_usd),
            task_id.clone(),
        );
        self.transcript.save()?;
        self.events.emit(
            "generation_completed",
            map_object(json!({
                "model": model_spec.name,
                "modality": modality.as_str(),
                "task_id": task_id,
                "cost_usd": cost_usd,
                "latency_s": latency_s,
            })),
        )?;

        Ok(GenerationReport {
            rendered,
            artifact,
            model: model_spec.name,
            modality,
            cost_usd,
            task_id,
            latency_s,
            fallback_reason,
        })
    }

    fn fail(
        &mut self,
        stage: &str,
        task_id: Option<&str>,
        detail: &str,
        err: anyhow::Error,
    ) -> anyhow::Error {
        let _ = self.events.emit(
            "generation_failed",
            map_object(json!({
                "stage": stage,
                "task_id": task_id,
                "error": detail,
            })),
        );
        self.totals.record_failed();
        err
    }

    /// Bearer key resolution: environment override first, then the local
    /// cache, then a fresh fetch from the gateway (cached on success).
    pub fn ensure_api_key(&mut self) -> Result<String> {
        resolve_api_key(self.gateway.as_ref(), &mut self.keys)
    }

    pub fn create_api_key(&mut self, name: &str) -> Result<String> {
        let key = create_and_cache_api_key(self.gateway.as_ref(), &mut self.keys, name)?;
        self.events
            .emit("api_key_created", map_object(json!({ "name": name })))?;
        Ok(key)
    }

    pub fn api_keys(&mut self) -> Result<Vec<String>> {
        let cached = self.keys.api_keys();
        if !cached.is_empty() {
            return Ok(cached);
        }
        refresh_api_keys(self.gateway.as_ref(), &mut self.keys)
    }

    pub fn balance(&mut self) -> Result<Option<f64>> {
        if let Some(balance) = self.keys.balance() {
            return Ok(Some(balance));
        }
        refresh_api_keys(self.gateway.as_ref(), &mut self.keys)?;
        Ok(self.keys.balance())
    }

    pub fn usage_logs(&mut self, limit: u64) -> Result<Vec<UsageRecord>> {
        let api_key = self.ensure_api_key()?;
        let payload = self.gateway.usage_logs(
            &LogQuery {
                api_key: Some(api_key.clone()),
                user_id: None,
                limit: Some(limit),
            },
            &api_key,
        )?;
        Ok(parse_usage_records(&payload))
    }

    pub fn reset_totals(&mut self) -> Result<()> {
        self.totals.reset();
        self.events.emit("totals_reset", EventPayload::new())?;
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        let summary_path = self.session_dir.join("summary.json");
        let payload = json!({
            "session_id": self.transcript.session_id,
            "started_at": self.transcript.created_at,
            "finished_at": now_utc_iso(),
            "messages": self.transcript.messages.len() as u64,
            "total_cost_usd": self.totals.total_cost_usd,
            "total_tokens": self.totals.total_tokens,
            "completed": self.totals.completed,
            "failed": self.totals.failed,
        });
        fs::write(&summary_path, serde_json::to_string_pretty(&payload)?)?;
        self.events.emit(
            "session_finished",
            map_object(json!({
                "summary_path": summary_path.to_string_lossy().to_string(),
            })),
        )?;
        Ok(())
    }
}

/// Standalone key resolution used by the engine and the CLI's key/log
/// commands: environment override, then the local cache, then a gateway
/// fetch cached on success.
pub fn resolve_api_key(gateway: &dyn Gateway, keys: &mut KeyStore) -> Result<String> {
    if let Some(key) = non_empty_env("PRISM_API_KEY") {
        return Ok(key);
    }
    if let Some(key) = keys.api_keys().first() {
        return Ok(key.clone());
    }
    refresh_api_keys(gateway, keys)?
        .first()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("the gateway returned no API keys for this account"))
}

/// Fetches the account's keys, caching them plus any reported balance.
pub fn refresh_api_keys(gateway: &dyn Gateway, keys: &mut KeyStore) -> Result<Vec<String>> {
    let jwt = keys
        .jwt()
        .or_else(|| non_empty_env("PRISM_JWT"))
        .unwrap_or_default();
    let payload = gateway.list_api_keys(&jwt)?;
    let fetched = api_keys_from_payload(&payload);
    if let Some(balance) = payload.get("balance").and_then(parse_value_to_f64) {
        keys.set_balance(balance)?;
    }
    keys.set_api_keys(fetched.clone())?;
    Ok(fetched)
}

pub fn create_and_cache_api_key(
    gateway: &dyn Gateway,
    keys: &mut KeyStore,
    name: &str,
) -> Result<String> {
    let jwt = keys
        .jwt()
        .or_else(|| non_empty_env("PRISM_JWT"))
        .unwrap_or_default();
    let payload = gateway.create_api_key(name, &jwt)?;
    let key = payload
        .get("api_key")
        .or_else(|| payload.get("key"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow::anyhow!("gateway response carried no api_key"))?
        .to_string();
    let mut cached = keys.api_keys();
    if !cached.contains(&key) {
        cached.push(key.clone());
        keys.set_api_keys(cached)?;
    }
    Ok(key)
}

fn api_keys_from_payload(payload: &Value) -> Vec<String> {
    let rows = payload
        .get("api_keys")
        .or_else(|| payload.get("keys"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut out = Vec::new();
    for row in rows {
        let key = match &row {
            Value::String(text) => Some(text.clone()),
            Value::Object(obj) => obj
                .get("api_key")
                .or_else(|| obj.get("key"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };
        if let Some(key) = key.map(|value| value.trim().to_string()) {
            if !key.is_empty() && !out.contains(&key) {
                out.push(key);
            }
        }
    }
    out
}

fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        let code = status.as_u16();
        let body = response.text().unwrap_or_default();
        bail!(
            "{label} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    response
        .json()
        .with_context(|| format!("failed parsing {label} JSON response"))
}

fn parse_value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        if !text.trim().is_empty() {
            parts.push(text);
        }
    }
    truncate_text(&parts.join(": "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect()
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use prism_contracts::models::{InputRule, Modality, ModelSpec};
    use prism_contracts::requests::Attachment;
    use serde_json::{json, Map, Value};
    use tempfile::TempDir;

    use super::{
        decode_artifact, estimate_generation_cost, extract_cost_usd, inspect_submit_response,
        parse_pricing_table_rows, parse_usage_records, poll_task, render_artifact,
        ArtifactPayload, CancelToken, DryrunGateway, Gateway, PlaygroundEngine, PollConfig,
        PollOutcome, SubmitOutcome, TaskHandle, TaskStatus, DEFAULT_GENERATION_COST_USD,
    };

    fn test_engine(
        temp: &TempDir,
        gateway: DryrunGateway,
        model: Option<&str>,
        modality: Modality,
    ) -> anyhow::Result<PlaygroundEngine> {
        let session_dir = temp.path().join("session");
        let events_path = session_dir.join("events.jsonl");
        let engine = PlaygroundEngine::new(
            &session_dir,
            &events_path,
            Box::new(gateway),
            model.map(str::to_string),
            modality,
        )?
        .with_key_store(temp.path().join("credentials.json"))
        .with_poll_interval(Duration::from_millis(1));
        Ok(engine)
    }

    fn event_types(temp: &TempDir) -> Vec<String> {
        let raw = fs::read_to_string(temp.path().join("session").join("events.jsonl"))
            .unwrap_or_default();
        raw.lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    fn png_attachment() -> Attachment {
        Attachment {
            path: "input.png".to_string(),
            mime: "image/png",
            bytes: b"png".to_vec(),
        }
    }

    #[test]
    fn sync_image_response_short_circuits_polling() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let gateway = DryrunGateway::new();
        let mut engine = test_engine(&temp, gateway.clone(), None, Modality::Image)?;

        let report = engine.generate("a red fox", &[], Map::new())?;
        assert!(report.rendered.starts_with("<img src=\"https://dryrun.invalid/"));
        assert!(report.task_id.is_none());
        assert!((report.cost_usd - 0.02).abs() < 1e-12);
        assert_eq!(gateway.status_calls(), 0);

        let types = event_types(&temp);
        assert!(types.contains(&"plan_preview".to_string()));
        assert!(types.contains(&"request_submitted".to_string()));
        assert!(types.contains(&"generation_completed".to_string()));
        assert!(!types.contains(&"task_queued".to_string()));
        Ok(())
    }

    #[test]
    fn async_video_polls_to_completion() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let gateway = DryrunGateway::new();
        let mut engine = test_engine(&temp, gateway.clone(), None, Modality::Video)?;

        let report = engine.generate("a fox leaping over a brook", &[], Map::new())?;
        assert!(report.rendered.starts_with("<video src=\"https://dryrun.invalid/"));
        assert_eq!(report.task_id.as_deref(), Some("dryrun-task-1"));
        assert!((report.cost_usd - 0.2).abs() < 1e-12);
        // 2 PENDING ticks plus the COMPLETED check
        assert_eq!(gateway.status_calls(), 3);

        let types = event_types(&temp);
        assert!(types.contains(&"task_queued".to_string()));
        assert!(types.contains(&"task_status".to_string()));
        assert!(types.contains(&"generation_completed".to_string()));
        Ok(())
    }

    #[test]
    fn validation_error_makes_no_gateway_call() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let gateway = DryrunGateway::new();
        let mut engine = test_engine(
            &temp,
            gateway.clone(),
            Some("kling-1.6-pro-i2v"),
            Modality::Video,
        )?;

        let err = engine
            .generate("make it move", &[], Map::new())
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert_eq!(
            err,
            "Model 'kling-1.6-pro-i2v' requires an input image attachment."
        );
        assert_eq!(gateway.submit_calls(), 0);
        assert_eq!(gateway.status_calls(), 0);

        let types = event_types(&temp);
        assert!(types.contains(&"validation_failed".to_string()));
        assert!(!types.contains(&"request_submitted".to_string()));
        Ok(())
    }

    #[test]
    fn failed_status_stops_polling_immediately() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let gateway = DryrunGateway::new();
        let mut engine = test_engine(&temp, gateway.clone(), None, Modality::Video)?;

        let mut options = Map::new();
        options.insert("dryrun_fail".to_string(), json!(true));
        let err = engine
            .generate("a doomed clip", &[], options)
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("dryrun scripted failure"), "got: {err}");
        assert_eq!(gateway.status_calls(), 1);
        assert_eq!(engine.totals().failed, 1);

        let types = event_types(&temp);
        assert!(types.contains(&"generation_failed".to_string()));
        assert!(!types.contains(&"generation_completed".to_string()));
        Ok(())
    }

    #[test]
    fn stalled_task_times_out_at_the_modality_budget() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let gateway = DryrunGateway::new();
        let mut engine = test_engine(&temp, gateway.clone(), None, Modality::Video)?;

        let mut options = Map::new();
        options.insert("dryrun_stall".to_string(), json!(true));
        let err = engine
            .generate("a clip that never arrives", &[], options)
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert_eq!(err, "timed out waiting for the video after 60 status checks");
        assert_eq!(gateway.status_calls(), 60);

        let types = event_types(&temp);
        assert!(types.contains(&"generation_timed_out".to_string()));
        Ok(())
    }

    #[test]
    fn reported_cost_is_recorded_exactly() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let gateway = DryrunGateway::new();
        let mut engine = test_engine(&temp, gateway, None, Modality::Image)?;

        let mut options = Map::new();
        options.insert("dryrun_cost".to_string(), json!(0.0123));
        engine.generate("a priced fox", &[], options)?;
        assert!((engine.totals().total_cost_usd - 0.0123).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn text_generation_records_tokens_and_timing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let gateway = DryrunGateway::new();
        let mut engine = test_engine(&temp, gateway, None, Modality::Text)?;

        let report = engine.generate("say hello", &[], Map::new())?;
        assert!(report.rendered.contains("dryrun response"));
        assert_eq!(engine.totals().total_tokens, 48);
        assert!(engine.totals().last_tps.is_some());
        Ok(())
    }

    #[test]
    fn image_to_video_accepts_an_attachment() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let gateway = DryrunGateway::new();
        let mut engine = test_engine(
            &temp,
            gateway,
            Some("kling-1.6-pro-i2v"),
            Modality::Video,
        )?;

        let report = engine.generate("make it move", &[png_attachment()], Map::new())?;
        assert_eq!(report.model, "kling-1.6-pro-i2v");
        assert!(report.rendered.starts_with("<video "));
        Ok(())
    }

    #[test]
    fn transcript_records_both_sides_of_a_generation() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let gateway = DryrunGateway::new();
        let mut engine = test_engine(&temp, gateway, None, Modality::Image)?;

        engine.generate("a red fox", &[], Map::new())?;
        let messages = &engine.transcript().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].body, "a red fox");
        assert_eq!(messages[1].role, "assistant");
        assert!(messages[1].artifact_url.is_some());
        Ok(())
    }

    #[test]
    fn finish_writes_a_session_summary() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let gateway = DryrunGateway::new();
        let mut engine = test_engine(&temp, gateway, None, Modality::Image)?;

        engine.generate("a red fox", &[], Map::new())?;
        engine.finish()?;

        let summary_path = temp.path().join("session").join("summary.json");
        let summary: Value = serde_json::from_str(&fs::read_to_string(summary_path)?)?;
        assert_eq!(summary["messages"], json!(2));
        assert_eq!(summary["completed"], json!(1));
        assert!((summary["total_cost_usd"].as_f64().unwrap_or_default() - 0.02).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn api_keys_are_fetched_once_and_cached() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let gateway = DryrunGateway::new();
        let mut engine = test_engine(&temp, gateway, None, Modality::Image)?;

        let key = engine.ensure_api_key()?;
        assert_eq!(key, "pk-dryrun-local");
        assert_eq!(engine.balance()?, Some(42.0));

        let again = engine.ensure_api_key()?;
        assert_eq!(again, "pk-dryrun-local");
        Ok(())
    }

    #[test]
    fn create_api_key_appends_to_the_store() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let gateway = DryrunGateway::new();
        let mut engine = test_engine(&temp, gateway, None, Modality::Image)?;

        let key = engine.create_api_key("ci-runner")?;
        assert_eq!(key, "pk-dryrun-ci-runner");
        assert!(engine.api_keys()?.contains(&key));
        Ok(())
    }

    #[test]
    fn usage_logs_decode_into_records() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let gateway = DryrunGateway::new();
        let mut engine = test_engine(&temp, gateway, None, Modality::Image)?;

        let records = engine.usage_logs(2)?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].model, "flux-schnell");
        assert_eq!(records[0].status, "COMPLETED");
        assert_eq!(records[0].cost_usd, Some(0.003));
        Ok(())
    }

    #[test]
    fn poll_task_respects_a_pre_cancelled_token() -> anyhow::Result<()> {
        let gateway = DryrunGateway::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let handle = TaskHandle {
            task_id: "dryrun-task-1".to_string(),
            submitted_at: "2026-08-06T00:00:00+00:00".to_string(),
        };
        let config =
            PollConfig::for_modality(Modality::Video).with_interval(Duration::from_millis(1));
        let outcome = poll_task(&gateway, "pk", &handle, &config, &cancel)?;
        assert_eq!(outcome, PollOutcome::Cancelled);
        assert_eq!(gateway.status_calls(), 0);
        Ok(())
    }

    #[test]
    fn submit_response_without_result_or_task_id_is_a_hard_error() {
        let payload = json!({ "detail": "accepted" });
        let err = inspect_submit_response(&payload, Modality::Video)
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert_eq!(err, "gateway response carried neither a result nor a task_id");
    }

    #[test]
    fn submit_response_with_nested_task_id_queues() -> anyhow::Result<()> {
        let payload = json!({ "data": { "task_id": "task-9" } });
        match inspect_submit_response(&payload, Modality::Video)? {
            SubmitOutcome::Queued(handle) => assert_eq!(handle.task_id, "task-9"),
            SubmitOutcome::Completed(_) => panic!("expected a queued task"),
        }
        Ok(())
    }

    #[test]
    fn decode_covers_the_video_field_union() {
        let shapes = [
            json!({ "video": { "url": "https://cdn.example/a.mp4" } }),
            json!({ "output": { "videos": ["https://cdn.example/a.mp4"] } }),
            json!({ "videos": ["https://cdn.example/a.mp4"] }),
            json!({ "videos": [{ "url": "https://cdn.example/a.mp4" }] }),
        ];
        for shape in shapes {
            assert_eq!(
                decode_artifact(&shape, Modality::Video),
                Some(ArtifactPayload::VideoUrl("https://cdn.example/a.mp4".to_string())),
                "shape: {shape}"
            );
        }
        assert_eq!(decode_artifact(&json!({}), Modality::Video), None);
    }

    #[test]
    fn decode_covers_audio_image_text_and_3d() {
        assert_eq!(
            decode_artifact(
                &json!({ "audios": ["https://cdn.example/a.mp3"] }),
                Modality::Audio
            ),
            Some(ArtifactPayload::AudioUrl("https://cdn.example/a.mp3".to_string()))
        );
        assert_eq!(
            decode_artifact(
                &json!({ "data": [{ "url": "https://cdn.example/a.png" }] }),
                Modality::Image
            ),
            Some(ArtifactPayload::ImageUrl("https://cdn.example/a.png".to_string()))
        );
        assert_eq!(
            decode_artifact(
                &json!({ "choices": [{ "message": { "content": "hi" } }] }),
                Modality::Text
            ),
            Some(ArtifactPayload::Text("hi".to_string()))
        );
        assert_eq!(
            decode_artifact(
                &json!({ "output": { "model": { "url": "https://cdn.example/a.glb" } } }),
                Modality::ThreeD
            ),
            Some(ArtifactPayload::ModelUrl("https://cdn.example/a.glb".to_string()))
        );
        // a video-shaped payload does not satisfy an image request
        assert_eq!(
            decode_artifact(
                &json!({ "videos": ["https://cdn.example/a.mp4"] }),
                Modality::Image
            ),
            None
        );
    }

    #[test]
    fn render_produces_the_documented_fragments() {
        assert_eq!(
            render_artifact(&ArtifactPayload::ImageUrl(
                "https://cdn.example/a.png".to_string()
            )),
            "<img src=\"https://cdn.example/a.png\" />"
        );
        assert_eq!(
            render_artifact(&ArtifactPayload::VideoUrl(
                "https://cdn.example/a.mp4".to_string()
            )),
            "<video src=\"https://cdn.example/a.mp4\" controls></video>"
        );
        assert_eq!(
            render_artifact(&ArtifactPayload::AudioUrl(
                "https://cdn.example/a.mp3".to_string()
            )),
            "<audio src=\"https://cdn.example/a.mp3\" controls></audio>"
        );
        let descriptor: Value = serde_json::from_str(&render_artifact(
            &ArtifactPayload::ModelUrl("https://cdn.example/a.glb".to_string()),
        ))
        .unwrap_or_default();
        assert_eq!(descriptor["kind"], json!("model-viewer"));
        assert_eq!(descriptor["src"], json!("https://cdn.example/a.glb"));
    }

    #[test]
    fn rendered_text_is_escaped() {
        assert_eq!(
            render_artifact(&ArtifactPayload::Text("<b>1 & 2</b>".to_string())),
            "&lt;b&gt;1 &amp; 2&lt;/b&gt;"
        );
        assert_eq!(
            render_artifact(&ArtifactPayload::ImageUrl(
                "https://cdn.example/a.png?x=\"y\"".to_string()
            )),
            "<img src=\"https://cdn.example/a.png?x=&quot;y&quot;\" />"
        );
    }

    #[test]
    fn cost_extraction_tolerates_strings_and_falls_back() {
        assert_eq!(
            extract_cost_usd(&json!({ "_cost_info": { "cost_usd": 0.0123 } })),
            Some(0.0123)
        );
        assert_eq!(
            extract_cost_usd(&json!({ "_cost_info": { "cost_usd": "0.5" } })),
            Some(0.5)
        );
        assert_eq!(extract_cost_usd(&json!({})), None);
        assert!((DEFAULT_GENERATION_COST_USD - 0.20).abs() < 1e-12);
    }

    #[test]
    fn task_status_parsing_is_case_insensitive_and_lenient() {
        assert_eq!(TaskStatus::parse("COMPLETED"), TaskStatus::Completed);
        assert_eq!(TaskStatus::parse("failed"), TaskStatus::Failed);
        assert_eq!(TaskStatus::parse("PENDING"), TaskStatus::Pending);
        assert_eq!(TaskStatus::parse("warming-up"), TaskStatus::Pending);
    }

    #[test]
    fn pricing_estimates_follow_the_modality() {
        let tables = parse_pricing_table_rows(
            r#"{
                "kling-1.6-standard": { "cost_per_second_usd": 0.056, "default_duration_s": 5 },
                "flux-schnell": { "cost_per_generation_usd": 0.003 },
                "qwen3-32b": { "cost_per_1m_tokens_usd": 0.4, "assumed_tokens": 800 }
            }"#,
        );
        let video = ModelSpec {
            name: "kling-1.6-standard".to_string(),
            modality: Modality::Video,
            pricing_key: Some("kling-1.6-standard".to_string()),
            input_rules: vec![InputRule::TextInstruction],
            context_window: None,
        };
        let estimate = estimate_generation_cost(&tables, &video, &Map::new());
        assert!(estimate.map(|v| (v - 0.28).abs() < 1e-9).unwrap_or(false));

        let mut options = Map::new();
        options.insert("duration_s".to_string(), json!(10));
        let estimate = estimate_generation_cost(&tables, &video, &options);
        assert!(estimate.map(|v| (v - 0.56).abs() < 1e-9).unwrap_or(false));

        let text = ModelSpec {
            name: "qwen3-32b".to_string(),
            modality: Modality::Text,
            pricing_key: Some("qwen3-32b".to_string()),
            input_rules: vec![InputRule::TextInstruction],
            context_window: Some(32768),
        };
        let estimate = estimate_generation_cost(&tables, &text, &Map::new());
        assert!(estimate.map(|v| (v - 0.00032).abs() < 1e-9).unwrap_or(false));

        let unpriced = ModelSpec {
            name: "mystery".to_string(),
            modality: Modality::Image,
            pricing_key: None,
            input_rules: Vec::new(),
            context_window: None,
        };
        assert_eq!(estimate_generation_cost(&tables, &unpriced, &Map::new()), None);
    }

    #[test]
    fn pricing_overrides_merge_row_wise() {
        let mut tables = parse_pricing_table_rows(
            r#"{ "flux-schnell": { "cost_per_generation_usd": 0.003, "note": "base" } }"#,
        );
        super::merge_pricing_table_rows(
            &mut tables,
            r#"{ "flux-schnell": { "cost_per_generation_usd": 0.005 } }"#,
        );
        let row = tables.get("flux-schnell").cloned().unwrap_or_default();
        assert_eq!(row.get("cost_per_generation_usd"), Some(&json!(0.005)));
        assert_eq!(row.get("note"), Some(&json!("base")));
    }

    #[test]
    fn usage_records_parse_leniently() {
        let payload = json!({
            "logs": [
                { "id": 7, "model": "flux-schnell", "modality": "image",
                  "status": "COMPLETED", "cost_usd": "0.003" },
                "not-an-object",
                { "model": "kling-1.6-standard" }
            ]
        });
        let records = parse_usage_records(&payload);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "7");
        assert_eq!(records[0].cost_usd, Some(0.003));
        assert_eq!(records[1].model, "kling-1.6-standard");
        assert!(records[1].status.is_empty());
    }

    #[test]
    fn dryrun_gateway_counts_calls() -> anyhow::Result<()> {
        let gateway = DryrunGateway::new();
        let mut payload = Map::new();
        payload.insert("prompt".to_string(), json!("hello"));
        payload.insert("modality".to_string(), json!("image"));
        gateway.submit(&payload, Modality::Image, "pk")?;
        assert_eq!(gateway.submit_calls(), 1);
        assert_eq!(gateway.status_calls(), 0);
        Ok(())
    }
}

