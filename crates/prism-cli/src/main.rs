use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use prism_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use prism_contracts::keys::KeyStore;
use prism_contracts::models::{Modality, ModelRegistry};
use prism_contracts::requests::Attachment;
use prism_contracts::session::SessionTotals;
use prism_contracts::transcript::Transcript;
use prism_engine::{
    create_and_cache_api_key, parse_usage_records, refresh_api_keys, resolve_api_key,
    DryrunGateway, Gateway, HttpGateway, LogQuery, PlaygroundEngine, UsageRecord,
};
use reqwest::blocking::Client as HttpClient;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

#[derive(Debug, Parser)]
#[command(name = "prism", version, about = "Prism multi-modal playground CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Generate(GenerateArgs),
    Models,
    Logs(LogsArgs),
    Keys(KeysArgs),
    Export(ExportArgs),
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value = "text")]
    modality: String,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value = "text")]
    modality: String,
    #[arg(long)]
    attach: Vec<PathBuf>,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct LogsArgs {
    #[arg(long, default_value_t = 20)]
    limit: u64,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct KeysArgs {
    #[command(subcommand)]
    action: KeysAction,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Subcommand)]
enum KeysAction {
    List,
    Create { name: String },
}

#[derive(Debug, Parser)]
struct ExportArgs {
    #[arg(long)]
    session: PathBuf,
    #[arg(long)]
    out: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("prism error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Generate(args) => run_generate(args),
        Command::Models => {
            print_models(&ModelRegistry::new(None));
            Ok(0)
        }
        Command::Logs(args) => run_logs(args),
        Command::Keys(args) => run_keys(args),
        Command::Export(args) => {
            export_gallery(&args.session, &args.out)?;
            println!("Exported to {}", args.out.display());
            Ok(0)
        }
    }
}

fn select_gateway(dryrun: bool) -> Box<dyn Gateway> {
    if dryrun || std::env::var_os("PRISM_DRYRUN").is_some() {
        Box::new(DryrunGateway::new())
    } else {
        Box::new(HttpGateway::new())
    }
}

fn parse_modality_flag(raw: &str) -> Result<Modality> {
    Modality::parse(raw)
        .ok_or_else(|| anyhow::anyhow!("unknown modality '{raw}' (text, image, video, audio, 3d)"))
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let modality = parse_modality_flag(&args.modality)?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let mut engine = PlaygroundEngine::new(
        &args.out,
        &events_path,
        select_gateway(args.dryrun),
        args.model.clone(),
        modality,
    )?;

    let stdin = io::stdin();
    let mut line = String::new();
    let mut attachments: Vec<Attachment> = Vec::new();

    println!("Prism playground started. Type /help for commands.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);

        match intent.action.as_str() {
            "noop" => continue,
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join("  "));
            }
            "generate" => {
                let prompt = intent.prompt.clone().unwrap_or_default();
                match engine.generate(&prompt, &attachments, Map::new()) {
                    Ok(report) => {
                        println!("{}", report.rendered);
                        if let Some(reason) = report.fallback_reason.as_deref() {
                            println!("Note: {reason}");
                        }
                        println!(
                            "Cost: {} | Session total: {}",
                            format_cost(Some(report.cost_usd)),
                            format_cost(Some(engine.totals().total_cost_usd)),
                        );
                        attachments.clear();
                    }
                    Err(err) => println!("Generation failed: {err:#}"),
                }
            }
            "set_model" => {
                let requested = value_as_non_empty_string(intent.command_args.get("model"));
                match requested {
                    Some(model) => {
                        engine.set_model(Some(model.clone()));
                        println!("Model set to {model}");
                    }
                    None => println!(
                        "Current model: {}",
                        engine.model().unwrap_or("(modality default)")
                    ),
                }
            }
            "set_modality" => {
                let requested = value_as_non_empty_string(intent.command_args.get("modality"));
                match requested.as_deref().and_then(Modality::parse) {
                    Some(parsed) => {
                        engine.set_modality(parsed);
                        println!("Modality set to {parsed}");
                    }
                    None => println!(
                        "Unknown modality '{}' (text, image, video, audio, 3d)",
                        requested.unwrap_or_default()
                    ),
                }
            }
            "attach" => {
                let paths = value_as_string_list(intent.command_args.get("paths"));
                if paths.is_empty() {
                    println!("/attach requires at least one path");
                    continue;
                }
                for path in paths {
                    match Attachment::load(&path) {
                        Ok(attachment) => {
                            println!("Attached {path}");
                            attachments.push(attachment);
                        }
                        Err(err) => println!("Attach failed: {err:#}"),
                    }
                }
                println!("{} attachment(s) staged", attachments.len());
            }
            "clear_attachments" => {
                attachments.clear();
                println!("Attachments cleared.");
            }
            "list_models" => print_models(engine.registry()),
            "show_usage" => print_totals(engine.totals()),
            "reset_totals" => {
                engine.reset_totals()?;
                println!("Session totals reset.");
            }
            "show_logs" => match engine.usage_logs(20) {
                Ok(records) => print_usage_table(&records),
                Err(err) => println!("Logs unavailable: {err:#}"),
            },
            "list_keys" => match engine.api_keys() {
                Ok(keys) if keys.is_empty() => println!("No API keys on this account."),
                Ok(keys) => {
                    for key in keys {
                        println!("{}", mask_key(&key));
                    }
                }
                Err(err) => println!("Keys unavailable: {err:#}"),
            },
            "create_key" => {
                let Some(name) = value_as_non_empty_string(intent.command_args.get("name")) else {
                    println!("/newkey requires a name");
                    continue;
                };
                match engine.create_api_key(&name) {
                    Ok(key) => println!("Created {}", mask_key(&key)),
                    Err(err) => println!("Key creation failed: {err:#}"),
                }
            }
            "show_balance" => match engine.balance() {
                Ok(Some(balance)) => println!("Balance: {}", format_cost(Some(balance))),
                Ok(None) => println!("Balance unknown (no JWT cached)."),
                Err(err) => println!("Balance unavailable: {err:#}"),
            },
            "export" => {
                let out = value_as_non_empty_string(intent.command_args.get("path"))
                    .map(PathBuf::from)
                    .unwrap_or_else(|| args.out.join("gallery.html"));
                match export_gallery(&args.out, &out) {
                    Ok(()) => println!("Exported to {}", out.display()),
                    Err(err) => println!("Export failed: {err:#}"),
                }
            }
            "quit" => break,
            "unknown" => {
                let command = value_as_non_empty_string(intent.command_args.get("command"))
                    .unwrap_or_default();
                println!("Unknown command /{command} (try /help)");
            }
            other => println!("Unhandled action '{other}'"),
        }
    }

    engine.finish()?;
    print_totals(engine.totals());
    Ok(())
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let modality = parse_modality_flag(&args.modality)?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let mut engine = PlaygroundEngine::new(
        &args.out,
        &events_path,
        select_gateway(args.dryrun),
        args.model.clone(),
        modality,
    )?;

    let mut attachments = Vec::new();
    for path in &args.attach {
        attachments.push(Attachment::load(path)?);
    }

    match engine.generate(&args.prompt, &attachments, Map::new()) {
        Ok(report) => {
            println!("{}", report.rendered);
            println!(
                "Cost: {} | Latency: {}",
                format_cost(Some(report.cost_usd)),
                format_latency(Some(report.latency_s)),
            );
            engine.finish()?;
            Ok(0)
        }
        Err(err) => {
            println!("Generation failed: {err:#}");
            engine.finish()?;
            Ok(1)
        }
    }
}

fn run_logs(args: LogsArgs) -> Result<i32> {
    let gateway = select_gateway(args.dryrun);
    let mut keys = cli_key_store();
    let api_key = resolve_api_key(gateway.as_ref(), &mut keys)?;
    let payload = gateway.usage_logs(
        &LogQuery {
            api_key: Some(api_key.clone()),
            user_id: None,
            limit: Some(args.limit),
        },
        &api_key,
    )?;
    print_usage_table(&parse_usage_records(&payload));
    Ok(0)
}

fn run_keys(args: KeysArgs) -> Result<i32> {
    let gateway = select_gateway(args.dryrun);
    let mut keys = cli_key_store();
    match args.action {
        KeysAction::List => {
            let fetched = refresh_api_keys(gateway.as_ref(), &mut keys)?;
            if fetched.is_empty() {
                println!("No API keys on this account.");
            }
            for key in fetched {
                println!("{}", mask_key(&key));
            }
            if let Some(balance) = keys.balance() {
                println!("Balance: {}", format_cost(Some(balance)));
            }
        }
        KeysAction::Create { name } => {
            let key = create_and_cache_api_key(gateway.as_ref(), &mut keys, &name)?;
            println!("Created {}", mask_key(&key));
        }
    }
    Ok(0)
}

fn cli_key_store() -> KeyStore {
    KeyStore::new(
        KeyStore::default_path().unwrap_or_else(|| PathBuf::from(".prism-credentials.json")),
    )
}

fn print_models(registry: &ModelRegistry) {
    println!("{:<22} {:<8} requirements", "model", "modality");
    for model in registry.list() {
        let mut notes = Vec::new();
        if model.requires_image() {
            notes.push("image input".to_string());
        }
        if let Some(keys) = model.structured_keys() {
            notes.push(format!("structured prompt ({})", keys.join(" | ")));
        }
        if let Some(window) = model.context_window {
            notes.push(format!("{window} token context"));
        }
        println!(
            "{:<22} {:<8} {}",
            model.name,
            model.modality.as_str(),
            if notes.is_empty() {
                "-".to_string()
            } else {
                notes.join(", ")
            }
        );
    }
}

fn print_totals(totals: &SessionTotals) {
    let mut parts = vec![
        format!("total cost {}", format_cost(Some(totals.total_cost_usd))),
        format!("{} tokens", totals.total_tokens),
        format!("{} completed / {} failed", totals.completed, totals.failed),
    ];
    if let Some(ttft) = totals.last_ttft_s {
        parts.push(format!("last ttft {ttft:.2}s"));
    }
    if let Some(tps) = totals.last_tps {
        parts.push(format!("last tps {tps:.1}"));
    }
    println!("Session: {}", parts.join(" | "));
}

fn print_usage_table(records: &[UsageRecord]) {
    if records.is_empty() {
        println!("No usage records.");
        return;
    }
    println!(
        "{:<12} {:<22} {:<8} {:<10} {:>9}  created",
        "id", "model", "modality", "status", "cost"
    );
    for record in records {
        println!(
            "{:<12} {:<22} {:<8} {:<10} {:>9}  {}",
            record.id,
            record.model,
            record.modality,
            record.status,
            format_cost(record.cost_usd),
            record.created_at.as_deref().unwrap_or("-"),
        );
    }
}

fn format_cost(value: Option<f64>) -> String {
    match value {
        Some(raw) => format!("${raw:.4}"),
        None => "N/A".to_string(),
    }
}

fn format_latency(value: Option<f64>) -> String {
    match value {
        Some(raw) => format!("{raw:.2}s"),
        None => "N/A".to_string(),
    }
}

fn mask_key(key: &str) -> String {
    if key.chars().count() <= 10 {
        return key.to_string();
    }
    let head: String = key.chars().take(10).collect();
    format!("{head}\u{2026}")
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|row| !row.is_empty())
        .map(str::to_string)
}

fn value_as_string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|item| item.as_str().map(str::trim).map(str::to_string))
        .filter(|item| !item.is_empty())
        .collect()
}

/// Writes an HTML gallery for a session directory. Image artifacts are
/// downloaded and thumbnailed next to the output file; anything that cannot
/// be fetched falls back to its rendered fragment.
fn export_gallery(session_dir: &Path, out: &Path) -> Result<()> {
    let transcript_path = session_dir.join("transcript.json");
    if !transcript_path.exists() {
        bail!("no transcript at {}", transcript_path.display());
    }
    let transcript = Transcript::load(&transcript_path);
    let out_dir = out.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(out_dir)?;
    let thumbs_dir = out_dir.join("thumbs");
    let http = HttpClient::new();

    let mut html = String::new();
    html.push_str("<!doctype html>\n<html>\n<head>\n<meta charset=\"utf-8\" />\n");
    html.push_str(&format!(
        "<title>Prism session {}</title>\n</head>\n<body>\n",
        escape_html(&transcript.session_id)
    ));
    html.push_str(&format!(
        "<h1>Session {}</h1>\n<p>{} message(s), started {}</p>\n",
        escape_html(&transcript.session_id),
        transcript.messages.len(),
        escape_html(&transcript.created_at)
    ));

    for message in &transcript.messages {
        html.push_str(&format!(
            "<div class=\"message {}\">\n<h3>{} ({})</h3>\n",
            escape_html(&message.role),
            escape_html(&message.role),
            escape_html(&message.modality)
        ));
        let body = if message.role == "user" {
            format!("<p>{}</p>", escape_html(&message.body))
        } else if message.modality == "image" {
            match message
                .artifact_url
                .as_deref()
                .map(|url| download_thumbnail(&http, url, &thumbs_dir))
            {
                Some(Ok(thumb)) => format!(
                    "<a href=\"{}\"><img src=\"thumbs/{thumb}\" /></a>",
                    escape_attr(message.artifact_url.as_deref().unwrap_or_default())
                ),
                _ => message.body.clone(),
            }
        } else {
            message.body.clone()
        };
        html.push_str(&body);
        if let Some(cost) = message.cost_usd {
            html.push_str(&format!("\n<p><small>{}</small></p>", format_cost(Some(cost))));
        }
        html.push_str("\n</div>\n");
    }
    html.push_str("</body>\n</html>\n");

    fs::write(out, html).with_context(|| format!("failed to write {}", out.display()))?;
    Ok(())
}

fn download_thumbnail(http: &HttpClient, url: &str, thumbs_dir: &Path) -> Result<String> {
    let response = http
        .get(url)
        .send()
        .with_context(|| format!("failed downloading artifact ({url})"))?;
    if !response.status().is_success() {
        bail!("artifact download failed ({})", response.status().as_u16());
    }
    let bytes = response.bytes().context("failed reading artifact bytes")?;
    let decoded = image::load_from_memory(&bytes).context("failed decoding artifact image")?;
    let resized = decoded.resize(256, 256, FilterType::Triangle).to_rgb8();

    let mut encoded = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut encoded, 85);
    encoder
        .encode_image(&DynamicImage::ImageRgb8(resized))
        .context("failed encoding thumbnail")?;

    fs::create_dir_all(thumbs_dir)?;
    let file_name = format!("{}.jpg", thumb_stem(url));
    fs::write(thumbs_dir.join(&file_name), encoded)?;
    Ok(file_name)
}

fn thumb_stem(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest.chars().take(12).collect()
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(raw: &str) -> String {
    escape_html(raw).replace('"', "&quot;")
}
