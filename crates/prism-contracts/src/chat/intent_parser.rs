use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, EXPORT_COMMAND, MULTI_PATH_COMMANDS, NO_ARG_COMMANDS, RAW_ARG_COMMANDS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            command_args: BTreeMap::new(),
        }
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn raw_arg_key(action: &str) -> &'static str {
    match action {
        "set_model" => "model",
        "set_modality" => "modality",
        _ => "name",
    }
}

fn parse_path_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let remainder = &slash_tail[command_len..];
            let arg = if remainder.is_empty() {
                ""
            } else {
                remainder.trim()
            };

            if let Some(action) = find_action(&command, RAW_ARG_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    raw_arg_key(action).to_string(),
                    Value::String(arg.to_string()),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, MULTI_PATH_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    "paths".to_string(),
                    Value::Array(
                        parse_path_args(arg)
                            .into_iter()
                            .map(Value::String)
                            .collect(),
                    ),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            if command == EXPORT_COMMAND.command {
                let mut intent = Intent::new(EXPORT_COMMAND.action, text);
                intent.command_args.insert(
                    "path".to_string(),
                    if arg.is_empty() {
                        Value::Null
                    } else {
                        Value::String(arg.to_string())
                    },
                );
                return intent;
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("generate", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_intent;

    #[test]
    fn bare_text_is_a_generate_intent() {
        let intent = parse_intent("  a fox leaping over a brook  ");
        assert_eq!(intent.action, "generate");
        assert_eq!(intent.prompt.as_deref(), Some("a fox leaping over a brook"));
    }

    #[test]
    fn empty_input_is_noop() {
        assert_eq!(parse_intent("   ").action, "noop");
    }

    #[test]
    fn model_and_modality_commands_carry_their_argument() {
        let model = parse_intent("/model kling-1.6-standard");
        assert_eq!(model.action, "set_model");
        assert_eq!(model.command_args["model"], json!("kling-1.6-standard"));

        let modality = parse_intent("/modality video");
        assert_eq!(modality.action, "set_modality");
        assert_eq!(modality.command_args["modality"], json!("video"));
    }

    #[test]
    fn attach_splits_quoted_paths() {
        let intent = parse_intent("/attach \"/tmp/a b.png\" /tmp/c.png");
        assert_eq!(intent.action, "attach");
        assert_eq!(
            intent.command_args["paths"],
            json!(["/tmp/a b.png", "/tmp/c.png"])
        );
    }

    #[test]
    fn no_arg_commands_resolve() {
        assert_eq!(parse_intent("/usage").action, "show_usage");
        assert_eq!(parse_intent("/logs").action, "show_logs");
        assert_eq!(parse_intent("/keys").action, "list_keys");
        assert_eq!(parse_intent("/balance").action, "show_balance");
        assert_eq!(parse_intent("/exit").action, "quit");
    }

    #[test]
    fn newkey_carries_a_name() {
        let intent = parse_intent("/newkey ci-runner");
        assert_eq!(intent.action, "create_key");
        assert_eq!(intent.command_args["name"], json!("ci-runner"));
    }

    #[test]
    fn export_path_is_optional() {
        let bare = parse_intent("/export");
        assert_eq!(bare.action, "export");
        assert_eq!(bare.command_args["path"], json!(null));

        let with_path = parse_intent("/export /tmp/gallery.html");
        assert_eq!(with_path.command_args["path"], json!("/tmp/gallery.html"));
    }

    #[test]
    fn unknown_command_is_reported_not_generated() {
        let intent = parse_intent("/warp 9");
        assert_eq!(intent.action, "unknown");
        assert_eq!(intent.command_args["command"], json!("warp"));
        assert_eq!(intent.command_args["arg"], json!("9"));
    }
}
