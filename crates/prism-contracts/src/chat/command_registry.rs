#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "model",
        action: "set_model",
    },
    CommandSpec {
        command: "modality",
        action: "set_modality",
    },
    CommandSpec {
        command: "newkey",
        action: "create_key",
    },
];

pub(crate) const MULTI_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "attach",
    action: "attach",
}];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "models",
        action: "list_models",
    },
    CommandSpec {
        command: "usage",
        action: "show_usage",
    },
    CommandSpec {
        command: "reset",
        action: "reset_totals",
    },
    CommandSpec {
        command: "logs",
        action: "show_logs",
    },
    CommandSpec {
        command: "keys",
        action: "list_keys",
    },
    CommandSpec {
        command: "balance",
        action: "show_balance",
    },
    CommandSpec {
        command: "clear",
        action: "clear_attachments",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
    },
];

pub(crate) const EXPORT_COMMAND: CommandSpec = CommandSpec {
    command: "export",
    action: "export",
};

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/model <name>",
    "/modality <text|image|video|audio|3d>",
    "/models",
    "/attach <paths\u{2026}>",
    "/clear",
    "/usage",
    "/reset",
    "/logs",
    "/keys",
    "/newkey <name>",
    "/balance",
    "/export [path]",
    "/help",
    "/quit",
];
