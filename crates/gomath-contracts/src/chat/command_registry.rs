#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
    pub arg: &'static str,
}

/// Commands whose whole remainder is one free-form argument.
pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "explain",
        action: "explain",
        arg: "text",
    },
    CommandSpec {
        command: "result",
        action: "show_result",
        arg: "task_id",
    },
    CommandSpec {
        command: "show",
        action: "show_history",
        arg: "id",
    },
    CommandSpec {
        command: "delete",
        action: "delete_history",
        arg: "id",
    },
];

/// Commands taking a single (possibly quoted) path.
pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "recognize",
        action: "recognize",
        arg: "path",
    },
    CommandSpec {
        command: "explain_image",
        action: "explain_image",
        arg: "path",
    },
    CommandSpec {
        command: "find_upload",
        action: "find_upload",
        arg: "path",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "history",
        action: "list_history",
        arg: "",
    },
    CommandSpec {
        command: "status",
        action: "status",
        arg: "",
    },
    CommandSpec {
        command: "help",
        action: "help",
        arg: "",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
        arg: "",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
        arg: "",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/recognize",
    "/explain",
    "/explain_image",
    "/result",
    "/history",
    "/show",
    "/delete",
    "/find_upload",
    "/status",
    "/help",
    "/quit",
];
