use std::collections::BTreeMap;

use super::command_registry::{
    CommandSpec, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, SINGLE_PATH_COMMANDS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub command_args: BTreeMap<String, String>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            command_args: BTreeMap::new(),
        }
    }

    fn with_arg(mut self, key: &str, value: String) -> Self {
        self.command_args.insert(key.to_string(), value);
        self
    }

    /// Non-empty, trimmed argument value.
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.command_args
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

fn find_spec(command: &str, specs: &[CommandSpec]) -> Option<CommandSpec> {
    specs.iter().copied().find(|spec| spec.command == command)
}

fn parse_single_path_arg(arg: &str) -> String {
    if arg.trim().is_empty() {
        return String::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect::<Vec<String>>()
            .join(" "),
        Err(_) => arg.trim().to_string(),
    }
}

/// Maps one line of chat input to an action.
///
/// `/command args` lines dispatch through the command tables; anything else is
/// a problem statement to explain.
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
            let arg = slash_tail[command_len..].trim();

            if let Some(spec) = find_spec(&command, RAW_ARG_COMMANDS) {
                return Intent::new(spec.action, text).with_arg(spec.arg, arg.to_string());
            }

            if let Some(spec) = find_spec(&command, SINGLE_PATH_COMMANDS) {
                return Intent::new(spec.action, text)
                    .with_arg(spec.arg, parse_single_path_arg(arg));
            }

            if let Some(spec) = find_spec(&command, NO_ARG_COMMANDS) {
                return Intent::new(spec.action, text);
            }

            return Intent::new("unknown", text)
                .with_arg("command", command)
                .with_arg("arg", arg.to_string());
        }
    }

    Intent::new("explain", text).with_arg("text", raw_trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::parse_intent;

    #[test]
    fn bare_text_is_explained() {
        let intent = parse_intent("  solve $x^2 - 5x + 6 = 0$ ");
        assert_eq!(intent.action, "explain");
        assert_eq!(intent.arg("text"), Some("solve $x^2 - 5x + 6 = 0$"));
    }

    #[test]
    fn blank_line_is_noop() {
        assert_eq!(parse_intent("   ").action, "noop");
    }

    #[test]
    fn explain_keeps_raw_remainder() {
        let intent = parse_intent("/explain  \"quoted\" 2x + 3 = 7");
        assert_eq!(intent.action, "explain");
        assert_eq!(intent.arg("text"), Some("\"quoted\" 2x + 3 = 7"));
    }

    #[test]
    fn single_path_commands_unquote() {
        let recognize = parse_intent("/recognize \"/tmp/my photo.jpg\"");
        assert_eq!(recognize.action, "recognize");
        assert_eq!(recognize.arg("path"), Some("/tmp/my photo.jpg"));

        let explain_image = parse_intent("/explain_image a.png");
        assert_eq!(explain_image.action, "explain_image");
        assert_eq!(explain_image.arg("path"), Some("a.png"));

        let find = parse_intent("/FIND_UPLOAD b.webp");
        assert_eq!(find.action, "find_upload");
        assert_eq!(find.arg("path"), Some("b.webp"));
    }

    #[test]
    fn id_commands_and_missing_args() {
        let result = parse_intent("/result 1234");
        assert_eq!(result.action, "show_result");
        assert_eq!(result.arg("task_id"), Some("1234"));

        let delete = parse_intent("/delete");
        assert_eq!(delete.action, "delete_history");
        assert_eq!(delete.arg("id"), None);
    }

    #[test]
    fn no_arg_commands() {
        assert_eq!(parse_intent("/history").action, "list_history");
        assert_eq!(parse_intent("/status").action, "status");
        assert_eq!(parse_intent("/exit").action, "quit");
        assert_eq!(parse_intent("/quit").action, "quit");
    }

    #[test]
    fn unknown_command() {
        let intent = parse_intent("/magic foo bar");
        assert_eq!(intent.action, "unknown");
        assert_eq!(intent.arg("command"), Some("magic"));
        assert_eq!(intent.arg("arg"), Some("foo bar"));
    }
}
