/// Commands understood by the interactive session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Help,
    Select { path: String },
    Remove,
    Analyze,
    Status,
    Quit,
    Noop,
    Unknown { raw: String },
}

pub const REPL_HELP_COMMANDS: [&str; 6] = [
    "/select <path>",
    "/remove",
    "/analyze",
    "/status",
    "/help",
    "/quit",
];

pub fn parse_repl_command(line: &str) -> ReplCommand {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ReplCommand::Noop;
    }
    if !trimmed.starts_with('/') {
        return ReplCommand::Unknown {
            raw: trimmed.to_string(),
        };
    }

    let (command, arg) = match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (trimmed, ""),
    };

    match command {
        "/help" => ReplCommand::Help,
        "/remove" => ReplCommand::Remove,
        "/analyze" => ReplCommand::Analyze,
        "/status" => ReplCommand::Status,
        "/quit" | "/exit" => ReplCommand::Quit,
        "/select" => match parse_single_path(arg) {
            Some(path) => ReplCommand::Select { path },
            None => ReplCommand::Unknown {
                raw: trimmed.to_string(),
            },
        },
        _ => ReplCommand::Unknown {
            raw: trimmed.to_string(),
        },
    }
}

// Paths may be quoted; fall back to whitespace splitting on unbalanced
// quotes so a stray quote never swallows the argument.
fn parse_single_path(arg: &str) -> Option<String> {
    let parts = match shell_words::split(arg) {
        Ok(parts) => parts,
        Err(_) => arg.split_whitespace().map(str::to_string).collect(),
    };
    match parts.as_slice() {
        [single] if !single.is_empty() => Some(single.clone()),
        _ => None,
    }
}
