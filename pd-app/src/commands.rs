//! Slash-command parser.

use pd_channels::ControlSignal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/start`, `/menu`
    Menu,
    /// `/help`
    Help,
    /// `/cancel`, `/back`, `/done` map onto control signals.
    Signal(ControlSignal),
    Unknown(String),
}

/// Returns `None` for plain text.
pub fn parse(input: &str) -> Option<Command> {
    let trimmed = input.trim();
    let rest = trimmed.strip_prefix('/')?;
    let word = rest.split_whitespace().next().unwrap_or_default();
    // Group chats address commands as /cmd@BotName.
    let name = word.split('@').next().unwrap_or_default().to_ascii_lowercase();
    Some(match name.as_str() {
        "start" | "menu" => Command::Menu,
        "help" => Command::Help,
        "cancel" | "back" => Command::Signal(ControlSignal::Back),
        "done" | "finish" => Command::Signal(ControlSignal::Finish),
        _ => Command::Unknown(word.to_string()),
    })
}

pub fn help_text() -> String {
    [
        "Commands:",
        "/start or /menu: choose an operation",
        "/done: finish adding files (merge)",
        "/cancel: abandon the current operation",
        "/help: this message",
    ]
    .join("\n")
}
