//! Slash commands for interactive mode

use std::path::PathBuf;

/// Result of parsing a slash command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show a message to the user (not sent to the backend)
    Message(String),
    /// Start a new conversation with the next message
    New,
    /// List saved conversations
    List,
    /// Switch to a conversation by id or id prefix
    Open(String),
    /// Show the current conversation with message indices
    Show,
    /// Replace the message at an index and resend from there
    Edit { index: usize, text: String },
    /// Queue an image for the next message
    Attach(PathBuf),
    /// List models, or switch to one
    Model(Option<String>),
    /// Delete the current conversation
    Delete,
    /// Exit the application
    Exit,
    /// Unknown command
    Unknown(String),
}

/// Parse a slash command. Returns `None` for ordinary chat input.
pub fn parse(input: &str) -> Option<Command> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let (command, args) = match rest.split_once(char::is_whitespace) {
        Some((command, args)) => (command.to_lowercase(), args.trim()),
        None => (rest.to_lowercase(), ""),
    };

    Some(match command.as_str() {
        "help" | "h" | "?" => Command::Message(help_message()),
        "new" | "n" => Command::New,
        "list" | "l" => Command::List,
        "open" | "o" if !args.is_empty() => Command::Open(args.to_string()),
        "open" | "o" => Command::Message("Usage: /open <id>".to_string()),
        "show" => Command::Show,
        "edit" | "e" => parse_edit(args),
        "attach" | "a" if !args.is_empty() => Command::Attach(PathBuf::from(args)),
        "attach" | "a" => Command::Message("Usage: /attach <path>".to_string()),
        "model" | "m" => Command::Model((!args.is_empty()).then(|| args.to_string())),
        "delete" => Command::Delete,
        "quit" | "exit" | "q" => Command::Exit,
        _ => Command::Unknown(command),
    })
}

fn parse_edit(args: &str) -> Command {
    let usage = || Command::Message("Usage: /edit <index> <text>".to_string());
    let Some((index, text)) = args.split_once(char::is_whitespace) else {
        return usage();
    };
    match index.parse() {
        Ok(index) if !text.trim().is_empty() => Command::Edit {
            index,
            text: text.trim().to_string(),
        },
        _ => usage(),
    }
}

/// Resolve an id or unique id prefix against known ids
pub fn resolve_id<'a>(query: &str, ids: impl IntoIterator<Item = &'a str>) -> Result<&'a str, String> {
    let ids: Vec<&'a str> = ids.into_iter().collect();
    if let Some(id) = ids.iter().find(|id| **id == query) {
        return Ok(*id);
    }

    let matches: Vec<&'a str> = ids.into_iter().filter(|id| id.starts_with(query)).collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(format!("No conversation matching '{}'", query)),
        _ => Err(format!("'{}' matches {} conversations", query, matches.len())),
    }
}

/// List models as text, marking the current one
pub fn list_models(current: &str) -> String {
    let mut output = String::from("Available models:\n");
    for model in parley_ai::models::available() {
        let marker = if *model == current { " *" } else { "" };
        output.push_str(&format!("  {}{}\n", model, marker));
    }
    output.push_str("\nSwitch with: /model <id>");
    output
}

fn help_message() -> String {
    r#"Available commands:
  /help, /h, /?            Show this help message
  /new, /n                 Start a new conversation
  /list, /l                List saved conversations
  /open, /o <id>           Switch to a conversation (id prefix is enough)
  /show                    Show the current conversation with indices
  /edit, /e <index> <text> Replace a message and resend from there
  /attach, /a <path>       Attach an image to the next message
  /model, /m [id]          List models or switch to a model
  /delete                  Delete the current conversation
  /quit, /exit, /q         Exit parley

Press Ctrl-C while a reply is streaming to stop it."#
        .to_string()
}
