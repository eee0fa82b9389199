//! parley - terminal chat client for a streaming generation backend

mod commands;
mod config;
mod media;
mod storage;

use clap::Parser;
use commands::Command;
use parley_ai::{ChatMessage, GeneratorConfig, HttpGenerator, Part, Role};
use parley_chat::{Chat, ConversationId, TurnOutcome};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tracing_subscriber::EnvFilter;

/// parley - chat with a streaming generation backend
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server origin (default: http://localhost:5174)
    #[arg(short, long)]
    server: Option<String>,

    /// Model to use (default: gemma-3-27b-it)
    #[arg(short, long)]
    model: Option<String>,

    /// Run a single prompt against the non-streaming endpoint and exit
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Open a saved conversation by id (or id prefix)
    #[arg(long)]
    resume: Option<String>,

    /// List saved conversations
    #[arg(long)]
    list: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    let filter = if args.verbose {
        EnvFilter::new("parley=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cfg = config::Config::load();

    // CLI takes precedence over the config file
    let server_url = args
        .server
        .or(cfg.server_url.clone())
        .unwrap_or_else(|| config::DEFAULT_SERVER_URL.to_string());
    let model = args
        .model
        .or(cfg.model.clone())
        .unwrap_or_else(|| parley_ai::models::DEFAULT_MODEL.to_string());
    let data_dir = cfg.data_dir();

    let generator = Arc::new(HttpGenerator::new(
        GeneratorConfig::new(&server_url).with_default_model(&model),
    )?);

    // Non-interactive mode
    if let Some(prompt) = args.command {
        let text = generator.generate_text(&prompt, Some(&model)).await?;
        println!("{}", text);
        return Ok(());
    }

    let persistence = Arc::new(storage::JsonlPersistence::new(data_dir.join("conversations")));
    let chat = Chat::new(generator, persistence, &model);
    if let Err(e) = chat.restore().await {
        eprintln!("Warning: Failed to load saved conversations: {}", e);
    }

    if args.list {
        list_conversations(&chat, None);
        return Ok(());
    }

    let current = match args.resume {
        Some(query) => Some(open_conversation(&chat, &query)?),
        None => None,
    };

    let result = run_interactive(&chat, current, &data_dir.join("images")).await;
    chat.flush().await;
    result
}

fn open_conversation(chat: &Chat, query: &str) -> anyhow::Result<ConversationId> {
    let snapshot = chat.store().snapshot();
    let id = commands::resolve_id(query, snapshot.keys().map(|id| id.as_str()))
        .map_err(anyhow::Error::msg)?;
    Ok(ConversationId::from(id))
}

fn list_conversations(chat: &Chat, current: Option<&ConversationId>) {
    let rows = chat.list();
    if rows.is_empty() {
        println!("No saved conversations.");
        return;
    }
    for row in rows {
        let marker = if current == Some(&row.id) { "*" } else { " " };
        let short: String = row.id.as_str().chars().take(8).collect();
        println!(
            "{} {}  {}  {}",
            marker,
            short,
            storage::timestamp_display(row.updated_at),
            row.title
        );
    }
}

fn show_conversation(chat: &Chat, id: &ConversationId) {
    let Some(convo) = chat.store().get(id) else {
        println!("Conversation not found.");
        return;
    };
    println!("{}", convo.title);
    for (i, message) in convo.messages.iter().enumerate() {
        let preview: String = message.text().chars().take(70).collect();
        let images = message.parts.iter().filter(|p| p.has_inline_data()).count();
        let suffix = if images > 0 {
            format!(" [{} image(s)]", images)
        } else {
            String::new()
        };
        println!(
            "  {}: [{}] {}{}",
            i,
            message.role.as_str(),
            preview.replace('\n', " "),
            suffix
        );
    }
}

async fn run_interactive(
    chat: &Chat,
    mut current: Option<ConversationId>,
    images_dir: &Path,
) -> anyhow::Result<()> {
    let mut attachments: Vec<Part> = Vec::new();

    // Show minimal startup info (only if TTY)
    if io::IsTerminal::is_terminal(&io::stderr()) {
        eprintln!("parley ({}) - /help for commands", chat.model());
        eprintln!();
    }
    if let Some(id) = &current {
        show_conversation(chat, id);
    }

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            // EOF
            break;
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(command) = commands::parse(input) {
            match command {
                Command::Exit => break,
                Command::Message(msg) => println!("{}", msg),
                Command::Unknown(cmd) => {
                    println!("Unknown command: /{}", cmd);
                    println!("Type /help for available commands.");
                }
                Command::New => {
                    current = None;
                    println!("Next message starts a new conversation.");
                }
                Command::List => list_conversations(chat, current.as_ref()),
                Command::Open(query) => match open_conversation(chat, &query) {
                    Ok(id) => {
                        show_conversation(chat, &id);
                        current = Some(id);
                    }
                    Err(e) => println!("{}", e),
                },
                Command::Show => match &current {
                    Some(id) => show_conversation(chat, id),
                    None => println!("No conversation yet."),
                },
                Command::Edit { index, text } => match &current {
                    Some(id) => {
                        let id = id.clone();
                        let printed = Arc::new(AtomicUsize::new(0));
                        let printer = spawn_printer(chat, printed.clone());
                        let result = with_interrupt(chat, chat.edit(&id, index, &text)).await;
                        finish_turn(result, printer, &printed, images_dir).await;
                    }
                    None => println!("No conversation to edit."),
                },
                Command::Attach(path) => match media::load_attachment(&path) {
                    Ok(part) => {
                        attachments.push(part);
                        println!(
                            "Attached {} ({} pending)",
                            path.display(),
                            attachments.len()
                        );
                    }
                    Err(e) => println!("{:#}", e),
                },
                Command::Model(None) => println!("{}", commands::list_models(&chat.model())),
                Command::Model(Some(model)) => {
                    if !parley_ai::models::is_known(&model) {
                        println!("Note: '{}' is not a listed model.", model);
                    }
                    chat.set_model(&model);
                    println!("Switched to: {}", model);
                }
                Command::Delete => match current.take() {
                    Some(id) => match chat.delete(&id) {
                        Ok(true) => println!("Deleted."),
                        Ok(false) => println!("Conversation not found."),
                        Err(e) => {
                            println!("{}", e);
                            current = Some(id);
                        }
                    },
                    None => println!("No conversation to delete."),
                },
            }
            println!();
            continue;
        }

        println!();
        let printed = Arc::new(AtomicUsize::new(0));
        let printer = spawn_printer(chat, printed.clone());
        let turn = chat.send(current.clone(), input, std::mem::take(&mut attachments));
        let result = with_interrupt(chat, turn).await;
        if let Ok(outcome) = &result {
            current = Some(outcome.conversation_id.clone());
        }
        finish_turn(result, printer, &printed, images_dir).await;
    }

    Ok(())
}

/// Run a turn, aborting it on Ctrl-C
async fn with_interrupt<F>(chat: &Chat, turn: F) -> parley_chat::Result<TurnOutcome>
where
    F: std::future::Future<Output = parley_chat::Result<TurnOutcome>>,
{
    tokio::pin!(turn);
    loop {
        tokio::select! {
            result = &mut turn => return result,
            _ = tokio::signal::ctrl_c() => chat.abort(),
        }
    }
}

/// Print the in-flight reply as new text shows up in store snapshots.
///
/// `printed` tracks how many characters have been written so far.
fn spawn_printer(chat: &Chat, printed: Arc<AtomicUsize>) -> tokio::task::JoinHandle<()> {
    let mut rx = chat.subscribe();

    tokio::spawn(async move {
        let mut last: Option<Arc<ChatMessage>> = None;
        while rx.changed().await.is_ok() {
            let snapshot = rx.borrow_and_update().clone();
            let Some(message) = snapshot
                .values()
                .find(|c| c.streaming)
                .and_then(|c| c.last().cloned())
            else {
                continue;
            };
            if last.as_ref().is_some_and(|l| Arc::ptr_eq(l, &message)) {
                continue;
            }

            let text: Vec<char> = message.text().chars().collect();
            let already = printed.load(Ordering::Acquire);
            if text.len() > already {
                let new_text: String = text[already..].iter().collect();
                print!("{}", new_text);
                io::stdout().flush().ok();
                printed.store(text.len(), Ordering::Release);
            }
            last = Some(message);
        }
    })
}

async fn finish_turn(
    result: parley_chat::Result<TurnOutcome>,
    printer: tokio::task::JoinHandle<()>,
    printed: &AtomicUsize,
    images_dir: &Path,
) {
    printer.abort();
    let _ = printer.await;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("Error: {}", e.describe());
            return;
        }
    };

    let message = &outcome.message;
    if message.role == Role::Error {
        eprintln!("\nError: {}", message.text());
        return;
    }

    let text: Vec<char> = message.text().chars().collect();
    let already = printed.load(Ordering::Acquire).min(text.len());
    let rest: String = text[already..].iter().collect();
    println!("{}", rest);

    if message.parts.iter().any(|p| p.has_inline_data()) {
        match media::save_images(images_dir, &message.parts) {
            Ok(paths) => {
                for path in paths {
                    println!("[image saved to {}]", path.display());
                }
            }
            Err(e) => eprintln!("Failed to save image: {:#}", e),
        }
    }

    let sources = message.sources();
    if !sources.is_empty() {
        println!("\nSources:");
        for (i, source) in sources.iter().enumerate() {
            match &source.title {
                Some(title) => println!("  [{}] {} ({})", i + 1, title, source.uri),
                None => println!("  [{}] {}", i + 1, source.uri),
            }
        }
    }
}
