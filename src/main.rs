//! Chatlink CLI - talk to a chat server from the terminal.
//!
//! This is the main binary entry point. See the `chatlink` library for the
//! core functionality.

use std::time::Duration;

use anyhow::{Context, Result};
use chatlink::{
    ClientConfig, ConversationId, DispatchEvent, DomainEvent, LoadOutcome, MessagingSession,
};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tokio::sync::broadcast::error::RecvError;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "chatlink")]
#[command(version)]
#[command(about = "Real-time messaging client")]
struct Cli {
    /// Override the configured server URL
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a message and wait for the server to acknowledge it
    Send {
        /// Conversation to post into
        #[arg(long, short)]
        conversation: String,
        /// Message text
        #[arg(required = true)]
        text: Vec<String>,
        /// Seconds to wait for the acknowledgement
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Print live events until Ctrl-C
    Listen {
        /// Only show events for this conversation
        #[arg(long, short)]
        conversation: Option<String>,
        /// Print a telemetry snapshot on exit
        #[arg(long)]
        telemetry: bool,
    },
    /// Print conversation history, oldest first
    History {
        /// Conversation to page through
        #[arg(long, short)]
        conversation: String,
        /// Maximum pages to fetch
        #[arg(long, default_value_t = 1)]
        pages: usize,
    },
    /// Show or change configuration
    Config {
        key: Option<String>,
        value: Option<String>,
    },
}

fn init_logging() -> Result<()> {
    let builder_env = env_logger::Env::default().default_filter_or("info");
    let mut builder = env_logger::Builder::from_env(builder_env);
    if let Ok(path) = std::env::var("CHATLINK_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.format_timestamp_secs().init();
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    let mut config = ClientConfig::load()?;
    if let Some(server) = cli.server {
        config.server_url = server;
        config.validate()?;
    }

    match cli.command {
        Commands::Config { key, value } => run_config(config, key, value),
        command => {
            let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
            runtime.block_on(run_session_command(config, command))
        }
    }
}

async fn run_session_command(config: ClientConfig, command: Commands) -> Result<()> {
    let session = MessagingSession::from_config(config)?;
    let result = match command {
        Commands::Send {
            conversation,
            text,
            timeout,
        } => send(&session, &conversation.into(), text.join(" "), timeout).await,
        Commands::Listen {
            conversation,
            telemetry,
        } => listen(&session, conversation.map(ConversationId::from).as_ref(), telemetry).await,
        Commands::History {
            conversation,
            pages,
        } => history(&session, &conversation.into(), pages).await,
        Commands::Config { .. } => Ok(()),
    };
    session.close();
    session.closed().await;
    result
}

async fn send(
    session: &MessagingSession,
    conversation: &ConversationId,
    text: String,
    timeout: u64,
) -> Result<()> {
    let mut events = session.subscribe_dispatch();
    session.connect()?;
    let outbound = session.send_text(conversation, text)?;
    log::info!("Queued {} in {conversation}", outbound.temp_id);

    let wait = async {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => anyhow::bail!("Interrupted"),
                event = events.recv() => match event {
                    Ok(DispatchEvent::Acknowledged { temp_id, message_id, .. })
                        if temp_id == outbound.temp_id =>
                    {
                        return Ok(message_id);
                    }
                    Ok(DispatchEvent::Failed { temp_id, error, code, .. })
                        if temp_id == outbound.temp_id =>
                    {
                        anyhow::bail!("Delivery failed ({code:?}): {error}");
                    }
                    Ok(DispatchEvent::AttemptFailed { temp_id, error, code, retry_in, .. })
                        if temp_id == outbound.temp_id =>
                    {
                        println!("Attempt failed ({code:?}: {error}), retrying in {retry_in:?}");
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => log::warn!("Missed {n} dispatch events"),
                    Err(RecvError::Closed) => anyhow::bail!("Session closed before acknowledgement"),
                },
            }
        }
    };

    let message_id = tokio::time::timeout(Duration::from_secs(timeout), wait)
        .await
        .with_context(|| format!("No acknowledgement within {timeout}s"))??;
    println!("Sent {} as {message_id}", outbound.temp_id);
    Ok(())
}

async fn listen(
    session: &MessagingSession,
    conversation: Option<&ConversationId>,
    show_telemetry: bool,
) -> Result<()> {
    let mut events = session.subscribe_domain();
    let mut states = session.watch_connection();
    session.connect()?;
    println!("Listening (Ctrl-C to stop)...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = states.borrow_and_update().clone();
                println!("[connection] {:?}", snapshot.state);
                if snapshot.state.is_closed() {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if conversation.is_some_and(|c| c != event.conversation_id()) {
                        continue;
                    }
                    print_event(&event);
                }
                Err(RecvError::Lagged(n)) => log::warn!("Missed {n} events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    if show_telemetry {
        if let Some(snapshot) = session.telemetry_snapshot(false) {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }
    Ok(())
}

fn print_event(event: &DomainEvent) {
    match event {
        DomainEvent::MessageAppended(message) => println!(
            "[{}] {} {:?}: {}",
            message.conversation_id, message.id, message.sender_type, message.content
        ),
        DomainEvent::ConversationCreated(summary) => println!("[{}] created", summary.id),
        DomainEvent::ConversationUpdated(summary) => println!(
            "[{}] updated (unread {})",
            summary.id, summary.unread_count
        ),
        DomainEvent::MessageRead {
            conversation_id,
            message_id,
            ..
        } => println!("[{conversation_id}] {message_id} read"),
        DomainEvent::Typing {
            conversation_id,
            sender_type,
            is_typing,
        } => println!("[{conversation_id}] {sender_type:?} typing={is_typing}"),
    }
}

async fn history(
    session: &MessagingSession,
    conversation: &ConversationId,
    pages: usize,
) -> Result<()> {
    let loader = session.history(conversation)?;
    for _ in 0..pages {
        match loader.load_older().await? {
            LoadOutcome::Loaded { fetched, .. } => log::debug!("Fetched {fetched} message(s)"),
            LoadOutcome::Exhausted | LoadOutcome::Busy => break,
        }
    }
    for record in session.messages(conversation) {
        println!("{}", serde_json::to_string(&record)?);
    }
    if loader.state().exhausted {
        println!("(start of conversation)");
    }
    Ok(())
}

fn run_config(mut config: ClientConfig, key: Option<String>, value: Option<String>) -> Result<()> {
    let mut fields = serde_json::to_value(&config)?;
    match (key, value) {
        (None, _) => println!("{}", serde_json::to_string_pretty(&fields)?),
        (Some(key), None) => {
            let field = fields
                .get(&key)
                .with_context(|| format!("Unknown config key: {key}"))?;
            println!("{field}");
        }
        (Some(key), Some(value)) => {
            let slot = fields
                .get_mut(&key)
                .with_context(|| format!("Unknown config key: {key}"))?;
            *slot = serde_json::from_str(&value)
                .unwrap_or(serde_json::Value::String(value));
            let token = config.token.take();
            config = serde_json::from_value(fields)
                .with_context(|| format!("Invalid value for {key}"))?;
            config.token = token;
            config.validate()?;
            let path = config.save()?;
            println!("Saved {key} to {}", path.display());
        }
    }
    Ok(())
}
