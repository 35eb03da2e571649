mod render;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use studygroup::backend::memory::MemoryBackend;
use studygroup::backend::{DataAccess, Row};
use studygroup::chat::compose::ComposeState;
use studygroup::config::ConfigError;
use studygroup::model::AuthUser;
use studygroup::{BackendConfig, BackendError, ChatConfig, ChatDeps, ChatMessage, ChatSession, LoadError, Notice, SendError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use render::{Printer, format_notice};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("{0}")]
    Load(#[from] LoadError),
    #[error("{0}")]
    Send(#[from] SendError),
    #[error("io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "studygroup-cli", about = "Study group chat client")]
struct Cli {
    /// Project URL, e.g. https://xyz.supabase.co
    #[arg(long, env = "SUPABASE_URL")]
    url: Option<String>,

    #[arg(long, env = "SUPABASE_ANON_KEY")]
    anon_key: Option<String>,

    /// User JWT; without it the client is signed out and cannot send.
    #[arg(long, env = "SUPABASE_ACCESS_TOKEN")]
    access_token: Option<String>,

    /// Print messages as JSON lines.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a group's message history.
    History { group_id: String },
    /// Send one message and print it once stored.
    Send {
        group_id: String,
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Print history, then follow new messages until Ctrl-C.
    Tail { group_id: String },
    /// Interactive chat: each stdin line is sent, new messages are printed.
    Chat { group_id: String },
    /// Run a chat against the in-memory backend with a simulated peer.
    Demo {
        #[arg(long, default_value_t = 3)]
        peer_messages: usize,
        #[arg(long, default_value_t = 300)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    match dotenvy::dotenv() {
        Ok(path) => debug!(path = %path.display(), "loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => warn!(error = %e, "ignoring unreadable .env"),
    }

    let cli = Cli::parse();
    let chat = ChatConfig::from_env()?;
    let mut printer = Printer::new(cli.json);

    match cli.command {
        Command::Demo { peer_messages, interval_ms } => {
            run_demo(chat, &mut printer, peer_messages, Duration::from_millis(interval_ms)).await
        }
        Command::History { ref group_id } => {
            let session = connect(&cli, group_id, chat).await?;
            let result = run_history(&session, &mut printer).await;
            session.teardown().await;
            result
        }
        Command::Send { ref group_id, ref text } => {
            let session = connect(&cli, group_id, chat).await?;
            let result = run_send(&session, &mut printer, &text.join(" ")).await;
            session.teardown().await;
            result
        }
        Command::Tail { ref group_id } => {
            let session = connect(&cli, group_id, chat).await?;
            let result = run_tail(&session, &mut printer).await;
            session.teardown().await;
            result
        }
        Command::Chat { ref group_id } => {
            let session = connect(&cli, group_id, chat).await?;
            let result = run_chat(&session, &mut printer).await;
            session.teardown().await;
            result
        }
    }
}

fn backend_config(cli: &Cli) -> Result<BackendConfig, ConfigError> {
    BackendConfig::from_lookup(|key| match key {
        "SUPABASE_URL" => cli.url.clone(),
        "SUPABASE_ANON_KEY" => cli.anon_key.clone(),
        "SUPABASE_ACCESS_TOKEN" => cli.access_token.clone(),
        other => std::env::var(other).ok(),
    })
}

async fn connect(cli: &Cli, group_id: &str, chat: ChatConfig) -> Result<ChatSession, CliError> {
    let backend = backend_config(cli)?;
    let deps = ChatDeps::hosted(&backend, &chat)?;
    Ok(ChatSession::open(group_id, deps, chat).await?)
}

// =============================================================================
// COMMANDS
// =============================================================================

async fn run_history(session: &ChatSession, printer: &mut Printer) -> Result<(), CliError> {
    let messages = load(session).await?;
    print_lines(printer.pending_lines(&messages)?);
    Ok(())
}

async fn run_send(session: &ChatSession, printer: &mut Printer, text: &str) -> Result<(), CliError> {
    match session.send_message(text).await {
        Ok(sent) => {
            print_lines(printer.pending_lines(std::slice::from_ref(&sent))?);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", format_notice(&Notice::from(&e)));
            Err(e.into())
        }
    }
}

async fn run_tail(session: &ChatSession, printer: &mut Printer) -> Result<(), CliError> {
    let mut changes = session.watch();
    let messages = load(session).await?;
    print_lines(printer.pending_lines(&messages)?);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                print_lines(printer.pending_lines(&session.messages().await)?);
            }
        }
    }
    Ok(())
}

async fn run_chat(session: &ChatSession, printer: &mut Printer) -> Result<(), CliError> {
    let mut changes = session.watch();
    let messages = load(session).await?;
    print_lines(printer.pending_lines(&messages)?);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut compose = ComposeState::new();
    // Sends run off the loop so Ctrl-C and incoming messages stay live.
    let (sent_tx, mut sent_rx) = mpsc::channel::<Result<ChatMessage, SendError>>(1);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line(), if !compose.is_sending() => {
                let Some(line) = line? else {
                    break;
                };
                compose.set_draft(line);
                if let Some(text) = compose.begin_send() {
                    spawn_send(session, text, sent_tx.clone());
                }
                print_lines(printer.pending_lines(&session.messages().await)?);
            }
            Some(result) = sent_rx.recv() => {
                compose.finish(&result);
                if let Err(e) = &result {
                    eprintln!("{}", format_notice(&Notice::from(e)));
                }
                print_lines(printer.pending_lines(&session.messages().await)?);
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                print_lines(printer.pending_lines(&session.messages().await)?);
            }
        }
    }
    Ok(())
}

async fn run_demo(chat: ChatConfig, printer: &mut Printer, peer_messages: usize, interval: Duration) -> Result<(), CliError> {
    const GROUP: &str = "demo-group";

    let backend = Arc::new(MemoryBackend::new());
    backend
        .set_current_user(Some(AuthUser {
            id: "demo-you".into(),
            email: Some("you@example.com".into()),
            full_name: Some("Demo You".into()),
        }))
        .await;
    backend
        .seed(
            &chat.members_table,
            vec![row(json!({"group_id": GROUP, "user_id": "demo-you", "is_admin": true}))],
        )
        .await;
    backend
        .seed(
            &chat.users_table,
            vec![
                row(json!({"id": "demo-you", "email": "you@example.com", "username": "you"})),
                row(json!({"id": "demo-peer", "email": "peer@example.com", "username": "peer"})),
            ],
        )
        .await;
    backend
        .seed(
            &chat.messages_table,
            vec![row(json!({
                "id": "welcome",
                "group_id": GROUP,
                "user_id": "demo-peer",
                "content": "Welcome to the study group!",
                "created_at": "2024-01-01T09:00:00Z",
            }))],
        )
        .await;

    let deps = ChatDeps::in_memory(&backend, &chat);
    let table = chat.messages_table.clone();
    let session = ChatSession::open(GROUP, deps, chat).await?;
    let mut changes = session.watch();
    print_lines(printer.pending_lines(&load(&session).await?)?);

    let mut peer = tokio::spawn({
        let backend = Arc::clone(&backend);
        async move {
            for n in 1..=peer_messages {
                tokio::time::sleep(interval).await;
                let message = row(json!({"group_id": GROUP, "user_id": "demo-peer", "content": format!("peer note #{n}")}));
                if let Err(e) = backend.insert(&table, message).await {
                    warn!(error = %e, "peer insert failed");
                }
            }
        }
    });

    for text in ["Hi all, ready for the quiz?", "   "] {
        if let Err(e) = session.send_message(text).await {
            eprintln!("{}", format_notice(&Notice::from(&e)));
        }
        print_lines(printer.pending_lines(&session.messages().await)?);
    }

    backend.fail_next_insert("simulated outage").await;
    if let Err(e) = session.send_message("this one fails").await {
        eprintln!("{}", format_notice(&Notice::from(&e)));
    }

    loop {
        tokio::select! {
            joined = &mut peer => {
                if let Err(e) = joined {
                    warn!(error = %e, "peer task failed");
                }
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                print_lines(printer.pending_lines(&session.messages().await)?);
            }
        }
    }
    print_lines(printer.pending_lines(&session.messages().await)?);

    info!(messages = session.messages().await.len(), "demo finished");
    session.teardown().await;
    Ok(())
}

// =============================================================================
// HELPERS
// =============================================================================

/// Send in the background; the outcome arrives on `sent`.
fn spawn_send(session: &ChatSession, text: String, sent: mpsc::Sender<Result<ChatMessage, SendError>>) {
    let session = session.clone();
    tokio::spawn(async move {
        let result = session.send_message(&text).await;
        if sent.send(result).await.is_err() {
            debug!("chat view closed before the send finished");
        }
    });
}

async fn load(session: &ChatSession) -> Result<Vec<ChatMessage>, CliError> {
    match session.load_initial().await {
        Ok(messages) => Ok(messages),
        Err(e) => {
            eprintln!("{}", format_notice(&Notice::from(&e)));
            Err(e.into())
        }
    }
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{line}");
    }
}

fn row(value: serde_json::Value) -> Row {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Row::new(),
    }
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
