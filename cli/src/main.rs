use std::fs;
use std::io::{self, Read, Write};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use sudar_chat::net::history::{HttpHistorySource, parse_history};
use sudar_chat::net::transport::SseTransport;
use sudar_chat::state::replay::replay;
use sudar_chat::{
    ChatSession, ClientConfig, ConfigError, Conversation, FlowType, HistoryError, MessageStatus,
    Phase, PhaseState, ProcessedMessage, Role, StreamError, StreamOutcome,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing user id; pass --user-id or set SUDAR_USER_ID")]
    MissingUserId,
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("stream failed: {0}")]
    Stream(#[from] StreamError),
    #[error("history failed: {0}")]
    History(#[from] HistoryError),
    #[error("stream did not complete: {0}")]
    Incomplete(String),
    #[error("output task failed: {0}")]
    Task(String),
    #[error("io failed: {0}")]
    Io(#[from] io::Error),
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "sudar-cli", about = "Sudar agent chat CLI")]
struct Cli {
    /// Agent service base URL; overrides `SUDAR_AGENT_URL`.
    #[arg(long)]
    agent_url: Option<String>,

    /// REST backend base URL; overrides `SUDAR_API_URL`.
    #[arg(long)]
    api_url: Option<String>,

    #[arg(long, env = "SUDAR_USER_ID")]
    user_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a query and stream the answer.
    Send(SendArgs),
    /// Load and print a stored chat.
    History(HistoryArgs),
    /// Replay a saved history document without any network access.
    Replay(ReplayArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FlowArg {
    Worksheet,
    Doubt,
}

impl From<FlowArg> for FlowType {
    fn from(flow: FlowArg) -> Self {
        match flow {
            FlowArg::Worksheet => Self::Worksheet,
            FlowArg::Doubt => Self::DoubtClearance,
        }
    }
}

#[derive(Args, Debug)]
struct SendArgs {
    query: String,

    /// Existing chat to continue; a new chat id is generated when absent.
    #[arg(long, env = "SUDAR_CHAT_ID")]
    chat_id: Option<String>,

    /// Force a flow instead of letting the agent's router decide.
    #[arg(long, value_enum)]
    flow: Option<FlowArg>,
}

#[derive(Args, Debug)]
struct HistoryArgs {
    #[arg(long, env = "SUDAR_CHAT_ID")]
    chat_id: String,

    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    #[arg(long, default_value = "-", help = "History JSON file, or - for stdin")]
    input: String,

    #[arg(long, default_value_t = false)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env()?;
    if let Some(url) = cli.agent_url {
        config.agent_url = url.trim_end_matches('/').to_owned();
    }
    if let Some(url) = cli.api_url {
        config.api_url = url.trim_end_matches('/').to_owned();
    }

    match cli.command {
        Command::Send(args) => run_send(&config, cli.user_id, args).await,
        Command::History(args) => run_history(&config, cli.user_id, args).await,
        Command::Replay(args) => run_replay(&args),
    }
}

fn build_session(config: &ClientConfig, user_id: String, chat_id: &str) -> Result<ChatSession, CliError> {
    let transport = SseTransport::new(config)?;
    let history = HttpHistorySource::new(config)?;
    Ok(ChatSession::new(
        Arc::new(transport),
        Arc::new(history),
        user_id,
        chat_id,
        config.timeouts.idle(),
    ))
}

async fn run_send(config: &ClientConfig, user_id: Option<String>, args: SendArgs) -> Result<(), CliError> {
    let user_id = user_id.ok_or(CliError::MissingUserId)?;
    let chat_id = args.chat_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut session = build_session(config, user_id, &chat_id)?;

    let printer = tokio::spawn(follow(session.subscribe()));
    let cancel = session.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = session.submit_with_flow(&args.query, args.flow.map(FlowType::from)).await;
    let notices = session.take_notices();
    drop(session);
    printer.await.map_err(|e| CliError::Task(e.to_string()))??;
    println!();

    for notice in &notices {
        eprintln!("{}: {}{}", notice.code, notice.message, if notice.retryable { " (retryable)" } else { "" });
    }
    match result? {
        StreamOutcome::Completed => {
            eprintln!("chat {chat_id}: completed");
            Ok(())
        }
        StreamOutcome::Ended => Err(CliError::Incomplete("stream ended before completion".to_owned())),
        StreamOutcome::Cancelled => Err(CliError::Incomplete("cancelled".to_owned())),
        StreamOutcome::TimedOut => Err(CliError::Incomplete("timed out".to_owned())),
        StreamOutcome::Failed(e) => Err(CliError::Stream(e)),
    }
}

/// Print streamed text as it grows, and status lines when they change.
async fn follow(mut rx: watch::Receiver<Conversation>) -> Result<(), io::Error> {
    let mut printed = 0;
    let mut last_status = String::new();
    while rx.changed().await.is_ok() {
        let conv = rx.borrow_and_update().clone();
        let Some(message) = conv.messages().iter().rev().find(|m| m.role == Role::Assistant) else {
            continue;
        };

        let status = message
            .phases
            .as_ref()
            .and_then(|tracker| tracker.active())
            .and_then(PhaseState::current_status);
        if let Some(status) = status {
            if status != last_status {
                eprintln!("\n[{status}]");
                status.clone_into(&mut last_status);
            }
        }

        if let Some(fresh) = message.content.get(printed..) {
            let mut out = io::stdout().lock();
            out.write_all(fresh.as_bytes())?;
            out.flush()?;
            printed = message.content.len();
        }
    }
    Ok(())
}

async fn run_history(config: &ClientConfig, user_id: Option<String>, args: HistoryArgs) -> Result<(), CliError> {
    let user_id = user_id.ok_or(CliError::MissingUserId)?;
    let mut session = build_session(config, user_id, &args.chat_id)?;
    session.load_history().await?;
    print_conversation(&session.snapshot(), args.json)
}

fn run_replay(args: &ReplayArgs) -> Result<(), CliError> {
    let raw = if args.input == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        fs::read_to_string(&args.input)?
    };

    let records = parse_history(serde_json::from_str::<Value>(&raw)?)?;
    let mut conv = Conversation::new("replay");
    conv.replace(replay(&records));
    print_conversation(&conv, args.json)
}

fn print_conversation(conv: &Conversation, json: bool) -> Result<(), CliError> {
    if json {
        println!("{}", serde_json::to_string_pretty(conv.messages())?);
        return Ok(());
    }

    if let Some(title) = conv.title() {
        println!("# {title}");
    }
    for message in conv.messages() {
        println!("{}", summary_line(message, conv.status(message)));
    }
    Ok(())
}

fn summary_line(message: &ProcessedMessage, status: MessageStatus) -> String {
    let role = match message.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    let state = match status {
        MessageStatus::Streaming => "streaming",
        MessageStatus::Complete => "complete",
        MessageStatus::Interrupted => "interrupted",
        MessageStatus::Failed => "failed",
    };
    let phases = message
        .phases
        .as_ref()
        .map(|tracker| {
            tracker
                .seen_phases()
                .into_iter()
                .map(Phase::as_str)
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default();
    let preview: String = message.content.chars().take(80).collect();
    format!("{role:<9} {state:<11} {phases:<28} {}", preview.replace('\n', " "))
}
