use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_stream::StreamExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use cce_core::{ContextManager, EventBus};
use cce_memory::SnapshotStore;
use cce_provider::mock::MockProvider;
use cce_provider::ollama::OllamaProvider;
use cce_provider::{ChatOptions, Provider, StreamEvent};
use cce_schema::{CceConfig, Mode};

#[derive(Parser)]
#[command(name = "ollm-cce", version, about = "Conversation context engine demo CLI")]
struct Cli {
    #[arg(long, default_value = "~/.ollm", help = "Home directory for model profiles, sessions, and snapshots")]
    home: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Local chat REPL backed by the context engine")]
    Chat {
        #[arg(long, default_value = "llama3:8b", help = "Model id, matched against LLM_profiles.json")]
        model: String,
        #[arg(long, value_enum, default_value_t = ModeArg::Assistant)]
        mode: ModeArg,
        #[arg(long, help = "Use a canned mock provider instead of a real Ollama server")]
        mock: bool,
        #[arg(long, default_value = "http://localhost:11434")]
        ollama_url: String,
    },
    #[command(subcommand, about = "Inspect and restore point-in-time snapshots")]
    Snapshots(SnapshotCommands),
}

#[derive(Subcommand)]
enum SnapshotCommands {
    #[command(about = "List snapshot ids for a session, most recent first")]
    List {
        #[arg(help = "Session id")]
        session: String,
    },
    #[command(about = "Print the contents of one snapshot")]
    Show {
        #[arg(help = "Session id")]
        session: String,
        #[arg(help = "Snapshot id")]
        snapshot_id: String,
    },
}

#[derive(Copy, Clone, ValueEnum)]
enum ModeArg {
    Assistant,
    Developer,
    Planning,
    Debugger,
}

impl From<ModeArg> for Mode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Assistant => Mode::Assistant,
            ModeArg::Developer => Mode::Developer,
            ModeArg::Planning => Mode::Planning,
            ModeArg::Debugger => Mode::Debugger,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    if cli.home.starts_with("~") {
        if let Some(home) = dirs::home_dir() {
            cli.home = home.join(cli.home.strip_prefix("~").unwrap_or(&cli.home));
        }
    }

    init_tracing(&cli.home)?;

    match cli.command {
        Commands::Chat { model, mode, mock, ollama_url } => {
            run_chat(cli.home, model, mode.into(), mock, ollama_url).await?;
        }
        Commands::Snapshots(SnapshotCommands::List { session }) => {
            run_snapshot_list(cli.home, session).await?;
        }
        Commands::Snapshots(SnapshotCommands::Show { session, snapshot_id }) => {
            run_snapshot_show(cli.home, session, snapshot_id).await?;
        }
    }

    Ok(())
}

fn init_tracing(home: &std::path::Path) -> Result<()> {
    let log_dir = home.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "cce.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Leaked deliberately: the guard must outlive main, and this process
    // has exactly one logger for its entire lifetime.
    Box::leak(Box::new(guard));

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking))
        .init();
    Ok(())
}

async fn run_chat(home: PathBuf, model: String, mode: Mode, mock: bool, ollama_url: String) -> Result<()> {
    let (provider, provider_name): (Arc<dyn Provider>, &str) = if mock {
        (
            Arc::new(MockProvider::with_reply(
                "This is a mocked reply. Run without --mock to talk to a real Ollama server.",
            )),
            "mock",
        )
    } else {
        (Arc::new(OllamaProvider::with_base(ollama_url, model.clone())?), "ollama")
    };

    let events = Arc::new(EventBus::default());
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            tracing::info!(?event, "context engine event");
        }
    });

    let session_id = Uuid::new_v4().to_string();
    let mut manager = ContextManager::start(
        &home,
        &session_id,
        &model,
        provider_name,
        mode,
        provider.clone(),
        CceConfig::default(),
        events,
    )
    .await?;

    println!("session {session_id}  model={model}  tool_support={}", manager.model_profile().tool_support);
    println!("type 'quit' to exit\n");

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut input = String::new();
        if stdin.read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();
        if input == "quit" || input == "exit" {
            break;
        }
        if input.is_empty() {
            continue;
        }

        manager.append_user_message(input).await?;

        let prompt = manager.build_prompt();
        let options = ChatOptions {
            num_ctx: manager.context().limit,
            think: false,
            ..ChatOptions::default()
        };

        let mut stream = provider.chat_stream(&prompt, &options).await?;
        let mut reply = String::new();
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::TextDelta { text } => {
                    print!("{text}");
                    std::io::stdout().flush()?;
                    reply.push_str(&text);
                }
                StreamEvent::Error { message } => eprintln!("\nprovider error: {message}"),
                StreamEvent::Thinking { .. } | StreamEvent::ToolCall { .. } | StreamEvent::Done { .. } => {}
            }
        }
        println!();

        manager.record_assistant_message(&reply, false).await?;
        tracing::debug!(usage = manager.usage_fraction(), "turn complete");
    }

    Ok(())
}

async fn run_snapshot_list(home: PathBuf, session: String) -> Result<()> {
    let store = SnapshotStore::new(&home, CceConfig::default().snapshot_max_count);
    let ids = store.list(&session).await?;
    if ids.is_empty() {
        println!("no snapshots for session {session}");
        return Ok(());
    }
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

async fn run_snapshot_show(home: PathBuf, session: String, snapshot_id: String) -> Result<()> {
    let store = SnapshotStore::new(&home, CceConfig::default().snapshot_max_count);
    let snapshot = store.restore(&session, &snapshot_id).await?;
    println!("snapshot {snapshot_id}");
    println!("  taken at:        {}", snapshot.timestamp);
    println!("  mode / tier:     {:?} / {}", snapshot.mode, snapshot.tier);
    println!("  token count:     {}", snapshot.token_count);
    println!("  user messages:   {}", snapshot.user_messages.len());
    println!("  other messages:  {}", snapshot.other_messages.len());
    println!("  checkpoints:     {}", snapshot.checkpoints.len());
    Ok(())
}
