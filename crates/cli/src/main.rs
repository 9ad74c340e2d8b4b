use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use lib::api::{Message, OpenWebUiClient, SendTurn};
use lib::config::{load_config, resolve_api_key, resolve_server_url};
use lib::stream::{start_stream, StreamOptions, StreamRegistry};

#[derive(Parser)]
#[command(name = "skiff")]
#[command(about = "Skiff CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Send one message to a conversation and stream the reply as it is
    /// generated (snapshot polling; no server push required). Ctrl-C stops
    /// the backend task instead of leaving it generating.
    Chat {
        /// Config file path (default: SKIFF_CONFIG_PATH or ~/.skiff/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Conversation id to append to.
        #[arg(long, value_name = "ID")]
        chat: String,

        /// Model name (e.g. "llama3.2:latest").
        #[arg(long, short)]
        model: String,

        /// The message text.
        text: String,
    },

    /// List conversations (pinned and archived included, newest first as
    /// returned by the backend).
    List {
        /// Config file path (default: SKIFF_CONFIG_PATH or ~/.skiff/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Maximum number of conversations to show.
        #[arg(long, short)]
        limit: Option<usize>,
    },

    /// Stop all background generation tasks for a conversation.
    Stop {
        /// Config file path (default: SKIFF_CONFIG_PATH or ~/.skiff/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Conversation id whose tasks should be stopped.
        #[arg(long, value_name = "ID")]
        chat: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("skiff {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Chat {
            config,
            chat,
            model,
            text,
        }) => {
            if let Err(e) = run_chat(config, chat, model, text).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::List { config, limit }) => {
            if let Err(e) = run_list(config, limit).await {
                log::error!("list failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Stop { config, chat }) => {
            if let Err(e) = run_stop(config, chat).await {
                log::error!("stop failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("skiff {} — run with --help for commands", env!("CARGO_PKG_VERSION"));
        }
    }
}

fn make_client(config_path: Option<std::path::PathBuf>) -> Result<(OpenWebUiClient, lib::config::Config)> {
    let (config, path) = load_config(config_path).context("loading config")?;
    log::debug!("using config at {}", path.display());
    let client = OpenWebUiClient::new(resolve_server_url(&config), resolve_api_key(&config));
    Ok((client, config))
}

/// Print deltas until the stream closes or `interrupt` resolves. Returns
/// whether the stream was interrupted mid-flight.
async fn pump_deltas<W: Write>(
    rx: &mut tokio::sync::mpsc::Receiver<String>,
    out: &mut W,
    interrupt: impl std::future::Future<Output = ()>,
) -> Result<bool> {
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    out.write_all(chunk.as_bytes())?;
                    out.flush()?;
                }
                None => return Ok(false),
            },
            _ = &mut interrupt => return Ok(true),
        }
    }
}

async fn run_chat(
    config_path: Option<std::path::PathBuf>,
    chat: String,
    model: String,
    text: String,
) -> Result<()> {
    let (client, config) = make_client(config_path)?;
    let client = Arc::new(client);

    let handle = client
        .send_turn(SendTurn {
            model,
            messages: vec![Message::user(text)],
            conversation_id: Some(chat.clone()),
            ..Default::default()
        })
        .await
        .context("submitting turn")?;
    log::info!(
        "turn accepted: message_id={} task_id={:?}",
        handle.message_id,
        handle.task_id
    );

    let registry = StreamRegistry::default();
    let (stream_id, mut rx) = start_stream(
        client.clone(),
        registry.clone(),
        chat,
        handle.message_id,
        handle.session_id,
        StreamOptions::from(&config.streaming),
        None,
    )
    .await;

    let mut stdout = std::io::stdout();
    let interrupted = pump_deltas(&mut rx, &mut stdout, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    println!();

    if interrupted {
        registry.cancel(&stream_id).await;
        if let Some(task_id) = handle.task_id {
            client
                .stop_task(&task_id)
                .await
                .with_context(|| format!("stopping task {}", task_id))?;
            println!("stopped {}", task_id);
        }
    }
    Ok(())
}

async fn run_list(config_path: Option<std::path::PathBuf>, limit: Option<usize>) -> Result<()> {
    let (client, _config) = make_client(config_path)?;
    let conversations = client
        .fetch_conversation_list(limit)
        .await
        .context("fetching conversation list")?;
    for summary in conversations {
        let mut flags = String::new();
        if summary.pinned {
            flags.push_str(" [pinned]");
        }
        if summary.archived {
            flags.push_str(" [archived]");
        }
        println!("{}  {}{}", summary.id, summary.title, flags);
    }
    Ok(())
}

async fn run_stop(config_path: Option<std::path::PathBuf>, chat: String) -> Result<()> {
    let (client, _config) = make_client(config_path)?;
    let tasks = client
        .list_chat_tasks(&chat)
        .await
        .context("listing chat tasks")?;
    if tasks.is_empty() {
        println!("no running tasks for {}", chat);
        return Ok(());
    }
    for task_id in tasks {
        client
            .stop_task(&task_id)
            .await
            .with_context(|| format!("stopping task {}", task_id))?;
        println!("stopped {}", task_id);
    }
    Ok(())
}
