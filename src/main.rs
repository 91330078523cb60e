#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::too_many_lines)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use syncmate::config::Config;
use syncmate::observability;
use syncmate::pipeline::{ConversationPipeline, PipelineError};
use syncmate::providers;
use syncmate::security::SanitizationGate;

/// `syncmate` - support chat for health-data sync problems.
#[derive(Parser, Debug)]
#[command(name = "syncmate")]
#[command(version)]
#[command(about = "Privacy-filtered, rate-limited, breaker-guarded support chat.", long_about = None)]
struct Cli {
    /// Use this config file instead of ~/.syncmate/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run text through the privacy filter and print the result as JSON
    Sanitize {
        /// Text to check
        text: String,
    },

    /// Chat through the full pipeline
    Chat {
        /// Single message mode (don't enter interactive mode)
        #[arg(short, long)]
        message: Option<String>,

        /// Session to continue; a new one is created when omitted
        #[arg(short, long)]
        session: Option<String>,

        /// User the calls are charged to
        #[arg(short, long, default_value = "local")]
        user: String,
    },

    /// Print the effective configuration with secrets masked
    Config,

    /// Show pipeline, breaker, usage and session status
    Status,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load_or_init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("Warning: {e}");
    }

    match cli.command {
        Commands::Sanitize { text } => {
            let result = SanitizationGate::new().check(&text);
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config.masked_json()?)?);
            Ok(())
        }
        Commands::Status => {
            let llm = providers::create_client(&config.provider)?;
            let pipeline = ConversationPipeline::from_config(&config, llm)?;
            let status = pipeline.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Chat {
            message,
            session,
            user,
        } => run_chat(&config, message, session, user).await,
    }
}

async fn run_chat(
    config: &Config,
    message: Option<String>,
    session: Option<String>,
    user: String,
) -> Result<()> {
    let llm = providers::create_client(&config.provider)?;
    if let Err(e) = llm.warmup().await {
        warn!("Provider warmup failed: {e}");
    }

    let pipeline = ConversationPipeline::from_config(config, llm)?;
    let reaper = pipeline
        .sessions()
        .spawn_reaper(config.session.reap_interval());
    let session_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!(%session_id, %user, "Chat session started");

    if let Some(text) = message {
        print_turn(&pipeline, &session_id, &user, &text).await;
        reaper.abort();
        pipeline.flush();
        return Ok(());
    }

    println!("syncmate: session {session_id}. Type a message, or /quit to exit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" || text == "/exit" {
            break;
        }
        print_turn(&pipeline, &session_id, &user, text).await;
    }

    reaper.abort();
    pipeline.flush();
    Ok(())
}

async fn print_turn(pipeline: &ConversationPipeline, session_id: &str, user: &str, text: &str) {
    match pipeline.send(session_id, user, text).await {
        Ok(reply) => {
            if reply.is_fallback {
                println!("(offline) {}", reply.content);
            } else {
                println!("{}", reply.content);
            }
        }
        Err(PipelineError::SanitizationBlocked { entities }) => {
            let kinds: Vec<&str> = entities.iter().map(|e| e.as_str()).collect();
            eprintln!(
                "Not sent: please remove personal details ({}) and try again.",
                kinds.join(", ")
            );
        }
        Err(e) => {
            eprintln!("Not sent: {e}");
        }
    }
}
