//! # Knowledge Base CLI (`kb`)
//!
//! Ask questions about a directory of documents, from the terminal or over
//! HTTP.
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb sync` | Scan the knowledge directory and ingest changed files |
//! | `kb files` | List files in the knowledge directory |
//! | `kb ask "<question>"` | Answer one question (`--stream` to print tokens as they arrive) |
//! | `kb chat` | Interactive conversation (`history`, `clear`, `exit`) |
//! | `kb history <session>` | Show a session's history from a running server |
//! | `kb serve` | Start the HTTP server |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use kb_harness::config::{self, Config};
use kb_harness::models::{format_sources, Message, Role, StreamEvent};
use kb_harness::server;
use kb_harness::service::{KnowledgeBase, SyncReport};

const DEFAULT_CONFIG: &str = "./kb.toml";

/// Knowledge base: grounded question answering over a local document folder.
#[derive(Parser)]
#[command(name = "kb", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// When the default path does not exist, built-in defaults are used.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the knowledge directory and ingest new, changed and deleted files.
    Sync,

    /// List supported files in the knowledge directory.
    Files,

    /// Answer a single question.
    Ask {
        question: String,

        /// Session whose history provides conversational context.
        #[arg(long, default_value = "cli")]
        session: String,

        /// Print the answer incrementally.
        #[arg(long)]
        stream: bool,
    },

    /// Start an interactive conversation.
    Chat {
        #[arg(long, default_value = "cli")]
        session: String,
    },

    /// Print the history of a session held by a running server.
    History {
        session: String,

        /// Server base URL (defaults to `http://<server.bind>`).
        #[arg(long)]
        server: Option<String>,
    },

    /// Start the HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let cfg = load(&cli.config)?;

    match cli.command {
        Commands::Sync => {
            let kb = KnowledgeBase::from_config(cfg)?;
            let report = kb.sync().await?;
            print_report(&report);
        }
        Commands::Files => {
            let kb = KnowledgeBase::from_config(cfg)?;
            let files = kb.list_files()?;
            if files.is_empty() {
                println!("No files in {}", kb.config().paths.knowledge_dir.display());
            }
            for f in files {
                println!("{:>10.2} KB  {:<5} {}", f.size_kb, f.file_type, f.name);
            }
        }
        Commands::Ask {
            question,
            session,
            stream,
        } => {
            let kb = start(cfg).await?;
            ask(&kb, &question, &session, stream).await?;
        }
        Commands::Chat { session } => {
            let kb = start(cfg).await?;
            chat(&kb, &session).await?;
        }
        Commands::History { session, server } => {
            let base = server.unwrap_or_else(|| format!("http://{}", cfg.server.bind));
            remote_history(&base, &session).await?;
        }
        Commands::Serve => {
            let kb = start(cfg).await?;
            server::run_server(Arc::new(kb)).await?;
        }
    }

    Ok(())
}

fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG) {
        return Ok(Config::minimal());
    }
    config::load_config(path)
}

/// Build the knowledge base and run the startup ingestion.
async fn start(cfg: Config) -> anyhow::Result<KnowledgeBase> {
    let kb = KnowledgeBase::from_config(cfg)?;
    let report = kb.initialize().await?;
    if report.changed > 0 || report.removed > 0 {
        print_report(&report);
    }
    Ok(kb)
}

fn print_report(report: &SyncReport) {
    println!("Sync complete");
    println!("  files changed:   {}", report.changed);
    println!("  files removed:   {}", report.removed);
    println!("  files ingested:  {}", report.ingested);
    println!("  chunks stored:   {}", report.chunks);
    if !report.failed.is_empty() {
        println!("  failed (will retry on next sync):");
        for f in &report.failed {
            println!("    {}", f);
        }
    }
}

async fn ask(kb: &KnowledgeBase, question: &str, session: &str, stream: bool) -> anyhow::Result<()> {
    if !stream {
        let answer = kb.query(question, session).await?;
        println!("{}", answer.answer);
        if !answer.sources.is_empty() {
            println!("\nSources:\n{}", format_sources(&answer.sources));
        }
        return Ok(());
    }

    let mut events = kb.stream_query(question, session).await?;
    let mut sources = Vec::new();
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        match event? {
            StreamEvent::Sources { sources: s } => sources = s,
            StreamEvent::Token { token } => {
                print!("{}", token);
                stdout.flush()?;
            }
            StreamEvent::End => {
                println!();
                if !sources.is_empty() {
                    println!("\nSources:\n{}", format_sources(&sources));
                }
                return Ok(());
            }
        }
    }
    anyhow::bail!("answer stream ended unexpectedly")
}

async fn chat(kb: &KnowledgeBase, session: &str) -> anyhow::Result<()> {
    println!("Ask a question. Commands: 'history', 'clear', 'exit'.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("\n> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();

        match input {
            "" => continue,
            "exit" | "quit" => break,
            "history" => print_history(&kb.history(session).await),
            "clear" => {
                kb.clear_history(session).await;
                println!("History cleared.");
            }
            question => {
                if let Err(e) = ask(kb, question, session, true).await {
                    eprintln!("Error: {:#}", e);
                }
            }
        }
    }
    Ok(())
}

fn print_history(history: &[Message]) {
    if history.is_empty() {
        println!("(no history)");
        return;
    }
    println!("=== Conversation history ===");
    for m in history {
        let who = match m.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        println!("{}: {}", who, m.content);
    }
}

async fn remote_history(base: &str, session: &str) -> anyhow::Result<()> {
    let url = format!("{}/api/history/{}", base.trim_end_matches('/'), session);
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach {}", url))?;
    if !response.status().is_success() {
        anyhow::bail!("server returned {}", response.status());
    }
    let body: serde_json::Value = response.json().await?;
    let history: Vec<Message> =
        serde_json::from_value(body.get("history").cloned().unwrap_or_default())?;
    print_history(&history);
    Ok(())
}
