mod api;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tablewise_backend::agent::Outcome;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use api::{ApiClient, ConfigureRequest, QueryResponse, DEFAULT_BACKEND_URL};

/// Ask questions about a SQL database in plain language.
#[derive(Parser, Debug)]
#[command(name = "tablewise", version, about)]
struct Cli {
    /// Backend base URL
    #[arg(long, env = "TABLEWISE_BACKEND_URL", default_value = DEFAULT_BACKEND_URL, global = true)]
    backend_url: String,

    /// Bearer token for the backend API
    #[arg(long, env = "TABLEWISE_BACKEND_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    /// Session to talk to (backend default session when omitted)
    #[arg(long, global = true)]
    session: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a database and its table descriptions from a TOML file
    Configure { file: PathBuf },
    /// Ask a single question
    Ask {
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,
    },
    /// List the tables registered for the session
    Tables,
    /// Show the session's conversation memory
    History,
    /// Interactive question loop on stdin
    Chat,
    /// Drop the session on the backend
    Forget,
    /// Follow the backend's agent events
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tablewise=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = ApiClient::new(&cli.backend_url, cli.token.clone());
    tracing::debug!("Backend API: {}", client.base_url());
    if !client.has_token() {
        tracing::warn!(
            "TABLEWISE_BACKEND_TOKEN is unset/empty; requests will fail unless backend auth mode is disabled"
        );
    }

    let session = cli.session.as_deref();
    match cli.command {
        Command::Configure { file } => configure(&client, session, &file).await,
        Command::Ask { question } => {
            let response = client.ask(session, &question.join(" ")).await?;
            print_answer(&response);
            Ok(())
        }
        Command::Tables => {
            let tables = client.tables(session).await?;
            println!(
                "Session '{}' ({}, configured {})",
                tables.session_id,
                tables.dialect,
                tables.configured_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            for table in tables.tables {
                println!("  {}: {}", table.table_name, table.description);
            }
            Ok(())
        }
        Command::History => {
            let session_id = session.unwrap_or(tablewise_backend::session::DEFAULT_SESSION_ID);
            let turns = client.history(session_id).await?;
            if turns.is_empty() {
                println!("(no conversation yet)");
            }
            for turn in turns {
                println!("{}: {}", turn.role.as_str(), turn.content);
            }
            Ok(())
        }
        Command::Chat => chat(&client, session).await,
        Command::Forget => {
            let session_id = session.unwrap_or(tablewise_backend::session::DEFAULT_SESSION_ID);
            client.delete_session(session_id).await?;
            println!("Session '{}' removed", session_id);
            Ok(())
        }
        Command::Watch => {
            client.health().await?;
            client
                .stream_events_forever(|event| println!("{}", event.summary()))
                .await;
            Ok(())
        }
    }
}

async fn configure(
    client: &ApiClient,
    session: Option<&str>,
    file: &std::path::Path,
) -> Result<()> {
    let mut request = ConfigureRequest::load(file)?;
    if let Some(session) = session {
        request.session_id = Some(session.to_string());
    }
    let response = client.configure(&request).await?;
    println!("{} (session '{}')", response.message, response.session_id);
    for table in response.tables {
        println!("  {}", table.table_name);
    }
    Ok(())
}

async fn chat(client: &ApiClient, session: Option<&str>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    println!("Ask a question (\"exit\" to quit).");

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if matches!(question, "exit" | "quit") {
            break;
        }

        match client.ask(session, question).await {
            Ok(response) => print_answer(&response),
            Err(error) => eprintln!("error: {:#}", error),
        }
    }
    Ok(())
}

fn print_answer(response: &QueryResponse) {
    println!("{}", response.answer);
    if let Some(sql) = response.sql_query.as_deref() {
        tracing::debug!("SQL: {}", sql);
    }
    if response.outcome == Outcome::Degraded {
        eprintln!(
            "(no verified answer after {} retr{})",
            response.retry_count,
            if response.retry_count == 1 { "y" } else { "ies" }
        );
    }
}
