//! orcaforge Admin CLI
//!
//! Operator CLI for inspecting and cancelling tasks against a running
//! `server` instance, implementing the exit-code contract from spec.md §6:
//! `0` success, `1` invalid arguments, `2` backend unreachable, `3` task not
//! found, `4` operation rejected.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::error;

const EXIT_SUCCESS: i32 = 0;
const EXIT_INVALID_ARGS: i32 = 1;
const EXIT_UNREACHABLE: i32 = 2;
const EXIT_NOT_FOUND: i32 = 3;
const EXIT_REJECTED: i32 = 4;

#[derive(Parser)]
#[command(name = "orcaforge-admin")]
#[command(about = "orcaforge Admin CLI - inspect and manage in-flight tasks")]
#[command(version = "1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Base URL of the running orcaforge server
    #[arg(long, env = "ORCAFORGE_ADMIN_URL", default_value = "http://localhost:8080")]
    server_url: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the status snapshot for a task
    Status {
        /// Task ID to look up
        task_id: String,
    },

    /// Cancel a task (idempotent; cancelling a completed task still exits 0)
    Cancel {
        /// Task ID to cancel
        task_id: String,
    },
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    phase: String,
    progress: f64,
    #[serde(default)]
    degraded: bool,
    #[serde(default)]
    quarantined: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorDocument {
    code: String,
    message: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let task_id = match &cli.command {
        Commands::Status { task_id } | Commands::Cancel { task_id } => task_id,
    };
    if uuid::Uuid::parse_str(task_id).is_err() {
        error!("invalid task id, expected a UUID: {task_id}");
        std::process::exit(EXIT_INVALID_ARGS);
    }

    let client = reqwest::Client::new();

    let exit_code = match cli.command {
        Commands::Status { task_id } => status(&client, &cli.server_url, &task_id).await,
        Commands::Cancel { task_id } => cancel(&client, &cli.server_url, &task_id).await,
    };

    std::process::exit(exit_code);
}

async fn status(client: &reqwest::Client, server_url: &str, task_id: &str) -> i32 {
    let url = format!("{server_url}/tasks/{task_id}");
    let response = match client.get(&url).send().await {
        Ok(response) => response,
        Err(e) => {
            error!("could not reach orcaforge server at {server_url}: {e}");
            return EXIT_UNREACHABLE;
        }
    };
    handle_status_response(response).await
}

async fn cancel(client: &reqwest::Client, server_url: &str, task_id: &str) -> i32 {
    let url = format!("{server_url}/tasks/{task_id}/cancel");
    let response = match client.post(&url).send().await {
        Ok(response) => response,
        Err(e) => {
            error!("could not reach orcaforge server at {server_url}: {e}");
            return EXIT_UNREACHABLE;
        }
    };
    handle_status_response(response).await
}

async fn handle_status_response(response: reqwest::Response) -> i32 {
    let status_code = response.status();
    if status_code.is_success() {
        match response.json::<StatusResponse>().await {
            Ok(snapshot) => {
                println!("phase:    {}", snapshot.phase);
                println!("status:   {}", snapshot.status);
                println!("progress: {:.0}%", snapshot.progress * 100.0);
                if snapshot.degraded {
                    println!("degraded: checkpoint write failed; not retried automatically");
                }
                if snapshot.quarantined {
                    println!("quarantined: corrupt checkpoint; will not auto-retry");
                }
                EXIT_SUCCESS
            }
            Err(e) => {
                error!("received an unparseable response body: {e}");
                EXIT_REJECTED
            }
        }
    } else {
        let document = response.json::<ErrorDocument>().await.ok();
        let message = document
            .as_ref()
            .map(|d| d.message.clone())
            .unwrap_or_else(|| status_code.to_string());
        match document.as_ref().map(|d| d.code.as_str()) {
            Some("not_found") => {
                error!("{message}");
                EXIT_NOT_FOUND
            }
            Some("invalid_input") => {
                error!("{message}");
                EXIT_INVALID_ARGS
            }
            _ => {
                error!("{message}");
                EXIT_REJECTED
            }
        }
    }
}
