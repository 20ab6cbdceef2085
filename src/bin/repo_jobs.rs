//! Operator CLI for the repository lifecycle queue.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use repo_lifecycle::{config::ConfigLoader, db, runtime::Components};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "repo-jobs")]
#[command(about = "Enqueue repository jobs and inspect their state", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a repository and enqueue a clone
    Clone { uri: String },

    /// Enqueue removal of a repository mirror
    Delete { uri: String },

    /// Show the stored state of a repository
    Status { uri: String },

    /// List dead-lettered jobs, most recent first
    DeadLetters {
        #[arg(long, default_value_t = 20)]
        limit: u64,
    },

    /// Put a dead-lettered job back on the queue
    Requeue { id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    Migrator::up(&db, None)
        .await
        .context("running database migrations")?;

    let lifecycle = Components::from_database(&config, db).lifecycle();

    match cli.command {
        Commands::Clone { uri } => {
            let job_id = lifecycle
                .clone_uri(&uri)
                .await
                .with_context(|| format!("enqueueing clone of {}", uri))?;
            println!("Enqueued clone job {}", job_id);
        }
        Commands::Delete { uri } => {
            let job_id = lifecycle
                .delete_uri(&uri)
                .await
                .with_context(|| format!("enqueueing delete of {}", uri))?;
            println!("Enqueued delete job {}", job_id);
        }
        Commands::Status { uri } => {
            match lifecycle
                .status(&uri)
                .await
                .with_context(|| format!("reading state of {}", uri))?
            {
                Some(state) => {
                    println!("uri:          {}", state.uri());
                    println!("local id:     {}", state.repository.local_id());
                    println!("status:       {}", state.status);
                    println!(
                        "revision:     {}",
                        state.revision.as_deref().unwrap_or("-")
                    );
                    println!(
                        "last updated: {}",
                        state
                            .last_updated_at
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "-".to_string())
                    );
                    if let Some(error) = state.error_info {
                        println!(
                            "error:        [{} / {} attempt {}] {}",
                            error.class, error.job_kind, error.attempt, error.message
                        );
                    }
                }
                None => println!("{} is not tracked", uri),
            }
        }
        Commands::DeadLetters { limit } => {
            let dead_letters = lifecycle
                .dead_letters(limit)
                .await
                .context("listing dead letters")?;
            if dead_letters.is_empty() {
                println!("No dead-lettered jobs");
            }
            for entry in dead_letters {
                println!(
                    "{}  {}  {}  failures={}  at={}  {}",
                    entry.id,
                    entry.record.kind(),
                    entry.record.repository,
                    entry.record.attempt,
                    entry.dead_lettered_at.to_rfc3339(),
                    entry.reason
                );
            }
        }
        Commands::Requeue { id } => {
            let job_id = lifecycle
                .requeue_dead_letter(id)
                .await
                .with_context(|| format!("requeueing dead letter {}", id))?;
            println!("Requeued as job {}", job_id);
        }
    }

    Ok(())
}
