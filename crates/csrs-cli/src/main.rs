use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "csrs-sync")]
#[command(about = "Copies organisation and grade display names into the reporting fact table")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load, format and write both display columns.
    Sync,
    /// Load and format names without touching the reporting store.
    Preview,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "csrs_sync=info,csrs_storage=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = csrs_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} grades={} grade_rows={} organisations={} organisation_rows={} dangling={}",
                summary.run_id,
                summary.grades_loaded,
                summary.grade_rows_updated,
                summary.organisations_loaded,
                summary.organisation_rows_updated,
                summary.dangling_references.len()
            );
        }
        Commands::Preview => {
            let preview = csrs_sync::preview_from_env().await?;
            for (id, name) in &preview.grade_names {
                println!("grade\t{id}\t{name}");
            }
            for (id, name) in &preview.organisation_names {
                println!("organisation\t{id}\t{name}");
            }
        }
    }

    Ok(())
}
