use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::Instrument;
use uuid::Uuid;

use schema_migrator::config::{Cli, Commands};
use schema_migrator::migrations::{all_migrations, MigrationRunner, MigrationStatus};
use schema_migrator::store::MongoStore;
use schema_migrator::{logging, telemetry};

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let runner = MigrationRunner::new(all_migrations()?, cli.migration.runner_config());
    let store = MongoStore::connect(&cli.mongodb).await.context("Failed to configure MongoDB client")?;
    store.ping().await.with_context(|| format!("MongoDB at {} is unreachable", cli.mongodb.uri))?;

    let target = cli.migration.target_version;
    match cli.command() {
        Commands::Run => {
            let run_id = Uuid::new_v4().to_string();
            let report = runner
                .run_to(&store, target)
                .instrument(telemetry::create_run_span(&run_id, store.database_name()))
                .await?;
            tracing::info!(
                run_id = %run_id,
                from = %report.from,
                to = %report.to,
                applied = report.applied(),
                outcomes = %serde_json::to_string(&report.outcomes)?,
                "Migration run finished"
            );
        }
        Commands::Status => match runner.status_to(&store, target).await? {
            MigrationStatus::UpToDate { current } => println!("Schema is up to date at v{current}"),
            MigrationStatus::Pending { current, target, steps } => {
                println!("Schema at v{current}, {} migration(s) pending up to v{target}:", steps.len());
                for (version, name) in steps {
                    println!("  v{version}  {name}");
                }
            }
            MigrationStatus::AheadOfCatalog { current, latest } => {
                let latest = latest.map_or_else(|| "none".to_string(), |v| format!("v{v}"));
                println!("Schema at v{current} is newer than the latest known migration ({latest})");
            }
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::set_panic_hook();
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init_logging_with_fallback();

    let result = execute(cli).await;
    telemetry::shutdown_tracer();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Migration failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}
