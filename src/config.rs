//! Command-line and environment configuration.
//!
//! Every flag can also be supplied through the environment (a `.env` file is loaded
//! first), which is how the migrator is configured in deployment jobs.

use clap::{Args, Parser, Subcommand};

use crate::migrations::runner::RunnerConfig;
use crate::version::SchemaVersion;

#[derive(Parser, Debug)]
#[command(
    name = "schema-migrator",
    about = "Applies versioned schema and reference-data migrations to the document store",
    after_help = "Examples:\n  \
    schema-migrator run\n  \
    schema-migrator status\n  \
    MIGRATION_TARGET_VERSION=1.0.14 schema-migrator run"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[clap(flatten)]
    pub mongodb: MongoArgs,

    #[clap(flatten)]
    pub migration: MigrationArgs,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Apply every pending migration (default)
    Run,
    /// Print the stored schema version and the pending migrations without applying them
    Status,
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.unwrap_or(Commands::Run)
    }
}

#[derive(Args, Debug, Clone)]
pub struct MongoArgs {
    /// MongoDB connection string
    #[arg(long = "mongodb-uri", env = "MONGODB_URI", default_value = "mongodb://mongo:27017")]
    pub uri: String,

    /// Database the migrations are applied to
    #[arg(long = "mongodb-database", env = "MONGODB_DATABASE", default_value = "agir")]
    pub database: String,

    #[arg(long = "mongodb-max-pool-size", env = "MONGODB_MAX_POOL_SIZE", default_value_t = 20)]
    pub max_pool_size: u32,

    #[arg(long = "mongodb-min-pool-size", env = "MONGODB_MIN_POOL_SIZE", default_value_t = 0)]
    pub min_pool_size: u32,

    #[arg(long = "mongodb-max-idle-time-ms", env = "MONGODB_MAX_IDLE_TIME_MS", default_value_t = 300_000)]
    pub max_idle_time_ms: u64,

    #[arg(long = "mongodb-connect-timeout-ms", env = "MONGODB_CONNECT_TIMEOUT_MS", default_value_t = 10_000)]
    pub connect_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct MigrationArgs {
    /// Maximum number of concurrent writes inside one batch chunk
    #[arg(
        long = "chunk-size",
        env = "MIGRATION_CHUNK_SIZE",
        default_value_t = 10,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub chunk_size: u16,

    /// Stop after this version instead of applying everything registered
    #[arg(long = "target-version", env = "MIGRATION_TARGET_VERSION")]
    pub target_version: Option<SchemaVersion>,

    /// Collection holding the single schema version marker document
    #[arg(long = "version-collection", env = "SCHEMA_VERSION_COLLECTION", default_value = "schemaVersion")]
    pub version_collection: String,

    /// Collection receiving one history record per applied step
    #[arg(long = "history-collection", env = "MIGRATION_HISTORY_COLLECTION", default_value = "migrationHistory")]
    pub history_collection: String,
}

impl MigrationArgs {
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            version_collection: self.version_collection.clone(),
            history_collection: self.history_collection.clone(),
            chunk_size: usize::from(self.chunk_size),
        }
    }
}
