//! Versioned schema and reference-data migrations for a MongoDB database.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod migrations;
pub mod store;
pub mod telemetry;
pub mod version;

pub use error::{MigrationError, StepError, StoreError, VerificationError};
pub use version::SchemaVersion;
