use thiserror::Error;

use crate::version::SchemaVersion;

/// Errors raised by a [`crate::store::DocumentStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("BSON serialization error: {0}")]
    BsonSerialization(#[from] mongodb::bson::ser::Error),

    #[error("BSON deserialization error: {0}")]
    BsonDeserialization(#[from] mongodb::bson::de::Error),

    #[error("Unsupported operator '{0}'")]
    UnsupportedOperator(String),

    #[error("Invalid filter document: {0}")]
    InvalidFilter(String),

    #[error("Invalid update document: {0}")]
    InvalidUpdate(String),

    #[error("Duplicate key on index '{index}' in collection '{collection}'")]
    DuplicateKey { collection: String, index: String },

    #[error("Collection '{0}' not found")]
    CollectionNotFound(String),

    #[error("Collection '{0}' already exists")]
    CollectionExists(String),

    #[error("Refusing unscoped delete on collection '{0}'")]
    UnscopedDelete(String),
}

/// Raised by [`crate::migrations::verify::ConsistencyVerifier`] when documents still
/// match a filter that a step expected to have emptied.
#[derive(Debug, Error)]
#[error("{count} document(s) in '{collection}' still match: {message}")]
pub struct VerificationError {
    pub collection: String,
    pub count: u64,
    pub message: String,
}

/// Errors a single migration step can return from `apply`.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error("{failed} of {attempted} batched write(s) on '{collection}' failed")]
    PartialBatch { collection: String, failed: usize, attempted: usize },

    #[error("Unexpected document shape in '{collection}': {message}")]
    UnexpectedShape { collection: String, message: String },

    #[error("Reference entry '{group}/{code}' does not exist")]
    MissingReference { group: String, code: String },
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Migration version {0} is registered more than once")]
    DuplicateVersion(SchemaVersion),

    #[error("Invalid schema version '{0}', expected MAJOR.MINOR.PATCH")]
    InvalidVersion(String),

    #[error(
        "Migration '{name}' (v{failed_version}) failed, database left at v{last_applied}: {source}"
    )]
    StepExecution {
        last_applied: SchemaVersion,
        failed_version: SchemaVersion,
        name: String,
        #[source]
        source: StepError,
    },

    #[error(
        "Migration '{name}' (v{failed_version}) ran but was not recorded, database left at v{last_applied}: {source}"
    )]
    MarkerWrite {
        last_applied: SchemaVersion,
        failed_version: SchemaVersion,
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("Stored schema version marker is malformed: {0}")]
    InvalidMarker(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl MigrationError {
    /// The version of the step that halted the run, if any.
    pub fn failed_version(&self) -> Option<SchemaVersion> {
        match self {
            MigrationError::StepExecution { failed_version, .. }
            | MigrationError::MarkerWrite { failed_version, .. } => Some(*failed_version),
            _ => None,
        }
    }
}
