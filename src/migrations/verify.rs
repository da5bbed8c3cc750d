use mongodb::bson::Document;

use super::reporter::StepReporter;
use crate::error::{StepError, VerificationError};
use crate::store::DocumentStore;

/// Post-condition checks run by steps after their writes.
pub struct ConsistencyVerifier<'a> {
    store: &'a dyn DocumentStore,
    reporter: StepReporter,
}

impl<'a> ConsistencyVerifier<'a> {
    pub fn new(store: &'a dyn DocumentStore, reporter: StepReporter) -> Self {
        Self { store, reporter }
    }

    /// Fails when at least one document of `collection` matches `filter`.
    pub async fn assert_none_match(&self, collection: &str, filter: Document, message: &str) -> Result<(), StepError> {
        let count = self.store.count(collection, filter).await?;
        if count == 0 {
            return Ok(());
        }
        let error = VerificationError { collection: collection.to_string(), count, message: message.to_string() };
        self.reporter.error(error.to_string());
        Err(error.into())
    }
}
