//! Context handed to each migration step.

use super::batch::{BatchReport, BatchUpdateExecutor};
use super::reporter::StepReporter;
use super::verify::ConsistencyVerifier;
use super::FailurePolicy;
use crate::error::StepError;
use crate::store::DocumentStore;
use crate::version::SchemaVersion;

pub struct MigrationContext<'a> {
    store: &'a dyn DocumentStore,
    reporter: StepReporter,
    policy: FailurePolicy,
    chunk_size: usize,
}

impl<'a> MigrationContext<'a> {
    pub fn new(store: &'a dyn DocumentStore, reporter: StepReporter, policy: FailurePolicy, chunk_size: usize) -> Self {
        Self { store, reporter, policy, chunk_size: chunk_size.max(1) }
    }

    pub fn store(&self) -> &'a dyn DocumentStore {
        self.store
    }

    pub fn version(&self) -> SchemaVersion {
        self.reporter.version()
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn reporter(&self) -> &StepReporter {
        &self.reporter
    }

    pub fn info(&self, message: impl Into<String>) {
        self.reporter.info(message);
    }

    pub fn batch(&self) -> BatchUpdateExecutor<'a> {
        BatchUpdateExecutor::new(self.store, self.reporter.clone(), self.chunk_size)
    }

    pub fn verifier(&self) -> ConsistencyVerifier<'a> {
        ConsistencyVerifier::new(self.store, self.reporter.clone())
    }

    /// Applies the step's failure policy to a finished batch.
    ///
    /// Under [`FailurePolicy::Strict`] any failed write fails the step; under
    /// [`FailurePolicy::BestEffort`] the failures have already been logged and the
    /// report is handed back for the step to inspect.
    pub fn settle(&self, report: BatchReport) -> Result<BatchReport, StepError> {
        if report.failures.is_empty() {
            return Ok(report);
        }
        match self.policy {
            FailurePolicy::Strict => Err(StepError::PartialBatch {
                collection: report.collection,
                failed: report.failures.len(),
                attempted: report.attempted,
            }),
            FailurePolicy::BestEffort => {
                self.reporter.info(format!(
                    "Accepting {} failed write(s) on '{}' (best-effort step)",
                    report.failures.len(),
                    report.collection
                ));
                Ok(report)
            }
        }
    }
}
