use std::collections::HashMap;

use async_trait::async_trait;
use mongodb::bson::{doc, Document};

use crate::error::StepError;
use crate::migrations::collections::{PROGRAM_BOOKS, PROJECTS};
use crate::migrations::{FailurePolicy, MigrationContext, MigrationStep};

/// Statuses the platform derives on its own; anything else was set by a user.
const DERIVED_STATUSES: [&str; 4] = ["planned", "programmed", "preliminaryOrdered", "postponed"];

/// Recomputes derived project statuses from the project type and the status of
/// the program book the project is attached to.
pub struct RecomputeProjectStatus;

fn expected_status(project: &Document, program_books: &HashMap<String, String>) -> Option<&'static str> {
    let project_type = project.get_str("projectTypeId").ok()?;
    let book_status = project.get_str("programBookId").ok().and_then(|id| program_books.get(id)).map(String::as_str);
    let status = match (project_type, book_status) {
        ("nonIntegrated", _) => "preliminaryOrdered",
        (_, Some("programmed" | "submittedFinal")) => "programmed",
        (_, Some("new" | "opened" | "submittedPreliminary")) => "postponed",
        _ => "planned",
    };
    Some(status)
}

#[async_trait]
impl MigrationStep for RecomputeProjectStatus {
    fn name(&self) -> &'static str {
        "recompute_project_status"
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::BestEffort
    }

    async fn apply(&self, ctx: &MigrationContext<'_>) -> Result<(), StepError> {
        let store = ctx.store();
        let program_books: HashMap<String, String> = store
            .find(PROGRAM_BOOKS, doc! {})
            .await?
            .iter()
            .filter_map(|book| Some((book.get_str("_id").ok()?.to_string(), book.get_str("status").ok()?.to_string())))
            .collect();

        let projects = store.find(PROJECTS, doc! {"status": {"$in": DERIVED_STATUSES.to_vec()}}).await?;
        ctx.info(format!("{} project(s) with a derived status", projects.len()));

        let report = ctx
            .batch()
            .apply(PROJECTS, projects, |project| {
                let expected = expected_status(project, &program_books)?;
                (project.get_str("status").ok() != Some(expected)).then(|| doc! {"$set": {"status": expected}})
            })
            .await;
        let report = ctx.settle(report)?;
        if !report.failures.is_empty() {
            ctx.info(format!("Projects left with their previous status: {}", report.failed_keys().join(", ")));
        }
        Ok(())
    }
}
