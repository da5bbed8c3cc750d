use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};

use crate::error::StepError;
use crate::migrations::collections::{INTERVENTIONS, PROJECTS};
use crate::migrations::{FailurePolicy, MigrationContext, MigrationStep};
use crate::store::WriteOptions;

/// Numeric fields that older clients stored as strings.
const NUMERIC_FIELDS: [(&str, &str); 4] = [
    (INTERVENTIONS, "estimate.allowance"),
    (INTERVENTIONS, "interventionYear"),
    (PROJECTS, "globalBudget.allowance"),
    (PROJECTS, "length.value"),
];

/// Coerces string-typed numeric fields: `""` becomes null, numeric text becomes
/// a double and anything else becomes null.
pub struct NormalizeLegacyNumbers;

fn value_at<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    match path.split_once('.') {
        None => document.get(path),
        Some((head, tail)) => value_at(document.get_document(head).ok()?, tail),
    }
}

/// Integer text keeps an integer type (`Int32`, or `Int64` when it does not fit).
fn normalized(value: &str) -> Bson {
    let value = value.trim();
    if let Ok(integer) = value.parse::<i64>() {
        return i32::try_from(integer).map_or(Bson::Int64(integer), Bson::Int32);
    }
    value.parse::<f64>().ok().filter(|n| n.is_finite()).map_or(Bson::Null, Bson::Double)
}

#[async_trait]
impl MigrationStep for NormalizeLegacyNumbers {
    fn name(&self) -> &'static str {
        "normalize_legacy_numbers"
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Strict
    }

    async fn apply(&self, ctx: &MigrationContext<'_>) -> Result<(), StepError> {
        let store = ctx.store();
        for (collection, field) in NUMERIC_FIELDS {
            let mut empty = Document::new();
            empty.insert(field, "");
            let mut set_null = Document::new();
            set_null.insert(field, Bson::Null);
            let cleared = store
                .update_many(collection, empty.clone(), doc! {"$set": set_null}, WriteOptions::default())
                .await?;

            let mut present = Document::new();
            present.insert(field, doc! {"$exists": true, "$ne": Bson::Null});
            let candidates = store.find(collection, present).await?;
            let report = ctx
                .batch()
                .apply(collection, candidates, |document| match value_at(document, field) {
                    Some(Bson::String(text)) => {
                        let mut set = Document::new();
                        set.insert(field, normalized(text));
                        Some(doc! {"$set": set})
                    }
                    _ => None,
                })
                .await;
            let report = ctx.settle(report)?;
            ctx.info(format!(
                "{collection}.{field}: {} empty string(s) cleared, {} text value(s) converted",
                cleared.modified, report.modified
            ));

            ctx.verifier()
                .assert_none_match(collection, empty, &format!("{collection}.{field} still holds empty strings"))
                .await?;
        }
        Ok(())
    }
}
