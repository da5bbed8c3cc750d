//! Reference data (taxonomy) helpers shared by the migration steps.

use std::fmt;

use mongodb::bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};

use super::batch::BatchWrite;
use super::collections::{COUNTERS, TAXONOMIES};
use super::context::MigrationContext;
use crate::error::{StepError, StoreError};
use crate::store::{delete_scoped, DocumentStore, UpdateOutcome, WriteOptions};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub fr: String,
    pub en: String,
}

/// A `(group, code)` keyed configuration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceEntry {
    pub group: String,
    pub code: String,
    pub label: Label,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_order: Option<i32>,
}

impl ReferenceEntry {
    pub fn new(group: &str, code: &str, fr: &str, en: &str) -> Self {
        Self {
            group: group.to_string(),
            code: code.to_string(),
            label: Label { fr: fr.to_string(), en: en.to_string() },
            properties: None,
            display_order: None,
        }
    }

    pub fn with_properties(mut self, properties: Document) -> Self {
        self.properties = Some(properties);
        self
    }

    pub fn with_display_order(mut self, display_order: i32) -> Self {
        self.display_order = Some(display_order);
        self
    }

    pub fn key_filter(&self) -> Document {
        entry_filter(&self.group, &self.code)
    }

    pub fn to_document(&self) -> Result<Document, StoreError> {
        Ok(mongodb::bson::to_document(self)?)
    }

    /// Upsert keyed by `(group, code)`. Absent properties or display order leave
    /// the stored values alone.
    pub fn upsert_write(&self) -> BatchWrite {
        let mut set = doc! {"label": {"fr": self.label.fr.as_str(), "en": self.label.en.as_str()}};
        if let Some(properties) = &self.properties {
            set.insert("properties", properties.clone());
        }
        if let Some(display_order) = self.display_order {
            set.insert("displayOrder", display_order);
        }
        BatchWrite::new(format!("{}/{}", self.group, self.code), self.key_filter(), doc! {"$set": set})
            .with_options(WriteOptions::upsert())
    }
}

fn entry_filter(group: &str, code: &str) -> Document {
    doc! {"group": group, "code": code}
}

/// A field of a business collection that stores a reference code.
///
/// `[]` marks an array level, e.g. `interventions[].assets[].typeId` or
/// `assetTypeIds[]` for an array of codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencePath {
    collection: String,
    path: String,
    segments: Vec<String>,
}

impl ReferencePath {
    pub fn new(collection: &str, path: &str) -> Self {
        Self {
            collection: collection.to_string(),
            path: path.to_string(),
            segments: path.split("[]").map(str::to_string).collect(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Dotted path used in queries, relying on implicit array traversal.
    pub fn query_path(&self) -> String {
        self.segments.concat()
    }

    /// Update path with one filtered positional identifier (`$[r0]`, `$[r1]`, ...) per array level.
    pub fn update_path(&self) -> String {
        positional_path(&self.segments)
    }

    /// Array filters restricting every level to the elements that lead to `code`.
    pub fn array_filters(&self, code: &str) -> Vec<Document> {
        level_filters(&self.segments, code)
    }

    pub fn filter(&self, code: &str) -> Document {
        let mut filter = Document::new();
        filter.insert(self.query_path(), code);
        filter
    }

    /// Whether the path ends in an array of codes (`assetTypeIds[]`) rather than a code field.
    pub fn is_code_array(&self) -> bool {
        self.segments.len() > 1 && self.segments.last().is_some_and(|segment| segment.is_empty())
    }

    /// Rewrites `from` to `to` in every document and every matching array element.
    ///
    /// In an array of codes that already holds `to`, `from` is removed instead so
    /// each code stays listed once.
    pub async fn rewrite(&self, store: &dyn DocumentStore, from: &str, to: &str) -> Result<UpdateOutcome, StoreError> {
        let pulled = if self.is_code_array() {
            self.pull_where_present(store, from, to).await?
        } else {
            UpdateOutcome::default()
        };
        let mut set = Document::new();
        set.insert(self.update_path(), to);
        let options = if self.segments.len() > 1 {
            WriteOptions::with_array_filters(self.array_filters(from))
        } else {
            WriteOptions::default()
        };
        let replaced = store.update_many(&self.collection, self.filter(from), doc! {"$set": set}, options).await?;
        Ok(UpdateOutcome {
            matched: pulled.matched + replaced.matched,
            modified: pulled.modified + replaced.modified,
            upserted_id: None,
        })
    }

    /// `$pull`s `from` out of the code arrays that contain both `from` and `to`.
    async fn pull_where_present(
        &self,
        store: &dyn DocumentStore,
        from: &str,
        to: &str,
    ) -> Result<UpdateOutcome, StoreError> {
        let array_segments = &self.segments[..self.segments.len() - 1];
        let both = doc! {"$all": [from, to]};
        let mut query = Document::new();
        query.insert(self.query_path(), both.clone());
        let mut pull = Document::new();
        pull.insert(positional_path(array_segments), from);
        let filters = level_filters(array_segments, both);
        let options =
            if filters.is_empty() { WriteOptions::default() } else { WriteOptions::with_array_filters(filters) };
        store.update_many(&self.collection, query, doc! {"$pull": pull}, options).await
    }
}

fn positional_path(segments: &[String]) -> String {
    let mut path = segments[0].clone();
    for (level, segment) in segments[1..].iter().enumerate() {
        path.push_str(&format!(".$[r{level}]"));
        path.push_str(segment);
    }
    path
}

fn level_filters(segments: &[String], condition: impl Into<Bson> + Clone) -> Vec<Document> {
    (0..segments.len() - 1)
        .map(|level| {
            let mut filter = Document::new();
            filter.insert(format!("r{level}{}", segments[level + 1..].concat()), condition.clone());
            filter
        })
        .collect()
}

impl fmt::Display for ReferencePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.collection, self.path)
    }
}

/// A reference code being renamed or merged into another code of the same group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeChange {
    pub group: String,
    pub from: String,
    pub to: String,
}

impl CodeChange {
    pub fn new(group: &str, from: &str, to: &str) -> Self {
        Self { group: group.to_string(), from: from.to_string(), to: to.to_string() }
    }

    /// Renames the entry in place and propagates the new code.
    ///
    /// Falls back to [`CodeChange::merge`] when an entry with the new code already
    /// exists, which is also the state left by an interrupted rename.
    pub async fn rename(&self, ctx: &MigrationContext<'_>, references: &[ReferencePath]) -> Result<u64, StepError> {
        let store = ctx.store();
        if store.count(TAXONOMIES, entry_filter(&self.group, &self.to)).await? > 0 {
            ctx.info(format!("'{}/{}' already exists, merging '{}' into it", self.group, self.to, self.from));
            return self.merge(ctx, references).await;
        }
        let outcome = store
            .update_one(
                TAXONOMIES,
                entry_filter(&self.group, &self.from),
                doc! {"$set": {"code": self.to.as_str()}},
                WriteOptions::default(),
            )
            .await?;
        if outcome.matched == 0 {
            ctx.info(format!("No '{}/{}' entry to rename", self.group, self.from));
        }
        let rewritten = self.propagate(ctx, references).await?;
        ctx.verifier()
            .assert_none_match(
                TAXONOMIES,
                entry_filter(&self.group, &self.from),
                &format!("'{}/{}' still present after rename", self.group, self.from),
            )
            .await?;
        Ok(rewritten)
    }

    /// Points every reference at the target code, then deletes the source entry.
    pub async fn merge(&self, ctx: &MigrationContext<'_>, references: &[ReferencePath]) -> Result<u64, StepError> {
        let store = ctx.store();
        if store.count(TAXONOMIES, entry_filter(&self.group, &self.to)).await? == 0 {
            return Err(StepError::MissingReference { group: self.group.clone(), code: self.to.clone() });
        }
        let rewritten = self.propagate(ctx, references).await?;
        let deleted = delete_scoped(store, TAXONOMIES, entry_filter(&self.group, &self.from)).await?;
        ctx.info(format!("Deleted {} '{}/{}' entry(ies)", deleted.deleted, self.group, self.from));
        ctx.verifier()
            .assert_none_match(
                TAXONOMIES,
                entry_filter(&self.group, &self.from),
                &format!("'{}/{}' still present after merge", self.group, self.from),
            )
            .await?;
        Ok(rewritten)
    }

    async fn propagate(&self, ctx: &MigrationContext<'_>, references: &[ReferencePath]) -> Result<u64, StepError> {
        let mut rewritten = 0;
        for reference in references {
            let outcome = reference.rewrite(ctx.store(), &self.from, &self.to).await?;
            ctx.info(format!(
                "Rewrote '{}' to '{}' in {} document(s) through {reference}",
                self.from, self.to, outcome.modified
            ));
            rewritten += outcome.modified;
        }
        let verifier = ctx.verifier();
        for reference in references {
            verifier
                .assert_none_match(
                    reference.collection(),
                    reference.filter(&self.from),
                    &format!("'{}' still referenced through {reference}", self.from),
                )
                .await?;
        }
        Ok(rewritten)
    }
}

/// Replaces a reference group wholly owned by a step: delete, then insert.
pub async fn replace_owned_group(
    ctx: &MigrationContext<'_>,
    group: &str,
    entries: &[ReferenceEntry],
) -> Result<u64, StepError> {
    if let Some(stray) = entries.iter().find(|entry| entry.group != group) {
        return Err(StepError::UnexpectedShape {
            collection: TAXONOMIES.to_string(),
            message: format!("entry '{}/{}' does not belong to group '{group}'", stray.group, stray.code),
        });
    }
    let documents = entries.iter().map(ReferenceEntry::to_document).collect::<Result<Vec<_>, _>>()?;
    let deleted = delete_scoped(ctx.store(), TAXONOMIES, doc! {"group": group}).await?;
    let inserted = ctx.store().insert_many(TAXONOMIES, documents).await?;
    ctx.info(format!("Replaced group '{group}': {} deleted, {inserted} inserted", deleted.deleted));
    Ok(inserted)
}

/// Creates the counter `name` starting at `start` unless it already exists.
///
/// Returns whether the counter was created.
pub async fn seed_sequence(ctx: &MigrationContext<'_>, name: &str, start: i64) -> Result<bool, StepError> {
    let outcome = ctx
        .store()
        .update_one(COUNTERS, doc! {"_id": name}, doc! {"$setOnInsert": {"seq": start}}, WriteOptions::upsert())
        .await?;
    let created = outcome.upserted_id.is_some();
    if created {
        ctx.info(format!("Seeded sequence '{name}' at {start}"));
    }
    Ok(created)
}
