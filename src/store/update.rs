//! Update-document evaluation for the in-memory store.
//!
//! Supported operators: `$set`, `$unset`, `$inc`, `$setOnInsert`, `$rename` and
//! `$pull` with an equality value.
//! Paths may contain numeric indexes, the all-positional `$[]` and filtered
//! `$[identifier]` segments resolved against the write's array filters.

use mongodb::bson::{Bson, Document};

use super::matcher::{self, as_f64, bson_equal};
use crate::error::StoreError;

enum Action<'a> {
    Set(&'a Bson),
    Unset,
    Inc(&'a Bson),
    Pull(&'a Bson),
}

impl Action<'_> {
    /// Removals never create the path they target.
    fn is_removal(&self) -> bool {
        matches!(self, Action::Unset | Action::Pull(_))
    }
}

pub(crate) fn apply_update(
    document: &mut Document,
    update: &Document,
    array_filters: &[Document],
    is_insert: bool,
) -> Result<(), StoreError> {
    if update.is_empty() {
        return Err(StoreError::InvalidUpdate("update document is empty".to_string()));
    }
    for (operator, fields) in update {
        let Bson::Document(fields) = fields else {
            return Err(StoreError::InvalidUpdate(format!("{operator} expects a document")));
        };
        match operator.as_str() {
            "$set" => {
                for (path, value) in fields {
                    apply_path(document, path, Action::Set(value), array_filters)?;
                }
            }
            "$setOnInsert" => {
                if is_insert {
                    for (path, value) in fields {
                        apply_path(document, path, Action::Set(value), array_filters)?;
                    }
                }
            }
            "$unset" => {
                for (path, _) in fields {
                    apply_path(document, path, Action::Unset, array_filters)?;
                }
            }
            "$inc" => {
                for (path, amount) in fields {
                    if as_f64(amount).is_none() {
                        return Err(StoreError::InvalidUpdate(format!("$inc on '{path}' expects a number")));
                    }
                    apply_path(document, path, Action::Inc(amount), array_filters)?;
                }
            }
            "$pull" => {
                for (path, value) in fields {
                    if matches!(value, Bson::Document(condition) if condition.keys().any(|k| k.starts_with('$'))) {
                        return Err(StoreError::UnsupportedOperator(format!("$pull condition on '{path}'")));
                    }
                    apply_path(document, path, Action::Pull(value), array_filters)?;
                }
            }
            "$rename" => {
                for (from, to) in fields {
                    let Bson::String(to) = to else {
                        return Err(StoreError::InvalidUpdate(format!("$rename target of '{from}' must be a string")));
                    };
                    if let Some(value) = take_path(document, from) {
                        apply_path(document, to, Action::Set(&value), array_filters)?;
                    }
                }
            }
            other if other.starts_with('$') => return Err(StoreError::UnsupportedOperator(other.to_string())),
            other => {
                return Err(StoreError::InvalidUpdate(format!(
                    "replacement documents are not supported (found field '{other}')"
                )))
            }
        }
    }
    Ok(())
}

/// Builds the initial document of an upsert from the equality clauses of its filter.
pub(crate) fn seed_from_filter(filter: &Document) -> Result<Document, StoreError> {
    let mut seeded = Document::new();
    for (key, condition) in filter {
        if key.starts_with('$') {
            continue;
        }
        let value = match condition {
            Bson::Document(ops) if ops.keys().any(|k| k.starts_with('$')) => match ops.get("$eq") {
                Some(value) => value,
                None => continue,
            },
            value => value,
        };
        apply_path(&mut seeded, key, Action::Set(value), &[])?;
    }
    Ok(seeded)
}

fn apply_path(document: &mut Document, path: &str, action: Action<'_>, filters: &[Document]) -> Result<(), StoreError> {
    let segments: Vec<&str> = path.split('.').collect();
    apply_in_document(document, &segments, &action, filters)
}

fn apply_in_document(
    document: &mut Document,
    segments: &[&str],
    action: &Action<'_>,
    filters: &[Document],
) -> Result<(), StoreError> {
    let Some((segment, rest)) = segments.split_first() else {
        return Err(StoreError::InvalidUpdate("empty update path".to_string()));
    };
    if segment.starts_with('$') {
        return Err(StoreError::InvalidUpdate(format!("positional segment '{segment}' applied to a document")));
    }
    if rest.is_empty() {
        return apply_leaf_in_document(document, segment, action);
    }
    match document.get_mut(*segment) {
        Some(child) => apply_in_value(child, rest, action, filters),
        None => match action {
            action if action.is_removal() => Ok(()),
            _ if rest[0].starts_with('$') => Err(StoreError::InvalidUpdate(format!(
                "path '{segment}' must exist in the document to apply array updates"
            ))),
            _ => {
                let mut child = Document::new();
                apply_in_document(&mut child, rest, action, filters)?;
                document.insert(*segment, child);
                Ok(())
            }
        },
    }
}

fn apply_in_value(
    value: &mut Bson,
    segments: &[&str],
    action: &Action<'_>,
    filters: &[Document],
) -> Result<(), StoreError> {
    match value {
        Bson::Document(document) => apply_in_document(document, segments, action, filters),
        Bson::Array(items) => {
            let Some((segment, rest)) = segments.split_first() else {
                return Err(StoreError::InvalidUpdate("empty update path".to_string()));
            };
            for index in select_elements(items, segment, action, filters)? {
                if rest.is_empty() {
                    apply_leaf_in_array(items, index, action)?;
                } else {
                    apply_in_value(&mut items[index], rest, action, filters)?;
                }
            }
            Ok(())
        }
        _ => match action {
            action if action.is_removal() => Ok(()),
            _ => Err(StoreError::InvalidUpdate(format!(
                "cannot create field '{}' inside a non-document value",
                segments.join(".")
            ))),
        },
    }
}

fn select_elements(
    items: &mut Vec<Bson>,
    segment: &str,
    action: &Action<'_>,
    filters: &[Document],
) -> Result<Vec<usize>, StoreError> {
    if segment == "$[]" {
        return Ok((0..items.len()).collect());
    }
    if let Some(identifier) = segment.strip_prefix("$[").and_then(|s| s.strip_suffix(']')) {
        let filter = array_filter_for(identifier, filters)?;
        let mut selected = Vec::new();
        for (index, item) in items.iter().enumerate() {
            let mut bound = Document::new();
            bound.insert(identifier, item.clone());
            if matcher::matches(&bound, filter)? {
                selected.push(index);
            }
        }
        return Ok(selected);
    }
    match segment.parse::<usize>() {
        Ok(index) if index < items.len() => Ok(vec![index]),
        Ok(index) => match action {
            action if action.is_removal() => Ok(vec![]),
            _ => {
                items.resize(index + 1, Bson::Null);
                Ok(vec![index])
            }
        },
        Err(_) => Err(StoreError::InvalidUpdate(format!("cannot use field name '{segment}' to traverse an array"))),
    }
}

fn array_filter_for<'a>(identifier: &str, filters: &'a [Document]) -> Result<&'a Document, StoreError> {
    let prefix = format!("{identifier}.");
    filters
        .iter()
        .find(|filter| filter.keys().any(|key| key == identifier || key.starts_with(&prefix)))
        .ok_or_else(|| StoreError::InvalidUpdate(format!("no array filter found for identifier '{identifier}'")))
}

fn apply_leaf_in_document(document: &mut Document, field: &str, action: &Action<'_>) -> Result<(), StoreError> {
    match action {
        Action::Set(value) => {
            document.insert(field, (*value).clone());
        }
        Action::Unset => {
            document.remove(field);
        }
        Action::Inc(amount) => {
            let next = match document.get(field) {
                Some(current) => add(current, amount, field)?,
                None => (*amount).clone(),
            };
            document.insert(field, next);
        }
        Action::Pull(value) => match document.get_mut(field) {
            Some(Bson::Array(items)) => items.retain(|item| !bson_equal(item, value)),
            Some(_) => {
                return Err(StoreError::InvalidUpdate(format!("cannot apply $pull to non-array field '{field}'")));
            }
            None => {}
        },
    }
    Ok(())
}

fn apply_leaf_in_array(items: &mut [Bson], index: usize, action: &Action<'_>) -> Result<(), StoreError> {
    match action {
        Action::Set(value) => items[index] = (*value).clone(),
        // MongoDB keeps the array length stable and nulls the slot.
        Action::Unset => items[index] = Bson::Null,
        Action::Inc(amount) => items[index] = add(&items[index], amount, &index.to_string())?,
        Action::Pull(value) => match &mut items[index] {
            Bson::Array(nested) => nested.retain(|item| !bson_equal(item, value)),
            _ => return Err(StoreError::InvalidUpdate(format!("cannot apply $pull to non-array element {index}"))),
        },
    }
    Ok(())
}

fn add(current: &Bson, amount: &Bson, field: &str) -> Result<Bson, StoreError> {
    let sum = match (current, amount) {
        (Bson::Int32(a), Bson::Int32(b)) => {
            a.checked_add(*b).map_or(Bson::Int64(i64::from(*a) + i64::from(*b)), Bson::Int32)
        }
        (Bson::Int32(a), Bson::Int64(b)) => Bson::Int64(i64::from(*a) + b),
        (Bson::Int64(a), Bson::Int32(b)) => Bson::Int64(a + i64::from(*b)),
        (Bson::Int64(a), Bson::Int64(b)) => Bson::Int64(a + b),
        (current, amount) => match (as_f64(current), as_f64(amount)) {
            (Some(a), Some(b)) => Bson::Double(a + b),
            _ => {
                return Err(StoreError::InvalidUpdate(format!("cannot apply $inc to non-numeric field '{field}'")));
            }
        },
    };
    Ok(sum)
}

fn take_path(document: &mut Document, path: &str) -> Option<Bson> {
    match path.split_once('.') {
        None => document.remove(path),
        Some((head, tail)) => match document.get_mut(head) {
            Some(Bson::Document(child)) => take_path(child, tail),
            _ => None,
        },
    }
}
