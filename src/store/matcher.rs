//! Filter evaluation for the in-memory store.
//!
//! Covers the part of the MongoDB query language the migration steps rely on:
//! dotted paths with implicit array traversal, comparison operators, `$in`/`$nin`,
//! `$exists`, `$elemMatch`, `$size` and the logical combinators.

use std::cmp::Ordering;

use mongodb::bson::{Bson, Document};

use crate::error::StoreError;

pub(crate) fn matches(document: &Document, filter: &Document) -> Result<bool, StoreError> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(key, condition)? {
                    all &= matches(document, clause)?;
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in clauses(key, condition)? {
                    any |= matches(document, clause)?;
                }
                any
            }
            "$nor" => {
                let mut any = false;
                for clause in clauses(key, condition)? {
                    any |= matches(document, clause)?;
                }
                !any
            }
            op if op.starts_with('$') => return Err(StoreError::UnsupportedOperator(op.to_string())),
            path => field_matches(&values_at(document, path), condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(operator: &str, condition: &'a Bson) -> Result<Vec<&'a Document>, StoreError> {
    let Bson::Array(items) = condition else {
        return Err(StoreError::InvalidFilter(format!("{operator} expects an array of filters")));
    };
    items
        .iter()
        .map(|item| match item {
            Bson::Document(clause) => Ok(clause),
            _ => Err(StoreError::InvalidFilter(format!("{operator} expects an array of filters"))),
        })
        .collect()
}

/// Collects every value reachable through `path`, descending into arrays of
/// sub-documents the way MongoDB does.
pub(crate) fn values_at(document: &Document, path: &str) -> Vec<Bson> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some((first, rest)) = segments.split_first() {
        if let Some(value) = document.get(*first) {
            collect(value, rest, &mut out);
        }
    }
    out
}

fn collect(value: &Bson, segments: &[&str], out: &mut Vec<Bson>) {
    let Some((segment, rest)) = segments.split_first() else {
        out.push(value.clone());
        return;
    };
    match value {
        Bson::Document(document) => {
            if let Some(child) = document.get(*segment) {
                collect(child, rest, out);
            }
        }
        Bson::Array(items) => {
            if let Ok(index) = segment.parse::<usize>() {
                if let Some(item) = items.get(index) {
                    collect(item, rest, out);
                }
            }
            for item in items {
                if let Bson::Document(_) = item {
                    collect(item, segments, out);
                }
            }
        }
        _ => {}
    }
}

fn is_operator_document(condition: &Bson) -> Option<&Document> {
    match condition {
        Bson::Document(document)
            if !document.is_empty() && document.keys().all(|key| key.starts_with('$')) =>
        {
            Some(document)
        }
        _ => None,
    }
}

fn field_matches(values: &[Bson], condition: &Bson) -> Result<bool, StoreError> {
    let Some(operators) = is_operator_document(condition) else {
        return Ok(equals_any(values, condition));
    };
    for (operator, argument) in operators {
        let matched = match operator.as_str() {
            "$eq" => equals_any(values, argument),
            "$ne" => !equals_any(values, argument),
            "$in" => in_list(values, operator, argument)?,
            "$nin" => !in_list(values, operator, argument)?,
            "$all" => all_of(values, argument)?,
            "$exists" => truthy(argument) != values.is_empty(),
            "$gt" => compare_any(values, argument, |o| o == Ordering::Greater),
            "$gte" => compare_any(values, argument, |o| o != Ordering::Less),
            "$lt" => compare_any(values, argument, |o| o == Ordering::Less),
            "$lte" => compare_any(values, argument, |o| o != Ordering::Greater),
            "$size" => {
                let expected = as_f64(argument)
                    .ok_or_else(|| StoreError::InvalidFilter("$size expects a number".to_string()))?;
                values.iter().any(|v| matches!(v, Bson::Array(items) if items.len() as f64 == expected))
            }
            "$elemMatch" => elem_match(values, argument)?,
            other => return Err(StoreError::UnsupportedOperator(other.to_string())),
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn elem_match(values: &[Bson], argument: &Bson) -> Result<bool, StoreError> {
    let Bson::Document(sub_filter) = argument else {
        return Err(StoreError::InvalidFilter("$elemMatch expects a document".to_string()));
    };
    let element_operators = is_operator_document(argument).is_some();
    for value in values {
        let Bson::Array(items) = value else { continue };
        for item in items {
            let matched = if element_operators {
                field_matches(std::slice::from_ref(item), argument)?
            } else if let Bson::Document(element) = item {
                matches(element, sub_filter)?
            } else {
                false
            };
            if matched {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn in_list(values: &[Bson], operator: &str, argument: &Bson) -> Result<bool, StoreError> {
    let Bson::Array(candidates) = argument else {
        return Err(StoreError::InvalidFilter(format!("{operator} expects an array")));
    };
    Ok(candidates.iter().any(|candidate| equals_any(values, candidate)))
}

fn all_of(values: &[Bson], argument: &Bson) -> Result<bool, StoreError> {
    let Bson::Array(required) = argument else {
        return Err(StoreError::InvalidFilter("$all expects an array".to_string()));
    };
    Ok(!required.is_empty() && required.iter().all(|candidate| equals_any(values, candidate)))
}

/// A missing field is equal to `null`; an array field is equal to a target when the
/// array itself or any of its elements is.
fn equals_any(values: &[Bson], target: &Bson) -> bool {
    if values.is_empty() {
        return matches!(target, Bson::Null);
    }
    values.iter().any(|value| {
        bson_equal(value, target)
            || matches!(value, Bson::Array(items) if items.iter().any(|item| bson_equal(item, target)))
    })
}

fn compare_any(values: &[Bson], target: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    values.iter().any(|value| match value {
        Bson::Array(items) => items.iter().any(|item| compare(item, target).is_some_and(&accept)),
        _ => compare(value, target).is_some_and(&accept),
    })
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Null => false,
        other => as_f64(other).map_or(true, |n| n != 0.0),
    }
}

pub(crate) fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

pub(crate) fn bson_equal(left: &Bson, right: &Bson) -> bool {
    match (as_f64(left), as_f64(right)) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn compare(left: &Bson, right: &Bson) -> Option<Ordering> {
    if let (Some(l), Some(r)) = (as_f64(left), as_f64(right)) {
        return l.partial_cmp(&r);
    }
    match (left, right) {
        (Bson::String(l), Bson::String(r)) => Some(l.cmp(r)),
        (Bson::DateTime(l), Bson::DateTime(r)) => Some(l.cmp(r)),
        (Bson::Boolean(l), Bson::Boolean(r)) => Some(l.cmp(r)),
        _ => None,
    }
}
