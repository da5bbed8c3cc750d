//! Names of the collections the migrations touch.

/// Reference entries keyed by `(group, code)`.
pub const TAXONOMIES: &str = "taxonomies";
pub const INTERVENTIONS: &str = "interventions";
pub const PROJECTS: &str = "projects";
pub const PROGRAM_BOOKS: &str = "programBooks";
/// Sequence counters, one document per sequence with a `seq` field.
pub const COUNTERS: &str = "counters";
pub const HISTORIES: &str = "histories";
/// Pre-1.0.2 name of [`HISTORIES`].
pub const LEGACY_HISTORY: &str = "history";
