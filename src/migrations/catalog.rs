use std::collections::BTreeMap;
use std::sync::Arc;

use super::{FailurePolicy, MigrationStep};
use crate::error::MigrationError;
use crate::version::SchemaVersion;

/// A step and the version it is registered under. Immutable once registered.
#[derive(Clone)]
pub struct MigrationDescriptor {
    pub version: SchemaVersion,
    pub step: Arc<dyn MigrationStep>,
}

impl MigrationDescriptor {
    pub fn name(&self) -> &'static str {
        self.step.name()
    }

    pub fn policy(&self) -> FailurePolicy {
        self.step.policy()
    }
}

impl std::fmt::Debug for MigrationDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationDescriptor")
            .field("version", &self.version)
            .field("name", &self.name())
            .field("policy", &self.policy())
            .finish()
    }
}

/// Registered migrations keyed, and therefore ordered, by numeric version.
#[derive(Default, Debug)]
pub struct VersionCatalog {
    descriptors: BTreeMap<SchemaVersion, MigrationDescriptor>,
}

impl VersionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        version: SchemaVersion,
        step: impl MigrationStep + 'static,
    ) -> Result<(), MigrationError> {
        if self.descriptors.contains_key(&version) {
            return Err(MigrationError::DuplicateVersion(version));
        }
        self.descriptors.insert(version, MigrationDescriptor { version, step: Arc::new(step) });
        Ok(())
    }

    /// All descriptors in ascending version order.
    pub fn list(&self) -> Vec<MigrationDescriptor> {
        self.descriptors.values().cloned().collect()
    }

    /// Descriptors strictly newer than `current`, ascending.
    pub fn pending_since(&self, current: SchemaVersion) -> Vec<MigrationDescriptor> {
        self.descriptors
            .range((std::ops::Bound::Excluded(current), std::ops::Bound::Unbounded))
            .map(|(_, descriptor)| descriptor.clone())
            .collect()
    }

    pub fn latest(&self) -> Option<SchemaVersion> {
        self.descriptors.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepError;
    use crate::migrations::MigrationContext;
    use async_trait::async_trait;

    struct Noop(&'static str);

    #[async_trait]
    impl MigrationStep for Noop {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn apply(&self, _ctx: &MigrationContext<'_>) -> Result<(), StepError> {
            Ok(())
        }
    }

    fn catalog_of(versions: &[&str]) -> VersionCatalog {
        let mut catalog = VersionCatalog::new();
        for version in versions {
            catalog.register(version.parse().unwrap(), Noop("noop")).unwrap();
        }
        catalog
    }

    fn rendered(descriptors: &[MigrationDescriptor]) -> Vec<String> {
        descriptors.iter().map(|d| d.version.to_string()).collect()
    }

    #[test]
    fn test_list_orders_numerically() {
        let catalog = catalog_of(&["1.0.1", "1.0.14", "1.0.3"]);
        assert_eq!(rendered(&catalog.list()), vec!["1.0.1", "1.0.3", "1.0.14"]);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut catalog = catalog_of(&["1.0.1"]);
        let result = catalog.register(SchemaVersion::new(1, 0, 1), Noop("again"));
        assert!(matches!(result, Err(MigrationError::DuplicateVersion(v)) if v == SchemaVersion::new(1, 0, 1)));
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.list()[0].name(), "noop");
    }

    #[test]
    fn test_pending_since_is_strictly_greater() {
        let catalog = catalog_of(&["1.0.1", "1.0.14", "1.0.3", "2.0.0"]);
        assert_eq!(rendered(&catalog.pending_since(SchemaVersion::ZERO)), vec!["1.0.1", "1.0.3", "1.0.14", "2.0.0"]);
        assert_eq!(rendered(&catalog.pending_since(SchemaVersion::new(1, 0, 3))), vec!["1.0.14", "2.0.0"]);
        assert_eq!(rendered(&catalog.pending_since(SchemaVersion::new(1, 0, 4))), vec!["1.0.14", "2.0.0"]);
        assert!(catalog.pending_since(SchemaVersion::new(2, 0, 0)).is_empty());
        assert!(catalog.pending_since(SchemaVersion::new(9, 0, 0)).is_empty());
    }

    #[test]
    fn test_latest() {
        assert_eq!(VersionCatalog::new().latest(), None);
        assert_eq!(catalog_of(&["1.0.14", "1.0.3"]).latest(), Some(SchemaVersion::new(1, 0, 14)));
    }
}
