//! Store and collection configuration.
//!
//! A [`StoreConfig`] lists the collections a store holds, which document kind
//! each accepts, and any declared uniqueness constraints. Configuration is
//! fixed at store creation: it is written (with a stable hash per collection)
//! to `meta.json`, and reopening a store with a different configuration is
//! refused.
//!
//! The default configuration is the detector-configuration layout: one
//! collection per document kind and no storage-level uniqueness, since dedup
//! keys are commit-time rules that must allow multi-revision history.

use std::collections::HashSet;
use std::hash::{DefaultHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::document::DocumentKind;
use crate::error::{ConfigError, Result};
use crate::value::PATH_SEPARATOR;

/// Name of the default geometry collection.
pub const GEOMETRY: &str = "geometry";
/// Name of the default calibration collection.
pub const CALIBRATION: &str = "calibration";
/// Name of the default detector-status collection.
pub const STATUS: &str = "status";

/// Configuration of a whole store.
///
/// # Example
///
/// ```rust
/// use gcdstore::schema::{CollectionConfig, StoreConfig, UniqueIndex};
/// use gcdstore::DocumentKind;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = StoreConfig::new(vec![
///     CollectionConfig::new("geometry", DocumentKind::Geometry),
///     CollectionConfig::new("runs", DocumentKind::Status)
///         .with_unique(UniqueIndex::new(["payload.run_id"])),
/// ])?;
/// assert_eq!(config.collections.len(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Collections, in declaration order.
    pub collections: Vec<CollectionConfig>,
}

impl StoreConfig {
    /// Creates and validates a store configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if validation fails.
    pub fn new(collections: Vec<CollectionConfig>) -> Result<Self> {
        let config = Self { collections };
        config.validate()?;
        Ok(config)
    }

    /// Validates every collection and checks names are unique.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.collections.is_empty() {
            return Err(ConfigError::NoCollections.into());
        }
        let mut seen = HashSet::new();
        for collection in &self.collections {
            collection.validate()?;
            if !seen.insert(collection.name.as_str()) {
                return Err(ConfigError::DuplicateCollection {
                    name: collection.name.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Returns the configuration of the named collection.
    pub fn collection(&self, name: &str) -> Option<&CollectionConfig> {
        self.collections.iter().find(|c| c.name == name)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            collections: vec![
                CollectionConfig::new(GEOMETRY, DocumentKind::Geometry),
                CollectionConfig::new(CALIBRATION, DocumentKind::Calibration),
                CollectionConfig::new(STATUS, DocumentKind::Status),
            ],
        }
    }
}

/// Configuration of a single collection.
#[derive(Debug, Clone, PartialEq, Hash, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Collection name; also its file stem on disk.
    pub name: String,

    /// The only document kind this collection accepts.
    pub kind: DocumentKind,

    /// Declared uniqueness constraints, checked on every insertion.
    #[serde(default)]
    pub unique: Vec<UniqueIndex>,
}

impl CollectionConfig {
    /// Creates a collection configuration without constraints.
    pub fn new(name: impl Into<String>, kind: DocumentKind) -> Self {
        Self {
            name: name.into(),
            kind,
            unique: Vec::new(),
        }
    }

    /// Adds a uniqueness constraint (builder style).
    #[must_use]
    pub fn with_unique(mut self, index: UniqueIndex) -> Self {
        self.unique.push(index);
        self
    }

    /// Validates this collection configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the name is unusable or a constraint is malformed.
    pub fn validate(&self) -> Result<()> {
        let name_ok = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !name_ok {
            return Err(ConfigError::InvalidName {
                name: self.name.clone(),
                reason: "must be non-empty ASCII letters, digits, '_' or '-'".to_string(),
            }
            .into());
        }
        if self.name == "meta" || self.name == "journal" {
            return Err(ConfigError::InvalidName {
                name: self.name.clone(),
                reason: "reserved for store metadata".to_string(),
            }
            .into());
        }

        for index in &self.unique {
            let malformed = index.fields.is_empty().then(String::new).or_else(|| {
                index
                    .fields
                    .iter()
                    .find(|f| f.is_empty() || f.split(PATH_SEPARATOR).any(str::is_empty))
                    .cloned()
            });
            if let Some(field) = malformed {
                return Err(ConfigError::InvalidUniqueField {
                    collection: self.name.clone(),
                    field,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Computes a stable hash of this configuration.
    ///
    /// Stored in `meta.json` to detect configuration changes when reopening
    /// a store.
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// A composite uniqueness constraint over document field paths.
///
/// Documents missing any of the fields are not constrained.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueIndex {
    /// Field paths forming the key.
    pub fields: Vec<String>,
}

impl UniqueIndex {
    /// Creates a constraint over `fields`.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GcdError;

    #[test]
    fn test_default_config_is_valid() {
        let config = StoreConfig::default();
        config.validate().unwrap();
        assert_eq!(config.collection(CALIBRATION).map(|c| c.kind), Some(DocumentKind::Calibration));
        assert!(config.collection("journal").is_none());
    }

    #[test]
    fn test_rejects_empty_and_duplicate() {
        assert!(matches!(
            StoreConfig::new(vec![]),
            Err(GcdError::Config(ConfigError::NoCollections))
        ));
        let err = StoreConfig::new(vec![
            CollectionConfig::new("geometry", DocumentKind::Geometry),
            CollectionConfig::new("geometry", DocumentKind::Status),
        ])
        .unwrap_err();
        assert!(matches!(err, GcdError::Config(ConfigError::DuplicateCollection { .. })));
    }

    #[test]
    fn test_rejects_bad_names() {
        for name in ["", "../escape", "with space", "journal"] {
            let config = CollectionConfig::new(name, DocumentKind::Geometry);
            assert!(
                matches!(config.validate(), Err(GcdError::Config(ConfigError::InvalidName { .. }))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_rejects_malformed_unique_fields() {
        for fields in [vec![], vec!["payload..x"], vec![""]] {
            let config = CollectionConfig::new("runs", DocumentKind::Status)
                .with_unique(UniqueIndex::new(fields));
            assert!(matches!(
                config.validate(),
                Err(GcdError::Config(ConfigError::InvalidUniqueField { .. }))
            ));
        }
    }

    #[test]
    fn test_stable_hash_tracks_layout() {
        let base = CollectionConfig::new("runs", DocumentKind::Status);
        let constrained = base.clone().with_unique(UniqueIndex::new(["name"]));
        assert_eq!(base.stable_hash(), base.clone().stable_hash());
        assert_ne!(base.stable_hash(), constrained.stable_hash());
    }
}
