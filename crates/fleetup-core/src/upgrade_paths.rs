//! Upgrade-path table.
//!
//! `config/upgrade_paths.json` is a single mapping from a source version to
//! the ordered sequence of versions to move through. A lookup miss means
//! "skip this device", not an error; the operator curates the table and a
//! device on an uncurated version is simply left alone.

use std::collections::BTreeMap;
use std::path::Path;

use crate::fsio::{self, FsError};

/// Read-only version-to-path mapping.
#[derive(Debug, Clone, Default)]
pub struct UpgradePathTable {
    paths: BTreeMap<String, Vec<String>>,
}

impl UpgradePathTable {
    /// Loads the table from `path`. A missing file is an empty table.
    ///
    /// # Errors
    ///
    /// Returns [`FsError`] when the file exists but is malformed.
    pub fn load(path: &Path) -> Result<Self, FsError> {
        let paths = fsio::read_json(path)?.unwrap_or_default();
        Ok(Self { paths })
    }

    /// Builds a table from an in-memory mapping, for tests and validation.
    #[must_use]
    pub fn from_map(paths: BTreeMap<String, Vec<String>>) -> Self {
        Self { paths }
    }

    /// The ordered upgrade path for `from_version`, or `None` when the
    /// version is not in the table (skip the device).
    #[must_use]
    pub fn plan(&self, from_version: &str) -> Option<&[String]> {
        self.paths.get(from_version).map(Vec::as_slice)
    }

    /// The final version a device starting at `from_version` should reach.
    #[must_use]
    pub fn target(&self, from_version: &str) -> Option<&str> {
        self.plan(from_version)?.last().map(String::as_str)
    }

    /// Number of source versions in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Iterates `(source, path)` entries in version order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.paths.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Checks the table shape for `fleetup path validate`: every entry must
    /// have a non-empty path of non-empty version strings, and no source may
    /// map to a path that begins with itself (a no-op first hop is always a
    /// curation mistake).
    #[must_use]
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (source, path) in &self.paths {
            if path.is_empty() {
                problems.push(format!("{source}: empty upgrade path"));
                continue;
            }
            if path.iter().any(String::is_empty) {
                problems.push(format!("{source}: path contains an empty version string"));
            }
            if path.first().is_some_and(|first| first == source) {
                problems.push(format!("{source}: path starts with the source version"));
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsio::atomic_write_json;

    fn table(entries: &[(&str, &[&str])]) -> UpgradePathTable {
        UpgradePathTable::from_map(
            entries
                .iter()
                .map(|(k, v)| {
                    (
                        (*k).to_string(),
                        v.iter().map(|s| (*s).to_string()).collect(),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn plan_returns_ordered_sequence() {
        let t = table(&[("10.0.2", &["10.1.0", "10.5.1", "11.1.0"])]);
        assert_eq!(
            t.plan("10.0.2").unwrap(),
            &["10.1.0", "10.5.1", "11.1.0"]
        );
        assert_eq!(t.target("10.0.2"), Some("11.1.0"));
    }

    #[test]
    fn unknown_version_is_none_not_error() {
        let t = table(&[("10.0.2", &["11.1.0"])]);
        assert!(t.plan("9.1.0").is_none());
        assert!(t.target("9.1.0").is_none());
    }

    #[test]
    fn load_round_trips_through_the_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upgrade_paths.json");
        let mut doc = BTreeMap::new();
        doc.insert("10.5.1".to_string(), vec!["11.1.0".to_string()]);
        atomic_write_json(&path, &doc).unwrap();

        let t = UpgradePathTable::load(&path).unwrap();
        assert_eq!(t.plan("10.5.1").unwrap(), &["11.1.0"]);
    }

    #[test]
    fn missing_file_is_an_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let t = UpgradePathTable::load(&dir.path().join("upgrade_paths.json")).unwrap();
        assert!(t.is_empty());
    }

    #[test]
    fn problems_flags_bad_shapes() {
        let t = table(&[
            ("10.0.2", &[]),
            ("10.1.0", &["10.1.0", "11.0.0"]),
            ("10.5.1", &["11.1.0"]),
        ]);
        let problems = t.problems();
        assert_eq!(problems.len(), 2);
        assert!(problems.iter().any(|p| p.contains("empty upgrade path")));
        assert!(problems.iter().any(|p| p.contains("starts with the source")));
    }
}
