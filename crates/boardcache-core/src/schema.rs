//! SQLite schema inspection
//!
//! Opens board databases read-only and lists their relations. Unreadable
//! files (missing, truncated, not SQLite) never satisfy a tier; callers that
//! need to tell "absent" from "corrupt" check existence first.

use crate::capability::CapabilityTier;
use rusqlite::{Connection, OpenFlags};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;

/// Result of checking one file against one tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    pub tier: CapabilityTier,
    /// False when the file could not be opened or queried
    pub readable: bool,
    pub relations: BTreeSet<String>,
    pub missing: Vec<&'static str>,
}

impl Inspection {
    pub fn satisfied(&self) -> bool {
        self.readable && self.missing.is_empty()
    }
}

/// Names of all tables and views in the database at `path`
pub fn relations_present(path: &Path) -> Result<BTreeSet<String>, rusqlite::Error> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type IN ('table', 'view')")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;

    Ok(names)
}

/// Inspect `path` against `tier`
pub fn inspect(path: &Path, tier: CapabilityTier) -> Inspection {
    match relations_present(path) {
        Ok(relations) => {
            let missing = tier.missing_from(&relations);
            Inspection {
                tier,
                readable: true,
                relations,
                missing,
            }
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Database unreadable");
            Inspection {
                tier,
                readable: false,
                relations: BTreeSet::new(),
                missing: tier.required_relations().to_vec(),
            }
        }
    }
}

/// True iff every relation `tier` requires exists in the database at `path`
pub fn satisfies(path: &Path, tier: CapabilityTier) -> bool {
    inspect(path, tier).satisfied()
}

/// Relations `tier` requires that the database at `path` lacks
pub fn missing_relations(path: &Path, tier: CapabilityTier) -> Vec<&'static str> {
    inspect(path, tier).missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_db(path: &Path, tables: &[&str]) {
        let conn = Connection::open(path).unwrap();
        for table in tables {
            conn.execute_batch(&format!("CREATE TABLE {table} (id INTEGER PRIMARY KEY);"))
                .unwrap();
        }
    }

    #[test]
    fn test_relations_present_lists_tables_and_views() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("aurora.db");
        create_db(&path, &["climbs", "product_sizes_layouts_sets"]);
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE VIEW climb_names AS SELECT id FROM climbs;")
            .unwrap();

        let names = relations_present(&path).unwrap();
        let expected: BTreeSet<String> = ["climb_names", "climbs", "product_sizes_layouts_sets"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_satisfies_requires_every_relation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("aurora.db");
        create_db(&path, &["climbs", "product_sizes_layouts_sets"]);

        assert!(satisfies(&path, CapabilityTier::Catalog));
        assert!(!satisfies(&path, CapabilityTier::Geometry));

        let inspection = inspect(&path, CapabilityTier::Geometry);
        assert!(inspection.readable);
        assert_eq!(inspection.missing, vec!["holes", "placements"]);
        assert_eq!(
            missing_relations(&path, CapabilityTier::Logbook),
            vec!["ascents", "bids"]
        );
    }

    #[test]
    fn test_missing_file_is_unsatisfied() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.db");

        assert!(!satisfies(&path, CapabilityTier::Layouts));
        // Read-only open must not create the file
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_file_is_unsatisfied() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corrupt.db");
        std::fs::write(&path, "not a sqlite database ".repeat(256)).unwrap();

        let inspection = inspect(&path, CapabilityTier::Catalog);
        assert!(!inspection.readable);
        assert!(!inspection.satisfied());
        assert_eq!(inspection.missing, vec!["climbs", "product_sizes_layouts_sets"]);
    }
}
