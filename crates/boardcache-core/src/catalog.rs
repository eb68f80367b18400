//! Climb catalog reader
//!
//! Reads climbs out of a database returned by the orchestrator for tier
//! `catalog`. Board databases differ in which optional columns they carry, so
//! rows are returned as JSON objects keyed by column name.

use anyhow::{bail, Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, Row};
use serde_json::{Map, Number, Value};
use std::path::Path;

/// One climb as column name → value
pub type ClimbRow = Map<String, Value>;

/// Columns copied into the catalog summary when the board has them
const OPTIONAL_COLUMNS: &[&str] = &["name", "grade", "setter", "product_sizes_layouts_set_id"];

fn open_read_only(path: &Path) -> Result<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("Failed to open board database {}", path.display()))
}

fn has_table(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

/// Column to identify climbs by: `id`, else `uuid`
fn detect_key_column(columns: &[String]) -> Result<&'static str> {
    for candidate in ["id", "uuid"] {
        if columns.iter().any(|c| c == candidate) {
            return Ok(candidate);
        }
    }
    bail!("climbs table has no id or uuid column (columns: {})", columns.join(", "))
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn row_to_map(row: &Row<'_>, names: &[String]) -> rusqlite::Result<ClimbRow> {
    let mut map = Map::with_capacity(names.len());
    for (idx, name) in names.iter().enumerate() {
        map.insert(name.clone(), value_to_json(row.get_ref(idx)?));
    }
    Ok(map)
}

/// Key column plus any optional columns for every climb; empty when there is no `climbs` table
pub fn extract_climb_catalog(path: &Path) -> Result<Vec<ClimbRow>> {
    let conn = open_read_only(path)?;
    if !has_table(&conn, "climbs")? {
        return Ok(Vec::new());
    }

    let columns = table_columns(&conn, "climbs")?;
    let key = detect_key_column(&columns)?;

    let mut selected = vec![key.to_string()];
    selected.extend(
        OPTIONAL_COLUMNS
            .iter()
            .filter(|c| columns.iter().any(|col| col == *c))
            .map(|c| c.to_string()),
    );

    let sql = format!("SELECT {} FROM climbs", selected.join(", "));
    let mut stmt = conn.prepare(&sql)?;
    let climbs = stmt
        .query_map([], |row| row_to_map(row, &selected))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to read climbs")?;

    Ok(climbs)
}

/// Full climb row for `uuid`, with the set's `image_filename` as `base_image_filename`
pub fn load_climb(path: &Path, uuid: &str) -> Result<Option<ClimbRow>> {
    let conn = open_read_only(path)?;
    let mut stmt = conn.prepare(
        "SELECT c.*, p.image_filename AS base_image_filename
         FROM climbs c
         LEFT JOIN product_sizes_layouts_sets p ON p.id = c.product_sizes_layouts_set_id
         WHERE c.uuid = ?1
         LIMIT 1",
    )?;
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    let mut rows = stmt.query([uuid])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_map(row, &names)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fixture(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE product_sizes_layouts_sets (id INTEGER PRIMARY KEY, image_filename TEXT);
             CREATE TABLE climbs (
                 uuid TEXT PRIMARY KEY,
                 name TEXT,
                 setter TEXT,
                 frames TEXT,
                 angle REAL,
                 product_sizes_layouts_set_id INTEGER
             );
             INSERT INTO product_sizes_layouts_sets VALUES (1, 'product_sizes_layouts_sets/original.png');
             INSERT INTO climbs VALUES ('abc', 'Warm Up', 'setter1', 'p1r12', 40.0, 1);
             INSERT INTO climbs VALUES ('def', 'Orphan', NULL, 'p2r13', NULL, 99);",
        )
        .unwrap();
    }

    #[test]
    fn test_extract_uses_uuid_and_optional_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("aurora.db");
        fixture(&path);

        let climbs = extract_climb_catalog(&path).unwrap();
        assert_eq!(climbs.len(), 2);

        let first = &climbs[0];
        let keys: Vec<&str> = first.keys().map(|k| k.as_str()).collect();
        assert!(keys.contains(&"uuid"));
        assert!(keys.contains(&"name"));
        assert!(keys.contains(&"product_sizes_layouts_set_id"));
        assert!(!keys.contains(&"grade"));
        assert!(!keys.contains(&"frames"));
    }

    #[test]
    fn test_extract_without_climbs_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("layouts.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE layouts (id INTEGER PRIMARY KEY);")
            .unwrap();

        assert!(extract_climb_catalog(&path).unwrap().is_empty());
    }

    #[test]
    fn test_extract_without_key_column_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("odd.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE climbs (name TEXT);")
            .unwrap();

        let err = extract_climb_catalog(&path).unwrap_err();
        assert!(err.to_string().contains("no id or uuid"));
    }

    #[test]
    fn test_load_climb_joins_base_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("aurora.db");
        fixture(&path);

        let climb = load_climb(&path, "abc").unwrap().unwrap();
        assert_eq!(climb["name"], "Warm Up");
        assert_eq!(climb["angle"], 40.0);
        assert_eq!(
            climb["base_image_filename"],
            "product_sizes_layouts_sets/original.png"
        );

        let orphan = load_climb(&path, "def").unwrap().unwrap();
        assert_eq!(orphan["base_image_filename"], Value::Null);

        assert!(load_climb(&path, "missing").unwrap().is_none());
    }
}
