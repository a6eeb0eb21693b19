use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use super::executor::write_atomic;

/// One row of a CSV table keyed by column name
pub type Row = BTreeMap<String, String>;

/// An in-memory CSV table (ledger, metadata table or report)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Read a CSV file with a header row; short rows are padded with empty cells
    pub fn from_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();

        for record in reader.records() {
            let record = record.with_context(|| format!("Malformed row in {}", path.display()))?;
            let row = columns
                .iter()
                .enumerate()
                .map(|(idx, column)| (column.clone(), record.get(idx).unwrap_or("").to_string()))
                .collect();
            rows.push(row);
        }

        Ok(Self { columns, rows })
    }

    /// Rewrite `path` with this table, atomically
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(
                self.columns
                    .iter()
                    .map(|c| row.get(c).map(String::as_str).unwrap_or("")),
            )?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Failed to serialize table: {}", e))?;

        write_atomic(path, &String::from_utf8(bytes)?)
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// A new table holding only the rows matching `keep`
    pub fn filtered(&self, keep: impl Fn(&Row) -> bool) -> Self {
        Self {
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|r| keep(r)).cloned().collect(),
        }
    }
}

/// A primary row paired with its matching secondary row
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRow {
    pub key: String,
    pub primary: Row,
    pub secondary: Row,
}

impl JoinedRow {
    /// Field from the primary row, falling back to the secondary
    pub fn get(&self, column: &str) -> &str {
        self.primary
            .get(column)
            .or_else(|| self.secondary.get(column))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Field from the primary row only
    pub fn primary(&self, column: &str) -> &str {
        self.primary.get(column).map(String::as_str).unwrap_or("")
    }

    /// Field from the secondary row only
    pub fn secondary(&self, column: &str) -> &str {
        self.secondary.get(column).map(String::as_str).unwrap_or("")
    }

    /// Both rows merged; primary wins on conflicting columns
    pub fn merged(&self) -> Row {
        let mut merged = self.secondary.clone();
        merged.extend(self.primary.clone());
        merged
    }
}

/// Normalise a join key: surrounding whitespace is dropped and blank keys never join.
///
/// Keys are compared as written, so `007` and `7` stay distinct.
pub fn normalize_key(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Inner join using the same key function on both sides
pub fn join<K>(primary: &Table, secondary: &Table, key: K) -> Vec<JoinedRow>
where
    K: Fn(&Row) -> Option<String>,
{
    join_with(primary, secondary, &key, &key)
}

/// Inner join of `primary` with `secondary`.
///
/// Output follows primary order. When several secondary rows share a key the
/// first one wins. Neither table is modified.
pub fn join_with<P, S>(
    primary: &Table,
    secondary: &Table,
    primary_key: P,
    secondary_key: S,
) -> Vec<JoinedRow>
where
    P: Fn(&Row) -> Option<String>,
    S: Fn(&Row) -> Option<String>,
{
    let mut index: HashMap<String, &Row> = HashMap::new();
    for row in &secondary.rows {
        if let Some(key) = secondary_key(row).as_deref().and_then(normalize_key) {
            index.entry(key).or_insert(row);
        }
    }

    let joined: Vec<JoinedRow> = primary
        .rows
        .iter()
        .filter_map(|row| {
            let key = primary_key(row).as_deref().and_then(normalize_key)?;
            index.get(&key).map(|matched| JoinedRow {
                key,
                primary: row.clone(),
                secondary: (*matched).clone(),
            })
        })
        .collect();

    if joined.is_empty() {
        tracing::warn!(
            "Join produced no rows ({} primary, {} secondary); check that names match between sources",
            primary.len(),
            secondary.len()
        );
    }

    joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table(columns: &[&str], rows: &[&[&str]]) -> Table {
        let mut table = Table::new(columns);
        for values in rows {
            table.push(
                columns
                    .iter()
                    .zip(values.iter())
                    .map(|(c, v)| (c.to_string(), v.to_string()))
                    .collect(),
            );
        }
        table
    }

    fn by(column: &'static str) -> impl Fn(&Row) -> Option<String> {
        move |row| row.get(column).cloned()
    }

    #[test]
    fn test_inner_join_keeps_only_shared_keys() {
        let a = table(&["item_id", "words"], &[&["1", "10"], &["2", "20"], &["3", "30"]]);
        let b = table(&["item_id", "title"], &[&["2", "Two"], &["3", "Three"], &["4", "Four"]]);

        let joined = join(&a, &b, by("item_id"));

        let keys: Vec<&str> = joined.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["2", "3"]);
        assert_eq!(joined[0].get("words"), "20");
        assert_eq!(joined[0].get("title"), "Two");
        assert_eq!(joined[1].merged().len(), 3);
    }

    #[test]
    fn test_join_trims_but_keeps_spelling() {
        let a = table(&["id"], &[&["7"], &[" 8 "], &["007"], &["1"]]);
        let b = table(&["id", "v"], &[&["7.0", "x"], &["8", "y"], &["007", "z"], &["1e0", "w"]]);

        let joined = join(&a, &b, by("id"));
        let keys: Vec<&str> = joined.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["8", "007"]);
        assert_eq!(joined[1].secondary("v"), "z");
    }

    #[test]
    fn test_join_with_different_key_columns() {
        let log = table(&["item_id"], &[&["case1"]]);
        let meta = table(&["filename", "title"], &[&["case1.mp4", "Case one"]]);

        let joined = join_with(
            &log,
            &meta,
            by("item_id"),
            |row: &Row| row.get("filename").map(|f| crate::engine::identity::resolve(f)),
        );
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].get("title"), "Case one");
    }

    #[test]
    fn test_empty_intersection_is_not_an_error() {
        let a = table(&["id"], &[&["1"]]);
        let b = table(&["id"], &[&["2"]]);
        assert!(join(&a, &b, by("id")).is_empty());
    }

    #[test]
    fn test_blank_keys_never_join() {
        let a = table(&["id"], &[&[""]]);
        let b = table(&["id"], &[&[" "]]);
        assert!(join(&a, &b, by("id")).is_empty());
        assert_eq!(normalize_key("3.5"), Some("3.5".to_string()));
    }

    #[test]
    fn test_csv_round_trip_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("summary.csv");
        let original = table(&["a", "b"], &[&["1", "x, y"]]);

        original.write_csv(&path).unwrap();
        assert_eq!(Table::from_csv(&path).unwrap(), original);
    }
}
