//! # Migration Discovery
//!
//! The scripting capability behind migrations stays abstract: a
//! [`MigrationSource`] turns a database name and a version range into ordered
//! executable statements. The bundled [`FileMigrationSource`] discovers plain
//! SQL scripts from a directory tree using a `<version>_<name>.sql` naming
//! convention.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{DispatchError, Result};

/// One discovered migration script, already reduced to executable statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    pub version: i64,
    pub name: String,
    pub statements: Vec<String>,
}

/// Discovery/scripting capability consumed by the topology manager.
#[async_trait]
pub trait MigrationSource: Send + Sync {
    /// Highest script version available for `database`, 0 when none exist.
    async fn latest_available(&self, database: &str) -> Result<i64>;

    /// Scripts with `after < version <= up_to`, ordered by version.
    async fn scripts_between(
        &self,
        database: &str,
        after: i64,
        up_to: i64,
    ) -> Result<Vec<MigrationScript>>;
}

/// Filesystem-backed source: `<root>/<database>/<version>_<name>.sql`.
pub struct FileMigrationSource {
    root: PathBuf,
}

impl FileMigrationSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn discover(&self, database: &str) -> Result<BTreeMap<i64, (String, PathBuf)>> {
        let dir = self.root.join(database);
        let mut scripts = BTreeMap::new();
        if !dir.exists() {
            return Ok(scripts);
        }

        let entries = fs::read_dir(&dir).map_err(|e| {
            DispatchError::Migration(format!("cannot read {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let entry = entry
                .map_err(|e| DispatchError::Migration(format!("cannot read entry: {e}")))?;
            let path = entry.path();
            if !path.is_file() || path.extension().map(|s| s != "sql").unwrap_or(true) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Some((version, name)) = parse_script_filename(stem) {
                    scripts.insert(version, (name, path));
                }
            }
        }

        Ok(scripts)
    }

    fn read_script(version: i64, name: &str, path: &Path) -> Result<MigrationScript> {
        let sql = fs::read_to_string(path).map_err(|e| {
            DispatchError::Migration(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(MigrationScript {
            version,
            name: name.to_string(),
            statements: split_statements(&sql),
        })
    }
}

#[async_trait]
impl MigrationSource for FileMigrationSource {
    async fn latest_available(&self, database: &str) -> Result<i64> {
        let scripts = self.discover(database)?;
        Ok(scripts.keys().next_back().copied().unwrap_or(0))
    }

    async fn scripts_between(
        &self,
        database: &str,
        after: i64,
        up_to: i64,
    ) -> Result<Vec<MigrationScript>> {
        if after >= up_to {
            return Ok(Vec::new());
        }
        let discovered = self.discover(database)?;
        let mut scripts = Vec::new();
        for (version, (name, path)) in discovered.range((after + 1)..=up_to) {
            scripts.push(Self::read_script(*version, name, path)?);
        }
        Ok(scripts)
    }
}

/// Parse `<version>_<name>` into its parts. Version must be all digits.
fn parse_script_filename(stem: &str) -> Option<(i64, String)> {
    let (version_part, name_part) = stem.split_once('_')?;
    if version_part.is_empty() || !version_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let version = version_part.parse().ok()?;
    Some((version, name_part.replace('_', " ")))
}

/// Split a script into statements on `;`, dropping empties and pure comments.
fn split_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.starts_with("--"))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_script(dir: &Path, filename: &str, sql: &str) {
        fs::write(dir.join(filename), sql).unwrap();
    }

    #[test]
    fn filename_parsing() {
        assert_eq!(
            parse_script_filename("1000_create_users"),
            Some((1000, "create users".to_string()))
        );
        assert_eq!(parse_script_filename("notes"), None);
        assert_eq!(parse_script_filename("abc_create"), None);
    }

    #[test]
    fn statement_splitting_drops_comments_and_empties() {
        let statements = split_statements(
            "-- header\nCREATE TABLE t (id INT);\n\nINSERT INTO t VALUES (1);\n;",
        );
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("CREATE TABLE"));
        assert!(statements[1].contains("INSERT"));
    }

    #[tokio::test]
    async fn discovers_ordered_scripts() {
        let tmp = tempfile::tempdir().unwrap();
        let db_dir = tmp.path().join("orders");
        fs::create_dir_all(&db_dir).unwrap();
        write_script(&db_dir, "1001_add_index.sql", "CREATE INDEX i ON t (a);");
        write_script(&db_dir, "1000_create_tables.sql", "CREATE TABLE t (a INT);");
        write_script(&db_dir, "readme.txt", "not a script");

        let source = FileMigrationSource::new(tmp.path());
        assert_eq!(source.latest_available("orders").await.unwrap(), 1001);

        let scripts = source.scripts_between("orders", 0, 1001).await.unwrap();
        assert_eq!(scripts.len(), 2);
        assert_eq!(scripts[0].version, 1000);
        assert_eq!(scripts[1].version, 1001);
    }

    #[tokio::test]
    async fn range_is_exclusive_of_already_loaded() {
        let tmp = tempfile::tempdir().unwrap();
        let db_dir = tmp.path().join("orders");
        fs::create_dir_all(&db_dir).unwrap();
        write_script(&db_dir, "1000_a.sql", "SELECT 1;");
        write_script(&db_dir, "1001_b.sql", "SELECT 2;");

        let source = FileMigrationSource::new(tmp.path());
        let scripts = source.scripts_between("orders", 1000, 1001).await.unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].version, 1001);
    }

    #[tokio::test]
    async fn missing_database_dir_is_empty_not_error() {
        let tmp = tempfile::tempdir().unwrap();
        let source = FileMigrationSource::new(tmp.path());
        assert_eq!(source.latest_available("ghost").await.unwrap(), 0);
        assert!(source.scripts_between("ghost", 0, 100).await.unwrap().is_empty());
    }
}
