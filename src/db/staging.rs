//! Staging schemas for dump files.
//!
//! A dump is never executed against production. It is loaded into its own
//! SQLite file, which is then ATTACHed to the production connection under a
//! schema name derived from the process id. The loader reads from that schema
//! and the file is removed once the call finishes.
//!
//! Orphaned staging files left by crashed runs are swept by age: empty files
//! are always removed, populated ones only once they are older than the
//! configured threshold.

use super::schema::SchemaInspector;
use super::{Database, quote_ident};
use crate::config::StagingConfig;
use crate::error::{LoadError, LoadResult};
use anyhow::{Context, Result};
use regex_lite::Regex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Extensions accepted for dump files.
pub const DUMP_EXTENSIONS: &[&str] = &["sql", "dump"];

/// Leading keywords of statements that would escape the staging schema:
/// switching, creating or dropping databases, and attaching other files.
static FOREIGN_DATABASE_STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:(?:USE|ATTACH|DETACH)\b|(?:CREATE|DROP)\s+(?:DATABASE|SCHEMA)\b)")
        .expect("static regex")
});

/// Side files SQLite may leave next to a database file.
const SIDE_FILE_SUFFIXES: &[&str] = &["-wal", "-shm", "-journal"];

/// Creates, fills and removes staging schemas.
#[derive(Debug, Clone)]
pub struct DumpImporter {
    staging_dir: PathBuf,
    prefix: String,
    orphan_max_age: Duration,
    large_dump_warn_bytes: u64,
}

impl DumpImporter {
    pub fn new(config: &StagingConfig) -> Self {
        Self {
            staging_dir: config.dir.clone(),
            prefix: config.prefix.clone(),
            orphan_max_age: Duration::from_secs(config.orphan_max_age_secs),
            large_dump_warn_bytes: config.large_dump_warn_bytes,
        }
    }

    /// Schema name used by this process.
    pub fn schema_name(&self) -> String {
        format!("{}{}", self.prefix, std::process::id())
    }

    /// File backing a staging schema.
    pub fn schema_path(&self, schema: &str) -> PathBuf {
        self.staging_dir.join(format!("{}.db", schema))
    }

    /// Check that a dump file exists, is readable and has a known extension.
    ///
    /// Large files are accepted with a warning.
    pub fn validate(&self, path: &Path) -> LoadResult<PathBuf> {
        let canonical = path
            .canonicalize()
            .map_err(|e| LoadError::invalid_dump(path, format!("not found: {}", e)))?;

        let metadata = std::fs::metadata(&canonical)
            .map_err(|e| LoadError::invalid_dump(&canonical, format!("unreadable: {}", e)))?;
        if !metadata.is_file() {
            return Err(LoadError::invalid_dump(&canonical, "not a regular file"));
        }

        let extension = canonical
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match extension.as_deref() {
            Some(ext) if DUMP_EXTENSIONS.contains(&ext) => {}
            _ => {
                return Err(LoadError::invalid_dump(
                    &canonical,
                    format!("unsupported extension (expected {})", DUMP_EXTENSIONS.join(", ")),
                ));
            }
        }

        std::fs::File::open(&canonical)
            .map_err(|e| LoadError::invalid_dump(&canonical, format!("unreadable: {}", e)))?;

        if metadata.len() > self.large_dump_warn_bytes {
            warn!(
                path = %canonical.display(),
                bytes = metadata.len(),
                "Dump file is large; import may take a while"
            );
        }

        Ok(canonical)
    }

    /// Create an empty staging schema for this process.
    ///
    /// A leftover schema with the same name is dropped first.
    pub fn create_staging_schema(&self, db: &Database) -> LoadResult<String> {
        let schema = self.schema_name();
        let path = self.schema_path(&schema);

        if path.exists() || is_attached(db, &schema).map_err(|e| LoadError::schema_creation(&schema, e))? {
            warn!(schema = %schema, "Dropping stale staging schema left by an earlier run");
            self.drop_schema(db, &schema)
                .map_err(|e| LoadError::schema_creation(&schema, e))?;
        }

        std::fs::create_dir_all(&self.staging_dir)
            .with_context(|| format!("creating {}", self.staging_dir.display()))
            .map_err(|e| LoadError::schema_creation(&schema, format!("{:#}", e)))?;

        Connection::open(&path)
            .and_then(|conn| conn.execute_batch("PRAGMA journal_mode=DELETE;"))
            .map_err(|e| LoadError::schema_creation(&schema, e))?;

        debug!(schema = %schema, path = %path.display(), "Created staging schema");
        Ok(schema)
    }

    /// Execute a dump into a staging schema and attach it to the production connection.
    ///
    /// Statements that target other databases are stripped first. Partial
    /// effects are left in place on failure; the caller drops the schema.
    pub fn import_dump(&self, db: &Database, path: &Path, schema: &str) -> LoadResult<()> {
        let sql = std::fs::read_to_string(path)
            .map_err(|e| LoadError::invalid_dump(path, format!("unreadable: {}", e)))?;
        let (sanitized, stripped) = sanitize_dump(&sql);
        if stripped > 0 {
            debug!(stripped, "Removed database-level statements from dump");
        }

        let staging_path = self.schema_path(schema);
        {
            let conn = Connection::open(&staging_path)
                .map_err(|e| LoadError::import_failed(schema, e))?;
            // Dumps list tables alphabetically, not in dependency order.
            conn.execute_batch("PRAGMA foreign_keys=OFF;")
                .and_then(|()| conn.execute_batch(&sanitized))
                .map_err(|e| LoadError::import_failed(schema, e))?;
        }

        db.with_conn(|conn| {
            let location = staging_path.to_string_lossy().to_string();
            conn.execute(
                &format!("ATTACH DATABASE ?1 AS {}", quote_ident(schema)),
                params![location],
            )?;
            Ok(())
        })
        .map_err(|e| LoadError::import_failed(schema, e))?;

        info!(schema = %schema, dump = %path.display(), "Dump imported into staging schema");
        Ok(())
    }

    /// Drop a staging schema if it exists. Never fails on a missing schema.
    pub fn drop_schema(&self, db: &Database, schema: &str) -> Result<()> {
        if is_attached(db, schema)? {
            db.with_conn(|conn| {
                conn.execute(&format!("DETACH DATABASE {}", quote_ident(schema)), [])?;
                Ok(())
            })?;
        }

        let path = self.schema_path(schema);
        remove_if_exists(&path)?;
        for suffix in SIDE_FILE_SUFFIXES {
            let mut side = path.clone().into_os_string();
            side.push(suffix);
            remove_if_exists(Path::new(&side))?;
        }

        debug!(schema = %schema, "Dropped staging schema");
        Ok(())
    }

    /// Remove staging schemas abandoned by earlier runs.
    ///
    /// Returns each removed schema with a short description of its age.
    pub fn cleanup_orphaned(&self, db: &Database) -> Result<BTreeMap<String, String>> {
        let mut removed = BTreeMap::new();

        let entries = match std::fs::read_dir(&self.staging_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.staging_dir.display()));
            }
        };

        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(schema) = file_name.strip_suffix(".db") else {
                continue;
            };
            if !schema.starts_with(&self.prefix) {
                continue;
            }

            let path = entry.path();
            let table_count = count_tables(&path).unwrap_or(0);

            let verdict = if table_count == 0 {
                Some("empty".to_string())
            } else {
                let age = file_age(&path)?;
                if age >= self.orphan_max_age {
                    Some(describe_age(age))
                } else {
                    None
                }
            };

            match verdict {
                Some(age) => {
                    info!(schema = %schema, age = %age, "Removing orphaned staging schema");
                    self.drop_schema(db, schema)?;
                    removed.insert(schema.to_string(), age);
                }
                None => {
                    debug!(schema = %schema, "Keeping recent staging schema");
                }
            }
        }

        Ok(removed)
    }
}

/// Strip statements that address databases other than the staging one.
///
/// Only whole statements are removed; text inside literals is never matched.
/// Returns the remaining SQL and the number of statements removed.
pub fn sanitize_dump(sql: &str) -> (String, usize) {
    let mut clean = String::with_capacity(sql.len());
    let mut stripped = 0;
    for statement in split_statements(sql) {
        if FOREIGN_DATABASE_STATEMENT.is_match(statement_head(statement)) {
            stripped += 1;
        } else {
            clean.push_str(statement);
        }
    }
    (clean, stripped)
}

/// Split a script at semicolons outside quotes and comments.
///
/// Pieces keep their leading whitespace and comments, so joining them gives
/// back the input. Text after the last semicolon is the final piece.
fn split_statements(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                // A doubled quote closes and reopens the literal.
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 1;
            }
            b';' => {
                pieces.push(&sql[start..=i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    if start < sql.len() {
        pieces.push(&sql[start..]);
    }
    pieces
}

/// Statement text after leading whitespace and comments.
fn statement_head(statement: &str) -> &str {
    let mut rest = statement.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.find('\n').map_or("", |n| &after[n + 1..]).trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.find("*/").map_or("", |n| &after[n + 2..]).trim_start();
        } else {
            return rest;
        }
    }
}

fn is_attached(db: &Database, schema: &str) -> Result<bool> {
    db.with_conn(|conn| {
        let found = conn
            .query_row(
                "SELECT 1 FROM pragma_database_list WHERE name = ?1",
                params![schema],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    })
}

fn count_tables(path: &Path) -> Result<usize> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let tables = SchemaInspector::new(&conn).table_names("main")?;
    Ok(tables.len())
}

fn file_age(path: &Path) -> Result<Duration> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

/// Human-readable age, e.g. `2h 5m`.
pub fn describe_age(age: Duration) -> String {
    let secs = age.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_database_statements() {
        let sql = "-- dump\n\
                   CREATE DATABASE /*!32312 IF NOT EXISTS*/ `prod` DEFAULT CHARSET utf8;\n\
                   USE `prod`;\n\
                   DROP DATABASE IF EXISTS other;\n\
                   CREATE TABLE t (id INTEGER);\n\
                   INSERT INTO t VALUES (1);\n\
                   attach database '/etc/x.db' as x;\n";
        let (clean, stripped) = sanitize_dump(sql);
        assert_eq!(stripped, 4);
        assert!(clean.contains("CREATE TABLE t"));
        assert!(clean.contains("INSERT INTO t VALUES (1);"));
        assert!(!clean.contains("USE"));
        assert!(!clean.contains("DATABASE"));
        assert!(!clean.to_lowercase().contains("attach"));
    }

    #[test]
    fn test_sanitize_keeps_column_named_use() {
        let sql = "CREATE TABLE t (\"use\" TEXT);\nINSERT INTO t VALUES ('USE it');\n";
        let (clean, stripped) = sanitize_dump(sql);
        assert_eq!(stripped, 0);
        assert_eq!(clean, sql);
    }

    #[test]
    fn test_sanitize_keeps_statement_text_inside_literals() {
        let sql = "INSERT INTO notes VALUES (1, 'first line\nuse caution; always');\n\
                   INSERT INTO notes VALUES (2, 'a\n  drop database x;\nattach it');\n";
        let (clean, stripped) = sanitize_dump(sql);
        assert_eq!(stripped, 0);
        assert_eq!(clean, sql);
    }

    #[test]
    fn test_sanitize_strips_use_without_space() {
        let sql = "USE`prod`;\nCREATE TABLE t (id INTEGER);\n/* c */ detach db;\n";
        let (clean, stripped) = sanitize_dump(sql);
        assert_eq!(stripped, 2);
        assert_eq!(clean, "\nCREATE TABLE t (id INTEGER);\n");
    }

    #[test]
    fn test_sanitize_keeps_words_starting_with_use() {
        let sql = "USERS;\nCREATE TABLE users (id INTEGER);\nINSERT INTO \"use\" VALUES (';');\n";
        let (clean, stripped) = sanitize_dump(sql);
        assert_eq!(stripped, 0);
        assert_eq!(clean, sql);
    }

    #[test]
    fn test_split_statements_respects_quotes_and_comments() {
        let sql = "SELECT 'a;b';\n-- x; y\nSELECT \"c;\";/* ; */SELECT 1";
        let pieces = split_statements(sql);
        assert_eq!(
            pieces,
            vec!["SELECT 'a;b';", "\n-- x; y\nSELECT \"c;\";", "/* ; */SELECT 1"]
        );
        assert_eq!(pieces.concat(), sql);
    }

    #[test]
    fn test_describe_age() {
        assert_eq!(describe_age(Duration::from_secs(42)), "42s");
        assert_eq!(describe_age(Duration::from_secs(125)), "2m 5s");
        assert_eq!(describe_age(Duration::from_secs(7_500)), "2h 5m");
    }
}
