//! Schema introspection against the SQLite catalog.
//!
//! Column lists are always read from the live catalog so the loader keeps
//! working when production and the dump drift apart.

use super::{now_timestamp, quote_ident};
use anyhow::Result;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

/// Information about a table column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    /// Declared default expression as written in the DDL.
    pub default_sql: Option<String>,
    /// Declared default evaluated at introspection time.
    #[serde(skip)]
    pub default_value: Option<Value>,
    pub primary_key: bool,
    pub auto_increment: bool,
}

/// Columns of one table, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct TableColumns {
    columns: Vec<ColumnInfo>,
}

impl TableColumns {
    pub fn get(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }
}

/// Reads column and table metadata for any attached schema.
pub struct SchemaInspector<'c> {
    conn: &'c Connection,
}

impl<'c> SchemaInspector<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Column metadata for `schema.table`. A missing table yields no columns.
    pub fn column_info(&self, schema: &str, table: &str) -> Result<TableColumns> {
        let mut stmt = self.conn.prepare(&format!(
            "PRAGMA {}.table_info({})",
            quote_ident(schema),
            quote_ident(table)
        ))?;

        // (name, type, notnull, dflt_value, pk)
        let raw: Vec<(String, String, bool, Option<String>, i32)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(1)?,
                    row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    row.get::<_, i32>(3)? != 0,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let pk_count = raw.iter().filter(|c| c.4 > 0).count();

        let mut columns = Vec::with_capacity(raw.len());
        for (name, data_type, not_null, default_sql, pk) in raw {
            let data_type = data_type.to_uppercase();
            // Only a lone INTEGER primary key aliases the rowid.
            let auto_increment = pk > 0 && pk_count == 1 && data_type == "INTEGER";
            let default_value = match &default_sql {
                Some(expr) => Some(self.evaluate_default(expr)),
                None => None,
            };
            columns.push(ColumnInfo {
                name,
                nullable: !not_null && !auto_increment,
                data_type,
                default_sql,
                default_value,
                primary_key: pk > 0,
                auto_increment,
            });
        }

        Ok(TableColumns { columns })
    }

    fn evaluate_default(&self, expr: &str) -> Value {
        self.conn
            .query_row(&format!("SELECT {}", expr), [], |row| row.get::<_, Value>(0))
            .unwrap_or_else(|_| Value::Text(expr.trim_matches('\'').to_string()))
    }

    /// Whether `schema.table` exists.
    pub fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                &format!(
                    "SELECT 1 FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
                    quote_ident(schema)
                ),
                params![table],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Names of all user tables in a schema.
    pub fn table_names(&self, schema: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT name FROM {}.sqlite_master
             WHERE type = 'table'
             AND name NOT LIKE 'sqlite_%'
             AND name NOT LIKE 'refinery_%'
             ORDER BY name",
            quote_ident(schema)
        ))?;

        let names: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(names)
    }

    /// Columns to name in an INSERT, in declaration order.
    pub fn insert_columns(
        &self,
        schema: &str,
        table: &str,
        exclude: &[&str],
        exclude_auto_increment: bool,
    ) -> Result<Vec<String>> {
        let columns = self.column_info(schema, table)?;
        Ok(columns
            .iter()
            .filter(|c| !exclude.contains(&c.name.as_str()))
            .filter(|c| !(exclude_auto_increment && c.auto_increment))
            .map(|c| c.name.clone())
            .collect())
    }
}

/// Value used for a column the dump does not carry.
///
/// NULL when allowed, otherwise the declared default, otherwise a zero value
/// matching the column's type.
pub fn fallback_value(column: &ColumnInfo) -> Value {
    if column.nullable {
        return Value::Null;
    }
    if let Some(default) = &column.default_value {
        return default.clone();
    }

    let ty = column.data_type.as_str();
    if ty.contains("JSON") {
        Value::Text("{}".to_string())
    } else if ty.contains("DATE") || ty.contains("TIME") {
        Value::Text(now_timestamp())
    } else if ty.contains("INT") || ty.contains("BOOL") {
        Value::Integer(0)
    } else if ty.contains("CHAR") || ty.contains("CLOB") || ty.contains("TEXT") {
        Value::Text(String::new())
    } else if ty.contains("REAL") || ty.contains("FLOA") || ty.contains("DOUB") {
        Value::Real(0.0)
    } else if ty.contains("NUM") || ty.contains("DEC") {
        Value::Integer(0)
    } else if ty.contains("BLOB") {
        Value::Blob(Vec::new())
    } else {
        Value::Text(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(data_type: &str, nullable: bool, default_value: Option<Value>) -> ColumnInfo {
        ColumnInfo {
            name: "c".to_string(),
            data_type: data_type.to_string(),
            nullable,
            default_sql: None,
            default_value,
            primary_key: false,
            auto_increment: false,
        }
    }

    fn conn_with_table() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE things (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                settings TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                note TEXT
            );
            CREATE TABLE links (a INTEGER NOT NULL, b INTEGER NOT NULL, PRIMARY KEY (a, b));",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_fallback_prefers_null_then_default() {
        assert_eq!(fallback_value(&column("TEXT", true, None)), Value::Null);
        assert_eq!(
            fallback_value(&column("TEXT", false, Some(Value::Text("x".into())))),
            Value::Text("x".into())
        );
    }

    #[test]
    fn test_fallback_zero_values_by_type() {
        assert_eq!(fallback_value(&column("TEXT", false, None)), Value::Text(String::new()));
        assert_eq!(fallback_value(&column("VARCHAR(64)", false, None)), Value::Text(String::new()));
        assert_eq!(fallback_value(&column("INTEGER", false, None)), Value::Integer(0));
        assert_eq!(fallback_value(&column("JSON", false, None)), Value::Text("{}".into()));
        assert_eq!(fallback_value(&column("REAL", false, None)), Value::Real(0.0));
        match fallback_value(&column("DATETIME", false, None)) {
            Value::Text(ts) => assert_eq!(ts.len(), 19),
            other => panic!("expected timestamp, got {:?}", other),
        }
    }

    #[test]
    fn test_column_info_reads_catalog() {
        let conn = conn_with_table();
        let inspector = SchemaInspector::new(&conn);
        let cols = inspector.column_info("main", "things").unwrap();

        assert_eq!(cols.len(), 5);
        let id = cols.get("id").unwrap();
        assert!(id.auto_increment);
        assert!(!id.nullable);

        let name = cols.get("name").unwrap();
        assert!(!name.nullable);
        assert_eq!(name.default_value, None);

        let settings = cols.get("settings").unwrap();
        assert_eq!(settings.default_value, Some(Value::Text("{}".into())));

        // CURRENT_TIMESTAMP is evaluated, not copied as text
        match cols.get("created_at").unwrap().default_value.as_ref().unwrap() {
            Value::Text(ts) => assert_ne!(ts, "CURRENT_TIMESTAMP"),
            other => panic!("unexpected default {:?}", other),
        }

        assert!(cols.get("note").unwrap().nullable);
    }

    #[test]
    fn test_composite_key_is_not_auto_increment() {
        let conn = conn_with_table();
        let cols = SchemaInspector::new(&conn).column_info("main", "links").unwrap();
        assert!(cols.iter().all(|c| !c.auto_increment));
    }

    #[test]
    fn test_missing_table() {
        let conn = conn_with_table();
        let inspector = SchemaInspector::new(&conn);
        assert!(inspector.column_info("main", "nope").unwrap().is_empty());
        assert!(!inspector.table_exists("main", "nope").unwrap());
        assert!(inspector.table_exists("main", "things").unwrap());
    }

    #[test]
    fn test_insert_columns_exclusions() {
        let conn = conn_with_table();
        let inspector = SchemaInspector::new(&conn);
        let cols = inspector
            .insert_columns("main", "things", &["note"], true)
            .unwrap();
        assert_eq!(cols, vec!["name", "settings", "created_at"]);

        let cols = inspector.insert_columns("main", "things", &[], false).unwrap();
        assert_eq!(cols[0], "id");
    }

    #[test]
    fn test_table_names_skips_internal_tables() {
        let conn = conn_with_table();
        let names = SchemaInspector::new(&conn).table_names("main").unwrap();
        assert_eq!(names, vec!["links", "things"]);
    }
}
