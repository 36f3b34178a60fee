//! Shared fixtures for the integration tests.
//!
//! Dumps are written as SQL scripts using the production schema, preceded by
//! the database-level statements a real dump carries.

#![allow(dead_code)]

use project_import::config::StagingConfig;
use project_import::db::Database;
use project_import::service::ProjectLoadService;
use rusqlite::params;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const SCHEMA: &str = include_str!("../../migrations/V1__initial_schema.sql");

const DUMP_HEADER: &str = "-- dump of prod\nCREATE DATABASE `prod`;\nUSE `prod`;\n\n";

/// Remote user owning every row of the test dumps.
pub const DUMP_USER_SQL: &str = "INSERT INTO users (id, name) VALUES (9, 'remote');\n";

/// Project 500 'Alpha': one context, one field and a template whose body
/// references the field.
pub const ALPHA_SQL: &str = "\
INSERT INTO projects (id, user_id, name, label, settings, local_path) VALUES (500, 9, 'Alpha', 'alpha', '{}', '/home/remote/alpha');
INSERT INTO contexts (id, project_id, name) VALUES (40, 500, 'Main');
INSERT INTO fields (id, project_id, user_id, context_id, name, field_type) VALUES (60, 500, 9, 40, 'Title', 'text');
INSERT INTO templates (id, project_id, context_id, name, body) VALUES (70, 500, 40, 'Card', '{\"ops\":[{\"insert\":\"FLD:{{60}}\"}]}');
";

/// Instance and note content for project 500.
pub const ALPHA_CONTENT_SQL: &str = "\
INSERT INTO field_options (id, field_id, value, label) VALUES (65, 60, 'a', 'A');
INSERT INTO field_options (id, field_id, value, label) VALUES (66, 60, 'b', 'B');
INSERT INTO template_fields (template_id, field_id, sort_order) VALUES (70, 60, 0);
INSERT INTO instances (id, template_id, name, data) VALUES (75, 70, 'First card', '{}');
INSERT INTO notes (id, project_id, instance_id, created_by, title, body) VALUES (85, 500, 75, 9, 'Remember', 'body');
";

/// Project 600 'Beta' with one field.
pub const BETA_SQL: &str = "\
INSERT INTO projects (id, user_id, name, label) VALUES (600, 9, 'Beta', 'beta');
INSERT INTO fields (id, project_id, user_id, name, field_type) VALUES (90, 600, 9, 'Owner', 'text');
";

/// Temporary production database with one importing user.
pub struct Fixture {
    pub dir: TempDir,
    pub service: ProjectLoadService,
    pub user: i64,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let db = Database::open(dir.path().join("prod.db")).expect("open database");
        let user = db.create_user("importer").expect("create user");
        let service = ProjectLoadService::from_config(db, &staging_config(dir.path()));
        Self { dir, service, user }
    }

    pub fn db(&self) -> &Database {
        self.service.database()
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.dir.path().join("staging")
    }

    /// Write a dump containing the production schema plus `rows`.
    pub fn write_dump(&self, name: &str, rows: &str) -> PathBuf {
        write_dump(self.dir.path(), name, &format!("{}{}{}", SCHEMA, DUMP_USER_SQL, rows))
    }

    /// Write a dump with an arbitrary schema.
    pub fn write_raw_dump(&self, name: &str, sql: &str) -> PathBuf {
        write_dump(self.dir.path(), name, sql)
    }

    pub fn add_project(&self, name: &str, label: Option<&str>) -> i64 {
        let user = self.user;
        self.db()
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO projects (user_id, name, label) VALUES (?1, ?2, ?3)",
                    params![user, name, label],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .expect("insert project")
    }

    pub fn add_field(&self, project: Option<i64>, name: &str, field_type: &str) -> i64 {
        let user = self.user;
        self.db()
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO fields (project_id, user_id, name, field_type) VALUES (?1, ?2, ?3, ?4)",
                    params![project, user, name, field_type],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .expect("insert field")
    }

    pub fn count(&self, table: &str) -> i64 {
        self.db().count_rows(table).expect("count rows")
    }

    /// Single integer from a query with no parameters.
    pub fn query_i64(&self, sql: &str) -> i64 {
        self.db()
            .with_conn(|conn| Ok(conn.query_row(sql, [], |row| row.get(0))?))
            .expect("query")
    }

    pub fn query_str(&self, sql: &str) -> Option<String> {
        self.db()
            .with_conn(|conn| Ok(conn.query_row(sql, [], |row| row.get(0))?))
            .expect("query")
    }

    /// Staging files still present on disk.
    pub fn staging_files(&self) -> Vec<String> {
        match std::fs::read_dir(self.staging_dir()) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

pub fn staging_config(root: &Path) -> StagingConfig {
    StagingConfig {
        dir: root.join("staging"),
        ..StagingConfig::default()
    }
}

pub fn write_dump(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("{}{}", DUMP_HEADER, body)).expect("write dump");
    path
}

/// Token for a placeholder of the given prefix.
pub fn token(prefix: &str, id: i64) -> String {
    format!("{}:{{{{{}}}}}", prefix, id)
}
