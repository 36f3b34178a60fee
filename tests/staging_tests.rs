//! Integration tests for staging schema lifecycle and orphan cleanup.

mod common;

use common::*;
use project_import::db::Database;
use project_import::db::schema::SchemaInspector;
use project_import::db::staging::DumpImporter;
use project_import::error::ErrorCode;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn setup() -> (TempDir, Database, DumpImporter) {
    let dir = TempDir::new().expect("tempdir");
    let db = Database::open(dir.path().join("prod.db")).expect("open database");
    let importer = DumpImporter::new(&staging_config(dir.path()));
    (dir, db, importer)
}

fn populated_file(path: &Path) {
    let conn = Connection::open(path).expect("open staging file");
    conn.execute_batch("CREATE TABLE projects (id INTEGER PRIMARY KEY);")
        .expect("create table");
}

fn age_file(path: &Path, age: Duration) {
    std::fs::File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::now() - age))
        .expect("set mtime");
}

fn staging_path(dir: &TempDir, name: &str) -> PathBuf {
    let staging = dir.path().join("staging");
    std::fs::create_dir_all(&staging).expect("staging dir");
    staging.join(name)
}

mod lifecycle {
    use super::*;

    #[test]
    fn import_attaches_and_drop_removes() {
        let (dir, db, importer) = setup();
        let dump = write_dump(
            dir.path(),
            "alpha.sql",
            &format!("{}{}{}", SCHEMA, DUMP_USER_SQL, ALPHA_SQL),
        );

        let schema = importer.create_staging_schema(&db).expect("create");
        assert!(schema.starts_with("import_staging_"));
        let path = importer.schema_path(&schema);
        assert!(path.exists());

        importer.import_dump(&db, &dump, &schema).expect("import");
        let has_projects = db
            .with_conn(|conn| SchemaInspector::new(conn).table_exists(&schema, "projects"))
            .expect("inspect");
        assert!(has_projects);
        let staged: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    &format!("SELECT COUNT(*) FROM \"{}\".projects", schema),
                    [],
                    |row| row.get(0),
                )?)
            })
            .expect("count");
        assert_eq!(staged, 1);
        assert_eq!(db.count_rows("projects").expect("count"), 0);

        importer.drop_schema(&db, &schema).expect("drop");
        assert!(!path.exists());
        let still_attached = db
            .with_conn(|conn| SchemaInspector::new(conn).table_exists(&schema, "projects"))
            .unwrap_or(false);
        assert!(!still_attached);
    }

    #[test]
    fn drop_of_missing_schema_is_a_no_op() {
        let (_dir, db, importer) = setup();
        importer
            .drop_schema(&db, "import_staging_404")
            .expect("drop missing");
    }

    #[test]
    fn create_replaces_stale_schema_of_same_name() {
        let (_dir, db, importer) = setup();
        let schema = importer.schema_name();
        let path = importer.schema_path(&schema);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("dir");
        populated_file(&path);

        let created = importer.create_staging_schema(&db).expect("create");
        assert_eq!(created, schema);
        let conn = Connection::open(&path).expect("open");
        let tables = SchemaInspector::new(&conn).table_names("main").expect("tables");
        assert!(tables.is_empty());
    }

    #[test]
    fn invalid_sql_is_an_import_failure() {
        let (dir, db, importer) = setup();
        let dump = write_dump(dir.path(), "bad.sql", "INSERT INTO nowhere VALUES (1);\n");

        let schema = importer.create_staging_schema(&db).expect("create");
        let err = importer.import_dump(&db, &dump, &schema).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ImportFailed);

        importer.drop_schema(&db, &schema).expect("drop");
        assert!(!importer.schema_path(&schema).exists());
    }

    #[test]
    fn validate_checks_extension_and_kind() {
        let (dir, _db, importer) = setup();

        let upper = dir.path().join("prod.DUMP");
        std::fs::write(&upper, "SELECT 1;").expect("write");
        assert!(importer.validate(&upper).is_ok());

        let folder = dir.path().join("folder.sql");
        std::fs::create_dir(&folder).expect("mkdir");
        let err = importer.validate(&folder).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidDump);

        let err = importer.validate(&dir.path().join("absent.sql")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidDump);
    }
}

mod cleanup {
    use super::*;

    #[test]
    fn cleanup_without_staging_dir_removes_nothing() {
        let (_dir, db, importer) = setup();
        let removed = importer.cleanup_orphaned(&db).expect("cleanup");
        assert!(removed.is_empty());
    }

    #[test]
    fn empty_schema_is_removed_regardless_of_age() {
        let (dir, db, importer) = setup();
        let path = staging_path(&dir, "import_staging_424242.db");
        std::fs::File::create(&path).expect("create");

        let removed = importer.cleanup_orphaned(&db).expect("cleanup");

        assert_eq!(
            removed.get("import_staging_424242").map(String::as_str),
            Some("empty")
        );
        assert!(!path.exists());
    }

    #[test]
    fn recent_populated_schema_is_kept() {
        let (dir, db, importer) = setup();
        let path = staging_path(&dir, "import_staging_424243.db");
        populated_file(&path);

        let removed = importer.cleanup_orphaned(&db).expect("cleanup");

        assert!(removed.is_empty());
        assert!(path.exists());
    }

    #[test]
    fn old_populated_schema_is_removed_with_age() {
        let (dir, db, importer) = setup();
        let path = staging_path(&dir, "import_staging_424244.db");
        populated_file(&path);
        age_file(&path, Duration::from_secs(2 * 3600 + 120));

        let removed = importer.cleanup_orphaned(&db).expect("cleanup");

        let age = removed.get("import_staging_424244").expect("removed");
        assert!(age.starts_with("2h"), "age was {}", age);
        assert!(!path.exists());
    }

    #[test]
    fn unrelated_files_are_left_alone() {
        let (dir, db, importer) = setup();
        let other = staging_path(&dir, "other.db");
        std::fs::File::create(&other).expect("create");
        let note = staging_path(&dir, "import_staging_1.txt");
        std::fs::write(&note, "keep").expect("write");

        let removed = importer.cleanup_orphaned(&db).expect("cleanup");

        assert!(removed.is_empty());
        assert!(other.exists());
        assert!(note.exists());
    }

    #[test]
    fn service_cleanup_sweeps_the_configured_directory() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.staging_dir()).expect("dir");
        let path = fx.staging_dir().join("import_staging_77.db");
        std::fs::File::create(&path).expect("create");

        let removed = fx.service.cleanup().expect("cleanup");

        assert_eq!(removed.len(), 1);
        assert!(fx.staging_files().is_empty());
    }
}
