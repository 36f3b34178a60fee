//! Rewriting of field references embedded in template documents.
//!
//! Template bodies reference fields with inline tokens such as `FLD:{{12}}`.
//! The number is a dump id and has to be rewritten to the local id of the
//! same field once the template's project has been loaded. Three kinds of
//! reference exist:
//!
//! - `FLD`: a field of the template's own project, resolved only through the
//!   id map of the current load.
//! - `GEN`: a global field (no project). Resolved through the id map, or by
//!   name among the importing user's local global fields.
//! - `EXT`: a field of another project in the dump. The owning project is
//!   matched to a local project by label, then by a unique name, and the field
//!   is looked up by name inside it.
//!
//! Resolution never fails a load. A token that cannot be resolved is left as
//! it is and a warning is recorded.

use crate::db::records::{Record, get_i64, get_str, query_records};
use crate::db::schema::SchemaInspector;
use crate::db::{MAIN_SCHEMA, qualified};
use crate::entities::{EntityType, ROOT_DELETED_COLUMN, ROOT_LABEL_COLUMN};
use crate::id_map::IdMap;
use anyhow::Result;
use regex_lite::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::LazyLock;
use tracing::debug;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(FLD|GEN|EXT):\{\{(\d+)\}\}").expect("static regex"));

/// Kind of field reference carried by a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PlaceholderKind {
    /// Field of the same project.
    Project,
    /// Field without a project.
    Global,
    /// Field of a different project.
    External,
}

impl PlaceholderKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            PlaceholderKind::Project => "FLD",
            PlaceholderKind::Global => "GEN",
            PlaceholderKind::External => "EXT",
        }
    }

    pub fn from_prefix(s: &str) -> Option<Self> {
        match s {
            "FLD" => Some(PlaceholderKind::Project),
            "GEN" => Some(PlaceholderKind::Global),
            "EXT" => Some(PlaceholderKind::External),
            _ => None,
        }
    }

    /// Token text for a field id.
    pub fn token(&self, id: i64) -> String {
        format!("{}:{{{{{}}}}}", self.prefix(), id)
    }
}

impl fmt::Display for PlaceholderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// All placeholders in a document, in order of appearance.
pub fn scan(body: &str) -> Vec<(PlaceholderKind, i64)> {
    PLACEHOLDER
        .captures_iter(body)
        .filter_map(|caps| {
            let kind = PlaceholderKind::from_prefix(caps.get(1)?.as_str())?;
            let id = caps.get(2)?.as_str().parse().ok()?;
            Some((kind, id))
        })
        .collect()
}

/// A field row as found in the dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpField {
    pub id: i64,
    pub project_id: Option<i64>,
    pub name: String,
    pub field_type: Option<String>,
}

impl DumpField {
    fn from_record(record: &Record) -> Option<Self> {
        Some(Self {
            id: get_i64(record, "id")?,
            project_id: get_i64(record, "project_id"),
            name: get_str(record, "name")?.to_string(),
            field_type: get_str(record, "field_type").map(str::to_string),
        })
    }

    pub fn is_global(&self) -> bool {
        self.project_id.is_none()
    }
}

/// A project row as found in the dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpProject {
    pub id: i64,
    pub name: String,
    pub label: Option<String>,
}

/// Resolves dump field ids inside documents and link rows to local ids.
///
/// Holds lookup caches for the staging schema only; every local lookup goes
/// to the database so that rows inserted earlier in the same load are seen.
#[derive(Debug)]
pub struct PlaceholderRemapper {
    staging: String,
    user_id: i64,
    dump_fields: HashMap<i64, Option<DumpField>>,
    dump_projects: HashMap<i64, Option<DumpProject>>,
    type_checked: HashSet<(i64, i64)>,
    warnings: Vec<String>,
}

impl PlaceholderRemapper {
    pub fn new(staging: impl Into<String>, user_id: i64) -> Self {
        Self {
            staging: staging.into(),
            user_id,
            dump_fields: HashMap::new(),
            dump_projects: HashMap::new(),
            type_checked: HashSet::new(),
            warnings: Vec::new(),
        }
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Hand over the warnings collected since the last call.
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    pub fn clear_warnings(&mut self) {
        self.warnings.clear();
    }

    fn warn(&mut self, message: String) {
        debug!(warning = %message, "Placeholder warning");
        self.warnings.push(message);
    }

    /// Rewrite every placeholder in `body`.
    ///
    /// `root_dump_id` is the dump id of the project the document belongs to.
    pub fn remap_document(
        &mut self,
        conn: &Connection,
        ids: &IdMap,
        root_dump_id: i64,
        body: &str,
    ) -> Result<String> {
        let mut out = String::with_capacity(body.len());
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(body) {
            let (Some(whole), Some(prefix), Some(digits)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            let (Some(kind), Ok(dump_id)) = (
                PlaceholderKind::from_prefix(prefix.as_str()),
                digits.as_str().parse::<i64>(),
            ) else {
                continue;
            };

            out.push_str(&body[last..whole.start()]);
            match self.resolve(conn, ids, root_dump_id, kind, dump_id)? {
                Some(local_id) => out.push_str(&kind.token(local_id)),
                None => out.push_str(whole.as_str()),
            }
            last = whole.end();
        }

        out.push_str(&body[last..]);
        Ok(out)
    }

    /// Resolve a bare field id from a link row.
    ///
    /// The kind of reference is derived from the dump: a field without a
    /// project is global, a field of another project is external.
    pub fn remap_field_id(
        &mut self,
        conn: &Connection,
        ids: &IdMap,
        root_dump_id: i64,
        dump_field_id: i64,
    ) -> Result<Option<i64>> {
        if let Some(local_id) = ids.get_field(dump_field_id) {
            return Ok(Some(local_id));
        }

        let kind = match self.dump_field(conn, dump_field_id)? {
            Some(field) if field.is_global() => PlaceholderKind::Global,
            Some(field) if field.project_id != Some(root_dump_id) => PlaceholderKind::External,
            _ => PlaceholderKind::Project,
        };
        self.resolve(conn, ids, root_dump_id, kind, dump_field_id)
    }

    /// Record the warnings a real load would produce for `body`, without
    /// touching production.
    ///
    /// `include_global_fields` tells whether missing global fields would be
    /// created by the load.
    pub fn check_document(
        &mut self,
        conn: &Connection,
        root_dump_id: i64,
        body: &str,
        include_global_fields: bool,
    ) -> Result<()> {
        let mut seen = BTreeSet::new();
        for (kind, dump_id) in scan(body) {
            if !seen.insert((kind, dump_id)) {
                continue;
            }
            match kind {
                PlaceholderKind::Project => {
                    let loaded = self
                        .dump_field(conn, dump_id)?
                        .is_some_and(|f| f.project_id == Some(root_dump_id));
                    if !loaded {
                        self.warn(format!(
                            "{}: field is not part of this project in the dump and will not be remapped",
                            kind.token(dump_id)
                        ));
                    }
                }
                PlaceholderKind::Global => {
                    let Some(field) = self.dump_field(conn, dump_id)? else {
                        self.warn_missing_dump_field(kind, dump_id);
                        continue;
                    };
                    match self.find_local_global(conn, &field.name)? {
                        Some((local_id, local_type)) => {
                            self.check_type(&field, local_id, local_type.as_deref());
                        }
                        None if include_global_fields => {}
                        None => self.warn_global_missing(kind, &field),
                    }
                }
                PlaceholderKind::External => {
                    self.resolve_external(conn, &IdMap::new(), dump_id)?;
                }
            }
        }
        Ok(())
    }

    fn resolve(
        &mut self,
        conn: &Connection,
        ids: &IdMap,
        root_dump_id: i64,
        kind: PlaceholderKind,
        dump_id: i64,
    ) -> Result<Option<i64>> {
        match kind {
            PlaceholderKind::Project => {
                let resolved = ids.get(EntityType::Field, dump_id);
                if resolved.is_none() {
                    let name = self
                        .dump_field(conn, dump_id)?
                        .map(|f| format!(" ('{}')", f.name))
                        .unwrap_or_default();
                    self.warn(format!(
                        "{}{}: field was not loaded with project {}; reference left unchanged",
                        kind.token(dump_id),
                        name,
                        root_dump_id
                    ));
                }
                Ok(resolved)
            }
            PlaceholderKind::Global => self.resolve_global(conn, ids, dump_id),
            PlaceholderKind::External => self.resolve_external(conn, ids, dump_id),
        }
    }

    fn resolve_global(&mut self, conn: &Connection, ids: &IdMap, dump_id: i64) -> Result<Option<i64>> {
        if let Some(local_id) = ids.get(EntityType::GlobalField, dump_id) {
            return Ok(Some(local_id));
        }

        let kind = PlaceholderKind::Global;
        let Some(field) = self.dump_field(conn, dump_id)? else {
            self.warn_missing_dump_field(kind, dump_id);
            return Ok(None);
        };

        match self.find_local_global(conn, &field.name)? {
            Some((local_id, local_type)) => {
                self.check_type(&field, local_id, local_type.as_deref());
                Ok(Some(local_id))
            }
            None => {
                self.warn_global_missing(kind, &field);
                Ok(None)
            }
        }
    }

    fn resolve_external(&mut self, conn: &Connection, ids: &IdMap, dump_id: i64) -> Result<Option<i64>> {
        if let Some(local_id) = ids.get(EntityType::Field, dump_id) {
            return Ok(Some(local_id));
        }

        let kind = PlaceholderKind::External;
        let Some(field) = self.dump_field(conn, dump_id)? else {
            self.warn_missing_dump_field(kind, dump_id);
            return Ok(None);
        };
        let Some(project_id) = field.project_id else {
            self.warn(format!(
                "{} ('{}'): field has no project in the dump; reference left unchanged",
                kind.token(dump_id),
                field.name
            ));
            return Ok(None);
        };
        let Some(project) = self.dump_project(conn, project_id)? else {
            self.warn(format!(
                "{} ('{}'): owning project {} is not in the dump; reference left unchanged",
                kind.token(dump_id),
                field.name,
                project_id
            ));
            return Ok(None);
        };

        let Some(local_project) = self.resolve_local_project(conn, ids, &project)? else {
            self.warn(format!(
                "{} ('{}'): linked project '{}' could not be matched to a local project; reference left unchanged",
                kind.token(dump_id),
                field.name,
                project.name
            ));
            return Ok(None);
        };

        let local_field: Option<i64> = conn
            .query_row(
                &format!(
                    "SELECT id FROM {} WHERE project_id = ?1 AND name = ?2 ORDER BY id LIMIT 1",
                    qualified(MAIN_SCHEMA, EntityType::Field.table())
                ),
                params![local_project, field.name],
                |row| row.get(0),
            )
            .optional()?;

        if local_field.is_none() {
            self.warn(format!(
                "{} ('{}'): local project {} has no field with that name; reference left unchanged",
                kind.token(dump_id),
                field.name,
                local_project
            ));
        }
        Ok(local_field)
    }

    /// Match a dump project to a local project of the importing user.
    ///
    /// Tries the id map, then a label match, then a name match that must be
    /// unique. An ambiguous name is reported and never guessed.
    pub fn resolve_local_project(
        &mut self,
        conn: &Connection,
        ids: &IdMap,
        project: &DumpProject,
    ) -> Result<Option<i64>> {
        if let Some(local_id) = ids.get(EntityType::Project, project.id) {
            return Ok(Some(local_id));
        }

        let table = qualified(MAIN_SCHEMA, EntityType::Project.table());

        if let Some(label) = &project.label {
            let by_label: Option<i64> = conn
                .query_row(
                    &format!(
                        "SELECT id FROM {} WHERE user_id = ?1 AND {} = ?2 AND {} IS NULL",
                        table, ROOT_LABEL_COLUMN, ROOT_DELETED_COLUMN
                    ),
                    params![self.user_id, label],
                    |row| row.get(0),
                )
                .optional()?;
            if by_label.is_some() {
                return Ok(by_label);
            }
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM {} WHERE user_id = ?1 AND name = ?2 AND {} IS NULL ORDER BY id",
            table, ROOT_DELETED_COLUMN
        ))?;
        let matches: Vec<i64> = stmt
            .query_map(params![self.user_id, project.name], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        match matches.as_slice() {
            [only] => Ok(Some(*only)),
            [] => Ok(None),
            many => {
                self.warn(format!(
                    "project '{}' matches {} local projects by name; not guessing",
                    project.name,
                    many.len()
                ));
                Ok(None)
            }
        }
    }

    /// Local global field of the importing user with this name, and its type.
    pub fn find_local_global(
        &self,
        conn: &Connection,
        name: &str,
    ) -> Result<Option<(i64, Option<String>)>> {
        let found = conn
            .query_row(
                &format!(
                    "SELECT id, field_type FROM {} WHERE user_id = ?1 AND project_id IS NULL AND name = ?2 ORDER BY id LIMIT 1",
                    qualified(MAIN_SCHEMA, EntityType::Field.table())
                ),
                params![self.user_id, name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(found)
    }

    /// Warn once per pair when a reused local global field has a different type.
    pub fn check_type(&mut self, field: &DumpField, local_id: i64, local_type: Option<&str>) {
        let (Some(dump_type), Some(local_type)) = (field.field_type.as_deref(), local_type) else {
            return;
        };
        if dump_type == local_type || !self.type_checked.insert((field.id, local_id)) {
            return;
        }
        self.warn(format!(
            "global field '{}' is '{}' in the dump but '{}' locally (local id {})",
            field.name, dump_type, local_type, local_id
        ));
    }

    fn warn_missing_dump_field(&mut self, kind: PlaceholderKind, dump_id: i64) {
        self.warn(format!(
            "{}: field does not exist in the dump; reference left unchanged",
            kind.token(dump_id)
        ));
    }

    fn warn_global_missing(&mut self, kind: PlaceholderKind, field: &DumpField) {
        self.warn(format!(
            "{} ('{}'): global field does not exist locally; re-run with global fields included to create it",
            kind.token(field.id),
            field.name
        ));
    }

    /// Field row from the dump, cached.
    pub fn dump_field(&mut self, conn: &Connection, dump_id: i64) -> Result<Option<DumpField>> {
        if let Some(cached) = self.dump_fields.get(&dump_id) {
            return Ok(cached.clone());
        }
        let field = self
            .staged_row(conn, EntityType::Field.table(), dump_id)?
            .as_ref()
            .and_then(DumpField::from_record);
        self.dump_fields.insert(dump_id, field.clone());
        Ok(field)
    }

    /// Project row from the dump, cached.
    pub fn dump_project(&mut self, conn: &Connection, dump_id: i64) -> Result<Option<DumpProject>> {
        if let Some(cached) = self.dump_projects.get(&dump_id) {
            return Ok(cached.clone());
        }
        let project = self
            .staged_row(conn, EntityType::Project.table(), dump_id)?
            .and_then(|record| {
                Some(DumpProject {
                    id: get_i64(&record, "id")?,
                    name: get_str(&record, "name")?.to_string(),
                    label: get_str(&record, ROOT_LABEL_COLUMN).map(str::to_string),
                })
            });
        self.dump_projects.insert(dump_id, project.clone());
        Ok(project)
    }

    fn staged_row(&self, conn: &Connection, table: &str, id: i64) -> Result<Option<Record>> {
        if !SchemaInspector::new(conn).table_exists(&self.staging, table)? {
            return Ok(None);
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} WHERE id = ?1",
            qualified(&self.staging, table)
        ))?;
        Ok(query_records(&mut stmt, params![id])?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    const ROOT: i64 = 500;

    /// Staging schema with two projects and a global field.
    fn setup() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let user = db.create_user("remap").unwrap();
        db.with_conn(|conn| {
            conn.execute_batch(
                "ATTACH DATABASE ':memory:' AS stage;
                 CREATE TABLE stage.projects (id INTEGER PRIMARY KEY, name TEXT, label TEXT);
                 CREATE TABLE stage.fields (id INTEGER PRIMARY KEY, project_id INTEGER, name TEXT, field_type TEXT);
                 INSERT INTO stage.projects VALUES (500, 'Alpha', 'alpha'), (600, 'Beta', 'beta'), (700, 'Gamma', NULL);
                 INSERT INTO stage.fields VALUES
                    (10, 500, 'Title', 'text'),
                    (20, NULL, 'Priority', 'select'),
                    (30, 600, 'Owner', 'text'),
                    (40, 700, 'Status', 'text');",
            )?;
            Ok(())
        })
        .unwrap();
        (db, user)
    }

    fn add_project(db: &Database, user: i64, name: &str, label: Option<&str>) -> i64 {
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO projects (user_id, name, label) VALUES (?1, ?2, ?3)",
                params![user, name, label],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .unwrap()
    }

    fn add_field(db: &Database, user: i64, project: Option<i64>, name: &str, ty: &str) -> i64 {
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO fields (project_id, user_id, name, field_type) VALUES (?1, ?2, ?3, ?4)",
                params![project, user, name, ty],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .unwrap()
    }

    #[test]
    fn test_scan_finds_all_kinds() {
        let found = scan(r#"{"ops":[{"insert":"FLD:{{1}} and GEN:{{22}} then EXT:{{333}} FOO:{{4}} FLD:{x}"}]}"#);
        assert_eq!(
            found,
            vec![
                (PlaceholderKind::Project, 1),
                (PlaceholderKind::Global, 22),
                (PlaceholderKind::External, 333),
            ]
        );
    }

    #[test]
    fn test_project_placeholder_uses_id_map_only() {
        let (db, user) = setup();
        let mut ids = IdMap::new();
        ids.add(EntityType::Field, 10, 91);
        let mut remapper = PlaceholderRemapper::new("stage", user);

        let out = db
            .with_conn(|conn| remapper.remap_document(conn, &ids, ROOT, "a FLD:{{10}} b FLD:{{11}}"))
            .unwrap();
        assert_eq!(out, "a FLD:{{91}} b FLD:{{11}}");
        assert_eq!(remapper.warnings().len(), 1);
        assert!(remapper.warnings()[0].contains("FLD:{{11}}"));
    }

    #[test]
    fn test_global_placeholder_falls_back_to_name() {
        let (db, user) = setup();
        let local = add_field(&db, user, None, "Priority", "text");
        let mut remapper = PlaceholderRemapper::new("stage", user);

        let out = db
            .with_conn(|conn| remapper.remap_document(conn, &IdMap::new(), ROOT, "GEN:{{20}}"))
            .unwrap();
        assert_eq!(out, format!("GEN:{{{{{}}}}}", local));
        // select in the dump, text locally
        let warnings = remapper.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("'select'"));
        assert!(remapper.warnings().is_empty());
    }

    #[test]
    fn test_global_placeholder_missing_locally_warns() {
        let (db, user) = setup();
        let mut remapper = PlaceholderRemapper::new("stage", user);
        let out = db
            .with_conn(|conn| remapper.remap_document(conn, &IdMap::new(), ROOT, "GEN:{{20}}"))
            .unwrap();
        assert_eq!(out, "GEN:{{20}}");
        assert!(remapper.warnings()[0].contains("Priority"));
        assert!(remapper.warnings()[0].contains("global fields included"));
    }

    #[test]
    fn test_external_placeholder_resolves_by_label_then_name() {
        let (db, user) = setup();
        let beta = add_project(&db, user, "Beta renamed", Some("beta"));
        let owner = add_field(&db, user, Some(beta), "Owner", "text");
        let gamma = add_project(&db, user, "Gamma", None);
        let status = add_field(&db, user, Some(gamma), "Status", "text");
        let mut remapper = PlaceholderRemapper::new("stage", user);

        let out = db
            .with_conn(|conn| {
                remapper.remap_document(conn, &IdMap::new(), ROOT, "EXT:{{30}} / EXT:{{40}}")
            })
            .unwrap();
        assert_eq!(out, format!("EXT:{{{{{}}}}} / EXT:{{{{{}}}}}", owner, status));
        assert!(remapper.warnings().is_empty());
    }

    #[test]
    fn test_external_placeholder_ambiguous_name_is_not_guessed() {
        let (db, user) = setup();
        for _ in 0..2 {
            let gamma = add_project(&db, user, "Gamma", None);
            add_field(&db, user, Some(gamma), "Status", "text");
        }
        let mut remapper = PlaceholderRemapper::new("stage", user);
        let out = db
            .with_conn(|conn| remapper.remap_document(conn, &IdMap::new(), ROOT, "EXT:{{40}}"))
            .unwrap();
        assert_eq!(out, "EXT:{{40}}");
        assert!(remapper.warnings().iter().any(|w| w.contains("matches 2 local projects")));
    }

    #[test]
    fn test_remap_field_id_matches_document_resolution() {
        let (db, user) = setup();
        let mut ids = IdMap::new();
        ids.add(EntityType::Field, 10, 91);
        let local_global = add_field(&db, user, None, "Priority", "select");
        let mut remapper = PlaceholderRemapper::new("stage", user);

        db.with_conn(|conn| {
            assert_eq!(remapper.remap_field_id(conn, &ids, ROOT, 10)?, Some(91));
            assert_eq!(remapper.remap_field_id(conn, &ids, ROOT, 20)?, Some(local_global));
            let doc = remapper.remap_document(conn, &ids, ROOT, "FLD:{{10}}")?;
            assert_eq!(doc, "FLD:{{91}}");
            assert_eq!(remapper.remap_field_id(conn, &ids, ROOT, 30)?, None);
            Ok(())
        })
        .unwrap();
        assert_eq!(remapper.warnings().len(), 1);
    }

    #[test]
    fn test_check_document_respects_global_inclusion() {
        let (db, user) = setup();
        let mut remapper = PlaceholderRemapper::new("stage", user);
        db.with_conn(|conn| {
            remapper.check_document(conn, ROOT, "FLD:{{10}} GEN:{{20}} GEN:{{20}}", true)?;
            assert!(remapper.warnings().is_empty());
            remapper.check_document(conn, ROOT, "FLD:{{30}} GEN:{{20}}", false)?;
            Ok(())
        })
        .unwrap();
        assert_eq!(remapper.warnings().len(), 2);
    }
}
