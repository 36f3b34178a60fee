//! Listing and loading projects from a dump.
//!
//! [`ProjectLoadService`] ties the pieces together: it stages the dump,
//! matches every requested project against local data, loads each project
//! in its own transaction and reports the outcome per project. A failure in
//! one project is recorded and the next one is loaded regardless.

use crate::config::StagingConfig;
use crate::db::loader::{EntityLoader, LoadOutcome, count_scoped};
use crate::db::records::{Record, get_i64, get_str, is_set, query_records};
use crate::db::schema::SchemaInspector;
use crate::db::staging::DumpImporter;
use crate::db::{Database, MAIN_SCHEMA, qualified};
use crate::entities::{
    EntityType, ForeignKey, INSERT_ORDER, ROOT_DELETED_COLUMN, TEMPLATE_BODY_COLUMN,
};
use crate::error::{LoadError, LoadResult};
use crate::id_map::IdMap;
use crate::placeholders::{PlaceholderKind, PlaceholderRemapper, scan};
use crate::report::{LoadReport, RootStatus};
use anyhow::{Result, bail};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Descendant tables counted by [`ProjectLoadService::list`].
pub const LISTED_COUNTS: &[EntityType] = &[
    EntityType::Context,
    EntityType::Field,
    EntityType::Template,
    EntityType::Instance,
    EntityType::Note,
];

/// Link rows get their field id from the remapper, so only the template is mapped here.
const TEMPLATE_FIELD_KEYS: &[ForeignKey] = &[ForeignKey::new("template_id", EntityType::Template)];

/// Project links get their target resolved separately.
const PROJECT_LINK_KEYS: &[ForeignKey] = &[ForeignKey::new("project_id", EntityType::Project)];

/// Row count of a descendant table, or a marker for a table the dump lacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DescendantCount {
    Count(usize),
    Missing,
}

impl std::fmt::Display for DescendantCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescendantCount::Count(n) => write!(f, "{}", n),
            DescendantCount::Missing => f.write_str("-"),
        }
    }
}

/// Projects found in a dump, with descendant counts per project.
#[derive(Debug, Clone, Default)]
pub struct DumpListing {
    /// Project rows in dump order.
    pub roots: Vec<Record>,
    /// Project id -> table name -> count.
    pub counts: BTreeMap<i64, BTreeMap<&'static str, DescendantCount>>,
}

impl DumpListing {
    pub fn count(&self, root_id: i64, table: &str) -> Option<DescendantCount> {
        self.counts.get(&root_id).and_then(|c| c.get(table)).copied()
    }
}

/// Parameters of one load call.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub dump_path: PathBuf,
    /// Dump ids of the projects to load, in load order.
    pub root_ids: Vec<i64>,
    /// Local user that will own the loaded projects.
    pub user_id: i64,
    pub dry_run: bool,
    pub include_global_fields: bool,
    /// Local project to replace for each entry of `root_ids`, by position.
    pub local_ids: Option<Vec<i64>>,
}

impl LoadRequest {
    pub fn new(dump_path: impl Into<PathBuf>, root_ids: Vec<i64>, user_id: i64) -> Self {
        Self {
            dump_path: dump_path.into(),
            root_ids,
            user_id,
            dry_run: false,
            include_global_fields: false,
            local_ids: None,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_global_fields(mut self, include: bool) -> Self {
        self.include_global_fields = include;
        self
    }

    pub fn with_local_ids(mut self, local_ids: Vec<i64>) -> Self {
        self.local_ids = Some(local_ids);
        self
    }
}

/// Lists and loads projects from dump files into the production database.
pub struct ProjectLoadService {
    db: Database,
    importer: DumpImporter,
}

impl ProjectLoadService {
    pub fn new(db: Database, importer: DumpImporter) -> Self {
        Self { db, importer }
    }

    pub fn from_config(db: Database, staging: &StagingConfig) -> Self {
        Self::new(db, DumpImporter::new(staging))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn importer(&self) -> &DumpImporter {
        &self.importer
    }

    /// Projects in a dump and how much each one contains. Never writes to production.
    pub fn list(&self, dump: &Path) -> LoadResult<DumpListing> {
        self.with_staging(dump, |staging| {
            self.require_root_table(dump, staging)?;

            let listing = self.db.with_conn(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT * FROM {} ORDER BY id",
                    qualified(staging, EntityType::Project.table())
                ))?;
                let roots = query_records(&mut stmt, [])?;

                let mut counts = BTreeMap::new();
                for root in &roots {
                    let Some(root_id) = get_i64(root, "id") else {
                        continue;
                    };
                    let mut per_table = BTreeMap::new();
                    for entity in LISTED_COUNTS {
                        let count = match count_scoped(conn, staging, *entity, root_id)? {
                            Some(n) => DescendantCount::Count(n),
                            None => DescendantCount::Missing,
                        };
                        per_table.insert(entity.table(), count);
                    }
                    counts.insert(root_id, per_table);
                }

                Ok(DumpListing { roots, counts })
            })?;

            info!(dump = %dump.display(), projects = listing.roots.len(), "Listed dump");
            Ok(listing)
        })
    }

    /// Load the requested projects.
    ///
    /// Returns an error only for problems that stop the whole call: invalid
    /// input, an unusable dump, or a staging failure. Everything that goes
    /// wrong for a single project is recorded in the report.
    pub fn load(&self, request: &LoadRequest) -> LoadResult<LoadReport> {
        self.validate_request(request)?;

        let mut report = LoadReport::new(request.dry_run);
        for root_id in &request.root_ids {
            report.init_root(*root_id, None);
        }

        info!(
            dump = %request.dump_path.display(),
            projects = ?request.root_ids,
            user = request.user_id,
            dry_run = request.dry_run,
            "Starting project load"
        );

        self.with_staging(&request.dump_path, |staging| {
            self.require_root_table(&request.dump_path, staging)?;

            let mut run = LoadRun::new(staging, request);
            self.db.with_conn_mut(|conn| {
                run.check_schema_drift(conn, &mut report)?;
                for (idx, root_id) in request.root_ids.iter().enumerate() {
                    let explicit = request
                        .local_ids
                        .as_ref()
                        .and_then(|ids| ids.get(idx).copied());
                    run.process_root(conn, &mut report, *root_id, explicit);
                }
                Ok(())
            })?;
            Ok(())
        })?;

        info!(
            success = report.success_count(),
            skipped = report.skipped_count(),
            errors = report.error_count(),
            dry_run = report.dry_run_count(),
            "Project load finished"
        );
        Ok(report)
    }

    /// Remove staging schemas left behind by crashed runs.
    pub fn cleanup(&self) -> LoadResult<BTreeMap<String, String>> {
        Ok(self.importer.cleanup_orphaned(&self.db)?)
    }

    fn validate_request(&self, request: &LoadRequest) -> LoadResult<()> {
        if request.root_ids.is_empty() {
            return Err(LoadError::validation("at least one project id is required"));
        }
        if let Some(bad) = request.root_ids.iter().find(|id| **id <= 0) {
            return Err(LoadError::validation(format!(
                "project ids must be positive, got {}",
                bad
            )));
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = request.root_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(LoadError::validation(format!(
                "project id {} is requested more than once",
                dup
            )));
        }

        if request.user_id <= 0 {
            return Err(LoadError::validation(format!(
                "user id must be positive, got {}",
                request.user_id
            )));
        }
        if !self.db.user_exists(request.user_id)? {
            return Err(LoadError::validation(format!(
                "user {} does not exist",
                request.user_id
            )));
        }

        if let Some(local_ids) = &request.local_ids {
            if local_ids.len() != request.root_ids.len() {
                return Err(LoadError::validation(format!(
                    "{} local ids given for {} projects",
                    local_ids.len(),
                    request.root_ids.len()
                )));
            }
            if let Some(bad) = local_ids.iter().find(|id| **id <= 0) {
                return Err(LoadError::validation(format!(
                    "local ids must be positive, got {}",
                    bad
                )));
            }
        }
        Ok(())
    }

    fn require_root_table(&self, dump: &Path, staging: &str) -> LoadResult<()> {
        let present = self.db.with_conn(|conn| {
            SchemaInspector::new(conn).table_exists(staging, EntityType::Project.table())
        })?;
        if !present {
            return Err(LoadError::invalid_dump(
                dump,
                format!("no {} table", EntityType::Project.table()),
            ));
        }
        Ok(())
    }

    /// Run `f` against a freshly staged copy of the dump.
    ///
    /// The staging schema is dropped afterwards whatever `f` returns.
    fn with_staging<T>(&self, dump: &Path, f: impl FnOnce(&str) -> LoadResult<T>) -> LoadResult<T> {
        let path = self.importer.validate(dump)?;

        let schema = match self.importer.create_staging_schema(&self.db) {
            Ok(schema) => schema,
            Err(e) => {
                self.drop_staging(&self.importer.schema_name());
                return Err(e);
            }
        };

        let result = self
            .importer
            .import_dump(&self.db, &path, &schema)
            .and_then(|()| f(&schema));

        self.drop_staging(&schema);
        result
    }

    fn drop_staging(&self, schema: &str) {
        if let Err(e) = self.importer.drop_schema(&self.db, schema) {
            warn!(schema = %schema, error = %e, "Failed to drop staging schema");
        }
    }
}

/// Local project a dump project will be loaded over.
enum LocalMatch {
    New,
    Existing(i64),
    Ambiguous(usize),
}

/// Results of one project load, filled as the tree is inserted.
#[derive(Debug, Default)]
struct RootLoad {
    local_id: i64,
    inserted: BTreeMap<EntityType, usize>,
    deleted: BTreeMap<EntityType, usize>,
    warnings: Vec<String>,
}

impl RootLoad {
    fn absorb(&mut self, entity: EntityType, outcome: LoadOutcome) {
        *self.inserted.entry(entity).or_default() += outcome.inserted;
        self.warnings.extend(outcome.warnings);
    }
}

/// State of a single load call: the loader with its id map and the remapper caches.
struct LoadRun<'r> {
    request: &'r LoadRequest,
    staging: String,
    loader: EntityLoader,
    remapper: PlaceholderRemapper,
}

impl<'r> LoadRun<'r> {
    fn new(staging: &str, request: &'r LoadRequest) -> Self {
        Self {
            request,
            staging: staging.to_string(),
            loader: EntityLoader::new(staging, request.user_id),
            remapper: PlaceholderRemapper::new(staging, request.user_id),
        }
    }

    /// Report tables and columns that differ between the dump and production.
    fn check_schema_drift(&self, conn: &Connection, report: &mut LoadReport) -> Result<()> {
        let inspector = SchemaInspector::new(conn);
        let mut seen = HashSet::new();

        for entity in INSERT_ORDER {
            let table = entity.table();
            if !seen.insert(table) {
                continue;
            }
            if !inspector.table_exists(&self.staging, table)? {
                report.add_global_warning(format!(
                    "dump has no {} table; nothing is loaded from it",
                    table
                ));
                continue;
            }

            let local = inspector.column_info(MAIN_SCHEMA, table)?;
            let dumped = inspector.column_info(&self.staging, table)?;

            let missing: Vec<&str> = local
                .iter()
                .filter(|c| !dumped.contains(&c.name))
                .map(|c| c.name.as_str())
                .collect();
            if !missing.is_empty() {
                report.add_global_warning(format!(
                    "dump table {} lacks column(s) {}; fallback values are used",
                    table,
                    missing.join(", ")
                ));
            }

            let extra: Vec<&str> = dumped
                .iter()
                .filter(|c| !local.contains(&c.name))
                .map(|c| c.name.as_str())
                .collect();
            if !extra.is_empty() {
                report.add_global_warning(format!(
                    "dump table {} has column(s) {} unknown locally; they are ignored",
                    table,
                    extra.join(", ")
                ));
            }
        }
        Ok(())
    }

    fn process_root(
        &mut self,
        conn: &mut Connection,
        report: &mut LoadReport,
        root_id: i64,
        explicit: Option<i64>,
    ) {
        if let Err(e) = self.try_root(conn, report, root_id, explicit) {
            let message = format!("{:#}", e);
            warn!(root = root_id, error = %message, "Project load failed");
            report.set_error(root_id, message);
        }
    }

    fn try_root(
        &mut self,
        conn: &mut Connection,
        report: &mut LoadReport,
        root_id: i64,
        explicit: Option<i64>,
    ) -> Result<()> {
        self.remapper.clear_warnings();

        let Some(root) = self
            .loader
            .fetch(conn, EntityType::Project, "id", &[root_id])?
            .into_iter()
            .next()
        else {
            report.add_warning(root_id, format!("project {} not found in the dump", root_id));
            report.set_status(root_id, RootStatus::Skipped);
            return Ok(());
        };

        let name = get_str(&root, "name").unwrap_or_default().to_string();
        report.init_root(root_id, Some(name.clone()));

        if is_set(&root, ROOT_DELETED_COLUMN) {
            report.add_warning(root_id, format!("project '{}' is deleted in the dump", name));
            report.set_status(root_id, RootStatus::Skipped);
            return Ok(());
        }

        let local_id = match self.match_local(conn, &name, explicit)? {
            LocalMatch::New => None,
            LocalMatch::Existing(id) => Some(id),
            LocalMatch::Ambiguous(count) => {
                let err = LoadError::AmbiguousLocalMatch { name, count };
                warn!(root = root_id, error = %err, "Ambiguous local project");
                report.set_error(root_id, err.to_string());
                return Ok(());
            }
        };
        report.set_replacement(root_id, local_id.is_some());
        if let Some(local_id) = local_id {
            report.set_local_id(root_id, local_id);
        }

        if self.request.dry_run {
            return self.preview_root(conn, report, root_id, local_id);
        }

        let checkpoint = self.loader.checkpoint();
        let mut loaded = RootLoad::default();
        match self.load_root_tx(conn, &root, root_id, local_id, &mut loaded) {
            Ok(()) => {
                report.set_local_id(root_id, loaded.local_id);
                for (entity, count) in loaded.deleted {
                    report.add_deleted(root_id, entity, count);
                }
                for (entity, count) in loaded.inserted {
                    report.add_inserted(root_id, entity, count);
                }
                report.add_warnings(root_id, loaded.warnings);
                report.set_status(root_id, RootStatus::Success);
                report.record_mappings(self.loader.ids());
                info!(
                    root = root_id,
                    local_id = loaded.local_id,
                    replacement = local_id.is_some(),
                    "Project loaded"
                );
                Ok(())
            }
            Err(e) => {
                self.loader.restore(checkpoint);
                // Fallback warnings usually name the value the commit rejected.
                report.add_warnings(root_id, loaded.warnings);
                report.add_warnings(root_id, self.remapper.take_warnings());
                Err(e)
            }
        }
    }

    /// Find the local project a dump project replaces, if any.
    fn match_local(&self, conn: &Connection, name: &str, explicit: Option<i64>) -> Result<LocalMatch> {
        let table = qualified(MAIN_SCHEMA, EntityType::Project.table());

        if let Some(local_id) = explicit {
            let owned = conn
                .query_row(
                    &format!("SELECT 1 FROM {} WHERE id = ?1 AND user_id = ?2", table),
                    params![local_id, self.request.user_id],
                    |_| Ok(()),
                )
                .optional()?;
            if owned.is_none() {
                bail!(
                    "local project {} does not exist or is not owned by user {}",
                    local_id,
                    self.request.user_id
                );
            }
            return Ok(LocalMatch::Existing(local_id));
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM {} WHERE user_id = ?1 AND name = ?2 AND {} IS NULL ORDER BY id",
            table, ROOT_DELETED_COLUMN
        ))?;
        let matches: Vec<i64> = stmt
            .query_map(params![self.request.user_id, name], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(match matches.as_slice() {
            [] => LocalMatch::New,
            [only] => LocalMatch::Existing(*only),
            many => LocalMatch::Ambiguous(many.len()),
        })
    }

    /// Load one project inside its own transaction.
    fn load_root_tx(
        &mut self,
        conn: &mut Connection,
        root: &Record,
        root_id: i64,
        local_id: Option<i64>,
        out: &mut RootLoad,
    ) -> Result<()> {
        let tx = conn.transaction()?;
        // The replaced project is deleted and reinserted under the same id.
        tx.execute_batch("PRAGMA defer_foreign_keys = ON")?;
        self.load_tree(&tx, root, root_id, local_id, out)?;
        tx.commit()?;
        Ok(())
    }

    fn load_tree(
        &mut self,
        conn: &Connection,
        root: &Record,
        root_id: i64,
        local_id: Option<i64>,
        out: &mut RootLoad,
    ) -> Result<()> {
        if let Some(local_id) = local_id {
            out.deleted = self.loader.count_local(conn, local_id)?;
            self.loader.delete_root(conn, local_id)?;
            debug!(root = root_id, local_id, "Deleted local project for replacement");
        }

        let (new_id, warnings) = self.loader.insert_root(conn, root, local_id)?;
        out.local_id = new_id;
        out.inserted.insert(EntityType::Project, 1);
        out.warnings.extend(warnings);

        let templates = self
            .loader
            .fetch(conn, EntityType::Template, "project_id", &[root_id])?;
        let template_ids = ids_of(&templates);
        let links = self
            .loader
            .fetch(conn, EntityType::TemplateField, "template_id", &template_ids)?;

        if self.request.include_global_fields {
            let outcome = self.prepare_global_fields(conn, &templates, &links)?;
            out.absorb(EntityType::GlobalField, outcome);
        }

        let contexts = self
            .loader
            .fetch(conn, EntityType::Context, "project_id", &[root_id])?;
        let outcome = self.loader.load_entity(conn, EntityType::Context, &contexts, None)?;
        out.absorb(EntityType::Context, outcome);

        let fields = self
            .loader
            .fetch(conn, EntityType::Field, "project_id", &[root_id])?;
        let outcome = self.loader.load_entity(conn, EntityType::Field, &fields, None)?;
        out.absorb(EntityType::Field, outcome);

        let options = self
            .loader
            .fetch(conn, EntityType::FieldOption, "field_id", &ids_of(&fields))?;
        let outcome = self
            .loader
            .load_entity(conn, EntityType::FieldOption, &options, None)?;
        out.absorb(EntityType::FieldOption, outcome);

        let outcome = self
            .loader
            .load_entity(conn, EntityType::Template, &templates, None)?;
        out.absorb(EntityType::Template, outcome);

        let outcome = self.load_template_fields(conn, root_id, &links)?;
        out.absorb(EntityType::TemplateField, outcome);

        let instances = self
            .loader
            .fetch(conn, EntityType::Instance, "template_id", &template_ids)?;
        let outcome = self
            .loader
            .load_entity(conn, EntityType::Instance, &instances, None)?;
        out.absorb(EntityType::Instance, outcome);

        let notes = self
            .loader
            .fetch(conn, EntityType::Note, "project_id", &[root_id])?;
        let outcome = self.loader.load_entity(conn, EntityType::Note, &notes, None)?;
        out.absorb(EntityType::Note, outcome);

        let outcome = self.load_project_links(conn, root_id)?;
        out.absorb(EntityType::ProjectLink, outcome);

        self.rewrite_template_bodies(conn, root_id, &templates)?;
        out.warnings.extend(self.remapper.take_warnings());

        out.inserted.retain(|_, count| *count > 0);
        Ok(())
    }

    /// Dump ids of global fields referenced by templates or their field links
    /// that are not mapped yet.
    fn referenced_globals(
        &mut self,
        conn: &Connection,
        templates: &[Record],
        links: &[Record],
    ) -> Result<Vec<i64>> {
        let mut wanted = BTreeSet::new();

        for template in templates {
            if let Some(body) = get_str(template, TEMPLATE_BODY_COLUMN) {
                wanted.extend(
                    scan(body)
                        .into_iter()
                        .filter(|(kind, _)| *kind == PlaceholderKind::Global)
                        .map(|(_, id)| id),
                );
            }
        }

        for link in links {
            let Some(field_id) = get_i64(link, "field_id") else {
                continue;
            };
            if self
                .remapper
                .dump_field(conn, field_id)?
                .is_some_and(|f| f.is_global())
            {
                wanted.insert(field_id);
            }
        }

        Ok(wanted
            .into_iter()
            .filter(|id| self.loader.get_mapping(EntityType::GlobalField, *id).is_none())
            .collect())
    }

    /// Map referenced global fields to local ones, creating those missing.
    fn prepare_global_fields(
        &mut self,
        conn: &Connection,
        templates: &[Record],
        links: &[Record],
    ) -> Result<LoadOutcome> {
        let wanted = self.referenced_globals(conn, templates, links)?;
        let records = self
            .loader
            .fetch(conn, EntityType::GlobalField, "id", &wanted)?;

        let mut created = LoadOutcome::default();
        for record in records {
            let Some(dump_id) = get_i64(&record, "id") else {
                continue;
            };
            let Some(field) = self.remapper.dump_field(conn, dump_id)? else {
                continue;
            };

            match self.remapper.find_local_global(conn, &field.name)? {
                Some((local_id, local_type)) => {
                    self.remapper.check_type(&field, local_id, local_type.as_deref());
                    self.loader.add_mapping(EntityType::GlobalField, dump_id, local_id);
                }
                None => {
                    // One at a time so a repeated name reuses the row just created.
                    let outcome = self.loader.load_entity(
                        conn,
                        EntityType::GlobalField,
                        std::slice::from_ref(&record),
                        None,
                    )?;
                    created.inserted += outcome.inserted;
                    created.warnings.extend(outcome.warnings);
                    created.id_map.extend(outcome.id_map);
                }
            }
        }

        debug!(created = created.inserted, "Prepared global fields");
        Ok(created)
    }

    /// Insert template-field links with their field ids resolved by the remapper.
    fn load_template_fields(
        &mut self,
        conn: &Connection,
        root_id: i64,
        links: &[Record],
    ) -> Result<LoadOutcome> {
        let mut rows = Vec::with_capacity(links.len());
        let mut skipped = Vec::new();
        let mut seen = HashSet::new();

        for link in links {
            let (Some(template_id), Some(field_id)) =
                (get_i64(link, "template_id"), get_i64(link, "field_id"))
            else {
                continue;
            };

            let resolved =
                self.remapper
                    .remap_field_id(conn, self.loader.ids(), root_id, field_id)?;
            let Some(local_field) = resolved else {
                skipped.push(format!(
                    "template {}: link to field {} skipped; field could not be resolved",
                    template_id, field_id
                ));
                continue;
            };
            if !seen.insert((template_id, local_field)) {
                skipped.push(format!(
                    "template {}: link to field {} duplicates local field {}; skipped",
                    template_id, field_id, local_field
                ));
                continue;
            }

            let mut row = link.clone();
            row.insert("field_id".to_string(), Value::Integer(local_field));
            rows.push(row);
        }

        let mut outcome =
            self.loader
                .load_entity(conn, EntityType::TemplateField, &rows, Some(TEMPLATE_FIELD_KEYS))?;
        outcome.warnings.extend(skipped);
        Ok(outcome)
    }

    /// Local project a link target resolves to.
    fn resolve_linked_project(&mut self, conn: &Connection, linked: i64) -> Result<Option<i64>> {
        if let Some(local_id) = self.loader.get_mapping(EntityType::Project, linked) {
            return Ok(Some(local_id));
        }
        let Some(project) = self.remapper.dump_project(conn, linked)? else {
            return Ok(None);
        };
        self.remapper
            .resolve_local_project(conn, self.loader.ids(), &project)
    }

    fn load_project_links(&mut self, conn: &Connection, root_id: i64) -> Result<LoadOutcome> {
        let links = self
            .loader
            .fetch(conn, EntityType::ProjectLink, "project_id", &[root_id])?;

        let mut rows = Vec::with_capacity(links.len());
        let mut skipped = Vec::new();
        for link in &links {
            let Some(linked) = get_i64(link, "linked_project_id") else {
                continue;
            };
            match self.resolve_linked_project(conn, linked)? {
                Some(local_id) => {
                    let mut row = link.clone();
                    row.insert("linked_project_id".to_string(), Value::Integer(local_id));
                    rows.push(row);
                }
                None => skipped.push(self.link_skipped(conn, linked)?),
            }
        }

        let mut outcome =
            self.loader
                .load_entity(conn, EntityType::ProjectLink, &rows, Some(PROJECT_LINK_KEYS))?;
        outcome.warnings.extend(skipped);
        Ok(outcome)
    }

    fn link_skipped(&mut self, conn: &Connection, linked: i64) -> Result<String> {
        let name = self
            .remapper
            .dump_project(conn, linked)?
            .map(|p| format!(" ('{}')", p.name))
            .unwrap_or_default();
        Ok(format!(
            "link to project {}{} skipped; no matching local project",
            linked, name
        ))
    }

    /// Rewrite placeholders in the bodies of the templates just loaded.
    fn rewrite_template_bodies(
        &mut self,
        conn: &Connection,
        root_id: i64,
        templates: &[Record],
    ) -> Result<()> {
        let table = qualified(MAIN_SCHEMA, EntityType::Template.table());

        for template in templates {
            let (Some(dump_id), Some(body)) =
                (get_i64(template, "id"), get_str(template, TEMPLATE_BODY_COLUMN))
            else {
                continue;
            };
            if scan(body).is_empty() {
                continue;
            }
            let Some(local_id) = self.loader.get_mapping(EntityType::Template, dump_id) else {
                continue;
            };

            let rewritten = self
                .remapper
                .remap_document(conn, self.loader.ids(), root_id, body)?;
            if rewritten != body {
                conn.execute(
                    &format!(
                        "UPDATE {} SET {} = ?1 WHERE id = ?2",
                        table, TEMPLATE_BODY_COLUMN
                    ),
                    params![rewritten, local_id],
                )?;
            }
        }
        Ok(())
    }

    /// Report what loading a project would do, without writing anything.
    fn preview_root(
        &mut self,
        conn: &Connection,
        report: &mut LoadReport,
        root_id: i64,
        local_id: Option<i64>,
    ) -> Result<()> {
        let include_global = self.request.include_global_fields;

        if let Some(local_id) = local_id {
            for (entity, count) in self.loader.count_local(conn, local_id)? {
                report.add_deleted(root_id, entity, count);
            }
        }
        for (entity, count) in self.loader.count_staged(conn, root_id)? {
            report.add_inserted(root_id, entity, count);
        }

        let templates = self
            .loader
            .fetch(conn, EntityType::Template, "project_id", &[root_id])?;
        let links = self
            .loader
            .fetch(conn, EntityType::TemplateField, "template_id", &ids_of(&templates))?;

        if include_global {
            let mut to_create = BTreeSet::new();
            for dump_id in self.referenced_globals(conn, &templates, &links)? {
                let Some(field) = self.remapper.dump_field(conn, dump_id)? else {
                    continue;
                };
                if !field.is_global() {
                    continue;
                }
                match self.remapper.find_local_global(conn, &field.name)? {
                    Some((local_id, local_type)) => {
                        self.remapper.check_type(&field, local_id, local_type.as_deref());
                    }
                    None => {
                        to_create.insert(field.name);
                    }
                }
            }
            report.add_inserted(root_id, EntityType::GlobalField, to_create.len());
        }

        for template in &templates {
            if let Some(body) = get_str(template, TEMPLATE_BODY_COLUMN) {
                self.remapper
                    .check_document(conn, root_id, body, include_global)?;
            }
        }

        for link in &links {
            let Some(field_id) = get_i64(link, "field_id") else {
                continue;
            };
            let kind = match self.remapper.dump_field(conn, field_id)? {
                Some(field) if field.project_id == Some(root_id) => continue,
                Some(field) if field.is_global() => PlaceholderKind::Global,
                Some(_) => PlaceholderKind::External,
                None => PlaceholderKind::Project,
            };
            self.remapper
                .check_document(conn, root_id, &kind.token(field_id), include_global)?;
        }

        let project_links = self
            .loader
            .fetch(conn, EntityType::ProjectLink, "project_id", &[root_id])?;
        for link in &project_links {
            let Some(linked) = get_i64(link, "linked_project_id") else {
                continue;
            };
            if self.request.root_ids.contains(&linked) {
                continue;
            }
            let resolved = match self.remapper.dump_project(conn, linked)? {
                Some(project) => self
                    .remapper
                    .resolve_local_project(conn, &IdMap::new(), &project)?,
                None => None,
            };
            if resolved.is_none() {
                let warning = self.link_skipped(conn, linked)?;
                report.add_warning(root_id, warning);
            }
        }

        report.add_warnings(root_id, self.remapper.take_warnings());
        report.set_status(root_id, RootStatus::DryRun);
        Ok(())
    }
}

fn ids_of(records: &[Record]) -> Vec<i64> {
    records.iter().filter_map(|r| get_i64(r, "id")).collect()
}
