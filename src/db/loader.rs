//! Row-level loading from a staging schema into production.
//!
//! The loader reads rows of one entity type from staging, rewrites their
//! foreign keys through the run's [`IdMap`], and inserts them into the main
//! schema. Column lists come from the catalog on both sides; columns the dump
//! lacks are filled with [`fallback_value`].

use super::records::{Record, display_value, get_i64, get_str, query_records, value_as_i64};
use super::schema::{SchemaInspector, TableColumns, fallback_value};
use super::{MAIN_SCHEMA, qualified, quote_ident};
use crate::entities::{
    DELETE_BEFORE_ROOT, EntityType, ForeignKey, Override, ROOT_LABEL_COLUMN, Scope, root_owned,
};
use crate::id_map::IdMap;
use anyhow::{Context, Result, anyhow};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::collections::BTreeMap;
use tracing::debug;

/// Everything needed to insert one batch of rows of a single entity type.
#[derive(Debug)]
pub struct EntityBatch<'a> {
    pub entity: EntityType,
    pub records: &'a [Record],
    /// Production columns to insert, in order.
    pub insert_columns: &'a [String],
    /// Production column metadata.
    pub column_info: &'a TableColumns,
    /// Columns present in the dump's copy of the table.
    pub staging_columns: &'a TableColumns,
    pub excluded: &'a [&'a str],
    pub overrides: &'a [Override],
    pub foreign_keys: &'a [ForeignKey],
    pub has_auto_increment: bool,
}

/// Result of loading one batch.
#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub inserted: usize,
    /// Mappings created by this batch only.
    pub id_map: BTreeMap<i64, i64>,
    pub warnings: Vec<String>,
}

/// Moves rows from a staging schema into production for one importing user.
///
/// Owns the id mappings of a single load call. Construct a new loader (or
/// call [`EntityLoader::clear_mappings`]) for every independent run.
#[derive(Debug)]
pub struct EntityLoader {
    staging: String,
    user_id: i64,
    ids: IdMap,
}

impl EntityLoader {
    pub fn new(staging: impl Into<String>, user_id: i64) -> Self {
        Self {
            staging: staging.into(),
            user_id,
            ids: IdMap::new(),
        }
    }

    pub fn staging(&self) -> &str {
        &self.staging
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    // ID map accessors

    pub fn add_mapping(&mut self, entity: EntityType, dump_id: i64, local_id: i64) -> bool {
        self.ids.add(entity, dump_id, local_id)
    }

    pub fn get_mapping(&self, entity: EntityType, dump_id: i64) -> Option<i64> {
        self.ids.get(entity, dump_id)
    }

    pub fn clear_mappings(&mut self) {
        self.ids.clear();
    }

    pub fn ids(&self) -> &IdMap {
        &self.ids
    }

    /// Snapshot of the mappings, restored with [`EntityLoader::restore`] after a rollback.
    pub fn checkpoint(&self) -> IdMap {
        self.ids.clone()
    }

    pub fn restore(&mut self, checkpoint: IdMap) {
        self.ids = checkpoint;
    }

    /// Rows of `entity` in staging whose `parent_column` is one of `parent_ids`.
    ///
    /// Returns nothing, without querying, for an empty id list or a table the
    /// dump does not contain.
    pub fn fetch(
        &self,
        conn: &Connection,
        entity: EntityType,
        parent_column: &str,
        parent_ids: &[i64],
    ) -> Result<Vec<Record>> {
        if parent_ids.is_empty() {
            return Ok(Vec::new());
        }
        if !SchemaInspector::new(conn).table_exists(&self.staging, entity.table())? {
            debug!(table = entity.table(), "Table missing from dump");
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; parent_ids.len()].join(", ");
        let mut filter = format!("{} IN ({})", quote_ident(parent_column), placeholders);
        match entity {
            EntityType::Field => filter.push_str(" AND project_id IS NOT NULL"),
            EntityType::GlobalField => filter.push_str(" AND project_id IS NULL"),
            _ => {}
        }
        let sql = format!(
            "SELECT * FROM {} WHERE {} ORDER BY rowid",
            qualified(&self.staging, entity.table()),
            filter
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = query_records(&mut stmt, params_from_iter(parent_ids.iter()))
            .with_context(|| format!("fetching {} from staging", entity.table()))?;
        Ok(rows)
    }

    /// Rows a local root currently owns, per entity type.
    pub fn count_local(
        &self,
        conn: &Connection,
        local_root_id: i64,
    ) -> Result<BTreeMap<EntityType, usize>> {
        let mut counts = BTreeMap::new();
        for entity in root_owned() {
            if let Some(count) = count_scoped(conn, MAIN_SCHEMA, entity, local_root_id)? {
                counts.insert(entity, count);
            }
        }
        Ok(counts)
    }

    /// Rows a dump root owns in staging, per entity type.
    pub fn count_staged(
        &self,
        conn: &Connection,
        dump_root_id: i64,
    ) -> Result<BTreeMap<EntityType, usize>> {
        let mut counts = BTreeMap::new();
        for entity in root_owned() {
            if let Some(count) = count_scoped(conn, &self.staging, entity, dump_root_id)? {
                counts.insert(entity, count);
            }
        }
        Ok(counts)
    }

    /// Delete a local root and everything it owns.
    ///
    /// Children holding a RESTRICT reference into another part of the subtree
    /// are deleted first; cascades take care of the rest.
    pub fn delete_root(&self, conn: &Connection, local_root_id: i64) -> Result<()> {
        for entity in DELETE_BEFORE_ROOT {
            let Scope::Direct(column) = entity.scope() else {
                continue;
            };
            let removed = conn.execute(
                &format!(
                    "DELETE FROM {} WHERE {} = ?1",
                    qualified(MAIN_SCHEMA, entity.table()),
                    quote_ident(column)
                ),
                params![local_root_id],
            )?;
            debug!(entity = %entity, removed, "Deleted ahead of root");
        }

        let removed = conn.execute(
            &format!(
                "DELETE FROM {} WHERE id = ?1",
                qualified(MAIN_SCHEMA, EntityType::Project.table())
            ),
            params![local_root_id],
        )?;
        if removed == 0 {
            return Err(anyhow!("local project {} not found", local_root_id));
        }
        Ok(())
    }

    /// Plain insert into a production table.
    ///
    /// Returns the generated key, or `None` for tables without a surrogate key.
    pub fn insert(
        &self,
        conn: &Connection,
        table: &str,
        columns: &[String],
        values: &[Value],
        returns_id: bool,
    ) -> Result<Option<i64>> {
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            qualified(MAIN_SCHEMA, table),
            column_list,
            placeholders
        );
        conn.prepare_cached(&sql)?
            .execute(params_from_iter(values.iter()))
            .with_context(|| format!("inserting into {}", table))?;

        Ok(returns_id.then(|| conn.last_insert_rowid()))
    }

    /// Build one row's insert values column by column.
    ///
    /// Excluded columns become NULL, override columns take their fixed value,
    /// foreign keys go through the id map (falling back to the dump value with
    /// a warning), other dump columns are copied, and columns the dump lacks
    /// get a fallback value.
    fn build_values(&self, batch: &EntityBatch<'_>, record: &Record, warnings: &mut Vec<String>) -> Vec<Value> {
        let mut values = Vec::with_capacity(batch.insert_columns.len());

        for column in batch.insert_columns {
            let column = column.as_str();

            if batch.excluded.contains(&column) {
                values.push(Value::Null);
                continue;
            }

            if let Some(ov) = batch.overrides.iter().find(|o| o.column() == column) {
                values.push(self.override_value(ov));
                continue;
            }

            if let Some(fk) = batch.foreign_keys.iter().find(|fk| fk.column == column) {
                values.push(self.resolve_foreign_key(batch.entity, fk, record, warnings));
                continue;
            }

            if batch.staging_columns.contains(column) {
                values.push(record.get(column).cloned().unwrap_or(Value::Null));
                continue;
            }

            let value = batch
                .column_info
                .get(column)
                .map(fallback_value)
                .unwrap_or(Value::Null);
            values.push(value);
        }

        values
    }

    fn override_value(&self, ov: &Override) -> Value {
        match ov {
            Override::ImportingUser(_) => Value::Integer(self.user_id),
        }
    }

    fn resolve_foreign_key(
        &self,
        entity: EntityType,
        fk: &ForeignKey,
        record: &Record,
        warnings: &mut Vec<String>,
    ) -> Value {
        let raw = record.get(fk.column).cloned().unwrap_or(Value::Null);
        if raw == Value::Null {
            return raw;
        }

        let mapped = value_as_i64(&raw).and_then(|dump_id| match fk.references {
            EntityType::Field => self.ids.get_field(dump_id),
            other => self.ids.get(other, dump_id),
        });

        match mapped {
            Some(local_id) => Value::Integer(local_id),
            None => {
                let row = get_i64(record, "id")
                    .map(|id| format!(" {}", id))
                    .unwrap_or_default();
                warnings.push(format!(
                    "{}{}: {} = {} has no local {} mapping; dump value kept as-is",
                    entity,
                    row,
                    fk.column,
                    display_value(&raw),
                    fk.references
                ));
                raw
            }
        }
    }

    /// Insert a batch of rows, recording each new id as soon as it exists.
    pub fn load_entity_records(
        &mut self,
        conn: &Connection,
        batch: &EntityBatch<'_>,
    ) -> Result<LoadOutcome> {
        let mut outcome = LoadOutcome::default();

        for record in batch.records {
            let values = self.build_values(batch, record, &mut outcome.warnings);
            let new_id = self.insert(
                conn,
                batch.entity.table(),
                batch.insert_columns,
                &values,
                batch.has_auto_increment,
            )?;

            if let (Some(new_id), Some(dump_id)) = (new_id, get_i64(record, "id")) {
                self.ids.add(batch.entity, dump_id, new_id);
                outcome.id_map.insert(dump_id, new_id);
            }
            outcome.inserted += 1;
        }

        debug!(
            entity = %batch.entity,
            inserted = outcome.inserted,
            "Loaded entity batch"
        );
        Ok(outcome)
    }

    /// Introspect both schemas and load `records` using the entity's configuration.
    ///
    /// `foreign_keys` replaces the configured list when the caller resolves
    /// some references itself.
    pub fn load_entity(
        &mut self,
        conn: &Connection,
        entity: EntityType,
        records: &[Record],
        foreign_keys: Option<&[ForeignKey]>,
    ) -> Result<LoadOutcome> {
        if records.is_empty() {
            return Ok(LoadOutcome::default());
        }

        let inspector = SchemaInspector::new(conn);
        let column_info = inspector.column_info(MAIN_SCHEMA, entity.table())?;
        let staging_columns = inspector.column_info(&self.staging, entity.table())?;
        let insert_columns =
            inspector.insert_columns(MAIN_SCHEMA, entity.table(), &[], entity.has_auto_increment())?;

        let batch = EntityBatch {
            entity,
            records,
            insert_columns: &insert_columns,
            column_info: &column_info,
            staging_columns: &staging_columns,
            excluded: entity.excluded_columns(),
            overrides: entity.override_columns(),
            foreign_keys: foreign_keys.unwrap_or(entity.foreign_keys()),
            has_auto_increment: entity.has_auto_increment(),
        };
        self.load_entity_records(conn, &batch)
    }

    /// Insert a root project.
    ///
    /// With `local_root_id` the row keeps that id, so references from outside
    /// the import stay valid. A label already used by another project of the
    /// same user is dropped with a warning.
    pub fn insert_root(
        &mut self,
        conn: &Connection,
        record: &Record,
        local_root_id: Option<i64>,
    ) -> Result<(i64, Vec<String>)> {
        let entity = EntityType::Project;
        let dump_id = get_i64(record, "id").ok_or_else(|| anyhow!("project row has no id"))?;

        let inspector = SchemaInspector::new(conn);
        let column_info = inspector.column_info(MAIN_SCHEMA, entity.table())?;
        let staging_columns = inspector.column_info(&self.staging, entity.table())?;
        let mut insert_columns = inspector.insert_columns(MAIN_SCHEMA, entity.table(), &[], true)?;

        let mut warnings = Vec::new();
        let mut record = record.clone();

        if let Some(label) = get_str(&record, ROOT_LABEL_COLUMN).map(str::to_string) {
            if self.label_taken(conn, &label, local_root_id)? {
                warnings.push(format!(
                    "label '{}' is already used by another local project; imported without a label",
                    label
                ));
                record.insert(ROOT_LABEL_COLUMN.to_string(), Value::Null);
            }
        }

        let batch = EntityBatch {
            entity,
            records: std::slice::from_ref(&record),
            insert_columns: &insert_columns,
            column_info: &column_info,
            staging_columns: &staging_columns,
            excluded: entity.excluded_columns(),
            overrides: entity.override_columns(),
            foreign_keys: entity.foreign_keys(),
            has_auto_increment: true,
        };
        let mut values = self.build_values(&batch, &record, &mut warnings);

        if let Some(local_id) = local_root_id {
            insert_columns.insert(0, "id".to_string());
            values.insert(0, Value::Integer(local_id));
        }

        let new_id = self
            .insert(conn, entity.table(), &insert_columns, &values, true)?
            .ok_or_else(|| anyhow!("projects insert returned no id"))?;
        self.ids.add(entity, dump_id, new_id);

        Ok((new_id, warnings))
    }

    fn label_taken(&self, conn: &Connection, label: &str, except_id: Option<i64>) -> Result<bool> {
        let found = conn
            .query_row(
                &format!(
                    "SELECT 1 FROM {} WHERE user_id = ?1 AND {} = ?2 AND id != ?3",
                    qualified(MAIN_SCHEMA, EntityType::Project.table()),
                    quote_ident(ROOT_LABEL_COLUMN)
                ),
                params![self.user_id, label, except_id.unwrap_or(-1)],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

/// Count rows owned by a root in any schema. `None` when the table is missing.
pub fn count_scoped(
    conn: &Connection,
    schema: &str,
    entity: EntityType,
    root_id: i64,
) -> Result<Option<usize>> {
    let inspector = SchemaInspector::new(conn);
    if !inspector.table_exists(schema, entity.table())? {
        return Ok(None);
    }

    let sql = match entity.scope() {
        Scope::Root => format!(
            "SELECT COUNT(*) FROM {} WHERE id = ?1",
            qualified(schema, entity.table())
        ),
        Scope::Direct(column) => format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?1",
            qualified(schema, entity.table()),
            quote_ident(column)
        ),
        Scope::Via { parent, column } => {
            let Scope::Direct(parent_column) = parent.scope() else {
                return Err(anyhow!("{} must be owned directly by the root", parent));
            };
            if !inspector.table_exists(schema, parent.table())? {
                return Ok(None);
            }
            format!(
                "SELECT COUNT(*) FROM {} c JOIN {} p ON c.{} = p.id WHERE p.{} = ?1",
                qualified(schema, entity.table()),
                qualified(schema, parent.table()),
                quote_ident(column),
                quote_ident(parent_column)
            )
        }
        Scope::Referenced => return Ok(Some(0)),
    };

    let count: i64 = conn.query_row(&sql, params![root_id], |row| row.get(0))?;
    Ok(Some(count as usize))
}
