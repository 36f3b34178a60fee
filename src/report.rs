//! Accumulated outcome of a load call.

use crate::entities::EntityType;
use crate::id_map::IdMap;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

/// Status of one requested root project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RootStatus {
    Pending,
    Success,
    Skipped,
    Error,
    DryRun,
}

impl RootStatus {
    /// Terminal statuses never change again; only warnings may be added.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RootStatus::Success | RootStatus::Skipped | RootStatus::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RootStatus::Pending => "pending",
            RootStatus::Success => "success",
            RootStatus::Skipped => "skipped",
            RootStatus::Error => "error",
            RootStatus::DryRun => "dry-run",
        }
    }
}

impl std::fmt::Display for RootStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report entry for one requested root.
#[derive(Debug, Clone, Serialize)]
pub struct RootEntry {
    /// Id of the project in the dump.
    pub dump_id: i64,
    pub name: Option<String>,
    pub status: RootStatus,
    pub is_replacement: bool,
    /// Local id of the loaded (or, in a dry run, replaced) project.
    pub local_id: Option<i64>,
    pub inserted: BTreeMap<EntityType, usize>,
    pub deleted: BTreeMap<EntityType, usize>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl RootEntry {
    fn new(dump_id: i64, name: Option<String>) -> Self {
        Self {
            dump_id,
            name,
            status: RootStatus::Pending,
            is_replacement: false,
            local_id: None,
            inserted: BTreeMap::new(),
            deleted: BTreeMap::new(),
            warnings: Vec::new(),
            error: None,
        }
    }

    pub fn total_inserted(&self) -> usize {
        self.inserted.values().sum()
    }

    pub fn total_deleted(&self) -> usize {
        self.deleted.values().sum()
    }

    pub fn inserted_count(&self, entity: EntityType) -> usize {
        self.inserted.get(&entity).copied().unwrap_or(0)
    }

    pub fn deleted_count(&self, entity: EntityType) -> usize {
        self.deleted.get(&entity).copied().unwrap_or(0)
    }
}

/// Per-root results plus the id mappings of everything that was committed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub dry_run: bool,
    roots: Vec<RootEntry>,
    global_warnings: Vec<String>,
    id_mappings: BTreeMap<EntityType, BTreeMap<i64, i64>>,
}

impl LoadReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    fn entry_mut(&mut self, dump_id: i64) -> &mut RootEntry {
        if let Some(idx) = self.roots.iter().position(|r| r.dump_id == dump_id) {
            &mut self.roots[idx]
        } else {
            self.roots.push(RootEntry::new(dump_id, None));
            let last = self.roots.len() - 1;
            &mut self.roots[last]
        }
    }

    /// Register a root as pending. Calling it again only fills in the name.
    pub fn init_root(&mut self, dump_id: i64, name: Option<String>) {
        let entry = self.entry_mut(dump_id);
        if name.is_some() {
            entry.name = name;
        }
    }

    /// Change a root's status. Ignored (returns `false`) once the status is terminal.
    pub fn set_status(&mut self, dump_id: i64, status: RootStatus) -> bool {
        let entry = self.entry_mut(dump_id);
        if entry.status.is_terminal() {
            warn!(
                root = dump_id,
                current = %entry.status,
                requested = %status,
                "Ignoring status change on finished root"
            );
            return false;
        }
        entry.status = status;
        true
    }

    /// Mark a root as failed with a message. Terminal.
    pub fn set_error(&mut self, dump_id: i64, message: impl Into<String>) -> bool {
        let message = message.into();
        if !self.set_status(dump_id, RootStatus::Error) {
            return false;
        }
        self.entry_mut(dump_id).error = Some(message);
        true
    }

    pub fn set_replacement(&mut self, dump_id: i64, is_replacement: bool) {
        self.entry_mut(dump_id).is_replacement = is_replacement;
    }

    pub fn set_local_id(&mut self, dump_id: i64, local_id: i64) {
        self.entry_mut(dump_id).local_id = Some(local_id);
    }

    pub fn add_inserted(&mut self, dump_id: i64, entity: EntityType, count: usize) {
        if count == 0 {
            return;
        }
        *self.entry_mut(dump_id).inserted.entry(entity).or_default() += count;
    }

    pub fn add_deleted(&mut self, dump_id: i64, entity: EntityType, count: usize) {
        if count == 0 {
            return;
        }
        *self.entry_mut(dump_id).deleted.entry(entity).or_default() += count;
    }

    pub fn add_warning(&mut self, dump_id: i64, warning: impl Into<String>) {
        self.entry_mut(dump_id).warnings.push(warning.into());
    }

    pub fn add_warnings(&mut self, dump_id: i64, warnings: impl IntoIterator<Item = String>) {
        self.entry_mut(dump_id).warnings.extend(warnings);
    }

    /// Warning not tied to a single root (schema drift, missing tables).
    pub fn add_global_warning(&mut self, warning: impl Into<String>) {
        self.global_warnings.push(warning.into());
    }

    /// Copy committed mappings into the report.
    pub fn record_mappings(&mut self, ids: &IdMap) {
        for (entity, map) in ids.iter() {
            let target = self.id_mappings.entry(entity).or_default();
            for (dump_id, local_id) in map {
                target.entry(*dump_id).or_insert(*local_id);
            }
        }
    }

    // Read accessors

    pub fn root(&self, dump_id: i64) -> Option<&RootEntry> {
        self.roots.iter().find(|r| r.dump_id == dump_id)
    }

    pub fn roots(&self) -> &[RootEntry] {
        &self.roots
    }

    pub fn global_warnings(&self) -> &[String] {
        &self.global_warnings
    }

    pub fn id_mappings(&self) -> &BTreeMap<EntityType, BTreeMap<i64, i64>> {
        &self.id_mappings
    }

    /// Local id a dump id was loaded as.
    pub fn mapping(&self, entity: EntityType, dump_id: i64) -> Option<i64> {
        self.id_mappings
            .get(&entity)
            .and_then(|m| m.get(&dump_id))
            .copied()
    }

    fn count_status(&self, status: RootStatus) -> usize {
        self.roots.iter().filter(|r| r.status == status).count()
    }

    pub fn success_count(&self) -> usize {
        self.count_status(RootStatus::Success)
    }

    pub fn error_count(&self) -> usize {
        self.count_status(RootStatus::Error)
    }

    pub fn skipped_count(&self) -> usize {
        self.count_status(RootStatus::Skipped)
    }

    pub fn dry_run_count(&self) -> usize {
        self.count_status(RootStatus::DryRun)
    }

    /// Roots loaded (or previewed) as new projects.
    pub fn new_count(&self) -> usize {
        self.roots
            .iter()
            .filter(|r| matches!(r.status, RootStatus::Success | RootStatus::DryRun))
            .filter(|r| !r.is_replacement)
            .count()
    }

    /// Roots loaded (or previewed) over an existing local project.
    pub fn replacement_count(&self) -> usize {
        self.roots
            .iter()
            .filter(|r| matches!(r.status, RootStatus::Success | RootStatus::DryRun))
            .filter(|r| r.is_replacement)
            .count()
    }

    pub fn has_errors(&self) -> bool {
        self.error_count() > 0
    }
}
