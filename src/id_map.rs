//! Dump-id to local-id mappings built during one load call.

use crate::entities::EntityType;
use std::collections::BTreeMap;

/// Per-entity-type mapping from dump primary keys to local primary keys.
///
/// Once a dump id is mapped for an entity type, the mapping is never
/// replaced: every later lookup resolves to the first local id recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMap {
    maps: BTreeMap<EntityType, BTreeMap<i64, i64>>,
}

impl IdMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mapping. Returns `false` if the dump id was already mapped,
    /// in which case the existing mapping is kept.
    pub fn add(&mut self, entity: EntityType, dump_id: i64, local_id: i64) -> bool {
        let map = self.maps.entry(entity).or_default();
        if map.contains_key(&dump_id) {
            return false;
        }
        map.insert(dump_id, local_id);
        true
    }

    pub fn get(&self, entity: EntityType, dump_id: i64) -> Option<i64> {
        self.maps.get(&entity).and_then(|m| m.get(&dump_id)).copied()
    }

    /// Resolve a field id loaded either as a project field or a global field.
    pub fn get_field(&self, dump_id: i64) -> Option<i64> {
        self.get(EntityType::Field, dump_id)
            .or_else(|| self.get(EntityType::GlobalField, dump_id))
    }

    /// Mappings for one entity type.
    pub fn entity(&self, entity: EntityType) -> Option<&BTreeMap<i64, i64>> {
        self.maps.get(&entity)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityType, &BTreeMap<i64, i64>)> {
        self.maps.iter().map(|(e, m)| (*e, m))
    }

    pub fn len(&self) -> usize {
        self.maps.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.maps.clear();
    }
}
