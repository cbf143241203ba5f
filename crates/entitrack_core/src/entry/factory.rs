//! Construction of entries of the right storage flavor.

use super::{Entry, EntryId, EntryStorage};
use crate::entity::{EntityMaterializer, EntityRef};
use crate::error::{TrackerError, TrackerResult};
use crate::metadata::EntityType;
use crate::value::Value;
use std::sync::Arc;

/// Builds entries, picking shadow, object or mixed storage from the
/// shape of the entity type.
#[derive(Clone)]
pub struct EntryFactory {
    materializer: Arc<dyn EntityMaterializer>,
}

impl std::fmt::Debug for EntryFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryFactory").finish_non_exhaustive()
    }
}

impl EntryFactory {
    /// Creates a factory that materializes objects with `materializer`.
    pub fn new(materializer: Arc<dyn EntityMaterializer>) -> Self {
        Self { materializer }
    }

    /// Creates an entry holding default values.
    ///
    /// Object-backed types get a freshly materialized object.
    pub fn create_new(&self, id: EntryId, entity_type: &Arc<EntityType>) -> TrackerResult<Entry> {
        if !entity_type.is_clr_backed() {
            let values = EntryStorage::shadow_defaults(entity_type);
            return Ok(Entry::new(
                id,
                Arc::clone(entity_type),
                EntryStorage::Shadow { values },
            ));
        }
        let entity = self.materializer.create(entity_type)?;
        self.create_for_entity(id, entity_type, entity)
    }

    /// Creates an entry wrapping an existing object.
    pub fn create_for_entity(
        &self,
        id: EntryId,
        entity_type: &Arc<EntityType>,
        entity: EntityRef,
    ) -> TrackerResult<Entry> {
        if !entity_type.is_clr_backed() {
            return Err(TrackerError::invalid_operation(format!(
                "entity type '{}' is shadow-only and cannot wrap an object",
                entity_type.name()
            )));
        }
        if entity.type_name() != entity_type.name() {
            return Err(TrackerError::invalid_operation(format!(
                "object of type '{}' cannot be tracked as '{}'",
                entity.type_name(),
                entity_type.name()
            )));
        }
        let storage = if entity_type.shadow_count() == 0 {
            EntryStorage::Object { entity }
        } else {
            EntryStorage::Mixed {
                entity,
                shadow: EntryStorage::shadow_defaults(entity_type),
            }
        };
        Ok(Entry::new(id, Arc::clone(entity_type), storage))
    }

    /// Creates an entry from a row of values in property order.
    pub fn create_from_values(
        &self,
        id: EntryId,
        entity_type: &Arc<EntityType>,
        values: &[Value],
    ) -> TrackerResult<Entry> {
        if values.len() != entity_type.properties().len() {
            return Err(TrackerError::invalid_operation(format!(
                "entity type '{}' has {} properties but {} values were supplied",
                entity_type.name(),
                entity_type.properties().len(),
                values.len()
            )));
        }
        let mut entry = self.create_new(id, entity_type)?;
        for (property, value) in entity_type.properties().iter().zip(values) {
            entry.write_raw(property, value.clone());
        }
        Ok(entry)
    }
}
