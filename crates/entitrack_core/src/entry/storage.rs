//! Primary value storage for the three entry flavors.

use crate::entity::{EntityRef, NavigationValue};
use crate::metadata::{EntityType, Navigation, Property};
use crate::value::Value;

/// Where an entry keeps its current values.
///
/// Chosen once by the entry factory from the shape of the entity type.
#[derive(Debug, Clone)]
pub(crate) enum EntryStorage {
    /// Schema-only record; every value lives in the entry.
    Shadow { values: Vec<Value> },
    /// Every property is a member of the object.
    Object { entity: EntityRef },
    /// Object members plus shadow slots kept in the entry.
    Mixed {
        entity: EntityRef,
        shadow: Vec<Value>,
    },
}

impl EntryStorage {
    /// Shadow slots initialised to each shadow property's default.
    pub(crate) fn shadow_defaults(entity_type: &EntityType) -> Vec<Value> {
        let mut slots = vec![Value::Null; entity_type.shadow_count()];
        for property in entity_type.properties() {
            if let Some(slot) = property.shadow_index() {
                slots[slot] = property.default_value();
            }
        }
        slots
    }

    pub(crate) fn entity(&self) -> Option<&EntityRef> {
        match self {
            Self::Shadow { .. } => None,
            Self::Object { entity } | Self::Mixed { entity, .. } => Some(entity),
        }
    }

    pub(crate) fn read(&self, property: &Property) -> Value {
        match (self, property.shadow_index()) {
            (Self::Shadow { values }, Some(slot)) | (Self::Mixed { shadow: values, .. }, Some(slot)) => {
                values.get(slot).cloned().unwrap_or(Value::Null)
            }
            (Self::Object { entity } | Self::Mixed { entity, .. }, None) => entity.get_value(property),
            _ => Value::Null,
        }
    }

    pub(crate) fn write(&mut self, property: &Property, value: Value) {
        match (self, property.shadow_index()) {
            (Self::Shadow { values }, Some(slot)) | (Self::Mixed { shadow: values, .. }, Some(slot)) => {
                if let Some(target) = values.get_mut(slot) {
                    *target = value;
                }
            }
            (Self::Object { entity } | Self::Mixed { entity, .. }, None) => {
                entity.set_value(property, value);
            }
            _ => {}
        }
    }

    pub(crate) fn read_navigation(&self, navigation: &Navigation) -> NavigationValue {
        match self.entity() {
            Some(entity) => entity.navigation(navigation),
            None => NavigationValue::empty(navigation),
        }
    }
}
