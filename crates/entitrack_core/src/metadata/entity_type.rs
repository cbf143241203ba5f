//! Entity type, property, navigation and foreign-key descriptors.

use crate::error::{TrackerError, TrackerResult};
use crate::value::{Value, ValueKind};
use serde::{Deserialize, Serialize};

/// When a property receives a generated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueGeneration {
    /// The caller always supplies the value.
    #[default]
    None,
    /// A value is generated when the entity is added.
    OnAdd,
    /// A value is generated on add and recomputed by the store on every update.
    OnAddAndUpdate,
}

/// A scalar property of an entity type.
#[derive(Debug, Clone)]
pub struct Property {
    pub(crate) name: String,
    pub(crate) index: usize,
    pub(crate) kind: ValueKind,
    pub(crate) nullable: bool,
    pub(crate) read_only: bool,
    pub(crate) value_generation: ValueGeneration,
    pub(crate) shadow: bool,
    pub(crate) shadow_index: Option<usize>,
    pub(crate) store_default: bool,
    pub(crate) primary_key: bool,
    pub(crate) foreign_key: bool,
    pub(crate) principal_key: bool,
}

impl Property {
    /// Returns the property name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stable index of the property within its entity type.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the declared value kind.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Returns true if the property accepts null.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Returns true if the property cannot be modified once tracked.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns the value generation strategy.
    #[must_use]
    pub fn value_generation(&self) -> ValueGeneration {
        self.value_generation
    }

    /// Returns true if the property has no backing member on the entity object.
    #[must_use]
    pub fn is_shadow(&self) -> bool {
        self.shadow
    }

    /// Slot of this property in an entry's shadow storage, if it has one.
    #[must_use]
    pub fn shadow_index(&self) -> Option<usize> {
        self.shadow_index
    }

    /// Returns true if the store supplies a default when no value is given.
    #[must_use]
    pub fn has_store_default(&self) -> bool {
        self.store_default
    }

    /// Returns true if the property is part of the primary key.
    #[must_use]
    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    /// Returns true if the property is part of a foreign key.
    #[must_use]
    pub fn is_foreign_key(&self) -> bool {
        self.foreign_key
    }

    /// Returns true if some foreign key references this property.
    #[must_use]
    pub fn is_principal_key(&self) -> bool {
        self.principal_key
    }

    /// Returns true if the property takes part in any key or relationship.
    #[must_use]
    pub fn is_key_or_foreign_key(&self) -> bool {
        self.primary_key || self.foreign_key || self.principal_key
    }

    /// Returns the default value for this property.
    #[must_use]
    pub fn default_value(&self) -> Value {
        if self.nullable {
            Value::Null
        } else {
            self.kind.default_value()
        }
    }

    /// Returns true if `value` is this property's default.
    pub fn is_default(&self, value: &Value) -> bool {
        *value == self.default_value()
    }
}

/// A relationship from one entity type to another.
#[derive(Debug, Clone)]
pub struct Navigation {
    pub(crate) name: String,
    pub(crate) index: usize,
    pub(crate) target: String,
    pub(crate) collection: bool,
}

impl Navigation {
    /// Returns the navigation name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the index of the navigation within its entity type.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the name of the entity type on the other end.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns true for to-many navigations.
    #[must_use]
    pub fn is_collection(&self) -> bool {
        self.collection
    }
}

/// A foreign key from a dependent entity type to a principal entity type.
#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub(crate) index: usize,
    pub(crate) dependent_type: String,
    pub(crate) properties: Vec<usize>,
    pub(crate) principal_type: String,
    pub(crate) principal_properties: Vec<usize>,
}

impl ForeignKey {
    /// Returns the index of the foreign key within its dependent type.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the dependent entity type name.
    #[must_use]
    pub fn dependent_type(&self) -> &str {
        &self.dependent_type
    }

    /// Ordered dependent property indices.
    #[must_use]
    pub fn properties(&self) -> &[usize] {
        &self.properties
    }

    /// Returns the principal entity type name.
    #[must_use]
    pub fn principal_type(&self) -> &str {
        &self.principal_type
    }

    /// Ordered principal property indices (on the principal type).
    #[must_use]
    pub fn principal_properties(&self) -> &[usize] {
        &self.principal_properties
    }
}

/// Describes one entity type: its properties, navigations and keys.
#[derive(Debug, Clone)]
pub struct EntityType {
    pub(crate) name: String,
    pub(crate) clr_backed: bool,
    pub(crate) properties: Vec<Property>,
    pub(crate) navigations: Vec<Navigation>,
    pub(crate) primary_key: Vec<usize>,
    pub(crate) foreign_keys: Vec<ForeignKey>,
    pub(crate) shadow_count: usize,
}

impl EntityType {
    /// Returns the entity type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if instances are backed by a live entity object.
    ///
    /// Types that are not backed are tracked purely through shadow storage.
    #[must_use]
    pub fn is_clr_backed(&self) -> bool {
        self.clr_backed
    }

    /// Returns all properties ordered by index.
    #[must_use]
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    /// Returns the property at `index`.
    #[must_use]
    pub fn property_at(&self, index: usize) -> Option<&Property> {
        self.properties.get(index)
    }

    /// Looks up a property by name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Looks up a property by name, failing if it does not exist.
    pub fn find_property(&self, name: &str) -> TrackerResult<&Property> {
        self.property(name)
            .ok_or_else(|| TrackerError::UnknownProperty {
                entity_type: self.name.clone(),
                name: name.to_string(),
            })
    }

    /// Returns all navigations ordered by index.
    #[must_use]
    pub fn navigations(&self) -> &[Navigation] {
        &self.navigations
    }

    /// Looks up a navigation by name.
    #[must_use]
    pub fn navigation(&self, name: &str) -> Option<&Navigation> {
        self.navigations.iter().find(|n| n.name == name)
    }

    /// Looks up a navigation by name, failing if it does not exist.
    pub fn find_navigation(&self, name: &str) -> TrackerResult<&Navigation> {
        self.navigation(name)
            .ok_or_else(|| TrackerError::UnknownNavigation {
                entity_type: self.name.clone(),
                name: name.to_string(),
            })
    }

    /// Primary key property indices, in key order. Empty for keyless types.
    #[must_use]
    pub fn primary_key(&self) -> &[usize] {
        &self.primary_key
    }

    /// Iterates over the primary key properties in key order.
    pub fn primary_key_properties(&self) -> impl Iterator<Item = &Property> {
        self.primary_key.iter().map(|&i| &self.properties[i])
    }

    /// Foreign keys declared on this (dependent) type.
    #[must_use]
    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    /// Number of shadow slots an entry of this type needs.
    #[must_use]
    pub fn shadow_count(&self) -> usize {
        self.shadow_count
    }

    /// Returns true if any property is generated when the entity is added.
    #[must_use]
    pub fn has_generated_values(&self) -> bool {
        self.properties
            .iter()
            .any(|p| p.value_generation != ValueGeneration::None)
    }
}
