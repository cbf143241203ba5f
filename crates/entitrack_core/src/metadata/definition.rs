//! Serializable model definitions.
//!
//! Definitions refer to properties and entity types by name. They are turned
//! into resolved [`EntityType`](super::EntityType)s by
//! [`ModelBuilder::build`](super::ModelBuilder::build).

use super::ValueGeneration;
use crate::value::ValueKind;
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Definition of a scalar property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDef {
    /// Property name.
    pub name: String,
    /// Declared value kind.
    pub kind: ValueKind,
    /// Whether the property accepts null.
    #[serde(default)]
    pub nullable: bool,
    /// Whether the property is read-only once tracked.
    #[serde(default)]
    pub read_only: bool,
    /// Value generation strategy.
    #[serde(default)]
    pub value_generation: ValueGeneration,
    /// Whether the property has no backing member on the entity object.
    #[serde(default)]
    pub shadow: bool,
    /// Whether the store supplies a default value.
    #[serde(default)]
    pub store_default: bool,
}

impl PropertyDef {
    /// Creates a non-nullable, writable property definition.
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            read_only: false,
            value_generation: ValueGeneration::None,
            shadow: false,
            store_default: false,
        }
    }

    /// Marks the property nullable.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Marks the property read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Sets the value generation strategy.
    #[must_use]
    pub fn generated(mut self, strategy: ValueGeneration) -> Self {
        self.value_generation = strategy;
        self
    }

    /// Marks the property as a shadow property.
    #[must_use]
    pub fn shadow(mut self) -> Self {
        self.shadow = true;
        self
    }

    /// Marks the property as having a store-side default.
    #[must_use]
    pub fn store_default(mut self) -> Self {
        self.store_default = true;
        self
    }
}

/// Definition of a navigation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationDef {
    /// Navigation name.
    pub name: String,
    /// Target entity type name.
    pub target: String,
    /// Whether the navigation is to-many.
    #[serde(default)]
    pub collection: bool,
}

impl NavigationDef {
    /// Creates a reference navigation definition.
    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            collection: false,
        }
    }

    /// Creates a collection navigation definition.
    pub fn collection(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            collection: true,
        }
    }
}

/// Definition of a foreign key on a dependent type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    /// Ordered dependent property names.
    pub properties: Vec<String>,
    /// Principal entity type name.
    pub principal: String,
    /// Ordered principal property names; defaults to the principal's primary key.
    #[serde(default)]
    pub principal_properties: Vec<String>,
}

impl ForeignKeyDef {
    /// Creates a foreign key referencing the principal's primary key.
    pub fn new<I, S>(properties: I, principal: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            properties: properties.into_iter().map(Into::into).collect(),
            principal: principal.into(),
            principal_properties: Vec::new(),
        }
    }

    /// References explicit principal properties instead of the primary key.
    #[must_use]
    pub fn referencing<I, S>(mut self, principal_properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.principal_properties = principal_properties.into_iter().map(Into::into).collect();
        self
    }
}

/// Definition of an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTypeDef {
    /// Entity type name; also the runtime type name reported by entity objects.
    pub name: String,
    /// Whether instances are backed by an entity object.
    #[serde(default = "default_true")]
    pub clr_backed: bool,
    /// Properties in index order.
    #[serde(default)]
    pub properties: Vec<PropertyDef>,
    /// Primary key property names.
    #[serde(default)]
    pub key: Vec<String>,
    /// Foreign keys on this type.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDef>,
    /// Navigations in index order.
    #[serde(default)]
    pub navigations: Vec<NavigationDef>,
}

impl EntityTypeDef {
    /// Creates an object-backed entity type definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clr_backed: true,
            properties: Vec::new(),
            key: Vec::new(),
            foreign_keys: Vec::new(),
            navigations: Vec::new(),
        }
    }

    /// Creates a definition tracked only through shadow storage.
    pub fn shadow(name: impl Into<String>) -> Self {
        Self {
            clr_backed: false,
            ..Self::new(name)
        }
    }

    /// Adds a property.
    #[must_use]
    pub fn property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    /// Sets the primary key.
    #[must_use]
    pub fn key<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key = properties.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a foreign key.
    #[must_use]
    pub fn foreign_key(mut self, foreign_key: ForeignKeyDef) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    /// Adds a navigation.
    #[must_use]
    pub fn navigation(mut self, navigation: NavigationDef) -> Self {
        self.navigations.push(navigation);
        self
    }
}

/// Definition of a whole model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDef {
    /// Entity types in the model.
    pub entity_types: Vec<EntityTypeDef>,
}
