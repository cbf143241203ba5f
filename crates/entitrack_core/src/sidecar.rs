//! Named value overlays attached to an entry.
//!
//! A sidecar holds a partial copy of an entry's property and navigation
//! values. Capability flags decide whether reads and writes pass through it
//! and whether it is pushed into the entity after a successful save.

use crate::entity::NavigationValue;
use crate::metadata::{EntityType, Navigation, Property};
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;

/// Name of a sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SidecarName {
    /// Snapshot of values as last accepted.
    OriginalValues,
    /// Snapshot of key, foreign-key and navigation values.
    RelationshipsSnapshot,
    /// Overlay for values computed by the store during a save.
    StoreGeneratedValues,
    /// Any other sidecar.
    Custom(String),
}

impl fmt::Display for SidecarName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OriginalValues => f.write_str("OriginalValues"),
            Self::RelationshipsSnapshot => f.write_str("RelationshipsSnapshot"),
            Self::StoreGeneratedValues => f.write_str("StoreGeneratedValues"),
            Self::Custom(name) => f.write_str(name),
        }
    }
}

/// Capability flags of a sidecar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SidecarFlags {
    /// Reads prefer the sidecar's value when it holds one.
    pub transparent_read: bool,
    /// Writes land in the sidecar instead of the entity.
    pub transparent_write: bool,
    /// Values are pushed into the entity after a successful save.
    pub auto_commit: bool,
}

impl SidecarFlags {
    /// A plain snapshot: no transparency, no auto-commit.
    pub const SNAPSHOT: Self = Self {
        transparent_read: false,
        transparent_write: false,
        auto_commit: false,
    };

    /// A transparent overlay that commits after save.
    pub const OVERLAY: Self = Self {
        transparent_read: true,
        transparent_write: true,
        auto_commit: true,
    };
}

/// A named, partial key/value store over an entry's members.
#[derive(Debug, Clone)]
pub struct Sidecar {
    name: SidecarName,
    flags: SidecarFlags,
    storable: Vec<bool>,
    storable_navigations: Vec<bool>,
    values: HashMap<usize, Value>,
    navigations: HashMap<usize, NavigationValue>,
}

impl Sidecar {
    /// Creates a sidecar able to store the given properties.
    #[must_use]
    pub fn new(
        name: SidecarName,
        flags: SidecarFlags,
        entity_type: &EntityType,
        properties: impl IntoIterator<Item = usize>,
    ) -> Self {
        let mut storable = vec![false; entity_type.properties().len()];
        for index in properties {
            if let Some(slot) = storable.get_mut(index) {
                *slot = true;
            }
        }
        Self {
            name,
            flags,
            storable,
            storable_navigations: vec![false; entity_type.navigations().len()],
            values: HashMap::new(),
            navigations: HashMap::new(),
        }
    }

    /// An OriginalValues snapshot covering every property.
    #[must_use]
    pub fn original_values(entity_type: &EntityType) -> Self {
        Self::new(
            SidecarName::OriginalValues,
            SidecarFlags::SNAPSHOT,
            entity_type,
            0..entity_type.properties().len(),
        )
    }

    /// A RelationshipsSnapshot covering key properties and every navigation.
    #[must_use]
    pub fn relationships_snapshot(entity_type: &EntityType) -> Self {
        let mut sidecar = Self::new(
            SidecarName::RelationshipsSnapshot,
            SidecarFlags::SNAPSHOT,
            entity_type,
            entity_type
                .properties()
                .iter()
                .filter(|p| p.is_key_or_foreign_key())
                .map(Property::index),
        );
        sidecar.storable_navigations.fill(true);
        sidecar
    }

    /// A StoreGeneratedValues overlay for the given properties.
    #[must_use]
    pub fn store_generated_values(
        entity_type: &EntityType,
        properties: impl IntoIterator<Item = usize>,
    ) -> Self {
        Self::new(
            SidecarName::StoreGeneratedValues,
            SidecarFlags::OVERLAY,
            entity_type,
            properties,
        )
    }

    /// Returns the sidecar's name.
    #[must_use]
    pub fn name(&self) -> &SidecarName {
        &self.name
    }

    /// Returns the capability flags.
    #[must_use]
    pub fn flags(&self) -> SidecarFlags {
        self.flags
    }

    /// Returns true if reads pass through this sidecar.
    #[must_use]
    pub fn transparent_read(&self) -> bool {
        self.flags.transparent_read
    }

    /// Returns true if writes land in this sidecar.
    #[must_use]
    pub fn transparent_write(&self) -> bool {
        self.flags.transparent_write
    }

    /// Returns true if this sidecar is committed into the entity after save.
    #[must_use]
    pub fn auto_commit(&self) -> bool {
        self.flags.auto_commit
    }

    /// Returns true if this sidecar can hold a value for `property`.
    #[must_use]
    pub fn can_store(&self, property: &Property) -> bool {
        self.storable.get(property.index()).copied().unwrap_or(false)
    }

    /// Returns true if this sidecar can hold a value for `navigation`.
    #[must_use]
    pub fn can_store_navigation(&self, navigation: &Navigation) -> bool {
        self.storable_navigations
            .get(navigation.index())
            .copied()
            .unwrap_or(false)
    }

    /// Returns true if a value is held for `property`.
    #[must_use]
    pub fn has_value(&self, property: &Property) -> bool {
        self.values.contains_key(&property.index())
    }

    /// Returns the value held for `property`.
    #[must_use]
    pub fn value(&self, property: &Property) -> Option<&Value> {
        self.values.get(&property.index())
    }

    /// Stores `value` for `property`. Returns false if it cannot be stored.
    pub fn set_value(&mut self, property: &Property, value: Value) -> bool {
        if !self.can_store(property) {
            return false;
        }
        self.values.insert(property.index(), value);
        true
    }

    /// Stores `value` only if nothing is held for `property` yet.
    pub fn ensure_value(&mut self, property: &Property, value: Value) {
        if self.can_store(property) {
            self.values.entry(property.index()).or_insert(value);
        }
    }

    /// Forgets the value held for `property`.
    pub fn remove_value(&mut self, property: &Property) -> Option<Value> {
        self.values.remove(&property.index())
    }

    /// Iterates held values as `(property index, value)`.
    pub fn values(&self) -> impl Iterator<Item = (usize, &Value)> {
        self.values.iter().map(|(index, value)| (*index, value))
    }

    /// Returns the snapshot held for `navigation`.
    #[must_use]
    pub fn navigation(&self, navigation: &Navigation) -> Option<&NavigationValue> {
        self.navigations.get(&navigation.index())
    }

    /// Stores a navigation snapshot.
    pub fn set_navigation(&mut self, navigation: &Navigation, value: NavigationValue) -> bool {
        if !self.can_store_navigation(navigation) {
            return false;
        }
        self.navigations.insert(navigation.index(), value);
        true
    }

    /// Returns true if no values are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.navigations.is_empty()
    }

    /// Forgets every held value.
    pub fn clear(&mut self) {
        self.values.clear();
        self.navigations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityTypeDef, Model, NavigationDef, PropertyDef};
    use crate::value::ValueKind;

    fn model() -> Model {
        Model::builder()
            .entity_type(
                EntityTypeDef::new("Blog")
                    .property(PropertyDef::new("Id", ValueKind::Integer))
                    .property(PropertyDef::new("Title", ValueKind::Text).nullable())
                    .key(["Id"]),
            )
            .entity_type(
                EntityTypeDef::new("Post")
                    .property(PropertyDef::new("Id", ValueKind::Integer))
                    .property(PropertyDef::new("BlogId", ValueKind::Integer))
                    .property(PropertyDef::new("Body", ValueKind::Text).nullable())
                    .key(["Id"])
                    .foreign_key(crate::metadata::ForeignKeyDef::new(["BlogId"], "Blog"))
                    .navigation(NavigationDef::reference("Blog", "Blog")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn relationships_snapshot_covers_keys_only() {
        let model = model();
        let post = model.entity_type("Post").unwrap();
        let sidecar = Sidecar::relationships_snapshot(post);

        assert!(sidecar.can_store(post.property("Id").unwrap()));
        assert!(sidecar.can_store(post.property("BlogId").unwrap()));
        assert!(!sidecar.can_store(post.property("Body").unwrap()));
        assert!(sidecar.can_store_navigation(post.navigation("Blog").unwrap()));
    }

    #[test]
    fn set_value_respects_storable_set() {
        let model = model();
        let blog = model.entity_type("Blog").unwrap();
        let id = blog.property("Id").unwrap();
        let title = blog.property("Title").unwrap();
        let mut sidecar = Sidecar::store_generated_values(blog, [id.index()]);

        assert!(sidecar.set_value(id, Value::Integer(7)));
        assert!(!sidecar.set_value(title, Value::from("x")));
        assert_eq!(sidecar.value(id), Some(&Value::Integer(7)));
        assert!(!sidecar.has_value(title));
        assert!(sidecar.transparent_read() && sidecar.auto_commit());
    }

    #[test]
    fn ensure_value_keeps_first_snapshot() {
        let model = model();
        let blog = model.entity_type("Blog").unwrap();
        let title = blog.property("Title").unwrap();
        let mut sidecar = Sidecar::original_values(blog);

        sidecar.ensure_value(title, Value::from("first"));
        sidecar.ensure_value(title, Value::from("second"));
        assert_eq!(sidecar.value(title), Some(&Value::from("first")));

        sidecar.clear();
        assert!(sidecar.is_empty());
    }
}
