//! Entity objects and the seam for materializing them.

use crate::error::{TrackerError, TrackerResult};
use crate::metadata::{EntityType, Navigation, Property};
use crate::notify::NotificationSink;
use crate::value::Value;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;

/// Shared handle to an entity object.
pub type EntityRef = Arc<dyn Entity>;

/// An application object whose state can be tracked.
///
/// Implementations use interior mutability: the tracker reads and writes
/// through a shared reference. Shadow properties are never passed to
/// [`get_value`](Entity::get_value) or [`set_value`](Entity::set_value).
pub trait Entity: Send + Sync + fmt::Debug {
    /// Name of the entity type this object belongs to.
    fn type_name(&self) -> &str;

    /// Reads a non-shadow property.
    fn get_value(&self, property: &Property) -> Value;

    /// Writes a non-shadow property.
    fn set_value(&self, property: &Property, value: Value);

    /// Reads a navigation.
    fn navigation(&self, navigation: &Navigation) -> NavigationValue {
        NavigationValue::empty(navigation)
    }

    /// Writes a navigation.
    fn set_navigation(&self, _navigation: &Navigation, _value: NavigationValue) {}

    /// Subscribes the tracker to native change notifications.
    ///
    /// Returns `false` when the object does not raise notifications.
    fn subscribe(&self, _sink: NotificationSink) -> bool {
        false
    }
}

/// Reference identity of an entity object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(usize);

impl ObjectId {
    /// Identity of the object behind `entity`.
    #[must_use]
    pub fn of(entity: &EntityRef) -> Self {
        Self(Arc::as_ptr(entity) as *const () as usize)
    }
}

/// Current value of a navigation.
#[derive(Debug, Clone)]
pub enum NavigationValue {
    /// A reference navigation, possibly unset.
    Reference(Option<EntityRef>),
    /// A collection navigation.
    Collection(Vec<EntityRef>),
}

impl NavigationValue {
    /// The unset value for `navigation`.
    #[must_use]
    pub fn empty(navigation: &Navigation) -> Self {
        if navigation.is_collection() {
            Self::Collection(Vec::new())
        } else {
            Self::Reference(None)
        }
    }

    /// Returns the referenced object, if this is a set reference.
    #[must_use]
    pub fn as_reference(&self) -> Option<&EntityRef> {
        match self {
            Self::Reference(target) => target.as_ref(),
            Self::Collection(_) => None,
        }
    }

    /// Returns the collection members, empty for references.
    #[must_use]
    pub fn as_collection(&self) -> &[EntityRef] {
        match self {
            Self::Collection(items) => items,
            Self::Reference(_) => &[],
        }
    }

    /// Compares by reference identity.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Reference(a), Self::Reference(b)) => match (a, b) {
                (None, None) => true,
                (Some(a), Some(b)) => ObjectId::of(a) == ObjectId::of(b),
                _ => false,
            },
            (Self::Collection(a), Self::Collection(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|(x, y)| ObjectId::of(x) == ObjectId::of(y))
            }
            _ => false,
        }
    }
}

/// Creates entity objects when materializing rows into tracked entries.
pub trait EntityMaterializer: Send + Sync {
    /// Creates an empty object for `entity_type`.
    fn create(&self, entity_type: &EntityType) -> TrackerResult<EntityRef>;
}

/// Materializer producing [`DynamicEntity`] objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct DynamicMaterializer {
    notifications: bool,
}

impl DynamicMaterializer {
    /// Materializer producing non-notifying objects.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            notifications: false,
        }
    }

    /// Materializer producing objects that raise change notifications.
    #[must_use]
    pub const fn notifying() -> Self {
        Self {
            notifications: true,
        }
    }
}

impl EntityMaterializer for DynamicMaterializer {
    fn create(&self, entity_type: &EntityType) -> TrackerResult<EntityRef> {
        if !entity_type.is_clr_backed() {
            return Err(TrackerError::invalid_operation(format!(
                "entity type '{}' has no object representation",
                entity_type.name()
            )));
        }
        let entity = if self.notifications {
            DynamicEntity::notifying(entity_type)
        } else {
            DynamicEntity::new(entity_type)
        };
        Ok(entity.into_ref())
    }
}

/// A general-purpose entity object holding values by property position.
///
/// Optionally raises change notifications through every subscribed sink,
/// the way a hand-written object with notifying setters would.
pub struct DynamicEntity {
    type_name: String,
    property_names: Vec<String>,
    navigation_names: Vec<String>,
    values: RwLock<Vec<Value>>,
    navigations: RwLock<Vec<NavigationValue>>,
    notifies: bool,
    sinks: Mutex<Vec<NotificationSink>>,
}

impl fmt::Debug for DynamicEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicEntity")
            .field("type_name", &self.type_name)
            .field("values", &*self.values.read())
            .field("notifies", &self.notifies)
            .finish_non_exhaustive()
    }
}

impl DynamicEntity {
    /// Creates an object with every property at its default value.
    #[must_use]
    pub fn new(entity_type: &EntityType) -> Self {
        Self::build(entity_type, false)
    }

    /// Creates an object that raises change notifications.
    #[must_use]
    pub fn notifying(entity_type: &EntityType) -> Self {
        Self::build(entity_type, true)
    }

    fn build(entity_type: &EntityType, notifies: bool) -> Self {
        Self {
            type_name: entity_type.name().to_string(),
            property_names: entity_type
                .properties()
                .iter()
                .map(|p| p.name().to_string())
                .collect(),
            navigation_names: entity_type
                .navigations()
                .iter()
                .map(|n| n.name().to_string())
                .collect(),
            values: RwLock::new(
                entity_type
                    .properties()
                    .iter()
                    .map(Property::default_value)
                    .collect(),
            ),
            navigations: RwLock::new(
                entity_type
                    .navigations()
                    .iter()
                    .map(NavigationValue::empty)
                    .collect(),
            ),
            notifies,
            sinks: Mutex::new(Vec::new()),
        }
    }

    /// Sets a property by name and returns `self`, for building objects.
    #[must_use]
    pub fn with(self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Wraps the object in a shared handle.
    #[must_use]
    pub fn into_ref(self) -> EntityRef {
        Arc::new(self)
    }

    /// Returns `true` if the object raises change notifications.
    #[must_use]
    pub fn is_notifying(&self) -> bool {
        self.notifies
    }

    /// Reads a property by name; unknown names read as null.
    #[must_use]
    pub fn get(&self, name: &str) -> Value {
        self.property_slot(name)
            .map(|slot| self.values.read()[slot].clone())
            .unwrap_or(Value::Null)
    }

    /// Writes a property by name. Unknown names are ignored.
    pub fn set(&self, name: &str, value: impl Into<Value>) {
        if let Some(slot) = self.property_slot(name) {
            self.write_slot(slot, value.into());
        }
    }

    /// Reads a reference navigation by name.
    #[must_use]
    pub fn reference(&self, name: &str) -> Option<EntityRef> {
        self.navigation_slot(name).and_then(|slot| {
            self.navigations.read()[slot]
                .as_reference()
                .cloned()
        })
    }

    /// Points a reference navigation at `target`.
    pub fn set_reference(&self, name: &str, target: Option<EntityRef>) {
        if let Some(slot) = self.navigation_slot(name) {
            self.write_navigation(slot, NavigationValue::Reference(target));
        }
    }

    /// Returns the members of a collection navigation.
    #[must_use]
    pub fn collection(&self, name: &str) -> Vec<EntityRef> {
        self.navigation_slot(name)
            .map(|slot| self.navigations.read()[slot].as_collection().to_vec())
            .unwrap_or_default()
    }

    /// Adds `item` to a collection navigation.
    ///
    /// Collections never raise notifications; they are picked up by change
    /// detection.
    pub fn add_to(&self, name: &str, item: EntityRef) {
        if let Some(slot) = self.navigation_slot(name) {
            if let NavigationValue::Collection(items) = &mut self.navigations.write()[slot] {
                items.push(item);
            }
        }
    }

    /// Removes `item` from a collection navigation.
    pub fn remove_from(&self, name: &str, item: &EntityRef) {
        let id = ObjectId::of(item);
        if let Some(slot) = self.navigation_slot(name) {
            if let NavigationValue::Collection(items) = &mut self.navigations.write()[slot] {
                items.retain(|existing| ObjectId::of(existing) != id);
            }
        }
    }

    fn property_slot(&self, name: &str) -> Option<usize> {
        self.property_names.iter().position(|n| n == name)
    }

    fn navigation_slot(&self, name: &str) -> Option<usize> {
        self.navigation_names.iter().position(|n| n == name)
    }

    fn write_slot(&self, slot: usize, value: Value) {
        let previous = self.values.read()[slot].clone();
        if previous == value {
            return;
        }
        let name = &self.property_names[slot];
        self.notify_changing(name, Some(previous));
        self.values.write()[slot] = value;
        self.notify_changed(name);
    }

    fn write_navigation(&self, slot: usize, value: NavigationValue) {
        if self.navigations.read()[slot].same_as(&value) {
            return;
        }
        let is_reference = matches!(value, NavigationValue::Reference(_));
        let name = &self.navigation_names[slot];
        if is_reference {
            self.notify_changing(name, None);
        }
        self.navigations.write()[slot] = value;
        if is_reference {
            self.notify_changed(name);
        }
    }

    fn notify_changing(&self, name: &str, previous: Option<Value>) {
        if self.notifies {
            for sink in self.sinks.lock().iter() {
                sink.property_changing(name, previous.clone());
            }
        }
    }

    fn notify_changed(&self, name: &str) {
        if self.notifies {
            for sink in self.sinks.lock().iter() {
                sink.property_changed(name);
            }
        }
    }
}

impl Entity for DynamicEntity {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn get_value(&self, property: &Property) -> Value {
        self.values
            .read()
            .get(property.index())
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn set_value(&self, property: &Property, value: Value) {
        if property.index() < self.property_names.len() {
            self.write_slot(property.index(), value);
        }
    }

    fn navigation(&self, navigation: &Navigation) -> NavigationValue {
        self.navigations
            .read()
            .get(navigation.index())
            .cloned()
            .unwrap_or_else(|| NavigationValue::empty(navigation))
    }

    fn set_navigation(&self, navigation: &Navigation, value: NavigationValue) {
        if navigation.index() < self.navigation_names.len() {
            self.write_navigation(navigation.index(), value);
        }
    }

    fn subscribe(&self, sink: NotificationSink) -> bool {
        if !self.notifies {
            return false;
        }
        let mut sinks = self.sinks.lock();
        sinks.retain(|existing| existing.entry() != sink.entry());
        sinks.push(sink);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityTypeDef, Model, NavigationDef, PropertyDef};
    use crate::notify::{NotificationPhase, NotificationQueue};
    use crate::entry::EntryId;
    use crate::value::ValueKind;

    fn model() -> Model {
        Model::builder()
            .entity_type(
                EntityTypeDef::new("Item")
                    .property(PropertyDef::new("Id", ValueKind::Integer))
                    .property(PropertyDef::new("Name", ValueKind::Text).nullable())
                    .navigation(NavigationDef::reference("Parent", "Item"))
                    .navigation(NavigationDef::collection("Children", "Item"))
                    .key(["Id"]),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn dynamic_entity_reads_and_writes_by_name() {
        let model = model();
        let item_type = model.entity_type("Item").unwrap();
        let item = DynamicEntity::new(item_type).with("Id", 3).with("Name", "a");

        assert_eq!(item.get("Id"), Value::Integer(3));
        assert_eq!(item.get_value(item_type.property("Name").unwrap()), Value::from("a"));
        assert_eq!(item.get("Missing"), Value::Null);
    }

    #[test]
    fn notifying_entity_reports_only_real_changes() {
        let model = model();
        let item_type = model.entity_type("Item").unwrap();
        let item = DynamicEntity::notifying(item_type).with("Name", "a");
        let queue = NotificationQueue::new();
        assert!(item.subscribe(queue.sink(EntryId::new(1, 0))));

        item.set("Name", "a");
        assert!(queue.drain().is_empty());

        item.set("Name", "b");
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(
            drained[0].phase,
            NotificationPhase::Changing(Some(Value::from("a")))
        );
    }

    #[test]
    fn plain_entity_declines_subscription() {
        let model = model();
        let item = DynamicEntity::new(model.entity_type("Item").unwrap());
        let queue = NotificationQueue::new();
        assert!(!item.subscribe(queue.sink(EntryId::new(1, 0))));
    }

    #[test]
    fn collections_compare_by_identity() {
        let model = model();
        let item_type = model.entity_type("Item").unwrap();
        let parent = DynamicEntity::new(item_type);
        let a = DynamicEntity::new(item_type).into_ref();
        let b = DynamicEntity::new(item_type).into_ref();

        parent.add_to("Children", a.clone());
        parent.add_to("Children", b.clone());
        parent.remove_from("Children", &a);

        let children = parent.collection("Children");
        assert_eq!(children.len(), 1);
        assert_eq!(ObjectId::of(&children[0]), ObjectId::of(&b));
    }

    #[test]
    fn materializer_rejects_shadow_types() {
        let model = Model::builder()
            .entity_type(
                EntityTypeDef::shadow("Log")
                    .property(PropertyDef::new("Id", ValueKind::Integer))
                    .key(["Id"]),
            )
            .build()
            .unwrap();
        let result = DynamicMaterializer::new().create(model.entity_type("Log").unwrap());
        assert!(result.is_err());
    }
}
