//! Tracked entries.
//!
//! An [`Entry`] wraps one entity object (or a schema-only shadow record)
//! together with its lifecycle state, a per-property flag set and any
//! attached sidecars. Reads and writes go through the entry's gate, which
//! consults transparent sidecars before the primary storage.
//!
//! State transitions that touch the identity map or listeners are driven by
//! the [`StateManager`](crate::StateManager); the entry itself only holds
//! per-entry data.

mod factory;
mod state;
mod storage;
mod subscriber;

pub use factory::EntryFactory;
pub use state::EntityState;
pub use subscriber::EntrySubscriber;

pub(crate) use storage::EntryStorage;

use crate::entity::{EntityRef, NavigationValue, ObjectId};
use crate::error::{TrackerError, TrackerResult};
use crate::key::EntityKey;
use crate::metadata::{EntityType, Navigation, Property, ValueGeneration};
use crate::sidecar::{Sidecar, SidecarName};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Identifier of an entry, unique across state managers in a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId {
    manager: u64,
    index: u64,
}

impl EntryId {
    /// Creates an entry id.
    #[must_use]
    pub const fn new(manager: u64, index: u64) -> Self {
        Self { manager, index }
    }

    /// Returns the id of the owning state manager.
    #[must_use]
    pub const fn manager(self) -> u64 {
        self.manager
    }

    /// Returns the position of the entry within its manager.
    #[must_use]
    pub const fn index(self) -> u64 {
        self.index
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.manager, self.index)
    }
}

/// One bit per property.
///
/// While the entry is `Added` a set bit means "holds a temporary value";
/// in every other state it means "modified".
#[derive(Debug, Clone, Default)]
struct PropertyFlags {
    words: Vec<u64>,
}

impl PropertyFlags {
    fn with_capacity(properties: usize) -> Self {
        Self {
            words: vec![0; properties.div_ceil(64)],
        }
    }

    fn get(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|word| word & (1u64 << (index % 64)) != 0)
    }

    fn set(&mut self, index: usize, on: bool) {
        if let Some(word) = self.words.get_mut(index / 64) {
            if on {
                *word |= 1u64 << (index % 64);
            } else {
                *word &= !(1u64 << (index % 64));
            }
        }
    }

    fn any(&self) -> bool {
        self.words.iter().any(|word| *word != 0)
    }

    fn clear(&mut self) {
        self.words.fill(0);
    }
}

/// The tracked representation of one entity.
#[derive(Debug)]
pub struct Entry {
    id: EntryId,
    entity_type: Arc<EntityType>,
    storage: EntryStorage,
    state: EntityState,
    flags: PropertyFlags,
    sidecars: Vec<Sidecar>,
    notifying: bool,
    eager_originals: bool,
}

impl Entry {
    pub(crate) fn new(id: EntryId, entity_type: Arc<EntityType>, storage: EntryStorage) -> Self {
        let flags = PropertyFlags::with_capacity(entity_type.properties().len());
        Self {
            id,
            entity_type,
            storage,
            state: EntityState::Unknown,
            flags,
            sidecars: Vec::new(),
            notifying: false,
            eager_originals: true,
        }
    }

    /// Returns the entry's id.
    #[must_use]
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Returns the entity type.
    #[must_use]
    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> EntityState {
        self.state
    }

    /// Returns the wrapped object, or `None` for shadow-only entries.
    #[must_use]
    pub fn entity(&self) -> Option<&EntityRef> {
        self.storage.entity()
    }

    /// Returns the reference identity of the wrapped object.
    #[must_use]
    pub fn object_id(&self) -> Option<ObjectId> {
        self.entity().map(ObjectId::of)
    }

    /// Returns true if the wrapped object raises change notifications.
    #[must_use]
    pub fn is_notifying(&self) -> bool {
        self.notifying
    }

    /// Returns true if OriginalValues was captured for every property up front.
    #[must_use]
    pub fn has_eager_original_values(&self) -> bool {
        self.eager_originals
    }

    // ---- read gate ----

    /// Reads the current value of `property`.
    ///
    /// A transparent-read sidecar holding a value wins over the entity.
    #[must_use]
    pub fn property_value(&self, property: &Property) -> Value {
        self.sidecars
            .iter()
            .filter(|s| s.transparent_read())
            .find_map(|s| s.value(property))
            .cloned()
            .unwrap_or_else(|| self.storage.read(property))
    }

    /// Reads the current value of the property called `name`.
    pub fn value(&self, name: &str) -> TrackerResult<Value> {
        let property = self.entity_type.find_property(name)?;
        Ok(self.property_value(property))
    }

    /// Reads the current value of `navigation`.
    #[must_use]
    pub fn navigation_value(&self, navigation: &Navigation) -> NavigationValue {
        self.storage.read_navigation(navigation)
    }

    /// Reads every current value in property order.
    #[must_use]
    pub fn value_buffer(&self) -> Vec<Value> {
        self.entity_type
            .properties()
            .iter()
            .map(|p| self.property_value(p))
            .collect()
    }

    /// Builds the primary key from current values.
    #[must_use]
    pub fn primary_key(&self) -> EntityKey {
        self.key_for(self.entity_type.primary_key())
    }

    /// Builds a key of this entity type over the given property indices.
    #[must_use]
    pub fn key_for(&self, properties: &[usize]) -> EntityKey {
        EntityKey::new(self.entity_type.name(), self.values_at(properties))
    }

    pub(crate) fn values_at(&self, properties: &[usize]) -> Vec<Value> {
        properties
            .iter()
            .map(|&i| {
                self.entity_type
                    .property_at(i)
                    .map(|p| self.property_value(p))
                    .unwrap_or(Value::Null)
            })
            .collect()
    }

    /// Reads the value `property` had when changes were last accepted.
    ///
    /// Falls back to the current value when no snapshot was taken.
    #[must_use]
    pub fn original_value(&self, property: &Property) -> Value {
        self.sidecar(&SidecarName::OriginalValues)
            .and_then(|s| s.value(property))
            .cloned()
            .unwrap_or_else(|| self.property_value(property))
    }

    /// Overwrites the original value of `property`.
    pub fn set_original_value(&mut self, property: &Property, value: Value) {
        if self.sidecar(&SidecarName::OriginalValues).is_none() {
            self.add_sidecar(Sidecar::original_values(&self.entity_type));
        }
        if let Some(originals) = self.sidecar_mut(&SidecarName::OriginalValues) {
            originals.set_value(property, value);
        }
    }

    // ---- flags ----

    /// Returns true if `property` is flagged as modified.
    #[must_use]
    pub fn is_property_modified(&self, property: &Property) -> bool {
        self.state != EntityState::Added && self.flags.get(property.index())
    }

    /// Iterates the properties flagged as modified.
    pub fn modified_properties(&self) -> impl Iterator<Item = &Property> {
        self.entity_type
            .properties()
            .iter()
            .filter(move |p| self.is_property_modified(p))
    }

    /// Returns true if `property` holds a temporary value.
    #[must_use]
    pub fn has_temporary_value(&self, property: &Property) -> bool {
        self.state == EntityState::Added && self.flags.get(property.index())
    }

    pub(crate) fn set_flag(&mut self, property: &Property, on: bool) {
        self.flags.set(property.index(), on);
    }

    pub(crate) fn any_flag(&self) -> bool {
        self.flags.any()
    }

    pub(crate) fn clear_flags(&mut self) {
        self.flags.clear();
    }

    /// Flags every property an explicit `Modified` marks as dirty.
    pub(crate) fn mark_all_modified(&mut self) {
        let entity_type = Arc::clone(&self.entity_type);
        for property in entity_type.properties() {
            let eligible = !property.is_read_only()
                && !property.is_primary_key()
                && property.value_generation() != ValueGeneration::OnAddAndUpdate;
            if eligible {
                self.flags.set(property.index(), true);
            }
        }
    }

    /// Returns true if the store may supply a value for `property` on save.
    #[must_use]
    pub fn may_get_store_value(&self, property: &Property) -> bool {
        match self.state {
            EntityState::Added => {
                self.flags.get(property.index())
                    || (property.has_store_default()
                        && property.is_default(&self.property_value(property)))
                    || property.value_generation() == ValueGeneration::OnAddAndUpdate
            }
            EntityState::Modified => {
                property.value_generation() == ValueGeneration::OnAddAndUpdate
                    && !self.flags.get(property.index())
            }
            _ => false,
        }
    }

    // ---- raw access ----

    pub(crate) fn set_state_field(&mut self, state: EntityState) {
        self.state = state;
    }

    pub(crate) fn set_notifying(&mut self, notifying: bool) {
        self.notifying = notifying;
    }

    pub(crate) fn set_eager_originals(&mut self, eager: bool) {
        self.eager_originals = eager;
    }

    /// Writes straight into primary storage, bypassing sidecars.
    pub(crate) fn write_raw(&mut self, property: &Property, value: Value) {
        self.storage.write(property, value);
    }

    /// Position of the first transparent-write sidecar able to store `property`.
    pub(crate) fn transparent_write_target(&self, property: &Property) -> Option<usize> {
        self.sidecars
            .iter()
            .position(|s| s.transparent_write() && s.can_store(property))
    }

    pub(crate) fn sidecar_at_mut(&mut self, position: usize) -> Option<&mut Sidecar> {
        self.sidecars.get_mut(position)
    }

    // ---- sidecars ----

    /// Returns the attached sidecars in attachment order.
    #[must_use]
    pub fn sidecars(&self) -> &[Sidecar] {
        &self.sidecars
    }

    /// Returns the sidecar called `name`.
    #[must_use]
    pub fn sidecar(&self, name: &SidecarName) -> Option<&Sidecar> {
        self.sidecars.iter().find(|s| s.name() == name)
    }

    /// Returns the sidecar called `name` for mutation.
    pub fn sidecar_mut(&mut self, name: &SidecarName) -> Option<&mut Sidecar> {
        self.sidecars.iter_mut().find(|s| s.name() == name)
    }

    /// Attaches `sidecar`, replacing any sidecar with the same name.
    pub fn add_sidecar(&mut self, sidecar: Sidecar) {
        match self.sidecars.iter_mut().find(|s| s.name() == sidecar.name()) {
            Some(existing) => *existing = sidecar,
            None => self.sidecars.push(sidecar),
        }
    }

    /// Detaches and returns the sidecar called `name`.
    pub fn remove_sidecar(&mut self, name: &SidecarName) -> Option<Sidecar> {
        let position = self.sidecars.iter().position(|s| s.name() == name)?;
        Some(self.sidecars.remove(position))
    }

    /// Records a value computed by the store during a save.
    ///
    /// Only valid while a StoreGeneratedValues sidecar covering `property`
    /// is attached, i.e. between preparing and committing a save.
    pub fn set_store_generated(&mut self, property: &Property, value: Value) -> TrackerResult<()> {
        let entity_type = self.entity_type.name().to_string();
        let sidecar = self
            .sidecar_mut(&SidecarName::StoreGeneratedValues)
            .ok_or_else(|| {
                TrackerError::invalid_operation(format!(
                    "entity of type '{entity_type}' is not being saved"
                ))
            })?;
        if !sidecar.set_value(property, value) {
            return Err(TrackerError::invalid_operation(format!(
                "property '{}' on entity type '{entity_type}' is not store generated",
                property.name()
            )));
        }
        Ok(())
    }

    // ---- snapshots ----

    /// Captures every property into OriginalValues.
    pub(crate) fn snapshot_original_values(&mut self) {
        let mut originals = Sidecar::original_values(&self.entity_type);
        for property in self.entity_type.properties() {
            originals.set_value(property, self.property_value(property));
        }
        self.add_sidecar(originals);
    }

    /// Captures key properties and navigations into RelationshipsSnapshot.
    pub(crate) fn snapshot_relationships(&mut self) {
        let mut snapshot = Sidecar::relationships_snapshot(&self.entity_type);
        for property in self.entity_type.properties() {
            if snapshot.can_store(property) {
                snapshot.set_value(property, self.property_value(property));
            }
        }
        for navigation in self.entity_type.navigations() {
            snapshot.set_navigation(navigation, self.navigation_value(navigation));
        }
        self.add_sidecar(snapshot);
    }

    /// Makes the current values the new baseline.
    pub(crate) fn refresh_snapshots(&mut self) {
        if self.eager_originals {
            self.snapshot_original_values();
        } else if let Some(originals) = self.sidecar_mut(&SidecarName::OriginalValues) {
            originals.clear();
        }
        self.snapshot_relationships();
    }

    /// Copies held original values back into primary storage.
    pub(crate) fn restore_original_values(&mut self) {
        let Some(originals) = self.sidecar(&SidecarName::OriginalValues) else {
            return;
        };
        let restored: Vec<(usize, Value)> = originals
            .values()
            .map(|(index, value)| (index, value.clone()))
            .collect();
        let entity_type = Arc::clone(&self.entity_type);
        for (index, value) in restored {
            if let Some(property) = entity_type.property_at(index) {
                self.write_raw(property, value);
            }
        }
    }

    /// Resets temporary values to their defaults. Only meaningful while `Added`.
    pub(crate) fn reset_temporary_values(&mut self) {
        let entity_type = Arc::clone(&self.entity_type);
        for property in entity_type.properties() {
            if self.flags.get(property.index()) {
                self.write_raw(property, property.default_value());
            }
        }
    }

    // ---- save pipeline ----

    /// Validates the key and attaches a StoreGeneratedValues sidecar if needed.
    pub fn prepare_to_save(&mut self) -> TrackerResult<()> {
        if self.primary_key().is_null() {
            return Err(TrackerError::NullPrimaryKey {
                entity_type: self.entity_type.name().to_string(),
            });
        }
        let generated: Vec<usize> = self
            .entity_type
            .properties()
            .iter()
            .filter(|p| self.may_get_store_value(p))
            .map(Property::index)
            .collect();
        if !generated.is_empty() {
            self.add_sidecar(Sidecar::store_generated_values(&self.entity_type, generated));
        }
        Ok(())
    }

    /// Pushes auto-commit sidecars into primary storage and detaches them.
    pub fn auto_commit_sidecars(&mut self) {
        let (committed, kept): (Vec<Sidecar>, Vec<Sidecar>) =
            std::mem::take(&mut self.sidecars)
                .into_iter()
                .partition(Sidecar::auto_commit);
        self.sidecars = kept;
        let entity_type = Arc::clone(&self.entity_type);
        for sidecar in committed {
            for (index, value) in sidecar.values() {
                if let Some(property) = entity_type.property_at(index) {
                    self.write_raw(property, value.clone());
                }
            }
        }
    }

    /// Discards auto-commit sidecars without touching primary storage.
    pub fn auto_rollback_sidecars(&mut self) {
        self.sidecars.retain(|s| !s.auto_commit());
    }
}
