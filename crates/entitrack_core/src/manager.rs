//! The state manager: identity map, reference map and save orchestration.

use crate::cancel::CancelFlag;
use crate::change_detector::{ChangeDetector, ChangeReport, DetectedChange};
use crate::config::TrackerConfig;
use crate::entity::{DynamicMaterializer, EntityMaterializer, EntityRef, ObjectId};
use crate::entry::{EntityState, Entry, EntryFactory, EntryId, EntrySubscriber};
use crate::error::{TrackerError, TrackerResult};
use crate::key::EntityKey;
use crate::listener::EntryListener;
use crate::metadata::{EntityType, ForeignKey, Model, Property, ValueGeneration};
use crate::notify::{NotificationPhase, NotificationQueue};
use crate::sidecar::SidecarName;
use crate::store::DataStore;
use crate::value::Value;
use crate::value_generation::ValueGeneratorSelector;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Owns every entry of one unit of work.
///
/// The manager keeps two indexes over tracked entries: the identity map
/// (primary key to entry) and the reference map (object identity to entry).
/// At most one entry is registered per key and per object. Entries are
/// addressed by [`EntryId`]; ids from another manager are rejected.
///
/// # Example
///
/// ```
/// use entitrack_core::{EntityState, Model, StateManager, Value};
///
/// let model = Model::from_json(r#"{
///     "entity_types": [{
///         "name": "Product",
///         "properties": [
///             { "name": "Id", "kind": "integer" },
///             { "name": "Name", "kind": "text", "nullable": true }
///         ],
///         "key": ["Id"]
///     }]
/// }"#)?;
/// let mut manager = StateManager::new(model.into());
///
/// let id = manager.get_or_materialize_entry("Product", &[Value::from(1), Value::from("Kool")])?;
/// manager.set_property(id, "Name", "Cool")?;
///
/// assert_eq!(manager.entry(id)?.state(), EntityState::Modified);
/// assert_eq!(manager.entry(id)?.value("Name")?, Value::from("Cool"));
/// # Ok::<(), entitrack_core::TrackerError>(())
/// ```
pub struct StateManager {
    id: u64,
    model: Arc<Model>,
    config: TrackerConfig,
    factory: EntryFactory,
    subscriber: EntrySubscriber,
    detector: ChangeDetector,
    generators: ValueGeneratorSelector,
    store: Option<Arc<dyn DataStore>>,
    listeners: Vec<Arc<dyn EntryListener>>,
    notifications: NotificationQueue,
    entries: BTreeMap<u64, Entry>,
    next_index: u64,
    identity_map: HashMap<EntityKey, EntryId>,
    reference_map: HashMap<ObjectId, EntryId>,
    /// Object entries that exist but are not registered in the indexes.
    untracked: HashMap<ObjectId, EntryId>,
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("entries", &self.entries.len())
            .field("tracked_keys", &self.identity_map.len())
            .finish_non_exhaustive()
    }
}

impl StateManager {
    /// Creates a manager with default configuration.
    #[must_use]
    pub fn new(model: Arc<Model>) -> Self {
        Self::with_config(model, TrackerConfig::default())
    }

    /// Creates a manager with the given configuration.
    #[must_use]
    pub fn with_config(model: Arc<Model>, config: TrackerConfig) -> Self {
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            model,
            subscriber: EntrySubscriber::new(&config),
            config,
            factory: EntryFactory::new(Arc::new(DynamicMaterializer::new())),
            detector: ChangeDetector::new(),
            generators: ValueGeneratorSelector::new(),
            store: None,
            listeners: Vec::new(),
            notifications: NotificationQueue::new(),
            entries: BTreeMap::new(),
            next_index: 0,
            identity_map: HashMap::new(),
            reference_map: HashMap::new(),
            untracked: HashMap::new(),
        }
    }

    /// Sets the persistence collaborator used by `save_changes`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the value generators used when entries become `Added`.
    #[must_use]
    pub fn with_value_generators(mut self, generators: ValueGeneratorSelector) -> Self {
        self.generators = generators;
        self
    }

    /// Sets how objects are created for new and materialized entries.
    #[must_use]
    pub fn with_materializer(mut self, materializer: Arc<dyn EntityMaterializer>) -> Self {
        self.factory = EntryFactory::new(materializer);
        self
    }

    /// Registers a listener.
    pub fn add_listener(&mut self, listener: Arc<dyn EntryListener>) {
        self.listeners.push(listener);
    }

    /// Returns this manager's id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the model.
    #[must_use]
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    // ---- lookup ----

    fn check_owner(&self, id: EntryId) -> TrackerResult<()> {
        if id.manager() == self.id {
            Ok(())
        } else {
            Err(TrackerError::ForeignEntry { entry: id })
        }
    }

    /// Returns the entry with `id`, tracked or not.
    pub fn entry(&self, id: EntryId) -> TrackerResult<&Entry> {
        self.check_owner(id)?;
        self.entries
            .get(&id.index())
            .ok_or(TrackerError::EntryNotFound { entry: id })
    }

    fn entry_mut(&mut self, id: EntryId) -> TrackerResult<&mut Entry> {
        self.check_owner(id)?;
        self.entries
            .get_mut(&id.index())
            .ok_or(TrackerError::EntryNotFound { entry: id })
    }

    /// Iterates tracked entries in creation order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values().filter(|e| e.state().is_tracked())
    }

    /// Returns the entry tracked under `key`. The null key is never present.
    #[must_use]
    pub fn try_get_entry(&self, key: &EntityKey) -> Option<&Entry> {
        if key.is_null() {
            return None;
        }
        self.identity_map
            .get(key)
            .and_then(|id| self.entries.get(&id.index()))
    }

    /// Returns the entry tracking `entity`.
    #[must_use]
    pub fn try_get_entry_for(&self, entity: &EntityRef) -> Option<&Entry> {
        self.reference_map
            .get(&ObjectId::of(entity))
            .and_then(|id| self.entries.get(&id.index()))
    }

    /// Drops a detached entry. Tracked entries must be detached first.
    pub fn remove_entry(&mut self, id: EntryId) -> TrackerResult<Entry> {
        if self.entry(id)?.state().is_tracked() {
            return Err(TrackerError::invalid_operation(format!(
                "entry {id} is still tracked"
            )));
        }
        let entry = self
            .entries
            .remove(&id.index())
            .ok_or(TrackerError::EntryNotFound { entry: id })?;
        if let Some(object) = entry.object_id() {
            if self.untracked.get(&object) == Some(&id) {
                self.untracked.remove(&object);
            }
        }
        Ok(entry)
    }

    // ---- creation ----

    fn allocate_id(&mut self) -> EntryId {
        let id = EntryId::new(self.id, self.next_index);
        self.next_index += 1;
        id
    }

    fn finish_entry(&mut self, mut entry: Entry) -> EntryId {
        let id = entry.id();
        self.subscriber
            .snapshot_and_subscribe(&mut entry, self.notifications.sink(id));
        if let Some(object) = entry.object_id() {
            self.untracked.insert(object, id);
        }
        trace!(
            entry = %id,
            entity_type = entry.entity_type().name(),
            notifying = entry.is_notifying(),
            "created entry"
        );
        self.entries.insert(id.index(), entry);
        id
    }

    /// Creates an untracked entry holding default values.
    ///
    /// Object-backed types get a freshly materialized object.
    pub fn create_new_entry(&mut self, entity_type: &str) -> TrackerResult<EntryId> {
        let entity_type = Arc::clone(self.model.find_entity_type(entity_type)?);
        let id = self.allocate_id();
        let entry = self.factory.create_new(id, &entity_type)?;
        Ok(self.finish_entry(entry))
    }

    /// Returns the entry for `entity`, creating an untracked one if needed.
    pub fn get_or_create_entry(&mut self, entity: &EntityRef) -> TrackerResult<EntryId> {
        let object = ObjectId::of(entity);
        if let Some(&id) = self
            .reference_map
            .get(&object)
            .or_else(|| self.untracked.get(&object))
        {
            return Ok(id);
        }
        let entity_type = Arc::clone(self.model.find_entity_type(entity.type_name())?);
        let id = self.allocate_id();
        let entry = self
            .factory
            .create_for_entity(id, &entity_type, Arc::clone(entity))?;
        Ok(self.finish_entry(entry))
    }

    /// Returns the entry tracked for the row `values`, materializing it as
    /// `Unchanged` if the key is not tracked yet.
    ///
    /// Values are in property order. A second call with the same key returns
    /// the first entry untouched, whatever values it is given.
    pub fn get_or_materialize_entry(
        &mut self,
        entity_type: &str,
        values: &[Value],
    ) -> TrackerResult<EntryId> {
        let entity_type = Arc::clone(self.model.find_entity_type(entity_type)?);
        let key_values = entity_type
            .primary_key()
            .iter()
            .map(|&i| values.get(i).cloned().unwrap_or(Value::Null))
            .collect();
        let key = EntityKey::new(entity_type.name(), key_values);
        if let Some(existing) = self.try_get_entry(&key) {
            return Ok(existing.id());
        }

        let id = self.allocate_id();
        let entry = self.factory.create_from_values(id, &entity_type, values)?;
        let id = self.finish_entry(entry);
        if let Err(err) = self.transition(id, EntityState::Unchanged, false) {
            let _ = self.remove_entry(id);
            return Err(err);
        }
        Ok(id)
    }

    // ---- indexes ----

    fn rendered_key(&self, key: &EntityKey) -> String {
        if self.config.sensitive_data_logging {
            key.to_string()
        } else {
            "{...}".to_string()
        }
    }

    /// Registers `id` in the identity and reference maps.
    ///
    /// Does not change the entry's state. Fails if a different entry is
    /// already registered for the same key or object.
    pub fn start_tracking(&mut self, id: EntryId) -> TrackerResult<()> {
        let entry = self.entry(id)?;
        let key = entry.primary_key();
        let object = entry.object_id();
        let entity_type = entry.entity_type().name().to_string();

        if let Some(object) = object {
            if self.reference_map.get(&object).is_some_and(|&e| e != id) {
                return Err(TrackerError::DuplicateReference { entity_type });
            }
        }
        if !key.is_null() && self.identity_map.get(&key).is_some_and(|&e| e != id) {
            return Err(TrackerError::DuplicateIdentity {
                entity_type,
                key: self.rendered_key(&key),
            });
        }

        if let Some(object) = object {
            self.reference_map.insert(object, id);
            self.untracked.remove(&object);
        }
        if !key.is_null() {
            self.identity_map.insert(key, id);
        }
        debug!(entry = %id, entity_type = %entity_type, "started tracking");
        Ok(())
    }

    /// Removes `id` from the identity and reference maps.
    pub fn stop_tracking(&mut self, id: EntryId) -> TrackerResult<()> {
        let entry = self.entry(id)?;
        let key = entry.primary_key();
        let object = entry.object_id();

        if self.identity_map.get(&key) == Some(&id) {
            self.identity_map.remove(&key);
        } else {
            self.identity_map.retain(|_, e| *e != id);
        }
        if let Some(object) = object {
            if self.reference_map.get(&object) == Some(&id) {
                self.reference_map.remove(&object);
            }
            self.untracked.insert(object, id);
        }
        debug!(entry = %id, "stopped tracking");
        Ok(())
    }

    /// Moves a tracked entry from `old_key` to its current primary key.
    pub fn update_identity_map(&mut self, id: EntryId, old_key: &EntityKey) -> TrackerResult<()> {
        let entry = self.entry(id)?;
        if !entry.state().is_tracked() {
            return Ok(());
        }
        let new_key = entry.primary_key();
        if new_key == *old_key {
            return Ok(());
        }
        if !new_key.is_null() && self.identity_map.get(&new_key).is_some_and(|&e| e != id) {
            return Err(TrackerError::DuplicateIdentity {
                entity_type: entry.entity_type().name().to_string(),
                key: self.rendered_key(&new_key),
            });
        }

        if self.identity_map.get(old_key) == Some(&id) {
            self.identity_map.remove(old_key);
        }
        if !new_key.is_null() {
            self.identity_map.insert(new_key, id);
        }
        trace!(entry = %id, "re-indexed identity map");
        Ok(())
    }

    // ---- relationships ----

    /// Finds the tracked principal of `id` through `foreign_key`.
    ///
    /// Linear scan over tracked entries.
    pub fn get_principal(
        &self,
        id: EntryId,
        foreign_key: &ForeignKey,
    ) -> TrackerResult<Option<EntryId>> {
        let values = self.entry(id)?.values_at(foreign_key.properties());
        Ok(self.find_principal(foreign_key, &values))
    }

    /// Like [`get_principal`](Self::get_principal), but matches on the
    /// foreign-key values recorded in the relationship snapshot.
    pub fn get_principal_from_snapshot(
        &self,
        id: EntryId,
        foreign_key: &ForeignKey,
    ) -> TrackerResult<Option<EntryId>> {
        let entry = self.entry(id)?;
        let snapshot = entry.sidecar(&SidecarName::RelationshipsSnapshot);
        let values: Vec<Value> = foreign_key
            .properties()
            .iter()
            .filter_map(|&i| entry.entity_type().property_at(i))
            .map(|p| {
                snapshot
                    .and_then(|s| s.value(p))
                    .cloned()
                    .unwrap_or_else(|| entry.property_value(p))
            })
            .collect();
        Ok(self.find_principal(foreign_key, &values))
    }

    fn find_principal(&self, foreign_key: &ForeignKey, values: &[Value]) -> Option<EntryId> {
        if values.iter().any(Value::is_null) {
            return None;
        }
        self.entries()
            .filter(|e| e.entity_type().name() == foreign_key.principal_type())
            .find(|e| e.values_at(foreign_key.principal_properties()) == values)
            .map(Entry::id)
    }

    /// Finds the tracked dependents of `id` through `foreign_key`.
    ///
    /// Linear scan over tracked entries.
    pub fn get_dependents(
        &self,
        id: EntryId,
        foreign_key: &ForeignKey,
    ) -> TrackerResult<Vec<EntryId>> {
        let values = self
            .entry(id)?
            .values_at(foreign_key.principal_properties());
        if values.iter().any(Value::is_null) {
            return Ok(Vec::new());
        }
        Ok(self
            .entries()
            .filter(|e| e.entity_type().name() == foreign_key.dependent_type())
            .filter(|e| e.values_at(foreign_key.properties()) == values)
            .map(Entry::id)
            .collect())
    }

    // ---- state machine ----

    /// Moves `id` to `state`.
    ///
    /// Leaving `Unknown` registers the entry; reaching `Unknown` detaches it.
    /// Becoming `Added` from `Unknown` first generates values for on-add
    /// properties still holding their default. Deleting an `Added` entry
    /// detaches it instead. An explicit `Modified` flags every writable,
    /// non-key, non-computed property.
    pub fn set_state(&mut self, id: EntryId, state: EntityState) -> TrackerResult<()> {
        if state != EntityState::Added || self.entry(id)?.state() != EntityState::Unknown {
            return self.transition(id, state, true);
        }
        let entity_type = Arc::clone(self.entry(id)?.entity_type());
        let mut generated = Vec::new();
        let result = match self.generate_values(id, &entity_type, &mut generated) {
            Ok(()) => self.transition(id, state, true),
            Err(err) => Err(err),
        };
        if result.is_err() {
            self.reset_generated(id, &generated)?;
        }
        result
    }

    /// Asynchronous [`set_state`](Self::set_state): awaits each value
    /// generator in turn.
    ///
    /// If `cancel` fires part-way, values generated so far are reset and the
    /// entry stays detached.
    pub async fn set_state_async(
        &mut self,
        id: EntryId,
        state: EntityState,
        cancel: &CancelFlag,
    ) -> TrackerResult<()> {
        if state != EntityState::Added || self.entry(id)?.state() != EntityState::Unknown {
            return self.transition(id, state, true);
        }
        let entity_type = Arc::clone(self.entry(id)?.entity_type());
        let mut generated = Vec::new();
        let result = match self
            .generate_values_async(id, &entity_type, cancel, &mut generated)
            .await
        {
            Ok(()) => self.transition(id, state, true),
            Err(err) => Err(err),
        };
        if result.is_err() {
            self.reset_generated(id, &generated)?;
        }
        result
    }

    fn generate_values<'a>(
        &mut self,
        id: EntryId,
        entity_type: &'a EntityType,
        generated: &mut Vec<&'a Property>,
    ) -> TrackerResult<()> {
        for property in entity_type.properties() {
            if !self.needs_generated_value(id, property)? {
                continue;
            }
            let generator = self.generators.select(entity_type, property)?;
            let value = generator.next(property)?;
            self.apply_generated(id, property, value, generator.generates_temporary_values())?;
            generated.push(property);
        }
        Ok(())
    }

    async fn generate_values_async<'a>(
        &mut self,
        id: EntryId,
        entity_type: &'a EntityType,
        cancel: &CancelFlag,
        generated: &mut Vec<&'a Property>,
    ) -> TrackerResult<()> {
        for property in entity_type.properties() {
            if !self.needs_generated_value(id, property)? {
                continue;
            }
            let generator = self.generators.select(entity_type, property)?;
            let value = generator.next_async(property, cancel).await?;
            self.apply_generated(id, property, value, generator.generates_temporary_values())?;
            generated.push(property);
        }
        Ok(())
    }

    /// Puts generated properties back to their defaults after a failed
    /// transition to `Added`.
    fn reset_generated(&mut self, id: EntryId, generated: &[&Property]) -> TrackerResult<()> {
        if generated.is_empty() {
            return Ok(());
        }
        self.quietly(|manager| {
            let entry = manager.entry_mut(id)?;
            for property in generated {
                entry.write_raw(property, property.default_value());
                entry.set_flag(property, false);
                if let Some(snapshot) = entry.sidecar_mut(&SidecarName::RelationshipsSnapshot) {
                    snapshot.set_value(property, property.default_value());
                }
            }
            Ok(())
        })?;
        debug!(entry = %id, properties = generated.len(), "reset generated values");
        Ok(())
    }

    fn needs_generated_value(&self, id: EntryId, property: &Property) -> TrackerResult<bool> {
        let entry = self.entry(id)?;
        Ok(property.value_generation() == ValueGeneration::OnAdd
            && property.is_default(&entry.property_value(property)))
    }

    fn apply_generated(
        &mut self,
        id: EntryId,
        property: &Property,
        value: Value,
        temporary: bool,
    ) -> TrackerResult<()> {
        let sensitive = self.config.sensitive_data_logging;
        self.quietly(|manager| {
            let entry = manager.entry_mut(id)?;
            if sensitive {
                trace!(entry = %id, property = property.name(), value = %value, "generated value");
            } else {
                trace!(entry = %id, property = property.name(), "generated value");
            }
            entry.write_raw(property, value.clone());
            entry.set_flag(property, temporary);
            if let Some(snapshot) = entry.sidecar_mut(&SidecarName::RelationshipsSnapshot) {
                snapshot.set_value(property, value);
            }
            Ok(())
        })
    }

    fn transition(&mut self, id: EntryId, requested: EntityState, explicit: bool) -> TrackerResult<()> {
        let old = self.entry(id)?.state();
        let new = if requested == EntityState::Deleted && old == EntityState::Added {
            EntityState::Unknown
        } else {
            requested
        };

        let mark_all = explicit && new == EntityState::Modified;
        if old == new {
            if mark_all {
                self.entry_mut(id)?.mark_all_modified();
            }
            return Ok(());
        }

        if old == EntityState::Unknown {
            self.start_tracking(id)?;
        }
        self.notify_state_changing(id, new);

        if new == EntityState::Unknown {
            self.stop_tracking(id)?;
            if old == EntityState::Added {
                self.quietly(|manager| {
                    manager.entry_mut(id)?.reset_temporary_values();
                    Ok(())
                })?;
            }
        }

        let entry = self.entry_mut(id)?;
        match new {
            EntityState::Unknown | EntityState::Unchanged => entry.clear_flags(),
            EntityState::Added if old != EntityState::Unknown => entry.clear_flags(),
            _ => {}
        }
        if old == EntityState::Unknown {
            entry.refresh_snapshots();
        }
        if mark_all {
            entry.mark_all_modified();
        }
        entry.set_state_field(new);
        trace!(entry = %id, from = %old, to = %new, "state changed");

        self.notify_state_changed(id, old);
        Ok(())
    }

    fn notify_state_changing(&self, id: EntryId, new: EntityState) {
        if let Some(entry) = self.entries.get(&id.index()) {
            for listener in &self.listeners {
                listener.state_changing(entry, new);
            }
        }
    }

    fn notify_state_changed(&self, id: EntryId, old: EntityState) {
        if let Some(entry) = self.entries.get(&id.index()) {
            for listener in &self.listeners {
                listener.state_changed(entry, old);
            }
        }
    }

    // ---- property gate ----

    /// Writes the property called `name`.
    pub fn set_property(
        &mut self,
        id: EntryId,
        name: &str,
        value: impl Into<Value>,
    ) -> TrackerResult<()> {
        let entity_type = Arc::clone(self.entry(id)?.entity_type());
        let property = entity_type.find_property(name)?;
        self.set_property_value(id, property, value.into())
    }

    /// Writes `property` through the entry's gate.
    ///
    /// A transparent-write sidecar able to hold the property takes the
    /// value. Otherwise the value is written only if it differs from the
    /// current one. Differing writes to read-only properties fail once the
    /// entry is `Unchanged`, `Modified` or `Deleted`.
    pub fn set_property_value(
        &mut self,
        id: EntryId,
        property: &Property,
        value: Value,
    ) -> TrackerResult<()> {
        let entry = self.entry(id)?;
        let entity_type = Arc::clone(entry.entity_type());
        if entity_type
            .property_at(property.index())
            .map(Property::name)
            != Some(property.name())
        {
            return Err(TrackerError::UnknownProperty {
                entity_type: entity_type.name().to_string(),
                name: property.name().to_string(),
            });
        }

        let current = entry.property_value(property);
        let guarded = matches!(
            entry.state(),
            EntityState::Unchanged | EntityState::Modified | EntityState::Deleted
        );
        if property.is_read_only() && guarded && current != value {
            return Err(TrackerError::read_only(property.name(), entity_type.name()));
        }

        if let Some(position) = entry.transparent_write_target(property) {
            self.on_property_changing(id, property, Some(current))?;
            if let Some(sidecar) = self.entry_mut(id)?.sidecar_at_mut(position) {
                sidecar.set_value(property, value);
            }
            return self.on_property_changed(id, property);
        }

        if current == value {
            return Ok(());
        }
        if self.config.sensitive_data_logging {
            trace!(entry = %id, property = property.name(), value = %value, "writing property");
        } else {
            trace!(entry = %id, property = property.name(), "writing property");
        }

        if entry.is_notifying() && !property.is_shadow() {
            // The object reports the write itself.
            self.entry_mut(id)?.write_raw(property, value);
            return self.process_notifications();
        }
        self.on_property_changing(id, property, Some(current))?;
        self.entry_mut(id)?.write_raw(property, value);
        self.on_property_changed(id, property)
    }

    /// Explicitly flags or unflags the property called `name` as modified.
    ///
    /// Read-only properties cannot be flagged. Flags are only recorded while
    /// the entry is `Unchanged` or `Modified`; flagging moves an `Unchanged`
    /// entry to `Modified`, and clearing the last flag moves it back.
    pub fn set_property_modified(
        &mut self,
        id: EntryId,
        name: &str,
        modified: bool,
    ) -> TrackerResult<()> {
        let entity_type = Arc::clone(self.entry(id)?.entity_type());
        let property = entity_type.find_property(name)?;
        if property.is_read_only() {
            return Err(TrackerError::read_only(property.name(), entity_type.name()));
        }
        self.set_modified_flag(id, property, modified)
    }

    fn set_modified_flag(
        &mut self,
        id: EntryId,
        property: &Property,
        modified: bool,
    ) -> TrackerResult<()> {
        let entry = self.entry_mut(id)?;
        let state = entry.state();
        if !state.tracks_modifications() {
            return Ok(());
        }
        entry.set_flag(property, modified);
        let any = entry.any_flag();
        match state {
            EntityState::Unchanged if modified => self.transition(id, EntityState::Modified, false),
            EntityState::Modified if !any => self.transition(id, EntityState::Unchanged, false),
            _ => Ok(()),
        }
    }

    /// Marks the property called `name` as holding a temporary value.
    ///
    /// Only honored while the entry is `Added`.
    pub fn mark_as_temporary(
        &mut self,
        id: EntryId,
        name: &str,
        temporary: bool,
    ) -> TrackerResult<()> {
        let entity_type = Arc::clone(self.entry(id)?.entity_type());
        let property = entity_type.find_property(name)?;
        let entry = self.entry_mut(id)?;
        if entry.state() == EntityState::Added {
            entry.set_flag(property, temporary);
        }
        Ok(())
    }

    // ---- change detection ----

    fn on_property_changing(
        &mut self,
        id: EntryId,
        property: &Property,
        previous: Option<Value>,
    ) -> TrackerResult<()> {
        self.check_owner(id)?;
        let entry = self
            .entries
            .get_mut(&id.index())
            .ok_or(TrackerError::EntryNotFound { entry: id })?;
        self.detector.property_changing(entry, property, previous);
        for listener in &self.listeners {
            listener.property_changing(entry, property);
        }
        Ok(())
    }

    fn on_property_changed(&mut self, id: EntryId, property: &Property) -> TrackerResult<()> {
        self.check_owner(id)?;
        let entry = self
            .entries
            .get_mut(&id.index())
            .ok_or(TrackerError::EntryNotFound { entry: id })?;
        if entry.state() == EntityState::Added {
            // An explicit write replaces a temporary value.
            entry.set_flag(property, false);
        }
        let report = self.detector.property_changed(entry, property);
        for listener in &self.listeners {
            listener.property_changed(entry, property);
        }
        self.apply_report(report)
    }

    /// Applies queued notifications from notifying objects.
    ///
    /// Returns the first error raised while applying them; the rest of the
    /// queue is still applied.
    pub fn process_notifications(&mut self) -> TrackerResult<()> {
        let mut first_error = None;
        for notification in self.notifications.drain() {
            let id = notification.entry;
            let Some(entry) = self.entries.get_mut(&id.index()) else {
                continue;
            };
            let entity_type = Arc::clone(entry.entity_type());
            let result = if let Some(property) = entity_type.property(&notification.member) {
                match notification.phase {
                    NotificationPhase::Changing(previous) => {
                        self.on_property_changing(id, property, previous)
                    }
                    NotificationPhase::Changed => self.on_property_changed(id, property),
                }
            } else if let Some(navigation) = entity_type.navigation(&notification.member) {
                match notification.phase {
                    NotificationPhase::Changing(_) => Ok(()),
                    NotificationPhase::Changed => {
                        let report = self.detector.navigation_changed(entry, navigation);
                        self.apply_report(report)
                    }
                }
            } else {
                Ok(())
            };
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Runs an internal write and drops the notifications it raised.
    fn quietly<T>(
        &mut self,
        write: impl FnOnce(&mut Self) -> TrackerResult<T>,
    ) -> TrackerResult<T> {
        self.process_notifications()?;
        let result = write(self);
        let _ = self.notifications.drain();
        result
    }

    /// Scans one entry for changes.
    pub fn detect_entry_changes(&mut self, id: EntryId) -> TrackerResult<()> {
        let detector = self.detector;
        let report = detector.detect_changes(self.entry_mut(id)?);
        self.apply_report(report)
    }

    /// Applies pending notifications, then scans every tracked entry.
    pub fn detect_changes(&mut self) -> TrackerResult<()> {
        self.process_notifications()?;
        let ids: Vec<EntryId> = self.entries().map(Entry::id).collect();
        for id in ids {
            self.detect_entry_changes(id)?;
        }
        Ok(())
    }

    fn apply_report(&mut self, report: ChangeReport) -> TrackerResult<()> {
        let id = report.entry;
        for change in &report.changes {
            if let DetectedChange::PropertyModified { property } = change {
                let entity_type = Arc::clone(self.entry(id)?.entity_type());
                if let Some(property) = entity_type.property_at(*property) {
                    self.set_modified_flag(id, property, true)?;
                }
                continue;
            }

            let entry = self.entry(id)?;
            let entity_type = entry.entity_type();
            for listener in &self.listeners {
                match change {
                    DetectedChange::ForeignKeyChanged { property, old, new } => {
                        if let Some(property) = entity_type.property_at(*property) {
                            listener.foreign_key_changed(entry, property, old, new);
                        }
                    }
                    DetectedChange::PrincipalKeyChanged { property, old, new } => {
                        if let Some(property) = entity_type.property_at(*property) {
                            listener.principal_key_changed(entry, property, old, new);
                        }
                    }
                    DetectedChange::NavigationReferenceChanged { navigation, old, new } => {
                        if let Some(navigation) = entity_type.navigations().get(*navigation) {
                            listener.navigation_reference_changed(
                                entry,
                                navigation,
                                old.as_ref(),
                                new.as_ref(),
                            );
                        }
                    }
                    DetectedChange::NavigationCollectionChanged {
                        navigation,
                        added,
                        removed,
                    } => {
                        if let Some(navigation) = entity_type.navigations().get(*navigation) {
                            listener.navigation_collection_changed(entry, navigation, added, removed);
                        }
                    }
                    DetectedChange::PropertyModified { .. } => {}
                }
            }
        }
        if let Some(old_key) = &report.previous_primary_key {
            if let Err(err) = self.update_identity_map(id, old_key) {
                self.restore_key_snapshot(id, &report)?;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Puts the primary-key values of a failed re-index back into the
    /// relationship snapshot, so the key change is still pending.
    fn restore_key_snapshot(&mut self, id: EntryId, report: &ChangeReport) -> TrackerResult<()> {
        let entry = self.entry_mut(id)?;
        let entity_type = Arc::clone(entry.entity_type());
        let Some(snapshot) = entry.sidecar_mut(&SidecarName::RelationshipsSnapshot) else {
            return Ok(());
        };
        for change in &report.changes {
            if let DetectedChange::PrincipalKeyChanged { property, old, .. } = change {
                if let Some(property) = entity_type
                    .property_at(*property)
                    .filter(|p| p.is_primary_key())
                {
                    snapshot.set_value(property, old.clone());
                }
            }
        }
        Ok(())
    }

    // ---- accept / reject ----

    /// Makes the entry's current values its new baseline.
    ///
    /// `Added` and `Modified` become `Unchanged`, `Deleted` is detached,
    /// `Unchanged` and `Unknown` are left alone.
    pub fn accept_changes(&mut self, id: EntryId) -> TrackerResult<()> {
        match self.entry(id)?.state() {
            EntityState::Added | EntityState::Modified => {
                self.entry_mut(id)?.refresh_snapshots();
                self.transition(id, EntityState::Unchanged, false)
            }
            EntityState::Deleted => self.transition(id, EntityState::Unknown, false),
            EntityState::Unchanged | EntityState::Unknown => Ok(()),
        }
    }

    /// Accepts changes on every tracked entry.
    pub fn accept_all_changes(&mut self) -> TrackerResult<()> {
        let ids: Vec<EntryId> = self.entries().map(Entry::id).collect();
        for id in ids {
            self.accept_changes(id)?;
        }
        Ok(())
    }

    /// Discards the entry's changes.
    ///
    /// Original values are copied back into the entity and the entry becomes
    /// `Unchanged`. An `Added` entry is detached instead.
    pub fn reject_changes(&mut self, id: EntryId) -> TrackerResult<()> {
        match self.entry(id)?.state() {
            EntityState::Added => self.transition(id, EntityState::Unknown, false),
            EntityState::Modified | EntityState::Deleted | EntityState::Unchanged => {
                let old_key = self.entry(id)?.primary_key();
                self.quietly(|manager| {
                    let entry = manager.entry_mut(id)?;
                    entry.restore_original_values();
                    entry.refresh_snapshots();
                    Ok(())
                })?;
                self.update_identity_map(id, &old_key)?;
                self.transition(id, EntityState::Unchanged, false)
            }
            EntityState::Unknown => Ok(()),
        }
    }

    // ---- save ----

    fn store(&self) -> TrackerResult<Arc<dyn DataStore>> {
        self.store
            .clone()
            .ok_or_else(|| TrackerError::invalid_operation("no data store configured"))
    }

    /// Collects dirty entries with the keys they are indexed under, and
    /// attaches their StoreGeneratedValues sidecars.
    fn prepare_save(&mut self) -> TrackerResult<(Vec<EntryId>, Vec<EntityKey>)> {
        if self.config.auto_detect_changes {
            self.detect_changes()?;
        } else {
            self.process_notifications()?;
        }
        let dirty: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.state().is_dirty())
            .map(Entry::id)
            .collect();
        let keys = dirty
            .iter()
            .map(|id| self.entry(*id).map(Entry::primary_key))
            .collect::<TrackerResult<Vec<_>>>()?;
        for (prepared, id) in dirty.iter().enumerate() {
            let prepared_entry = self.entry_mut(*id).and_then(Entry::prepare_to_save);
            if let Err(err) = prepared_entry {
                self.rollback(&dirty[..prepared]);
                return Err(err);
            }
        }
        Ok((dirty, keys))
    }

    fn dirty_refs(&mut self, dirty: &[EntryId]) -> Vec<&mut Entry> {
        let wanted: HashSet<u64> = dirty.iter().map(|id| id.index()).collect();
        self.entries
            .iter_mut()
            .filter(|(index, _)| wanted.contains(index))
            .map(|(_, entry)| entry)
            .collect()
    }

    fn rollback(&mut self, entries: &[EntryId]) {
        for id in entries {
            if let Some(entry) = self.entries.get_mut(&id.index()) {
                entry.auto_rollback_sidecars();
            }
        }
        debug!(entries = entries.len(), "rolled back store-generated values");
    }

    /// Fails if committing the store-generated keys of `dirty` would give two
    /// entries the same key. Every dirty entry releases the key it was
    /// indexed under before `keys` are reassigned.
    fn check_committed_keys(&self, dirty: &[EntryId], keys: &[EntityKey]) -> TrackerResult<()> {
        let released: HashSet<&EntityKey> = keys.iter().collect();
        let mut claimed = HashSet::new();
        for id in dirty {
            let entry = self.entry(*id)?;
            if entry.state() == EntityState::Deleted {
                continue;
            }
            let key = entry.primary_key();
            if key.is_null() {
                continue;
            }
            let held = self.identity_map.get(&key).is_some_and(|e| e != id)
                && !released.contains(&key);
            if held || !claimed.insert(key.clone()) {
                return Err(TrackerError::DuplicateIdentity {
                    entity_type: entry.entity_type().name().to_string(),
                    key: self.rendered_key(&key),
                });
            }
        }
        Ok(())
    }

    fn commit_store_values(&mut self, id: EntryId) -> TrackerResult<()> {
        self.quietly(|manager| {
            manager.entry_mut(id)?.auto_commit_sidecars();
            Ok(())
        })
    }

    /// Commits a persisted save.
    ///
    /// Keys are validated up front, then every entry leaves its old key,
    /// deleted entries are detached and the others are indexed under their
    /// new keys. Store values are committed entry by entry after that, checking
    /// `cancel` before each one.
    fn commit_saved(
        &mut self,
        dirty: &[EntryId],
        keys: &[EntityKey],
        cancel: Option<&CancelFlag>,
    ) -> TrackerResult<()> {
        if let Err(err) = self.check_committed_keys(dirty, keys) {
            warn!(error = %err, "store-generated keys collide, rolling back");
            self.rollback(dirty);
            return Err(err);
        }
        for (id, old_key) in dirty.iter().zip(keys) {
            if self.identity_map.get(old_key) == Some(id) {
                self.identity_map.remove(old_key);
            }
        }

        let mut pending = Vec::with_capacity(dirty.len());
        for (id, old_key) in dirty.iter().zip(keys) {
            let entry = self.entry(*id)?;
            if entry.state() == EntityState::Deleted {
                self.commit_store_values(*id)?;
                self.accept_changes(*id)?;
                continue;
            }
            let new_key = entry.primary_key();
            if !new_key.is_null() {
                self.identity_map.insert(new_key, *id);
            }
            pending.push((*id, old_key));
        }

        for (committed, (id, _)) in pending.iter().enumerate() {
            if cancel.is_some_and(CancelFlag::is_cancelled) {
                warn!(committed, remaining = pending.len() - committed, "save cancelled");
                self.restore_keys(&pending[committed..]);
                return Err(TrackerError::Cancelled);
            }
            self.commit_store_values(*id)?;
            self.accept_changes(*id)?;
        }
        Ok(())
    }

    /// Rolls back entries whose commit was cancelled and indexes them under
    /// their previous keys again.
    fn restore_keys(&mut self, pending: &[(EntryId, &EntityKey)]) {
        for (id, old_key) in pending {
            let Some(entry) = self.entries.get_mut(&id.index()) else {
                continue;
            };
            let new_key = entry.primary_key();
            entry.auto_rollback_sidecars();
            if self.identity_map.get(&new_key) == Some(id) {
                self.identity_map.remove(&new_key);
            }
            if !old_key.is_null() {
                self.identity_map.entry((*old_key).clone()).or_insert(*id);
            }
        }
        debug!(entries = pending.len(), "rolled back store-generated values");
    }

    /// Persists every `Added`, `Modified` and `Deleted` entry.
    ///
    /// On success store-generated values are committed and changes accepted.
    /// On failure every prepared entry is rolled back and keeps its state.
    /// That includes store-generated keys that collide with a key still
    /// tracked after the save, which fail with
    /// [`TrackerError::DuplicateIdentity`].
    pub fn save_changes(&mut self) -> TrackerResult<usize> {
        let store = self.store()?;
        let (dirty, keys) = self.prepare_save()?;
        if dirty.is_empty() {
            return Ok(0);
        }
        debug!(entries = dirty.len(), "saving changes");

        let result = {
            let mut entries = self.dirty_refs(&dirty);
            store.save_changes(&mut entries)
        };
        match result {
            Ok(rows) => {
                self.commit_saved(&dirty, &keys, None)?;
                debug!(entries = dirty.len(), rows, "saved changes");
                Ok(rows)
            }
            Err(err) => {
                warn!(error = %err, "save failed");
                self.rollback(&dirty);
                Err(err)
            }
        }
    }

    /// Asynchronous [`save_changes`](Self::save_changes).
    ///
    /// `cancel` is checked before persisting and between entry commits.
    /// Entries committed before cancellation stay committed; the rest are
    /// rolled back and [`TrackerError::Cancelled`] is returned.
    pub async fn save_changes_async(&mut self, cancel: &CancelFlag) -> TrackerResult<usize> {
        let store = self.store()?;
        let (dirty, keys) = self.prepare_save()?;
        if dirty.is_empty() {
            return Ok(0);
        }
        if let Err(err) = cancel.check() {
            warn!(entries = dirty.len(), "save cancelled before persisting");
            self.rollback(&dirty);
            return Err(err);
        }
        debug!(entries = dirty.len(), "saving changes");

        let result = {
            let mut entries = self.dirty_refs(&dirty);
            store.save_changes_async(&mut entries, cancel).await
        };
        let rows = match result {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "save failed");
                self.rollback(&dirty);
                return Err(err);
            }
        };

        self.commit_saved(&dirty, &keys, Some(cancel))?;
        debug!(entries = dirty.len(), rows, "saved changes");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::DynamicEntity;
    use crate::metadata::{EntityTypeDef, ForeignKeyDef, NavigationDef, PropertyDef};
    use crate::value::ValueKind;
    use crate::value_generation::ValueGenerator;
    use parking_lot::Mutex;

    fn model() -> Arc<Model> {
        let model = Model::builder()
            .entity_type(
                EntityTypeDef::new("Category")
                    .property(
                        PropertyDef::new("Id", ValueKind::Integer).generated(ValueGeneration::OnAdd),
                    )
                    .property(PropertyDef::new("Name", ValueKind::Text).nullable())
                    .navigation(NavigationDef::collection("Products", "Product"))
                    .key(["Id"]),
            )
            .entity_type(
                EntityTypeDef::new("Product")
                    .property(
                        PropertyDef::new("Id", ValueKind::Integer).generated(ValueGeneration::OnAdd),
                    )
                    .property(PropertyDef::new("CategoryId", ValueKind::Integer).nullable())
                    .property(PropertyDef::new("Name", ValueKind::Text).nullable())
                    .property(PropertyDef::new("Sku", ValueKind::Text).nullable().read_only())
                    .property(
                        PropertyDef::new("Version", ValueKind::Integer)
                            .generated(ValueGeneration::OnAddAndUpdate),
                    )
                    .foreign_key(ForeignKeyDef::new(["CategoryId"], "Category"))
                    .key(["Id"]),
            )
            .entity_type(
                EntityTypeDef::shadow("Tag")
                    .property(PropertyDef::new("Id", ValueKind::Integer))
                    .property(PropertyDef::new("Label", ValueKind::Text).nullable())
                    .key(["Id"]),
            )
            .build()
            .unwrap();
        Arc::new(model)
    }

    fn key(entity_type: &str, id: i64) -> EntityKey {
        EntityKey::new(entity_type, vec![Value::Integer(id)])
    }

    fn product_row(id: i64, sku: &str) -> Vec<Value> {
        vec![
            Value::from(id),
            Value::Null,
            Value::from("Chai"),
            Value::from(sku),
            Value::from(1),
        ]
    }

    /// Assigns 7, 8, ... to the key of every added entry.
    struct KeyAssigningStore {
        next: Mutex<i64>,
    }

    impl DataStore for KeyAssigningStore {
        fn save_changes(&self, entries: &mut [&mut Entry]) -> TrackerResult<usize> {
            for entry in entries.iter_mut() {
                if entry.state() != EntityState::Added {
                    continue;
                }
                let entity_type = Arc::clone(entry.entity_type());
                let mut next = self.next.lock();
                entry.set_store_generated(entity_type.find_property("Id")?, Value::Integer(*next))?;
                *next += 1;
            }
            Ok(entries.len())
        }
    }

    struct FailingStore;

    impl DataStore for FailingStore {
        fn save_changes(&self, _entries: &mut [&mut Entry]) -> TrackerResult<usize> {
            Err(TrackerError::persistence_retryable("connection reset"))
        }
    }

    #[derive(Default)]
    struct StateLog {
        transitions: Mutex<Vec<(EntityState, EntityState)>>,
    }

    impl EntryListener for StateLog {
        fn state_changed(&self, entry: &Entry, old_state: EntityState) {
            self.transitions.lock().push((old_state, entry.state()));
        }
    }

    #[test]
    fn materialize_returns_existing_entry_for_same_key() {
        let mut manager = StateManager::new(model());
        let first = manager
            .get_or_materialize_entry("Category", &[Value::from(1), Value::from("Beverages")])
            .unwrap();
        let second = manager
            .get_or_materialize_entry("Category", &[Value::from(1), Value::from("Other")])
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(manager.entries().count(), 1);
        let entry = manager.try_get_entry(&key("Category", 1)).unwrap();
        assert_eq!(entry.state(), EntityState::Unchanged);
        assert_eq!(entry.value("Name").unwrap(), Value::from("Beverages"));
    }

    #[test]
    fn writing_the_current_value_is_a_no_op() {
        let mut manager = StateManager::new(model());
        let id = manager
            .get_or_materialize_entry("Category", &[Value::from(1), Value::from("Beverages")])
            .unwrap();

        manager.set_property(id, "Name", "Beverages").unwrap();
        assert_eq!(manager.entry(id).unwrap().state(), EntityState::Unchanged);
    }

    #[test]
    fn property_write_modifies_and_reject_restores() {
        let mut manager = StateManager::new(model());
        let id = manager
            .get_or_materialize_entry("Category", &[Value::from(1), Value::from("Beverages")])
            .unwrap();

        manager.set_property(id, "Name", "Drinks").unwrap();
        let entry = manager.entry(id).unwrap();
        let name = entry.entity_type().find_property("Name").unwrap();
        assert_eq!(entry.state(), EntityState::Modified);
        assert!(entry.is_property_modified(name));
        assert_eq!(entry.original_value(name), Value::from("Beverages"));

        manager.reject_changes(id).unwrap();
        let entry = manager.entry(id).unwrap();
        assert_eq!(entry.state(), EntityState::Unchanged);
        assert_eq!(entry.value("Name").unwrap(), Value::from("Beverages"));
    }

    #[test]
    fn clearing_the_last_modified_flag_returns_to_unchanged() {
        let mut manager = StateManager::new(model());
        let id = manager
            .get_or_materialize_entry("Category", &[Value::from(1), Value::from("Beverages")])
            .unwrap();

        manager.set_property_modified(id, "Name", true).unwrap();
        assert_eq!(manager.entry(id).unwrap().state(), EntityState::Modified);
        manager.set_property_modified(id, "Name", false).unwrap();
        assert_eq!(manager.entry(id).unwrap().state(), EntityState::Unchanged);
    }

    #[test]
    fn added_entry_gets_temporary_key_and_delete_detaches_it() {
        let mut manager = StateManager::new(model());
        let id = manager.create_new_entry("Category").unwrap();
        manager.set_state(id, EntityState::Added).unwrap();

        let entry = manager.entry(id).unwrap();
        let key_property = entry.entity_type().find_property("Id").unwrap();
        assert_eq!(entry.value("Id").unwrap(), Value::Integer(-1));
        assert!(entry.has_temporary_value(key_property));
        assert!(manager.try_get_entry(&key("Category", -1)).is_some());

        manager.set_state(id, EntityState::Deleted).unwrap();
        let entry = manager.entry(id).unwrap();
        assert_eq!(entry.state(), EntityState::Unknown);
        assert_eq!(entry.value("Id").unwrap(), Value::Integer(0));
        assert!(manager.try_get_entry(&key("Category", -1)).is_none());
        assert_eq!(manager.entries().count(), 0);
    }

    #[test]
    fn explicit_key_write_clears_temporary_flag() {
        let mut manager = StateManager::new(model());
        let id = manager.create_new_entry("Category").unwrap();
        manager.set_state(id, EntityState::Added).unwrap();

        manager.set_property(id, "Id", 10).unwrap();
        let entry = manager.entry(id).unwrap();
        let key_property = entry.entity_type().find_property("Id").unwrap();
        assert!(!entry.has_temporary_value(key_property));
        assert!(manager.try_get_entry(&key("Category", 10)).is_some());
        assert!(manager.try_get_entry(&key("Category", -1)).is_none());
    }

    #[test]
    fn temporary_marking_only_applies_to_added_entries() {
        let mut manager = StateManager::new(model());
        let added = manager.create_new_entry("Category").unwrap();
        manager.set_property(added, "Id", 10).unwrap();
        manager.set_state(added, EntityState::Added).unwrap();
        manager.mark_as_temporary(added, "Id", true).unwrap();

        let tracked = manager.create_new_entry("Category").unwrap();
        manager.set_property(tracked, "Id", 11).unwrap();
        manager.set_state(tracked, EntityState::Unchanged).unwrap();
        manager.mark_as_temporary(tracked, "Id", true).unwrap();

        let entry = manager.entry(added).unwrap();
        let key_property = entry.entity_type().find_property("Id").unwrap();
        assert!(entry.has_temporary_value(key_property));
        let entry = manager.entry(tracked).unwrap();
        assert!(!entry.has_temporary_value(key_property));
        assert_eq!(entry.state(), EntityState::Unchanged);
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let mut manager = StateManager::new(model());
        let first = manager.create_new_entry("Category").unwrap();
        manager.set_property(first, "Id", 5).unwrap();
        manager.set_state(first, EntityState::Unchanged).unwrap();

        let second = manager.create_new_entry("Category").unwrap();
        manager.set_property(second, "Id", 5).unwrap();
        let err = manager.set_state(second, EntityState::Unchanged).unwrap_err();

        assert!(matches!(err, TrackerError::DuplicateIdentity { .. }));
        assert_eq!(manager.entry(second).unwrap().state(), EntityState::Unknown);
        assert_eq!(manager.try_get_entry(&key("Category", 5)).unwrap().id(), first);
    }

    #[test]
    fn same_object_resolves_to_one_entry() {
        let model = model();
        let mut manager = StateManager::new(Arc::clone(&model));
        let category: EntityRef = DynamicEntity::new(model.entity_type("Category").unwrap())
            .with("Id", 3)
            .into_ref();

        let first = manager.get_or_create_entry(&category).unwrap();
        let second = manager.get_or_create_entry(&category).unwrap();
        assert_eq!(first, second);

        manager.set_state(first, EntityState::Unchanged).unwrap();
        assert_eq!(manager.try_get_entry_for(&category).unwrap().id(), first);
        assert_eq!(manager.get_or_create_entry(&category).unwrap(), first);
    }

    #[test]
    fn entries_from_another_manager_are_rejected() {
        let model = model();
        let mut owner = StateManager::new(Arc::clone(&model));
        let other = StateManager::new(model);
        let id = owner.create_new_entry("Category").unwrap();

        assert!(matches!(
            other.entry(id),
            Err(TrackerError::ForeignEntry { .. })
        ));
    }

    #[test]
    fn tracked_entries_cannot_be_removed() {
        let mut manager = StateManager::new(model());
        let id = manager
            .get_or_materialize_entry("Category", &[Value::from(1), Value::Null])
            .unwrap();
        assert!(manager.remove_entry(id).is_err());

        manager.set_state(id, EntityState::Unknown).unwrap();
        assert!(manager.remove_entry(id).is_ok());
        assert!(manager.entry(id).is_err());
    }

    #[test]
    fn read_only_property_rejects_changes_once_tracked() {
        let mut manager = StateManager::new(model());
        let id = manager
            .get_or_materialize_entry("Product", &product_row(1, "A-1"))
            .unwrap();

        let err = manager.set_property(id, "Sku", "B-2").unwrap_err();
        assert!(matches!(err, TrackerError::PropertyReadOnly { .. }));
        manager.set_property(id, "Sku", "A-1").unwrap();

        let added = manager.create_new_entry("Product").unwrap();
        manager.set_state(added, EntityState::Added).unwrap();
        manager.set_property(added, "Sku", "C-3").unwrap();
    }

    #[test]
    fn explicit_modified_flags_writable_non_key_properties() {
        let mut manager = StateManager::new(model());
        let id = manager
            .get_or_materialize_entry("Product", &product_row(1, "A-1"))
            .unwrap();

        manager.set_state(id, EntityState::Modified).unwrap();
        let names: Vec<&str> = manager
            .entry(id)
            .unwrap()
            .modified_properties()
            .map(Property::name)
            .collect();
        assert_eq!(names, ["CategoryId", "Name"]);
    }

    #[test]
    fn primary_key_write_reindexes_identity_map() {
        let mut manager = StateManager::new(model());
        let id = manager
            .get_or_materialize_entry("Category", &[Value::from(1), Value::Null])
            .unwrap();

        manager.set_property(id, "Id", 2).unwrap();
        assert!(manager.try_get_entry(&key("Category", 1)).is_none());
        assert_eq!(manager.try_get_entry(&key("Category", 2)).unwrap().id(), id);
    }

    #[test]
    fn colliding_key_write_stays_pending_until_resolved() {
        let mut manager = StateManager::new(model());
        let first = manager
            .get_or_materialize_entry("Category", &[Value::from(5), Value::Null])
            .unwrap();
        let second = manager
            .get_or_materialize_entry("Category", &[Value::from(6), Value::Null])
            .unwrap();

        let err = manager.set_property(second, "Id", 5).unwrap_err();
        assert!(matches!(err, TrackerError::DuplicateIdentity { .. }));
        assert_eq!(manager.try_get_entry(&key("Category", 5)).unwrap().id(), first);
        assert_eq!(manager.try_get_entry(&key("Category", 6)).unwrap().id(), second);
        assert!(matches!(
            manager.detect_changes(),
            Err(TrackerError::DuplicateIdentity { .. })
        ));

        manager.set_property(second, "Id", 9).unwrap();
        assert!(manager.try_get_entry(&key("Category", 6)).is_none());
        assert_eq!(manager.try_get_entry(&key("Category", 9)).unwrap().id(), second);
        assert_eq!(manager.try_get_entry(&key("Category", 5)).unwrap().id(), first);
    }

    #[test]
    fn shadow_entries_have_no_object() {
        let mut manager = StateManager::new(model());
        let id = manager.create_new_entry("Tag").unwrap();
        manager.set_property(id, "Id", 3).unwrap();
        manager.set_property(id, "Label", "sale").unwrap();
        manager.set_state(id, EntityState::Unchanged).unwrap();

        let entry = manager.try_get_entry(&key("Tag", 3)).unwrap();
        assert!(entry.entity().is_none());
        assert_eq!(entry.value("Label").unwrap(), Value::from("sale"));
    }

    #[test]
    fn notifying_entity_changes_flow_through_notifications() {
        let model = model();
        let mut manager = StateManager::new(Arc::clone(&model));
        let category = Arc::new(
            DynamicEntity::notifying(model.entity_type("Category").unwrap())
                .with("Id", 1)
                .with("Name", "Beverages"),
        );
        let handle: EntityRef = category.clone();
        let id = manager.get_or_create_entry(&handle).unwrap();
        manager.set_state(id, EntityState::Unchanged).unwrap();
        assert!(manager.entry(id).unwrap().is_notifying());

        category.set("Name", "Drinks");
        assert_eq!(manager.entry(id).unwrap().state(), EntityState::Unchanged);
        manager.process_notifications().unwrap();
        assert_eq!(manager.entry(id).unwrap().state(), EntityState::Modified);

        manager.reject_changes(id).unwrap();
        assert_eq!(category.get("Name"), Value::from("Beverages"));
        assert_eq!(manager.entry(id).unwrap().state(), EntityState::Unchanged);
    }

    #[test]
    fn listeners_observe_state_transitions() {
        let mut manager = StateManager::new(model());
        let log = Arc::new(StateLog::default());
        manager.add_listener(log.clone());

        let id = manager
            .get_or_materialize_entry("Category", &[Value::from(1), Value::Null])
            .unwrap();
        manager.set_property(id, "Name", "Produce").unwrap();
        manager.set_state(id, EntityState::Deleted).unwrap();

        assert_eq!(
            *log.transitions.lock(),
            [
                (EntityState::Unknown, EntityState::Unchanged),
                (EntityState::Unchanged, EntityState::Modified),
                (EntityState::Modified, EntityState::Deleted),
            ]
        );
    }

    #[test]
    fn save_commits_store_generated_key() {
        let store = Arc::new(KeyAssigningStore {
            next: Mutex::new(7),
        });
        let mut manager = StateManager::new(model()).with_store(store);
        let id = manager.create_new_entry("Category").unwrap();
        manager.set_state(id, EntityState::Added).unwrap();

        assert_eq!(manager.save_changes().unwrap(), 1);

        let entry = manager.entry(id).unwrap();
        assert_eq!(entry.state(), EntityState::Unchanged);
        assert_eq!(entry.value("Id").unwrap(), Value::Integer(7));
        assert!(entry.sidecar(&SidecarName::StoreGeneratedValues).is_none());
        assert_eq!(manager.try_get_entry(&key("Category", 7)).unwrap().id(), id);
        assert!(manager.try_get_entry(&key("Category", -1)).is_none());
    }

    #[test]
    fn save_reuses_key_released_by_deleted_entry() {
        let store = Arc::new(KeyAssigningStore {
            next: Mutex::new(7),
        });
        let mut manager = StateManager::new(model()).with_store(store);
        let added = manager.create_new_entry("Category").unwrap();
        manager.set_state(added, EntityState::Added).unwrap();
        let product = manager.create_new_entry("Product").unwrap();
        manager.set_state(product, EntityState::Added).unwrap();
        let deleted = manager
            .get_or_materialize_entry("Category", &[Value::from(7), Value::from("Old")])
            .unwrap();
        manager.set_state(deleted, EntityState::Deleted).unwrap();

        assert_eq!(manager.save_changes().unwrap(), 3);

        let entry = manager.entry(added).unwrap();
        assert_eq!(entry.state(), EntityState::Unchanged);
        assert_eq!(entry.value("Id").unwrap(), Value::Integer(7));
        assert_eq!(manager.try_get_entry(&key("Category", 7)).unwrap().id(), added);
        assert!(manager.try_get_entry(&key("Category", -1)).is_none());

        let entry = manager.entry(product).unwrap();
        assert_eq!(entry.state(), EntityState::Unchanged);
        assert_eq!(entry.value("Id").unwrap(), Value::Integer(8));
        assert!(entry.sidecar(&SidecarName::StoreGeneratedValues).is_none());

        assert_eq!(manager.entry(deleted).unwrap().state(), EntityState::Unknown);
        assert_eq!(manager.entries().count(), 2);
    }

    #[test]
    fn colliding_generated_key_fails_save_without_partial_commit() {
        let store = Arc::new(KeyAssigningStore {
            next: Mutex::new(7),
        });
        let mut manager = StateManager::new(model()).with_store(store);
        let added = manager.create_new_entry("Category").unwrap();
        manager.set_state(added, EntityState::Added).unwrap();
        let product = manager.create_new_entry("Product").unwrap();
        manager.set_state(product, EntityState::Added).unwrap();
        let existing = manager
            .get_or_materialize_entry("Category", &[Value::from(7), Value::from("Kept")])
            .unwrap();

        let err = manager.save_changes().unwrap_err();
        assert!(matches!(err, TrackerError::DuplicateIdentity { .. }));

        for (id, temporary) in [(added, -1), (product, -2)] {
            let entry = manager.entry(id).unwrap();
            assert_eq!(entry.state(), EntityState::Added);
            assert_eq!(entry.value("Id").unwrap(), Value::Integer(temporary));
            assert!(entry.sidecar(&SidecarName::StoreGeneratedValues).is_none());
        }
        assert_eq!(manager.try_get_entry(&key("Category", -1)).unwrap().id(), added);
        assert_eq!(manager.try_get_entry(&key("Product", -2)).unwrap().id(), product);
        assert_eq!(manager.try_get_entry(&key("Category", 7)).unwrap().id(), existing);
    }

    #[test]
    fn failed_save_keeps_states_and_discards_store_values() {
        let mut manager = StateManager::new(model()).with_store(Arc::new(FailingStore));
        let id = manager.create_new_entry("Category").unwrap();
        manager.set_state(id, EntityState::Added).unwrap();

        let err = manager.save_changes().unwrap_err();
        assert!(err.is_retryable());

        let entry = manager.entry(id).unwrap();
        assert_eq!(entry.state(), EntityState::Added);
        assert_eq!(entry.value("Id").unwrap(), Value::Integer(-1));
        assert!(entry.sidecar(&SidecarName::StoreGeneratedValues).is_none());
    }

    #[test]
    fn save_without_store_is_an_error() {
        let mut manager = StateManager::new(model());
        assert!(matches!(
            manager.save_changes(),
            Err(TrackerError::InvalidOperation { .. })
        ));
    }

    /// Hands out one temporary value, then cancels whatever comes next.
    struct CancelAfterFirst {
        cancel: CancelFlag,
    }

    impl ValueGenerator for CancelAfterFirst {
        fn next(&self, _property: &Property) -> TrackerResult<Value> {
            self.cancel.cancel();
            Ok(Value::Integer(-5))
        }

        fn generates_temporary_values(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn cancelled_generation_resets_values_already_generated() {
        let model = Model::builder()
            .entity_type(
                EntityTypeDef::new("Order")
                    .property(
                        PropertyDef::new("Id", ValueKind::Integer).generated(ValueGeneration::OnAdd),
                    )
                    .property(
                        PropertyDef::new("Token", ValueKind::Uuid).generated(ValueGeneration::OnAdd),
                    )
                    .key(["Id"]),
            )
            .build()
            .unwrap();
        let cancel = CancelFlag::new();
        let generators = ValueGeneratorSelector::new().with_generator(
            "Order",
            "Id",
            Arc::new(CancelAfterFirst {
                cancel: cancel.clone(),
            }),
        );
        let mut manager = StateManager::new(Arc::new(model)).with_value_generators(generators);
        let id = manager.create_new_entry("Order").unwrap();

        let err = manager
            .set_state_async(id, EntityState::Added, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Cancelled));

        let entry = manager.entry(id).unwrap();
        let entity_type = Arc::clone(entry.entity_type());
        assert_eq!(entry.state(), EntityState::Unknown);
        for name in ["Id", "Token"] {
            let property = entity_type.find_property(name).unwrap();
            assert_eq!(entry.value(name).unwrap(), property.default_value());
        }
        assert!(manager.try_get_entry(&key("Order", -5)).is_none());
        assert_eq!(manager.entries().count(), 0);
    }

    #[tokio::test]
    async fn cancelled_async_save_rolls_back() {
        let store = Arc::new(KeyAssigningStore {
            next: Mutex::new(7),
        });
        let mut manager = StateManager::new(model()).with_store(store);
        let id = manager.create_new_entry("Category").unwrap();
        manager.set_state(id, EntityState::Added).unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = manager.save_changes_async(&cancel).await.unwrap_err();
        assert!(matches!(err, TrackerError::Cancelled));

        let entry = manager.entry(id).unwrap();
        assert_eq!(entry.state(), EntityState::Added);
        assert!(entry.sidecar(&SidecarName::StoreGeneratedValues).is_none());

        cancel.reset();
        assert_eq!(manager.save_changes_async(&cancel).await.unwrap(), 1);
        assert_eq!(manager.entry(id).unwrap().value("Id").unwrap(), Value::Integer(7));
    }
}
