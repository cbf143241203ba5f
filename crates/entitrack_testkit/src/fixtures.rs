//! Test fixtures: a sample model, a recording listener, an in-memory store
//! and deterministic value generators.

use entitrack_core::{
    DataStore, EntityRef, EntityState, Entry, EntryId, EntryListener, Model, Navigation, Property,
    StateManager, TrackerConfig, TrackerError, TrackerResult, Value, ValueGenerator,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// JSON definition of the sample model.
///
/// - `Category`: generated integer key, a `Products` collection.
/// - `Product`: generated key, optional `CategoryId` foreign key, a
///   store-computed `Version`, a read-only `Sku` and a shadow `Audit`
///   property (so its entries are mixed).
/// - `OrderLine`: composite key (`OrderId`, `ProductId`).
/// - `Tag`: shadow-only type with no entity object.
pub const SAMPLE_MODEL_JSON: &str = r#"{
    "entity_types": [
        {
            "name": "Category",
            "properties": [
                { "name": "Id", "kind": "integer", "value_generation": "on_add" },
                { "name": "Name", "kind": "text", "nullable": true }
            ],
            "key": ["Id"],
            "navigations": [
                { "name": "Products", "target": "Product", "collection": true }
            ]
        },
        {
            "name": "Product",
            "properties": [
                { "name": "Id", "kind": "integer", "value_generation": "on_add" },
                { "name": "CategoryId", "kind": "integer", "nullable": true },
                { "name": "Name", "kind": "text", "nullable": true },
                { "name": "Price", "kind": "integer" },
                { "name": "Sku", "kind": "text", "nullable": true, "read_only": true },
                { "name": "Version", "kind": "integer", "value_generation": "on_add_and_update" },
                { "name": "Audit", "kind": "text", "nullable": true, "shadow": true }
            ],
            "key": ["Id"],
            "foreign_keys": [
                { "properties": ["CategoryId"], "principal": "Category" }
            ],
            "navigations": [
                { "name": "Category", "target": "Category" }
            ]
        },
        {
            "name": "OrderLine",
            "properties": [
                { "name": "OrderId", "kind": "integer" },
                { "name": "ProductId", "kind": "integer" },
                { "name": "Quantity", "kind": "integer" }
            ],
            "key": ["OrderId", "ProductId"]
        },
        {
            "name": "Tag",
            "clr_backed": false,
            "properties": [
                { "name": "Id", "kind": "integer" },
                { "name": "Label", "kind": "text", "nullable": true }
            ],
            "key": ["Id"]
        }
    ]
}"#;

/// Returns the sample model.
///
/// # Panics
///
/// Panics if [`SAMPLE_MODEL_JSON`] does not describe a valid model.
pub fn sample_model() -> Arc<Model> {
    Arc::new(Model::from_json(SAMPLE_MODEL_JSON).expect("sample model is valid"))
}

/// Returns a manager over the sample model with default configuration.
pub fn sample_manager() -> StateManager {
    StateManager::new(sample_model())
}

/// Returns a manager over the sample model with `config`.
pub fn sample_manager_with(config: TrackerConfig) -> StateManager {
    StateManager::with_config(sample_model(), config)
}

/// Materializes a `Category` row.
///
/// # Panics
///
/// Panics if materialization fails.
pub fn materialize_category(manager: &mut StateManager, id: i64, name: &str) -> EntryId {
    manager
        .get_or_materialize_entry("Category", &[Value::from(id), Value::from(name)])
        .expect("materialize category")
}

/// Materializes a `Product` row. `Audit` starts out null.
///
/// # Panics
///
/// Panics if materialization fails.
pub fn materialize_product(
    manager: &mut StateManager,
    id: i64,
    category_id: Option<i64>,
    price: i64,
) -> EntryId {
    let values = [
        Value::from(id),
        category_id.map_or(Value::Null, Value::from),
        Value::from(format!("Product {id}")),
        Value::from(price),
        Value::from(format!("SKU-{id}")),
        Value::from(1),
        Value::Null,
    ];
    manager
        .get_or_materialize_entry("Product", &values)
        .expect("materialize product")
}

/// One callback received by a [`RecordingListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// `state_changing`.
    StateChanging {
        /// Entry.
        entry: EntryId,
        /// State before the transition.
        from: EntityState,
        /// Requested state.
        to: EntityState,
    },
    /// `state_changed`.
    StateChanged {
        /// Entry.
        entry: EntryId,
        /// Previous state.
        from: EntityState,
        /// New state.
        to: EntityState,
    },
    /// `property_changing`.
    PropertyChanging {
        /// Entry.
        entry: EntryId,
        /// Property name.
        property: String,
    },
    /// `property_changed`.
    PropertyChanged {
        /// Entry.
        entry: EntryId,
        /// Property name.
        property: String,
    },
    /// `foreign_key_changed`.
    ForeignKeyChanged {
        /// Entry.
        entry: EntryId,
        /// Property name.
        property: String,
        /// Snapshot value.
        old: Value,
        /// Current value.
        new: Value,
    },
    /// `principal_key_changed`.
    PrincipalKeyChanged {
        /// Entry.
        entry: EntryId,
        /// Property name.
        property: String,
        /// Snapshot value.
        old: Value,
        /// Current value.
        new: Value,
    },
    /// `navigation_reference_changed`.
    NavigationReferenceChanged {
        /// Entry.
        entry: EntryId,
        /// Navigation name.
        navigation: String,
    },
    /// `navigation_collection_changed`.
    NavigationCollectionChanged {
        /// Entry.
        entry: EntryId,
        /// Navigation name.
        navigation: String,
        /// Number of added members.
        added: usize,
        /// Number of removed members.
        removed: usize,
    },
}

/// A listener that records every callback it receives.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    /// Creates an empty listener.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded events in order.
    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().clone()
    }

    /// Returns the `(from, to)` pairs of completed transitions of `entry`.
    pub fn transitions(&self, entry: EntryId) -> Vec<(EntityState, EntityState)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ListenerEvent::StateChanged { entry: e, from, to } if *e == entry => {
                    Some((*from, *to))
                }
                _ => None,
            })
            .collect()
    }

    /// Forgets every recorded event.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn record(&self, event: ListenerEvent) {
        self.events.lock().push(event);
    }
}

impl EntryListener for RecordingListener {
    fn state_changing(&self, entry: &Entry, new_state: EntityState) {
        self.record(ListenerEvent::StateChanging {
            entry: entry.id(),
            from: entry.state(),
            to: new_state,
        });
    }

    fn state_changed(&self, entry: &Entry, old_state: EntityState) {
        self.record(ListenerEvent::StateChanged {
            entry: entry.id(),
            from: old_state,
            to: entry.state(),
        });
    }

    fn property_changing(&self, entry: &Entry, property: &Property) {
        self.record(ListenerEvent::PropertyChanging {
            entry: entry.id(),
            property: property.name().to_string(),
        });
    }

    fn property_changed(&self, entry: &Entry, property: &Property) {
        self.record(ListenerEvent::PropertyChanged {
            entry: entry.id(),
            property: property.name().to_string(),
        });
    }

    fn foreign_key_changed(&self, entry: &Entry, property: &Property, old: &Value, new: &Value) {
        self.record(ListenerEvent::ForeignKeyChanged {
            entry: entry.id(),
            property: property.name().to_string(),
            old: old.clone(),
            new: new.clone(),
        });
    }

    fn principal_key_changed(&self, entry: &Entry, property: &Property, old: &Value, new: &Value) {
        self.record(ListenerEvent::PrincipalKeyChanged {
            entry: entry.id(),
            property: property.name().to_string(),
            old: old.clone(),
            new: new.clone(),
        });
    }

    fn navigation_reference_changed(
        &self,
        entry: &Entry,
        navigation: &Navigation,
        _old: Option<&EntityRef>,
        _new: Option<&EntityRef>,
    ) {
        self.record(ListenerEvent::NavigationReferenceChanged {
            entry: entry.id(),
            navigation: navigation.name().to_string(),
        });
    }

    fn navigation_collection_changed(
        &self,
        entry: &Entry,
        navigation: &Navigation,
        added: &[EntityRef],
        removed: &[EntityRef],
    ) {
        self.record(ListenerEvent::NavigationCollectionChanged {
            entry: entry.id(),
            navigation: navigation.name().to_string(),
            added: added.len(),
            removed: removed.len(),
        });
    }
}

/// What an [`InMemoryStore`] saw for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedEntry {
    /// Entry.
    pub entry: EntryId,
    /// State at save time.
    pub state: EntityState,
    /// Entity type name.
    pub entity_type: String,
    /// Names of the properties flagged as modified.
    pub modified: Vec<String>,
}

#[derive(Debug, Default)]
struct StoreState {
    batches: Vec<Vec<SavedEntry>>,
    next_generated: i64,
}

/// An in-memory [`DataStore`] double.
///
/// Entries are processed in order. For every `Added` entry whose
/// StoreGeneratedValues sidecar covers the configured property, the store
/// writes the next value of its sequence. A failure can be injected at the
/// n-th entry of a batch.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    generated_property: Option<String>,
    fail_at: Option<usize>,
}

impl InMemoryStore {
    /// Creates a store that persists everything and generates nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates `start`, `start + 1`, ... for `property` of added entries.
    #[must_use]
    pub fn generating(mut self, property: impl Into<String>, start: i64) -> Self {
        self.generated_property = Some(property.into());
        self.state.get_mut().next_generated = start;
        self
    }

    /// Fails with a retryable persistence error at entry `index` of every batch.
    #[must_use]
    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Returns the successfully persisted batches.
    pub fn batches(&self) -> Vec<Vec<SavedEntry>> {
        self.state.lock().batches.clone()
    }

    /// Returns every successfully persisted entry across batches.
    pub fn saved(&self) -> Vec<SavedEntry> {
        self.state.lock().batches.concat()
    }
}

impl DataStore for InMemoryStore {
    fn save_changes(&self, entries: &mut [&mut Entry]) -> TrackerResult<usize> {
        let mut state = self.state.lock();
        let mut batch = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter_mut().enumerate() {
            let entity_type = Arc::clone(entry.entity_type());
            if entry.state() == EntityState::Added {
                if let Some(property) = self
                    .generated_property
                    .as_deref()
                    .and_then(|name| entity_type.property(name))
                {
                    if entry.may_get_store_value(property) {
                        entry.set_store_generated(property, Value::Integer(state.next_generated))?;
                        state.next_generated += 1;
                    }
                }
            }
            if self.fail_at == Some(index) {
                return Err(TrackerError::persistence_retryable(format!(
                    "simulated failure at entry {index}"
                )));
            }
            batch.push(SavedEntry {
                entry: entry.id(),
                state: entry.state(),
                entity_type: entity_type.name().to_string(),
                modified: entry
                    .modified_properties()
                    .map(|p| p.name().to_string())
                    .collect(),
            });
        }
        let rows = batch.len();
        state.batches.push(batch);
        Ok(rows)
    }
}

/// Always returns the same value.
#[derive(Debug, Clone)]
pub struct FixedValueGenerator {
    value: Value,
    temporary: bool,
}

impl FixedValueGenerator {
    /// Generates `value` as a permanent value.
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            temporary: false,
        }
    }

    /// Marks generated values as temporary.
    #[must_use]
    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }
}

impl ValueGenerator for FixedValueGenerator {
    fn next(&self, _property: &Property) -> TrackerResult<Value> {
        Ok(self.value.clone())
    }

    fn generates_temporary_values(&self) -> bool {
        self.temporary
    }
}

/// Generates `start`, `start + 1`, ... as permanent integers.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicI64,
}

impl SequenceGenerator {
    /// Creates a sequence starting at `start`.
    pub fn starting_at(start: i64) -> Self {
        Self {
            next: AtomicI64::new(start),
        }
    }
}

impl ValueGenerator for SequenceGenerator {
    fn next(&self, _property: &Property) -> TrackerResult<Value> {
        Ok(Value::Integer(self.next.fetch_add(1, Ordering::SeqCst)))
    }
}
