//! Client-side value generation for properties generated on add.

use crate::cancel::CancelFlag;
use crate::error::{TrackerError, TrackerResult};
use crate::metadata::{EntityType, Property};
use crate::value::{Value, ValueKind};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Future returned by [`ValueGenerator::next_async`].
pub type GeneratorFuture<'a> = Pin<Box<dyn Future<Output = TrackerResult<Value>> + Send + 'a>>;

/// Produces values for properties entering the `Added` state.
pub trait ValueGenerator: Send + Sync {
    /// Returns the next value for `property`.
    fn next(&self, property: &Property) -> TrackerResult<Value>;

    /// Returns the next value for `property` without blocking.
    ///
    /// The default checks `cancel` and then calls [`next`](Self::next).
    fn next_async<'a>(&'a self, property: &'a Property, cancel: &'a CancelFlag) -> GeneratorFuture<'a> {
        Box::pin(async move {
            cancel.check()?;
            self.next(property)
        })
    }

    /// Returns true if generated values are placeholders the store replaces.
    fn generates_temporary_values(&self) -> bool {
        false
    }
}

/// Hands out -1, -2, ... as temporary integer keys.
#[derive(Debug, Default)]
pub struct TemporaryIntegerGenerator {
    last: AtomicI64,
}

impl TemporaryIntegerGenerator {
    /// Creates a generator starting at -1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ValueGenerator for TemporaryIntegerGenerator {
    fn next(&self, property: &Property) -> TrackerResult<Value> {
        if property.kind() != ValueKind::Integer {
            return Err(TrackerError::value_generation(format!(
                "cannot generate temporary integers for '{}'",
                property.name()
            )));
        }
        Ok(Value::Integer(self.last.fetch_sub(1, Ordering::SeqCst) - 1))
    }

    fn generates_temporary_values(&self) -> bool {
        true
    }
}

/// Generates random (v4) UUIDs, as UUID or text values.
#[derive(Debug, Default, Clone, Copy)]
pub struct GuidGenerator;

impl ValueGenerator for GuidGenerator {
    fn next(&self, property: &Property) -> TrackerResult<Value> {
        let id = Uuid::new_v4();
        match property.kind() {
            ValueKind::Uuid => Ok(Value::Uuid(id)),
            ValueKind::Text => Ok(Value::Text(id.to_string())),
            _ => Err(TrackerError::value_generation(format!(
                "cannot generate a GUID for '{}'",
                property.name()
            ))),
        }
    }
}

/// Picks the generator for a property.
///
/// Overrides registered per entity type and property win; otherwise integer
/// properties get temporary integers and UUID or text properties get GUIDs.
#[derive(Clone)]
pub struct ValueGeneratorSelector {
    overrides: HashMap<(String, String), Arc<dyn ValueGenerator>>,
    integers: Arc<dyn ValueGenerator>,
    guids: Arc<dyn ValueGenerator>,
}

impl std::fmt::Debug for ValueGeneratorSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueGeneratorSelector")
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for ValueGeneratorSelector {
    fn default() -> Self {
        Self {
            overrides: HashMap::new(),
            integers: Arc::new(TemporaryIntegerGenerator::new()),
            guids: Arc::new(GuidGenerator),
        }
    }
}

impl ValueGeneratorSelector {
    /// Creates a selector with the built-in generators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `generator` for one property of one entity type.
    #[must_use]
    pub fn with_generator(
        mut self,
        entity_type: impl Into<String>,
        property: impl Into<String>,
        generator: Arc<dyn ValueGenerator>,
    ) -> Self {
        self.overrides
            .insert((entity_type.into(), property.into()), generator);
        self
    }

    /// Returns the generator for `property` of `entity_type`.
    pub fn select(
        &self,
        entity_type: &EntityType,
        property: &Property,
    ) -> TrackerResult<Arc<dyn ValueGenerator>> {
        let key = (entity_type.name().to_string(), property.name().to_string());
        if let Some(generator) = self.overrides.get(&key) {
            return Ok(Arc::clone(generator));
        }
        match property.kind() {
            ValueKind::Integer => Ok(Arc::clone(&self.integers)),
            ValueKind::Uuid | ValueKind::Text => Ok(Arc::clone(&self.guids)),
            _ => Err(TrackerError::NoValueGenerator {
                property: property.name().to_string(),
                entity_type: entity_type.name().to_string(),
            }),
        }
    }
}
