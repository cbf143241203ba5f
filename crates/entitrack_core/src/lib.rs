//! # EntiTrack Core
//!
//! Change tracking and identity management for a unit of work.
//!
//! This crate provides:
//! - An identity map and a reference map over tracked entries
//! - The entry lifecycle (`Unknown`, `Added`, `Unchanged`, `Modified`, `Deleted`)
//! - Change detection by snapshot comparison or native notifications
//! - Sidecars holding original, relationship and store-generated values
//! - A save pipeline with commit and rollback of store-generated values
//!
//! ## Key Invariants
//!
//! - At most one tracked entry per primary key and per entity object
//! - The null key is never indexed
//! - Writing a property's current value is a no-op
//! - A failed save leaves every entry in its previous state
//!
//! ## Usage
//!
//! ```
//! use entitrack_core::{
//!     EntityState, EntityTypeDef, Model, PropertyDef, StateManager, Value, ValueGeneration,
//!     ValueKind,
//! };
//! use std::sync::Arc;
//!
//! let model = Model::builder()
//!     .entity_type(
//!         EntityTypeDef::new("Category")
//!             .property(PropertyDef::new("Id", ValueKind::Integer).generated(ValueGeneration::OnAdd))
//!             .property(PropertyDef::new("Name", ValueKind::Text).nullable())
//!             .key(["Id"]),
//!     )
//!     .build()?;
//! let mut manager = StateManager::new(Arc::new(model));
//!
//! let id = manager.create_new_entry("Category")?;
//! manager.set_property(id, "Name", "Beverages")?;
//! manager.set_state(id, EntityState::Added)?;
//!
//! // Keys generated on the client are temporary until the store replaces them.
//! assert_eq!(manager.entry(id)?.value("Id")?, Value::Integer(-1));
//! # Ok::<(), entitrack_core::TrackerError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cancel;
mod change_detector;
mod config;
mod entity;
mod entry;
mod error;
mod key;
mod listener;
mod manager;
pub mod metadata;
mod notify;
mod sidecar;
mod store;
mod value;
mod value_generation;

pub use cancel::CancelFlag;
pub use change_detector::{ChangeDetector, ChangeReport, DetectedChange};
pub use config::TrackerConfig;
pub use entity::{
    DynamicEntity, DynamicMaterializer, Entity, EntityMaterializer, EntityRef, NavigationValue,
    ObjectId,
};
pub use entry::{EntityState, Entry, EntryFactory, EntryId, EntrySubscriber};
pub use error::{TrackerError, TrackerResult};
pub use key::EntityKey;
pub use listener::EntryListener;
pub use manager::StateManager;
pub use metadata::{
    EntityType, EntityTypeDef, ForeignKey, ForeignKeyDef, Model, ModelBuilder, ModelDef,
    Navigation, NavigationDef, Property, PropertyDef, ValueGeneration,
};
pub use notify::{NotificationPhase, NotificationSink, PropertyNotification};
pub use sidecar::{Sidecar, SidecarFlags, SidecarName};
pub use store::{DataStore, SaveFuture};
pub use value::{Value, ValueKind};
pub use value_generation::{
    GeneratorFuture, GuidGenerator, TemporaryIntegerGenerator, ValueGenerator,
    ValueGeneratorSelector,
};
