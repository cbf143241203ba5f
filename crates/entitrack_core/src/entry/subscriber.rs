//! Initial snapshots and native notification wiring for new entries.

use super::Entry;
use crate::config::TrackerConfig;
use crate::notify::NotificationSink;

/// Snapshots a freshly built entry and subscribes it to its object's
/// change notifications.
#[derive(Debug, Clone, Copy)]
pub struct EntrySubscriber {
    eager_original_values: bool,
}

impl EntrySubscriber {
    /// Creates a subscriber honoring `config`.
    #[must_use]
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            eager_original_values: config.eager_original_values,
        }
    }

    /// Subscribes `entry` through `sink` and takes its initial snapshots.
    ///
    /// The RelationshipsSnapshot is always captured. OriginalValues is
    /// captured up front unless the object notifies and lazy snapshots are
    /// in use.
    pub fn snapshot_and_subscribe(&self, entry: &mut Entry, sink: NotificationSink) {
        let notifying = entry
            .entity()
            .is_some_and(|entity| entity.subscribe(sink));
        entry.set_notifying(notifying);

        let eager = !notifying || self.eager_original_values;
        entry.set_eager_originals(eager);
        if eager {
            entry.snapshot_original_values();
        }
        entry.snapshot_relationships();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::DynamicMaterializer;
    use crate::entry::{EntryFactory, EntryId};
    use crate::metadata::{EntityTypeDef, Model, PropertyDef};
    use crate::notify::NotificationQueue;
    use crate::sidecar::SidecarName;
    use crate::value::ValueKind;
    use std::sync::Arc;

    fn model() -> Model {
        Model::builder()
            .entity_type(
                EntityTypeDef::new("Item")
                    .property(PropertyDef::new("Id", ValueKind::Integer))
                    .key(["Id"]),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn plain_objects_are_snapshotted_eagerly() {
        let model = model();
        let factory = EntryFactory::new(Arc::new(DynamicMaterializer::new()));
        let mut entry = factory
            .create_new(EntryId::new(1, 0), model.entity_type("Item").unwrap())
            .unwrap();
        let queue = NotificationQueue::new();
        let sink = queue.sink(entry.id());

        EntrySubscriber::new(&TrackerConfig::default()).snapshot_and_subscribe(&mut entry, sink);

        assert!(!entry.is_notifying());
        assert!(entry.sidecar(&SidecarName::OriginalValues).is_some());
        assert!(entry.sidecar(&SidecarName::RelationshipsSnapshot).is_some());
    }

    #[test]
    fn notifying_objects_defer_original_values() {
        let model = model();
        let factory = EntryFactory::new(Arc::new(DynamicMaterializer::notifying()));
        let mut entry = factory
            .create_new(EntryId::new(1, 0), model.entity_type("Item").unwrap())
            .unwrap();
        let queue = NotificationQueue::new();
        let sink = queue.sink(entry.id());

        EntrySubscriber::new(&TrackerConfig::default()).snapshot_and_subscribe(&mut entry, sink);

        assert!(entry.is_notifying());
        assert!(!entry.has_eager_original_values());
        assert!(entry.sidecar(&SidecarName::OriginalValues).is_none());
        assert!(entry.sidecar(&SidecarName::RelationshipsSnapshot).is_some());
    }

    #[test]
    fn eager_config_snapshots_notifying_objects_too() {
        let model = model();
        let factory = EntryFactory::new(Arc::new(DynamicMaterializer::notifying()));
        let mut entry = factory
            .create_new(EntryId::new(1, 0), model.entity_type("Item").unwrap())
            .unwrap();
        let queue = NotificationQueue::new();
        let config = TrackerConfig::new().eager_original_values(true);
        let sink = queue.sink(entry.id());

        EntrySubscriber::new(&config).snapshot_and_subscribe(&mut entry, sink);

        assert!(entry.is_notifying());
        assert!(entry.sidecar(&SidecarName::OriginalValues).is_some());
    }
}
