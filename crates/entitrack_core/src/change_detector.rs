//! Change detection against an entry's snapshots.
//!
//! The detector compares live values with the OriginalValues and
//! RelationshipsSnapshot sidecars, refreshes the relationship snapshot where
//! it found a difference and returns a [`ChangeReport`]. Applying the report
//! (flagging properties, moving the entry to `Modified`, re-indexing keys and
//! notifying listeners) is left to the state manager.

use crate::entity::{EntityRef, NavigationValue, ObjectId};
use crate::entry::{Entry, EntryId};
use crate::key::EntityKey;
use crate::metadata::{Navigation, Property, ValueGeneration};
use crate::sidecar::{Sidecar, SidecarName};
use crate::value::Value;
use std::collections::HashSet;
use tracing::trace;

/// One change found by the detector.
#[derive(Debug, Clone)]
pub enum DetectedChange {
    /// A scalar property differs from its original value.
    PropertyModified {
        /// Property index.
        property: usize,
    },
    /// A foreign-key property differs from its relationship snapshot.
    ForeignKeyChanged {
        /// Property index.
        property: usize,
        /// Snapshot value.
        old: Value,
        /// Current value.
        new: Value,
    },
    /// A primary or principal key property differs from its relationship snapshot.
    PrincipalKeyChanged {
        /// Property index.
        property: usize,
        /// Snapshot value.
        old: Value,
        /// Current value.
        new: Value,
    },
    /// A reference navigation points at a different object.
    NavigationReferenceChanged {
        /// Navigation index.
        navigation: usize,
        /// Previously referenced object.
        old: Option<EntityRef>,
        /// Currently referenced object.
        new: Option<EntityRef>,
    },
    /// A collection navigation gained or lost members.
    NavigationCollectionChanged {
        /// Navigation index.
        navigation: usize,
        /// Members not in the snapshot.
        added: Vec<EntityRef>,
        /// Snapshot members no longer present.
        removed: Vec<EntityRef>,
    },
}

/// Everything the detector found for one entry.
#[derive(Debug, Clone)]
pub struct ChangeReport {
    /// The inspected entry.
    pub entry: EntryId,
    /// Changes in detection order.
    pub changes: Vec<DetectedChange>,
    /// The primary key before a key property changed, if one did.
    pub previous_primary_key: Option<EntityKey>,
}

impl ChangeReport {
    /// An empty report for `entry`.
    #[must_use]
    pub fn new(entry: EntryId) -> Self {
        Self {
            entry,
            changes: Vec::new(),
            previous_primary_key: None,
        }
    }

    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Compares entries against their snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector;

impl ChangeDetector {
    /// Creates a change detector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Handles "property changing": captures the original value lazily.
    ///
    /// Entries with an eager OriginalValues snapshot are left alone.
    /// `previous` is the value about to be replaced when the caller knows it.
    pub fn property_changing(&self, entry: &mut Entry, property: &Property, previous: Option<Value>) {
        if entry.has_eager_original_values() {
            return;
        }
        let value = previous.unwrap_or_else(|| entry.property_value(property));
        if entry.sidecar(&SidecarName::OriginalValues).is_none() {
            entry.add_sidecar(Sidecar::original_values(entry.entity_type()));
        }
        if let Some(originals) = entry.sidecar_mut(&SidecarName::OriginalValues) {
            originals.ensure_value(property, value);
        }
    }

    /// Handles "property changed" for one scalar property.
    pub fn property_changed(&self, entry: &mut Entry, property: &Property) -> ChangeReport {
        let mut report = ChangeReport::new(entry.id());
        detect_property_change(entry, property, &mut report);
        detect_key_change(entry, property, &mut report);
        report
    }

    /// Handles "property changed" for one navigation.
    pub fn navigation_changed(&self, entry: &mut Entry, navigation: &Navigation) -> ChangeReport {
        let mut report = ChangeReport::new(entry.id());
        detect_navigation_change(entry, navigation, &mut report);
        report
    }

    /// Scans every property and navigation of `entry`.
    ///
    /// Scalar properties and reference navigations of notifying entities
    /// are skipped; their changes arrive as notifications. Collections are
    /// always diffed.
    pub fn detect_changes(&self, entry: &mut Entry) -> ChangeReport {
        let mut report = ChangeReport::new(entry.id());
        let entity_type = std::sync::Arc::clone(entry.entity_type());
        let scan_all = !entry.is_notifying();

        if scan_all {
            for property in entity_type.properties() {
                detect_property_change(entry, property, &mut report);
                detect_key_change(entry, property, &mut report);
            }
        }
        for navigation in entity_type.navigations() {
            if scan_all || navigation.is_collection() {
                detect_navigation_change(entry, navigation, &mut report);
            }
        }

        if !report.is_empty() {
            trace!(
                entry = %entry.id(),
                entity_type = entity_type.name(),
                changes = report.changes.len(),
                "detected changes"
            );
        }
        report
    }
}

fn detect_property_change(entry: &Entry, property: &Property, report: &mut ChangeReport) {
    if !entry.state().tracks_modifications()
        || property.value_generation() == ValueGeneration::OnAddAndUpdate
        || entry.is_property_modified(property)
    {
        return;
    }
    let current = entry.property_value(property);
    let changed = match entry
        .sidecar(&SidecarName::OriginalValues)
        .and_then(|s| s.value(property))
    {
        Some(original) => *original != current,
        // Lazily snapshotted entries without a snapshot cannot prove the value unchanged.
        None => !entry.has_eager_original_values(),
    };
    if changed {
        report.changes.push(DetectedChange::PropertyModified {
            property: property.index(),
        });
    }
}

fn detect_key_change(entry: &mut Entry, property: &Property, report: &mut ChangeReport) {
    if !property.is_key_or_foreign_key() {
        return;
    }
    let current = entry.property_value(property);
    let Some(old) = entry
        .sidecar(&SidecarName::RelationshipsSnapshot)
        .and_then(|s| s.value(property))
        .cloned()
    else {
        return;
    };
    if old.structurally_equals(&current) {
        return;
    }

    if property.is_primary_key() && report.previous_primary_key.is_none() {
        report.previous_primary_key = Some(snapshot_primary_key(entry));
    }
    if property.is_foreign_key() {
        report.changes.push(DetectedChange::ForeignKeyChanged {
            property: property.index(),
            old: old.clone(),
            new: current.clone(),
        });
    }
    if property.is_primary_key() || property.is_principal_key() {
        report.changes.push(DetectedChange::PrincipalKeyChanged {
            property: property.index(),
            old,
            new: current.clone(),
        });
    }
    if let Some(snapshot) = entry.sidecar_mut(&SidecarName::RelationshipsSnapshot) {
        snapshot.set_value(property, current);
    }
}

/// The primary key as recorded in the relationship snapshot.
fn snapshot_primary_key(entry: &Entry) -> EntityKey {
    let entity_type = entry.entity_type();
    let snapshot = entry.sidecar(&SidecarName::RelationshipsSnapshot);
    let values = entity_type
        .primary_key_properties()
        .map(|p| {
            snapshot
                .and_then(|s| s.value(p))
                .cloned()
                .unwrap_or_else(|| entry.property_value(p))
        })
        .collect();
    EntityKey::new(entity_type.name(), values)
}

fn detect_navigation_change(entry: &mut Entry, navigation: &Navigation, report: &mut ChangeReport) {
    let current = entry.navigation_value(navigation);
    let snapshot = entry
        .sidecar(&SidecarName::RelationshipsSnapshot)
        .and_then(|s| s.navigation(navigation))
        .cloned()
        .unwrap_or_else(|| NavigationValue::empty(navigation));

    let change = if navigation.is_collection() {
        let (added, removed) = diff_collections(snapshot.as_collection(), current.as_collection());
        (!added.is_empty() || !removed.is_empty()).then_some(
            DetectedChange::NavigationCollectionChanged {
                navigation: navigation.index(),
                added,
                removed,
            },
        )
    } else {
        (!current.same_as(&snapshot)).then(|| DetectedChange::NavigationReferenceChanged {
            navigation: navigation.index(),
            old: snapshot.as_reference().cloned(),
            new: current.as_reference().cloned(),
        })
    };

    if let Some(change) = change {
        report.changes.push(change);
        if let Some(snapshot) = entry.sidecar_mut(&SidecarName::RelationshipsSnapshot) {
            snapshot.set_navigation(navigation, current);
        }
    }
}

/// Set difference by reference identity: `(added, removed)`.
fn diff_collections(before: &[EntityRef], after: &[EntityRef]) -> (Vec<EntityRef>, Vec<EntityRef>) {
    let before_ids: HashSet<ObjectId> = before.iter().map(ObjectId::of).collect();
    let after_ids: HashSet<ObjectId> = after.iter().map(ObjectId::of).collect();

    let mut seen = HashSet::new();
    let added = after
        .iter()
        .filter(|e| !before_ids.contains(&ObjectId::of(e)) && seen.insert(ObjectId::of(e)))
        .cloned()
        .collect();
    seen.clear();
    let removed = before
        .iter()
        .filter(|e| !after_ids.contains(&ObjectId::of(e)) && seen.insert(ObjectId::of(e)))
        .cloned()
        .collect();
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::entity::{DynamicEntity, DynamicMaterializer};
    use crate::entry::{EntityState, EntryFactory, EntrySubscriber};
    use crate::metadata::{EntityTypeDef, ForeignKeyDef, Model, NavigationDef, PropertyDef};
    use crate::notify::NotificationQueue;
    use crate::value::ValueKind;
    use std::sync::Arc;

    fn model() -> Model {
        Model::builder()
            .entity_type(
                EntityTypeDef::new("Category")
                    .property(PropertyDef::new("Id", ValueKind::Integer))
                    .property(PropertyDef::new("Name", ValueKind::Text).nullable())
                    .navigation(NavigationDef::collection("Products", "Product"))
                    .key(["Id"]),
            )
            .entity_type(
                EntityTypeDef::new("Product")
                    .property(PropertyDef::new("Id", ValueKind::Integer))
                    .property(PropertyDef::new("CategoryId", ValueKind::Integer))
                    .property(
                        PropertyDef::new("Stamp", ValueKind::Integer)
                            .generated(ValueGeneration::OnAddAndUpdate),
                    )
                    .foreign_key(ForeignKeyDef::new(["CategoryId"], "Category"))
                    .navigation(NavigationDef::reference("Category", "Category"))
                    .key(["Id"]),
            )
            .build()
            .unwrap()
    }

    fn object(model: &Model, type_name: &str) -> DynamicEntity {
        DynamicEntity::new(model.entity_type(type_name).unwrap())
    }

    fn tracked(model: &Model, entity: &Arc<DynamicEntity>, state: EntityState) -> Entry {
        use crate::entity::Entity;
        let entity_type = model.entity_type(entity.type_name()).unwrap();
        let factory = EntryFactory::new(Arc::new(DynamicMaterializer::new()));
        let mut entry = factory
            .create_for_entity(EntryId::new(1, 0), entity_type, entity.clone())
            .unwrap();
        let queue = NotificationQueue::new();
        let sink = queue.sink(entry.id());
        EntrySubscriber::new(&TrackerConfig::default()).snapshot_and_subscribe(&mut entry, sink);
        entry.set_state_field(state);
        entry
    }

    #[test]
    fn detects_scalar_property_change() {
        let model = model();
        let category = Arc::new(object(&model, "Category").with("Id", 1).with("Name", "Beverages"));
        let mut entry = tracked(&model, &category, EntityState::Unchanged);

        assert!(ChangeDetector.detect_changes(&mut entry).is_empty());

        category.set("Name", "Drinks");
        let report = ChangeDetector.detect_changes(&mut entry);
        assert!(matches!(
            report.changes.as_slice(),
            [DetectedChange::PropertyModified { property: 1 }]
        ));
    }

    #[test]
    fn ignores_changes_outside_tracking_states() {
        let model = model();
        let category = Arc::new(object(&model, "Category").with("Id", 1));
        let mut entry = tracked(&model, &category, EntityState::Added);

        category.set("Name", "Drinks");
        assert!(ChangeDetector.detect_changes(&mut entry).is_empty());
    }

    #[test]
    fn computed_properties_are_never_flagged() {
        let model = model();
        let product = Arc::new(object(&model, "Product").with("Id", 1));
        let mut entry = tracked(&model, &product, EntityState::Unchanged);

        product.set("Stamp", 9);
        assert!(ChangeDetector.detect_changes(&mut entry).is_empty());
    }

    #[test]
    fn foreign_key_change_refreshes_snapshot() {
        let model = model();
        let product = Arc::new(object(&model, "Product").with("Id", 1).with("CategoryId", 77));
        let mut entry = tracked(&model, &product, EntityState::Unchanged);

        product.set("CategoryId", 78);
        let report = ChangeDetector.detect_changes(&mut entry);
        assert!(report.changes.iter().any(|c| matches!(
            c,
            DetectedChange::ForeignKeyChanged {
                old: Value::Integer(77),
                new: Value::Integer(78),
                ..
            }
        )));

        let again = ChangeDetector.detect_changes(&mut entry);
        assert!(!again
            .changes
            .iter()
            .any(|c| matches!(c, DetectedChange::ForeignKeyChanged { .. })));
    }

    #[test]
    fn primary_key_change_reports_previous_key() {
        let model = model();
        let category = Arc::new(object(&model, "Category").with("Id", -1));
        let mut entry = tracked(&model, &category, EntityState::Unchanged);

        category.set("Id", 42);
        let report = ChangeDetector.detect_changes(&mut entry);

        assert_eq!(
            report.previous_primary_key,
            Some(EntityKey::new("Category", vec![Value::Integer(-1)]))
        );
        assert!(report
            .changes
            .iter()
            .any(|c| matches!(c, DetectedChange::PrincipalKeyChanged { property: 0, .. })));
    }

    #[test]
    fn equal_bytes_are_not_a_key_change() {
        let model = Model::builder()
            .entity_type(
                EntityTypeDef::new("Blob")
                    .property(PropertyDef::new("Hash", ValueKind::Bytes))
                    .key(["Hash"]),
            )
            .build()
            .unwrap();
        let blob = Arc::new(object(&model, "Blob").with("Hash", vec![1u8, 2, 3]));
        let mut entry = tracked(&model, &blob, EntityState::Unchanged);

        blob.set("Hash", vec![1u8, 2, 3]);
        assert!(ChangeDetector.detect_changes(&mut entry).is_empty());
    }

    #[test]
    fn reference_navigation_change() {
        let model = model();
        let first: EntityRef = Arc::new(object(&model, "Category").with("Id", 1));
        let second: EntityRef = Arc::new(object(&model, "Category").with("Id", 2));
        let product = Arc::new(object(&model, "Product").with("Id", 1));
        product.set_reference("Category", Some(first.clone()));
        let mut entry = tracked(&model, &product, EntityState::Unchanged);

        product.set_reference("Category", Some(second.clone()));
        let report = ChangeDetector.detect_changes(&mut entry);
        match report.changes.as_slice() {
            [DetectedChange::NavigationReferenceChanged { old, new, .. }] => {
                assert_eq!(old.as_ref().map(ObjectId::of), Some(ObjectId::of(&first)));
                assert_eq!(new.as_ref().map(ObjectId::of), Some(ObjectId::of(&second)));
            }
            other => panic!("unexpected changes: {other:?}"),
        }
        assert!(ChangeDetector.detect_changes(&mut entry).is_empty());
    }

    #[test]
    fn collection_diff_by_reference_identity() {
        let model = model();
        let a: EntityRef = Arc::new(object(&model, "Product").with("Id", 1));
        let b: EntityRef = Arc::new(object(&model, "Product").with("Id", 2));
        let c: EntityRef = Arc::new(object(&model, "Product").with("Id", 3));
        let a_twin: EntityRef = Arc::new(object(&model, "Product").with("Id", 1));

        let category = Arc::new(object(&model, "Category").with("Id", 1));
        category.add_to("Products", a.clone());
        category.add_to("Products", b);
        let mut entry = tracked(&model, &category, EntityState::Unchanged);

        category.remove_from("Products", &a);
        category.add_to("Products", c.clone());
        category.add_to("Products", a_twin.clone());

        let report = ChangeDetector.detect_changes(&mut entry);
        match report.changes.as_slice() {
            [DetectedChange::NavigationCollectionChanged { added, removed, .. }] => {
                let added: HashSet<ObjectId> = added.iter().map(ObjectId::of).collect();
                let expected: HashSet<ObjectId> =
                    [ObjectId::of(&c), ObjectId::of(&a_twin)].into_iter().collect();
                assert_eq!(added, expected);
                assert_eq!(removed.len(), 1);
                assert_eq!(ObjectId::of(&removed[0]), ObjectId::of(&a));
            }
            other => panic!("unexpected changes: {other:?}"),
        }
        assert!(ChangeDetector.detect_changes(&mut entry).is_empty());
    }

    #[test]
    fn remove_then_add_same_object_is_no_change() {
        let model = model();
        let product: EntityRef = Arc::new(object(&model, "Product"));
        let category = Arc::new(object(&model, "Category").with("Id", 1));
        category.add_to("Products", product.clone());
        let mut entry = tracked(&model, &category, EntityState::Unchanged);

        category.remove_from("Products", &product);
        category.add_to("Products", product);
        assert!(ChangeDetector.detect_changes(&mut entry).is_empty());
    }

    #[test]
    fn notifying_entities_only_diff_collections() {
        let model = model();
        let category = Arc::new(
            DynamicEntity::notifying(model.entity_type("Category").unwrap()).with("Id", 1),
        );
        let mut entry = tracked(&model, &category, EntityState::Unchanged);
        assert!(entry.is_notifying());

        category.set("Name", "Drinks");
        category.add_to("Products", Arc::new(object(&model, "Product")));

        let report = ChangeDetector.detect_changes(&mut entry);
        assert!(matches!(
            report.changes.as_slice(),
            [DetectedChange::NavigationCollectionChanged { .. }]
        ));
    }

    #[test]
    fn lazy_snapshot_keeps_first_original() {
        let model = model();
        let category = Arc::new(DynamicEntity::notifying(model.entity_type("Category").unwrap()));
        let mut entry = tracked(&model, &category, EntityState::Unchanged);
        let name = entry.entity_type().property("Name").unwrap().clone();

        ChangeDetector.property_changing(&mut entry, &name, Some(Value::from("first")));
        ChangeDetector.property_changing(&mut entry, &name, Some(Value::from("second")));
        assert_eq!(entry.original_value(&name), Value::from("first"));

        let report = ChangeDetector.property_changed(&mut entry, &name);
        assert!(matches!(
            report.changes.as_slice(),
            [DetectedChange::PropertyModified { .. }]
        ));
    }
}
