//! Observer seam for tracked changes.

use crate::entity::EntityRef;
use crate::entry::{EntityState, Entry};
use crate::metadata::{Navigation, Property};
use crate::value::Value;

/// Receives notifications about tracked entries.
///
/// Every method has an empty default so implementations only override what
/// they react to. Relationship fixup and auditing hook in here.
pub trait EntryListener: Send + Sync {
    /// The entry is about to move to `new_state`.
    fn state_changing(&self, _entry: &Entry, _new_state: EntityState) {}

    /// The entry moved from `old_state` to its current state.
    fn state_changed(&self, _entry: &Entry, _old_state: EntityState) {}

    /// A property of the entry is about to be written.
    fn property_changing(&self, _entry: &Entry, _property: &Property) {}

    /// A property of the entry was written.
    fn property_changed(&self, _entry: &Entry, _property: &Property) {}

    /// A foreign-key property differs from its relationship snapshot.
    fn foreign_key_changed(&self, _entry: &Entry, _property: &Property, _old: &Value, _new: &Value) {}

    /// A primary or principal key property differs from its relationship snapshot.
    fn principal_key_changed(
        &self,
        _entry: &Entry,
        _property: &Property,
        _old: &Value,
        _new: &Value,
    ) {
    }

    /// A reference navigation points at a different object.
    fn navigation_reference_changed(
        &self,
        _entry: &Entry,
        _navigation: &Navigation,
        _old: Option<&EntityRef>,
        _new: Option<&EntityRef>,
    ) {
    }

    /// Objects were added to or removed from a collection navigation.
    fn navigation_collection_changed(
        &self,
        _entry: &Entry,
        _navigation: &Navigation,
        _added: &[EntityRef],
        _removed: &[EntityRef],
    ) {
    }
}
