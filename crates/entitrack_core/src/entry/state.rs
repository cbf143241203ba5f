//! Entity lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a tracked entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EntityState {
    /// Not tracked. Initial state, and the state after detaching.
    #[default]
    Unknown,
    /// New; will be inserted on save.
    Added,
    /// Tracked and identical to the store as far as is known.
    Unchanged,
    /// Tracked with at least one modified property.
    Modified,
    /// Tracked and scheduled for deletion.
    Deleted,
}

impl EntityState {
    /// Returns true for every state except `Unknown`.
    #[must_use]
    pub const fn is_tracked(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Returns true if the entry must be persisted on save.
    #[must_use]
    pub const fn is_dirty(self) -> bool {
        matches!(self, Self::Added | Self::Modified | Self::Deleted)
    }

    /// Returns true if property writes are tracked as modifications.
    #[must_use]
    pub const fn tracks_modifications(self) -> bool {
        matches!(self, Self::Unchanged | Self::Modified)
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::Added => "Added",
            Self::Unchanged => "Unchanged",
            Self::Modified => "Modified",
            Self::Deleted => "Deleted",
        };
        f.write_str(name)
    }
}
