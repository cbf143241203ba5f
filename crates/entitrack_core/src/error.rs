//! Error types for the change tracker.

use crate::entry::EntryId;
use thiserror::Error;

/// Result type for change-tracking operations.
pub type TrackerResult<T> = Result<T, TrackerError>;

/// Errors that can occur while tracking entities.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// A different entry is already tracked under the same identity key.
    #[error("another instance of entity type '{entity_type}' with key {key} is already being tracked")]
    DuplicateIdentity {
        /// Entity type name.
        entity_type: String,
        /// Rendered key values.
        key: String,
    },

    /// A different entry is already tracked for the same object reference.
    #[error("the entity object of type '{entity_type}' is already tracked by another entry")]
    DuplicateReference {
        /// Entity type name.
        entity_type: String,
    },

    /// The entry was created by a different state manager.
    #[error("entry {entry} belongs to a different state manager")]
    ForeignEntry {
        /// The offending entry.
        entry: EntryId,
    },

    /// No entry with the given id exists in this manager.
    #[error("entry {entry} not found")]
    EntryNotFound {
        /// The missing entry.
        entry: EntryId,
    },

    /// The primary key of an entity could not be resolved to a non-null value.
    #[error("entity of type '{entity_type}' has a null primary key")]
    NullPrimaryKey {
        /// Entity type name.
        entity_type: String,
    },

    /// The property is read-only and cannot be modified.
    #[error("property '{property}' on entity type '{entity_type}' is read-only")]
    PropertyReadOnly {
        /// Property name.
        property: String,
        /// Entity type name.
        entity_type: String,
    },

    /// The entity type is not part of the model.
    #[error("entity type '{name}' is not part of the model")]
    UnknownEntityType {
        /// Entity type name.
        name: String,
    },

    /// The property is not defined on the entity type.
    #[error("property '{name}' is not defined on entity type '{entity_type}'")]
    UnknownProperty {
        /// Entity type name.
        entity_type: String,
        /// Property name.
        name: String,
    },

    /// The navigation is not defined on the entity type.
    #[error("navigation '{name}' is not defined on entity type '{entity_type}'")]
    UnknownNavigation {
        /// Entity type name.
        entity_type: String,
        /// Navigation name.
        name: String,
    },

    /// The model definition is inconsistent.
    #[error("invalid model: {message}")]
    InvalidModel {
        /// Description of the problem.
        message: String,
    },

    /// No value generator is available for a property.
    #[error("no value generator available for property '{property}' on entity type '{entity_type}'")]
    NoValueGenerator {
        /// Property name.
        property: String,
        /// Entity type name.
        entity_type: String,
    },

    /// A value generator failed.
    #[error("value generation failed: {message}")]
    ValueGeneration {
        /// Description of the failure.
        message: String,
    },

    /// The persistence collaborator failed.
    #[error("persistence failed: {message}")]
    Persistence {
        /// Description of the failure.
        message: String,
        /// Whether the save can be retried.
        retryable: bool,
    },

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// JSON model or configuration could not be parsed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrackerError {
    /// Creates an invalid model error.
    pub fn invalid_model(message: impl Into<String>) -> Self {
        Self::InvalidModel {
            message: message.into(),
        }
    }

    /// Creates a value generation error.
    pub fn value_generation(message: impl Into<String>) -> Self {
        Self::ValueGeneration {
            message: message.into(),
        }
    }

    /// Creates a non-retryable persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a retryable persistence error.
    pub fn persistence_retryable(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a read-only property error.
    pub fn read_only(property: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self::PropertyReadOnly {
            property: property.into(),
            entity_type: entity_type.into(),
        }
    }

    /// Returns true if retrying the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TrackerError::Persistence { retryable, .. } => *retryable,
            _ => false,
        }
    }
}
