//! Entity identity keys.

use crate::value::Value;
use std::fmt;
use std::slice;
use std::sync::Arc;

/// The identity of a row: an entity type plus its ordered key values.
///
/// Keys compare structurally, so two keys built from distinct buffers holding
/// the same bytes are equal. A key with any null part collapses into
/// [`EntityKey::Null`], which the identity map treats as never present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    /// An unresolved identity.
    Null,
    /// A single-property key.
    Simple {
        /// Entity type name.
        entity_type: Arc<str>,
        /// Key value.
        value: Value,
    },
    /// A multi-property key.
    Composite {
        /// Entity type name.
        entity_type: Arc<str>,
        /// Key values in key order.
        values: Vec<Value>,
    },
}

impl EntityKey {
    /// Creates a key for `entity_type` from ordered key values.
    ///
    /// Returns [`EntityKey::Null`] if `values` is empty or holds a null.
    pub fn new(entity_type: impl Into<Arc<str>>, mut values: Vec<Value>) -> Self {
        if values.is_empty() || values.iter().any(Value::is_null) {
            return EntityKey::Null;
        }
        let entity_type = entity_type.into();
        if values.len() == 1 {
            EntityKey::Simple {
                entity_type,
                value: values.remove(0),
            }
        } else {
            EntityKey::Composite {
                entity_type,
                values,
            }
        }
    }

    /// Returns true for the distinguished null key.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, EntityKey::Null)
    }

    /// Returns the entity type name, or `None` for the null key.
    #[must_use]
    pub fn entity_type(&self) -> Option<&str> {
        match self {
            EntityKey::Null => None,
            EntityKey::Simple { entity_type, .. } | EntityKey::Composite { entity_type, .. } => {
                Some(entity_type)
            }
        }
    }

    /// Returns the key values in key order. Empty for the null key.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        match self {
            EntityKey::Null => &[],
            EntityKey::Simple { value, .. } => slice::from_ref(value),
            EntityKey::Composite { values, .. } => values,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Null => f.write_str("{null}"),
            EntityKey::Simple { value, .. } => write!(f, "{{{value}}}"),
            EntityKey::Composite { values, .. } => {
                f.write_str("{")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("}")
            }
        }
    }
}
