//! Property-based test generators using proptest.

use entitrack_core::Value;
use proptest::prelude::*;
use uuid::Uuid;

/// Strategy for any value, null included.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        1 => Just(Value::Null),
        1 => any::<bool>().prop_map(Value::Bool),
        3 => any::<i64>().prop_map(Value::Integer),
        3 => "[a-zA-Z0-9 ]{0,16}".prop_map(Value::Text),
        2 => prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
        1 => prop::array::uniform16(any::<u8>()).prop_map(|b| Value::Uuid(Uuid::from_bytes(b))),
    ]
}

/// Strategy for a non-null value usable as a key part.
pub fn key_part_strategy() -> impl Strategy<Value = Value> {
    value_strategy().prop_filter("key parts are not null", |v| !v.is_null())
}

/// Strategy for the values of a composite key with 1 to 3 parts.
pub fn key_values_strategy() -> impl Strategy<Value = Vec<Value>> {
    prop::collection::vec(key_part_strategy(), 1..4)
}

/// Strategy for optional category names.
pub fn name_strategy() -> impl Strategy<Value = Option<String>> {
    prop::option::of("[A-Z][a-z]{0,12}")
}

/// Strategy for a sequence of `Name` writes.
pub fn name_writes_strategy(max: usize) -> impl Strategy<Value = Vec<Option<String>>> {
    prop::collection::vec(name_strategy(), 0..max)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
