//! Tracker configuration.

use crate::error::TrackerResult;
use serde::{Deserialize, Serialize};

/// Configuration for a state manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Whether `save_changes` scans every tracked entry for changes first.
    pub auto_detect_changes: bool,

    /// Whether notifying entities get a full OriginalValues snapshot up front.
    ///
    /// When off, their original values are captured one property at a time
    /// from "property changing" notifications.
    pub eager_original_values: bool,

    /// Whether property values may appear in log output.
    pub sensitive_data_logging: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            auto_detect_changes: true,
            eager_original_values: false,
            sensitive_data_logging: false,
        }
    }
}

impl TrackerConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> TrackerResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Sets whether `save_changes` detects changes first.
    #[must_use]
    pub const fn auto_detect_changes(mut self, value: bool) -> Self {
        self.auto_detect_changes = value;
        self
    }

    /// Sets whether notifying entities are snapshotted eagerly.
    #[must_use]
    pub const fn eager_original_values(mut self, value: bool) -> Self {
        self.eager_original_values = value;
        self
    }

    /// Sets whether values may be logged.
    #[must_use]
    pub const fn sensitive_data_logging(mut self, value: bool) -> Self {
        self.sensitive_data_logging = value;
        self
    }
}
