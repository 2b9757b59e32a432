//! Configuration for the handle runtime.
//!
//! Loaded from JSON (all fields optional) or built in code with the
//! chaining setters.

use crate::error::{HandleError, HandleResult};
use crate::id::MAX_SAFE_HANDLE_ID;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Handle runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HandleConfig {
    /// Highest id a table allocates before compacting.
    /// Default: 2^31 - 1
    pub max_handle_id: u32,

    /// Pause taken before a compaction pass so concurrent disposals can
    /// shrink the live set. Default: 100ms
    pub compaction_pause_ms: u64,

    /// Capacity of the serializing task queue.
    /// Default: 1024
    pub queue_capacity: usize,

    /// How long a producer blocks on a full queue before the task is dropped.
    /// Default: 5000ms
    pub push_timeout_ms: u64,

    /// Log resources that were only disposed because they were dropped.
    /// Default: on in debug builds
    pub leak_detection: bool,

    /// Name of the queue consumer thread.
    pub queue_name: String,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            max_handle_id: MAX_SAFE_HANDLE_ID,
            compaction_pause_ms: 100,
            queue_capacity: 1024,
            push_timeout_ms: 5000,
            leak_detection: cfg!(debug_assertions),
            queue_name: "otter-task-queue".to_string(),
        }
    }
}

impl HandleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document and validate it.
    pub fn from_json_str(json: &str) -> HandleResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file and validate it.
    pub fn from_path(path: impl AsRef<Path>) -> HandleResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> HandleResult<()> {
        if self.max_handle_id == 0 {
            return Err(HandleError::config("maxHandleId must be at least 1"));
        }
        if self.max_handle_id > MAX_SAFE_HANDLE_ID {
            return Err(HandleError::config(format!(
                "maxHandleId {} exceeds {}",
                self.max_handle_id, MAX_SAFE_HANDLE_ID
            )));
        }
        if self.queue_capacity == 0 {
            return Err(HandleError::config("queueCapacity must be at least 1"));
        }
        Ok(())
    }

    pub fn compaction_pause(&self) -> Duration {
        Duration::from_millis(self.compaction_pause_ms)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn max_handle_id(mut self, ceiling: u32) -> Self {
        self.max_handle_id = ceiling;
        self
    }

    pub fn compaction_pause_ms(mut self, ms: u64) -> Self {
        self.compaction_pause_ms = ms;
        self
    }

    /// Set the queue capacity (clamped to at least 1)
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn push_timeout_ms(mut self, ms: u64) -> Self {
        self.push_timeout_ms = ms;
        self
    }

    pub fn leak_detection(mut self, enabled: bool) -> Self {
        self.leak_detection = enabled;
        self
    }

    pub fn queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HandleConfig::default();
        assert_eq!(config.max_handle_id, 2_147_483_647);
        assert_eq!(config.compaction_pause(), Duration::from_millis(100));
        assert_eq!(config.queue_capacity, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = HandleConfig::from_json_str(r#"{ "maxHandleId": 64 }"#).unwrap();
        assert_eq!(config.max_handle_id, 64);
        assert_eq!(config.queue_capacity, 1024);
    }

    #[test]
    fn test_validate_rejects_zero_ceiling() {
        let err = HandleConfig::from_json_str(r#"{ "maxHandleId": 0 }"#).unwrap_err();
        assert!(matches!(err, HandleError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_oversized_ceiling() {
        let config = HandleConfig::default().max_handle_id(u32::MAX);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_min_values() {
        let config = HandleConfig::new().queue_capacity(0);
        assert_eq!(config.queue_capacity, 1);
    }

    #[test]
    fn test_malformed_json() {
        let err = HandleConfig::from_json_str("{ nope").unwrap_err();
        assert!(matches!(err, HandleError::Json(_)));
    }
}
