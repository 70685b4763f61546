//! Configuration for the frame buffer

use serde::{Deserialize, Serialize};

use crate::{NAMED_MUTEX_NAME, SHARED_MEMORY_NAME};

/// Names of the shared objects a frame buffer binds to.
///
/// Producers and consumers interoperate only when both use the same pair of
/// names. The defaults are the well-known names every virtual camera
/// consumer looks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameBufferConfig {
    /// Name of the shared memory region
    pub shared_memory_name: String,

    /// Name of the cross-process mutex guarding the region
    pub mutex_name: String,
}

impl Default for FrameBufferConfig {
    fn default() -> Self {
        Self {
            shared_memory_name: SHARED_MEMORY_NAME.to_string(),
            mutex_name: NAMED_MUTEX_NAME.to_string(),
        }
    }
}

impl FrameBufferConfig {
    /// Derive both names from a common prefix, `<prefix>/SharedMemory` and
    /// `<prefix>/NamedMutex`.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            shared_memory_name: format!("{prefix}/SharedMemory"),
            mutex_name: format!("{prefix}/NamedMutex"),
        }
    }

    /// Set the shared memory region name
    #[must_use]
    pub fn with_shared_memory_name(mut self, name: impl Into<String>) -> Self {
        self.shared_memory_name = name.into();
        self
    }

    /// Set the named mutex name
    #[must_use]
    pub fn with_mutex_name(mut self, name: impl Into<String>) -> Self {
        self.mutex_name = name.into();
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_uses_well_known_names() {
        let config = FrameBufferConfig::default();
        assert_eq!(config.shared_memory_name, "DirectShow Softcam/SharedMemory");
        assert_eq!(config.mutex_name, "DirectShow Softcam/NamedMutex");
    }

    #[test]
    fn test_prefix_matches_default_layout() {
        assert_eq!(
            FrameBufferConfig::with_prefix("DirectShow Softcam"),
            FrameBufferConfig::default()
        );
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config: FrameBufferConfig =
            serde_json::from_str(r#"{"mutex_name": "Other/NamedMutex"}"#).unwrap();
        assert_eq!(config.shared_memory_name, SHARED_MEMORY_NAME);
        assert_eq!(config.mutex_name, "Other/NamedMutex");
    }
}
