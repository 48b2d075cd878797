//! Plain, serde-deserializable configuration surface.
//!
//! Reading these types from a file, environment, or RPC call is left to the
//! embedding application; the dispatcher's bootstrap operates on them directly.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Library staging settings used by a Driver's `deploy_all`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploySettings {
    /// URIs of libraries to stage.
    #[serde(default)]
    pub libs: Vec<String>,
    /// Whether to unpack archives (e.g. `.tar.gz`) after download.
    #[serde(default)]
    pub unpack: bool,
    /// Destination directory for staged libraries.
    #[serde(default)]
    pub location: String,
}

/// Per-transformation-type configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformationTypeConfig {
    /// Number of Workers in this type's Pool. Must be >= 1.
    pub concurrency: usize,
    /// Base unit the backoff wait is sampled from.
    #[serde(with = "humantime_serde")]
    pub backoff_slot_time: Duration,
    /// Floor added to every computed backoff wait.
    #[serde(with = "humantime_serde")]
    pub backoff_minimum_delay: Duration,
    /// Library staging settings for this type's drivers.
    #[serde(default)]
    pub deploy: DeploySettings,
}

/// Top-level dispatcher configuration: the set of known transformation types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Keyed by `type_name`. Unknown types encountered at runtime are a
    /// bootstrap error, never a fallback.
    pub types: HashMap<String, TransformationTypeConfig>,
}

impl DispatcherConfig {
    /// Start building a configuration with no registered types.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transformation type, builder-style.
    pub fn with_type(mut self, type_name: impl Into<String>, config: TransformationTypeConfig) -> Self {
        self.types.insert(type_name.into(), config);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let config = DispatcherConfig::new().with_type(
            "hive",
            TransformationTypeConfig {
                concurrency: 2,
                backoff_slot_time: Duration::from_millis(100),
                backoff_minimum_delay: Duration::from_millis(50),
                deploy: DeploySettings::default(),
            },
        );
        let json = serde_json::to_string(&config).unwrap();
        let back: DispatcherConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.types["hive"].concurrency, 2);
    }
}
