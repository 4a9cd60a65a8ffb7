//! Service configuration and JSON sequencer definitions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::ConfigurationError;
use crate::queue::OverflowPolicy;
use crate::sequencer::{Sequencer, SequencerConfig};
use crate::value::PropertyValue;

/// Runtime configuration for a `SequencingService`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Fixed number of worker threads.
    pub worker_count: usize,
    /// Maximum number of queued jobs.
    pub queue_capacity: usize,
    /// Behavior of enqueue when the queue is full.
    pub overflow: OverflowPolicy,
    /// Per-subscriber outcome buffer.
    pub outcome_stream_capacity: usize,
    pub sequencers: Vec<SequencerDefinition>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 1024,
            overflow: OverflowPolicy::Skip,
            outcome_stream_capacity: 1024,
            sequencers: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigurationError::Unreadable {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigurationError::Unreadable {
            message: format!("{}: {e}", path.display()),
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.worker_count == 0 {
            return Err(invalid("worker_count", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be at least 1"));
        }
        if self.outcome_stream_capacity == 0 {
            return Err(invalid("outcome_stream_capacity", "must be at least 1"));
        }

        let mut names = HashSet::with_capacity(self.sequencers.len());
        for def in &self.sequencers {
            if !names.insert(def.name.as_str()) {
                return Err(ConfigurationError::DuplicateSequencer {
                    name: def.name.clone(),
                });
            }
        }
        Ok(())
    }
}

fn invalid(setting: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidSetting {
        setting: setting.to_string(),
        reason: reason.to_string(),
    }
}

/// A sequencer as declared in configuration.
///
/// `sequencer` names an entry in a [`SequencerCatalog`]. Property values may
/// be plain JSON scalars, arrays of strings, or the tagged form
/// `{"type": "date", "value": "..."}`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencerDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub path_expressions: Vec<String>,
    pub sequencer: String,
    #[serde(default)]
    pub properties: BTreeMap<String, JsonValue>,
}

/// Named sequencer implementations that definitions can refer to.
#[derive(Default, Clone)]
pub struct SequencerCatalog {
    entries: HashMap<String, Arc<dyn Sequencer>>,
}

impl SequencerCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) an implementation under `reference`.
    #[must_use]
    pub fn with(mut self, reference: impl Into<String>, sequencer: impl Sequencer + 'static) -> Self {
        self.insert(reference, sequencer);
        self
    }

    pub fn insert(&mut self, reference: impl Into<String>, sequencer: impl Sequencer + 'static) {
        self.entries.insert(reference.into(), Arc::new(sequencer));
    }

    #[must_use]
    pub fn get(&self, reference: &str) -> Option<Arc<dyn Sequencer>> {
        self.entries.get(reference).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Builds a registrable configuration from a definition.
    pub fn resolve(&self, def: &SequencerDefinition) -> Result<SequencerConfig, ConfigurationError> {
        let sequencer = self
            .get(&def.sequencer)
            .ok_or_else(|| ConfigurationError::UnknownSequencerLogic {
                reference: def.sequencer.clone(),
            })?;

        let mut builder = SequencerConfig::builder(def.name.clone())
            .description(def.description.clone())
            .path_expressions(def.path_expressions.iter().cloned())
            .shared_sequencer(def.sequencer.clone(), sequencer);
        for (key, value) in &def.properties {
            builder = builder.property(key.clone(), property_value(key, value)?);
        }
        builder.build()
    }
}

impl fmt::Debug for SequencerCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("SequencerCatalog").field("entries", &names).finish()
    }
}

fn property_value(key: &str, value: &JsonValue) -> Result<PropertyValue, ConfigurationError> {
    let unsupported = |reason: &str| ConfigurationError::InvalidSetting {
        setting: format!("properties.{key}"),
        reason: reason.to_string(),
    };

    match value {
        JsonValue::Bool(b) => Ok(PropertyValue::Boolean(*b)),
        JsonValue::Number(n) => n
            .as_i64()
            .map(PropertyValue::Long)
            .or_else(|| n.as_f64().map(PropertyValue::Double))
            .ok_or_else(|| unsupported("number out of range")),
        JsonValue::String(s) => Ok(PropertyValue::String(s.clone())),
        JsonValue::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .map(PropertyValue::Strings)
            .ok_or_else(|| unsupported("arrays may only contain strings")),
        JsonValue::Object(_) => {
            serde_json::from_value(value.clone()).map_err(|e| unsupported(&e.to_string()))
        }
        JsonValue::Null => Err(unsupported("null is not a property value")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::sequencer::from_fn;

    #[test]
    fn defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.overflow, OverflowPolicy::Skip);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config = ServiceConfig::from_json_str(r#"{"worker_count": 2}"#).unwrap();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.queue_capacity, 1024);
        assert!(config.sequencers.is_empty());
    }

    #[test]
    fn block_policy_parses() {
        let config =
            ServiceConfig::from_json_str(r#"{"overflow": {"policy": "block", "enqueue_timeout_ms": 250}}"#).unwrap();
        assert_eq!(config.overflow, OverflowPolicy::Block { timeout_ms: 250 });
    }

    #[test]
    fn zero_settings_are_rejected() {
        for json in [
            r#"{"worker_count": 0}"#,
            r#"{"queue_capacity": 0}"#,
            r#"{"outcome_stream_capacity": 0}"#,
        ] {
            let err = ServiceConfig::from_json_str(json).unwrap_err();
            assert!(matches!(err, ConfigurationError::InvalidSetting { .. }), "{json}");
        }
    }

    #[test]
    fn malformed_json_is_unreadable() {
        let err = ServiceConfig::from_json_str("{").unwrap_err();
        assert!(matches!(err, ConfigurationError::Unreadable { .. }));
    }

    #[test]
    fn duplicate_definitions_are_rejected() {
        let json = r#"{"sequencers": [
            {"name": "a", "path_expressions": ["/a"], "sequencer": "x"},
            {"name": "a", "path_expressions": ["/b"], "sequencer": "x"}
        ]}"#;
        let err = ServiceConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateSequencer { .. }));
    }

    #[test]
    fn resolve_converts_properties() {
        let catalog = SequencerCatalog::new().with("noop", from_fn(|_ctx| Ok(())));
        let def: SequencerDefinition = serde_json::from_str(
            r#"{
                "name": "images",
                "description": "image metadata",
                "path_expressions": ["/images/*@data"],
                "sequencer": "noop",
                "properties": {
                    "enabled": true,
                    "max_size": 4096,
                    "ratio": 0.5,
                    "format": "png",
                    "formats": ["png", "jpg"],
                    "since": {"type": "date", "value": "2024-01-01T00:00:00Z"}
                }
            }"#,
        )
        .unwrap();

        let config = catalog.resolve(&def).unwrap();
        let props = config.properties();
        assert_eq!(props["enabled"], PropertyValue::Boolean(true));
        assert_eq!(props["max_size"], PropertyValue::Long(4096));
        assert_eq!(props["ratio"], PropertyValue::Double(0.5));
        assert_eq!(props["format"], PropertyValue::from("png"));
        assert_eq!(props["formats"].as_strings().unwrap().len(), 2);
        assert_eq!(props["since"].type_name(), "date");
        assert_eq!(config.logic(), "noop");
    }

    #[test]
    fn resolve_reports_unknown_logic_and_bad_values() {
        let catalog = SequencerCatalog::new().with("noop", from_fn(|_ctx| Ok(())));
        let mut def = SequencerDefinition {
            name: "a".to_string(),
            description: String::new(),
            path_expressions: vec!["/a".to_string()],
            sequencer: "missing".to_string(),
            properties: BTreeMap::new(),
        };
        assert!(matches!(
            catalog.resolve(&def),
            Err(ConfigurationError::UnknownSequencerLogic { .. })
        ));

        def.sequencer = "noop".to_string();
        def.properties.insert("mixed".to_string(), serde_json::json!(["a", 1]));
        assert!(matches!(
            catalog.resolve(&def),
            Err(ConfigurationError::InvalidSetting { setting, .. }) if setting == "properties.mixed"
        ));
    }
}
