//! Registry of active sequencer configurations.
//!
//! Readers take an `Arc` snapshot and match against it without holding any
//! lock. Writers build a new list and swap it in under the write lock, so a
//! reader sees either the old list or the new one, never a partial update.

use std::sync::{Arc, RwLock};

use tracing::info;

use crate::error::{lock_err, ConfigurationError, SequencingResult};
use crate::sequencer::SequencerConfig;

/// Immutable view of the registered configurations, in registration order.
pub type RegistrySnapshot = Arc<Vec<Arc<SequencerConfig>>>;

#[allow(missing_docs)]
#[derive(Debug, Default)]
pub struct SequencerRegistry {
    configs: RwLock<RegistrySnapshot>,
}

impl SequencerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a configuration. Fails if the name is already taken.
    pub fn register(&self, config: SequencerConfig) -> SequencingResult<Arc<SequencerConfig>> {
        let mut guard = self.configs.write().map_err(|_| lock_err("registry.register"))?;
        if guard.iter().any(|c| c.name() == config.name()) {
            return Err(ConfigurationError::DuplicateSequencer {
                name: config.name().to_string(),
            }
            .into());
        }

        let config = Arc::new(config);
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(Arc::clone(&config));
        *guard = Arc::new(next);

        info!(sequencer = %config.name(), rules = config.path_expressions().len(), "registered sequencer");
        Ok(config)
    }

    /// Replaces the configuration with the same name wholesale, or registers
    /// it if absent. Returns the previous configuration.
    pub fn replace(&self, config: SequencerConfig) -> SequencingResult<Option<Arc<SequencerConfig>>> {
        let mut guard = self.configs.write().map_err(|_| lock_err("registry.replace"))?;
        let config = Arc::new(config);

        let mut next: Vec<Arc<SequencerConfig>> = guard.iter().cloned().collect();
        let previous = match next.iter().position(|c| c.name() == config.name()) {
            Some(idx) => Some(std::mem::replace(&mut next[idx], Arc::clone(&config))),
            None => {
                next.push(Arc::clone(&config));
                None
            }
        };
        *guard = Arc::new(next);

        info!(sequencer = %config.name(), replaced = previous.is_some(), "reconfigured sequencer");
        Ok(previous)
    }

    /// Removes a configuration. Jobs already queued for it still run.
    pub fn unregister(&self, name: &str) -> SequencingResult<Arc<SequencerConfig>> {
        let mut guard = self.configs.write().map_err(|_| lock_err("registry.unregister"))?;
        let Some(idx) = guard.iter().position(|c| c.name() == name) else {
            return Err(ConfigurationError::UnknownSequencer {
                name: name.to_string(),
            }
            .into());
        };

        let mut next: Vec<Arc<SequencerConfig>> = guard.iter().cloned().collect();
        let removed = next.remove(idx);
        *guard = Arc::new(next);

        info!(sequencer = %name, "unregistered sequencer");
        Ok(removed)
    }

    pub fn snapshot(&self) -> SequencingResult<RegistrySnapshot> {
        let guard = self.configs.read().map_err(|_| lock_err("registry.snapshot"))?;
        Ok(Arc::clone(&*guard))
    }

    pub fn get(&self, name: &str) -> SequencingResult<Option<Arc<SequencerConfig>>> {
        Ok(self.snapshot()?.iter().find(|c| c.name() == name).cloned())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.configs.read().map(|g| g.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::SequencingError;
    use crate::sequencer::from_fn;

    fn config(name: &str, expr: &str) -> SequencerConfig {
        SequencerConfig::builder(name)
            .path_expression(expr)
            .sequencer("noop", from_fn(|_ctx| Ok(())))
            .build()
            .unwrap()
    }

    #[test]
    fn register_rejects_duplicates() {
        let registry = SequencerRegistry::new();
        registry.register(config("A", "/a")).unwrap();
        let err = registry.register(config("A", "/b")).unwrap_err();
        assert!(matches!(
            err,
            SequencingError::Configuration(ConfigurationError::DuplicateSequencer { .. })
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("A").unwrap().unwrap().path_expressions()[0].as_str(),
            "/a"
        );
    }

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let registry = SequencerRegistry::new();
        registry.register(config("A", "/a")).unwrap();
        let before = registry.snapshot().unwrap();

        registry.register(config("B", "/b")).unwrap();
        registry.unregister("A").unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(before[0].name(), "A");
        let after = registry.snapshot().unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].name(), "B");
    }

    #[test]
    fn unregister_unknown_is_an_error() {
        let registry = SequencerRegistry::new();
        let err = registry.unregister("missing").unwrap_err();
        assert!(matches!(
            err,
            SequencingError::Configuration(ConfigurationError::UnknownSequencer { .. })
        ));
    }

    #[test]
    fn replace_swaps_in_place() {
        let registry = SequencerRegistry::new();
        registry.register(config("A", "/a")).unwrap();
        registry.register(config("B", "/b")).unwrap();

        let previous = registry.replace(config("A", "/a2")).unwrap().unwrap();
        assert_eq!(previous.path_expressions()[0].as_str(), "/a");

        let snapshot = registry.snapshot().unwrap();
        let names: Vec<&str> = snapshot.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(snapshot[0].path_expressions()[0].as_str(), "/a2");

        assert!(registry.replace(config("C", "/c")).unwrap().is_none());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn concurrent_readers_see_whole_lists() {
        let registry = Arc::new(SequencerRegistry::new());
        let writer = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for i in 0..200 {
                    registry.register(config(&format!("s{i}"), "/x")).unwrap();
                }
            })
        };

        let mut last = 0;
        while last < 200 {
            let snapshot = registry.snapshot().unwrap();
            assert!(snapshot.len() >= last);
            for (i, c) in snapshot.iter().enumerate() {
                assert_eq!(c.name(), format!("s{i}"));
            }
            last = snapshot.len();
        }
        writer.join().unwrap();
    }
}
