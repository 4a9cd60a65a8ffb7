//! Sequencer logic and its immutable registration record.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::ExecutionContext;
use crate::error::{ConfigurationError, ExecutionError};
use crate::event::ChangeEvent;
use crate::path::{PathExpression, PathMatch};
use crate::value::PropertyValue;

/// Failure reported by sequencer logic.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SequencerError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SequencerError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(message: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ExecutionError> for SequencerError {
    fn from(err: ExecutionError) -> Self {
        Self {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Pluggable derivation logic.
///
/// Implementations read the changed content and write derived content through
/// the `ExecutionContext`. They never commit; the pipeline commits after a
/// successful return and rolls back otherwise.
pub trait Sequencer: Send + Sync {
    /// Processes one change.
    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), SequencerError>;
}

/// Sequencer backed by a closure. See [`from_fn`].
pub struct FnSequencer<F>(F);

impl<F> Sequencer for FnSequencer<F>
where
    F: Fn(&mut ExecutionContext<'_>) -> Result<(), SequencerError> + Send + Sync,
{
    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), SequencerError> {
        (self.0)(ctx)
    }
}

/// Wraps a closure as a `Sequencer`.
pub fn from_fn<F>(f: F) -> FnSequencer<F>
where
    F: Fn(&mut ExecutionContext<'_>) -> Result<(), SequencerError> + Send + Sync,
{
    FnSequencer(f)
}

/// Name and description of a registered sequencer.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerSummary {
    pub name: String,
    pub description: String,
}

/// One entry of a sequencer's explicit field listing.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    pub name: String,
    pub value: String,
}

/// Immutable registration of a sequencer with its rules and properties.
pub struct SequencerConfig {
    name: String,
    description: String,
    expressions: Vec<PathExpression>,
    logic: String,
    sequencer: Arc<dyn Sequencer>,
    properties: BTreeMap<String, PropertyValue>,
}

impl SequencerConfig {
    /// Creates a builder.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> SequencerConfigBuilder {
        SequencerConfigBuilder::new(name)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn path_expressions(&self) -> &[PathExpression] {
        &self.expressions
    }

    /// Reference naming the sequencer logic (e.g. a catalog key).
    #[must_use]
    pub fn logic(&self) -> &str {
        &self.logic
    }

    #[must_use]
    pub fn sequencer(&self) -> &dyn Sequencer {
        self.sequencer.as_ref()
    }

    #[must_use]
    pub const fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }

    /// Evaluates the rules in declaration order; the first match wins.
    #[must_use]
    pub fn find_match(&self, event: &ChangeEvent) -> Option<PathMatch> {
        self.expressions
            .iter()
            .find_map(|e| e.matches(event.workspace(), event.path(), event.property()))
    }

    #[must_use]
    pub fn summary(&self) -> SequencerSummary {
        SequencerSummary {
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }

    /// Explicit, typed listing of this configuration's fields.
    ///
    /// `name` and `description` come first, then one `path_expressions.<i>`
    /// entry per rule in declaration order, then `sequencer`, then one
    /// `properties.<key>` entry per configuration property in key order.
    #[must_use]
    pub fn fields(&self) -> Vec<ConfigField> {
        let mut fields = vec![
            ConfigField {
                name: "name".to_string(),
                value: self.name.clone(),
            },
            ConfigField {
                name: "description".to_string(),
                value: self.description.clone(),
            },
        ];
        fields.extend(self.expressions.iter().enumerate().map(|(i, e)| ConfigField {
            name: format!("path_expressions.{i}"),
            value: e.as_str().to_string(),
        }));
        fields.push(ConfigField {
            name: "sequencer".to_string(),
            value: self.logic.clone(),
        });
        fields.extend(self.properties.iter().map(|(k, v)| ConfigField {
            name: format!("properties.{k}"),
            value: v.to_string(),
        }));
        fields
    }
}

impl fmt::Debug for SequencerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequencerConfig")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("expressions", &self.expressions)
            .field("logic", &self.logic)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

/// Builder for [`SequencerConfig`]. Expressions are parsed in `build`, so a
/// malformed rule never reaches the registry.
pub struct SequencerConfigBuilder {
    name: String,
    description: String,
    expressions: Vec<String>,
    logic: Option<(String, Arc<dyn Sequencer>)>,
    properties: BTreeMap<String, PropertyValue>,
}

impl SequencerConfigBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            expressions: Vec::new(),
            logic: None,
            properties: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn path_expression(mut self, expression: impl Into<String>) -> Self {
        self.expressions.push(expression.into());
        self
    }

    #[must_use]
    pub fn path_expressions<I, S>(mut self, expressions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expressions.extend(expressions.into_iter().map(Into::into));
        self
    }

    /// Sets the sequencer logic together with the reference it is known by.
    #[must_use]
    pub fn sequencer(mut self, reference: impl Into<String>, sequencer: impl Sequencer + 'static) -> Self {
        self.logic = Some((reference.into(), Arc::new(sequencer)));
        self
    }

    /// Like [`Self::sequencer`] for logic that is already shared.
    #[must_use]
    pub fn shared_sequencer(mut self, reference: impl Into<String>, sequencer: Arc<dyn Sequencer>) -> Self {
        self.logic = Some((reference.into(), sequencer));
        self
    }

    #[must_use]
    pub fn property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Result<SequencerConfig, ConfigurationError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(ConfigurationError::MissingField {
                field: "name".to_string(),
            });
        }
        if self.expressions.is_empty() {
            return Err(ConfigurationError::MissingField {
                field: "path_expressions".to_string(),
            });
        }
        let (logic, sequencer) = self.logic.ok_or_else(|| ConfigurationError::MissingField {
            field: "sequencer".to_string(),
        })?;

        let expressions = self
            .expressions
            .iter()
            .map(|e| PathExpression::parse(e))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SequencerConfig {
            name,
            description: self.description,
            expressions,
            logic,
            sequencer,
            properties: self.properties,
        })
    }
}
