//! # sequencing - Content sequencing pipeline
//!
//! A sequencing service watches mutations on a hierarchical content store and
//! runs pluggable sequencers against the changed data, deriving new content
//! without blocking the mutation that triggered the work.
//!
//! ## Core Concepts
//!
//! - **Sequencer**: pluggable logic that derives content from a changed property
//! - **SequencerConfig**: a named, immutable registration of a sequencer with its path-expression rules
//! - **Path Expression**: a rule such as `/images/**/*.png@data => /derived/$2` selecting the changes a sequencer reacts to
//! - **Job**: one scheduled invocation of a sequencer for one change event
//!
//! ## Pipeline
//!
//! `RawNotification` → `EventSource` → `PathMatcher` (against a registry
//! snapshot) → `DispatchQueue` → worker pool → `ExecutionContext` → statistics
//! and outcome streams. `SequencingService` owns the pipeline and its
//! start/pause/shutdown lifecycle.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sequencing::{from_fn, SequencerConfig, SequencingService};
//!
//! let config = SequencerConfig::builder("thumbnails")
//!     .path_expression("/images/*.png@data => /thumbs/$1")
//!     .sequencer("thumbnailer", from_fn(|ctx| {
//!         let bytes = ctx.input_bytes()?;
//!         let thumb = ctx.store_binary(&bytes[..bytes.len().min(64)])?;
//!         ctx.write_output("thumbnail", thumb)?;
//!         Ok(())
//!     }))
//!     .build()?;
//! service.register(config)?;
//! service.start()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod event;
pub mod path;
pub mod value;

// Configuration and matching
pub mod config;
pub mod matcher;
pub mod registry;
pub mod sequencer;

// Execution
pub mod context;
pub mod job;
pub mod queue;
pub mod runtime;
pub mod service;
pub mod stats;

pub use config::{SequencerCatalog, SequencerDefinition, ServiceConfig};
pub use context::{
    BinaryStore, ContentSession, ContentStore, ExecutionContext, InMemoryBinaryStore, InMemoryContentStore,
};
pub use error::{
    ConfigurationError, ExecutionError, LifecycleError, SequencingError, SequencingResult,
};
pub use event::{ChangeEvent, EventKind, EventSource, RawNotification, SessionHandle};
pub use job::{JobId, JobOutcome, JobState, JobSummary};
pub use matcher::{MatchOutput, MatchedSequencer, PathMatcher};
pub use path::{PathExpression, PathMatch};
pub use queue::{EnqueueOutcome, OverflowPolicy};
pub use registry::{RegistrySnapshot, SequencerRegistry};
pub use runtime::outcome::OutcomeStream;
pub use sequencer::{
    from_fn, ConfigField, FnSequencer, Sequencer, SequencerConfig, SequencerConfigBuilder, SequencerError,
    SequencerSummary,
};
pub use service::{DispatchReport, LifecycleState, SequencingService};
pub use stats::StatisticsSnapshot;
pub use value::{BinaryKey, PropertyValue};
