//! The sequencing service: lifecycle controller and management surface.
//!
//! `notify` is the only entry point on the mutation path. It never blocks
//! beyond the configured overflow wait and never reports sequencing failures
//! back to the caller.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::{SequencerCatalog, SequencerDefinition, ServiceConfig};
use crate::context::{BinaryStore, ContentStore};
use crate::error::{lock_err, ConfigurationError, SequencingResult};
use crate::event::{EventSource, RawNotification};
use crate::job::{Job, JobSummary};
use crate::matcher::PathMatcher;
use crate::queue::{DispatchQueue, EnqueueOutcome};
use crate::registry::SequencerRegistry;
use crate::runtime::outcome::OutcomeStream;
use crate::runtime::pool::WorkerPool;
use crate::runtime::Pipeline;
use crate::sequencer::{ConfigField, SequencerConfig, SequencerSummary};
use crate::stats::StatisticsSnapshot;

/// Lifecycle state of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No events accepted; no workers.
    Stopped,
    /// Events accepted and dispatched.
    Running,
    /// Events accepted and queued; nothing dispatched.
    Paused,
}

impl LifecycleState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Running => 1,
            Self::Paused => 2,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Paused,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// What happened to one notification.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// The notification was dropped before matching (service stopped or
    /// notification malformed).
    pub discarded: bool,
    pub matched: usize,
    pub queued: usize,
    pub skipped: usize,
}

impl DispatchReport {
    const fn discarded() -> Self {
        Self {
            discarded: true,
            matched: 0,
            queued: 0,
            skipped: 0,
        }
    }
}

/// Reacts to content mutations by running matching sequencers on a fixed
/// worker pool.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use sequencing::{
///     from_fn, EventKind, InMemoryBinaryStore, InMemoryContentStore, RawNotification,
///     SequencerConfig, SequencingService, ServiceConfig, SessionHandle,
/// };
///
/// let content = InMemoryContentStore::new();
/// let service = SequencingService::new(
///     ServiceConfig::default(),
///     Arc::new(content.clone()),
///     Arc::new(InMemoryBinaryStore::new()),
/// )
/// .unwrap();
///
/// service
///     .register(
///         SequencerConfig::builder("touch")
///             .path_expression("/docs/*@data")
///             .sequencer("touch", from_fn(|ctx| {
///                 ctx.write_output("sequenced", true)?;
///                 Ok(())
///             }))
///             .build()
///             .unwrap(),
///     )
///     .unwrap();
///
/// let outcomes = service.subscribe().unwrap();
/// service.start().unwrap();
/// let report = service.notify(RawNotification::property(
///     EventKind::Added,
///     "/docs/a",
///     "data",
///     SessionHandle::new("default"),
/// ));
/// assert_eq!(report.queued, 1);
/// outcomes.recv().unwrap();
/// service.shutdown().unwrap();
/// let sequenced = content.property("default", "/docs/a", "sequenced");
/// assert_eq!(sequenced.and_then(|v| v.as_boolean()), Some(true));
/// assert_eq!(service.statistics().nodes_sequenced, 1);
/// ```
pub struct SequencingService {
    config: ServiceConfig,
    registry: SequencerRegistry,
    matcher: PathMatcher,
    source: EventSource,
    pipeline: Arc<Pipeline>,
    state: AtomicU8,
    lifecycle: Mutex<Option<WorkerPool>>,
}

impl SequencingService {
    /// Creates a stopped service. Sequencer definitions in `config` can only
    /// be resolved through a catalog; see [`Self::from_config`].
    pub fn new(
        config: ServiceConfig,
        content: Arc<dyn ContentStore>,
        binaries: Arc<dyn BinaryStore>,
    ) -> SequencingResult<Self> {
        Self::from_config(config, &SequencerCatalog::new(), content, binaries)
    }

    /// Creates a stopped service and registers every definition in `config`.
    pub fn from_config(
        config: ServiceConfig,
        catalog: &SequencerCatalog,
        content: Arc<dyn ContentStore>,
        binaries: Arc<dyn BinaryStore>,
    ) -> SequencingResult<Self> {
        config.validate()?;

        let queue = Arc::new(DispatchQueue::new(config.queue_capacity, config.overflow));
        let pipeline = Arc::new(Pipeline::new(
            queue,
            content,
            binaries,
            config.outcome_stream_capacity,
        ));

        let service = Self {
            config,
            registry: SequencerRegistry::new(),
            matcher: PathMatcher::new(),
            source: EventSource,
            pipeline,
            state: AtomicU8::new(LifecycleState::Stopped.as_u8()),
            lifecycle: Mutex::new(None),
        };
        for def in &service.config.sequencers {
            service.registry.register(catalog.resolve(def)?)?;
        }
        Ok(service)
    }

    #[must_use]
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Registers a sequencer. Allowed in every lifecycle state.
    pub fn register(&self, config: SequencerConfig) -> SequencingResult<Arc<SequencerConfig>> {
        self.registry.register(config)
    }

    pub fn register_definition(
        &self,
        def: &SequencerDefinition,
        catalog: &SequencerCatalog,
    ) -> SequencingResult<Arc<SequencerConfig>> {
        self.registry.register(catalog.resolve(def)?)
    }

    /// Removes a sequencer. Jobs already queued for it still run.
    pub fn unregister(&self, name: &str) -> SequencingResult<Arc<SequencerConfig>> {
        self.registry.unregister(name)
    }

    /// Swaps in a new configuration under the same name. Later events match
    /// against it; queued jobs keep the configuration they were created with.
    pub fn replace(&self, config: SequencerConfig) -> SequencingResult<Option<Arc<SequencerConfig>>> {
        self.registry.replace(config)
    }

    pub fn sequencers(&self) -> SequencingResult<Vec<SequencerSummary>> {
        Ok(self.registry.snapshot()?.iter().map(|c| c.summary()).collect())
    }

    pub fn sequencer(&self, name: &str) -> SequencingResult<Option<Arc<SequencerConfig>>> {
        self.registry.get(name)
    }

    /// Typed field listing of one sequencer's configuration.
    pub fn sequencer_fields(&self, name: &str) -> SequencingResult<Vec<ConfigField>> {
        let config = self.registry.get(name)?.ok_or_else(|| ConfigurationError::UnknownSequencer {
            name: name.to_string(),
        })?;
        Ok(config.fields())
    }

    /// Handles one content-store notification: one job is enqueued for every
    /// matching sequencer.
    pub fn notify(&self, raw: RawNotification) -> DispatchReport {
        if self.state() == LifecycleState::Stopped {
            debug!(path = %raw.path, "service stopped; notification discarded");
            return DispatchReport::discarded();
        }
        let Some(event) = self.source.normalize(raw) else {
            return DispatchReport::discarded();
        };
        let snapshot = match self.registry.snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                error!(path = %event.path(), error = %err, "unable to read sequencer registry");
                return DispatchReport::discarded();
            }
        };

        let matches = self.matcher.match_event(&event, &snapshot);
        let mut report = DispatchReport {
            matched: matches.len(),
            ..DispatchReport::default()
        };

        for matched in matches {
            self.pipeline.stats.record_matched();
            let job = Job::new(Arc::clone(&event), matched.config, matched.output_path);
            let job_id = job.id();
            match self.pipeline.queue.enqueue(job) {
                Ok(EnqueueOutcome::Queued) => {
                    debug!(%job_id, path = %event.path(), "queued sequencing job");
                    report.queued += 1;
                }
                Ok(EnqueueOutcome::Overflow(job)) => {
                    self.pipeline.skipped(job, "dispatch queue is full");
                    report.skipped += 1;
                }
                Ok(EnqueueOutcome::Closed(job)) => {
                    self.pipeline.skipped(job, "service is not accepting jobs");
                    report.skipped += 1;
                }
                Err(err) => {
                    error!(%job_id, path = %event.path(), error = %err, "unable to enqueue sequencing job");
                    self.pipeline.stats.record_skipped();
                    report.skipped += 1;
                }
            }
        }
        report
    }

    /// STOPPED/PAUSED -> RUNNING. The start time is reset only when starting
    /// from STOPPED. Starting a running service is a no-op.
    pub fn start(&self) -> SequencingResult<()> {
        let mut pool = self.lifecycle.lock().map_err(|_| lock_err("service.start"))?;
        match self.state() {
            LifecycleState::Running => Ok(()),
            LifecycleState::Paused => {
                self.pipeline.queue.open()?;
                self.set_state(LifecycleState::Running);
                info!(queued = self.pipeline.queue.size(), "sequencing service resumed");
                Ok(())
            }
            LifecycleState::Stopped => {
                // Workers must exist before dispatch opens.
                self.pipeline.queue.pause()?;
                let workers = WorkerPool::start(self.config.worker_count, &self.pipeline)?;
                if let Err(err) = self.pipeline.queue.open() {
                    self.pipeline.close_queue();
                    workers.join();
                    return Err(err);
                }
                self.pipeline.stats.reset_start_time();
                let size = workers.size();
                *pool = Some(workers);
                self.set_state(LifecycleState::Running);
                info!(workers = size, "sequencing service started");
                Ok(())
            }
        }
    }

    /// RUNNING -> PAUSED. Events keep being queued up to capacity; nothing is
    /// dispatched until `start`. A no-op in any other state.
    pub fn pause(&self) -> SequencingResult<()> {
        let _pool = self.lifecycle.lock().map_err(|_| lock_err("service.pause"))?;
        if self.state() != LifecycleState::Running {
            return Ok(());
        }
        self.pipeline.queue.pause()?;
        self.set_state(LifecycleState::Paused);
        info!("sequencing service paused");
        Ok(())
    }

    /// Any state -> STOPPED.
    ///
    /// New notifications are discarded from the moment this is called. Jobs
    /// still queued are skipped; running jobs finish, and all workers have
    /// exited when this returns.
    pub fn shutdown(&self) -> SequencingResult<()> {
        let mut pool = self.lifecycle.lock().map_err(|_| lock_err("service.shutdown"))?;
        if self.state() == LifecycleState::Stopped {
            return Ok(());
        }
        self.set_state(LifecycleState::Stopped);

        let skipped = self.pipeline.close_queue();
        if let Some(workers) = pool.take() {
            workers.join();
        }
        info!(skipped, "sequencing service shut down");
        Ok(())
    }

    #[must_use]
    pub fn statistics(&self) -> StatisticsSnapshot {
        let stats = &self.pipeline.stats;
        StatisticsSnapshot {
            nodes_sequenced: stats.nodes_sequenced(),
            nodes_skipped: stats.nodes_skipped(),
            jobs_failed: stats.jobs_failed(),
            job_activity: stats.job_activity(),
            jobs_matched: stats.jobs_matched(),
            queued_jobs: self.pipeline.queue.size(),
            running_jobs: self.pipeline.queue.running(),
            start_time: stats.start_time(),
            dropped_outcomes: self.pipeline.outcomes.dropped(),
            workers_replaced: self.pipeline.workers_replaced(),
        }
    }

    /// Current queue depth.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.pipeline.queue.size()
    }

    /// Queued jobs in dispatch order.
    pub fn queued_jobs(&self) -> SequencingResult<Vec<JobSummary>> {
        self.pipeline.queue.queued_jobs()
    }

    pub fn running_jobs(&self) -> SequencingResult<Vec<JobSummary>> {
        self.pipeline.queue.running_jobs()
    }

    /// Subscribes to terminal job outcomes.
    pub fn subscribe(&self) -> SequencingResult<OutcomeStream> {
        self.pipeline.outcomes.subscribe()
    }
}

impl fmt::Debug for SequencingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequencingService")
            .field("state", &self.state())
            .field("config", &self.config)
            .field("sequencers", &self.registry.len())
            .field("queued", &self.pipeline.queue.size())
            .finish_non_exhaustive()
    }
}

impl Drop for SequencingService {
    fn drop(&mut self) {
        if self.shutdown().is_err() {
            // Lifecycle lock poisoned: still release any blocked workers.
            self.pipeline.close_queue();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::context::{InMemoryBinaryStore, InMemoryContentStore};
    use crate::error::SequencingError;
    use crate::event::{EventKind, SessionHandle};
    use crate::job::JobState;
    use crate::queue::OverflowPolicy;
    use crate::sequencer::from_fn;

    fn service(config: ServiceConfig) -> SequencingService {
        SequencingService::new(
            config,
            Arc::new(InMemoryContentStore::new()),
            Arc::new(InMemoryBinaryStore::new()),
        )
        .unwrap()
    }

    fn noop(name: &str, expr: &str) -> SequencerConfig {
        SequencerConfig::builder(name)
            .path_expression(expr)
            .sequencer("noop", from_fn(|_ctx| Ok(())))
            .build()
            .unwrap()
    }

    fn change(path: &str, property: &str) -> RawNotification {
        RawNotification::property(EventKind::Changed, path, property, SessionHandle::new("default"))
    }

    #[test]
    fn stopped_service_discards_notifications() {
        let service = service(ServiceConfig::default());
        service.register(noop("A", "/foo/*@data")).unwrap();

        let report = service.notify(change("/foo/bar", "data"));
        assert!(report.discarded);
        let stats = service.statistics();
        assert_eq!(stats.jobs_matched, 0);
        assert_eq!(stats.nodes_skipped, 0);
    }

    #[test]
    fn match_and_non_match_scenario() {
        let service = service(ServiceConfig::default());
        service.register(noop("A", "/foo/*@data")).unwrap();
        service.start().unwrap();
        service.pause().unwrap();

        let report = service.notify(change("/foo/bar", "data"));
        assert_eq!(report.queued, 1);
        let queued = service.queued_jobs().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].sequencer, "A");

        let report = service.notify(change("/baz", "data"));
        assert_eq!(report, DispatchReport::default());
        let stats = service.statistics();
        assert_eq!(stats.jobs_matched, 1);
        assert_eq!(stats.nodes_skipped, 0);
        assert_eq!(stats.queued_jobs, 1);
    }

    #[test]
    fn overflow_skips_with_count() {
        let service = service(ServiceConfig {
            queue_capacity: 1,
            ..ServiceConfig::default()
        });
        service.register(noop("A", "/**")).unwrap();
        service.start().unwrap();
        service.pause().unwrap();

        assert_eq!(service.notify(change("/a", "p")).queued, 1);
        assert_eq!(service.notify(change("/b", "p")).skipped, 1);
        let stats = service.statistics();
        assert_eq!(stats.nodes_skipped, 1);
        assert_eq!(stats.queued_jobs, 1);
    }

    #[test]
    fn lifecycle_no_ops() {
        let service = service(ServiceConfig::default());
        service.pause().unwrap();
        assert_eq!(service.state(), LifecycleState::Stopped);
        service.shutdown().unwrap();

        service.start().unwrap();
        service.start().unwrap();
        assert_eq!(service.state(), LifecycleState::Running);
        service.pause().unwrap();
        service.pause().unwrap();
        assert_eq!(service.state(), LifecycleState::Paused);
        service.shutdown().unwrap();
        assert_eq!(service.state(), LifecycleState::Stopped);
    }

    #[test]
    fn resume_keeps_start_time_restart_resets_it() {
        let service = service(ServiceConfig::default());
        service.start().unwrap();
        let first = service.statistics().start_time;

        std::thread::sleep(Duration::from_millis(5));
        service.pause().unwrap();
        service.start().unwrap();
        assert_eq!(service.statistics().start_time, first);

        service.shutdown().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        service.start().unwrap();
        assert!(service.statistics().start_time > first);
    }

    #[test]
    fn shutdown_skips_backlog() {
        let service = service(ServiceConfig::default());
        service.register(noop("A", "/**")).unwrap();
        service.start().unwrap();
        service.pause().unwrap();
        for i in 0..3 {
            service.notify(change(&format!("/n{i}"), "p"));
        }
        let outcomes = service.subscribe().unwrap();

        service.shutdown().unwrap();
        let stats = service.statistics();
        assert_eq!(stats.nodes_skipped, 3);
        assert_eq!(stats.queued_jobs, 0);
        assert_eq!(stats.running_jobs, 0);
        for _ in 0..3 {
            assert_eq!(outcomes.recv().unwrap().state, JobState::Skipped);
        }
    }

    #[test]
    fn sequencer_fields_for_unknown_name_is_an_error() {
        let service = service(ServiceConfig::default());
        let err = service.sequencer_fields("missing").unwrap_err();
        assert!(matches!(
            err,
            SequencingError::Configuration(ConfigurationError::UnknownSequencer { .. })
        ));
    }

    #[test]
    fn new_rejects_definitions_without_catalog() {
        let config = ServiceConfig {
            sequencers: vec![SequencerDefinition {
                name: "a".to_string(),
                description: String::new(),
                path_expressions: vec!["/a".to_string()],
                sequencer: "noop".to_string(),
                properties: Default::default(),
            }],
            ..ServiceConfig::default()
        };
        let err = SequencingService::new(
            config,
            Arc::new(InMemoryContentStore::new()),
            Arc::new(InMemoryBinaryStore::new()),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SequencingError::Configuration(ConfigurationError::UnknownSequencerLogic { .. })
        ));
    }

    #[test]
    fn block_policy_applies_through_notify() {
        let service = service(ServiceConfig {
            queue_capacity: 1,
            overflow: OverflowPolicy::Block { timeout_ms: 20 },
            ..ServiceConfig::default()
        });
        service.register(noop("A", "/**")).unwrap();
        service.start().unwrap();
        service.pause().unwrap();

        service.notify(change("/a", "p"));
        let started = std::time::Instant::now();
        let report = service.notify(change("/b", "p"));
        assert_eq!(report.skipped, 1);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
