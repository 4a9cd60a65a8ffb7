//! Jobs: one scheduled invocation of a sequencer against one change event.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::ChangeEvent;
use crate::sequencer::SequencerConfig;

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Create a new random job id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job state machine: `Queued -> Running -> Completed | Failed`, or
/// `Queued -> Skipped` when the job is dropped before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl JobState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Identity of a content node across workspaces. Jobs sharing a key are
/// executed one at a time, in enqueue order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub workspace: String,
    pub path: String,
}

/// A scheduled sequencer invocation.
///
/// The target sequencer is fixed at creation and never changes, even if the
/// registry is later reconfigured.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    event: Arc<ChangeEvent>,
    sequencer: Arc<SequencerConfig>,
    output_path: String,
    state: JobState,
    enqueued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn new(event: Arc<ChangeEvent>, sequencer: Arc<SequencerConfig>, output_path: Option<String>) -> Self {
        let output_path = output_path.unwrap_or_else(|| event.path().to_string());
        Self {
            id: JobId::new(),
            event,
            sequencer,
            output_path,
            state: JobState::Queued,
            enqueued_at: Utc::now(),
            started_at: None,
        }
    }

    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    #[must_use]
    pub fn event(&self) -> &ChangeEvent {
        &self.event
    }

    #[must_use]
    pub fn sequencer(&self) -> &SequencerConfig {
        &self.sequencer
    }

    #[must_use]
    pub fn output_path(&self) -> &str {
        &self.output_path
    }

    #[must_use]
    pub const fn state(&self) -> JobState {
        self.state
    }

    #[must_use]
    pub const fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    #[must_use]
    pub fn node_key(&self) -> NodeKey {
        NodeKey {
            workspace: self.event.workspace().to_string(),
            path: self.event.path().to_string(),
        }
    }

    pub(crate) fn start(&mut self) {
        debug_assert_eq!(self.state, JobState::Queued);
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn finish(&mut self, state: JobState) {
        debug_assert!(state.is_terminal());
        self.state = state;
    }

    #[must_use]
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            sequencer: self.sequencer.name().to_string(),
            workspace: self.event.workspace().to_string(),
            path: self.event.path().to_string(),
            property: self.event.property().to_string(),
            output_path: self.output_path.clone(),
            state: self.state,
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
        }
    }
}

/// Read-only view of a queued or running job.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub sequencer: String,
    pub workspace: String,
    pub path: String,
    pub property: String,
    pub output_path: String,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Emitted once for every job that reaches a terminal state.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub id: JobId,
    pub sequencer: String,
    pub workspace: String,
    pub path: String,
    pub property: String,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    pub(crate) fn new(job: &Job, error: Option<String>) -> Self {
        Self {
            id: job.id,
            sequencer: job.sequencer.name().to_string(),
            workspace: job.event.workspace().to_string(),
            path: job.event.path().to_string(),
            property: job.event.property().to_string(),
            state: job.state,
            error,
            enqueued_at: job.enqueued_at,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::event::{EventKind, EventSource, RawNotification, SessionHandle};
    use crate::sequencer::from_fn;

    fn job() -> Job {
        let event = EventSource
            .normalize(RawNotification::property(
                EventKind::Added,
                "/foo/bar",
                "data",
                SessionHandle::new("default"),
            ))
            .unwrap();
        let config = SequencerConfig::builder("A")
            .path_expression("/foo/*@data")
            .sequencer("noop", from_fn(|_ctx| Ok(())))
            .build()
            .unwrap();
        Job::new(event, Arc::new(config), None)
    }

    #[test]
    fn new_job_is_queued_with_default_output() {
        let job = job();
        assert_eq!(job.state(), JobState::Queued);
        assert_eq!(job.output_path(), "/foo/bar");
        assert!(job.started_at().is_none());
        assert_eq!(
            job.node_key(),
            NodeKey {
                workspace: "default".to_string(),
                path: "/foo/bar".to_string()
            }
        );
    }

    #[test]
    fn transitions_are_recorded() {
        let mut job = job();
        job.start();
        assert_eq!(job.state(), JobState::Running);
        assert!(job.started_at().is_some());
        job.finish(JobState::Completed);

        let outcome = JobOutcome::new(&job, None);
        assert_eq!(outcome.state, JobState::Completed);
        assert_eq!(outcome.sequencer, "A");
        assert!(outcome.finished_at >= outcome.enqueued_at);
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Skipped.is_terminal());
    }

    #[test]
    fn summary_serializes() {
        let summary = job().summary();
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["state"], "queued");
        assert_eq!(json["sequencer"], "A");
        assert!(json.get("started_at").is_none());
    }
}
