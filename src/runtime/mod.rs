//! Execution runtime: the shared pipeline state workers run against, the
//! worker pool, and outcome reporting.

pub mod outcome;
pub(crate) mod pool;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[cfg(test)]
use std::sync::atomic::AtomicBool;

use tracing::{debug, error, warn};

use crate::context::{BinaryStore, ContentStore, ExecutionContext};
use crate::error::ExecutionError;
use crate::job::{Job, JobOutcome, JobState};
use crate::queue::DispatchQueue;
use crate::stats::Statistics;

use outcome::OutcomeHub;

/// State shared by the service front-end, the workers and their supervisor.
pub(crate) struct Pipeline {
    pub(crate) queue: Arc<DispatchQueue>,
    pub(crate) content: Arc<dyn ContentStore>,
    pub(crate) binaries: Arc<dyn BinaryStore>,
    pub(crate) stats: Statistics,
    pub(crate) outcomes: OutcomeHub,
    workers_replaced: AtomicU64,

    #[cfg(test)]
    pub(crate) inject_fault: AtomicBool,
}

impl Pipeline {
    pub(crate) fn new(
        queue: Arc<DispatchQueue>,
        content: Arc<dyn ContentStore>,
        binaries: Arc<dyn BinaryStore>,
        outcome_capacity: usize,
    ) -> Self {
        Self {
            queue,
            content,
            binaries,
            stats: Statistics::new(),
            outcomes: OutcomeHub::new(outcome_capacity),
            workers_replaced: AtomicU64::new(0),
            #[cfg(test)]
            inject_fault: AtomicBool::new(false),
        }
    }

    pub(crate) fn workers_replaced(&self) -> u64 {
        self.workers_replaced.load(Ordering::Relaxed)
    }

    pub(crate) fn record_replacement(&self) {
        self.workers_replaced.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs the job's sequencer in a fresh session. The session is committed
    /// only if the sequencer returns `Ok`; otherwise the context rolls it back
    /// when dropped.
    pub(crate) fn execute(&self, job: &Job) -> Result<(), ExecutionError> {
        let config = job.sequencer();
        let session = self.content.open_session(job.event().workspace())?;
        let mut ctx = ExecutionContext::new(job, session, self.binaries.as_ref());

        match panic::catch_unwind(AssertUnwindSafe(|| config.sequencer().execute(&mut ctx))) {
            Ok(Ok(())) => ctx.commit(),
            Ok(Err(err)) => Err(ExecutionError::SequencerFailed {
                sequencer: config.name().to_string(),
                message: err.to_string(),
            }),
            Err(payload) => Err(ExecutionError::SequencerPanicked {
                sequencer: config.name().to_string(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    pub(crate) fn completed(&self, job: &Job) {
        debug!(
            job_id = %job.id(),
            sequencer = %job.sequencer().name(),
            path = %job.event().path(),
            "sequencing job completed"
        );
        self.stats.record_sequenced();
        self.outcomes.publish(&JobOutcome::new(job, None));
    }

    pub(crate) fn failed(&self, job: &Job, err: &ExecutionError) {
        error!(
            job_id = %job.id(),
            sequencer = %job.sequencer().name(),
            path = %job.event().path(),
            error = %err,
            "error while sequencing node"
        );
        self.stats.record_failed();
        self.outcomes.publish(&JobOutcome::new(job, Some(err.to_string())));
    }

    pub(crate) fn skipped(&self, mut job: Job, reason: &str) {
        warn!(
            job_id = %job.id(),
            sequencer = %job.sequencer().name(),
            path = %job.event().path(),
            reason,
            "skipping sequencing job"
        );
        job.finish(JobState::Skipped);
        self.stats.record_skipped();
        self.outcomes.publish(&JobOutcome::new(&job, Some(reason.to_string())));
    }

    /// Closes the queue and skips everything still waiting in it.
    pub(crate) fn close_queue(&self) -> usize {
        let drained = self.queue.close();
        let count = drained.len();
        for job in drained {
            self.skipped(job, "service shut down before the job ran");
        }
        count
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
