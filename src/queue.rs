//! Bounded dispatch queue with per-node ordering and exclusion.
//!
//! Jobs are claimed from the head of the queue, skipping any job whose node is
//! currently being processed. Because the earliest pending job for a node is
//! always ahead of later ones, and a node stays busy until its claim is
//! released, jobs for the same node run one at a time in enqueue order while
//! jobs for different nodes run in parallel.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{lock_err, SequencingResult};
use crate::job::{Job, JobId, JobSummary, NodeKey};

/// What `enqueue` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject immediately; the job is skipped.
    #[default]
    Skip,
    /// Wait up to `timeout_ms` for space, then skip.
    Block {
        #[serde(alias = "enqueue_timeout_ms")]
        timeout_ms: u64,
    },
}

/// Result of an enqueue attempt. Rejected jobs are handed back to the caller.
#[derive(Debug)]
pub enum EnqueueOutcome {
    Queued,
    /// The queue was full for the whole allowed wait.
    Overflow(Job),
    /// The queue no longer accepts jobs.
    Closed(Job),
}

/// Dispatch mode, driven by the lifecycle controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Accepting and dispatching.
    Open,
    /// Accepting, not dispatching.
    Paused,
    /// Rejecting; waiting consumers are released.
    Closed,
}

#[derive(Debug)]
struct QueueState {
    mode: QueueMode,
    pending: VecDeque<Job>,
    busy: HashSet<NodeKey>,
    running: HashMap<JobId, JobSummary>,
}

impl QueueState {
    fn next_eligible(&self) -> Option<usize> {
        self.pending.iter().position(|job| !self.busy.contains(&job.node_key()))
    }
}

#[allow(missing_docs)]
#[derive(Debug)]
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    space: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
    depth: AtomicUsize,
    running: AtomicUsize,
}

impl DispatchQueue {
    /// Creates a closed queue. `capacity` is clamped to at least one.
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                mode: QueueMode::Closed,
                pending: VecDeque::with_capacity(capacity.min(4096)),
                busy: HashSet::new(),
                running: HashMap::new(),
            }),
            available: Condvar::new(),
            space: Condvar::new(),
            capacity,
            policy,
            depth: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
        }
    }

    /// Appends a job to the tail.
    pub fn enqueue(&self, job: Job) -> SequencingResult<EnqueueOutcome> {
        let mut state = self.lock("queue.enqueue")?;

        if state.mode != QueueMode::Closed && state.pending.len() >= self.capacity {
            if let OverflowPolicy::Block { timeout_ms } = self.policy {
                let deadline = Instant::now() + Duration::from_millis(timeout_ms);
                while state.mode != QueueMode::Closed && state.pending.len() >= self.capacity {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _) = self
                        .space
                        .wait_timeout(state, deadline - now)
                        .map_err(|_| lock_err("queue.enqueue"))?;
                    state = guard;
                }
            }
        }

        if state.mode == QueueMode::Closed {
            return Ok(EnqueueOutcome::Closed(job));
        }
        if state.pending.len() >= self.capacity {
            return Ok(EnqueueOutcome::Overflow(job));
        }

        trace!(job_id = %job.id(), path = %job.event().path(), "enqueued job");
        state.pending.push_back(job);
        self.depth.store(state.pending.len(), Ordering::Release);
        drop(state);
        self.available.notify_one();
        Ok(EnqueueOutcome::Queued)
    }

    /// Blocks until a job can be claimed, returning `None` once the queue is closed.
    pub fn dequeue(self: &Arc<Self>) -> SequencingResult<Option<Claim>> {
        let mut state = self.lock("queue.dequeue")?;
        loop {
            match state.mode {
                QueueMode::Closed => return Ok(None),
                QueueMode::Open => {
                    if let Some(idx) = state.next_eligible() {
                        let Some(mut job) = state.pending.remove(idx) else {
                            continue;
                        };
                        job.start();
                        let key = job.node_key();
                        state.busy.insert(key.clone());
                        state.running.insert(job.id(), job.summary());
                        self.depth.store(state.pending.len(), Ordering::Release);
                        self.running.store(state.running.len(), Ordering::Release);
                        drop(state);
                        self.space.notify_one();
                        trace!(job_id = %job.id(), path = %key.path, "claimed job");
                        return Ok(Some(Claim {
                            queue: Arc::clone(self),
                            key,
                            job,
                        }));
                    }
                }
                QueueMode::Paused => {}
            }
            state = self.available.wait(state).map_err(|_| lock_err("queue.dequeue"))?;
        }
    }

    /// Jobs currently queued.
    #[must_use]
    pub fn size(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Jobs currently claimed by workers.
    #[must_use]
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// A poisoned queue reports `Closed`.
    #[must_use]
    pub fn mode(&self) -> QueueMode {
        self.state.lock().map(|s| s.mode).unwrap_or(QueueMode::Closed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.mode() == QueueMode::Closed
    }

    /// Summaries of queued jobs in queue order.
    pub fn queued_jobs(&self) -> SequencingResult<Vec<JobSummary>> {
        let state = self.lock("queue.queued_jobs")?;
        Ok(state.pending.iter().map(Job::summary).collect())
    }

    /// Summaries of running jobs, oldest start first.
    pub fn running_jobs(&self) -> SequencingResult<Vec<JobSummary>> {
        let state = self.lock("queue.running_jobs")?;
        let mut jobs: Vec<JobSummary> = state.running.values().cloned().collect();
        jobs.sort_by_key(|j| j.started_at);
        Ok(jobs)
    }

    /// Starts (or resumes) dispatching.
    pub(crate) fn open(&self) -> SequencingResult<()> {
        self.set_mode(QueueMode::Open)
    }

    /// Keeps accepting jobs but stops handing them out.
    pub(crate) fn pause(&self) -> SequencingResult<()> {
        self.set_mode(QueueMode::Paused)
    }

    /// Stops accepting jobs, wakes every waiter and returns the jobs that were
    /// still queued. Claimed jobs are unaffected.
    pub(crate) fn close(&self) -> Vec<Job> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.mode = QueueMode::Closed;
        let drained: Vec<Job> = state.pending.drain(..).collect();
        self.depth.store(0, Ordering::Release);
        drop(state);
        self.available.notify_all();
        self.space.notify_all();
        debug!(drained = drained.len(), "dispatch queue closed");
        drained
    }

    fn set_mode(&self, mode: QueueMode) -> SequencingResult<()> {
        let mut state = self.lock("queue.set_mode")?;
        state.mode = mode;
        drop(state);
        self.available.notify_all();
        self.space.notify_all();
        Ok(())
    }

    fn release(&self, key: &NodeKey, id: JobId) {
        // Must succeed even after a panic elsewhere, or the node stays busy forever.
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.busy.remove(key);
        state.running.remove(&id);
        self.running.store(state.running.len(), Ordering::Release);
        drop(state);
        self.available.notify_all();
    }

    fn lock(&self, context: &str) -> SequencingResult<MutexGuard<'_, QueueState>> {
        self.state.lock().map_err(|_| lock_err(context))
    }
}

/// Exclusive ownership of a running job. Dropping the claim frees the job's
/// node for the next queued job.
#[derive(Debug)]
pub struct Claim {
    queue: Arc<DispatchQueue>,
    key: NodeKey,
    job: Job,
}

impl Claim {
    #[must_use]
    pub const fn job(&self) -> &Job {
        &self.job
    }

    pub(crate) fn job_mut(&mut self) -> &mut Job {
        &mut self.job
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.queue.release(&self.key, self.job.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use crate::event::{EventKind, EventSource, RawNotification, SessionHandle};
    use crate::job::JobState;
    use crate::sequencer::{from_fn, SequencerConfig};

    fn job(path: &str) -> Job {
        let event = EventSource
            .normalize(RawNotification::property(
                EventKind::Changed,
                path,
                "data",
                SessionHandle::new("default"),
            ))
            .unwrap();
        let config = SequencerConfig::builder("A")
            .path_expression("/**")
            .sequencer("noop", from_fn(|_ctx| Ok(())))
            .build()
            .unwrap();
        Job::new(event, Arc::new(config), None)
    }

    fn open_queue(capacity: usize, policy: OverflowPolicy) -> Arc<DispatchQueue> {
        let queue = Arc::new(DispatchQueue::new(capacity, policy));
        queue.open().unwrap();
        queue
    }

    #[test]
    fn overflow_with_skip_policy_returns_job() {
        let queue = open_queue(1, OverflowPolicy::Skip);
        assert!(matches!(queue.enqueue(job("/a")).unwrap(), EnqueueOutcome::Queued));
        match queue.enqueue(job("/b")).unwrap() {
            EnqueueOutcome::Overflow(j) => assert_eq!(j.event().path(), "/b"),
            other => panic!("expected overflow, got {other:?}"),
        }
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn block_policy_waits_at_most_the_timeout() {
        let queue = open_queue(1, OverflowPolicy::Block { timeout_ms: 50 });
        queue.enqueue(job("/a")).unwrap();

        let started = Instant::now();
        let outcome = queue.enqueue(job("/b")).unwrap();
        let waited = started.elapsed();
        assert!(matches!(outcome, EnqueueOutcome::Overflow(_)));
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_secs(2));
    }

    #[test]
    fn block_policy_succeeds_when_space_frees() {
        let queue = open_queue(1, OverflowPolicy::Block { timeout_ms: 5_000 });
        queue.enqueue(job("/a")).unwrap();

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                let claim = queue.dequeue().unwrap().unwrap();
                claim.job().event().path().to_string()
            })
        };

        assert!(matches!(queue.enqueue(job("/b")).unwrap(), EnqueueOutcome::Queued));
        assert_eq!(consumer.join().unwrap(), "/a");
    }

    #[test]
    fn same_node_is_exclusive_and_fifo() {
        let queue = open_queue(8, OverflowPolicy::Skip);
        queue.enqueue(job("/n")).unwrap();
        queue.enqueue(job("/n")).unwrap();
        queue.enqueue(job("/m")).unwrap();
        let first_id = queue.queued_jobs().unwrap()[0].id;

        let first = queue.dequeue().unwrap().unwrap();
        assert_eq!(first.job().id(), first_id);
        assert_eq!(first.job().state(), JobState::Running);

        // The second "/n" job is blocked; "/m" is handed out instead.
        let second = queue.dequeue().unwrap().unwrap();
        assert_eq!(second.job().event().path(), "/m");
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.running(), 2);

        drop(first);
        let third = queue.dequeue().unwrap().unwrap();
        assert_eq!(third.job().event().path(), "/n");
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn paused_queue_accepts_but_does_not_dispatch() {
        let queue = open_queue(4, OverflowPolicy::Skip);
        queue.pause().unwrap();
        queue.enqueue(job("/a")).unwrap();
        assert_eq!(queue.size(), 1);

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.dequeue().unwrap().map(|c| c.job().id()))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.size(), 1);

        queue.open().unwrap();
        assert!(consumer.join().unwrap().is_some());
    }

    #[test]
    fn close_releases_waiters_and_returns_pending() {
        let queue = open_queue(4, OverflowPolicy::Skip);
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.dequeue().unwrap().is_none())
        };
        thread::sleep(Duration::from_millis(20));

        queue.pause().unwrap();
        queue.enqueue(job("/a")).unwrap();
        queue.enqueue(job("/b")).unwrap();
        let drained = queue.close();
        assert_eq!(drained.len(), 2);
        assert_eq!(queue.size(), 0);
        assert!(consumer.join().unwrap());

        assert!(matches!(queue.enqueue(job("/c")).unwrap(), EnqueueOutcome::Closed(_)));
    }

    #[test]
    fn running_jobs_are_listed_until_released() {
        let queue = open_queue(4, OverflowPolicy::Skip);
        queue.enqueue(job("/a")).unwrap();
        let claim = queue.dequeue().unwrap().unwrap();

        let running = queue.running_jobs().unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].state, JobState::Running);
        assert!(queue.queued_jobs().unwrap().is_empty());

        drop(claim);
        assert!(queue.running_jobs().unwrap().is_empty());
        assert_eq!(queue.running(), 0);
    }
}
