//! Fixed-size worker pool.
//!
//! Each worker loops on `DispatchQueue::dequeue` until the queue closes. A
//! supervisor thread joins workers as they exit and respawns any worker that
//! died for a reason other than shutdown, so the pool keeps its configured
//! capacity.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::error::{ExecutionError, LifecycleError};
use crate::job::{Job, JobState};
use crate::queue::Claim;

use super::Pipeline;

#[derive(Debug, Clone, Copy)]
struct WorkerExit {
    index: usize,
    clean: bool,
}

/// Reports the worker's exit to the supervisor on every exit path, including
/// unwinding.
struct ExitNotice {
    index: usize,
    clean: bool,
    tx: Sender<WorkerExit>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerExit {
            index: self.index,
            clean: self.clean,
        });
    }
}

/// A claimed job that has not yet been reported. If the worker dies before
/// reporting, the job is recorded as failed instead of vanishing.
struct InFlight<'a> {
    claim: Claim,
    pipeline: &'a Pipeline,
    settled: bool,
}

impl<'a> InFlight<'a> {
    fn new(claim: Claim, pipeline: &'a Pipeline) -> Self {
        Self {
            claim,
            pipeline,
            settled: false,
        }
    }

    fn job(&self) -> &Job {
        self.claim.job()
    }

    fn settle(mut self, result: Result<(), ExecutionError>) {
        self.settled = true;
        match result {
            Ok(()) => {
                self.claim.job_mut().finish(JobState::Completed);
                self.pipeline.completed(self.claim.job());
            }
            Err(err) => {
                self.claim.job_mut().finish(JobState::Failed);
                self.pipeline.failed(self.claim.job(), &err);
            }
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let err = ExecutionError::WorkerTerminated {
                job_id: self.claim.job().id(),
            };
            self.claim.job_mut().finish(JobState::Failed);
            self.pipeline.failed(self.claim.job(), &err);
        }
    }
}

pub(crate) struct WorkerPool {
    size: usize,
    supervisor: JoinHandle<()>,
}

impl WorkerPool {
    /// Spawns `size` workers and their supervisor.
    ///
    /// On failure the queue is closed and any workers already started are
    /// joined before the error is returned.
    pub(crate) fn start(size: usize, pipeline: &Arc<Pipeline>) -> Result<Self, LifecycleError> {
        let size = size.max(1);
        let (exit_tx, exit_rx) = unbounded::<WorkerExit>();

        let mut handles = Vec::with_capacity(size);
        for index in 0..size {
            match spawn_worker(index, pipeline, &exit_tx) {
                Ok(handle) => handles.push(Some(handle)),
                Err(err) => {
                    abort_start(pipeline, handles);
                    return Err(err);
                }
            }
        }

        let name = "sequencing-supervisor".to_string();
        let supervisor_pipeline = Arc::clone(pipeline);
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || supervise(&supervisor_pipeline, &exit_rx, &exit_tx, handles));

        match spawned {
            Ok(supervisor) => {
                info!(workers = size, "sequencing worker pool started");
                Ok(Self { size, supervisor })
            }
            Err(err) => {
                // The closure (and the worker handles it owned) is dropped with
                // the failed spawn, leaving the workers detached; closing the
                // queue still makes them exit.
                pipeline.close_queue();
                Err(LifecycleError::WorkerSpawn {
                    name,
                    message: err.to_string(),
                })
            }
        }
    }

    pub(crate) const fn size(&self) -> usize {
        self.size
    }

    /// Waits for every worker to exit. The queue must already be closed.
    pub(crate) fn join(self) {
        if self.supervisor.join().is_err() {
            error!("sequencing supervisor panicked");
        }
        debug!("sequencing worker pool stopped");
    }
}

fn spawn_worker(
    index: usize,
    pipeline: &Arc<Pipeline>,
    exits: &Sender<WorkerExit>,
) -> Result<JoinHandle<()>, LifecycleError> {
    let name = format!("sequencing-worker-{index}");
    let pipeline = Arc::clone(pipeline);
    let exits = exits.clone();
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || worker_loop(index, &pipeline, exits))
        .map_err(|err| LifecycleError::WorkerSpawn {
            name,
            message: err.to_string(),
        })
}

fn abort_start(pipeline: &Pipeline, handles: Vec<Option<JoinHandle<()>>>) {
    pipeline.close_queue();
    for handle in handles.into_iter().flatten() {
        let _ = handle.join();
    }
}

fn worker_loop(index: usize, pipeline: &Pipeline, exits: Sender<WorkerExit>) {
    let mut notice = ExitNotice {
        index,
        clean: false,
        tx: exits,
    };

    loop {
        match pipeline.queue.dequeue() {
            Ok(Some(claim)) => {
                let in_flight = InFlight::new(claim, pipeline);

                #[cfg(test)]
                if pipeline
                    .inject_fault
                    .swap(false, std::sync::atomic::Ordering::AcqRel)
                {
                    panic!("injected worker fault");
                }

                let result = pipeline.execute(in_flight.job());
                in_flight.settle(result);
            }
            Ok(None) => {
                notice.clean = true;
                return;
            }
            Err(err) => {
                error!(worker = index, error = %err, "sequencing worker failed");
                return;
            }
        }
    }
}

fn supervise(
    pipeline: &Arc<Pipeline>,
    exits: &Receiver<WorkerExit>,
    exit_tx: &Sender<WorkerExit>,
    mut handles: Vec<Option<JoinHandle<()>>>,
) {
    let mut live = handles.len();
    while live > 0 {
        let Ok(exit) = exits.recv() else {
            break;
        };
        if let Some(handle) = handles.get_mut(exit.index).and_then(Option::take) {
            let _ = handle.join();
        }

        if exit.clean || pipeline.queue.is_closed() {
            live -= 1;
            continue;
        }

        warn!(worker = exit.index, "sequencing worker terminated unexpectedly; replacing it");
        match spawn_worker(exit.index, pipeline, exit_tx) {
            Ok(handle) => {
                handles[exit.index] = Some(handle);
                pipeline.record_replacement();
            }
            Err(err) => {
                error!(worker = exit.index, error = %err, "unable to replace sequencing worker");
                live -= 1;
            }
        }
    }
}
