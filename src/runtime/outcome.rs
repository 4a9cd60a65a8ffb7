//! Job outcome subscriptions.
//!
//! Publishing never blocks a worker: each subscriber has a bounded buffer and
//! an outcome that does not fit is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use tracing::trace;

use crate::error::{lock_err, ExecutionError, SequencingError, SequencingResult};
use crate::job::JobOutcome;

const STREAM_PATH: &str = "outcome_stream";

#[derive(Debug)]
pub(crate) struct OutcomeHub {
    capacity: usize,
    subscribers: Mutex<Vec<Sender<JobOutcome>>>,
    dropped: AtomicU64,
}

impl OutcomeHub {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn subscribe(&self) -> SequencingResult<OutcomeStream> {
        let (tx, rx) = bounded::<JobOutcome>(self.capacity);
        self.subscribers
            .lock()
            .map_err(|_| lock_err("outcomes.subscribe"))?
            .push(tx);
        Ok(OutcomeStream { rx })
    }

    pub(crate) fn publish(&self, outcome: &JobOutcome) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        subscribers.retain(|tx| match tx.try_send(outcome.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                trace!("removing disconnected outcome subscriber");
                false
            }
        });
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// A stream of terminal job outcomes.
///
/// Dropping the stream unsubscribes it on the next publish. The stream
/// disconnects when the owning service is dropped.
#[derive(Debug)]
pub struct OutcomeStream {
    rx: Receiver<JobOutcome>,
}

impl OutcomeStream {
    /// Receive the next outcome (blocking).
    pub fn recv(&self) -> SequencingResult<JobOutcome> {
        self.rx.recv().map_err(|_| disconnected())
    }

    /// Receive the next outcome with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> SequencingResult<JobOutcome> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => SequencingError::Execution(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            RecvTimeoutError::Disconnected => disconnected(),
        })
    }

    /// Returns a buffered outcome without blocking.
    pub fn try_recv(&self) -> SequencingResult<Option<JobOutcome>> {
        match self.rx.try_recv() {
            Ok(outcome) => Ok(Some(outcome)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(disconnected()),
        }
    }

    /// Outcomes currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

fn disconnected() -> SequencingError {
    SequencingError::Execution(ExecutionError::Disconnected {
        path: STREAM_PATH.to_string(),
    })
}
