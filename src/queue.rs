//! Process-wide FIFO of submission ids with queue-position accounting.
//!
//! An id is handed to at most one worker at a time. Enqueueing an id that is
//! already waiting only resets its state; enqueueing one that a worker holds
//! is replayed once that worker calls [`JudgeQueue::finish`].

use async_channel::{Receiver, Sender};
use metrics::counter;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::Store;
use crate::submission::{Submission, SubmissionStatus};

#[derive(Debug, Default)]
struct Counters {
    last_enqueued: u64,
    last_judged: u64,
    /// Ids in the channel, with the position each was given.
    queued: HashMap<u64, u64>,
    /// Ids popped by a worker that has not finished them yet.
    running: HashSet<u64>,
    /// Requests made while the id was running. `Some` carries a rejudge message.
    deferred: HashMap<u64, Option<String>>,
}

/// Cloneable handle shared by intake, workers and the period loop.
#[derive(Clone)]
pub struct JudgeQueue {
    tx: Sender<u64>,
    rx: Receiver<u64>,
    counters: Arc<Mutex<Counters>>,
}

impl Default for JudgeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JudgeQueue {
    pub fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self {
            tx,
            rx,
            counters: Arc::new(Mutex::new(Counters::default())),
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues a submission and records its position and pending state.
    ///
    /// The position is assigned, persisted and sent under one lock, so channel
    /// order matches position order and a worker never observes the state of
    /// the previous run.
    pub fn enqueue(&self, store: &dyn Store, id: u64) -> Result<u64, StoreError> {
        self.request(store, id, None)
    }

    /// Re-queues a finished submission, showing `message` until it is judged.
    pub fn rejudge(&self, store: &dyn Store, id: u64, message: &str) -> Result<u64, StoreError> {
        self.request(store, id, Some(message))
    }

    fn request(&self, store: &dyn Store, id: u64, message: Option<&str>) -> Result<u64, StoreError> {
        // Fail on unknown ids before a position is spent.
        let current = store.load_submission(id)?;
        let mut counters = self.counters();

        if counters.running.contains(&id) {
            let slot = counters.deferred.entry(id).or_insert(None);
            if message.is_some() {
                *slot = message.map(str::to_string);
            }
            debug!(submission_id = id, "submission is being judged, request deferred");
            return Ok(current.queue_position);
        }

        let queued = counters.queued.get(&id).copied();
        let position = match queued {
            Some(position) => position,
            None => counters.last_enqueued + 1,
        };
        store.update_submission(id, &mut |s| {
            if let Some(message) = message {
                s.simple_result = message.to_string();
            }
            s.queue_position = position;
            s.completed = false;
            s.status = SubmissionStatus::Pending;
        })?;
        if queued.is_some() {
            debug!(submission_id = id, position, "submission already queued");
            return Ok(position);
        }

        counters.last_enqueued = position;
        counters.queued.insert(id, position);
        // Unbounded and we hold a receiver, so the send cannot fail.
        let _ = self.tx.try_send(id);
        counter!("submissions_enqueued_total").increment(1);
        info!(submission_id = id, position, "submission enqueued");
        Ok(position)
    }

    /// Waits for the next id. `None` once every sender is gone.
    pub async fn pop(&self) -> Option<u64> {
        let id = self.rx.recv().await.ok()?;
        let mut counters = self.counters();
        counters.queued.remove(&id);
        counters.running.insert(id);
        counters.last_judged += 1;
        Some(id)
    }

    /// Releases an id taken by [`pop`](Self::pop) and replays any request
    /// that arrived while it was being judged.
    pub fn finish(&self, store: &dyn Store, id: u64) -> Result<(), StoreError> {
        let deferred = {
            let mut counters = self.counters();
            counters.running.remove(&id);
            counters.deferred.remove(&id)
        };
        match deferred {
            Some(Some(message)) => self.rejudge(store, id, &message).map(drop),
            Some(None) => self.enqueue(store, id).map(drop),
            None => Ok(()),
        }
    }

    /// How many submissions are ahead of `submission`, 0 once it is done.
    pub fn position(&self, submission: &Submission) -> u64 {
        if submission.completed {
            return 0;
        }
        let counters = self.counters();
        submission
            .queue_position
            .saturating_sub(counters.last_judged)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn close(&self) {
        self.tx.close();
    }
}
