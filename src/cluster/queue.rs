//! Replica action queue
//!
//! Per CLUSTER_MODEL.md §5:
//! - One bounded FIFO queue per replica, drained by a single dedicated
//!   worker thread; actions apply to that replica strictly in enqueue
//!   order (CL-F1)
//! - `enqueue` never blocks the caller; a full queue rejects the action so
//!   one slow replica cannot stall the others
//! - The worker never retries locally; failures are reported upward and
//!   become a quarantine decision at the membership layer
//! - Stopping is "finish the current item, then exit"; an in-flight action
//!   is never aborted mid-application

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use super::errors::{ClusterError, ClusterResult};
use crate::backend::{Action, BackendError, DatabaseHandle};
use crate::observability::{Event, Logger};

/// Upward reporting from a queue worker to its owning member.
///
/// Callbacks run on the worker thread, after the queue lock is released,
/// so implementations may take membership locks freely.
pub trait QueueEvents: Send + Sync {
    /// An action was applied successfully.
    fn action_applied(&self, description: &str);

    /// An action failed; the worker exits after reporting. No local retry.
    fn action_failed(&self, description: &str, error: BackendError);

    /// The queue became empty after a successful apply. Lets the member
    /// promote itself from PROCESSING to READY.
    fn queue_drained(&self);
}

struct QueueInner {
    pending: VecDeque<Arc<dyn Action>>,
    /// Workers exit when set; cleared by the next start.
    stop: bool,
    /// Bumped by every start so a superseded worker can never consume
    /// alongside its replacement.
    epoch: u64,
    worker: Option<JoinHandle<()>>,
}

/// Bounded FIFO of pending actions for one replica, plus its worker.
pub struct ReplicaQueue {
    /// Short key prefix, used for thread names and log fields.
    label: String,
    handle: Arc<dyn DatabaseHandle>,
    capacity: usize,
    inner: Mutex<QueueInner>,
    work: Condvar,
}

impl ReplicaQueue {
    /// Create a queue for the given backend handle.
    pub fn new(handle: Arc<dyn DatabaseHandle>, capacity: usize) -> Arc<Self> {
        let key = handle.settings_key();
        let label = key.chars().take(12).collect();
        Arc::new(Self {
            label,
            handle,
            capacity,
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                stop: true,
                epoch: 0,
                worker: None,
            }),
            work: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an action, never blocking. A full queue rejects it.
    pub fn enqueue(&self, action: Arc<dyn Action>) -> ClusterResult<()> {
        let mut inner = self.lock();
        if inner.pending.len() >= self.capacity {
            drop(inner);
            Logger::emit(
                Event::QueueRejected,
                &[("member", &self.label), ("capacity", &self.capacity.to_string())],
            );
            return Err(ClusterError::QueueFull {
                key: self.label.clone(),
                capacity: self.capacity,
            });
        }
        inner.pending.push_back(action);
        self.work.notify_all();
        Ok(())
    }

    /// Discard all pending actions, returning how many were dropped. The
    /// in-flight action (if any) still completes.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let dropped = inner.pending.len();
        inner.pending.clear();
        dropped
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether no actions are pending.
    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Whether an active (not stop-requested) worker is attached.
    pub fn worker_running(&self) -> bool {
        let inner = self.lock();
        !inner.stop
            && inner
                .worker
                .as_ref()
                .map(|w| !w.is_finished())
                .unwrap_or(false)
    }

    /// Start the single consumer. Idempotent: a second start while a
    /// worker is active is a no-op.
    pub fn start_worker(self: &Arc<Self>, events: Arc<dyn QueueEvents>) {
        let superseded = {
            let mut inner = self.lock();
            if let Some(worker) = inner.worker.as_ref() {
                if !inner.stop && !worker.is_finished() {
                    return;
                }
            }
            inner.stop = false;
            inner.epoch = inner.epoch.wrapping_add(1);
            let epoch = inner.epoch;
            let superseded = inner.worker.take();

            let queue = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name(format!("nimbus-replica-{}", self.label))
                .spawn(move || queue.run(epoch, events));
            match spawned {
                Ok(worker) => {
                    inner.worker = Some(worker);
                    Logger::emit(Event::WorkerStarted, &[("member", &self.label)]);
                }
                Err(e) => {
                    let reason = e.to_string();
                    Logger::emit_at(
                        crate::observability::Severity::Error,
                        Event::WorkerStopped,
                        &[("member", &self.label), ("spawn_error", &reason)],
                    );
                }
            }
            superseded
        };
        // A stopped-but-still-winding-down predecessor exits on its own
        // (stale epoch); reap it outside the lock.
        if let Some(worker) = superseded {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }

    /// Signal the worker to exit after its current item. Idempotent; safe
    /// to call from the worker thread itself (no self-join).
    pub fn stop_worker(&self) {
        let worker = {
            let mut inner = self.lock();
            inner.stop = true;
            self.work.notify_all();
            inner.worker.take()
        };
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
            Logger::emit(Event::WorkerStopped, &[("member", &self.label)]);
        }
    }

    fn run(self: Arc<Self>, epoch: u64, events: Arc<dyn QueueEvents>) {
        loop {
            let action = {
                let mut inner = self.lock();
                loop {
                    if inner.stop || inner.epoch != epoch {
                        return;
                    }
                    if let Some(action) = inner.pending.pop_front() {
                        break action;
                    }
                    inner = self
                        .work
                        .wait(inner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            };

            let description = action.describe();
            match action.apply(self.handle.as_ref()) {
                Ok(()) => {
                    events.action_applied(&description);
                    let drained = {
                        let inner = self.lock();
                        inner.pending.is_empty() && !inner.stop && inner.epoch == epoch
                    };
                    if drained {
                        events.queue_drained();
                    }
                }
                Err(error) => {
                    let message = error.to_string();
                    Logger::emit(
                        Event::ActionFailed,
                        &[
                            ("member", &self.label),
                            ("action", &description),
                            ("error", &message),
                        ],
                    );
                    // The member decides what happens next (quarantine);
                    // this worker is done either way.
                    events.action_failed(&description, error);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryHandle, StatementAction};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        applied: AtomicUsize,
        failed: AtomicUsize,
        drained: AtomicUsize,
    }

    impl QueueEvents for Recorder {
        fn action_applied(&self, _description: &str) {
            self.applied.fetch_add(1, Ordering::SeqCst);
        }

        fn action_failed(&self, _description: &str, _error: BackendError) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }

        fn queue_drained(&self) {
            self.drained.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn statement(text: &str) -> Arc<dyn Action> {
        Arc::new(StatementAction::new(text))
    }

    fn wait_until(deadline: Duration, predicate: impl Fn() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        predicate()
    }

    #[test]
    fn test_fifo_order_preserved() {
        let handle = MemoryHandle::new("fifo");
        let queue = ReplicaQueue::new(handle.clone(), 16);
        let events = Arc::new(Recorder::default());
        for i in 0..5 {
            queue.enqueue(statement(&format!("w{i}"))).unwrap();
        }
        queue.start_worker(events.clone());
        assert!(wait_until(Duration::from_secs(5), || queue.is_empty()
            && events.applied.load(Ordering::SeqCst) == 5));
        queue.stop_worker();
        assert_eq!(handle.journal(), vec!["w0", "w1", "w2", "w3", "w4"]);
    }

    #[test]
    fn test_full_queue_rejects() {
        let handle = MemoryHandle::new("full");
        let queue = ReplicaQueue::new(handle, 2);
        queue.enqueue(statement("a")).unwrap();
        queue.enqueue(statement("b")).unwrap();
        assert!(matches!(
            queue.enqueue(statement("c")),
            Err(ClusterError::QueueFull { capacity: 2, .. })
        ));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drained_reported_after_last_apply() {
        let handle = MemoryHandle::new("drain");
        let queue = ReplicaQueue::new(handle, 16);
        let events = Arc::new(Recorder::default());
        queue.enqueue(statement("only")).unwrap();
        queue.start_worker(events.clone());
        assert!(wait_until(Duration::from_secs(5), || {
            events.drained.load(Ordering::SeqCst) >= 1
        }));
        queue.stop_worker();
    }

    #[test]
    fn test_failure_reported_not_retried() {
        let handle = MemoryHandle::new("fail");
        handle.inject_failure("backend down");
        let queue = ReplicaQueue::new(handle.clone(), 16);
        let events = Arc::new(Recorder::default());
        queue.enqueue(statement("boom")).unwrap();
        queue.start_worker(events.clone());
        assert!(wait_until(Duration::from_secs(5), || {
            events.failed.load(Ordering::SeqCst) == 1
        }));
        // Worker exited after the failure; nothing was applied or retried.
        assert!(wait_until(Duration::from_secs(5), || !queue.worker_running()));
        assert_eq!(events.applied.load(Ordering::SeqCst), 0);
        assert!(handle.journal().is_empty());
    }

    #[test]
    fn test_start_twice_spawns_one_worker() {
        let handle = MemoryHandle::new("twice");
        let queue = ReplicaQueue::new(handle.clone(), 16);
        let events = Arc::new(Recorder::default());
        queue.start_worker(events.clone());
        queue.start_worker(events.clone());
        queue.enqueue(statement("once")).unwrap();
        assert!(wait_until(Duration::from_secs(5), || queue.is_empty()
            && events.applied.load(Ordering::SeqCst) == 1));
        queue.stop_worker();
        assert_eq!(handle.journal(), vec!["once"]);
    }

    #[test]
    fn test_stop_idempotent_and_stop_without_start() {
        let handle = MemoryHandle::new("stop");
        let queue = ReplicaQueue::new(handle, 16);
        queue.stop_worker();
        let events = Arc::new(Recorder::default());
        queue.start_worker(events);
        queue.stop_worker();
        queue.stop_worker();
        assert!(!queue.worker_running());
    }

    #[test]
    fn test_restart_after_stop_consumes_again() {
        let handle = MemoryHandle::new("restart");
        let queue = ReplicaQueue::new(handle.clone(), 16);
        let events = Arc::new(Recorder::default());
        queue.start_worker(events.clone());
        queue.enqueue(statement("first")).unwrap();
        assert!(wait_until(Duration::from_secs(5), || queue.is_empty()
            && events.applied.load(Ordering::SeqCst) == 1));
        queue.stop_worker();

        queue.enqueue(statement("second")).unwrap();
        queue.start_worker(events.clone());
        assert!(wait_until(Duration::from_secs(5), || queue.is_empty()
            && events.applied.load(Ordering::SeqCst) == 2));
        queue.stop_worker();
        assert_eq!(handle.journal(), vec!["first", "second"]);
    }

    #[test]
    fn test_clear_discards_pending() {
        let handle = MemoryHandle::new("clear");
        let queue = ReplicaQueue::new(handle, 16);
        queue.enqueue(statement("a")).unwrap();
        queue.enqueue(statement("b")).unwrap();
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
