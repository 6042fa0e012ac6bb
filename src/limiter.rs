use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::concurrency::Concurrency;
use crate::error::{panic_message, LimitError, TaskError};
use crate::handle::{Outcome, TaskHandle};

/// A queued task, waiting for the slot it will be started with.
type Job = Box<dyn FnOnce(Slot) + Send + 'static>;

/// Hand-overs deferred by a `release` nested inside another one.
type Deferred = VecDeque<(Job, Arc<Shared>)>;

thread_local! {
    /// `None` while no release is running on this thread.
    static HAND_OVERS: RefCell<Option<Deferred>> = const { RefCell::new(None) };
}

/// Admission gate that keeps at most `concurrency` submitted tasks in flight.
///
/// Tasks that find every slot taken wait in a FIFO queue and are started, in
/// submission order, as running tasks settle. Clones share the same slots and
/// queue.
///
/// Tasks are spawned on the Tokio runtime attached with [`Limiter::with_handle`],
/// or on the runtime current at submission time.
#[derive(Clone)]
pub struct Limiter {
    shared: Arc<Shared>,
}

struct Shared {
    concurrency: Concurrency,
    runtime: Option<Handle>,
    state: Mutex<State>,
    counters: Counters,
}

#[derive(Default)]
struct State {
    active: usize,
    pending: VecDeque<Job>,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    admitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    cancelled: AtomicU64,
}

/// A non-owning reference to a [`Limiter`]; it does not keep the slots and
/// queue alive.
#[derive(Clone)]
pub struct WeakLimiter {
    shared: Weak<Shared>,
}

impl WeakLimiter {
    pub fn upgrade(&self) -> Option<Limiter> {
        self.shared.upgrade().map(|shared| Limiter { shared })
    }
}

/// Point-in-time view of a limiter.
///
/// `cancelled` counts tasks whose handles resolved to
/// [`TaskError::Cancelled`]: entries removed by [`Limiter::clear_queue`] and
/// admitted tasks the runtime dropped before they settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterStats {
    pub active: usize,
    pub pending: usize,
    pub submitted: u64,
    pub admitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
    pub cancelled: u64,
}

impl Limiter {
    /// Create a limiter allowing `limit` tasks in flight.
    ///
    /// Fails with [`LimitError::InvalidArgument`] when `limit` is zero.
    pub fn new(limit: usize) -> Result<Self, LimitError> {
        Ok(Self::with_concurrency(Concurrency::new(limit)?))
    }

    /// A limiter that admits every task immediately and never queues.
    pub fn unbounded() -> Self {
        Self::with_concurrency(Concurrency::Unbounded)
    }

    pub fn with_concurrency(concurrency: Concurrency) -> Self {
        Self::build(concurrency, None)
    }

    /// Spawn admitted tasks on `runtime` instead of the ambient runtime.
    pub fn with_handle(concurrency: Concurrency, runtime: Handle) -> Self {
        Self::build(concurrency, Some(runtime))
    }

    fn build(concurrency: Concurrency, runtime: Option<Handle>) -> Self {
        debug!(%concurrency, "limiter created");
        Self {
            shared: Arc::new(Shared {
                concurrency,
                runtime,
                state: Mutex::new(State::default()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn concurrency(&self) -> Concurrency {
        self.shared.concurrency
    }

    /// Number of tasks admitted and not yet settled.
    pub fn active_count(&self) -> usize {
        self.shared.lock().active
    }

    /// Number of tasks waiting for a slot.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Submit a task. Never waits for a slot.
    ///
    /// `task` is called once the task is admitted; the future it returns is
    /// driven on the runtime while holding the slot. A panic while building
    /// or polling the future releases the slot like any other settlement and
    /// is reported as [`TaskError::Panicked`].
    ///
    /// Must be called from within a Tokio runtime unless the limiter was
    /// built with [`Limiter::with_handle`].
    pub fn submit<F, Fut, T, E>(&self, task: F) -> TaskHandle<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let runtime = self.shared.runtime();
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |slot: Slot| {
            runtime.spawn(run_task(task, tx, slot));
        });

        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let admitted = {
            let mut state = self.shared.lock();
            if state.pending.is_empty() && self.shared.concurrency.admits(state.active) {
                state.active += 1;
                Some(job)
            } else {
                state.pending.push_back(job);
                debug!(
                    active = state.active,
                    pending = state.pending.len(),
                    "task queued"
                );
                None
            }
        };

        if let Some(job) = admitted {
            job(Slot::admit(&self.shared));
        }

        TaskHandle::new(rx)
    }

    /// Start `task` only if a slot is free right now; otherwise hand it back.
    pub fn try_submit<F, Fut, T, E>(&self, task: F) -> Result<TaskHandle<T, E>, F>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let runtime = self.shared.runtime();
        {
            let mut state = self.shared.lock();
            if !(state.pending.is_empty() && self.shared.concurrency.admits(state.active)) {
                return Err(task);
            }
            state.active += 1;
        }

        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        runtime.spawn(run_task(task, tx, Slot::admit(&self.shared)));
        Ok(TaskHandle::new(rx))
    }

    /// Drop every queued task. Running tasks are left alone.
    ///
    /// Handles of the dropped tasks resolve to [`TaskError::Cancelled`].
    /// Returns the number of tasks removed.
    pub fn clear_queue(&self) -> usize {
        let dropped: Vec<Job> = {
            let mut state = self.shared.lock();
            state.pending.drain(..).collect()
        };
        let n = dropped.len();
        // Drop outside the lock: the closures own caller values.
        drop(dropped);

        if n > 0 {
            self.shared
                .counters
                .cancelled
                .fetch_add(n as u64, Ordering::Relaxed);
            info!(dropped = n, "pending queue cleared");
        }
        n
    }

    pub fn downgrade(&self) -> WeakLimiter {
        WeakLimiter {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn stats(&self) -> LimiterStats {
        let (active, pending) = {
            let state = self.shared.lock();
            (state.active, state.pending.len())
        };
        let c = &self.shared.counters;
        LimiterStats {
            active,
            pending,
            submitted: c.submitted.load(Ordering::Relaxed),
            admitted: c.admitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Limiter")
            .field("concurrency", &self.shared.concurrency)
            .field("active", &state.active)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Shared {
    // User code never runs under this lock, so a poisoned guard still holds
    // consistent counts.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn runtime(&self) -> Handle {
        self.runtime.clone().unwrap_or_else(Handle::current)
    }

    /// Give up one slot: either hand it straight to the head of the queue or
    /// return it. Both happen under one lock, so `active` never dips below the
    /// bound while work is waiting.
    ///
    /// Starting the next job can release again on the same thread (a runtime
    /// that is shutting down drops the spawned future on the spot). Those
    /// nested hand-overs are queued on `HAND_OVERS` and run by the outermost
    /// call, so the stack stays flat however long the queue is.
    fn release(self: &Arc<Self>) {
        let next = {
            let mut state = self.lock();
            match state.pending.pop_front() {
                Some(job) => Some(job),
                None => {
                    state.active = state.active.saturating_sub(1);
                    None
                }
            }
        };
        let Some(job) = next else {
            return;
        };

        let nested = HAND_OVERS.with(|cell| match cell.borrow_mut().as_mut() {
            Some(deferred) => {
                deferred.push_back((job, Arc::clone(self)));
                None
            }
            None => Some(job),
        });
        let Some(job) = nested else {
            return;
        };

        HAND_OVERS.with(|cell| *cell.borrow_mut() = Some(VecDeque::new()));
        let _reset = ResetHandOvers;

        debug!("slot handed to queued task");
        job(Slot::admit(self));
        while let Some((job, shared)) =
            HAND_OVERS.with(|cell| cell.borrow_mut().as_mut().and_then(VecDeque::pop_front))
        {
            job(Slot::admit(&shared));
        }
    }
}

/// Leaves `HAND_OVERS` empty again, even if starting a job unwinds.
struct ResetHandOvers;

impl Drop for ResetHandOvers {
    fn drop(&mut self) {
        let leftover = HAND_OVERS.with(|cell| cell.borrow_mut().take());
        // Only reached with entries on unwind; each still owns a slot.
        for (job, shared) in leftover.into_iter().flatten() {
            job(Slot::admit(&shared));
        }
    }
}

/// An occupied slot. Dropping it releases the slot, whatever way the task
/// ended.
struct Slot {
    shared: Arc<Shared>,
    settled: bool,
}

impl Slot {
    fn admit(shared: &Arc<Shared>) -> Self {
        shared.counters.admitted.fetch_add(1, Ordering::Relaxed);
        Slot {
            shared: Arc::clone(shared),
            settled: false,
        }
    }

    fn record<T, E>(&mut self, outcome: &Outcome<T, E>) {
        let c = &self.shared.counters;
        match outcome {
            Ok(_) => c.completed.fetch_add(1, Ordering::Relaxed),
            Err(TaskError::Panicked(_)) => c.panicked.fetch_add(1, Ordering::Relaxed),
            Err(_) => c.failed.fetch_add(1, Ordering::Relaxed),
        };
        self.settled = true;
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if !self.settled {
            // The runtime dropped the task; its handle reads as cancelled.
            self.shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.release();
    }
}

async fn run_task<F, Fut, T, E>(task: F, tx: oneshot::Sender<Outcome<T, E>>, mut slot: Slot)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let outcome = match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(fut) => match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(TaskError::Failed(err)),
            Err(payload) => Err(TaskError::Panicked(panic_message(payload))),
        },
        Err(payload) => Err(TaskError::Panicked(panic_message(payload))),
    };

    if let Err(TaskError::Panicked(msg)) = &outcome {
        warn!(panic = %msg, "task panicked");
    }
    slot.record(&outcome);

    // Free the slot before the submitter observes the outcome.
    drop(slot);

    // The submitter may have dropped its handle; nothing else to do then.
    let _ = tx.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::ready;

    #[test]
    fn rejects_zero_concurrency() {
        let err = Limiter::new(0).unwrap_err();
        assert!(matches!(err, LimitError::InvalidArgument { .. }), "{err}");
    }

    #[test]
    fn fresh_limiter_is_idle() {
        let limiter = Limiter::new(3).unwrap();
        assert_eq!(limiter.active_count(), 0);
        assert_eq!(limiter.pending_count(), 0);
        assert_eq!(limiter.concurrency().limit(), Some(3));
    }

    #[tokio::test]
    async fn submit_passes_value_through() {
        let limiter = Limiter::new(1).unwrap();
        let value = limiter
            .submit(|| ready(Ok::<_, String>("done")))
            .await
            .unwrap();
        assert_eq!(value, "done");
    }

    #[tokio::test]
    async fn try_submit_refuses_when_full() {
        let limiter = Limiter::new(1).unwrap();
        let (release, gate) = oneshot::channel::<()>();
        let first = limiter
            .try_submit(move || async move {
                let _ = gate.await;
                Ok::<_, String>(1)
            })
            .unwrap_or_else(|_| panic!("first try_submit should be admitted"));

        let refused = limiter.try_submit(|| ready(Ok::<u32, String>(2)));
        assert!(refused.is_err());
        assert_eq!(limiter.pending_count(), 0);

        release.send(()).unwrap();
        assert_eq!(first.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stats_count_each_settlement_kind() {
        let limiter = Limiter::new(2).unwrap();
        let ok = limiter.submit(|| ready(Ok::<u32, String>(1)));
        let failed = limiter.submit(|| ready(Err::<u32, String>("bad".into())));
        assert!(ok.await.is_ok());
        assert!(failed.await.is_err());

        let stats = limiter.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.admitted, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn weak_limiter_does_not_keep_the_limiter_alive() {
        let limiter = Limiter::new(2).unwrap();
        let weak = limiter.downgrade();
        assert_eq!(weak.upgrade().map(|l| l.concurrency().limit()), Some(Some(2)));
        drop(limiter);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn explicit_runtime_handle_is_used() {
        let limiter = Limiter::with_handle(Concurrency::new(1).unwrap(), Handle::current());
        let out = limiter.submit(|| ready(Ok::<_, String>(5))).await;
        assert_eq!(out.unwrap(), 5);
    }
}
