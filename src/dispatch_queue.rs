//! Thread-safe priority queue of pending requests with time-decayed urgency.
//!
//! Pending requests live in a lock-guarded vector. Each `take_next` reads the
//! clock once and scans for the request with the highest effective priority,
//! breaking ties by creation time, then id. The ordering is therefore exact at
//! the moment of every take; across takes it drifts as requests age, which
//! is the point of the aging term.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::TransitionError;
use crate::events::{LifecycleEvent, ListenerRegistry};
use crate::request::{Aging, Request, RequestSummary};
use crate::types::{PriorityClass, RequestId, RequestState};

/// Pending and in-progress requests plus the counters dashboards read.
pub struct DispatchQueue {
    inner: Mutex<QueueState>,
    available: Condvar,
    idle: Condvar,
    clock: Arc<dyn Clock>,
    aging: Aging,
    listeners: Arc<ListenerRegistry>,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<Request>,
    in_progress: HashMap<RequestId, Request>,
    // Taken by a worker and not yet completed, requeued, or abandoned.
    outstanding: usize,
    closed: bool,
    completed: usize,
    cancelled: usize,
    abandoned: usize,
    requeued: usize,
    by_priority: [usize; 4],
}

impl QueueState {
    fn best_index(&self, now: Instant, aging: &Aging) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (index, candidate) in self.pending.iter().enumerate() {
            let score = candidate.effective_priority(now, aging);
            let better = match best {
                None => true,
                Some((best_index, best_score)) => {
                    let current = &self.pending[best_index];
                    score
                        .total_cmp(&best_score)
                        .then_with(|| current.created_at().cmp(&candidate.created_at()))
                        .then_with(|| current.id().cmp(&candidate.id()))
                        .is_gt()
                }
            };
            if better {
                best = Some((index, score));
            }
        }
        best.map(|(index, _)| index)
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.outstanding == 0
    }
}

/// Point-in-time counters for dashboards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub abandoned: usize,
    pub requeued: usize,
    pub by_priority: Vec<(PriorityClass, usize)>,
}

impl DispatchQueue {
    /// Create an empty, open queue.
    pub fn new(clock: Arc<dyn Clock>, aging: Aging, listeners: Arc<ListenerRegistry>) -> Self {
        Self {
            inner: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            idle: Condvar::new(),
            clock,
            aging,
            listeners,
        }
    }

    /// Aging parameters used for effective priority.
    pub fn aging(&self) -> Aging {
        self.aging
    }

    /// Accept a new pending request; returns it back if intake is closed,
    /// including a close that lands while `created` listeners run.
    pub fn submit(&self, request: Request) -> Result<RequestId, Request> {
        if request.state() != RequestState::Pending {
            warn!(request = request.id(), state = %request.state(), "refusing non-pending submission");
            return Err(request);
        }
        if self.inner.lock().closed {
            return Err(request);
        }
        // Listeners hear about the request before any worker can take it.
        self.listeners.notify(LifecycleEvent::Created, &request);
        let id = request.id();
        let priority = request.priority();
        let mut guard = self.inner.lock();
        // Intake may have closed while listeners ran; the push must see it.
        if guard.closed {
            drop(guard);
            debug!(request = id, "intake closed during submission");
            return Err(request);
        }
        guard.by_priority[priority.index()] += 1;
        guard.pending.push(request);
        self.available.notify_one();
        drop(guard);
        debug!(request = id, %priority, "request queued");
        Ok(id)
    }

    /// Put a taken request back after a failed acquisition. The original
    /// creation time is kept so its aging boost carries over. Accepted even
    /// after intake closes.
    pub fn requeue(&self, request: Request) {
        let id = request.id();
        let mut guard = self.inner.lock();
        guard.outstanding = guard.outstanding.saturating_sub(1);
        guard.requeued += 1;
        guard.pending.push(request);
        self.available.notify_one();
        drop(guard);
        debug!(request = id, "request requeued");
    }

    /// Remove and return the most urgent pending request, waiting up to
    /// `timeout`. `None` or a zero timeout waits until a request arrives or
    /// the queue is closed and empty.
    pub fn take_next(&self, timeout: Option<Duration>) -> Option<Request> {
        self.take_next_unless(timeout, || false)
    }

    /// [`take_next`](Self::take_next) that gives up as soon as `cancelled`
    /// returns true. `cancelled` is checked under the queue lock, so whoever
    /// flips it must call [`wake_takers`](Self::wake_takers) afterwards.
    pub fn take_next_unless(&self, timeout: Option<Duration>, cancelled: impl Fn() -> bool) -> Option<Request> {
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);
        let mut guard = self.inner.lock();
        loop {
            if cancelled() {
                return None;
            }
            let now = self.clock.now();
            if let Some(index) = guard.best_index(now, &self.aging) {
                let request = guard.pending.swap_remove(index);
                guard.outstanding += 1;
                return Some(request);
            }
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut guard, deadline).timed_out() {
                        if cancelled() {
                            return None;
                        }
                        // One last look in case a submit raced the timeout.
                        let now = self.clock.now();
                        let index = guard.best_index(now, &self.aging)?;
                        let request = guard.pending.swap_remove(index);
                        guard.outstanding += 1;
                        return Some(request);
                    }
                }
                None => {
                    if guard.closed {
                        return None;
                    }
                    self.available.wait(&mut guard);
                }
            }
        }
    }

    /// Wake every blocked taker so it re-checks its cancel condition.
    pub fn wake_takers(&self) {
        let _guard = self.inner.lock();
        self.available.notify_all();
    }

    /// Cancel a request that is still pending. Requests already taken by a
    /// worker are not affected and report `false`.
    pub fn cancel(&self, id: RequestId) -> bool {
        let mut guard = self.inner.lock();
        let Some(index) = guard.pending.iter().position(|r| r.id() == id) else {
            return false;
        };
        let mut request = guard.pending.swap_remove(index);
        if let Err(err) = request.transition(RequestState::Cancelled) {
            warn!(%err, "cancel found a non-pending request in the queue");
        }
        guard.cancelled += 1;
        if guard.is_idle() {
            self.idle.notify_all();
        }
        drop(guard);
        debug!(request = id, "request cancelled");
        true
    }

    /// Commit a taken request as in progress and fire `assigned`.
    pub fn mark_in_progress(&self, request: &mut Request) -> Result<(), TransitionError> {
        request.transition(RequestState::InProgress)?;
        self.inner
            .lock()
            .in_progress
            .insert(request.id(), request.clone());
        self.listeners.notify(LifecycleEvent::Assigned, request);
        Ok(())
    }

    /// Complete an in-progress request and fire `completed`.
    pub fn mark_completed(&self, request: &mut Request) -> Result<(), TransitionError> {
        request.transition(RequestState::Completed)?;
        let mut guard = self.inner.lock();
        guard.in_progress.remove(&request.id());
        guard.outstanding = guard.outstanding.saturating_sub(1);
        guard.completed += 1;
        if guard.is_idle() {
            self.idle.notify_all();
        }
        drop(guard);
        self.listeners.notify(LifecycleEvent::Completed, request);
        Ok(())
    }

    /// Drop a taken request that will never finish (forced stop, or a
    /// failure in the worker). It leaves every index without a state change.
    pub fn mark_abandoned(&self, request: &Request) {
        let mut guard = self.inner.lock();
        guard.in_progress.remove(&request.id());
        guard.outstanding = guard.outstanding.saturating_sub(1);
        guard.abandoned += 1;
        if guard.is_idle() {
            self.idle.notify_all();
        }
        drop(guard);
        warn!(request = request.id(), state = %request.state(), "request abandoned");
    }

    /// Stop accepting new submissions and wake indefinite waiters.
    pub fn close(&self) {
        let mut guard = self.inner.lock();
        guard.closed = true;
        self.available.notify_all();
    }

    /// Whether intake has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Block until nothing is pending or held by a worker, or `timeout`
    /// passes. Returns `true` when idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock();
        while !guard.is_idle() {
            if self.idle.wait_until(&mut guard, deadline).timed_out() {
                return guard.is_idle();
            }
        }
        true
    }

    /// Current number of pending requests.
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Requests between assignment and an end state.
    pub fn active_len(&self) -> usize {
        self.inner.lock().in_progress.len()
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> QueueStats {
        let guard = self.inner.lock();
        QueueStats {
            pending: guard.pending.len(),
            active: guard.in_progress.len(),
            completed: guard.completed,
            cancelled: guard.cancelled,
            abandoned: guard.abandoned,
            requeued: guard.requeued,
            by_priority: PriorityClass::ALL
                .iter()
                .map(|&p| (p, guard.by_priority[p.index()]))
                .collect(),
        }
    }

    /// Up to `limit` pending requests in the order `take_next` would serve them now.
    pub fn top_pending(&self, limit: usize) -> Vec<RequestSummary> {
        let now = self.clock.now();
        let guard = self.inner.lock();
        let mut ranked: Vec<&Request> = guard.pending.iter().collect();
        ranked.sort_by(|a, b| {
            b.effective_priority(now, &self.aging)
                .total_cmp(&a.effective_priority(now, &self.aging))
                .then_with(|| a.created_at().cmp(&b.created_at()))
                .then_with(|| a.id().cmp(&b.id()))
        });
        ranked
            .into_iter()
            .take(limit)
            .map(|r| r.summary(now, &self.aging))
            .collect()
    }

    /// Summaries of requests being served, oldest first.
    pub fn in_progress(&self) -> Vec<RequestSummary> {
        let now = self.clock.now();
        let guard = self.inner.lock();
        let mut active: Vec<RequestSummary> = guard
            .in_progress
            .values()
            .map(|r| r.summary(now, &self.aging))
            .collect();
        active.sort_by_key(|s| s.id);
        active
    }
}
