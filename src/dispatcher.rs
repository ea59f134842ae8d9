//! Facade over the queue, both pools, and the worker crew.
//!
//! Shutdown runs in ordered phases, each bounded:
//! 1. intake closes (`close_intake`), later submissions fail;
//! 2. the drain window lets workers empty the queue;
//! 3. workers get the stop flag and finish their current request; any still
//!    running after the join timeout are interrupted out of their service
//!    delay, which releases what they hold;
//! 4. a [`FinalReport`] is assembled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::clock::{Clock, Interrupt, SystemClock};
use crate::config::DispatchConfig;
use crate::dispatch_queue::{DispatchQueue, QueueStats};
use crate::error::DispatchError;
use crate::events::{DispatchListener, ListenerRegistry};
use crate::pool::{PoolCounters, PoolOccupancy, ResourcePool};
use crate::request::{Request, RequestSummary};
use crate::resources::{Responder, Vehicle};
use crate::types::{Coord, PriorityClass, RequestId, RequestState, WorkerId};
use crate::worker::{DispatchContext, DispatchWorker, WorkerHandle, spawn_worker};

/// Running workers plus the signals shared with them.
struct Crew {
    handles: Vec<WorkerHandle>,
    exits: Receiver<WorkerId>,
    stop: Arc<AtomicBool>,
    interrupt: Arc<Interrupt>,
}

/// Point-in-time view of queue and pools.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchSnapshot {
    pub queue: QueueStats,
    pub vehicles: PoolOccupancy,
    pub responders: PoolOccupancy,
    pub workers: usize,
}

/// Per-worker line of the final report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerReport {
    pub id: WorkerId,
    pub name: String,
    pub processed: usize,
}

/// Terminal counts produced by [`Dispatcher::stop`] and [`Dispatcher::shutdown`].
#[derive(Clone, Debug)]
pub struct FinalReport {
    pub workers: Vec<WorkerReport>,
    pub queue: QueueStats,
    pub vehicles: PoolOccupancy,
    pub responders: PoolOccupancy,
    pub vehicle_counters: PoolCounters,
    pub responder_counters: PoolCounters,
    /// Queue was idle when the drain window ended.
    pub drained: bool,
    /// Some worker had to be interrupted after the join timeout.
    pub forced: bool,
    pub elapsed: Duration,
}

impl FinalReport {
    /// Requests taken by all workers combined.
    pub fn processed(&self) -> usize {
        self.workers.iter().map(|w| w.processed).sum()
    }

    /// Both pools have every resource back and their permit counts agree.
    pub fn pools_settled(&self) -> bool {
        let settled = |o: &PoolOccupancy| o.available == o.total && o.permits == o.available;
        settled(&self.vehicles) && settled(&self.responders)
    }
}

/// Owns the queue, both pools, the listeners, and the worker crew.
pub struct Dispatcher {
    ctx: Arc<DispatchContext>,
    listeners: Arc<ListenerRegistry>,
    config: DispatchConfig,
    crew: Mutex<Option<Crew>>,
}

impl Dispatcher {
    /// Dispatcher on the system clock.
    pub fn new(config: DispatchConfig, vehicles: Vec<Vehicle>, responders: Vec<Responder>) -> Self {
        Self::with_clock(config, vehicles, responders, Arc::new(SystemClock))
    }

    /// Dispatcher on a caller-supplied clock, e.g. a `ManualClock` in tests.
    pub fn with_clock(
        config: DispatchConfig,
        vehicles: Vec<Vehicle>,
        responders: Vec<Responder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let listeners = Arc::new(ListenerRegistry::new());
        let queue = DispatchQueue::new(Arc::clone(&clock), config.aging(), Arc::clone(&listeners));
        let ctx = DispatchContext {
            queue: Arc::new(queue),
            vehicles: Arc::new(ResourcePool::new("vehicles", vehicles)),
            responders: Arc::new(ResourcePool::new("responders", responders)),
            clock,
            settings: config.worker_settings(),
        };
        Self {
            ctx: Arc::new(ctx),
            listeners,
            config,
            crew: Mutex::new(None),
        }
    }

    /// The validated configuration this dispatcher runs with.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Build a pending request stamped with this dispatcher's clock.
    pub fn new_request(
        &self,
        priority: PriorityClass,
        location: Coord,
        address: impl Into<String>,
        description: impl Into<String>,
    ) -> Request {
        Request::new(priority, location, address, description, self.ctx.clock.now())
    }

    /// Queue a request for the workers. Fails with `NotPending` for a request
    /// that already left the pending state, otherwise `IntakeClosed`.
    pub fn submit(&self, request: Request) -> Result<RequestId, DispatchError> {
        self.ctx.queue.submit(request).map_err(|refused| match refused.state() {
            RequestState::Pending => DispatchError::IntakeClosed(refused.id()),
            state => DispatchError::NotPending {
                id: refused.id(),
                state,
            },
        })
    }

    /// Best effort: only requests still pending can be cancelled.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.ctx.queue.cancel(id)
    }

    /// Subscribe to lifecycle events from now on.
    pub fn add_listener(&self, listener: Arc<dyn DispatchListener>) {
        self.listeners.add(listener);
    }

    /// The pending-request queue.
    pub fn queue(&self) -> &DispatchQueue {
        &self.ctx.queue
    }

    /// The vehicle pool.
    pub fn vehicles(&self) -> &Arc<ResourcePool<Vehicle>> {
        &self.ctx.vehicles
    }

    /// The responder pool.
    pub fn responders(&self) -> &Arc<ResourcePool<Responder>> {
        &self.ctx.responders
    }

    /// Requests waiting for a worker.
    pub fn pending_count(&self) -> usize {
        self.ctx.queue.len()
    }

    /// Requests a worker is currently serving.
    pub fn active_count(&self) -> usize {
        self.ctx.queue.active_len()
    }

    /// Requests that reached `Completed`.
    pub fn completed_count(&self) -> usize {
        self.ctx.queue.stats().completed
    }

    /// Requests cancelled while still pending.
    pub fn cancelled_count(&self) -> usize {
        self.ctx.queue.stats().cancelled
    }

    /// Queue counters, pool occupancy, and crew size in one read.
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            queue: self.ctx.queue.stats(),
            vehicles: self.ctx.vehicles.occupancy(),
            responders: self.ctx.responders.occupancy(),
            workers: self.crew.lock().as_ref().map_or(0, |c| c.handles.len()),
        }
    }

    /// The `limit` most urgent pending requests, in service order.
    pub fn top_pending(&self, limit: usize) -> Vec<RequestSummary> {
        self.ctx.queue.top_pending(limit)
    }

    /// Requests currently being served.
    pub fn in_progress(&self) -> Vec<RequestSummary> {
        self.ctx.queue.in_progress()
    }

    /// Vehicles currently out, with the request each one serves.
    pub fn busy_vehicles(&self) -> Vec<(String, Option<RequestId>)> {
        self.ctx.vehicles.busy()
    }

    /// Whether a worker crew is started.
    pub fn is_running(&self) -> bool {
        self.crew.lock().is_some()
    }

    /// Spawn `worker_count` workers named `dispatcher-1..=N`.
    pub fn start(&self, worker_count: usize) -> Result<(), DispatchError> {
        let mut slot = self.crew.lock();
        if slot.is_some() {
            return Err(DispatchError::AlreadyRunning);
        }
        let (exit_tx, exits) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let interrupt = Arc::new(Interrupt::new());
        let mut handles = Vec::with_capacity(worker_count);
        for id in 1..=worker_count {
            let worker = DispatchWorker::new(id, Arc::clone(&self.ctx), Arc::clone(&stop), Arc::clone(&interrupt));
            match spawn_worker(worker, exit_tx.clone()) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // Unwind the workers that did start before reporting.
                    stop.store(true, Ordering::SeqCst);
                    interrupt.raise();
                    self.ctx.queue.wake_takers();
                    for handle in handles {
                        let _ = handle.thread.join();
                    }
                    return Err(err);
                }
            }
        }
        info!(workers = worker_count, "dispatch workers started");
        *slot = Some(Crew {
            handles,
            exits,
            stop,
            interrupt,
        });
        Ok(())
    }

    /// Producers have stopped; refuse further submissions.
    pub fn close_intake(&self) {
        self.ctx.queue.close();
        info!("intake closed");
    }

    /// Signal workers to stop after their current request and wait for them.
    /// Workers still busy after the join timeout are interrupted.
    pub fn stop(&self) -> Result<FinalReport, DispatchError> {
        self.stop_at(Instant::now(), false)
    }

    /// Full drain protocol: close intake, give queued work the drain window,
    /// then stop the workers.
    pub fn shutdown(&self) -> Result<FinalReport, DispatchError> {
        if !self.is_running() {
            return Err(DispatchError::NotRunning);
        }
        let started = Instant::now();
        self.close_intake();
        let window = self.config.drain_window();
        info!(?window, pending = self.pending_count(), "draining");
        let drained = self.ctx.queue.wait_idle(window);
        if !drained {
            let stats = self.ctx.queue.stats();
            warn!(pending = stats.pending, active = stats.active, "drain window ended with work left");
        }
        self.stop_at(started, drained)
    }

    fn stop_at(&self, started: Instant, drained: bool) -> Result<FinalReport, DispatchError> {
        let crew = self.crew.lock().take().ok_or(DispatchError::NotRunning)?;
        crew.stop.store(true, Ordering::SeqCst);
        self.ctx.queue.wake_takers();

        let deadline = Instant::now() + self.config.worker_join_timeout();
        let mut exited = 0;
        while exited < crew.handles.len() {
            let left = deadline.saturating_duration_since(Instant::now());
            match crew.exits.recv_timeout(left) {
                Ok(_) => exited += 1,
                Err(_) => break,
            }
        }
        let forced = exited < crew.handles.len();
        if forced {
            warn!(
                stragglers = crew.handles.len() - exited,
                "workers still busy after join timeout; interrupting"
            );
            crew.interrupt.raise();
        }

        let mut workers = Vec::with_capacity(crew.handles.len());
        for handle in crew.handles {
            if handle.thread.join().is_err() {
                warn!(worker = %handle.name, "worker thread panicked outside a dispatch");
            }
            workers.push(WorkerReport {
                id: handle.id,
                name: handle.name,
                processed: handle.processed.load(Ordering::SeqCst),
            });
        }

        let report = FinalReport {
            workers,
            queue: self.ctx.queue.stats(),
            vehicles: self.ctx.vehicles.occupancy(),
            responders: self.ctx.responders.occupancy(),
            vehicle_counters: self.ctx.vehicles.counters(),
            responder_counters: self.ctx.responders.counters(),
            drained,
            forced,
            elapsed: started.elapsed(),
        };
        info!(
            processed = report.processed(),
            completed = report.queue.completed,
            abandoned = report.queue.abandoned,
            forced,
            "dispatch workers stopped"
        );
        Ok(report)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(crew) = self.crew.get_mut().take() {
            crew.stop.store(true, Ordering::SeqCst);
            crew.interrupt.raise();
            self.ctx.queue.wake_takers();
            for handle in crew.handles {
                let _ = handle.thread.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::FnListener;
    use crate::resources::{Specialty, VehicleCategory};
    use std::sync::atomic::AtomicUsize;

    fn fast_config() -> DispatchConfig {
        DispatchConfig {
            take_timeout_ms: 10,
            vehicle_timeout_ms: 20,
            responder_timeout_ms: 20,
            time_unit_ms: 1,
            drain_window_units: 2_000,
            worker_join_timeout_ms: 1_000,
            ..DispatchConfig::default()
        }
    }

    fn fleet(vehicles: usize, responders: usize) -> (Vec<Vehicle>, Vec<Responder>) {
        let vehicles = (0..vehicles)
            .map(|i| Vehicle::new(format!("AMB-{i:03}"), VehicleCategory::Advanced, Coord::default()))
            .collect();
        let responders = (0..responders)
            .map(|i| Responder::new(format!("MED-{i:03}"), format!("Dr. {i}"), Specialty::ALL[i % 5]))
            .collect();
        (vehicles, responders)
    }

    #[test]
    fn start_twice_is_rejected_and_stop_requires_start() {
        let (v, r) = fleet(1, 1);
        let dispatcher = Dispatcher::new(fast_config(), v, r);
        assert!(matches!(dispatcher.stop(), Err(DispatchError::NotRunning)));
        dispatcher.start(2).expect("start");
        assert!(matches!(dispatcher.start(1), Err(DispatchError::AlreadyRunning)));
        assert_eq!(dispatcher.snapshot().workers, 2);

        let report = dispatcher.stop().expect("stop");
        assert_eq!(report.workers.len(), 2);
        assert!(!report.forced);
        assert!(!dispatcher.is_running());
    }

    #[test]
    fn shutdown_drains_queue_and_returns_every_resource() {
        let (v, r) = fleet(2, 6);
        let dispatcher = Dispatcher::new(fast_config(), v, r);
        let completions = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&completions);
        dispatcher.add_listener(Arc::new(FnListener::new().on_completed(move |req| {
            assert_eq!(req.state(), RequestState::Completed);
            seen.fetch_add(1, Ordering::SeqCst);
        })));

        dispatcher.start(3).expect("start");
        for (i, priority) in PriorityClass::ALL.iter().cycle().take(12).enumerate() {
            let req = dispatcher.new_request(*priority, Coord::new(0.0, i as f64 * 0.1), "depot", "drill");
            dispatcher.submit(req).expect("intake open");
        }
        let report = dispatcher.shutdown().expect("shutdown");

        assert!(report.drained);
        assert_eq!(report.queue.completed, 12);
        assert_eq!(report.processed(), 12);
        assert_eq!(completions.load(Ordering::SeqCst), 12);
        assert!(report.pools_settled());
        assert_eq!(report.vehicle_counters.acquired, report.vehicle_counters.released);
    }

    #[test]
    fn submit_after_close_is_refused() {
        let (v, r) = fleet(1, 1);
        let dispatcher = Dispatcher::new(fast_config(), v, r);
        dispatcher.close_intake();
        let req = dispatcher.new_request(PriorityClass::Critical, Coord::default(), "quay", "late");
        let id = req.id();
        match dispatcher.submit(req) {
            Err(DispatchError::IntakeClosed(refused)) => assert_eq!(refused, id),
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[test]
    fn non_pending_submission_is_not_reported_as_closed_intake() {
        let (v, r) = fleet(1, 1);
        let dispatcher = Dispatcher::new(fast_config(), v, r);
        let mut req = dispatcher.new_request(PriorityClass::Moderate, Coord::default(), "quay", "stale");
        req.transition(RequestState::Cancelled).expect("pending can be cancelled");
        match dispatcher.submit(req) {
            Err(DispatchError::NotPending { state, .. }) => assert_eq!(state, RequestState::Cancelled),
            other => panic!("expected not-pending refusal, got {other:?}"),
        }
        assert!(!dispatcher.queue().is_closed());
    }

    #[test]
    fn shutdown_without_workers_returns_at_once() {
        let (v, r) = fleet(1, 1);
        let config = DispatchConfig {
            drain_window_units: 60_000,
            ..fast_config()
        };
        let dispatcher = Dispatcher::new(config, v, r);
        let req = dispatcher.new_request(PriorityClass::Minor, Coord::default(), "quay", "waiting");
        dispatcher.submit(req).expect("intake open");

        let started = Instant::now();
        assert!(matches!(dispatcher.shutdown(), Err(DispatchError::NotRunning)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!dispatcher.queue().is_closed());
    }

    #[test]
    fn snapshots_reflect_pending_work() {
        let clock = Arc::new(ManualClock::new());
        let (v, r) = fleet(1, 2);
        let dispatcher = Dispatcher::with_clock(fast_config(), v, r, clock);
        let minor = dispatcher.new_request(PriorityClass::Minor, Coord::default(), "a", "x");
        let severe = dispatcher.new_request(PriorityClass::Severe, Coord::default(), "b", "y");
        let minor_id = dispatcher.submit(minor).expect("intake open");
        dispatcher.submit(severe).expect("intake open");

        assert!(dispatcher.cancel(minor_id));
        let snapshot = dispatcher.snapshot();
        assert_eq!((snapshot.queue.pending, snapshot.queue.cancelled), (1, 1));
        assert_eq!((snapshot.vehicles.available, snapshot.vehicles.total), (1, 1));
        assert_eq!(dispatcher.top_pending(5)[0].priority, PriorityClass::Severe);
        assert!(dispatcher.busy_vehicles().is_empty());
    }

    #[test]
    fn stuck_worker_is_interrupted_and_releases_its_crew() {
        // Service would take minutes; the join timeout is short.
        let config = DispatchConfig {
            time_unit_ms: 60_000,
            worker_join_timeout_ms: 50,
            ..fast_config()
        };
        let (v, r) = fleet(1, 4);
        let dispatcher = Dispatcher::new(config, v, r);
        let (assigned_tx, assigned_rx) = mpsc::channel();
        let assigned_tx = parking_lot::Mutex::new(assigned_tx);
        dispatcher.add_listener(Arc::new(FnListener::new().on_assigned(move |req| {
            let _ = assigned_tx.lock().send(req.id());
        })));
        dispatcher.start(1).expect("start");
        let req = dispatcher.new_request(PriorityClass::Severe, Coord::default(), "ridge", "fall");
        let id = dispatcher.submit(req).expect("intake open");
        assert_eq!(assigned_rx.recv_timeout(Duration::from_secs(2)).expect("assigned"), id);

        let report = dispatcher.stop().expect("stop");
        assert!(report.forced);
        assert_eq!(report.queue.abandoned, 1);
        assert_eq!(report.queue.active, 0);
        assert!(report.pools_settled());
    }
}
