//! Dispatch worker: dequeue, acquire a vehicle and crew, serve, release.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::clock::{Clock, Interrupt};
use crate::dispatch_queue::DispatchQueue;
use crate::error::DispatchError;
use crate::pool::ResourcePool;
use crate::request::Request;
use crate::resources::{Resource, Responder, Vehicle};
use crate::types::WorkerId;

/// Timeouts and pacing shared by every worker.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorkerSettings {
    pub take_timeout: Duration,
    pub vehicle_timeout: Duration,
    pub responder_timeout: Duration,
    /// Real duration of one abstract time unit.
    pub time_unit: Duration,
}

impl WorkerSettings {
    fn units(&self, n: u64) -> Duration {
        self.time_unit
            .saturating_mul(u32::try_from(n).unwrap_or(u32::MAX))
    }
}

/// The shared state every worker operates on.
pub struct DispatchContext {
    pub queue: Arc<DispatchQueue>,
    pub vehicles: Arc<ResourcePool<Vehicle>>,
    pub responders: Arc<ResourcePool<Responder>>,
    pub clock: Arc<dyn Clock>,
    pub settings: WorkerSettings,
}

/// Travel time in time units for a straight-line `distance`. Saturates for
/// distances too large to represent; NaN and negatives count as zero.
pub fn travel_units(distance: f64) -> u64 {
    let half_units = (distance.max(0.0) * 2.0).floor();
    (half_units as u64).saturating_add(1)
}

/// How a single dispatch attempt ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed { responders: usize, shortfall: usize },
    Requeued,
    Interrupted,
}

/// A request taken off the queue. Unless it is settled (completed or
/// requeued) it is reported abandoned when dropped, including on unwind.
struct InHand<'a> {
    queue: &'a DispatchQueue,
    request: Request,
    settled: bool,
}

impl<'a> InHand<'a> {
    fn new(queue: &'a DispatchQueue, request: Request) -> Self {
        Self {
            queue,
            request,
            settled: false,
        }
    }

    fn requeue(mut self) {
        self.settled = true;
        self.queue.requeue(self.request.clone());
    }
}

impl Drop for InHand<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.queue.mark_abandoned(&self.request);
        }
    }
}

/// One dispatcher thread's state: its id, the shared context, and stop signals.
pub struct DispatchWorker {
    id: WorkerId,
    name: String,
    ctx: Arc<DispatchContext>,
    stop: Arc<AtomicBool>,
    interrupt: Arc<Interrupt>,
    processed: Arc<AtomicUsize>,
}

impl DispatchWorker {
    pub fn new(
        id: WorkerId,
        ctx: Arc<DispatchContext>,
        stop: Arc<AtomicBool>,
        interrupt: Arc<Interrupt>,
    ) -> Self {
        Self {
            id,
            name: format!("dispatcher-{id}"),
            ctx,
            stop,
            interrupt,
            processed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Worker number, starting at 1.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Thread name, `dispatcher-<id>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared counter of requests this worker committed.
    pub fn processed(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.processed)
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.interrupt.is_raised()
    }

    /// Loop until told to stop. The current request always runs to an end
    /// state before the stop flag is checked again.
    pub fn run(&self) {
        info!(worker = %self.name, "dispatch worker waiting for requests");
        while !self.should_stop() {
            let take_timeout = Some(self.ctx.settings.take_timeout);
            let Some(request) = self.ctx.queue.take_next_unless(take_timeout, || self.should_stop()) else {
                continue;
            };
            let id = request.id();
            match panic::catch_unwind(AssertUnwindSafe(|| self.dispatch_one(request))) {
                Ok(Ok(outcome)) => debug!(worker = %self.name, request = id, ?outcome, "dispatch finished"),
                Ok(Err(err)) => error!(worker = %self.name, request = id, %err, "dispatch failed"),
                Err(_) => error!(worker = %self.name, request = id, "dispatch panicked; worker continues"),
            }
        }
        info!(
            worker = %self.name,
            processed = self.processed.load(Ordering::SeqCst),
            "dispatch worker finished"
        );
    }

    /// Run one request through acquisition, service, and release.
    pub fn dispatch_one(&self, request: Request) -> Result<Outcome, DispatchError> {
        let ctx = &self.ctx;
        let settings = ctx.settings;
        let mut hand = InHand::new(&ctx.queue, request);
        debug!(worker = %self.name, request = hand.request.id(), priority = %hand.request.priority(), "processing");

        let Some(vehicle) = ctx.vehicles.acquire_one(&hand.request, settings.vehicle_timeout) else {
            info!(worker = %self.name, request = hand.request.id(), "no vehicle available; requeueing");
            hand.requeue();
            return Ok(Outcome::Requeued);
        };
        hand.request.set_assigned_vehicle(vehicle.id());

        let demand = hand.request.priority().base_responders().min(vehicle.capacity());
        let crew = ctx
            .responders
            .acquire_many(demand, &hand.request, settings.responder_timeout);
        let shortfall = demand - crew.len();
        if shortfall > 0 {
            warn!(
                worker = %self.name,
                request = hand.request.id(),
                demand,
                assigned = crew.len(),
                "responder shortfall; proceeding with partial crew"
            );
        }

        ctx.queue.mark_in_progress(&mut hand.request)?;
        self.processed.fetch_add(1, Ordering::SeqCst);

        let location = hand.request.location();
        let travel = settings.units(travel_units(vehicle.distance_to(location)));
        let service = settings.units(hand.request.priority().service_units());
        info!(
            worker = %self.name,
            request = hand.request.id(),
            vehicle = vehicle.id(),
            responders = crew.len(),
            ?travel,
            "en route"
        );
        if !ctx.clock.sleep(travel, &self.interrupt) {
            return Ok(Outcome::Interrupted);
        }
        vehicle.move_to(location);
        if !ctx.clock.sleep(service, &self.interrupt) {
            return Ok(Outcome::Interrupted);
        }

        ctx.queue.mark_completed(&mut hand.request)?;
        hand.settled = true;
        let responders = crew.len();
        vehicle.release();
        for member in crew {
            member.release();
        }
        Ok(Outcome::Completed {
            responders,
            shortfall,
        })
    }
}

/// Handle to a spawned worker thread.
pub struct WorkerHandle {
    pub id: WorkerId,
    pub name: String,
    pub processed: Arc<AtomicUsize>,
    pub thread: thread::JoinHandle<()>,
}

/// Reports its worker id on `exits` when the thread ends, even on unwind.
struct ExitNotice {
    id: WorkerId,
    exits: Sender<WorkerId>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.exits.send(self.id);
    }
}

/// Spawn `worker` on a named thread.
pub fn spawn_worker(worker: DispatchWorker, exits: Sender<WorkerId>) -> Result<WorkerHandle, DispatchError> {
    let id = worker.id();
    let name = worker.name().to_string();
    let processed = worker.processed();
    let thread = thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let _notice = ExitNotice { id, exits };
            worker.run();
        })
        .map_err(DispatchError::WorkerSpawn)?;
    Ok(WorkerHandle {
        id,
        name,
        processed,
        thread,
    })
}
