//! Concurrent allocator for one kind of resource.
//!
//! Allocation is two-phase. A counting permit is taken first (bounded wait),
//! then a concrete resource is claimed by compare-and-set on its availability
//! flag. Between the phases the caller holds a [`Reservation`]; dropping it
//! before commit returns everything it holds, so a lost claim can never leak
//! a permit. Committed resources are handed out as [`Lease`]s which go back
//! to the pool exactly once, explicitly or on drop.
//!
//! Invariant: at every quiescent point, `permits == resources flagged available`.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::request::Request;
use crate::resources::Resource;
use crate::types::RequestId;

/// Counting semaphore over the pool's free resources.
struct Permits {
    count: Mutex<usize>,
    available: Condvar,
}

impl Permits {
    fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Wait until `wanted` permits are free or `timeout` passes, then take
    /// as many as are free, up to `wanted`.
    fn acquire_up_to(&self, wanted: usize, timeout: Duration) -> usize {
        if wanted == 0 {
            return 0;
        }
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count < wanted {
            if self.available.wait_until(&mut count, deadline).timed_out() {
                break;
            }
        }
        let granted = wanted.min(*count);
        *count -= granted;
        granted
    }

    fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut count = self.count.lock();
        *count += n;
        self.available.notify_all();
    }

    fn available(&self) -> usize {
        *self.count.lock()
    }
}

/// Progress of a single allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReservationStage {
    PermitHeld,
    ResourceClaimed,
    Committed,
    Released,
}

/// A permit taken from a pool, optionally with a claimed resource.
///
/// Dropping a reservation that has not been committed rolls it back: the
/// claimed resource (if any) is flagged available again and the permit is
/// returned.
pub struct Reservation<'a, R: Resource> {
    pool: &'a ResourcePool<R>,
    stage: ReservationStage,
    resource: Option<Arc<R>>,
}

impl<'a, R: Resource> Reservation<'a, R> {
    fn with_permit(pool: &'a ResourcePool<R>) -> Self {
        Self {
            pool,
            stage: ReservationStage::PermitHeld,
            resource: None,
        }
    }

    /// Current step of the two-phase acquisition.
    pub fn stage(&self) -> ReservationStage {
        self.stage
    }

    /// Claim the best-ranked available resource for `request`. Candidates
    /// are tried in rank order until one compare-and-set succeeds.
    pub fn claim_best(&mut self, request: &Request) -> bool {
        if self.stage != ReservationStage::PermitHeld {
            return self.stage == ReservationStage::ResourceClaimed;
        }
        let pool = self.pool;
        let mut candidates: Vec<(f64, &Arc<R>)> = pool
            .resources
            .iter()
            .filter(|r| r.is_available())
            .map(|r| (r.rank(request), r))
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
        for (_, candidate) in candidates {
            if self.claim(candidate, request.id()) {
                return true;
            }
        }
        false
    }

    /// Claim one specific resource.
    pub fn claim(&mut self, resource: &Arc<R>, request: RequestId) -> bool {
        if self.stage != ReservationStage::PermitHeld {
            return false;
        }
        if !resource.claim().try_claim(request) {
            return false;
        }
        self.resource = Some(Arc::clone(resource));
        self.stage = ReservationStage::ResourceClaimed;
        true
    }

    /// Finalise a claimed reservation. Without a claim it rolls back and
    /// returns `None`.
    pub fn commit(mut self) -> Option<Arc<R>> {
        match self.resource.take() {
            Some(resource) if self.stage == ReservationStage::ResourceClaimed => {
                self.stage = ReservationStage::Committed;
                self.pool.acquired.fetch_add(1, Ordering::SeqCst);
                Some(resource)
            }
            _ => None,
        }
    }

    /// Undo everything this reservation holds.
    pub fn rollback(mut self) {
        self.undo();
    }

    fn undo(&mut self) {
        match self.stage {
            ReservationStage::Committed | ReservationStage::Released => return,
            ReservationStage::ResourceClaimed => {
                if let Some(resource) = self.resource.take() {
                    resource.claim().unclaim();
                }
            }
            ReservationStage::PermitHeld => {}
        }
        self.pool.permits.release(1);
        self.pool.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.stage = ReservationStage::Released;
    }
}

impl<R: Resource> Drop for Reservation<'_, R> {
    fn drop(&mut self) {
        self.undo();
    }
}

/// A committed resource. Returned to its pool by [`Lease::release`] or on drop.
pub struct Lease<R: Resource> {
    pool: Arc<ResourcePool<R>>,
    resource: Option<Arc<R>>,
}

impl<R: Resource> Lease<R> {
    /// The resource this lease holds.
    pub fn resource(&self) -> &Arc<R> {
        match &self.resource {
            Some(resource) => resource,
            // Only `release` and `drop` take the resource, and both consume the lease.
            None => unreachable!("lease used after release"),
        }
    }

    /// Hand the resource back now; `false` if the pool refused the release.
    pub fn release(mut self) -> bool {
        match self.resource.take() {
            Some(resource) => self.pool.release(&resource),
            None => false,
        }
    }
}

impl<R: Resource> Deref for Lease<R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.resource()
    }
}

impl<R: Resource> Drop for Lease<R> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            debug!(pool = self.pool.label, resource = resource.id(), "lease dropped; releasing");
            self.pool.release(&resource);
        }
    }
}

impl<R: Resource> fmt::Debug for Lease<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("pool", &self.pool.label)
            .field("resource", &self.resource.as_ref().map(|r| r.id().to_string()))
            .finish()
    }
}

/// Available/total view of a pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolOccupancy {
    pub available: usize,
    pub total: usize,
    pub permits: usize,
}

/// Lifetime counters of a pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolCounters {
    pub acquired: u64,
    pub released: u64,
    pub rollbacks: u64,
    pub rejected_releases: u64,
}

/// Fixed set of resources guarded by a permit counter and per-resource claims.
pub struct ResourcePool<R: Resource> {
    label: &'static str,
    resources: Vec<Arc<R>>,
    permits: Permits,
    acquired: AtomicU64,
    released: AtomicU64,
    rollbacks: AtomicU64,
    rejected_releases: AtomicU64,
}

impl<R: Resource> ResourcePool<R> {
    /// Build a pool where every resource starts available.
    pub fn new(label: &'static str, resources: impl IntoIterator<Item = R>) -> Self {
        let resources: Vec<Arc<R>> = resources.into_iter().map(Arc::new).collect();
        let permits = resources.iter().filter(|r| r.is_available()).count();
        Self {
            label,
            resources,
            permits: Permits::new(permits),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            rejected_releases: AtomicU64::new(0),
        }
    }

    /// Pool name used in logs and reports.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Phase one only: wait up to `timeout` for a permit.
    pub fn begin_reservation(&self, timeout: Duration) -> Option<Reservation<'_, R>> {
        if self.permits.acquire_up_to(1, timeout) == 0 {
            return None;
        }
        Some(Reservation::with_permit(self))
    }

    /// Reserve the best resource for `request` (lowest rank), waiting up to
    /// `timeout` for one to free up.
    pub fn acquire_one(self: &Arc<Self>, request: &Request, timeout: Duration) -> Option<Lease<R>> {
        let mut reservation = self.begin_reservation(timeout)?;
        if !reservation.claim_best(request) {
            warn!(pool = self.label, request = request.id(), "permit granted but no resource claimable; permit returned");
            return None;
        }
        let resource = reservation.commit()?;
        debug!(pool = self.label, request = request.id(), resource = resource.id(), "resource acquired");
        Some(self.lease(resource))
    }

    /// Reserve up to `count` resources in one bounded wait. Fewer than
    /// `count` (even zero) is a normal outcome; surplus permits go back.
    pub fn acquire_many(
        self: &Arc<Self>,
        count: usize,
        request: &Request,
        timeout: Duration,
    ) -> Vec<Lease<R>> {
        let granted = self.permits.acquire_up_to(count, timeout);
        let mut leases = Vec::with_capacity(granted);
        for _ in 0..granted {
            let mut reservation = Reservation::with_permit(self.as_ref());
            if !reservation.claim_best(request) {
                // Dropping the reservation hands its permit back.
                continue;
            }
            if let Some(resource) = reservation.commit() {
                leases.push(self.lease(resource));
            }
        }
        if leases.len() < granted {
            warn!(
                pool = self.label,
                request = request.id(),
                granted,
                claimed = leases.len(),
                "returned surplus permits"
            );
        }
        leases
    }

    fn lease(self: &Arc<Self>, resource: Arc<R>) -> Lease<R> {
        Lease {
            pool: Arc::clone(self),
            resource: Some(resource),
        }
    }

    /// Clear the assignment, flag the resource available, return its permit.
    /// A second release of the same acquisition is rejected and logged.
    pub fn release(&self, resource: &Arc<R>) -> bool {
        if !self.resources.iter().any(|r| Arc::ptr_eq(r, resource)) {
            error!(pool = self.label, resource = resource.id(), "release of a resource from another pool");
            self.rejected_releases.fetch_add(1, Ordering::SeqCst);
            return false;
        }
        if !resource.claim().unclaim() {
            error!(pool = self.label, resource = resource.id(), "double release rejected");
            self.rejected_releases.fetch_add(1, Ordering::SeqCst);
            return false;
        }
        self.permits.release(1);
        self.released.fetch_add(1, Ordering::SeqCst);
        debug!(pool = self.label, resource = resource.id(), "resource released");
        true
    }

    /// Every resource in the pool, free or claimed.
    pub fn resources(&self) -> &[Arc<R>] {
        &self.resources
    }

    /// Free resources, total size, and spare permits right now.
    pub fn occupancy(&self) -> PoolOccupancy {
        PoolOccupancy {
            available: self.resources.iter().filter(|r| r.is_available()).count(),
            total: self.resources.len(),
            permits: self.permits.available(),
        }
    }

    /// Permit count equals available resources. Meaningful only when no
    /// thread is between phases.
    pub fn invariant_holds(&self) -> bool {
        let occupancy = self.occupancy();
        occupancy.permits == occupancy.available
    }

    /// Lifetime acquire, release, and rollback counts.
    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            acquired: self.acquired.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
            rollbacks: self.rollbacks.load(Ordering::SeqCst),
            rejected_releases: self.rejected_releases.load(Ordering::SeqCst),
        }
    }

    /// Resources currently held, with the request each one serves.
    pub fn busy(&self) -> Vec<(String, Option<RequestId>)> {
        self.resources
            .iter()
            .filter(|r| !r.is_available())
            .map(|r| (r.id().to_string(), r.assigned_request()))
            .collect()
    }
}
