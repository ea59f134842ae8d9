//! Request entity and its one-way lifecycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::TransitionError;
use crate::types::{Coord, PriorityClass, RequestId, RequestState};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// An incoming service request.
///
/// Owned by the queue while pending and moved into the worker that
/// dequeues it; it is never shared between workers.
#[derive(Clone, Debug)]
pub struct Request {
    id: RequestId,
    location: Coord,
    address: String,
    priority: PriorityClass,
    description: String,
    created_at: Instant,
    state: RequestState,
    assigned_vehicle: Option<String>,
}

impl Request {
    /// Create a pending request stamped with `created_at`.
    pub fn new(
        priority: PriorityClass,
        location: Coord,
        address: impl Into<String>,
        description: impl Into<String>,
        created_at: Instant,
    ) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            location,
            address: address.into(),
            priority,
            description: description.into(),
            created_at,
            state: RequestState::Pending,
            assigned_vehicle: None,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn location(&self) -> Coord {
        self.location
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn priority(&self) -> PriorityClass {
        self.priority
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn assigned_vehicle(&self) -> Option<&str> {
        self.assigned_vehicle.as_deref()
    }

    pub(crate) fn set_assigned_vehicle(&mut self, vehicle: impl Into<String>) {
        self.assigned_vehicle = Some(vehicle.into());
    }

    /// Time spent since creation as observed at `now`.
    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// `weight * (1 + waited_intervals * factor)`, where `waited_intervals`
    /// counts whole `aging_interval`s elapsed since creation.
    pub fn effective_priority(&self, now: Instant, aging: &Aging) -> f64 {
        let intervals = aging.intervals(self.waited(now));
        f64::from(self.priority.weight()) * (1.0 + intervals as f64 * aging.factor)
    }

    /// Apply a lifecycle step; illegal or repeated steps leave the state untouched.
    pub fn transition(&mut self, next: RequestState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Read-only view for dashboards and listeners that outlive the borrow.
    pub fn summary(&self, now: Instant, aging: &Aging) -> RequestSummary {
        RequestSummary {
            id: self.id,
            priority: self.priority,
            address: self.address.clone(),
            state: self.state,
            waited: self.waited(now),
            effective_priority: self.effective_priority(now, aging),
            assigned_vehicle: self.assigned_vehicle.clone(),
        }
    }
}

/// Aging parameters of the effective priority function.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aging {
    pub interval: Duration,
    pub factor: f64,
}

impl Aging {
    pub fn intervals(&self, waited: Duration) -> u64 {
        let interval = self.interval.as_nanos().max(1);
        (waited.as_nanos() / interval) as u64
    }
}

impl Default for Aging {
    /// One boost step per waited minute, 10% of the base weight each.
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            factor: 0.1,
        }
    }
}

/// Snapshot of a request at a point in time.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestSummary {
    pub id: RequestId,
    pub priority: PriorityClass,
    pub address: String,
    pub state: RequestState,
    pub waited: Duration,
    pub effective_priority: f64,
    pub assigned_vehicle: Option<String>,
}
