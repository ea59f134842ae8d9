//! Vehicles, responders, and the reservation flag they share.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::request::Request;
use crate::types::{Coord, RequestId};

/// Availability flag plus the request currently holding the resource.
///
/// The flag only changes through compare-and-set, so two claimants can
/// never both win the same resource.
#[derive(Debug)]
pub struct Claim {
    available: AtomicBool,
    assigned: Mutex<Option<RequestId>>,
}

impl Claim {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            assigned: Mutex::new(None),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn assigned(&self) -> Option<RequestId> {
        *self.assigned.lock()
    }

    /// Flip available -> taken; returns false if someone else holds it.
    pub fn try_claim(&self, request: RequestId) -> bool {
        if self
            .available
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        *self.assigned.lock() = Some(request);
        true
    }

    /// Clear the assignment and flip taken -> available.
    /// Returns false if the resource was already available.
    pub fn unclaim(&self) -> bool {
        let mut assigned = self.assigned.lock();
        if self
            .available
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        *assigned = None;
        true
    }
}

impl Default for Claim {
    fn default() -> Self {
        Self::new()
    }
}

/// Anything a [`ResourcePool`](crate::pool::ResourcePool) can hand out.
pub trait Resource: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn claim(&self) -> &Claim;

    /// Selection rank for `request`; the pool prefers the lowest rank and
    /// falls back to insertion order on ties.
    fn rank(&self, request: &Request) -> f64;

    fn is_available(&self) -> bool {
        self.claim().is_available()
    }

    fn assigned_request(&self) -> Option<RequestId> {
        self.claim().assigned()
    }
}

/// Vehicle category; determines how many responders it can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VehicleCategory {
    Basic,
    Advanced,
    MobileIcu,
}

impl VehicleCategory {
    pub const fn capacity(self) -> usize {
        match self {
            VehicleCategory::Basic => 2,
            VehicleCategory::Advanced => 4,
            VehicleCategory::MobileIcu => 6,
        }
    }
}

impl fmt::Display for VehicleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VehicleCategory::Basic => "basic",
            VehicleCategory::Advanced => "advanced",
            VehicleCategory::MobileIcu => "mobile-icu",
        };
        f.pad(name)
    }
}

/// An ambulance in the fleet.
#[derive(Debug)]
pub struct Vehicle {
    id: String,
    category: VehicleCategory,
    position: Mutex<Coord>,
    claim: Claim,
}

impl Vehicle {
    pub fn new(id: impl Into<String>, category: VehicleCategory, position: Coord) -> Self {
        Self {
            id: id.into(),
            category,
            position: Mutex::new(position),
            claim: Claim::new(),
        }
    }

    /// Equipment class.
    pub fn category(&self) -> VehicleCategory {
        self.category
    }

    /// How many responders fit on board.
    pub fn capacity(&self) -> usize {
        self.category.capacity()
    }

    /// Last known position; the scene of its latest call.
    pub fn position(&self) -> Coord {
        *self.position.lock()
    }

    /// Straight-line distance from the current position.
    pub fn distance_to(&self, target: Coord) -> f64 {
        self.position().distance_to(target)
    }

    /// Relocate after arriving on scene.
    pub fn move_to(&self, target: Coord) {
        *self.position.lock() = target;
    }
}

impl Resource for Vehicle {
    fn id(&self) -> &str {
        &self.id
    }

    fn claim(&self) -> &Claim {
        &self.claim
    }

    fn rank(&self, request: &Request) -> f64 {
        self.distance_to(request.location())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Specialty {
    Paramedic,
    GeneralPractitioner,
    EmergencyPhysician,
    Cardiologist,
    Traumatologist,
}

impl Specialty {
    pub const ALL: [Specialty; 5] = [
        Specialty::Paramedic,
        Specialty::GeneralPractitioner,
        Specialty::EmergencyPhysician,
        Specialty::Cardiologist,
        Specialty::Traumatologist,
    ];
}

impl fmt::Display for Specialty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Specialty::Paramedic => "paramedic",
            Specialty::GeneralPractitioner => "general practitioner",
            Specialty::EmergencyPhysician => "emergency physician",
            Specialty::Cardiologist => "cardiologist",
            Specialty::Traumatologist => "traumatologist",
        };
        f.pad(name)
    }
}

/// A medic who rides out with a vehicle.
#[derive(Debug)]
pub struct Responder {
    id: String,
    name: String,
    specialty: Specialty,
    claim: Claim,
}

impl Responder {
    pub fn new(id: impl Into<String>, name: impl Into<String>, specialty: Specialty) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            specialty,
            claim: Claim::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn specialty(&self) -> Specialty {
        self.specialty
    }
}

impl Resource for Responder {
    fn id(&self) -> &str {
        &self.id
    }

    fn claim(&self) -> &Claim {
        &self.claim
    }

    // No positional affinity: every responder ranks equal, so the pool
    // takes the first available one.
    fn rank(&self, _request: &Request) -> f64 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn claim_is_exclusive_under_contention() {
        let claim = Arc::new(Claim::new());
        let contenders = 8;
        let barrier = Arc::new(Barrier::new(contenders));
        let winners = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for id in 0..contenders {
            let claim = Arc::clone(&claim);
            let barrier = Arc::clone(&barrier);
            let winners = Arc::clone(&winners);
            handles.push(thread::spawn(move || {
                barrier.wait();
                if claim.try_claim(id as u64) {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("claim thread panicked");
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(!claim.is_available());
        assert!(claim.assigned().is_some());
    }

    #[test]
    fn unclaim_twice_is_reported() {
        let claim = Claim::new();
        assert!(claim.try_claim(5));
        assert_eq!(claim.assigned(), Some(5));
        assert!(claim.unclaim());
        assert_eq!(claim.assigned(), None);
        assert!(!claim.unclaim());
    }

    #[test]
    fn category_sets_capacity() {
        let van = Vehicle::new("AMB-001", VehicleCategory::Advanced, Coord::default());
        assert_eq!(van.capacity(), 4);
        assert_eq!(VehicleCategory::Basic.capacity(), 2);
        assert_eq!(VehicleCategory::MobileIcu.capacity(), 6);
    }

    #[test]
    fn vehicle_rank_is_distance_to_request() {
        let van = Vehicle::new("AMB-002", VehicleCategory::Basic, Coord::new(1.0, 1.0));
        let req = Request::new(
            crate::types::PriorityClass::Minor,
            Coord::new(4.0, 5.0),
            "market",
            "sprain",
            std::time::Instant::now(),
        );
        assert!((van.rank(&req) - 5.0).abs() < 1e-9);
        van.move_to(req.location());
        assert_eq!(van.rank(&req), 0.0);
    }
}
