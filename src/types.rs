//! Shared identifiers, coordinates, and severity model used across the system.

use std::fmt;

/// Unique identifier for a request; assigned at creation and never reused.
pub type RequestId = u64;
/// Unique identifier for a dispatch worker thread.
pub type WorkerId = usize;

/// Planar position used for nearest-vehicle matching and travel time.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    pub fn distance_to(&self, other: Coord) -> f64 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.4}, {:.4})", self.x, self.y)
    }
}

/// Severity level of a request. Higher weight is more urgent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PriorityClass {
    Minor,
    Moderate,
    Severe,
    Critical,
}

impl PriorityClass {
    /// All classes, most urgent first.
    pub const ALL: [PriorityClass; 4] = [
        PriorityClass::Critical,
        PriorityClass::Severe,
        PriorityClass::Moderate,
        PriorityClass::Minor,
    ];

    /// Static weight fed into the effective priority function.
    pub const fn weight(self) -> u32 {
        match self {
            PriorityClass::Critical => 4,
            PriorityClass::Severe => 3,
            PriorityClass::Moderate => 2,
            PriorityClass::Minor => 1,
        }
    }

    /// Responders requested before the vehicle capacity cap is applied.
    pub const fn base_responders(self) -> usize {
        match self {
            PriorityClass::Critical => 3,
            PriorityClass::Severe => 2,
            PriorityClass::Moderate => 2,
            PriorityClass::Minor => 1,
        }
    }

    /// On-scene treatment time, in abstract time units.
    pub const fn service_units(self) -> u64 {
        match self {
            PriorityClass::Critical => 8,
            PriorityClass::Severe => 5,
            PriorityClass::Moderate => 3,
            PriorityClass::Minor => 2,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            PriorityClass::Critical => "imminent risk of death",
            PriorityClass::Severe => "requires urgent attention",
            PriorityClass::Moderate => "attention needed shortly",
            PriorityClass::Minor => "can wait",
        }
    }

    /// Dense index for per-class counter arrays (Critical = 0).
    pub(crate) const fn index(self) -> usize {
        match self {
            PriorityClass::Critical => 0,
            PriorityClass::Severe => 1,
            PriorityClass::Moderate => 2,
            PriorityClass::Minor => 3,
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PriorityClass::Critical => "CRITICAL",
            PriorityClass::Severe => "SEVERE",
            PriorityClass::Moderate => "MODERATE",
            PriorityClass::Minor => "MINOR",
        };
        f.pad(name)
    }
}

/// Lifecycle state of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestState {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl RequestState {
    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub const fn can_transition_to(self, next: RequestState) -> bool {
        matches!(
            (self, next),
            (RequestState::Pending, RequestState::InProgress)
                | (RequestState::Pending, RequestState::Cancelled)
                | (RequestState::InProgress, RequestState::Completed)
        )
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Cancelled)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Pending => "pending",
            RequestState::InProgress => "in-progress",
            RequestState::Completed => "completed",
            RequestState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}
