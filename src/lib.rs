//! Emergency dispatch coordinator.
//!
//! Incoming requests wait in a [`DispatchQueue`] ordered by severity with a
//! fairness boost for long waits. [`DispatchWorker`]s match each request to
//! the nearest free vehicle and a crew of responders drawn from two
//! [`ResourcePool`]s, simulate the call-out, and release everything back.
//! [`Dispatcher`] ties it together and owns the shutdown sequence.

pub mod clock;
pub mod config;
pub mod dispatch_queue;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod logging;
pub mod pool;
pub mod request;
pub mod resources;
pub mod types;
pub mod worker;

pub use clock::{Clock, Interrupt, ManualClock, SystemClock};
pub use config::{DispatchConfig, FleetConfig};
pub use dispatch_queue::{DispatchQueue, QueueStats};
pub use dispatcher::{DispatchSnapshot, Dispatcher, FinalReport, WorkerReport};
pub use error::{ConfigError, DispatchError, TransitionError};
pub use events::{DispatchListener, FnListener, LifecycleEvent, ListenerRegistry};
pub use pool::{Lease, PoolCounters, PoolOccupancy, Reservation, ReservationStage, ResourcePool};
pub use request::{Aging, Request, RequestSummary};
pub use resources::{Resource, Responder, Specialty, Vehicle, VehicleCategory};
pub use types::{Coord, PriorityClass, RequestId, RequestState, WorkerId};
pub use worker::{DispatchContext, DispatchWorker, Outcome, WorkerHandle, WorkerSettings};
