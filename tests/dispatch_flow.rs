//! End-to-end dispatch cycles driven through the public API.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::time::Duration;

use parking_lot::Mutex;
use siren_dispatch::{
    Aging, Clock, Coord, DispatchConfig, DispatchContext, DispatchQueue, DispatchWorker, Dispatcher,
    FnListener, Interrupt, ListenerRegistry, ManualClock, Outcome, PriorityClass, RequestState,
    ResourcePool, Responder, Specialty, Vehicle, VehicleCategory, WorkerSettings,
};

fn responders(n: usize) -> Vec<Responder> {
    (0..n)
        .map(|i| Responder::new(format!("MED-{i:03}"), format!("Medic {i}"), Specialty::ALL[i % 5]))
        .collect()
}

fn quick_config() -> DispatchConfig {
    DispatchConfig {
        take_timeout_ms: 20,
        vehicle_timeout_ms: 50,
        responder_timeout_ms: 50,
        time_unit_ms: 1,
        drain_window_units: 5_000,
        worker_join_timeout_ms: 2_000,
        ..DispatchConfig::default()
    }
}

#[test]
fn critical_call_runs_full_cycle_and_frees_everything() {
    let clock = Arc::new(ManualClock::new());
    let listeners = Arc::new(ListenerRegistry::new());
    let states = Arc::new(Mutex::new(Vec::new()));
    let (on_assigned, on_completed) = (Arc::clone(&states), Arc::clone(&states));
    listeners.add(Arc::new(
        FnListener::new()
            .on_assigned(move |req| on_assigned.lock().push(req.state()))
            .on_completed(move |req| on_completed.lock().push(req.state())),
    ));
    let ctx = Arc::new(DispatchContext {
        queue: Arc::new(DispatchQueue::new(clock.clone(), Aging::default(), listeners)),
        vehicles: Arc::new(ResourcePool::new(
            "vehicles",
            vec![Vehicle::new("AMB-001", VehicleCategory::Advanced, Coord::new(0.0, 0.0))],
        )),
        responders: Arc::new(ResourcePool::new("responders", responders(10))),
        clock: clock.clone(),
        settings: WorkerSettings {
            take_timeout: Duration::from_millis(20),
            vehicle_timeout: Duration::from_millis(20),
            responder_timeout: Duration::from_millis(20),
            time_unit: Duration::from_secs(1),
        },
    });

    let request = siren_dispatch::Request::new(
        PriorityClass::Critical,
        Coord::new(0.0, 0.0),
        "Harbour road",
        "cardiac arrest",
        clock.now(),
    );
    ctx.queue.submit(request).expect("intake open");
    let taken = ctx.queue.take_next(Some(Duration::from_millis(20))).expect("request");

    let worker = DispatchWorker::new(1, Arc::clone(&ctx), Arc::new(AtomicBool::new(false)), Arc::new(Interrupt::new()));
    let outcome = worker.dispatch_one(taken).expect("dispatch");

    // min(3 for critical, capacity 4) responders, nothing short.
    assert_eq!(outcome, Outcome::Completed { responders: 3, shortfall: 0 });
    assert_eq!(*states.lock(), vec![RequestState::InProgress, RequestState::Completed]);
    let stats = ctx.queue.stats();
    assert_eq!((stats.pending, stats.active, stats.completed), (0, 0, 1));
    assert_eq!(ctx.vehicles.occupancy().available, 1);
    assert_eq!(ctx.responders.occupancy().available, 10);
    assert_eq!(ctx.responders.counters().acquired, 3);
    assert!(ctx.vehicles.invariant_holds());
    assert!(ctx.responders.invariant_holds());
}

#[test]
fn starved_minor_call_overtakes_fresh_severe_after_requeue() {
    let clock = Arc::new(ManualClock::new());
    let config = DispatchConfig {
        aging_interval_ms: 60_000,
        ..quick_config()
    };
    let dispatcher = Dispatcher::with_clock(config, Vec::new(), responders(2), clock.clone());
    let minor = dispatcher.new_request(PriorityClass::Minor, Coord::default(), "Old Town square", "sprain");
    let minor_id = dispatcher.submit(minor).expect("intake open");

    // A worker takes it, finds no vehicle, and puts it back.
    let taken = dispatcher.queue().take_next(Some(Duration::from_millis(5))).expect("request");
    clock.advance(Duration::from_secs(25 * 60));
    dispatcher.queue().requeue(taken);

    let severe = dispatcher.new_request(PriorityClass::Severe, Coord::default(), "Riverside park", "burns");
    dispatcher.submit(severe).expect("intake open");

    let top = dispatcher.top_pending(2);
    assert_eq!(top[0].id, minor_id);
    assert!((top[0].effective_priority - 3.5).abs() < 1e-9);
    assert_eq!(top[1].priority, PriorityClass::Severe);
}

#[test]
fn shutdown_drains_backlog_before_stopping_workers() {
    let vehicles = (0..3)
        .map(|i| Vehicle::new(format!("AMB-{i:03}"), VehicleCategory::MobileIcu, Coord::new(i as f64, 0.0)))
        .collect();
    let dispatcher = Dispatcher::new(quick_config(), vehicles, responders(8));
    let (done_tx, done_rx) = mpsc::channel();
    let done_tx = Mutex::new(done_tx);
    dispatcher.add_listener(Arc::new(FnListener::new().on_completed(move |req| {
        let _ = done_tx.lock().send(req.id());
    })));

    let mut ids = Vec::new();
    for (i, priority) in PriorityClass::ALL.iter().cycle().take(20).enumerate() {
        let req = dispatcher.new_request(*priority, Coord::new((i % 3) as f64, 1.0), "Northgate market", "drill");
        ids.push(dispatcher.submit(req).expect("intake open"));
    }
    dispatcher.start(4).expect("start");
    let report = dispatcher.shutdown().expect("shutdown");

    assert!(report.drained);
    assert!(!report.forced);
    assert_eq!(report.queue.completed, 20);
    assert_eq!(report.queue.pending, 0);
    assert_eq!(report.workers.len(), 4);
    assert_eq!(report.processed(), 20);
    assert!(report.pools_settled());

    let mut finished: Vec<u64> = done_rx.try_iter().collect();
    finished.sort_unstable();
    ids.sort_unstable();
    assert_eq!(finished, ids);

    let late = dispatcher.new_request(PriorityClass::Critical, Coord::default(), "University campus", "late call");
    assert!(dispatcher.submit(late).is_err());
}

#[test]
fn cancel_is_best_effort_against_running_workers() {
    let dispatcher = Dispatcher::new(
        DispatchConfig {
            time_unit_ms: 20,
            ..quick_config()
        },
        vec![Vehicle::new("AMB-001", VehicleCategory::Basic, Coord::default())],
        responders(2),
    );
    let (assigned_tx, assigned_rx) = mpsc::channel();
    let assigned_tx = Mutex::new(assigned_tx);
    dispatcher.add_listener(Arc::new(FnListener::new().on_assigned(move |req| {
        let _ = assigned_tx.lock().send(req.id());
    })));
    dispatcher.start(1).expect("start");

    let first = dispatcher.new_request(PriorityClass::Critical, Coord::default(), "Harbour road", "collapse");
    let first_id = dispatcher.submit(first).expect("intake open");
    assert_eq!(assigned_rx.recv_timeout(Duration::from_secs(2)).expect("assigned"), first_id);

    // The only vehicle is busy, so the second call is still pending.
    let second = dispatcher.new_request(PriorityClass::Minor, Coord::default(), "Airport ring road", "cut");
    let second_id = dispatcher.submit(second).expect("intake open");
    assert!(!dispatcher.cancel(first_id));
    assert!(dispatcher.cancel(second_id));

    let report = dispatcher.shutdown().expect("shutdown");
    assert_eq!(report.queue.completed, 1);
    assert_eq!(report.queue.cancelled, 1);
    assert!(report.pools_settled());
}
