//! Demo, benchmark, and stress runners around the dispatch core.
//!
//! Everything here is harness: it builds a fleet, plays the part of the
//! call operators and the status board, and prints summaries to stdout.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use siren_dispatch::{
    Coord, DispatchConfig, DispatchError, DispatchListener, Dispatcher, FinalReport, FleetConfig,
    PriorityClass, Request, Responder, Specialty, Vehicle, VehicleCategory,
};

const ADDRESSES: [&str; 10] = [
    "5th Avenue and 22nd Street",
    "South Beach promenade",
    "Old Town square",
    "Northgate market",
    "Harbour road",
    "Hillcrest estate",
    "Fishermen's wharf",
    "Airport ring road",
    "Riverside park",
    "University campus",
];

const DESCRIPTIONS: [&str; 10] = [
    "severe chest pain",
    "shortness of breath",
    "road traffic injury",
    "heavy bleeding",
    "loss of consciousness",
    "seizure",
    "open fracture",
    "serious burns",
    "poisoning",
    "cardiac arrest",
];

const SURNAMES: [&str; 8] = [
    "Rivera", "Okafor", "Lindqvist", "Moreau", "Tanaka", "Haddad", "Novak", "Castillo",
];

/// Best-effort CPU user/system time snapshot (seconds) on Unix platforms.
#[cfg(unix)]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    // SAFETY: getrusage only writes into the zeroed struct we own.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    let seconds = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0;
    Some((seconds(usage.ru_utime), seconds(usage.ru_stime)))
}

#[cfg(not(unix))]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    None
}

fn random_in(rng: &mut SmallRng, bounds: [f64; 2]) -> f64 {
    if bounds[0] >= bounds[1] {
        return bounds[0];
    }
    rng.random_range(bounds[0]..=bounds[1])
}

/// Vehicles `AMB-001..` (ICUs first, then advanced, then basic) scattered over
/// the service area, and responders `MED-001..` cycling through specialties.
pub fn build_fleet(fleet: &FleetConfig, rng: &mut SmallRng) -> (Vec<Vehicle>, Vec<Responder>) {
    let icu = (fleet.vehicles as f64 * fleet.mobile_icu_share).round() as usize;
    let advanced = (fleet.vehicles as f64 * fleet.advanced_share).round() as usize;
    let vehicles = (0..fleet.vehicles)
        .map(|i| {
            let category = if i < icu {
                VehicleCategory::MobileIcu
            } else if i < icu + advanced {
                VehicleCategory::Advanced
            } else {
                VehicleCategory::Basic
            };
            let position = Coord::new(random_in(rng, fleet.area_x), random_in(rng, fleet.area_y));
            Vehicle::new(format!("AMB-{:03}", i + 1), category, position)
        })
        .collect();
    let responders = (0..fleet.responders)
        .map(|i| {
            let specialty = Specialty::ALL[i % Specialty::ALL.len()];
            let name = format!("{} {}", SURNAMES[i % SURNAMES.len()], i + 1);
            Responder::new(format!("MED-{:03}", i + 1), name, specialty)
        })
        .collect();
    (vehicles, responders)
}

/// 10% critical, 20% severe, 30% moderate, 40% minor.
fn pick_priority(roll: u32) -> PriorityClass {
    match roll {
        0..10 => PriorityClass::Critical,
        10..30 => PriorityClass::Severe,
        30..60 => PriorityClass::Moderate,
        _ => PriorityClass::Minor,
    }
}

fn random_request(dispatcher: &Dispatcher, rng: &mut SmallRng) -> Request {
    let area = &dispatcher.config().fleet;
    let priority = pick_priority(rng.random_range(0..100));
    let location = Coord::new(random_in(rng, area.area_x), random_in(rng, area.area_y));
    let address = ADDRESSES[rng.random_range(0..ADDRESSES.len())];
    let description = DESCRIPTIONS[rng.random_range(0..DESCRIPTIONS.len())];
    dispatcher.new_request(priority, location, address, description)
}

/// Call operator: submits random requests every 0.5 to 3 time units until
/// `stop` is set, `limit` is reached, or intake closes. Returns its count.
fn spawn_producer(
    index: usize,
    dispatcher: Arc<Dispatcher>,
    limit: Option<usize>,
    stop: Arc<AtomicBool>,
    seed: u64,
) -> Result<thread::JoinHandle<usize>> {
    let name = format!("operator-{index}");
    let handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let mut rng = SmallRng::seed_from_u64(seed);
            let unit_ms = dispatcher.config().time_unit_ms;
            let mut submitted = 0;
            while !stop.load(Ordering::SeqCst) && limit.is_none_or(|limit| submitted < limit) {
                let pause = unit_ms * rng.random_range(500..3_000) / 1_000;
                thread::sleep(Duration::from_millis(pause));
                let request = random_request(&dispatcher, &mut rng);
                let priority = request.priority();
                match dispatcher.submit(request) {
                    Ok(id) => {
                        submitted += 1;
                        debug!(operator = %name, request = id, %priority, "call logged");
                    }
                    Err(DispatchError::IntakeClosed(_)) => break,
                    Err(err) => {
                        warn!(operator = %name, %err, "submit failed");
                        break;
                    }
                }
            }
            submitted
        })
        .with_context(|| format!("failed to spawn producer {index}"))?;
    Ok(handle)
}

/// Render the status board shown by the monitor thread.
pub fn render_dashboard(dispatcher: &Dispatcher, top: usize) -> String {
    let snapshot = dispatcher.snapshot();
    let queue = &snapshot.queue;
    let mut out = String::new();
    let _ = writeln!(out, "==================== DISPATCH STATUS ====================");
    let _ = writeln!(
        out,
        "pending={} active={} completed={} cancelled={} abandoned={} requeued={}",
        queue.pending, queue.active, queue.completed, queue.cancelled, queue.abandoned, queue.requeued
    );
    let by_priority: Vec<String> = queue
        .by_priority
        .iter()
        .map(|(priority, count)| format!("{priority}={count}"))
        .collect();
    let _ = writeln!(out, "received: {}", by_priority.join(" "));
    let _ = writeln!(
        out,
        "vehicles {}/{} free, responders {}/{} free",
        snapshot.vehicles.available,
        snapshot.vehicles.total,
        snapshot.responders.available,
        snapshot.responders.total
    );
    let pending = dispatcher.top_pending(top);
    if !pending.is_empty() {
        let _ = writeln!(out, "next up:");
        for summary in pending {
            let _ = writeln!(
                out,
                "  #{:<5} {:<8} {:<28} waited={:>6.1}s score={:.2}",
                summary.id,
                summary.priority,
                summary.address,
                summary.waited.as_secs_f64(),
                summary.effective_priority
            );
        }
    }
    let busy = dispatcher.busy_vehicles();
    if !busy.is_empty() {
        let _ = writeln!(out, "on call:");
        for (vehicle, request) in busy {
            match request {
                Some(request) => {
                    let _ = writeln!(out, "  {vehicle} -> #{request}");
                }
                None => {
                    let _ = writeln!(out, "  {vehicle} (claiming)");
                }
            }
        }
    }
    let _ = write!(out, "=========================================================");
    out
}

/// Status board thread: prints the dashboard every `every` until `stop`.
fn spawn_monitor(
    dispatcher: Arc<Dispatcher>,
    every: Duration,
    stop: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("status-monitor".to_string())
        .spawn(move || {
            let poll = every.min(Duration::from_millis(50)).max(Duration::from_millis(1));
            let mut last = Instant::now();
            while !stop.load(Ordering::SeqCst) {
                thread::sleep(poll);
                if last.elapsed() >= every {
                    println!("{}", render_dashboard(&dispatcher, 5));
                    last = Instant::now();
                }
            }
        })
        .context("failed to spawn status monitor")
}

/// Counts lifecycle events and checks allocation exclusivity as they happen.
#[derive(Default)]
struct EventTally {
    created: AtomicUsize,
    assigned: AtomicUsize,
    completed: AtomicUsize,
    wait_us: AtomicU64,
    vehicles_out: Mutex<HashSet<String>>,
    requests_seen: Mutex<HashSet<u64>>,
    double_allocation: AtomicBool,
    duplicate_requests: AtomicBool,
}

impl DispatchListener for EventTally {
    fn on_created(&self, _request: &Request) {
        self.created.fetch_add(1, Ordering::SeqCst);
    }

    fn on_assigned(&self, request: &Request) {
        self.assigned.fetch_add(1, Ordering::SeqCst);
        let waited = request.waited(Instant::now()).as_micros() as u64;
        self.wait_us.fetch_add(waited, Ordering::SeqCst);
        if !self.requests_seen.lock().insert(request.id()) {
            self.duplicate_requests.store(true, Ordering::SeqCst);
        }
        if let Some(vehicle) = request.assigned_vehicle() {
            if !self.vehicles_out.lock().insert(vehicle.to_string()) {
                self.double_allocation.store(true, Ordering::SeqCst);
            }
        }
    }

    fn on_completed(&self, request: &Request) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        if let Some(vehicle) = request.assigned_vehicle() {
            self.vehicles_out.lock().remove(vehicle);
        }
    }
}

#[derive(Clone, Debug)]
pub struct DemoOptions {
    pub producers: usize,
    /// Stop each producer after this many requests instead of on a timer.
    pub requests_per_producer: Option<usize>,
    /// How long producers run, in time units, when no per-producer limit is set.
    pub duration_units: u64,
    /// Dashboard period in time units; zero disables the monitor.
    pub dashboard_units: u64,
    pub seed: Option<u64>,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            producers: 2,
            requests_per_producer: None,
            duration_units: 30,
            dashboard_units: 5,
            seed: None,
        }
    }
}

/// Full run: fleet, workers, producers, monitor, then the shutdown sequence.
pub fn run_demo(config: DispatchConfig, options: DemoOptions) -> Result<()> {
    let seed = options.seed.unwrap_or_else(rand::random);
    let mut rng = SmallRng::seed_from_u64(seed);
    let (vehicles, responders) = build_fleet(&config.fleet, &mut rng);
    let workers = config.workers;
    info!(seed, vehicles = vehicles.len(), responders = responders.len(), workers, "starting dispatch centre");

    let dispatcher = Arc::new(Dispatcher::new(config, vehicles, responders));
    let tally = Arc::new(EventTally::default());
    dispatcher.add_listener(tally.clone());
    dispatcher.start(workers)?;

    let stop_producers = Arc::new(AtomicBool::new(false));
    let mut producers = Vec::with_capacity(options.producers);
    for index in 1..=options.producers {
        producers.push(spawn_producer(
            index,
            Arc::clone(&dispatcher),
            options.requests_per_producer,
            Arc::clone(&stop_producers),
            seed.wrapping_add(index as u64),
        )?);
    }

    let stop_monitor = Arc::new(AtomicBool::new(false));
    let monitor = if options.dashboard_units > 0 {
        let every = dispatcher.config().units(options.dashboard_units);
        Some(spawn_monitor(Arc::clone(&dispatcher), every, Arc::clone(&stop_monitor))?)
    } else {
        None
    };

    if options.requests_per_producer.is_none() {
        thread::sleep(dispatcher.config().units(options.duration_units));
        stop_producers.store(true, Ordering::SeqCst);
    }
    let mut submitted = 0;
    for producer in producers {
        submitted += producer
            .join()
            .map_err(|_| anyhow::anyhow!("producer thread panicked"))?;
    }
    info!(submitted, "producers stopped");

    let report = dispatcher.shutdown()?;
    stop_monitor.store(true, Ordering::SeqCst);
    if let Some(monitor) = monitor {
        monitor
            .join()
            .map_err(|_| anyhow::anyhow!("status monitor panicked"))?;
    }

    print_demo_summary(&report, &tally, submitted);
    Ok(())
}

fn print_demo_summary(report: &FinalReport, tally: &EventTally, submitted: usize) {
    let per_worker: Vec<usize> = report.workers.iter().map(|w| w.processed).collect();
    let queue = &report.queue;
    println!("DEMO SUMMARY");
    println!("workers={} requests_submitted={submitted}", report.workers.len());
    println!("processed_per_worker={per_worker:?}");
    println!(
        "completed={} cancelled={} abandoned={} requeued={}",
        queue.completed, queue.cancelled, queue.abandoned, queue.requeued
    );
    println!("pending={}", queue.pending);
    println!("active={}", queue.active);
    println!(
        "events created={} assigned={} completed={}",
        tally.created.load(Ordering::SeqCst),
        tally.assigned.load(Ordering::SeqCst),
        tally.completed.load(Ordering::SeqCst)
    );
    println!(
        "vehicles_free={}/{} responders_free={}/{}",
        report.vehicles.available, report.vehicles.total, report.responders.available, report.responders.total
    );
    println!("pool_invariant={}", report.pools_settled());
    println!("double_allocation={}", tally.double_allocation.load(Ordering::SeqCst));
    println!("drained={} forced={}", report.drained, report.forced);
}

/// Parameters of one benchmark run.
#[derive(Clone, Copy, Debug)]
pub struct BenchParams {
    pub workers: usize,
    pub requests: usize,
    pub vehicles: usize,
    pub responders: usize,
    pub time_unit_ms: u64,
    pub seed: u64,
}

/// Aggregated metrics from a single benchmark run.
struct BenchResult {
    params: BenchParams,
    elapsed_ms: f64,
    throughput: f64,
    avg_dispatch_wait_us: f64,
    cpu_user_s: Option<f64>,
    cpu_sys_s: Option<f64>,
    completed: usize,
    requeued: usize,
    pool_invariant: bool,
    double_allocation: bool,
    duplicate_requests: bool,
    conserved: bool,
}

const BENCH_HEADER: &str = "workers,requests,vehicles,responders,time_unit_ms,elapsed_ms,throughput_req_per_s,avg_dispatch_wait_us,cpu_user_s,cpu_sys_s,completed,requeued,pool_invariant,double_allocation,duplicate_requests,conserved";

impl BenchResult {
    fn csv_row(&self) -> String {
        let cpu = |v: Option<f64>| v.map_or_else(|| "NA".to_string(), |v| format!("{v:.4}"));
        let p = &self.params;
        format!(
            "{},{},{},{},{},{:.2},{:.2},{:.2},{},{},{},{},{},{},{},{}",
            p.workers,
            p.requests,
            p.vehicles,
            p.responders,
            p.time_unit_ms,
            self.elapsed_ms,
            self.throughput,
            self.avg_dispatch_wait_us,
            cpu(self.cpu_user_s),
            cpu(self.cpu_sys_s),
            self.completed,
            self.requeued,
            self.pool_invariant,
            self.double_allocation,
            self.duplicate_requests,
            self.conserved
        )
    }

    fn report_violations(&self) {
        if !self.pool_invariant {
            eprintln!("# violation,pool_invariant");
        }
        if self.double_allocation {
            eprintln!("# violation,double_allocation");
        }
        if self.duplicate_requests {
            eprintln!("# violation,duplicate_requests");
        }
        if !self.conserved {
            eprintln!("# violation,conservation");
        }
    }
}

fn bench_once(base: &DispatchConfig, params: BenchParams) -> Result<BenchResult> {
    let mut config = base.clone();
    config.workers = params.workers;
    config.time_unit_ms = params.time_unit_ms;
    config.fleet.vehicles = params.vehicles;
    config.fleet.responders = params.responders;
    // Every request must finish inside the drain window.
    config.drain_window_units = config.drain_window_units.max(params.requests as u64 * 20);

    let mut rng = SmallRng::seed_from_u64(params.seed);
    let (vehicles, responders) = build_fleet(&config.fleet, &mut rng);
    let dispatcher = Dispatcher::new(config, vehicles, responders);
    let tally = Arc::new(EventTally::default());
    dispatcher.add_listener(tally.clone());

    for _ in 0..params.requests {
        let request = random_request(&dispatcher, &mut rng);
        dispatcher.submit(request)?;
    }

    let cpu_start = cpu_times_seconds();
    let start = Instant::now();
    dispatcher.start(params.workers)?;
    let report = dispatcher.shutdown()?;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1_000.0;

    let (cpu_user_s, cpu_sys_s) = match (cpu_start, cpu_times_seconds()) {
        (Some((user_start, sys_start)), Some((user_end, sys_end))) => {
            (Some(user_end - user_start), Some(sys_end - sys_start))
        }
        _ => (None, None),
    };
    let completed = report.queue.completed;
    let assigned = tally.assigned.load(Ordering::SeqCst);
    let conserved = completed + report.queue.pending + report.queue.abandoned == params.requests
        && report.vehicle_counters.acquired == report.vehicle_counters.released
        && report.responder_counters.acquired == report.responder_counters.released
        && report.vehicle_counters.rejected_releases == 0
        && report.responder_counters.rejected_releases == 0;

    Ok(BenchResult {
        params,
        elapsed_ms,
        throughput: if elapsed_ms > 0.0 {
            completed as f64 / (elapsed_ms / 1_000.0)
        } else {
            0.0
        },
        avg_dispatch_wait_us: if assigned > 0 {
            tally.wait_us.load(Ordering::SeqCst) as f64 / assigned as f64
        } else {
            0.0
        },
        cpu_user_s,
        cpu_sys_s,
        completed,
        requeued: report.queue.requeued,
        pool_invariant: report.pools_settled(),
        double_allocation: tally.double_allocation.load(Ordering::SeqCst),
        duplicate_requests: tally.duplicate_requests.load(Ordering::SeqCst),
        conserved,
    })
}

/// Single benchmark run; prints a CSV header and one row.
pub fn run_benchmark(config: &DispatchConfig, params: BenchParams, validate: bool) -> Result<()> {
    let result = bench_once(config, params)?;
    println!("{BENCH_HEADER}");
    println!("{}", result.csv_row());
    if validate {
        result.report_violations();
    }
    Ok(())
}

/// Sweep worker and request counts; one CSV row per combination.
pub fn run_stress(
    config: &DispatchConfig,
    base: BenchParams,
    worker_sets: &[usize],
    request_sets: &[usize],
    validate: bool,
) -> Result<()> {
    if worker_sets.contains(&0) {
        anyhow::bail!("worker counts must be > 0");
    }
    println!("{BENCH_HEADER}");
    for &workers in worker_sets {
        for &requests in request_sets {
            let params = BenchParams {
                workers,
                requests,
                ..base
            };
            let result = bench_once(config, params)?;
            println!("{}", result.csv_row());
            if validate {
                result.report_violations();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fleet_follows_category_split() {
        let mut rng = SmallRng::seed_from_u64(7);
        let (vehicles, responders) = build_fleet(&FleetConfig::default(), &mut rng);
        let categories: Vec<VehicleCategory> = vehicles.iter().map(|v| v.category()).collect();
        assert_eq!(categories[..3], [VehicleCategory::MobileIcu; 3]);
        assert_eq!(categories[3..6], [VehicleCategory::Advanced; 3]);
        assert!(categories[6..].iter().all(|c| *c == VehicleCategory::Basic));
        assert_eq!(responders.len(), 20);
        assert_eq!(responders[5].specialty(), Specialty::Paramedic);

        let area = FleetConfig::default();
        for vehicle in &vehicles {
            let p = vehicle.position();
            assert!((area.area_x[0]..=area.area_x[1]).contains(&p.x));
            assert!((area.area_y[0]..=area.area_y[1]).contains(&p.y));
        }
    }

    #[test]
    fn priority_roll_matches_distribution() {
        let counts = (0..100).fold([0usize; 4], |mut acc, roll| {
            acc[pick_priority(roll).weight() as usize - 1] += 1;
            acc
        });
        // Indexed by weight - 1: minor, moderate, severe, critical.
        assert_eq!(counts, [40, 30, 20, 10]);
    }

    #[test]
    fn dashboard_lists_pending_work() {
        let dispatcher = Dispatcher::new(DispatchConfig::default(), Vec::new(), Vec::new());
        let request = dispatcher.new_request(PriorityClass::Critical, Coord::default(), "Harbour road", "seizure");
        dispatcher.submit(request).expect("intake open");
        let board = render_dashboard(&dispatcher, 3);
        assert!(board.contains("pending=1"));
        assert!(board.contains("CRITICAL=1"));
        assert!(board.contains("Harbour road"));
        assert!(board.contains("vehicles 0/0 free"));
    }

    #[test]
    fn small_bench_validates_clean() {
        let params = BenchParams {
            workers: 3,
            requests: 15,
            vehicles: 3,
            responders: 6,
            time_unit_ms: 1,
            seed: 11,
        };
        let result = bench_once(&DispatchConfig::default(), params).expect("bench");
        assert_eq!(result.completed, 15);
        assert!(result.pool_invariant);
        assert!(!result.double_allocation);
        assert!(!result.duplicate_requests);
        assert!(result.conserved);
    }
}
