//! Diverter worker pool.
//!
//! Each diverter gets a dedicated worker thread fed by a rendezvous channel,
//! so the scheduler loop never blocks on GPIO and "at most one activation per
//! diverter" holds structurally. Commands carry the scheduler generation;
//! a command that outlived a cancellation is a no-op at the worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use beltsort_traits::{Actuator, Category};
use crossbeam_channel as xch;

use crate::scheduler::PendingFire;

#[derive(Debug)]
pub struct FireCommand {
    pub fire: PendingFire,
    pub generation: u64,
}

/// Reported by a worker after an activation attempt.
#[derive(Debug)]
pub struct FireResult {
    pub fire: PendingFire,
    pub outcome: Result<u64, String>,
    /// Operation count crossed the maintenance ceiling (still activated).
    pub maintenance_due: bool,
    pub finished_at: Instant,
}

#[derive(Debug, Clone)]
pub struct DiverterStatus {
    pub enabled: bool,
    pub op_count: u64,
    pub fault_count: u64,
    pub last_op_at: Option<Instant>,
}

struct Shared {
    enabled: AtomicBool,
    op_count: AtomicU64,
    fault_count: AtomicU64,
    last_op_at: std::sync::Mutex<Option<Instant>>,
}

struct Unit {
    tx: xch::Sender<FireCommand>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

pub struct DiverterPool {
    units: HashMap<Category, Unit>,
    results_tx: xch::Sender<FireResult>,
    results_rx: xch::Receiver<FireResult>,
    generation: Arc<AtomicU64>,
}

impl Default for DiverterPool {
    fn default() -> Self {
        Self::new()
    }
}

impl DiverterPool {
    pub fn new() -> Self {
        let (results_tx, results_rx) = xch::unbounded();
        Self {
            units: HashMap::new(),
            results_tx,
            results_rx,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a diverter and spawn its worker.
    pub fn add_diverter(
        &mut self,
        category: Category,
        mut actuator: Box<dyn Actuator + Send>,
        max_operations: Option<u64>,
    ) {
        // Rendezvous channel: try_send only succeeds while the worker is
        // parked at recv, so a busy diverter rejects the overlapping fire.
        let (tx, rx) = xch::bounded::<FireCommand>(0);
        let shared = Arc::new(Shared {
            enabled: AtomicBool::new(true),
            op_count: AtomicU64::new(0),
            fault_count: AtomicU64::new(0),
            last_op_at: std::sync::Mutex::new(None),
        });
        let shared_bg = shared.clone();
        let results_tx = self.results_tx.clone();
        let generation = self.generation.clone();

        let handle = std::thread::spawn(move || {
            for cmd in rx.iter() {
                if cmd.generation != generation.load(Ordering::Acquire) {
                    tracing::debug!(item_id = cmd.fire.item_id, "skipping cancelled fire command");
                    continue;
                }
                if !shared_bg.enabled.load(Ordering::Acquire) {
                    let _ = results_tx.send(FireResult {
                        fire: cmd.fire,
                        outcome: Err("diverter disabled".into()),
                        maintenance_due: false,
                        finished_at: Instant::now(),
                    });
                    continue;
                }
                let duration = cmd.fire.duration;
                let outcome = match actuator.activate(duration) {
                    Ok(()) => {
                        let ops = shared_bg.op_count.fetch_add(1, Ordering::AcqRel) + 1;
                        if let Ok(mut last) = shared_bg.last_op_at.lock() {
                            *last = Some(Instant::now());
                        }
                        Ok(ops)
                    }
                    Err(e) => {
                        shared_bg.fault_count.fetch_add(1, Ordering::AcqRel);
                        Err(e.to_string())
                    }
                };
                let maintenance_due = match (&outcome, max_operations) {
                    (Ok(ops), Some(max)) => *ops >= max,
                    _ => false,
                };
                let _ = results_tx.send(FireResult {
                    fire: cmd.fire,
                    outcome,
                    maintenance_due,
                    finished_at: Instant::now(),
                });
            }
        });

        self.units.insert(
            category,
            Unit {
                tx,
                shared,
                handle: Some(handle),
            },
        );
    }

    pub fn has(&self, category: Category) -> bool {
        self.units.contains_key(&category)
    }

    /// Hand a due fire to its worker. Fails fast (returning the fire) when
    /// the diverter is unknown or an activation is already in flight.
    pub fn dispatch(&self, fire: PendingFire, generation: u64) -> Result<(), PendingFire> {
        let Some(unit) = self.units.get(&fire.category) else {
            return Err(fire);
        };
        match unit.tx.try_send(FireCommand { fire, generation }) {
            Ok(()) => Ok(()),
            Err(xch::TrySendError::Full(cmd)) | Err(xch::TrySendError::Disconnected(cmd)) => {
                Err(cmd.fire)
            }
        }
    }

    /// Non-blocking: collect finished activations.
    pub fn drain_results(&self) -> Vec<FireResult> {
        self.results_rx.try_iter().collect()
    }

    /// Invalidate queued-but-unstarted commands (E-stop, shutdown).
    pub fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::Release);
    }

    pub fn disable(&self, category: Category) {
        if let Some(u) = self.units.get(&category) {
            u.shared.enabled.store(false, Ordering::Release);
            tracing::warn!(%category, "diverter disabled");
        }
    }

    pub fn enable(&self, category: Category) {
        if let Some(u) = self.units.get(&category) {
            u.shared.enabled.store(true, Ordering::Release);
        }
    }

    pub fn disable_all(&self) {
        for (category, u) in &self.units {
            u.shared.enabled.store(false, Ordering::Release);
            tracing::warn!(%category, "diverter disabled");
        }
    }

    pub fn enable_all(&self) {
        for u in self.units.values() {
            u.shared.enabled.store(true, Ordering::Release);
        }
    }

    pub fn is_enabled(&self, category: Category) -> bool {
        self.units
            .get(&category)
            .map(|u| u.shared.enabled.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn status(&self, category: Category) -> Option<DiverterStatus> {
        self.units.get(&category).map(|u| DiverterStatus {
            enabled: u.shared.enabled.load(Ordering::Acquire),
            op_count: u.shared.op_count.load(Ordering::Acquire),
            fault_count: u.shared.fault_count.load(Ordering::Acquire),
            last_op_at: u.shared.last_op_at.lock().map(|g| *g).unwrap_or(None),
        })
    }

    pub fn statuses(&self) -> HashMap<Category, DiverterStatus> {
        self.units
            .keys()
            .filter_map(|c| self.status(*c).map(|s| (*c, s)))
            .collect()
    }

    /// Close the command channels and wait for workers to finish their
    /// current activation, bounded by `drain`.
    pub fn shutdown(&mut self, drain: Duration) {
        for unit in self.units.values_mut() {
            // Dropping the sender ends the worker's iterator.
            let (dead_tx, _) = xch::bounded(1);
            unit.tx = dead_tx;
        }
        let deadline = Instant::now() + drain;
        for (category, unit) in self.units.iter_mut() {
            if let Some(handle) = unit.handle.take() {
                if Instant::now() < deadline {
                    let _ = handle.join();
                } else {
                    tracing::warn!(%category, "abandoning diverter worker past drain deadline");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beltsort_traits::BoxError;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct CountingActuator {
        activations: Arc<Mutex<Vec<Duration>>>,
        fail: Arc<AtomicBool>,
    }

    impl Actuator for CountingActuator {
        fn initialize(&mut self) -> Result<(), BoxError> {
            Ok(())
        }
        fn activate(&mut self, duration: Duration) -> Result<(), BoxError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err("gpio write failed".into());
            }
            self.activations.lock().unwrap().push(duration);
            Ok(())
        }
        fn home(&mut self) -> Result<(), BoxError> {
            Ok(())
        }
        fn shutdown(&mut self) -> Result<(), BoxError> {
            Ok(())
        }
    }

    fn fire(id: u64, category: Category) -> PendingFire {
        let now = Instant::now();
        PendingFire {
            fire_at: now,
            latest: now + Duration::from_millis(50),
            trigger_at: now,
            classify_at: now,
            item_id: id,
            category,
            duration: Duration::from_millis(1),
            confidence: 0.9,
            bbox: None,
            generation: 0,
        }
    }

    fn wait_results(pool: &DiverterPool, n: usize) -> Vec<FireResult> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut out = Vec::new();
        while out.len() < n && Instant::now() < deadline {
            out.extend(pool.drain_results());
            std::thread::sleep(Duration::from_millis(1));
        }
        out
    }

    #[test]
    fn activation_success_increments_op_count() {
        let mut pool = DiverterPool::new();
        let act = CountingActuator::default();
        pool.add_diverter(Category::Metal, Box::new(act.clone()), None);

        pool.dispatch(fire(1, Category::Metal), 0).unwrap();
        let results = wait_results(&pool, 1);
        assert!(matches!(results[0].outcome, Ok(1)));
        assert_eq!(pool.status(Category::Metal).unwrap().op_count, 1);
    }

    #[test]
    fn failure_increments_fault_count() {
        let mut pool = DiverterPool::new();
        let act = CountingActuator::default();
        act.fail.store(true, Ordering::Relaxed);
        pool.add_diverter(Category::Metal, Box::new(act), None);

        pool.dispatch(fire(1, Category::Metal), 0).unwrap();
        let results = wait_results(&pool, 1);
        assert!(results[0].outcome.is_err());
        assert_eq!(pool.status(Category::Metal).unwrap().fault_count, 1);
    }

    #[test]
    fn disabled_diverter_rejects_fires() {
        let mut pool = DiverterPool::new();
        pool.add_diverter(Category::Metal, Box::new(CountingActuator::default()), None);
        pool.disable(Category::Metal);

        pool.dispatch(fire(1, Category::Metal), 0).unwrap();
        let results = wait_results(&pool, 1);
        assert!(results[0].outcome.as_ref().is_err_and(|e| e.contains("disabled")));
    }

    #[test]
    fn stale_generation_is_noop() {
        let mut pool = DiverterPool::new();
        let act = CountingActuator::default();
        pool.add_diverter(Category::Metal, Box::new(act.clone()), None);
        pool.set_generation(5);

        pool.dispatch(fire(1, Category::Metal), 4).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(pool.drain_results().is_empty());
        assert!(act.activations.lock().unwrap().is_empty());
    }

    #[test]
    fn maintenance_ceiling_flags_but_still_activates() {
        let mut pool = DiverterPool::new();
        pool.add_diverter(Category::Metal, Box::new(CountingActuator::default()), Some(2));

        pool.dispatch(fire(1, Category::Metal), 0).unwrap();
        let first = wait_results(&pool, 1);
        assert!(!first[0].maintenance_due);

        pool.dispatch(fire(2, Category::Metal), 0).unwrap();
        let second = wait_results(&pool, 1);
        assert!(second[0].maintenance_due);
        assert!(second[0].outcome.is_ok());
    }

    #[test]
    fn unknown_category_fails_fast() {
        let pool = DiverterPool::new();
        assert!(pool.dispatch(fire(1, Category::Glass), 0).is_err());
    }
}
