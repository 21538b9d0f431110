//! In-process telemetry fan-out.
//!
//! Publication never blocks: each subscriber owns a bounded queue and a drop
//! policy. The database writer subscribes with a deep buffer and drop-newest;
//! a live front-end broadcaster subscribes shallow with drop-oldest. Within
//! one topic, events arrive in publication order (single publish lock).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use beltsort_traits::{BBox, Category};
use crossbeam_channel as xch;

use crate::error::DropReason;
use crate::fault::{FaultKind, Severity};
use crate::metrics::MetricsSnapshot;
use crate::state::SystemState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    ItemActuated,
    ItemDropped,
    Metrics,
    StateChanged,
    Alert,
    BinChanged,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ItemActuated => "item.actuated",
            Topic::ItemDropped => "item.dropped",
            Topic::Metrics => "metrics",
            Topic::StateChanged => "state.changed",
            Topic::Alert => "alert",
            Topic::BinChanged => "bin.changed",
        }
    }
}

/// Telemetry event shapes. Timestamps are nanoseconds since the orchestrator
/// epoch (monotonic, not wall time).
#[derive(Debug, Clone)]
pub enum Event {
    ItemActuated {
        item_id: u64,
        trigger_ns: u64,
        classify_ns: u64,
        fire_ns: u64,
        category: Category,
        confidence: f32,
        bbox: Option<BBox>,
        diverter_op_count: u64,
    },
    ItemDropped {
        item_id: u64,
        trigger_ns: u64,
        reason: DropReason,
    },
    StateChanged {
        from: SystemState,
        to: SystemState,
        reason: String,
    },
    Alert {
        severity: Severity,
        kind: FaultKind,
        component: String,
        message: String,
    },
    Metrics(MetricsSnapshot),
    BinChanged {
        category: Category,
        fill_fraction: f32,
        state: &'static str,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::ItemActuated { .. } => Topic::ItemActuated,
            Event::ItemDropped { .. } => Topic::ItemDropped,
            Event::StateChanged { .. } => Topic::StateChanged,
            Event::Alert { .. } => Topic::Alert,
            Event::Metrics(_) => Topic::Metrics,
            Event::BinChanged { .. } => Topic::BinChanged,
        }
    }
}

/// What to do when a subscriber's buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest buffered event to make room (live streams).
    DropOldest,
    /// Discard the incoming event (batch writers that must keep history order).
    DropNewest,
}

struct SubEntry {
    name: &'static str,
    topics: Option<Vec<Topic>>,
    tx: xch::Sender<Event>,
    rx_for_evict: xch::Receiver<Event>,
    policy: OverflowPolicy,
    dropped: Arc<AtomicU64>,
    // The bus holds a receiver clone for eviction, so sender disconnection
    // can't signal subscriber death; this weak token does.
    alive: std::sync::Weak<()>,
}

/// Receiving side of a subscription. Dropping it unsubscribes on the next
/// publish.
pub struct Subscription {
    pub rx: xch::Receiver<Event>,
    dropped: Arc<AtomicU64>,
    _alive: Arc<()>,
}

impl Subscription {
    /// Events lost to this subscriber's overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Topic-based pub/sub hub. Cheap to clone and share.
#[derive(Clone, Default)]
pub struct TelemetryBus {
    subs: Arc<Mutex<Vec<SubEntry>>>,
}

impl TelemetryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the given topics (`None` = everything) with a bounded
    /// buffer of `capacity` events.
    pub fn subscribe(
        &self,
        name: &'static str,
        topics: Option<Vec<Topic>>,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Subscription {
        let (tx, rx) = xch::bounded(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let alive = Arc::new(());
        let entry = SubEntry {
            name,
            topics,
            tx,
            rx_for_evict: rx.clone(),
            policy,
            dropped: dropped.clone(),
            alive: Arc::downgrade(&alive),
        };
        if let Ok(mut subs) = self.subs.lock() {
            subs.push(entry);
        }
        Subscription {
            rx,
            dropped,
            _alive: alive,
        }
    }

    /// Deliver to every interested subscriber without ever blocking.
    pub fn publish(&self, event: Event) {
        let topic = event.topic();
        let Ok(mut subs) = self.subs.lock() else {
            return;
        };
        subs.retain(|s| {
            if s.alive.upgrade().is_none() {
                return false;
            }
            if let Some(filter) = &s.topics
                && !filter.contains(&topic)
            {
                return true;
            }
            match s.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(xch::TrySendError::Full(ev)) => {
                    s.dropped.fetch_add(1, Ordering::Relaxed);
                    match s.policy {
                        OverflowPolicy::DropOldest => {
                            let _ = s.rx_for_evict.try_recv();
                            if s.tx.try_send(ev).is_err() {
                                tracing::trace!(subscriber = s.name, "overflow after evict");
                            }
                        }
                        OverflowPolicy::DropNewest => {
                            tracing::trace!(subscriber = s.name, "dropping newest event");
                        }
                    }
                    true
                }
                Err(xch::TrySendError::Disconnected(_)) => false,
            }
        });
    }
}
