//! Running counters and the bounded metrics history.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use beltsort_traits::Category;
use chrono::{DateTime, Utc};

/// One periodic metrics sample, ring-buffered.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub wall_ts: DateTime<Utc>,
    pub uptime_s: f64,
    pub items_processed: u64,
    pub items_actuated: u64,
    pub items_dropped: u64,
    pub items_per_minute: f64,
    pub avg_confidence: f32,
    pub avg_processing_ms: f64,
    pub error_rate: f32,
    pub per_category: HashMap<Category, u64>,
    pub cpu_pct: f32,
    pub mem_pct: f32,
    pub temp_c: f32,
}

/// Accumulates pipeline outcomes between metrics ticks and over the run.
#[derive(Debug, Default)]
pub struct Counters {
    pub items_processed: u64,
    pub items_actuated: u64,
    pub items_dropped: u64,
    pub classify_errors: u64,
    pub actuation_failures: u64,
    pub recovery_attempts: u64,
    pub successful_recoveries: u64,
    confidence_sum: f64,
    confidence_n: u64,
    processing_ms_sum: f64,
    processing_n: u64,
    per_category: HashMap<Category, u64>,
    /// Completion instants in the last 60 s, for items/minute.
    recent: VecDeque<Instant>,
}

impl Counters {
    pub fn record_classified(&mut self, category: Category, confidence: f32, processing: Duration) {
        self.items_processed += 1;
        self.confidence_sum += f64::from(confidence);
        self.confidence_n += 1;
        self.processing_ms_sum += processing.as_secs_f64() * 1000.0;
        self.processing_n += 1;
        *self.per_category.entry(category).or_insert(0) += 1;
    }

    pub fn record_classify_error(&mut self) {
        self.items_processed += 1;
        self.classify_errors += 1;
    }

    pub fn record_actuated(&mut self, now: Instant) {
        self.items_actuated += 1;
        self.recent.push_back(now);
        self.prune(now);
    }

    pub fn record_dropped(&mut self) {
        self.items_dropped += 1;
    }

    pub fn record_actuation_failure(&mut self) {
        self.actuation_failures += 1;
    }

    pub fn items_per_minute(&mut self, now: Instant) -> f64 {
        self.prune(now);
        self.recent.len() as f64
    }

    /// Throughput over the last hour is approximated from the last minute.
    pub fn items_last_hour_estimate(&mut self, now: Instant) -> u32 {
        (self.items_per_minute(now) * 60.0) as u32
    }

    pub fn avg_confidence(&self) -> f32 {
        if self.confidence_n == 0 {
            0.0
        } else {
            (self.confidence_sum / self.confidence_n as f64) as f32
        }
    }

    pub fn avg_processing_ms(&self) -> f64 {
        if self.processing_n == 0 {
            0.0
        } else {
            self.processing_ms_sum / self.processing_n as f64
        }
    }

    pub fn error_rate(&self) -> f32 {
        if self.items_processed == 0 {
            0.0
        } else {
            (self.classify_errors + self.actuation_failures) as f32 / self.items_processed as f32
        }
    }

    pub fn per_category(&self) -> &HashMap<Category, u64> {
        &self.per_category
    }

    fn prune(&mut self, now: Instant) {
        let horizon = Duration::from_secs(60);
        while let Some(front) = self.recent.front() {
            if now.saturating_duration_since(*front) > horizon {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Bounded history of metrics snapshots, oldest evicted first.
#[derive(Debug)]
pub struct MetricsRing {
    buf: VecDeque<MetricsSnapshot>,
    cap: usize,
}

impl MetricsRing {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.max(1)),
            cap: cap.max(1),
        }
    }

    pub fn push(&mut self, snap: MetricsSnapshot) {
        if self.buf.len() == self.cap {
            self.buf.pop_front();
        }
        self.buf.push_back(snap);
    }

    pub fn latest(&self) -> Option<&MetricsSnapshot> {
        self.buf.back()
    }

    /// Most recent `window` snapshots, oldest first.
    pub fn window(&self, window: usize) -> Vec<MetricsSnapshot> {
        let skip = self.buf.len().saturating_sub(window);
        self.buf.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(n: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            wall_ts: Utc::now(),
            uptime_s: 0.0,
            items_processed: n,
            items_actuated: 0,
            items_dropped: 0,
            items_per_minute: 0.0,
            avg_confidence: 0.0,
            avg_processing_ms: 0.0,
            error_rate: 0.0,
            per_category: HashMap::new(),
            cpu_pct: 0.0,
            mem_pct: 0.0,
            temp_c: 0.0,
        }
    }

    #[test]
    fn ring_evicts_oldest() {
        let mut ring = MetricsRing::new(3);
        for n in 0..5 {
            ring.push(snap(n));
        }
        assert_eq!(ring.len(), 3);
        let w = ring.window(10);
        assert_eq!(w[0].items_processed, 2);
        assert_eq!(ring.latest().unwrap().items_processed, 4);
    }

    #[test]
    fn items_per_minute_prunes_old_completions() {
        let mut c = Counters::default();
        let t0 = Instant::now();
        c.record_actuated(t0);
        c.record_actuated(t0 + Duration::from_secs(10));
        assert_eq!(c.items_per_minute(t0 + Duration::from_secs(30)) as u64, 2);
        // First completion ages out past the 60 s horizon.
        assert_eq!(c.items_per_minute(t0 + Duration::from_secs(65)) as u64, 1);
    }

    #[test]
    fn error_rate_counts_both_sources() {
        let mut c = Counters::default();
        c.record_classified(Category::Metal, 0.9, Duration::from_millis(20));
        c.record_classify_error();
        assert!((c.error_rate() - 0.5).abs() < 1e-6);
    }
}
