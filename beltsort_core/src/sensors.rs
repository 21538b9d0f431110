//! Camera-trigger listener: owns the edge input on a background thread,
//! applies the debounce window, and feeds the orchestrator over a bounded
//! channel. When the consumer lags, edges are coalesced (dropped) rather
//! than ever blocking the listener.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use beltsort_traits::EdgeInput;
use crossbeam_channel as xch;

/// A debounced camera-trigger edge. One edge becomes one item in the
/// pipeline; the orchestrator assigns ids.
#[derive(Debug, Clone, Copy)]
pub struct TriggerEvent {
    pub at: Instant,
}

const QUEUE_DEPTH: usize = 32;
const POLL_TIMEOUT: Duration = Duration::from_millis(20);

pub struct TriggerListener {
    rx: xch::Receiver<TriggerEvent>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TriggerListener {
    pub fn spawn<E: EdgeInput + Send + 'static>(mut input: E, debounce: Duration) -> Self {
        let (tx, rx) = xch::bounded(QUEUE_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_bg = stop.clone();

        let handle = std::thread::spawn(move || {
            let mut last_edge: Option<Instant> = None;
            while !stop_bg.load(Ordering::Relaxed) {
                match input.wait_edge(POLL_TIMEOUT) {
                    Ok(Some(at)) => {
                        // Two edges inside the debounce window collapse into
                        // the first.
                        if let Some(prev) = last_edge
                            && at.saturating_duration_since(prev) < debounce
                        {
                            continue;
                        }
                        last_edge = Some(at);
                        if tx.try_send(TriggerEvent { at }).is_err() {
                            tracing::warn!("trigger queue full, coalescing edge");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "trigger input read failed");
                        std::thread::sleep(Duration::from_millis(5));
                    }
                }
            }
        });

        Self {
            rx,
            stop,
            handle: Some(handle),
        }
    }

    /// Channel the orchestrator consumes.
    pub fn events(&self) -> xch::Receiver<TriggerEvent> {
        self.rx.clone()
    }
}

impl Drop for TriggerListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beltsort_traits::BoxError;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct QueueInput(Arc<Mutex<VecDeque<Instant>>>);

    impl EdgeInput for QueueInput {
        fn wait_edge(&mut self, _timeout: Duration) -> Result<Option<Instant>, BoxError> {
            Ok(self.0.lock().unwrap().pop_front())
        }
    }

    #[test]
    fn edges_inside_debounce_window_collapse() {
        let t0 = Instant::now();
        let input = QueueInput::default();
        {
            let mut q = input.0.lock().unwrap();
            q.push_back(t0);
            q.push_back(t0 + Duration::from_millis(10)); // inside 50 ms window
            q.push_back(t0 + Duration::from_millis(120)); // distinct event
        }
        let listener = TriggerListener::spawn(input, Duration::from_millis(50));

        let rx = listener.events();
        let first = rx.recv_timeout(Duration::from_secs(1)).expect("first edge");
        assert_eq!(first.at, t0);
        let second = rx.recv_timeout(Duration::from_secs(1)).expect("second edge");
        assert_eq!(second.at, t0 + Duration::from_millis(120));
        assert!(rx.try_recv().is_err());
    }
}
