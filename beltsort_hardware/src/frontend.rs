//! Stand-ins for the external capture and inference collaborators.
//!
//! The camera driver and the neural inference engine live outside this
//! system; integrators hand their own implementations to the orchestrator
//! builder. These simulated versions back the CLI's simulation mode and the
//! test suites, and are available regardless of the `hardware` feature.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beltsort_traits::{BoxError, Classifier, Detection, Frame, FrameSource};

/// Camera stand-in producing empty frames with a running sequence number.
#[derive(Default)]
pub struct SimCamera {
    seq: u64,
    pub fail_next: bool,
}

impl SimCamera {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameSource for SimCamera {
    fn capture(&mut self, _timeout: Duration) -> Result<Frame, BoxError> {
        if self.fail_next {
            self.fail_next = false;
            return Err("simulated capture failure".into());
        }
        self.seq += 1;
        Ok(Frame {
            seq: self.seq,
            data: Vec::new(),
        })
    }
}

/// Scripted classifier: pops pre-loaded responses, falling back to a fixed
/// label. Clones share the script so tests can push results mid-run.
#[derive(Clone)]
pub struct SimClassifier {
    script: Arc<Mutex<VecDeque<Result<Vec<Detection>, String>>>>,
    default_label: String,
    default_confidence: f32,
}

impl SimClassifier {
    pub fn new(default_label: &str, default_confidence: f32) -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            default_label: default_label.to_string(),
            default_confidence,
        }
    }

    pub fn push_result(&self, r: Result<Vec<Detection>, String>) {
        if let Ok(mut q) = self.script.lock() {
            q.push_back(r);
        }
    }

    pub fn push_detection(&self, label: &str, confidence: f32) {
        self.push_result(Ok(vec![Detection {
            label: label.to_string(),
            confidence,
            bbox: None,
        }]));
    }
}

impl Classifier for SimClassifier {
    fn classify(&mut self, _frame: &Frame, _deadline: Duration) -> Result<Vec<Detection>, BoxError> {
        let scripted = self.script.lock().ok().and_then(|mut q| q.pop_front());
        match scripted {
            Some(Ok(dets)) => Ok(dets),
            Some(Err(msg)) => Err(msg.into()),
            None => Ok(vec![Detection {
                label: self.default_label.clone(),
                confidence: self.default_confidence,
                bbox: None,
            }]),
        }
    }
}
