//! Classifier client: wraps the raw inference backend with the confidence
//! policy and alias mapping.

use std::str::FromStr;

use beltsort_traits::{BBox, Category, Classifier, Frame};

use crate::config::ClassifyCfg;
use crate::error::SorterError;

/// Outcome of a classification attempt that produced a routable category.
#[derive(Debug, Clone)]
pub struct Classification {
    pub category: Category,
    pub confidence: f32,
    pub bbox: Option<BBox>,
    /// True when the result fell back because of low confidence or no
    /// detection; the pipeline still treats the item as classified.
    pub low_confidence: bool,
}

pub struct ClassifierClient {
    inner: Box<dyn Classifier + Send>,
    cfg: ClassifyCfg,
}

impl ClassifierClient {
    pub fn new(inner: Box<dyn Classifier + Send>, cfg: ClassifyCfg) -> Self {
        Self { inner, cfg }
    }

    pub fn set_cfg(&mut self, cfg: ClassifyCfg) {
        self.cfg = cfg;
    }

    /// Replace the backend (model failover), returning the previous one.
    pub fn swap_backend(
        &mut self,
        backend: Box<dyn Classifier + Send>,
    ) -> Box<dyn Classifier + Send> {
        std::mem::replace(&mut self.inner, backend)
    }

    /// Probe the backend with a blank frame (self-check, recovery).
    pub fn probe(&mut self) -> Result<(), SorterError> {
        self.classify(&Frame::default()).map(|_| ())
    }

    fn map_label(&self, label: &str) -> Option<Category> {
        if let Some(c) = self.cfg.aliases.get(label) {
            return Some(*c);
        }
        Category::from_str(label).ok()
    }

    /// Run inference and apply the routing policy: best detection wins,
    /// aliases map to canonical categories, anything unknown or below
    /// `min_confidence` becomes the fallback category with a flag.
    pub fn classify(&mut self, frame: &Frame) -> Result<Classification, SorterError> {
        let detections = self
            .inner
            .classify(frame, self.cfg.budget)
            .map_err(|e| {
                let s = e.to_string();
                if s.to_lowercase().contains("timeout") {
                    SorterError::Timeout("classifier")
                } else {
                    SorterError::Classifier(s)
                }
            })?;

        let best = detections
            .into_iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence));

        let Some(best) = best else {
            return Ok(Classification {
                category: self.cfg.fallback,
                confidence: 0.0,
                bbox: None,
                low_confidence: true,
            });
        };

        let mapped = self.map_label(&best.label);
        let (category, low_confidence) = match mapped {
            Some(c) if best.confidence >= self.cfg.min_confidence => (c, false),
            Some(_) => {
                tracing::debug!(
                    label = %best.label,
                    confidence = best.confidence,
                    "below confidence threshold, using fallback"
                );
                (self.cfg.fallback, true)
            }
            None => {
                tracing::debug!(label = %best.label, "unmapped label, using fallback");
                (self.cfg.fallback, true)
            }
        };

        Ok(Classification {
            category,
            confidence: best.confidence,
            bbox: best.bbox,
            low_confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beltsort_traits::{BoxError, Detection};
    use std::collections::HashMap;
    use std::time::Duration;

    struct FixedBackend(Vec<Detection>);

    impl Classifier for FixedBackend {
        fn classify(
            &mut self,
            _frame: &Frame,
            _deadline: Duration,
        ) -> Result<Vec<Detection>, BoxError> {
            Ok(self.0.clone())
        }
    }

    fn det(label: &str, confidence: f32) -> Detection {
        Detection {
            label: label.into(),
            confidence,
            bbox: None,
        }
    }

    fn cfg() -> ClassifyCfg {
        let mut aliases = HashMap::new();
        aliases.insert("tin_can".to_string(), Category::Metal);
        ClassifyCfg {
            min_confidence: 0.5,
            fallback: Category::Other,
            aliases,
            budget: Duration::from_millis(100),
        }
    }

    #[test]
    fn best_detection_wins_and_alias_maps() {
        let backend = FixedBackend(vec![det("plastic", 0.6), det("tin_can", 0.9)]);
        let mut client = ClassifierClient::new(Box::new(backend), cfg());
        let c = client.classify(&Frame::default()).unwrap();
        assert_eq!(c.category, Category::Metal);
        assert!(!c.low_confidence);
    }

    #[test]
    fn below_threshold_falls_back_with_flag() {
        let backend = FixedBackend(vec![det("glass", 0.3)]);
        let mut client = ClassifierClient::new(Box::new(backend), cfg());
        let c = client.classify(&Frame::default()).unwrap();
        assert_eq!(c.category, Category::Other);
        assert!(c.low_confidence);
        assert!((c.confidence - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn no_detections_fall_back_at_zero_confidence() {
        let backend = FixedBackend(vec![]);
        let mut client = ClassifierClient::new(Box::new(backend), cfg());
        let c = client.classify(&Frame::default()).unwrap();
        assert_eq!(c.category, Category::Other);
        assert!(c.low_confidence);
        assert_eq!(c.confidence, 0.0);
    }

    #[test]
    fn timeout_errors_are_typed() {
        struct TimeoutBackend;
        impl Classifier for TimeoutBackend {
            fn classify(
                &mut self,
                _frame: &Frame,
                _deadline: Duration,
            ) -> Result<Vec<Detection>, BoxError> {
                Err("inference timeout".into())
            }
        }
        let mut client = ClassifierClient::new(Box::new(TimeoutBackend), cfg());
        let err = client.classify(&Frame::default()).unwrap_err();
        assert!(matches!(err, SorterError::Timeout(_)));
    }
}
