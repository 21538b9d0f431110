//! Maps `Box<dyn Error>` from trait boundaries to typed `SorterError`.
//!
//! The traits in `beltsort_traits` use `Box<dyn Error + Send + Sync>` for
//! maximum flexibility; this module converts those to our typed error enum
//! using string-based heuristics (the hardware crate's own error types render
//! distinctive messages).

use crate::error::SorterError;

/// Map a trait-boundary error to a typed `SorterError`.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> SorterError {
    let s = e.to_string();
    let lower = s.to_lowercase();
    if lower.contains("timeout") {
        SorterError::Timeout("hardware")
    } else if lower.contains("busy") || lower.contains("fault") || lower.contains("disabled") {
        SorterError::HardwareFault(s)
    } else {
        SorterError::Hardware(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_strings_map_to_timeout() {
        let e: Box<dyn std::error::Error> = "echo timeout".into();
        assert!(matches!(map_hw_error(&*e), SorterError::Timeout(_)));
    }

    #[test]
    fn busy_maps_to_hardware_fault() {
        let e: Box<dyn std::error::Error> = "actuator busy".into();
        assert!(matches!(map_hw_error(&*e), SorterError::HardwareFault(_)));
    }
}
