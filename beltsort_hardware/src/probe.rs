//! Host health probe backed by /proc and the SoC thermal zone.

use std::fs;

use beltsort_traits::{BoxError, SystemProbe};

use crate::error::HwError;

const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

/// CPU / memory / temperature probe for Linux hosts. CPU usage is derived
/// from deltas between consecutive /proc/stat samples, so the first call
/// after construction reports 0.
#[derive(Default)]
pub struct ProcProbe {
    last_cpu: Option<(u64, u64)>, // (busy, total)
}

impl ProcProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_cpu_counters() -> Result<(u64, u64), HwError> {
        let stat = fs::read_to_string("/proc/stat")?;
        let line = stat
            .lines()
            .next()
            .ok_or_else(|| HwError::Probe("empty /proc/stat".into()))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|f| f.parse().ok())
            .collect();
        if fields.len() < 4 {
            return Err(HwError::Probe("short cpu line in /proc/stat".into()));
        }
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().sum();
        Ok((total - idle, total))
    }
}

impl SystemProbe for ProcProbe {
    fn cpu_percent(&mut self) -> Result<f32, BoxError> {
        let (busy, total) = Self::read_cpu_counters()?;
        let pct = match self.last_cpu {
            Some((prev_busy, prev_total)) if total > prev_total => {
                let db = busy.saturating_sub(prev_busy) as f32;
                let dt = (total - prev_total) as f32;
                (db / dt * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        };
        self.last_cpu = Some((busy, total));
        Ok(pct)
    }

    fn memory_percent(&mut self) -> Result<f32, BoxError> {
        let meminfo = fs::read_to_string("/proc/meminfo").map_err(HwError::Io)?;
        let mut total_kb = 0u64;
        let mut avail_kb = 0u64;
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                total_kb = rest.trim().trim_end_matches(" kB").trim().parse().unwrap_or(0);
            } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                avail_kb = rest.trim().trim_end_matches(" kB").trim().parse().unwrap_or(0);
            }
        }
        if total_kb == 0 {
            return Err(Box::new(HwError::Probe("MemTotal missing".into())));
        }
        Ok(((total_kb - avail_kb.min(total_kb)) as f32 / total_kb as f32 * 100.0).clamp(0.0, 100.0))
    }

    fn temperature_c(&mut self) -> Result<f32, BoxError> {
        let raw = fs::read_to_string(THERMAL_ZONE).map_err(HwError::Io)?;
        let millideg: f32 = raw
            .trim()
            .parse()
            .map_err(|_| HwError::Probe(format!("unparseable thermal zone value: {raw:?}")))?;
        Ok(millideg / 1000.0)
    }
}
