//! Activation duration estimate.
//!
//! ```text
//! raw       = Σ (base[type] + overhead) × count[type]
//! buffered  = ceil(raw × buffer_percent / 100)
//! estimated = ceil(buffered / 60)
//! capped    = clamp(estimated, min_minutes, max_minutes)
//! ```
//!
//! Integer arithmetic throughout so the ceilings are exact.

use std::collections::BTreeMap;

use serde::Serialize;

use super::backlog::BacklogSnapshot;
use crate::config::EstimatorConfig;
use crate::jobs::JobType;

/// Built-in base duration per job type, in seconds. `None` means "use the
/// configured default".
pub fn builtin_base_seconds(job_type: &JobType) -> Option<u64> {
    match job_type {
        JobType::CalculateStats => Some(10),
        JobType::ExportCsv => Some(45),
        JobType::BatchCleanup => Some(120),
        JobType::GenerateReport => Some(480),
        JobType::Other(_) => None,
    }
}

impl EstimatorConfig {
    /// Base duration for `job_type`: override, then built-in arm, then default.
    pub fn base_seconds(&self, job_type: &JobType) -> u64 {
        self.overrides
            .get(job_type)
            .copied()
            .or_else(|| builtin_base_seconds(job_type))
            .unwrap_or(self.default_base_seconds)
    }

    /// Clamp a minute count into `[min_minutes, max_minutes]`.
    pub fn clamp_minutes(&self, minutes: u64) -> u32 {
        minutes.clamp(self.min_minutes as u64, self.max_minutes as u64) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DurationEstimate {
    pub raw_seconds: u64,
    pub buffered_seconds: u64,
    /// Before clamping.
    pub estimated_minutes: u64,
    /// What the worker is actually granted.
    pub capped_minutes: u32,
}

/// Pure estimator over a backlog snapshot.
#[derive(Debug, Clone, Default)]
pub struct DurationEstimator {
    config: EstimatorConfig,
}

impl DurationEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn estimate(&self, snapshot: &BacklogSnapshot) -> DurationEstimate {
        self.estimate_counts(&snapshot.by_type)
    }

    pub fn estimate_counts(&self, by_type: &BTreeMap<JobType, usize>) -> DurationEstimate {
        let raw_seconds = by_type.iter().fold(0u64, |acc, (job_type, count)| {
            let per_job = self
                .config
                .base_seconds(job_type)
                .saturating_add(self.config.overhead_seconds);
            acc.saturating_add(per_job.saturating_mul(*count as u64))
        });

        let buffered = (raw_seconds as u128 * self.config.safety_buffer_percent as u128)
            .div_ceil(100);
        let buffered_seconds = u64::try_from(buffered).unwrap_or(u64::MAX);
        let estimated_minutes = buffered_seconds.div_ceil(60);

        DurationEstimate {
            raw_seconds,
            buffered_seconds,
            estimated_minutes,
            capped_minutes: self.config.clamp_minutes(estimated_minutes),
        }
    }
}
