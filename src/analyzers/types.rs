//! Data types produced by scoring and aggregation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::readings::RejectionReason;

/// How much of one sensor's cycle survived cleaning.
///
/// This is computed here from our own cleaning results and is unrelated to
/// the confidence figure PurpleAir shows on its map; the two can disagree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorConfidence {
    pub sensor_id: u64,
    pub region_code: String,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub valid_count: usize,
    pub total_count: usize,
    /// `None` when `total_count == 0`. Never coerced to 0 or 100.
    pub confidence_pct: Option<f64>,
    /// Mean corrected value over valid samples.
    pub mean_value: Option<f64>,
    pub rejections: BTreeMap<RejectionReason, usize>,
}

impl SensorConfidence {
    pub fn is_healthy(&self, threshold_pct: f64) -> bool {
        self.confidence_pct.is_some_and(|c| c >= threshold_pct)
    }

    pub fn rejected_count(&self) -> usize {
        self.total_count - self.valid_count
    }
}

/// Per-region statistics for one cycle. Replaced, never updated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionSummary {
    pub region_code: String,
    pub region_name: String,
    pub cycle_timestamp: DateTime<Utc>,
    /// Mean of per-sensor means, over sensors with at least one valid sample.
    pub mean_value: Option<f64>,
    /// Population standard deviation of those per-sensor means.
    pub stddev_value: Option<f64>,
    pub aqi: Option<u16>,
    pub sensor_count: usize,
    /// Sensors that contributed to `mean_value`.
    pub valid_sensor_count: usize,
    pub healthy_sensor_count: usize,
    pub healthy_threshold_pct: f64,
}
