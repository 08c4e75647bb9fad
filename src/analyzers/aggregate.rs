use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

use crate::analyzers::aqi::pm25_to_aqi;
use crate::analyzers::types::{RegionSummary, SensorConfidence};
use crate::analyzers::utility::{mean, stddev};
use crate::catalog::Region;
use crate::readings::CleanedSample;

/// Combines one region's scored sensors into a [`RegionSummary`].
///
/// Each sensor first collapses to the mean of its valid samples; the region
/// mean is the mean of those. Sensors without a valid sample still count in
/// `sensor_count` but not in the mean. Samples for sensors absent from
/// `confidences` are ignored.
///
/// Values are summed in sorted order so the output does not depend on input
/// order: the same inputs always serialize to the same bytes.
pub fn aggregate_region(
    region: &Region,
    confidences: &[SensorConfidence],
    samples: &[CleanedSample],
    cycle_timestamp: DateTime<Utc>,
    healthy_threshold_pct: f64,
) -> RegionSummary {
    let sensors: BTreeSet<u64> = confidences.iter().map(|c| c.sensor_id).collect();

    let mut valid_by_sensor: BTreeMap<u64, Vec<f64>> = BTreeMap::new();
    for s in samples {
        if !sensors.contains(&s.sensor_id) || s.rejected {
            continue;
        }
        if let Some(v) = s.corrected_value {
            valid_by_sensor.entry(s.sensor_id).or_default().push(v);
        }
    }

    let mut sensor_means: Vec<f64> = valid_by_sensor
        .into_values()
        .map(|mut values| {
            values.sort_by(f64::total_cmp);
            mean(&values)
        })
        .collect();
    sensor_means.sort_by(f64::total_cmp);

    let mean_value = (!sensor_means.is_empty()).then(|| mean(&sensor_means));
    let stddev_value = mean_value.and_then(|m| stddev(&sensor_means, m));

    let healthy_sensor_count = confidences
        .iter()
        .filter(|c| c.is_healthy(healthy_threshold_pct))
        .count();

    RegionSummary {
        region_code: region.code.clone(),
        region_name: region.name.clone(),
        cycle_timestamp,
        mean_value,
        stddev_value,
        aqi: mean_value.map(pm25_to_aqi),
        sensor_count: sensors.len(),
        valid_sensor_count: sensor_means.len(),
        healthy_sensor_count,
        healthy_threshold_pct,
    }
}
