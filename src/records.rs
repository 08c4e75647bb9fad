//! Row layouts written to the output sheets.

use chrono::{DateTime, Utc};

use crate::analyzers::types::{RegionSummary, SensorConfidence};
use crate::output::Table;
use crate::readings::{CleanedSample, RawReading, RejectionReason};

/// Time stamp layout shared by every sheet (UTC).
pub const TIME_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

const LOCAL_SAMPLE_HEADER: &[&str] = &[
    "time_stamp",
    "sensor_index",
    "name",
    "rssi",
    "uptime",
    "pm2.5_cf_1_a",
    "pm2.5_cf_1_b",
    "humidity",
    "pm25_epa",
    "rejected",
    "rejection_reason",
    "Ipm25",
];

const REGIONAL_SAMPLE_HEADER: &[&str] = &[
    "time_stamp",
    "sensor_index",
    "name",
    "pm2.5_cf_1_a",
    "pm2.5_cf_1_b",
    "humidity",
    "pm25_epa",
    "rejected",
    "rejection_reason",
    "Ipm25",
];

const HEALTH_HEADER: &[&str] = &[
    "time_stamp",
    "region",
    "sensor_index",
    "name",
    "valid_count",
    "total_count",
    "confidence_pct",
    "mean_pm25_epa",
    "missing_aux",
    "out_of_range",
    "sensor_disagreement",
];

const SUMMARY_HEADER: &[&str] = &[
    "time_stamp",
    "region",
    "region_name",
    "sensor_count",
    "valid_sensor_count",
    "healthy_sensor_count",
    "healthy_threshold_pct",
    "mean_pm25_epa",
    "stddev_pm25_epa",
    "Ipm25",
];

pub fn format_time(ts: DateTime<Utc>) -> String {
    ts.format(TIME_FORMAT).to_string()
}

fn opt<T: ToString>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

fn fixed(v: Option<f64>, digits: usize) -> String {
    v.map(|v| format!("{v:.digits$}")).unwrap_or_default()
}

/// One row per raw/cleaned pair. The local region also gets signal and
/// uptime columns.
pub fn sample_table(pairs: &[(RawReading, CleanedSample)], local: bool) -> Table {
    let mut table = Table::new(if local {
        LOCAL_SAMPLE_HEADER
    } else {
        REGIONAL_SAMPLE_HEADER
    });

    for (raw, cleaned) in pairs {
        let mut row = vec![
            format_time(raw.timestamp),
            raw.sensor_id.to_string(),
            raw.name.clone(),
        ];
        if local {
            row.push(opt(raw.rssi));
            row.push(opt(raw.uptime));
        }
        row.extend([
            raw.measured_value.to_string(),
            opt(raw.secondary_value),
            opt(raw.humidity),
            opt(cleaned.corrected_value),
            cleaned.rejected.to_string(),
            opt(cleaned.rejection_reason),
            opt(cleaned.aqi),
        ]);
        table.rows.push(row);
    }
    table
}

/// One row per scored sensor. `name_of` supplies display names by sensor index.
pub fn health_table<'a>(
    cycle_timestamp: DateTime<Utc>,
    confidences: &[SensorConfidence],
    name_of: impl Fn(u64) -> Option<&'a str>,
) -> Table {
    let mut table = Table::new(HEALTH_HEADER);
    let count = |c: &SensorConfidence, r: RejectionReason| {
        c.rejections.get(&r).copied().unwrap_or(0).to_string()
    };

    for c in confidences {
        table.rows.push(vec![
            format_time(cycle_timestamp),
            c.region_code.clone(),
            c.sensor_id.to_string(),
            name_of(c.sensor_id).unwrap_or_default().to_string(),
            c.valid_count.to_string(),
            c.total_count.to_string(),
            fixed(c.confidence_pct, 1),
            fixed(c.mean_value, 3),
            count(c, RejectionReason::MissingAux),
            count(c, RejectionReason::OutOfRange),
            count(c, RejectionReason::SensorDisagreement),
        ]);
    }
    table
}

pub fn summary_table(summaries: &[&RegionSummary]) -> Table {
    let mut table = Table::new(SUMMARY_HEADER);
    for s in summaries {
        table.rows.push(vec![
            format_time(s.cycle_timestamp),
            s.region_code.clone(),
            s.region_name.clone(),
            s.sensor_count.to_string(),
            s.valid_sensor_count.to_string(),
            s.healthy_sensor_count.to_string(),
            s.healthy_threshold_pct.to_string(),
            fixed(s.mean_value, 3),
            fixed(s.stddev_value, 3),
            opt(s.aqi),
        ]);
    }
    table
}
