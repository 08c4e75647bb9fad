//! Monthly history backfill for a single sensor.
//!
//! PurpleAir caps how many days one history request may span, depending on
//! the averaging period, so a month is split into evenly sized windows.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::BTreeSet;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::analyzers::cleaner::ReadingCleaner;
use crate::analyzers::scorer::score;
use crate::analyzers::types::SensorConfidence;
use crate::output::OutputSink;
use crate::pipeline::{RetryPolicy, retry_transient};
use crate::readings::{CleanedSample, RawReading};
use crate::records::{health_table, sample_table};
use crate::services::HistorySource;

/// Longest span, in days, one history request may cover.
pub fn max_window_days(average_minutes: u32) -> Option<u32> {
    match average_minutes {
        2 => Some(2),
        10 => Some(3),
        30 => Some(7),
        60 => Some(14),
        _ => None,
    }
}

fn last_day_of_month(year: i32, month: u32) -> Option<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((next - first).num_days() as u32)
}

/// Splits a month into request windows `[day 00:00:01, day 23:59:59]`.
pub fn month_windows(
    year: i32,
    month: u32,
    average_minutes: u32,
) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>> {
    let Some(limit) = max_window_days(average_minutes) else {
        bail!("unsupported averaging period {average_minutes} (use 2, 10, 30 or 60)");
    };
    let last_day = last_day_of_month(year, month)
        .with_context(|| format!("invalid month {year}-{month}"))?;

    let n = last_day.div_ceil(limit);
    let mut windows = Vec::with_capacity(n as usize);
    for i in 1..=n {
        let start_day = last_day * (i - 1) / n + 1;
        let end_day = (last_day * i / n).min(last_day);
        let start = Utc
            .with_ymd_and_hms(year, month, start_day, 0, 0, 1)
            .single()
            .context("window start out of range")?;
        let end = Utc
            .with_ymd_and_hms(year, month, end_day, 23, 59, 59)
            .single()
            .context("window end out of range")?;
        windows.push((start, end));
    }
    Ok(windows)
}

/// What to backfill and how to label it.
#[derive(Debug, Clone)]
pub struct BackfillRequest {
    pub sensor_id: u64,
    pub name: String,
    pub region_code: String,
    pub year: i32,
    pub month: u32,
    pub average_minutes: u32,
}

impl BackfillRequest {
    pub fn sheet_name(&self) -> String {
        format!("history_{}_{:02}_{}", self.year, self.month, self.sensor_id)
    }
}

#[derive(Debug, Clone)]
pub struct BackfillReport {
    pub sheet: String,
    pub windows: usize,
    pub skipped_windows: usize,
    pub confidence: SensorConfidence,
}

/// Fetches, cleans and scores one sensor-month and writes it to `sink`.
///
/// A window whose transient errors outlast the retry budget is skipped;
/// a fatal error aborts the backfill before anything is written.
#[tracing::instrument(skip_all, fields(sensor = req.sensor_id, year = req.year, month = req.month))]
pub async fn backfill_month<H: HistorySource + ?Sized>(
    source: &H,
    sink: &dyn OutputSink,
    cleaner: &ReadingCleaner,
    retry: &RetryPolicy,
    req: &BackfillRequest,
    health_sheet: &str,
) -> Result<BackfillReport> {
    let windows = month_windows(req.year, req.month, req.average_minutes)?;
    let gate = Semaphore::new(1);
    let label = req.sensor_id.to_string();

    let mut readings: Vec<RawReading> = Vec::new();
    let mut seen = BTreeSet::new();
    let mut skipped_windows = 0;

    for (i, (start, end)) in windows.iter().enumerate() {
        info!(window = i + 1, of = windows.len(), %start, %end, "Requesting history window");
        let batch = match retry_transient(retry, &gate, &label, || {
            source.history(req.sensor_id, *start, *end, req.average_minutes)
        })
        .await
        {
            Ok(batch) => batch,
            Err((e, attempts)) if e.is_retryable() => {
                warn!(window = i + 1, attempts, error = %e, "History window skipped");
                skipped_windows += 1;
                continue;
            }
            Err((e, _)) => return Err(e).context("history request failed"),
        };

        for failure in &batch.failures {
            warn!(reason = %failure.reason, "History row skipped");
        }
        for r in batch.readings {
            if seen.insert(r.timestamp) {
                readings.push(RawReading {
                    name: req.name.clone(),
                    region_code: req.region_code.clone(),
                    ..r
                });
            }
        }
    }
    readings.sort_by_key(|r| r.timestamp);

    let pairs: Vec<(RawReading, CleanedSample)> = readings
        .into_iter()
        .map(|r| {
            let c = cleaner.clean(&r);
            (r, c)
        })
        .collect();
    let cleaned: Vec<CleanedSample> = pairs.iter().map(|(_, c)| c.clone()).collect();
    let confidence = score(req.sensor_id, &req.region_code, &cleaned);

    let sheet = req.sheet_name();
    sink.append_rows(&sheet, &sample_table(&pairs, true)).await?;
    let stamp = confidence.window_end.unwrap_or_else(Utc::now);
    let name = req.name.as_str();
    sink.append_rows(
        health_sheet,
        &health_table(stamp, std::slice::from_ref(&confidence), |_| Some(name)),
    )
    .await?;

    info!(
        sheet = %sheet,
        samples = confidence.total_count,
        valid = confidence.valid_count,
        confidence = ?confidence.confidence_pct,
        "History backfill written"
    );

    Ok(BackfillReport {
        sheet,
        windows: windows.len(),
        skipped_windows,
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_month_windows_cover_month_without_overlap() {
        let w = month_windows(2024, 5, 30).unwrap();
        let days: Vec<_> = w
            .iter()
            .map(|(s, e)| (s.format("%d").to_string(), e.format("%d").to_string()))
            .collect();
        assert_eq!(
            days,
            vec![
                ("01".into(), "06".into()),
                ("07".into(), "12".into()),
                ("13".into(), "18".into()),
                ("19".into(), "24".into()),
                ("25".into(), "31".into()),
            ]
        );
        for pair in w.windows(2) {
            assert!(pair[0].1 < pair[1].0);
        }
    }

    #[test]
    fn test_month_windows_short_averages() {
        assert_eq!(month_windows(2024, 2, 2).unwrap().len(), 15);
        assert_eq!(month_windows(2023, 2, 60).unwrap().len(), 2);
        assert_eq!(month_windows(2024, 12, 10).unwrap().len(), 11);
    }

    #[test]
    fn test_month_windows_rejects_bad_input() {
        assert!(month_windows(2024, 5, 15).is_err());
        assert!(month_windows(2024, 13, 30).is_err());
    }
}
