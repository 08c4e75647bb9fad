//! One poll-clean-score-aggregate pass over the configured regions.
//!
//! Fetches for all regions start together and share a single semaphore
//! gate against the sensor API. Results are then processed strictly in the
//! order given (local region first), and each region's rows are written as
//! soon as that region is done: sample rows, then Health rows, then the
//! Summary row, so a Summary row means the region's other rows are in place.
//! Dropping the cycle future aborts outstanding fetches but keeps everything
//! already written; a drop between those three writes can leave sample rows
//! with no Summary row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::analyzers::aggregate::aggregate_region;
use crate::analyzers::cleaner::ReadingCleaner;
use crate::analyzers::scorer::score;
use crate::analyzers::types::{RegionSummary, SensorConfidence};
use crate::catalog::{Region, RegionCatalog};
use crate::config::AppConfig;
use crate::error::{ConfigError, FetchError};
use crate::output::{OutputSink, Table};
use crate::readings::{CleanedSample, RawReading};
use crate::records::{health_table, sample_table, summary_table};
use crate::services::{SensorBatch, SensorFailure, SensorSource};

/// Bounded exponential backoff for transient fetch errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "retry.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::InvalidBounds {
                name: "retry.backoff_ms",
                min: self.initial_backoff_ms as f64,
                max: self.max_backoff_ms as f64,
            });
        }
        Ok(())
    }

    /// Delay after the `attempt`-th failure (1-based): doubles each time,
    /// capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(32);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// A region that produced no summary this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionFailure {
    pub region_code: String,
    pub error: FetchError,
    pub attempts: u32,
}

/// Runs `op` until it succeeds, fails fatally, or `policy` runs out of
/// attempts. Every attempt holds a permit from `gate` for the duration of
/// the request only; backoff sleeps do not.
///
/// On failure returns the last error and the number of attempts made.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    gate: &Semaphore,
    label: &str,
    mut op: F,
) -> Result<T, (FetchError, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match gate.acquire().await {
            Ok(_permit) => op().await,
            Err(_) => Err(FetchError::Fatal("rate-limit gate closed".to_string())),
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    info!(target_name = label, attempt, "Fetch succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    target_name = label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient fetch error, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err((e, attempt)),
        }
    }
}

/// Fetches one region through [`retry_transient`].
pub async fn fetch_with_retry<S: SensorSource + ?Sized>(
    source: &S,
    region: &Region,
    policy: &RetryPolicy,
    gate: &Semaphore,
) -> Result<SensorBatch, RegionFailure> {
    retry_transient(policy, gate, &region.code, || source.fetch(region))
        .await
        .map_err(|(error, attempts)| RegionFailure {
            region_code: region.code.clone(),
            error,
            attempts,
        })
}

/// Knobs that shape a cycle, separate from its collaborators.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub local_region: String,
    pub healthy_threshold_pct: f64,
    pub samples_per_cycle: usize,
    pub sample_spacing: Duration,
    pub health_sheet: String,
    pub summary_sheet: String,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            local_region: config.local_region.clone(),
            healthy_threshold_pct: config.healthy_threshold_pct,
            samples_per_cycle: config.samples_per_cycle.max(1),
            sample_spacing: Duration::from_secs(config.sample_spacing_secs),
            health_sheet: config.output.health_sheet.clone(),
            summary_sheet: config.output.summary_sheet.clone(),
        }
    }
}

/// Outcome of one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle_timestamp: DateTime<Utc>,
    pub summaries: BTreeMap<String, RegionSummary>,
    pub failures: Vec<RegionFailure>,
    /// Sensor records the source could not parse, by region code.
    pub sensor_failures: BTreeMap<String, Vec<SensorFailure>>,
    /// Readings dropped because their location is unknown or outside the box.
    pub outside_region: usize,
    pub sink_errors: Vec<String>,
}

impl CycleReport {
    pub fn sensor_failure_count(&self) -> usize {
        self.sensor_failures.values().map(Vec::len).sum()
    }
}

struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for h in &self.0 {
            h.abort();
        }
    }
}

pub struct PipelineRunner {
    source: Arc<dyn SensorSource>,
    cleaner: ReadingCleaner,
    retry: RetryPolicy,
    gate: Arc<Semaphore>,
    sinks: Vec<Arc<dyn OutputSink>>,
    settings: PipelineSettings,
}

impl PipelineRunner {
    pub fn new(source: Arc<dyn SensorSource>, cleaner: ReadingCleaner, settings: PipelineSettings) -> Self {
        Self {
            source,
            cleaner,
            retry: RetryPolicy::default(),
            gate: Arc::new(Semaphore::new(1)),
            sinks: Vec::new(),
            settings,
        }
    }

    pub fn from_config(config: &AppConfig, source: Arc<dyn SensorSource>) -> Self {
        Self::new(source, config.cleaner(), PipelineSettings::from_config(config))
            .with_retry(config.retry.clone())
            .with_gate(config.max_concurrent_fetches)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Maximum requests in flight against the sensor API.
    pub fn with_gate(mut self, permits: usize) -> Self {
        self.gate = Arc::new(Semaphore::new(permits.max(1)));
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub async fn run_cycle(&self, catalog: &RegionCatalog) -> CycleReport {
        self.run_cycle_at(catalog, Utc::now()).await
    }

    /// Runs a cycle over every region in `catalog`, stamped with
    /// `cycle_timestamp`.
    #[tracing::instrument(skip_all, fields(regions = catalog.len(), cycle = %cycle_timestamp))]
    pub async fn run_cycle_at(&self, catalog: &RegionCatalog, cycle_timestamp: DateTime<Utc>) -> CycleReport {
        let regions = catalog.cycle_order();
        let mut report = CycleReport {
            cycle_timestamp,
            ..Default::default()
        };

        let handles: Vec<_> = regions.iter().map(|r| self.spawn_fetch(r.clone())).collect();
        let _abort = AbortOnDrop(handles.iter().map(|h| h.abort_handle()).collect());

        for (region, handle) in regions.iter().zip(handles) {
            let span = tracing::info_span!("process_region", region = %region.code);
            let fetched = match handle.await {
                Ok(result) => result,
                Err(e) => Err(RegionFailure {
                    region_code: region.code.clone(),
                    error: FetchError::Fatal(format!("fetch task failed: {e}")),
                    attempts: 0,
                }),
            };

            match fetched {
                Ok(batches) => {
                    let summary = self
                        .process_region(catalog, region, batches, cycle_timestamp, &mut report)
                        .instrument(span)
                        .await;
                    report.summaries.insert(region.code.clone(), summary);
                }
                Err(failure) => {
                    error!(
                        region = %failure.region_code,
                        attempts = failure.attempts,
                        error = %failure.error,
                        "Region fetch failed, no summary this cycle"
                    );
                    report.failures.push(failure);
                }
            }
        }

        info!(
            summaries = report.summaries.len(),
            failed_regions = report.failures.len(),
            sensor_failures = report.sensor_failure_count(),
            sink_errors = report.sink_errors.len(),
            "Cycle complete"
        );
        report
    }

    /// Collects `samples_per_cycle` batches for one region in the background.
    ///
    /// A fatal error discards the region. A transient error that outlasts the
    /// retry budget stops sampling; rounds already collected are kept.
    fn spawn_fetch(&self, region: Region) -> tokio::task::JoinHandle<Result<Vec<SensorBatch>, RegionFailure>> {
        let source = self.source.clone();
        let gate = self.gate.clone();
        let retry = self.retry.clone();
        let rounds = self.settings.samples_per_cycle;
        let spacing = self.settings.sample_spacing;
        let span = tracing::info_span!("fetch_region", region = %region.code);

        tokio::spawn(
            async move {
                let mut batches = Vec::with_capacity(rounds);
                for round in 0..rounds {
                    match fetch_with_retry(source.as_ref(), &region, &retry, &gate).await {
                        Ok(batch) => {
                            debug!(round, readings = batch.readings.len(), "Sample round fetched");
                            batches.push(batch);
                        }
                        Err(failure) if failure.error.is_retryable() && !batches.is_empty() => {
                            warn!(
                                round,
                                error = %failure.error,
                                "Sampling stopped early, keeping completed rounds"
                            );
                            break;
                        }
                        Err(failure) => return Err(failure),
                    }
                    if round + 1 < rounds {
                        tokio::time::sleep(spacing).await;
                    }
                }
                Ok(batches)
            }
            .instrument(span),
        )
    }

    /// Cleans, scores and aggregates one region's batches and writes its rows.
    ///
    /// A sensor with a failed record in any round is left out of this cycle
    /// entirely; its other rounds are neither scored nor written.
    async fn process_region(
        &self,
        catalog: &RegionCatalog,
        region: &Region,
        batches: Vec<SensorBatch>,
        cycle_timestamp: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> RegionSummary {
        let local = region.code == self.settings.local_region;

        let mut seen = HashSet::new();
        let mut by_sensor: BTreeMap<u64, Vec<(RawReading, CleanedSample)>> = BTreeMap::new();
        let mut names: BTreeMap<u64, String> = BTreeMap::new();

        let mut failed = BTreeSet::new();

        for SensorBatch { readings, failures } in batches {
            for failure in &failures {
                warn!(sensor = ?failure.sensor_id, reason = %failure.reason, "Sensor excluded this cycle");
                failed.extend(failure.sensor_id);
            }
            if !failures.is_empty() {
                report
                    .sensor_failures
                    .entry(region.code.clone())
                    .or_default()
                    .extend(failures);
            }

            for raw in readings {
                let member = raw
                    .location
                    .is_some_and(|p| catalog.membership(p).iter().any(|r| r.code == region.code));
                if !member {
                    debug!(sensor = raw.sensor_id, "Reading outside region, skipped");
                    report.outside_region += 1;
                    continue;
                }
                // Repeated rounds can return an unchanged reading.
                if !seen.insert((raw.sensor_id, raw.timestamp)) {
                    continue;
                }
                let cleaned = self.cleaner.clean(&raw);
                names.entry(raw.sensor_id).or_insert_with(|| raw.name.clone());
                by_sensor.entry(raw.sensor_id).or_default().push((raw, cleaned));
            }
        }

        for id in &failed {
            if by_sensor.remove(id).is_some() {
                debug!(sensor = id, "Dropped readings of a sensor with a failed record");
            }
        }

        let confidences: Vec<SensorConfidence> = by_sensor
            .iter()
            .map(|(id, pairs)| {
                let samples: Vec<_> = pairs.iter().map(|(_, c)| c.clone()).collect();
                score(*id, &region.code, &samples)
            })
            .collect();

        let pairs: Vec<(RawReading, CleanedSample)> = by_sensor.into_values().flatten().collect();
        let cleaned: Vec<CleanedSample> = pairs.iter().map(|(_, c)| c.clone()).collect();

        let summary = aggregate_region(
            region,
            &confidences,
            &cleaned,
            cycle_timestamp,
            self.settings.healthy_threshold_pct,
        );

        info!(
            sensors = summary.sensor_count,
            valid_sensors = summary.valid_sensor_count,
            healthy = summary.healthy_sensor_count,
            mean = ?summary.mean_value,
            "Region aggregated"
        );

        let samples = sample_table(&pairs, local);
        let health = health_table(cycle_timestamp, &confidences, |id| names.get(&id).map(String::as_str));
        let summary_row = summary_table(&[&summary]);

        self.write(&region.code, &samples, report).await;
        self.write(&self.settings.health_sheet, &health, report).await;
        self.write(&self.settings.summary_sheet, &summary_row, report).await;

        summary
    }

    async fn write(&self, sheet: &str, table: &Table, report: &mut CycleReport) {
        for sink in &self.sinks {
            if let Err(e) = sink.append_rows(sheet, table).await {
                error!(sheet, error = %e, "Failed to write rows");
                report.sink_errors.push(format!("{sheet}: {e}"));
            }
        }
    }
}
