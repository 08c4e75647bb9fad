//! CLI entry point for the air quality rater.
//!
//! Provides subcommands for the polling loop, region lookups, monthly
//! history backfills, sheet trimming, merging and export.

use anyhow::{Context, Result, bail};
use aq_rater::catalog::GeoPoint;
use aq_rater::config::AppConfig;
use aq_rater::export::{export_csv, merge_sheets, merged_month_sheet, month_sheets};
use aq_rater::history::{BackfillRequest, backfill_month};
use aq_rater::infra::purpleair::PurpleAirClient;
use aq_rater::output::{CsvSink, MemorySink, OutputSink, check_sheet_name};
use aq_rater::pipeline::PipelineRunner;
use aq_rater::trim::{TrimRule, trim_sheet};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "aq_rater")]
#[command(about = "Rates PurpleAir PM2.5 sensors and summarizes regions", long_about = None)]
struct Cli {
    /// JSON config with regions, thresholds and output settings
    #[arg(short, long, env = "AQ_RATER_CONFIG", default_value = "aq_rater.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll every region, clean and score readings, write sheets
    Run {
        /// Number of cycles to run (0 = until interrupted)
        #[arg(short = 'n', long, default_value_t = 1)]
        cycles: usize,

        /// Keep output in memory instead of writing CSV files
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// List configured regions, or the ones containing a point
    Regions {
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lon: Option<f64>,

        #[arg(long, requires = "lon", allow_hyphen_values = true)]
        lat: Option<f64>,
    },
    /// Backfill one month of averaged history for a sensor
    History {
        /// Configured sensor name or numeric sensor index
        #[arg(short, long)]
        sensor: String,

        #[arg(short, long)]
        year: i32,

        #[arg(short, long)]
        month: u32,

        /// Averaging period in minutes: 2, 10, 30 or 60
        #[arg(short, long, default_value_t = 10)]
        average: u32,

        /// Region code to tag rows with (defaults to the local region)
        #[arg(short, long)]
        region: Option<String>,
    },
    /// Remove old rows from the top of a sheet
    Trim {
        #[arg(short, long)]
        sheet: String,

        /// Rows newer than this many days are always kept
        #[arg(short, long, default_value_t = 21)]
        days: i64,

        /// Only rows from before this month are removed (defaults to the current month)
        #[arg(short, long)]
        month: Option<u32>,

        /// Actually rewrite the sheet; without it the trim is only reported
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Merge sheets into one time-ordered sheet without repeated rows
    Merge {
        /// Sheets to merge, comma separated
        #[arg(short, long, value_delimiter = ',', conflicts_with_all = ["year", "month"])]
        sheets: Vec<String>,

        /// Merge every history sheet of this year and month instead
        #[arg(short, long, requires = "month")]
        year: Option<i32>,

        #[arg(short, long, requires = "year")]
        month: Option<u32>,

        /// Target sheet (defaults to history_YYYY_MM_all, or all_data for --sheets)
        #[arg(short, long)]
        out: Option<String>,
    },
    /// Copy a sheet to a standalone CSV file
    Export {
        #[arg(short, long)]
        sheet: String,

        #[arg(short, long)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/aq_rater.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("aq_rater.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config))?;

    match cli.command {
        Commands::Run { cycles, dry_run } => run(&config, cycles, dry_run).await?,
        Commands::Regions { lon, lat } => {
            let catalog = config.catalog()?;
            match lon.zip(lat) {
                Some((lon, lat)) => {
                    let hits = catalog.membership(GeoPoint::new(lon, lat));
                    if hits.is_empty() {
                        info!(lon, lat, "Point is outside every configured region");
                    }
                    for r in hits {
                        info!(code = %r.code, name = %r.name, local = catalog.is_local(&r.code), "Region contains point");
                    }
                }
                None => {
                    for r in catalog.cycle_order() {
                        info!(
                            code = %r.code,
                            name = %r.name,
                            local = catalog.is_local(&r.code),
                            bbox = ?r.bbox,
                            "Region"
                        );
                    }
                }
            }
        }
        Commands::History {
            sensor,
            year,
            month,
            average,
            region,
        } => {
            let sensor_id = config
                .resolve_sensor(&sensor)
                .with_context(|| format!("unknown sensor '{sensor}'"))?;
            let name = config
                .sensors
                .iter()
                .find(|(_, id)| **id == sensor_id)
                .map(|(n, _)| n.clone())
                .unwrap_or_else(|| sensor_id.to_string());
            let req = BackfillRequest {
                sensor_id,
                name,
                region_code: region.unwrap_or_else(|| config.local_region.clone()),
                year,
                month,
                average_minutes: average,
            };

            let client = PurpleAirClient::new(&read_key()?, config.max_age_secs)?;
            let sink = CsvSink::new(&config.output.csv_dir)?;
            let report = backfill_month(
                &client,
                &sink,
                &config.cleaner(),
                &config.retry,
                &req,
                &config.output.health_sheet,
            )
            .await?;

            if report.skipped_windows > 0 {
                warn!(
                    skipped = report.skipped_windows,
                    windows = report.windows,
                    "Some history windows could not be fetched"
                );
            }
            info!(
                sheet = %report.sheet,
                confidence = ?report.confidence.confidence_pct,
                "History backfill finished"
            );
        }
        Commands::Trim {
            sheet,
            days,
            month,
            yes,
        } => {
            let sink = CsvSink::new(&config.output.csv_dir)?;
            let rule = TrimRule::new(Utc::now().naive_utc(), days, month);
            let plan = trim_sheet(&sink, &sheet, &rule, yes).await?;
            if plan.rows == 0 {
                info!(sheet = %plan.sheet, "Nothing to trim");
            } else if !plan.applied {
                warn!(
                    sheet = %plan.sheet,
                    rows = plan.rows,
                    first = ?plan.first,
                    last = ?plan.last,
                    "Dry run, pass --yes to remove these rows"
                );
            }
        }
        Commands::Merge {
            sheets,
            year,
            month,
            out,
        } => {
            let sink = CsvSink::new(&config.output.csv_dir)?;
            let (sources, default_out) = match year.zip(month) {
                Some((year, month)) => (
                    month_sheets(&sink.sheet_names().await?, year, month),
                    merged_month_sheet(year, month),
                ),
                None if !sheets.is_empty() => (sheets, "all_data".to_string()),
                None => bail!("pass --sheets or --year and --month"),
            };
            if sources.is_empty() {
                bail!("no sheets to merge");
            }
            let out = out.unwrap_or(default_out);
            check_sheet_name(&out)?;
            let report = merge_sheets(&sink, &sources, &out).await?;
            info!(
                out = %report.out_sheet,
                sheets = report.sheets.len(),
                rows_in = report.rows_in,
                rows_out = report.rows_out,
                "Merge finished"
            );
        }
        Commands::Export { sheet, path } => {
            let sink = CsvSink::new(&config.output.csv_dir)?;
            export_csv(&sink, &sheet, &path).await?;
        }
    }

    Ok(())
}

fn read_key() -> Result<String> {
    std::env::var("PURPLEAIR_READ_KEY").context("PURPLEAIR_READ_KEY must be set")
}

/// Runs polling cycles until `cycles` is reached or Ctrl+C arrives.
///
/// Interrupting mid-cycle drops the cycle future: outstanding fetches are
/// aborted and regions already written stay written. A region interrupted
/// while its rows are being written may have sample rows but no Summary row;
/// its Summary row is always the last one written.
#[tracing::instrument(skip(config))]
async fn run(config: &AppConfig, cycles: usize, dry_run: bool) -> Result<()> {
    let catalog = config.catalog()?;
    let source = Arc::new(PurpleAirClient::new(&read_key()?, config.max_age_secs)?);

    let memory = dry_run.then(|| Arc::new(MemorySink::new()));
    let sink: Arc<dyn OutputSink> = match &memory {
        Some(m) => m.clone() as Arc<dyn OutputSink>,
        None => Arc::new(CsvSink::new(&config.output.csv_dir)?),
    };
    let runner = PipelineRunner::from_config(config, source).with_sink(sink);
    let poll = Duration::from_secs(config.poll_interval_secs);

    if cycles == 0 {
        info!(poll_secs = poll.as_secs(), "Polling until interrupted. Press Ctrl+C to stop.");
    }

    let mut count = 0;
    loop {
        count += 1;
        info!(cycle = count, "Starting cycle");

        tokio::select! {
            report = runner.run_cycle(&catalog) => {
                for f in &report.failures {
                    error!(region = %f.region_code, error = %f.error, "Region skipped this cycle");
                }
                for (region, failed) in &report.sensor_failures {
                    warn!(region = %region, sensors = failed.len(), "Sensors excluded after failed records");
                }
                info!(
                    cycle = count,
                    summaries = report.summaries.len(),
                    outside_region = report.outside_region,
                    "Cycle finished"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping after partial cycle");
                break;
            }
        }

        if let Some(m) = &memory {
            info!(sheets = ?m.sheet_names().await?, "Dry run, nothing written to disk");
        }
        if cycles > 0 && count >= cycles {
            break;
        }

        info!(poll_secs = poll.as_secs(), "Waiting before next cycle");
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping");
                break;
            }
        }
    }

    Ok(())
}
