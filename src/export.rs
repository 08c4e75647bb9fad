//! Combining sheets and copying them out of a sink.
//!
//! Monthly history backfills write one sheet per sensor; `merge_sheets`
//! folds them into a single time-ordered sheet and `export_csv` writes any
//! sheet to a standalone CSV file.

use anyhow::{Context, Result, bail};
use chrono::NaiveDateTime;
use csv::WriterBuilder;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::output::{OutputSink, Table};
use crate::records::TIME_FORMAT;

/// History sheets for one month, one per sensor, in name order.
pub fn month_sheets(names: &[String], year: i32, month: u32) -> Vec<String> {
    let prefix = format!("history_{year}_{month:02}_");
    let mut sheets: Vec<String> = names
        .iter()
        .filter(|n| {
            n.strip_prefix(&prefix)
                .is_some_and(|rest| rest.parse::<u64>().is_ok())
        })
        .cloned()
        .collect();
    sheets.sort();
    sheets
}

/// Name the merged sheet for a month gets by default.
pub fn merged_month_sheet(year: i32, month: u32) -> String {
    format!("history_{year}_{month:02}_all")
}

/// Concatenates tables that share a header, drops repeated rows and orders
/// the rest by `time_stamp`. Rows whose time stamp does not parse keep
/// their relative order after the dated ones.
pub fn merge_tables(tables: &[(String, Table)]) -> Result<Table> {
    let Some((_, first)) = tables.first() else {
        bail!("nothing to merge");
    };

    let mut merged = Table {
        header: first.header.clone(),
        rows: Vec::new(),
    };
    let mut seen = HashSet::new();
    for (sheet, table) in tables {
        if table.header != merged.header {
            bail!("sheet '{sheet}' has a different header and cannot be merged");
        }
        for row in &table.rows {
            if seen.insert(row) {
                merged.rows.push(row.clone());
            }
        }
    }

    if let Some(col) = merged.column("time_stamp") {
        merged.rows.sort_by_cached_key(|row| {
            let ts = row
                .get(col)
                .and_then(|v| NaiveDateTime::parse_from_str(v, TIME_FORMAT).ok());
            (ts.is_none(), ts)
        });
    }
    Ok(merged)
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    pub out_sheet: String,
    pub sheets: Vec<String>,
    pub rows_in: usize,
    pub rows_out: usize,
}

/// Reads `sheets`, merges them and overwrites `out_sheet` with the result.
#[tracing::instrument(skip(sink))]
pub async fn merge_sheets(sink: &dyn OutputSink, sheets: &[String], out_sheet: &str) -> Result<MergeReport> {
    if sheets.iter().any(|s| s == out_sheet) {
        bail!("'{out_sheet}' is both a source and the merge target");
    }

    let mut tables = Vec::with_capacity(sheets.len());
    for sheet in sheets {
        let table = sink
            .read_rows(sheet)
            .await
            .with_context(|| format!("cannot read sheet '{sheet}'"))?;
        tables.push((sheet.clone(), table));
    }
    let rows_in = tables.iter().map(|(_, t)| t.rows.len()).sum();

    let merged = merge_tables(&tables)?;
    sink.replace_rows(out_sheet, &merged).await?;

    info!(out_sheet, sheets = sheets.len(), rows_in, rows_out = merged.rows.len(), "Sheets merged");
    Ok(MergeReport {
        out_sheet: out_sheet.to_string(),
        sheets: sheets.to_vec(),
        rows_in,
        rows_out: merged.rows.len(),
    })
}

fn write_table(path: &Path, table: &Table) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let mut writer = WriterBuilder::new().has_headers(false).from_path(path)?;
    writer.write_record(&table.header)?;
    for row in &table.rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes `sheet` to `path` as CSV, replacing any existing file. Returns the
/// number of data rows written.
pub async fn export_csv(sink: &dyn OutputSink, sheet: &str, path: &Path) -> Result<usize> {
    let table = sink.read_rows(sheet).await?;
    let rows = table.rows.len();
    let target: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_table(&target, &table))
        .await?
        .with_context(|| format!("cannot write {}", path.display()))?;

    info!(sheet, rows, path = %path.display(), "Sheet exported");
    Ok(rows)
}
