//! Row-oriented output sinks.
//!
//! The pipeline and the maintenance commands only see [`OutputSink`]; a
//! spreadsheet backend would implement the same trait. [`CsvSink`] keeps one
//! file per sheet, [`MemorySink`] is used for dry runs and tests.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use csv::{ReaderBuilder, WriterBuilder};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A header plus data rows, all as display strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(header: &[&str]) -> Self {
        Self {
            header: header.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }
}

#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Appends `table.rows` to `sheet`, creating it with `table.header` if
    /// it does not exist yet.
    async fn append_rows(&self, sheet: &str, table: &Table) -> Result<()>;

    /// Reads a sheet back. A missing sheet is an error.
    async fn read_rows(&self, sheet: &str) -> Result<Table>;

    /// Overwrites a sheet with exactly `table`.
    async fn replace_rows(&self, sheet: &str, table: &Table) -> Result<()>;

    /// Names of every existing sheet, sorted.
    async fn sheet_names(&self) -> Result<Vec<String>>;
}

/// Sheet names become file names, so they must be a single plain component.
pub fn check_sheet_name(sheet: &str) -> Result<()> {
    if sheet.is_empty()
        || sheet == "."
        || sheet == ".."
        || sheet.contains(['/', '\\', '\0'])
    {
        bail!("invalid sheet name '{sheet}'");
    }
    Ok(())
}

fn check_header(sheet: &str, existing: &[String], table: &Table) -> Result<()> {
    if existing != table.header.as_slice() {
        bail!(
            "sheet '{sheet}' has header {:?}, refusing to append rows with header {:?}",
            existing,
            table.header
        );
    }
    Ok(())
}

/// Writes each sheet to `<dir>/<sheet>.csv`.
pub struct CsvSink {
    dir: PathBuf,
}

impl CsvSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create output directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, sheet: &str) -> PathBuf {
        self.dir.join(format!("{sheet}.csv"))
    }

    fn checked_path(&self, sheet: &str) -> Result<PathBuf> {
        check_sheet_name(sheet)?;
        Ok(self.path_for(sheet))
    }
}

fn check_width(table: &Table) -> Result<()> {
    if let Some(row) = table.rows.iter().find(|r| r.len() != table.header.len()) {
        bail!(
            "row has {} columns but header has {}",
            row.len(),
            table.header.len()
        );
    }
    Ok(())
}

/// First record of an existing file, `None` when the file is missing or empty.
fn read_header(path: &Path) -> Result<Option<Vec<String>>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut rdr = ReaderBuilder::new().has_headers(false).from_path(path)?;
    match rdr.records().next() {
        Some(record) => Ok(Some(record?.iter().map(str::to_string).collect())),
        None => Ok(None),
    }
}

fn append_csv(sheet: &str, path: &Path, table: &Table) -> Result<()> {
    let existing = read_header(path)?;
    debug!(path = %path.display(), file_exists = existing.is_some(), rows = table.rows.len(), "Appending CSV rows");

    if let Some(header) = &existing {
        check_header(sheet, header, table)?;
    }

    let file = OpenOptions::new().append(true).create(true).open(path)?;
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);

    if existing.is_none() {
        writer.write_record(&table.header)?;
    }
    for row in &table.rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn read_csv(path: &Path) -> Result<Table> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("cannot open sheet {}", path.display()))?;
    let header = rdr.headers()?.iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    for record in rdr.records() {
        rows.push(record?.iter().map(str::to_string).collect());
    }
    Ok(Table { header, rows })
}

fn write_csv(path: &Path, table: &Table) -> Result<()> {
    // Write aside and rename so readers never see a half-written sheet.
    let tmp = path.with_extension("csv.tmp");
    {
        let mut writer = WriterBuilder::new().has_headers(false).from_path(&tmp)?;
        writer.write_record(&table.header)?;
        for row in &table.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl OutputSink for CsvSink {
    async fn append_rows(&self, sheet: &str, table: &Table) -> Result<()> {
        check_width(table)?;
        if table.is_empty() {
            return Ok(());
        }
        let path = self.checked_path(sheet)?;
        let sheet = sheet.to_string();
        let table = table.clone();
        tokio::task::spawn_blocking(move || append_csv(&sheet, &path, &table)).await?
    }

    async fn read_rows(&self, sheet: &str) -> Result<Table> {
        let path = self.checked_path(sheet)?;
        tokio::task::spawn_blocking(move || read_csv(&path)).await?
    }

    async fn replace_rows(&self, sheet: &str, table: &Table) -> Result<()> {
        check_width(table)?;
        let path = self.checked_path(sheet)?;
        let rows = table.rows.len();
        let table = table.clone();
        tokio::task::spawn_blocking(move || write_csv(&path, &table)).await??;
        info!(sheet, rows, "Sheet rewritten");
        Ok(())
    }

    async fn sheet_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "csv") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Keeps sheets in memory.
#[derive(Default)]
pub struct MemorySink {
    sheets: Mutex<BTreeMap<String, Table>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn append_rows(&self, sheet: &str, table: &Table) -> Result<()> {
        check_width(table)?;
        if table.is_empty() {
            return Ok(());
        }
        let mut sheets = self.sheets.lock().await;
        let entry = sheets.entry(sheet.to_string()).or_insert_with(|| Table {
            header: table.header.clone(),
            rows: Vec::new(),
        });
        check_header(sheet, &entry.header, table)?;
        entry.rows.extend(table.rows.iter().cloned());
        Ok(())
    }

    async fn read_rows(&self, sheet: &str) -> Result<Table> {
        self.sheets
            .lock()
            .await
            .get(sheet)
            .cloned()
            .with_context(|| format!("sheet '{sheet}' not found"))
    }

    async fn replace_rows(&self, sheet: &str, table: &Table) -> Result<()> {
        check_width(table)?;
        self.sheets
            .lock()
            .await
            .insert(sheet.to_string(), table.clone());
        Ok(())
    }

    async fn sheet_names(&self) -> Result<Vec<String>> {
        Ok(self.sheets.lock().await.keys().cloned().collect())
    }
}
