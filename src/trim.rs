//! Shrinks a sheet by dropping its oldest rows.

use anyhow::{Context, Result};
use chrono::{Datelike, Duration, NaiveDateTime};
use tracing::info;

use crate::output::{OutputSink, Table};
use crate::records::TIME_FORMAT;

/// Which rows may go: older than `keep_days` and from before `month` of `year`.
#[derive(Debug, Clone, Copy)]
pub struct TrimRule {
    pub now: NaiveDateTime,
    pub keep_days: i64,
    pub month: u32,
    pub year: i32,
}

impl TrimRule {
    /// Cleans the month of `now` unless another month is given.
    pub fn new(now: NaiveDateTime, keep_days: i64, month: Option<u32>) -> Self {
        Self {
            now,
            keep_days,
            month: month.unwrap_or_else(|| now.month()),
            year: now.year(),
        }
    }

    fn eligible(&self, ts: NaiveDateTime) -> bool {
        self.now - ts > Duration::days(self.keep_days) && (ts.month() < self.month || ts.year() < self.year)
    }
}

/// Number of leading rows that may be removed.
///
/// Rows are assumed oldest first. Counting stops at the first row that must
/// stay (or whose time stamp does not parse), so only a contiguous block at
/// the top of the sheet is ever removed.
pub fn leading_rows_to_trim(table: &Table, rule: &TrimRule) -> Result<usize> {
    let col = table
        .column("time_stamp")
        .context("sheet has no time_stamp column")?;

    Ok(table
        .rows
        .iter()
        .take_while(|row| {
            row.get(col)
                .and_then(|v| NaiveDateTime::parse_from_str(v, TIME_FORMAT).ok())
                .is_some_and(|ts| rule.eligible(ts))
        })
        .count())
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrimPlan {
    pub sheet: String,
    pub rows: usize,
    pub first: Option<String>,
    pub last: Option<String>,
    pub applied: bool,
}

/// Works out what to trim from `sheet` and, when `apply` is set, rewrites it.
pub async fn trim_sheet(sink: &dyn OutputSink, sheet: &str, rule: &TrimRule, apply: bool) -> Result<TrimPlan> {
    let mut table = sink.read_rows(sheet).await?;
    let n = leading_rows_to_trim(&table, rule)?;
    let col = table.column("time_stamp").unwrap_or(0);

    let stamp = |i: usize| table.rows.get(i).and_then(|r| r.get(col)).cloned();
    let mut plan = TrimPlan {
        sheet: sheet.to_string(),
        rows: n,
        first: if n > 0 { stamp(0) } else { None },
        last: n.checked_sub(1).and_then(stamp),
        applied: false,
    };

    if n == 0 || !apply {
        return Ok(plan);
    }

    table.rows.drain(..n);
    sink.replace_rows(sheet, &table).await?;
    plan.applied = true;
    info!(sheet, rows = n, first = ?plan.first, last = ?plan.last, "Rows trimmed");
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MemorySink;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn sheet(stamps: &[NaiveDateTime]) -> Table {
        let mut t = Table::new(&["time_stamp", "pm25_epa"]);
        for s in stamps {
            t.rows.push(vec![s.format(TIME_FORMAT).to_string(), "5.0".to_string()]);
        }
        t
    }

    #[test]
    fn test_only_old_rows_from_prior_months() {
        let now = at(2024, 5, 20);
        let rule = TrimRule::new(now, 21, None);
        let t = sheet(&[at(2024, 3, 1), at(2024, 4, 15), at(2024, 4, 29), at(2024, 5, 1)]);
        // 04/29 is within 21 days
        assert_eq!(leading_rows_to_trim(&t, &rule).unwrap(), 2);
    }

    #[test]
    fn test_current_month_rows_are_kept_even_when_old() {
        let now = at(2024, 5, 30);
        let rule = TrimRule::new(now, 3, None);
        let t = sheet(&[at(2024, 5, 1), at(2024, 5, 2)]);
        assert_eq!(leading_rows_to_trim(&t, &rule).unwrap(), 0);

        let rule = TrimRule::new(now, 3, Some(6));
        assert_eq!(leading_rows_to_trim(&t, &rule).unwrap(), 2);
    }

    #[test]
    fn test_prior_year_rows_trimmed() {
        let rule = TrimRule::new(at(2024, 1, 10), 21, None);
        let t = sheet(&[at(2023, 11, 1), at(2023, 12, 31)]);
        assert_eq!(leading_rows_to_trim(&t, &rule).unwrap(), 1);
    }

    #[test]
    fn test_unparseable_stamp_stops_trim() {
        let rule = TrimRule::new(at(2024, 5, 20), 1, None);
        let mut t = sheet(&[at(2024, 1, 1)]);
        t.rows.insert(0, vec!["garbage".to_string(), "1".to_string()]);
        assert_eq!(leading_rows_to_trim(&t, &rule).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_trim_sheet_dry_run_then_apply() {
        let sink = MemorySink::new();
        sink.append_rows("TV", &sheet(&[at(2024, 3, 1), at(2024, 3, 2), at(2024, 5, 19)]))
            .await
            .unwrap();
        let rule = TrimRule::new(at(2024, 5, 20), 21, None);

        let plan = trim_sheet(&sink, "TV", &rule, false).await.unwrap();
        assert_eq!(plan.rows, 2);
        assert!(!plan.applied);
        assert_eq!(plan.first.as_deref(), Some("03/01/2024 12:00:00"));
        assert_eq!(plan.last.as_deref(), Some("03/02/2024 12:00:00"));
        assert_eq!(sink.read_rows("TV").await.unwrap().rows.len(), 3);

        let plan = trim_sheet(&sink, "TV", &rule, true).await.unwrap();
        assert!(plan.applied);
        let left = sink.read_rows("TV").await.unwrap();
        assert_eq!(left.rows.len(), 1);
        assert_eq!(left.rows[0][0], "05/19/2024 12:00:00");
    }

    #[tokio::test]
    async fn test_trim_missing_sheet_errors() {
        let sink = MemorySink::new();
        let rule = TrimRule::new(at(2024, 5, 20), 21, None);
        assert!(trim_sheet(&sink, "nope", &rule, true).await.is_err());
    }
}
