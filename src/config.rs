//! JSON configuration for regions, cleaning thresholds and pipeline tuning.
//!
//! ```json
//! {
//!   "local_region": "TV",
//!   "regions": [
//!     { "code": "TV", "name": "Temescal Valley", "bbox": [-117.5298, 33.7180, -117.4166, 33.8188] },
//!     { "code": "OC", "name": "Orange County",   "bbox": [-117.877808, 33.650065, -117.628899, 33.776579] }
//!   ],
//!   "healthy_threshold_pct": 70.0,
//!   "retry": { "max_attempts": 4, "initial_backoff_ms": 500, "max_backoff_ms": 30000 },
//!   "output": { "csv_dir": "data" }
//! }
//! ```
//!
//! Every field except `regions` and `local_region` has a default.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::analyzers::cleaner::{CleaningPolicy, EpaCorrection, ReadingCleaner};
use crate::catalog::{Region, RegionCatalog};
use crate::error::ConfigError;
use crate::output::check_sheet_name;
use crate::pipeline::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory holding one CSV file per sheet.
    #[serde(default = "default_csv_dir")]
    pub csv_dir: String,
    #[serde(default = "default_health_sheet")]
    pub health_sheet: String,
    #[serde(default = "default_summary_sheet")]
    pub summary_sheet: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            csv_dir: default_csv_dir(),
            health_sheet: default_health_sheet(),
            summary_sheet: default_summary_sheet(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Cycle order is `local_region` first, then this order.
    pub regions: Vec<Region>,
    pub local_region: String,

    #[serde(default = "default_threshold")]
    pub healthy_threshold_pct: f64,
    #[serde(default)]
    pub cleaning: CleaningPolicy,
    #[serde(default)]
    pub correction: EpaCorrection,
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Size of the gate shared by every request to the sensor API.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    #[serde(default = "default_samples_per_cycle")]
    pub samples_per_cycle: usize,
    #[serde(default = "default_sample_spacing_secs")]
    pub sample_spacing_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Sensors not seen within this many seconds are left out by the API.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    #[serde(default)]
    pub output: OutputConfig,

    /// Display name -> sensor index, used by the history backfill.
    #[serde(default)]
    pub sensors: BTreeMap<String, u64>,
}

fn default_csv_dir() -> String {
    "data".to_string()
}

fn default_health_sheet() -> String {
    "Health".to_string()
}

fn default_summary_sheet() -> String {
    "Summary".to_string()
}

fn default_threshold() -> f64 {
    70.0
}

fn default_max_concurrent_fetches() -> usize {
    2
}

fn default_samples_per_cycle() -> usize {
    1
}

fn default_sample_spacing_secs() -> u64 {
    60
}

fn default_poll_interval_secs() -> u64 {
    1200
}

fn default_max_age_secs() -> u64 {
    3600
}

impl AppConfig {
    /// Reads, parses and validates the config at `path`.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.catalog()?;
        self.validate_sheets()?;
        if !(0.0..=100.0).contains(&self.healthy_threshold_pct) {
            return Err(ConfigError::InvalidThreshold(self.healthy_threshold_pct));
        }
        self.cleaning.validate()?;
        self.retry.validate()?;
        if self.max_concurrent_fetches == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "max_concurrent_fetches",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.samples_per_cycle == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "samples_per_cycle",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Every region writes a sheet named after its code, next to the Health,
    /// Summary and `history_*` sheets. None of them may collide.
    fn validate_sheets(&self) -> Result<(), ConfigError> {
        let out = &self.output;
        let named = [&out.health_sheet, &out.summary_sheet]
            .into_iter()
            .chain(self.regions.iter().map(|r| &r.code));
        for sheet in named {
            check_sheet_name(sheet).map_err(|_| ConfigError::InvalidSheetName(sheet.clone()))?;
        }

        if out.health_sheet == out.summary_sheet {
            return Err(ConfigError::SheetNameClash(out.health_sheet.clone()));
        }
        for r in &self.regions {
            if r.code == out.health_sheet || r.code == out.summary_sheet || r.code.starts_with("history_") {
                return Err(ConfigError::SheetNameClash(r.code.clone()));
            }
        }
        Ok(())
    }

    pub fn catalog(&self) -> Result<RegionCatalog, ConfigError> {
        RegionCatalog::new(self.regions.clone(), &self.local_region)
    }

    pub fn cleaner(&self) -> ReadingCleaner {
        ReadingCleaner::new(self.cleaning.clone(), self.correction.clone())
    }

    /// Looks a sensor up by configured name, falling back to a numeric index.
    pub fn resolve_sensor(&self, name_or_index: &str) -> Option<u64> {
        self.sensors
            .get(name_or_index)
            .copied()
            .or_else(|| name_or_index.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "local_region": "TV",
        "regions": [
            { "code": "TV", "name": "Temescal Valley", "bbox": [-117.5298, 33.7180, -117.4166, 33.8188] },
            { "code": "RS", "name": "Riverside", "bbox": [-117.455864, 33.855306, -117.185326, 34.018518] }
        ],
        "sensors": { "SCTV_26": 9208 }
    }"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = AppConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.healthy_threshold_pct, 70.0);
        assert_eq!(config.output.health_sheet, "Health");
        assert_eq!(config.cleaning, CleaningPolicy::default());
        assert_eq!(config.correction, EpaCorrection::default());
        assert_eq!(config.samples_per_cycle, 1);
        assert_eq!(config.catalog().unwrap().local_code(), "TV");
    }

    #[test]
    fn test_partial_cleaning_section_keeps_other_defaults() {
        let json = MINIMAL.replace(
            r#""sensors""#,
            r#""cleaning": { "corrected_max": 250.0 }, "sensors""#,
        );
        let config = AppConfig::from_json(&json).unwrap();
        assert_eq!(config.cleaning.corrected_max, 250.0);
        assert_eq!(config.cleaning.abs_tolerance, 5.0);
    }

    #[test]
    fn test_degenerate_region_fails_at_load() {
        let json = MINIMAL.replace("-117.4166, 33.8188", "-117.5298, 33.8188");
        assert!(matches!(
            AppConfig::from_json(&json),
            Err(ConfigError::DegenerateRegion { .. })
        ));
    }

    #[test]
    fn test_threshold_out_of_range() {
        let json = MINIMAL.replace(r#""sensors""#, r#""healthy_threshold_pct": 120.0, "sensors""#);
        assert!(matches!(
            AppConfig::from_json(&json),
            Err(ConfigError::InvalidThreshold(_))
        ));
    }

    #[test]
    fn test_unparseable_config() {
        assert!(matches!(AppConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            AppConfig::load("/nonexistent/aq_rater.json"),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_region_code_cannot_share_a_sheet() {
        let json = MINIMAL.replace(r#""code": "RS""#, r#""code": "Health""#);
        assert!(matches!(
            AppConfig::from_json(&json),
            Err(ConfigError::SheetNameClash(code)) if code == "Health"
        ));

        let json = MINIMAL.replace(
            r#""sensors""#,
            r#""output": { "health_sheet": "Stats", "summary_sheet": "Stats" }, "sensors""#,
        );
        assert!(matches!(
            AppConfig::from_json(&json),
            Err(ConfigError::SheetNameClash(_))
        ));
    }

    #[test]
    fn test_region_code_must_be_a_plain_file_name() {
        for bad in ["../../etc/x", "a\\\\b", ".."] {
            let json = MINIMAL.replace(r#""code": "RS""#, &format!(r#""code": "{bad}""#));
            assert!(
                matches!(AppConfig::from_json(&json), Err(ConfigError::InvalidSheetName(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = AppConfig::from_json(include_str!("../config.example.json")).unwrap();
        assert_eq!(config.catalog().unwrap().cycle_order()[0].code, "TV");
        assert_eq!(config.regions.len(), 4);
    }

    #[test]
    fn test_resolve_sensor_by_name_or_index() {
        let config = AppConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.resolve_sensor("SCTV_26"), Some(9208));
        assert_eq!(config.resolve_sensor("9172"), Some(9172));
        assert_eq!(config.resolve_sensor("nope"), None);
    }
}
