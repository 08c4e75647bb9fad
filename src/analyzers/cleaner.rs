//! EPA-style quality control for a single PurpleAir reading.
//!
//! A reading passes through four gates, in order:
//!
//! 1. both auxiliary inputs (secondary channel, humidity) must be present,
//! 2. every input must sit inside the instrument range,
//! 3. the two laser channels must agree (EPA dual-channel criterion),
//! 4. the corrected concentration must be physically plausible.
//!
//! The first failed gate decides the [`RejectionReason`]. All limits live in
//! [`CleaningPolicy`]; the correction formula is a [`Correction`] so it can be
//! swapped without touching the gates. Every bound is inclusive.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

use crate::analyzers::aqi::pm25_to_aqi;
use crate::error::ConfigError;
use crate::readings::{CleanedSample, RawReading, RejectionReason};

/// Turns a channel-averaged PM2.5 value and relative humidity into a
/// corrected concentration.
pub trait Correction: Debug + Send + Sync {
    fn correct(&self, pm: f64, humidity: f64) -> f64;
}

/// The US-wide PurpleAir correction published by the EPA, with every
/// coefficient configurable. Result is rounded to three decimals.
///
/// ```text
/// pm <= breakpoint:  low_pm * pm + low_rh * rh + low_intercept
/// pm >  breakpoint:  high_pm * pm + high_pm_sq * pm^2 + high_intercept
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpaCorrection {
    pub breakpoint: f64,
    pub low_pm: f64,
    pub low_rh: f64,
    pub low_intercept: f64,
    pub high_pm: f64,
    pub high_pm_sq: f64,
    pub high_intercept: f64,
}

impl Default for EpaCorrection {
    fn default() -> Self {
        Self {
            breakpoint: 343.0,
            low_pm: 0.52,
            low_rh: -0.086,
            low_intercept: 5.75,
            high_pm: 0.46,
            high_pm_sq: 3.93e-4,
            high_intercept: 2.97,
        }
    }
}

impl Correction for EpaCorrection {
    fn correct(&self, pm: f64, humidity: f64) -> f64 {
        let v = if pm <= self.breakpoint {
            self.low_pm * pm + self.low_rh * humidity + self.low_intercept
        } else {
            self.high_pm * pm + self.high_pm_sq * pm * pm + self.high_intercept
        };
        (v * 1000.0).round() / 1000.0
    }
}

/// Thresholds for the cleaning gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningPolicy {
    pub channel_min: f64,
    pub channel_max: f64,
    pub humidity_min: f64,
    pub humidity_max: f64,
    /// Channels disagree only when the absolute difference exceeds this
    /// AND the relative difference exceeds `rel_tolerance`.
    pub abs_tolerance: f64,
    /// `|a - b| / mean(a, b)`, as a fraction.
    pub rel_tolerance: f64,
    pub corrected_min: f64,
    pub corrected_max: f64,
    /// Clamp negative corrected values to zero before the plausibility check.
    pub floor_at_zero: bool,
}

impl Default for CleaningPolicy {
    fn default() -> Self {
        Self {
            channel_min: 0.0,
            channel_max: 1000.0,
            humidity_min: 0.0,
            humidity_max: 100.0,
            abs_tolerance: 5.0,
            rel_tolerance: 0.7,
            corrected_min: 0.0,
            corrected_max: 500.0,
            floor_at_zero: true,
        }
    }
}

impl CleaningPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_bounds("cleaning.channel", self.channel_min, self.channel_max)?;
        check_bounds("cleaning.humidity", self.humidity_min, self.humidity_max)?;
        check_bounds("cleaning.corrected", self.corrected_min, self.corrected_max)?;
        if !(self.abs_tolerance >= 0.0 && self.rel_tolerance >= 0.0) {
            return Err(ConfigError::InvalidSetting {
                name: "cleaning.tolerance",
                reason: "tolerances must be non-negative".to_string(),
            });
        }
        Ok(())
    }
}

fn check_bounds(name: &'static str, min: f64, max: f64) -> Result<(), ConfigError> {
    if min <= max {
        Ok(())
    } else {
        Err(ConfigError::InvalidBounds { name, min, max })
    }
}

fn within(v: f64, min: f64, max: f64) -> bool {
    v >= min && v <= max
}

/// Pure, deterministic reading cleaner.
#[derive(Debug, Clone)]
pub struct ReadingCleaner {
    policy: CleaningPolicy,
    correction: Arc<dyn Correction>,
}

impl Default for ReadingCleaner {
    fn default() -> Self {
        Self::new(CleaningPolicy::default(), EpaCorrection::default())
    }
}

impl ReadingCleaner {
    pub fn new(policy: CleaningPolicy, correction: impl Correction + 'static) -> Self {
        Self {
            policy,
            correction: Arc::new(correction),
        }
    }

    pub fn policy(&self) -> &CleaningPolicy {
        &self.policy
    }

    pub fn clean(&self, raw: &RawReading) -> CleanedSample {
        let p = &self.policy;

        let (Some(b), Some(rh)) = (raw.secondary_value, raw.humidity) else {
            return CleanedSample::rejected(raw, RejectionReason::MissingAux);
        };
        let a = raw.measured_value;

        if !within(a, p.channel_min, p.channel_max)
            || !within(b, p.channel_min, p.channel_max)
            || !within(rh, p.humidity_min, p.humidity_max)
        {
            return CleanedSample::rejected(raw, RejectionReason::OutOfRange);
        }

        let diff = (a - b).abs();
        let mean = (a + b) / 2.0;
        let rel = if mean > 0.0 { diff / mean } else { 0.0 };
        if diff > p.abs_tolerance && rel > p.rel_tolerance {
            return CleanedSample::rejected(raw, RejectionReason::SensorDisagreement);
        }

        let mut corrected = self.correction.correct(mean, rh);
        if p.floor_at_zero && corrected < 0.0 {
            corrected = 0.0;
        }
        if !within(corrected, p.corrected_min, p.corrected_max) {
            return CleanedSample::rejected(raw, RejectionReason::OutOfRange);
        }

        CleanedSample::accepted(raw, corrected, pm25_to_aqi(corrected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[derive(Debug)]
    struct Identity;

    impl Correction for Identity {
        fn correct(&self, pm: f64, _humidity: f64) -> f64 {
            pm
        }
    }

    fn reading(a: f64, b: Option<f64>, rh: Option<f64>) -> RawReading {
        RawReading {
            sensor_id: 9208,
            name: "SCTV_26".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            region_code: "TV".to_string(),
            location: None,
            measured_value: a,
            secondary_value: b,
            humidity: rh,
            rssi: None,
            uptime: None,
        }
    }

    #[test]
    fn test_epa_correction_low_segment() {
        let epa = EpaCorrection::default();
        // 0.52 * 11 - 0.086 * 50 + 5.75
        assert_eq!(epa.correct(11.0, 50.0), 7.17);
    }

    #[test]
    fn test_epa_correction_high_segment() {
        let epa = EpaCorrection::default();
        let expected = ((0.46 * 400.0 + 3.93e-4 * 160_000.0 + 2.97) * 1000.0_f64).round() / 1000.0;
        assert_eq!(epa.correct(400.0, 50.0), expected);
        assert_eq!(epa.correct(343.0, 0.0), ((0.52 * 343.0 + 5.75) * 1000.0_f64).round() / 1000.0);
    }

    #[test]
    fn test_clean_accepts_agreeing_channels() {
        let s = ReadingCleaner::default().clean(&reading(10.0, Some(12.0), Some(50.0)));
        assert!(!s.rejected);
        assert_eq!(s.corrected_value, Some(7.17));
        assert_eq!(s.rejection_reason, None);
        assert_eq!(s.aqi, Some(pm25_to_aqi(7.17)));
    }

    #[test]
    fn test_clean_missing_aux() {
        let c = ReadingCleaner::default();
        let s = c.clean(&reading(10.0, None, Some(50.0)));
        assert_eq!(s.rejection_reason, Some(RejectionReason::MissingAux));
        assert!(s.rejected);
        assert_eq!(s.corrected_value, None);

        let s = c.clean(&reading(10.0, Some(10.0), None));
        assert_eq!(s.rejection_reason, Some(RejectionReason::MissingAux));
    }

    #[test]
    fn test_clean_out_of_instrument_range() {
        let c = ReadingCleaner::default();
        assert_eq!(
            c.clean(&reading(-1.0, Some(0.0), Some(50.0))).rejection_reason,
            Some(RejectionReason::OutOfRange)
        );
        assert_eq!(
            c.clean(&reading(10.0, Some(10.0), Some(101.0))).rejection_reason,
            Some(RejectionReason::OutOfRange)
        );
        assert_eq!(
            c.clean(&reading(f64::NAN, Some(10.0), Some(50.0))).rejection_reason,
            Some(RejectionReason::OutOfRange)
        );
    }

    #[test]
    fn test_clean_channel_disagreement_needs_both_tolerances() {
        let c = ReadingCleaner::default();
        // 20 apart, 100% relative
        assert_eq!(
            c.clean(&reading(10.0, Some(30.0), Some(40.0))).rejection_reason,
            Some(RejectionReason::SensorDisagreement)
        );
        // 40 apart but only 33% relative
        assert!(!c.clean(&reading(100.0, Some(140.0), Some(40.0))).rejected);
        // 400% relative but only 4 apart
        assert!(!c.clean(&reading(1.0, Some(5.0), Some(40.0))).rejected);
    }

    #[test]
    fn test_clean_bounds_are_inclusive() {
        let policy = CleaningPolicy {
            channel_max: 200.0,
            corrected_max: 200.0,
            ..Default::default()
        };
        let c = ReadingCleaner::new(policy, Identity);

        let s = c.clean(&reading(200.0, Some(200.0), Some(100.0)));
        assert!(!s.rejected);
        assert_eq!(s.corrected_value, Some(200.0));

        let s = c.clean(&reading(200.0001, Some(200.0), Some(100.0)));
        assert_eq!(s.rejection_reason, Some(RejectionReason::OutOfRange));
    }

    #[test]
    fn test_clean_implausible_corrected_value() {
        let policy = CleaningPolicy {
            corrected_max: 50.0,
            ..Default::default()
        };
        let c = ReadingCleaner::new(policy, Identity);
        let s = c.clean(&reading(60.0, Some(60.0), Some(30.0)));
        assert_eq!(s.rejection_reason, Some(RejectionReason::OutOfRange));
    }

    #[test]
    fn test_negative_correction_floored() {
        // 0.52 * 0 - 0.086 * 100 + 5.75 < 0
        let s = ReadingCleaner::default().clean(&reading(0.0, Some(0.0), Some(100.0)));
        assert_eq!(s.corrected_value, Some(0.0));

        let policy = CleaningPolicy {
            floor_at_zero: false,
            ..Default::default()
        };
        let s = ReadingCleaner::new(policy, EpaCorrection::default())
            .clean(&reading(0.0, Some(0.0), Some(100.0)));
        assert_eq!(s.rejection_reason, Some(RejectionReason::OutOfRange));
    }

    #[test]
    fn test_clean_is_deterministic() {
        let c = ReadingCleaner::default();
        for r in [
            reading(10.0, Some(12.0), Some(50.0)),
            reading(10.0, Some(30.0), Some(50.0)),
            reading(10.0, None, None),
        ] {
            assert_eq!(c.clean(&r), c.clean(&r));
        }
    }

    #[test]
    fn test_policy_validation() {
        assert!(CleaningPolicy::default().validate().is_ok());
        let bad = CleaningPolicy {
            humidity_min: 90.0,
            humidity_max: 10.0,
            ..Default::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::InvalidBounds { name: "cleaning.humidity", .. })
        ));
    }
}
