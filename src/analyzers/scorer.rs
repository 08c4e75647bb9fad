use std::collections::BTreeMap;

use crate::analyzers::types::SensorConfidence;
use crate::analyzers::utility::mean;
use crate::readings::CleanedSample;

/// Percentage of `part` in `total`, or `None` when there is nothing to divide.
pub fn pct(part: usize, total: usize) -> Option<f64> {
    if total == 0 {
        None
    } else {
        Some(part as f64 * 100.0 / total as f64)
    }
}

/// Scores one sensor's samples for one cycle.
///
/// `samples` must all belong to `sensor_id`; order only affects the window
/// bounds, never the counts.
pub fn score(sensor_id: u64, region_code: &str, samples: &[CleanedSample]) -> SensorConfidence {
    let mut rejections = BTreeMap::new();
    let mut valid = Vec::with_capacity(samples.len());

    for s in samples {
        match (s.corrected_value, s.rejection_reason) {
            (Some(v), None) if !s.rejected => valid.push(v),
            (_, reason) => {
                if let Some(reason) = reason {
                    *rejections.entry(reason).or_insert(0) += 1;
                }
            }
        }
    }

    let total_count = samples.len();
    let valid_count = valid.len();

    SensorConfidence {
        sensor_id,
        region_code: region_code.to_string(),
        window_start: samples.iter().map(|s| s.timestamp).min(),
        window_end: samples.iter().map(|s| s.timestamp).max(),
        valid_count,
        total_count,
        confidence_pct: pct(valid_count, total_count),
        mean_value: (!valid.is_empty()).then(|| mean(&valid)),
        rejections,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readings::RejectionReason;
    use chrono::{Duration, TimeZone, Utc};

    fn sample(i: i64, value: Option<f64>, reason: Option<RejectionReason>) -> CleanedSample {
        CleanedSample {
            sensor_id: 1,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::minutes(i),
            corrected_value: value,
            rejected: reason.is_some(),
            rejection_reason: reason,
            aqi: None,
        }
    }

    #[test]
    fn test_pct_with_zero_total_is_none() {
        assert_eq!(pct(0, 0), None);
        assert_eq!(pct(1, 4), Some(25.0));
    }

    #[test]
    fn test_three_of_ten_rejected() {
        let samples: Vec<_> = (0..10)
            .map(|i| {
                if i < 3 {
                    sample(i, None, Some(RejectionReason::OutOfRange))
                } else {
                    sample(i, Some(10.0), None)
                }
            })
            .collect();

        let c = score(1, "TV", &samples);
        assert_eq!(c.confidence_pct, Some(70.0));
        assert_eq!(c.valid_count, 7);
        assert_eq!(c.total_count, 10);
        assert_eq!(c.rejected_count(), 3);
        assert_eq!(c.rejections.get(&RejectionReason::OutOfRange), Some(&3));
        assert_eq!(c.mean_value, Some(10.0));
        assert_eq!(c.window_end.unwrap() - c.window_start.unwrap(), Duration::minutes(9));
    }

    #[test]
    fn test_empty_window_is_undefined_not_zero() {
        let c = score(1, "TV", &[]);
        assert_eq!(c.confidence_pct, None);
        assert_eq!(c.valid_count, 0);
        assert_eq!(c.total_count, 0);
        assert_eq!(c.mean_value, None);
        assert!(!c.is_healthy(0.0));
    }

    #[test]
    fn test_all_rejected_is_zero_confidence() {
        let samples = vec![
            sample(0, None, Some(RejectionReason::MissingAux)),
            sample(1, None, Some(RejectionReason::SensorDisagreement)),
        ];
        let c = score(1, "TV", &samples);
        assert_eq!(c.confidence_pct, Some(0.0));
        assert_eq!(c.mean_value, None);
        assert_eq!(c.rejections.len(), 2);
    }

    #[test]
    fn test_healthy_threshold_is_inclusive() {
        let samples: Vec<_> = (0..10)
            .map(|i| {
                if i < 3 {
                    sample(i, None, Some(RejectionReason::OutOfRange))
                } else {
                    sample(i, Some(5.0), None)
                }
            })
            .collect();
        let c = score(1, "TV", &samples);
        assert!(c.is_healthy(70.0));
        assert!(!c.is_healthy(70.1));
    }
}
