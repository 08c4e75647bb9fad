//! Per-sample records flowing through one cycle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::catalog::GeoPoint;

/// One sensor's reading as returned by the sensor API. Never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReading {
    pub sensor_id: u64,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub region_code: String,
    /// Last reported location. History records carry none.
    pub location: Option<GeoPoint>,

    /// Primary PM2.5 channel (CF=1), µg/m³.
    pub measured_value: f64,
    /// Secondary laser counter on the same sensor, µg/m³.
    pub secondary_value: Option<f64>,
    /// Relative humidity, percent.
    pub humidity: Option<f64>,

    pub rssi: Option<i64>,
    pub uptime: Option<u64>,
}

/// Why a sample was discarded by cleaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    MissingAux,
    OutOfRange,
    SensorDisagreement,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::MissingAux => "missing_aux",
            RejectionReason::OutOfRange => "out_of_range",
            RejectionReason::SensorDisagreement => "sensor_disagreement",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of cleaning exactly one [`RawReading`].
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedSample {
    pub sensor_id: u64,
    pub timestamp: DateTime<Utc>,
    pub corrected_value: Option<f64>,
    pub rejected: bool,
    pub rejection_reason: Option<RejectionReason>,
    /// US AQI of `corrected_value`.
    pub aqi: Option<u16>,
}

impl CleanedSample {
    pub fn accepted(raw: &RawReading, corrected_value: f64, aqi: u16) -> Self {
        Self {
            sensor_id: raw.sensor_id,
            timestamp: raw.timestamp,
            corrected_value: Some(corrected_value),
            rejected: false,
            rejection_reason: None,
            aqi: Some(aqi),
        }
    }

    pub fn rejected(raw: &RawReading, reason: RejectionReason) -> Self {
        Self {
            sensor_id: raw.sensor_id,
            timestamp: raw.timestamp,
            corrected_value: None,
            rejected: true,
            rejection_reason: Some(reason),
            aqi: None,
        }
    }
}
