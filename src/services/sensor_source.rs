//! Traits for retrieving sensor readings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::catalog::Region;
use crate::error::FetchError;
use crate::readings::RawReading;

/// A sensor whose record could not be turned into a [`RawReading`].
#[derive(Debug, Clone, PartialEq)]
pub struct SensorFailure {
    pub sensor_id: Option<u64>,
    pub reason: String,
}

/// Everything one request returned: usable readings plus per-sensor failures.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorBatch {
    pub readings: Vec<RawReading>,
    pub failures: Vec<SensorFailure>,
}

/// Current readings for every sensor registered inside a region.
#[async_trait]
pub trait SensorSource: Send + Sync {
    /// Returns readings for sensors located inside `region.bbox`, tagged with
    /// `region.code`.
    ///
    /// # Errors
    ///
    /// [`FetchError::Transient`] when a retry may succeed,
    /// [`FetchError::Fatal`] when it will not.
    async fn fetch(&self, region: &Region) -> Result<SensorBatch, FetchError>;
}

/// Averaged historical readings for a single sensor.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn history(
        &self,
        sensor_id: u64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        average_minutes: u32,
    ) -> Result<SensorBatch, FetchError>;
}
