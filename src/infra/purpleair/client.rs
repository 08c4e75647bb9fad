use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use crate::catalog::{GeoPoint, Region};
use crate::error::FetchError;
use crate::fetch::auth::ApiKey;
use crate::fetch::{BasicClient, HttpClient, fetch_bytes};
use crate::readings::RawReading;
use crate::services::{HistorySource, SensorBatch, SensorFailure, SensorSource};

const DEFAULT_BASE_URL: &str = "https://api.purpleair.com";

const CURRENT_FIELDS: &str = "name,latitude,longitude,last_seen,rssi,uptime,humidity,\
pm2.5_cf_1_a,pm2.5_cf_1_b";

const HISTORY_FIELDS: &str = "rssi,uptime,humidity,pm2.5_cf_1_a,pm2.5_cf_1_b";

/// PurpleAir answers with a column list plus row arrays.
#[derive(Deserialize)]
struct TablePayload {
    #[serde(default)]
    data_time_stamp: Option<i64>,
    #[serde(default)]
    sensor_index: Option<u64>,
    fields: Vec<String>,
    data: Vec<Vec<Value>>,
}

struct Columns<'a> {
    index: HashMap<&'a str, usize>,
}

impl<'a> Columns<'a> {
    fn new(fields: &'a [String]) -> Self {
        Self {
            index: fields.iter().enumerate().map(|(i, f)| (f.as_str(), i)).collect(),
        }
    }

    fn get<'r>(&self, row: &'r [Value], name: &str) -> Option<&'r Value> {
        row.get(*self.index.get(name)?).filter(|v| !v.is_null())
    }

    fn f64(&self, row: &[Value], name: &str) -> Option<f64> {
        self.get(row, name)?.as_f64()
    }

    fn i64(&self, row: &[Value], name: &str) -> Option<i64> {
        self.get(row, name)?.as_i64()
    }

    fn u64(&self, row: &[Value], name: &str) -> Option<u64> {
        self.get(row, name)?.as_u64()
    }

    fn str(&self, row: &[Value], name: &str) -> Option<String> {
        self.get(row, name)?.as_str().map(str::to_string)
    }
}

fn unix(ts: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0).single()
}

fn decode(bytes: &[u8]) -> Result<TablePayload, FetchError> {
    serde_json::from_slice(bytes)
        .map_err(|e| FetchError::Fatal(format!("unexpected PurpleAir payload: {e}")))
}

/// Parses a `/v1/sensors` response into readings tagged with `region_code`.
///
/// Rows without a sensor index, primary channel or time stamp become
/// [`SensorFailure`]s rather than failing the whole batch.
pub fn parse_sensors(bytes: &[u8], region_code: &str) -> Result<SensorBatch, FetchError> {
    let payload = decode(bytes)?;
    let cols = Columns::new(&payload.fields);
    let fallback_ts = payload.data_time_stamp.and_then(unix);

    let mut batch = SensorBatch::default();
    for row in &payload.data {
        let Some(sensor_id) = cols.u64(row, "sensor_index") else {
            batch.failures.push(SensorFailure {
                sensor_id: None,
                reason: "row without sensor_index".to_string(),
            });
            continue;
        };
        let Some(measured_value) = cols.f64(row, "pm2.5_cf_1_a") else {
            batch.failures.push(SensorFailure {
                sensor_id: Some(sensor_id),
                reason: "no pm2.5_cf_1_a value".to_string(),
            });
            continue;
        };
        let Some(timestamp) = cols.i64(row, "last_seen").and_then(unix).or(fallback_ts) else {
            batch.failures.push(SensorFailure {
                sensor_id: Some(sensor_id),
                reason: "no time stamp".to_string(),
            });
            continue;
        };

        let location = match (cols.f64(row, "longitude"), cols.f64(row, "latitude")) {
            (Some(lon), Some(lat)) => Some(GeoPoint::new(lon, lat)),
            _ => None,
        };

        batch.readings.push(RawReading {
            sensor_id,
            name: cols.str(row, "name").unwrap_or_default(),
            timestamp,
            region_code: region_code.to_string(),
            location,
            measured_value,
            secondary_value: cols.f64(row, "pm2.5_cf_1_b"),
            humidity: cols.f64(row, "humidity"),
            rssi: cols.i64(row, "rssi"),
            uptime: cols.u64(row, "uptime"),
        });
    }

    Ok(batch)
}

/// Parses a `/v1/sensors/{id}/history` response. Readings carry no name,
/// region or location; the caller labels them.
pub fn parse_history(bytes: &[u8], sensor_id: u64) -> Result<SensorBatch, FetchError> {
    let payload = decode(bytes)?;
    let cols = Columns::new(&payload.fields);
    let sensor_id = payload.sensor_index.unwrap_or(sensor_id);

    let mut batch = SensorBatch::default();
    for row in &payload.data {
        let (Some(timestamp), Some(measured_value)) = (
            cols.i64(row, "time_stamp").and_then(unix),
            cols.f64(row, "pm2.5_cf_1_a"),
        ) else {
            batch.failures.push(SensorFailure {
                sensor_id: Some(sensor_id),
                reason: "history row without time_stamp or pm2.5_cf_1_a".to_string(),
            });
            continue;
        };

        batch.readings.push(RawReading {
            sensor_id,
            name: String::new(),
            timestamp,
            region_code: String::new(),
            location: None,
            measured_value,
            secondary_value: cols.f64(row, "pm2.5_cf_1_b"),
            humidity: cols.f64(row, "humidity"),
            rssi: cols.i64(row, "rssi"),
            uptime: cols.u64(row, "uptime"),
        });
    }
    batch.readings.sort_by_key(|r| r.timestamp);

    Ok(batch)
}

/// [`SensorSource`] and [`HistorySource`] backed by the PurpleAir v1 API.
pub struct PurpleAirClient<C> {
    http: C,
    base_url: String,
    max_age_secs: u64,
}

impl PurpleAirClient<ApiKey<BasicClient>> {
    /// Builds a client that authenticates with a PurpleAir read key.
    pub fn new(read_key: &str, max_age_secs: u64) -> Result<Self> {
        let http = ApiKey::purpleair(BasicClient::new()?, read_key)?;
        Ok(Self::with_client(http, DEFAULT_BASE_URL, max_age_secs))
    }
}

impl<C: HttpClient> PurpleAirClient<C> {
    pub fn with_client(http: C, base_url: &str, max_age_secs: u64) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_age_secs,
        }
    }

    /// PurpleAir names the box by its north-west and south-east corners.
    pub fn sensors_url(&self, region: &Region) -> Result<Url, FetchError> {
        let b = &region.bbox;
        Url::parse_with_params(
            &format!("{}/v1/sensors", self.base_url),
            &[
                ("fields", CURRENT_FIELDS.to_string()),
                ("nwlng", b.min_lon.to_string()),
                ("nwlat", b.max_lat.to_string()),
                ("selng", b.max_lon.to_string()),
                ("selat", b.min_lat.to_string()),
                ("max_age", self.max_age_secs.to_string()),
            ],
        )
        .map_err(|e| FetchError::Fatal(format!("cannot build sensors url: {e}")))
    }

    pub fn history_url(
        &self,
        sensor_id: u64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        average_minutes: u32,
    ) -> Result<Url, FetchError> {
        Url::parse_with_params(
            &format!("{}/v1/sensors/{}/history", self.base_url, sensor_id),
            &[
                ("start_timestamp", start.timestamp().to_string()),
                ("end_timestamp", end.timestamp().to_string()),
                ("average", average_minutes.to_string()),
                ("fields", HISTORY_FIELDS.to_string()),
            ],
        )
        .map_err(|e| FetchError::Fatal(format!("cannot build history url: {e}")))
    }
}

#[async_trait]
impl<C: HttpClient> SensorSource for PurpleAirClient<C> {
    async fn fetch(&self, region: &Region) -> Result<SensorBatch, FetchError> {
        let url = self.sensors_url(region)?;
        let bytes = fetch_bytes(&self.http, url.as_str()).await?;
        let batch = parse_sensors(&bytes, &region.code)?;
        debug!(
            region = %region.code,
            readings = batch.readings.len(),
            failures = batch.failures.len(),
            "Sensors payload parsed"
        );
        Ok(batch)
    }
}

#[async_trait]
impl<C: HttpClient> HistorySource for PurpleAirClient<C> {
    async fn history(
        &self,
        sensor_id: u64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        average_minutes: u32,
    ) -> Result<SensorBatch, FetchError> {
        let url = self.history_url(sensor_id, start, end, average_minutes)?;
        let bytes = fetch_bytes(&self.http, url.as_str()).await?;
        parse_history(&bytes, sensor_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BoundingBox;

    const SENSORS: &str = r#"{
        "api_version": "V1.0.11-0.0.49",
        "time_stamp": 1714564860,
        "data_time_stamp": 1714564800,
        "max_age": 3600,
        "fields": ["sensor_index", "name", "latitude", "longitude", "last_seen", "rssi", "uptime",
                   "humidity", "pm2.5_cf_1_a", "pm2.5_cf_1_b"],
        "data": [
            [9208, "SCTV_26", 33.75, -117.45, 1714564750, -61, 12345, 41, 10.2, 11.0],
            [9172, "Temescal", 33.77, -117.47, null, -70, 99, null, 8.5, null],
            [9356, "Oz Terramor", 33.76, -117.46, 1714564700, -55, 10, 30, null, 7.0],
            [null, "ghost", 33.76, -117.46, 1714564700, -55, 10, 30, 5.0, 5.0]
        ]
    }"#;

    #[test]
    fn test_parse_sensors() {
        let batch = parse_sensors(SENSORS.as_bytes(), "TV").unwrap();
        assert_eq!(batch.readings.len(), 2);
        assert_eq!(batch.failures.len(), 2);

        let r = &batch.readings[0];
        assert_eq!(r.sensor_id, 9208);
        assert_eq!(r.name, "SCTV_26");
        assert_eq!(r.region_code, "TV");
        assert_eq!(r.location, Some(GeoPoint::new(-117.45, 33.75)));
        assert_eq!(r.timestamp.timestamp(), 1714564750);
        assert_eq!(r.measured_value, 10.2);
        assert_eq!(r.secondary_value, Some(11.0));
        assert_eq!(r.humidity, Some(41.0));
        assert_eq!(r.rssi, Some(-61));
        assert_eq!(r.uptime, Some(12345));

        // missing last_seen falls back to data_time_stamp; nulls become None
        let r = &batch.readings[1];
        assert_eq!(r.timestamp.timestamp(), 1714564800);
        assert_eq!(r.humidity, None);
        assert_eq!(r.secondary_value, None);

        assert_eq!(batch.failures[0].sensor_id, Some(9356));
        assert_eq!(batch.failures[1].sensor_id, None);
    }

    #[test]
    fn test_parse_garbage_is_fatal() {
        let err = parse_sensors(b"<html>", "TV").unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_parse_history_sorts_by_time() {
        let body = r#"{
            "sensor_index": 9208,
            "fields": ["time_stamp", "humidity", "pm2.5_cf_1_a", "pm2.5_cf_1_b"],
            "data": [[1714600000, 40, 3.0, 3.2], [1714500000, 45, 4.0, 4.1], [1714550000, 45, null, 4.1]]
        }"#;
        let batch = parse_history(body.as_bytes(), 1).unwrap();
        assert_eq!(batch.readings.len(), 2);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.readings[0].sensor_id, 9208);
        assert!(batch.readings[0].timestamp < batch.readings[1].timestamp);
    }

    #[test]
    fn test_sensors_url_uses_corners() {
        struct Never;
        #[async_trait]
        impl HttpClient for Never {
            async fn execute(&self, _req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
                unreachable!()
            }
        }

        let client = PurpleAirClient::with_client(Never, "https://api.purpleair.com/", 600);
        let region = Region::new("TV", "Temescal Valley", BoundingBox::new(-117.5, 33.7, -117.4, 33.8));
        let url = client.sensors_url(&region).unwrap();
        let q: HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(url.path(), "/v1/sensors");
        assert_eq!(q["nwlng"], "-117.5");
        assert_eq!(q["nwlat"], "33.8");
        assert_eq!(q["selng"], "-117.4");
        assert_eq!(q["selat"], "33.7");
        assert_eq!(q["max_age"], "600");
        assert!(q["fields"].contains("pm2.5_cf_1_b"));
    }
}
