//! Named rectangular regions and point membership.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::ConfigError;

/// A longitude/latitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lon: f64,
    pub lat: f64,
}

impl GeoPoint {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }
}

/// Axis-aligned rectangle. Bounds are inclusive.
///
/// Serialized as `[min_lon, min_lat, max_lon, max_lat]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// `false` when either axis has `min >= max` (or a NaN bound).
    pub fn is_valid(&self) -> bool {
        self.min_lon < self.max_lon && self.min_lat < self.max_lat
    }

    pub fn contains(&self, p: GeoPoint) -> bool {
        p.lon >= self.min_lon && p.lon <= self.max_lon && p.lat >= self.min_lat && p.lat <= self.max_lat
    }
}

impl From<[f64; 4]> for BoundingBox {
    fn from(v: [f64; 4]) -> Self {
        BoundingBox::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.min_lon, b.min_lat, b.max_lon, b.max_lat]
    }
}

/// A named bounding box, the unit of aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub code: String,
    pub name: String,
    pub bbox: BoundingBox,
}

impl Region {
    pub fn new(code: &str, name: &str, bbox: BoundingBox) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            bbox,
        }
    }

    pub fn contains(&self, p: GeoPoint) -> bool {
        self.bbox.contains(p)
    }
}

/// The configured set of regions, validated once at load time.
#[derive(Debug, Clone)]
pub struct RegionCatalog {
    regions: Vec<Region>,
    local: String,
}

impl RegionCatalog {
    /// Validates every region and the local designation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an empty or duplicate code, a degenerate
    /// rectangle, or a local code that names no region.
    pub fn new(regions: Vec<Region>, local: &str) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for r in &regions {
            if r.code.is_empty() {
                return Err(ConfigError::EmptyRegionCode);
            }
            if !seen.insert(r.code.as_str()) {
                return Err(ConfigError::DuplicateRegion(r.code.clone()));
            }
            if !r.bbox.is_valid() {
                return Err(ConfigError::DegenerateRegion {
                    code: r.code.clone(),
                });
            }
        }
        if !seen.contains(local) {
            return Err(ConfigError::UnknownLocalRegion(local.to_string()));
        }

        Ok(Self {
            regions,
            local: local.to_string(),
        })
    }

    pub fn local_code(&self) -> &str {
        &self.local
    }

    pub fn is_local(&self, code: &str) -> bool {
        self.local == code
    }

    pub fn get(&self, code: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.code == code)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Every region whose rectangle contains `p`. Regions may overlap.
    pub fn membership(&self, p: GeoPoint) -> Vec<&Region> {
        self.regions.iter().filter(|r| r.contains(p)).collect()
    }

    /// The local region first, then the rest in configured order.
    pub fn cycle_order(&self) -> Vec<Region> {
        let mut ordered = Vec::with_capacity(self.regions.len());
        ordered.extend(self.regions.iter().filter(|r| r.code == self.local).cloned());
        ordered.extend(self.regions.iter().filter(|r| r.code != self.local).cloned());
        ordered
    }
}
