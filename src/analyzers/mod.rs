//! Reading cleanup, confidence scoring, and regional aggregation.
//!
//! Everything in here is pure and synchronous: the same inputs always give
//! the same outputs, so per-sensor work can run in any order or in parallel.

pub mod aggregate;
pub mod aqi;
pub mod cleaner;
pub mod scorer;
pub mod types;
pub mod utility;
