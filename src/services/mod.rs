//! Seams to the outside world the pipeline depends on.

pub mod sensor_source;

pub use sensor_source::{HistorySource, SensorBatch, SensorFailure, SensorSource};
