//! PurpleAir v1 REST API.

mod client;

pub use client::{PurpleAirClient, parse_history, parse_sensors};
