//! Automatic seismic event detection and location
//!
//! [`engine::Autoloc3`] takes a continuous stream of phase picks and
//! amplitudes and incrementally nucleates, associates, refines and publishes
//! hypocentres. The travel-time table, the locator inversion and the report
//! sink are pluggable.

pub mod associator;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod locator;
pub mod model;
pub mod nucleator;
pub mod pick_log;
pub mod playback;
pub mod report;
pub mod scoring;
pub mod station_config;
pub mod traveltime;

pub use config::Config;
pub use engine::Autoloc3;
pub use error::{AutolocError, Result};
pub use report::ReportSink;
