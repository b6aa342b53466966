//! Domain data model: stations, picks, arrivals and origins

pub mod arrival;
pub mod origin;
pub mod pick;
pub mod station;

pub use arrival::{Arrival, Exclusion};
pub use origin::{
    DepthType, Hypocenter, Origin, OriginError, OriginId, OriginIdGenerator, OriginQuality,
    OriginVector, Trial,
};
pub use pick::{Amplitude, Pick, PickStatus};
pub use station::Station;

/// Seconds since the Unix epoch
pub type Time = f64;

/// Render a time for log lines
pub fn time2str(t: Time) -> String {
    let secs = t.floor();
    let nanos = ((t - secs) * 1e9).round().clamp(0.0, 999_999_999.0) as u32;
    match chrono::DateTime::from_timestamp(secs as i64, nanos) {
        Some(dt) => format!("{}.{}", dt.format("%Y-%m-%d %H:%M:%S"), nanos / 100_000_000),
        None => format!("{:.1}", t),
    }
}
