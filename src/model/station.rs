use serde::{Deserialize, Serialize};

/// A seismic station as known to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub net: String,
    pub code: String,
    pub lat: f64,
    pub lon: f64,
    /// Elevation in metres
    pub alt: f64,
    /// Automatic picks from unused stations are ignored
    pub used: bool,
    /// Maximum epicentral distance (degrees) for nucleation
    pub max_nuc_dist: f64,
    /// Maximum epicentral distance (degrees) for location
    pub max_loc_dist: f64,
}

impl Station {
    pub fn new(net: &str, code: &str, lat: f64, lon: f64, alt: f64) -> Self {
        Self {
            net: net.to_string(),
            code: code.to_string(),
            lat,
            lon,
            alt,
            used: true,
            max_nuc_dist: 180.0,
            max_loc_dist: 180.0,
        }
    }

    /// Registry key, "NET.CODE"
    pub fn key(&self) -> String {
        format!("{}.{}", self.net, self.code)
    }
}
