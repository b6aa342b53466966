use super::station::Station;
use super::Time;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PickStatus {
    Automatic,
    Manual,
    Confirmed,
    IgnoredAutomatic,
}

/// A phase onset detected at one station.
///
/// Picks are shared as `Arc<Pick>` between the pick buffer, arrivals and the
/// nucleator. Only the engine changes the annotation fields (`normamp`,
/// `xxl`, `status`), by replacing its buffered copy before the pick is used.
/// Identity is the `id`; two `Arc`s with the same id are the same pick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pick {
    pub id: String,
    pub net: String,
    pub sta: String,
    #[serde(default)]
    pub loc: String,
    #[serde(default)]
    pub cha: String,
    pub time: Time,
    #[serde(default)]
    pub amp: f64,
    #[serde(default)]
    pub per: f64,
    #[serde(default)]
    pub snr: f64,
    #[serde(default)]
    pub normamp: f64,
    pub status: PickStatus,
    #[serde(default)]
    pub xxl: bool,
    /// Resolved once the station is known; never changes afterwards
    #[serde(skip)]
    pub station: Option<Arc<Station>>,
}

impl Pick {
    pub fn new(id: &str, net: &str, sta: &str, time: Time) -> Self {
        Self {
            id: id.to_string(),
            net: net.to_string(),
            sta: sta.to_string(),
            loc: String::new(),
            cha: "BHZ".to_string(),
            time,
            amp: 0.0,
            per: 0.0,
            snr: 0.0,
            normamp: 0.0,
            status: PickStatus::Automatic,
            xxl: false,
            station: None,
        }
    }

    pub fn with_amplitude(mut self, amp: f64, per: f64, snr: f64) -> Self {
        self.amp = amp;
        self.per = per;
        self.snr = snr;
        self
    }

    pub fn with_status(mut self, status: PickStatus) -> Self {
        self.status = status;
        self
    }

    /// "NET.STA" key matching [`Station::key`]
    pub fn station_key(&self) -> String {
        format!("{}.{}", self.net, self.sta)
    }

    pub fn station(&self) -> Option<&Station> {
        self.station.as_deref()
    }

    pub fn is_automatic(&self) -> bool {
        matches!(self.status, PickStatus::Automatic | PickStatus::IgnoredAutomatic)
    }

    pub fn is_manual(&self) -> bool {
        matches!(self.status, PickStatus::Manual | PickStatus::Confirmed)
    }

    pub fn is_ignored(&self) -> bool {
        self.status == PickStatus::IgnoredAutomatic
    }

    pub fn has_amplitude(&self) -> bool {
        self.amp > 0.0 && self.snr > 0.0
    }

    /// One-letter status used in logs
    pub fn status_flag(&self) -> char {
        if self.is_manual() {
            'M'
        } else {
            'A'
        }
    }

    /// Same station as `other`, by registry key
    pub fn same_station(&self, other: &Pick) -> bool {
        self.net == other.net && self.sta == other.sta
    }
}

/// An amplitude measurement referring to a buffered pick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Amplitude {
    pub pick_id: String,
    /// Amplitude type, compared with the configured SNR and absolute types
    #[serde(rename = "type")]
    pub kind: String,
    pub value: f64,
    #[serde(default)]
    pub period: f64,
}
