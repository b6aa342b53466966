//! Locator adapter
//!
//! Wraps a black-box [`Inversion`] with the depth-fixing contract the engine
//! relies on: origins whose depth type implies a fixed depth stay fixed, free
//! solutions at or above the minimum depth are retried pinned to it, and the
//! azimuthal gaps and distance summary are filled in on success.

pub mod inversion;

pub use inversion::{phase_travel_time, Inversion, LeastSquaresInversion};

use crate::error::invariant_violation;
use crate::model::{DepthType, Origin, OriginQuality, Station};
use crate::traveltime::TravelTimeTable;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Why a relocation produced no solution. Always recovered by the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocatorError {
    #[error("too few usable arrivals ({have}, need {need})")]
    TooFewArrivals { have: usize, need: usize },

    #[error("unknown station {0}")]
    UnknownStation(String),

    #[error("inversion diverged")]
    Diverged,

    #[error("singular system")]
    Singular,
}

pub struct Locator {
    inversion: Box<dyn Inversion>,
    ttt: Arc<dyn TravelTimeTable>,
    stations: HashMap<String, Arc<Station>>,
    min_depth: f64,
    fixed_depth: Option<f64>,
    use_fixed_depth: bool,
}

impl Locator {
    pub fn new(ttt: Arc<dyn TravelTimeTable>) -> Self {
        Self::with_inversion(ttt, Box::new(LeastSquaresInversion::new()))
    }

    pub fn with_inversion(ttt: Arc<dyn TravelTimeTable>, inversion: Box<dyn Inversion>) -> Self {
        Self {
            inversion,
            ttt,
            stations: HashMap::new(),
            min_depth: 5.0,
            fixed_depth: None,
            use_fixed_depth: false,
        }
    }

    pub fn set_station(&mut self, station: Arc<Station>) {
        self.stations.insert(station.key(), station);
    }

    pub fn station_count(&self) -> usize {
        self.stations.len()
    }

    pub fn set_min_depth(&mut self, depth: f64) {
        self.min_depth = depth;
    }

    /// Pin the depth used while fixed-depth mode is on
    pub fn set_fixed_depth(&mut self, depth: f64) {
        self.fixed_depth = Some(depth);
        self.use_fixed_depth = true;
    }

    /// Toggle fixed-depth mode. Without an explicit depth the origin's own
    /// depth is kept.
    pub fn use_fixed_depth(&mut self, enable: bool) {
        self.use_fixed_depth = enable;
        if !enable {
            self.fixed_depth = None;
        }
    }

    pub fn travel_times(&self) -> &dyn TravelTimeTable {
        self.ttt.as_ref()
    }

    pub fn reset(&mut self) {
        self.fixed_depth = None;
        self.use_fixed_depth = false;
    }

    pub fn relocate(&self, origin: &Origin) -> Result<Origin, LocatorError> {
        if let Some(a) = origin
            .arrivals
            .iter()
            .find(|a| a.is_defining() && !self.stations.contains_key(&a.pick.station_key()))
        {
            return Err(LocatorError::UnknownStation(a.pick.station_key()));
        }

        let fixed = match origin.depth_type {
            DepthType::DepthManuallyFixed | DepthType::DepthDefault => Some(origin.dep),
            _ if self.use_fixed_depth => Some(self.fixed_depth.unwrap_or(origin.dep)),
            _ => None,
        };

        let mut relo = self.invert(origin, fixed)?;

        if fixed.is_none() {
            if relo.dep <= self.min_depth {
                log::debug!(
                    "origin {}: free depth {:.1} km at minimum, retrying with {:.1} km",
                    origin.id,
                    relo.dep,
                    self.min_depth
                );
                let retry = self.invert(&relo, Some(self.min_depth))?;
                relo = retry;
                relo.depth_type = DepthType::DepthMinimum;
            } else if relo.depth_type == DepthType::DepthMinimum {
                relo.depth_type = DepthType::DepthFree;
            }
        }

        relo.quality = quality(&relo);
        Ok(relo)
    }

    fn invert(&self, origin: &Origin, fixed: Option<f64>) -> Result<Origin, LocatorError> {
        let relo = self.inversion.invert(origin, fixed, self.ttt.as_ref())?;

        if relo.arrivals.len() != origin.arrivals.len()
            || relo
                .arrivals
                .iter()
                .zip(origin.arrivals.iter())
                .any(|(a, b)| a.pick.id != b.pick.id)
        {
            invariant_violation(&format!(
                "{} inversion changed the arrival order of origin {}",
                self.inversion.name(),
                origin.id
            ));
        }
        Ok(relo)
    }
}

/// Primary and secondary azimuthal gap of the defining arrivals.
///
/// The secondary gap is the largest gap left after dropping any one station.
/// Returns `None` with fewer than two defining arrivals.
pub fn determine_azimuthal_gaps(origin: &Origin) -> Option<(f64, f64)> {
    let mut azi: Vec<f64> = origin
        .arrivals
        .iter()
        .filter(|a| a.is_defining())
        .map(|a| a.azimuth.rem_euclid(360.0))
        .collect();
    let n = azi.len();
    if n < 2 {
        return None;
    }

    azi.sort_by(|a, b| a.total_cmp(b));
    for i in 0..n {
        let wrapped = azi[i] + 360.0;
        azi.push(wrapped);
    }

    let primary = (0..n).map(|i| azi[i + 1] - azi[i]).fold(0.0, f64::max);
    let secondary = if n == 2 {
        primary
    } else {
        (0..n).map(|i| azi[i + 2] - azi[i]).fold(0.0, f64::max)
    };
    Some((primary, secondary))
}

fn quality(origin: &Origin) -> OriginQuality {
    let (azi_gap_primary, azi_gap_secondary) =
        determine_azimuthal_gaps(origin).unwrap_or((360.0, 360.0));

    let mut dist: Vec<f64> = origin
        .arrivals
        .iter()
        .filter(|a| a.is_defining())
        .map(|a| a.distance)
        .collect();
    dist.sort_by(|a, b| a.total_cmp(b));

    OriginQuality {
        azi_gap_primary,
        azi_gap_secondary,
        min_distance: dist.first().copied().unwrap_or(0.0),
        median_distance: dist.get(dist.len() / 2).copied().unwrap_or(0.0),
        max_distance: dist.last().copied().unwrap_or(0.0),
    }
}
