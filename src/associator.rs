//! Phase association of single picks with known origins

use crate::geo::delazi;
use crate::model::{Arrival, Origin, OriginId, Pick};
use crate::scoring::avgfn;
use crate::traveltime::{travel_time_p, travel_time_prefix, TravelTimeTable};
use std::sync::Arc;

/// Pick explained by a phase of one origin
#[derive(Debug, Clone)]
pub struct Association {
    pub origin_id: OriginId,
    pub imported: bool,
    /// Phase, residual, distance, azimuth and affinity of the match
    pub arrival: Arrival,
}

impl Association {
    pub fn phase(&self) -> &str {
        &self.arrival.phase
    }

    pub fn affinity(&self) -> f64 {
        self.arrival.affinity
    }
}

struct PhaseRange {
    code: &'static str,
    dmin: f64,
    dmax: f64,
}

/// Candidate phases in priority order
const PHASES: [PhaseRange; 8] = [
    PhaseRange { code: "P", dmin: 0.0, dmax: 180.0 },
    PhaseRange { code: "PcP", dmin: 25.0, dmax: 55.0 },
    PhaseRange { code: "ScP", dmin: 25.0, dmax: 55.0 },
    PhaseRange { code: "PP", dmin: 60.0, dmax: 160.0 },
    PhaseRange { code: "SKP", dmin: 120.0, dmax: 150.0 },
    PhaseRange { code: "PKKP", dmin: 80.0, dmax: 130.0 },
    PhaseRange { code: "PKiKP", dmin: 30.0, dmax: 120.0 },
    PhaseRange { code: "SKKP", dmin: 80.0, dmax: 130.0 },
];

/// Residual widening at regional distances
pub fn regional_taper(delta: f64) -> f64 {
    1.0 + 0.6 * (-0.003 * delta * delta).exp() + 0.5 * (-0.03 * (15.0 - delta).powi(2)).exp()
}

pub struct Associator {
    ttt: Arc<dyn TravelTimeTable>,
    associations: Vec<Association>,
}

impl Associator {
    pub fn new(ttt: Arc<dyn TravelTimeTable>) -> Self {
        Self {
            ttt,
            associations: Vec::new(),
        }
    }

    /// Associations of the last [`Associator::feed`] call
    pub fn associations(&self) -> &[Association] {
        &self.associations
    }

    pub fn reset(&mut self) {
        self.associations.clear();
    }

    /// Try to explain `pick` as a phase of each origin.
    ///
    /// At most one association is produced per origin, the first matching
    /// phase in priority order. Returns whether anything matched.
    pub fn feed(&mut self, pick: &Arc<Pick>, origins: &[Origin]) -> bool {
        self.associations.clear();

        let Some(station) = pick.station() else {
            return false;
        };

        for origin in origins {
            let (delta, azimuth, _) = delazi(origin.lat, origin.lon, station.lat, station.lon);
            let effective_score = if origin.imported { 1000.0 } else { origin.score };

            for range in PHASES.iter() {
                if delta < range.dmin || delta > range.dmax {
                    continue;
                }

                let min_score = if range.code == "P" { 20.0 } else { 50.0 };
                if effective_score < min_score {
                    continue;
                }

                let (tt, x) = if range.code == "P" {
                    (travel_time_p(self.ttt.as_ref(), delta, origin.dep), regional_taper(delta))
                } else {
                    (
                        travel_time_prefix(self.ttt.as_ref(), delta, origin.dep, range.code),
                        1.0,
                    )
                };
                let Some(tt) = tt else {
                    continue;
                };

                let residual = pick.time - origin.time - tt.time;
                let affinity = if origin.imported {
                    if !(-20.0..=30.0).contains(&residual) {
                        continue;
                    }
                    1.0
                } else {
                    let affinity = avgfn(residual / 10.0 / x);
                    if affinity < 0.1 {
                        continue;
                    }
                    affinity
                };

                let phase = if range.code == "P" && tt.time > 960.0 {
                    "PKP"
                } else {
                    range.code
                };

                let mut arrival = Arrival::new(pick.clone(), phase, residual);
                arrival.distance = delta;
                arrival.azimuth = azimuth;
                arrival.affinity = affinity;
                self.associations.push(Association {
                    origin_id: origin.id,
                    imported: origin.imported,
                    arrival,
                });
                break;
            }
        }

        !self.associations.is_empty()
    }
}
