//! Acceptance filter and fake-origin detection
//!
//! A large earthquake produces many later phases (PP, PKP, S, depth phases)
//! that the nucleator may cluster into a spurious small origin. Such a
//! "fake" origin shares its picks with the predicted secondary phases of
//! the real one.

use super::Autoloc3;
use crate::geo::delazi;
use crate::model::{Arrival, Exclusion, Origin};
use crate::traveltime::{TravelTime, TravelTimeTable};

/// A secondary phase of a stronger origin that may masquerade as P
struct SecondaryPhase {
    phase: &'static str,
    /// Upper end of the coincidence window; the lower end is always -20 s
    window: f64,
    skip_xxl: bool,
    /// Only for arrivals that scored below 1
    weak_only: bool,
}

const fn secondary(phase: &'static str, window: f64, skip_xxl: bool, weak_only: bool) -> SecondaryPhase {
    SecondaryPhase {
        phase,
        window,
        skip_xxl,
        weak_only,
    }
}

/// Secondary phases in test order for the given geometry
fn candidate_phases(delta: f64, depth: f64) -> Vec<SecondaryPhase> {
    let mut phases = Vec::new();
    if delta > 30.0 {
        phases.push(secondary("PP", 30.0, true, true));
    }
    if delta > 100.0 {
        phases.push(secondary("PKP", 50.0, true, false));
    }
    if delta > 120.0 && delta < 142.0 {
        phases.push(secondary("SKP", 50.0, true, false));
    }
    if delta > 100.0 && delta < 130.0 {
        phases.push(secondary("PKKP", 50.0, true, false));
    }
    if delta > 25.0 && depth > 60.0 {
        phases.push(secondary("pP", 30.0, false, false));
        phases.push(secondary("sP", 30.0, false, false));
    }
    if delta < 110.0 {
        phases.push(secondary("S", 30.0, true, true));
    }
    phases
}

/// Exact phase if tabulated, else the first branch starting with `phase`
fn secondary_travel_time(
    ttt: &dyn TravelTimeTable,
    delta: f64,
    depth: f64,
    phase: &str,
) -> Option<TravelTime> {
    let times = ttt.compute(delta, depth);
    if let Some(exact) = times.iter().find(|tt| tt.phase == phase) {
        return Some(exact.clone());
    }
    times.into_iter().find(|tt| tt.phase.starts_with(phase))
}

/// Whether `arr` coincides with a secondary phase of `other`. A coincidence
/// that explains the pick better than its own residual marks the arrival.
fn coincides_with_secondary(ttt: &dyn TravelTimeTable, arr: &mut Arrival, other: &Origin) -> bool {
    let Some(station) = arr.pick.station.clone() else {
        return false;
    };
    let (delta, _, _) = delazi(other.lat, other.lon, station.lat, station.lon);

    for candidate in candidate_phases(delta, other.dep) {
        if candidate.skip_xxl && arr.pick.xxl {
            continue;
        }
        if candidate.weak_only && arr.score >= 1.0 {
            continue;
        }
        let Some(TravelTime { time, .. }) = secondary_travel_time(ttt, delta, other.dep, candidate.phase)
        else {
            continue;
        };
        let dt = arr.pick.time - (other.time + time);
        if dt > -20.0 && dt < candidate.window {
            if dt.abs() < arr.residual.abs() {
                arr.excluded = Exclusion::DeterioratesSolution;
            }
            return true;
        }
    }
    false
}

impl Autoloc3 {
    /// Probability that `origin` is an artefact of a larger origin
    pub(super) fn test_fake(&self, origin: &mut Origin) -> f64 {
        if origin.imported || origin.score > 80.0 {
            return 0.0;
        }

        let mut max_probability: f64 = 0.0;
        for other in &self.origins {
            if other.id == origin.id {
                continue;
            }
            if other.time < origin.time - 1800.0 || other.time > origin.time + 600.0 {
                continue;
            }
            let defining = origin.defining_phase_count();
            if other.defining_phase_count() < 2 * defining {
                continue;
            }

            let mut count = 0;
            for arr in origin.arrivals.iter_mut() {
                if other.find_arrival(&arr.pick).is_some() {
                    arr.excluded = Exclusion::DeterioratesSolution;
                    count += 1;
                    continue;
                }
                if coincides_with_secondary(self.ttt.as_ref(), arr, other) {
                    count += 1;
                }
            }

            if count > 0 {
                let probability = count as f64 / defining.max(1) as f64;
                log::debug!(
                    "origin {}: {} arrivals explained by origin {}, fake probability {:.2}",
                    origin.id,
                    count,
                    other.id,
                    probability
                );
                max_probability = max_probability.max(probability);
            }
        }
        max_probability
    }

    pub(super) fn passed_final_check(&self, origin: &Origin) -> bool {
        origin.preliminary || origin.defining_phase_count() >= self.config.min_phase_count
    }

    /// Final acceptance of a reworked origin
    pub(super) fn passed_filter(&self, origin: &mut Origin) -> bool {
        if self.config.offline || self.config.test {
            log::debug!(" TRY {}", origin.oneliner());
        }

        let fake = self.test_fake(origin);
        if fake > self.config.max_allowed_fake_probability {
            log::info!(
                "origin {} rejected, fake probability {:.2}",
                origin.id,
                fake
            );
            return false;
        }

        if !self.passed_final_check(origin) {
            return false;
        }

        self.ensure_consistent_arrivals(origin);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::model::{Arrival, Pick, Station};
    use crate::traveltime::{travel_time_prefix, TabulatedTravelTimes};
    use std::sync::Arc;

    #[test]
    fn test_candidate_phases_by_geometry() {
        let names = |d: f64, z: f64| -> Vec<&'static str> {
            candidate_phases(d, z).iter().map(|p| p.phase).collect()
        };
        assert_eq!(names(10.0, 10.0), vec!["S"]);
        assert_eq!(names(50.0, 10.0), vec!["PP", "S"]);
        assert_eq!(names(50.0, 100.0), vec!["PP", "pP", "sP", "S"]);
        assert_eq!(names(125.0, 10.0), vec!["PP", "PKP", "SKP", "PKKP"]);
    }

    #[test]
    fn test_pp_coincidence_marks_arrival() {
        let ttt = TabulatedTravelTimes::new();
        let big = Origin::new(1, 0.0, 0.0, 10.0, 1000.0);
        let station = Arc::new(Station::new("XX", "FAR", 0.0, 60.0, 0.0));
        let pp = travel_time_prefix(&ttt, 60.0, 10.0, "PP").unwrap();

        let mut pick = Pick::new("pp", "XX", "FAR", 1000.0 + pp.time + 2.0);
        pick.station = Some(station);
        let mut arr = Arrival::new(Arc::new(pick), "P", 5.0);
        arr.score = 0.5;
        assert!(coincides_with_secondary(&ttt, &mut arr, &big));
        assert_eq!(arr.excluded, Exclusion::DeterioratesSolution);

        // a well-scoring arrival is not suspected of being PP
        arr.excluded = Exclusion::NotExcluded;
        arr.score = 2.0;
        assert!(!coincides_with_secondary(&ttt, &mut arr, &big));
    }

    #[test]
    fn test_shared_picks_make_origin_fake() {
        let (mut engine, _) = make_engine(make_config());
        let big = make_located_origin(&mut engine, 1);
        engine.store_origin(big.clone());

        let mut small = big.clone();
        small.id = 2;
        small.arrivals.truncate(3);
        small.score = 10.0;
        let p = engine.test_fake(&mut small);
        assert!((p - 1.0).abs() < 1e-9);
        assert!(small
            .arrivals
            .iter()
            .all(|a| a.excluded == Exclusion::DeterioratesSolution));
        assert!(!engine.passed_filter(&mut small));

        // strong origins are never fake
        let mut strong = big.clone();
        strong.id = 3;
        strong.arrivals.truncate(3);
        strong.score = 100.0;
        assert_eq!(engine.test_fake(&mut strong), 0.0);
    }

    #[test]
    fn test_final_check_respects_preliminary() {
        let (mut engine, _) = make_engine(make_config());
        let mut origin = make_located_origin(&mut engine, 1);
        origin.arrivals.truncate(4);
        assert!(!engine.passed_final_check(&origin));
        origin.preliminary = true;
        assert!(engine.passed_final_check(&origin));
    }
}
