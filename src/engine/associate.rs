//! Grafting single picks onto origins

use super::Autoloc3;
use crate::error::invariant_violation;
use crate::geo::delazi;
use crate::model::{Arrival, DepthType, Exclusion, Origin, Pick};
use crate::traveltime::travel_time_p;
use std::collections::HashSet;
use std::sync::Arc;

fn is_p_type(phase: &str) -> bool {
    matches!(phase, "P" | "Pn" | "Pg" | "Pb")
}

fn is_pkp_type(phase: &str) -> bool {
    matches!(phase, "PKP" | "PKPab" | "PKPdf" | "PKiKP")
}

/// Pick time plausible for a P or PKP arrival of `origin`
fn might_be_associated(pick: &Pick, origin: &Origin) -> bool {
    let dt = pick.time - origin.time;
    (-10.0..=1300.0).contains(&dt)
}

impl Autoloc3 {
    /// Whether the arrival's residual lies in the acceptance window scaled
    /// by `min_factor` (negative side) and `max_factor` (positive side).
    pub(super) fn residual_ok(&self, arr: &Arrival, min_factor: f64, max_factor: f64) -> bool {
        let mut min = -min_factor * self.config.max_residual_use;
        let mut max = max_factor * self.config.max_residual_use;

        if self.config.aggressive_pkp && is_pkp_type(&arr.phase) {
            min *= 2.0;
            max *= 2.0;
        }
        if is_p_type(&arr.phase) {
            let d = arr.distance;
            max *= 1.0 + 0.7 * (-d * d / 50.0).exp();
        }

        arr.residual >= min && arr.residual <= max
    }

    /// Add `pick` as `phase` to `origin`.
    ///
    /// The pick is tried on a relocated copy. If it makes the solution worse
    /// it is kept as a loosely associated arrival. Returns false if the pick
    /// is implausible or no relocation could be obtained.
    pub(super) fn associate(&mut self, origin: &mut Origin, pick: &Arc<Pick>, phase: &str) -> bool {
        if !might_be_associated(pick, origin) {
            return false;
        }
        if phase == "PKP" && pick.time - origin.time < 1000.0 {
            return false;
        }
        let Some(station) = pick.station.clone() else {
            return false;
        };
        if origin.find_arrival(pick).is_some() {
            return false;
        }
        if phase != "P" && phase != "PKP" {
            log::warn!("cannot associate pick {} as {}", pick.id, phase);
            return false;
        }

        let (delta, az, _) = delazi(origin.lat, origin.lon, station.lat, station.lon);
        let Some(tt) = travel_time_p(self.ttt.as_ref(), delta, origin.dep) else {
            return false;
        };

        let residual = pick.time - origin.time - tt.time;
        let mut arr = Arrival::new(pick.clone(), phase, residual);
        arr.distance = delta;
        arr.azimuth = az;
        if !self.residual_ok(&arr, 0.9, 1.3) {
            return false;
        }

        let min_phase_count = self.config.min_phase_count as f64
            + (delta - station.max_nuc_dist) * self.config.dist_slope;
        if (origin.phase_count() as f64) < min_phase_count {
            if !(phase == "PKP" && self.config.aggressive_pkp) {
                arr.excluded = Exclusion::TemporarilyExcluded;
            }
        }

        if origin.imported {
            arr.excluded = Exclusion::UnusedPhase;
        }

        let mut copy = origin.clone();
        let original_score = self.score(&mut copy);
        let original_rms = copy.rms();

        if delta > 105.0
            && copy.defining_phase_count_in(0.0, 105.0) > self.config.min_sta_count_ignore_pkp
        {
            arr.excluded = Exclusion::UnusedPhase;
        } else if delta > 105.0 && delta < 125.0 {
            log::info!("origin {}: {} at {:.1} deg not used", origin.id, pick.id, delta);
            arr.excluded = Exclusion::UnusedPhase;
        }

        copy.add(arr.clone());

        if origin.imported {
            origin.update_from(&copy);
            return true;
        }

        let mut relocated: Option<Origin> = None;
        if arr.excluded != Exclusion::UnusedPhase {
            let fixed = if self.config.default_depth_stickiness > 0.9 {
                self.locator.set_fixed_depth(self.config.default_depth);
                true
            } else if origin.depth_type == DepthType::DepthManuallyFixed {
                self.locator.set_fixed_depth(origin.dep);
                true
            } else {
                self.locator.use_fixed_depth(false);
                false
            };

            let mut relo = match self.relocate(&copy) {
                Some(relo) => relo,
                None if fixed => return false,
                None => {
                    self.locator.set_fixed_depth(origin.dep);
                    match self.relocate(&copy) {
                        Some(relo) => relo,
                        None => return false,
                    }
                }
            };

            let score = self.score(&mut relo);
            let rms = relo.rms();
            let mut result = Some(relo);

            let max_rms_increase = 3.0 / (10.0 + copy.arrivals.len() as f64).sqrt();
            if score < original_score || rms > original_rms + max_rms_increase {
                log::debug!(
                    "origin {}: pick {} deteriorates solution (score {:.1} -> {:.1}, rms {:.2} -> {:.2})",
                    origin.id,
                    pick.id,
                    original_score,
                    score,
                    original_rms,
                    rms
                );
                let Some(index) = copy.find_arrival(pick) else {
                    invariant_violation(&format!("pick {} lost from trial origin", pick.id));
                };
                copy.arrivals[index].excluded = Exclusion::LargeResidual;

                self.locator.set_fixed_depth(origin.dep);
                result = match self.relocate(&copy) {
                    None => {
                        log::error!("origin {}: fixed-depth relocation failed", origin.id);
                        None
                    }
                    Some(mut relo) => {
                        if self.score(&mut relo) < original_score {
                            None
                        } else {
                            Some(relo)
                        }
                    }
                };
            }

            if let Some(relo) = result.as_ref() {
                let Some(index) = relo.find_arrival(pick) else {
                    invariant_violation(&format!("pick {} lost during relocation", pick.id));
                };
                if relo.arrivals[index].residual.abs() > self.config.max_residual_use {
                    let mut loose = relo.arrivals[index].clone();
                    loose.excluded = Exclusion::LargeResidual;
                    origin.add(loose);
                    return true;
                }
            }
            relocated = result;
        }

        match relocated {
            Some(relo) => origin.update_from(&relo),
            None => {
                let mut loose = origin.clone();
                if arr.excluded != Exclusion::UnusedPhase {
                    arr.excluded = Exclusion::DeterioratesSolution;
                }
                loose.add(arr);
                origin.update_from(&loose);
            }
        }

        log::debug!("origin {}: added {} as {}", origin.id, pick.id, phase);
        true
    }

    /// Scan the pick buffer for unassociated picks that fit `origin`.
    /// Returns whether any pick was added.
    pub(super) fn add_more_picks(&mut self, origin: &mut Origin, _keep_depth: bool) -> bool {
        let have: HashSet<String> = origin
            .arrivals
            .iter()
            .filter(|a| a.is_defining() && a.pick.station.is_some())
            .map(|a| format!("{}:{}", a.pick.station_key(), a.phase))
            .collect();

        let candidates: Vec<Arc<Pick>> = self.picks.values().cloned().collect();
        let mut added = 0;
        for pick in candidates {
            if pick.station.is_none() {
                continue;
            }
            if pick.is_manual() && !self.config.use_manual_picks {
                continue;
            }
            if pick.is_ignored() {
                continue;
            }
            let key = pick.station_key();
            if have.contains(&format!("{}:P", key)) || have.contains(&format!("{}:PKP", key)) {
                continue;
            }
            if pick.amp <= 0.0 || pick.snr <= 0.0 {
                continue;
            }
            if self.too_low_snr(&pick) || self.blacklist.contains(&pick.id) {
                continue;
            }
            if self.pick_origin.contains_key(&pick.id) {
                continue;
            }

            if !self.associate(origin, &pick, "P") && !self.associate(origin, &pick, "PKP") {
                continue;
            }
            added += 1;
        }

        if added == 0 {
            return false;
        }
        log::debug!("origin {}: {} more picks added", origin.id, added);
        self.rename_p_pkp(origin);
        true
    }

    /// Relabel P arrivals that are really PKP and vice versa
    pub(super) fn rename_p_pkp(&self, origin: &mut Origin) {
        let otime = origin.time;
        for arr in origin.arrivals.iter_mut() {
            let dt = arr.pick.time - otime;
            if arr.phase == "P" && arr.distance > 105.0 && dt > 1000.0 {
                arr.phase = "PKP".to_string();
            } else if arr.phase == "PKP" && arr.distance < 125.0 && dt < 1000.0 {
                arr.phase = "P".to_string();
            }
        }
    }
}
