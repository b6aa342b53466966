//! Per-pick processing pipeline

use super::Autoloc3;
use crate::error::invariant_violation;
use crate::geo::delazi;
use crate::model::{Exclusion, Origin, Pick, PickStatus};
use crate::traveltime::travel_time_prefix;
use std::sync::Arc;

/// Normalisation amplitude when XXL detection is disabled
const DEFAULT_NORM_AMPLITUDE: f64 = 2000.0;

fn valid(pick: &Pick) -> bool {
    if pick.station.is_none() {
        return false;
    }
    if !pick.is_automatic() {
        return true;
    }
    if pick.snr <= 0.0 || pick.snr > 1.0e7 {
        if pick.snr > 1.0e7 {
            log::warn!("pick {} with snr of {} was rejected", pick.id, pick.snr);
        }
        return false;
    }
    pick.has_amplitude()
}

impl Autoloc3 {
    /// Run a buffered pick through the pipeline. Returns true if the pick
    /// changed or created an origin, or is kept for a manual origin.
    pub(super) fn process(&mut self, pick_id: &str) -> bool {
        let Some(mut pick) = self.picks.get(pick_id).cloned() else {
            invariant_violation(&format!("pick {} vanished from the buffer", pick_id));
        };

        if !valid(&pick) {
            log::debug!("invalid pick {}", pick.id);
            return false;
        }

        if self.too_low_snr(&pick) {
            return false;
        }

        self.annotate_amplitude(Arc::make_mut(&mut pick));
        self.picks.insert(pick.id.clone(), pick.clone());

        if pick.is_automatic() && self.too_many_recent_picks(&pick) {
            let mut ignored = (*pick).clone();
            ignored.status = PickStatus::IgnoredAutomatic;
            self.picks.insert(ignored.id.clone(), Arc::new(ignored));
            return false;
        }

        self.log_pick(&pick);

        if self.blacklist.contains(&pick.id) {
            log::info!("process pick {:<35} blacklisted -> ignored", pick.id);
            return false;
        }

        if pick.is_manual() && !self.config.use_manual_picks {
            if self.config.use_manual_origins {
                return true;
            }
            log::info!("process pick BLACKLISTING {} (manual pick)", pick.id);
            self.blacklist.insert(pick.id.clone());
            return false;
        }

        log::info!(
            "process pick {:<35} {}",
            pick.id,
            if pick.xxl { "XXL" } else { "" }
        );

        if self.follows_bigger_pick(&pick) {
            return false;
        }

        if self.perhaps_pdiff(&pick) {
            log::info!("process pick {:<35} perhaps Pdiff -> ignored", pick.id);
            return false;
        }

        if let Some(origin) = self.try_associate(&pick) {
            if origin.imported {
                self.store_origin(origin);
                return true;
            }

            let mut origin = origin;
            if !self.rework(&mut origin) {
                log::debug!("rework of associated origin {} unsuccessful", origin.id);
            }
            if self.passed_filter(&mut origin) {
                if origin.score >= self.config.min_score_bypass_nucleator {
                    log::debug!(
                        "origin {} score {:.1} above bypass threshold, nucleator skipped",
                        origin.id,
                        origin.score
                    );
                }
                self.store_origin(origin);
                return true;
            }
        }

        if let Some(mut origin) = self.try_nucleate(&pick) {
            if !self.rework(&mut origin) {
                log::debug!("rework of nucleated origin {} unsuccessful", origin.id);
            }
            if self.passed_filter(&mut origin) {
                self.store_origin(origin);
                return true;
            }
        }

        if self.config.xxl_enabled {
            if let Some(origin) = self.xxl_preliminary_origin(&pick) {
                let mut origin = match self.find_equivalent(&origin) {
                    Some(id) => match self.origins.find_mut(id) {
                        Some(equivalent) => {
                            equivalent.update_from(&origin);
                            equivalent.clone()
                        }
                        None => origin,
                    },
                    None => origin,
                };
                self.rework(&mut origin);
                if self.passed_filter(&mut origin) {
                    self.store_origin(origin);
                    return true;
                }
            }
        }

        false
    }

    /// Flag XXL picks and set the normalised amplitude used in scoring
    pub(super) fn annotate_amplitude(&self, pick: &mut Pick) {
        if self.config.xxl_enabled
            && pick.amp >= self.config.xxl_min_amplitude
            && pick.snr > self.config.xxl_min_snr
        {
            pick.xxl = true;
        }
        let norm = if self.config.xxl_enabled {
            self.config.xxl_min_amplitude
        } else {
            DEFAULT_NORM_AMPLITUDE
        };
        pick.normamp = pick.amp / norm;
    }

    pub(super) fn too_low_snr(&self, pick: &Pick) -> bool {
        pick.is_automatic() && pick.snr < self.config.min_pick_snr
    }

    /// Throttle for stations producing bursts of picks.
    ///
    /// Sums the clamped SNR of the station's picks within the threshold
    /// interval, weighted by age, and rejects a pick whose own SNR falls
    /// below a fraction of that sum or below the decayed SNR of a recent
    /// pick within the XXL dead time.
    pub(super) fn too_many_recent_picks(&self, new_pick: &Pick) -> bool {
        if !new_pick.is_automatic() {
            return false;
        }
        let span = self.config.dynamic_pick_threshold_interval;
        if span <= 0.0 {
            return false;
        }
        if new_pick.snr <= 0.0 {
            return true;
        }

        let mut weighted_sum = 0.0;
        let mut prev_threshold: f64 = 0.0;
        for old in self.picks.values() {
            if !old.same_station(new_pick) {
                continue;
            }
            if !self.config.use_manual_picks && old.is_manual() && !self.config.use_manual_origins {
                continue;
            }
            let dt = new_pick.time - old.time;
            if !(0.0..=span).contains(&dt) {
                continue;
            }
            let snr = old.snr.clamp(3.0, 15.0);
            weighted_sum += snr * (1.0 - dt / span);
            prev_threshold = prev_threshold.max(snr * (1.0 - dt / self.config.xxl_dead_time));
        }

        weighted_sum *= 0.14;
        if new_pick.snr < weighted_sum {
            log::debug!(
                "process pick {} snr {:.1} below dynamic threshold {:.1}",
                new_pick.id,
                new_pick.snr,
                weighted_sum
            );
            return true;
        }
        if new_pick.snr < prev_threshold {
            log::debug!(
                "process pick {} snr {:.1} below previous pick threshold {:.1}",
                new_pick.id,
                new_pick.snr,
                prev_threshold
            );
            return true;
        }
        false
    }

    /// Pick within the XXL dead time after an XXL pick of the same station
    pub(super) fn follows_bigger_pick(&self, new_pick: &Pick) -> bool {
        for pick in self.picks.values() {
            if pick.id == new_pick.id || !pick.xxl || !pick.same_station(new_pick) {
                continue;
            }
            let dt = new_pick.time - pick.time;
            if dt < 0.0 || dt > self.config.xxl_dead_time {
                continue;
            }
            log::info!(
                "process pick IGNORING {} (following XXL pick {})",
                new_pick.id,
                pick.id
            );
            return true;
        }
        false
    }

    /// Weak pick in the Pdiff coda of a large teleseismic event
    pub(super) fn perhaps_pdiff(&self, pick: &Pick) -> bool {
        if pick.snr > 6.0 {
            return false;
        }
        let Some(station) = pick.station() else {
            return false;
        };

        let mut result = false;
        for origin in &self.origins {
            if pick.time - origin.time > 1000.0 || origin.score < 100.0 {
                continue;
            }
            let (delta, _, _) = delazi(origin.lat, origin.lon, station.lat, station.lon);
            if !(98.0..=120.0).contains(&delta) {
                continue;
            }
            let Some(tt) = travel_time_prefix(self.ttt.as_ref(), delta, origin.dep, "Pdiff")
            else {
                continue;
            };
            let dt = pick.time - (origin.time + tt.time);
            if dt > 0.0 && dt < 150.0 {
                result = true;
            }
        }
        result
    }

    /// Try to attach the pick to a known origin. Returns the updated copy of
    /// the best candidate; the buffer is not changed.
    pub(super) fn try_associate(&mut self, pick: &Arc<Pick>) -> Option<Origin> {
        if !self.associator.feed(pick, self.origins.as_slice()) {
            return None;
        }
        let associations = self.associator.associations().to_vec();
        log::info!("process pick {}: {} associations", pick.id, associations.len());
        for asso in &associations {
            log::info!(
                "     origin {:>6} phase {:<6} affinity {:.2} residual {:6.1}",
                asso.origin_id,
                asso.phase(),
                asso.affinity(),
                asso.arrival.residual
            );
        }

        for asso in associations.iter().filter(|a| a.imported) {
            let Some(mut origin) = self.origins.find(asso.origin_id).cloned() else {
                continue;
            };
            if !self.associate(&mut origin, pick, asso.phase()) {
                continue;
            }
            if origin.find_arrival(pick).is_none() {
                invariant_violation(&format!(
                    "pick {} missing from imported origin {} after association",
                    pick.id, origin.id
                ));
            }
            log::info!("process pick {} associated to imported origin {}", pick.id, origin.id);
            return Some(origin);
        }

        let mut best: Option<Origin> = None;
        let mut best_count = 0;
        for asso in &associations {
            if asso.affinity() < self.config.min_pick_affinity {
                continue;
            }
            let Some(mut origin) = self.origins.find(asso.origin_id).cloned() else {
                continue;
            };
            if origin.imported {
                break;
            }

            let phase = asso.phase();
            if phase == "P" || phase == "PKP" {
                if !self.associate(&mut origin, pick, phase) {
                    log::debug!("process pick {}: not associated to origin {}", pick.id, origin.id);
                    continue;
                }
            } else {
                let mut arr = asso.arrival.clone();
                arr.excluded = Exclusion::UnusedPhase;
                origin.add(arr);
            }

            let Some(index) = origin.find_arrival(pick) else {
                invariant_violation(&format!(
                    "pick {} missing from origin {} after association",
                    pick.id, origin.id
                ));
            };
            let arr = &origin.arrivals[index];
            log::info!(
                "process pick {} associated to origin {} as {} residual {:.1} {}",
                pick.id,
                origin.id,
                arr.phase,
                arr.residual,
                if arr.is_defining() { "" } else { "(excluded)" }
            );

            if !self.passed_filter(&mut origin) {
                continue;
            }

            let count = origin.defining_phase_count();
            if count > best_count {
                best_count = count;
                best = Some(origin);
            }
        }
        best
    }

    /// Let the nucleator propose an origin. If an equivalent origin exists
    /// it absorbs the proposal and is returned only if the merge changed it.
    pub(super) fn try_nucleate(&mut self, pick: &Arc<Pick>) -> Option<Origin> {
        if !self.nucleator.feed(pick) {
            return None;
        }
        let candidates = self.nucleator.new_origins().to_vec();

        let mut new_origin: Option<Origin> = None;
        let mut best_score = 0.0;
        for mut candidate in candidates {
            if candidate.rms() > 3.0 * self.config.max_rms {
                continue;
            }
            let score = self.score(&mut candidate);
            if new_origin.is_none() || score > best_score {
                best_score = score;
                new_origin = Some(candidate);
            }
        }
        let mut new_origin = new_origin?;
        new_origin.id = self.ids.next_id();
        new_origin.sort_arrivals();
        log::info!("nucleated {}", new_origin.oneliner());

        let equivalent = self.origins.best_equivalent_origin(&new_origin).cloned();
        let Some(mut equivalent) = equivalent else {
            return if self.passed_filter(&mut new_origin) {
                Some(new_origin)
            } else {
                None
            };
        };

        let rms = equivalent.rms();
        let score = self.score(&mut equivalent);
        let mut merged = self.merge(&equivalent, &new_origin);
        let merged_score = self.score(&mut merged);

        let eps = 1.0e-7;
        if ((merged.rms() - rms) / rms).abs() < eps && ((merged_score - score) / score).abs() < eps {
            log::debug!("merge of origins {} and {} changed nothing", equivalent.id, new_origin.id);
            return None;
        }

        log::info!("merged origins {} and {}", equivalent.id, new_origin.id);
        equivalent.update_from(&merged);
        if let Some(buffered) = self.origins.find_mut(equivalent.id) {
            buffered.update_from(&merged);
        }
        if self.passed_filter(&mut equivalent) {
            Some(equivalent)
        } else {
            None
        }
    }
}
