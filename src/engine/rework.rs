//! Post-processing of freshly associated or nucleated origins
//!
//! Every heuristic works on a [`Trial`] copy and commits it only when the
//! relocation of the trial succeeds.

use super::Autoloc3;
use crate::geo::{delazi, KM_PER_DEG};
use crate::model::{DepthType, Exclusion, Origin, Trial};

/// Defining phase count above which the RMS is actively reduced
const ACCEPTABLE_RMS_MIN_PHASES: usize = 20;

/// Up to this many defining phases the RMS is reduced by score enhancement
/// instead of dropping the worst arrival
const ACCEPTABLE_RMS_ENHANCE_MAX_PHASES: usize = 50;

/// Origins with fewer defining phases get a score enhancement pass
const ENHANCE_MAX_PHASES: usize = 30;

fn arrival_with_largest_residual(origin: &Origin) -> Option<usize> {
    let mut imax = None;
    let mut resmax = 0.0;
    for (i, arr) in origin.arrivals.iter().enumerate() {
        if !arr.is_defining() {
            continue;
        }
        if arr.residual.abs() > resmax {
            resmax = arr.residual.abs();
            imax = Some(i);
        }
    }
    imax
}

impl Autoloc3 {
    /// Depth decision, outlier trimming and extra pick association.
    /// Returns false if the origin ends with too few defining phases.
    pub(super) fn rework(&mut self, origin: &mut Origin) -> bool {
        let min_phase_count = self.config.min_phase_count;
        if origin.defining_phase_count() < min_phase_count {
            return false;
        }

        let mut adopt_manual_depth = false;
        let mut enforce_default_depth = false;
        if self.config.adopt_manual_depth
            && matches!(
                origin.depth_type,
                DepthType::DepthManuallyFixed | DepthType::DepthPhases
            )
        {
            log::info!("origin {}: adopting depth {:.1} km", origin.id, origin.dep);
            adopt_manual_depth = true;
        } else if self.config.default_depth_stickiness >= 0.9 {
            log::info!("origin {}: enforcing default depth (sticky)", origin.id);
            enforce_default_depth = true;
        } else if self.epicenter_requires_default_depth(origin) && self.set_default_depth(origin) {
            log::info!("origin {}: enforcing default depth (epicenter)", origin.id);
            enforce_default_depth = true;
        } else if self.set_the_right_depth(origin) {
            log::info!("origin {}: using default depth", origin.id);
            enforce_default_depth = true;
        } else {
            log::debug!("origin {}: depth left free", origin.id);
        }

        if origin.defining_phase_count() < ENHANCE_MAX_PHASES {
            self.enhance_score(origin, 0);
        }

        if enforce_default_depth {
            self.locator.set_fixed_depth(self.config.default_depth);
        } else if adopt_manual_depth {
            self.locator.set_fixed_depth(origin.dep);
        }
        let keep_depth = adopt_manual_depth || enforce_default_depth;
        if !keep_depth {
            self.locator.use_fixed_depth(false);
        }
        self.trim_residuals(origin);

        let max_sta_dist = self.config.max_sta_dist;
        while origin.defining_phase_count_in(0.0, max_sta_dist) > min_phase_count {
            let mut farthest: Option<usize> = None;
            let mut dmax = 0.0;
            for (i, arr) in origin.arrivals.iter().enumerate() {
                if arr.is_defining() && arr.distance > dmax {
                    dmax = arr.distance;
                    farthest = Some(i);
                }
            }
            let Some(i) = farthest else {
                break;
            };
            if dmax < max_sta_dist {
                break;
            }

            let mut trial = Trial::of(origin);
            trial.origin_mut().arrivals[i].excluded = Exclusion::StationDistance;
            match self.relocate(trial.origin()) {
                Some(relo) => {
                    trial.adopt(&relo);
                    trial.commit(origin);
                }
                None => {
                    log::warn!("origin {}: relocation failed dropping far station", origin.id);
                    break;
                }
            }
        }

        self.ensure_acceptable_rms(origin, keep_depth);
        self.add_more_picks(origin, keep_depth);
        self.trim_residuals(origin);
        self.remove_worst_outliers(origin);
        self.exclude_distant_stations(origin);
        self.exclude_pkp(origin);

        if origin.dep != self.config.default_depth && origin.depth_type == DepthType::DepthDefault
        {
            origin.depth_type = DepthType::DepthFree;
        }

        origin.defining_phase_count() >= min_phase_count
    }

    /// Extension point for regions where depth is never resolvable
    pub(super) fn epicenter_requires_default_depth(&self, _origin: &Origin) -> bool {
        false
    }

    /// Relocate at the default depth
    pub(super) fn set_default_depth(&mut self, origin: &mut Origin) -> bool {
        self.locator.set_fixed_depth(self.config.default_depth);
        let Some(relo) = self.relocate(origin) else {
            log::warn!("origin {}: relocation at default depth failed", origin.id);
            return false;
        };
        origin.update_from(&relo);
        origin.depth_type = DepthType::DepthDefault;
        true
    }

    /// Decide whether the default depth should be used. Returns true if the
    /// origin was moved to the default depth.
    pub(super) fn set_the_right_depth(&mut self, origin: &mut Origin) -> bool {
        if !self.config.try_default_depth || origin.depth_type == DepthType::DepthPhases {
            return false;
        }

        if origin.depth_type == DepthType::DepthDefault {
            let mut test = origin.clone();
            test.depth_type = DepthType::DepthFree;
            self.locator.use_fixed_depth(false);
            let Some(relo) = self.relocate(&test) else {
                log::warn!("origin {}: free-depth relocation failed", origin.id);
                return false;
            };
            // two stations within five source depths resolve the depth
            let radius = 5.0 * relo.dep.max(self.config.default_depth) / KM_PER_DEG;
            if relo.defining_phase_count_in(0.0, radius) >= 2 {
                origin.update_from(&relo);
                return false;
            }
            return true;
        }

        if origin.defining_phase_count_in(0.0, 5.0 * origin.dep / KM_PER_DEG) >= 2 {
            return false;
        }

        let mut test = origin.clone();
        if !self.set_default_depth(&mut test) {
            return false;
        }

        if self.config.default_depth_stickiness < 0.9 {
            let rms1 = origin.rms();
            let rms2 = test.rms();
            if rms2 > 1.2 * rms1 && rms2 > self.config.good_rms {
                return false;
            }
            let score1 = self.score(origin);
            let score2 = self.score(&mut test);
            if score2 < 0.9 * score1 - 5.0 {
                return false;
            }
            if origin.dep != test.dep {
                log::info!(
                    "origin {}: changed depth from {:.1} to default of {:.1}, score {:.1} -> {:.1}, rms {:.1} -> {:.1}",
                    origin.id,
                    origin.dep,
                    test.dep,
                    score1,
                    score2,
                    rms1,
                    rms2
                );
            }
        }

        origin.update_from(&test);
        origin.depth_type = DepthType::DepthDefault;
        origin.score = self.score(origin);
        true
    }

    /// Whether the data constrain the depth. If not, the origin is moved
    /// to the default depth.
    pub(super) fn depth_is_resolvable(&mut self, origin: &mut Origin) -> bool {
        if origin.depth_type == DepthType::DepthDefault && origin.dep != self.config.default_depth {
            origin.depth_type = DepthType::DepthFree;
        }

        let mut test = origin.clone();
        test.depth_type = DepthType::DepthFree;
        self.locator.use_fixed_depth(false);
        if let Some(relo) = self.relocate(&test) {
            let e = &relo.error;
            if e.sdepth > 0.0 && (e.sdepth < 15.0 * e.stime || e.sdepth < 0.7 * relo.dep) {
                return true;
            }
        }

        let mut test = origin.clone();
        test.dep = self.config.default_depth;
        self.locator.set_fixed_depth(self.config.default_depth);
        let Some(mut relo) = self.relocate(&test) else {
            return true;
        };

        let score1 = self.score(origin);
        let score2 = self.score(&mut relo);
        if score2 < 0.8 * score1 {
            return true;
        }

        if origin.dep != relo.dep {
            log::info!(
                "origin {}: changed depth from {:.1} to default of {:.1}, score {:.1} -> {:.1}",
                origin.id,
                origin.dep,
                relo.dep,
                score1,
                score2
            );
        }
        origin.update_from(&relo);
        origin.depth_type = DepthType::DepthDefault;
        origin.score = self.score(origin);
        false
    }

    /// Try to raise the score by excluding arrivals.
    ///
    /// Small origins with enough XXL picks drop the non-XXL picks preceding
    /// the earliest XXL pick. If outlier enhancement is enabled, arrivals
    /// whose exclusion raises the score by at least 0.2 are then excluded
    /// one at a time, at most `max_loops` times (0 = unlimited).
    pub(super) fn enhance_score(&mut self, origin: &mut Origin, max_loops: usize) -> bool {
        if (origin.defining_phase_count() as f64) < 1.5 * self.config.min_phase_count as f64 {
            let earliest_xxl = origin
                .arrivals
                .iter()
                .filter(|a| a.pick.xxl)
                .min_by(|a, b| a.pick.time.total_cmp(&b.pick.time))
                .map(|a| a.pick.clone());
            let xxl_count = origin.arrivals.iter().filter(|a| a.pick.xxl).count();

            if let Some(earliest) = earliest_xxl {
                if xxl_count >= self.config.xxl_min_phase_count {
                    let mut trial = Trial::of(origin);
                    let mut excluded = 0;
                    for arr in trial.origin_mut().arrivals.iter_mut() {
                        if !arr.pick.xxl && arr.pick.time < earliest.time {
                            arr.excluded = Exclusion::ManuallyExcluded;
                            excluded += 1;
                        }
                    }

                    if excluded > 0 {
                        self.locator
                            .use_fixed_depth(self.config.default_depth_stickiness > 0.9);
                        let scratch = trial.origin_mut();
                        scratch.depth_type = DepthType::DepthFree;
                        if let Some(station) = earliest.station() {
                            scratch.lat = station.lat;
                            scratch.lon = station.lon;
                        }
                        if let Some(relo) = self.relocate(trial.origin()) {
                            origin.update_from(&relo);
                            log::info!(" XXL {}", origin.oneliner());
                            return true;
                        }
                    }
                }
            }
        }

        if !self.config.enable_outlier_enhancement {
            return false;
        }

        let mut count = 0;
        let mut loops = 0;
        while origin.defining_phase_count() > self.config.min_phase_count {
            loops += 1;
            if max_loops > 0 && loops > max_loops {
                break;
            }

            let current = self.score(origin);
            let mut best_score = current;
            let mut best_excluded: Option<usize> = None;
            for i in 0..origin.arrivals.len() {
                if !origin.arrivals[i].is_defining() {
                    continue;
                }
                let mut trial = Trial::of(origin);
                trial.origin_mut().arrivals[i].excluded = Exclusion::ManuallyExcluded;
                let Some(mut relo) = self.relocate_free_then_fixed(trial.origin()) else {
                    continue;
                };
                let score = self.score(&mut relo);
                if score > best_score {
                    best_score = score;
                    best_excluded = Some(i);
                }
            }

            let Some(i) = best_excluded else {
                break;
            };
            if best_score < current + 0.2 {
                break;
            }

            let mut trial = Trial::of(origin);
            trial.origin_mut().arrivals[i].excluded = Exclusion::LargeResidual;
            let Some(relo) = self.relocate_free_then_fixed(trial.origin()) else {
                break;
            };
            log::debug!(
                "origin {}: excluding {} raises score {:.1} -> {:.1}",
                origin.id,
                origin.arrivals[i].pick.id,
                current,
                best_score
            );
            trial.adopt(&relo);
            trial.commit(origin);
            count += 1;
        }
        count > 0
    }

    fn relocate_free_then_fixed(&mut self, origin: &Origin) -> Option<Origin> {
        self.locator.use_fixed_depth(false);
        if let Some(relo) = self.relocate(origin) {
            return Some(relo);
        }
        self.locator.use_fixed_depth(true);
        self.relocate(origin)
    }

    /// Exclude the worst residuals, then readmit large-residual arrivals
    /// that fit again. Uses the locator's current depth mode.
    pub(super) fn trim_residuals(&mut self, origin: &mut Origin) -> bool {
        let mut count = 0;
        let max_use = self.config.max_residual_use;

        while origin.defining_phase_count() >= self.config.min_phase_count {
            let mut worst: Option<usize> = None;
            let mut max_residual = 0.0;
            for (i, arr) in origin.arrivals.iter().enumerate() {
                if !arr.is_defining() {
                    continue;
                }
                let mut normalized = arr.residual / max_use;
                // positive residuals are penalised
                if normalized > 0.0 {
                    normalized *= 1.5;
                }
                if normalized.abs() > max_residual {
                    max_residual = normalized.abs();
                    worst = Some(i);
                }
            }
            let Some(i) = worst else {
                break;
            };
            if max_residual < 1.0 {
                break;
            }

            let mut trial = Trial::of(origin);
            trial.origin_mut().arrivals[i].excluded = Exclusion::LargeResidual;
            let Some(relo) = self.relocate(trial.origin()) else {
                break;
            };
            trial.adopt(&relo);
            trial.commit(origin);
            count += 1;
        }

        loop {
            let mut best: Option<usize> = None;
            let mut min_residual = 1000.0;
            for (i, arr) in origin.arrivals.iter().enumerate() {
                if arr.excluded != Exclusion::LargeResidual {
                    continue;
                }
                if arr.residual.abs() < min_residual {
                    min_residual = arr.residual.abs();
                    best = Some(i);
                }
            }
            let Some(i) = best else {
                break;
            };
            if min_residual > 2.0 * self.config.good_rms {
                break;
            }

            let mut trial = Trial::of(origin);
            trial.origin_mut().arrivals[i].excluded = Exclusion::NotExcluded;
            let Some(relo) = self.relocate(trial.origin()) else {
                break;
            };
            trial.adopt(&relo);
            trial.commit(origin);
            count += 1;
        }

        count > 0
    }

    /// Bring down the RMS of large origins
    pub(super) fn ensure_acceptable_rms(&mut self, origin: &mut Origin, keep_depth: bool) {
        while origin.rms() > self.config.max_rms {
            let defining = origin.defining_phase_count();
            if defining < ACCEPTABLE_RMS_MIN_PHASES {
                break;
            }

            if defining < ACCEPTABLE_RMS_ENHANCE_MAX_PHASES {
                if !self.enhance_score(origin, 1) {
                    break;
                }
                continue;
            }

            let Some(worst) = arrival_with_largest_residual(origin) else {
                break;
            };
            let mut trial = Trial::of(origin);
            trial.origin_mut().arrivals[worst].excluded = Exclusion::LargeResidual;
            self.locator.use_fixed_depth(keep_depth);
            let Some(relo) = self.relocate(trial.origin()) else {
                log::warn!("origin {}: relocation failed reducing rms", origin.id);
                break;
            };
            trial.adopt(&relo);
            trial.commit(origin);
        }
    }

    /// Detach excluded arrivals whose residual is beyond any use
    pub(super) fn remove_worst_outliers(&mut self, origin: &mut Origin) -> usize {
        let max_keep = self.config.max_residual_keep;
        let mut removed = Vec::new();
        origin.arrivals.retain(|arr| {
            if !arr.is_defining() && arr.residual.abs() > max_keep {
                removed.push(arr.pick.id.clone());
                false
            } else {
                true
            }
        });

        for pick_id in &removed {
            if self.pick_origin.get(pick_id) == Some(&origin.id) {
                self.pick_origin.remove(pick_id);
            }
        }
        if !removed.is_empty() {
            log::debug!("origin {}: removed outliers {}", origin.id, removed.join(", "));
        }
        removed.len()
    }

    /// Exclude stations far beyond the bulk of the network
    pub(super) fn exclude_distant_stations(&mut self, origin: &mut Origin) -> bool {
        let q = 4.0;
        let mut distance: Vec<f64> = origin
            .arrivals
            .iter()
            .filter(|a| a.is_defining() || a.excluded == Exclusion::StationDistance)
            .filter(|a| a.distance <= 110.0)
            .map(|a| a.distance)
            .collect();

        let n = distance.len();
        if n < 4 {
            return false;
        }
        distance.sort_by(|a, b| a.total_cmp(b));

        let nx = if 0.1 * n as f64 > 2.0 {
            (0.1 * n as f64) as usize
        } else {
            2
        };
        let mut max_distance = distance[n - nx];
        for &d in &distance[n - nx + 1..] {
            if d > q * max_distance {
                break;
            }
            max_distance = d;
        }

        let mut trial = Trial::of(origin);
        let mut excluded = 0;
        for arr in trial.origin_mut().arrivals.iter_mut() {
            if arr.is_defining() && arr.distance > max_distance {
                arr.excluded = Exclusion::StationDistance;
                excluded += 1;
            }
        }
        if excluded == 0 {
            return false;
        }

        match self.relocate(trial.origin()) {
            Some(relo) => {
                trial.adopt(&relo);
                trial.commit(origin);
                true
            }
            None => false,
        }
    }

    /// Stop using core phases when the P range is well covered
    pub(super) fn exclude_pkp(&mut self, origin: &mut Origin) -> bool {
        if origin.defining_phase_count_in(0.0, 105.0) < self.config.min_sta_count_ignore_pkp {
            return false;
        }

        let otime = origin.time;
        let mut trial = Trial::of(origin);
        let mut changed = false;
        for arr in trial.origin_mut().arrivals.iter_mut() {
            if !arr.is_defining() || arr.distance < 105.0 {
                continue;
            }
            if (arr.phase == "P" || arr.phase == "PKP") && arr.pick.time - otime > 960.0 {
                arr.excluded = Exclusion::UnusedPhase;
                changed = true;
            }
        }
        if !changed {
            return false;
        }

        match self.relocate(trial.origin()) {
            Some(relo) => {
                trial.adopt(&relo);
                trial.commit(origin);
                true
            }
            None => {
                log::warn!("origin {}: relocation failed excluding PKP", origin.id);
                false
            }
        }
    }

    /// Recompute distances and azimuths and restore the canonical order
    pub(crate) fn ensure_consistent_arrivals(&self, origin: &mut Origin) {
        let (lat, lon) = (origin.lat, origin.lon);
        for arr in origin.arrivals.iter_mut() {
            if let Some(station) = arr.pick.station() {
                let (delta, az, _) = delazi(lat, lon, station.lat, station.lon);
                arr.distance = delta;
                arr.azimuth = az;
            }
        }
        origin.sort_arrivals();
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_trim_residuals_excludes_bad_pick() {
        let (mut engine, _) = make_engine(make_config());
        let mut origin = make_located_origin(&mut engine, 1);
        let bad = origin.arrivals[3].pick.id.clone();

        // shift one pick far off and relocate with the bad pick in
        let mut shifted = (*origin.arrivals[3].pick).clone();
        shifted.time += 12.0;
        origin.arrivals[3].pick = std::sync::Arc::new(shifted);
        engine.locator.set_fixed_depth(10.0);
        let relo = engine.relocate(&origin).unwrap();
        origin.update_from(&relo);

        assert!(engine.trim_residuals(&mut origin));
        let idx = origin.find_arrival_by_id(&bad).unwrap();
        assert_eq!(origin.arrivals[idx].excluded, Exclusion::LargeResidual);
        assert!(origin.rms() < 1.0);
    }

    #[test]
    fn test_remove_worst_outliers() {
        let (mut engine, _) = make_engine(make_config());
        let mut origin = make_located_origin(&mut engine, 1);
        origin.arrivals[0].excluded = Exclusion::LargeResidual;
        origin.arrivals[0].residual = 30.0;
        origin.arrivals[1].excluded = Exclusion::LargeResidual;
        origin.arrivals[1].residual = 10.0;
        let n = origin.arrivals.len();

        assert_eq!(engine.remove_worst_outliers(&mut origin), 1);
        assert_eq!(origin.arrivals.len(), n - 1);
        assert_eq!(engine.remove_worst_outliers(&mut origin), 0);
    }

    #[test]
    fn test_exclude_distant_stations() {
        let (mut engine, _) = make_engine(make_config());
        let mut origin = make_located_origin(&mut engine, 1);
        // one arrival pretends to be very far away
        origin.arrivals[0].distance = 40.0;
        let far = origin.arrivals[0].pick.id.clone();
        let _ = engine.exclude_distant_stations(&mut origin);
        let idx = origin.find_arrival_by_id(&far).unwrap();
        assert_eq!(origin.arrivals[idx].excluded, Exclusion::StationDistance);
        assert_eq!(origin.defining_phase_count(), 7);
    }

    #[test]
    fn test_enhance_score_disabled_leaves_origin() {
        let (mut engine, _) = make_engine(make_config());
        let mut origin = make_located_origin(&mut engine, 1);
        let before = origin.defining_phase_count();
        assert!(!engine.enhance_score(&mut origin, 0));
        assert_eq!(origin.defining_phase_count(), before);
    }

    #[test]
    fn test_enhance_score_enabled_drops_outlier() {
        let config = Config {
            enable_outlier_enhancement: true,
            min_phase_count: 4,
            ..make_config()
        };
        let (mut engine, _) = make_engine(config);
        let mut origin = make_located_origin(&mut engine, 1);

        let mut shifted = (*origin.arrivals[5].pick).clone();
        shifted.time += 20.0;
        let bad = shifted.id.clone();
        origin.arrivals[5].pick = std::sync::Arc::new(shifted);
        engine.locator.use_fixed_depth(false);
        let relo = engine.relocate(&origin).unwrap();
        origin.update_from(&relo);
        let score_before = engine.score(&mut origin);

        assert!(engine.enhance_score(&mut origin, 1));
        let idx = origin.find_arrival_by_id(&bad).unwrap();
        assert!(!origin.arrivals[idx].is_defining());
        assert!(engine.score(&mut origin) > score_before);
    }

    #[test]
    fn test_epicenter_rule_is_noop() {
        let (mut engine, _) = make_engine(make_config());
        let origin = make_located_origin(&mut engine, 1);
        assert!(!engine.epicenter_requires_default_depth(&origin));
    }
}
