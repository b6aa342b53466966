//! Merging and matching of origins

use super::Autoloc3;
use crate::config::MergeCriterion;
use crate::model::{Exclusion, Origin, OriginId};

impl Autoloc3 {
    /// Whether `candidate` should be the base of a merge with `other`
    fn prefer_for_merge(&self, candidate: &Origin, other: &Origin) -> bool {
        match self.config.merge_criterion {
            MergeCriterion::Score => {
                self.score(&mut candidate.clone()) > self.score(&mut other.clone())
            }
            MergeCriterion::DefiningPhaseCount => {
                candidate.defining_phase_count() > other.defining_phase_count()
            }
        }
    }

    /// Combine two origins sharing picks. The result carries the id of
    /// `origin1` and the solution of the preferred origin, extended by the
    /// arrivals of the other one where they fit.
    pub(super) fn merge(&mut self, origin1: &Origin, origin2: &Origin) -> Origin {
        let id = origin1.id;
        let (better, worse) = if self.prefer_for_merge(origin2, origin1) {
            (origin2, origin1)
        } else {
            (origin1, origin2)
        };

        let mut combined = better.clone();
        combined.id = id;
        for arr in &worse.arrivals {
            if combined.find_arrival(&arr.pick).is_some() {
                continue;
            }
            let mut arr = arr.clone();
            arr.excluded = Exclusion::TemporarilyExcluded;
            combined.add(arr);
        }

        self.locator.use_fixed_depth(false);
        let Some(relo) = self.relocate(&combined) else {
            log::warn!("merge of origins {} and {}: relocation failed", origin1.id, origin2.id);
            return combined;
        };
        combined.update_from(&relo);

        let readmit: Vec<bool> = combined
            .arrivals
            .iter()
            .map(|arr| self.residual_ok(arr, 1.3, 1.8))
            .collect();
        for (arr, ok) in combined.arrivals.iter_mut().zip(readmit) {
            if arr.excluded != Exclusion::TemporarilyExcluded {
                continue;
            }
            arr.excluded = if ok {
                Exclusion::NotExcluded
            } else {
                Exclusion::LargeResidual
            };
        }

        self.trim_residuals(&mut combined);
        combined
    }

    /// Buffered origin best matching a manual origin: within 20 minutes,
    /// most identical picks or same-station picks within 20 s
    pub(super) fn find_matching_origin(&self, origin: &Origin) -> Option<OriginId> {
        let mut found = None;
        let mut best_match = 0;

        for existing in &self.origins {
            if (origin.time - existing.time).abs() > 1200.0 {
                continue;
            }

            let mut matches = 0;
            for arr in &existing.arrivals {
                let pick = &arr.pick;
                if pick.station.is_none() {
                    log::warn!("pick {} of origin {} without station info", pick.id, existing.id);
                    continue;
                }
                let hit = origin.arrivals.iter().any(|other| {
                    other.pick.id == pick.id
                        || (other.pick.same_station(pick)
                            && (-20.0..=20.0).contains(&(other.pick.time - pick.time)))
                });
                if hit {
                    matches += 1;
                }
            }

            if matches > best_match {
                best_match = matches;
                found = Some(existing.id);
            }
        }
        found
    }

    /// Highest-scoring buffered origin sharing at least three picks
    pub(super) fn find_equivalent(&self, origin: &Origin) -> Option<OriginId> {
        let mut result: Option<&Origin> = None;
        for other in &self.origins {
            if origin.common_pick_count(other) < 3 {
                continue;
            }
            match result {
                Some(r) if other.score <= r.score => {}
                _ => result = Some(other),
            }
        }
        result.map(|o| o.id)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::config::Config;
    use crate::model::Origin;

    /// Split a located origin into two overlapping halves
    fn make_pair(engine: &mut super::super::Autoloc3) -> (Origin, Origin) {
        let full = make_located_origin(engine, 1);
        let mut a = full.clone();
        a.arrivals.truncate(6);
        let mut b = full.clone();
        b.id = 2;
        b.arrivals.drain(0..3);
        engine.locator.use_fixed_depth(false);
        let relo = engine.relocate(&a).unwrap();
        a.update_from(&relo);
        let relo = engine.relocate(&b).unwrap();
        b.update_from(&relo);
        (a, b)
    }

    #[test]
    fn test_merge_combines_arrivals() {
        let (mut engine, _) = make_engine(make_config());
        let (a, b) = make_pair(&mut engine);
        let merged = engine.merge(&a, &b);
        assert_eq!(merged.id, a.id);
        assert_eq!(merged.arrivals.len(), 8);
        assert_eq!(merged.defining_phase_count(), 8);
        assert!(merged
            .arrivals
            .iter()
            .all(|arr| arr.excluded != Exclusion::TemporarilyExcluded));
    }

    #[test]
    fn test_merge_criterion_policies() {
        let (mut engine, _) = make_engine(make_config());
        let (mut a, b) = make_pair(&mut engine);
        // a has 6 defining phases but is made to score worse than b
        for arr in a.arrivals.iter_mut().take(2) {
            let mut pick = (*arr.pick).clone();
            pick.snr = 3.0;
            pick.normamp = 0.01;
            arr.pick = std::sync::Arc::new(pick);
        }
        a.arrivals[5].excluded = Exclusion::ManuallyExcluded;
        let a_count = a.defining_phase_count();
        let b_count = b.defining_phase_count();
        assert!(a_count == b_count);

        assert!(engine.prefer_for_merge(&b, &a));

        let config = Config {
            merge_criterion: MergeCriterion::DefiningPhaseCount,
            ..make_config()
        };
        let (engine2, _) = make_engine(config);
        // equal counts: neither is preferred, the first argument stays base
        assert!(!engine2.prefer_for_merge(&b, &a));
        let mut c = b.clone();
        c.arrivals[0].excluded = Exclusion::ManuallyExcluded;
        assert!(engine2.prefer_for_merge(&a, &c));
    }

    #[test]
    fn test_find_equivalent_and_matching() {
        let (mut engine, _) = make_engine(make_config());
        let origin = make_located_origin(&mut engine, 1);
        engine.store_origin(origin.clone());

        let mut probe = origin.clone();
        probe.id = 99;
        probe.arrivals.truncate(3);
        assert_eq!(engine.find_equivalent(&probe), Some(1));
        probe.arrivals.truncate(2);
        assert_eq!(engine.find_equivalent(&probe), None);

        // a manual pick 5 s off at a shared station matches
        let mut manual = Origin::new(0, origin.lat, origin.lon, 10.0, origin.time + 30.0);
        let mut arr = origin.arrivals[0].clone();
        let mut pick = (*arr.pick).clone();
        pick.id = "manual-0".to_string();
        pick.time += 5.0;
        arr.pick = std::sync::Arc::new(pick);
        manual.arrivals.push(arr);
        assert_eq!(engine.find_matching_origin(&manual), Some(1));

        manual.time += 3600.0;
        assert_eq!(engine.find_matching_origin(&manual), None);
    }
}
