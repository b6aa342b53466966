//! Fast-track preliminary origins from clusters of very large picks

use super::Autoloc3;
use crate::geo::{delazi, distance};
use crate::model::{Arrival, DepthType, Exclusion, Origin, Pick};
use std::sync::Arc;

impl Autoloc3 {
    /// XXL picks of other stations close enough in space and time to
    /// `new_pick` to belong to the same large event, one per station
    fn xxl_cluster(&self, new_pick: &Arc<Pick>) -> Vec<Arc<Pick>> {
        let Some(new_station) = new_pick.station() else {
            return Vec::new();
        };
        let max_dist = self.config.xxl_max_sta_dist;
        let max_dt = 10.0 + 13.7 * max_dist;

        let mut cluster = vec![new_pick.clone()];
        for old in self.picks.values() {
            if !old.xxl || old.is_ignored() || old.same_station(new_pick) {
                continue;
            }
            let Some(old_station) = old.station() else {
                continue;
            };
            if (new_pick.time - old.time).abs() > max_dt {
                continue;
            }
            let dx = distance(old_station.lat, old_station.lon, new_station.lat, new_station.lon);
            if dx > max_dist {
                continue;
            }
            if !self.config.use_manual_picks && old.is_manual() && !self.config.use_manual_origins {
                continue;
            }
            if cluster.iter().any(|p| p.same_station(old)) {
                continue;
            }
            cluster.push(old.clone());
        }
        cluster
    }

    /// Trial depths for the fixed-depth XXL relocation: multiples of the
    /// default depth up to the XXL maximum, or just the default depth if
    /// it is sticky
    fn xxl_trial_depths(&self) -> Vec<f64> {
        let default_depth = self.config.default_depth;
        if self.config.default_depth_stickiness > 0.9 || default_depth <= 0.0 {
            return vec![default_depth];
        }
        (1..)
            .map(|i| default_depth * i as f64)
            .take_while(|dep| *dep <= self.config.xxl_max_depth)
            .collect()
    }

    /// Preliminary origin from a cluster of XXL picks around `new_pick`.
    ///
    /// The cluster is located at fixed trial depths starting just next to
    /// the earliest station. The first acceptable solution wins.
    pub(super) fn xxl_preliminary_origin(&mut self, new_pick: &Arc<Pick>) -> Option<Origin> {
        if !new_pick.xxl {
            return None;
        }

        let cluster = self.xxl_cluster(new_pick);
        log::debug!("number of XXL picks={}", cluster.len());
        if cluster.len() < self.config.xxl_min_phase_count {
            return None;
        }

        let earliest = cluster
            .iter()
            .min_by(|a, b| a.time.total_cmp(&b.time))?
            .clone();
        let station = earliest.station()?;
        let (lat, lon, time) = (station.lat + 0.03, station.lon + 0.03, earliest.time - 0.05);
        let sticky = self.config.default_depth_stickiness > 0.9;

        for dep in self.xxl_trial_depths() {
            let mut origin = Origin::new(0, lat, lon, dep, time);
            for pick in &cluster {
                let mut arr = Arrival::new(pick.clone(), "P", 0.0);
                if let Some(st) = pick.station() {
                    let (delta, az, _) = delazi(lat, lon, st.lat, st.lon);
                    arr.distance = delta;
                    arr.azimuth = az;
                }
                arr.excluded = Exclusion::NotExcluded;
                origin.arrivals.push(arr);
            }

            self.locator.set_fixed_depth(dep);
            log::debug!("trying to relocate possible XXL origin; trial depth {} km", dep);
            let Some(relo) = self.relocate(&origin) else {
                log::debug!("failed to relocate possible XXL origin");
                continue;
            };
            log::debug!("XXL {}", relo.oneliner());

            let too_far = relo
                .arrivals
                .iter()
                .any(|a| a.distance > self.config.xxl_max_sta_dist);
            if too_far || relo.rms() > self.config.max_rms {
                continue;
            }

            log::info!("relocated XXL alert");
            origin.update_from(&relo);
            origin.preliminary = true;
            origin.depth_type = if sticky {
                DepthType::DepthDefault
            } else {
                DepthType::DepthManuallyFixed
            };
            log::info!("{}", origin.oneliner());

            if !sticky && self.depth_is_resolvable(&mut origin) {
                self.locator.use_fixed_depth(false);
                let mut free = origin.clone();
                free.depth_type = DepthType::DepthFree;
                if let Some(relo) = self.relocate(&free) {
                    origin.update_from(&relo);
                }
            }

            origin.id = self.ids.next_id();
            origin.sort_arrivals();
            return Some(origin);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::config::Config;

    fn make_xxl_config() -> Config {
        Config {
            xxl_enabled: true,
            ..make_config()
        }
    }

    /// Buffer XXL picks for the first `n` stations, returning the last one
    fn make_xxl_picks(engine: &mut Autoloc3, n: usize) -> Arc<Pick> {
        let stations = make_stations();
        let mut last = None;
        for (i, st) in stations.iter().take(n).enumerate() {
            let mut pick = make_pick(engine, &format!("xxl-{}", i), st, 0.0)
                .with_amplitude(50_000.0, 1.0, 30.0);
            pick.xxl = true;
            pick.station = engine.stations.get(&st.key()).cloned();
            let pick = Arc::new(pick);
            engine.picks.insert(pick.id.clone(), pick.clone());
            last = Some(pick);
        }
        last.unwrap()
    }

    #[test]
    fn test_trial_depths() {
        let (engine, _) = make_engine(make_xxl_config());
        assert_eq!(
            engine.xxl_trial_depths(),
            vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0]
        );

        let config = Config {
            default_depth_stickiness: 1.0,
            ..make_xxl_config()
        };
        let (engine, _) = make_engine(config);
        assert_eq!(engine.xxl_trial_depths(), vec![10.0]);
    }

    #[test]
    fn test_xxl_cluster_too_small() {
        let (mut engine, _) = make_engine(make_xxl_config());
        let pick = make_xxl_picks(&mut engine, 3);
        assert!(engine.xxl_preliminary_origin(&pick).is_none());
    }

    #[test]
    fn test_xxl_preliminary_origin() {
        let (mut engine, _) = make_engine(make_xxl_config());
        let pick = make_xxl_picks(&mut engine, 6);
        let origin = engine.xxl_preliminary_origin(&pick).unwrap();

        assert!(origin.preliminary);
        assert!(origin.id > 0);
        assert_eq!(origin.arrivals.len(), 6);
        assert!((origin.lat - LAT).abs() < 0.3);
        assert!((origin.lon - LON).abs() < 0.3);
    }

    #[test]
    fn test_non_xxl_pick_ignored() {
        let (mut engine, _) = make_engine(make_xxl_config());
        let pick = make_xxl_picks(&mut engine, 6);
        let mut plain = (*pick).clone();
        plain.xxl = false;
        assert!(engine.xxl_preliminary_origin(&Arc::new(plain)).is_none());
    }
}
