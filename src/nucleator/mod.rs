//! Grid-search nucleator
//!
//! Every incoming pick is back-projected to a fixed set of trial hypocentres
//! ([`GridPoint`]). A grid point that finds a cluster of compatible picks
//! proposes an origin; [`GridSearch`] keeps the best proposal, relocates it
//! and hands it to the engine.

pub mod grid;
pub mod gridpoint;

pub use grid::{parse_grid, read_grid_file};
pub use gridpoint::{GridPoint, StationWrapper};

use crate::error::Result;
use crate::locator::Locator;
use crate::model::{Origin, Pick, Station};
use crate::scoring::origin_score;
use crate::traveltime::TravelTimeTable;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Minimum arrivals of a grid point proposal
const MIN_ARRIVALS: usize = 6;

pub struct GridSearch {
    grid: Vec<GridPoint>,
    stations: HashMap<String, Arc<Station>>,
    configured_stations: HashSet<String>,
    ttt: Arc<dyn TravelTimeTable>,
    locator: Locator,
    max_rms: f64,
    network_size_km: f64,
    new_origins: Vec<Origin>,
}

impl GridSearch {
    pub fn new(ttt: Arc<dyn TravelTimeTable>) -> Self {
        Self {
            grid: Vec::new(),
            stations: HashMap::new(),
            configured_stations: HashSet::new(),
            locator: Locator::new(ttt.clone()),
            ttt,
            max_rms: 3.5,
            network_size_km: 0.0,
            new_origins: Vec::new(),
        }
    }

    pub fn with_locator(mut self, locator: Locator) -> Self {
        self.locator = locator;
        self
    }

    pub fn set_grid_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.set_grid(read_grid_file(path)?);
        Ok(())
    }

    pub fn set_grid(&mut self, grid: Vec<GridPoint>) {
        self.grid = grid;
        self.configured_stations.clear();
    }

    pub fn grid_size(&self) -> usize {
        self.grid.len()
    }

    /// Scoring parameters used to rank proposals
    pub fn set_scoring(&mut self, max_rms: f64, network_size_km: f64) {
        self.max_rms = max_rms;
        self.network_size_km = network_size_km;
    }

    pub fn set_min_depth(&mut self, depth: f64) {
        self.locator.set_min_depth(depth);
    }

    pub fn set_station(&mut self, station: Arc<Station>) {
        self.locator.set_station(station.clone());
        self.stations.insert(station.key(), station);
    }

    /// Origins proposed by the last [`GridSearch::feed`] call
    pub fn new_origins(&self) -> &[Origin] {
        &self.new_origins
    }

    /// Feed one pick; at most one new origin results.
    pub fn feed(&mut self, pick: &Arc<Pick>) -> bool {
        self.new_origins.clear();

        if self.stations.is_empty() {
            log::error!("nucleator fed without any stations configured");
            return false;
        }

        let key = pick.station_key();
        let Some(station) = self.stations.get(&key).cloned() else {
            log::error!("nucleator: no station {}", key);
            return false;
        };

        let setup_needed = self.configured_stations.insert(key.clone());
        if setup_needed {
            log::debug!("nucleator: setting up station {}", key);
        }

        let mut candidates: BTreeMap<BTreeSet<String>, (Origin, f64)> = BTreeMap::new();
        let mut max_score: f64 = 0.0;

        for gp in self.grid.iter_mut() {
            if setup_needed {
                gp.setup_station(&station, self.ttt.as_ref());
            }

            let Some(origin) = gp.feed(pick) else {
                continue;
            };
            if origin.arrivals.len() < MIN_ARRIVALS || origin.find_arrival(pick).is_none() {
                continue;
            }

            let mut origin = origin.clone();
            let score = origin_score(&mut origin, self.max_rms, self.network_size_km);

            let pick_set: BTreeSet<String> = origin
                .arrivals
                .iter()
                .filter(|a| a.is_defining())
                .map(|a| a.pick.id.clone())
                .collect();
            if let Some((_, existing)) = candidates.get(&pick_set) {
                if score <= *existing {
                    continue;
                }
            }

            if score < 0.6 * max_score {
                continue;
            }
            max_score = max_score.max(score);

            origin.score = score;
            candidates.insert(pick_set, (origin, score));
        }

        let mut relocated = Vec::new();
        for (origin, score) in candidates.values() {
            if *score < 0.6 * max_score {
                continue;
            }

            self.locator.use_fixed_depth(true);
            let relo = match self.locator.relocate(origin) {
                Ok(relo) => relo,
                Err(e) => {
                    log::debug!("nucleator: fixed-depth relocation failed: {}", e);
                    continue;
                }
            };

            let Some(index) = relo.find_arrival(pick) else {
                log::error!("nucleator: pick {} unexpectedly not found after relocation", pick.id);
                continue;
            };
            if relo.arrivals[index].distance > station.max_nuc_dist {
                continue;
            }
            relocated.push(relo);
        }

        let mut best: Option<(Origin, f64)> = None;
        for mut origin in relocated {
            let score = origin_score(&mut origin, self.max_rms, self.network_size_km);
            if score <= 0.0 {
                continue;
            }
            if best.as_ref().map_or(true, |(_, s)| score > *s) {
                origin.score = score;
                best = Some((origin, score));
            }
        }

        if let Some((best, _)) = best {
            self.locator.use_fixed_depth(false);
            match self.locator.relocate(&best) {
                Ok(relo) => self.new_origins.push(relo),
                Err(e) => log::debug!("nucleator: free-depth relocation failed: {}", e),
            }
        }

        !self.new_origins.is_empty()
    }

    /// Purge projected picks at or before `min_time` from every grid point
    pub fn cleanup(&mut self, min_time: f64) -> usize {
        let removed: usize = self.grid.iter_mut().map(|gp| gp.cleanup(min_time)).sum();
        if removed > 0 {
            log::debug!("nucleator cleanup: removed {} projected picks", removed);
        }
        removed
    }

    pub fn reset(&mut self) {
        for gp in self.grid.iter_mut() {
            gp.clear();
        }
        self.new_origins.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{delazi, project};
    use crate::locator::phase_travel_time;
    use crate::traveltime::TabulatedTravelTimes;

    const OTIME: f64 = 50_000.0;

    fn make_stations() -> Vec<Arc<Station>> {
        (0..8)
            .map(|i| {
                let az = 45.0 * i as f64 + 10.0;
                let (lat, lon) = project(45.0, 10.0, 0.5 + 0.12 * i as f64, az);
                Arc::new(Station::new("XX", &format!("S{}", i), lat, lon, 0.0))
            })
            .collect()
    }

    fn make_search(stations: &[Arc<Station>]) -> GridSearch {
        let ttt: Arc<dyn TravelTimeTable> = Arc::new(TabulatedTravelTimes::new());
        let mut search = GridSearch::new(ttt);
        let mut grid = Vec::new();
        for dlat in [-0.5, 0.0, 0.5] {
            for dlon in [-0.5, 0.0, 0.5] {
                grid.push(GridPoint::new(45.0 + dlat, 10.0 + dlon, 10.0).with_limits(1.0, 10.0, 6));
            }
        }
        search.set_grid(grid);
        for station in stations {
            search.set_station(station.clone());
        }
        search
    }

    fn make_pick(station: &Arc<Station>, id: &str) -> Arc<Pick> {
        let ttt = TabulatedTravelTimes::new();
        let (delta, _, _) = delazi(45.0, 10.0, station.lat, station.lon);
        let tt = phase_travel_time(&ttt, "P", delta, 10.0).unwrap();
        let mut pick = Pick::new(id, &station.net, &station.code, OTIME + tt.time)
            .with_amplitude(2000.0, 1.0, 12.0);
        pick.normamp = 1.0;
        pick.station = Some(station.clone());
        Arc::new(pick)
    }

    #[test]
    fn test_nucleates_from_consistent_picks() {
        let stations = make_stations();
        let mut search = make_search(&stations);

        let mut origins = Vec::new();
        for (i, station) in stations.iter().enumerate() {
            if search.feed(&make_pick(station, &format!("p{}", i))) {
                assert!(i >= 5);
                origins.extend(search.new_origins().iter().cloned());
            }
        }

        let origin = origins.last().unwrap();
        assert!(origin.arrivals.len() >= 6);
        assert!((origin.lat - 45.0).abs() < 0.1, "lat {}", origin.lat);
        assert!((origin.lon - 10.0).abs() < 0.1, "lon {}", origin.lon);
        assert!((origin.time - OTIME).abs() < 2.0);
    }

    #[test]
    fn test_new_origins_cleared_each_call() {
        let stations = make_stations();
        let mut search = make_search(&stations);
        for (i, station) in stations.iter().enumerate() {
            search.feed(&make_pick(station, &format!("p{}", i)));
        }
        let mut late = (*make_pick(&stations[0], "late")).clone();
        late.time += 3000.0;
        assert!(!search.feed(&Arc::new(late)));
        assert!(search.new_origins().is_empty());
    }

    #[test]
    fn test_no_stations() {
        let ttt: Arc<dyn TravelTimeTable> = Arc::new(TabulatedTravelTimes::new());
        let mut search = GridSearch::new(ttt);
        let station = Arc::new(Station::new("XX", "A", 0.0, 0.0, 0.0));
        assert!(!search.feed(&make_pick(&station, "p")));
    }

    #[test]
    fn test_cleanup_and_reset() {
        let stations = make_stations();
        let mut search = make_search(&stations);
        for (i, station) in stations.iter().enumerate().take(3) {
            search.feed(&make_pick(station, &format!("p{}", i)));
        }
        assert!(search.cleanup(OTIME + 1000.0) > 0);
        assert_eq!(search.cleanup(OTIME + 1000.0), 0);
        search.reset();
        assert!(search.new_origins().is_empty());
    }
}
