//! A single trial hypocentre of the nucleator grid

use crate::geo::delazi;
use crate::model::{Arrival, Hypocenter, Origin, Pick, Station};
use crate::traveltime::{travel_time_p, TravelTimeTable};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Cached geometry and P prediction from one station to one grid point
#[derive(Debug, Clone)]
pub struct StationWrapper {
    pub station: Arc<Station>,
    pub phase: String,
    pub distance: f64,
    /// Grid point to station
    pub azimuth: f64,
    pub ttime: f64,
    /// Horizontal slowness, s/deg
    pub hslow: f64,
}

/// Back-projected origin time as a map key; ties keep insertion order
#[derive(Debug, Clone, Copy)]
struct ProjectedKey {
    time: f64,
    seq: u64,
}

impl PartialEq for ProjectedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ProjectedKey {}

impl PartialOrd for ProjectedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProjectedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time.total_cmp(&other.time).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Clone)]
struct ProjectedPick {
    pick: Arc<Pick>,
    wrapper: Arc<StationWrapper>,
}

#[derive(Debug, Clone)]
pub struct GridPoint {
    pub hypocenter: Hypocenter,
    /// Cluster radius, degrees
    pub radius: f64,
    /// Half width of the projected-time window, seconds
    pub dt: f64,
    pub max_sta_dist: f64,
    pub nmin: usize,
    wrappers: HashMap<String, Arc<StationWrapper>>,
    projected: BTreeMap<ProjectedKey, ProjectedPick>,
    seq: u64,
    origin: Origin,
}

impl GridPoint {
    pub fn new(lat: f64, lon: f64, dep: f64) -> Self {
        Self {
            hypocenter: Hypocenter::new(lat, lon, dep),
            radius: 4.0,
            dt: 50.0,
            max_sta_dist: 180.0,
            nmin: 6,
            wrappers: HashMap::new(),
            projected: BTreeMap::new(),
            seq: 0,
            origin: Origin::new(0, lat, lon, dep, 0.0),
        }
    }

    pub fn with_limits(mut self, radius: f64, max_sta_dist: f64, nmin: usize) -> Self {
        self.radius = radius;
        self.max_sta_dist = max_sta_dist;
        self.nmin = nmin;
        self
    }

    /// Cache the geometry for `station` unless it is out of range
    pub fn setup_station(&mut self, station: &Arc<Station>, ttt: &dyn TravelTimeTable) -> bool {
        let h = &self.hypocenter;
        let (delta, azimuth, _) = delazi(h.lat, h.lon, station.lat, station.lon);
        if delta > station.max_nuc_dist || delta > self.max_sta_dist {
            return false;
        }
        let Some(tt) = travel_time_p(ttt, delta, h.dep) else {
            return false;
        };

        self.wrappers.insert(
            station.key(),
            Arc::new(StationWrapper {
                station: station.clone(),
                phase: tt.phase,
                distance: delta,
                azimuth,
                ttime: tt.time,
                hslow: tt.dtdd,
            }),
        );
        true
    }

    pub fn wrapper_count(&self) -> usize {
        self.wrappers.len()
    }

    pub fn projected_count(&self) -> usize {
        self.projected.len()
    }

    /// Back-project `pick` and look for a cluster containing it.
    ///
    /// Returns the grid point's candidate origin when at least `nmin`
    /// mutually compatible picks from distinct stations are found.
    pub fn feed(&mut self, pick: &Arc<Pick>) -> Option<&Origin> {
        let wrapper = self.wrappers.get(&pick.station_key())?.clone();
        if wrapper.distance > self.max_sta_dist || wrapper.distance > wrapper.station.max_nuc_dist {
            return None;
        }

        let projected_time = pick.time - wrapper.ttime;
        let already = self
            .projected
            .range(
                ProjectedKey { time: projected_time, seq: 0 }
                    ..=ProjectedKey { time: projected_time, seq: u64::MAX },
            )
            .any(|(_, p)| p.pick.id == pick.id);
        if !already {
            self.seq += 1;
            self.projected.insert(
                ProjectedKey { time: projected_time, seq: self.seq },
                ProjectedPick {
                    pick: pick.clone(),
                    wrapper: wrapper.clone(),
                },
            );
        }

        let lo = ProjectedKey { time: projected_time - self.dt, seq: 0 };
        let hi = ProjectedKey { time: projected_time + self.dt, seq: u64::MAX };
        let window: Vec<(f64, &ProjectedPick)> = self
            .projected
            .range(lo..=hi)
            .map(|(k, p)| (k.time, p))
            .collect();
        let npick = window.len();
        if npick < self.nmin {
            return None;
        }

        const DT0: f64 = 4.0;
        let mut cnt = vec![0usize; npick];
        let mut flg = vec![false; npick];
        for i in 0..npick {
            let (ti, pi) = window[i];
            for k in i..npick {
                let (tk, pk) = window[k];
                let azi_diff =
                    (((pk.wrapper.azimuth - pi.wrapper.azimuth) + 180.0).rem_euclid(360.0) - 180.0).abs();
                let dtmax =
                    self.radius * (pi.wrapper.hslow + pk.wrapper.hslow) * azi_diff / 90.0 + DT0;
                if (ti - tk).abs() < dtmax {
                    cnt[i] += 1;
                    cnt[k] += 1;
                    if pi.pick.id == pick.id || pk.pick.id == pick.id {
                        flg[i] = true;
                        flg[k] = true;
                    }
                }
            }
        }

        if flg.iter().filter(|&&f| f).count() < self.nmin {
            return None;
        }

        // origin time from the best-connected member of the group
        let mut best = 0;
        for i in 0..npick {
            if flg[i] && (!flg[best] || cnt[i] > cnt[best]) {
                best = i;
            }
        }
        let otime = window[best].0;

        let h = self.hypocenter;
        let mut origin = Origin::at(0, &h, otime);
        for (i, (t, p)) in window.iter().enumerate() {
            if !flg[i] {
                continue;
            }
            if origin.arrivals.iter().any(|a| a.pick.same_station(&p.pick)) {
                continue;
            }
            let phase = if p.pick.time - otime < 960.0 { "P" } else { "PKP" };
            let mut arrival = Arrival::new(p.pick.clone(), phase, t - otime);
            arrival.distance = p.wrapper.distance;
            arrival.azimuth = p.wrapper.azimuth;
            origin.arrivals.push(arrival);
        }

        if origin.arrivals.len() < self.nmin {
            return None;
        }

        self.origin = origin;
        Some(&self.origin)
    }

    /// Drop projected picks at or before `min_time`, returning how many
    pub fn cleanup(&mut self, min_time: f64) -> usize {
        let kept = self.projected.split_off(&ProjectedKey {
            time: min_time,
            seq: u64::MAX,
        });
        let removed = self.projected.len();
        self.projected = kept;
        removed
    }

    pub fn clear(&mut self) {
        self.projected.clear();
    }
}
