//! Autoloc3 engine
//!
//! Owns the pick buffer, the origin buffer and the publication bookkeeping,
//! and drives every incoming pick through the processing pipeline:
//! validation, association with known origins, nucleation of new ones,
//! rework, acceptance filtering and rate-limited publication.
//!
//! The engine is synchronous. Each `feed_*` call runs to completion before
//! returning; callers that share an engine across tasks wrap it in a mutex.

mod associate;
mod fake;
mod merge;
mod process;
mod publish;
mod rework;
mod xxl;

use crate::associator::Associator;
use crate::config::Config;
use crate::error::{AutolocError, Result};
use crate::locator::Locator;
use crate::model::{
    Amplitude, DepthType, Origin, OriginId, OriginIdGenerator, OriginVector, Pick, Station,
    Time,
};
use crate::nucleator::{GridPoint, GridSearch};
use crate::pick_log::{format_pick, PickLog};
use crate::report::ReportSink;
use crate::scoring::origin_score;
use crate::station_config::StationConfig;
use crate::traveltime::{TabulatedTravelTimes, TravelTimeTable};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Wall-clock source, seconds since the epoch
pub type TimeFn = Box<dyn Fn() -> Time + Send + Sync>;

fn wall_clock() -> Time {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + now.timestamp_subsec_micros() as f64 * 1e-6
}

pub struct Autoloc3 {
    config: Config,
    station_config: StationConfig,
    stations: HashMap<String, Arc<Station>>,
    missing_stations: HashSet<String>,

    /// Buffered picks by id, ordered for deterministic scans
    picks: BTreeMap<String, Arc<Pick>>,
    /// Pick id -> origin currently using it as a defining arrival
    pick_origin: HashMap<String, OriginId>,
    blacklist: HashSet<String>,

    origins: OriginVector,
    /// Origins stored since the last `report()`
    new_origins: Vec<OriginId>,
    outgoing: BTreeSet<OriginId>,
    last_sent: HashMap<OriginId, Origin>,
    next_due: HashMap<OriginId, Time>,
    ids: OriginIdGenerator,

    ttt: Arc<dyn TravelTimeTable>,
    associator: Associator,
    nucleator: GridSearch,
    locator: Locator,
    sink: Box<dyn ReportSink>,
    pick_log: Option<PickLog>,

    playback_now: Time,
    next_cleanup: Time,
    now_fn: TimeFn,
}

impl Autoloc3 {
    pub fn new(config: Config, sink: Box<dyn ReportSink>) -> Self {
        Self::new_with_time_fn(config, sink, Box::new(wall_clock))
    }

    /// Create an engine with a custom wall clock (for tests)
    pub fn new_with_time_fn(config: Config, sink: Box<dyn ReportSink>, now_fn: TimeFn) -> Self {
        let ttt: Arc<dyn TravelTimeTable> = Arc::new(TabulatedTravelTimes::new());
        let station_config = StationConfig::with_default(config.default_max_nuc_dist);
        let mut engine = Self {
            station_config,
            stations: HashMap::new(),
            missing_stations: HashSet::new(),
            picks: BTreeMap::new(),
            pick_origin: HashMap::new(),
            blacklist: HashSet::new(),
            origins: OriginVector::new(),
            new_origins: Vec::new(),
            outgoing: BTreeSet::new(),
            last_sent: HashMap::new(),
            next_due: HashMap::new(),
            ids: OriginIdGenerator::new(),
            associator: Associator::new(ttt.clone()),
            nucleator: GridSearch::new(ttt.clone()),
            locator: Locator::new(ttt.clone()),
            ttt,
            sink,
            pick_log: None,
            playback_now: 0.0,
            next_cleanup: 0.0,
            now_fn,
            config,
        };
        engine.apply_config();
        engine
    }

    /// Replace the travel-time table. Must be called before stations and
    /// the grid are configured.
    pub fn with_travel_times(mut self, ttt: Arc<dyn TravelTimeTable>) -> Self {
        self.associator = Associator::new(ttt.clone());
        self.nucleator = GridSearch::new(ttt.clone());
        self.locator = Locator::new(ttt.clone());
        self.ttt = ttt;
        self.apply_config();
        self
    }

    fn apply_config(&mut self) {
        self.locator.set_min_depth(self.config.minimum_depth);
        self.nucleator.set_min_depth(self.config.minimum_depth);
        self.nucleator
            .set_scoring(self.config.max_rms, self.config.network_size_km);
    }

    /// Validate the configuration and load the station config, grid and
    /// pick log. The engine must not be fed if this fails.
    pub fn init(&mut self) -> Result<()> {
        self.config = self.config.clone().validated()?;
        self.apply_config();

        if let Some(path) = self.config.station_config_file.clone() {
            log::debug!("reading station config from {}", path);
            self.station_config.read(&path)?;
        }

        if let Some(path) = self.config.grid_file.clone() {
            self.nucleator.set_grid_file(&path)?;
        }
        if self.nucleator.grid_size() == 0 {
            return Err(AutolocError::GridFile("no grid points configured".to_string()));
        }

        if let Some(prefix) = self.config.pick_log_file.clone() {
            self.pick_log = Some(PickLog::new(prefix));
        }

        log::info!(
            "autoloc initialised: {} grid points, travel times '{}', sink {}",
            self.nucleator.grid_size(),
            self.ttt.model_name(),
            self.sink.sink_type()
        );
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn set_grid(&mut self, grid: Vec<GridPoint>) {
        self.nucleator.set_grid(grid);
    }

    /// Station configuration used by subsequent `set_station` calls
    pub fn set_station_config(&mut self, station_config: StationConfig) {
        self.station_config = station_config;
    }

    /// Register a station; duplicates are ignored
    pub fn set_station(&mut self, mut station: Station) -> bool {
        let key = station.key();
        if self.stations.contains_key(&key) {
            return false;
        }

        let entry = self.station_config.get(&station.net, &station.code);
        station.max_nuc_dist = entry.max_nuc_dist;
        station.max_loc_dist = 180.0;
        station.used = entry.usage > 0;

        let station = Arc::new(station);
        self.stations.insert(key.clone(), station.clone());
        self.locator.set_station(station.clone());
        self.nucleator.set_station(station);
        log::debug!("initialized station {:<8}", key);
        true
    }

    pub fn set_stations<I: IntoIterator<Item = Station>>(&mut self, stations: I) -> usize {
        stations
            .into_iter()
            .filter(|s| self.set_station(s.clone()))
            .count()
    }

    pub fn station_count(&self) -> usize {
        self.stations.len()
    }

    /// Buffered pick by id
    pub fn pick(&self, id: &str) -> Option<&Arc<Pick>> {
        self.picks.get(id)
    }

    pub fn pick_count(&self) -> usize {
        self.picks.len()
    }

    pub fn origins(&self) -> &[Origin] {
        self.origins.as_slice()
    }

    /// Origin currently holding `pick_id` as a defining arrival
    pub fn origin_of_pick(&self, pick_id: &str) -> Option<OriginId> {
        self.pick_origin.get(pick_id).copied()
    }

    /// Pick time clock in playback mode, wall clock otherwise
    pub fn now(&self) -> Time {
        if self.config.playback {
            return self.playback_now;
        }
        (self.now_fn)()
    }

    /// Feed a pick. Returns whether it was processed.
    pub fn feed_pick(&mut self, pick: Pick) -> bool {
        self.new_origins.clear();
        let is_new = !self.picks.contains_key(&pick.id);

        let Some(pick) = self.store_pick(pick) else {
            return false;
        };
        self.process_buffered(&pick.id, is_new)
    }

    /// Attach an amplitude to a buffered pick and re-run the pick
    pub fn feed_amplitude(&mut self, amplitude: Amplitude) -> bool {
        self.new_origins.clear();

        let Some(buffered) = self.picks.get_mut(&amplitude.pick_id) else {
            log::debug!("amplitude for unknown pick {}", amplitude.pick_id);
            return false;
        };

        let pick = Arc::make_mut(buffered);
        if amplitude.kind == self.config.ampl_type_snr {
            pick.snr = amplitude.value;
        } else if amplitude.kind == self.config.ampl_type_abs {
            pick.amp = amplitude.value;
            pick.per = amplitude.period;
        } else {
            log::debug!(
                "ignoring amplitude of type '{}' for pick {}",
                amplitude.kind,
                amplitude.pick_id
            );
            return false;
        }

        let id = amplitude.pick_id;
        self.process_buffered(&id, false)
    }

    fn process_buffered(&mut self, id: &str, is_new: bool) -> bool {
        let Some(pick) = self.picks.get(id).cloned() else {
            return false;
        };

        if pick.is_automatic() && !pick.has_amplitude() {
            if is_new {
                log::debug!(
                    "process pick {:<35} {}   waiting for amplitude",
                    pick.id,
                    pick.status_flag()
                );
            }
            return false;
        }

        if !self.process(id) {
            return false;
        }

        self.report();
        self.cleanup(None);
        true
    }

    /// Resolve the station and buffer the pick. A pick that is already
    /// buffered takes over the measurements of the new copy.
    fn store_pick(&mut self, mut pick: Pick) -> Option<Arc<Pick>> {
        if pick.station.is_none() {
            let key = pick.station_key();
            match self.stations.get(&key) {
                Some(station) => pick.station = Some(station.clone()),
                None => {
                    if self.missing_stations.insert(key.clone()) {
                        log::error!("missing station {}", key);
                    }
                    return None;
                }
            }
        }

        if pick.is_automatic() && !pick.station().map(|s| s.used).unwrap_or(false) {
            return None;
        }

        if pick.time < self.now() - self.config.max_age {
            log::info!("ignored old pick {}", pick.id);
            return None;
        }

        if self.config.playback && pick.time > self.playback_now {
            self.playback_now = pick.time;
        }

        match self.picks.get_mut(&pick.id) {
            Some(existing) => {
                if pick.has_amplitude() {
                    let buffered = Arc::make_mut(existing);
                    buffered.amp = pick.amp;
                    buffered.per = pick.per;
                    buffered.snr = pick.snr;
                }
                Some(existing.clone())
            }
            None => {
                let pick = Arc::new(pick);
                self.picks.insert(pick.id.clone(), pick.clone());
                Some(pick)
            }
        }
    }

    /// Write a pick to the log and, if configured, the daily pick log
    fn log_pick(&mut self, pick: &Pick) {
        let line = format_pick(pick);
        log::debug!("pick {}", line);

        let date = chrono::DateTime::from_timestamp(self.now() as i64, 0)
            .map(|dt| dt.date_naive())
            .unwrap_or_default();
        if let Some(pick_log) = self.pick_log.as_mut() {
            if let Err(e) = pick_log.write(pick, date) {
                log::warn!("failed to write pick log: {}", e);
            }
        }
    }

    /// Feed a manual or imported origin
    pub fn feed_origin(&mut self, mut origin: Origin) -> bool {
        self.new_origins.clear();

        if origin.imported {
            if !self.config.use_imported_origins {
                log::debug!("ignoring imported origin {}", origin.id);
                return false;
            }
            origin.id = self.ids.next_id();
            self.resolve_arrival_stations(&mut origin);
            self.store_origin(origin);
            self.report();
            return true;
        }

        if origin.arrivals.is_empty() {
            log::warn!("ignoring manual origin without arrivals");
            return false;
        }

        self.resolve_arrival_stations(&mut origin);

        let Some(found_id) = self.find_matching_origin(&origin) else {
            log::debug!("no matching origin found for manual origin");
            return true;
        };
        let Some(found) = self.origins.find(found_id).cloned() else {
            return true;
        };
        log::info!("using manual origin to update origin {}", found_id);

        let mut merged = origin;
        merged.id = found_id;
        for arr in &found.arrivals {
            if merged.find_arrival(&arr.pick).is_some() {
                continue;
            }
            if merged
                .arrivals
                .iter()
                .any(|a| a.pick.same_station(&arr.pick) && a.phase == arr.phase)
            {
                continue;
            }
            merged.arrivals.push(arr.clone());
        }
        self.ensure_consistent_arrivals(&mut merged);

        if merged.depth_type == DepthType::DepthManuallyFixed {
            self.locator.set_fixed_depth(merged.dep);
        } else {
            self.locator.use_fixed_depth(false);
        }

        match self.relocate(&merged) {
            Some(relo) => {
                merged.update_from(&relo);
                self.store_origin(merged);
                self.report();
                self.cleanup(None);
            }
            None => log::warn!("failed to relocate origin {} with manual data", found_id),
        }
        true
    }

    /// Attach registered stations to the picks of externally built arrivals,
    /// dropping arrivals from unknown stations.
    fn resolve_arrival_stations(&mut self, origin: &mut Origin) {
        let stations = &self.stations;
        origin.arrivals.retain_mut(|arr| {
            if arr.pick.station.is_some() {
                return true;
            }
            match stations.get(&arr.pick.station_key()) {
                Some(station) => {
                    Arc::make_mut(&mut arr.pick).station = Some(station.clone());
                    true
                }
                None => false,
            }
        });
    }

    /// Store an accepted origin, or update the buffered origin with its id.
    /// Returns the id.
    fn store_origin(&mut self, mut origin: Origin) -> OriginId {
        self.rename_p_pkp(&mut origin);

        if origin.imported {
            log::info!("storing imported origin {}", origin.id);
            self.add_more_picks(&mut origin, false);
        } else {
            origin.score = self.score(&mut origin);
        }

        if origin.depth_phase_count() > 0 {
            origin.depth_type = DepthType::DepthPhases;
        }

        let id = origin.id;
        let min_phase_count = self.config.min_phase_count;
        let default_depth = self.config.default_depth;
        let finalize = |o: &mut Origin| {
            if !o.imported && o.defining_phase_count() >= min_phase_count {
                o.preliminary = false;
            }
            if o.depth_type == DepthType::DepthDefault && o.dep != default_depth {
                o.depth_type = DepthType::DepthFree;
            }
        };

        let stored = match self.origins.find_mut(id) {
            Some(existing) => {
                existing.update_from(&origin);
                finalize(existing);
                log::info!("UPD {}", existing.oneliner());
                existing.clone()
            }
            None => {
                finalize(&mut origin);
                log::info!("NEW {}", origin.oneliner());
                self.origins.push(origin.clone());
                origin
            }
        };

        self.pick_origin.retain(|_, o| *o != id);
        for arr in stored.arrivals.iter().filter(|a| a.is_defining()) {
            self.pick_origin.insert(arr.pick.id.clone(), id);
        }

        if !self.new_origins.contains(&id) {
            self.new_origins.push(id);
        }
        id
    }

    pub(crate) fn score(&self, origin: &mut Origin) -> f64 {
        origin_score(origin, self.config.max_rms, self.config.network_size_km)
    }

    /// Relocate with the locator's current depth mode; failures are logged
    pub(crate) fn relocate(&self, origin: &Origin) -> Option<Origin> {
        match self.locator.relocate(origin) {
            Ok(relo) => Some(relo),
            Err(e) => {
                log::debug!("relocation of origin {} failed: {}", origin.id, e);
                None
            }
        }
    }

    /// Purge picks, origins and publication state older than `min_time`.
    ///
    /// Without an explicit time this is the periodic housekeeping call: it
    /// runs at most once per cleanup interval and purges everything older
    /// than `maxAge` plus half an hour.
    pub fn cleanup(&mut self, min_time: Option<Time>) {
        let min_time = match min_time {
            Some(t) => t,
            None => {
                if self.config.max_age <= 0.0 || self.now() < self.next_cleanup {
                    return;
                }
                self.now() - self.config.max_age - 1800.0
            }
        };

        let picks_before = self.picks.len();
        let origins_before = self.origins.len();

        self.picks.retain(|_, p| p.time >= min_time);
        let nclean = self.nucleator.cleanup(min_time);
        self.next_cleanup = self.now() + self.config.cleanup_interval;

        self.origins.retain(|o| o.time >= min_time);
        let origins = &self.origins;
        self.last_sent.retain(|id, o| o.time >= min_time && origins.find(*id).is_some());
        self.next_due.retain(|id, _| origins.find(*id).is_some());
        self.outgoing.retain(|id| origins.find(*id).is_some());
        let picks = &self.picks;
        self.pick_origin
            .retain(|pick_id, id| picks.contains_key(pick_id) && origins.find(*id).is_some());

        log::info!(
            "cleanup: picks {}/{}, origins {}/{}, nucleator items removed {}",
            picks_before,
            self.picks.len(),
            origins_before,
            self.origins.len(),
            nclean
        );
        self.dump_state();
    }

    /// Log one line per buffered origin
    pub fn dump_state(&self) {
        for origin in &self.origins {
            log::info!("{}", origin.oneliner());
        }
    }

    /// Forget all picks and origins. Stations stay registered.
    pub fn reset(&mut self) {
        log::info!("reset requested");
        self.associator.reset();
        self.nucleator.reset();
        self.locator.reset();
        self.outgoing.clear();
        self.origins.clear();
        self.last_sent.clear();
        self.next_due.clear();
        self.picks.clear();
        self.pick_origin.clear();
        self.blacklist.clear();
        self.new_origins.clear();
    }

    /// Publish what is due, flush the sink and drop all state
    pub fn shutdown(&mut self) {
        log::info!("shutting down autoloc");
        self.report();
        if let Err(e) = self.sink.flush() {
            log::error!("failed to flush {} sink: {}", self.sink.sink_type(), e);
        }
        self.dump_state();
        self.reset();
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::model::PickStatus;

    #[test]
    fn test_set_station_idempotent() {
        let (mut engine, _) = make_engine(make_config());
        assert_eq!(engine.station_count(), 8);
        assert!(!engine.set_station(make_stations()[0].clone()));
        assert_eq!(engine.station_count(), 8);
    }

    #[test]
    fn test_station_config_applied_on_registration() {
        let sink = RecordingSink::default();
        let mut engine = Autoloc3::new(make_config(), Box::new(sink));
        let mut sc = StationConfig::with_default(180.0);
        sc.parse("XX S00 0 10\nXX * 1 25\n").unwrap();
        engine.set_station_config(sc);
        engine.set_stations(make_stations());

        let s0 = engine.stations.get("XX.S00").unwrap();
        assert!(!s0.used);
        assert_eq!(s0.max_nuc_dist, 10.0);
        let s1 = engine.stations.get("XX.S01").unwrap();
        assert!(s1.used);
        assert_eq!(s1.max_nuc_dist, 25.0);
    }

    #[test]
    fn test_pick_from_unknown_station_rejected() {
        let (mut engine, _) = make_engine(make_config());
        let pick = Pick::new("x1", "ZZ", "NOPE", OTIME).with_amplitude(1000.0, 1.0, 10.0);
        assert!(!engine.feed_pick(pick));
        assert!(engine.pick("x1").is_none());
        assert!(engine.missing_stations.contains("ZZ.NOPE"));
    }

    #[test]
    fn test_pick_without_amplitude_waits() {
        let (mut engine, _) = make_engine(make_config());
        let st = make_stations()[0].clone();
        let pick = Pick::new("a1", &st.net, &st.code, OTIME + 10.0);
        assert!(!engine.feed_pick(pick));
        assert!(engine.pick("a1").is_some());
        assert_eq!(engine.now(), OTIME + 10.0);
    }

    #[test]
    fn test_amplitude_updates_buffered_pick() {
        let (mut engine, _) = make_engine(make_config());
        let st = make_stations()[0].clone();
        engine.feed_pick(Pick::new("a1", &st.net, &st.code, OTIME + 10.0));

        let snr = Amplitude {
            pick_id: "a1".to_string(),
            kind: "snr".to_string(),
            value: 12.0,
            period: 0.0,
        };
        engine.feed_amplitude(snr);
        let abs = Amplitude {
            pick_id: "a1".to_string(),
            kind: "mb".to_string(),
            value: 800.0,
            period: 1.2,
        };
        engine.feed_amplitude(abs);

        let pick = engine.pick("a1").unwrap();
        assert_eq!(pick.snr, 12.0);
        assert_eq!(pick.amp, 800.0);
        assert_eq!(pick.per, 1.2);
        assert!(pick.has_amplitude());

        let unknown = Amplitude {
            pick_id: "missing".to_string(),
            kind: "snr".to_string(),
            value: 1.0,
            period: 0.0,
        };
        assert!(!engine.feed_amplitude(unknown));
    }

    #[test]
    fn test_old_pick_ignored_with_wall_clock() {
        let config = Config {
            playback: false,
            ..Config::default()
        };
        let sink = RecordingSink::default();
        let mut engine =
            Autoloc3::new_with_time_fn(config, Box::new(sink), Box::new(|| OTIME + 100_000.0));
        engine.set_stations(make_stations());
        let st = make_stations()[0].clone();
        let pick = Pick::new("old", &st.net, &st.code, OTIME).with_amplitude(1000.0, 1.0, 10.0);
        assert!(!engine.feed_pick(pick));
        assert!(engine.pick("old").is_none());
    }

    #[test]
    fn test_manual_pick_blacklisted_without_manual_origins() {
        let (mut engine, _) = make_engine(make_config());
        let st = make_stations()[0].clone();
        let pick = make_pick(&engine, "m1", &st, 0.0).with_status(PickStatus::Manual);
        assert!(!engine.feed_pick(pick));
        assert!(engine.blacklist.contains("m1"));

        let config = Config {
            use_manual_origins: true,
            ..make_config()
        };
        let (mut engine, _) = make_engine(config);
        let pick = make_pick(&engine, "m2", &st, 0.0).with_status(PickStatus::Manual);
        assert!(engine.feed_pick(pick));
        assert!(!engine.blacklist.contains("m2"));
    }

    #[test]
    fn test_init_requires_grid() {
        let sink = RecordingSink::default();
        let mut engine = Autoloc3::new(make_config(), Box::new(sink));
        assert!(engine.init().is_err());

        let (mut engine, _) = make_engine(make_config());
        assert!(engine.init().is_ok());
    }

    #[test]
    fn test_cleanup_purges_old_state() {
        let (mut engine, _) = make_engine(make_config());
        let origin = make_located_origin(&mut engine, 1);
        engine.store_origin(origin);
        assert_eq!(engine.origins().len(), 1);
        assert!(engine.pick_count() > 0);

        engine.cleanup(Some(OTIME + 10_000.0));
        assert!(engine.origins().is_empty());
        assert_eq!(engine.pick_count(), 0);
        assert!(engine.pick_origin.is_empty());
    }

    #[test]
    fn test_reset_keeps_stations() {
        let (mut engine, _) = make_engine(make_config());
        let origin = make_located_origin(&mut engine, 1);
        engine.store_origin(origin);
        engine.reset();
        assert!(engine.origins().is_empty());
        assert_eq!(engine.pick_count(), 0);
        assert_eq!(engine.station_count(), 8);
    }

    #[test]
    fn test_store_origin_tracks_defining_picks() {
        let (mut engine, _) = make_engine(make_config());
        let origin = make_located_origin(&mut engine, 7);
        let id = engine.store_origin(origin);
        assert_eq!(id, 7);
        assert_eq!(engine.origin_of_pick("p7-0"), Some(7));
        assert!(!engine.origins()[0].preliminary);
        assert!(engine.new_origins.contains(&7));
    }

    #[test]
    fn test_located_origin_is_scored() {
        let (mut engine, _) = make_engine(make_config());
        let mut origin = make_located_origin(&mut engine, 3);
        assert!(origin.arrivals.iter().all(|a| a.pick.normamp > 0.0));
        assert!(origin.score > 0.0);
        assert!(origin.arrivals.iter().all(|a| a.score > 0.0));
        assert_eq!(engine.score(&mut origin), origin.score);
    }
}
