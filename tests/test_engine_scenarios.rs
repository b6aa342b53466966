//! End-to-end engine scenarios on a synthetic regional network

use autoloc::geo::{delazi, project};
use autoloc::model::{Arrival, Origin, Pick, PickStatus, Station};
use autoloc::nucleator::GridPoint;
use autoloc::traveltime::{travel_time_p, TabulatedTravelTimes};
use autoloc::{Autoloc3, Config, ReportSink};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};

const LAT: f64 = -20.0;
const LON: f64 = 170.0;
const OTIME: f64 = 1_600_000_000.0;

#[derive(Clone, Default)]
struct RecordingSink {
    sent: Arc<Mutex<Vec<Origin>>>,
}

impl RecordingSink {
    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl ReportSink for RecordingSink {
    fn report(&mut self, origin: &Origin) -> bool {
        self.sent.lock().unwrap().push(origin.clone());
        true
    }

    fn sink_type(&self) -> &'static str {
        "recording"
    }
}

fn make_stations() -> Vec<Station> {
    (0..8)
        .map(|i| {
            let az = i as f64 * 45.0 + 20.0;
            let delta = 0.6 + 0.1 * i as f64;
            let (lat, lon) = project(LAT, LON, delta, az);
            Station::new("NZ", &format!("T{}", i), lat, lon, 0.0)
        })
        .collect()
}

fn make_grid() -> Vec<GridPoint> {
    let mut grid = Vec::new();
    for dlat in [-0.5, 0.0, 0.5] {
        for dlon in [-0.5, 0.0, 0.5] {
            grid.push(GridPoint::new(LAT + dlat, LON + dlon, 10.0));
        }
    }
    grid
}

/// Automatic pick at the predicted P time plus `offset`
fn make_pick(id: &str, station: &Station, offset: f64) -> Pick {
    let ttt = TabulatedTravelTimes::new();
    let (delta, _, _) = delazi(LAT, LON, station.lat, station.lon);
    let tt = travel_time_p(&ttt, delta, 10.0).unwrap();
    Pick::new(id, &station.net, &station.code, OTIME + tt.time + offset)
        .with_amplitude(2000.0, 1.0, 10.0)
        .with_status(PickStatus::Automatic)
}

/// Engine on a manually advanced wall clock
fn make_engine(config: Config) -> (Autoloc3, RecordingSink, Arc<Mutex<f64>>) {
    let sink = RecordingSink::default();
    let clock = Arc::new(Mutex::new(OTIME + 300.0));
    let engine_clock = clock.clone();
    let mut engine = Autoloc3::new_with_time_fn(
        config,
        Box::new(sink.clone()),
        Box::new(move || *engine_clock.lock().unwrap()),
    );
    engine.set_grid(make_grid());
    engine.set_stations(make_stations());
    (engine, sink, clock)
}

#[test]
fn test_end_to_end_nucleation_and_publication() {
    let config = Config {
        publication_interval_time_slope: 0.5,
        publication_interval_time_intercept: 0.0,
        ..Config::default()
    };
    let (mut engine, sink, clock) = make_engine(config);
    let stations = make_stations();
    let start = *clock.lock().unwrap();

    // feed until the grid search nucleates
    let mut fed = 0;
    for (i, st) in stations.iter().enumerate() {
        engine.feed_pick(make_pick(&format!("e2e-{}", i), st, 0.0));
        fed = i + 1;
        if !engine.origins().is_empty() {
            break;
        }
    }
    assert!(fed >= 6 && fed < stations.len());
    assert_eq!(engine.origins().len(), 1);
    let id = engine.origins()[0].id;

    // a new origin goes out immediately
    assert_eq!(sink.count(), 1);
    let first = sink.sent.lock().unwrap()[0].clone();
    assert_eq!(first.id, id);
    let n = first.defining_phase_count() as f64;
    assert_eq!(engine.next_due(id), Some(start + 0.5 * n));

    // further picks improve the origin but the clock has not moved
    for (i, st) in stations.iter().enumerate().skip(fed) {
        engine.feed_pick(make_pick(&format!("e2e-{}", i), st, 0.0));
    }
    assert_eq!(engine.origins().len(), 1);
    let origin = engine.origins()[0].clone();
    assert!(origin.defining_phase_count() > first.defining_phase_count());
    assert!((origin.lat - LAT).abs() < 0.2);
    assert!((origin.lon - LON).abs() < 0.2);
    assert!((origin.time - OTIME).abs() < 2.0);
    assert_eq!(sink.count(), 1);

    // once the delay has passed the improved origin is sent exactly once
    *clock.lock().unwrap() += 60.0;
    engine.report();
    assert_eq!(sink.count(), 2);
    let second = sink.sent.lock().unwrap()[1].clone();
    assert_eq!(second.id, id);
    assert_eq!(second.defining_phase_count(), origin.defining_phase_count());

    // nothing new: no further publication
    *clock.lock().unwrap() += 60.0;
    engine.report();
    assert_eq!(sink.count(), 2);
}

#[test]
fn test_noisy_network_with_jitter() {
    let (mut engine, _sink, _clock) = make_engine(Config::default());
    let mut rng = StdRng::seed_from_u64(42);

    for (i, st) in make_stations().iter().enumerate() {
        let jitter: f64 = rng.gen_range(-0.4..0.4);
        engine.feed_pick(make_pick(&format!("noisy-{}", i), st, jitter));
    }

    assert_eq!(engine.origins().len(), 1);
    let origin = &engine.origins()[0];
    assert!(origin.defining_phase_count() >= 6);
    assert!(origin.rms() < 1.0);
    assert!((origin.lat - LAT).abs() < 0.3);
    assert!((origin.lon - LON).abs() < 0.3);
}

#[test]
fn test_isolated_picks_do_not_nucleate() {
    let (mut engine, sink, _clock) = make_engine(Config::default());
    let stations = make_stations();
    // picks spread far apart in time cannot share a source
    for (i, st) in stations.iter().take(4).enumerate() {
        engine.feed_pick(make_pick(&format!("iso-{}", i), st, i as f64 * 400.0));
    }
    assert!(engine.origins().is_empty());
    assert_eq!(sink.count(), 0);
    assert_eq!(engine.pick_count(), 4);
}

#[test]
fn test_unknown_station_pick_rejected() {
    let (mut engine, _sink, _clock) = make_engine(Config::default());
    let stranger = Station::new("ZZ", "NOPE", LAT, LON + 1.0, 0.0);
    assert!(!engine.feed_pick(make_pick("stranger", &stranger, 0.0)));
    assert!(engine.pick("stranger").is_none());
}

#[test]
fn test_late_amplitude_releases_pick() {
    let (mut engine, _sink, _clock) = make_engine(Config::default());
    let st = make_stations()[0].clone();
    let mut pick = make_pick("late-amp", &st, 0.0);
    pick.amp = 0.0;
    pick.snr = 0.0;

    assert!(!engine.feed_pick(pick));
    assert!(engine.pick("late-amp").is_some());

    let snr = autoloc::model::Amplitude {
        pick_id: "late-amp".to_string(),
        kind: "snr".to_string(),
        value: 12.0,
        period: 0.0,
    };
    engine.feed_amplitude(snr);
    assert_eq!(engine.pick("late-amp").unwrap().snr, 12.0);

    let abs = autoloc::model::Amplitude {
        pick_id: "late-amp".to_string(),
        kind: "mb".to_string(),
        value: 4321.0,
        period: 0.9,
    };
    engine.feed_amplitude(abs);
    let buffered = engine.pick("late-amp").unwrap();
    assert_eq!(buffered.amp, 4321.0);
    assert_eq!(buffered.per, 0.9);
}

#[test]
fn test_manual_origin_updates_matching_origin() {
    let (mut engine, _sink, _clock) = make_engine(Config::default());
    let stations = make_stations();
    for (i, st) in stations.iter().enumerate() {
        engine.feed_pick(make_pick(&format!("auto-{}", i), st, 0.0));
    }
    assert_eq!(engine.origins().len(), 1);
    let id = engine.origins()[0].id;

    let mut manual = Origin::new(0, LAT, LON, 10.0, OTIME);
    let pick = make_pick("manual-0", &stations[0], 0.2).with_status(PickStatus::Manual);
    manual.add(Arrival::new(Arc::new(pick), "P", 0.0));

    assert!(engine.feed_origin(manual));
    assert_eq!(engine.origins().len(), 1);
    let updated = &engine.origins()[0];
    assert_eq!(updated.id, id);
    assert!(updated.find_arrival_by_id("manual-0").is_some());
    assert!(updated.find_arrival_by_id("auto-0").is_none());
}

#[test]
fn test_imported_origin_requires_opt_in() {
    let (mut engine, _sink, _clock) = make_engine(Config::default());
    let mut imported = Origin::new(0, LAT, LON, 10.0, OTIME);
    imported.imported = true;
    assert!(!engine.feed_origin(imported.clone()));
    assert!(engine.origins().is_empty());

    let config = Config {
        use_imported_origins: true,
        ..Config::default()
    };
    let (mut engine, _sink, _clock) = make_engine(config);
    assert!(engine.feed_origin(imported));
    assert_eq!(engine.origins().len(), 1);
    assert!(engine.origins()[0].imported);
}

#[test]
fn test_reset_forgets_everything_but_stations() {
    let (mut engine, _sink, _clock) = make_engine(Config::default());
    for (i, st) in make_stations().iter().enumerate() {
        engine.feed_pick(make_pick(&format!("r{}", i), st, 0.0));
    }
    assert!(!engine.origins().is_empty());

    engine.reset();
    assert!(engine.origins().is_empty());
    assert_eq!(engine.pick_count(), 0);
    assert_eq!(engine.station_count(), 8);
}
