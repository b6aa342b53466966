//! Playback from files: inventory, grid, event stream and JSONL output

use autoloc::geo::{delazi, project};
use autoloc::playback::{read_events, read_inventory, run_playback, PlaybackEvent};
use autoloc::report::{JsonlOriginWriter, OriginRecord};
use autoloc::traveltime::{travel_time_p, TabulatedTravelTimes};
use autoloc::{Autoloc3, AutolocError, Config};
use serde_json::json;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, NamedTempFile};
use tokio::sync::mpsc;

const LAT: f64 = 38.0;
const LON: f64 = 23.5;
const OTIME: f64 = 1_650_000_000.0;

fn write_file(dir: &Path, name: &str, content: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path.to_string_lossy().to_string()
}

fn make_inventory() -> String {
    let mut text = String::from("# NET STA lat lon elevation\n");
    for i in 0..8 {
        let (lat, lon) = project(LAT, LON, 0.5 + 0.1 * i as f64, i as f64 * 45.0 + 5.0);
        text.push_str(&format!("HL S{} {:.5} {:.5} 120\n", i, lat, lon));
    }
    text
}

fn make_grid() -> String {
    let mut text = String::from("# lat lon dep radius maxdist nmin\n");
    for dlat in [-0.5, 0.0, 0.5] {
        for dlon in [-0.5, 0.0, 0.5] {
            text.push_str(&format!("{} {} 10 4 180 6\n", LAT + dlat, LON + dlon));
        }
    }
    text
}

/// Pick events first without amplitudes, then one SNR and one absolute
/// amplitude event per pick
fn make_events(inventory: &str) -> String {
    let ttt = TabulatedTravelTimes::new();
    let mut lines = Vec::new();
    let mut amplitudes = Vec::new();
    for line in inventory.lines().filter(|l| !l.starts_with('#')) {
        let f: Vec<&str> = line.split_whitespace().collect();
        let (lat, lon): (f64, f64) = (f[2].parse().unwrap(), f[3].parse().unwrap());
        let (delta, _, _) = delazi(LAT, LON, lat, lon);
        let tt = travel_time_p(&ttt, delta, 10.0).unwrap();
        let id = format!("pick-{}", f[1]);
        lines.push(json!({
            "type": "pick",
            "data": {"id": id, "net": f[0], "sta": f[1], "cha": "HHZ",
                     "time": OTIME + tt.time, "status": "Automatic"}
        }));
        amplitudes.push(json!({"type": "amplitude", "data": {"pick_id": id, "type": "snr", "value": 15.0}}));
        amplitudes.push(json!({"type": "amplitude", "data": {"pick_id": id, "type": "mb", "value": 2500.0, "period": 1.0}}));
    }
    lines.extend(amplitudes);
    let mut text: String = lines.iter().map(|l| format!("{}\n", l)).collect();
    text.push_str("this is not json\n");
    text
}

#[test]
fn test_read_inventory_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{}", make_inventory()).unwrap();
    let stations = read_inventory(file.path()).unwrap();
    assert_eq!(stations.len(), 8);
    assert_eq!(stations[3].key(), "HL.S3");
    assert_eq!(stations[3].alt, 120.0);
}

#[test]
fn test_missing_inventory_is_an_error() {
    let dir = tempdir().unwrap();
    let result = read_inventory(dir.path().join("nope.txt"));
    assert!(matches!(result, Err(AutolocError::Inventory(_))));
}

#[test]
fn test_init_fails_without_grid() {
    let dir = tempdir().unwrap();
    let config = Config {
        grid_file: Some(dir.path().join("missing.grid").to_string_lossy().to_string()),
        ..Config::default()
    };
    let sink = JsonlOriginWriter::new(dir.path().join("out.jsonl"), false).unwrap();
    let mut engine = Autoloc3::new(config, Box::new(sink));
    assert!(matches!(engine.init(), Err(AutolocError::GridFile(_))));
}

#[tokio::test]
async fn test_read_events_skips_malformed_lines() {
    let dir = tempdir().unwrap();
    let inventory = make_inventory();
    let events = write_file(dir.path(), "events.jsonl", &make_events(&inventory));

    let (tx, mut rx) = mpsc::channel::<PlaybackEvent>(100);
    let sent = read_events(&events, tx).await.unwrap();
    assert_eq!(sent, 24);

    let mut picks = 0;
    while let Some(event) = rx.recv().await {
        if matches!(event, PlaybackEvent::Pick(_)) {
            picks += 1;
        }
    }
    assert_eq!(picks, 8);
}

#[tokio::test]
async fn test_playback_publishes_origin_to_jsonl() {
    let dir = tempdir().unwrap();
    let inventory = make_inventory();
    let inventory_path = write_file(dir.path(), "inventory.txt", &inventory);
    let grid_path = write_file(dir.path(), "grid.conf", &make_grid());
    let events_path = write_file(dir.path(), "events.jsonl", &make_events(&inventory));
    let output = dir.path().join("origins.jsonl");
    let pick_log = dir.path().join("picks").to_string_lossy().to_string();

    let config = Config {
        playback: true,
        grid_file: Some(grid_path),
        pick_log_file: Some(pick_log.clone()),
        ..Config::default()
    };
    let sink = JsonlOriginWriter::new(&output, false).unwrap();
    let mut engine = Autoloc3::new(config, Box::new(sink));
    engine.init().unwrap();
    assert_eq!(engine.set_stations(read_inventory(&inventory_path).unwrap()), 8);

    let engine = Arc::new(Mutex::new(engine));
    let (tx, rx) = mpsc::channel::<PlaybackEvent>(100);
    let reader = tokio::spawn(async move { read_events(&events_path, tx).await });
    let stats = run_playback(rx, engine.clone(), 5.0).await;
    assert_eq!(reader.await.unwrap().unwrap(), 24);
    assert_eq!(stats.events, 24);
    assert!(stats.accepted >= 1);

    let origin = {
        let mut guard = engine.lock().unwrap();
        assert_eq!(guard.origins().len(), 1);
        let origin = guard.origins()[0].clone();
        guard.shutdown();
        origin
    };
    assert!((origin.lat - LAT).abs() < 0.2);
    assert!((origin.lon - LON).abs() < 0.2);

    let content = std::fs::read_to_string(&output).unwrap();
    let records: Vec<OriginRecord> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert!(!records.is_empty());
    assert!(records.iter().all(|r| r.id == origin.id));
    assert!(records[0].defining_phase_count >= 6);

    // every processed pick went to the daily pick log
    let logs: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("picks."))
        .collect();
    assert_eq!(logs.len(), 1);
    let logged = std::fs::read_to_string(logs[0].path()).unwrap();
    assert!(logged.lines().count() >= 8);
}
