//! Playback input: station inventory and JSONL event files
//!
//! An event file holds one JSON object per line:
//!
//! ```text
//! {"type":"pick","data":{"id":"p1","net":"GE","sta":"UGM","time":1600000000.0,"status":"Automatic"}}
//! {"type":"amplitude","data":{"pick_id":"p1","type":"snr","value":12.5}}
//! {"type":"origin","data":{"lat":-7.9,"lon":110.4,"depth":10.0,"time":1599999990.0,"arrivals":[]}}
//! ```
//!
//! [`run_playback`] feeds events from a channel into a shared engine and
//! runs the periodic publication and cleanup on a timer.

use crate::engine::Autoloc3;
use crate::error::{AutolocError, Result};
use crate::model::{Amplitude, Arrival, DepthType, Exclusion, Origin, Pick, Station};
use serde::Deserialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

/// Parse a station inventory: `NET STA lat lon elevation` per line
pub fn parse_inventory(text: &str) -> Result<Vec<Station>> {
    let mut stations = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            return Err(AutolocError::Inventory(format!(
                "line {}: expected 'NET STA lat lon elevation', got '{}'",
                lineno + 1,
                line
            )));
        }
        let number = |i: usize| {
            fields[i].parse::<f64>().map_err(|e| {
                AutolocError::Inventory(format!("line {}: bad number '{}': {}", lineno + 1, fields[i], e))
            })
        };
        stations.push(Station::new(fields[0], fields[1], number(2)?, number(3)?, number(4)?));
    }
    Ok(stations)
}

pub fn read_inventory<P: AsRef<Path>>(path: P) -> Result<Vec<Station>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| AutolocError::Inventory(format!("cannot read {}: {}", path.display(), e)))?;
    let stations = parse_inventory(&text)?;
    log::info!("read {} stations from {}", stations.len(), path.display());
    Ok(stations)
}

fn default_phase() -> String {
    "P".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArrivalEvent {
    pub pick: Pick,
    #[serde(default = "default_phase")]
    pub phase: String,
    #[serde(default)]
    pub residual: f64,
    #[serde(default)]
    pub excluded: bool,
}

/// Manual or imported origin as found in an event file
#[derive(Debug, Clone, Deserialize)]
pub struct OriginEvent {
    pub lat: f64,
    pub lon: f64,
    pub depth: f64,
    pub time: f64,
    #[serde(default)]
    pub depth_fixed: bool,
    #[serde(default)]
    pub imported: bool,
    #[serde(default)]
    pub arrivals: Vec<ArrivalEvent>,
}

impl OriginEvent {
    pub fn into_origin(self) -> Origin {
        let mut origin = Origin::new(0, self.lat, self.lon, self.depth, self.time);
        origin.imported = self.imported;
        if self.depth_fixed {
            origin.depth_type = DepthType::DepthManuallyFixed;
        }
        for arr in self.arrivals {
            let mut arrival = Arrival::new(Arc::new(arr.pick), &arr.phase, arr.residual);
            if arr.excluded {
                arrival.excluded = Exclusion::ManuallyExcluded;
            }
            origin.add(arrival);
        }
        origin
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum PlaybackEvent {
    Pick(Pick),
    Amplitude(Amplitude),
    Origin(OriginEvent),
}

impl PlaybackEvent {
    pub fn parse(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// Feed the event to the engine. Returns whether it changed anything.
    pub fn apply(self, engine: &mut Autoloc3) -> bool {
        match self {
            PlaybackEvent::Pick(pick) => engine.feed_pick(pick),
            PlaybackEvent::Amplitude(amplitude) => engine.feed_amplitude(amplitude),
            PlaybackEvent::Origin(origin) => engine.feed_origin(origin.into_origin()),
        }
    }
}

/// Counters of one playback run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackStats {
    pub events: u64,
    pub accepted: u64,
    pub timer_flushes: u64,
}

/// Read an event file line by line and send the events down `tx`.
/// Malformed lines are logged and skipped. Returns the number of events sent.
pub async fn read_events<P: AsRef<Path>>(path: P, tx: mpsc::Sender<PlaybackEvent>) -> Result<u64> {
    let file = tokio::fs::File::open(path.as_ref()).await?;
    let mut lines = BufReader::new(file).lines();
    let mut sent = 0u64;
    let mut lineno = 0usize;

    while let Some(line) = lines.next_line().await? {
        lineno += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match PlaybackEvent::parse(line) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    log::warn!("playback receiver closed after {} events", sent);
                    break;
                }
                sent += 1;
            }
            Err(e) => log::warn!("line {}: skipping malformed event: {}", lineno, e),
        }
    }
    Ok(sent)
}

fn lock(engine: &Mutex<Autoloc3>) -> MutexGuard<'_, Autoloc3> {
    match engine.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Consume events until the channel closes.
///
/// Each event is fed under one lock acquisition. The wakeup timer publishes
/// origins whose rate-limit delay expired and runs the periodic cleanup.
pub async fn run_playback(
    mut rx: mpsc::Receiver<PlaybackEvent>,
    engine: Arc<Mutex<Autoloc3>>,
    wakeup_secs: f64,
) -> PlaybackStats {
    log::info!("🚀 Starting playback (wakeup interval {:.1}s)", wakeup_secs);

    let mut stats = PlaybackStats::default();
    let mut timer = interval(Duration::from_secs_f64(wakeup_secs.max(0.1)));
    let mut last_log_time = std::time::Instant::now();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                stats.events += 1;
                if event.apply(&mut lock(&engine)) {
                    stats.accepted += 1;
                }

                if last_log_time.elapsed().as_secs() >= 10 {
                    log::info!("📊 Playback: {} events, {} accepted", stats.events, stats.accepted);
                    last_log_time = std::time::Instant::now();
                }
            }

            _ = timer.tick() => {
                let mut guard = lock(&engine);
                guard.flush();
                guard.cleanup(None);
                stats.timer_flushes += 1;
            }
        }
    }

    log::info!(
        "playback finished: {} events, {} accepted",
        stats.events,
        stats.accepted
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PickStatus;

    #[test]
    fn test_parse_inventory() {
        let text = "# net sta lat lon elev\nGE UGM -7.91 110.52 350\n\nXX  A1  45.0  10.0  0\n";
        let stations = parse_inventory(text).unwrap();
        assert_eq!(stations.len(), 2);
        assert_eq!(stations[0].key(), "GE.UGM");
        assert!((stations[0].lat + 7.91).abs() < 1e-9);
        assert_eq!(stations[1].code, "A1");
    }

    #[test]
    fn test_parse_inventory_rejects_bad_lines() {
        assert!(matches!(
            parse_inventory("GE UGM -7.91"),
            Err(AutolocError::Inventory(_))
        ));
        assert!(matches!(
            parse_inventory("GE UGM north 110 0"),
            Err(AutolocError::Inventory(_))
        ));
    }

    #[test]
    fn test_parse_events() {
        let pick = PlaybackEvent::parse(
            r#"{"type":"pick","data":{"id":"p1","net":"GE","sta":"UGM","time":100.5,"status":"Automatic","snr":7.0}}"#,
        )
        .unwrap();
        match pick {
            PlaybackEvent::Pick(p) => {
                assert_eq!(p.id, "p1");
                assert_eq!(p.status, PickStatus::Automatic);
                assert_eq!(p.snr, 7.0);
                assert!(p.station.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }

        let amp = PlaybackEvent::parse(
            r#"{"type":"amplitude","data":{"pick_id":"p1","type":"mb","value":3200.0,"period":0.8}}"#,
        )
        .unwrap();
        assert!(matches!(amp, PlaybackEvent::Amplitude(ref a) if a.kind == "mb"));

        assert!(PlaybackEvent::parse(r#"{"type":"magnitude","data":{}}"#).is_err());
    }

    #[test]
    fn test_origin_event_conversion() {
        let event = PlaybackEvent::parse(
            r#"{"type":"origin","data":{"lat":1.0,"lon":2.0,"depth":33.0,"time":500.0,"depth_fixed":true,
                "arrivals":[{"pick":{"id":"m1","net":"XX","sta":"A","time":510.0,"status":"Manual"},"phase":"P"},
                            {"pick":{"id":"m2","net":"XX","sta":"B","time":520.0,"status":"Manual"},"excluded":true}]}}"#,
        )
        .unwrap();
        let PlaybackEvent::Origin(origin) = event else {
            panic!("expected origin event");
        };
        let origin = origin.into_origin();
        assert_eq!(origin.depth_type, DepthType::DepthManuallyFixed);
        assert_eq!(origin.arrivals.len(), 2);
        assert_eq!(origin.defining_phase_count(), 1);
        assert_eq!(origin.arrivals[1].phase, "P");
        assert!(!origin.imported);
    }
}
