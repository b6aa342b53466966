//! JSONL origin writer - one line per published origin version

use super::ReportSink;
use crate::model::{time2str, Arrival, DepthType, Exclusion, Origin, OriginId};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArrivalRecord {
    pub pick_id: String,
    pub station: String,
    pub phase: String,
    pub distance: f64,
    pub azimuth: f64,
    pub residual: f64,
    pub score: f64,
    pub excluded: Exclusion,
}

impl From<&Arrival> for ArrivalRecord {
    fn from(arr: &Arrival) -> Self {
        Self {
            pick_id: arr.pick.id.clone(),
            station: arr.pick.station_key(),
            phase: arr.phase.clone(),
            distance: arr.distance,
            azimuth: arr.azimuth,
            residual: arr.residual,
            score: arr.score,
            excluded: arr.excluded,
        }
    }
}

/// Serialized form of a published origin
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OriginRecord {
    pub id: OriginId,
    pub time: String,
    pub epoch: f64,
    pub lat: f64,
    pub lon: f64,
    pub depth: f64,
    pub depth_fixed: bool,
    pub score: f64,
    pub rms: f64,
    pub defining_phase_count: usize,
    pub azi_gap_secondary: f64,
    pub preliminary: bool,
    pub arrivals: Vec<ArrivalRecord>,
    /// Publication time
    pub published: f64,
}

impl OriginRecord {
    /// Build a record. Without `all_phases` only defining arrivals and
    /// unused phases are included.
    pub fn from_origin(origin: &Origin, all_phases: bool) -> Self {
        let arrivals = origin
            .arrivals
            .iter()
            .filter(|a| all_phases || a.is_defining() || a.excluded == Exclusion::UnusedPhase)
            .map(ArrivalRecord::from)
            .collect();

        Self {
            id: origin.id,
            time: time2str(origin.time),
            epoch: origin.time,
            lat: origin.lat,
            lon: origin.lon,
            depth: origin.dep,
            depth_fixed: matches!(
                origin.depth_type,
                DepthType::DepthDefault | DepthType::DepthManuallyFixed
            ),
            score: origin.score,
            rms: origin.rms(),
            defining_phase_count: origin.defining_phase_count(),
            azi_gap_secondary: origin.quality.azi_gap_secondary,
            preliminary: origin.preliminary,
            arrivals,
            published: origin.timestamp,
        }
    }
}

pub struct JsonlOriginWriter {
    writer: BufWriter<File>,
    report_all_phases: bool,
    written: usize,
}

impl JsonlOriginWriter {
    /// Open `path` for appending
    pub fn new<P: AsRef<Path>>(path: P, report_all_phases: bool) -> std::io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        log::info!("📝 Writing origins to: {}", path.display());

        Ok(Self {
            writer: BufWriter::new(file),
            report_all_phases,
            written: 0,
        })
    }

    pub fn write_origin(&mut self, origin: &Origin) -> std::io::Result<()> {
        let record = OriginRecord::from_origin(origin, self.report_all_phases);
        let json = serde_json::to_string(&record)?;
        writeln!(self.writer, "{}", json)?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl Drop for JsonlOriginWriter {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

impl ReportSink for JsonlOriginWriter {
    fn report(&mut self, origin: &Origin) -> bool {
        match self.write_origin(origin) {
            Ok(()) => true,
            Err(e) => {
                log::error!("failed to write origin {}: {}", origin.id, e);
                false
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    fn sink_type(&self) -> &'static str {
        "JSONL"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Pick;
    use std::sync::Arc;

    fn make_origin() -> Origin {
        let mut origin = Origin::new(3, 45.0, 10.0, 10.0, 1_600_000_000.0);
        for (i, excluded) in [
            Exclusion::NotExcluded,
            Exclusion::LargeResidual,
            Exclusion::UnusedPhase,
        ]
        .into_iter()
        .enumerate()
        {
            let pick = Pick::new(&format!("p{}", i), "XX", &format!("S{}", i), 1_600_000_030.0);
            let mut arr = Arrival::new(Arc::new(pick), "P", 0.5);
            arr.excluded = excluded;
            origin.arrivals.push(arr);
        }
        origin
    }

    #[test]
    fn test_record_filters_excluded_arrivals() {
        let origin = make_origin();
        let record = OriginRecord::from_origin(&origin, false);
        let ids: Vec<&str> = record.arrivals.iter().map(|a| a.pick_id.as_str()).collect();
        assert_eq!(ids, vec!["p0", "p2"]);
        assert_eq!(record.defining_phase_count, 1);
        assert_eq!(record.time, "2020-09-13 12:26:40.0");

        let record = OriginRecord::from_origin(&origin, true);
        assert_eq!(record.arrivals.len(), 3);
    }

    #[test]
    fn test_writer_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("origins.jsonl");
        {
            let mut writer = JsonlOriginWriter::new(&path, false).unwrap();
            assert!(writer.report(&make_origin()));
            assert!(writer.report(&make_origin()));
            assert_eq!(writer.written(), 2);
        }
        {
            let mut writer = JsonlOriginWriter::new(&path, true).unwrap();
            assert!(writer.report(&make_origin()));
            writer.flush().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let records: Vec<OriginRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].arrivals.len(), 2);
        assert_eq!(records[2].arrivals.len(), 3);
        assert_eq!(records[2].id, 3);
    }
}
