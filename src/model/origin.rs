//! Origins and origin collections

use super::arrival::{Arrival, Exclusion};
use super::pick::Pick;
use super::{time2str, Time};
use serde::Serialize;

pub type OriginId = u64;

/// How the depth of an origin was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DepthType {
    DepthFree,
    DepthPhases,
    DepthMinimum,
    DepthDefault,
    DepthManuallyFixed,
}

/// Location with symmetric uncertainties
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Hypocenter {
    pub lat: f64,
    pub lon: f64,
    pub dep: f64,
    pub laterr: f64,
    pub lonerr: f64,
    pub deperr: f64,
}

impl Hypocenter {
    pub fn new(lat: f64, lon: f64, dep: f64) -> Self {
        Self {
            lat,
            lon,
            dep,
            laterr: 0.0,
            lonerr: 0.0,
            deperr: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OriginQuality {
    pub azi_gap_primary: f64,
    pub azi_gap_secondary: f64,
    pub min_distance: f64,
    pub median_distance: f64,
    pub max_distance: f64,
}

/// Error ellipse and standard errors from the last inversion
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OriginError {
    pub sdobs: f64,
    pub conf: f64,
    pub semi_major_axis: f64,
    pub semi_minor_axis: f64,
    pub strike: f64,
    pub stime: f64,
    pub sdepth: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Origin {
    pub id: OriginId,
    pub lat: f64,
    pub lon: f64,
    pub dep: f64,
    pub laterr: f64,
    pub lonerr: f64,
    pub deperr: f64,
    pub time: Time,
    pub timeerr: f64,
    pub arrivals: Vec<Arrival>,
    pub depth_type: DepthType,
    pub score: f64,
    pub preliminary: bool,
    pub imported: bool,
    pub quality: OriginQuality,
    pub error: OriginError,
    /// Time of publication, only meaningful for sent copies
    pub timestamp: Time,
}

impl Origin {
    pub fn new(id: OriginId, lat: f64, lon: f64, dep: f64, time: Time) -> Self {
        Self {
            id,
            lat,
            lon,
            dep,
            laterr: 0.0,
            lonerr: 0.0,
            deperr: 0.0,
            time,
            timeerr: 0.0,
            arrivals: Vec::new(),
            depth_type: DepthType::DepthFree,
            score: 0.0,
            preliminary: false,
            imported: false,
            quality: OriginQuality::default(),
            error: OriginError::default(),
            timestamp: 0.0,
        }
    }

    pub fn at(id: OriginId, hypocenter: &Hypocenter, time: Time) -> Self {
        let mut origin = Self::new(id, hypocenter.lat, hypocenter.lon, hypocenter.dep, time);
        origin.laterr = hypocenter.laterr;
        origin.lonerr = hypocenter.lonerr;
        origin.deperr = hypocenter.deperr;
        origin
    }

    pub fn hypocenter(&self) -> Hypocenter {
        Hypocenter {
            lat: self.lat,
            lon: self.lon,
            dep: self.dep,
            laterr: self.laterr,
            lonerr: self.lonerr,
            deperr: self.deperr,
        }
    }

    /// Root-mean-square residual of the defining arrivals
    pub fn rms(&self) -> f64 {
        let (sum, n) = self
            .arrivals
            .iter()
            .filter(|a| a.is_defining())
            .fold((0.0, 0usize), |(s, n), a| (s + a.residual * a.residual, n + 1));
        if n == 0 {
            return 0.0;
        }
        (sum / n as f64).sqrt()
    }

    pub fn defining_phase_count(&self) -> usize {
        self.defining_phase_count_in(0.0, 180.0)
    }

    /// Defining arrivals with distance within `[dmin, dmax]`
    pub fn defining_phase_count_in(&self, dmin: f64, dmax: f64) -> usize {
        self.arrivals
            .iter()
            .filter(|a| a.is_defining() && a.distance >= dmin && a.distance <= dmax)
            .count()
    }

    pub fn phase_count(&self) -> usize {
        self.phase_count_in(0.0, 180.0)
    }

    /// Like the defining count, but also accepting unused PKP arrivals
    pub fn phase_count_in(&self, dmin: f64, dmax: f64) -> usize {
        self.arrivals
            .iter()
            .filter(|a| a.distance >= dmin && a.distance <= dmax)
            .filter(|a| {
                a.is_defining()
                    || (a.excluded == Exclusion::UnusedPhase && a.phase.starts_with("PKP"))
            })
            .count()
    }

    /// Number of defining depth phases (pP, sP)
    pub fn depth_phase_count(&self) -> usize {
        self.arrivals
            .iter()
            .filter(|a| a.is_defining() && (a.phase == "pP" || a.phase == "sP"))
            .count()
    }

    /// Index of the arrival referencing `pick`
    pub fn find_arrival(&self, pick: &Pick) -> Option<usize> {
        self.find_arrival_by_id(&pick.id)
    }

    pub fn find_arrival_by_id(&self, pick_id: &str) -> Option<usize> {
        self.arrivals.iter().position(|a| a.pick.id == pick_id)
    }

    /// Add an arrival unless its pick is already present
    pub fn add(&mut self, arrival: Arrival) -> bool {
        if self.find_arrival(&arrival.pick).is_some() {
            log::debug!(
                "origin {}: pick {} already associated, arrival not added",
                self.id,
                arrival.pick.id
            );
            return false;
        }
        self.arrivals.push(arrival);
        true
    }

    /// Canonical order: distance, then pick time
    pub fn sort_arrivals(&mut self) {
        self.arrivals.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.pick.time.total_cmp(&b.pick.time))
        });
    }

    /// Graft the solution of `other` (usually a relocated copy) onto this
    /// origin, keeping identity and status flags.
    pub fn update_from(&mut self, other: &Origin) {
        self.lat = other.lat;
        self.lon = other.lon;
        self.dep = other.dep;
        self.laterr = other.laterr;
        self.lonerr = other.lonerr;
        self.deperr = other.deperr;
        self.time = other.time;
        self.timeerr = other.timeerr;
        self.arrivals = other.arrivals.clone();
        self.depth_type = other.depth_type;
        self.score = other.score;
        self.quality = other.quality;
        self.error = other.error;
    }

    /// Picks shared with `other`
    pub fn common_pick_count(&self, other: &Origin) -> usize {
        self.arrivals
            .iter()
            .filter(|a| other.find_arrival(&a.pick).is_some())
            .count()
    }

    /// Compact one-line summary for logs
    pub fn oneliner(&self) -> String {
        format!(
            "{:>6} {} {:7.3} {:8.3} {:5.0}{} {:3}/{:3} {:6.1} {:5.2}",
            self.id,
            time2str(self.time),
            self.lat,
            self.lon,
            self.dep,
            match self.depth_type {
                DepthType::DepthDefault | DepthType::DepthManuallyFixed => 'f',
                DepthType::DepthMinimum => 'm',
                DepthType::DepthPhases => 'p',
                DepthType::DepthFree => ' ',
            },
            self.defining_phase_count(),
            self.arrivals.len(),
            self.score,
            self.rms()
        )
    }
}

/// Scratch copy of an origin for a tentative change.
///
/// Heuristics mutate or relocate the scratch copy; `commit` grafts the
/// result back onto the target via [`Origin::update_from`], dropping the
/// trial discards it.
#[derive(Debug, Clone)]
pub struct Trial {
    scratch: Origin,
}

impl Trial {
    pub fn of(origin: &Origin) -> Self {
        Self {
            scratch: origin.clone(),
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.scratch
    }

    pub fn origin_mut(&mut self) -> &mut Origin {
        &mut self.scratch
    }

    /// Adopt a relocated solution as the new scratch state
    pub fn adopt(&mut self, relocated: &Origin) {
        self.scratch.update_from(relocated);
    }

    pub fn commit(self, target: &mut Origin) {
        target.update_from(&self.scratch);
    }

    pub fn into_origin(self) -> Origin {
        self.scratch
    }
}

/// Strictly increasing origin ids for one engine instance
#[derive(Debug, Default)]
pub struct OriginIdGenerator {
    last: OriginId,
}

impl OriginIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> OriginId {
        self.last += 1;
        self.last
    }
}

/// The engine's buffer of current origins
#[derive(Debug, Clone, Default)]
pub struct OriginVector {
    origins: Vec<Origin>,
}

impl OriginVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Origin> {
        self.origins.iter()
    }

    pub fn as_slice(&self) -> &[Origin] {
        &self.origins
    }

    pub fn push(&mut self, origin: Origin) {
        self.origins.push(origin);
    }

    pub fn clear(&mut self) {
        self.origins.clear();
    }

    pub fn retain<F: FnMut(&Origin) -> bool>(&mut self, f: F) {
        self.origins.retain(f);
    }

    pub fn find(&self, id: OriginId) -> Option<&Origin> {
        self.origins.iter().find(|o| o.id == id)
    }

    pub fn find_mut(&mut self, id: OriginId) -> Option<&mut Origin> {
        self.origins.iter_mut().find(|o| o.id == id)
    }

    /// Highest-scoring other origin sharing at least three picks with `start`
    pub fn best_equivalent_origin(&self, start: &Origin) -> Option<&Origin> {
        self.origins
            .iter()
            .filter(|o| o.id != start.id)
            .filter(|o| start.common_pick_count(o) >= 3)
            .fold(None, |best: Option<&Origin>, o| match best {
                Some(b) if b.score >= o.score => Some(b),
                _ => Some(o),
            })
    }
}

impl<'a> IntoIterator for &'a OriginVector {
    type Item = &'a Origin;
    type IntoIter = std::slice::Iter<'a, Origin>;

    fn into_iter(self) -> Self::IntoIter {
        self.origins.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn make_pick(id: &str, sta: &str, time: f64) -> Arc<Pick> {
        Arc::new(Pick::new(id, "XX", sta, time).with_amplitude(1000.0, 1.0, 10.0))
    }

    fn make_origin(id: OriginId, picks: &[&str]) -> Origin {
        let mut origin = Origin::new(id, 10.0, 20.0, 10.0, 1000.0);
        for (i, p) in picks.iter().enumerate() {
            let mut arr = Arrival::new(make_pick(p, &format!("S{}", i), 1010.0 + i as f64), "P", 0.0);
            arr.distance = 1.0 + i as f64;
            origin.add(arr);
        }
        origin
    }

    #[test]
    fn test_add_rejects_duplicate_pick() {
        let mut origin = make_origin(1, &["a", "b"]);
        let dup = Arrival::new(make_pick("a", "S9", 1011.0), "P", 0.0);

        assert!(!origin.add(dup));
        assert_eq!(origin.arrivals.len(), 2);
    }

    #[test]
    fn test_counts_and_rms() {
        let mut origin = make_origin(1, &["a", "b", "c", "d"]);
        origin.arrivals[0].residual = 3.0;
        origin.arrivals[1].residual = -4.0;
        origin.arrivals[2].excluded = Exclusion::LargeResidual;
        origin.arrivals[2].residual = 100.0;
        origin.arrivals[3].excluded = Exclusion::UnusedPhase;
        origin.arrivals[3].phase = "PKP".to_string();

        assert_eq!(origin.defining_phase_count(), 2);
        assert_eq!(origin.phase_count(), 3);
        assert_eq!(origin.defining_phase_count_in(0.0, 1.5), 1);
        assert!((origin.rms() - (12.5f64).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_update_from_keeps_identity() {
        let mut origin = make_origin(7, &["a"]);
        origin.preliminary = true;
        let mut relocated = make_origin(99, &["a", "b"]);
        relocated.lat = -5.0;
        relocated.depth_type = DepthType::DepthMinimum;

        origin.update_from(&relocated);

        assert_eq!(origin.id, 7);
        assert!(origin.preliminary);
        assert_eq!(origin.lat, -5.0);
        assert_eq!(origin.arrivals.len(), 2);
        assert_eq!(origin.depth_type, DepthType::DepthMinimum);
    }

    #[test]
    fn test_trial_commit_and_discard() {
        let mut origin = make_origin(3, &["a", "b"]);

        let mut trial = Trial::of(&origin);
        trial.origin_mut().arrivals[0].excluded = Exclusion::LargeResidual;
        drop(trial);
        assert_eq!(origin.defining_phase_count(), 2);

        let mut trial = Trial::of(&origin);
        trial.origin_mut().arrivals[0].excluded = Exclusion::LargeResidual;
        trial.commit(&mut origin);
        assert_eq!(origin.defining_phase_count(), 1);
    }

    #[test]
    fn test_origin_ids_strictly_increase() {
        let mut ids = OriginIdGenerator::new();
        let mut last = 0;
        for _ in 0..1000 {
            let id = ids.next_id();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_best_equivalent_origin() {
        let mut vector = OriginVector::new();
        let mut weak = make_origin(1, &["a", "b", "c", "x"]);
        weak.score = 10.0;
        let mut strong = make_origin(2, &["a", "b", "c", "y"]);
        strong.score = 20.0;
        let mut unrelated = make_origin(3, &["a", "q", "r", "s"]);
        unrelated.score = 50.0;
        vector.push(weak);
        vector.push(strong);
        vector.push(unrelated);

        let start = make_origin(10, &["a", "b", "c", "d"]);
        let best = vector.best_equivalent_origin(&start).unwrap();
        assert_eq!(best.id, 2);
    }

    #[test]
    fn test_sort_arrivals_by_distance_then_time() {
        let mut origin = Origin::new(1, 0.0, 0.0, 10.0, 0.0);
        let mut far = Arrival::new(make_pick("far", "A", 50.0), "P", 0.0);
        far.distance = 5.0;
        let mut near_late = Arrival::new(make_pick("nl", "B", 30.0), "P", 0.0);
        near_late.distance = 1.0;
        let mut near_early = Arrival::new(make_pick("ne", "C", 20.0), "P", 0.0);
        near_early.distance = 1.0;
        origin.add(far);
        origin.add(near_late);
        origin.add(near_early);

        origin.sort_arrivals();

        let ids: Vec<&str> = origin.arrivals.iter().map(|a| a.pick_id()).collect();
        assert_eq!(ids, vec!["ne", "nl", "far"]);
    }
}
