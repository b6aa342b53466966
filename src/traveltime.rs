//! Travel-time oracle
//!
//! The engine only needs a list of phase arrivals for a given epicentral
//! distance and source depth. [`TravelTimeTable`] is that seam; production
//! deployments plug in a full earth-model table. [`TabulatedTravelTimes`] is a
//! coarse layered-earth approximation good enough for playback and tests.

use crate::geo::KM_PER_DEG;

/// One phase arrival predicted by a travel-time table
#[derive(Debug, Clone, PartialEq)]
pub struct TravelTime {
    pub phase: String,
    /// Travel time in seconds
    pub time: f64,
    /// Horizontal slowness, seconds per degree
    pub dtdd: f64,
    /// Depth derivative, seconds per km
    pub dtdh: f64,
}

/// Source of predicted phase arrivals
pub trait TravelTimeTable: Send + Sync {
    /// All phases at `delta` degrees for a source at `depth` km, sorted by time
    fn compute(&self, delta: f64, depth: f64) -> Vec<TravelTime>;

    /// Name for logging
    fn model_name(&self) -> &str {
        "unknown"
    }
}

/// First P-type arrival.
///
/// Below 114° this is simply the first arrival. Beyond, the direct P and
/// Pdiff branches are skipped in favour of the first PK* core phase.
pub fn travel_time_p(ttt: &dyn TravelTimeTable, delta: f64, depth: f64) -> Option<TravelTime> {
    ttt.compute(delta, depth)
        .into_iter()
        .find(|tt| delta < 114.0 || tt.phase.starts_with("PK"))
}

/// First arrival whose phase name starts with `prefix`
pub fn travel_time_prefix(
    ttt: &dyn TravelTimeTable,
    delta: f64,
    depth: f64,
    prefix: &str,
) -> Option<TravelTime> {
    ttt.compute(delta, depth)
        .into_iter()
        .find(|tt| tt.phase.starts_with(prefix))
}

/// Surface-focus P times (degrees, seconds) for the teleseismic mantle branch
const P_TABLE: &[(f64, f64)] = &[
    (10.0, 146.0),
    (15.0, 211.0),
    (20.0, 277.0),
    (25.0, 327.0),
    (30.0, 372.0),
    (35.0, 415.0),
    (40.0, 456.0),
    (45.0, 494.0),
    (50.0, 531.0),
    (55.0, 566.0),
    (60.0, 599.0),
    (65.0, 631.0),
    (70.0, 661.0),
    (75.0, 690.0),
    (80.0, 717.0),
    (85.0, 743.0),
    (90.0, 768.0),
    (95.0, 792.0),
    (100.0, 815.0),
];

const PKPDF_TABLE: &[(f64, f64)] = &[
    (110.0, 1112.0),
    (120.0, 1130.0),
    (130.0, 1149.0),
    (140.0, 1166.0),
    (150.0, 1180.0),
    (160.0, 1192.0),
    (170.0, 1200.0),
    (180.0, 1203.0),
];

const PKPAB_TABLE: &[(f64, f64)] = &[
    (145.0, 1180.0),
    (150.0, 1192.0),
    (160.0, 1218.0),
    (170.0, 1240.0),
    (180.0, 1250.0),
];

const PDIFF_SLOWNESS: f64 = 4.44;

/// Linear interpolation returning (value, slope)
fn interp(table: &[(f64, f64)], x: f64) -> Option<(f64, f64)> {
    let first = table.first()?;
    let last = table.last()?;
    if x < first.0 || x > last.0 {
        return None;
    }
    for w in table.windows(2) {
        let (x0, y0) = w[0];
        let (x1, y1) = w[1];
        if x >= x0 && x <= x1 {
            let slope = (y1 - y0) / (x1 - x0);
            return Some((y0 + slope * (x - x0), slope));
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Branch {
    Pg,
    Pn,
    P,
    Pdiff,
    PKPdf,
    PKPab,
    PKiKP,
    PcP,
    ScP,
    PP,
    S,
    SKP,
    PKKP,
    SKKP,
    DepthP,
    DepthS,
}

impl Branch {
    const ALL: [Branch; 16] = [
        Branch::Pg,
        Branch::Pn,
        Branch::P,
        Branch::Pdiff,
        Branch::PKPdf,
        Branch::PKPab,
        Branch::PKiKP,
        Branch::PcP,
        Branch::ScP,
        Branch::PP,
        Branch::S,
        Branch::SKP,
        Branch::PKKP,
        Branch::SKKP,
        Branch::DepthP,
        Branch::DepthS,
    ];

    fn name(self) -> &'static str {
        match self {
            Branch::Pg => "Pg",
            Branch::Pn => "Pn",
            Branch::P => "P",
            Branch::Pdiff => "Pdiff",
            Branch::PKPdf => "PKPdf",
            Branch::PKPab => "PKPab",
            Branch::PKiKP => "PKiKP",
            Branch::PcP => "PcP",
            Branch::ScP => "ScP",
            Branch::PP => "PP",
            Branch::S => "S",
            Branch::SKP => "SKP",
            Branch::PKKP => "PKKP",
            Branch::SKKP => "SKKP",
            Branch::DepthP => "pP",
            Branch::DepthS => "sP",
        }
    }
}

/// Coarse spherically symmetric travel-time model.
///
/// Crustal phases are computed for a single layer over a half space;
/// teleseismic branches are interpolated from surface-focus tables and
/// corrected for source depth with the vertical slowness of the upper layer.
#[derive(Debug, Clone)]
pub struct TabulatedTravelTimes {
    pub crust_vp: f64,
    pub crust_vs: f64,
    pub mantle_vp: f64,
    pub moho_depth: f64,
}

impl Default for TabulatedTravelTimes {
    fn default() -> Self {
        Self {
            crust_vp: 6.0,
            crust_vs: 3.5,
            mantle_vp: 8.0,
            moho_depth: 35.0,
        }
    }
}

impl TabulatedTravelTimes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vertical slowness (s/km) for horizontal slowness `p` (s/deg)
    fn eta(&self, v: f64, p: f64) -> f64 {
        let p_km = p / KM_PER_DEG;
        (1.0 / (v * v) - p_km * p_km).max(0.0).sqrt()
    }

    /// Surface time and slowness corrected to source depth
    fn deepen(&self, surface: Option<(f64, f64)>, depth: f64) -> Option<f64> {
        let (t, p) = surface?;
        Some(t - depth * self.eta(self.crust_vp, p))
    }

    fn pn_intercept(&self) -> f64 {
        let k = self.eta(self.crust_vp, KM_PER_DEG / self.mantle_vp);
        2.0 * self.moho_depth * k
    }

    fn mantle_p(&self, delta: f64) -> Option<(f64, f64)> {
        interp(P_TABLE, delta)
    }

    fn time(&self, branch: Branch, delta: f64, depth: f64) -> Option<f64> {
        let x = delta * KM_PER_DEG;
        match branch {
            Branch::Pg => {
                if delta > 15.0 || depth > self.moho_depth {
                    return None;
                }
                Some((x * x + depth * depth).sqrt() / self.crust_vp)
            }
            Branch::Pn => {
                if delta > 20.0 {
                    return None;
                }
                let k = self.eta(self.crust_vp, KM_PER_DEG / self.mantle_vp);
                if depth <= self.moho_depth {
                    Some(x / self.mantle_vp + self.pn_intercept() - depth * k)
                } else {
                    let dz = depth - self.moho_depth;
                    Some((x * x + dz * dz).sqrt() / self.mantle_vp + self.moho_depth * k)
                }
            }
            Branch::P => self.deepen(self.mantle_p(delta), depth),
            Branch::Pdiff => {
                if delta <= 100.0 || delta > 150.0 {
                    return None;
                }
                let t0 = 815.0 + PDIFF_SLOWNESS * (delta - 100.0);
                self.deepen(Some((t0, PDIFF_SLOWNESS)), depth)
            }
            Branch::PKPdf => self.deepen(interp(PKPDF_TABLE, delta), depth),
            Branch::PKPab => self.deepen(interp(PKPAB_TABLE, delta), depth),
            Branch::PKiKP => {
                if delta > 113.0 {
                    return None;
                }
                self.deepen(Some((996.0 + 0.0095 * delta * delta, 0.019 * delta)), depth)
            }
            Branch::PcP => {
                if delta > 95.0 {
                    return None;
                }
                let t0 = (511.0f64.powi(2) + (7.1 * delta).powi(2)).sqrt();
                self.deepen(Some((t0, 7.1 * 7.1 * delta / t0)), depth)
            }
            Branch::ScP => {
                let pcp = self.time(Branch::PcP, delta, 0.0)?;
                let p = 1.4 * 7.1 * 7.1 * delta / pcp;
                Some(1.4 * pcp - depth * self.eta(self.crust_vs, p))
            }
            Branch::PP => {
                if delta < 20.0 {
                    return None;
                }
                let (t, p) = self.mantle_p(delta / 2.0)?;
                self.deepen(Some((2.0 * t, p)), depth)
            }
            Branch::S => {
                if delta < 10.0 {
                    return None;
                }
                let (t, p) = self.mantle_p(delta)?;
                Some(1.8 * t - depth * self.eta(self.crust_vs, 1.8 * p))
            }
            Branch::SKP => {
                if !(120.0..=150.0).contains(&delta) {
                    return None;
                }
                Some(self.time(Branch::PKPdf, delta, depth)? + 220.0)
            }
            Branch::PKKP => {
                if !(80.0..=130.0).contains(&delta) {
                    return None;
                }
                self.deepen(Some((1850.0 - 1.5 * (delta - 80.0), 1.5)), depth)
            }
            Branch::SKKP => Some(self.time(Branch::PKKP, delta, depth)? + 240.0),
            Branch::DepthP | Branch::DepthS => {
                if depth <= 0.0 || delta < 10.0 {
                    return None;
                }
                let (_, p) = self.mantle_p(delta)?;
                let direct = self.time(Branch::P, delta, depth)?;
                let up_p = depth * self.eta(self.crust_vp, p);
                if branch == Branch::DepthP {
                    Some(direct + 2.0 * up_p)
                } else {
                    Some(direct + up_p + depth * self.eta(self.crust_vs, p))
                }
            }
        }
    }
}

/// Numerical derivative, central where possible, one-sided at branch ends
fn derivative<F: Fn(f64) -> Option<f64>>(f: F, x: f64, h: f64) -> f64 {
    let lo = (x - h).max(0.0);
    match (f(x + h), f(lo), f(x)) {
        (Some(t1), Some(t0), _) if x + h > lo => (t1 - t0) / (x + h - lo),
        (Some(t1), None, Some(t)) => (t1 - t) / h,
        (None, Some(t0), Some(t)) if x > lo => (t - t0) / (x - lo),
        _ => 0.0,
    }
}

impl TravelTimeTable for TabulatedTravelTimes {
    fn compute(&self, delta: f64, depth: f64) -> Vec<TravelTime> {
        let depth = depth.max(0.0);
        let mut list: Vec<TravelTime> = Branch::ALL
            .iter()
            .filter_map(|&branch| {
                let time = self.time(branch, delta, depth)?;
                let dtdd = derivative(|d| self.time(branch, d, depth), delta, 0.05);
                let dtdh = derivative(|z| self.time(branch, delta, z), depth, 0.5);
                Some(TravelTime {
                    phase: branch.name().to_string(),
                    time,
                    dtdd,
                    dtdh,
                })
            })
            .collect();
        list.sort_by(|a, b| a.time.total_cmp(&b.time));
        list
    }

    fn model_name(&self) -> &str {
        "tabulated"
    }
}
