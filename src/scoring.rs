//! Scoring functions shared by the nucleator, associator and engine

use crate::geo::KM_PER_DEG;
use crate::model::{Exclusion, Origin};
use std::f64::consts::PI;

/// Affinity taper, `cos²(x·π/2)` on [-1, 1] and zero outside
pub fn avgfn(x: f64) -> f64 {
    if !(-1.0..=1.0).contains(&x) {
        return 0.0;
    }
    let y = (x * PI * 0.5).cos();
    y * y
}

/// Residual taper: 1 on a ±0.2 plateau, cosine taper to 0 at ±1
pub fn avgfn2(x: f64) -> f64 {
    const W: f64 = 0.2;

    if !(-1.0..=1.0).contains(&x) {
        return 0.0;
    }
    if x > -W && x < W {
        return 1.0;
    }

    let x = (x + if x > 0.0 { -W } else { W }) / (1.0 - W);
    let y = 0.5 * ((x * PI).cos() + 1.0);
    y * y
}

/// Mild preference for shallow sources
pub fn depth_factor(depth: f64) -> f64 {
    1.0 + 0.0005 * (200.0 - depth)
}

/// Score of an origin.
///
/// Sums amplitude, distance and residual factors over the defining arrivals
/// (unused PKP arrivals count at 0.3) and weights the sum by depth. The only
/// side effect is the per-arrival `score`/`ascore`/`dscore`/`tscore`
/// diagnostics. Arrivals are visited in canonical order without reordering
/// the origin.
pub fn origin_score(origin: &mut Origin, max_rms: f64, network_size_km: f64) -> f64 {
    let mut order: Vec<usize> = (0..origin.arrivals.len()).collect();
    order.sort_by(|&a, &b| {
        let (a, b) = (&origin.arrivals[a], &origin.arrivals[b]);
        a.distance
            .total_cmp(&b.distance)
            .then(a.pick.time.total_cmp(&b.pick.time))
    });

    let mut score = 0.0;
    let mut ampl_score_max = 0.0;

    for (i, &k) in order.iter().enumerate() {
        let arr = &mut origin.arrivals[k];
        let pick = arr.pick.clone();
        let Some(station) = pick.station() else {
            continue;
        };

        arr.score = 0.0;
        arr.ascore = 0.0;
        arr.dscore = 0.0;
        arr.tscore = 0.0;

        let mut snr = pick.snr.max(3.0);
        if snr > 1.0e7 {
            continue;
        }
        snr = snr.min(100.0);
        if pick.is_manual() && pick.snr <= 0.0 {
            snr = 10.0;
        }

        let mut normamp = pick.normamp;
        if pick.is_manual() && normamp <= 0.0 {
            normamp = 1.0;
        }

        let snr_score = snr.log10();

        let d = arr.distance;
        let r = if network_size_km <= 0.0 {
            station.max_nuc_dist
        } else {
            0.5 * network_size_km / KM_PER_DEG
        };
        let dist_score = 1.5 * (-d * d / (r * r)).exp();

        if normamp <= 0.0 {
            log::warn!(
                "pick {} with normamp {} amp {} skipped in scoring",
                pick.id,
                normamp,
                pick.amp
            );
            continue;
        }

        let mut ampl_score = (1.0 + 0.8 * (1.0 + 0.5 * normamp.log10())).max(1.0);

        // a sudden big amplitude far out must not dominate
        if ampl_score_max == 0.0 {
            ampl_score_max = ampl_score;
        } else {
            if i > 2 && ampl_score > ampl_score_max + 0.4 {
                ampl_score = ampl_score_max + 0.4;
            }
            if ampl_score > ampl_score_max {
                ampl_score_max = ampl_score;
            }
        }
        ampl_score *= snr_score;

        let time_score = avgfn2(arr.residual / (2.0 * max_rms));

        arr.dscore = dist_score;
        arr.ascore = ampl_score;
        arr.tscore = time_score;

        let phase_score = match arr.excluded {
            Exclusion::NotExcluded => 1.0,
            Exclusion::UnusedPhase if arr.phase.starts_with("PKP") => 0.3,
            _ => continue,
        };

        arr.score = phase_score * time_score * dist_score * ampl_score;
        score += arr.score;
    }

    score * depth_factor(origin.dep)
}
