//! Linearised least-squares hypocentre inversion

use super::LocatorError;
use crate::geo::{delazi, offset, KM_PER_DEG};
use crate::model::{Origin, OriginError};
use crate::traveltime::{travel_time_p, travel_time_prefix, TravelTime, TravelTimeTable};
use nalgebra::{DMatrix, DVector, Matrix2};

/// Black-box hypocentre inversion used by [`super::Locator`].
///
/// Implementations relocate `origin` from its defining arrivals and return a
/// copy with updated hypocentre, origin time, errors and per-arrival
/// residual, distance and azimuth. The arrival list must come back in the
/// same order.
pub trait Inversion: Send + Sync {
    fn invert(
        &self,
        origin: &Origin,
        fixed_depth: Option<f64>,
        ttt: &dyn TravelTimeTable,
    ) -> Result<Origin, LocatorError>;

    fn name(&self) -> &str;
}

/// Predicted arrival for a named phase.
///
/// "P" is the first P-type arrival, "PKP" the first core phase; other names
/// are matched exactly and then by prefix.
pub fn phase_travel_time(
    ttt: &dyn TravelTimeTable,
    phase: &str,
    delta: f64,
    depth: f64,
) -> Option<TravelTime> {
    match phase {
        "P" => travel_time_p(ttt, delta, depth),
        "PKP" => travel_time_prefix(ttt, delta, depth, "PKP"),
        _ => {
            let list = ttt.compute(delta, depth);
            match list.iter().position(|tt| tt.phase == phase) {
                Some(i) => list.into_iter().nth(i),
                None => list.into_iter().find(|tt| tt.phase.starts_with(phase)),
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct State {
    time: f64,
    lat: f64,
    lon: f64,
    dep: f64,
}

impl State {
    fn is_finite(&self) -> bool {
        self.time.is_finite() && self.lat.is_finite() && self.lon.is_finite() && self.dep.is_finite()
    }
}

struct Prediction {
    residual: f64,
    delta: f64,
    azimuth: f64,
    /// d(tt)/d(time, north km, east km, depth km)
    partials: [f64; 4],
}

/// Damped Gauss-Newton inversion over (time, north, east, depth).
///
/// Each iteration solves the linearised system with an SVD, limits the step
/// and halves it until the misfit no longer grows. Iteration stops when the
/// step becomes negligible or no descent is possible.
#[derive(Debug, Clone)]
pub struct LeastSquaresInversion {
    pub max_iterations: usize,
    pub max_horizontal_step_km: f64,
    pub max_depth_step_km: f64,
    pub max_depth: f64,
    /// Scale from standard error to the 90% horizontal ellipse
    pub ellipse_scale: f64,
}

impl Default for LeastSquaresInversion {
    fn default() -> Self {
        Self {
            max_iterations: 40,
            max_horizontal_step_km: 50.0,
            max_depth_step_km: 30.0,
            max_depth: 700.0,
            ellipse_scale: 4.605_f64.sqrt(),
        }
    }
}

impl LeastSquaresInversion {
    pub fn new() -> Self {
        Self::default()
    }

    fn predict(
        &self,
        origin: &Origin,
        index: usize,
        state: &State,
        ttt: &dyn TravelTimeTable,
    ) -> Option<Prediction> {
        let arrival = &origin.arrivals[index];
        let station = arrival.pick.station()?;
        let (delta, azimuth, _) = delazi(state.lat, state.lon, station.lat, station.lon);
        let tt = phase_travel_time(ttt, &arrival.phase, delta, state.dep)?;
        let p = tt.dtdd / KM_PER_DEG;
        let az = azimuth.to_radians();
        Some(Prediction {
            residual: arrival.pick.time - state.time - tt.time,
            delta,
            azimuth,
            partials: [1.0, -p * az.cos(), -p * az.sin(), tt.dtdh],
        })
    }

    /// Design matrix and residual vector over the predictable used arrivals
    fn system(
        &self,
        origin: &Origin,
        used: &[usize],
        state: &State,
        nparam: usize,
        ttt: &dyn TravelTimeTable,
    ) -> Result<(DMatrix<f64>, DVector<f64>), LocatorError> {
        let rows: Vec<Prediction> = used
            .iter()
            .filter_map(|&i| self.predict(origin, i, state, ttt))
            .collect();
        if rows.len() < nparam {
            return Err(LocatorError::TooFewArrivals {
                have: rows.len(),
                need: nparam,
            });
        }

        let mut a = DMatrix::zeros(rows.len(), nparam);
        let mut r = DVector::zeros(rows.len());
        for (k, row) in rows.iter().enumerate() {
            for j in 0..nparam {
                a[(k, j)] = row.partials[j];
            }
            r[k] = row.residual;
        }
        Ok((a, r))
    }

    fn misfit(
        &self,
        origin: &Origin,
        used: &[usize],
        state: &State,
        nparam: usize,
        ttt: &dyn TravelTimeTable,
    ) -> Result<f64, LocatorError> {
        let (_, r) = self.system(origin, used, state, nparam, ttt)?;
        Ok(r.norm_squared())
    }

    fn apply(&self, state: &State, step: &DVector<f64>, scale: f64, fixed: bool) -> State {
        let mut dn = step[1] * scale;
        let mut de = step[2] * scale;
        let horizontal = (dn * dn + de * de).sqrt();
        if horizontal > self.max_horizontal_step_km {
            dn *= self.max_horizontal_step_km / horizontal;
            de *= self.max_horizontal_step_km / horizontal;
        }
        let (lat, lon) = offset(state.lat, state.lon, dn, de);

        let dep = if fixed {
            state.dep
        } else {
            let dz = (step[3] * scale).clamp(-self.max_depth_step_km, self.max_depth_step_km);
            (state.dep + dz).clamp(0.0, self.max_depth)
        };

        State {
            time: state.time + step[0] * scale,
            lat,
            lon,
            dep,
        }
    }
}

impl Inversion for LeastSquaresInversion {
    fn invert(
        &self,
        origin: &Origin,
        fixed_depth: Option<f64>,
        ttt: &dyn TravelTimeTable,
    ) -> Result<Origin, LocatorError> {
        let fixed = fixed_depth.is_some();
        let nparam = if fixed { 3 } else { 4 };

        let used: Vec<usize> = origin
            .arrivals
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_defining())
            .map(|(i, _)| i)
            .collect();
        if used.len() < nparam {
            return Err(LocatorError::TooFewArrivals {
                have: used.len(),
                need: nparam,
            });
        }
        if let Some(&i) = used.iter().find(|&&i| origin.arrivals[i].pick.station().is_none()) {
            return Err(LocatorError::UnknownStation(origin.arrivals[i].pick.station_key()));
        }

        let mut state = State {
            time: origin.time,
            lat: origin.lat,
            lon: origin.lon,
            dep: fixed_depth.unwrap_or(origin.dep).clamp(0.0, self.max_depth),
        };
        let mut misfit = self.misfit(origin, &used, &state, nparam, ttt)?;

        for _ in 0..self.max_iterations {
            let (a, r) = self.system(origin, &used, &state, nparam, ttt)?;
            let svd = a.svd(true, true);
            let smax = svd.singular_values.max();
            if smax.is_nan() || smax <= 0.0 {
                return Err(LocatorError::Singular);
            }
            let solution = svd
                .solve(&r, smax * 1e-8)
                .map_err(|_| LocatorError::Singular)?;
            let mut step = DVector::zeros(4);
            for j in 0..nparam {
                step[j] = solution[j];
            }

            let mut accepted = None;
            let mut scale = 1.0;
            for _ in 0..8 {
                let trial = self.apply(&state, &step, scale, fixed);
                if !trial.is_finite() {
                    return Err(LocatorError::Diverged);
                }
                let trial_misfit = self.misfit(origin, &used, &trial, nparam, ttt)?;
                if trial_misfit <= misfit {
                    accepted = Some((trial, trial_misfit));
                    break;
                }
                scale *= 0.5;
            }

            let Some((next, next_misfit)) = accepted else {
                break;
            };
            let moved_km = {
                let (d, _, _) = delazi(state.lat, state.lon, next.lat, next.lon);
                d * KM_PER_DEG + (next.dep - state.dep).abs()
            };
            let moved_s = (next.time - state.time).abs();
            state = next;
            misfit = next_misfit;
            if moved_km < 0.01 && moved_s < 0.001 {
                break;
            }
        }

        if !state.is_finite() || state.lat.abs() > 90.0 {
            return Err(LocatorError::Diverged);
        }

        let mut result = origin.clone();
        result.time = state.time;
        result.lat = state.lat;
        result.lon = if state.lon > 180.0 {
            state.lon - 360.0
        } else if state.lon < -180.0 {
            state.lon + 360.0
        } else {
            state.lon
        };
        result.dep = state.dep;

        for (i, arrival) in result.arrivals.iter_mut().enumerate() {
            if let Some(p) = self.predict(origin, i, &state, ttt) {
                arrival.residual = p.residual;
                arrival.distance = p.delta;
                arrival.azimuth = p.azimuth;
            } else if let Some(station) = arrival.pick.station() {
                let (delta, azimuth, _) = delazi(state.lat, state.lon, station.lat, station.lon);
                arrival.distance = delta;
                arrival.azimuth = azimuth;
            }
        }

        // covariance of the final solution
        let (a, r) = self.system(origin, &used, &state, nparam, ttt)?;
        let n = r.len();
        let sdobs = if n > nparam {
            (r.norm_squared() / (n - nparam) as f64).sqrt()
        } else {
            (r.norm_squared() / n as f64).sqrt()
        };
        let normal = a.transpose() * &a;
        let cov = normal
            .pseudo_inverse(1e-10)
            .map_err(|_| LocatorError::Singular)?
            * (sdobs * sdobs);

        let horizontal = Matrix2::new(cov[(1, 1)], cov[(1, 2)], cov[(2, 1)], cov[(2, 2)]);
        let eigen = horizontal.symmetric_eigen();
        let (major, minor, axis) = if eigen.eigenvalues[0] >= eigen.eigenvalues[1] {
            (eigen.eigenvalues[0], eigen.eigenvalues[1], eigen.eigenvectors.column(0).into_owned())
        } else {
            (eigen.eigenvalues[1], eigen.eigenvalues[0], eigen.eigenvectors.column(1).into_owned())
        };
        let strike = axis[1].atan2(axis[0]).to_degrees().rem_euclid(180.0);

        let stime = cov[(0, 0)].max(0.0).sqrt();
        let sdepth = if fixed { 0.0 } else { cov[(3, 3)].max(0.0).sqrt() };

        result.timeerr = stime;
        result.laterr = cov[(1, 1)].max(0.0).sqrt();
        result.lonerr = cov[(2, 2)].max(0.0).sqrt();
        result.deperr = sdepth;
        result.error = OriginError {
            sdobs,
            conf: 0.9,
            semi_major_axis: self.ellipse_scale * major.max(0.0).sqrt(),
            semi_minor_axis: self.ellipse_scale * minor.max(0.0).sqrt(),
            strike,
            stime,
            sdepth,
        };

        Ok(result)
    }

    fn name(&self) -> &str {
        "least-squares"
    }
}
