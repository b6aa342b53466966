//! Great-circle geometry on a spherical earth

/// Kilometres per degree of arc
pub const KM_PER_DEG: f64 = 111.195;

/// Epicentral distance, azimuth and back-azimuth between two points.
///
/// Returns `(delta, azimuth, back_azimuth)` in degrees. The azimuth is
/// measured at point 1 towards point 2, the back-azimuth at point 2
/// towards point 1, both clockwise from north in `[0, 360)`.
pub fn delazi(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> (f64, f64, f64) {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dlon = (lon2 - lon1).to_radians();

    let cos_d = phi1.sin() * phi2.sin() + phi1.cos() * phi2.cos() * dlon.cos();
    let delta = cos_d.clamp(-1.0, 1.0).acos().to_degrees();

    let az = bearing(phi1, phi2, dlon);
    let baz = bearing(phi2, phi1, -dlon);

    (delta, az, baz)
}

/// Epicentral distance in degrees
pub fn distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    delazi(lat1, lon1, lat2, lon2).0
}

fn bearing(phi1: f64, phi2: f64, dlon: f64) -> f64 {
    let y = dlon.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dlon.cos();
    if x == 0.0 && y == 0.0 {
        return 0.0;
    }
    y.atan2(x).to_degrees().rem_euclid(360.0)
}

/// Shift a point by a north/east displacement in kilometres (flat-earth step,
/// only valid for small displacements).
pub fn offset(lat: f64, lon: f64, north_km: f64, east_km: f64) -> (f64, f64) {
    let new_lat = (lat + north_km / KM_PER_DEG).clamp(-89.999, 89.999);
    let coslat = new_lat.to_radians().cos().max(1e-6);
    let mut new_lon = lon + east_km / (KM_PER_DEG * coslat);
    if new_lon > 180.0 {
        new_lon -= 360.0;
    } else if new_lon < -180.0 {
        new_lon += 360.0;
    }
    (new_lat, new_lon)
}

/// Point at `delta` degrees along `azimuth` from (lat, lon), exact on the sphere.
pub fn project(lat: f64, lon: f64, delta: f64, azimuth: f64) -> (f64, f64) {
    let (phi1, lam1) = (lat.to_radians(), lon.to_radians());
    let (d, az) = (delta.to_radians(), azimuth.to_radians());
    let phi2 = (phi1.sin() * d.cos() + phi1.cos() * d.sin() * az.cos()).asin();
    let lam2 = lam1 + (az.sin() * d.sin() * phi1.cos()).atan2(d.cos() - phi1.sin() * phi2.sin());
    let mut lon2 = lam2.to_degrees();
    if lon2 > 180.0 {
        lon2 -= 360.0;
    } else if lon2 < -180.0 {
        lon2 += 360.0;
    }
    (phi2.to_degrees(), lon2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delazi_along_meridian() {
        let (d, az, baz) = delazi(0.0, 0.0, 10.0, 0.0);
        assert!((d - 10.0).abs() < 1e-9);
        assert!(az.abs() < 1e-9);
        assert!((baz - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_delazi_along_equator() {
        let (d, az, baz) = delazi(0.0, 0.0, 0.0, 90.0);
        assert!((d - 90.0).abs() < 1e-9);
        assert!((az - 90.0).abs() < 1e-9);
        assert!((baz - 270.0).abs() < 1e-9);
    }

    #[test]
    fn test_project_roundtrip_distance() {
        let (lat, lon) = project(45.0, 10.0, 3.5, 135.0);
        let (d, az, _) = delazi(45.0, 10.0, lat, lon);
        assert!((d - 3.5).abs() < 1e-6);
        assert!((az - 135.0).abs() < 1e-6);
    }
}
