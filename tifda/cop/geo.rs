use crate::model::Location;

/// Mean Earth radius, meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters; altitude is ignored.
#[must_use]
pub fn haversine_m(a: &Location, b: &Location) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().clamp(0.0, 1.0).asin()
}

/// Great-circle distance in kilometers.
#[must_use]
pub fn haversine_km(a: &Location, b: &Location) -> f64 {
    haversine_m(a, b) / 1000.0
}

/// Initial bearing from `a` to `b`, degrees in [0, 360).
#[must_use]
pub fn bearing_deg(a: &Location, b: &Location) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlon = (b.lon - a.lon).to_radians();
    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    y.atan2(x).to_degrees().rem_euclid(360.0)
}

/// Point at `distance_m` along `bearing` from `origin`.
#[must_use]
pub fn destination(origin: &Location, bearing: f64, distance_m: f64) -> Location {
    let delta = distance_m / EARTH_RADIUS_M;
    let theta = bearing.to_radians();
    let lat1 = origin.lat.to_radians();
    let lon1 = origin.lon.to_radians();
    let lat2 = (lat1.sin() * delta.cos() + lat1.cos() * delta.sin() * theta.cos()).asin();
    let lon2 = lon1
        + (theta.sin() * delta.sin() * lat1.cos()).atan2(delta.cos() - lat1.sin() * lat2.sin());
    Location {
        lat: lat2.to_degrees(),
        lon: ((lon2.to_degrees() + 540.0) % 360.0) - 180.0,
        alt: origin.alt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_distance() {
        let madrid = Location::new(40.4168, -3.7038);
        let barcelona = Location::new(41.3874, 2.1686);
        let km = haversine_km(&madrid, &barcelona);
        assert!((km - 505.0).abs() < 5.0, "got {km}");
    }

    #[test]
    fn destination_round_trips_bearing_and_distance() {
        let origin = Location::new(40.0, -3.0);
        let target = destination(&origin, 90.0, 10_000.0);
        assert!((haversine_m(&origin, &target) - 10_000.0).abs() < 1.0);
        assert!((bearing_deg(&origin, &target) - 90.0).abs() < 0.1);
    }
}
