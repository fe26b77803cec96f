//! Haversine distance (§4.9 "compute haversine distance and upsert a
//! route-segment"). Plain math, no crate pulls this in for us.

const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Great-circle distance between two lat/lon points, in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1_r, lat2_r) = (lat1.to_radians(), lat2.to_radians());
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1_r.cos() * lat2_r.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_KM * c
}

pub fn km_to_mi(km: f64) -> f64 {
    km * 0.621_371
}

/// Midpoint of a great-circle segment, used to estimate an
/// intermediate node's position when its two neighbors in a traceroute
/// path both have GPS (§4.9).
pub fn midpoint(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> (f64, f64) {
    let (lat1_r, lon1_r) = (lat1.to_radians(), lon1.to_radians());
    let (lat2_r, lon2_r) = (lat2.to_radians(), lon2.to_radians());

    let bx = lat2_r.cos() * (lon2_r - lon1_r).cos();
    let by = lat2_r.cos() * (lon2_r - lon1_r).sin();

    let lat_mid = ((lat1_r.sin() + lat2_r.sin())).atan2(
        ((lat1_r.cos() + bx).powi(2) + by.powi(2)).sqrt(),
    );
    let lon_mid = lon1_r + by.atan2(lat1_r.cos() + bx);

    (lat_mid.to_degrees(), lon_mid.to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance_for_identical_points() {
        assert!(haversine_km(40.0, -73.0, 40.0, -73.0) < 1e-9);
    }

    #[test]
    fn known_distance_new_york_to_los_angeles_is_roughly_right() {
        // Published great-circle distance is ~3,940 km.
        let distance = haversine_km(40.7128, -74.0060, 34.0522, -118.2437);
        assert!((distance - 3940.0).abs() < 50.0, "got {distance}");
    }

    #[test]
    fn midpoint_of_a_point_with_itself_is_itself() {
        let (lat, lon) = midpoint(10.0, 20.0, 10.0, 20.0);
        assert!((lat - 10.0).abs() < 1e-6);
        assert!((lon - 20.0).abs() < 1e-6);
    }

    #[test]
    fn km_to_mi_conversion() {
        assert!((km_to_mi(1.0) - 0.621_371).abs() < 1e-6);
    }
}
