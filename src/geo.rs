//! Distance and bounding-box helpers.
//!
//! All coordinates are WGS84 degrees, all distances meters.

use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;
/// Slack added to bounding-box margins so float rounding never cuts a stop
/// that is exactly on the radius.
const BBOX_SLACK: f64 = 1.01;
/// Decimal places kept when comparing vehicle coordinates (~11 m).
const COORDINATE_PRECISION: f64 = 10_000.0;

/// Great-circle distance between two points in meters (Haversine).
pub fn haversine_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);

    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_METERS * c
}

/// Point reached after travelling `distance_m` from a start point along
/// `bearing_deg` (clockwise from north) on the same sphere as
/// [`haversine_meters`].
pub fn destination_point(lat: f64, lon: f64, bearing_deg: f64, distance_m: f64) -> (f64, f64) {
    let angular = distance_m / EARTH_RADIUS_METERS;
    let bearing = bearing_deg.to_radians();
    let lat1 = lat.to_radians();
    let lon1 = lon.to_radians();

    let lat2 = (lat1.sin() * angular.cos() + lat1.cos() * angular.sin() * bearing.cos()).asin();
    let lon2 = lon1
        + (bearing.sin() * angular.sin() * lat1.cos()).atan2(angular.cos() - lat1.sin() * lat2.sin());

    (lat2.to_degrees(), lon2.to_degrees())
}

/// Coordinate rounded to a fixed grid, usable as a hash key.
pub fn rounded_coordinate(lat: f64, lon: f64) -> (i64, i64) {
    (
        (lat * COORDINATE_PRECISION).round() as i64,
        (lon * COORDINATE_PRECISION).round() as i64,
    )
}

pub fn is_valid_coordinate(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Box that contains every point within `radius_m` of the center.
    ///
    /// Margins use the same earth radius as [`haversine_meters`]. The
    /// longitude margin is widened by `1 / cos(lat)` at the box's widest
    /// latitude; near the poles the box covers every longitude.
    pub fn around(lat: f64, lon: f64, radius_m: f64) -> Self {
        let lat_margin = (radius_m / EARTH_RADIUS_METERS).to_degrees() * BBOX_SLACK;
        let widest_lat = (lat.abs() + lat_margin).min(90.0);
        let cos_lat = widest_lat.to_radians().cos();
        let lon_margin = if cos_lat < 1e-9 {
            360.0
        } else {
            lat_margin / cos_lat
        };

        BoundingBox {
            min_lat: lat - lat_margin,
            min_lon: lon - lon_margin,
            max_lat: lat + lat_margin,
            max_lon: lon + lon_margin,
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }

    /// Parses `min_lat,min_lon,max_lat,max_lon`.
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .ok()?;

        match parts.as_slice() {
            [min_lat, min_lon, max_lat, max_lon] if min_lat <= max_lat && min_lon <= max_lon => {
                Some(BoundingBox {
                    min_lat: *min_lat,
                    min_lon: *min_lon,
                    max_lat: *max_lat,
                    max_lon: *max_lon,
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_distance() {
        // Union Station to Bloor-Yonge is roughly 2.9 km
        let dist = haversine_meters(43.6452, -79.3806, 43.6709, -79.3868);
        assert!((dist - 2_900.0).abs() < 100.0, "got {dist}");
    }

    #[test]
    fn test_haversine_zero() {
        assert_eq!(haversine_meters(43.65, -79.38, 43.65, -79.38), 0.0);
    }

    #[test]
    fn test_destination_point_matches_haversine() {
        let (lat, lon) = destination_point(43.6532, -79.3832, 45.0, 1_234.0);
        let dist = haversine_meters(43.6532, -79.3832, lat, lon);
        assert!((dist - 1_234.0).abs() < 0.01, "got {dist}");
    }

    #[test]
    fn test_bounding_box_contains_radius() {
        let (lat, lon, radius) = (43.6532, -79.3832, 700.0);
        let bbox = BoundingBox::around(lat, lon, radius);

        for bearing in [0.0, 45.0, 90.0, 135.0, 180.0, 225.0, 270.0, 315.0] {
            let (p_lat, p_lon) = destination_point(lat, lon, bearing, radius * 0.999);
            assert!(bbox.contains(p_lat, p_lon), "bearing {bearing} cut by the box");
        }
        assert!(!bbox.contains(43.70, -79.38));
    }

    #[test]
    fn test_bounding_box_at_high_latitude() {
        let bbox = BoundingBox::around(89.999, 10.0, 5_000.0);
        let (p_lat, p_lon) = destination_point(89.999, 10.0, 90.0, 4_990.0);
        assert!(bbox.contains(p_lat, p_lon));
    }

    #[test]
    fn test_bounding_box_parse() {
        let bbox = BoundingBox::parse("43.58, -79.64, 43.86, -79.11").unwrap();
        assert!(bbox.contains(43.6532, -79.3832));
        assert!(!bbox.contains(45.5017, -73.5673));
        assert!(BoundingBox::parse("1,2,3").is_none());
        assert!(BoundingBox::parse("44,0,43,1").is_none());
    }

    #[test]
    fn test_rounded_coordinate() {
        assert_eq!(
            rounded_coordinate(43.645_21, -79.380_61),
            rounded_coordinate(43.645_24, -79.380_64)
        );
        assert_ne!(
            rounded_coordinate(43.6452, -79.3806),
            rounded_coordinate(43.6462, -79.3806)
        );
    }
}
