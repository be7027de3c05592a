// ----- Geometry -----
//
// Everything here works on WGS84 degrees. Polygon work is done in a local
// equirectangular plane around a reference point, which is accurate to well
// under a metre for fences a few kilometres across.

use wing_proto::GeoPoint;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

pub fn distance_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    haversine_m(a.lat, a.lon, b.lat, b.lon)
}

/// Initial great-circle bearing from `a` to `b`, degrees in [0, 360).
pub fn bearing_deg(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let x = dlon.sin() * lat2.cos();
    let y = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    (x.atan2(y).to_degrees() + 360.0) % 360.0
}

/// Point reached travelling `distance_m` from `from` along `bearing_deg`.
pub fn destination(from: &GeoPoint, distance_m: f64, bearing_deg: f64) -> GeoPoint {
    let d = distance_m / EARTH_RADIUS_M;
    let brng = bearing_deg.to_radians();
    let lat1 = from.lat.to_radians();
    let lon1 = from.lon.to_radians();
    let lat2 = (lat1.sin() * d.cos() + lat1.cos() * d.sin() * brng.cos()).asin();
    let lon2 = lon1 + (brng.sin() * d.sin() * lat1.cos()).atan2(d.cos() - lat1.sin() * lat2.sin());
    GeoPoint { lat: lat2.to_degrees(), lon: lon2.to_degrees(), alt: from.alt }
}

/// Local tangent plane, x east / y north in metres.
#[derive(Debug, Clone, Copy)]
pub struct LocalFrame {
    lat0: f64,
    lon0: f64,
    cos_lat0: f64,
}

impl LocalFrame {
    pub fn new(origin: &GeoPoint) -> Self {
        Self { lat0: origin.lat, lon0: origin.lon, cos_lat0: origin.lat.to_radians().cos() }
    }

    pub fn to_xy(&self, p: &GeoPoint) -> (f64, f64) {
        let x = (p.lon - self.lon0).to_radians() * EARTH_RADIUS_M * self.cos_lat0;
        let y = (p.lat - self.lat0).to_radians() * EARTH_RADIUS_M;
        (x, y)
    }

    pub fn to_geo(&self, x: f64, y: f64) -> GeoPoint {
        let lat = self.lat0 + (y / EARTH_RADIUS_M).to_degrees();
        let lon = self.lon0 + (x / (EARTH_RADIUS_M * self.cos_lat0)).to_degrees();
        GeoPoint::new(lat, lon)
    }
}

/// Ray casting polygon test on (lat, lon) vertices. Closing edge is implicit.
pub fn point_in_polygon(poly: &[GeoPoint], lat: f64, lon: f64) -> bool {
    let mut inside = false;
    let n = poly.len();
    if n < 3 { return false; }
    let mut j = n - 1;
    for i in 0..n {
        let xi = poly[i].lon; let yi = poly[i].lat;
        let xj = poly[j].lon; let yj = poly[j].lat;
        let intersect = ((yi > lat) != (yj > lat))
            && (lon < (xj - xi) * (lat - yi) / (yj - yi + 1e-12) + xi);
        if intersect { inside = !inside; }
        j = i;
    }
    inside
}

/// Closest point to (px, py) on segment a-b, in plane coordinates.
pub fn closest_on_segment(px: f64, py: f64, ax: f64, ay: f64, bx: f64, by: f64) -> (f64, f64) {
    let vx = bx - ax; let vy = by - ay;
    let wx = px - ax; let wy = py - ay;

    let c1 = wx*vx + wy*vy;
    if c1 <= 0.0 { return (ax, ay); }
    let c2 = vx*vx + vy*vy;
    if c2 <= c1 { return (bx, by); }
    let t = c1 / c2;
    (ax + t*vx, ay + t*vy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_one_degree_latitude() {
        let d = haversine_m(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_195.0).abs() < 100.0, "{d}");
    }

    #[test]
    fn destination_inverts_bearing_and_distance() {
        let a = GeoPoint::new(21.0285, 105.8048);
        let b = destination(&a, 750.0, 63.0);
        assert!((distance_m(&a, &b) - 750.0).abs() < 0.5);
        assert!((bearing_deg(&a, &b) - 63.0).abs() < 0.1);
    }

    #[test]
    fn local_frame_round_trips_nearby_points() {
        let origin = GeoPoint::new(21.03, 105.80);
        let frame = LocalFrame::new(&origin);
        let p = destination(&origin, 400.0, 210.0);
        let (x, y) = frame.to_xy(&p);
        assert!(((x * x + y * y).sqrt() - 400.0).abs() < 1.0);
        let back = frame.to_geo(x, y);
        assert!(distance_m(&p, &back) < 0.01);
    }

    #[test]
    fn ray_casting_square() {
        let sq = [
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0, 1.0),
            GeoPoint::new(1.0, 1.0),
            GeoPoint::new(1.0, 0.0),
        ];
        assert!(point_in_polygon(&sq, 0.5, 0.5));
        assert!(!point_in_polygon(&sq, 1.5, 0.5));
        assert!(!point_in_polygon(&sq[..2], 0.5, 0.5));
    }

    #[test]
    fn closest_on_segment_clamps_to_endpoints() {
        assert_eq!(closest_on_segment(-5.0, 1.0, 0.0, 0.0, 10.0, 0.0), (0.0, 0.0));
        assert_eq!(closest_on_segment(15.0, 1.0, 0.0, 0.0, 10.0, 0.0), (10.0, 0.0));
        assert_eq!(closest_on_segment(4.0, 3.0, 0.0, 0.0, 10.0, 0.0), (4.0, 0.0));
    }
}
