//! Polygon and altitude containment with breach response selection.
//!
//! Fences are compiled once into a local plane so that each check is a
//! bounding-box rejection followed by an O(n) ray cast per fence. Vertex
//! counts are kept small (about a dozen) so a full evaluation of a typical
//! fence set stays far below the safety tick period.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use wing_proto::GeoPoint;

use crate::geo::{self, LocalFrame};

/// Breach responses, least to most escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FenceAction {
    Warn,
    Loiter,
    GuidedReturn,
    Rth,
    Land,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoFence {
    pub name: String,
    pub vertices: Vec<GeoPoint>,
    /// true = no-fly volume, false = must-stay-inside region
    #[serde(default = "default_exclusion")]
    pub exclusion: bool,
    #[serde(default)]
    pub altitude_min: f64,
    #[serde(default = "default_altitude_max")]
    pub altitude_max: f64,
    #[serde(default = "default_action")]
    pub action: FenceAction,
    #[serde(default)]
    pub priority: u8,
}

fn default_exclusion() -> bool { true }
fn default_altitude_max() -> f64 { 1000.0 }
fn default_action() -> FenceAction { FenceAction::GuidedReturn }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceConfig {
    pub home: GeoPoint,
    /// Hard cap on horizontal distance from home; exceeding it means RTH.
    #[serde(default)]
    pub max_distance_m: Option<f64>,
    #[serde(default = "default_warning_distance")]
    pub warning_distance_m: f64,
    /// Distance beyond the boundary for GUIDED_RETURN targets.
    #[serde(default = "default_safe_margin")]
    pub safe_margin_m: f64,
    /// Each attempt doubles the margin.
    #[serde(default = "default_safe_attempts")]
    pub safe_point_attempts: u32,
    #[serde(default = "default_vertical_margin")]
    pub vertical_margin_m: f64,
    #[serde(default)]
    pub fences: Vec<GeoFence>,
}

fn default_warning_distance() -> f64 { 30.0 }
fn default_safe_margin() -> f64 { 20.0 }
fn default_safe_attempts() -> u32 { 4 }
fn default_vertical_margin() -> f64 { 5.0 }

impl GeofenceConfig {
    pub fn new(home: GeoPoint) -> Self {
        Self {
            home,
            max_distance_m: None,
            warning_distance_m: default_warning_distance(),
            safe_margin_m: default_safe_margin(),
            safe_point_attempts: default_safe_attempts(),
            vertical_margin_m: default_vertical_margin(),
            fences: Vec::new(),
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Result of one containment evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct FenceCheck {
    pub breached: bool,
    /// `None` when not breached.
    pub action: Option<FenceAction>,
    pub fence: Option<String>,
    pub nearest_safe_point: Option<GeoPoint>,
    /// True when only the altitude band was violated.
    pub vertical: bool,
    /// Horizontal distance to the closest boundary on the safe side.
    /// Infinite when no boundary constrains the position.
    pub clearance_m: f64,
    /// Exclusion fences closer than the warning distance.
    pub near: Vec<String>,
}

impl FenceCheck {
    fn clear(clearance_m: f64, near: Vec<String>) -> Self {
        Self {
            breached: false,
            action: None,
            fence: None,
            nearest_safe_point: None,
            vertical: false,
            clearance_m,
            near,
        }
    }
}

struct CompiledFence {
    fence: GeoFence,
    frame: LocalFrame,
    xy: Vec<(f64, f64)>,
    // min_lat, min_lon, max_lat, max_lon
    bbox: [f64; 4],
}

impl CompiledFence {
    fn compile(fence: GeoFence) -> Self {
        let n = fence.vertices.len().max(1) as f64;
        // the local frame is centred on the vertex mean
        let origin = GeoPoint::new(
            fence.vertices.iter().map(|p| p.lat).sum::<f64>() / n,
            fence.vertices.iter().map(|p| p.lon).sum::<f64>() / n,
        );
        let frame = LocalFrame::new(&origin);
        let xy: Vec<(f64, f64)> = fence.vertices.iter().map(|p| frame.to_xy(p)).collect();
        let mut bbox = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];
        for p in &fence.vertices {
            bbox[0] = bbox[0].min(p.lat);
            bbox[1] = bbox[1].min(p.lon);
            bbox[2] = bbox[2].max(p.lat);
            bbox[3] = bbox[3].max(p.lon);
        }
        Self { fence, frame, xy, bbox }
    }

    fn contains(&self, p: &GeoPoint) -> bool {
        if p.lat < self.bbox[0] || p.lat > self.bbox[2] || p.lon < self.bbox[1] || p.lon > self.bbox[3] {
            return false;
        }
        geo::point_in_polygon(&self.fence.vertices, p.lat, p.lon)
    }

    fn in_band(&self, altitude: f64) -> bool {
        altitude >= self.fence.altitude_min && altitude <= self.fence.altitude_max
    }

    /// Distance to the nearest band limit; positive inside, negative outside.
    fn band_depth(&self, altitude: f64) -> f64 {
        (altitude - self.fence.altitude_min).min(self.fence.altitude_max - altitude)
    }

    /// Nearest boundary point for every edge, closest first.
    fn boundary_points(&self, p: &GeoPoint) -> Vec<(f64, (f64, f64))> {
        let (px, py) = self.frame.to_xy(p);
        let n = self.xy.len();
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let (ax, ay) = self.xy[i];
            let (bx, by) = self.xy[(i + 1) % n];
            let (cx, cy) = geo::closest_on_segment(px, py, ax, ay, bx, by);
            out.push((((cx - px).powi(2) + (cy - py).powi(2)).sqrt(), (cx, cy)));
        }
        out.sort_by(|a, b| a.0.total_cmp(&b.0));
        out
    }

    fn distance_to_boundary(&self, p: &GeoPoint) -> f64 {
        self.boundary_points(p).first().map(|b| b.0).unwrap_or(f64::INFINITY)
    }
}

struct Breach<'a> {
    name: &'a str,
    priority: u8,
    action: FenceAction,
    safe: Option<GeoPoint>,
    vertical: bool,
}

pub struct GeofenceEngine {
    cfg: GeofenceConfig,
    fences: Vec<CompiledFence>,
}

impl GeofenceEngine {
    pub fn new(cfg: GeofenceConfig) -> Self {
        let fences = cfg.fences.iter().cloned().map(CompiledFence::compile).collect();
        Self { cfg, fences }
    }

    pub fn config(&self) -> &GeofenceConfig {
        &self.cfg
    }

    pub fn home(&self) -> GeoPoint {
        self.cfg.home
    }

    /// True when `p` at `altitude` lies inside any exclusion volume.
    pub fn in_exclusion(&self, p: &GeoPoint, altitude: f64) -> bool {
        self.fences
            .iter()
            .any(|f| f.fence.exclusion && f.in_band(altitude) && f.contains(p))
    }

    pub fn check_position(&self, point: &GeoPoint, altitude: f64) -> FenceCheck {
        let mut clearance = f64::INFINITY;
        let mut near = Vec::new();
        let mut breaches: Vec<Breach<'_>> = Vec::new();

        if let Some(max) = self.cfg.max_distance_m {
            let d = geo::distance_m(&self.cfg.home, point);
            if d > max {
                breaches.push(Breach {
                    name: "max_distance",
                    priority: u8::MAX,
                    action: FenceAction::Rth,
                    safe: Some(self.cfg.home),
                    vertical: false,
                });
            } else {
                clearance = clearance.min(max - d);
            }
        }

        for f in &self.fences {
            let inside = f.contains(point);
            let in_band = f.in_band(altitude);
            if f.fence.exclusion {
                if inside && in_band {
                    breaches.push(self.horizontal_breach(f, point, altitude));
                } else if !inside {
                    let d = f.distance_to_boundary(point);
                    clearance = clearance.min(d);
                    if d < self.cfg.warning_distance_m {
                        warn!("fence: {:.1}m from exclusion '{}'", d, f.fence.name);
                        near.push(f.fence.name.clone());
                    }
                } else {
                    // over or under the volume
                    clearance = clearance.min(-f.band_depth(altitude));
                }
            } else if !inside {
                breaches.push(self.horizontal_breach(f, point, altitude));
            } else if !in_band {
                breaches.push(Breach {
                    name: &f.fence.name,
                    priority: f.fence.priority,
                    action: f.fence.action,
                    safe: Some(self.vertical_safe_point(f, point, altitude)),
                    vertical: true,
                });
            } else {
                clearance = clearance.min(f.distance_to_boundary(point)).min(f.band_depth(altitude));
            }
        }

        let Some(worst) = breaches
            .into_iter()
            .max_by(|a, b| (a.priority, a.action).cmp(&(b.priority, b.action)))
        else {
            return FenceCheck::clear(clearance, near);
        };

        let mut action = worst.action;
        if action == FenceAction::GuidedReturn && worst.safe.is_none() {
            debug!("fence: no safe point for '{}', falling back to RTH", worst.name);
            action = FenceAction::Rth;
        }
        FenceCheck {
            breached: true,
            action: Some(action),
            fence: Some(worst.name.to_string()),
            nearest_safe_point: worst.safe,
            vertical: worst.vertical,
            clearance_m: 0.0,
            near,
        }
    }

    fn horizontal_breach<'a>(&self, f: &'a CompiledFence, p: &GeoPoint, altitude: f64) -> Breach<'a> {
        let safe = match f.fence.action {
            FenceAction::GuidedReturn => self.search_safe_point(f, p, altitude),
            _ => None,
        };
        Breach {
            name: &f.fence.name,
            priority: f.fence.priority,
            action: f.fence.action,
            safe,
            vertical: false,
        }
    }

    /// Steps from the current position through the nearest boundary point
    /// and `margin` beyond it. Candidates are tried for the three closest
    /// edges with a doubling margin; the first one that lands on the safe
    /// side of this fence and outside every exclusion volume wins.
    fn search_safe_point(&self, f: &CompiledFence, p: &GeoPoint, altitude: f64) -> Option<GeoPoint> {
        let (px, py) = f.frame.to_xy(p);
        for (d, (nx, ny)) in f.boundary_points(p).into_iter().take(3) {
            let (mut dx, mut dy) = (nx - px, ny - py);
            if d < 1e-3 {
                // on the boundary: go away from (or toward) the frame origin
                dx = nx;
                dy = ny;
                if !f.fence.exclusion { dx = -dx; dy = -dy; }
            }
            let len = dx.hypot(dy);
            if len < 1e-9 { continue; }
            let (ux, uy) = (dx / len, dy / len);

            let mut margin = self.cfg.safe_margin_m.max(1.0);
            for _ in 0..self.cfg.safe_point_attempts.max(1) {
                let cand = f.frame.to_geo(nx + ux * margin, ny + uy * margin);
                let safe_side = f.contains(&cand) != f.fence.exclusion;
                let home_ok = self
                    .cfg
                    .max_distance_m
                    .map(|max| geo::distance_m(&self.cfg.home, &cand) <= max)
                    .unwrap_or(true);
                if safe_side && home_ok && !self.in_exclusion(&cand, altitude) {
                    return Some(cand.with_alt(altitude));
                }
                margin *= 2.0;
            }
        }
        None
    }

    fn vertical_safe_point(&self, f: &CompiledFence, p: &GeoPoint, altitude: f64) -> GeoPoint {
        let lo = f.fence.altitude_min + self.cfg.vertical_margin_m;
        let hi = (f.fence.altitude_max - self.cfg.vertical_margin_m).max(lo);
        GeoPoint::new(p.lat, p.lon).with_alt(altitude.clamp(lo, hi))
    }
}

/// Pre-defined fence shapes.
pub mod templates {
    use super::*;
    use crate::geo::destination;

    fn ring(center: &GeoPoint, n: usize, radius_at: impl Fn(usize) -> f64) -> Vec<GeoPoint> {
        (0..n)
            .map(|i| {
                let bearing = 360.0 * i as f64 / n as f64;
                let p = destination(&GeoPoint::new(center.lat, center.lon), radius_at(i), bearing);
                GeoPoint::new(p.lat, p.lon)
            })
            .collect()
    }

    /// Five-pointed star, inner radius 40 % of the outer.
    pub fn star(name: &str, center: GeoPoint, radius_m: f64) -> GeoFence {
        let vertices = ring(&center, 10, |i| if i % 2 == 0 { radius_m } else { radius_m * 0.4 });
        exclusion(name, vertices)
    }

    pub fn circle(name: &str, center: GeoPoint, radius_m: f64, segments: usize) -> GeoFence {
        exclusion(name, ring(&center, segments.max(3), |_| radius_m))
    }

    pub fn rectangle(name: &str, sw: GeoPoint, ne: GeoPoint) -> GeoFence {
        exclusion(
            name,
            vec![
                GeoPoint::new(sw.lat, sw.lon),
                GeoPoint::new(sw.lat, ne.lon),
                GeoPoint::new(ne.lat, ne.lon),
                GeoPoint::new(ne.lat, sw.lon),
            ],
        )
    }

    fn exclusion(name: &str, vertices: Vec<GeoPoint>) -> GeoFence {
        GeoFence {
            name: name.to_string(),
            vertices,
            exclusion: true,
            altitude_min: 0.0,
            altitude_max: default_altitude_max(),
            action: FenceAction::GuidedReturn,
            priority: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{destination, distance_m};

    fn home() -> GeoPoint {
        GeoPoint::new(21.028511, 105.804817)
    }

    fn star_engine(center: GeoPoint) -> GeofenceEngine {
        let mut cfg = GeofenceConfig::new(home());
        cfg.fences.push(templates::star("base", center, 100.0));
        GeofenceEngine::new(cfg)
    }

    #[test]
    fn inside_star_exclusion_yields_guided_return_near_center() {
        let center = GeoPoint::new(21.030, 105.806);
        let engine = star_engine(center);
        let probe = destination(&center, 5.0, 10.0);

        let check = engine.check_position(&probe, 50.0);
        assert!(check.breached);
        assert_eq!(check.action, Some(FenceAction::GuidedReturn));
        let safe = check.nearest_safe_point.expect("safe point");
        let r = distance_m(&center, &safe);
        assert!(r <= 100.0 + engine.config().safe_margin_m, "safe point {r:.1}m from center");
        assert!(!engine.in_exclusion(&safe, 50.0));
        assert_eq!(safe.alt, Some(50.0));
    }

    #[test]
    fn outside_everything_reports_clearance() {
        let center = GeoPoint::new(21.030, 105.806);
        let engine = star_engine(center);
        let probe = destination(&center, 120.0, 0.0);

        let check = engine.check_position(&probe, 50.0);
        assert!(!check.breached);
        assert_eq!(check.action, None);
        assert!(check.clearance_m > 15.0 && check.clearance_m < 25.0, "{}", check.clearance_m);
        assert_eq!(check.near, vec!["base".to_string()]);
    }

    #[test]
    fn exclusion_above_its_band_is_not_a_breach() {
        let center = GeoPoint::new(21.030, 105.806);
        let mut cfg = GeofenceConfig::new(home());
        let mut f = templates::circle("low", center, 80.0, 12);
        f.altitude_max = 60.0;
        cfg.fences.push(f);
        let engine = GeofenceEngine::new(cfg);
        assert!(engine.check_position(&center, 40.0).breached);
        assert!(!engine.check_position(&center, 90.0).breached);
    }

    #[test]
    fn inclusion_altitude_violation_is_a_vertical_breach() {
        let sw = GeoPoint::new(21.02, 105.80);
        let ne = GeoPoint::new(21.04, 105.82);
        let mut op = templates::rectangle("ops", sw, ne);
        op.exclusion = false;
        op.altitude_max = 120.0;
        op.action = FenceAction::Loiter;
        let mut cfg = GeofenceConfig::new(home());
        cfg.fences.push(op);
        let engine = GeofenceEngine::new(cfg);

        let inside = GeoPoint::new(21.03, 105.81);
        let check = engine.check_position(&inside, 150.0);
        assert!(check.breached);
        assert!(check.vertical);
        assert_eq!(check.action, Some(FenceAction::Loiter));
        assert_eq!(check.nearest_safe_point.and_then(|p| p.alt), Some(115.0));

        assert!(!engine.check_position(&inside, 100.0).breached);
    }

    #[test]
    fn clearance_counts_the_altitude_band() {
        let sw = GeoPoint::new(21.02, 105.80);
        let ne = GeoPoint::new(21.04, 105.82);
        let mut op = templates::rectangle("ops", sw, ne);
        op.exclusion = false;
        op.altitude_max = 120.0;
        let mut cfg = GeofenceConfig::new(home());
        cfg.fences.push(op);
        let mut tower = templates::rectangle("tower", GeoPoint::new(21.030, 105.810), GeoPoint::new(21.031, 105.811));
        tower.altitude_max = 60.0;
        cfg.fences.push(tower);
        let engine = GeofenceEngine::new(cfg);

        // just under the ceiling, far from every edge
        let check = engine.check_position(&GeoPoint::new(21.025, 105.805), 119.5);
        assert!(!check.breached);
        assert!((check.clearance_m - 0.5).abs() < 1e-9, "{}", check.clearance_m);

        // above the tower's band
        let check = engine.check_position(&GeoPoint::new(21.0305, 105.8105), 64.0);
        assert!(!check.breached);
        assert!((check.clearance_m - 4.0).abs() < 1e-9, "{}", check.clearance_m);
    }

    #[test]
    fn leaving_inclusion_steers_back_inside() {
        let sw = GeoPoint::new(21.02, 105.80);
        let ne = GeoPoint::new(21.04, 105.82);
        let mut op = templates::rectangle("ops", sw, ne);
        op.exclusion = false;
        let mut cfg = GeofenceConfig::new(home());
        cfg.fences.push(op);
        let engine = GeofenceEngine::new(cfg);

        let outside = GeoPoint::new(21.045, 105.81);
        let check = engine.check_position(&outside, 50.0);
        assert_eq!(check.action, Some(FenceAction::GuidedReturn));
        let safe = check.nearest_safe_point.unwrap();
        assert!(safe.lat < 21.04 && safe.lat > 21.039);
    }

    #[test]
    fn breach_on_a_corner_steers_toward_the_middle() {
        let sw = GeoPoint::new(21.02, 105.80);
        let ne = GeoPoint::new(21.04, 105.82);
        let mut op = templates::rectangle("ops", sw, ne);
        op.exclusion = false;
        let mut cfg = GeofenceConfig::new(home());
        cfg.fences.push(op);
        let engine = GeofenceEngine::new(cfg);

        // a hair outside the south-west corner
        let corner = GeoPoint::new(21.02 - 1e-9, 105.80 - 1e-9);
        let check = engine.check_position(&corner, 50.0);
        assert!(check.breached);
        let safe = check.nearest_safe_point.unwrap();
        assert!(safe.lat > 21.02 && safe.lon > 105.80, "{safe}");
        assert!(distance_m(&corner, &safe) < 30.0);
        assert!(!engine.check_position(&safe, 50.0).breached);
    }

    #[test]
    fn guided_return_without_safe_point_falls_back_to_rth() {
        // inclusion zone fully covered by an exclusion zone: nothing is safe
        let center = GeoPoint::new(21.030, 105.806);
        let mut inner = templates::circle("ops", center, 50.0, 8);
        inner.exclusion = false;
        let mut cfg = GeofenceConfig::new(home());
        cfg.fences.push(inner);
        let mut blanket = templates::circle("blanket", center, 2_000.0, 8);
        blanket.action = FenceAction::Warn;
        cfg.fences.push(blanket);
        let engine = GeofenceEngine::new(cfg);

        let outside = destination(&center, 300.0, 90.0);
        let check = engine.check_position(&outside, 50.0);
        assert!(check.breached);
        assert_eq!(check.action, Some(FenceAction::Rth));
    }

    #[test]
    fn higher_priority_fence_wins() {
        let center = GeoPoint::new(21.030, 105.806);
        let mut a = templates::circle("advisory", center, 200.0, 12);
        a.action = FenceAction::Land;
        let mut b = templates::circle("airfield", center, 100.0, 12);
        b.action = FenceAction::Loiter;
        b.priority = 5;
        let mut cfg = GeofenceConfig::new(home());
        cfg.fences = vec![a, b];
        let engine = GeofenceEngine::new(cfg);

        let check = engine.check_position(&center, 50.0);
        assert_eq!(check.fence.as_deref(), Some("airfield"));
        assert_eq!(check.action, Some(FenceAction::Loiter));
    }

    #[test]
    fn max_distance_cap_returns_home() {
        let mut cfg = GeofenceConfig::new(home());
        cfg.max_distance_m = Some(1000.0);
        let engine = GeofenceEngine::new(cfg);
        let far = destination(&home(), 1500.0, 45.0);
        let check = engine.check_position(&far, 50.0);
        assert_eq!(check.action, Some(FenceAction::Rth));
        assert_eq!(check.nearest_safe_point, Some(home()));
    }

    #[test]
    fn json_round_trip_keeps_decisions() {
        let center = GeoPoint::new(21.030, 105.806);
        let mut cfg = GeofenceConfig::new(home());
        cfg.max_distance_m = Some(1500.0);
        cfg.fences.push(templates::star("base", center, 150.0));
        cfg.fences.push(templates::circle("restricted", GeoPoint::new(21.027, 105.803), 80.0, 16));
        let engine = GeofenceEngine::new(cfg.clone());
        let reloaded = GeofenceEngine::new(GeofenceConfig::from_json(&cfg.to_json().unwrap()).unwrap());

        let probes = [
            (GeoPoint::new(21.029, 105.805), 50.0),
            (GeoPoint::new(21.030, 105.806), 50.0),
            (GeoPoint::new(21.027, 105.803), 50.0),
            (GeoPoint::new(21.040, 105.810), 50.0),
        ];
        for (p, alt) in probes {
            assert_eq!(engine.check_position(&p, alt), reloaded.check_position(&p, alt));
        }
    }

    #[test]
    fn toml_config_uses_defaults() {
        let cfg: GeofenceConfig = toml::from_str(
            r#"
            home = { lat = 21.0, lon = 105.0 }
            [[fences]]
            name = "a"
            vertices = [{ lat = 21.0, lon = 105.0 }, { lat = 21.0, lon = 105.01 }, { lat = 21.01, lon = 105.0 }]
            "#,
        )
        .unwrap();
        let f = &cfg.fences[0];
        assert!(f.exclusion);
        assert_eq!(f.action, FenceAction::GuidedReturn);
        assert_eq!(f.altitude_max, 1000.0);
        assert_eq!(cfg.safe_margin_m, 20.0);
    }

    #[test]
    fn escalation_order() {
        use FenceAction::*;
        assert!(Warn < Loiter && Loiter < GuidedReturn && GuidedReturn < Rth && Rth < Land);
    }
}
