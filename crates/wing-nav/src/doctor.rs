use wing_proto::ConfigError;

use crate::energy::EnergyConfig;
use crate::geofence::GeofenceConfig;
use crate::geolocate::CameraModel;
use crate::link::LinkConfig;

/// Vertex count above which the per-tick check budget gets uncomfortable.
pub const MAX_FENCE_VERTICES: usize = 32;

pub fn check_geofence(cfg: &GeofenceConfig) -> ConfigError {
    let mut e = ConfigError::default();
    e.check(cfg.home.is_valid(), format!("geofence.home {} is not a valid coordinate", cfg.home));
    if let Some(max) = cfg.max_distance_m {
        e.check(max >= 50.0, format!("geofence.max_distance_m {max} too small (>= 50)"));
    }
    e.check(cfg.warning_distance_m >= 0.0, "geofence.warning_distance_m must be >= 0");
    e.check(cfg.safe_margin_m > 0.0, "geofence.safe_margin_m must be > 0");
    e.check(
        (1..=8).contains(&cfg.safe_point_attempts),
        format!("geofence.safe_point_attempts {} should be 1..8", cfg.safe_point_attempts),
    );

    let mut names = std::collections::HashSet::new();
    for f in &cfg.fences {
        let id = if f.name.is_empty() { "<unnamed>" } else { f.name.as_str() };
        e.check(!f.name.is_empty(), "geofence: a fence has an empty name");
        e.check(names.insert(f.name.as_str()), format!("geofence '{id}': duplicate name"));
        e.check(f.vertices.len() >= 3, format!("geofence '{id}': {} vertices, need >= 3", f.vertices.len()));
        e.check(
            f.vertices.len() <= MAX_FENCE_VERTICES,
            format!("geofence '{id}': {} vertices exceeds {MAX_FENCE_VERTICES}", f.vertices.len()),
        );
        for (i, v) in f.vertices.iter().enumerate() {
            e.check(v.is_valid(), format!("geofence '{id}': vertex {i} {v} invalid"));
        }
        e.check(
            f.altitude_min.is_finite() && f.altitude_max.is_finite() && f.altitude_min < f.altitude_max,
            format!("geofence '{id}': altitude band [{}, {}] is empty", f.altitude_min, f.altitude_max),
        );
    }
    e
}

pub fn check_energy(cfg: &EnergyConfig) -> ConfigError {
    let mut e = ConfigError::default();
    e.check(cfg.capacity_mah > 0.0, "energy.capacity_mah must be > 0");
    e.check(cfg.nominal_voltage > 0.0, "energy.nominal_voltage must be > 0");
    e.check((1..=14).contains(&cfg.cells), format!("energy.cells {} should be 1..14", cfg.cells));
    e.check((0.0..50.0).contains(&cfg.reserve_pct), "energy.reserve_pct should be 0..50");
    e.check(
        cfg.critical_margin_pct < cfg.warn_margin_pct,
        format!(
            "energy.critical_margin_pct ({}) must be below warn_margin_pct ({})",
            cfg.critical_margin_pct, cfg.warn_margin_pct
        ),
    );
    let nominal_cell = cfg.nominal_voltage / cfg.cells.max(1) as f64;
    e.check(
        cfg.empty_cell_voltage > 2.5 && cfg.empty_cell_voltage < nominal_cell,
        format!("energy.empty_cell_voltage {} must be in (2.5, {nominal_cell:.2})", cfg.empty_cell_voltage),
    );
    e.check(cfg.cruise_power_w > 0.0 && cfg.climb_power_w > 0.0, "energy: power coefficients must be > 0");
    e.check(cfg.consumption_factor >= 1.0, "energy.consumption_factor must be >= 1.0");
    e.check(cfg.vertical_speed_mps > 0.0, "energy.vertical_speed_mps must be > 0");
    e.check(cfg.min_groundspeed_mps > 0.0, "energy.min_groundspeed_mps must be > 0");
    e.check(
        cfg.groundspeed_alpha > 0.0 && cfg.groundspeed_alpha <= 1.0,
        "energy.groundspeed_alpha must be in (0, 1]",
    );
    for (i, s) in cfg.landing_sites.iter().enumerate() {
        e.check(s.is_valid(), format!("energy.landing_sites[{i}] {s} invalid"));
    }
    e
}

pub fn check_link(cfg: &LinkConfig) -> ConfigError {
    let mut e = ConfigError::default();
    e.check(cfg.rc_timeout_ms >= 100, "link.rc_timeout_ms too small (>= 100)");
    e.check(cfg.gcs_timeout_ms >= 500, "link.gcs_timeout_ms too small (>= 500)");
    e.check(
        cfg.anomaly_clear < cfg.anomaly_threshold && cfg.anomaly_threshold <= 100.0,
        format!("link: need anomaly_clear ({}) < anomaly_threshold ({}) <= 100", cfg.anomaly_clear, cfg.anomaly_threshold),
    );
    e.check(cfg.decay > 0.0 && cfg.decay < 1.0, "link.decay must be in (0, 1)");
    e.check(cfg.jump_m > 0.0, "link.jump_m must be > 0");
    e.check(cfg.hdop_spike > 0.5, "link.hdop_spike too small");
    e
}

pub fn check_camera(cam: &CameraModel) -> ConfigError {
    let mut e = ConfigError::default();
    e.check(cam.hfov_deg > 0.0 && cam.hfov_deg < 180.0, "camera.hfov_deg must be in (0, 180)");
    e.check(cam.vfov_deg > 0.0 && cam.vfov_deg < 180.0, "camera.vfov_deg must be in (0, 180)");
    e.check((-90.0..=0.0).contains(&cam.mount_pitch_deg), "camera.mount_pitch_deg must be in [-90, 0]");
    e.check(cam.max_range_m > 0.0, "camera.max_range_m must be > 0");
    e
}
