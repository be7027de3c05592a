//! Battery energy versus the cost of getting home.
//!
//! All energies are expressed as a percentage of the pack's nominal energy
//! so the margin can be compared directly against the reported remaining %.

use serde::{Deserialize, Serialize};
use tracing::debug;
use wing_proto::{GeoPoint, TelemetrySnapshot};

use crate::geo;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    pub capacity_mah: f64,
    pub nominal_voltage: f64,
    pub cells: u8,

    /// Untouchable floor, percent of pack.
    pub reserve_pct: f64,
    pub warn_margin_pct: f64,
    pub critical_margin_pct: f64,
    pub critical_cell_voltage: f64,
    /// Cell voltage treated as empty for the voltage-based estimate.
    pub empty_cell_voltage: f64,

    // Consumption model. Empirical; tune per airframe.
    pub cruise_power_w: f64,
    pub climb_power_w: f64,
    /// Descent power as a fraction of cruise power.
    pub descent_power_ratio: f64,
    pub consumption_factor: f64,
    pub vertical_speed_mps: f64,
    pub min_groundspeed_mps: f64,
    /// EMA weight of the newest groundspeed sample.
    pub groundspeed_alpha: f64,

    /// Pre-surveyed emergency landing sites.
    pub landing_sites: Vec<GeoPoint>,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            capacity_mah: 10_400.0,
            nominal_voltage: 14.8,
            cells: 4,
            reserve_pct: 10.0,
            warn_margin_pct: 20.0,
            critical_margin_pct: 10.0,
            critical_cell_voltage: 3.3,
            empty_cell_voltage: 3.3,
            cruise_power_w: 150.0,
            climb_power_w: 250.0,
            descent_power_ratio: 0.5,
            consumption_factor: 1.2,
            vertical_speed_mps: 2.0,
            min_groundspeed_mps: 5.0,
            groundspeed_alpha: 0.3,
            landing_sites: Vec::new(),
        }
    }
}

impl EnergyConfig {
    pub fn pack_wh(&self) -> f64 {
        self.capacity_mah / 1000.0 * self.nominal_voltage
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnergyTier {
    /// Neither a percentage nor a voltage has been reported yet.
    Unknown,
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnergyEstimate {
    pub distance_home_m: f64,
    pub groundspeed_mps: f64,
    pub time_to_home_s: f64,
    pub power_w: f64,
    /// None when there was neither a percentage nor a voltage to go on.
    pub remaining_pct: Option<f64>,
    pub required_pct: f64,
    /// remaining - required - reserve. Negative means home is out of reach.
    pub margin_pct: f64,
    pub cell_voltage: Option<f64>,
    /// Distance coverable before dipping into the reserve.
    pub reachable_m: f64,
    pub tier: EnergyTier,
}

impl EnergyEstimate {
    pub fn is_known(&self) -> bool {
        self.tier != EnergyTier::Unknown
    }

    pub fn can_return(&self) -> bool {
        self.margin_pct >= 0.0
    }
}

/// What to do once the budget turns critical.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EnergyResponse {
    Rth,
    /// `site` is `None` when no candidate qualified; land in place.
    Land { site: Option<GeoPoint> },
}

pub struct EnergyBudgetEngine {
    cfg: EnergyConfig,
    home: GeoPoint,
    groundspeed_ema: Option<f64>,
}

impl EnergyBudgetEngine {
    pub fn new(cfg: EnergyConfig, home: GeoPoint) -> Self {
        Self { cfg, home, groundspeed_ema: None }
    }

    pub fn config(&self) -> &EnergyConfig {
        &self.cfg
    }

    pub fn set_home(&mut self, home: GeoPoint) {
        self.home = home;
    }

    pub fn update(&mut self, snap: &TelemetrySnapshot) -> EnergyEstimate {
        let c = &self.cfg;

        let gs = snap.groundspeed_mps();
        let ema = match self.groundspeed_ema {
            Some(prev) => prev + c.groundspeed_alpha * (gs - prev),
            None => gs,
        };
        self.groundspeed_ema = Some(ema);
        let speed = ema.max(c.min_groundspeed_mps);

        let distance = geo::distance_m(&snap.position(), &self.home);
        let time_to_home = distance / speed;
        let power = snap.battery.power_w().unwrap_or(c.cruise_power_w);

        // positive dz: home is above us
        let dz = -snap.rel_alt_m;
        let vertical_s = dz.abs() / c.vertical_speed_mps.max(0.1);
        let vertical_power = if dz > 0.0 { c.climb_power_w } else { c.cruise_power_w * c.descent_power_ratio };

        let pack_wh = c.pack_wh();
        let required_wh = (power * time_to_home + vertical_power * vertical_s) / 3600.0 * c.consumption_factor;
        let required_pct = required_wh / pack_wh * 100.0;

        let cell_voltage = snap.battery.voltage.map(|v| v as f64 / c.cells.max(1) as f64);
        let remaining_pct = self.remaining_pct(snap.battery.remaining, cell_voltage);
        let margin_pct = remaining_pct.unwrap_or(0.0) - required_pct - c.reserve_pct;

        let usable_wh = (remaining_pct.unwrap_or(0.0) - c.reserve_pct).max(0.0) / 100.0 * pack_wh;
        let reachable_m = usable_wh / (power * c.consumption_factor).max(1.0) * 3600.0 * speed;

        let cell_collapse = cell_voltage.map(|v| v < c.critical_cell_voltage).unwrap_or(false);
        let tier = if remaining_pct.is_none() {
            EnergyTier::Unknown
        } else if cell_collapse || margin_pct < c.critical_margin_pct {
            EnergyTier::Critical
        } else if margin_pct < c.warn_margin_pct {
            EnergyTier::Warning
        } else {
            EnergyTier::Ok
        };

        debug!(
            "energy: home {:.0}m, gs {:.1}m/s, {:.0}W, remaining {:?}%, required {:.1}%, margin {:.1}% -> {:?}",
            distance, speed, power, remaining_pct, required_pct, margin_pct, tier
        );

        EnergyEstimate {
            distance_home_m: distance,
            groundspeed_mps: speed,
            time_to_home_s: time_to_home,
            power_w: power,
            remaining_pct,
            required_pct,
            margin_pct,
            cell_voltage,
            reachable_m,
            tier,
        }
    }

    /// The more conservative of the reported percentage and a linear
    /// per-cell voltage estimate.
    fn remaining_pct(&self, reported: Option<u8>, cell_voltage: Option<f64>) -> Option<f64> {
        let c = &self.cfg;
        let by_voltage = cell_voltage.map(|v| {
            let full = c.nominal_voltage / c.cells.max(1) as f64;
            let span = (full - c.empty_cell_voltage).max(0.01);
            ((v - c.empty_cell_voltage) / span * 100.0).clamp(0.0, 100.0)
        });
        match (reported.map(f64::from), by_voltage) {
            (Some(r), Some(v)) => Some(r.min(v)),
            (r, v) => r.or(v),
        }
    }

    /// Response for a CRITICAL estimate. `excluded` rejects sites inside
    /// no-fly volumes.
    pub fn critical_response(
        &self,
        est: &EnergyEstimate,
        position: &GeoPoint,
        excluded: impl Fn(&GeoPoint) -> bool,
    ) -> EnergyResponse {
        if est.can_return() {
            return EnergyResponse::Rth;
        }
        EnergyResponse::Land { site: self.search_landing_site(position, est.reachable_m, excluded) }
    }

    /// Nearest configured site within `reachable_m` that `excluded` accepts.
    pub fn search_landing_site(
        &self,
        from: &GeoPoint,
        reachable_m: f64,
        excluded: impl Fn(&GeoPoint) -> bool,
    ) -> Option<GeoPoint> {
        let mut best: Option<(f64, GeoPoint)> = None;
        for site in &self.cfg.landing_sites {
            let d = geo::distance_m(from, site);
            if d > reachable_m || excluded(site) {
                continue;
            }
            if best.map(|(bd, _)| d < bd).unwrap_or(true) {
                best = Some((d, *site));
            }
        }
        debug!("landing site search: {} candidates, picked {:?}", self.cfg.landing_sites.len(), best);
        best.map(|(_, s)| s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::destination;
    use wing_proto::telemetry::{BatteryStatus, NedVelocity};

    fn home() -> GeoPoint {
        GeoPoint::new(21.028511, 105.804817)
    }

    fn snap_at(pos: GeoPoint, speed: f64, battery: BatteryStatus) -> TelemetrySnapshot {
        TelemetrySnapshot {
            lat: pos.lat,
            lon: pos.lon,
            alt_m: 100.0,
            velocity: NedVelocity { vn: speed, ve: 0.0, vd: 0.0 },
            battery,
            ..Default::default()
        }
    }

    fn small_pack() -> EnergyConfig {
        EnergyConfig { capacity_mah: 5000.0, ..Default::default() }
    }

    #[test]
    fn far_from_home_on_a_quarter_pack_lands() {
        let mut cfg = small_pack();
        let pos = destination(&home(), 2000.0, 45.0);
        let near_site = destination(&pos, 500.0, 180.0);
        let far_site = destination(&pos, 3000.0, 0.0);
        cfg.landing_sites = vec![far_site, near_site];
        let mut engine = EnergyBudgetEngine::new(cfg, home());

        let battery = BatteryStatus { voltage: Some(14.8), current: Some(30.0), remaining: Some(25) };
        let est = engine.update(&snap_at(pos, 15.0, battery));

        assert!((est.distance_home_m - 2000.0).abs() < 1.0);
        assert_eq!(est.remaining_pct, Some(25.0));
        assert!(est.margin_pct < 0.0, "margin {:.1}", est.margin_pct);
        assert_eq!(est.tier, EnergyTier::Critical);

        let searched = std::cell::Cell::new(0);
        let resp = engine.critical_response(&est, &pos, |_| {
            searched.set(searched.get() + 1);
            false
        });
        assert!(searched.get() > 0);
        match resp {
            EnergyResponse::Land { site: Some(site) } => {
                assert!(geo::distance_m(&site, &near_site) < 1.0);
            }
            other => panic!("expected LAND at the near site, got {other:?}"),
        }
    }

    #[test]
    fn critical_but_reachable_returns_home() {
        let mut engine = EnergyBudgetEngine::new(small_pack(), home());
        let pos = destination(&home(), 300.0, 90.0);
        let battery = BatteryStatus { voltage: Some(14.8), current: Some(10.0), remaining: Some(18) };
        let est = engine.update(&snap_at(pos, 15.0, battery));
        assert_eq!(est.tier, EnergyTier::Critical);
        assert!(est.can_return());
        assert_eq!(engine.critical_response(&est, &pos, |_| false), EnergyResponse::Rth);
    }

    #[test]
    fn excluded_sites_are_skipped_and_none_means_land_in_place() {
        let mut cfg = small_pack();
        let pos = destination(&home(), 2000.0, 45.0);
        cfg.landing_sites = vec![destination(&pos, 200.0, 0.0)];
        let engine = EnergyBudgetEngine::new(cfg, home());
        assert_eq!(engine.search_landing_site(&pos, 1000.0, |_| true), None);
        assert_eq!(engine.search_landing_site(&pos, 100.0, |_| false), None);
        assert!(engine.search_landing_site(&pos, 1000.0, |_| false).is_some());
    }

    #[test]
    fn tiers_follow_margin_thresholds() {
        let mut engine = EnergyBudgetEngine::new(EnergyConfig::default(), home());
        let battery = |r| BatteryStatus { voltage: None, current: None, remaining: Some(r) };
        assert_eq!(engine.update(&snap_at(home(), 0.0, battery(90))).tier, EnergyTier::Ok);
        assert_eq!(engine.update(&snap_at(home(), 0.0, battery(25))).tier, EnergyTier::Warning);
        assert_eq!(engine.update(&snap_at(home(), 0.0, battery(15))).tier, EnergyTier::Critical);
    }

    #[test]
    fn no_battery_report_is_unknown_not_critical() {
        let mut engine = EnergyBudgetEngine::new(EnergyConfig::default(), home());
        let far = destination(&home(), 2_000.0, 90.0);
        let est = engine.update(&snap_at(far, 15.0, BatteryStatus::default()));
        assert_eq!(est.tier, EnergyTier::Unknown);
        assert!(!est.is_known());
        assert_eq!(est.remaining_pct, None);

        // the first real report takes over
        let battery = BatteryStatus { voltage: None, current: None, remaining: Some(90) };
        assert_eq!(engine.update(&snap_at(far, 15.0, battery)).tier, EnergyTier::Ok);
    }

    #[test]
    fn cell_voltage_collapse_forces_critical() {
        let mut engine = EnergyBudgetEngine::new(EnergyConfig::default(), home());
        let battery = BatteryStatus { voltage: Some(12.8), current: Some(5.0), remaining: Some(80) };
        let est = engine.update(&snap_at(home(), 0.0, battery));
        assert!((est.cell_voltage.unwrap() - 3.2).abs() < 1e-3);
        assert_eq!(est.tier, EnergyTier::Critical);
    }

    #[test]
    fn sagging_voltage_is_more_conservative_than_reported_percent() {
        let mut engine = EnergyBudgetEngine::new(EnergyConfig::default(), home());
        // 3.45 V/cell is 37.5 % of the way from empty to nominal
        let battery = BatteryStatus { voltage: Some(13.8), current: None, remaining: Some(70) };
        let est = engine.update(&snap_at(home(), 0.0, battery));
        let r = est.remaining_pct.unwrap();
        assert!(r > 30.0 && r < 40.0, "{r}");
    }

    #[test]
    fn groundspeed_is_smoothed_and_floored() {
        let mut engine = EnergyBudgetEngine::new(EnergyConfig::default(), home());
        let pos = destination(&home(), 1000.0, 0.0);
        let b = BatteryStatus { remaining: Some(80), ..Default::default() };
        assert_eq!(engine.update(&snap_at(pos, 20.0, b)).groundspeed_mps, 20.0);
        let est = engine.update(&snap_at(pos, 10.0, b));
        assert!((est.groundspeed_mps - 17.0).abs() < 1e-9);
        let mut fresh = EnergyBudgetEngine::new(EnergyConfig::default(), home());
        assert_eq!(fresh.update(&snap_at(pos, 0.5, b)).groundspeed_mps, 5.0);
    }
}
