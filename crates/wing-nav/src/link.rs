//! RC / ground-link staleness and GPS integrity scoring.
//!
//! The monitor only reports. RC loss is left to the flight controller's own
//! failsafe and a GPS anomaly is surfaced to the pilot as an alert; neither
//! results in an autonomous command from here.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use wing_proto::{GeoPoint, TelemetrySnapshot};

use crate::geo;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyWeights {
    pub position_jump: f64,
    pub velocity_disagreement: f64,
    pub satellite_drop: f64,
    pub hdop_spike: f64,
    pub fix_loss: f64,
    pub low_satellites: f64,
}

impl Default for AnomalyWeights {
    fn default() -> Self {
        Self {
            position_jump: 30.0,
            velocity_disagreement: 25.0,
            satellite_drop: 20.0,
            hdop_spike: 15.0,
            fix_loss: 30.0,
            low_satellites: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub rc_timeout_ms: u64,
    pub gcs_timeout_ms: u64,

    pub anomaly_threshold: f64,
    /// Score must fall below this before a flagged anomaly clears.
    pub anomaly_clear: f64,
    pub decay: f64,
    pub jump_m: f64,
    pub velocity_disagreement_mps: f64,
    /// A drop from at or above this count to below it is suspicious.
    pub satellite_floor: u8,
    pub min_satellites: u8,
    pub hdop_spike: f32,
    pub alert_interval_ms: i64,
    pub weights: AnomalyWeights,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            rc_timeout_ms: 1_500,
            gcs_timeout_ms: 5_000,
            anomaly_threshold: 50.0,
            anomaly_clear: 30.0,
            decay: 0.85,
            jump_m: 50.0,
            velocity_disagreement_mps: 10.0,
            satellite_floor: 4,
            min_satellites: 6,
            hdop_spike: 3.0,
            alert_interval_ms: 5_000,
            weights: AnomalyWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySignal {
    PositionJump,
    VelocityDisagreement,
    SatelliteDrop,
    HdopSpike,
    FixLoss,
    LowSatellites,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkHealth {
    pub rc_age_ms: Option<u64>,
    pub gcs_age_ms: Option<u64>,
    pub rc_lost: bool,
    pub gcs_lost: bool,
    pub fix_type: u8,
    pub hdop: f32,
    pub satellites: u8,
    /// 0..=100
    pub anomaly_score: f64,
    pub gps_anomaly: bool,
    /// Signals that fired on this update.
    pub signals: Vec<AnomalySignal>,
    /// Pilot-facing text, rate limited. Only set while an anomaly is flagged.
    pub alert: Option<String>,
}

pub struct LinkHealthMonitor {
    cfg: LinkConfig,
    home: GeoPoint,
    prev: Option<TelemetrySnapshot>,
    last_good_fix: Option<GeoPoint>,
    score: f64,
    flagged: bool,
    last_alert_ms: Option<i64>,
}

impl LinkHealthMonitor {
    pub fn new(cfg: LinkConfig, home: GeoPoint) -> Self {
        Self {
            cfg,
            home,
            prev: None,
            last_good_fix: None,
            score: 0.0,
            flagged: false,
            last_alert_ms: None,
        }
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn update(&mut self, snap: &TelemetrySnapshot) -> LinkHealth {
        let signals = self.signals(snap);
        let w = &self.cfg.weights;
        let delta: f64 = signals
            .iter()
            .map(|s| match s {
                AnomalySignal::PositionJump => w.position_jump,
                AnomalySignal::VelocityDisagreement => w.velocity_disagreement,
                AnomalySignal::SatelliteDrop => w.satellite_drop,
                AnomalySignal::HdopSpike => w.hdop_spike,
                AnomalySignal::FixLoss => w.fix_loss,
                AnomalySignal::LowSatellites => w.low_satellites,
            })
            .sum();
        self.score = (self.score * self.cfg.decay + delta).clamp(0.0, 100.0);

        let was = self.flagged;
        if self.score >= self.cfg.anomaly_threshold {
            self.flagged = true;
        } else if self.score < self.cfg.anomaly_clear {
            self.flagged = false;
        }
        if self.flagged != was {
            if self.flagged {
                warn!("gps: anomaly flagged (score {:.0}, signals {:?})", self.score, signals);
            } else {
                info!("gps: anomaly cleared (score {:.0})", self.score);
            }
        }
        if !self.flagged && snap.gps.has_3d_fix() {
            self.last_good_fix = Some(snap.position());
        }

        let alert = if self.flagged { self.alert_text(snap.ts_unix_ms, &signals) } else { None };

        let links = &snap.links;
        let rc_lost = !links.rc_present || links.rc_age_ms.map(|a| a > self.cfg.rc_timeout_ms).unwrap_or(true);
        let gcs_lost = !links.gcs_present || links.gcs_age_ms.map(|a| a > self.cfg.gcs_timeout_ms).unwrap_or(true);

        self.prev = Some(snap.clone());

        LinkHealth {
            rc_age_ms: links.rc_age_ms,
            gcs_age_ms: links.gcs_age_ms,
            rc_lost,
            gcs_lost,
            fix_type: snap.gps.fix_type,
            hdop: snap.gps.hdop,
            satellites: snap.gps.satellites,
            anomaly_score: self.score,
            gps_anomaly: self.flagged,
            signals,
            alert,
        }
    }

    fn signals(&self, cur: &TelemetrySnapshot) -> Vec<AnomalySignal> {
        let c = &self.cfg;
        let mut out = Vec::new();

        if !cur.gps.has_3d_fix() {
            out.push(AnomalySignal::FixLoss);
        }

        let Some(prev) = &self.prev else {
            return out;
        };

        let dt = (cur.ts_unix_ms - prev.ts_unix_ms) as f64 / 1000.0;
        if dt > 0.0 && prev.gps.has_3d_fix() && cur.gps.has_3d_fix() {
            let moved = geo::distance_m(&prev.position(), &cur.position());
            // only a jump if the previous speed cannot explain it
            if moved > c.jump_m && moved > 2.0 * prev.groundspeed_mps() * dt {
                out.push(AnomalySignal::PositionJump);
            }
            let gps_speed = moved / dt;
            if (gps_speed - cur.groundspeed_mps()).abs() > c.velocity_disagreement_mps {
                out.push(AnomalySignal::VelocityDisagreement);
            }
        }

        if prev.gps.satellites >= c.satellite_floor && cur.gps.satellites < c.satellite_floor {
            out.push(AnomalySignal::SatelliteDrop);
        }
        if cur.gps.hdop > c.hdop_spike && prev.gps.hdop <= c.hdop_spike {
            out.push(AnomalySignal::HdopSpike);
        }
        if prev.gps.satellites >= c.min_satellites && cur.gps.satellites < c.min_satellites {
            out.push(AnomalySignal::LowSatellites);
        }
        out
    }

    fn alert_text(&mut self, now_ms: i64, signals: &[AnomalySignal]) -> Option<String> {
        if let Some(last) = self.last_alert_ms {
            if now_ms - last < self.cfg.alert_interval_ms {
                return None;
            }
        }
        self.last_alert_ms = Some(now_ms);

        let mut text = format!("GPS ANOMALY score {:.0}", self.score);
        if !signals.is_empty() {
            let names: Vec<String> = signals.iter().map(|s| format!("{:?}", s)).collect();
            text.push_str(&format!(" [{}]", names.join(",")));
        }
        if let Some(fix) = &self.last_good_fix {
            text.push_str(&format!(
                " | home {:.0}deg {:.1}km",
                geo::bearing_deg(fix, &self.home),
                geo::distance_m(fix, &self.home) / 1000.0
            ));
        }
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::destination;
    use wing_proto::telemetry::{GpsStatus, LinkStatus, NedVelocity};

    fn home() -> GeoPoint {
        GeoPoint::new(21.028511, 105.804817)
    }

    fn good(ts: i64, pos: GeoPoint) -> TelemetrySnapshot {
        TelemetrySnapshot {
            ts_unix_ms: ts,
            lat: pos.lat,
            lon: pos.lon,
            alt_m: 120.0,
            velocity: NedVelocity { vn: 15.0, ve: 0.0, vd: 0.0 },
            gps: GpsStatus { fix_type: 3, satellites: 12, hdop: 0.9 },
            links: LinkStatus { rc_present: true, rc_age_ms: Some(40), gcs_present: true, gcs_age_ms: Some(300) },
            ..Default::default()
        }
    }

    #[test]
    fn jump_with_velocity_disagreement_flags_anomaly() {
        let mut mon = LinkHealthMonitor::new(LinkConfig::default(), home());
        let p0 = destination(&home(), 800.0, 0.0);
        let h = mon.update(&good(0, p0));
        assert!(!h.gps_anomaly);

        // 300 m in one second while the INS says 15 m/s
        let p1 = destination(&p0, 300.0, 90.0);
        let h = mon.update(&good(1_000, p1));
        assert_eq!(h.signals, vec![AnomalySignal::PositionJump, AnomalySignal::VelocityDisagreement]);
        assert!((h.anomaly_score - 55.0).abs() < 1e-9);
        assert!(h.gps_anomaly);
        let alert = h.alert.expect("alert text");
        assert!(alert.contains("GPS ANOMALY score 55"), "{alert}");
        assert!(alert.contains("home 180deg 0.8km"), "{alert}");
    }

    #[test]
    fn steady_flight_stays_clean() {
        let mut mon = LinkHealthMonitor::new(LinkConfig::default(), home());
        let mut p = home();
        for i in 0..20 {
            let h = mon.update(&good(i * 1000, p));
            assert!(h.signals.is_empty(), "step {i}: {:?}", h.signals);
            assert!(!h.gps_anomaly);
            p = destination(&p, 15.0, 0.0);
        }
    }

    #[test]
    fn anomaly_decays_and_clears_with_hysteresis() {
        let mut mon = LinkHealthMonitor::new(LinkConfig::default(), home());
        let p0 = home();
        mon.update(&good(0, p0));
        let p1 = destination(&p0, 300.0, 90.0);
        assert!(mon.update(&good(1_000, p1)).gps_anomaly);

        // 55 * 0.85^n: 46.8, 39.7, 33.8, 28.7
        let mut p = p1;
        let mut flags = Vec::new();
        for i in 2..6 {
            p = destination(&p, 15.0, 90.0);
            let mut s = good(i * 1_000, p);
            s.velocity = NedVelocity { vn: 0.0, ve: 15.0, vd: 0.0 };
            flags.push(mon.update(&s).gps_anomaly);
        }
        assert_eq!(flags, vec![true, true, true, false]);
    }

    #[test]
    fn satellite_and_hdop_signals_fire_on_transitions_only() {
        let mut mon = LinkHealthMonitor::new(LinkConfig::default(), home());
        mon.update(&good(0, home()));
        let mut s = good(1_000, home());
        s.velocity = NedVelocity::default();
        s.gps = GpsStatus { fix_type: 3, satellites: 3, hdop: 4.5 };
        let h = mon.update(&s);
        assert_eq!(
            h.signals,
            vec![AnomalySignal::SatelliteDrop, AnomalySignal::HdopSpike, AnomalySignal::LowSatellites]
        );
        assert!((h.anomaly_score - 45.0).abs() < 1e-9);

        let mut s2 = s.clone();
        s2.ts_unix_ms = 2_000;
        assert!(mon.update(&s2).signals.is_empty());
    }

    #[test]
    fn fix_loss_counts_every_update_and_caps_at_100() {
        let mut mon = LinkHealthMonitor::new(LinkConfig::default(), home());
        let mut s = good(0, home());
        s.gps.fix_type = 1;
        let mut last = 0.0;
        for i in 0..40 {
            s.ts_unix_ms = i * 1000;
            last = mon.update(&s).anomaly_score;
        }
        assert!(last <= 100.0 && last > 99.0, "{last}");
    }

    #[test]
    fn link_loss_uses_independent_thresholds() {
        let mut mon = LinkHealthMonitor::new(LinkConfig::default(), home());
        let mut s = good(0, home());
        s.links = LinkStatus { rc_present: true, rc_age_ms: Some(200), gcs_present: true, gcs_age_ms: Some(9_000) };
        let h = mon.update(&s);
        assert!(!h.rc_lost);
        assert!(h.gcs_lost);

        s.links = LinkStatus { rc_present: false, rc_age_ms: None, gcs_present: true, gcs_age_ms: Some(100) };
        let h = mon.update(&s);
        assert!(h.rc_lost);
        assert!(!h.gcs_lost);
    }

    #[test]
    fn alerts_are_rate_limited() {
        let mut mon = LinkHealthMonitor::new(LinkConfig::default(), home());
        let mut s = good(0, home());
        s.gps.fix_type = 0;
        let mut alerts = 0;
        for i in 0..20 {
            s.ts_unix_ms = i * 500;
            if mon.update(&s).alert.is_some() {
                alerts += 1;
            }
        }
        // flagged from the 2nd update (30, 55.5, ...), one alert per 5 s
        assert_eq!(alerts, 2);
    }
}
