use serde::{Deserialize, Serialize};

use crate::{FaultKind, Target, TelemetrySnapshot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultReport {
    pub ts_unix_ms: i64,
    pub stage: String,
    pub kind: FaultKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyTransition {
    pub ts_unix_ms: i64,
    pub from: String,
    pub to: String,
    pub command: Option<String>,
    pub reason: String,
}

/// Everything that leaves the vehicle, and everything the audit log records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UploadItem {
    Target(Target),
    Telemetry(TelemetrySnapshot),
    Fault(FaultReport),
    Safety(SafetyTransition),
}

impl UploadItem {
    pub fn label(&self) -> &'static str {
        match self {
            UploadItem::Target(_) => "target",
            UploadItem::Telemetry(_) => "telemetry",
            UploadItem::Fault(_) => "fault",
            UploadItem::Safety(_) => "safety",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_are_tagged_by_kind() {
        let item = UploadItem::Target(Target {
            timestamp: 1_700_000_000_000,
            class: "person".into(),
            confidence: 0.9,
            lat: 21.03,
            lon: 105.8,
            frame_id: 7,
        });
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["kind"], "target");
        assert_eq!(json["class"], "person");
        assert_eq!(item.label(), "target");
    }
}
