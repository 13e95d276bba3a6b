use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One active timer as returned by `GET /timers/active`.
///
/// Only the identity and status are interpreted by this crate; everything else
/// the server sends is carried through untouched in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub id: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Pending alert as returned by `GET /timers/alerts/pending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: i64,
    pub timer_id: i64,
    #[serde(alias = "alert_minutes")]
    pub alert_threshold_minutes: u32,
    pub triggered_at: DateTime<Utc>,
    pub status: String,
    #[serde(default, alias = "timer")]
    pub timer_snapshot: Option<TimerSnapshot>,
}

impl AlertRecord {
    pub fn shown_key(&self) -> ShownAlertKey {
        ShownAlertKey::new(self.timer_id, self.alert_threshold_minutes)
    }
}

/// Deduplication key for surfaced alerts: `"{timer_id}:{threshold_minutes}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShownAlertKey(String);

impl ShownAlertKey {
    pub fn new(timer_id: i64, threshold_minutes: u32) -> Self {
        Self(format!("{}:{}", timer_id, threshold_minutes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShownAlertKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
