use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Descriptor produced by the platform's push service, submitted to
/// `POST /notifications/subscribe` so the server can deliver dose reminders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct PushSubscription {
    pub endpoint: String,
    pub keys: PushKeys,
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    pub expiration_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct PushKeys {
    pub p256dh: String,
    pub auth: String,
}

impl PushSubscription {
    pub fn is_expired(&self) -> bool {
        self.expiration_time.map(|t| t <= Utc::now()).unwrap_or(false)
    }
}
