use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::anomaly::AnomalyKind;

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProviderKind {
    Slack,
    Teams,
    Discord,
    Googlechat,
    Generic,
}

/// A webhook destination persisted as an ordinary store row.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NotificationProvider {
    pub id: Uuid,
    pub kind: ProviderKind,
    pub webhook_url: String,
    pub enabled: bool,
    /// Empty list subscribes to every anomaly kind.
    #[serde(default)]
    pub subscribed_alert_kinds: Vec<AnomalyKind>,
}

impl NotificationProvider {
    pub fn subscribed_to(&self, kind: AnomalyKind) -> bool {
        self.enabled
            && (self.subscribed_alert_kinds.is_empty()
                || self.subscribed_alert_kinds.contains(&kind))
    }
}
