use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use resources::{
    anomaly::Anomaly,
    config::OperatorConfig,
    notify::{NotificationProvider, ProviderKind},
};
use serde_json::{json, Value as JsonValue};

use crate::{guard::EndpointGuard, store::MetricStore};

const WEBHOOK_RATE_LIMIT_RPS: u32 = 5;

/// Webhook fan-out for subscribed anomaly kinds. Provider rows live in the
/// store; nothing here owns them. Sends go through the same rate-limited,
/// circuit-broken, retried path as the other outbound calls.
#[derive(Clone)]
pub struct Notifier {
    http: reqwest::Client,
    guard: Arc<EndpointGuard>,
}

impl Notifier {
    pub fn new(config: &OperatorConfig) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.webhook_timeout_secs))
                .build()
                .with_context(|| "Failed to build webhook HTTP client")?,
            guard: Arc::new(EndpointGuard::new("webhook", WEBHOOK_RATE_LIMIT_RPS)),
        })
    }

    /// Provider-native message body; the single dispatch point over kinds.
    pub fn payload(kind: ProviderKind, title: &str, text: &str) -> JsonValue {
        match kind {
            ProviderKind::Slack => json!({ "text": format!("*{}*\n{}", title, text) }),
            ProviderKind::Teams => json!({
                "@type": "MessageCard",
                "@context": "http://schema.org/extensions",
                "summary": title,
                "themeColor": "E81123",
                "title": title,
                "text": text,
            }),
            ProviderKind::Discord => {
                json!({ "content": format!("**{}**\n{}", title, text) })
            },
            ProviderKind::Googlechat => {
                json!({ "text": format!("*{}*\n{}", title, text) })
            },
            ProviderKind::Generic => json!({
                "source": "smart-autoscaler",
                "title": title,
                "text": text,
            }),
        }
    }

    pub async fn send(
        &self,
        provider: &NotificationProvider,
        title: &str,
        text: &str,
    ) -> Result<()> {
        let payload = Self::payload(provider.kind, title, text);
        self.guard
            .retry(|| async {
                self.http
                    .post(&provider.webhook_url)
                    .json(&payload)
                    .send()
                    .await?
                    .error_for_status()?;
                Ok::<(), anyhow::Error>(())
            })
            .await
            .with_context(|| format!("Webhook {} rejected the message", provider.kind))
    }

    /// A visible provider-native message proving the webhook works.
    pub async fn send_test(&self, provider: &NotificationProvider) -> Result<()> {
        self.send(
            provider,
            "Smart autoscaler test",
            "This is a test notification; the webhook is wired up correctly.",
        )
        .await
    }

    /// Fan an anomaly out to every enabled, subscribed provider. Failures
    /// are logged per provider and never fail the loop.
    pub async fn broadcast(&self, store: &MetricStore, anomaly: &Anomaly) {
        let providers = match store.list_notifiers() {
            Ok(providers) => providers,
            Err(err) => {
                tracing::warn!("Failed to list notification providers: {}", err);
                return;
            },
        };
        for provider in providers
            .iter()
            .filter(|p| p.subscribed_to(anomaly.kind))
        {
            let title = format!("[{}] {}", anomaly.severity, anomaly.kind);
            if let Err(err) = self.send(provider, &title, &anomaly.description).await {
                tracing::warn!(
                    "Notification via {} ({}) failed: {:#}",
                    provider.kind,
                    provider.id,
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slack_payload_is_plain_text() {
        let payload = Notifier::payload(ProviderKind::Slack, "Alert", "pre-scaled");
        assert_eq!(payload["text"], "*Alert*\npre-scaled");
    }

    #[test]
    fn teams_payload_is_a_message_card() {
        let payload = Notifier::payload(ProviderKind::Teams, "Alert", "pre-scaled");
        assert_eq!(payload["@type"], "MessageCard");
        assert_eq!(payload["title"], "Alert");
        assert_eq!(payload["text"], "pre-scaled");
    }

    #[test]
    fn discord_payload_uses_content() {
        let payload = Notifier::payload(ProviderKind::Discord, "Alert", "pre-scaled");
        assert!(payload["content"].as_str().unwrap().contains("Alert"));
    }

    #[test]
    fn generic_payload_names_the_source() {
        let payload = Notifier::payload(ProviderKind::Generic, "Alert", "pre-scaled");
        assert_eq!(payload["source"], "smart-autoscaler");
    }
}
