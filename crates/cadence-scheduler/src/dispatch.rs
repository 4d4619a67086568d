//! Reminder delivery: notification senders the scheduler can be wired to.
//! Supports: HTTP Webhook (JSON POST) and a log-only sender.

use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::config::NotifyConfig;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::NotificationSender;
use cadence_core::types::{Occurrence, PartyRef, ReminderRule};

/// JSON body posted for one reminder.
pub fn reminder_payload(
    recipient: &PartyRef,
    occurrence: &Occurrence,
    rule: &ReminderRule,
) -> serde_json::Value {
    serde_json::json!({
        "recipient": recipient.key(),
        "routine_id": occurrence.routine_id,
        "occurrence_id": occurrence.id,
        "start": occurrence.start.to_rfc3339(),
        "end": occurrence.end.to_rfc3339(),
        "rule_id": rule.id,
        "lead_minutes": rule.lead_minutes,
        "channel": rule.channel,
    })
}

/// Generic HTTP webhook: POST with JSON body.
pub struct WebhookSender {
    client: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
}

impl WebhookSender {
    pub fn new(url: &str, headers: Vec<(String, String)>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            headers,
        }
    }
}

#[async_trait]
impl NotificationSender for WebhookSender {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, recipient: &PartyRef, occurrence: &Occurrence, rule: &ReminderRule) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&reminder_payload(recipient, occurrence, rule));
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| CadenceError::Delivery(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::info!("✅ Reminder webhook sent to {} for {}", recipient, occurrence.id);
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(CadenceError::Delivery(format!("Webhook error {status}: {body}")))
        }
    }
}

/// Writes reminders to the log only. Used when no transport is configured.
pub struct LogSender;

#[async_trait]
impl NotificationSender for LogSender {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, recipient: &PartyRef, occurrence: &Occurrence, rule: &ReminderRule) -> Result<()> {
        tracing::info!(
            "📢 Reminder '{}' for {}: {} starts at {}",
            rule.id,
            recipient,
            occurrence.id,
            occurrence.start.format("%Y-%m-%d %H:%M UTC")
        );
        Ok(())
    }
}

/// Build the sender described by the notify config.
pub fn sender_from_config(config: &NotifyConfig) -> Arc<dyn NotificationSender> {
    match config.webhook_url.as_deref() {
        Some(url) if !url.is_empty() => {
            tracing::info!("🌐 Reminders go to webhook {}", url);
            Arc::new(WebhookSender::new(url, config.webhook_headers.clone()))
        }
        _ => {
            tracing::info!("📝 No webhook configured, reminders are logged only");
            Arc::new(LogSender)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn occurrence() -> Occurrence {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        Occurrence {
            id: "occ-1".into(),
            routine_id: "rtn-1".into(),
            start,
            end: start + chrono::Duration::minutes(30),
            status: cadence_core::types::OccurrenceStatus::Scheduled,
            created_at: start,
            updated_at: start,
        }
    }

    #[test]
    fn test_payload_shape() {
        let mut rule = ReminderRule::new("r15", 15, cadence_core::types::RecipientScope::AllParticipants);
        rule.channel = Some("email".into());
        let payload = reminder_payload(&PartyRef::team("design"), &occurrence(), &rule);
        assert_eq!(payload["recipient"], "team:design");
        assert_eq!(payload["occurrence_id"], "occ-1");
        assert_eq!(payload["lead_minutes"], 15);
        assert_eq!(payload["channel"], "email");
        assert_eq!(payload["start"], "2024-01-01T09:00:00+00:00");
    }

    #[test]
    fn test_sender_from_config() {
        let mut config = NotifyConfig::default();
        assert_eq!(sender_from_config(&config).name(), "log");
        config.webhook_url = Some("http://localhost:9/hook".into());
        assert_eq!(sender_from_config(&config).name(), "webhook");
    }

    #[tokio::test]
    async fn test_webhook_unreachable_is_delivery_error() {
        let sender = WebhookSender::new("http://127.0.0.1:9/unreachable", vec![]);
        let rule = ReminderRule::new("r15", 15, cadence_core::types::RecipientScope::AllParticipants);
        let result = sender.send(&PartyRef::user("alice"), &occurrence(), &rule).await;
        assert!(matches!(result, Err(CadenceError::Delivery(_))));
    }
}
