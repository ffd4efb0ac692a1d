use key_dispenser_redeem::{AuditEvent, AuditSink, LogAuditSink};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{error, info, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts every issued key to a chat-style webhook, in the background.
#[derive(Debug, Clone)]
pub struct WebhookAuditSink {
    webhook_url: String,
    client: reqwest::Client,
}

impl WebhookAuditSink {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

pub fn webhook_payload(event: &AuditEvent) -> Value {
    let who = event.identity.as_deref().unwrap_or("anonymous");
    json!({
        "content": format!("New key issued to `{who}`: `{}`", event.credential),
        "identity": event.identity,
        "credential": event.credential,
        "timestamp": event.timestamp.to_rfc3339(),
    })
}

impl AuditSink for WebhookAuditSink {
    fn record(&self, event: AuditEvent) {
        LogAuditSink.record(event.clone());

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to deliver webhook, skipping");
            return;
        };

        let payload = webhook_payload(&event);
        let client = self.client.clone();
        let webhook_url = self.webhook_url.clone();
        runtime.spawn(async move {
            match client
                .post(&webhook_url)
                .json(&payload)
                .timeout(WEBHOOK_TIMEOUT)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    info!(webhook_url, "Webhook called successfully");
                }
                Ok(response) => {
                    warn!(
                        webhook_url,
                        status = %response.status(),
                        "Webhook returned non-success status"
                    );
                }
                Err(error) => {
                    error!(webhook_url, ?error, "Failed to call webhook");
                }
            }
        });
    }
}
