//! Signed outbound webhooks: the notification webhook and the automation
//! dispatch job both post through [`WebhookClient`].

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value as JsonValue;
use sha2::Sha256;
use tracing::{debug, warn};

use attestor_core::defaults::{WEBHOOK_EVENT_HEADER, WEBHOOK_SIGNATURE_HEADER, WEBHOOK_TIMEOUT_SECS};
use attestor_core::{Error, EvidenceNotification, Notifier, Result};

type HmacSha256 = Hmac<Sha256>;

/// `sha256=<hex>` HMAC of `body` under `secret`.
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Internal(format!("invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// POSTs JSON bodies to one URL, signing them when a secret is configured.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookClient {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .build()?;
        Ok(Self::with_client(client, url, secret))
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            client,
            url: url.into(),
            secret,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Deliver one event. Non-2xx responses are errors.
    pub async fn deliver(&self, event_type: &str, payload: &JsonValue) -> Result<u16> {
        let body = serde_json::to_vec(payload)?;

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header(WEBHOOK_EVENT_HEADER, event_type);
        if let Some(secret) = &self.secret {
            request = request.header(WEBHOOK_SIGNATURE_HEADER, sign_payload(secret, &body)?);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Request(format!(
                "webhook {} returned {}: {}",
                self.url,
                status.as_u16(),
                text.chars().take(200).collect::<String>()
            )));
        }
        debug!(url = %self.url, event_type, status = status.as_u16(), "Webhook delivered");
        Ok(status.as_u16())
    }
}

/// Delivers evidence notifications to an external webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: WebhookClient,
}

impl WebhookNotifier {
    pub fn new(client: WebhookClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &EvidenceNotification) -> Result<()> {
        let payload = serde_json::to_value(notification)?;
        let event_type = notification.status.event_type();
        self.client
            .deliver(event_type, &payload)
            .await
            .map(|_| ())
            .inspect_err(|e| {
                warn!(
                    event_type,
                    evidence_id = %notification.evidence_id,
                    error = %e,
                    "Notification webhook failed"
                )
            })
    }
}
