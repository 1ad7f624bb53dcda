//! Best-effort webhook delivery with bounded retries.
//!
//! One POST per terminal task state, retried on transport error or non-2xx
//! with exponential backoff (`2^attempt` seconds) up to the configured cap.
//! A final failure is logged and swallowed; delivery never affects the
//! task's state.

use std::time::Duration;

use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::observability::LogEvent;

/// Webhook sender shared by all tasks.
pub struct WebhookDelivery {
    client: reqwest::Client,
    max_retries: u32,
}

impl WebhookDelivery {
    /// Build a sender with a per-attempt timeout and a retry cap.
    pub fn new(timeout: Duration, max_retries: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| {
                Error::InfrastructureUnavailable(format!("cannot build webhook client: {err}"))
            })?;
        Ok(Self {
            client,
            max_retries,
        })
    }

    /// Deliver `{task_id, status, data}` to `webhook_url`.
    ///
    /// Returns whether any attempt got a 2xx. At most `1 + max_retries`
    /// POSTs are made.
    pub async fn deliver(
        &self,
        task_id: &str,
        webhook_url: &str,
        status: &str,
        data: Value,
    ) -> bool {
        let payload = json!({
            "task_id": task_id,
            "status": status,
            "data": data,
        });
        for attempt in 0..=self.max_retries {
            let outcome = self.client.post(webhook_url).json(&payload).send().await;
            match outcome {
                Ok(response) if response.status().is_success() => {
                    tracing::info!(
                        event = LogEvent::WebhookSent.as_str(),
                        task_id,
                        status_code = response.status().as_u16(),
                        attempt = attempt + 1,
                        "webhook delivered"
                    );
                    return true;
                }
                Ok(response) => {
                    tracing::warn!(
                        event = LogEvent::WebhookRetry.as_str(),
                        task_id,
                        status_code = response.status().as_u16(),
                        attempt = attempt + 1,
                        "webhook rejected"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        event = LogEvent::WebhookRetry.as_str(),
                        task_id,
                        attempt = attempt + 1,
                        error = %err,
                        "webhook attempt failed"
                    );
                }
            }
            if attempt < self.max_retries {
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
            }
        }
        tracing::error!(
            event = LogEvent::WebhookGivenUp.as_str(),
            task_id,
            url = webhook_url,
            attempts = self.max_retries + 1,
            "webhook delivery abandoned"
        );
        false
    }
}
