//! Best-effort outbound alert sink. Failures are logged and swallowed; they
//! must never propagate into the aggregator's request path.

use tracing::warn;

pub struct AlertSink {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl AlertSink {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Posts `message` (plus optional target/agent context) to the configured
    /// webhook. A silent no-op when no webhook is configured; any transport
    /// or status error is logged, never returned.
    pub async fn send_alert(&self, message: &str, target: Option<&str>, agent: Option<&str>) {
        let Some(url) = self.webhook_url.as_ref().filter(|u| !u.is_empty()) else {
            return;
        };

        let body = serde_json::json!({
            "content": message,
            "target": target,
            "agent": agent,
        });

        match self.client.post(url).json(&body).send().await {
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), "alert webhook returned non-success status");
            }
            Err(e) => {
                warn!(error = %e, "alert webhook request failed");
            }
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unset_webhook_is_a_silent_no_op() {
        let sink = AlertSink::new(None);
        sink.send_alert("target down", Some("1"), Some("agent-1")).await;
    }
}
