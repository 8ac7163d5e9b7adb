use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;

use crate::lodestone::scaler::Waker;

/// Connection lifecycle payload delivered to the webhook. `player` is set
/// when the sniff saw a LoginStart; `reason` only on abnormal ends.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEvent {
    pub client: String,
    pub host: String,
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

#[async_trait]
pub trait ConnectionNotifier: Send + Sync {
    async fn connected(&self, event: ConnectionEvent);
    async fn disconnected(&self, event: ConnectionEvent);
}

#[derive(Serialize)]
struct WebhookPayload {
    event: &'static str,
    #[serde(flatten)]
    info: ConnectionEvent,
}

/// Fire-and-forget JSON POSTs. Delivery failures are logged at debug and
/// never affect the connection being reported.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("webhook: build http client")?;
        Ok(Self { http, url })
    }

    async fn post(&self, event: &'static str, info: ConnectionEvent) {
        let payload = WebhookPayload { event, info };
        if let Err(err) = self.http.post(&self.url).json(&payload).send().await {
            tracing::debug!(url = %self.url, event, err = %err, "webhook: delivery failed");
        }
    }
}

#[async_trait]
impl ConnectionNotifier for WebhookNotifier {
    async fn connected(&self, event: ConnectionEvent) {
        self.post("connected", event).await;
    }

    async fn disconnected(&self, event: ConnectionEvent) {
        self.post("disconnected", event).await;
    }
}

#[derive(Serialize)]
struct WakeRequest<'a> {
    action: &'static str,
    waker_id: &'a str,
}

/// Waker that drives an external autoscaler over HTTP: `action=wake` must
/// bring the backend for `waker_id` to a dialable state, `action=sleep`
/// scales it back down.
pub struct WebhookWaker {
    http: reqwest::Client,
    url: String,
}

impl WebhookWaker {
    pub fn new(url: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("waker: build http client")?;
        Ok(Self { http, url })
    }

    async fn post(&self, action: &'static str, waker_id: &str) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(&self.url)
            .json(&WakeRequest { action, waker_id })
            .send()
            .await
            .with_context(|| format!("waker: {action} {waker_id}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("waker: {action} {waker_id} returned {}", resp.status());
        }
        Ok(())
    }
}

#[async_trait]
impl Waker for WebhookWaker {
    async fn wake(&self, waker_id: &str) -> anyhow::Result<()> {
        self.post("wake", waker_id).await
    }

    async fn sleep(&self, waker_id: &str) -> anyhow::Result<()> {
        self.post("sleep", waker_id).await
    }
}
