//! Downstream dispatchers for merged batches.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Url;
use rf_batch::{Dispatcher, MergedBatch};
use std::time::Duration;

/// POSTs each merged batch as JSON to a work-queue endpoint.
#[derive(Clone)]
pub struct HttpDispatcher {
    http: reqwest::Client,
    url: Url,
    auth_token: Option<String>,
}

impl HttpDispatcher {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url.trim()).map_err(|e| anyhow!("invalid dispatch url: {e}"))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url,
            auth_token: None,
        })
    }

    pub fn with_auth_token(mut self, auth_token: Option<String>) -> Self {
        self.auth_token = auth_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    fn authorized_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

pub fn dispatch_payload(batch: &MergedBatch) -> serde_json::Value {
    serde_json::json!({
        "routing_context": batch.routing_context,
        "sender": batch.sender,
        "text": batch.text,
        "metadata": batch.metadata,
        "batch": {
            "fragment_count": batch.fragment_count,
            "span_millis": batch.span_millis,
            "first_enqueued_at_millis": batch.first_enqueued_at_millis,
            "last_enqueued_at_millis": batch.last_enqueued_at_millis,
        }
    })
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    fn name(&self) -> &str {
        "http"
    }

    async fn dispatch(&self, batch: &MergedBatch) -> Result<()> {
        let response = self
            .authorized_request(self.http.post(self.url.clone()))
            .json(&dispatch_payload(batch))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "dispatch to {} failed: status={} body={}",
                self.url,
                status,
                body
            ));
        }
        Ok(())
    }
}

/// Logs merged batches instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDispatcher;

#[async_trait]
impl Dispatcher for LogDispatcher {
    fn name(&self) -> &str {
        "log"
    }

    async fn dispatch(&self, batch: &MergedBatch) -> Result<()> {
        tracing::info!(
            sender = %batch.sender,
            routing_context = %batch.routing_context,
            fragment_count = batch.fragment_count,
            span_millis = batch.span_millis,
            text = %batch.text,
            "merged batch"
        );
        Ok(())
    }
}
