//! HTTP client for the upstream backend: one POST per request, incremental
//! parse of the chunked SSE body, normalized events out.

use super::events::{EventParser, StreamEvent};
use crate::config::ApiConfig;
use crate::error::GatewayError;
use castor_schema::upstream::{StreamChunk, UpstreamEnvelope, UpstreamModelList};
use eventsource_stream::Eventsource;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;
use tracing::{debug, warn};
use url::Url;

/// An upstream stream that goes quiet for this long is treated as broken.
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const BODY_SNIPPET_MAX: usize = 300;

pub struct UpstreamClient {
    client: reqwest::Client,
    url: Url,
    models_url: Url,
    user_agent: String,
}

impl UpstreamClient {
    pub fn new(cfg: &ApiConfig) -> Self {
        // Streaming responses can run for many minutes; only the connect
        // phase gets a deadline here, idle detection happens per-read.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build upstream HTTP client");
        Self {
            client,
            url: cfg.url.clone(),
            models_url: cfg.models_url.clone(),
            user_agent: cfg.user_agent.clone(),
        }
    }

    /// POSTs the envelope and returns the status-checked streaming response.
    ///
    /// 403 is special-cased: the credential in use is burned and the caller
    /// must route through the pool's disable path.
    pub async fn start_stream(
        &self,
        access_token: &str,
        envelope: &UpstreamEnvelope,
    ) -> Result<reqwest::Response, GatewayError> {
        debug!(model = %envelope.model, request_id = %envelope.request_id, "posting upstream request");
        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(access_token)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .json(envelope)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(GatewayError::CredentialForbidden);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::UpstreamStatus {
                status,
                body: snippet(&body),
            });
        }
        Ok(response)
    }

    /// Reads the SSE body and forwards normalized events into `tx`.
    ///
    /// Send failures mean the client went away; the read loop stops quietly.
    /// Transport errors and idle timeouts surface as `UpstreamInterrupted` —
    /// events already sent stay committed.
    pub async fn pump_events(
        response: reqwest::Response,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), GatewayError> {
        let mut parser = EventParser::default();
        let source = response.bytes_stream().eventsource();
        let mut timed = std::pin::pin!(source.timeout(SSE_IDLE_TIMEOUT));

        while let Some(item) = timed.next().await {
            let event = match item {
                Ok(Ok(event)) => event,
                Ok(Err(e)) => {
                    return Err(GatewayError::UpstreamInterrupted(e.to_string()));
                }
                Err(_) => {
                    return Err(GatewayError::UpstreamInterrupted(format!(
                        "stream idle for more than {}s",
                        SSE_IDLE_TIMEOUT.as_secs()
                    )));
                }
            };

            if event.data.is_empty() || event.data == "[DONE]" {
                continue;
            }
            // Undecodable lines are skipped, not fatal.
            let Ok(chunk) = serde_json::from_str::<StreamChunk>(&event.data) else {
                warn!("skipping undecodable upstream SSE line: {:.60}...", event.data);
                continue;
            };

            for normalized in parser.feed(&chunk) {
                if tx.send(normalized).await.is_err() {
                    return Ok(());
                }
            }
        }

        for normalized in parser.finish() {
            if tx.send(normalized).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Buffers the whole stream for the non-streaming response paths.
    pub async fn collect_events(
        response: reqwest::Response,
    ) -> Result<Vec<StreamEvent>, GatewayError> {
        let (tx, mut rx) = mpsc::channel(32);
        let pump = tokio::spawn(Self::pump_events(response, tx));

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        pump.await
            .map_err(|e| GatewayError::UpstreamInterrupted(e.to_string()))??;
        Ok(events)
    }

    /// POST with an empty JSON body; the response maps model id to metadata.
    pub async fn fetch_models(
        &self,
        access_token: &str,
    ) -> Result<UpstreamModelList, GatewayError> {
        let response = self
            .client
            .post(self.models_url.clone())
            .bearer_auth(access_token)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .json(&json!({}))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(GatewayError::CredentialForbidden);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::UpstreamStatus {
                status,
                body: snippet(&body),
            });
        }
        Ok(response.json().await?)
    }
}

fn snippet(body: &str) -> String {
    match body.char_indices().nth(BODY_SNIPPET_MAX) {
        Some((idx, _)) => format!("{}...<truncated>", &body[..idx]),
        None => body.to_string(),
    }
}
