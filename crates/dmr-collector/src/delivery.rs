// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP delivery of records to the EasyDispatch API.
//!
//! Every request carries the bearer credential. An attempt succeeds only when
//! the response is 2xx *and* its JSON body has `"success": true`. HTTP 401
//! and 403 end delivery immediately; every other failure is retried according
//! to the [`RetryStrategy`] and, once attempts run out, queueable records are
//! handed to the [`QueueStore`]. Radio status updates are never queued and
//! get a single attempt.
//!
//! Once the client's cancel token fires no further request is sent: an
//! attempt in flight is abandoned and queueable records go straight to the
//! queue.

use crate::commands::{Command, CommandStatus};
use crate::errors::DeliveryError;
use crate::queue::QueueStore;
use crate::records::{Envelope, Payload, Record};
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// `n` attempts with no pause in between.
    Immediate(u32),
    /// `attempts` attempts, pausing `base * 2^(k-1)` after the k-th failure.
    /// There is no pause after the last attempt.
    ExponentialBackoff { attempts: u32, base: Duration },
}

impl RetryStrategy {
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            RetryStrategy::Immediate(attempts)
            | RetryStrategy::ExponentialBackoff { attempts, .. } => *attempts,
        }
    }

    /// Pause after the 1-based `attempt` failed, or `None` when it was the last.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.attempts() {
            return None;
        }
        match self {
            RetryStrategy::Immediate(_) => Some(Duration::ZERO),
            RetryStrategy::ExponentialBackoff { base, .. } => {
                let factor = 1_u32 << attempt.saturating_sub(1).min(16);
                Some(base.saturating_mul(factor))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Base URL, resource paths are appended to it.
    pub endpoint: String,
    pub api_key: String,
    pub timeout: Duration,
    pub retry_strategy: RetryStrategy,
    /// Identifies this collector when polling for commands.
    pub installation_id: String,
}

/// What happened to a record handed to [`DeliveryClient::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Kept for the drain loop.
    Queued,
    /// Not queueable and undeliverable; logged and discarded.
    Dropped,
}

#[derive(Clone)]
pub struct DeliveryClient {
    config: Arc<DeliveryConfig>,
    client: reqwest::Client,
    queue: Arc<QueueStore>,
    cancel_token: CancellationToken,
}

impl DeliveryClient {
    pub fn new(config: DeliveryConfig, queue: Arc<QueueStore>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        info!("DELIVERY | Initialized API client (endpoint: {})", config.endpoint);
        Ok(DeliveryClient {
            config: Arc::new(config),
            client,
            queue,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Stops network activity once `cancel_token` fires.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<QueueStore> {
        &self.queue
    }

    #[must_use]
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Delivers one record with retries, queueing it when every attempt
    /// failed transiently. An authentication failure is returned as an error
    /// and the record is neither retried nor queued.
    pub async fn deliver(&self, record: &Record) -> Result<DeliveryOutcome, DeliveryError> {
        let description = record.describe();
        let envelope = record
            .envelope()
            .map_err(|e| DeliveryError::Payload(e.to_string()))?;

        let strategy = if envelope.kind.is_queueable() {
            self.config.retry_strategy
        } else {
            RetryStrategy::Immediate(1)
        };
        match self.attempt_with(&envelope, strategy).await {
            Ok(body) => {
                info!("DELIVERY | Posted {description}: {}", summarize(&body));
                Ok(DeliveryOutcome::Delivered)
            }
            Err(e) if e.is_fatal() => {
                error!("DELIVERY | Giving up on {description}: {e}");
                Err(e)
            }
            Err(e) if envelope.kind.is_queueable() => {
                if matches!(e, DeliveryError::Cancelled) {
                    info!("DELIVERY | Shutting down, queueing {description}");
                } else {
                    error!("DELIVERY | Failed to post {description}: {e}");
                }
                if let Err(queue_error) = self.queue.enqueue_off_runtime(envelope).await {
                    error!("DELIVERY | {description} queued in memory only: {queue_error}");
                }
                Ok(DeliveryOutcome::Queued)
            }
            Err(e) => {
                error!("DELIVERY | Failed to post {description}, dropping it: {e}");
                Ok(DeliveryOutcome::Dropped)
            }
        }
    }

    /// Sends an envelope with retries and returns the acknowledging body.
    pub async fn attempt(&self, envelope: &Envelope) -> Result<Value, DeliveryError> {
        self.attempt_with(envelope, self.config.retry_strategy).await
    }

    async fn attempt_with(
        &self,
        envelope: &Envelope,
        strategy: RetryStrategy,
    ) -> Result<Value, DeliveryError> {
        let url = &self.url(envelope.kind.path());
        self.with_retry(envelope.kind.as_str(), strategy, || async move {
            let request = self.post_envelope(url, envelope).await;
            let body = execute(request).await?;
            require_success(body)
        })
        .await
    }

    /// Pending commands for this installation. Any failure yields an empty
    /// list; malformed entries are skipped.
    pub async fn fetch_commands(&self) -> Vec<Command> {
        let url = &self.url("/commands");
        let result = self
            .with_retry("commands", self.config.retry_strategy, || async move {
                let request = self
                    .client
                    .get(url)
                    .bearer_auth(&self.config.api_key)
                    .query(&[("raspberry_id", self.config.installation_id.as_str())]);
                execute(request).await
            })
            .await;

        let body = match result {
            Ok(body) => body,
            Err(e) => {
                warn!("COMMANDS | Failed to fetch pending commands: {e}");
                return Vec::new();
            }
        };
        let Some(Value::Array(entries)) = body.get("commands") else {
            return Vec::new();
        };
        let commands: Vec<Command> = entries
            .iter()
            .filter_map(|entry| match serde_json::from_value(entry.clone()) {
                Ok(command) => Some(command),
                Err(e) => {
                    warn!("COMMANDS | Skipping malformed command {entry}: {e}");
                    None
                }
            })
            .collect();
        info!("COMMANDS | Retrieved {} pending commands", commands.len());
        commands
    }

    /// Reports the result of a command. Not queued on failure.
    pub async fn report_command(
        &self,
        id: u64,
        status: CommandStatus,
        error_message: Option<&str>,
    ) -> Result<(), DeliveryError> {
        let url = &self.url(&format!("/commands/{id}/complete"));
        let body = &json!({ "status": status, "error_message": error_message });
        self.with_retry("command result", self.config.retry_strategy, || async move {
            let request = self
                .client
                .post(url)
                .bearer_auth(&self.config.api_key)
                .json(body);
            require_success(execute(request).await?)
        })
        .await?;
        info!("COMMANDS | Command result posted: {id} -> {status}");
        Ok(())
    }

    async fn with_retry<F, Fut>(
        &self,
        label: &str,
        strategy: RetryStrategy,
        mut send: F,
    ) -> Result<Value, DeliveryError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Value, DeliveryError>>,
    {
        let attempts = strategy.attempts();
        let mut attempt = 0;
        loop {
            if self.cancel_token.is_cancelled() {
                return Err(DeliveryError::Cancelled);
            }
            attempt += 1;
            let started = Instant::now();
            let result = tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!("DELIVERY | {label} attempt {attempt}/{attempts} interrupted");
                    return Err(DeliveryError::Cancelled);
                }
                result = send() => result,
            };
            let last_error = match result {
                Ok(body) => {
                    debug!(
                        "DELIVERY | {label} accepted in {} ms (attempt {attempt}/{attempts})",
                        started.elapsed().as_millis()
                    );
                    return Ok(body);
                }
                Err(DeliveryError::Transient(reason)) => reason,
                Err(e) => return Err(e),
            };
            warn!("DELIVERY | {label} attempt {attempt}/{attempts} failed: {last_error}");

            match strategy.delay_after(attempt) {
                Some(delay) => tokio::select! {
                    () = self.cancel_token.cancelled() => return Err(DeliveryError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                },
                None => {
                    return Err(DeliveryError::Exhausted {
                        attempts: attempt,
                        last_error,
                    })
                }
            }
        }
    }

    async fn post_envelope(&self, url: &str, envelope: &Envelope) -> RequestBuilder {
        let request = self.client.post(url).bearer_auth(&self.config.api_key);
        match envelope.artifact_path.as_deref() {
            Some(path) => match read_artifact(path).await {
                Some(part) => request.multipart(form(&envelope.payload, part)),
                None => request.json(&envelope.payload),
            },
            None => request.json(&envelope.payload),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.endpoint.trim_end_matches('/'))
    }
}

async fn read_artifact(path: &Path) -> Option<Part> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let file_name = path
                .file_name()
                .map_or_else(|| "audio".to_string(), |n| n.to_string_lossy().into_owned());
            Some(Part::bytes(bytes).file_name(file_name))
        }
        Err(e) => {
            warn!(
                "DELIVERY | Artifact {} unavailable, sending without it: {e}",
                path.display()
            );
            None
        }
    }
}

fn form(payload: &Payload, audio: Part) -> Form {
    payload
        .iter()
        .fold(Form::new(), |form, (key, value)| match value {
            Value::Null => form,
            Value::String(text) => form.text(key.clone(), text.clone()),
            other => form.text(key.clone(), other.to_string()),
        })
        .part("audio", audio)
}

async fn execute(request: RequestBuilder) -> Result<Value, DeliveryError> {
    let response = request
        .send()
        .await
        .map_err(|e| DeliveryError::Transient(describe_reqwest_error(&e)))?;
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        error!("DELIVERY | API authentication failed ({status})");
        return Err(DeliveryError::Unauthorized(status));
    }
    let text = response
        .text()
        .await
        .map_err(|e| DeliveryError::Transient(describe_reqwest_error(&e)))?;
    if !status.is_success() {
        return Err(DeliveryError::Transient(format!("HTTP {status}: {text}")));
    }
    serde_json::from_str(&text)
        .map_err(|e| DeliveryError::Transient(format!("unreadable response body: {e}")))
}

fn require_success(body: Value) -> Result<Value, DeliveryError> {
    if body.get("success") == Some(&Value::Bool(true)) {
        Ok(body)
    } else {
        Err(DeliveryError::Transient(format!(
            "API did not acknowledge: {body}"
        )))
    }
}

fn describe_reqwest_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("request timeout: {e}")
    } else if e.is_connect() {
        format!("connection error: {e}")
    } else {
        format!("request error: {e}")
    }
}

// Resource ids the API echoes back, for the success log line.
fn summarize(body: &Value) -> String {
    ["transmission_id", "sms_id", "emergency_id"]
        .iter()
        .find_map(|key| body.get(*key).map(|id| format!("{key}={id}")))
        .unwrap_or_else(|| "ok".to_string())
}
