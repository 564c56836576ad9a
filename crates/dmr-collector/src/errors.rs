// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the collector.
//!
//! Line classification and correlation never fail: malformed input is dropped
//! and reported through logs only. Everything that can fail loudly lives here.

use reqwest::StatusCode;
use std::path::PathBuf;

/// Errors raised while assembling or validating the collector configuration.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Errors from the durable offline queue.
///
/// The in-memory queue has already been updated when one of these is
/// returned; only the on-disk snapshot is stale.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue file {path} I/O error: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize queue snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("No leased queue item with id {0}")]
    UnknownLease(u64),
    #[error("Queue flush task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Outcome of a failed delivery attempt (or series of attempts).
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The API rejected the bearer credential. Retrying cannot help.
    #[error("Authentication rejected by API ({0})")]
    Unauthorized(StatusCode),
    /// A single attempt failed in a way that may succeed later.
    #[error("Transient delivery failure: {0}")]
    Transient(String),
    /// Every configured attempt failed transiently.
    #[error("Failed to deliver after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    #[error("Failed to build request payload: {0}")]
    Payload(String),
    /// Shutdown started before the record was acknowledged.
    #[error("Delivery interrupted by shutdown")]
    Cancelled,
}

impl DeliveryError {
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::Payload(_))
    }
}

/// Errors raised while executing a remote command.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CommandError {
    #[error("Unknown command type: {0}")]
    UnknownType(String),
    #[error("{0}")]
    InvalidCommand(&'static str),
}

/// Unrecoverable startup errors of the collector service.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
