// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # DMR Collector
//!
//! Follows the MMDVM host log of a DMR hotspot, turns voice headers, voice
//! ends and RSSI samples into transmissions and delivers them to the
//! EasyDispatch API. Records that cannot be delivered are kept in a durable
//! offline queue and retried in the background.
//!
//! Data flow: [`tailer`] → [`classifier`] → [`correlator`] → [`delivery`]
//! → API, or [`queue`] → [`drain`] → API. [`service::Collector`] wires the
//! pieces together.

#![deny(clippy::all)]
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::todo,
        clippy::unimplemented
    )
)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]

/// Log line classification
pub mod classifier;

/// Audio and display interfaces
pub mod collaborators;

/// Remote commands and the helper tools that carry them out
pub mod commands;

/// Configuration management - YAML file, environment variables, and defaults
pub mod config;

pub mod correlator;

/// Parsers for SMS, GPS, emergency and telemetry payloads
pub mod data_parser;

/// HTTP delivery with retries and offline queueing
pub mod delivery;

pub mod drain;

pub mod errors;

/// Durable offline queue
pub mod queue;

pub mod records;

pub mod service;

/// MMDVM log follower
pub mod tailer;
