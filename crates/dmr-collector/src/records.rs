// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed records and their wire projections.

use crate::correlator::Transmission;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};

/// Timestamp layout accepted by the API: no sub-second part, no zone.
pub const API_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// JSON object sent as the body (or form fields) of one request.
pub type Payload = Map<String, Value>;

#[must_use]
pub fn format_api_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(API_TIMESTAMP_FORMAT).to_string()
}

mod api_timestamp {
    use super::{format_api_timestamp, API_TIMESTAMP_FORMAT};
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_api_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, API_TIMESTAMP_FORMAT).map_err(serde::de::Error::custom)
    }
}

/// One logical API resource per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    #[serde(rename = "transmission")]
    Transmission,
    #[serde(rename = "sms")]
    Sms,
    #[serde(rename = "gps")]
    Gps,
    #[serde(rename = "emergency")]
    Emergency,
    #[serde(rename = "radio-status")]
    RadioStatus,
}

impl RecordKind {
    /// Resource path relative to the API endpoint.
    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            RecordKind::Transmission => "/transmissions",
            RecordKind::Sms => "/sms",
            RecordKind::Gps => "/gps",
            RecordKind::Emergency => "/emergencies",
            RecordKind::RadioStatus => "/radio-status",
        }
    }

    /// Status updates are only meaningful live, so they are never persisted.
    #[must_use]
    pub fn is_queueable(self) -> bool {
        !matches!(self, RecordKind::RadioStatus)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Transmission => "transmission",
            RecordKind::Sms => "sms",
            RecordKind::Gps => "gps",
            RecordKind::Emergency => "emergency",
            RecordKind::RadioStatus => "radio-status",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioStatus {
    Online,
    Offline,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyType {
    EmergencyButton,
    Panic,
    Fire,
    Medical,
    Help,
    Sos,
    Generic,
}

/// A finalized transmission plus the recording made while it was open.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmissionRecord {
    pub transmission: Transmission,
    pub artifact: Option<PathBuf>,
}

#[derive(Serialize)]
struct TransmissionFields {
    radio_id: u32,
    talkgroup_id: u32,
    timeslot: u8,
    start_time: String,
    end_time: Option<String>,
    duration: Option<f64>,
    rssi: Option<i32>,
    ber: Option<f64>,
}

impl From<&Transmission> for TransmissionFields {
    fn from(t: &Transmission) -> Self {
        TransmissionFields {
            radio_id: t.radio_id,
            talkgroup_id: t.destination_id,
            timeslot: t.slot,
            start_time: format_api_timestamp(&t.start_time),
            end_time: t.end_time.as_ref().map(format_api_timestamp),
            duration: t.duration,
            rssi: t.rssi,
            ber: t.ber,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsMessage {
    pub from_radio_id: u32,
    pub to_radio_id: Option<u32>,
    pub to_talkgroup_id: Option<u32>,
    pub message: String,
    #[serde(with = "api_timestamp")]
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsPosition {
    pub radio_id: u32,
    pub latitude: f64,
    pub longitude: f64,
    /// Metres.
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub accuracy: Option<f64>,
    #[serde(with = "api_timestamp")]
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyReport {
    /// Zero when the log line carries no radio identifier.
    pub radio_id: u32,
    pub emergency_type: EmergencyType,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(with = "api_timestamp")]
    pub triggered_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioStatusUpdate {
    pub radio_id: u32,
    pub status: RadioStatus,
    pub rssi: Option<i32>,
    pub ber: Option<f64>,
}

/// Anything the delivery client can send.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Transmission(TransmissionRecord),
    Sms(SmsMessage),
    Gps(GpsPosition),
    Emergency(EmergencyReport),
    RadioStatus(RadioStatusUpdate),
}

impl Record {
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Transmission(_) => RecordKind::Transmission,
            Record::Sms(_) => RecordKind::Sms,
            Record::Gps(_) => RecordKind::Gps,
            Record::Emergency(_) => RecordKind::Emergency,
            Record::RadioStatus(_) => RecordKind::RadioStatus,
        }
    }

    /// Projects the record onto the field set its resource expects.
    pub fn payload(&self) -> Result<Payload, serde_json::Error> {
        match self {
            Record::Transmission(record) => {
                to_payload(&TransmissionFields::from(&record.transmission))
            }
            Record::Sms(sms) => to_payload(sms),
            Record::Gps(gps) => to_payload(gps),
            Record::Emergency(emergency) => to_payload(emergency),
            Record::RadioStatus(status) => to_payload(status),
        }
    }

    /// Detaches the wire form from the typed record.
    pub fn envelope(&self) -> Result<Envelope, serde_json::Error> {
        Ok(Envelope {
            kind: self.kind(),
            payload: self.payload()?,
            artifact_path: self.artifact().map(Path::to_path_buf),
        })
    }

    #[must_use]
    pub fn artifact(&self) -> Option<&Path> {
        match self {
            Record::Transmission(record) => record.artifact.as_deref(),
            _ => None,
        }
    }

    /// Key fields for log lines.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Record::Transmission(record) => {
                let t = &record.transmission;
                format!(
                    "transmission slot {} radio {} -> {} {} at {}",
                    t.slot,
                    t.radio_id,
                    t.destination_kind,
                    t.destination_id,
                    format_api_timestamp(&t.start_time)
                )
            }
            Record::Sms(sms) => format!(
                "sms from {} at {}",
                sms.from_radio_id,
                format_api_timestamp(&sms.timestamp)
            ),
            Record::Gps(gps) => format!(
                "gps radio {} at {}",
                gps.radio_id,
                format_api_timestamp(&gps.timestamp)
            ),
            Record::Emergency(emergency) => format!(
                "emergency radio {} at {}",
                emergency.radio_id,
                format_api_timestamp(&emergency.triggered_at)
            ),
            Record::RadioStatus(status) => {
                format!("radio-status radio {} {:?}", status.radio_id, status.status)
            }
        }
    }
}

/// Everything needed to (re)send one record: its resource, its fields and the
/// path of an attached file. File bytes are read at send time only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: RecordKind,
    pub payload: Payload,
    pub artifact_path: Option<PathBuf>,
}

fn to_payload<T: Serialize>(value: &T) -> Result<Payload, serde_json::Error> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
            "expected an object payload, got {other}"
        ))),
    }
}
