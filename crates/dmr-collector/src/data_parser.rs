// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parsers for DMR short-data payloads: SMS text, positions, emergency
//! alerts and telemetry. All parsers are fail-soft.

use crate::records::{EmergencyType, GpsPosition, SmsMessage};
use chrono::NaiveDateTime;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

#[allow(clippy::expect_used)]
fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static pattern compiles")
}

// APRS `DDMM.mmN/DDDMM.mmW`, optionally followed by `/A=FFFFFF` (feet).
fn aprs_with_altitude() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        compile(r"([0-9]{2})([0-9]{2}\.[0-9]{2})([NS])/([0-9]{3})([0-9]{2}\.[0-9]{2})([EW])/A=([0-9]{6})")
    })
}

fn aprs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        compile(r"([0-9]{2})([0-9]{2}\.[0-9]{2})([NS])/([0-9]{3})([0-9]{2}\.[0-9]{2})([EW])")
    })
}

fn decimal_pair() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| compile(r"(-?[0-9]+\.[0-9]+),\s*(-?[0-9]+\.[0-9]+)"))
}

fn battery() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| compile(r"(?i)BATT[:\s]*([0-9]+\.?[0-9]*)V?"))
}

fn temperature() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| compile(r"(?i)TEMP[:\s]*(-?[0-9]+\.?[0-9]*)C?"))
}

const FEET_TO_METRES: f64 = 0.3048;

const EMERGENCY_KEYWORDS: [(&str, EmergencyType); 6] = [
    ("emergency", EmergencyType::EmergencyButton),
    ("panic", EmergencyType::Panic),
    ("fire", EmergencyType::Fire),
    ("medical", EmergencyType::Medical),
    ("help", EmergencyType::Help),
    ("sos", EmergencyType::Sos),
];

#[derive(Debug, Clone, PartialEq)]
pub struct SmsText {
    pub message: String,
}

impl SmsText {
    #[must_use]
    pub fn into_message(
        self,
        from_radio_id: u32,
        to_radio_id: Option<u32>,
        to_talkgroup_id: Option<u32>,
        timestamp: NaiveDateTime,
    ) -> SmsMessage {
        SmsMessage {
            from_radio_id,
            to_radio_id,
            to_talkgroup_id,
            message: self.message,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Whole metres.
    pub altitude: Option<f64>,
}

impl GpsFix {
    #[must_use]
    pub fn into_position(self, radio_id: u32, timestamp: NaiveDateTime) -> GpsPosition {
        GpsPosition {
            radio_id,
            latitude: self.latitude,
            longitude: self.longitude,
            altitude: self.altitude,
            speed: None,
            heading: None,
            accuracy: None,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Telemetry {
    pub battery_voltage: Option<f64>,
    pub temperature: Option<f64>,
}

fn decode(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .chars()
        .filter(|c| *c != char::REPLACEMENT_CHARACTER)
        .collect()
}

pub fn parse_sms(data: &[u8]) -> Option<SmsText> {
    let text: String = decode(data)
        .trim()
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .collect();
    if text.is_empty() {
        return None;
    }
    info!("PARSER | Parsed SMS: {text}");
    Some(SmsText { message: text })
}

pub fn parse_gps(data: &[u8]) -> Option<GpsFix> {
    let text = decode(data);

    if let Some(caps) = aprs_with_altitude().captures(&text) {
        let latitude = degrees_minutes(&caps[1], &caps[2], &caps[3])?;
        let longitude = degrees_minutes(&caps[4], &caps[5], &caps[6])?;
        let feet: u32 = caps[7].parse().ok()?;
        let altitude = (f64::from(feet) * FEET_TO_METRES).trunc();
        info!("PARSER | Parsed GPS with altitude: {latitude}, {longitude}, {altitude}m");
        return Some(GpsFix {
            latitude,
            longitude,
            altitude: Some(altitude),
        });
    }

    if let Some(caps) = aprs().captures(&text) {
        let latitude = degrees_minutes(&caps[1], &caps[2], &caps[3])?;
        let longitude = degrees_minutes(&caps[4], &caps[5], &caps[6])?;
        info!("PARSER | Parsed GPS: {latitude}, {longitude}");
        return Some(GpsFix {
            latitude,
            longitude,
            altitude: None,
        });
    }

    let caps = decimal_pair().captures(&text)?;
    let latitude: f64 = caps[1].parse().ok()?;
    let longitude: f64 = caps[2].parse().ok()?;
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        debug!("PARSER | Decimal position out of range: {latitude}, {longitude}");
        return None;
    }
    info!("PARSER | Parsed GPS (decimal): {latitude}, {longitude}");
    Some(GpsFix {
        latitude,
        longitude,
        altitude: None,
    })
}

fn degrees_minutes(degrees: &str, minutes: &str, hemisphere: &str) -> Option<f64> {
    let degrees: f64 = degrees.parse().ok()?;
    let minutes: f64 = minutes.parse().ok()?;
    let mut decimal = degrees + minutes / 60.0;
    if matches!(hemisphere, "S" | "W") {
        decimal = -decimal;
    }
    Some((decimal * 1_000_000.0).round() / 1_000_000.0)
}

/// Classifies alert text by the first known keyword it contains.
pub fn parse_emergency(data: &[u8]) -> EmergencyType {
    let text = decode(data).trim().to_lowercase();
    let emergency_type = EMERGENCY_KEYWORDS
        .iter()
        .find(|(keyword, _)| text.contains(keyword))
        .map_or(EmergencyType::Generic, |(_, kind)| *kind);
    warn!("PARSER | Parsed emergency: {emergency_type:?}");
    emergency_type
}

pub fn parse_telemetry(data: &[u8]) -> Option<Telemetry> {
    let text = decode(data);
    let telemetry = Telemetry {
        battery_voltage: battery()
            .captures(&text)
            .and_then(|caps| caps[1].parse().ok()),
        temperature: temperature()
            .captures(&text)
            .and_then(|caps| caps[1].parse().ok()),
    };
    if telemetry == Telemetry::default() {
        return None;
    }
    info!("PARSER | Parsed telemetry: {telemetry:?}");
    Some(telemetry)
}
