// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Classification of single MMDVMHost log lines into typed DMR events.
//!
//! The host writes free-form lines such as
//!
//! ```text
//! M: 2024-01-01 12:00:00.000 DMR Slot 1, received voice header from 2222001 to TG 1
//! M: 2024-01-01 12:00:05.500 DMR Slot 1, received voice end of transmission, 5.3s, BER: 1.20%
//! ```
//!
//! [`classify`] recognizes the handful of shapes the collector cares about and
//! returns `None` for everything else, including lines cut short by a read that
//! raced the writer or lines whose numbers do not parse.

use chrono::NaiveDateTime;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::trace;

/// Timestamp layout used by MMDVMHost (`2024-01-01 12:00:00.000`).
pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

const VOICE_HEADER: &str = r"M:\s+(\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}\.\d{3})\s+DMR Slot (\d+),\s+received voice header from (\d+) to (TG|PC) (\d+)";
const VOICE_END: &str = r"M:\s+(\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}\.\d{3})\s+DMR Slot (\d+),\s+received voice end of transmission,\s+(\d+\.\d+)s,\s+BER: (\d+\.\d+)%";
const SIGNAL_SAMPLE: &str = r"DMR Slot (\d+),\s+.*?RSSI:\s+(-?\d+)";
const DATA_HEADER: &str = r"M:\s+(\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}\.\d{3})\s+DMR Slot (\d+),\s+received data header from (\d+) to (TG|PC) (\d+)";
const EMERGENCY: &str = r"M:\s+(\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}\.\d{3})\s+DMR Slot (\d+),.*?Emergency";

/// The two destination kinds a DMR call can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationKind {
    #[serde(rename = "TG")]
    Talkgroup,
    #[serde(rename = "PC")]
    PrivateCall,
}

impl DestinationKind {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "TG" => Some(Self::Talkgroup),
            "PC" => Some(Self::PrivateCall),
            _ => None,
        }
    }

    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::Talkgroup => "TG",
            Self::PrivateCall => "PC",
        }
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Header of a voice or data call: who is talking to whom, on which slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallHeader {
    pub timestamp: NaiveDateTime,
    pub slot: u8,
    pub radio_id: u32,
    pub destination_kind: DestinationKind,
    pub destination_id: u32,
}

/// End of a voice call. The log line carries no radio id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceEnd {
    pub timestamp: NaiveDateTime,
    pub slot: u8,
    /// Seconds.
    pub duration: f64,
    /// Bit error rate, percent.
    pub ber: f64,
}

/// Signal strength reported for whatever is active on a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalSample {
    pub slot: u8,
    pub rssi: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmergencyEvent {
    pub timestamp: NaiveDateTime,
    pub slot: u8,
}

/// A typed event extracted from one log line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogEvent {
    VoiceStart(CallHeader),
    VoiceEnd(VoiceEnd),
    SignalSample(SignalSample),
    DataHeader(CallHeader),
    Emergency(EmergencyEvent),
}

struct Patterns {
    voice_header: Regex,
    voice_end: Regex,
    signal_sample: Regex,
    data_header: Regex,
    emergency: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        #[allow(clippy::expect_used)]
        let compile = |pattern: &str| Regex::new(pattern).expect("static log pattern is valid");
        Patterns {
            voice_header: compile(VOICE_HEADER),
            voice_end: compile(VOICE_END),
            signal_sample: compile(SIGNAL_SAMPLE),
            data_header: compile(DATA_HEADER),
            emergency: compile(EMERGENCY),
        }
    })
}

/// Classifies a single log line.
///
/// Patterns are tried in a fixed order (voice header, voice end, signal sample,
/// data header, emergency) and the first match wins. A line that matches a
/// pattern but carries an unparsable field is dropped entirely.
#[must_use]
pub fn classify(line: &str) -> Option<LogEvent> {
    let patterns = patterns();

    if let Some(caps) = patterns.voice_header.captures(line) {
        return call_header(&caps).map(LogEvent::VoiceStart).or_else(|| {
            trace!("Dropping malformed voice header line: {line}");
            None
        });
    }

    if let Some(caps) = patterns.voice_end.captures(line) {
        return voice_end(&caps).map(LogEvent::VoiceEnd).or_else(|| {
            trace!("Dropping malformed voice end line: {line}");
            None
        });
    }

    if let Some(caps) = patterns.signal_sample.captures(line) {
        return signal_sample(&caps).map(LogEvent::SignalSample);
    }

    if let Some(caps) = patterns.data_header.captures(line) {
        return call_header(&caps).map(LogEvent::DataHeader);
    }

    if let Some(caps) = patterns.emergency.captures(line) {
        return emergency(&caps).map(LogEvent::Emergency);
    }

    None
}

/// Parses an MMDVMHost timestamp; tolerates repeated spaces between date and time.
#[must_use]
pub fn parse_log_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&normalized, LOG_TIMESTAMP_FORMAT).ok()
}

fn field<T: FromStr>(caps: &Captures<'_>, index: usize) -> Option<T> {
    caps.get(index)?.as_str().parse().ok()
}

fn timestamp(caps: &Captures<'_>) -> Option<NaiveDateTime> {
    parse_log_timestamp(caps.get(1)?.as_str())
}

fn call_header(caps: &Captures<'_>) -> Option<CallHeader> {
    Some(CallHeader {
        timestamp: timestamp(caps)?,
        slot: field(caps, 2)?,
        radio_id: field(caps, 3)?,
        destination_kind: DestinationKind::from_token(caps.get(4)?.as_str())?,
        destination_id: field(caps, 5)?,
    })
}

fn voice_end(caps: &Captures<'_>) -> Option<VoiceEnd> {
    let duration: f64 = field(caps, 3)?;
    let ber: f64 = field(caps, 4)?;
    if !duration.is_finite() || !ber.is_finite() {
        return None;
    }
    Some(VoiceEnd {
        timestamp: timestamp(caps)?,
        slot: field(caps, 2)?,
        duration,
        ber,
    })
}

fn signal_sample(caps: &Captures<'_>) -> Option<SignalSample> {
    Some(SignalSample {
        slot: field(caps, 1)?,
        rssi: field(caps, 2)?,
    })
}

fn emergency(caps: &Captures<'_>) -> Option<EmergencyEvent> {
    Some(EmergencyEvent {
        timestamp: timestamp(caps)?,
        slot: field(caps, 2)?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    const HEADER: &str =
        "M: 2024-01-01 12:00:00.000 DMR Slot 1, received voice header from 2222001 to TG 1";
    const END: &str = "M: 2024-01-01 12:00:05.500 DMR Slot 1, received voice end of transmission, 5.3s, BER: 1.20%";

    fn ts(h: u32, m: u32, s: u32, ms: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_milli_opt(h, m, s, ms)
            .unwrap()
    }

    #[test]
    fn test_voice_header() {
        assert_eq!(
            classify(HEADER),
            Some(LogEvent::VoiceStart(CallHeader {
                timestamp: ts(12, 0, 0, 0),
                slot: 1,
                radio_id: 2_222_001,
                destination_kind: DestinationKind::Talkgroup,
                destination_id: 1,
            }))
        );
    }

    #[test]
    fn test_private_call_header() {
        let line = "M: 2024-01-01 12:00:00.000 DMR Slot 2, received voice header from 3100001 to PC 3100002";
        let Some(LogEvent::VoiceStart(header)) = classify(line) else {
            panic!("expected voice start");
        };
        assert_eq!(header.slot, 2);
        assert_eq!(header.destination_kind, DestinationKind::PrivateCall);
        assert_eq!(header.destination_id, 3_100_002);
    }

    #[test]
    fn test_voice_end() {
        assert_eq!(
            classify(END),
            Some(LogEvent::VoiceEnd(VoiceEnd {
                timestamp: ts(12, 0, 5, 500),
                slot: 1,
                duration: 5.3,
                ber: 1.2,
            }))
        );
    }

    #[test]
    fn test_signal_sample() {
        let line = "M: 2024-01-01 12:00:01.000 DMR Slot 2, RSSI: -73 dBm";
        assert_eq!(
            classify(line),
            Some(LogEvent::SignalSample(SignalSample { slot: 2, rssi: -73 }))
        );
    }

    #[test]
    fn test_data_header() {
        let line = "M: 2024-01-01 12:01:00.000 DMR Slot 2, received data header from 2222002 to PC 2222003";
        let Some(LogEvent::DataHeader(header)) = classify(line) else {
            panic!("expected data header");
        };
        assert_eq!(header.radio_id, 2_222_002);
        assert_eq!(header.destination_kind, DestinationKind::PrivateCall);
    }

    #[test]
    fn test_emergency() {
        let line = "M: 2024-01-01 12:02:00.000 DMR Slot 1, Emergency alarm received";
        assert_eq!(
            classify(line),
            Some(LogEvent::Emergency(EmergencyEvent {
                timestamp: ts(12, 2, 0, 0),
                slot: 1,
            }))
        );
    }

    #[test]
    fn test_unrelated_lines() {
        assert_eq!(classify(""), None);
        assert_eq!(classify("I: 2024-01-01 12:00:00.000 MMDVMHost-20230101 is running"), None);
        assert_eq!(
            classify("M: 2024-01-01 12:00:00.000 DMR Slot 1, received RF late entry"),
            None
        );
    }

    #[test]
    fn test_truncated_line_is_dropped() {
        assert_eq!(
            classify("M: 2024-01-01 12:00:00.000 DMR Slot 1, received voice header from 2222001 to TG"),
            None
        );
        assert_eq!(
            classify("M: 2024-01-01 12:00:05.500 DMR Slot 1, received voice end of transmission, 5.3s, BER: 1.2"),
            None
        );
    }

    #[test]
    fn test_malformed_numbers_drop_the_line() {
        // radio id does not fit in 32 bits
        let line = "M: 2024-01-01 12:00:00.000 DMR Slot 1, received voice header from 99999999999 to TG 1";
        assert_eq!(classify(line), None);

        // slot does not fit in 8 bits
        let line = "M: 2024-01-01 12:00:00.000 DMR Slot 300, received voice header from 2222001 to TG 1";
        assert_eq!(classify(line), None);

        // impossible calendar date
        let line = "M: 2024-13-45 12:00:00.000 DMR Slot 1, received voice header from 2222001 to TG 1";
        assert_eq!(classify(line), None);
    }

    #[test]
    fn test_parse_log_timestamp() {
        assert_eq!(
            parse_log_timestamp("2024-01-01 12:00:05.500"),
            Some(ts(12, 0, 5, 500))
        );
        assert_eq!(
            parse_log_timestamp("2024-01-01   12:00:05.500"),
            Some(ts(12, 0, 5, 500))
        );
        assert_eq!(parse_log_timestamp("not a timestamp"), None);
    }

    proptest! {
        #[test]
        fn classify_never_panics(line in "\\PC*") {
            let _ = classify(&line);
        }

        #[test]
        fn truncated_header_never_misclassifies_as_end(cut in 0usize..HEADER.len()) {
            let event = classify(&HEADER[..cut]);
            prop_assert!(!matches!(event, Some(LogEvent::VoiceEnd(_))));
        }
    }
}
