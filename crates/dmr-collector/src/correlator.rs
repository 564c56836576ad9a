// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Correlation of classified log events into transmissions.
//!
//! A transmission opens on a voice header, collects RSSI samples for its slot
//! and closes on the next voice end seen on the same slot. At most one
//! transmission is open per `(slot, radio_id)` key. The correlator is owned by
//! a single consumer task; it has no interior locking.

use crate::classifier::{CallHeader, DestinationKind, EmergencyEvent, LogEvent, SignalSample, VoiceEnd};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// `(slot, radio_id)`
pub type CorrelationKey = (u8, u32);

/// A voice transmission, open or finalized.
#[derive(Debug, Clone, PartialEq)]
pub struct Transmission {
    pub slot: u8,
    pub radio_id: u32,
    pub destination_kind: DestinationKind,
    pub destination_id: u32,
    pub start_time: NaiveDateTime,
    pub end_time: Option<NaiveDateTime>,
    /// Seconds, as reported by the host at close.
    pub duration: Option<f64>,
    /// Last sample seen while open.
    pub rssi: Option<i32>,
    pub ber: Option<f64>,
}

impl Transmission {
    #[must_use]
    pub fn open(header: &CallHeader) -> Self {
        Transmission {
            slot: header.slot,
            radio_id: header.radio_id,
            destination_kind: header.destination_kind,
            destination_id: header.destination_id,
            start_time: header.timestamp,
            end_time: None,
            duration: None,
            rssi: None,
            ber: None,
        }
    }

    #[must_use]
    pub fn key(&self) -> CorrelationKey {
        (self.slot, self.radio_id)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.end_time.is_some()
    }

    fn close(&mut self, end: &VoiceEnd) {
        self.end_time = Some(end.timestamp);
        self.duration = Some(end.duration);
        self.ber = Some(end.ber);
    }
}

/// Receiver of everything the correlator emits.
///
/// Every call happens synchronously inside the correlator operation that
/// triggered it, so side effects started in `transmission_opened` have been
/// initiated by the time the operation returns.
pub trait CorrelatorSink {
    fn transmission_opened(&mut self, transmission: &Transmission);
    fn transmission_closed(&mut self, transmission: Transmission);
    /// A newer voice header replaced this still-open transmission.
    fn transmission_abandoned(&mut self, _transmission: Transmission) {}
    fn data_header(&mut self, header: CallHeader);
    fn emergency(&mut self, event: EmergencyEvent);
}

/// Everything a [`Correlator`] can emit, as a value.
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    Opened(Transmission),
    Closed(Transmission),
    Abandoned(Transmission),
    Data(CallHeader),
    Emergency(EmergencyEvent),
}

impl CorrelatorSink for Vec<Emission> {
    fn transmission_opened(&mut self, transmission: &Transmission) {
        self.push(Emission::Opened(transmission.clone()));
    }

    fn transmission_closed(&mut self, transmission: Transmission) {
        self.push(Emission::Closed(transmission));
    }

    fn transmission_abandoned(&mut self, transmission: Transmission) {
        self.push(Emission::Abandoned(transmission));
    }

    fn data_header(&mut self, header: CallHeader) {
        self.push(Emission::Data(header));
    }

    fn emergency(&mut self, event: EmergencyEvent) {
        self.push(Emission::Emergency(event));
    }
}

#[derive(Debug)]
struct OpenEntry {
    // Monotonic open order; breaks ties between radios sharing a slot.
    seq: u64,
    transmission: Transmission,
}

/// Keyed state machine over open transmissions.
#[derive(Debug, Default)]
pub struct Correlator {
    open: HashMap<CorrelationKey, OpenEntry>,
    next_seq: u64,
}

impl Correlator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes a classified event to the matching operation.
    pub fn process<S: CorrelatorSink>(&mut self, event: LogEvent, sink: &mut S) {
        match event {
            LogEvent::VoiceStart(header) => self.on_start(header, sink),
            LogEvent::VoiceEnd(end) => self.on_end(end, sink),
            LogEvent::SignalSample(sample) => self.on_signal(sample),
            LogEvent::DataHeader(header) => self.on_data(header, sink),
            LogEvent::Emergency(event) => self.on_emergency(event, sink),
        }
    }

    pub fn on_start<S: CorrelatorSink>(&mut self, header: CallHeader, sink: &mut S) {
        let transmission = Transmission::open(&header);
        let key = transmission.key();
        info!(
            "CORRELATOR | Voice transmission started: Slot {}, Radio {} -> {} {}",
            header.slot, header.radio_id, header.destination_kind, header.destination_id
        );
        if let Some(previous) = self.open.remove(&key) {
            let abandoned = previous.transmission;
            warn!(
                "CORRELATOR | Abandoning open transmission without voice end: Slot {}, Radio {} -> {} {}, started {}",
                abandoned.slot,
                abandoned.radio_id,
                abandoned.destination_kind,
                abandoned.destination_id,
                abandoned.start_time
            );
            sink.transmission_abandoned(abandoned);
        }
        sink.transmission_opened(&transmission);

        let seq = self.next_seq;
        self.next_seq += 1;
        self.open.insert(key, OpenEntry { seq, transmission });
    }

    /// Updates the RSSI of the transmission currently open on the sample's slot.
    pub fn on_signal(&mut self, sample: SignalSample) {
        match self.latest_on_slot(sample.slot) {
            Some(key) => {
                if let Some(entry) = self.open.get_mut(&key) {
                    entry.transmission.rssi = Some(sample.rssi);
                }
            }
            None => debug!("CORRELATOR | RSSI sample on idle slot {} discarded", sample.slot),
        }
    }

    pub fn on_end<S: CorrelatorSink>(&mut self, end: VoiceEnd, sink: &mut S) {
        let Some(entry) = self
            .latest_on_slot(end.slot)
            .and_then(|key| self.open.remove(&key))
        else {
            debug!("CORRELATOR | Voice end on slot {} without open transmission discarded", end.slot);
            return;
        };

        let mut transmission = entry.transmission;
        transmission.close(&end);
        info!(
            "CORRELATOR | Voice transmission ended: Slot {}, Duration {}s, BER {}%",
            end.slot, end.duration, end.ber
        );
        sink.transmission_closed(transmission);
    }

    pub fn on_data<S: CorrelatorSink>(&mut self, header: CallHeader, sink: &mut S) {
        info!(
            "CORRELATOR | Data transmission: Slot {}, Radio {} -> {} {}",
            header.slot, header.radio_id, header.destination_kind, header.destination_id
        );
        sink.data_header(header);
    }

    pub fn on_emergency<S: CorrelatorSink>(&mut self, event: EmergencyEvent, sink: &mut S) {
        warn!("CORRELATOR | EMERGENCY detected on Slot {}!", event.slot);
        sink.emergency(event);
    }

    #[must_use]
    pub fn get(&self, key: CorrelationKey) -> Option<&Transmission> {
        self.open.get(&key).map(|entry| &entry.transmission)
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Empties the live set, returning whatever was still open.
    pub fn take_open(&mut self) -> Vec<Transmission> {
        let mut entries: Vec<OpenEntry> = self.open.drain().map(|(_, entry)| entry).collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.transmission).collect()
    }

    fn latest_on_slot(&self, slot: u8) -> Option<CorrelationKey> {
        self.open
            .iter()
            .filter(|(_, entry)| entry.transmission.slot == slot)
            .max_by_key(|(_, entry)| entry.seq)
            .map(|(key, _)| *key)
    }
}
