// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Interfaces to the audio and display subsystems, which live outside this
//! crate, plus no-op implementations for hosts without them.

use std::path::PathBuf;
use std::time::Duration;

/// Opaque identifier of an in-progress recording.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordingHandle(pub String);

/// Out-of-process audio capture keyed by `(slot, source, destination)`.
///
/// `begin` is called synchronously when a transmission opens and must only
/// *start* the recording. `end` and `cleanup` may block and are run off the
/// async executor.
pub trait AudioRecorder: Send + Sync {
    fn begin(&self, slot: u8, source: u32, destination: u32) -> Option<RecordingHandle>;
    /// Stops the recording and returns the finished file, if any.
    fn end(&self, handle: RecordingHandle) -> Option<PathBuf>;
    /// Removes recordings older than `max_age`; returns how many went.
    fn cleanup(&self, max_age: Duration) -> usize;
}

/// Fire-and-forget status sink. Implementations must not block.
pub trait StatusDisplay: Send + Sync {
    fn slot_activity(&self, slot: u8, active: bool);
    fn show_dmr_data(&self, line: &str);
    fn api_status(&self, connected: bool);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAudioRecorder;

impl AudioRecorder for NoopAudioRecorder {
    fn begin(&self, _slot: u8, _source: u32, _destination: u32) -> Option<RecordingHandle> {
        None
    }

    fn end(&self, _handle: RecordingHandle) -> Option<PathBuf> {
        None
    }

    fn cleanup(&self, _max_age: Duration) -> usize {
        0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStatusDisplay;

impl StatusDisplay for NoopStatusDisplay {
    fn slot_activity(&self, _slot: u8, _active: bool) {}

    fn show_dmr_data(&self, _line: &str) {}

    fn api_status(&self, _connected: bool) {}
}
