// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The running collector: wires the log tailer, correlator and delivery
//! client together and owns every background task.

use crate::classifier::{classify, CallHeader, EmergencyEvent};
use crate::collaborators::{AudioRecorder, RecordingHandle, StatusDisplay};
use crate::commands::{CommandExecutor, CommandPoller, ProcessRunner};
use crate::config::Config;
use crate::correlator::{CorrelationKey, Correlator, CorrelatorSink, Transmission};
use crate::delivery::{DeliveryClient, DeliveryOutcome};
use crate::drain::QueueDrainer;
use crate::errors::CollectorError;
use crate::queue::QueueStore;
use crate::records::{
    EmergencyReport, EmergencyType, RadioStatus, RadioStatusUpdate, Record, TransmissionRecord,
};
use crate::tailer::{LogTailer, TailerState};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Radio id used for emergencies; the log line does not name the radio.
pub const EMERGENCY_RADIO_ID: u32 = 0;

/// Work handed from the tailing task to the dispatcher.
#[derive(Debug)]
enum Dispatch {
    Closed {
        transmission: Transmission,
        recording: Option<RecordingHandle>,
    },
    Abandoned {
        transmission: Transmission,
        recording: Option<RecordingHandle>,
    },
    Status(RadioStatusUpdate),
    Emergency(EmergencyEvent),
}

/// Correlator sink living on the tailing task. Only starts work; anything
/// that can block goes through the channel.
struct DispatchSink {
    audio: Arc<dyn AudioRecorder>,
    display: Arc<dyn StatusDisplay>,
    recordings: HashMap<CorrelationKey, RecordingHandle>,
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl DispatchSink {
    fn send(&self, dispatch: Dispatch) {
        if let Err(e) = self.tx.send(dispatch) {
            error!("COLLECTOR | Dispatcher is gone, dropping {:?}", e.0);
        }
    }
}

impl CorrelatorSink for DispatchSink {
    fn transmission_opened(&mut self, transmission: &Transmission) {
        self.display.slot_activity(transmission.slot, true);
        if let Some(handle) = self.audio.begin(
            transmission.slot,
            transmission.radio_id,
            transmission.destination_id,
        ) {
            debug!("COLLECTOR | Recording {} started", handle.0);
            self.recordings.insert(transmission.key(), handle);
        }
        self.send(Dispatch::Status(RadioStatusUpdate {
            radio_id: transmission.radio_id,
            status: RadioStatus::Online,
            rssi: None,
            ber: None,
        }));
    }

    fn transmission_closed(&mut self, transmission: Transmission) {
        self.display.slot_activity(transmission.slot, false);
        let recording = self.recordings.remove(&transmission.key());
        self.send(Dispatch::Closed {
            transmission,
            recording,
        });
    }

    fn transmission_abandoned(&mut self, transmission: Transmission) {
        self.display.slot_activity(transmission.slot, false);
        let recording = self.recordings.remove(&transmission.key());
        self.send(Dispatch::Abandoned {
            transmission,
            recording,
        });
    }

    fn data_header(&mut self, header: CallHeader) {
        self.display.show_dmr_data(&format!(
            "Slot {} DATA {} -> {} {}",
            header.slot, header.radio_id, header.destination_kind, header.destination_id
        ));
    }

    fn emergency(&mut self, event: EmergencyEvent) {
        self.send(Dispatch::Emergency(event));
    }
}

/// Delivers what the tailing task produced, in order.
struct Dispatcher {
    client: DeliveryClient,
    audio: Arc<dyn AudioRecorder>,
    display: Arc<dyn StatusDisplay>,
}

impl Dispatcher {
    /// Runs until every sender is gone, so work queued before shutdown is
    /// still handled. After cancellation the client sends nothing, so the
    /// backlog is queued or dropped without waiting on the network.
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
        while let Some(dispatch) = rx.recv().await {
            self.handle(dispatch).await;
        }
        debug!("COLLECTOR | Dispatcher stopped");
    }

    async fn handle(&self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Closed {
                transmission,
                recording,
            } => {
                let artifact = self.finish_recording(recording).await;
                let record = Record::Transmission(TransmissionRecord {
                    transmission,
                    artifact,
                });
                self.deliver(&record).await;
            }
            Dispatch::Abandoned {
                transmission,
                recording,
            } => {
                if let Some(path) = self.finish_recording(recording).await {
                    discard_artifact(path).await;
                }
                debug!(
                    "COLLECTOR | Discarded abandoned transmission: Slot {}, Radio {}",
                    transmission.slot, transmission.radio_id
                );
            }
            Dispatch::Status(update) => {
                self.deliver(&Record::RadioStatus(update)).await;
            }
            Dispatch::Emergency(event) => {
                let record = Record::Emergency(EmergencyReport {
                    radio_id: EMERGENCY_RADIO_ID,
                    emergency_type: EmergencyType::EmergencyButton,
                    latitude: None,
                    longitude: None,
                    triggered_at: event.timestamp,
                });
                self.deliver(&record).await;
            }
        }
    }

    async fn deliver(&self, record: &Record) {
        let connected = matches!(
            self.client.deliver(record).await,
            Ok(DeliveryOutcome::Delivered)
        );
        self.display.api_status(connected);
    }

    async fn finish_recording(&self, recording: Option<RecordingHandle>) -> Option<PathBuf> {
        let handle = recording?;
        let audio = Arc::clone(&self.audio);
        match tokio::task::spawn_blocking(move || audio.end(handle)).await {
            Ok(artifact) => artifact,
            Err(e) => {
                error!("COLLECTOR | Audio recorder failed to stop: {e}");
                None
            }
        }
    }
}

async fn discard_artifact(path: PathBuf) {
    if let Err(e) = tokio::fs::remove_file(&path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("COLLECTOR | Failed to remove {}: {e}", path.display());
        }
    }
}

async fn cleanup_loop(
    audio: Arc<dyn AudioRecorder>,
    interval: Duration,
    max_age: Duration,
    cancel_token: CancellationToken,
) {
    while !cancel_token.is_cancelled() {
        let recorder = Arc::clone(&audio);
        match tokio::task::spawn_blocking(move || recorder.cleanup(max_age)).await {
            Ok(0) => {}
            Ok(removed) => info!("COLLECTOR | Removed {removed} old recordings"),
            Err(e) => error!("COLLECTOR | Audio cleanup failed: {e}"),
        }
        tokio::select! {
            () = cancel_token.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
}

pub struct Collector {
    config: Config,
    client: DeliveryClient,
    tailer: LogTailer,
    audio: Arc<dyn AudioRecorder>,
    display: Arc<dyn StatusDisplay>,
    cancel_token: CancellationToken,
}

impl Collector {
    /// Validates the config, loads the offline queue and builds the HTTP
    /// client. Does not start anything.
    pub fn new(
        config: Config,
        audio: Arc<dyn AudioRecorder>,
        display: Arc<dyn StatusDisplay>,
        cancel_token: CancellationToken,
    ) -> Result<Self, CollectorError> {
        config.validate()?;
        let queue = Arc::new(QueueStore::load(&config.queue_path));
        let client =
            DeliveryClient::new(config.delivery(), queue)?.with_cancel_token(cancel_token.clone());
        let tailer = LogTailer::new(config.tailer(), cancel_token.clone());
        Ok(Collector {
            config,
            client,
            tailer,
            audio,
            display,
            cancel_token,
        })
    }

    #[must_use]
    pub fn client(&self) -> &DeliveryClient {
        &self.client
    }

    #[must_use]
    pub fn tailer_state(&self) -> watch::Receiver<TailerState> {
        self.tailer.subscribe()
    }

    /// Runs every task until the cancel token fires, then waits for all of
    /// them. Returns how many transmissions were still open and got dropped.
    pub async fn run(self) -> usize {
        let Collector {
            config,
            client,
            tailer,
            audio,
            display,
            cancel_token,
        } = self;
        info!(
            "COLLECTOR | Starting for installation {} (DMR id {}), monitoring {}",
            config.installation_id,
            config.dmr_id,
            config.mmdvm_log_path.display()
        );

        let queue = Arc::clone(client.queue());
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            client: client.clone(),
            audio: Arc::clone(&audio),
            display: Arc::clone(&display),
        };
        let dispatcher_task = tokio::spawn(dispatcher.run(rx));

        let sink = DispatchSink {
            audio: Arc::clone(&audio),
            display,
            recordings: HashMap::new(),
            tx,
        };
        let tailer_task = tokio::spawn(tail(tailer, sink));

        let background: Vec<(&str, JoinHandle<()>)> = vec![
            (
                "queue drainer",
                tokio::spawn(
                    QueueDrainer::new(
                        client.clone(),
                        config.queue_drain_interval,
                        config.queue_cooldown,
                        cancel_token.clone(),
                    )
                    .spin(),
                ),
            ),
            (
                "command poller",
                tokio::spawn(
                    CommandPoller::new(
                        client,
                        CommandExecutor::new(
                            config.dmr_id,
                            config.tool_timeout,
                            config.unavailable_policy,
                            ProcessRunner,
                        ),
                        config.commands_interval,
                        cancel_token.clone(),
                    )
                    .spin(),
                ),
            ),
            (
                "audio cleanup",
                tokio::spawn(cleanup_loop(
                    audio,
                    config.cleanup_interval,
                    config.audio_max_age,
                    cancel_token.clone(),
                )),
            ),
        ];

        let dropped = match tailer_task.await {
            Ok(dropped) => dropped,
            Err(e) => {
                error!("COLLECTOR | Log monitoring task failed: {e}");
                0
            }
        };
        if let Err(e) = dispatcher_task.await {
            error!("COLLECTOR | Dispatcher task failed: {e}");
        }
        for (name, handle) in background {
            if let Err(e) = handle.await {
                error!("COLLECTOR | {name} task failed: {e}");
            }
        }

        if dropped > 0 {
            warn!("COLLECTOR | Dropped {dropped} transmissions still open at shutdown");
        }
        info!(
            "COLLECTOR | Stopped ({} records in offline queue)",
            queue.len()
        );
        dropped
    }
}

/// Owns the correlator. Open transmissions left at the end are released
/// like abandoned ones and counted.
async fn tail(tailer: LogTailer, mut sink: DispatchSink) -> usize {
    let mut correlator = Correlator::new();
    tailer
        .spin(|line| {
            if let Some(event) = classify(line) {
                correlator.process(event, &mut sink);
            }
        })
        .await;

    let open = correlator.take_open();
    for transmission in &open {
        warn!(
            "COLLECTOR | Dropping open transmission: Slot {}, Radio {} -> {} {}, started {}",
            transmission.slot,
            transmission.radio_id,
            transmission.destination_kind,
            transmission.destination_id,
            transmission.start_time
        );
    }
    let count = open.len();
    for transmission in open {
        sink.transmission_abandoned(transmission);
    }
    count
}
