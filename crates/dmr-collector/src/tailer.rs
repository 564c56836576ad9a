// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Follows an append-only log file and hands every complete line to a callback.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailerState {
    WaitingForFile,
    Tailing,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct TailerConfig {
    pub path: PathBuf,
    /// Delay between existence checks while the file is missing.
    pub file_wait: Duration,
    /// Back-off when a read yields no complete line.
    pub idle_poll: Duration,
}

pub struct LogTailer {
    config: TailerConfig,
    cancel_token: CancellationToken,
    state: watch::Sender<TailerState>,
}

enum TailExit {
    Cancelled,
    FileGone,
}

impl LogTailer {
    #[must_use]
    pub fn new(config: TailerConfig, cancel_token: CancellationToken) -> Self {
        let (state, _) = watch::channel(TailerState::WaitingForFile);
        LogTailer {
            config,
            cancel_token,
            state,
        }
    }

    /// Observes state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TailerState> {
        self.state.subscribe()
    }

    /// Runs until cancelled. Historical content is never replayed: every time
    /// the file is (re)opened the cursor starts at its current end. After the
    /// file disappears or a read fails, reopening waits `file_wait`.
    pub async fn spin<F: FnMut(&str)>(self, mut on_line: F) {
        loop {
            let Some(file) = self.wait_for_file().await else {
                break;
            };
            let exit = self.tail(file, &mut on_line).await;
            self.state.send_replace(TailerState::WaitingForFile);
            match exit {
                Ok(TailExit::Cancelled) => break,
                Ok(TailExit::FileGone) => {
                    warn!("TAILER | Log file {} disappeared", self.config.path.display());
                }
                Err(e) => {
                    warn!(
                        "TAILER | Error reading {}: {e}",
                        self.config.path.display()
                    );
                }
            }
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                () = tokio::time::sleep(self.config.file_wait) => {}
            }
        }
        self.state.send_replace(TailerState::Stopped);
        info!("TAILER | Stopped monitoring {}", self.config.path.display());
    }

    async fn wait_for_file(&self) -> Option<File> {
        let mut announced = false;
        loop {
            if self.cancel_token.is_cancelled() {
                return None;
            }
            match File::open(&self.config.path).await {
                Ok(file) => return Some(file),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if !announced {
                        warn!(
                            "TAILER | Log file not found: {}, waiting",
                            self.config.path.display()
                        );
                        announced = true;
                    }
                }
                Err(e) => warn!(
                    "TAILER | Cannot open {}: {e}",
                    self.config.path.display()
                ),
            }
            tokio::select! {
                () = self.cancel_token.cancelled() => return None,
                () = tokio::time::sleep(self.config.file_wait) => {}
            }
        }
    }

    async fn tail<F: FnMut(&str)>(
        &self,
        mut file: File,
        on_line: &mut F,
    ) -> std::io::Result<TailExit> {
        let mut position = file.seek(SeekFrom::End(0)).await?;
        let mut reader = BufReader::new(file);
        // Bytes of a line whose newline has not been written yet.
        let mut pending: Vec<u8> = Vec::new();

        self.state.send_replace(TailerState::Tailing);
        info!(
            "TAILER | Monitoring {} from offset {position}",
            self.config.path.display()
        );

        loop {
            if self.cancel_token.is_cancelled() {
                return Ok(TailExit::Cancelled);
            }

            let read = reader.read_until(b'\n', &mut pending).await?;
            position += read as u64;

            if pending.last() == Some(&b'\n') {
                let line = String::from_utf8_lossy(&pending);
                on_line(line.trim_end_matches(['\r', '\n']));
                pending.clear();
                continue;
            }

            match tokio::fs::metadata(&self.config.path).await {
                Ok(meta) if meta.len() < position => {
                    info!(
                        "TAILER | {} truncated, reading from the start",
                        self.config.path.display()
                    );
                    reader = BufReader::new(File::open(&self.config.path).await?);
                    position = 0;
                    pending.clear();
                    continue;
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(TailExit::FileGone);
                }
                Err(e) => return Err(e),
            }

            if !pending.is_empty() {
                debug!("TAILER | Holding {} bytes of a partial line", pending.len());
            }
            tokio::select! {
                () = self.cancel_token.cancelled() => return Ok(TailExit::Cancelled),
                () = tokio::time::sleep(self.config.idle_poll) => {}
            }
        }
    }
}
