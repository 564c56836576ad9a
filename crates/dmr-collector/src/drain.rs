// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background re-delivery of queued records.

use crate::delivery::DeliveryClient;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStep {
    Empty,
    Delivered,
    Requeued,
}

pub struct QueueDrainer {
    client: DeliveryClient,
    interval: Duration,
    cooldown: Duration,
    cancel_token: CancellationToken,
}

impl QueueDrainer {
    #[must_use]
    pub fn new(
        client: DeliveryClient,
        interval: Duration,
        cooldown: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        QueueDrainer {
            client,
            interval,
            cooldown,
            cancel_token,
        }
    }

    /// Leases the oldest queued item and tries it once through the regular
    /// retry path.
    pub async fn drain_once(&self) -> DrainStep {
        let queue = self.client.queue();
        let Some(item) = queue.drain_one() else {
            return DrainStep::Empty;
        };
        let kind = item.envelope.kind;

        match self.client.attempt(&item.envelope).await {
            Ok(_) => {
                if let Err(e) = queue.complete_off_runtime(item.id).await {
                    error!("DRAIN | Delivered queued {kind} {} but could not persist: {e}", item.id);
                }
                info!(
                    "DRAIN | Delivered queued {kind} {} (queue size: {})",
                    item.id,
                    queue.len()
                );
                DrainStep::Delivered
            }
            Err(e) => {
                warn!("DRAIN | Queued {kind} {} still undeliverable: {e}", item.id);
                if let Err(e) = queue.requeue_off_runtime(item).await {
                    error!("DRAIN | Failed to persist requeued {kind}: {e}");
                }
                DrainStep::Requeued
            }
        }
    }

    /// Drains until cancelled. Idles for `interval` when the queue is empty
    /// and for `cooldown` after a failed attempt. A delivered item is followed
    /// by the next one without pausing, so a backlog empties at network speed.
    /// The cadence only applies once the queue is empty or failing.
    pub async fn spin(self) {
        info!(
            "DRAIN | Started offline queue processor ({} items pending)",
            self.client.queue().len()
        );
        while !self.cancel_token.is_cancelled() {
            let pause = match self.drain_once().await {
                DrainStep::Delivered => continue,
                DrainStep::Empty => self.interval,
                DrainStep::Requeued => {
                    debug!("DRAIN | Cooling down for {:?}", self.cooldown);
                    self.cooldown
                }
            };
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                () = tokio::time::sleep(pause) => {}
            }
        }
        info!("DRAIN | Stopped offline queue processor");
    }
}
