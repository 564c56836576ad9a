// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod logger;

use std::{env, path::PathBuf, process, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use dmr_collector::{
    collaborators::{NoopAudioRecorder, NoopStatusDisplay},
    config::{self, log_level::LogLevel},
    service::Collector,
};

const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

#[tokio::main]
pub async fn main() {
    let config_path = env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let loaded = config::load(&config_path);

    let log_level = loaded
        .as_ref()
        .map_or(LogLevel::default(), |config| config.log_level);
    if let Err(e) = init_logging(log_level) {
        eprintln!("COLLECTOR | ERROR | Failed to initialise logging: {e}");
        process::exit(1);
    }
    debug!("Logging subsystem enabled");

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!(
                "Unable to load configuration ({}): {e}. Shutting down.",
                config_path.display()
            );
            process::exit(1);
        }
    };

    let cancel_token = CancellationToken::new();
    let collector = match Collector::new(
        config,
        Arc::new(NoopAudioRecorder),
        Arc::new(NoopStatusDisplay),
        cancel_token.clone(),
    ) {
        Ok(collector) => collector,
        Err(e) => {
            error!("Unable to start the collector: {e}. Shutting down.");
            process::exit(1);
        }
    };

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown requested, stopping background tasks");
        cancel_token.cancel();
    });

    collector.run().await;
}

fn init_logging(level: LogLevel) -> Result<(), String> {
    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", level.as_directive());
    let filter = EnvFilter::try_new(env_filter)
        .map_err(|e| format!("could not parse log level in configuration: {e}"))?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(logger::Formatter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("setting default subscriber failed: {e}"))
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => debug!("Received SIGINT"),
                    _ = sigterm.recv() => debug!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Unable to listen for SIGTERM: {e}");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Unable to listen for SIGINT: {e}");
                    std::future::pending::<()>().await;
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    }
}
